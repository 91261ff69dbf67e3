use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, Path, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
        request::Parts,
        StatusCode,
    },
    response::{IntoResponse, Response},
    Extension, Json,
};
use tokio_util::io::ReaderStream;

use crate::auth::{authorize_owner_or_admin, CurrentUser};
use crate::error::AppError;
use crate::routes::download_link_helpers::{
    attachment_filename, content_type_for, create_links_for_order, deactivate_link,
    deactivate_order_links, file_extension, find_ebook, find_link_by_id, find_link_by_token,
    find_order, find_user, insert_link, link_ip_addresses, links_for_user, notify_link_ready,
    order_items_for, try_consume, LinkSettings,
};
use crate::types::{
    ApiResponse, DownloadLinkDetail, DownloadLinkView, EmptyData, IssueLinkRequest, IssuedLink,
    LinkStatus, LinkValidation,
};
use crate::AppState;

/// Address of the requester, recorded on successful redemptions.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip().to_string()));
        }

        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(ClientIp(forwarded.unwrap_or_else(|| "unknown".to_string())))
    }
}

/// Check whether a download token can still be redeemed
#[utoipa::path(
    get,
    path = "/downloads/validate/{token}",
    params(("token" = String, Path, description = "Download token from the emailed URL")),
    responses(
        (status = 200, description = "Link is valid", body = ApiResponse<LinkValidation>),
        (status = 404, description = "Unknown token", body = ApiResponse<EmptyData>),
        (status = 410, description = "Link expired, used up or deactivated", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads"
)]
pub async fn validate_link(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<LinkValidation>>, AppError> {
    let (link, ebook) = {
        let mut conn = state.get_db_connection()?;
        find_link_by_token(&mut conn, &token)?
    };

    let status = link.status_at(chrono::Utc::now().naive_utc());
    if !status.is_redeemable() {
        return Err(AppError::LinkGone(status));
    }

    Ok(Json(ApiResponse::success(LinkValidation {
        id: link.id.clone(),
        expires_at: link.expires_at.and_utc(),
        download_count: link.download_count,
        max_downloads: link.max_downloads,
        remaining_downloads: link.remaining_downloads(),
        status,
        ebook: ebook.summary(),
    })))
}

/// Redeem a download token and stream the ebook
///
/// The download is counted before the first byte is sent; an aborted
/// transfer still uses up one download.
#[utoipa::path(
    get,
    path = "/downloads/download/{token}",
    params(("token" = String, Path, description = "Download token from the emailed URL")),
    responses(
        (status = 200, description = "Ebook file stream with an attachment filename"),
        (status = 404, description = "Unknown token or missing file", body = ApiResponse<EmptyData>),
        (status = 410, description = "Link expired, used up or deactivated", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads"
)]
pub async fn download_ebook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ClientIp(client_ip): ClientIp,
) -> Result<Response, AppError> {
    let (link, ebook) = {
        let mut conn = state.get_db_connection()?;
        find_link_by_token(&mut conn, &token)?
    };

    let status = link.status_at(chrono::Utc::now().naive_utc());
    if !status.is_redeemable() {
        return Err(AppError::LinkGone(status));
    }

    if !state.storage.exists(&ebook.file_path).await {
        tracing::error!(ebook_id = %ebook.id, path = %ebook.file_path, "ebook file missing");
        return Err(AppError::NotFound("Ebook file not found".to_string()));
    }
    let file = state.storage.open(&ebook.file_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound("Ebook file not found".to_string())
        } else {
            AppError::from(e)
        }
    })?;

    let redeemed_at = chrono::Utc::now().naive_utc();
    let link_id = link.id.clone();
    let requester_ip = client_ip.clone();
    state
        .with_connection(move |conn| {
            if try_consume(conn, &link_id, &requester_ip, redeemed_at)? {
                return Ok(());
            }
            // Lost the race or the link changed since it was read.
            let (current, _) = find_link_by_id(conn, &link_id)?;
            let status = match current.status_at(redeemed_at) {
                LinkStatus::Active => LinkStatus::CapReached,
                other => other,
            };
            Err(AppError::LinkGone(status))
        })
        .await?;

    tracing::info!(link_id = %link.id, ip = %client_ip, "download redeemed");

    let extension = file_extension(&ebook);
    let filename = attachment_filename(&ebook.title, &extension);
    let headers = [
        (CONTENT_TYPE, content_type_for(&extension).to_string()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
        (CONTENT_LENGTH, file.len.to_string()),
    ];

    Ok((headers, Body::from_stream(ReaderStream::new(file.reader))).into_response())
}

/// Issue a download link for one ebook of an order
#[utoipa::path(
    post,
    path = "/downloads",
    request_body = IssueLinkRequest,
    responses(
        (status = 201, description = "Link created", body = ApiResponse<IssuedLink>),
        (status = 400, description = "Missing or invalid fields", body = ApiResponse<EmptyData>),
        (status = 401, description = "Not logged in", body = ApiResponse<EmptyData>),
        (status = 403, description = "Order belongs to someone else", body = ApiResponse<EmptyData>),
        (status = 404, description = "Order or ebook not found", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads",
    security(("bearer_auth" = []))
)]
pub async fn issue_link(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<IssueLinkRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let settings = LinkSettings::from_config(&state.config)
        .with_overrides(payload.expires_in_hours, payload.max_downloads)?;

    let caller = user.clone();
    let (owner, ebook, link) = state
        .with_connection(move |conn| {
            let order = find_order(conn, &payload.order_id)?;
            authorize_owner_or_admin(&caller, &order.user_id, "order")?;

            let items = order_items_for(conn, &order)?;
            if !items.iter().any(|item| item.ebook_id == payload.ebook_id) {
                return Err(AppError::NotFound(
                    "This ebook is not part of the order".to_string(),
                ));
            }

            let ebook = find_ebook(conn, &payload.ebook_id)?
                .ok_or_else(|| AppError::NotFound("Ebook not found".to_string()))?;
            let owner = find_user(conn, &order.user_id)?;

            let link = insert_link(
                conn,
                &order.user_id,
                &order.id,
                &ebook.id,
                &settings,
                chrono::Utc::now().naive_utc(),
            )?;
            Ok((owner, ebook, link))
        })
        .await?;

    tracing::info!(link_id = %link.id, order_id = %link.order_id, issued_by = %user.id, "download link issued");

    let issued = notify_link_ready(&state, &owner, &ebook, &link).await;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(issued))))
}

/// List the caller's download links, newest first
#[utoipa::path(
    get,
    path = "/downloads/my-downloads",
    responses(
        (status = 200, description = "Caller's links", body = ApiResponse<Vec<DownloadLinkView>>),
        (status = 401, description = "Not logged in", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads",
    security(("bearer_auth" = []))
)]
pub async fn my_downloads(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<Vec<DownloadLinkView>>>, AppError> {
    let links = {
        let mut conn = state.get_db_connection()?;
        links_for_user(&mut conn, &user.id)?
    };

    let now = chrono::Utc::now().naive_utc();
    Ok(Json(ApiResponse::success(
        links
            .iter()
            .map(|(link, ebook)| link.view(ebook, now))
            .collect(),
    )))
}

#[utoipa::path(
    get,
    path = "/downloads/{id}",
    params(("id" = String, Path, description = "Download link id")),
    responses(
        (status = 200, description = "Link details", body = ApiResponse<DownloadLinkDetail>),
        (status = 403, description = "Not owner or admin", body = ApiResponse<EmptyData>),
        (status = 404, description = "Unknown link", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads",
    security(("bearer_auth" = []))
)]
pub async fn get_download(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(link_id): Path<String>,
) -> Result<Json<ApiResponse<DownloadLinkDetail>>, AppError> {
    let mut conn = state.get_db_connection()?;

    let (link, ebook) = find_link_by_id(&mut conn, &link_id)?;
    authorize_owner_or_admin(&user, &link.user_id, "download")?;
    let ip_addresses = link_ip_addresses(&mut conn, &link.id)?;

    Ok(Json(ApiResponse::success(DownloadLinkDetail {
        link: link.view(&ebook, chrono::Utc::now().naive_utc()),
        ip_addresses,
    })))
}

/// Permanently deactivate a download link
#[utoipa::path(
    patch,
    path = "/downloads/{id}/disable",
    params(("id" = String, Path, description = "Download link id")),
    responses(
        (status = 200, description = "Link deactivated", body = ApiResponse<EmptyData>),
        (status = 403, description = "Not owner or admin", body = ApiResponse<EmptyData>),
        (status = 404, description = "Unknown link", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads",
    security(("bearer_auth" = []))
)]
pub async fn disable_download(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(link_id): Path<String>,
) -> Result<Json<ApiResponse<EmptyData>>, AppError> {
    let mut conn = state.get_db_connection()?;

    let (link, _) = find_link_by_id(&mut conn, &link_id)?;
    authorize_owner_or_admin(&user, &link.user_id, "download")?;
    deactivate_link(&mut conn, &link.id)?;

    tracing::info!(link_id = %link.id, by = %user.id, "download link deactivated");
    Ok(Json(ApiResponse::success(EmptyData {})))
}

/// Replace every link of an order with one fresh link per line item
#[utoipa::path(
    post,
    path = "/downloads/regenerate/{order_id}",
    params(("order_id" = String, Path, description = "Order id")),
    responses(
        (status = 200, description = "New links issued", body = ApiResponse<Vec<IssuedLink>>),
        (status = 403, description = "Not owner or admin", body = ApiResponse<EmptyData>),
        (status = 404, description = "Unknown order", body = ApiResponse<EmptyData>)
    ),
    tag = "Downloads",
    security(("bearer_auth" = []))
)]
pub async fn regenerate_links(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<IssuedLink>>>, AppError> {
    let settings = LinkSettings::from_config(&state.config);

    let caller = user.clone();
    let (owner, created) = state
        .with_connection(move |conn| {
            let order = find_order(conn, &order_id)?;
            authorize_owner_or_admin(&caller, &order.user_id, "order")?;
            let owner = find_user(conn, &order.user_id)?;

            // Old links are gone before anyone hears about the new ones.
            let created = conn.immediate_transaction::<_, AppError, _>(|conn| {
                let deactivated = deactivate_order_links(conn, &order.id)?;
                tracing::info!(order_id = %order.id, deactivated, "deactivated previous download links");
                create_links_for_order(conn, &order, &settings, chrono::Utc::now().naive_utc())
            })?;
            Ok((owner, created))
        })
        .await?;

    let mut issued = Vec::with_capacity(created.len());
    for (link, ebook) in &created {
        issued.push(notify_link_ready(&state, &owner, ebook, link).await);
    }

    Ok(Json(ApiResponse::success(issued)))
}
