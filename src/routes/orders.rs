use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use diesel::prelude::*;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::model::{Order, OrderItem, User};
use crate::notifier::TemplateKind;
use crate::routes::download_link_helpers::{
    create_links_for_order, find_user, notify_link_ready, order_items_for, LinkSettings,
};
use crate::types::{
    ApiResponse, EmptyData, OrderStatus, PaymentWebhookData, PaymentWebhookRequest,
};
use crate::AppState;

fn verify_webhook_secret(headers: &HeaderMap, expected: Option<&str>) -> AppResult<()> {
    let expected = expected.ok_or_else(|| {
        AppError::Unauthorized("Payment webhook is not configured".to_string())
    })?;

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(secret) if secret == expected => Ok(()),
        _ => Err(AppError::Unauthorized(
            "Invalid payment webhook credentials".to_string(),
        )),
    }
}

async fn send_order_confirmation(state: &AppState, owner: &User, order: &Order, items: &[OrderItem]) {
    let payload = json!({
        "name": owner.name,
        "order_id": order.id,
        "items": items
            .iter()
            .map(|item| json!({
                "title": item.title,
                "price_cents": item.price_cents,
                "quantity": item.quantity,
            }))
            .collect::<Vec<_>>(),
        "total_price_cents": order.total_price_cents,
    });

    if let Err(e) = state
        .notifier
        .send(&owner.email, TemplateKind::OrderConfirmation, payload)
        .await
    {
        tracing::warn!(order_id = %order.id, error = %e, "failed to send order confirmation");
    }
}

/// Payment provider callback
///
/// The first transition of an order to `completed` issues one download link
/// per line item. Replayed callbacks do not issue more links.
#[utoipa::path(
    post,
    path = "/orders/payment-webhook",
    request_body = PaymentWebhookRequest,
    responses(
        (status = 200, description = "Payment status recorded", body = ApiResponse<PaymentWebhookData>),
        (status = 401, description = "Missing or wrong webhook secret", body = ApiResponse<EmptyData>),
        (status = 404, description = "No order for this payment", body = ApiResponse<EmptyData>)
    ),
    tag = "Orders",
    security(("webhook_secret" = []))
)]
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PaymentWebhookRequest>,
) -> Result<Json<ApiResponse<PaymentWebhookData>>, AppError> {
    verify_webhook_secret(&headers, state.config.payment_webhook_secret.as_deref())?;

    let settings = LinkSettings::from_config(&state.config);
    let now = chrono::Utc::now().naive_utc();

    let payment_status_raw = payload.payment_status.clone();
    let (order, new_status, created, owner, items) = state
        .with_connection(move |conn| {
            let (order, new_status, created) =
                conn.immediate_transaction::<_, AppError, _>(|conn| {
                    use crate::schema::orders::dsl::*;

                    let order: Order = orders
                        .filter(payment_id.eq(&payload.payment_id))
                        .select(Order::as_select())
                        .first(conn)
                        .optional()?
                        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))?;

                    let previous = order.order_status;
                    let next = OrderStatus::from_payment_status(&payload.payment_status)
                        .unwrap_or(previous);

                    diesel::update(orders.find(&order.id))
                        .set((
                            payment_status.eq(&payload.payment_status),
                            order_status.eq(next),
                            updated_at.eq(now),
                        ))
                        .execute(conn)?;

                    let created =
                        if next == OrderStatus::Completed && previous != OrderStatus::Completed {
                            create_links_for_order(conn, &order, &settings, now)?
                        } else {
                            Vec::new()
                        };

                    Ok((order, next, created))
                })?;

            let owner = find_user(conn, &order.user_id)?;
            let items = order_items_for(conn, &order)?;
            Ok((order, new_status, created, owner, items))
        })
        .await?;

    tracing::info!(
        order_id = %order.id,
        payment_status = %payment_status_raw,
        ?new_status,
        links = created.len(),
        "payment webhook processed"
    );

    let mut links = Vec::with_capacity(created.len());
    if !created.is_empty() {
        send_order_confirmation(&state, &owner, &order, &items).await;
        for (link, ebook) in &created {
            links.push(notify_link_ready(&state, &owner, ebook, link).await);
        }
    }

    Ok(Json(ApiResponse::success(PaymentWebhookData {
        order_id: order.id,
        order_status: new_status,
        links,
    })))
}
