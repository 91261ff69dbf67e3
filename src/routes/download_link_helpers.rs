use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::json;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    model::{DownloadLink, DownloadLinkIp, Ebook, Order, OrderItem, User},
    notifier::TemplateKind,
    types::IssuedLink,
    AppState,
};

const TOKEN_INSERT_ATTEMPTS: usize = 3;

/// Expiry and cap applied to newly issued links.
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub ttl: chrono::Duration,
    pub max_downloads: i32,
}

impl LinkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl: config.link_ttl,
            max_downloads: config.max_downloads,
        }
    }

    pub fn with_overrides(
        mut self,
        expires_in_hours: Option<i64>,
        max_downloads: Option<i32>,
    ) -> AppResult<Self> {
        if let Some(hours) = expires_in_hours {
            self.ttl = chrono::Duration::try_hours(hours).ok_or_else(|| {
                AppError::Validation("expires_in_hours is too large".to_string())
            })?;
        }
        if let Some(max) = max_downloads {
            self.max_downloads = max;
        }
        Ok(self)
    }

    pub fn expires_at(&self, now: NaiveDateTime) -> AppResult<NaiveDateTime> {
        now.checked_add_signed(self.ttl)
            .ok_or_else(|| AppError::Validation("Link expiry is out of range".to_string()))
    }
}

pub fn find_link_by_token(
    conn: &mut SqliteConnection,
    token_param: &str,
) -> AppResult<(DownloadLink, Ebook)> {
    use crate::schema::{download_links, ebooks};

    download_links::table
        .inner_join(ebooks::table)
        .filter(download_links::token.eq(token_param))
        .select((DownloadLink::as_select(), Ebook::as_select()))
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound("Invalid download link".to_string()))
}

pub fn find_link_by_id(
    conn: &mut SqliteConnection,
    link_id: &str,
) -> AppResult<(DownloadLink, Ebook)> {
    use crate::schema::{download_links, ebooks};

    download_links::table
        .inner_join(ebooks::table)
        .filter(download_links::id.eq(link_id))
        .select((DownloadLink::as_select(), Ebook::as_select()))
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound("Download not found".to_string()))
}

pub fn links_for_user(
    conn: &mut SqliteConnection,
    owner_id: &str,
) -> AppResult<Vec<(DownloadLink, Ebook)>> {
    use crate::schema::{download_links, ebooks};

    Ok(download_links::table
        .inner_join(ebooks::table)
        .filter(download_links::user_id.eq(owner_id))
        .order(download_links::created_at.desc())
        .select((DownloadLink::as_select(), Ebook::as_select()))
        .load(conn)?)
}

pub fn link_ip_addresses(conn: &mut SqliteConnection, link_id: &str) -> AppResult<Vec<String>> {
    use crate::schema::download_link_ips::dsl::*;

    Ok(download_link_ips
        .filter(download_link_id.eq(link_id))
        .order(first_seen_at.asc())
        .select(ip_address)
        .load(conn)?)
}

pub fn find_order(conn: &mut SqliteConnection, order_id: &str) -> AppResult<Order> {
    use crate::schema::orders::dsl::*;

    orders
        .find(order_id)
        .select(Order::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound("Order not found".to_string()))
}

pub fn order_items_for(conn: &mut SqliteConnection, order: &Order) -> AppResult<Vec<OrderItem>> {
    Ok(OrderItem::belonging_to(order)
        .select(OrderItem::as_select())
        .load(conn)?)
}

pub fn find_ebook(conn: &mut SqliteConnection, ebook_id: &str) -> AppResult<Option<Ebook>> {
    use crate::schema::ebooks::dsl::*;

    Ok(ebooks
        .find(ebook_id)
        .select(Ebook::as_select())
        .first(conn)
        .optional()?)
}

pub fn find_user(conn: &mut SqliteConnection, user_id: &str) -> AppResult<User> {
    use crate::schema::users::dsl::*;

    users
        .find(user_id)
        .select(User::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
}

/// Inserts a fresh link, drawing a new token if the unique index ever rejects one.
pub fn insert_link(
    conn: &mut SqliteConnection,
    owner_id: &str,
    order_id: &str,
    ebook_id: &str,
    settings: &LinkSettings,
    now: NaiveDateTime,
) -> AppResult<DownloadLink> {
    use crate::schema::download_links;

    for _ in 0..TOKEN_INSERT_ATTEMPTS {
        let new_link = DownloadLink::new(
            owner_id.to_string(),
            order_id.to_string(),
            ebook_id.to_string(),
            settings.expires_at(now)?,
            settings.max_downloads,
        );

        match diesel::insert_into(download_links::table)
            .values(&new_link)
            .execute(conn)
        {
            Ok(_) => return Ok(new_link),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => {
                tracing::warn!(error = info.message(), "download token collision, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(AppError::InternalError(
        "Could not allocate a unique download token".to_string(),
    ))
}

/// Issues one link per line item. Items whose ebook no longer exists are skipped.
pub fn create_links_for_order(
    conn: &mut SqliteConnection,
    order: &Order,
    settings: &LinkSettings,
    now: NaiveDateTime,
) -> AppResult<Vec<(DownloadLink, Ebook)>> {
    let mut created = Vec::new();
    for item in order_items_for(conn, order)? {
        let Some(ebook) = find_ebook(conn, &item.ebook_id)? else {
            tracing::warn!(order_id = %order.id, ebook_id = %item.ebook_id, "skipping line item with unknown ebook");
            continue;
        };
        let link = insert_link(conn, &order.user_id, &order.id, &ebook.id, settings, now)?;
        created.push((link, ebook));
    }
    Ok(created)
}

/// Counts one redemption if, and only if, the link is still valid at `now`.
///
/// The check and the increment are a single conditional UPDATE, so concurrent
/// callers can never push `download_count` past `max_downloads`. Returns
/// `false` when the update matched nothing.
pub fn try_consume(
    conn: &mut SqliteConnection,
    link_id: &str,
    requester_ip: &str,
    now: NaiveDateTime,
) -> AppResult<bool> {
    use crate::schema::{download_link_ips, download_links};

    conn.immediate_transaction::<_, AppError, _>(|conn| {
        let updated = diesel::update(
            download_links::table
                .filter(download_links::id.eq(link_id))
                .filter(download_links::active.eq(true))
                .filter(download_links::expires_at.gt(now))
                .filter(download_links::download_count.lt(download_links::max_downloads)),
        )
        .set((
            download_links::download_count.eq(download_links::download_count + 1),
            download_links::updated_at.eq(now),
        ))
        .execute(conn)?;

        if updated == 0 {
            return Ok(false);
        }

        diesel::insert_or_ignore_into(download_link_ips::table)
            .values(&DownloadLinkIp {
                download_link_id: link_id.to_string(),
                ip_address: requester_ip.to_string(),
                first_seen_at: now,
            })
            .execute(conn)?;

        Ok(true)
    })
}

pub fn deactivate_link(conn: &mut SqliteConnection, link_id: &str) -> AppResult<()> {
    use crate::schema::download_links::dsl::*;

    diesel::update(download_links.find(link_id))
        .set((
            active.eq(false),
            updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn deactivate_order_links(conn: &mut SqliteConnection, order_id_param: &str) -> AppResult<usize> {
    use crate::schema::download_links::dsl::*;

    Ok(diesel::update(
        download_links
            .filter(order_id.eq(order_id_param))
            .filter(active.eq(true)),
    )
    .set((
        active.eq(false),
        updated_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .execute(conn)?)
}

/// Sends the "download link ready" message for a freshly issued link.
///
/// A failed send never undoes the link; it only marks the result degraded.
pub async fn notify_link_ready(
    state: &AppState,
    owner: &User,
    ebook: &Ebook,
    link: &DownloadLink,
) -> IssuedLink {
    let download_url = state.config.download_url(&link.token);
    let expires_at = link.expires_at.and_utc();

    let payload = json!({
        "name": owner.name,
        "book_title": ebook.title,
        "download_url": download_url,
        "expires_at": expires_at.to_rfc3339(),
        "expiry_date": expires_at.format("%d/%m/%Y at %H:%M").to_string(),
        "max_downloads": link.max_downloads,
    });

    let warning = match state
        .notifier
        .send(&owner.email, TemplateKind::DownloadLinkReady, payload)
        .await
    {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(link_id = %link.id, error = %e, "download link created but notification failed");
            Some(format!("Download link created but the email could not be sent: {e}"))
        }
    };

    IssuedLink {
        id: link.id.clone(),
        ebook_id: link.ebook_id.clone(),
        token: link.token.clone(),
        download_url,
        expires_at,
        max_downloads: link.max_downloads,
        notification_sent: warning.is_none(),
        warning,
    }
}

/// `My Book: Vol. 2` becomes `my_book__vol__2.pdf`.
pub fn attachment_filename(title: &str, extension: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.{extension}")
}

/// Extension of the stored file, falling back to the first listed format.
pub fn file_extension(ebook: &Ebook) -> String {
    std::path::Path::new(&ebook.file_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .or_else(|| {
            ebook
                .format
                .split(',')
                .next()
                .map(|f| f.trim().to_ascii_lowercase())
                .filter(|f| !f.is_empty())
        })
        .unwrap_or_else(|| "pdf".to_string())
}

pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "epub" => "application/epub+zip",
        "mobi" => "application/x-mobipocket-ebook",
        _ => "application/octet-stream",
    }
}
