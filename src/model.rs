use crate::types::{DownloadLinkView, EbookSummary, LinkStatus, OrderStatus, Role};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

pub const TOKEN_LENGTH: usize = 32;

#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: NaiveDateTime,
}

impl User {
    pub fn new(name: String, email: String, role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            email,
            role,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = crate::schema::ebooks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Ebook {
    pub id: String,
    pub title: String,
    pub author: String,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub format: String,
    pub cover_image: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Ebook {
    pub fn summary(&self) -> EbookSummary {
        EbookSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
            file_size: self.file_size,
            format: self.format.clone(),
            cover_image: self.cover_image.clone(),
        }
    }
}

#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub payment_id: String,
    pub payment_method: String,
    pub payment_status: String,
    pub order_status: OrderStatus,
    pub total_price_cents: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Selectable, Insertable, Identifiable, Associations, Debug, Clone)]
#[diesel(belongs_to(Order))]
#[diesel(table_name = crate::schema::order_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub ebook_id: String,
    pub title: String,
    pub price_cents: i64,
    pub quantity: i32,
}

#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = crate::schema::download_links)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DownloadLink {
    pub id: String,
    pub user_id: String,
    pub order_id: String,
    pub ebook_id: String,
    pub token: String,
    pub expires_at: NaiveDateTime,
    pub download_count: i32,
    pub max_downloads: i32,
    pub active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DownloadLink {
    pub fn new(
        user_id: String,
        order_id: String,
        ebook_id: String,
        expires_at: NaiveDateTime,
        max_downloads: i32,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            order_id,
            ebook_id,
            token: generate_token(),
            expires_at,
            download_count: 0,
            max_downloads,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Expiry is reported before the usage cap, and the cap before deactivation.
    pub fn status_at(&self, now: NaiveDateTime) -> LinkStatus {
        if now >= self.expires_at {
            LinkStatus::Expired
        } else if self.download_count >= self.max_downloads {
            LinkStatus::CapReached
        } else if !self.active {
            LinkStatus::Deactivated
        } else {
            LinkStatus::Active
        }
    }

    pub fn is_valid_at(&self, now: NaiveDateTime) -> bool {
        self.status_at(now).is_redeemable()
    }

    pub fn remaining_downloads(&self) -> i32 {
        (self.max_downloads - self.download_count).max(0)
    }

    pub fn view(&self, ebook: &Ebook, now: NaiveDateTime) -> DownloadLinkView {
        DownloadLinkView {
            id: self.id.clone(),
            order_id: self.order_id.clone(),
            expires_at: self.expires_at.and_utc(),
            download_count: self.download_count,
            max_downloads: self.max_downloads,
            active: self.active,
            status: self.status_at(now),
            created_at: self.created_at.and_utc(),
            ebook: ebook.summary(),
        }
    }
}

/// One distinct requester address seen on a successful redemption.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = crate::schema::download_link_ips)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DownloadLinkIp {
    pub download_link_id: String,
    pub ip_address: String,
    pub first_seen_at: NaiveDateTime,
}

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
