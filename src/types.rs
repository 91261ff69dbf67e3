use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, AsExpression, FromSqlRow, ToSchema,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl ToSql<Text, Sqlite> for Role {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        match *self {
            Role::User => <&str as ToSql<Text, Sqlite>>::to_sql(&"user", out),
            Role::Admin => <&str as ToSql<Text, Sqlite>>::to_sql(&"admin", out),
        }
    }
}

impl FromSql<Text, Sqlite> for Role {
    fn from_sql(
        bytes: <Sqlite as diesel::backend::Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let role_str = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match role_str.as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err("Invalid user role".into()),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, AsExpression, FromSqlRow, ToSchema,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    /// Maps a payment provider status onto the order lifecycle.
    /// Unknown provider statuses leave the order untouched.
    pub fn from_payment_status(payment_status: &str) -> Option<Self> {
        match payment_status {
            "succeeded" | "completed" => Some(OrderStatus::Completed),
            "failed" | "cancelled" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

impl ToSql<Text, Sqlite> for OrderStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        match *self {
            OrderStatus::Processing => {
                <&str as ToSql<Text, Sqlite>>::to_sql(&"processing", out)
            }
            OrderStatus::Completed => <&str as ToSql<Text, Sqlite>>::to_sql(&"completed", out),
            OrderStatus::Failed => <&str as ToSql<Text, Sqlite>>::to_sql(&"failed", out),
        }
    }
}

impl FromSql<Text, Sqlite> for OrderStatus {
    fn from_sql(
        bytes: <Sqlite as diesel::backend::Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let status_str = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        match status_str.as_str() {
            "processing" => Ok(OrderStatus::Processing),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            _ => Err("Invalid order status".into()),
        }
    }
}

/// Derived state of a download link. Only `Deactivated` is backed by a stored flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Expired,
    CapReached,
    Deactivated,
}

impl LinkStatus {
    pub fn is_redeemable(self) -> bool {
        self == LinkStatus::Active
    }

    pub fn message(self) -> &'static str {
        match self {
            LinkStatus::Active => "Download link is valid",
            LinkStatus::Expired => "Download link has expired",
            LinkStatus::CapReached => "Maximum number of downloads reached",
            LinkStatus::Deactivated => "Download link has been deactivated",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why a download link can no longer be redeemed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LinkStatus>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            reason: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: LinkStatus) -> Self {
        self.reason = Some(reason);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EmptyData {}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EbookSummary {
    pub id: String,
    pub title: String,
    pub author: String,
    pub file_size: Option<i64>,
    pub format: String,
    pub cover_image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LinkValidation {
    pub id: String,
    pub expires_at: DateTime<Utc>,
    pub download_count: i32,
    pub max_downloads: i32,
    pub remaining_downloads: i32,
    pub status: LinkStatus,
    pub ebook: EbookSummary,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadLinkView {
    pub id: String,
    pub order_id: String,
    pub expires_at: DateTime<Utc>,
    pub download_count: i32,
    pub max_downloads: i32,
    pub active: bool,
    pub status: LinkStatus,
    pub created_at: DateTime<Utc>,
    pub ebook: EbookSummary,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadLinkDetail {
    #[serde(flatten)]
    pub link: DownloadLinkView,
    pub ip_addresses: Vec<String>,
}

/// Ten years; longer overrides are rejected at the boundary.
pub const MAX_EXPIRES_IN_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssueLinkRequest {
    pub order_id: String,
    pub ebook_id: String,
    pub expires_in_hours: Option<i64>,
    pub max_downloads: Option<i32>,
}

impl IssueLinkRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.order_id.trim().is_empty() {
            return Err(AppError::Validation("order_id is required".to_string()));
        }
        if self.ebook_id.trim().is_empty() {
            return Err(AppError::Validation("ebook_id is required".to_string()));
        }
        if matches!(self.expires_in_hours, Some(hours) if hours <= 0) {
            return Err(AppError::Validation(
                "expires_in_hours must be positive".to_string(),
            ));
        }
        if matches!(self.expires_in_hours, Some(hours) if hours > MAX_EXPIRES_IN_HOURS) {
            return Err(AppError::Validation(format!(
                "expires_in_hours must be at most {MAX_EXPIRES_IN_HOURS}"
            )));
        }
        if matches!(self.max_downloads, Some(max) if max <= 0) {
            return Err(AppError::Validation(
                "max_downloads must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IssuedLink {
    pub id: String,
    pub ebook_id: String,
    pub token: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub max_downloads: i32,
    pub notification_sent: bool,
    /// Set when the link was created but the owner could not be notified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentWebhookRequest {
    pub payment_id: String,
    pub payment_status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentWebhookData {
    pub order_id: String,
    pub order_status: OrderStatus,
    pub links: Vec<IssuedLink>,
}
