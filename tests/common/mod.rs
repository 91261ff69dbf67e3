#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use diesel::prelude::*;
use ebook_downloads::auth::issue_session_token;
use ebook_downloads::config::Config;
use ebook_downloads::db::{build_pool, run_migrations};
use ebook_downloads::model::{DownloadLink, Ebook, Order, OrderItem, User};
use ebook_downloads::notifier::{Notifier, NotifyError, TemplateKind};
use ebook_downloads::schema::{download_links, ebooks, order_items, orders, users};
use ebook_downloads::storage::LocalFileStorage;
use ebook_downloads::types::{OrderStatus, Role};
use ebook_downloads::{app, AppState};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`

pub const JWT_SECRET: &str = "test-secret";
pub const WEBHOOK_SECRET: &str = "webhook-secret";
pub const EBOOK_BYTES: &[u8] = b"%PDF-1.4 pretend this is a book";

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub recipient: String,
    pub template: TemplateKind,
    pub payload: Value,
}

/// Records every message; optionally fails every send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<SentNotification>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_with(&self, template: TemplateKind) -> Vec<SentNotification> {
        self.sent()
            .into_iter()
            .filter(|n| n.template == template)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: Value,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(SentNotification {
            recipient: recipient.to_string(),
            template,
            payload,
        });
        if self.fail {
            Err(NotifyError::Rejected(503))
        } else {
            Ok(())
        }
    }
}

// Throwaway database and storage directory, removed on drop
pub struct TestEnv {
    pub dir: PathBuf,
    pub state: AppState,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default())
    }

    pub fn with_notifier(notifier: RecordingNotifier) -> Self {
        let dir = std::env::temp_dir().join(format!("ebook_downloads_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("files")).unwrap();

        let database_url = dir.join("test.db").to_string_lossy().into_owned();
        let pool = build_pool(&database_url).unwrap();
        run_migrations(&pool).unwrap();

        let config = Config {
            database_url,
            port: 0,
            jwt_secret: JWT_SECRET.to_string(),
            frontend_url: "https://books.example".to_string(),
            link_ttl: chrono::Duration::hours(48),
            max_downloads: 3,
            storage_root: dir.clone(),
            notifier_url: None,
            notifier_api_key: None,
            payment_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            reaper_interval: None,
            link_retention: chrono::Duration::days(30),
            sentry_dsn: None,
        };

        let notifier = Arc::new(notifier);
        let state = AppState::new(
            pool,
            config,
            notifier.clone(),
            Arc::new(LocalFileStorage::new(dir.clone())),
        );

        Self {
            dir,
            state,
            notifier,
        }
    }

    pub fn app(&self) -> Router {
        app(self.state.clone())
    }

    pub fn conn(&self) -> ebook_downloads::db::DbConnection {
        self.state.get_db_connection().unwrap()
    }

    pub fn insert_user(&self, name: &str, role: Role) -> User {
        let user = User::new(
            name.to_string(),
            format!("{}_{}@example.com", name, uuid::Uuid::new_v4()),
            role,
        );
        diesel::insert_into(users::table)
            .values(&user)
            .execute(&mut self.conn())
            .unwrap();
        user
    }

    /// Inserts an ebook; the backing file is written only when `with_file` is set.
    pub fn insert_ebook(&self, title: &str, with_file: bool) -> Ebook {
        let id = uuid::Uuid::new_v4().to_string();
        let file_path = format!("/files/{id}.pdf");
        if with_file {
            std::fs::write(self.dir.join(format!("files/{id}.pdf")), EBOOK_BYTES).unwrap();
        }

        let ebook = Ebook {
            id,
            title: title.to_string(),
            author: "A. Writer".to_string(),
            file_path,
            file_size: Some(EBOOK_BYTES.len() as i64),
            format: "PDF".to_string(),
            cover_image: Some("/covers/book.jpg".to_string()),
            created_at: chrono::Utc::now().naive_utc(),
        };
        diesel::insert_into(ebooks::table)
            .values(&ebook)
            .execute(&mut self.conn())
            .unwrap();
        ebook
    }

    pub fn insert_order(&self, owner: &User, books: &[&Ebook], status: OrderStatus) -> Order {
        let now = chrono::Utc::now().naive_utc();
        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: owner.id.clone(),
            payment_id: format!("pay_{}", uuid::Uuid::new_v4()),
            payment_method: "card".to_string(),
            payment_status: "pending".to_string(),
            order_status: status,
            total_price_cents: 999 * books.len() as i64,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn();
        diesel::insert_into(orders::table)
            .values(&order)
            .execute(&mut conn)
            .unwrap();

        for book in books {
            let item = OrderItem {
                id: uuid::Uuid::new_v4().to_string(),
                order_id: order.id.clone(),
                ebook_id: book.id.clone(),
                title: book.title.clone(),
                price_cents: 999,
                quantity: 1,
            };
            diesel::insert_into(order_items::table)
                .values(&item)
                .execute(&mut conn)
                .unwrap();
        }
        order
    }

    /// Inserts a link directly, bypassing issuance.
    pub fn insert_link(
        &self,
        order: &Order,
        ebook: &Ebook,
        expires_in: chrono::Duration,
        max_downloads: i32,
    ) -> DownloadLink {
        let link = DownloadLink::new(
            order.user_id.clone(),
            order.id.clone(),
            ebook.id.clone(),
            chrono::Utc::now().naive_utc() + expires_in,
            max_downloads,
        );
        diesel::insert_into(download_links::table)
            .values(&link)
            .execute(&mut self.conn())
            .unwrap();
        link
    }

    pub fn reload_link(&self, link_id: &str) -> DownloadLink {
        download_links::table
            .find(link_id)
            .select(DownloadLink::as_select())
            .first(&mut self.conn())
            .unwrap()
    }

    /// Everything needed for the common case: a buyer, one book with a file, a paid order.
    pub fn purchase(&self) -> (User, Ebook, Order) {
        let buyer = self.insert_user("buyer", Role::User);
        let ebook = self.insert_ebook("Rust in Practice", true);
        let order = self.insert_order(&buyer, &[&ebook], OrderStatus::Completed);
        (buyer, ebook, order)
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

pub fn session_token(user: &User) -> String {
    issue_session_token(&user.id, JWT_SECRET, chrono::Duration::hours(1)).unwrap()
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn get_from(uri: &str, ip: [u8; 4]) -> Request<Body> {
    let mut req = get(uri, None);
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
    req
}

pub fn send_json(method: &str, uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn send_empty(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let body_bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };
    (status, body)
}
