mod common;

use axum::http::{Request, StatusCode};
use axum::body::Body;
use common::*;
use diesel::prelude::*;
use ebook_downloads::model::Order;
use ebook_downloads::notifier::TemplateKind;
use ebook_downloads::schema::{download_links, orders};
use ebook_downloads::types::{OrderStatus, Role};
use serde_json::{json, Value};

fn webhook(secret: Option<&str>, payment_id: &str, payment_status: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/orders/payment-webhook")
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header("authorization", format!("Bearer {secret}"));
    }
    let body: Value = json!({"payment_id": payment_id, "payment_status": payment_status});
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn links_for(env: &TestEnv, order: &Order) -> i64 {
    download_links::table
        .filter(download_links::order_id.eq(&order.id))
        .count()
        .get_result(&mut env.conn())
        .unwrap()
}

fn reload_order(env: &TestEnv, order: &Order) -> Order {
    orders::table
        .find(&order.id)
        .select(Order::as_select())
        .first(&mut env.conn())
        .unwrap()
}

#[tokio::test]
async fn completed_payment_issues_one_link_per_item() {
    let env = TestEnv::new();
    let buyer = env.insert_user("buyer", Role::User);
    let first = env.insert_ebook("First Book", true);
    let second = env.insert_ebook("Second Book", true);
    let order = env.insert_order(&buyer, &[&first, &second], OrderStatus::Processing);

    let (status, body) = call(
        env.app(),
        webhook(Some(WEBHOOK_SECRET), &order.payment_id, "succeeded"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order_status"], "completed");
    assert_eq!(body["data"]["links"].as_array().unwrap().len(), 2);
    assert_eq!(links_for(&env, &order), 2);

    let stored = reload_order(&env, &order);
    assert_eq!(stored.order_status, OrderStatus::Completed);
    assert_eq!(stored.payment_status, "succeeded");

    let confirmations = env.notifier.sent_with(TemplateKind::OrderConfirmation);
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].recipient, buyer.email);
    assert_eq!(env.notifier.sent_with(TemplateKind::DownloadLinkReady).len(), 2);

    let token = body["data"]["links"][0]["token"].as_str().unwrap();
    let (status, _) = call(env.app(), get(&format!("/downloads/validate/{token}"), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn replayed_completion_does_not_issue_again() {
    let env = TestEnv::new();
    let buyer = env.insert_user("buyer", Role::User);
    let ebook = env.insert_ebook("Only Book", true);
    let order = env.insert_order(&buyer, &[&ebook], OrderStatus::Processing);

    for _ in 0..2 {
        let (status, _) = call(
            env.app(),
            webhook(Some(WEBHOOK_SECRET), &order.payment_id, "completed"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(links_for(&env, &order), 1);
    assert_eq!(env.notifier.sent_with(TemplateKind::OrderConfirmation).len(), 1);
    assert_eq!(env.notifier.sent_with(TemplateKind::DownloadLinkReady).len(), 1);
}

#[tokio::test]
async fn failed_payment_marks_order_without_links() {
    let env = TestEnv::new();
    let buyer = env.insert_user("buyer", Role::User);
    let ebook = env.insert_ebook("Only Book", true);
    let order = env.insert_order(&buyer, &[&ebook], OrderStatus::Processing);

    let (status, body) = call(
        env.app(),
        webhook(Some(WEBHOOK_SECRET), &order.payment_id, "failed"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order_status"], "failed");
    assert_eq!(links_for(&env, &order), 0);
    assert_eq!(reload_order(&env, &order).order_status, OrderStatus::Failed);
    assert!(env.notifier.sent().is_empty());
}

#[tokio::test]
async fn unknown_status_only_records_the_raw_value() {
    let env = TestEnv::new();
    let buyer = env.insert_user("buyer", Role::User);
    let ebook = env.insert_ebook("Only Book", true);
    let order = env.insert_order(&buyer, &[&ebook], OrderStatus::Processing);

    let (status, _) = call(
        env.app(),
        webhook(Some(WEBHOOK_SECRET), &order.payment_id, "requires_action"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let stored = reload_order(&env, &order);
    assert_eq!(stored.order_status, OrderStatus::Processing);
    assert_eq!(stored.payment_status, "requires_action");
    assert_eq!(links_for(&env, &order), 0);
}

#[tokio::test]
async fn webhook_requires_the_shared_secret() {
    let env = TestEnv::new();
    let buyer = env.insert_user("buyer", Role::User);
    let ebook = env.insert_ebook("Only Book", true);
    let order = env.insert_order(&buyer, &[&ebook], OrderStatus::Processing);

    let (status, _) = call(
        env.app(),
        webhook(Some("guess"), &order.payment_id, "succeeded"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(env.app(), webhook(None, &order.payment_id, "succeeded")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(reload_order(&env, &order).order_status, OrderStatus::Processing);
    assert_eq!(links_for(&env, &order), 0);
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let env = TestEnv::new();

    let (status, body) = call(
        env.app(),
        webhook(Some(WEBHOOK_SECRET), "pay_missing", "succeeded"),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn links_survive_a_failing_notifier() {
    let env = TestEnv::with_notifier(RecordingNotifier::failing());
    let buyer = env.insert_user("buyer", Role::User);
    let ebook = env.insert_ebook("Only Book", true);
    let order = env.insert_order(&buyer, &[&ebook], OrderStatus::Processing);

    let (status, body) = call(
        env.app(),
        webhook(Some(WEBHOOK_SECRET), &order.payment_id, "succeeded"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["links"][0]["notification_sent"], false);
    assert_eq!(links_for(&env, &order), 1);
}
