//! Signed webhook events flow through the dispatcher to delivery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use sha2::Sha256;
use tokio::sync::Mutex;
use tower::ServiceExt;

use autosherpa::channels::{Channel, Delivery, Dispatcher, WhatsAppChannel};
use autosherpa::config::WhatsAppConfig;
use autosherpa::error::ChannelError;

use common::Builder;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Delivery for Outbox {
    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .await
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }
}

impl Outbox {
    async fn wait_for(&self, n: usize) -> Vec<(String, String)> {
        for _ in 0..400 {
            {
                let sent = self.sent.lock().await;
                if sent.len() >= n {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent.lock().await.clone()
    }
}

fn config() -> WhatsAppConfig {
    WhatsAppConfig {
        access_token: SecretString::from("token"),
        phone_number_id: "1234".to_string(),
        verify_token: SecretString::from("verify-me"),
        app_secret: SecretString::from("app-secret"),
        api_base: "https://graph.facebook.com/v18.0".to_string(),
    }
}

fn event(from: &str, id: &str, body: &str) -> String {
    serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{ "changes": [{ "field": "messages", "value": {
            "messaging_product": "whatsapp",
            "metadata": { "phone_number_id": "1234" },
            "messages": [{ "id": id, "from": from, "type": "text", "text": { "body": body } }]
        }}]}]
    })
    .to_string()
}

fn signed(body: String) -> Request<Body> {
    let mut mac = Hmac::<Sha256>::new_from_slice(b"app-secret").unwrap();
    mac.update(body.as_bytes());
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    Request::post("/webhook")
        .header("x-hub-signature-256", signature)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn replies_arrive_in_order_per_user() {
    let h = Builder::new().build().await;
    let outbox = Arc::new(Outbox::default());
    let channel = WhatsAppChannel::new(&config());
    let app = channel.router();
    let stream = channel.start().await.unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(h.orchestrator),
        outbox.clone(),
        Duration::from_secs(5),
    );
    tokio::spawn(async move { dispatcher.run(stream).await });

    for (i, text) in ["I want to buy a car", "Hyundai SUV under 10 lakh", "1"]
        .into_iter()
        .enumerate()
    {
        let resp = app
            .clone()
            .oneshot(signed(event("919811111111", &format!("wamid.{i}"), text)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let sent = outbox.wait_for(3).await;
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(user, _)| user == "919811111111"));
    assert!(sent[0].1.contains("Brand"));
    assert!(sent[1].1.contains("Venue"));
    assert!(sent[2].1.contains("Nice choice"));
}

#[tokio::test]
async fn tampered_event_never_reaches_the_engine() {
    let h = Builder::new().build().await;
    let states = h.states.clone();
    let channel = WhatsAppChannel::new(&config());
    let app = channel.router();
    let stream = channel.start().await.unwrap();
    let outbox = Arc::new(Outbox::default());
    let dispatcher = Dispatcher::new(Arc::new(h.orchestrator), outbox.clone(), Duration::from_secs(5));
    tokio::spawn(async move { dispatcher.run(stream).await });

    let mut req = signed(event("919822222222", "wamid.x", "I want to buy a car"));
    *req.body_mut() = Body::from(event("919822222222", "wamid.x", "book a service"));
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(outbox.sent.lock().await.is_empty());
    assert!(states.get("919822222222").await.unwrap().is_none());
}
