//! WhatsApp Cloud API channel.
//!
//! Inbound: an axum router serving the Meta webhook (`GET /webhook` for the
//! subscription handshake, `POST /webhook` for signed message events).
//! Outbound: `WhatsAppClient` posts text messages to the Graph API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::channels::{Channel, Delivery, IncomingMessage, MessageStream};
use crate::config::WhatsAppConfig;
use crate::error::ChannelError;

/// WhatsApp caps a text body at 4096 characters.
const MAX_MESSAGE_LEN: usize = 4096;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ── Webhook channel ─────────────────────────────────────────────────────

#[derive(Clone)]
struct WebhookState {
    inner: Arc<WebhookInner>,
}

struct WebhookInner {
    verify_token: SecretString,
    app_secret: SecretString,
    phone_number_id: String,
    incoming_tx: mpsc::UnboundedSender<IncomingMessage>,
}

/// Receives user messages from the WhatsApp webhook.
pub struct WhatsAppChannel {
    inner: Arc<WebhookInner>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
}

impl WhatsAppChannel {
    pub fn new(config: &WhatsAppConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(WebhookInner {
            verify_token: config.verify_token.clone(),
            app_secret: config.app_secret.clone(),
            phone_number_id: config.phone_number_id.clone(),
            incoming_tx,
        });
        Self {
            inner,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Build the axum router with the `/webhook` endpoints.
    pub fn router(&self) -> Router {
        let state = WebhookState {
            inner: Arc::clone(&self.inner),
        };

        Router::new()
            .route("/webhook", get(verify_handler).post(event_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let rx = self
            .incoming_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "whatsapp".to_string(),
                reason: "start() already called".to_string(),
            })?;

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

async fn verify_handler(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<WebhookState>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or_default();
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected = state.inner.verify_token.expose_secret();

    let token_matches = !expected.is_empty()
        && bool::from(token.as_bytes().ct_eq(expected.as_bytes()));

    if mode == "subscribe" && token_matches {
        info!("WhatsApp webhook verified");
        return (StatusCode::OK, challenge).into_response();
    }

    warn!(mode = %mode, "WhatsApp webhook verification rejected");
    StatusCode::FORBIDDEN.into_response()
}

async fn event_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify_signature(state.inner.app_secret.expose_secret(), signature, &body) {
        warn!("Rejected WhatsApp event with a bad signature");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("Unreadable WhatsApp event payload: {}", e);
            return StatusCode::OK;
        }
    };

    for msg in payload.text_messages(&state.inner.phone_number_id) {
        if state.inner.incoming_tx.send(msg).is_err() {
            warn!("WhatsApp dispatcher is gone; dropping inbound message");
            break;
        }
    }

    StatusCode::OK
}

/// Check `X-Hub-Signature-256` (`sha256=<hex>`) against the raw body.
fn verify_signature(app_secret: &str, header: Option<&str>, body: &[u8]) -> bool {
    let Some(header) = header else {
        return false;
    };
    let hex_sig = header.trim();
    let hex_sig = hex_sig.strip_prefix("sha256=").unwrap_or(hex_sig);
    let Ok(signature) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    bool::from(expected.as_slice().ct_eq(signature.as_slice()))
}

// ── Webhook payload ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    metadata: Option<ChangeMetadata>,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    messages: Vec<InboundMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeMetadata {
    #[serde(default)]
    phone_number_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Contact {
    #[serde(default)]
    wa_id: String,
    #[serde(default)]
    profile: Option<ContactProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct ContactProfile {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct InboundMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<TextBody>,
}

#[derive(Debug, Default, Deserialize)]
struct TextBody {
    #[serde(default)]
    body: String,
}

impl WebhookPayload {
    /// Text messages addressed to `phone_number_id`, in payload order.
    /// Status callbacks and media are skipped.
    fn text_messages(self, phone_number_id: &str) -> Vec<IncomingMessage> {
        let mut out = Vec::new();
        for change in self.entry.into_iter().flat_map(|e| e.changes) {
            let value = change.value;
            if let Some(meta) = &value.metadata
                && !meta.phone_number_id.is_empty()
                && meta.phone_number_id != phone_number_id
            {
                debug!(phone_number_id = %meta.phone_number_id, "Skipping event for another number");
                continue;
            }
            for msg in value.messages {
                let Some(text) = msg.text.filter(|_| msg.kind == "text") else {
                    debug!(kind = %msg.kind, "Skipping non-text WhatsApp message");
                    continue;
                };
                if msg.from.is_empty() {
                    continue;
                }
                let profile_name = value
                    .contacts
                    .iter()
                    .find(|c| c.wa_id == msg.from)
                    .and_then(|c| c.profile.as_ref())
                    .map(|p| p.name.clone());
                out.push(
                    IncomingMessage::new("whatsapp", msg.from, text.body).with_metadata(
                        serde_json::json!({ "wamid": msg.id, "profile_name": profile_name }),
                    ),
                );
            }
        }
        out
    }
}

// ── Outbound client ─────────────────────────────────────────────────────

/// Sends text replies through the WhatsApp Cloud API.
pub struct WhatsAppClient {
    http: reqwest::Client,
    messages_url: String,
    access_token: SecretString,
}

impl WhatsAppClient {
    pub fn new(config: &WhatsAppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            messages_url: format!(
                "{}/{}/messages",
                config.api_base.trim_end_matches('/'),
                config.phone_number_id
            ),
            access_token: config.access_token.clone(),
        }
    }

    async fn send_chunk(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body },
        });

        let resp = self
            .http
            .post(&self.messages_url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "whatsapp".to_string(),
                reason: format!("{status}: {detail}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for WhatsAppClient {
    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.send_chunk(user_id, &chunk).await?;
        }
        Ok(())
    }
}

/// Split a message into chunks of at most `max_len` bytes, preferring
/// newline then space boundaries.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
