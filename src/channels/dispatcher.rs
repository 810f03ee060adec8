//! Per-user dispatch of inbound messages.
//!
//! Each user gets one worker task fed by an unbounded queue. The worker
//! handles that user's messages strictly in acceptance order and hands each
//! reply to the delivery before taking the next one, so replies never
//! overtake each other. Workers for different users run concurrently and
//! exit after sitting idle.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channels::{Delivery, IncomingMessage, MessageStream, OutboundMessage};
use crate::conversation::{Orchestrator, phrases};

/// Turns one inbound message into one reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, user_id: &str, text: &str) -> OutboundMessage;
}

#[async_trait]
impl MessageHandler for Orchestrator {
    async fn handle(&self, user_id: &str, text: &str) -> OutboundMessage {
        Orchestrator::handle(self, user_id, text).await
    }
}

/// Run the handler, turning a panic into the fallback reply.
pub async fn respond(handler: &dyn MessageHandler, user_id: &str, text: &str) -> OutboundMessage {
    match AssertUnwindSafe(handler.handle(user_id, text)).catch_unwind().await {
        Ok(reply) => reply,
        Err(_) => {
            error!(user_id = %user_id, "Message handler panicked");
            OutboundMessage::new(user_id, phrases::fallback())
        }
    }
}

type Workers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    delivery: Arc<dyn Delivery>,
    idle: Duration,
    workers: Workers,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        delivery: Arc<dyn Delivery>,
        idle: Duration,
    ) -> Self {
        Self {
            handler,
            delivery,
            idle,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accept a message for processing. Returns immediately.
    pub fn dispatch(&self, msg: IncomingMessage) {
        let mut workers = match self.workers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };

        let text = match workers.get(&msg.user_id) {
            Some(tx) => match tx.send(msg.content) {
                Ok(()) => return,
                Err(mpsc::error::SendError(text)) => text,
            },
            None => msg.content,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: we still hold the receiver.
        let _ = tx.send(text);
        workers.insert(msg.user_id.clone(), tx);
        debug!(user_id = %msg.user_id, "Spawning dispatch worker");

        tokio::spawn(run_worker(
            msg.user_id,
            rx,
            Arc::clone(&self.handler),
            Arc::clone(&self.delivery),
            Arc::clone(&self.workers),
            self.idle,
        ));
    }

    /// Drain a channel's stream until it ends.
    pub async fn run(&self, mut stream: MessageStream) {
        while let Some(msg) = stream.next().await {
            debug!(channel = %msg.channel, user_id = %msg.user_id, "Inbound message");
            self.dispatch(msg);
        }
        info!("Inbound stream closed");
    }

    /// Number of live per-user workers.
    pub fn active_workers(&self) -> usize {
        match self.workers.lock() {
            Ok(w) => w.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

async fn run_worker(
    user_id: String,
    mut rx: mpsc::UnboundedReceiver<String>,
    handler: Arc<dyn MessageHandler>,
    delivery: Arc<dyn Delivery>,
    workers: Workers,
    idle: Duration,
) {
    loop {
        let text = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(_) => {
                // Retire under the map lock so a concurrent dispatch either
                // lands in our queue first or finds no worker and spawns one.
                let mut map = match workers.lock() {
                    Ok(w) => w,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match rx.try_recv() {
                    Ok(text) => text,
                    Err(_) => {
                        map.remove(&user_id);
                        debug!(user_id = %user_id, "Dispatch worker idle, exiting");
                        return;
                    }
                }
            }
        };

        let reply = respond(handler.as_ref(), &user_id, &text).await;
        if let Err(e) = delivery.send(&reply.user_id, &reply.text).await {
            warn!(user_id = %user_id, "Reply delivery failed: {}", e);
        }
    }
}
