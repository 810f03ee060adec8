//! CLI channel: stdin/stdout REPL for local testing.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, Delivery, IncomingMessage, MessageStream};
use crate::error::ChannelError;

/// Reads one message per line from stdin and prints replies to stdout.
pub struct CliChannel {
    user_id: String,
    started: AtomicBool,
}

impl CliChannel {
    pub fn new() -> Self {
        Self::for_user("local-user")
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            started: AtomicBool::new(false),
        }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::StartupFailed {
                name: "cli".to_string(),
                reason: "start() already called".to_string(),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let user_id = self.user_id.clone();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            eprint!("> ");
                            continue;
                        }
                        let msg = IncomingMessage::new("cli", user_id.as_str(), line);
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Delivery for CliChannel {
    async fn send(&self, _user_id: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n{}\n", text);
        eprint!("> ");
        Ok(())
    }
}
