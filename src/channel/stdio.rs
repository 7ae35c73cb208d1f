//! Stdio development transport.
//!
//! Each line typed on stdin becomes a message in the main group; outbound
//! messages print to stdout. Useful for exercising the full pipeline without
//! a real messaging account.

use super::{Channel, InboundBatch};
use crate::message::{Message, format_timestamp};
use async_trait::async_trait;
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

pub struct StdioChannel {
    main_group: String,
    seq: AtomicU64,
}

impl StdioChannel {
    pub fn new(main_group: impl Into<String>) -> Self {
        Self {
            main_group: main_group.into(),
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Channel for StdioChannel {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn run(&self, tx: Sender<InboundBatch>, cancel: CancellationToken) {
        let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(32);

        // Stdin is blocking — read it on a dedicated thread.
        let reader = tokio::task::spawn_blocking(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        let trimmed = line.trim().to_owned();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if line_tx.blocking_send(trimmed).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = line_rx.recv() => {
                    let Some(line) = line else { break };
                    let n = self.seq.fetch_add(1, Ordering::Relaxed);
                    let message = Message::new(
                        format!("stdio-{n}"),
                        self.main_group.clone(),
                        "terminal",
                        line,
                        format_timestamp(chrono::Utc::now()),
                    );
                    let batch = InboundBatch {
                        group_id: self.main_group.clone(),
                        messages: vec![message],
                    };
                    if tx.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        }

        reader.abort();
    }

    async fn send_message(&self, group_id: &str, text: &str) -> color_eyre::Result<()> {
        println!("[{group_id}] {text}");
        Ok(())
    }

    async fn set_typing(&self, _group_id: &str, _typing: bool) {
        // No typing concept on a terminal.
    }
}
