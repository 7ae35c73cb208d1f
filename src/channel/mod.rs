//! Channel abstraction for messaging transports.
//!
//! The transport owns connection, authentication, and wire encoding; courier
//! only consumes this trait. The bundled [`StdioChannel`] is a development
//! transport that maps terminal lines to the main group.

pub mod stdio;

pub use stdio::StdioChannel;

use crate::message::Message;
use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// A batch of newly received messages for one group, pushed by a transport.
#[derive(Debug, Clone)]
pub struct InboundBatch {
    pub group_id: String,
    pub messages: Vec<Message>,
}

/// Trait for messaging transport integrations.
///
/// Implementations run a background receive loop producing [`InboundBatch`]es
/// and accept outbound sends and typing signals.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Run the channel's receive loop, sending batches to `tx`.
    /// Should run until `cancel` is triggered.
    async fn run(&self, tx: Sender<InboundBatch>, cancel: CancellationToken);

    /// Send a message into a group.
    async fn send_message(&self, group_id: &str, text: &str) -> color_eyre::Result<()>;

    /// Toggle the "typing" indicator for a group. Best-effort; transports
    /// without the concept ignore it.
    async fn set_typing(&self, group_id: &str, typing: bool);
}
