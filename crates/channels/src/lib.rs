//! Outbound messaging channels.
//!
//! A channel is the single external session every campaign send flows
//! through. The dispatcher only sees the [`MessageChannel`] trait.

pub mod scripted;
pub mod whatsapp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scripted::ScriptedChannel;
pub use whatsapp::WhatsAppChannel;

/// Session state reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),

    #[error("Rejected by channel ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Send timed out after {0}s")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Capability to deliver one text message to one phone number.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn connection_status(&self) -> ConnectionStatus;

    /// Send `text` to `phone`. Returns the channel's message id once the
    /// channel has accepted the message.
    async fn send_message(&self, phone: &str, text: &str) -> Result<String, ChannelError>;
}
