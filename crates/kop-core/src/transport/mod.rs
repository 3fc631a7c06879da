//! Messaging transport port.
//!
//! The session manager owns exactly one [`TransportBackend`]. Backends push
//! [`TransportEvent`]s into the channel handed to `connect` and expose the single
//! imperative `send`.

pub mod simulated;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    domain::{ChatAddress, Credentials, DeliveryReceipt, MessageId},
    Result,
};

pub use simulated::SimulatedTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Real,
    Simulated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account was logged out (from the phone or through `logout`).
    Logout,
    /// Another client took over the session.
    Conflict,
    Network(String),
    Other(String),
}

impl DisconnectReason {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "logout" | "logged_out" | "unpaired" => Self::Logout,
            "conflict" | "replaced" => Self::Conflict,
            "" => Self::Other("unknown".to_string()),
            _ if lower.contains("network") || lower.contains("timeout") => {
                Self::Network(raw.trim().to_string())
            }
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn is_logout(&self) -> bool {
        matches!(self, Self::Logout)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logout => f.write_str("logout"),
            Self::Conflict => f.write_str("conflict"),
            Self::Network(s) => write!(f, "network: {s}"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Inbound payload, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    MediaWithCaption {
        mime: String,
        caption: Option<String>,
    },
    ButtonReply {
        button_id: String,
        display_text: String,
    },
    Unsupported {
        kind: String,
    },
}

/// Raw inbound message as the transport delivers it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub id: MessageId,
    pub from: ChatAddress,
    /// Group participant, when the chat is a group.
    pub author: Option<ChatAddress>,
    pub from_me: bool,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A pairing challenge (QR payload) to show to the operator.
    PairingChallenge { code: String },
    Authenticated { credentials: Option<Credentials> },
    /// Connection is usable. `principal` is the account phone when verified.
    Ready { principal: Option<String> },
    Disconnected { reason: DisconnectReason },
    /// Stored credentials were rejected.
    AuthFailure { reason: String },
    Message(InboundEnvelope),
    /// Delivery acknowledgement for a previously sent message.
    Delivered { message_id: MessageId },
}

#[async_trait]
pub trait TransportBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the connection. Returns once the backend is running; progress arrives
    /// as events on `events`. `DependencyMissing` means the backend cannot run here.
    async fn connect(
        &self,
        credentials: Option<Credentials>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()>;

    async fn send(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt>;

    /// Liveness poll used by the health monitor.
    async fn is_alive(&self) -> Result<bool>;

    /// Keep-alive (presence) ping while ready.
    async fn ping(&self) -> Result<()>;

    /// Tell the platform to drop the linked session.
    async fn logout(&self) -> Result<()>;

    /// Tear down local resources. Never fails.
    async fn shutdown(&self);
}

/// Builds the real backend. The manager falls back to [`SimulatedTransport`] when
/// this fails with a missing-dependency error.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn TransportBackend>>;
}
