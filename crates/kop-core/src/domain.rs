use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix the platform uses for one-to-one chats.
pub const USER_ADDRESS_SUFFIX: &str = "@c.us";

/// Suffixes for broadcast/system channels (status updates, newsletters).
const SYSTEM_ADDRESS_SUFFIXES: &[&str] = &["@broadcast", "@newsletter"];

/// Transport-level chat address (`6281234567890@c.us`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatAddress(pub String);

impl ChatAddress {
    /// Address of a one-to-one chat for a canonical (`62…`) phone number.
    pub fn for_phone(canonical_phone: &str) -> Self {
        Self(format!("{canonical_phone}{USER_ADDRESS_SUFFIX}"))
    }

    /// The part before `@` (the phone digits for user chats).
    pub fn user_part(&self) -> &str {
        self.0.split('@').next().unwrap_or_default()
    }

    pub fn is_system_channel(&self) -> bool {
        SYSTEM_ADDRESS_SUFFIXES
            .iter()
            .any(|suffix| self.0.ends_with(suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport message id (string, opaque).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session id (opaque string, regenerated on every full reset).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the transport hands back for an accepted outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
}

/// Opaque transport credentials persisted between runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
}
