use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::MessageId;

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Push notification for dashboards and internal observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    State {
        state: String,
    },
    Pairing {
        raw: String,
        rendered: String,
        cycle: u64,
    },
    Connected {
        connected: bool,
        principal: Option<String>,
        degraded: bool,
    },
    Disconnected {
        reason: String,
    },
    ConnectionFailed {
        attempts: u32,
    },
    LoggedOut,
    MessageHandled {
        phone: String,
        command: Option<String>,
        member: bool,
    },
    Delivered {
        message_id: MessageId,
    },
}

/// Best-effort fan-out of [`StatusEvent`]s.
///
/// Publishing never blocks and never fails; with no subscribers events are dropped,
/// and a subscriber that falls behind sees `Lagged` on its own receiver only.
#[derive(Clone)]
pub struct StatusHub {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: StatusEvent) {
        tracing::debug!(?event, "status event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
