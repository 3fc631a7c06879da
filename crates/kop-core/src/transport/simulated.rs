use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BackendKind, TransportBackend, TransportEvent};
use crate::{
    domain::{ChatAddress, Credentials, DeliveryReceipt, MessageId},
    Result,
};

/// Prefix of pairing challenges issued in degraded mode.
pub const SIMULATED_CHALLENGE_PREFIX: &str = "kop-simulated:";

/// Stand-in backend for environments where the real transport cannot run.
///
/// Issues a synthetic pairing challenge, reports ready after a fixed delay without
/// a verified principal, and acknowledges every send locally.
pub struct SimulatedTransport {
    ready_delay: Duration,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    events: Option<mpsc::Sender<TransportEvent>>,
    cancel: Option<CancellationToken>,
}

impl SimulatedTransport {
    pub fn new(ready_delay: Duration) -> Self {
        Self {
            ready_delay,
            state: Mutex::new(SimState::default()),
        }
    }
}

#[async_trait]
impl TransportBackend for SimulatedTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn connect(
        &self,
        _credentials: Option<Credentials>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut st = self.state.lock().await;
            if let Some(prev) = st.cancel.replace(cancel.clone()) {
                prev.cancel();
            }
            st.events = Some(events.clone());
        }

        let code = format!("{SIMULATED_CHALLENGE_PREFIX}{}", uuid::Uuid::new_v4());
        let delay = self.ready_delay;
        tokio::spawn(async move {
            if events
                .send(TransportEvent::PairingChallenge { code })
                .await
                .is_err()
            {
                return;
            }
            tokio::select! {
              _ = cancel.cancelled() => {}
              _ = tokio::time::sleep(delay) => {
                let _ = events.send(TransportEvent::Authenticated { credentials: None }).await;
                let _ = events.send(TransportEvent::Ready { principal: None }).await;
              }
            }
        });
        Ok(())
    }

    async fn send(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt> {
        let message_id = MessageId(format!("sim-{}", uuid::Uuid::new_v4()));
        let events = self.state.lock().await.events.clone();
        tracing::debug!(to = %to, message_id = %message_id, chars = text.chars().count(), "simulated send");

        if let Some(events) = events {
            let _ = events.try_send(TransportEvent::Delivered {
                message_id: message_id.clone(),
            });
        }
        Ok(DeliveryReceipt {
            message_id,
            timestamp: Utc::now(),
        })
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {
        let mut st = self.state.lock().await;
        if let Some(tok) = st.cancel.take() {
            tok.cancel();
        }
        st.events = None;
    }
}
