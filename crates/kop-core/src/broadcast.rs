//! Campaign broadcasts.
//!
//! Pending campaigns are claimed one at a time and sent to their recipients in
//! batches through the session's [`MessageSender`], with spacing between messages
//! and batches. Per-recipient failures are retried with linear backoff and never
//! abort the campaign. Delivery acknowledgements advance `sent` recipients to
//! `delivered`.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::BroadcastConfig,
    domain::{ChatAddress, DeliveryReceipt, MessageId},
    phone,
    session::MessageSender,
    status::StatusEvent,
    utils::{AuditEvent, AuditLogger},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Sending,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl RecipientStatus {
    /// Recipient status only moves forward: pending → sent → delivered, or
    /// pending → failed.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent) | (Self::Pending, Self::Failed) | (Self::Sent, Self::Delivered)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Campaign {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub status: CampaignStatus,
    pub sent_count: u32,
    pub failed_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientEntry {
    pub id: i64,
    pub campaign_id: i64,
    pub phone: String,
    pub status: RecipientStatus,
    pub error: Option<String>,
    pub message_id: Option<MessageId>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Counters recomputed from recipient rows. `sent` includes delivered recipients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CampaignCounts {
    pub sent: u32,
    pub failed: u32,
    pub pending: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CampaignReport {
    pub campaign_id: i64,
    pub sent: u32,
    pub failed: u32,
    /// `Pending` when the run was interrupted and the campaign released.
    pub status: CampaignStatus,
}

/// Campaign persistence. Status writes are guarded: `mark_*` return `false` when the
/// row was not in a state the transition is allowed from.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Oldest pending campaign, atomically moved to `sending`.
    async fn claim_next_pending(&self) -> Result<Option<Campaign>>;

    async fn pending_recipients(&self, campaign_id: i64, limit: usize) -> Result<Vec<RecipientEntry>>;

    async fn mark_sent(&self, recipient_id: i64, receipt: &DeliveryReceipt) -> Result<bool>;

    async fn mark_failed(&self, recipient_id: i64, error: &str) -> Result<bool>;

    /// `sent` → `delivered` for whichever recipient holds `message_id`.
    async fn mark_delivered(&self, message_id: &MessageId, at: DateTime<Utc>) -> Result<bool>;

    /// Recompute counters and move the campaign to `completed`.
    async fn finish(&self, campaign_id: i64) -> Result<CampaignCounts>;

    /// `sending` → `pending`, so an interrupted campaign is picked up again later.
    async fn release(&self, campaign_id: i64) -> Result<()>;

    async fn fail_campaign(&self, campaign_id: i64, reason: &str) -> Result<()>;
}

/// Rejects bodies that can never be delivered.
pub fn validate_body(body: &str, max_len: usize) -> std::result::Result<(), String> {
    if body.trim().is_empty() {
        return Err("empty message body".to_string());
    }
    let len = body.chars().count();
    if len > max_len {
        return Err(format!("message body has {len} characters (max {max_len})"));
    }
    Ok(())
}

/// Tries per store write that follows a message already handed to the transport.
const STORE_WRITE_ATTEMPTS: u32 = 3;

/// Sent messages whose `sent` mark has not reached the store yet, by recipient id.
type Unrecorded = HashMap<i64, DeliveryReceipt>;

enum Delivery {
    Sent,
    Failed,
    /// Stopped mid-retry; the recipient stays pending.
    Interrupted,
}

/// Both tokens a campaign run stops on: process shutdown and the session ending.
struct StopSignals {
    shutdown: CancellationToken,
    session: CancellationToken,
}

impl StopSignals {
    fn is_set(&self) -> bool {
        self.shutdown.is_cancelled() || self.session.is_cancelled()
    }

    /// Sleep for `d`; `false` when a stop signal fired first.
    async fn pause(&self, d: Duration) -> bool {
        if d.is_zero() {
            return !self.is_set();
        }
        tokio::select! {
          _ = self.shutdown.cancelled() => false,
          _ = self.session.cancelled() => false,
          _ = tokio::time::sleep(d) => true,
        }
    }
}

#[derive(Clone)]
pub struct BroadcastSender {
    inner: Arc<BroadcastInner>,
}

struct BroadcastInner {
    cfg: BroadcastConfig,
    store: Arc<dyn CampaignStore>,
    sender: Arc<dyn MessageSender>,
    audit: Option<AuditLogger>,
}

impl BroadcastSender {
    pub fn new(
        cfg: BroadcastConfig,
        store: Arc<dyn CampaignStore>,
        sender: Arc<dyn MessageSender>,
        audit: Option<AuditLogger>,
    ) -> Self {
        Self {
            inner: Arc::new(BroadcastInner {
                cfg,
                store,
                sender,
                audit,
            }),
        }
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move { sender.run(shutdown).await })
    }

    /// Poll for pending campaigns until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_ms = self.inner.cfg.poll_interval.as_millis() as u64,
            "broadcast sender started"
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once(&shutdown).await {
                // Finished one; look for the next right away.
                Ok(Some(report)) if report.status.is_terminal() => continue,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "broadcast poll failed"),
            }
            tokio::select! {
              _ = shutdown.cancelled() => break,
              _ = tokio::time::sleep(self.inner.cfg.poll_interval) => {}
            }
        }
        info!("broadcast sender stopped");
    }

    /// Claim and process at most one campaign.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<Option<CampaignReport>> {
        let Some(campaign) = self.inner.store.claim_next_pending().await? else {
            return Ok(None);
        };
        self.process_campaign(&campaign, shutdown).await.map(Some)
    }

    /// Run one claimed campaign. A store error ends the run early and releases the
    /// campaign so the poll loop can pick it up again.
    pub async fn process_campaign(
        &self,
        campaign: &Campaign,
        shutdown: &CancellationToken,
    ) -> Result<CampaignReport> {
        let mut unrecorded = Unrecorded::new();
        let result = self.run_campaign(campaign, shutdown, &mut unrecorded).await;
        if let Err(e) = &result {
            warn!(campaign_id = campaign.id, error = %e, "broadcast aborted; releasing campaign");
            self.record_unrecorded(campaign, &mut unrecorded).await;
            let store = &self.inner.store;
            let id = campaign.id;
            if let Err(e) = self.persist("release campaign", move || store.release(id)).await {
                error!(campaign_id = id, error = %e, "could not release campaign");
            }
        }
        result
    }

    async fn run_campaign(
        &self,
        campaign: &Campaign,
        shutdown: &CancellationToken,
        unrecorded: &mut Unrecorded,
    ) -> Result<CampaignReport> {
        let store = &self.inner.store;
        let cfg = &self.inner.cfg;

        if let Err(reason) = validate_body(&campaign.body, cfg.max_body_len) {
            warn!(campaign_id = campaign.id, reason = %reason, "campaign rejected");
            store.fail_campaign(campaign.id, &reason).await?;
            return Ok(CampaignReport {
                campaign_id: campaign.id,
                sent: 0,
                failed: 0,
                status: CampaignStatus::Failed,
            });
        }

        info!(campaign_id = campaign.id, title = %campaign.title, "broadcast started");
        let stop = StopSignals {
            shutdown: shutdown.clone(),
            session: self.inner.sender.session_token(),
        };
        let (mut sent, mut failed) = (0u32, 0u32);

        'batches: loop {
            if stop.is_set() {
                break 'batches;
            }
            // Unrecorded recipients still read as pending; skip past them.
            let batch: Vec<RecipientEntry> = store
                .pending_recipients(campaign.id, cfg.batch_size + unrecorded.len())
                .await?
                .into_iter()
                .filter(|r| !unrecorded.contains_key(&r.id))
                .take(cfg.batch_size)
                .collect();
            if batch.is_empty() {
                self.record_unrecorded(campaign, unrecorded).await;
                let counts = store.finish(campaign.id).await?;
                info!(
                    campaign_id = campaign.id,
                    sent = counts.sent,
                    failed = counts.failed,
                    "broadcast completed"
                );
                return Ok(CampaignReport {
                    campaign_id: campaign.id,
                    sent: counts.sent,
                    failed: counts.failed,
                    status: CampaignStatus::Completed,
                });
            }

            for (i, recipient) in batch.iter().enumerate() {
                if i > 0 && !stop.pause(cfg.message_delay).await {
                    break 'batches;
                }
                match self.deliver(campaign, recipient, &stop, unrecorded).await? {
                    Delivery::Sent => sent += 1,
                    Delivery::Failed => failed += 1,
                    Delivery::Interrupted => break 'batches,
                }
            }

            debug!(campaign_id = campaign.id, size = batch.len(), "batch done");
            if !stop.pause(cfg.batch_pause).await {
                break 'batches;
            }
        }

        warn!(
            campaign_id = campaign.id,
            sent, failed, "broadcast interrupted; campaign released"
        );
        self.record_unrecorded(campaign, unrecorded).await;
        store.release(campaign.id).await?;
        Ok(CampaignReport {
            campaign_id: campaign.id,
            sent,
            failed,
            status: CampaignStatus::Pending,
        })
    }

    async fn deliver(
        &self,
        campaign: &Campaign,
        recipient: &RecipientEntry,
        stop: &StopSignals,
        unrecorded: &mut Unrecorded,
    ) -> Result<Delivery> {
        let store = &self.inner.store;
        let canonical = phone::normalize_phone(&recipient.phone);
        if !phone::is_plausible(&canonical) {
            let reason = format!("invalid phone number: {:?}", recipient.phone);
            warn!(campaign_id = campaign.id, recipient_id = recipient.id, "{reason}");
            store.mark_failed(recipient.id, &reason).await?;
            self.audit(AuditEvent::delivery(campaign.id, &recipient.phone, None, 0, Some(&reason)));
            return Ok(Delivery::Failed);
        }

        let to = ChatAddress::for_phone(&canonical);
        let max_attempts = self.inner.cfg.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.sender.send_text(&to, &campaign.body).await {
                Ok(receipt) => {
                    debug!(
                        campaign_id = campaign.id,
                        to = %to,
                        message_id = %receipt.message_id,
                        attempt,
                        "broadcast message sent"
                    );
                    self.audit(AuditEvent::delivery(
                        campaign.id,
                        &canonical,
                        Some(&receipt.message_id.0),
                        attempt,
                        None,
                    ));
                    let (id, r) = (recipient.id, &receipt);
                    let recorded = self.persist("mark recipient sent", move || store.mark_sent(id, r)).await;
                    if let Err(e) = recorded {
                        warn!(campaign_id = campaign.id, recipient_id = id, error = %e, "sent message not recorded yet");
                        unrecorded.insert(id, receipt);
                    }
                    return Ok(Delivery::Sent);
                }
                Err(e) if attempt >= max_attempts => {
                    let reason = e.to_string();
                    warn!(campaign_id = campaign.id, to = %to, attempts = attempt, error = %reason, "broadcast message failed");
                    store.mark_failed(recipient.id, &reason).await?;
                    self.audit(AuditEvent::delivery(campaign.id, &canonical, None, attempt, Some(&reason)));
                    return Ok(Delivery::Failed);
                }
                Err(e) => {
                    let wait = self.inner.cfg.retry_backoff.saturating_mul(attempt);
                    debug!(to = %to, attempt, wait_ms = wait.as_millis() as u64, error = %e, "send failed; retrying");
                    if !stop.pause(wait).await {
                        return Ok(Delivery::Interrupted);
                    }
                }
            }
        }
    }

    /// Last try at marking already-sent recipients. Whatever still fails stays pending
    /// in the store and is logged.
    async fn record_unrecorded(&self, campaign: &Campaign, unrecorded: &mut Unrecorded) {
        let store = &self.inner.store;
        for (id, receipt) in std::mem::take(unrecorded) {
            let r = &receipt;
            let recorded = self.persist("mark recipient sent", move || store.mark_sent(id, r)).await;
            if let Err(e) = recorded {
                error!(
                    campaign_id = campaign.id,
                    recipient_id = id,
                    message_id = %receipt.message_id,
                    error = %e,
                    "sent message could not be recorded"
                );
                unrecorded.insert(id, receipt);
            }
        }
    }

    /// Retry a store write with linear backoff, up to [`STORE_WRITE_ATTEMPTS`] tries.
    async fn persist<T, F, Fut>(&self, what: &str, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match write().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= STORE_WRITE_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(what, attempt, error = %e, "store write failed; retrying");
                    tokio::time::sleep(self.inner.cfg.retry_backoff.saturating_mul(attempt)).await;
                }
            }
        }
    }

    /// Advance `sent` recipients to `delivered` as acknowledgements arrive.
    pub fn spawn_delivery_tracker(
        &self,
        events: broadcast::Receiver<StatusEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move { sender.track_deliveries(events, shutdown).await })
    }

    pub async fn track_deliveries(
        &self,
        mut events: broadcast::Receiver<StatusEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
              _ = shutdown.cancelled() => break,
              ev = events.recv() => match ev {
                Ok(StatusEvent::Delivered { message_id }) => {
                    match self.inner.store.mark_delivered(&message_id, Utc::now()).await {
                        Ok(true) => debug!(message_id = %message_id, "broadcast message delivered"),
                        // Not a broadcast message, or already delivered.
                        Ok(false) => {}
                        Err(e) => warn!(message_id = %message_id, error = %e, "could not record delivery"),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "delivery tracker lagged"),
                Err(RecvError::Closed) => break,
              }
            }
        }
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(log) = &self.inner.audit {
            log.record(event);
        }
    }
}
