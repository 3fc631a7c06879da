//! Inbound message pipeline.
//!
//! Each event passes a fixed series of gates (self-originated, system channel,
//! duplicate, single-flight lock, reply spacing, empty text). Survivors are resolved
//! to a member and dispatched; exactly one reply goes back per handled event.

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    commands::{first_token, CommandRegistry},
    config::{CoopProfile, PipelineConfig},
    directory::MemberDirectory,
    domain::{ChatAddress, MessageId},
    errors::Error,
    phone, replies,
    session::MessageSender,
    status::{StatusEvent, StatusHub},
    transport::{InboundEnvelope, MessageBody},
    utils::{AuditEvent, AuditLogger},
};

/// Inbound event with the fields the gates need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    pub id: MessageId,
    /// Chat the reply goes to.
    pub reply_to: ChatAddress,
    /// Raw phone of the person who wrote the message.
    pub sender_phone: String,
    pub text: String,
    pub from_me: bool,
    pub is_system_channel: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn from_envelope(env: &InboundEnvelope) -> Self {
        let author = env.author.as_ref().unwrap_or(&env.from);
        Self {
            id: env.id.clone(),
            reply_to: env.from.clone(),
            sender_phone: author.user_part().to_string(),
            text: extract_text(&env.body),
            from_me: env.from_me,
            is_system_channel: env.from.is_system_channel(),
            received_at: env.timestamp,
        }
    }
}

/// The user-typed text of a payload; empty for kinds that carry none.
pub fn extract_text(body: &MessageBody) -> String {
    match body {
        MessageBody::Text(text) => text.trim().to_string(),
        MessageBody::MediaWithCaption { caption, .. } => {
            caption.as_deref().unwrap_or_default().trim().to_string()
        }
        MessageBody::ButtonReply {
            button_id,
            display_text,
        } => {
            if display_text.trim().is_empty() {
                button_id.trim().to_string()
            } else {
                display_text.trim().to_string()
            }
        }
        MessageBody::Unsupported { .. } => String::new(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    SelfOriginated,
    SystemChannel,
    Duplicate,
    RateLimited,
    EmptyText,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Replied {
        command: Option<&'static str>,
        member: bool,
    },
    Dropped(DropReason),
    /// Lock busy; the event will be retried once after a short delay.
    Deferred,
    /// A reply was produced but could not be sent.
    SendFailed(String),
}

/// Processed-id set: bounded, and emptied wholesale when full or on a timer.
struct ProcessedCache {
    ids: HashSet<MessageId>,
    max: usize,
    clear_every: Duration,
    cleared_at: Instant,
}

impl ProcessedCache {
    fn new(max: usize, clear_every: Duration) -> Self {
        Self {
            ids: HashSet::new(),
            max,
            clear_every,
            cleared_at: Instant::now(),
        }
    }

    fn expire(&mut self) {
        if self.cleared_at.elapsed() >= self.clear_every {
            debug!(size = self.ids.len(), "clearing processed-id cache");
            self.ids.clear();
            self.cleared_at = Instant::now();
        }
    }

    fn contains(&mut self, id: &MessageId) -> bool {
        self.expire();
        self.ids.contains(id)
    }

    fn insert(&mut self, id: MessageId) {
        self.expire();
        if self.ids.len() >= self.max {
            self.ids.clear();
            self.cleared_at = Instant::now();
        }
        self.ids.insert(id);
    }
}

#[derive(Clone)]
pub struct InboundPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    cfg: PipelineConfig,
    coop: CoopProfile,
    directory: MemberDirectory,
    registry: Arc<CommandRegistry>,
    sender: Arc<dyn MessageSender>,
    status: StatusHub,
    audit: Option<AuditLogger>,

    /// Single-flight: at most one event is past gate 4 at a time.
    lock: Arc<Mutex<()>>,
    processed: std::sync::Mutex<ProcessedCache>,
    last_reply: std::sync::Mutex<Option<Instant>>,
}

impl InboundPipeline {
    pub fn new(
        cfg: PipelineConfig,
        coop: CoopProfile,
        directory: MemberDirectory,
        registry: Arc<CommandRegistry>,
        sender: Arc<dyn MessageSender>,
        status: StatusHub,
        audit: Option<AuditLogger>,
    ) -> Self {
        let processed =
            ProcessedCache::new(cfg.processed_cache_max, cfg.processed_cache_clear_interval);
        Self {
            inner: Arc::new(PipelineInner {
                cfg,
                coop,
                directory,
                registry,
                sender,
                status,
                audit,
                lock: Arc::new(Mutex::new(())),
                processed: std::sync::Mutex::new(processed),
                last_reply: std::sync::Mutex::new(None),
            }),
        }
    }

    /// One pass over `event`. A busy lock defers the event instead of dropping it.
    pub async fn handle(&self, event: InboundEvent) -> PipelineOutcome {
        if let Some(reason) = self.early_gates(&event) {
            debug!(id = %event.id, ?reason, "inbound event dropped");
            return PipelineOutcome::Dropped(reason);
        }

        match self.inner.lock.clone().try_lock_owned() {
            Ok(guard) => {
                self.mark_processed(&event.id);
                self.handle_locked(event, guard).await
            }
            Err(_) => {
                self.defer(event);
                PipelineOutcome::Deferred
            }
        }
    }

    /// Second pass of a deferred event: waits for the lock so it is handled after
    /// the event that was in flight.
    pub async fn handle_deferred(&self, event: InboundEvent) -> PipelineOutcome {
        if let Some(reason) = self.early_gates(&event) {
            debug!(id = %event.id, ?reason, "deferred event dropped");
            return PipelineOutcome::Dropped(reason);
        }
        let guard = self.inner.lock.clone().lock_owned().await;
        self.mark_processed(&event.id);
        self.handle_locked(event, guard).await
    }

    /// Consume transport envelopes until cancelled, one pass per event.
    pub fn spawn_runner(
        &self,
        mut rx: mpsc::Receiver<InboundEnvelope>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            info!("inbound pipeline started");
            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  env = rx.recv() => {
                    let Some(env) = env else { break };
                    let p = pipeline.clone();
                    tokio::spawn(async move {
                        let event = InboundEvent::from_envelope(&env);
                        let outcome = p.handle(event).await;
                        debug!(id = %env.id, ?outcome, "inbound pass finished");
                    });
                  }
                }
            }
            info!("inbound pipeline stopped");
        })
    }

    /// Gates 1-3.
    fn early_gates(&self, event: &InboundEvent) -> Option<DropReason> {
        if event.from_me {
            return Some(DropReason::SelfOriginated);
        }
        if event.is_system_channel {
            return Some(DropReason::SystemChannel);
        }
        let mut processed = self
            .inner
            .processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if processed.contains(&event.id) {
            return Some(DropReason::Duplicate);
        }
        None
    }

    fn mark_processed(&self, id: &MessageId) {
        self.inner
            .processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    fn defer(&self, event: InboundEvent) {
        let pipeline = self.clone();
        let delay = self.inner.cfg.defer_delay;
        debug!(id = %event.id, delay_ms = delay.as_millis() as u64, "pipeline busy; deferring event");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = pipeline.handle_deferred(event).await;
            debug!(?outcome, "deferred pass finished");
        });
    }

    fn too_soon(&self) -> bool {
        let last = self
            .inner
            .last_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.is_some_and(|t| t.elapsed() < self.inner.cfg.min_reply_interval)
    }

    /// Gates 5-6, then resolve, dispatch and reply. The guard is released on return.
    async fn handle_locked(
        &self,
        event: InboundEvent,
        _guard: OwnedMutexGuard<()>,
    ) -> PipelineOutcome {
        if self.too_soon() {
            debug!(id = %event.id, "reply interval not elapsed; dropping");
            return PipelineOutcome::Dropped(DropReason::RateLimited);
        }
        if event.text.is_empty() {
            debug!(id = %event.id, "no text; dropping");
            return PipelineOutcome::Dropped(DropReason::EmptyText);
        }

        let phone = phone::normalize_phone(&event.sender_phone);
        let text = event.text.trim().to_lowercase();

        let (reply, command, member_number) = match self.inner.directory.resolve(&phone).await {
            Ok(member) => match self.inner.registry.dispatch(&member, &text) {
                Ok(d) => (d.reply, d.command, Some(member.member_number)),
                Err(e) => {
                    error!(phone = %phone, error = %e, "command handler failed");
                    self.audit(AuditEvent::error(&phone, &e.to_string(), Some(&text)));
                    (replies::apology(), None, Some(member.member_number))
                }
            },
            Err(Error::MemberNotFound) => {
                info!(phone = %phone, keyword = %first_token(&text), "message from non-member");
                self.audit(AuditEvent::non_member(&phone, &text));
                (replies::not_registered(&self.inner.coop), None, None)
            }
            Err(e) => {
                error!(phone = %phone, error = %e, "member lookup failed");
                self.audit(AuditEvent::error(&phone, &e.to_string(), Some("member lookup")));
                (replies::apology(), None, None)
            }
        };

        let outcome = match self.inner.sender.send_text(&event.reply_to, &reply).await {
            Ok(receipt) => {
                *self
                    .inner
                    .last_reply
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                debug!(id = %event.id, message_id = %receipt.message_id, "reply sent");
                PipelineOutcome::Replied {
                    command,
                    member: member_number.is_some(),
                }
            }
            Err(e) => {
                warn!(id = %event.id, to = %event.reply_to, error = %e, "reply could not be sent");
                PipelineOutcome::SendFailed(e.to_string())
            }
        };

        if let Some(number) = &member_number {
            self.audit(AuditEvent::message(&phone, number, command, &text, &reply));
        }
        self.inner.status.publish(StatusEvent::MessageHandled {
            phone,
            command: command.map(str::to_string),
            member: member_number.is_some(),
        });
        outcome
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(log) = &self.inner.audit {
            log.record(event);
        }
    }
}
