//! In-memory fakes shared by unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    broadcast::{Campaign, CampaignCounts, CampaignStatus, CampaignStore, RecipientEntry, RecipientStatus},
    directory::{
        is_active_status, LoanStatus, LoanSummary, Member, MemberRecord, MemberStore, SavingsBalance,
    },
    domain::{ChatAddress, Credentials, DeliveryReceipt, MessageId},
    phone,
    session::{MessageSender, SessionState},
    transport::{
        BackendKind, InboundEnvelope, MessageBody, TransportBackend, TransportEvent,
        TransportFactory,
    },
    Error, Result,
};

// ============== Members ==============

pub(crate) fn sample_member_record(id: i64, phone: &str) -> MemberRecord {
    MemberRecord {
        id,
        name: format!("Anggota {id}"),
        member_number: format!("KSP-{id:04}"),
        status: "aktif".to_string(),
        phone: phone.to_string(),
        joined_at: NaiveDate::from_ymd_opt(2021, 3, 15),
    }
}

pub(crate) fn sample_member() -> Member {
    Member::from_parts(
        sample_member_record(1, "6281234567890"),
        vec![
            SavingsBalance {
                category: "pokok".into(),
                amount: 100_000,
            },
            SavingsBalance {
                category: "wajib".into(),
                amount: 1_150_000,
            },
        ],
        vec![LoanSummary {
            loan_number: "PJ-2024-001".into(),
            principal: 10_000_000,
            outstanding: 4_500_000,
            status: LoanStatus::Active,
            installments_paid: 7,
            installments_total: 12,
            next_due: NaiveDate::from_ymd_opt(2024, 8, 17),
        }],
    )
}

#[derive(Default)]
struct MemberTables {
    members: Vec<(MemberRecord, Vec<SavingsBalance>, Vec<LoanSummary>)>,
    unavailable: bool,
}

pub(crate) struct InMemoryMemberStore {
    tables: Mutex<MemberTables>,
}

impl InMemoryMemberStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(MemberTables::default()),
        }
    }

    pub fn insert(&self, record: MemberRecord, savings: Vec<SavingsBalance>, loans: Vec<LoanSummary>) {
        self.tables.lock().unwrap().members.push((record, savings, loans));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.tables.lock().unwrap().unavailable = unavailable;
    }

    fn check(&self) -> Result<()> {
        if self.tables.lock().unwrap().unavailable {
            return Err(Error::StoreUnavailable("database is locked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MemberStore for InMemoryMemberStore {
    async fn find_active_by_phone(&self, variants: &[String]) -> Result<Option<MemberRecord>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .members
            .iter()
            .map(|(record, _, _)| record)
            .find(|r| {
                let stored = phone::lookup_variants(&r.phone);
                is_active_status(&r.status) && variants.iter().any(|v| stored.contains(v))
            })
            .cloned())
    }

    async fn savings_by_category(&self, member_id: i64) -> Result<Vec<SavingsBalance>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .members
            .iter()
            .find(|(r, _, _)| r.id == member_id)
            .map(|(_, s, _)| s.clone())
            .unwrap_or_default())
    }

    async fn loans(&self, member_id: i64) -> Result<Vec<LoanSummary>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .members
            .iter()
            .find(|(r, _, _)| r.id == member_id)
            .map(|(_, _, l)| l.clone())
            .unwrap_or_default())
    }
}

// ============== Transport ==============

pub(crate) fn text_envelope(id: &str, phone: &str, text: &str) -> InboundEnvelope {
    InboundEnvelope {
        id: MessageId(id.to_string()),
        from: ChatAddress::for_phone(phone),
        author: None,
        from_me: false,
        timestamp: Utc::now(),
        body: MessageBody::Text(text.to_string()),
    }
}

#[derive(Clone, Debug)]
pub(crate) enum ConnectScript {
    Accept,
    Fail(String),
    Missing,
}

#[derive(Default)]
struct BackendState {
    events: Option<mpsc::Sender<TransportEvent>>,
    on_connect: Vec<TransportEvent>,
    script: Option<ConnectScript>,
    credentials_seen: Vec<Option<Credentials>>,
    sent: Vec<(ChatAddress, String)>,
}

/// Scriptable transport. Events are pushed by the test through [`FakeBackend::emit`].
pub(crate) struct FakeBackend {
    state: Mutex<BackendState>,
    alive: AtomicBool,
    connects: AtomicUsize,
    next_receipt: AtomicUsize,
    pub logouts: AtomicUsize,
    pub pings: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            alive: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            next_receipt: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Events pushed at the start of every connect.
    pub fn emit_on_connect(&self, events: Vec<TransportEvent>) {
        self.state.lock().unwrap().on_connect = events;
    }

    pub fn set_connect(&self, script: ConnectScript) {
        self.state.lock().unwrap().script = Some(script);
    }

    /// Push an event on the current connection. `false` when nothing listens.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let tx = self.state.lock().unwrap().events.clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(ChatAddress, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn credentials_seen(&self) -> Vec<Option<Credentials>> {
        self.state.lock().unwrap().credentials_seen.clone()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn connect(
        &self,
        credentials: Option<Credentials>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (script, initial) = {
            let mut st = self.state.lock().unwrap();
            st.credentials_seen.push(credentials);
            (
                st.script.clone().unwrap_or(ConnectScript::Accept),
                st.on_connect.clone(),
            )
        };
        match script {
            ConnectScript::Accept => {}
            ConnectScript::Fail(msg) => return Err(Error::Transport(msg)),
            ConnectScript::Missing => {
                return Err(Error::DependencyMissing("bridge not configured".into()))
            }
        }

        self.state.lock().unwrap().events = Some(events.clone());
        for ev in initial {
            let _ = events.send(ev).await;
        }
        Ok(())
    }

    async fn send(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt> {
        let n = self.next_receipt.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .lock()
            .unwrap()
            .sent
            .push((to.clone(), text.to_string()));
        Ok(DeliveryReceipt {
            message_id: MessageId(format!("fake-{n}")),
            timestamp: Utc::now(),
        })
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().events = None;
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum FactoryMode {
    Backend,
    /// Real transport cannot run here.
    Missing,
    /// Setup failure that is not a missing dependency.
    Broken,
}

pub(crate) struct FakeFactory {
    pub backend: Arc<FakeBackend>,
    pub creates: AtomicUsize,
    mode: Mutex<FactoryMode>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(FakeBackend::new()),
            creates: AtomicUsize::new(0),
            mode: Mutex::new(FactoryMode::Backend),
        }
    }

    pub fn set_mode(&self, mode: FactoryMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn TransportBackend>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            FactoryMode::Backend => Ok(self.backend.clone()),
            FactoryMode::Missing => Err(Error::DependencyMissing(
                "KOP_GATEWAY_URL not configured".into(),
            )),
            FactoryMode::Broken => Err(Error::Initialization("bad gateway api key".into())),
        }
    }
}

// ============== Sender ==============

#[derive(Default)]
struct SenderState {
    sent: Vec<(ChatAddress, String)>,
    ids: Vec<MessageId>,
    attempts: HashMap<ChatAddress, u32>,
    /// Remaining failures per address; `u32::MAX` fails forever.
    failures: HashMap<ChatAddress, u32>,
    cancel_after: Option<usize>,
    delay: Duration,
}

/// [`MessageSender`] that records sends and fails on request.
pub(crate) struct FakeSender {
    state: Mutex<SenderState>,
    not_ready: AtomicBool,
    token: CancellationToken,
}

impl FakeSender {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SenderState::default()),
            not_ready: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    pub fn sent(&self) -> Vec<(ChatAddress, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().ids.clone()
    }

    pub fn attempts_to(&self, to: &ChatAddress) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(to)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_times(&self, to: &ChatAddress, n: u32) {
        self.state.lock().unwrap().failures.insert(to.clone(), n);
    }

    pub fn fail_always(&self, to: &ChatAddress) {
        self.fail_times(to, u32::MAX);
    }

    pub fn set_not_ready(&self, not_ready: bool) {
        self.not_ready.store(not_ready, Ordering::SeqCst);
    }

    /// Cancel the session token once `n` messages went out.
    pub fn cancel_session_after(&self, n: usize) {
        self.state.lock().unwrap().cancel_after = Some(n);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }
}

#[async_trait]
impl MessageSender for FakeSender {
    async fn send_text(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt> {
        if self.not_ready.load(Ordering::SeqCst) {
            return Err(Error::NotReady(SessionState::Disconnected));
        }
        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut st = self.state.lock().unwrap();
        *st.attempts.entry(to.clone()).or_default() += 1;
        if let Some(remaining) = st.failures.get_mut(to) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(Error::Transport("send rejected".into()));
            }
        }

        let message_id = MessageId(format!("fake-msg-{}", st.ids.len() + 1));
        st.sent.push((to.clone(), text.to_string()));
        st.ids.push(message_id.clone());
        if st.cancel_after.is_some_and(|n| st.sent.len() >= n) {
            self.token.cancel();
        }
        Ok(DeliveryReceipt {
            message_id,
            timestamp: Utc::now(),
        })
    }

    fn session_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

// ============== Campaigns ==============

#[derive(Default)]
struct CampaignTables {
    campaigns: Vec<Campaign>,
    recipients: Vec<RecipientEntry>,
}

/// Campaign store with the same guarded transitions as the SQLite one.
pub(crate) struct InMemoryCampaignStore {
    tables: Mutex<CampaignTables>,
    /// Remaining injected failures per operation name.
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(CampaignTables::default()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `n` calls of `op` (a trait method name) fail as if the store
    /// were down.
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.failures.lock().unwrap().insert(op, n);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(Error::StoreUnavailable(format!("{op}: database is locked")))
            }
            _ => Ok(()),
        }
    }

    pub fn add_campaign(&self, title: &str, body: &str, phones: &[&str]) -> i64 {
        let mut t = self.tables.lock().unwrap();
        let id = t.campaigns.len() as i64 + 1;
        t.campaigns.push(Campaign {
            id,
            title: title.to_string(),
            body: body.to_string(),
            status: CampaignStatus::Pending,
            sent_count: 0,
            failed_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        });
        for phone in phones {
            let rid = t.recipients.len() as i64 + 1;
            t.recipients.push(RecipientEntry {
                id: rid,
                campaign_id: id,
                phone: phone.to_string(),
                status: RecipientStatus::Pending,
                error: None,
                message_id: None,
                sent_at: None,
                delivered_at: None,
            });
        }
        id
    }

    pub fn campaign(&self, id: i64) -> Campaign {
        self.tables
            .lock()
            .unwrap()
            .campaigns
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .unwrap()
    }

    pub fn recipients(&self, campaign_id: i64) -> Vec<RecipientEntry> {
        self.tables
            .lock()
            .unwrap()
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    fn advance(
        &self,
        pick: impl Fn(&RecipientEntry) -> bool,
        next: RecipientStatus,
        apply: impl FnOnce(&mut RecipientEntry),
    ) -> bool {
        let mut t = self.tables.lock().unwrap();
        match t
            .recipients
            .iter_mut()
            .find(|r| pick(r) && r.status.can_advance_to(next))
        {
            Some(r) => {
                r.status = next;
                apply(r);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn claim_next_pending(&self) -> Result<Option<Campaign>> {
        self.check("claim_next_pending")?;
        let mut t = self.tables.lock().unwrap();
        let next = t
            .campaigns
            .iter_mut()
            .filter(|c| c.status == CampaignStatus::Pending)
            .min_by_key(|c| (c.created_at, c.id));
        Ok(next.map(|c| {
            c.status = CampaignStatus::Sending;
            c.started_at.get_or_insert_with(Utc::now);
            c.clone()
        }))
    }

    async fn pending_recipients(&self, campaign_id: i64, limit: usize) -> Result<Vec<RecipientEntry>> {
        self.check("pending_recipients")?;
        let t = self.tables.lock().unwrap();
        Ok(t.recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.status == RecipientStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, recipient_id: i64, receipt: &DeliveryReceipt) -> Result<bool> {
        self.check("mark_sent")?;
        Ok(self.advance(|r| r.id == recipient_id, RecipientStatus::Sent, |r| {
            r.message_id = Some(receipt.message_id.clone());
            r.sent_at = Some(receipt.timestamp);
        }))
    }

    async fn mark_failed(&self, recipient_id: i64, error: &str) -> Result<bool> {
        self.check("mark_failed")?;
        Ok(self.advance(|r| r.id == recipient_id, RecipientStatus::Failed, |r| {
            r.error = Some(error.to_string());
        }))
    }

    async fn mark_delivered(&self, message_id: &MessageId, at: chrono::DateTime<Utc>) -> Result<bool> {
        Ok(self.advance(
            |r| r.message_id.as_ref() == Some(message_id),
            RecipientStatus::Delivered,
            |r| r.delivered_at = Some(at),
        ))
    }

    async fn finish(&self, campaign_id: i64) -> Result<CampaignCounts> {
        self.check("finish")?;
        let mut t = self.tables.lock().unwrap();
        let mut counts = CampaignCounts::default();
        for r in t.recipients.iter().filter(|r| r.campaign_id == campaign_id) {
            match r.status {
                RecipientStatus::Sent | RecipientStatus::Delivered => counts.sent += 1,
                RecipientStatus::Failed => counts.failed += 1,
                RecipientStatus::Pending => counts.pending += 1,
            }
        }
        if let Some(c) = t.campaigns.iter_mut().find(|c| c.id == campaign_id) {
            c.sent_count = counts.sent;
            c.failed_count = counts.failed;
            if c.status == CampaignStatus::Sending {
                c.status = CampaignStatus::Completed;
                c.completed_at = Some(Utc::now());
            }
        }
        Ok(counts)
    }

    async fn release(&self, campaign_id: i64) -> Result<()> {
        self.check("release")?;
        let mut t = self.tables.lock().unwrap();
        if let Some(c) = t
            .campaigns
            .iter_mut()
            .find(|c| c.id == campaign_id && c.status == CampaignStatus::Sending)
        {
            c.status = CampaignStatus::Pending;
        }
        Ok(())
    }

    async fn fail_campaign(&self, campaign_id: i64, _reason: &str) -> Result<()> {
        self.check("fail_campaign")?;
        let mut t = self.tables.lock().unwrap();
        if let Some(c) = t
            .campaigns
            .iter_mut()
            .find(|c| c.id == campaign_id && !c.status.is_terminal())
        {
            c.status = CampaignStatus::Failed;
            c.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
