//! Connection session manager.
//!
//! Owns the single transport connection: pairing, readiness, reconnection with
//! capped exponential backoff, health monitoring, keep-alive pings and the degraded
//! fallback. Everything outbound funnels through [`ConnectionManager::send`].

use std::{
    fmt,
    future::Future,
    path::Path,
    pin::Pin,
    sync::{Arc, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qrcode::{render::unicode, QrCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{BackgroundTask, BackoffPolicy, ScheduledTask},
    config::Config,
    domain::{ChatAddress, Credentials, DeliveryReceipt, SessionId},
    errors::Error,
    status::{StatusEvent, StatusHub},
    throttle::SendThrottle,
    transport::{
        BackendKind, DisconnectReason, InboundEnvelope, SimulatedTransport, TransportBackend,
        TransportEvent, TransportFactory,
    },
    Result,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Initializing,
    QrPending,
    Authenticated,
    Ready,
    LoggedOut,
    /// Simulated backend in use: behaves like `Ready` without a verified principal.
    Degraded,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Initializing => "initializing",
            Self::QrPending => "qr_pending",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::LoggedOut => "logged_out",
            Self::Degraded => "degraded",
        }
    }

    pub fn accepts_sends(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// A connect cycle is underway or established; `initialize` is a no-op.
    fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::QrPending | Self::Authenticated | Self::Ready | Self::Degraded
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Displayable pairing challenge. Single-use: replaced by every new challenge and
/// dropped once the transport authenticates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PairingArtifact {
    pub raw: String,
    pub rendered: String,
    pub issued_at: DateTime<Utc>,
    pub cycle: u64,
}

/// Render a pairing payload as a terminal QR code.
pub fn render_pairing_code(raw: &str) -> Result<String> {
    let code = QrCode::new(raw.as_bytes())
        .map_err(|e| Error::External(format!("cannot encode pairing code: {e}")))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub principal: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub pairing: Option<PairingArtifact>,
    pub backend: Option<BackendKind>,
    pairing_cycles: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            id: SessionId::generate(),
            state: SessionState::Disconnected,
            principal: None,
            last_heartbeat: None,
            reconnect_attempts: 0,
            pairing: None,
            backend: None,
            pairing_cycles: 0,
        }
    }

    /// Replace wholesale with a fresh session (new id). Pairing cycle numbers keep
    /// counting so artifacts from the old session can never be mistaken for new ones.
    fn renew(&mut self) {
        let cycles = self.pairing_cycles;
        *self = Self::new();
        self.pairing_cycles = cycles;
    }
}

/// Point-in-time view of the session for dashboards and tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub principal: Option<String>,
    pub reconnect_attempts: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub backend: Option<BackendKind>,
    pub has_pairing_artifact: bool,
    pub terminal_failure: bool,
}

/// What gets written to the session file once the transport is ready.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub principal: Option<String>,
    pub backend: BackendKind,
    pub connected_at: DateTime<Utc>,
}

/// Outbound port used by the inbound pipeline and the broadcast sender.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt>;

    /// Cancelled when the current session ends (logout or reset).
    fn session_token(&self) -> CancellationToken {
        CancellationToken::new()
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cfg: Arc<Config>,
    policy: BackoffPolicy,
    factory: Arc<dyn TransportFactory>,
    status: StatusHub,
    inbound: mpsc::Sender<InboundEnvelope>,
    throttle: SendThrottle,
    session_token: std::sync::Mutex<CancellationToken>,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    session: Session,
    backend: Option<Arc<dyn TransportBackend>>,
    /// Bumped on every connect and teardown; events and timers from older
    /// generations are ignored.
    generation: u64,
    pump: Option<BackgroundTask>,
    health: Option<BackgroundTask>,
    keepalive: Option<BackgroundTask>,
    reconnect: Option<ScheduledTask>,
    pairing_timer: Option<ScheduledTask>,
    reconnecting: bool,
    terminal_failure: bool,
}

impl ConnectionManager {
    pub fn new(
        cfg: Arc<Config>,
        factory: Arc<dyn TransportFactory>,
        status: StatusHub,
        inbound: mpsc::Sender<InboundEnvelope>,
    ) -> Self {
        let c = &cfg.connection;
        let policy = BackoffPolicy::new(c.reconnect_base, c.reconnect_cap, c.max_reconnect_attempts);
        let throttle = SendThrottle::new(cfg.throttle);
        Self {
            inner: Arc::new(ManagerInner {
                cfg,
                policy,
                factory,
                status,
                inbound,
                throttle,
                session_token: std::sync::Mutex::new(CancellationToken::new()),
                state: Mutex::new(ManagerState {
                    session: Session::new(),
                    backend: None,
                    generation: 0,
                    pump: None,
                    health: None,
                    keepalive: None,
                    reconnect: None,
                    pairing_timer: None,
                    reconnecting: false,
                    terminal_failure: false,
                }),
            }),
        }
    }

    /// Start the transport. No-op while a cycle is underway or established.
    ///
    /// Fails with `Initialization` when the backend cannot even be built; a missing
    /// runtime dependency switches to degraded mode instead. Connect failures after
    /// that point are handled by the reconnection policy.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock().await;
            if st.terminal_failure {
                return Err(Error::ConnectionFailed {
                    attempts: self.inner.policy.max_attempts,
                });
            }
            if st.session.state.is_active() {
                debug!(state = %st.session.state, "initialize: already running");
                return Ok(());
            }
            if st.session.state == SessionState::LoggedOut {
                st.session.renew();
            }
            if let Some(t) = st.reconnect.take() {
                t.cancel();
            }
            st.reconnecting = false;
            st.session.pairing = None;
            st.session.state = SessionState::Initializing;
            info!(session_id = %st.session.id, "initializing transport");
        }
        self.refresh_session_token();
        self.publish_state(SessionState::Initializing);

        if let Err(e) = self.start_cycle().await {
            {
                let mut st = self.inner.state.lock().await;
                st.session.state = SessionState::Disconnected;
            }
            error!(error = %e, "transport initialization failed");
            self.publish_state(SessionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    /// Send a text message. `NotReady` unless the session is ready or degraded.
    pub async fn send(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt> {
        let backend = {
            let st = self.inner.state.lock().await;
            let state = st.session.state;
            if !state.accepts_sends() {
                return Err(Error::NotReady(state));
            }
            st.backend.clone().ok_or(Error::NotReady(state))?
        };

        self.inner.throttle.acquire(to.as_str()).await;

        let send_timeout = self.inner.cfg.connection.send_timeout;
        match timeout(send_timeout, backend.send(to, text)).await {
            Ok(Ok(receipt)) => {
                debug!(to = %to, message_id = %receipt.message_id, "message sent");
                Ok(receipt)
            }
            Ok(Err(e)) => {
                warn!(to = %to, error = %e, "send failed");
                Err(e)
            }
            Err(_) => {
                warn!(to = %to, "send timed out; probing transport health");
                let mgr = self.clone();
                tokio::spawn(async move { mgr.check_health().await });
                Err(Error::Delivery(format!(
                    "send timed out after {send_timeout:?}"
                )))
            }
        }
    }

    /// Log out: best-effort notify the transport, then tear down locally. Always
    /// succeeds locally and clears persisted credentials.
    pub async fn logout(&self) -> Result<()> {
        let backend = {
            let mut st = self.inner.state.lock().await;
            if let Some(t) = st.reconnect.take() {
                t.cancel();
            }
            st.reconnecting = false;
            st.backend.clone()
        };

        if let Some(backend) = backend {
            match timeout(self.inner.cfg.connection.logout_timeout, backend.logout()).await {
                Ok(Ok(())) => info!("transport acknowledged logout"),
                Ok(Err(e)) => warn!(error = %e, "transport logout failed; tearing down locally"),
                Err(_) => warn!("transport logout timed out; tearing down locally"),
            }
        }

        self.finish_logout().await;
        Ok(())
    }

    /// Full reset: cancel everything, clear credentials, new session id, start over.
    pub async fn reset(&self) -> Result<()> {
        info!("resetting session");
        {
            let mut st = self.inner.state.lock().await;
            if let Some(t) = st.reconnect.take() {
                t.cancel();
            }
            st.reconnecting = false;
            st.terminal_failure = false;
        }
        self.cancel_session_token();
        self.teardown_backend().await;
        self.clear_persisted_files();
        {
            let mut st = self.inner.state.lock().await;
            st.session.renew();
        }
        self.inner.throttle.clear().await;
        self.publish_state(SessionState::Disconnected);
        self.initialize().await
    }

    /// Process exit: drop the connection but keep credentials for the next run.
    pub async fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock().await;
            if let Some(t) = st.reconnect.take() {
                t.cancel();
            }
            st.reconnecting = false;
        }
        self.cancel_session_token();
        self.teardown_backend().await;
        {
            let mut st = self.inner.state.lock().await;
            st.session.state = SessionState::Disconnected;
            st.session.pairing = None;
        }
        self.publish_state(SessionState::Disconnected);
        info!("transport shut down");
    }

    pub async fn status(&self) -> SessionSnapshot {
        let st = self.inner.state.lock().await;
        SessionSnapshot {
            session_id: st.session.id.clone(),
            state: st.session.state,
            principal: st.session.principal.clone(),
            reconnect_attempts: st.session.reconnect_attempts,
            last_heartbeat: st.session.last_heartbeat,
            backend: st.session.backend,
            has_pairing_artifact: st.session.pairing.is_some(),
            terminal_failure: st.terminal_failure,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.state.lock().await.session.state
    }

    pub async fn pairing_artifact(&self) -> Option<PairingArtifact> {
        self.inner.state.lock().await.session.pairing.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    /// Token cancelled when the current session ends (logout or reset).
    pub fn session_token(&self) -> CancellationToken {
        self.inner
            .session_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ============== Connect cycle ==============

    async fn start_cycle(&self) -> Result<()> {
        let backend = match self.inner.factory.create().await {
            Ok(b) => b,
            Err(e) if e.is_missing_dependency() => {
                warn!(error = %e, "transport dependency missing; entering degraded mode");
                self.enter_degraded().await;
                return Ok(());
            }
            Err(Error::Initialization(msg)) => return Err(Error::Initialization(msg)),
            Err(e) => return Err(Error::Initialization(e.to_string())),
        };
        self.connect_backend(backend).await;
        Ok(())
    }

    async fn connect_backend(&self, backend: Arc<dyn TransportBackend>) {
        let credentials = match load_json::<Credentials>(&self.inner.cfg.credentials_file) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable credentials file");
                None
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let generation = {
            let mut st = self.inner.state.lock().await;
            st.generation += 1;
            if let Some(pump) = st.pump.take() {
                pump.stop();
            }
            st.pump = Some(self.spawn_pump(st.generation, rx));
            st.backend = Some(backend.clone());
            st.session.backend = Some(backend.kind());
            st.generation
        };

        debug!(
            generation,
            backend = ?backend.kind(),
            has_credentials = credentials.is_some(),
            "connecting transport"
        );

        let connect_timeout = self.inner.cfg.connection.connect_timeout;
        match timeout(connect_timeout, backend.connect(credentials, tx)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_missing_dependency() && backend.kind() == BackendKind::Real => {
                warn!(error = %e, "transport dependency missing; entering degraded mode");
                self.enter_degraded().await;
            }
            Ok(Err(e)) => {
                self.fail_cycle(Some(generation), format!("connect failed: {e}"))
                    .await
            }
            Err(_) => {
                self.fail_cycle(
                    Some(generation),
                    format!("connect timed out after {connect_timeout:?}"),
                )
                .await
            }
        }
    }

    fn spawn_pump(&self, generation: u64, mut rx: mpsc::Receiver<TransportEvent>) -> BackgroundTask {
        let mgr = self.clone();
        BackgroundTask::spawn(move |cancel| async move {
            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  ev = rx.recv() => match ev {
                    Some(ev) => mgr.handle_event(generation, ev).await,
                    None => break,
                  }
                }
            }
        })
    }

    async fn handle_event(&self, generation: u64, event: TransportEvent) {
        if self.inner.state.lock().await.generation != generation {
            debug!(generation, "dropping event from a stale connection");
            return;
        }

        match event {
            TransportEvent::PairingChallenge { code } => {
                self.on_pairing_challenge(generation, code).await
            }
            TransportEvent::Authenticated { credentials } => {
                self.on_authenticated(credentials).await
            }
            TransportEvent::Ready { principal } => self.on_ready(principal).await,
            TransportEvent::Disconnected { reason } => {
                self.on_disconnected(generation, reason).await
            }
            TransportEvent::AuthFailure { reason } => {
                self.on_auth_failure(generation, reason).await
            }
            TransportEvent::Message(envelope) => {
                if self.inner.inbound.send(envelope).await.is_err() {
                    debug!("inbound receiver closed; dropping message");
                }
            }
            TransportEvent::Delivered { message_id } => {
                self.inner
                    .status
                    .publish(StatusEvent::Delivered { message_id });
            }
        }
    }

    async fn on_pairing_challenge(&self, generation: u64, code: String) {
        let rendered = match render_pairing_code(&code) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "falling back to the raw pairing code");
                code.clone()
            }
        };

        let (artifact, state) = {
            let mut st = self.inner.state.lock().await;
            st.session.pairing_cycles += 1;
            let artifact = PairingArtifact {
                raw: code,
                rendered,
                issued_at: Utc::now(),
                cycle: st.session.pairing_cycles,
            };
            st.session.pairing = Some(artifact.clone());

            let simulated = st.session.backend == Some(BackendKind::Simulated);
            if !simulated {
                st.session.state = SessionState::QrPending;
                if st.pairing_timer.is_none() {
                    st.pairing_timer = Some(self.spawn_pairing_timeout(generation));
                }
            }
            (artifact, st.session.state)
        };

        info!(cycle = artifact.cycle, state = %state, "pairing challenge issued");
        self.publish_state(state);
        self.inner.status.publish(StatusEvent::Pairing {
            raw: artifact.raw,
            rendered: artifact.rendered,
            cycle: artifact.cycle,
        });
    }

    fn spawn_pairing_timeout(&self, generation: u64) -> ScheduledTask {
        let mgr = self.clone();
        let after = self.inner.cfg.connection.pairing_timeout;
        ScheduledTask::spawn(after, async move {
            let expired = {
                let mut st = mgr.inner.state.lock().await;
                st.pairing_timer = None;
                st.generation == generation && st.session.state == SessionState::QrPending
            };
            if expired {
                let err = Error::PairingTimeout(after);
                warn!(error = %err, "pairing not completed");
                mgr.fail_cycle(Some(generation), err.to_string()).await;
            }
        })
    }

    async fn on_authenticated(&self, credentials: Option<Credentials>) {
        if let Some(creds) = &credentials {
            if let Err(e) = save_json(&self.inner.cfg.credentials_file, creds) {
                warn!(error = %e, "failed to persist transport credentials");
            }
        }

        let state = {
            let mut st = self.inner.state.lock().await;
            if let Some(t) = st.pairing_timer.take() {
                t.cancel();
            }
            if st.session.backend != Some(BackendKind::Simulated) {
                st.session.pairing = None;
                st.session.state = SessionState::Authenticated;
            }
            st.session.state
        };
        info!(state = %state, "transport authenticated");
        self.publish_state(state);
    }

    async fn on_ready(&self, principal: Option<String>) {
        let (session_id, state, principal, degraded) = {
            let mut st = self.inner.state.lock().await;
            if let Some(t) = st.pairing_timer.take() {
                t.cancel();
            }
            let degraded = st.session.backend == Some(BackendKind::Simulated);
            if degraded {
                st.session.state = SessionState::Degraded;
                st.session.principal = None;
            } else {
                st.session.state = SessionState::Ready;
                st.session.principal = principal;
                st.session.pairing = None;

                if let Some(t) = st.health.take() {
                    t.stop();
                }
                if let Some(t) = st.keepalive.take() {
                    t.stop();
                }
                st.health = Some(self.spawn_health_monitor());
                st.keepalive = Some(self.spawn_keepalive());
            }
            st.session.reconnect_attempts = 0;
            st.reconnecting = false;
            st.session.last_heartbeat = Some(Utc::now());
            (
                st.session.id.clone(),
                st.session.state,
                st.session.principal.clone(),
                degraded,
            )
        };

        let record = SessionRecord {
            session_id: session_id.clone(),
            principal: principal.clone(),
            backend: if degraded {
                BackendKind::Simulated
            } else {
                BackendKind::Real
            },
            connected_at: Utc::now(),
        };
        if let Err(e) = save_json(&self.inner.cfg.session_file, &record) {
            warn!(error = %e, "failed to persist session record");
        }

        info!(
            session_id = %session_id,
            principal = principal.as_deref().unwrap_or("-"),
            degraded,
            "transport ready"
        );
        self.publish_state(state);
        self.inner.status.publish(StatusEvent::Connected {
            connected: true,
            principal,
            degraded,
        });
    }

    async fn on_disconnected(&self, generation: u64, reason: DisconnectReason) {
        if reason.is_logout() {
            info!("session logged out from the device");
            self.finish_logout().await;
            return;
        }
        self.fail_cycle(Some(generation), reason.to_string()).await;
    }

    async fn on_auth_failure(&self, generation: u64, reason: String) {
        warn!(reason = %reason, "stored credentials rejected; re-pairing");
        if let Err(e) = remove_if_exists(&self.inner.cfg.credentials_file) {
            warn!(error = %e, "failed to clear credentials");
        }
        {
            let mut st = self.inner.state.lock().await;
            if st.generation != generation {
                return;
            }
            st.session.renew();
        }
        self.fail_cycle(Some(generation), format!("auth failure: {reason}"))
            .await;
    }

    // ============== Failure handling ==============

    /// The current connect cycle is dead: tear it down and apply the reconnection
    /// policy. Ignored when `expected` names a generation that is no longer current.
    fn fail_cycle(&self, expected: Option<u64>, reason: String) -> BoxFuture<()> {
        let mgr = self.clone();
        Box::pin(async move {
            {
                let mut st = mgr.inner.state.lock().await;
                if expected.is_some_and(|g| g != st.generation) {
                    debug!(reason = %reason, "ignoring failure from a stale connection");
                    return;
                }
                if st.session.state == SessionState::LoggedOut || st.terminal_failure {
                    return;
                }
                st.session.state = SessionState::Disconnected;
            }

            warn!(reason = %reason, "transport connection lost");
            mgr.publish_state(SessionState::Disconnected);
            mgr.inner
                .status
                .publish(StatusEvent::Disconnected { reason });

            mgr.teardown_backend().await;
            mgr.schedule_reconnect().await;
        })
    }

    async fn schedule_reconnect(&self) {
        let scheduled = {
            let mut st = self.inner.state.lock().await;
            if st.reconnect.is_some() {
                debug!("reconnect already scheduled");
                return;
            }
            if st.session.state == SessionState::LoggedOut || st.terminal_failure {
                return;
            }

            // The failed connect that brought us here counts toward the budget.
            let attempt = st.session.reconnect_attempts + 1;
            if let Some(delay) = self.inner.policy.next_delay(attempt) {
                st.session.reconnect_attempts = attempt;
                st.reconnecting = true;
                let mgr = self.clone();
                st.reconnect = Some(ScheduledTask::spawn(delay, async move {
                    mgr.reconnect_now(attempt).await;
                }));
                Some((attempt, delay))
            } else {
                None
            }
        };

        match scheduled {
            Some((attempt, delay)) => info!(
                attempt,
                max_attempts = self.inner.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            ),
            None => self.on_reconnect_exhausted().await,
        }
    }

    async fn reconnect_now(&self, attempt: u32) {
        {
            let mut st = self.inner.state.lock().await;
            st.reconnect = None;
            if st.session.state == SessionState::LoggedOut || st.terminal_failure {
                return;
            }
            st.session.pairing = None;
            st.session.state = SessionState::Initializing;
        }
        info!(attempt, "reconnecting transport");
        self.publish_state(SessionState::Initializing);

        if let Err(e) = self.start_cycle().await {
            self.fail_cycle(None, e.to_string()).await;
        }
    }

    async fn on_reconnect_exhausted(&self) {
        let attempts = self.inner.policy.max_attempts;

        if self.inner.cfg.connection.strict_no_fallback {
            {
                let mut st = self.inner.state.lock().await;
                st.reconnecting = false;
                st.terminal_failure = true;
                st.session.state = SessionState::Disconnected;
            }
            error!(attempts, "reconnect attempts exhausted; giving up");
            self.inner
                .status
                .publish(StatusEvent::ConnectionFailed { attempts });
            return;
        }

        warn!(attempts, "reconnect attempts exhausted; falling back to degraded mode");
        {
            let mut st = self.inner.state.lock().await;
            st.reconnecting = false;
            st.session.renew();
        }
        self.enter_degraded().await;
    }

    fn enter_degraded(&self) -> BoxFuture<()> {
        let mgr = self.clone();
        Box::pin(async move {
            mgr.teardown_backend().await;
            let backend: Arc<dyn TransportBackend> = Arc::new(SimulatedTransport::new(
                mgr.inner.cfg.connection.degraded_ready_delay,
            ));
            {
                let mut st = mgr.inner.state.lock().await;
                st.session.state = SessionState::Degraded;
                st.session.principal = None;
                st.session.backend = Some(BackendKind::Simulated);
            }
            mgr.publish_state(SessionState::Degraded);
            mgr.connect_backend(backend).await;
        })
    }

    async fn teardown_backend(&self) {
        let (backend, tasks) = {
            let mut st = self.inner.state.lock().await;
            st.generation += 1;
            if let Some(t) = st.pairing_timer.take() {
                t.cancel();
            }
            let tasks = [st.pump.take(), st.health.take(), st.keepalive.take()];
            (st.backend.take(), tasks)
        };

        for task in tasks.into_iter().flatten() {
            task.stop();
        }
        if let Some(backend) = backend {
            let limit = self.inner.cfg.connection.logout_timeout;
            if timeout(limit, backend.shutdown()).await.is_err() {
                warn!("transport shutdown timed out");
            }
        }
    }

    async fn finish_logout(&self) {
        self.teardown_backend().await;
        self.clear_persisted_files();
        {
            let mut st = self.inner.state.lock().await;
            if let Some(t) = st.reconnect.take() {
                t.cancel();
            }
            st.reconnecting = false;
            st.session.state = SessionState::LoggedOut;
            st.session.principal = None;
            st.session.pairing = None;
            st.session.reconnect_attempts = 0;
            info!(session_id = %st.session.id, "session logged out");
        }
        self.cancel_session_token();
        self.publish_state(SessionState::LoggedOut);
        self.inner.status.publish(StatusEvent::LoggedOut);
    }

    // ============== Health ==============

    fn spawn_health_monitor(&self) -> BackgroundTask {
        let mgr = self.clone();
        let every = self.inner.cfg.connection.health_check_interval;
        BackgroundTask::spawn(move |cancel| async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  _ = tick.tick() => mgr.check_health().await,
                }
            }
        })
    }

    fn spawn_keepalive(&self) -> BackgroundTask {
        let mgr = self.clone();
        let every = self.inner.cfg.connection.keepalive_interval;
        BackgroundTask::spawn(move |cancel| async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                  _ = cancel.cancelled() => break,
                  _ = tick.tick() => mgr.ping_once().await,
                }
            }
        })
    }

    async fn check_health(&self) {
        let (backend, generation) = {
            let st = self.inner.state.lock().await;
            if st.session.state != SessionState::Ready || st.reconnecting {
                return;
            }
            let Some(backend) = st.backend.clone() else {
                return;
            };
            (backend, st.generation)
        };

        let limit = self.inner.cfg.connection.health_timeout;
        let verdict = match timeout(limit, backend.is_alive()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("transport reports not alive".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no answer within {limit:?}")),
        };

        match verdict {
            Ok(()) => {
                let mut st = self.inner.state.lock().await;
                st.session.last_heartbeat = Some(Utc::now());
                debug!("health check ok");
            }
            Err(reason) => {
                warn!(reason = %reason, "health check failed");
                self.fail_cycle(Some(generation), format!("health check failed: {reason}"))
                    .await;
            }
        }
    }

    async fn ping_once(&self) {
        let backend = {
            let st = self.inner.state.lock().await;
            if st.session.state != SessionState::Ready {
                return;
            }
            st.backend.clone()
        };
        let Some(backend) = backend else {
            return;
        };

        match timeout(self.inner.cfg.connection.health_timeout, backend.ping()).await {
            Ok(Ok(())) => debug!("keep-alive ping ok"),
            Ok(Err(e)) => warn!(error = %e, "keep-alive ping failed"),
            Err(_) => warn!("keep-alive ping timed out"),
        }
    }

    // ============== Helpers ==============

    fn publish_state(&self, state: SessionState) {
        self.inner.status.publish(StatusEvent::State {
            state: state.to_string(),
        });
    }

    fn cancel_session_token(&self) {
        self.session_token().cancel();
    }

    fn refresh_session_token(&self) {
        let mut tok = self
            .inner
            .session_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if tok.is_cancelled() {
            *tok = CancellationToken::new();
        }
    }

    fn clear_persisted_files(&self) {
        for path in [&self.inner.cfg.credentials_file, &self.inner.cfg.session_file] {
            if let Err(e) = remove_if_exists(path) {
                warn!(path = %path.display(), error = %e, "failed to remove session file");
            }
        }
    }
}

#[async_trait]
impl MessageSender for ConnectionManager {
    async fn send_text(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt> {
        self.send(to, text).await
    }

    fn session_token(&self) -> CancellationToken {
        ConnectionManager::session_token(self)
    }
}

// ============== Persistence ==============

/// Last session record written by a ready transport, if any.
pub fn load_session_record(path: &Path) -> Result<Option<SessionRecord>> {
    load_json(path)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&txt)?))
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let txt = serde_json::to_string(value)?;
    std::fs::write(path, txt)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testutil::{ConnectScript, FactoryMode, FakeFactory},
        transport::simulated::SIMULATED_CHALLENGE_PREFIX,
    };
    use std::{sync::atomic::Ordering, time::Duration};

    struct Harness {
        mgr: ConnectionManager,
        factory: Arc<FakeFactory>,
        cfg: Arc<Config>,
        inbound: mpsc::Receiver<InboundEnvelope>,
        _dir: tempfile::TempDir,
    }

    fn harness(tweak: impl FnOnce(&mut Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            session_file: dir.path().join("session.json"),
            credentials_file: dir.path().join("credentials.json"),
            ..Config::default()
        };
        cfg.throttle.global_min_interval = Duration::ZERO;
        cfg.throttle.per_chat_min_interval = Duration::ZERO;
        tweak(&mut cfg);

        let cfg = Arc::new(cfg);
        let factory = Arc::new(FakeFactory::new());
        let (tx, rx) = mpsc::channel(16);
        let mgr = ConnectionManager::new(cfg.clone(), factory.clone(), StatusHub::new(), tx);
        Harness {
            mgr,
            factory,
            cfg,
            inbound: rx,
            _dir: dir,
        }
    }

    /// Let spawned tasks run without moving the (paused) clock much.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_then_ready() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        backend.emit_on_connect(vec![TransportEvent::PairingChallenge {
            code: "2@pairing-payload".into(),
        }]);
        let mut events = h.mgr.subscribe();

        h.mgr.initialize().await.unwrap();
        settle().await;

        assert_eq!(h.mgr.state().await, SessionState::QrPending);
        let artifact = h.mgr.pairing_artifact().await.unwrap();
        assert_eq!(artifact.raw, "2@pairing-payload");
        assert!(!artifact.rendered.is_empty());
        assert!(matches!(
            h.mgr.send(&ChatAddress::for_phone("6281"), "x").await,
            Err(Error::NotReady(SessionState::QrPending))
        ));

        backend
            .emit(TransportEvent::Authenticated {
                credentials: Some(Credentials {
                    token: "tok-1".into(),
                }),
            })
            .await;
        backend
            .emit(TransportEvent::Ready {
                principal: Some("6281234567890".into()),
            })
            .await;
        settle().await;

        let snap = h.mgr.status().await;
        assert_eq!(snap.state, SessionState::Ready);
        assert_eq!(snap.principal.as_deref(), Some("6281234567890"));
        assert!(!snap.has_pairing_artifact);
        assert_eq!(snap.backend, Some(BackendKind::Real));

        let creds: Credentials = load_json(&h.cfg.credentials_file).unwrap().unwrap();
        assert_eq!(creds.token, "tok-1");
        let record = load_session_record(&h.cfg.session_file).unwrap().unwrap();
        assert_eq!(record.session_id, snap.session_id);

        let seen = drain(&mut events).await;
        assert!(seen.iter().any(|e| matches!(e, StatusEvent::Pairing { .. })));
        assert!(seen.contains(&StatusEvent::Connected {
            connected: true,
            principal: Some("6281234567890".into()),
            degraded: false,
        }));

        let receipt = h
            .mgr
            .send(&ChatAddress::for_phone("6281"), "halo")
            .await
            .unwrap();
        assert!(receipt.message_id.0.starts_with("fake-"));
        assert_eq!(backend.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_is_idempotent() {
        let h = harness(|_| {});
        h.mgr.initialize().await.unwrap();
        h.mgr.initialize().await.unwrap();
        assert_eq!(h.factory.creates.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.backend.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_setup_is_an_initialization_error() {
        let h = harness(|_| {});
        h.factory.set_mode(FactoryMode::Broken);
        assert!(matches!(
            h.mgr.initialize().await,
            Err(Error::Initialization(_))
        ));
        assert_eq!(h.mgr.state().await, SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_dependency_switches_to_degraded_mode() {
        let h = harness(|c| c.connection.degraded_ready_delay = Duration::from_secs(3));
        h.factory.set_mode(FactoryMode::Missing);
        let mut events = h.mgr.subscribe();

        h.mgr.initialize().await.unwrap();
        settle().await;
        assert_eq!(h.mgr.state().await, SessionState::Degraded);
        let artifact = h.mgr.pairing_artifact().await.unwrap();
        assert!(artifact.raw.starts_with(SIMULATED_CHALLENGE_PREFIX));

        tokio::time::sleep(Duration::from_secs(4)).await;
        let snap = h.mgr.status().await;
        assert_eq!(snap.state, SessionState::Degraded);
        assert_eq!(snap.principal, None);
        assert_eq!(snap.backend, Some(BackendKind::Simulated));
        assert!(drain(&mut events).await.contains(&StatusEvent::Connected {
            connected: true,
            principal: None,
            degraded: true,
        }));

        let receipt = h
            .mgr
            .send(&ChatAddress::for_phone("6281"), "halo")
            .await
            .unwrap();
        assert!(receipt.message_id.0.starts_with("sim-"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_fall_back_to_degraded() {
        let h = harness(|_| {});
        h.factory
            .backend
            .set_connect(ConnectScript::Fail("bridge refused".into()));

        h.mgr.initialize().await.unwrap();
        // 5 + 10 + 20 + 40 seconds of backoff between the five connects, plus slack.
        tokio::time::sleep(Duration::from_secs(80)).await;

        assert_eq!(h.factory.backend.connect_count(), 5);
        assert_eq!(h.mgr.state().await, SessionState::Degraded);
        assert!(!h.mgr.status().await.terminal_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn fifth_consecutive_connect_error_gives_up() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        backend.set_connect(ConnectScript::Fail("bridge refused".into()));

        h.mgr.initialize().await.unwrap();
        // Failures land at 0, 5, 15, 35 and 75 seconds.
        tokio::time::sleep(Duration::from_secs(74)).await;
        assert_eq!(backend.connect_count(), 4);
        assert_eq!(h.mgr.state().await, SessionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.connect_count(), 5);
        assert_eq!(h.mgr.state().await, SessionState::Degraded);

        // A bridge that recovers later is not retried.
        backend.set_connect(ConnectScript::Accept);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(backend.connect_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_mode_surfaces_connection_failed() {
        let h = harness(|c| c.connection.strict_no_fallback = true);
        h.factory
            .backend
            .set_connect(ConnectScript::Fail("bridge refused".into()));
        let mut events = h.mgr.subscribe();

        h.mgr.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_secs(80)).await;

        assert_eq!(h.factory.backend.connect_count(), 5);
        let snap = h.mgr.status().await;
        assert_eq!(snap.state, SessionState::Disconnected);
        assert!(snap.terminal_failure);
        assert!(drain(&mut events)
            .await
            .contains(&StatusEvent::ConnectionFailed { attempts: 5 }));
        assert!(matches!(
            h.mgr.initialize().await,
            Err(Error::ConnectionFailed { attempts: 5 })
        ));

        // Nothing else is attempted afterwards.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.factory.backend.connect_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_for_the_backoff_delay() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Ready {
                principal: Some("6281".into()),
            })
            .await;
        settle().await;
        assert_eq!(h.mgr.state().await, SessionState::Ready);

        backend
            .emit(TransportEvent::Disconnected {
                reason: DisconnectReason::Network("socket closed".into()),
            })
            .await;
        settle().await;
        assert_eq!(h.mgr.state().await, SessionState::Disconnected);
        assert_eq!(h.mgr.status().await.reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(backend.connect_count(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reuses_persisted_credentials() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Authenticated {
                credentials: Some(Credentials {
                    token: "tok-9".into(),
                }),
            })
            .await;
        backend
            .emit(TransportEvent::Disconnected {
                reason: DisconnectReason::Conflict,
            })
            .await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let seen = backend.credentials_seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_ref().map(|c| c.token.as_str()), Some("tok-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_logout_does_not_reconnect() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        let token = h.mgr.session_token();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Disconnected {
                reason: DisconnectReason::Logout,
            })
            .await;
        settle().await;

        assert_eq!(h.mgr.state().await, SessionState::LoggedOut);
        assert!(token.is_cancelled());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_credentials_and_cancels_reconnect() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        save_json(
            &h.cfg.credentials_file,
            &Credentials {
                token: "old".into(),
            },
        )
        .unwrap();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Disconnected {
                reason: DisconnectReason::Network("reset".into()),
            })
            .await;
        settle().await;

        h.mgr.logout().await.unwrap();
        assert_eq!(h.mgr.state().await, SessionState::LoggedOut);
        assert!(!h.cfg.credentials_file.exists());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.connect_count(), 1);

        // A new initialize starts a new session.
        let before = h.mgr.status().await.session_id;
        h.mgr.initialize().await.unwrap();
        assert_ne!(h.mgr.status().await.session_id, before);
        assert!(!h.mgr.session_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_from_ready_notifies_the_transport() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Ready { principal: None })
            .await;
        settle().await;

        let mut events = h.mgr.subscribe();
        h.mgr.logout().await.unwrap();
        assert_eq!(backend.logouts.load(Ordering::SeqCst), 1);
        assert!(drain(&mut events).await.contains(&StatusEvent::LoggedOut));
        assert!(matches!(
            h.mgr.send(&ChatAddress::for_phone("6281"), "x").await,
            Err(Error::NotReady(SessionState::LoggedOut))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_health_check_triggers_reconnect() {
        let h = harness(|c| c.connection.health_check_interval = Duration::from_secs(30));
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Ready { principal: None })
            .await;
        settle().await;

        backend.set_alive(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.mgr.state().await, SessionState::Disconnected);

        backend.set_alive(true);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_while_ready() {
        let h = harness(|c| {
            c.connection.keepalive_interval = Duration::from_secs(15);
            c.connection.health_check_interval = Duration::from_secs(300);
        });
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Ready { principal: None })
            .await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(46)).await;
        assert_eq!(backend.pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_replaces_the_session() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        save_json(
            &h.cfg.credentials_file,
            &Credentials {
                token: "stale".into(),
            },
        )
        .unwrap();
        h.mgr.initialize().await.unwrap();
        let before = h.mgr.status().await.session_id;

        backend
            .emit(TransportEvent::AuthFailure {
                reason: "bad mac".into(),
            })
            .await;
        settle().await;

        assert!(!h.cfg.credentials_file.exists());
        assert_ne!(h.mgr.status().await.session_id, before);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let seen = backend.credentials_seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], None);
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_timeout_folds_into_reconnect() {
        let h = harness(|c| c.connection.pairing_timeout = Duration::from_secs(60));
        let backend = h.factory.backend.clone();
        backend.emit_on_connect(vec![TransportEvent::PairingChallenge {
            code: "qr-1".into(),
        }]);
        h.mgr.initialize().await.unwrap();
        settle().await;
        assert_eq!(h.mgr.state().await, SessionState::QrPending);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.mgr.status().await.reconnect_attempts, 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.connect_count(), 2);
        // The fresh cycle issued a fresh artifact.
        assert_eq!(h.mgr.pairing_artifact().await.map(|a| a.cycle), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_acks_and_messages_are_forwarded() {
        let mut h = harness(|_| {});
        let backend = h.factory.backend.clone();
        let mut events = h.mgr.subscribe();
        h.mgr.initialize().await.unwrap();

        let envelope = crate::testutil::text_envelope("m-1", "6281234567890", "saldo");
        backend.emit(TransportEvent::Message(envelope.clone())).await;
        backend
            .emit(TransportEvent::Delivered {
                message_id: crate::domain::MessageId("fake-1".into()),
            })
            .await;
        settle().await;

        assert_eq!(h.inbound.recv().await, Some(envelope));
        assert!(drain(&mut events).await.contains(&StatusEvent::Delivered {
            message_id: crate::domain::MessageId("fake-1".into())
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_starts_a_new_session() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        let before = h.mgr.status().await.session_id;
        let token = h.mgr.session_token();

        h.mgr.reset().await.unwrap();
        assert!(token.is_cancelled());
        assert!(!h.mgr.session_token().is_cancelled());
        assert_ne!(h.mgr.status().await.session_id, before);
        assert_eq!(backend.connect_count(), 2);
        assert!(backend.shutdowns.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_keeps_credentials() {
        let h = harness(|_| {});
        let backend = h.factory.backend.clone();
        h.mgr.initialize().await.unwrap();
        backend
            .emit(TransportEvent::Authenticated {
                credentials: Some(Credentials {
                    token: "keep-me".into(),
                }),
            })
            .await;
        settle().await;

        h.mgr.shutdown().await;
        assert_eq!(h.mgr.state().await, SessionState::Disconnected);
        assert!(h.cfg.credentials_file.exists());
        assert_eq!(backend.logouts.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.connect_count(), 1);
    }

    #[test]
    fn pairing_codes_render_as_unicode_blocks() {
        let out = render_pairing_code("2@abc,def,ghi").unwrap();
        assert!(out.lines().count() > 10);
        assert!(out.contains('█') || out.contains('▀') || out.contains('▄'));
    }
}
