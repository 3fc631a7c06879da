//! HTTP + websocket bridge transport.
//!
//! The messaging account runs inside an external gateway process. Commands go over
//! its REST API; lifecycle events, inbound messages and acks stream back over a
//! websocket and are decoded by [`frames`].

pub mod frames;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use kop_core::{
    config::GatewayConfig,
    domain::{ChatAddress, Credentials, DeliveryReceipt, MessageId},
    transport::{
        BackendKind, DisconnectReason, TransportBackend, TransportEvent, TransportFactory,
    },
    Error, Result,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Builds [`GatewayTransport`]s. Without a configured URL the real transport cannot
/// run, which the session manager answers with degraded mode.
pub struct GatewayFactory {
    cfg: GatewayConfig,
}

impl GatewayFactory {
    pub fn new(cfg: GatewayConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl TransportFactory for GatewayFactory {
    async fn create(&self) -> Result<Arc<dyn TransportBackend>> {
        let Some(base_url) = self.cfg.base_url.clone() else {
            return Err(Error::DependencyMissing(
                "gateway not configured (KOP_GATEWAY_URL)".to_string(),
            ));
        };
        let transport = GatewayTransport::new(&base_url, self.cfg.clone())?;
        Ok(Arc::new(transport))
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    #[serde(default)]
    status: String,
}

pub struct GatewayTransport {
    http: reqwest::Client,
    base_url: String,
    cfg: GatewayConfig,
    reader: Mutex<Option<CancellationToken>>,
}

impl GatewayTransport {
    pub fn new(base_url: &str, cfg: GatewayConfig) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Initialization(format!(
                "gateway url must be http(s): {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| Error::Initialization(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            cfg,
            reader: Mutex::new(None),
        })
    }

    fn session_url(&self, suffix: &str) -> String {
        format!(
            "{}/sessions/{}{suffix}",
            self.base_url, self.cfg.session_name
        )
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.cfg.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }

    async fn post(&self, url: &str, body: serde_json::Value, what: &str) -> Result<Response> {
        let resp = self
            .authed(self.http.post(url).json(&body))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{what} request error: {e}")))?;
        check(resp, what).await
    }

    async fn stop_reader(&self) {
        if let Some(tok) = self.reader.lock().await.take() {
            tok.cancel();
        }
    }

    async fn open_event_stream(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        let url = events_url(&self.base_url, &self.cfg.session_name);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Transport(format!("event stream url: {e}")))?;
        if let Some(key) = &self.cfg.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| Error::Initialization(format!("api key header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("event stream connect: {e}")))?;
        debug!(url = %url, "event stream open");

        let cancel = CancellationToken::new();
        if let Some(prev) = self.reader.lock().await.replace(cancel.clone()) {
            prev.cancel();
        }

        let mut stream = ws;
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                  _ = cancel.cancelled() => return,
                  msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match frames::parse_frame(&text) {
                        Ok(Some(ev)) => {
                            if events.send(ev).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "undecodable gateway frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "event stream closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("event stream error: {e}"),
                    None => break "event stream ended".to_string(),
                  }
                }
            };
            info!(reason = %reason, "gateway event stream closed");
            let _ = events
                .send(TransportEvent::Disconnected {
                    reason: DisconnectReason::Network(reason),
                })
                .await;
        });
        Ok(())
    }
}

#[async_trait]
impl TransportBackend for GatewayTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn connect(
        &self,
        credentials: Option<Credentials>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        // Subscribe first so the pairing challenge emitted on start is not missed.
        self.open_event_stream(events).await?;
        let body = json!({ "credentials": credentials.map(|c| c.token) });
        if let Err(e) = self.post(&self.session_url("/start"), body, "session start").await {
            self.stop_reader().await;
            return Err(e);
        }
        info!(session = %self.cfg.session_name, "gateway session started");
        Ok(())
    }

    async fn send(&self, to: &ChatAddress, text: &str) -> Result<DeliveryReceipt> {
        let url = self.session_url("/messages");
        let body = json!({ "to": to.as_str(), "text": text });

        let mut retried = false;
        let resp = loop {
            let resp = self
                .authed(self.http.post(&url).json(&body))
                .send()
                .await
                .map_err(|e| Error::Delivery(format!("send request error: {e}")))?;
            if resp.status() == StatusCode::TOO_MANY_REQUESTS && !retried {
                let wait = retry_after(resp.headers().get(reqwest::header::RETRY_AFTER));
                warn!(to = %to, wait_ms = wait.as_millis() as u64, "gateway rate limited; retrying once");
                tokio::time::sleep(wait).await;
                retried = true;
                continue;
            }
            break resp;
        };

        let resp = check(resp, "send").await.map_err(|e| match e {
            Error::Transport(msg) => Error::Delivery(msg),
            other => other,
        })?;
        let sent: SendResponse = resp
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("send response: {e}")))?;
        Ok(DeliveryReceipt {
            message_id: MessageId(sent.id),
            timestamp: Utc::now(),
        })
    }

    async fn is_alive(&self) -> Result<bool> {
        let resp = self
            .authed(self.http.get(self.session_url("/status")))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("session status request error: {e}")))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let info: SessionInfo = check(resp, "session status")
            .await?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("session status response: {e}")))?;
        Ok(info.status.eq_ignore_ascii_case("working"))
    }

    async fn ping(&self) -> Result<()> {
        self.post(
            &self.session_url("/presence"),
            json!({ "presence": "available" }),
            "presence",
        )
        .await?;
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.post(&self.session_url("/logout"), json!({}), "logout")
            .await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.stop_reader().await;
    }
}

/// Map a non-success response to a transport error carrying a body excerpt.
async fn check(resp: Response, what: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Transport(format!(
        "{what} failed: {status} {}",
        body.chars().take(200).collect::<String>()
    )))
}

/// `http(s)://host` → `ws(s)://host/sessions/<name>/events`.
pub fn events_url(base_url: &str, session: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/sessions/{session}/events")
}

/// Seconds form of `Retry-After`, clamped.
fn retry_after(value: Option<&reqwest::header::HeaderValue>) -> Duration {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
        .min(MAX_RETRY_AFTER)
}
