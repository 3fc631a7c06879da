use std::time::Duration;

use crate::session::SessionState;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the session engine
/// can tell recoverable transport failures apart from user-facing ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport initialization failed: {0}")]
    Initialization(String),

    /// The transport cannot run at all in this environment (bridge not configured,
    /// binary missing, ...). The session manager falls back to degraded mode on this.
    #[error("transport runtime dependency missing: {0}")]
    DependencyMissing(String),

    #[error("transport not ready (state: {0})")]
    NotReady(SessionState),

    #[error("pairing timed out after {0:?}")]
    PairingTimeout(Duration),

    #[error("connection failed after {attempts} reconnect attempts")]
    ConnectionFailed { attempts: u32 },

    #[error("member not found")]
    MemberNotFound,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

/// Failure signatures that mean "the transport can never start here", as opposed to
/// "the transport failed this time".
const MISSING_DEPENDENCY_SIGNATURES: &[&str] = &[
    "dependency missing",
    "not installed",
    "not configured",
    "executable not found",
    "no such file or directory",
    "failed to launch",
];

impl Error {
    /// Whether this error means the real transport is structurally unavailable.
    pub fn is_missing_dependency(&self) -> bool {
        match self {
            Error::DependencyMissing(_) => true,
            Error::Initialization(msg) => {
                let lower = msg.to_lowercase();
                MISSING_DEPENDENCY_SIGNATURES
                    .iter()
                    .any(|sig| lower.contains(sig))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
