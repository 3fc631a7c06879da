use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, throttle::ThrottleConfig, Result};

/// Typed configuration for the assistant.
///
/// Every section has `Default` values matching the reference deployment; environment
/// variables override them one by one.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub database_path: PathBuf,
    pub session_file: PathBuf,
    pub credentials_file: PathBuf,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    pub gateway: GatewayConfig,
    pub connection: ConnectionConfig,
    pub throttle: ThrottleConfig,
    pub pipeline: PipelineConfig,
    pub broadcast: BroadcastConfig,
    pub coop: CoopProfile,
}

/// Where the messaging bridge daemon lives. Without a base URL the real transport
/// cannot start and the session manager runs in degraded mode.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub session_name: String,
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            session_name: "kop".to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
    /// Surface `ConnectionFailed` instead of falling back to degraded mode.
    pub strict_no_fallback: bool,

    pub health_check_interval: Duration,
    pub keepalive_interval: Duration,

    pub connect_timeout: Duration,
    pub pairing_timeout: Duration,
    pub health_timeout: Duration,
    pub send_timeout: Duration,
    pub logout_timeout: Duration,

    /// How long the simulated transport waits before reporting ready.
    pub degraded_ready_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            strict_no_fallback: false,
            health_check_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(60),
            pairing_timeout: Duration::from_secs(120),
            health_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            logout_timeout: Duration::from_secs(10),
            degraded_ready_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Minimum spacing between two replies (anti-flood / anti-loop).
    pub min_reply_interval: Duration,
    /// Delay before a deferred event is re-queued.
    pub defer_delay: Duration,
    pub processed_cache_max: usize,
    pub processed_cache_clear_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_reply_interval: Duration::from_secs(2),
            defer_delay: Duration::from_millis(1500),
            processed_cache_max: 1000,
            processed_cache_clear_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub message_delay: Duration,
    pub batch_pause: Duration,
    pub max_retries: u32,
    /// Linear: attempt `n` waits `retry_backoff * n`.
    pub retry_backoff: Duration,
    pub max_body_len: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            message_delay: Duration::from_secs(2),
            batch_pause: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_secs(3),
            max_body_len: 4096,
        }
    }
}

/// Cooperative contact details shown by the `info` and `kontak` commands.
#[derive(Clone, Debug)]
pub struct CoopProfile {
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub office_hours: String,
    pub website: Option<String>,
}

impl Default for CoopProfile {
    fn default() -> Self {
        Self {
            name: "Koperasi Simpan Pinjam".to_string(),
            address: "-".to_string(),
            phone: "-".to_string(),
            email: "-".to_string(),
            office_hours: "Senin - Jumat, 08.00 - 16.00".to_string(),
            website: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("kop.db"),
            session_file: PathBuf::from("/tmp/kop-session.json"),
            credentials_file: PathBuf::from("/tmp/kop-credentials.json"),
            audit_log_path: PathBuf::from("/tmp/kop-audit.log"),
            audit_log_json: false,
            gateway: GatewayConfig::default(),
            connection: ConnectionConfig::default(),
            throttle: ThrottleConfig::default(),
            pipeline: PipelineConfig::default(),
            broadcast: BroadcastConfig::default(),
            coop: CoopProfile::default(),
        }
    }
}

impl Config {
    /// Load from the process environment (after an optional `.env`).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (environment, map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Lookup(&lookup);
        let defaults = Config::default();

        // Storage
        let database_path = env.path("KOP_DATABASE_PATH").unwrap_or(defaults.database_path);
        let session_file = env.path("KOP_SESSION_FILE").unwrap_or(defaults.session_file);
        let credentials_file = env
            .path("KOP_CREDENTIALS_FILE")
            .unwrap_or(defaults.credentials_file);

        // Audit logging
        let audit_log_path = env.path("AUDIT_LOG_PATH").unwrap_or(defaults.audit_log_path);
        let audit_log_json = env.bool("AUDIT_LOG_JSON").unwrap_or(defaults.audit_log_json);

        // Gateway bridge
        let gw = defaults.gateway;
        let gateway = GatewayConfig {
            base_url: env
                .str("KOP_GATEWAY_URL")
                .map(|s| s.trim_end_matches('/').to_string()),
            api_key: env.str("KOP_GATEWAY_API_KEY"),
            session_name: env.str("KOP_GATEWAY_SESSION").unwrap_or(gw.session_name),
            request_timeout: env
                .millis("KOP_GATEWAY_TIMEOUT_MS")
                .unwrap_or(gw.request_timeout),
        };

        // Connection lifecycle
        let c = defaults.connection;
        let connection = ConnectionConfig {
            reconnect_base: env.millis("RECONNECT_BASE_MS").unwrap_or(c.reconnect_base),
            reconnect_cap: env.millis("RECONNECT_CAP_MS").unwrap_or(c.reconnect_cap),
            max_reconnect_attempts: env
                .u32("MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(c.max_reconnect_attempts),
            strict_no_fallback: env
                .bool("STRICT_NO_FALLBACK")
                .unwrap_or(c.strict_no_fallback),
            health_check_interval: env
                .millis("HEALTH_CHECK_INTERVAL_MS")
                .unwrap_or(c.health_check_interval),
            keepalive_interval: env
                .millis("KEEPALIVE_INTERVAL_MS")
                .unwrap_or(c.keepalive_interval),
            connect_timeout: env.millis("CONNECT_TIMEOUT_MS").unwrap_or(c.connect_timeout),
            pairing_timeout: env.millis("PAIRING_TIMEOUT_MS").unwrap_or(c.pairing_timeout),
            health_timeout: env.millis("HEALTH_TIMEOUT_MS").unwrap_or(c.health_timeout),
            send_timeout: env.millis("SEND_TIMEOUT_MS").unwrap_or(c.send_timeout),
            logout_timeout: env.millis("LOGOUT_TIMEOUT_MS").unwrap_or(c.logout_timeout),
            degraded_ready_delay: env
                .millis("DEGRADED_READY_DELAY_MS")
                .unwrap_or(c.degraded_ready_delay),
        };

        // Outbound throttling
        let t = defaults.throttle;
        let throttle = ThrottleConfig {
            global_min_interval: env
                .millis("SEND_GLOBAL_MIN_INTERVAL_MS")
                .unwrap_or(t.global_min_interval),
            per_chat_min_interval: env
                .millis("SEND_PER_CHAT_MIN_INTERVAL_MS")
                .unwrap_or(t.per_chat_min_interval),
        };

        // Inbound pipeline
        let p = defaults.pipeline;
        let pipeline = PipelineConfig {
            min_reply_interval: env
                .millis("MIN_REPLY_INTERVAL_MS")
                .unwrap_or(p.min_reply_interval),
            defer_delay: env.millis("DEFER_DELAY_MS").unwrap_or(p.defer_delay),
            processed_cache_max: env
                .usize("PROCESSED_CACHE_MAX")
                .unwrap_or(p.processed_cache_max),
            processed_cache_clear_interval: env
                .millis("PROCESSED_CACHE_CLEAR_MS")
                .unwrap_or(p.processed_cache_clear_interval),
        };

        // Broadcast
        let b = defaults.broadcast;
        let broadcast = BroadcastConfig {
            poll_interval: env
                .millis("BROADCAST_POLL_INTERVAL_MS")
                .unwrap_or(b.poll_interval),
            batch_size: env.usize("BROADCAST_BATCH_SIZE").unwrap_or(b.batch_size),
            message_delay: env
                .millis("BROADCAST_MESSAGE_DELAY_MS")
                .unwrap_or(b.message_delay),
            batch_pause: env.millis("BROADCAST_BATCH_PAUSE_MS").unwrap_or(b.batch_pause),
            max_retries: env.u32("BROADCAST_MAX_RETRIES").unwrap_or(b.max_retries),
            retry_backoff: env
                .millis("BROADCAST_RETRY_BACKOFF_MS")
                .unwrap_or(b.retry_backoff),
            max_body_len: env.usize("BROADCAST_MAX_BODY_LEN").unwrap_or(b.max_body_len),
        };

        // Cooperative profile
        let coop_defaults = defaults.coop;
        let coop = CoopProfile {
            name: env.str("COOP_NAME").unwrap_or(coop_defaults.name),
            address: env.str("COOP_ADDRESS").unwrap_or(coop_defaults.address),
            phone: env.str("COOP_PHONE").unwrap_or(coop_defaults.phone),
            email: env.str("COOP_EMAIL").unwrap_or(coop_defaults.email),
            office_hours: env
                .str("COOP_OFFICE_HOURS")
                .unwrap_or(coop_defaults.office_hours),
            website: env.str("COOP_WEBSITE"),
        };

        let cfg = Self {
            database_path,
            session_file,
            credentials_file,
            audit_log_path,
            audit_log_json,
            gateway,
            connection,
            throttle,
            pipeline,
            broadcast,
            coop,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.max_reconnect_attempts == 0 {
            return Err(Error::Config(
                "MAX_RECONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if c.reconnect_base.is_zero() || c.reconnect_base > c.reconnect_cap {
            return Err(Error::Config(format!(
                "RECONNECT_BASE_MS ({:?}) must be > 0 and <= RECONNECT_CAP_MS ({:?})",
                c.reconnect_base, c.reconnect_cap
            )));
        }
        if self.broadcast.batch_size == 0 {
            return Err(Error::Config(
                "BROADCAST_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.pipeline.processed_cache_max == 0 {
            return Err(Error::Config(
                "PROCESSED_CACHE_MAX must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Typed accessors over a key lookup. Empty values count as unset.
struct Lookup<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Lookup<'_> {
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key).and_then(non_empty)
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.str(key).map(|s| {
            matches!(
                s.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn u64(&self, key: &str) -> Option<u64> {
        self.str(key).and_then(|s| s.trim().parse::<u64>().ok())
    }

    fn u32(&self, key: &str) -> Option<u32> {
        self.str(key).and_then(|s| s.trim().parse::<u32>().ok())
    }

    fn usize(&self, key: &str) -> Option<usize> {
        self.str(key).and_then(|s| s.trim().parse::<usize>().ok())
    }

    fn millis(&self, key: &str) -> Option<Duration> {
        self.u64(key).map(Duration::from_millis)
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.str(key).map(PathBuf::from)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
