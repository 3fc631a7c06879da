use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{errors::Error, Result};

/// Truncate to `max_len` characters, appending `...` when something was cut.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}...", &s[..cut]),
    }
}

// ============== Audit Logging ==============

/// Free text (member messages and replies) is cut to this many characters.
const AUDIT_MAX_TEXT: usize = 500;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A member message and the reply it got.
    Message {
        phone: String,
        member_number: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        content: String,
        response: String,
    },
    /// Access attempt from a phone that does not belong to an active member.
    NonMember { phone: String, content: String },
    Error {
        phone: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    /// Final outcome of one broadcast recipient.
    Delivery {
        campaign_id: i64,
        phone: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// One line of the audit log.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: AuditRecord,
}

impl AuditEvent {
    fn now(record: AuditRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            record,
        }
    }

    pub fn message(
        phone: &str,
        member_number: &str,
        command: Option<&str>,
        content: &str,
        response: &str,
    ) -> Self {
        Self::now(AuditRecord::Message {
            phone: phone.to_string(),
            member_number: member_number.to_string(),
            command: command.map(str::to_string),
            content: content.to_string(),
            response: response.to_string(),
        })
    }

    pub fn non_member(phone: &str, content: &str) -> Self {
        Self::now(AuditRecord::NonMember {
            phone: phone.to_string(),
            content: content.to_string(),
        })
    }

    pub fn error(phone: &str, error: &str, context: Option<&str>) -> Self {
        Self::now(AuditRecord::Error {
            phone: phone.to_string(),
            error: error.to_string(),
            context: context.map(str::to_string),
        })
    }

    pub fn delivery(
        campaign_id: i64,
        phone: &str,
        message_id: Option<&str>,
        attempts: u32,
        error: Option<&str>,
    ) -> Self {
        Self::now(AuditRecord::Delivery {
            campaign_id,
            phone: phone.to_string(),
            message_id: message_id.map(str::to_string),
            attempts,
            error: error.map(str::to_string),
        })
    }

    fn clip_free_text(&mut self) {
        let fields: Vec<&mut String> = match &mut self.record {
            AuditRecord::Message {
                content, response, ..
            } => vec![content, response],
            AuditRecord::NonMember { content, .. } => vec![content],
            AuditRecord::Error { .. } | AuditRecord::Delivery { .. } => Vec::new(),
        };
        for field in fields {
            *field = truncate_text(field, AUDIT_MAX_TEXT);
        }
    }

    /// `key: value` lines under a separator, for operators reading the file by eye.
    fn to_plain_block(&self) -> Result<String> {
        let serde_json::Value::Object(fields) = serde_json::to_value(self)? else {
            return Err(Error::External("audit event is not a JSON object".into()));
        };
        let mut out = format!("\n{}", "=".repeat(60));
        for (k, v) in fields {
            let v = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            out.push_str(&format!("\n{k}: {v}"));
        }
        out.push('\n');
        Ok(out)
    }
}

/// Append-only audit log, JSON lines or plain blocks.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        event.clip_free_text();
        let entry = if self.json {
            format!("{}\n", serde_json::to_string(&event)?)
        } else {
            event.to_plain_block()?
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())?;
        Ok(())
    }

    /// Like [`write`](Self::write), but failures only reach the log.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(event) {
            tracing::warn!(path = %self.path.display(), error = %e, "audit log write failed");
        }
    }
}
