use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kop_core::{
    broadcast::{Campaign, CampaignCounts, CampaignStatus, CampaignStore, RecipientEntry, RecipientStatus},
    domain::{DeliveryReceipt, MessageId},
    Result,
};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use tracing::info;

use crate::database::{map_tr_err, parse_ts, to_text, Database};

type SqlResult<T> = std::result::Result<T, rusqlite::Error>;

const CAMPAIGN_COLUMNS: &str = "id, title, body, status, sent_count, failed_count, created_at, \
                                started_at, completed_at";
const RECIPIENT_COLUMNS: &str =
    "id, broadcast_id, phone, status, error, message_id, sent_at, delivered_at";

/// [`CampaignStore`] over `broadcasts` and `broadcast_recipients`. Every status
/// write carries the allowed source state in its `WHERE` clause.
pub struct SqliteCampaignStore {
    conn: Arc<Connection>,
}

impl SqliteCampaignStore {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Queue a campaign with one pending recipient per phone.
    pub async fn create_campaign(&self, title: &str, body: &str, phones: &[String]) -> Result<i64> {
        let title = title.to_string();
        let body = body.to_string();
        let phones = phones.to_vec();
        let now = to_text(Utc::now());
        self.conn
            .call(move |conn| -> SqlResult<i64> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO broadcasts (title, body, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
                    params![title, body, now],
                )?;
                let id = tx.last_insert_rowid();
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO broadcast_recipients (broadcast_id, phone) VALUES (?1, ?2)",
                    )?;
                    for phone in &phones {
                        stmt.execute(params![id, phone])?;
                    }
                }
                tx.commit()?;
                Ok(id)
            })
            .await
            .map_err(|e| map_tr_err("create campaign", e))
    }

    pub async fn campaign(&self, id: i64) -> Result<Option<Campaign>> {
        self.conn
            .call(move |conn| -> SqlResult<Option<Campaign>> {
                conn.query_row(
                    &format!("SELECT {CAMPAIGN_COLUMNS} FROM broadcasts WHERE id = ?1"),
                    [id],
                    campaign_from_row,
                )
                .optional()
            })
            .await
            .map_err(|e| map_tr_err("load campaign", e))
    }

    pub async fn recipients(&self, campaign_id: i64) -> Result<Vec<RecipientEntry>> {
        self.conn
            .call(move |conn| -> SqlResult<Vec<RecipientEntry>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM broadcast_recipients \
                     WHERE broadcast_id = ?1 ORDER BY id"
                ))?;
                let rows = stmt
                    .query_map([campaign_id], recipient_from_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| map_tr_err("load recipients", e))
    }

    /// Campaigns left in `sending` by a process that died mid-run go back to
    /// `pending`. Returns how many were recovered.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let n = self
            .conn
            .call(|conn| -> SqlResult<usize> {
                conn.execute(
                    "UPDATE broadcasts SET status = 'pending' WHERE status = 'sending'",
                    [],
                )
            })
            .await
            .map_err(|e| map_tr_err("recover campaigns", e))?;
        if n > 0 {
            info!(count = n, "recovered interrupted campaigns");
        }
        Ok(n)
    }
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn claim_next_pending(&self) -> Result<Option<Campaign>> {
        let now = to_text(Utc::now());
        self.conn
            .call(move |conn| -> SqlResult<Option<Campaign>> {
                let tx = conn.transaction()?;
                let id: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM broadcasts WHERE status = 'pending' \
                         ORDER BY created_at, id LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(id) = id else {
                    return Ok(None);
                };
                let claimed = tx.execute(
                    "UPDATE broadcasts SET status = 'sending', started_at = COALESCE(started_at, ?1) \
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, id],
                )?;
                if claimed == 0 {
                    return Ok(None);
                }
                let campaign = tx.query_row(
                    &format!("SELECT {CAMPAIGN_COLUMNS} FROM broadcasts WHERE id = ?1"),
                    [id],
                    campaign_from_row,
                )?;
                tx.commit()?;
                Ok(Some(campaign))
            })
            .await
            .map_err(|e| map_tr_err("claim campaign", e))
    }

    async fn pending_recipients(&self, campaign_id: i64, limit: usize) -> Result<Vec<RecipientEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.conn
            .call(move |conn| -> SqlResult<Vec<RecipientEntry>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM broadcast_recipients \
                     WHERE broadcast_id = ?1 AND status = 'pending' ORDER BY id LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![campaign_id, limit], recipient_from_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| map_tr_err("load pending recipients", e))
    }

    async fn mark_sent(&self, recipient_id: i64, receipt: &DeliveryReceipt) -> Result<bool> {
        let message_id = receipt.message_id.0.clone();
        let sent_at = to_text(receipt.timestamp);
        self.conn
            .call(move |conn| -> SqlResult<bool> {
                let n = conn.execute(
                    "UPDATE broadcast_recipients SET status = 'sent', message_id = ?1, sent_at = ?2 \
                     WHERE id = ?3 AND status = 'pending'",
                    params![message_id, sent_at, recipient_id],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(|e| map_tr_err("mark sent", e))
    }

    async fn mark_failed(&self, recipient_id: i64, error: &str) -> Result<bool> {
        let error = error.to_string();
        self.conn
            .call(move |conn| -> SqlResult<bool> {
                let n = conn.execute(
                    "UPDATE broadcast_recipients SET status = 'failed', error = ?1 \
                     WHERE id = ?2 AND status = 'pending'",
                    params![error, recipient_id],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(|e| map_tr_err("mark failed", e))
    }

    async fn mark_delivered(&self, message_id: &MessageId, at: DateTime<Utc>) -> Result<bool> {
        let message_id = message_id.0.clone();
        let at = to_text(at);
        self.conn
            .call(move |conn| -> SqlResult<bool> {
                let n = conn.execute(
                    "UPDATE broadcast_recipients SET status = 'delivered', delivered_at = ?1 \
                     WHERE message_id = ?2 AND status = 'sent'",
                    params![at, message_id],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(|e| map_tr_err("mark delivered", e))
    }

    async fn finish(&self, campaign_id: i64) -> Result<CampaignCounts> {
        let now = to_text(Utc::now());
        self.conn
            .call(move |conn| -> SqlResult<CampaignCounts> {
                let tx = conn.transaction()?;
                let mut counts = CampaignCounts::default();
                {
                    let mut stmt = tx.prepare(
                        "SELECT status, COUNT(*) FROM broadcast_recipients \
                         WHERE broadcast_id = ?1 GROUP BY status",
                    )?;
                    let mut rows = stmt.query([campaign_id])?;
                    while let Some(row) = rows.next()? {
                        let status: String = row.get(0)?;
                        let n: u32 = row.get(1)?;
                        match RecipientStatus::parse(&status) {
                            Some(RecipientStatus::Sent | RecipientStatus::Delivered) => counts.sent += n,
                            Some(RecipientStatus::Failed) => counts.failed += n,
                            Some(RecipientStatus::Pending) | None => counts.pending += n,
                        }
                    }
                }
                tx.execute(
                    "UPDATE broadcasts SET sent_count = ?1, failed_count = ?2 WHERE id = ?3",
                    params![counts.sent, counts.failed, campaign_id],
                )?;
                tx.execute(
                    "UPDATE broadcasts SET status = 'completed', completed_at = ?1 \
                     WHERE id = ?2 AND status = 'sending'",
                    params![now, campaign_id],
                )?;
                tx.commit()?;
                Ok(counts)
            })
            .await
            .map_err(|e| map_tr_err("finish campaign", e))
    }

    async fn release(&self, campaign_id: i64) -> Result<()> {
        self.conn
            .call(move |conn| -> SqlResult<()> {
                conn.execute(
                    "UPDATE broadcasts SET status = 'pending' WHERE id = ?1 AND status = 'sending'",
                    [campaign_id],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_tr_err("release campaign", e))
    }

    async fn fail_campaign(&self, campaign_id: i64, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        let now = to_text(Utc::now());
        self.conn
            .call(move |conn| -> SqlResult<()> {
                conn.execute(
                    "UPDATE broadcasts SET status = 'failed', error = ?1, completed_at = ?2 \
                     WHERE id = ?3 AND status IN ('pending', 'sending')",
                    params![reason, now, campaign_id],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_tr_err("fail campaign", e))
    }
}

fn campaign_from_row(row: &Row<'_>) -> SqlResult<Campaign> {
    let status: String = row.get(3)?;
    Ok(Campaign {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        // The CHECK constraint keeps the column to known values.
        status: CampaignStatus::parse(&status).unwrap_or(CampaignStatus::Failed),
        sent_count: row.get(4)?,
        failed_count: row.get(5)?,
        created_at: parse_ts(row.get(6)?).unwrap_or_default(),
        started_at: parse_ts(row.get(7)?),
        completed_at: parse_ts(row.get(8)?),
    })
}

fn recipient_from_row(row: &Row<'_>) -> SqlResult<RecipientEntry> {
    let status: String = row.get(3)?;
    let message_id: Option<String> = row.get(5)?;
    Ok(RecipientEntry {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        phone: row.get(2)?,
        status: RecipientStatus::parse(&status).unwrap_or(RecipientStatus::Failed),
        error: row.get(4)?,
        message_id: message_id.map(MessageId),
        sent_at: parse_ts(row.get(6)?),
        delivered_at: parse_ts(row.get(7)?),
    })
}
