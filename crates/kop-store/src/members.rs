use std::sync::Arc;

use async_trait::async_trait;
use kop_core::{
    directory::{is_active_status, LoanStatus, LoanSummary, MemberRecord, MemberStore, SavingsBalance},
    Result,
};
use tokio_rusqlite::Connection;

use crate::database::{map_tr_err, parse_date, Database};

/// [`MemberStore`] over the `members`, `savings` and `loans` tables.
pub struct SqliteMemberStore {
    conn: Arc<Connection>,
}

impl SqliteMemberStore {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }
}

#[async_trait]
impl MemberStore for SqliteMemberStore {
    async fn find_active_by_phone(&self, variants: &[String]) -> Result<Option<MemberRecord>> {
        if variants.is_empty() {
            return Ok(None);
        }
        let variants = variants.to_vec();
        let rows = self
            .conn
            .call(move |conn| -> std::result::Result<Vec<MemberRecord>, rusqlite::Error> {
                let placeholders = vec!["?"; variants.len()].join(", ");
                let sql = format!(
                    "SELECT id, name, member_number, status, phone, joined_at \
                     FROM members WHERE phone IN ({placeholders}) ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(variants.iter()), |row| {
                        Ok(MemberRecord {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            member_number: row.get(2)?,
                            status: row.get(3)?,
                            phone: row.get(4)?,
                            joined_at: parse_date(row.get(5)?),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| map_tr_err("member lookup", e))?;

        Ok(rows.into_iter().find(|m| is_active_status(&m.status)))
    }

    async fn savings_by_category(&self, member_id: i64) -> Result<Vec<SavingsBalance>> {
        self.conn
            .call(move |conn| -> std::result::Result<Vec<SavingsBalance>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT category, COALESCE(SUM(amount), 0) FROM savings \
                     WHERE member_id = ?1 GROUP BY category ORDER BY category",
                )?;
                let rows = stmt
                    .query_map([member_id], |row| {
                        Ok(SavingsBalance {
                            category: row.get(0)?,
                            amount: row.get(1)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| map_tr_err("savings lookup", e))
    }

    async fn loans(&self, member_id: i64) -> Result<Vec<LoanSummary>> {
        self.conn
            .call(move |conn| -> std::result::Result<Vec<LoanSummary>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT loan_number, principal, outstanding, status, installments_paid, \
                     installments_total, next_due FROM loans WHERE member_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([member_id], |row| {
                        let status: String = row.get(3)?;
                        Ok(LoanSummary {
                            loan_number: row.get(0)?,
                            principal: row.get(1)?,
                            outstanding: row.get(2)?,
                            status: LoanStatus::parse(&status),
                            installments_paid: row.get(4)?,
                            installments_total: row.get(5)?,
                            next_due: parse_date(row.get(6)?),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| map_tr_err("loan lookup", e))
    }
}
