use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::{errors::Error, phone, Result};

/// Identity row of a member, as the backing store holds it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberRecord {
    pub id: i64,
    pub name: String,
    pub member_number: String,
    pub status: String,
    pub phone: String,
    pub joined_at: Option<NaiveDate>,
}

/// Membership status values that count as active.
pub const ACTIVE_MEMBER_STATUSES: &[&str] = &["aktif", "active"];

pub fn is_active_status(status: &str) -> bool {
    let s = status.trim().to_lowercase();
    ACTIVE_MEMBER_STATUSES.contains(&s.as_str())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SavingsBalance {
    /// `pokok`, `wajib`, `sukarela`, ...
    pub category: String,
    pub amount: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    Completed,
    Other,
}

impl LoanStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "active" | "aktif" | "berjalan" => Self::Active,
            "completed" | "lunas" | "paid" | "closed" => Self::Completed,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoanSummary {
    pub loan_number: String,
    pub principal: i64,
    pub outstanding: i64,
    pub status: LoanStatus,
    pub installments_paid: u32,
    pub installments_total: u32,
    pub next_due: Option<NaiveDate>,
}

/// A resolved member with financial aggregates. Read-only to the core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub member_number: String,
    pub status: String,
    pub phone: String,
    pub joined_at: Option<NaiveDate>,
    pub savings: Vec<SavingsBalance>,
    pub loans: Vec<LoanSummary>,
}

impl Member {
    pub fn from_parts(
        record: MemberRecord,
        savings: Vec<SavingsBalance>,
        loans: Vec<LoanSummary>,
    ) -> Self {
        Self {
            id: record.id,
            name: record.name,
            member_number: record.member_number,
            status: record.status,
            phone: record.phone,
            joined_at: record.joined_at,
            savings,
            loans,
        }
    }

    pub fn total_savings(&self) -> i64 {
        self.savings.iter().map(|s| s.amount).sum()
    }

    pub fn active_loans(&self) -> impl Iterator<Item = &LoanSummary> {
        self.loans.iter().filter(|l| l.status == LoanStatus::Active)
    }

    pub fn completed_loan_count(&self) -> usize {
        self.loans
            .iter()
            .filter(|l| l.status == LoanStatus::Completed)
            .count()
    }

    pub fn outstanding_balance(&self) -> i64 {
        self.active_loans().map(|l| l.outstanding).sum()
    }
}

/// Backing-store port for member data.
///
/// Implementations map their own failures into `Error::StoreUnavailable`.
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// First *active* member whose stored phone equals one of `variants`.
    async fn find_active_by_phone(&self, variants: &[String]) -> Result<Option<MemberRecord>>;

    async fn savings_by_category(&self, member_id: i64) -> Result<Vec<SavingsBalance>>;

    async fn loans(&self, member_id: i64) -> Result<Vec<LoanSummary>>;
}

/// Resolves a raw sender phone to a [`Member`] with aggregates.
#[derive(Clone)]
pub struct MemberDirectory {
    store: Arc<dyn MemberStore>,
}

impl MemberDirectory {
    pub fn new(store: Arc<dyn MemberStore>) -> Self {
        Self { store }
    }

    /// `MemberNotFound` when no active member matches; `StoreUnavailable` when the
    /// store could not be queried.
    pub async fn resolve(&self, raw_phone: &str) -> Result<Member> {
        let variants = phone::lookup_variants(raw_phone);
        if variants.is_empty() {
            return Err(Error::MemberNotFound);
        }

        let record = self
            .store
            .find_active_by_phone(&variants)
            .await
            .map_err(into_store_error)?
            .ok_or(Error::MemberNotFound)?;

        let savings = self
            .store
            .savings_by_category(record.id)
            .await
            .map_err(into_store_error)?;
        let loans = self.store.loans(record.id).await.map_err(into_store_error)?;

        Ok(Member::from_parts(record, savings, loans))
    }
}

fn into_store_error(e: Error) -> Error {
    match e {
        Error::StoreUnavailable(_) | Error::MemberNotFound => e,
        other => Error::StoreUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{sample_member_record, InMemoryMemberStore};

    #[tokio::test]
    async fn resolves_any_phone_shape() {
        let store = InMemoryMemberStore::new();
        store.insert(sample_member_record(1, "081234567890"), vec![], vec![]);
        let dir = MemberDirectory::new(Arc::new(store));

        let a = dir.resolve("+62 812-3456-7890").await.unwrap();
        let b = dir.resolve("6281234567890").await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn inactive_or_unknown_members_are_not_found() {
        let store = InMemoryMemberStore::new();
        let mut inactive = sample_member_record(2, "6285511112222");
        inactive.status = "nonaktif".to_string();
        store.insert(inactive, vec![], vec![]);
        let dir = MemberDirectory::new(Arc::new(store));

        assert!(matches!(
            dir.resolve("085511112222").await,
            Err(Error::MemberNotFound)
        ));
        assert!(matches!(dir.resolve("").await, Err(Error::MemberNotFound)));
    }

    #[tokio::test]
    async fn store_failures_surface_as_unavailable() {
        let store = InMemoryMemberStore::new();
        store.set_unavailable(true);
        let dir = MemberDirectory::new(Arc::new(store));
        assert!(matches!(
            dir.resolve("081234567890").await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[test]
    fn aggregates_ignore_completed_loans() {
        let member = Member::from_parts(
            sample_member_record(1, "6281"),
            vec![
                SavingsBalance {
                    category: "pokok".into(),
                    amount: 100_000,
                },
                SavingsBalance {
                    category: "wajib".into(),
                    amount: 250_000,
                },
            ],
            vec![
                LoanSummary {
                    loan_number: "P-1".into(),
                    principal: 5_000_000,
                    outstanding: 2_000_000,
                    status: LoanStatus::Active,
                    installments_paid: 6,
                    installments_total: 12,
                    next_due: None,
                },
                LoanSummary {
                    loan_number: "P-0".into(),
                    principal: 1_000_000,
                    outstanding: 0,
                    status: LoanStatus::Completed,
                    installments_paid: 10,
                    installments_total: 10,
                    next_due: None,
                },
            ],
        );
        assert_eq!(member.total_savings(), 350_000);
        assert_eq!(member.outstanding_balance(), 2_000_000);
        assert_eq!(member.active_loans().count(), 1);
        assert_eq!(member.completed_loan_count(), 1);
    }

    #[test]
    fn loan_status_parsing() {
        assert_eq!(LoanStatus::parse("Aktif"), LoanStatus::Active);
        assert_eq!(LoanStatus::parse("lunas"), LoanStatus::Completed);
        assert_eq!(LoanStatus::parse("macet"), LoanStatus::Other);
    }
}
