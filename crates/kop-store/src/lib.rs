//! SQLite persistence for the member directory and campaign broadcasts.
//!
//! All statements run on tokio-rusqlite's single background thread; the stores
//! share one [`Database`] connection.

pub mod campaigns;
pub mod database;
pub mod members;

pub use campaigns::SqliteCampaignStore;
pub use database::Database;
pub use members::SqliteMemberStore;
