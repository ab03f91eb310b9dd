//! Trialink Database Layer
//!
//! Persists assembled trial records. A record decomposes into three
//! relations keyed by registry id (`studies`, `endpoints`,
//! `baseline_measures`); every [`TrialStore`] upserts, so re-running a
//! resolution never duplicates rows.
//!
//! # Example
//!
//! ```rust,no_run
//! use trialink_db::{Database, SqliteTrialStore, TrialStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("sqlite://data/trialink.db").await?;
//!     db.initialize().await?;
//!
//!     let store = SqliteTrialStore::new(db);
//!     println!("{} studies", store.database().stats().await?.studies);
//!     Ok(())
//! }
//! ```

pub mod database;
pub mod error;
pub mod schema;
pub mod store;

pub use database::{Database, DatabaseStats};
pub use error::{DbError, Result};
pub use schema::{
    decompose, BaselineRow, EndpointRow, StudyRow, TABLE_BASELINE_MEASURES, TABLE_ENDPOINTS,
    TABLE_STUDIES,
};
pub use store::{JsonExporter, MemoryTrialStore, SqliteTrialStore, TrialStore};
