//! Sync history: an append-only log of sync sessions and the changes they
//! made.
//!
//! Entries feed audit listings, statistics, velocity reports and rollback
//! lookups. The default backend is a SQLite database under the config
//! directory.

mod sqlite;
mod store;
mod types;

pub use sqlite::SqliteHistoryStore;
pub use store::SyncHistoryStore;
pub use types::{
    day_span, days_before, generate_change_id, generate_entry_id, ChangeRecord, HistoryQuery, StoreInfo,
    SyncHistoryEntry, SyncOutcome, SyncStatistics, VelocityMetrics,
};
