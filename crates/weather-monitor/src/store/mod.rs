//! Observation store interface.
//!
//! Holds at most one current row per location id. No history.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::observation::Observation;

/// Errors from observation stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A newer observation is already stored; the write was discarded.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Insert-or-replace of the latest observation per location.
///
/// Shared by up to `worker_count` concurrent tasks.
pub trait ObservationStore: Send + Sync + 'static {
    fn upsert(
        &self,
        observation: Observation,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
