//! Folio Sync Engine
//!
//! Local-first synchronization for Folio, including:
//! - Durable outbound queue of local mutations
//! - Batched flushing with retry budgets and eviction of stuck items
//! - Cached change-feed subscriptions with row normalization
//! - Append-only pending log and a pure read-time merge
//! - Debounced cleanup of confirmed local changes
//!
//! Readers never wait on the network: every query merges the local mirror of
//! server rows with the pending log.

pub mod backoff;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod feed;
pub mod flush;
pub mod mirror;
pub mod outbox;
pub mod pending;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod table;
pub mod tokens;

// Re-export main types
pub use backoff::Backoff;
pub use cleanup::Cleanup;
pub use config::{CleanupConfig, EngineConfig, FeedConfig, FlushConfig};
pub use engine::{EngineStats, SyncEngine};
pub use feed::{ChangeFeed, FeedEvent, FeedHandle, FeedState, FeedStatus};
pub use flush::{FlushDriver, FlushReport};
pub use mirror::SyncedMirror;
pub use outbox::{Outbox, QueueStats};
pub use pending::{PendingChange, PendingLog, PendingStatus};
pub use reconcile::{into_values, merge, sort_by_field, LocalAnnotation, MergedRow, LOCAL_FIELD};
pub use scheduler::{FlushRequest, FlushScheduler, FlushSchedulerHandle};
pub use session::Session;
pub use store::LocalStore;
pub use table::{Entity, Mutation, Table, WriteReceipt};
pub use tokens::{TaskToken, TaskTokens};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = EngineConfig::default();
        let _backoff = Backoff::default();
        let _tokens = TaskTokens::new();
        let _session = Session::new();
    }
}
