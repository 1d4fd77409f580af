//! Common utilities and types shared across the Folio sync crates.
//!
//! This module provides the error type, row and id types, wire types for
//! the batch-write endpoint, and the clock abstraction used for every
//! recorded timestamp.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{
    row_id, BatchRequest, BatchResponse, EntityId, IntentStatus, ItemError, MutationIntent,
    OperationKind, Row, ID_FIELD,
};
