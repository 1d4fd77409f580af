//! Remote authority abstraction for the Folio sync engine.
//!
//! This module provides trait-based interfaces for the two remote endpoints
//! the engine talks to (batch writes and the change feed), an HTTP client for
//! them, an in-memory authority for tests and offline development, and the
//! row shapes that translate between wire and local rows.
//!
//! # Design Principles
//! - Transport isolation: queueing and reconciliation live in `folio-sync`
//! - Async operations: all I/O operations are async
//! - Full snapshots: feeds carry whole tables, never deltas

pub mod http;
pub mod memory;
pub mod predicate;
pub mod provider;
pub mod shape;

pub use http::{HttpRemote, HttpRemoteConfig};
pub use memory::MemoryRemote;
pub use predicate::Predicate;
pub use provider::{FeedKey, FeedSource, RemoteAuthority, SnapshotStream};
pub use shape::{to_camel_case, to_snake_case, ShapeRegistry, TableShape, UnionShape};
