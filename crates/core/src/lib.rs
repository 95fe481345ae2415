//! Core types and shared functionality for the Stringboot client engine.
//!
//! This crate provides:
//! - Local Store with SQLite backend (entries, cursors, assignments, identity)
//! - Bounded in-memory LRU for resolved strings
//! - Deterministic experiment bucketing
//! - Watch hub and cross-context broadcaster
//! - Unified error types and layered configuration

pub mod assignment;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod identity;
pub mod language;
pub mod memory;
pub mod model;
pub mod store;
pub mod watch;

pub use assignment::{ExperimentConfig, Variant, resolve_variant};
pub use broadcast::{Broadcaster, ContextEvent, ContextEventKind};
pub use config::{ClientConfig, ConfigError};
pub use error::Error;
pub use identity::{IdentityStore, MemoryIdentityStore};
pub use memory::{Generation, MemoryCache};
pub use model::{
    CacheStats, DeltaRequest, DeltaResponse, DeviceIdentity, Entry, ExperimentAssignment, IdentitySource, Language,
    RemoteEntry, SyncCursor,
};
pub use store::{CommitOutcome, CommitRequest, StoreDb};
pub use watch::{ChangeReason, Subscription, WatchEvent, WatchHub};
