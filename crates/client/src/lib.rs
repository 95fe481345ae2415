//! Client engine for Stringboot.
//!
//! This crate provides the delta sync engine, sticky experiment assignment,
//! the HTTP delta source and the [`StringClient`] facade built on the tiers in
//! `stringboot-core`.

pub mod client;
pub mod remote;
pub mod resolver;
pub mod sync;
pub mod tiers;

#[cfg(test)]
mod testing;

pub use client::StringClient;
pub use remote::{DeltaSource, HttpDeltaSource, HttpSourceConfig, RemoteError};
pub use resolver::AssignmentResolver;
pub use sync::{SyncAnnouncer, SyncEngine, SyncOptions, SyncResult};
pub use tiers::Tiers;
