//! Remote delta-sync endpoint.
//!
//! The sync engine only depends on [`DeltaSource`]; [`HttpDeltaSource`] is the
//! production implementation. The endpoint must be idempotent: asking twice
//! for the same `since_version` returns the same delta.

pub mod error;
pub mod http;

pub use error::RemoteError;
pub use http::{HttpDeltaSource, HttpSourceConfig};

use async_trait::async_trait;
use stringboot_core::{DeltaRequest, DeltaResponse, Error};

/// Something that can answer "what changed for this language since version N".
#[async_trait]
pub trait DeltaSource: Send + Sync {
    /// Fetch the delta for `request`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NetworkFailure` when the remote is unreachable or
    /// answers with an error status, `Error::InvalidResponse` when the body
    /// cannot be used.
    async fn fetch_delta(&self, request: &DeltaRequest) -> Result<DeltaResponse, Error>;
}
