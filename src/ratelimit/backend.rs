//! Admission backend trait.

use async_trait::async_trait;

use super::bucket::Decision;
use crate::error::Result;

/// Trait for admission backends.
///
/// Abstracts the in-process [`Limiter`](super::Limiter) so the
/// [`AdmissionGuard`](super::AdmissionGuard) can work with any
/// implementation. An `Err` means the bookkeeping itself failed; a denial
/// is an `Ok` decision with `allowed == false`.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Check both the caller's global ceiling and the rule for `path`.
    async fn check(&self, identity: &str, path: &str) -> Result<Decision>;
}
