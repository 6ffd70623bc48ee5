//! Admission guard called at the top of every request handler.
//!
//! The guard is the explicit pre-check the request pipeline runs before doing
//! any work: it skips exempt paths, asks the backend for a decision, and turns
//! a denial into a [`Rejection`] the boundary layer can render as a
//! "429 Too Many Requests" response.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use super::backend::AdmissionBackend;
use super::bucket::RETRY_SLACK_SECS;

/// Identity used when the caller address is unknown.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Retry hint handed out when a faulty limiter fails closed.
const FAULT_RETRY_AFTER_SECS: f64 = 1.0;

/// What to do when the backend itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Let the request through (fail-open)
    #[default]
    Allow,
    /// Reject the request (fail-closed)
    Deny,
}

/// Guard settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    /// When false every request is admitted without touching the backend
    pub enabled: bool,
    /// Paths that are never limited
    pub exempt_paths: Vec<String>,
    /// Path prefixes that are never limited
    pub exempt_prefixes: Vec<String>,
    /// Behaviour on backend faults
    pub on_fault: FaultPolicy,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            exempt_paths: vec!["/health".to_string(), "/api/v1/health".to_string()],
            exempt_prefixes: vec!["/static/".to_string()],
            on_fault: FaultPolicy::Allow,
        }
    }
}

/// A denied request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rejection {
    /// Exact seconds until the request would be admitted
    pub retry_after_secs: f64,
}

impl Rejection {
    /// HTTP status for a rejected request.
    pub const STATUS: u16 = 429;

    /// Message returned in the response body.
    pub const DETAIL: &'static str = "Rate limit exceeded. Please try again later.";

    /// Create a rejection with a retry hint.
    pub fn new(retry_after_secs: f64) -> Self {
        Self { retry_after_secs }
    }

    /// Value for the `Retry-After` header: whole seconds, rounded up, at least 1.
    ///
    /// The hint may be shortened by at most the bucket's retry slack, so a
    /// client waiting exactly the header value is always admitted.
    pub fn retry_after_header(&self) -> String {
        let secs = (self.retry_after_secs - RETRY_SLACK_SECS).ceil().max(1.0) as u64;
        secs.to_string()
    }

    /// JSON response body.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "detail": Self::DETAIL,
            "retry_after": self.retry_after_secs,
        })
    }
}

/// Result of running the guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Within limits
    Admitted,
    /// Not subject to limiting (guard disabled or exempt path)
    Exempt,
    /// Admitted because the backend failed and the policy is fail-open
    FailedOpen,
    /// Over limit
    Rejected(Rejection),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// Pre-check wrapping an admission backend.
pub struct AdmissionGuard<B: AdmissionBackend> {
    /// The backend making decisions
    backend: Arc<B>,
    /// Exemptions and fault policy
    settings: GuardSettings,
}

impl<B: AdmissionBackend> AdmissionGuard<B> {
    /// Create a guard with default settings.
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_settings(backend, GuardSettings::default())
    }

    /// Create a guard with explicit settings.
    pub fn with_settings(backend: Arc<B>, settings: GuardSettings) -> Self {
        Self { backend, settings }
    }

    /// The backend behind this guard.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Whether `path` bypasses limiting entirely.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.settings.exempt_paths.iter().any(|p| p == path)
            || self
                .settings
                .exempt_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Decide whether a request from `identity` to `path` may proceed.
    ///
    /// A missing identity is limited under [`UNKNOWN_IDENTITY`].
    pub async fn admit(&self, identity: Option<&str>, path: &str) -> Admission {
        if !self.settings.enabled || self.is_exempt(path) {
            return Admission::Exempt;
        }

        let identity = identity.unwrap_or(UNKNOWN_IDENTITY);

        let checked = AssertUnwindSafe(self.backend.check(identity, path))
            .catch_unwind()
            .await;

        match checked {
            Ok(Ok(decision)) if decision.allowed => Admission::Admitted,
            Ok(Ok(decision)) => {
                debug!(
                    identity = %identity,
                    path = %path,
                    retry_after_secs = decision.retry_after_secs,
                    "Request rejected by rate limiter"
                );
                Admission::Rejected(Rejection::new(decision.retry_after_secs))
            }
            Ok(Err(e)) => self.on_fault(identity, path, &e.to_string()),
            Err(panic) => self.on_fault(identity, path, panic_message(&*panic)),
        }
    }

    fn on_fault(&self, identity: &str, path: &str, fault: &str) -> Admission {
        match self.settings.on_fault {
            FaultPolicy::Allow => {
                warn!(
                    identity = %identity,
                    path = %path,
                    error = %fault,
                    "Rate limiter fault, admitting request"
                );
                Admission::FailedOpen
            }
            FaultPolicy::Deny => {
                error!(
                    identity = %identity,
                    path = %path,
                    error = %fault,
                    "Rate limiter fault, rejecting request"
                );
                Admission::Rejected(Rejection::new(FAULT_RETRY_AFTER_SECS))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "backend panicked"
    }
}
