//! Message transport abstraction and outcome classification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::recipient::Recipient;

/// A message broadcast to every recipient in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Body text
    pub text: String,
}

impl Message {
    /// Create a text message.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Why a send did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Destination permanently unreachable (e.g. the recipient revoked permission)
    PermanentRejection,
    /// The transport rejected the request itself as invalid
    MalformedDestination,
    /// Network errors, timeouts, and anything unexpected
    TransientError,
}

impl FailureKind {
    /// Short label used in logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PermanentRejection => "permanent",
            FailureKind::MalformedDestination => "malformed",
            FailureKind::TransientError => "transient",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of one send attempt.
///
/// Transport adapters map their client library's error taxonomy onto these
/// variants; the dispatcher never inspects library-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was accepted
    Delivered,
    /// The destination will never accept messages again
    PermanentRejection { reason: String },
    /// The request was rejected as invalid
    MalformedDestination { reason: String },
    /// The attempt failed in a way that may not recur
    TransientError { reason: String },
}

impl SendOutcome {
    /// The failure class, or `None` for a delivered message.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SendOutcome::Delivered => None,
            SendOutcome::PermanentRejection { .. } => Some(FailureKind::PermanentRejection),
            SendOutcome::MalformedDestination { .. } => Some(FailureKind::MalformedDestination),
            SendOutcome::TransientError { .. } => Some(FailureKind::TransientError),
        }
    }
}

/// Trait for message transports (e.g. a bot messaging client).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to `recipient` and classify the result.
    async fn send(&self, recipient: &Recipient, message: &Message) -> SendOutcome;
}

/// Dry-run transport that logs each send instead of delivering it.
///
/// Empty contact handles are reported as malformed so that a dry run still
/// surfaces bad roster entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

impl LogTransport {
    /// Create a logging transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, recipient: &Recipient, message: &Message) -> SendOutcome {
        if recipient.contact_handle.trim().is_empty() {
            return SendOutcome::MalformedDestination {
                reason: "empty contact handle".to_string(),
            };
        }

        info!(
            recipient = %recipient.id,
            contact_handle = %recipient.contact_handle,
            chars = message.text.chars().count(),
            "Dry-run delivery"
        );
        SendOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(SendOutcome::Delivered.failure_kind(), None);
        assert_eq!(
            SendOutcome::PermanentRejection { reason: "blocked".into() }.failure_kind(),
            Some(FailureKind::PermanentRejection)
        );
        assert_eq!(
            SendOutcome::MalformedDestination { reason: "chat not found".into() }.failure_kind(),
            Some(FailureKind::MalformedDestination)
        );
        assert_eq!(
            SendOutcome::TransientError { reason: "timeout".into() }.failure_kind(),
            Some(FailureKind::TransientError)
        );
    }

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureKind::PermanentRejection.to_string(), "permanent");
        assert_eq!(FailureKind::MalformedDestination.to_string(), "malformed");
        assert_eq!(FailureKind::TransientError.to_string(), "transient");
    }

    #[tokio::test]
    async fn test_log_transport() {
        let transport = LogTransport::new();
        let message = Message::new("How are you feeling?");

        let outcome = transport.send(&Recipient::new("1", "555001"), &message).await;
        assert_eq!(outcome, SendOutcome::Delivered);

        let outcome = transport.send(&Recipient::new("2", "  "), &message).await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::MalformedDestination));
    }
}
