//! Persistence-facing collaborator traits.

use async_trait::async_trait;
use thiserror::Error;

use super::recipient::{Recipient, RecipientId};

/// Errors raised by recipient persistence.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Recipient store unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(RecipientId),
}

/// Read side: who should receive a broadcast right now.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    /// Every recipient currently in the `Active` state, in delivery order.
    async fn list_active(&self) -> Result<Vec<Recipient>, DirectoryError>;
}

/// Write side: the one state change the dispatcher is allowed to make.
#[async_trait]
pub trait RecipientStateStore: Send + Sync {
    /// Move an `Active` recipient to `Blocked`.
    async fn mark_blocked(&self, id: &RecipientId) -> Result<(), DirectoryError>;
}
