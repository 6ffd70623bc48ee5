//! Recipient records as seen by the dispatcher.

use serde::{Deserialize, Serialize};

/// Opaque recipient identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(pub String);

impl RecipientId {
    /// Create an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecipientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a recipient receives broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Receives broadcasts
    #[default]
    Active,
    /// Temporarily opted out; managed outside the dispatcher
    Paused,
    /// Permanently unreachable until reset externally
    Blocked,
}

impl DeliveryState {
    /// Whether recipients in this state are included in a broadcast run.
    pub fn is_eligible(&self) -> bool {
        matches!(self, DeliveryState::Active)
    }
}

/// A broadcast recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable identifier
    pub id: RecipientId,
    /// Destination address, interpreted only by the transport
    pub contact_handle: String,
    /// Current delivery state
    #[serde(default)]
    pub delivery_state: DeliveryState,
}

impl Recipient {
    /// Create an active recipient.
    pub fn new(id: impl Into<String>, contact_handle: impl Into<String>) -> Self {
        Self {
            id: RecipientId::new(id),
            contact_handle: contact_handle.into(),
            delivery_state: DeliveryState::Active,
        }
    }

    /// Override the delivery state.
    pub fn with_state(mut self, state: DeliveryState) -> Self {
        self.delivery_state = state;
        self
    }
}
