//! In-memory recipient roster.
//!
//! Stands in for the relational store when running the dispatcher on its
//! own: the roster is loaded from YAML at startup and state changes live
//! only for the life of the process.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::recipient::{DeliveryState, Recipient, RecipientId};
use super::source::{DirectoryError, RecipientSource, RecipientStateStore};
use crate::error::{Result, VigilError};

/// Serialized roster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

/// Recipient source and state store backed by a vector.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    recipients: RwLock<Vec<Recipient>>,
}

impl InMemoryDirectory {
    /// Create a directory holding `recipients` in the given order.
    pub fn new(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients: RwLock::new(recipients),
        }
    }

    /// Load a roster from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let roster: Roster = serde_yaml::from_str(yaml)
            .map_err(|e| VigilError::Config(format!("Failed to parse roster: {}", e)))?;
        Ok(Self::new(roster.recipients))
    }

    /// Load a roster from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading recipient roster");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Current state of a recipient.
    pub fn state_of(&self, id: &RecipientId) -> Option<DeliveryState> {
        self.recipients
            .read()
            .iter()
            .find(|r| &r.id == id)
            .map(|r| r.delivery_state)
    }

    /// Number of recipients in the roster, in any state.
    pub fn len(&self) -> usize {
        self.recipients.read().len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecipientSource for InMemoryDirectory {
    async fn list_active(&self) -> std::result::Result<Vec<Recipient>, DirectoryError> {
        Ok(self
            .recipients
            .read()
            .iter()
            .filter(|r| r.delivery_state.is_eligible())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecipientStateStore for InMemoryDirectory {
    async fn mark_blocked(&self, id: &RecipientId) -> std::result::Result<(), DirectoryError> {
        let mut recipients = self.recipients.write();
        let recipient = recipients
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| DirectoryError::UnknownRecipient(id.clone()))?;

        // paused recipients are managed elsewhere; blocked ones need no write
        if recipient.delivery_state == DeliveryState::Active {
            recipient.delivery_state = DeliveryState::Blocked;
            debug!(recipient = %id, "Recipient marked blocked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER: &str = r#"
recipients:
  - id: "1"
    contact_handle: "555001"
  - id: "2"
    contact_handle: "555002"
    delivery_state: paused
  - id: "3"
    contact_handle: "555003"
    delivery_state: blocked
  - id: "4"
    contact_handle: "555004"
"#;

    #[test]
    fn test_list_active_filters_and_keeps_order() {
        let directory = InMemoryDirectory::from_yaml(ROSTER).unwrap();
        assert_eq!(directory.len(), 4);

        let active = tokio_test::block_on(directory.list_active()).unwrap();
        let ids: Vec<_> = active.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
    }

    #[test]
    fn test_mark_blocked_only_moves_active() {
        let directory = InMemoryDirectory::from_yaml(ROSTER).unwrap();

        tokio_test::block_on(directory.mark_blocked(&RecipientId::new("1"))).unwrap();
        tokio_test::block_on(directory.mark_blocked(&RecipientId::new("2"))).unwrap();

        assert_eq!(directory.state_of(&RecipientId::new("1")), Some(DeliveryState::Blocked));
        assert_eq!(directory.state_of(&RecipientId::new("2")), Some(DeliveryState::Paused));
    }

    #[test]
    fn test_mark_blocked_unknown_recipient() {
        let directory = InMemoryDirectory::default();
        let result = tokio_test::block_on(directory.mark_blocked(&RecipientId::new("nope")));
        assert!(matches!(result, Err(DirectoryError::UnknownRecipient(_))));
    }

    #[test]
    fn test_bad_roster_rejected() {
        assert!(InMemoryDirectory::from_yaml("recipients: 12").is_err());
    }
}
