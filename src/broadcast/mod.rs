//! Scheduled broadcast: deliver one message to every active recipient.
//!
//! The dispatcher is wired to its collaborators through traits so that the
//! recipient store and the messaging transport can be swapped independently.

mod directory;
mod dispatcher;
mod recipient;
mod source;
mod transport;

pub use directory::{InMemoryDirectory, Roster};
pub use dispatcher::{DispatchResult, Dispatcher, RunCompletion, RunPhase, DEFAULT_PACING};
pub use recipient::{DeliveryState, Recipient, RecipientId};
pub use source::{DirectoryError, RecipientSource, RecipientStateStore};
pub use transport::{FailureKind, LogTransport, Message, SendOutcome, Transport};
