//! Broadcast dispatcher: one run sends one message to every active recipient.
//!
//! A run moves through `Idle → Fetching → Sending → Completed`. Recipients are
//! processed sequentially in the order the source returns them, with a fixed
//! pacing delay between sends. A failed send is final for that recipient in
//! that run; the run always reaches `Completed` and returns a summary.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::recipient::Recipient;
use super::source::{RecipientSource, RecipientStateStore};
use super::transport::{FailureKind, Message, SendOutcome, Transport};
use crate::schedule::Job;

/// Default delay between consecutive sends.
pub const DEFAULT_PACING: Duration = Duration::from_millis(500);

/// Where the dispatcher is within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// No run has started yet
    Idle,
    /// Loading recipients
    Fetching,
    /// Iterating recipients
    Sending,
    /// The last run has finished
    Completed,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCompletion {
    /// Every recipient was processed
    Completed,
    /// Stopped early between recipients; counts are partial
    Cancelled,
    /// The recipient source failed; nothing was sent
    SourceUnavailable,
}

/// Summary of one broadcast run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    /// Identifier used to correlate this run's log lines
    pub run_id: Uuid,
    /// Recipients the message was delivered to
    pub sent_count: usize,
    /// Recipients whose send failed for any reason
    pub failed_count: usize,
    /// Failures broken down by class
    pub failures_by_reason: BTreeMap<FailureKind, usize>,
    /// How the run ended
    pub completion: RunCompletion,
}

impl DispatchResult {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            sent_count: 0,
            failed_count: 0,
            failures_by_reason: BTreeMap::new(),
            completion: RunCompletion::Completed,
        }
    }

    /// Recipients processed so far.
    pub fn processed(&self) -> usize {
        self.sent_count + self.failed_count
    }

    /// Failures of one class.
    pub fn failures(&self, kind: FailureKind) -> usize {
        self.failures_by_reason.get(&kind).copied().unwrap_or(0)
    }

    fn record(&mut self, failure: Option<FailureKind>) {
        match failure {
            None => self.sent_count += 1,
            Some(kind) => {
                self.failed_count += 1;
                *self.failures_by_reason.entry(kind).or_insert(0) += 1;
            }
        }
    }
}

/// Drives broadcast runs against injected collaborators.
///
/// The dispatcher never schedules itself and does not guard against
/// overlapping runs; the trigger invoking it is expected to cap concurrency.
pub struct Dispatcher {
    source: Arc<dyn RecipientSource>,
    store: Arc<dyn RecipientStateStore>,
    transport: Arc<dyn Transport>,
    message: Message,
    pacing: Duration,
    phase: RwLock<RunPhase>,
    /// Counts of the run in progress, or of the last finished run
    progress: RwLock<Option<DispatchResult>>,
}

impl Dispatcher {
    /// Create a dispatcher with the default pacing delay.
    pub fn new(
        source: Arc<dyn RecipientSource>,
        store: Arc<dyn RecipientStateStore>,
        transport: Arc<dyn Transport>,
        message: Message,
    ) -> Self {
        Self {
            source,
            store,
            transport,
            message,
            pacing: DEFAULT_PACING,
            phase: RwLock::new(RunPhase::Idle),
            progress: RwLock::new(None),
        }
    }

    /// Set the delay between consecutive sends.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        *self.phase.read()
    }

    /// Counts of the run in progress, or of the last finished run.
    pub fn progress(&self) -> Option<DispatchResult> {
        self.progress.read().clone()
    }

    /// Run one broadcast to completion.
    pub async fn run(&self) -> DispatchResult {
        self.run_until_cancelled(&CancellationToken::new()).await
    }

    /// Run one broadcast, stopping between recipients if `cancel` fires.
    pub async fn run_until_cancelled(&self, cancel: &CancellationToken) -> DispatchResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("broadcast_run", %run_id);
        self.execute_run(run_id, cancel).instrument(span).await
    }

    async fn execute_run(&self, run_id: Uuid, cancel: &CancellationToken) -> DispatchResult {
        let mut result = DispatchResult::new(run_id);
        self.set_phase(RunPhase::Fetching);
        *self.progress.write() = Some(result.clone());
        info!("Broadcast run started");

        let recipients = match self.source.list_active().await {
            Ok(recipients) => recipients,
            Err(e) => {
                error!(error = %e, "Could not load recipients, aborting run");
                result.completion = RunCompletion::SourceUnavailable;
                return self.finish(result);
            }
        };

        info!(count = recipients.len(), "Loaded active recipients");
        if recipients.is_empty() {
            return self.finish(result);
        }

        self.set_phase(RunPhase::Sending);
        let total = recipients.len();

        for (index, recipient) in recipients.iter().enumerate() {
            if cancel.is_cancelled() {
                result.completion = RunCompletion::Cancelled;
                break;
            }

            let failure = self.deliver(recipient).await;
            result.record(failure);
            *self.progress.write() = Some(result.clone());

            if index + 1 < total {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        result.completion = RunCompletion::Cancelled;
                        break;
                    }
                    _ = tokio::time::sleep(self.pacing) => {}
                }
            }
        }

        if result.completion == RunCompletion::Cancelled {
            warn!(
                processed = result.processed(),
                remaining = total - result.processed(),
                "Broadcast run cancelled"
            );
        }

        self.finish(result)
    }

    /// Send to one recipient and reconcile its state.
    ///
    /// Returns the failure class, or `None` on success. A panic anywhere in
    /// the attempt is contained here and counted as a transient failure.
    async fn deliver(&self, recipient: &Recipient) -> Option<FailureKind> {
        match AssertUnwindSafe(self.attempt(recipient)).catch_unwind().await {
            Ok(failure) => failure,
            Err(panic) => {
                error!(
                    recipient = %recipient.id,
                    panic = panic_message(&*panic),
                    "Unexpected fault while delivering, counting as transient"
                );
                Some(FailureKind::TransientError)
            }
        }
    }

    async fn attempt(&self, recipient: &Recipient) -> Option<FailureKind> {
        let outcome = self.transport.send(recipient, &self.message).await;

        match outcome {
            SendOutcome::Delivered => {
                debug!(recipient = %recipient.id, "Message delivered");
                None
            }
            SendOutcome::PermanentRejection { reason } => {
                info!(
                    recipient = %recipient.id,
                    reason = %reason,
                    "Recipient unreachable, marking blocked"
                );
                match self.store.mark_blocked(&recipient.id).await {
                    Ok(()) => Some(FailureKind::PermanentRejection),
                    Err(e) => {
                        error!(
                            recipient = %recipient.id,
                            error = %e,
                            "Failed to mark recipient blocked"
                        );
                        Some(FailureKind::TransientError)
                    }
                }
            }
            SendOutcome::MalformedDestination { reason } => {
                error!(
                    recipient = %recipient.id,
                    reason = %reason,
                    "Transport rejected destination as malformed"
                );
                Some(FailureKind::MalformedDestination)
            }
            SendOutcome::TransientError { reason } => {
                warn!(
                    recipient = %recipient.id,
                    reason = %reason,
                    "Transient send failure"
                );
                Some(FailureKind::TransientError)
            }
        }
    }

    fn finish(&self, result: DispatchResult) -> DispatchResult {
        self.set_phase(RunPhase::Completed);
        *self.progress.write() = Some(result.clone());

        info!(
            sent = result.sent_count,
            failed = result.failed_count,
            failures = ?result.failures_by_reason,
            completion = ?result.completion,
            "Broadcast run finished"
        );
        result
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.phase.write() = phase;
    }
}

#[async_trait]
impl Job for Dispatcher {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn execute(&self, cancel: CancellationToken) {
        self.run_until_cancelled(&cancel).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
