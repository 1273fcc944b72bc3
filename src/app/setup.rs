//! Activation sequence: pairing, priming, cannula insertion.
//!
//! ```text
//!  AddressAssigned ─prime─▶ Priming ──(52 s, verify)──▶ PrimingFinished
//!  PrimingFinished ─insert─▶ CannulaInserting ──(10 s, verify)──▶ Completed
//! ```
//!
//! Each step sends its command synchronously, then hands back a
//! [`SetupTask`] that waits out the physical delivery time before polling
//! the pod to confirm the step.

use std::sync::{Arc, Weak};

use embassy_time::Duration;
use log::{debug, info, warn};

use crate::error::{CommandError, CommandErrorKind, Error, Result};
use crate::pod::schedule::BasalSchedule;
use crate::pod::{PodProgress, SetupProgress};
use crate::task::{self, CancelToken, CompletionSlot, TaskHandle};

use super::commands::PodCommand;
use super::ports::{CommandExecutor, SessionStore};
use super::responses::{Response, StatusResponse};
use super::service::{Core, PodManager, Shared};
use super::verify::CommandChannel;

/// Outcome of one setup verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupActionResult {
    Success,
    /// The pod answered, but reports a different stage.
    Failure(SetupProgress),
    /// The pod could not be asked; carries the last poll error.
    VerificationFailure(CommandError),
}

impl SetupActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The session (or the whole manager) went away before the step could
    /// be checked.
    pub(crate) fn session_gone() -> Self {
        Self::VerificationFailure(CommandError::certain(CommandErrorKind::Other))
    }

    /// Convert into the orchestrator's error type for a step that expected
    /// to reach `expected`.
    pub fn into_result(self, expected: SetupProgress) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::Failure(actual) => Err(Error::OutOfSequence {
                expected,
                actual: Some(actual),
            }),
            Self::VerificationFailure(cause) => Err(Error::VerificationExhausted(cause)),
        }
    }
}

/// Which activation step is being verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetupStep {
    Priming,
    CannulaInsertion,
}

impl SetupStep {
    pub(crate) fn expected(self) -> SetupProgress {
        match self {
            Self::Priming => SetupProgress::PrimingFinished,
            Self::CannulaInsertion => SetupProgress::Completed,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Priming => "priming",
            Self::CannulaInsertion => "cannula insertion",
        }
    }

    /// Progress the step reaches given what the pod reports, if it
    /// reaches one at all.
    fn reconcile(self, current: SetupProgress, status: &StatusResponse) -> Option<SetupProgress> {
        match self {
            Self::Priming
                if current == SetupProgress::Priming
                    && status.pod_progress >= PodProgress::PrimingCompleted =>
            {
                Some(SetupProgress::PrimingFinished)
            }
            Self::CannulaInsertion
                if current == SetupProgress::CannulaInserting && status.pod_progress.is_running() =>
            {
                Some(SetupProgress::Completed)
            }
            _ => None,
        }
    }
}

// ── Verification ─────────────────────────────────────────────

impl<E: CommandExecutor, S: SessionStore> Core<E, S> {
    /// Poll status up to `tries` times and check the step landed.
    ///
    /// A status reply settles the outcome at once, matching or not.  Only
    /// poll errors are retried.
    pub(crate) fn verify_setup_step(&mut self, step: SetupStep, tries: u8) -> SetupActionResult {
        let expected = step.expected();
        let mut outcome = SetupActionResult::VerificationFailure(CommandError::communication());

        for attempt in 1..=tries {
            let Some(current) = self.state.as_ref().map(|s| s.setup_progress()) else {
                warn!("setup: session cleared during {}", step.name());
                return SetupActionResult::session_gone();
            };

            let status = match self.send(PodCommand::GetStatus) {
                Ok(Response::Status(status)) => status,
                Ok(other) => {
                    warn!("setup: attempt {attempt}: unexpected reply {other:?}");
                    outcome = SetupActionResult::VerificationFailure(CommandError::new(
                        CommandErrorKind::Other,
                    ));
                    continue;
                }
                Err(e) => {
                    warn!("setup: attempt {attempt}/{tries} for {} failed: {e}", step.name());
                    outcome = SetupActionResult::VerificationFailure(e);
                    continue;
                }
            };

            if let Some(reached) = step.reconcile(current, &status) {
                self.set_setup_progress(reached);
            }
            let actual = self
                .state
                .as_ref()
                .map_or(current, |s| s.setup_progress());
            return if actual == expected {
                info!("setup: {} verified", step.name());
                SetupActionResult::Success
            } else {
                warn!(
                    "setup: {} not confirmed, pod at {} ({:?})",
                    step.name(),
                    actual,
                    status.pod_progress
                );
                SetupActionResult::Failure(actual)
            };
        }
        outcome
    }
}

// ── Setup task handle ────────────────────────────────────────

/// A setup step waiting out its delivery time before verification.
pub struct SetupTask {
    expected: SetupProgress,
    delay: Duration,
    slot: Arc<CompletionSlot<SetupActionResult>>,
    task: TaskHandle,
}

impl SetupTask {
    /// Progress the step should reach.
    pub fn expected(&self) -> SetupProgress {
        self.expected
    }

    /// Wait scheduled before verification.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn try_result(&self) -> Option<SetupActionResult> {
        self.slot.peek()
    }

    /// Block until verification has run.
    pub fn wait(&self) -> SetupActionResult {
        self.slot.wait_blocking()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<SetupActionResult> {
        self.slot.wait_timeout(timeout)
    }

    /// Wait and convert the outcome into a `Result`.
    pub fn finish(self) -> Result<()> {
        let expected = self.expected;
        self.wait().into_result(expected)
    }

    /// Abandon the pending verification.  The step itself was already sent
    /// and is not undone; nothing will resolve this task afterwards.
    pub fn cancel(self) {
        self.task.cancel();
    }
}

// ── PodManager operations ────────────────────────────────────

impl<E, S> PodManager<E, S>
where
    E: CommandExecutor + Send + 'static,
    S: SessionStore + Send + 'static,
{
    /// Pair (if needed) and start priming.
    pub fn pair_and_prime(&self) -> Result<SetupTask> {
        let mut core = self.shared.lock_core();
        if core.state.is_none() {
            core.pair()?;
        }
        let progress = core.session()?.setup_progress();
        if !progress.is_before(SetupProgress::PrimingFinished) {
            return Err(Error::OutOfSequence {
                expected: SetupProgress::AddressAssigned,
                actual: Some(progress),
            });
        }

        let delay = self.shared.config.priming_delay();
        let pending = self.arm_setup_step(SetupStep::Priming, delay)?;
        if let Err(e) = core.send(PodCommand::Prime) {
            pending.abort();
            return Err(e.into());
        }
        core.set_setup_progress(SetupProgress::Priming);
        info!("setup: priming, verifying in {}ms", delay.as_millis());
        Ok(pending.start())
    }

    /// Program `schedule` and insert the cannula.
    pub fn insert_cannula(&self, schedule: BasalSchedule) -> Result<SetupTask> {
        let mut core = self.shared.lock_core();
        let actual = core.state.as_ref().map(|s| s.setup_progress());
        match actual {
            None => {
                return Err(Error::OutOfSequence {
                    expected: SetupProgress::PrimingFinished,
                    actual,
                });
            }
            Some(p) if p.is_before(SetupProgress::PrimingFinished) => {
                return Err(Error::OutOfSequence {
                    expected: SetupProgress::PrimingFinished,
                    actual,
                });
            }
            Some(p) if p.is_after(SetupProgress::CannulaInserting) => {
                return Err(Error::OutOfSequence {
                    expected: SetupProgress::CannulaInserting,
                    actual,
                });
            }
            Some(_) => {}
        }

        let tz = core.session()?.timezone();
        let offset_secs = self.shared.clock.local_seconds_of_day(tz);
        let delay = self.shared.config.cannula_insertion_delay();
        let pending = self.arm_setup_step(SetupStep::CannulaInsertion, delay)?;
        if let Err(e) = core.send(PodCommand::InsertCannula {
            schedule: schedule.clone(),
            offset_secs,
        }) {
            pending.abort();
            return Err(e.into());
        }
        if let Some(state) = core.state.as_mut() {
            state.set_basal_schedule(schedule, offset_secs);
        }
        core.set_setup_progress(SetupProgress::CannulaInserting);
        core.persist();
        info!("setup: inserting cannula, verifying in {}ms", delay.as_millis());
        Ok(pending.start())
    }

    /// Spawn the verification task, held back until [`PendingStep::start`].
    fn arm_setup_step(&self, step: SetupStep, delay: Duration) -> Result<PendingStep> {
        let slot = Arc::new(CompletionSlot::new());
        let gate = Arc::new(CompletionSlot::new());
        let job = SetupJob {
            shared: Arc::downgrade(&self.shared),
            step,
            delay,
            tries: self.shared.config.verification_tries,
            gate: Arc::clone(&gate),
            slot: Arc::clone(&slot),
        };
        let task = task::spawn("setup-verify", move |token| job.run(token)).map_err(|e| {
            warn!("setup: cannot spawn verification: {e}");
            Error::TaskSpawn
        })?;
        Ok(PendingStep {
            gate,
            task: SetupTask {
                expected: step.expected(),
                delay,
                slot,
                task,
            },
        })
    }
}

struct PendingStep {
    gate: Arc<CompletionSlot<()>>,
    task: SetupTask,
}

impl PendingStep {
    fn start(self) -> SetupTask {
        if self.gate.fulfill(()).is_err() {
            debug!("setup: verification gate already open");
        }
        self.task
    }

    fn abort(self) {
        self.task.cancel();
    }
}

struct SetupJob<E, S> {
    shared: Weak<Shared<E, S>>,
    step: SetupStep,
    delay: Duration,
    tries: u8,
    gate: Arc<CompletionSlot<()>>,
    slot: Arc<CompletionSlot<SetupActionResult>>,
}

impl<E, S> SetupJob<E, S>
where
    E: CommandExecutor + Send + 'static,
    S: SessionStore + Send + 'static,
{
    async fn run(self, token: CancelToken) {
        self.gate.wait().await;
        if !task::sleep(&token, self.delay).await {
            return;
        }
        let result = match self.shared.upgrade() {
            Some(shared) => {
                let mut core = shared.lock_core();
                core.verify_setup_step(self.step, self.tries)
            }
            None => {
                warn!("setup: manager dropped before {} was verified", self.step.name());
                SetupActionResult::session_gone()
            }
        };
        if self.slot.fulfill(result).is_err() {
            warn!("setup: {} result already published", self.step.name());
        }
    }
}
