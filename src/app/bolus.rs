//! Bolus lifecycle.
//!
//! A bolus is delivered by the pod at a fixed rate over tens of seconds and
//! cannot be observed while it runs.  The orchestrator therefore tracks it
//! by time:
//!
//! ```text
//!  bolus() ──▶ command ok ──▶ ActiveBolus{id} ──▶ gate opens
//!                                                   │
//!                       ┌───────────────────────────┴───────────┐
//!                       ▼                                       ▼
//!            20 progress reports over            sleep(remaining), then poll
//!            the remaining duration              status ≤ N times, resolve
//!                                                                │
//!  cancel_bolus() ── cancel command ── take record ── resolve ◀─┘ (first wins)
//! ```
//!
//! The record lives in its own lock and is only ever *taken* (never copied)
//! by the party that resolves it, so exactly one of completion and
//! cancellation reaches the slot.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use embassy_time::{Duration, Instant};
use futures_lite::future;
use log::{debug, info, warn};

use crate::config::PodConfig;
use crate::error::{Error, Result};
use crate::pod::{DeliveryStatus, DeliveryTypes};
use crate::task::{self, CancelToken, CompletionSlot, TaskHandle};

use super::commands::PodCommand;
use super::events::PodEvent;
use super::ports::{Clock, CommandExecutor, SessionStore};
use super::responses::Response;
use super::service::{Core, PodManager, Shared};
use super::verify::{self, CommandChannel};

/// Progress callback: `(estimated_units_delivered, percent_complete)`.
pub type ProgressCallback = Box<dyn FnMut(f64, u8) + Send>;

/// Final outcome of one bolus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusResult {
    pub units_delivered: f64,
}

// ── Estimation ───────────────────────────────────────────────

/// Round to a whole number of pump pulses.
pub fn round_to_pulses(units: f64, pulse_size: f64) -> f64 {
    let divisor = (1.0 / pulse_size).round();
    (units * divisor).round() / divisor
}

/// Linear estimate of what the pod has delivered by `now`.
///
/// Never exceeds the requested units (after pulse rounding) and never
/// decreases as `now` advances.  `now` before `start` counts as zero.
pub fn estimate_units_delivered(units: f64, start: Instant, now: Instant, config: &PodConfig) -> f64 {
    let elapsed_ms = now.saturating_duration_since(start).as_millis() as f64;
    let total_ms = (units / config.bolus_rate * 1000.0).trunc();
    let factor = if total_ms > 0.0 {
        elapsed_ms / total_ms
    } else {
        1.0
    };
    round_to_pulses(factor.min(1.0) * units, config.pulse_size)
}

// ── Active bolus record ──────────────────────────────────────

pub(crate) struct ActiveBolus {
    id: u64,
    units: f64,
    start_time: Instant,
    task: TaskHandle,
    slot: Arc<CompletionSlot<BolusResult>>,
}

impl ActiveBolus {
    /// Stop the background task and publish `result`.
    fn resolve(self, result: BolusResult) {
        self.task.cancel();
        if self.slot.fulfill(result).is_err() {
            warn!("bolus {}: already resolved, dropping {result:?}", self.id);
        }
    }
}

/// Caller's view of a running bolus.
///
/// Resolves exactly once, with the full requested units on completion or
/// with the delivered estimate on cancellation.
pub struct BolusHandle {
    units_requested: f64,
    slot: Arc<CompletionSlot<BolusResult>>,
}

impl BolusHandle {
    pub fn units_requested(&self) -> f64 {
        self.units_requested
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    pub fn try_result(&self) -> Option<BolusResult> {
        self.slot.peek()
    }

    /// Block until the bolus resolves.
    pub fn wait(&self) -> BolusResult {
        self.slot.wait_blocking()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<BolusResult> {
        self.slot.wait_timeout(timeout)
    }

    /// Await the result from async code.
    pub async fn result(&self) -> BolusResult {
        self.slot.wait().await
    }
}

// ── Shared-record helpers ────────────────────────────────────

impl<E, S> Shared<E, S> {
    fn has_bolus(&self) -> bool {
        self.bolus.lock(|cell| cell.borrow().is_some())
    }

    fn is_active_bolus(&self, id: u64) -> bool {
        self.bolus
            .lock(|cell| cell.borrow().as_ref().is_some_and(|b| b.id == id))
    }

    /// Take the record if it is still the bolus `id`.
    fn take_bolus(&self, id: u64) -> Option<ActiveBolus> {
        self.bolus.lock(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.as_ref().is_some_and(|b| b.id == id) {
                slot.take()
            } else {
                None
            }
        })
    }

    fn take_any_bolus(&self) -> Option<ActiveBolus> {
        self.bolus.lock(|cell| cell.borrow_mut().take())
    }
}

/// The last manager handle is gone: nothing will poll or cancel the
/// running bolus any more, so its handle resolves with the estimate now.
impl<E, S> Drop for Shared<E, S> {
    fn drop(&mut self) {
        let Some(active) = self.take_any_bolus() else {
            return;
        };
        let estimate =
            estimate_units_delivered(active.units, active.start_time, self.clock.now(), &self.config);
        warn!("bolus {}: manager dropped, resolving with ~{estimate} U", active.id);
        active.resolve(BolusResult {
            units_delivered: estimate,
        });
    }
}

// ── PodManager operations ────────────────────────────────────

impl<E, S> PodManager<E, S>
where
    E: CommandExecutor + Send + 'static,
    S: SessionStore + Send + 'static,
{
    /// Full delivery time for a bolus of `units`.
    pub fn calculate_bolus_duration(&self, units: f64) -> Duration {
        self.shared.config.bolus_duration(units)
    }

    pub fn has_active_bolus(&self) -> bool {
        self.shared.has_bolus()
    }

    /// Start a bolus of `units`.
    ///
    /// The command runs through verification; once accepted, delivery is
    /// tracked in the background and `progress` (if any) receives up to
    /// `bolus_progress_reports` estimates.
    pub fn bolus(&self, units: f64, progress: Option<ProgressCallback>) -> Result<BolusHandle> {
        let config = &self.shared.config;
        let mut core = self.shared.lock_core();
        let actual = core.require_ready()?.delivery_status();
        if !(units > 0.0) || units > config.max_bolus {
            return Err(Error::InvalidArgument("bolus units out of range"));
        }
        if self.shared.has_bolus() {
            return Err(Error::IllegalDeliveryStatus {
                expected: DeliveryStatus::Normal,
                actual,
            });
        }

        let id = self.shared.next_bolus_id.fetch_add(1, Ordering::Relaxed);
        let total = config.bolus_duration(units);
        let remaining = total
            .checked_sub(config.command_round_trip())
            .unwrap_or(Duration::from_ticks(0));
        let slot = Arc::new(CompletionSlot::new());
        let gate: Arc<CompletionSlot<Instant>> = Arc::new(CompletionSlot::new());

        let job = BolusJob {
            shared: Arc::downgrade(&self.shared),
            clock: Arc::clone(&self.shared.clock),
            config: config.clone(),
            id,
            units,
            remaining,
            gate: Arc::clone(&gate),
            progress,
        };
        let task = task::spawn("bolus", move |token| job.run(token)).map_err(|e| {
            warn!("bolus: cannot spawn tracker: {e}");
            Error::TaskSpawn
        })?;

        if let Err(e) = verify::execute_and_verify(
            &mut *core,
            PodCommand::Bolus { units, beep: true },
        ) {
            task.cancel();
            return Err(e);
        }

        let start_time = self
            .shared
            .clock
            .now()
            .checked_sub(config.command_round_trip())
            .unwrap_or(Instant::from_ticks(0));
        info!(
            "bolus {id}: {units} U accepted, ~{}ms total, tracking for {}ms",
            total.as_millis(),
            remaining.as_millis()
        );
        self.shared.bolus.lock(|cell| {
            *cell.borrow_mut() = Some(ActiveBolus {
                id,
                units,
                start_time,
                task,
                slot: Arc::clone(&slot),
            });
        });
        core.emit(PodEvent::BolusStarted { units });
        // The record is in place; let the tracker run.
        if gate.fulfill(start_time).is_err() {
            debug!("bolus {id}: tracker gate already open");
        }

        Ok(BolusHandle {
            units_requested: units,
            slot,
        })
    }

    /// Cancel the running bolus and resolve it with the delivered estimate.
    ///
    /// If the cancel command fails, the bolus stays active and keeps its
    /// background tracking.
    pub fn cancel_bolus(&self) -> Result<BolusResult> {
        let mut core = self.shared.lock_core();
        let actual = core.require_ready()?.delivery_status();
        if !self.shared.has_bolus() {
            return Err(Error::IllegalDeliveryStatus {
                expected: DeliveryStatus::BolusInProgress,
                actual,
            });
        }

        verify::execute_and_verify(
            &mut *core,
            PodCommand::CancelDelivery {
                types: DeliveryTypes::BOLUS,
                beep: true,
            },
        )?;

        // Completion needs the monitor we hold, so the record is still ours.
        let Some(active) = self.shared.take_any_bolus() else {
            return Err(Error::IllegalDeliveryStatus {
                expected: DeliveryStatus::BolusInProgress,
                actual,
            });
        };
        let now = self.shared.clock.now();
        let result = BolusResult {
            units_delivered: estimate_units_delivered(
                active.units,
                active.start_time,
                now,
                &self.shared.config,
            ),
        };
        info!(
            "bolus {}: cancelled, ~{} of {} U delivered",
            active.id, result.units_delivered, active.units
        );
        active.resolve(result);
        core.emit(PodEvent::BolusFinished {
            units_delivered: result.units_delivered,
            cancelled: true,
        });
        Ok(result)
    }

    /// Resolve a running bolus with its estimate when the session ends.
    pub(crate) fn abandon_bolus(&self, core: &mut Core<E, S>) {
        let Some(active) = self.shared.take_any_bolus() else {
            return;
        };
        let estimate = estimate_units_delivered(
            active.units,
            active.start_time,
            self.shared.clock.now(),
            &self.shared.config,
        );
        warn!("bolus {}: session ending, resolving with ~{estimate} U", active.id);
        active.resolve(BolusResult {
            units_delivered: estimate,
        });
        core.emit(PodEvent::BolusFinished {
            units_delivered: estimate,
            cancelled: true,
        });
    }
}

// ── Background tracker ───────────────────────────────────────

struct BolusJob<E, S> {
    shared: Weak<Shared<E, S>>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: PodConfig,
    id: u64,
    units: f64,
    remaining: Duration,
    /// Opened with the start time once the record is stored.
    gate: Arc<CompletionSlot<Instant>>,
    progress: Option<ProgressCallback>,
}

impl<E, S> BolusJob<E, S>
where
    E: CommandExecutor + Send + 'static,
    S: SessionStore + Send + 'static,
{
    async fn run(mut self, token: CancelToken) {
        let start_time = self.gate.wait().await;
        let progress = self.progress.take();
        let reports = async {
            if let Some(callback) = progress {
                self.report_progress(&token, start_time, callback).await;
            }
        };
        let completion = async {
            if task::sleep(&token, self.remaining).await {
                self.complete();
            }
        };
        future::zip(reports, completion).await;
    }

    async fn report_progress(
        &self,
        token: &CancelToken,
        start_time: Instant,
        mut callback: ProgressCallback,
    ) {
        let reports = self.config.bolus_progress_reports;
        let interval_ms = self.remaining.as_millis() / u64::from(reports);
        for count in 1..=reports {
            if count > 1 && !task::sleep(token, Duration::from_millis(interval_ms)).await {
                return;
            }
            let estimate =
                estimate_units_delivered(self.units, start_time, self.clock.now(), &self.config);
            let percent = (f64::from(count) / f64::from(reports) * 100.0) as u8;
            callback(estimate, percent);
        }
    }

    /// Confirm the pod stopped bolusing, then resolve with the full dose.
    fn complete(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut core = shared.lock_core();
        if !shared.is_active_bolus(self.id) {
            debug!("bolus {}: already resolved before completion", self.id);
            return;
        }

        for attempt in 1..=self.config.verification_tries {
            match core.send(PodCommand::GetStatus) {
                Ok(Response::Status(status)) if !status.delivery_status.is_bolusing() => break,
                Ok(Response::Status(status)) => debug!(
                    "bolus {}: still {} on poll {attempt}",
                    self.id, status.delivery_status
                ),
                Ok(other) => debug!("bolus {}: ignoring reply {other:?}", self.id),
                Err(e) => debug!("bolus {}: ignoring poll error: {e}", self.id),
            }
        }

        if let Some(active) = shared.take_bolus(self.id) {
            let result = BolusResult {
                units_delivered: self.units,
            };
            info!("bolus {}: completed, {} U", self.id, self.units);
            active.resolve(result);
            core.emit(PodEvent::BolusFinished {
                units_delivered: self.units,
                cancelled: false,
            });
        }
    }
}
