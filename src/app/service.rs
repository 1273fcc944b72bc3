//! Pod manager: the orchestration core.
//!
//! [`PodManager`] owns the session state and every port.  All top-level
//! operations run under a single monitor, so exactly one command exchange
//! is in flight at a time and session mutations are serialized.  Setup
//! verification and bolus tracking run on background tasks that re-enter
//! the monitor only for their own status polls.
//!
//! ```text
//!  caller ──▶ ┌──────────────────────────────┐ ──▶ CommandExecutor
//!             │  PodManager (monitor)        │ ──▶ SessionStore
//!  tasks  ──▶ │  SessionState · ActiveBolus  │ ──▶ EventSink
//!             └──────────────────────────────┘
//! ```

use core::cell::RefCell;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, error, info, warn};

use crate::config::PodConfig;
use crate::error::{CommandError, CommandErrorKind, Error, Result};
use crate::pod::schedule::{BasalSchedule, TempBasal};
use crate::pod::state::SessionState;
use crate::pod::{DeliveryTypes, PodInfoType, SetupProgress};

use super::bolus::ActiveBolus;
use super::commands::{CommandEnvelope, PodCommand};
use super::events::PodEvent;
use super::ports::{Clock, CommandExecutor, EventSink, SessionStore};
use super::responses::{PodInfoResponse, Response, StatusResponse};
use super::verify::{self, CommandChannel};

// ───────────────────────────────────────────────────────────────
// Session core (everything behind the monitor)
// ───────────────────────────────────────────────────────────────

pub(crate) struct Core<E, S> {
    executor: E,
    store: S,
    sink: Box<dyn EventSink + Send>,
    clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) state: Option<SessionState>,
}

impl<E: CommandExecutor, S: SessionStore> Core<E, S> {
    pub(crate) fn session(&self) -> Result<&SessionState> {
        self.state.as_ref().ok_or(Error::NoActiveSession)
    }

    pub(crate) fn require_ready(&self) -> Result<&SessionState> {
        match self.state.as_ref() {
            Some(state) if state.is_ready_for_delivery() => Ok(state),
            other => Err(Error::NotReady {
                actual: other.map(SessionState::setup_progress),
            }),
        }
    }

    pub(crate) fn emit(&mut self, event: PodEvent) {
        self.sink.emit(&event);
    }

    /// Save the session.  A failed save is logged, not surfaced: the pod
    /// has already acted on whatever changed.
    pub(crate) fn persist(&mut self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        if let Err(e) = self.store.save(state) {
            error!("session: save failed: {e}");
        }
    }

    pub(crate) fn set_setup_progress(&mut self, progress: SetupProgress) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let from = state.setup_progress();
        if state.advance_setup_progress(progress) {
            info!("session: setup {from} -> {progress}");
            self.emit(PodEvent::SetupProgressChanged { from, to: progress });
            self.persist();
        }
    }

    /// Drop the session and the persisted copy.  The in-memory session is
    /// gone even when the store cannot be cleared.
    pub(crate) fn clear_session(&mut self) -> Result<()> {
        if self.state.take().is_some() {
            info!("session: cleared");
            self.emit(PodEvent::SessionCleared);
        }
        self.store.clear().map_err(|e| {
            error!("session: clearing stored copy failed: {e}");
            Error::Storage(e)
        })
    }

    fn apply_status(&mut self, status: &StatusResponse) {
        let at_ms = self.clock.now().as_millis();
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let from = state.delivery_status();
        if state.apply_status(status, at_ms) {
            let to = status.delivery_status;
            debug!("session: delivery {from} -> {to}");
            self.emit(PodEvent::DeliveryStatusChanged { from, to });
        }
    }

    /// Pair with an unaddressed pod and start a new session.
    pub(crate) fn pair(&mut self) -> Result<()> {
        match self.send(PodCommand::AssignAddress)? {
            Response::Paired(pair) => {
                let tz = self.clock.utc_offset();
                info!(
                    "session: paired address={:#010x} lot={} tid={}",
                    pair.address, pair.lot, pair.tid
                );
                self.state = Some(SessionState::new(
                    pair.address,
                    pair.lot,
                    pair.tid,
                    pair.nonce_seed,
                    tz,
                ));
                self.emit(PodEvent::SessionCreated {
                    address: pair.address,
                });
                self.persist();
                Ok(())
            }
            other => {
                warn!("session: unexpected pairing reply {other:?}");
                Err(CommandError::new(CommandErrorKind::Other).into())
            }
        }
    }

    pub(crate) fn fetch_status(&mut self) -> Result<StatusResponse> {
        let response = self.send(PodCommand::GetStatus)?;
        expect_status(&response)
    }
}

fn expect_status(response: &Response) -> Result<StatusResponse> {
    response.status().copied().ok_or_else(|| {
        warn!("session: expected status reply, got {response:?}");
        Error::CertainCommandFailure(CommandError::certain(CommandErrorKind::Other))
    })
}

impl<E: CommandExecutor, S: SessionStore> CommandChannel for Core<E, S> {
    /// One exchange with nonce bookkeeping:
    ///
    /// 1. a nonce-bearing command consumes the predicted nonce
    /// 2. a certain failure hands the nonce back (the pod never saw it)
    /// 3. a resync value from the pod overrides the prediction
    /// 4. status replies are folded into the session, which is then saved
    fn send(&mut self, command: PodCommand) -> core::result::Result<Response, CommandError> {
        let (address, nonce) = match self.state.as_mut() {
            Some(state) => (
                Some(state.address()),
                command.uses_nonce().then(|| state.take_nonce()),
            ),
            None => (None, None),
        };
        let name = command.name();
        let envelope = CommandEnvelope {
            command,
            address,
            nonce,
        };

        debug!("exchange: {name} nonce={nonce:?}");
        let result = self.executor.execute(&envelope);

        match &result {
            Ok(response) => {
                if let Some(status) = response.status() {
                    self.apply_status(status);
                }
            }
            Err(e) => {
                debug!("exchange: {name} failed: {e}");
                if let Some(state) = self.state.as_mut() {
                    if let (true, Some(sent)) = (e.certain, nonce) {
                        state.resync_nonce(sent);
                    }
                    if let CommandErrorKind::NonceOutOfSync {
                        resync: Some(expected),
                    } = e.kind
                    {
                        info!("exchange: resyncing nonce to {expected}");
                        state.resync_nonce(expected);
                    }
                }
            }
        }
        self.persist();
        result
    }
}

// ───────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────

pub(crate) struct Shared<E, S> {
    core: Mutex<Core<E, S>>,
    /// Active bolus record.  Never held across a command exchange.
    pub(crate) bolus: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<ActiveBolus>>>,
    pub(crate) config: PodConfig,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) next_bolus_id: AtomicU64,
}

impl<E, S> Shared<E, S> {
    /// Enter the monitor.  A panic on another holder does not brick the
    /// session, so poisoning is ignored.
    pub(crate) fn lock_core(&self) -> MutexGuard<'_, Core<E, S>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ───────────────────────────────────────────────────────────────
// PodManager
// ───────────────────────────────────────────────────────────────

/// Session orchestrator for one pod.
///
/// Cheap to clone; clones share the same session and monitor.
pub struct PodManager<E, S> {
    pub(crate) shared: Arc<Shared<E, S>>,
}

impl<E, S> Clone for PodManager<E, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E, S> PodManager<E, S>
where
    E: CommandExecutor + Send + 'static,
    S: SessionStore + Send + 'static,
{
    /// Build the orchestrator, resuming any session found in `store`.
    pub fn new(
        executor: E,
        store: S,
        sink: impl EventSink + Send + 'static,
        clock: Arc<dyn Clock + Send + Sync>,
        config: PodConfig,
    ) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;
        let state = store.load()?;
        match &state {
            Some(s) => info!(
                "PodManager: resumed session address={:#010x} setup={}",
                s.address(),
                s.setup_progress()
            ),
            None => info!("PodManager: no saved session"),
        }

        let core = Core {
            executor,
            store,
            sink: Box::new(sink),
            clock: Arc::clone(&clock),
            state,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                bolus: BlockingMutex::new(RefCell::new(None)),
                config,
                clock,
                next_bolus_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &PodConfig {
        &self.shared.config
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn is_ready_for_delivery(&self) -> bool {
        self.shared
            .lock_core()
            .state
            .as_ref()
            .is_some_and(SessionState::is_ready_for_delivery)
    }

    /// Snapshot of the session.  Changes to the copy do not reach the pod.
    pub fn session(&self) -> Option<SessionState> {
        self.shared.lock_core().state.clone()
    }

    /// Session as JSON for diagnostics; `"null"` without a session.
    pub fn session_json(&self) -> String {
        let core = self.shared.lock_core();
        serde_json::to_string(&core.state).unwrap_or_else(|e| {
            error!("session: JSON encoding failed: {e}");
            String::from("null")
        })
    }

    /// Fetch a fresh status.  Works at any setup stage.
    pub fn get_pod_status(&self) -> Result<StatusResponse> {
        let mut core = self.shared.lock_core();
        core.session()?;
        core.fetch_status()
    }

    pub fn get_pod_info(&self, kind: PodInfoType) -> Result<PodInfoResponse> {
        let mut core = self.shared.lock_core();
        core.require_ready()?;
        match core.send(PodCommand::GetPodInfo(kind))? {
            Response::PodInfo(info) => Ok(info),
            other => {
                warn!("PodManager: expected pod info, got {other:?}");
                Err(Error::CertainCommandFailure(CommandError::certain(
                    CommandErrorKind::Other,
                )))
            }
        }
    }

    // ── Delivery operations ───────────────────────────────────

    /// Acknowledge every pending alert.
    pub fn acknowledge_alerts(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        let alerts = core.require_ready()?.active_alerts();
        core.send(PodCommand::AcknowledgeAlerts(alerts))?;
        if let Some(state) = core.state.as_mut() {
            state.clear_alerts(alerts);
        }
        core.persist();
        info!("PodManager: acknowledged {} alert(s)", alerts.len());
        Ok(())
    }

    /// Program a new basal schedule starting at the current local time.
    pub fn set_basal_schedule(&self, schedule: BasalSchedule) -> Result<()> {
        let mut core = self.shared.lock_core();
        let tz = core.require_ready()?.timezone();
        let offset_secs = self.shared.clock.local_seconds_of_day(tz);
        core.send(PodCommand::SetBasalSchedule {
            schedule: schedule.clone(),
            offset_secs,
            resume: false,
            beep: true,
        })?;
        if let Some(state) = core.state.as_mut() {
            state.set_basal_schedule(schedule, offset_secs);
        }
        core.persist();
        info!("PodManager: basal schedule set at offset {offset_secs}s");
        Ok(())
    }

    /// Start a temporary basal.  Verified: a lost reply must not leave the
    /// caller guessing whether the temp basal is running.
    pub fn set_temporary_basal(&self, rate: f64, duration_minutes: u16) -> Result<()> {
        let temp = TempBasal::new(rate, duration_minutes)
            .map_err(|_| Error::InvalidArgument("temp basal rate or duration out of range"))?;
        let mut core = self.shared.lock_core();
        core.require_ready()?;
        verify::execute_and_verify(&mut *core, PodCommand::SetTempBasal { temp, beep: true })?;
        info!("PodManager: temp basal {rate} U/h for {duration_minutes} min");
        Ok(())
    }

    pub fn cancel_temporary_basal(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        core.require_ready()?;
        core.send(PodCommand::CancelDelivery {
            types: DeliveryTypes::TEMP_BASAL,
            beep: true,
        })?;
        info!("PodManager: temp basal cancelled");
        Ok(())
    }

    /// Stop all delivery.
    pub fn suspend_delivery(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        core.require_ready()?;
        core.send(PodCommand::CancelDelivery {
            types: DeliveryTypes::ALL,
            beep: true,
        })?;
        info!("PodManager: delivery suspended");
        Ok(())
    }

    /// Re-apply the stored basal schedule at the current local time.
    pub fn resume_delivery(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        core.require_ready()?;
        self.resume_basal(&mut core, true)?;
        info!("PodManager: delivery resumed");
        Ok(())
    }

    /// Re-align the pod with the host's timezone.
    ///
    /// Delivery is suspended, then resumed on the new local time.  If the
    /// resume fails, delivery stays suspended and the error is returned.
    pub fn sync_time(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        core.require_ready()?;
        core.send(PodCommand::CancelDelivery {
            types: DeliveryTypes::ALL,
            beep: false,
        })?;

        let tz = self.shared.clock.utc_offset();
        if let Some(state) = core.state.as_mut() {
            state.set_timezone(tz);
        }
        core.persist();

        self.resume_basal(&mut core, true)?;
        info!("PodManager: time synced to {tz}");
        Ok(())
    }

    /// Deactivate the pod.  The session is cleared even when the command
    /// fails; the pod cannot be driven any further either way.
    pub fn deactivate(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        core.session()?;
        let outcome = core.send(PodCommand::Deactivate);
        if let Err(e) = &outcome {
            warn!("PodManager: deactivation failed ({e}), clearing session anyway");
        }
        self.abandon_bolus(&mut core);
        let cleared = core.clear_session();
        // The pod's answer matters more to the caller than the store's.
        outcome?;
        cleared?;
        info!("PodManager: pod deactivated");
        Ok(())
    }

    /// Forget the session without talking to the pod.
    pub fn reset_session(&self) -> Result<()> {
        let mut core = self.shared.lock_core();
        self.abandon_bolus(&mut core);
        core.clear_session()
    }

    // ── Internal ──────────────────────────────────────────────

    fn resume_basal(&self, core: &mut Core<E, S>, beep: bool) -> Result<()> {
        let state = core.require_ready()?;
        let schedule = state
            .basal_schedule()
            .cloned()
            .ok_or(Error::InvalidArgument("no basal schedule stored"))?;
        let offset_secs = self.shared.clock.local_seconds_of_day(state.timezone());
        core.send(PodCommand::SetBasalSchedule {
            schedule,
            offset_secs,
            resume: true,
            beep,
        })?;
        if let Some(state) = core.state.as_mut() {
            state.set_schedule_offset(offset_secs);
        }
        core.persist();
        Ok(())
    }
}
