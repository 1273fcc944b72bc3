//! Simulated pod.
//!
//! Implements [`CommandExecutor`] with an in-process model of the pod:
//! nonce checking, activation stages and time-based delivery.  Radio
//! faults can be injected to exercise command verification.
//!
//! The handle is cheap to clone; clones drive the same simulated pod, so a
//! test or the simulator binary can keep one to inject faults after the
//! executor has been handed to the orchestrator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use embassy_time::{Duration, Instant};
use log::{debug, info};

use crate::app::commands::{CommandEnvelope, PodCommand};
use crate::app::ports::CommandExecutor;
use crate::app::responses::{PairResponse, PodInfoResponse, Response, StatusResponse};
use crate::config::PodConfig;
use crate::error::{CommandError, CommandErrorKind};
use crate::pod::{AlertSet, DeliveryStatus, DeliveryTypes, Nonce, PodProgress};

const SIM_ADDRESS: u32 = 0x1f0e_89f0;
const SIM_LOT: u32 = 44_147;
const SIM_TID: u32 = 1_100_256;
const SIM_NONCE_SEED: u32 = 0x8c61_ee59;
/// Alert slot raised once the pod has been running.
const LOW_RESERVOIR_SLOT: u8 = 4;

/// One-shot radio fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioFault {
    /// The command never reaches the pod.
    LoseCommand,
    /// The pod executes the command but the reply is lost.
    LoseReply,
}

#[derive(Debug)]
struct SimPod {
    config: PodConfig,
    address: Option<u32>,
    expected_nonce: Nonce,
    progress: PodProgress,
    stage_done_at: Option<Instant>,
    basal_active: bool,
    temp_basal_until: Option<Instant>,
    bolus_until: Option<Instant>,
    bolus_units: f64,
    bolus_started: Option<Instant>,
    delivered: f64,
    alerts: AlertSet,
    activated_at: Option<Instant>,
    faults: VecDeque<RadioFault>,
    commands_seen: u32,
}

/// Cloneable handle to a simulated pod.
#[derive(Debug, Clone)]
pub struct SimulatedPod {
    inner: Arc<Mutex<SimPod>>,
}

impl SimulatedPod {
    /// New unpaired pod whose delivery rates follow `config`.
    pub fn new(config: &PodConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimPod {
                config: config.clone(),
                address: None,
                expected_nonce: Nonce::new(SIM_NONCE_SEED),
                progress: PodProgress::PairingSuccess,
                stage_done_at: None,
                basal_active: false,
                temp_basal_until: None,
                bolus_until: None,
                bolus_units: 0.0,
                bolus_started: None,
                delivered: 0.0,
                alerts: AlertSet::EMPTY,
                activated_at: None,
                faults: VecDeque::new(),
                commands_seen: 0,
            })),
        }
    }

    /// Queue a fault for an upcoming exchange.
    pub fn inject(&self, fault: RadioFault) {
        self.lock().faults.push_back(fault);
    }

    /// Raise an alert in `slot` (0–7).
    pub fn raise_alert(&self, slot: u8) {
        let mut pod = self.lock();
        if let Some(alerts) = pod.alerts.with_slot(slot) {
            pod.alerts = alerts;
        }
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        let mut pod = self.lock();
        pod.refresh(Instant::now());
        pod.delivery_status()
    }

    pub fn pod_progress(&self) -> PodProgress {
        let mut pod = self.lock();
        pod.refresh(Instant::now());
        pod.progress
    }

    /// Units delivered since activation, including bolus in progress.
    pub fn insulin_delivered(&self) -> f64 {
        let mut pod = self.lock();
        pod.refresh(Instant::now());
        pod.delivered
    }

    /// Commands that reached the pod (lost commands are not counted).
    pub fn commands_seen(&self) -> u32 {
        self.lock().commands_seen
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimPod> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandExecutor for SimulatedPod {
    fn execute(&mut self, envelope: &CommandEnvelope) -> Result<Response, CommandError> {
        let mut pod = self.lock();
        let fault = pod.faults.pop_front();
        if fault == Some(RadioFault::LoseCommand) {
            debug!("sim: {} lost on the way out", envelope.command.name());
            return Err(CommandError::communication());
        }

        pod.commands_seen += 1;
        let now = Instant::now();
        pod.refresh(now);
        let response = pod.handle(envelope, now)?;

        if fault == Some(RadioFault::LoseReply) {
            debug!("sim: reply to {} lost", envelope.command.name());
            return Err(CommandError::communication());
        }
        Ok(response)
    }
}

impl SimPod {
    fn duration(units: f64, rate: f64) -> Duration {
        Duration::from_millis((units / rate * 1000.0).round() as u64)
    }

    /// Advance time-based state to `now`.
    fn refresh(&mut self, now: Instant) {
        if self.stage_done_at.is_some_and(|at| now >= at) {
            self.stage_done_at = None;
            self.progress = match self.progress {
                PodProgress::Priming => PodProgress::PrimingCompleted,
                PodProgress::InsertingCannula => {
                    self.activated_at = Some(now);
                    PodProgress::Running
                }
                other => other,
            };
        }
        if self.temp_basal_until.is_some_and(|at| now >= at) {
            self.temp_basal_until = None;
        }
        if self.bolus_until.is_some_and(|at| now >= at) {
            self.bolus_until = None;
            self.bolus_started = None;
            self.delivered += self.bolus_units;
            self.bolus_units = 0.0;
        }
    }

    fn delivery_status(&self) -> DeliveryStatus {
        let temp = self.temp_basal_until.is_some();
        match (self.bolus_until.is_some(), temp) {
            _ if self.progress == PodProgress::Priming => DeliveryStatus::Priming,
            (true, true) => DeliveryStatus::BolusAndTempBasal,
            (true, false) => DeliveryStatus::BolusInProgress,
            (false, true) => DeliveryStatus::TempBasalRunning,
            (false, false) if self.basal_active => DeliveryStatus::Normal,
            (false, false) => DeliveryStatus::Suspended,
        }
    }

    fn status(&self, now: Instant) -> Response {
        let minutes_active = self
            .activated_at
            .map_or(0, |at| now.saturating_duration_since(at).as_secs() / 60);
        Response::Status(StatusResponse {
            delivery_status: self.delivery_status(),
            pod_progress: self.progress,
            alerts: self.alerts,
            insulin_delivered: self.delivered,
            minutes_active: minutes_active.min(u64::from(u16::MAX)) as u16,
        })
    }

    fn reject(kind: CommandErrorKind) -> CommandError {
        // The pod answered; it certainly did not act.
        CommandError::certain(kind)
    }

    fn handle(&mut self, envelope: &CommandEnvelope, now: Instant) -> Result<Response, CommandError> {
        let command = &envelope.command;

        if command.uses_nonce() {
            if envelope.nonce != Some(self.expected_nonce) {
                debug!(
                    "sim: nonce {:?} rejected, expecting {}",
                    envelope.nonce, self.expected_nonce
                );
                return Err(CommandError::nonce_out_of_sync(Some(self.expected_nonce)));
            }
            self.expected_nonce = self.expected_nonce.next();
        }

        match command {
            PodCommand::AssignAddress => {
                if self.address.is_some() {
                    return Err(Self::reject(CommandErrorKind::IllegalSetupProgress));
                }
                self.address = Some(SIM_ADDRESS);
                info!("sim: paired as {SIM_ADDRESS:#010x}");
                return Ok(Response::Paired(PairResponse {
                    address: SIM_ADDRESS,
                    lot: SIM_LOT,
                    tid: SIM_TID,
                    nonce_seed: self.expected_nonce,
                }));
            }
            PodCommand::Prime => {
                if self.progress != PodProgress::PairingSuccess {
                    return Err(Self::reject(CommandErrorKind::IllegalSetupProgress));
                }
                self.progress = PodProgress::Priming;
                self.stage_done_at = Some(
                    now + Self::duration(self.config.prime_units, self.config.priming_rate),
                );
                self.delivered += self.config.prime_units;
            }
            PodCommand::InsertCannula { .. } => {
                if self.progress != PodProgress::PrimingCompleted {
                    return Err(Self::reject(CommandErrorKind::IllegalSetupProgress));
                }
                self.progress = PodProgress::InsertingCannula;
                self.stage_done_at = Some(
                    now + Self::duration(
                        self.config.cannula_insertion_units,
                        self.config.cannula_insertion_rate,
                    ),
                );
                self.basal_active = true;
                self.delivered += self.config.cannula_insertion_units;
            }
            PodCommand::GetStatus => {}
            PodCommand::GetPodInfo(kind) => {
                return Ok(Response::PodInfo(PodInfoResponse {
                    kind: *kind,
                    payload: vec![*kind as u8, self.progress as u8, self.alerts.bits()],
                }));
            }
            PodCommand::AcknowledgeAlerts(alerts) => {
                self.alerts = self.alerts.without(*alerts);
            }
            PodCommand::SetBasalSchedule { .. } => {
                self.require_running()?;
                self.basal_active = true;
            }
            PodCommand::SetTempBasal { temp, .. } => {
                self.require_running()?;
                self.temp_basal_until =
                    Some(now + Duration::from_secs(u64::from(temp.duration_minutes) * 60));
            }
            PodCommand::Bolus { units, .. } => {
                self.require_running()?;
                if self.bolus_until.is_some() {
                    return Err(Self::reject(CommandErrorKind::IllegalDeliveryStatus));
                }
                self.bolus_units = *units;
                self.bolus_started = Some(now);
                self.bolus_until = Some(now + Self::duration(*units, self.config.bolus_rate));
                if self.delivered > 50.0 {
                    if let Some(alerts) = self.alerts.with_slot(LOW_RESERVOIR_SLOT) {
                        self.alerts = alerts;
                    }
                }
            }
            PodCommand::CancelDelivery { types, .. } => {
                if types.contains(DeliveryTypes::BOLUS) {
                    if let (Some(started), Some(until)) = (self.bolus_started, self.bolus_until) {
                        let total = until.saturating_duration_since(started).as_millis().max(1);
                        let done = now.saturating_duration_since(started).as_millis();
                        self.delivered += self.bolus_units * done as f64 / total as f64;
                    }
                    self.bolus_until = None;
                    self.bolus_started = None;
                    self.bolus_units = 0.0;
                }
                if types.contains(DeliveryTypes::TEMP_BASAL) {
                    self.temp_basal_until = None;
                }
                if types.contains(DeliveryTypes::BASAL) {
                    self.basal_active = false;
                }
            }
            PodCommand::Deactivate => {
                self.progress = PodProgress::Inactive;
                self.basal_active = false;
                self.temp_basal_until = None;
                self.bolus_until = None;
            }
        }
        Ok(self.status(now))
    }

    fn require_running(&self) -> Result<(), CommandError> {
        if self.progress.is_running() {
            Ok(())
        } else {
            Err(Self::reject(CommandErrorKind::IllegalSetupProgress))
        }
    }
}
