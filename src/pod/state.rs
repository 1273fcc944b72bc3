//! Session state for one pod activation.
//!
//! `SessionState` is the orchestrator's record of what the pod last told
//! it.  It is created by pairing, updated from command responses, persisted
//! after every change, and destroyed on deactivation.  Callers outside the
//! orchestrator only ever receive clones.

use log::warn;
use serde::{Deserialize, Serialize};

use super::schedule::BasalSchedule;
use super::{AlertSet, DeliveryStatus, Nonce, PodProgress, SetupProgress, TimeZoneOffset};
use crate::app::responses::StatusResponse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    address: u32,
    lot: u32,
    tid: u32,
    setup_progress: SetupProgress,
    delivery_status: DeliveryStatus,
    pod_progress: Option<PodProgress>,
    basal_schedule: Option<BasalSchedule>,
    /// Seconds after local midnight at which the current schedule was applied.
    schedule_offset_secs: u32,
    nonce: Nonce,
    active_alerts: AlertSet,
    timezone: TimeZoneOffset,
    /// Monotonic milliseconds of the last status response.
    last_status_at_ms: Option<u64>,
}

impl SessionState {
    /// Fresh session right after the pod accepted an address.
    pub fn new(address: u32, lot: u32, tid: u32, nonce: Nonce, timezone: TimeZoneOffset) -> Self {
        Self {
            address,
            lot,
            tid,
            setup_progress: SetupProgress::AddressAssigned,
            delivery_status: DeliveryStatus::Suspended,
            pod_progress: Some(PodProgress::PairingSuccess),
            basal_schedule: None,
            schedule_offset_secs: 0,
            nonce,
            active_alerts: AlertSet::EMPTY,
            timezone,
            last_status_at_ms: None,
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn lot(&self) -> u32 {
        self.lot
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn setup_progress(&self) -> SetupProgress {
        self.setup_progress
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery_status
    }

    pub fn pod_progress(&self) -> Option<PodProgress> {
        self.pod_progress
    }

    pub fn basal_schedule(&self) -> Option<&BasalSchedule> {
        self.basal_schedule.as_ref()
    }

    pub fn schedule_offset_secs(&self) -> u32 {
        self.schedule_offset_secs
    }

    pub fn current_nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn active_alerts(&self) -> AlertSet {
        self.active_alerts
    }

    pub fn timezone(&self) -> TimeZoneOffset {
        self.timezone
    }

    pub fn last_status_at_ms(&self) -> Option<u64> {
        self.last_status_at_ms
    }

    pub fn is_ready_for_delivery(&self) -> bool {
        self.setup_progress == SetupProgress::Completed
    }

    // ── Mutation ──────────────────────────────────────────────

    /// Move setup forward.  Backwards moves are refused and logged; returns
    /// whether the stored progress changed.
    pub fn advance_setup_progress(&mut self, progress: SetupProgress) -> bool {
        if progress < self.setup_progress {
            warn!(
                "session: refusing setup regression {} -> {}",
                self.setup_progress, progress
            );
            return false;
        }
        let changed = progress != self.setup_progress;
        self.setup_progress = progress;
        changed
    }

    /// Hand out the nonce for the next command and advance the prediction.
    pub fn take_nonce(&mut self) -> Nonce {
        let current = self.nonce;
        self.nonce = current.next();
        current
    }

    /// Adopt the nonce the pod told us it expects.
    pub fn resync_nonce(&mut self, nonce: Nonce) {
        self.nonce = nonce;
    }

    /// Fold a status response into the session.  Returns whether the
    /// delivery status changed.
    pub fn apply_status(&mut self, status: &StatusResponse, at_ms: u64) -> bool {
        let changed = status.delivery_status != self.delivery_status;
        self.delivery_status = status.delivery_status;
        self.pod_progress = Some(status.pod_progress);
        self.active_alerts = status.alerts;
        self.last_status_at_ms = Some(at_ms);
        changed
    }

    pub fn set_basal_schedule(&mut self, schedule: BasalSchedule, offset_secs: u32) {
        self.basal_schedule = Some(schedule);
        self.schedule_offset_secs = offset_secs;
    }

    pub fn set_schedule_offset(&mut self, offset_secs: u32) {
        self.schedule_offset_secs = offset_secs;
    }

    pub fn set_timezone(&mut self, timezone: TimeZoneOffset) {
        self.timezone = timezone;
    }

    pub fn clear_alerts(&mut self, acknowledged: AlertSet) {
        self.active_alerts = self.active_alerts.without(acknowledged);
    }
}
