//! Mock adapters for integration tests.
//!
//! `MockPod` answers every command instantly from a tiny pod model and
//! records each envelope, so tests can assert on the full command history.
//! Failures are injected per command name.  The clock, sink and store hand
//! out shared handles so tests can inspect them after the manager owns the
//! adapter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use embassy_time::{Duration, Instant};

use podcore::app::commands::{CommandEnvelope, PodCommand};
use podcore::app::events::PodEvent;
use podcore::app::ports::{Clock, CommandExecutor, EventSink, SessionStore, StorageError};
use podcore::app::responses::{PairResponse, PodInfoResponse, Response, StatusResponse};
use podcore::pod::state::SessionState;
use podcore::pod::{
    AlertSet, DeliveryStatus, DeliveryTypes, Nonce, PodProgress, SetupProgress, TimeZoneOffset,
};
use podcore::{CommandError, PodConfig, PodManager};

pub const POD_ADDRESS: u32 = 0x1f00_0042;
pub const NONCE_SEED: u32 = 0x0100;

// ── MockPod ───────────────────────────────────────────────────

struct PodModel {
    progress: PodProgress,
    delivery: DeliveryStatus,
    alerts: AlertSet,
    /// Commands don't move `progress` while set.
    hold_progress: bool,
    failures: HashMap<&'static str, VecDeque<CommandError>>,
    sent: Vec<CommandEnvelope>,
}

#[derive(Clone)]
pub struct MockPod {
    model: Arc<Mutex<PodModel>>,
}

#[allow(dead_code)]
impl MockPod {
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(PodModel {
                progress: PodProgress::PairingSuccess,
                delivery: DeliveryStatus::Suspended,
                alerts: AlertSet::EMPTY,
                hold_progress: false,
                failures: HashMap::new(),
                sent: Vec::new(),
            })),
        }
    }

    /// Model of an already activated pod.
    pub fn running() -> Self {
        let pod = Self::new();
        {
            let mut m = pod.model.lock().unwrap();
            m.progress = PodProgress::Running;
            m.delivery = DeliveryStatus::Normal;
        }
        pod
    }

    /// Fail the next `times` commands named `name` with `error`.
    pub fn fail_on(&self, name: &'static str, times: usize, error: CommandError) {
        let mut m = self.model.lock().unwrap();
        let queue = m.failures.entry(name).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    pub fn hold_progress(&self, hold: bool) {
        self.model.lock().unwrap().hold_progress = hold;
    }

    pub fn set_alerts(&self, alerts: AlertSet) {
        self.model.lock().unwrap().alerts = alerts;
    }

    pub fn set_delivery(&self, delivery: DeliveryStatus) {
        self.model.lock().unwrap().delivery = delivery;
    }

    pub fn sent(&self) -> Vec<CommandEnvelope> {
        self.model.lock().unwrap().sent.clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.model
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|e| e.command.name())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.sent_names().iter().filter(|n| **n == name).count()
    }

    pub fn last_sent(&self) -> Option<CommandEnvelope> {
        self.model.lock().unwrap().sent.last().cloned()
    }
}

impl Default for MockPod {
    fn default() -> Self {
        Self::new()
    }
}

impl PodModel {
    fn status(&self) -> Response {
        Response::Status(StatusResponse {
            delivery_status: self.delivery,
            pod_progress: self.progress,
            alerts: self.alerts,
            insulin_delivered: 0.0,
            minutes_active: 0,
        })
    }

    fn advance(&mut self, progress: PodProgress) {
        if !self.hold_progress {
            self.progress = progress;
        }
    }
}

impl CommandExecutor for MockPod {
    fn execute(&mut self, envelope: &CommandEnvelope) -> Result<Response, CommandError> {
        let mut m = self.model.lock().unwrap();
        m.sent.push(envelope.clone());

        let name = envelope.command.name();
        if let Some(error) = m.failures.get_mut(name).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        match &envelope.command {
            PodCommand::AssignAddress => {
                return Ok(Response::Paired(PairResponse {
                    address: POD_ADDRESS,
                    lot: 1,
                    tid: 2,
                    nonce_seed: Nonce::new(NONCE_SEED),
                }));
            }
            PodCommand::GetPodInfo(kind) => {
                return Ok(Response::PodInfo(PodInfoResponse {
                    kind: *kind,
                    payload: vec![0xaa],
                }));
            }
            // Priming and insertion finish instantly on the mock.
            PodCommand::Prime => m.advance(PodProgress::PrimingCompleted),
            PodCommand::InsertCannula { .. } => {
                m.advance(PodProgress::Running);
                m.delivery = DeliveryStatus::Normal;
            }
            // A bolus is reported once, then shows as finished.
            PodCommand::Bolus { .. } => m.delivery = DeliveryStatus::BolusInProgress,
            PodCommand::GetStatus => {
                let reply = m.status();
                if m.delivery.is_bolusing() {
                    m.delivery = DeliveryStatus::Normal;
                }
                return Ok(reply);
            }
            PodCommand::AcknowledgeAlerts(acked) => m.alerts = m.alerts.without(*acked),
            PodCommand::SetTempBasal { .. } => m.delivery = DeliveryStatus::TempBasalRunning,
            PodCommand::CancelDelivery { types, .. } => {
                if *types == DeliveryTypes::ALL {
                    m.delivery = DeliveryStatus::Suspended;
                } else if !types.is_empty() {
                    m.delivery = DeliveryStatus::Normal;
                }
            }
            PodCommand::SetBasalSchedule { .. } => m.delivery = DeliveryStatus::Normal,
            PodCommand::Deactivate => {
                m.advance(PodProgress::Inactive);
                m.delivery = DeliveryStatus::Suspended;
            }
        }
        Ok(m.status())
    }
}

// ── ManualClock ───────────────────────────────────────────────

/// Hand-driven clock.  Starts at t = 1000 s, UTC midnight.
#[derive(Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
    seconds_of_day: Arc<AtomicU32>,
    offset_minutes: Arc<Mutex<TimeZoneOffset>>,
}

#[allow(dead_code)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(1_000_000)),
            seconds_of_day: Arc::new(AtomicU32::new(0)),
            offset_minutes: Arc::new(Mutex::new(TimeZoneOffset::UTC)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis(), Ordering::SeqCst);
    }

    pub fn set_seconds_of_day(&self, secs: u32) {
        self.seconds_of_day.store(secs, Ordering::SeqCst);
    }

    pub fn set_offset(&self, offset: TimeZoneOffset) {
        *self.offset_minutes.lock().unwrap() = offset;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    fn utc_seconds_of_day(&self) -> u32 {
        self.seconds_of_day.load(Ordering::SeqCst)
    }

    fn utc_offset(&self) -> TimeZoneOffset {
        *self.offset_minutes.lock().unwrap()
    }
}

// ── RecordingSink ─────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<PodEvent>>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn events(&self) -> Vec<PodEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &PodEvent) -> bool {
        self.events.lock().unwrap().contains(event)
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &PodEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ── SharedStore ───────────────────────────────────────────────

/// Session store whose contents outlive the manager that wrote them.
#[derive(Clone, Default)]
pub struct SharedStore {
    pub saved: Arc<Mutex<Option<SessionState>>>,
    pub saves: Arc<AtomicUsize>,
    /// Next `clear` fails with an I/O error.
    pub fail_clear: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl SharedStore {
    pub fn with(state: SessionState) -> Self {
        let store = Self::default();
        *store.saved.lock().unwrap() = Some(state);
        store
    }

    pub fn snapshot(&self) -> Option<SessionState> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_next_clear(&self) {
        self.fail_clear.store(true, Ordering::SeqCst);
    }
}

impl SessionStore for SharedStore {
    fn load(&self) -> Result<Option<SessionState>, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&mut self, state: &SessionState) -> Result<(), StorageError> {
        *self.saved.lock().unwrap() = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        if self.fail_clear.swap(false, Ordering::SeqCst) {
            return Err(StorageError::IoError);
        }
        *self.saved.lock().unwrap() = None;
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────

pub struct Harness {
    pub manager: PodManager<MockPod, SharedStore>,
    pub pod: MockPod,
    pub clock: ManualClock,
    pub sink: RecordingSink,
    pub store: SharedStore,
}

/// Fast timings: every physical delay is a thousandth of the real one.
#[allow(dead_code)]
pub fn fast_config() -> PodConfig {
    PodConfig::time_scaled(1000.0)
}

#[allow(dead_code)]
pub fn harness(pod: MockPod, store: SharedStore, config: PodConfig) -> Harness {
    let clock = ManualClock::new();
    let sink = RecordingSink::default();
    let manager = PodManager::new(
        pod.clone(),
        store.clone(),
        sink.clone(),
        Arc::new(clock.clone()),
        config,
    )
    .unwrap();
    Harness {
        manager,
        pod,
        clock,
        sink,
        store,
    }
}

/// Fresh manager with no session.
#[allow(dead_code)]
pub fn unpaired(config: PodConfig) -> Harness {
    harness(MockPod::new(), SharedStore::default(), config)
}

/// Session that finished setup, resumed from the store.
#[allow(dead_code)]
pub fn activated_session() -> SessionState {
    let mut state = SessionState::new(
        POD_ADDRESS,
        1,
        2,
        Nonce::new(NONCE_SEED),
        TimeZoneOffset::UTC,
    );
    state.advance_setup_progress(SetupProgress::Completed);
    state.set_basal_schedule(
        podcore::pod::schedule::BasalSchedule::flat(0.8).unwrap(),
        0,
    );
    state
}

/// Manager resumed on an activated pod.
#[allow(dead_code)]
pub fn activated(config: PodConfig) -> Harness {
    harness(MockPod::running(), SharedStore::with(activated_session()), config)
}
