//! Pod domain vocabulary.
//!
//! Plain data types describing what the orchestrator knows about the pod:
//! activation stage, delivery activity, alert slots and the nonce counter.
//! Nothing in here performs I/O.

pub mod schedule;
pub mod state;

use core::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Setup progress
// ---------------------------------------------------------------------------

/// Client-side activation stage.  Ordering is the activation order, so
/// `a < b` means `a` comes earlier in setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SetupProgress {
    AddressAssigned = 0,
    Priming = 1,
    PrimingFinished = 2,
    CannulaInserting = 3,
    Completed = 4,
}

impl SetupProgress {
    pub fn is_before(self, other: Self) -> bool {
        self < other
    }

    pub fn is_after(self, other: Self) -> bool {
        self > other
    }
}

impl fmt::Display for SetupProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddressAssigned => "address assigned",
            Self::Priming => "priming",
            Self::PrimingFinished => "priming finished",
            Self::CannulaInserting => "cannula inserting",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Device-reported progress
// ---------------------------------------------------------------------------

/// Activation stage as reported by the pod in a status response.
///
/// Coarser-grained than the device's internal counter; only the stages the
/// orchestrator reacts to are distinguished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PodProgress {
    PairingSuccess = 3,
    Priming = 4,
    PrimingCompleted = 5,
    BasalInitialized = 6,
    InsertingCannula = 7,
    Running = 8,
    RunningLow = 9,
    FaultEvent = 13,
    Inactive = 15,
}

impl PodProgress {
    /// Pod has finished inserting the cannula and is delivering basal.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::RunningLow)
    }
}

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

/// Current insulin-delivery activity reported by the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryStatus {
    Suspended = 0,
    Normal = 1,
    TempBasalRunning = 2,
    Priming = 4,
    BolusInProgress = 5,
    BolusAndTempBasal = 6,
}

impl DeliveryStatus {
    pub fn is_bolusing(self) -> bool {
        matches!(self, Self::BolusInProgress | Self::BolusAndTempBasal)
    }

    pub fn is_suspended(self) -> bool {
        self == Self::Suspended
    }

    pub fn is_temp_basal_running(self) -> bool {
        matches!(self, Self::TempBasalRunning | Self::BolusAndTempBasal)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Suspended => "suspended",
            Self::Normal => "normal",
            Self::TempBasalRunning => "temp basal running",
            Self::Priming => "priming",
            Self::BolusInProgress => "bolus in progress",
            Self::BolusAndTempBasal => "bolus and temp basal",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Delivery types
// ---------------------------------------------------------------------------

/// Set of delivery types addressed by a cancel command, stored as a bitmask.
///
/// The empty set is the no-op cancel used to probe the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryTypes(u8);

impl DeliveryTypes {
    pub const NONE: Self = Self(0);
    pub const BASAL: Self = Self(0b0001);
    pub const TEMP_BASAL: Self = Self(0b0010);
    pub const BOLUS: Self = Self(0b0100);
    pub const ALL: Self = Self(0b0111);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Alert slots pending acknowledgement.  The pod exposes eight slots (0–7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertSet(u8);

impl AlertSet {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `None` for slots outside 0–7.
    pub fn with_slot(self, slot: u8) -> Option<Self> {
        (slot < 8).then(|| Self(self.0 | (1 << slot)))
    }

    pub fn contains(self, slot: u8) -> bool {
        slot < 8 && self.0 & (1 << slot) != 0
    }

    pub fn without(self, acknowledged: Self) -> Self {
        Self(self.0 & !acknowledged.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn slots(self) -> impl Iterator<Item = u8> {
        (0..8u8).filter(move |slot| self.contains(*slot))
    }
}

// ---------------------------------------------------------------------------
// Nonce
// ---------------------------------------------------------------------------

/// Client-predicted command nonce.
///
/// Every nonce-bearing command consumes the current value; the device
/// rejects a command whose nonce differs from its own prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(u32);

impl Nonce {
    pub const fn new(seed: u32) -> Self {
        Self(seed)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Timezone
// ---------------------------------------------------------------------------

/// Local-time offset the pod believes in, in minutes east of UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeZoneOffset(i16);

impl TimeZoneOffset {
    pub const UTC: Self = Self(0);

    /// Offsets beyond ±14h do not exist; they are rejected.
    pub fn from_minutes(minutes: i16) -> Option<Self> {
        (-14 * 60..=14 * 60).contains(&minutes).then_some(Self(minutes))
    }

    pub const fn minutes(self) -> i16 {
        self.0
    }
}

impl fmt::Display for TimeZoneOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { '-' } else { '+' };
        let abs = self.0.unsigned_abs();
        write!(f, "UTC{}{:02}:{:02}", sign, abs / 60, abs % 60)
    }
}

// ---------------------------------------------------------------------------
// Pod info
// ---------------------------------------------------------------------------

/// Detailed info pages that can be requested from the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PodInfoType {
    ActiveAlerts = 0x01,
    ExtendedFault = 0x02,
    DataLog = 0x03,
    FaultAndInitialization = 0x05,
    LowFlashLog = 0x50,
}
