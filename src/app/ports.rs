//! Port traits: the hexagonal boundary between orchestration and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ PodManager (domain)
//! ```
//!
//! Driven adapters (radio executor, session storage, event sinks, clock)
//! implement these traits.  The [`PodManager`](super::service::PodManager)
//! consumes them, so the orchestration core never touches a radio or a disk
//! directly.
//!
//! ## Safety notes
//!
//! - **CommandExecutor** implementations MUST only set
//!   [`CommandError::certain`] when the pod provably did not act on the
//!   command (it never left the host, or the pod answered with a refusal).
//! - **SessionStore** implementations MUST write atomically; a torn session
//!   record loses the nonce and strands the pod.

use embassy_time::Instant;

use crate::error::CommandError;
use crate::pod::TimeZoneOffset;
use crate::pod::state::SessionState;

use super::commands::CommandEnvelope;
use super::events::PodEvent;
use super::responses::Response;

// ───────────────────────────────────────────────────────────────
// Command executor (driven adapter: domain → pod)
// ───────────────────────────────────────────────────────────────

/// Performs one command/response exchange with the pod.
///
/// Calls are synchronous and never overlap: the orchestrator holds its
/// monitor for the duration of every exchange.
pub trait CommandExecutor {
    fn execute(&mut self, envelope: &CommandEnvelope) -> Result<Response, CommandError>;
}

// ───────────────────────────────────────────────────────────────
// Session store (driven adapter: domain ↔ persistent session)
// ───────────────────────────────────────────────────────────────

/// Persists the session so a restarted host can resume the activation.
pub trait SessionStore {
    /// Returns `Ok(None)` when no session has been saved.
    fn load(&self) -> Result<Option<SessionState>, StorageError>;

    fn save(&mut self, state: &SessionState) -> Result<(), StorageError>;

    /// Remove the saved session.  `Ok(())` even if none existed.
    fn clear(&mut self) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (driven adapter: domain ↔ key-value storage)
// ───────────────────────────────────────────────────────────────

/// Namespaced key-value storage backing [`SessionStore`] adapters.
///
/// Write operations MUST be atomic; no partial writes on power loss.
pub trait StoragePort {
    /// Read a value.  Returns the number of bytes written to `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → caller / logging)
// ───────────────────────────────────────────────────────────────

/// The orchestrator emits [`PodEvent`]s through this port whenever the
/// session materially changes.  Fire-and-forget: the sink cannot fail an
/// operation.
pub trait EventSink {
    fn emit(&mut self, event: &PodEvent);
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Time source.  Injected so bolus estimates can be tested with a
/// hand-driven clock.
pub trait Clock {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Seconds elapsed since UTC midnight.
    fn utc_seconds_of_day(&self) -> u32;

    /// Host's current local offset.
    fn utc_offset(&self) -> TimeZoneOffset;

    /// Seconds after *local* midnight in `tz`.
    fn local_seconds_of_day(&self, tz: TimeZoneOffset) -> u32 {
        const DAY: i64 = 86_400;
        let local = i64::from(self.utc_seconds_of_day()) + i64::from(tz.minutes()) * 60;
        local.rem_euclid(DAY) as u32
    }
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`StoragePort`] and [`SessionStore`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Stored record failed to decode.
    Corrupted,
    /// Record would not fit the storage buffer.
    TooLarge,
    /// Generic I/O error.
    IoError,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::Corrupted => write!(f, "record corrupted"),
            Self::TooLarge => write!(f, "record too large"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for StorageError {}
