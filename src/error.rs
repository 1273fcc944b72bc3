//! Unified error types for the pod orchestrator.
//!
//! Two layers:
//!
//! - [`CommandError`] is what the command executor reports for one failed
//!   exchange.  It is *unresolved*: on its own it does not say whether the
//!   pod acted on the command.
//! - [`Error`] is what orchestrator operations surface.  Command failures
//!   only become an [`Error`] after they have been classified as certain or
//!   uncertain, either by the executor itself or by the verification probe.
//!
//! All variants are `Copy` so they can be stored in setup results and
//! handed across the background-task boundary without allocation.

use core::fmt;

use crate::app::ports::StorageError;
use crate::pod::{DeliveryStatus, Nonce, SetupProgress};

// ---------------------------------------------------------------------------
// Command errors (executor boundary)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// Radio exchange failed or timed out.
    Communication,
    /// The pod rejected the nonce.  `resync` is the value it expects next,
    /// when the reply carried one.
    NonceOutOfSync { resync: Option<Nonce> },
    /// The pod refused the command in its current delivery state.
    IllegalDeliveryStatus,
    /// The pod refused the command in its current activation stage.
    IllegalSetupProgress,
    Other,
}

impl fmt::Display for CommandErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication => write!(f, "communication failure"),
            Self::NonceOutOfSync { resync: Some(n) } => {
                write!(f, "nonce out of sync (pod expects {n})")
            }
            Self::NonceOutOfSync { resync: None } => write!(f, "nonce out of sync"),
            Self::IllegalDeliveryStatus => write!(f, "illegal delivery status"),
            Self::IllegalSetupProgress => write!(f, "illegal setup progress"),
            Self::Other => write!(f, "unexpected failure"),
        }
    }
}

/// One failed command exchange, as reported by the executor.
///
/// `certain` is set by the executor when it knows the command never
/// reached the pod (e.g. the radio refused to transmit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub certain: bool,
}

impl CommandError {
    pub const fn new(kind: CommandErrorKind) -> Self {
        Self {
            kind,
            certain: false,
        }
    }

    pub const fn certain(kind: CommandErrorKind) -> Self {
        Self {
            kind,
            certain: true,
        }
    }

    pub const fn communication() -> Self {
        Self::new(CommandErrorKind::Communication)
    }

    pub const fn nonce_out_of_sync(resync: Option<Nonce>) -> Self {
        Self::new(CommandErrorKind::NonceOutOfSync { resync })
    }

    pub fn is_nonce_out_of_sync(&self) -> bool {
        matches!(self.kind, CommandErrorKind::NonceOutOfSync { .. })
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.certain {
            write!(f, " (certain)")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandError {}

// ---------------------------------------------------------------------------
// Orchestrator errors
// ---------------------------------------------------------------------------

/// Every fallible orchestrator operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Setup step attempted out of order.
    OutOfSequence {
        expected: SetupProgress,
        actual: Option<SetupProgress>,
    },
    /// Delivery operation attempted before setup completed.
    NotReady { actual: Option<SetupProgress> },
    /// Operation needs a paired pod and there is none.
    NoActiveSession,
    /// Operation conflicts with the current delivery activity.
    IllegalDeliveryStatus {
        expected: DeliveryStatus,
        actual: DeliveryStatus,
    },
    /// The command definitely did not take effect; retrying is safe.
    CertainCommandFailure(CommandError),
    /// The command may or may not have taken effect.
    UncertainCommandFailure(CommandError),
    /// Setup verification ran out of attempts without reaching the pod.
    VerificationExhausted(CommandError),
    /// Caller-supplied value rejected before anything was sent.
    InvalidArgument(&'static str),
    Storage(StorageError),
    /// A background verification or bolus task could not be started.
    /// Raised before any command is sent.
    TaskSpawn,
}

impl Error {
    /// True when a command reached the exchange and the pod provably did
    /// not act on it.
    pub fn is_certain_failure(&self) -> bool {
        matches!(self, Self::CertainCommandFailure(_))
    }

    /// True when repeating the request cannot cause a double delivery:
    /// either the pod provably did not act, or nothing was sent at all.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            Self::CertainCommandFailure(_)
                | Self::OutOfSequence { .. }
                | Self::NotReady { .. }
                | Self::NoActiveSession
                | Self::IllegalDeliveryStatus { .. }
                | Self::InvalidArgument(_)
                | Self::TaskSpawn
        )
    }

    /// Underlying command failure, if any.
    pub fn command_error(&self) -> Option<CommandError> {
        match self {
            Self::CertainCommandFailure(e)
            | Self::UncertainCommandFailure(e)
            | Self::VerificationExhausted(e) => Some(*e),
            _ => None,
        }
    }
}

fn fmt_progress(p: Option<SetupProgress>) -> &'static str {
    match p {
        None => "no session",
        Some(SetupProgress::AddressAssigned) => "address assigned",
        Some(SetupProgress::Priming) => "priming",
        Some(SetupProgress::PrimingFinished) => "priming finished",
        Some(SetupProgress::CannulaInserting) => "cannula inserting",
        Some(SetupProgress::Completed) => "completed",
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfSequence { expected, actual } => write!(
                f,
                "setup out of sequence: expected {expected}, pod is at {}",
                fmt_progress(*actual)
            ),
            Self::NotReady { actual } => write!(
                f,
                "pod not ready for delivery (setup: {})",
                fmt_progress(*actual)
            ),
            Self::NoActiveSession => write!(f, "no active pod session"),
            Self::IllegalDeliveryStatus { expected, actual } => {
                write!(f, "illegal delivery status: expected {expected}, got {actual}")
            }
            Self::CertainCommandFailure(e) => write!(f, "command failed: {}", e.kind),
            Self::UncertainCommandFailure(e) => {
                write!(f, "command outcome unknown: {}", e.kind)
            }
            Self::VerificationExhausted(e) => {
                write!(f, "verification attempts exhausted: {}", e.kind)
            }
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::TaskSpawn => write!(f, "failed to start background task"),
        }
    }
}

impl std::error::Error for Error {}

/// A command failure not run through verification keeps the executor's own
/// certainty classification.
impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        if e.certain {
            Self::CertainCommandFailure(e)
        } else {
            Self::UncertainCommandFailure(e)
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Orchestrator-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
