//! Outbound orchestrator events.
//!
//! The [`PodManager`](super::service::PodManager) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other side
//! decide what to do with them, such as logging them or pushing them to a UI.

use serde::Serialize;

use crate::pod::{DeliveryStatus, SetupProgress};

/// Structured events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PodEvent {
    /// Pairing produced a new session.
    SessionCreated { address: u32 },

    /// Setup advanced.
    SetupProgressChanged {
        from: SetupProgress,
        to: SetupProgress,
    },

    /// A status response changed the delivery activity.
    DeliveryStatusChanged {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// Session dropped (deactivation or explicit reset).
    SessionCleared,

    BolusStarted { units: f64 },

    /// Bolus resolved, by completion or cancellation.
    BolusFinished { units_delivered: f64, cancelled: bool },
}
