//! Outbound commands to the pod.
//!
//! These are the orchestrator-level intents handed to the
//! [`CommandExecutor`](super::ports::CommandExecutor).  The executor owns
//! message encoding; the orchestrator owns which command is sent when and
//! with which nonce.

use crate::pod::schedule::{BasalSchedule, TempBasal};
use crate::pod::{AlertSet, DeliveryTypes, Nonce, PodInfoType};

/// Commands the orchestrator can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum PodCommand {
    /// Assign an address to an unpaired pod.
    AssignAddress,

    /// Deliver the priming bolus.
    Prime,

    /// Program the basal schedule and fire the cannula insertion bolus.
    InsertCannula {
        schedule: BasalSchedule,
        offset_secs: u32,
    },

    GetStatus,

    GetPodInfo(PodInfoType),

    AcknowledgeAlerts(AlertSet),

    SetBasalSchedule {
        schedule: BasalSchedule,
        offset_secs: u32,
        /// Re-applying the stored schedule after a suspend.
        resume: bool,
        beep: bool,
    },

    SetTempBasal { temp: TempBasal, beep: bool },

    Bolus { units: f64, beep: bool },

    /// Cancel the given delivery types.  An empty set is a no-op on the
    /// pod and only exercises the nonce.
    CancelDelivery { types: DeliveryTypes, beep: bool },

    Deactivate,
}

impl PodCommand {
    /// Whether the command's message block carries the rolling nonce.
    pub fn uses_nonce(&self) -> bool {
        !matches!(
            self,
            Self::AssignAddress | Self::GetStatus | Self::GetPodInfo(_)
        )
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AssignAddress => "assign-address",
            Self::Prime => "prime",
            Self::InsertCannula { .. } => "insert-cannula",
            Self::GetStatus => "get-status",
            Self::GetPodInfo(_) => "get-pod-info",
            Self::AcknowledgeAlerts(_) => "acknowledge-alerts",
            Self::SetBasalSchedule { resume: true, .. } => "resume-basal",
            Self::SetBasalSchedule { .. } => "set-basal-schedule",
            Self::SetTempBasal { .. } => "set-temp-basal",
            Self::Bolus { .. } => "bolus",
            Self::CancelDelivery { types, .. } if types.is_empty() => "cancel-none",
            Self::CancelDelivery { .. } => "cancel-delivery",
            Self::Deactivate => "deactivate",
        }
    }
}

/// A command addressed to a specific pod, with the nonce it consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: PodCommand,
    /// `None` before pairing.
    pub address: Option<u32>,
    /// `None` for commands without a nonce-bearing block.
    pub nonce: Option<Nonce>,
}
