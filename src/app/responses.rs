//! Responses returned by the command executor.
//!
//! These are the decoded forms the orchestrator needs; the byte-level
//! encoding stays inside the executor adapter.

use serde::{Deserialize, Serialize};

use crate::pod::{AlertSet, DeliveryStatus, Nonce, PodInfoType, PodProgress};

/// Status snapshot the pod returns for most commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub delivery_status: DeliveryStatus,
    pub pod_progress: PodProgress,
    pub alerts: AlertSet,
    /// Total units delivered since activation.
    pub insulin_delivered: f64,
    pub minutes_active: u16,
}

/// Identity the pod reports once it accepts an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
    pub address: u32,
    pub lot: u32,
    pub tid: u32,
    /// First nonce the pod will expect.
    pub nonce_seed: Nonce,
}

/// Raw info page returned for a [`PodInfoType`] request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfoResponse {
    pub kind: PodInfoType,
    pub payload: Vec<u8>,
}

/// Decoded reply to one command exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Paired(PairResponse),
    Status(StatusResponse),
    PodInfo(PodInfoResponse),
}

impl Response {
    pub fn status(&self) -> Option<&StatusResponse> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }
}
