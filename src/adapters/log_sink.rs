//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing orchestrator events through the
//! `log` facade.  A UI or persistence bridge would implement the same
//! trait.

use log::info;

use crate::app::events::PodEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`PodEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &PodEvent) {
        match event {
            PodEvent::SessionCreated { address } => {
                info!("SESSION | created address={:#010x}", address);
            }
            PodEvent::SetupProgressChanged { from, to } => {
                info!("SETUP | {} -> {}", from, to);
            }
            PodEvent::DeliveryStatusChanged { from, to } => {
                info!("DELIVERY | {} -> {}", from, to);
            }
            PodEvent::SessionCleared => {
                info!("SESSION | cleared");
            }
            PodEvent::BolusStarted { units } => {
                info!("BOLUS | started {:.2}U", units);
            }
            PodEvent::BolusFinished {
                units_delivered,
                cancelled,
            } => {
                info!(
                    "BOLUS | {} {:.2}U",
                    if *cancelled { "cancelled after" } else { "completed" },
                    units_delivered
                );
            }
        }
    }
}
