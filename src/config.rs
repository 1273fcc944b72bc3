//! Orchestrator configuration parameters
//!
//! Physical delivery constants of the pod plus the orchestrator's timing and
//! retry budgets.  Injected once at construction; never mutated afterwards.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Core orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodConfig {
    // --- Insulin delivery ---
    /// Smallest amount the pod can deliver (units)
    pub pulse_size: f64,
    /// Bolus delivery rate (units/second)
    pub bolus_rate: f64,
    /// Priming delivery rate (units/second)
    pub priming_rate: f64,
    /// Cannula insertion delivery rate (units/second)
    pub cannula_insertion_rate: f64,
    /// Volume delivered while priming (units)
    pub prime_units: f64,
    /// Volume delivered during cannula insertion (units)
    pub cannula_insertion_units: f64,
    /// Largest single bolus accepted (units)
    pub max_bolus: f64,

    // --- Timing ---
    /// Average time between sending a bolus command and seeing its reply
    pub command_round_trip_ms: u64,
    /// Physical delays are rounded up to a multiple of this
    pub delay_granularity_ms: u64,

    // --- Budgets ---
    /// Status polls per setup verification or bolus completion check
    pub verification_tries: u8,
    /// Progress notifications per bolus
    pub bolus_progress_reports: u8,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            // Delivery
            pulse_size: 0.05,
            bolus_rate: 0.025,
            priming_rate: 0.05,
            cannula_insertion_rate: 0.05,
            prime_units: 2.6,
            cannula_insertion_units: 0.5,
            max_bolus: 30.0,

            // Timing
            command_round_trip_ms: 2_000,
            delay_granularity_ms: 1_000, // whole seconds

            // Budgets
            verification_tries: 3,
            bolus_progress_reports: 20,
        }
    }
}

impl PodConfig {
    /// Same pod, with every physical duration divided by `factor`.
    ///
    /// Rates go up, the round-trip allowance goes down and the delay
    /// granularity drops to milliseconds.  Used by simulations and tests.
    pub fn time_scaled(factor: f64) -> Self {
        let base = Self::default();
        Self {
            bolus_rate: base.bolus_rate * factor,
            priming_rate: base.priming_rate * factor,
            cannula_insertion_rate: base.cannula_insertion_rate * factor,
            command_round_trip_ms: (base.command_round_trip_ms as f64 / factor) as u64,
            delay_granularity_ms: 1,
            ..base
        }
    }

    /// Reject values that would make delivery estimates meaningless.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.pulse_size > 0.0 && self.pulse_size <= 1.0) {
            return Err("pulse_size must be in (0, 1] U");
        }
        if !(self.bolus_rate > 0.0 && self.priming_rate > 0.0 && self.cannula_insertion_rate > 0.0) {
            return Err("delivery rates must be positive");
        }
        if self.prime_units <= 0.0 || self.cannula_insertion_units <= 0.0 {
            return Err("setup volumes must be positive");
        }
        if self.max_bolus <= 0.0 {
            return Err("max_bolus must be positive");
        }
        if self.delay_granularity_ms == 0 {
            return Err("delay_granularity_ms must be non-zero");
        }
        if self.verification_tries == 0 {
            return Err("verification_tries must be at least 1");
        }
        if self.bolus_progress_reports == 0 {
            return Err("bolus_progress_reports must be at least 1");
        }
        Ok(())
    }

    /// Time the pod needs to deliver `units` at `rate` U/s, rounded up to
    /// the delay granularity.
    pub fn delivery_duration(&self, units: f64, rate: f64) -> Duration {
        // Round to whole milliseconds first so 2.6 / 0.05 stays 52 s.
        let ms = (units / rate * 1000.0).round().max(0.0) as u64;
        let step = self.delay_granularity_ms.max(1);
        Duration::from_millis(ms.div_ceil(step) * step)
    }

    /// Wait before verifying the priming bolus.
    pub fn priming_delay(&self) -> Duration {
        self.delivery_duration(self.prime_units, self.priming_rate)
    }

    /// Wait before verifying cannula insertion.
    pub fn cannula_insertion_delay(&self) -> Duration {
        self.delivery_duration(self.cannula_insertion_units, self.cannula_insertion_rate)
    }

    /// Full duration of a bolus of `units`.
    pub fn bolus_duration(&self, units: f64) -> Duration {
        self.delivery_duration(units, self.bolus_rate)
    }

    pub fn command_round_trip(&self) -> Duration {
        Duration::from_millis(self.command_round_trip_ms)
    }
}
