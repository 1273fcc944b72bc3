//! podsim: drives a simulated pod through a full activation.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │                                                              │
//! │  SimulatedPod        KvSessionStore      LogEventSink        │
//! │  (CommandExecutor)   (SessionStore)      (EventSink)         │
//! │  SystemClock (Clock)                                         │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ───────────────────    │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │              PodManager (orchestration)                │  │
//! │  │  setup · verification · bolus tracking                 │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `podsim [speedup]`.  Physical delays are divided by `speedup`
//! (default 20), so priming takes 2.6 s instead of 52 s.
#![deny(unused_must_use)]

use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use podcore::adapters::log_sink::LogEventSink;
use podcore::adapters::sim::{RadioFault, SimulatedPod};
use podcore::adapters::store::{KvSessionStore, MemoryStorage};
use podcore::adapters::time::SystemClock;
use podcore::pod::PodInfoType;
use podcore::pod::schedule::{BasalSchedule, BasalSegment};
use podcore::{PodConfig, PodManager};

const DEFAULT_SPEEDUP: f64 = 20.0;

fn sleep_for(duration: embassy_time::Duration) {
    thread::sleep(std::time::Duration::from_millis(duration.as_millis()));
}

fn main() -> Result<()> {
    // ── 1. Logging and configuration ──────────────────────────
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let speedup = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<f64>()
            .with_context(|| format!("speedup must be a number, got {arg:?}"))?,
        None => DEFAULT_SPEEDUP,
    };
    if !(speedup >= 1.0) {
        bail!("speedup must be at least 1");
    }

    info!("╔══════════════════════════════════════╗");
    info!("║  podsim v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    let config = PodConfig::time_scaled(speedup);

    // ── 2. Adapters ───────────────────────────────────────────
    let pod = SimulatedPod::new(&config);
    let store = KvSessionStore::new(MemoryStorage::new());
    let clock = Arc::new(SystemClock::default());
    let manager = PodManager::new(pod.clone(), store, LogEventSink::new(), clock, config.clone())?;

    // ── 3. Activation ─────────────────────────────────────────
    let priming = manager.pair_and_prime()?;
    info!("priming: waiting {}ms", priming.delay().as_millis());
    priming.finish().context("priming")?;

    let schedule = BasalSchedule::new(&[
        BasalSegment::new(0.6, 7 * 60),
        BasalSegment::new(0.9, 15 * 60),
        BasalSegment::new(0.7, 2 * 60),
    ])?;
    info!("basal schedule: {:.2} U/day", schedule.daily_total());
    manager
        .insert_cannula(schedule)?
        .finish()
        .context("cannula insertion")?;

    let status = manager.get_pod_status()?;
    info!(
        "pod running: {} / {:?}, {:.2} U delivered",
        status.delivery_status, status.pod_progress, status.insulin_delivered
    );

    // ── 4. A full bolus with progress ─────────────────────────
    let handle = manager.bolus(
        1.0,
        Some(Box::new(|units, percent| {
            info!("bolus progress: {percent:3}% ~{units:.2} U");
        })),
    )?;
    let result = handle.wait();
    info!("bolus finished: {:.2} U", result.units_delivered);
    // The pod finishes a round trip after the tracker does.
    sleep_for(config.command_round_trip());

    // ── 5. A temp basal across a lost reply ───────────────────
    pod.inject(RadioFault::LoseReply);
    manager.set_temporary_basal(1.5, 30)?;
    manager.cancel_temporary_basal()?;

    // ── 6. A cancelled bolus ──────────────────────────────────
    let units = 2.0;
    let handle = manager.bolus(units, None)?;
    sleep_for(manager.calculate_bolus_duration(units) / 3);
    let cancelled = manager.cancel_bolus()?;
    info!(
        "bolus cancelled: ~{:.2} of {units} U (handle saw {:.2})",
        cancelled.units_delivered,
        handle.wait().units_delivered
    );

    // ── 7. Alerts, suspend / resume, deactivation ─────────────
    pod.raise_alert(2);
    let status = manager.get_pod_status()?;
    if !status.alerts.is_empty() {
        manager.acknowledge_alerts()?;
    }
    let info = manager.get_pod_info(PodInfoType::ActiveAlerts)?;
    info!("pod info {:?}: {:02x?}", info.kind, info.payload);

    manager.suspend_delivery()?;
    manager.resume_delivery()?;
    manager.sync_time()?;

    info!("session: {}", manager.session_json());
    if let Err(e) = manager.deactivate() {
        warn!("deactivation reported: {e}");
    }
    info!(
        "simulated pod: {:?}, {:.2} U delivered, {} commands",
        pod.pod_progress(),
        pod.insulin_delivered(),
        pod.commands_seen()
    );
    Ok(())
}
