//! Bolus start, tracking, cancellation and resolution.

use std::sync::{Arc, Mutex};

use embassy_time::Duration;

use crate::mock_pod::{
    MockPod, RecordingSink, SharedStore, activated, activated_session, fast_config, unpaired,
};
use podcore::PodManager;
use podcore::adapters::time::SystemClock;
use podcore::app::events::PodEvent;
use podcore::error::CommandErrorKind;
use podcore::pod::DeliveryStatus;
use podcore::{BolusResult, CommandError, Error, PodConfig};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn bolus_duration_follows_bolus_rate() {
    let h = activated(PodConfig::default());
    assert_eq!(h.manager.calculate_bolus_duration(2.0), Duration::from_secs(80));
    assert_eq!(h.manager.calculate_bolus_duration(0.05), Duration::from_secs(2));
}

#[test]
fn completed_bolus_resolves_with_full_units() {
    let h = activated(fast_config());
    let handle = h.manager.bolus(2.0, None).unwrap();
    assert_eq!(handle.units_requested(), 2.0);
    assert!(h.manager.has_active_bolus());

    let result = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(result, BolusResult { units_delivered: 2.0 });
    assert!(!h.manager.has_active_bolus());
    // Completion holds the monitor until its event is out.
    assert!(h.manager.session().is_some());

    let events = h.sink.events();
    assert!(events.contains(&PodEvent::BolusStarted { units: 2.0 }));
    assert!(events.contains(&PodEvent::BolusFinished {
        units_delivered: 2.0,
        cancelled: false
    }));
    // Completion confirmed by a status poll.
    assert!(h.pod.count("get-status") >= 1);
}

#[test]
fn progress_reports_rise_with_elapsed_time() {
    let config = PodConfig::time_scaled(100.0);
    let manager = PodManager::new(
        MockPod::running(),
        SharedStore::with(activated_session()),
        RecordingSink::default(),
        Arc::new(SystemClock::default()),
        config,
    )
    .unwrap();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let handle = manager
        .bolus(
            2.0,
            Some(Box::new(move |units, percent| {
                sink.lock().unwrap().push((units, percent));
            })),
        )
        .unwrap();
    assert_eq!(handle.wait_timeout(WAIT).unwrap().units_delivered, 2.0);

    let reports = reports.lock().unwrap().clone();
    assert!(reports.len() >= 2, "{reports:?}");
    assert!(reports.len() <= usize::from(manager.config().bolus_progress_reports));
    assert_eq!(reports[0].1, 5);
    for pair in reports.windows(2) {
        assert!(pair[1].1 > pair[0].1, "{reports:?}");
        assert!(pair[1].0 >= pair[0].0, "{reports:?}");
    }
    let (first, last) = (reports[0].0, reports[reports.len() - 1].0);
    assert!(last > first, "{reports:?}");
    assert!(last <= 2.0);
}

#[test]
fn failed_completion_polls_still_resolve_bolus() {
    let h = activated(fast_config());
    h.pod.fail_on("get-status", 3, CommandError::communication());

    let handle = h.manager.bolus(2.0, None).unwrap();
    let result = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(result.units_delivered, 2.0);
    assert!(!h.manager.has_active_bolus());
    assert!(h.manager.session().is_some());

    assert_eq!(h.pod.count("get-status"), 3);
    assert!(h.sink.contains(&PodEvent::BolusFinished {
        units_delivered: 2.0,
        cancelled: false
    }));
    // No poll got through, so the session keeps the pod's last report.
    assert_eq!(
        h.manager.session().unwrap().delivery_status(),
        DeliveryStatus::BolusInProgress
    );
}

#[test]
fn dropping_the_manager_resolves_running_bolus_with_estimate() {
    let h = activated(PodConfig::default());
    let handle = h.manager.bolus(2.0, None).unwrap();
    h.clock.advance(Duration::from_secs(38));

    drop(h.manager);
    let result = handle.wait_timeout(WAIT);
    assert_eq!(result, Some(BolusResult { units_delivered: 1.0 }));
}

#[test]
fn cancel_twenty_seconds_into_two_units_estimates_half() {
    let h = activated(PodConfig::default());
    let handle = h.manager.bolus(2.0, None).unwrap();

    // Start time is backdated by the 2 s round trip.
    h.clock.advance(Duration::from_secs(18));
    let result = h.manager.cancel_bolus().unwrap();

    assert_eq!(result.units_delivered, 0.5);
    assert_eq!(handle.wait_timeout(WAIT), Some(result));
    assert!(!h.manager.has_active_bolus());
    assert!(h.sink.contains(&PodEvent::BolusFinished {
        units_delivered: 0.5,
        cancelled: true
    }));

    let cancel = h.pod.last_sent().unwrap();
    assert_eq!(cancel.command.name(), "cancel-delivery");
}

#[test]
fn cancel_past_the_end_is_capped_at_requested_units() {
    let h = activated(PodConfig::default());
    let handle = h.manager.bolus(1.0, None).unwrap();
    h.clock.advance(Duration::from_secs(600));
    assert_eq!(h.manager.cancel_bolus().unwrap().units_delivered, 1.0);
    assert_eq!(handle.wait().units_delivered, 1.0);
}

#[test]
fn cancel_without_bolus_is_illegal() {
    let h = activated(fast_config());
    let err = h.manager.cancel_bolus().unwrap_err();
    assert_eq!(
        err,
        Error::IllegalDeliveryStatus {
            expected: DeliveryStatus::BolusInProgress,
            actual: DeliveryStatus::Suspended
        }
    );
    assert!(h.pod.sent().is_empty());
}

#[test]
fn second_bolus_while_active_is_refused() {
    let h = activated(PodConfig::default());
    let _first = h.manager.bolus(1.0, None).unwrap();
    let err = h.manager.bolus(1.0, None).err().unwrap();
    assert!(matches!(
        err,
        Error::IllegalDeliveryStatus {
            expected: DeliveryStatus::Normal,
            ..
        }
    ));
    assert_eq!(h.pod.count("bolus"), 1);
    h.manager.cancel_bolus().unwrap();
}

#[test]
fn out_of_range_units_are_rejected_before_sending() {
    let h = activated(fast_config());
    for units in [0.0, -1.0, 30.05, f64::NAN] {
        let err = h.manager.bolus(units, None).err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)), "{units}: {err:?}");
    }
    assert!(h.pod.sent().is_empty());
}

#[test]
fn bolus_before_activation_is_not_ready() {
    let h = unpaired(fast_config());
    let err = h.manager.bolus(1.0, None).err().unwrap();
    assert_eq!(err, Error::NotReady { actual: None });
}

#[test]
fn refused_cancel_keeps_bolus_running() {
    let h = activated(PodConfig::default());
    let handle = h.manager.bolus(1.0, None).unwrap();
    let refused = CommandError::certain(CommandErrorKind::IllegalDeliveryStatus);
    h.pod.fail_on("cancel-delivery", 1, refused);

    assert_eq!(
        h.manager.cancel_bolus().unwrap_err(),
        Error::CertainCommandFailure(refused)
    );
    assert!(h.manager.has_active_bolus());
    assert!(!handle.is_resolved());

    h.manager.cancel_bolus().unwrap();
    assert!(handle.is_resolved());
}

#[test]
fn lost_bolus_reply_confirmed_by_verification_starts_tracking() {
    let h = activated(fast_config());
    h.pod.fail_on("bolus", 1, CommandError::communication());

    let handle = h.manager.bolus(1.0, None).unwrap();
    assert_eq!(&h.pod.sent_names()[..2], &["bolus", "cancel-none"]);
    assert_eq!(handle.wait_timeout(WAIT).unwrap().units_delivered, 1.0);
}

#[test]
fn unresolved_bolus_reply_is_uncertain_and_not_tracked() {
    let h = activated(fast_config());
    h.pod.fail_on("bolus", 1, CommandError::communication());
    h.pod.fail_on("cancel-none", 1, CommandError::communication());

    let err = h.manager.bolus(1.0, None).err().unwrap();
    assert!(matches!(err, Error::UncertainCommandFailure(_)));
    assert!(!err.is_certain_failure());
    assert!(!h.manager.has_active_bolus());
}

#[test]
fn verification_nonce_rejection_makes_bolus_failure_certain() {
    let h = activated(fast_config());
    let sent_nonce = h.manager.session().unwrap().current_nonce();
    h.pod.fail_on("bolus", 1, CommandError::communication());
    h.pod
        .fail_on("cancel-none", 1, CommandError::nonce_out_of_sync(Some(sent_nonce)));

    let err = h.manager.bolus(1.0, None).err().unwrap();
    assert!(matches!(err, Error::CertainCommandFailure(e) if e.certain));
    assert!(!h.manager.has_active_bolus());
    // The pod's resync value wins.
    assert_eq!(h.manager.session().unwrap().current_nonce(), sent_nonce);
    // A retry is sent with the nonce the pod expects.
    let _ = h.manager.bolus(1.0, None).unwrap();
    let retry = h
        .pod
        .sent()
        .into_iter()
        .rev()
        .find(|e| e.command.name() == "bolus")
        .unwrap();
    assert_eq!(retry.nonce, Some(sent_nonce));
}

#[test]
fn deactivation_resolves_running_bolus_with_estimate() {
    let h = activated(PodConfig::default());
    let handle = h.manager.bolus(2.0, None).unwrap();
    h.clock.advance(Duration::from_secs(38));

    h.manager.deactivate().unwrap();
    assert_eq!(handle.wait_timeout(WAIT).unwrap().units_delivered, 1.0);
    assert!(!h.manager.has_active_bolus());
}

#[test]
fn bolus_ids_do_not_leak_between_boluses() {
    let h = activated(fast_config());
    let first = h.manager.bolus(0.5, None).unwrap();
    first.wait_timeout(WAIT).unwrap();
    let second = h.manager.bolus(0.5, None).unwrap();
    assert_eq!(second.wait_timeout(WAIT).unwrap().units_delivered, 0.5);
    assert_eq!(first.try_result().unwrap().units_delivered, 0.5);
}
