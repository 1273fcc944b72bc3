//! Activation sequence: pairing, priming, cannula insertion.

use std::sync::Arc;

use embassy_time::Duration;

use crate::mock_pod::{MockPod, SharedStore, activated, fast_config, harness, unpaired};
use podcore::adapters::sim::{RadioFault, SimulatedPod};
use podcore::adapters::store::{KvSessionStore, MemoryStorage};
use podcore::adapters::time::SystemClock;
use podcore::app::events::PodEvent;
use podcore::error::CommandErrorKind;
use podcore::pod::SetupProgress;
use podcore::pod::schedule::BasalSchedule;
use podcore::{CommandError, Error, PodConfig, PodManager, SetupActionResult};

fn schedule() -> BasalSchedule {
    BasalSchedule::flat(1.0).unwrap()
}

fn progress(h: &crate::mock_pod::Harness) -> Option<SetupProgress> {
    h.manager.session().map(|s| s.setup_progress())
}

#[test]
fn full_activation_reaches_completed() {
    let h = unpaired(fast_config());

    let priming = h.manager.pair_and_prime().unwrap();
    assert_eq!(priming.expected(), SetupProgress::PrimingFinished);
    assert_eq!(progress(&h), Some(SetupProgress::Priming));
    priming.finish().unwrap();
    assert_eq!(progress(&h), Some(SetupProgress::PrimingFinished));

    let insertion = h.manager.insert_cannula(schedule()).unwrap();
    assert_eq!(progress(&h), Some(SetupProgress::CannulaInserting));
    assert_eq!(insertion.wait(), SetupActionResult::Success);

    assert!(h.manager.is_ready_for_delivery());
    assert_eq!(
        h.pod.sent_names(),
        vec!["assign-address", "prime", "get-status", "insert-cannula", "get-status"]
    );
    assert_eq!(
        h.manager.session().unwrap().basal_schedule(),
        Some(&schedule())
    );
}

#[test]
fn activation_events_follow_setup_order() {
    let h = unpaired(fast_config());
    h.manager.pair_and_prime().unwrap().finish().unwrap();
    h.manager.insert_cannula(schedule()).unwrap().finish().unwrap();

    let setup: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PodEvent::SetupProgressChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        setup,
        vec![
            SetupProgress::Priming,
            SetupProgress::PrimingFinished,
            SetupProgress::CannulaInserting,
            SetupProgress::Completed,
        ]
    );
    assert!(h.sink.contains(&PodEvent::SessionCreated {
        address: crate::mock_pod::POD_ADDRESS
    }));
}

#[test]
fn priming_nonce_comes_from_pairing_seed() {
    let h = unpaired(fast_config());
    h.manager.pair_and_prime().unwrap().finish().unwrap();
    let prime = h
        .pod
        .sent()
        .into_iter()
        .find(|e| e.command.name() == "prime")
        .unwrap();
    assert_eq!(
        prime.nonce.map(|n| n.value()),
        Some(crate::mock_pod::NONCE_SEED)
    );
    assert_eq!(prime.address, Some(crate::mock_pod::POD_ADDRESS));
}

#[test]
fn insert_cannula_without_session_is_out_of_sequence() {
    let h = unpaired(fast_config());
    let err = h.manager.insert_cannula(schedule()).err().unwrap();
    assert_eq!(
        err,
        Error::OutOfSequence {
            expected: SetupProgress::PrimingFinished,
            actual: None
        }
    );
    assert!(h.pod.sent().is_empty());
}

#[test]
fn insert_cannula_while_priming_is_out_of_sequence() {
    // Real priming delay: verification stays pending for the whole test.
    let h = unpaired(PodConfig::default());
    let priming = h.manager.pair_and_prime().unwrap();
    assert_eq!(priming.wait_timeout(Duration::from_millis(20)), None);

    let err = h.manager.insert_cannula(schedule()).err().unwrap();
    assert_eq!(
        err,
        Error::OutOfSequence {
            expected: SetupProgress::PrimingFinished,
            actual: Some(SetupProgress::Priming)
        }
    );
    priming.cancel();
    assert_eq!(h.pod.count("insert-cannula"), 0);
}

#[test]
fn insert_cannula_after_completion_is_out_of_sequence() {
    let h = activated(fast_config());
    let err = h.manager.insert_cannula(schedule()).err().unwrap();
    assert_eq!(
        err,
        Error::OutOfSequence {
            expected: SetupProgress::CannulaInserting,
            actual: Some(SetupProgress::Completed)
        }
    );
}

#[test]
fn priming_again_after_priming_finished_is_refused() {
    let h = unpaired(fast_config());
    h.manager.pair_and_prime().unwrap().finish().unwrap();
    let err = h.manager.pair_and_prime().err().unwrap();
    assert_eq!(
        err,
        Error::OutOfSequence {
            expected: SetupProgress::AddressAssigned,
            actual: Some(SetupProgress::PrimingFinished)
        }
    );
    assert_eq!(h.pod.count("prime"), 1);
}

#[test]
fn stalled_priming_reports_failure_with_actual_progress() {
    let pod = MockPod::new();
    pod.hold_progress(true);
    let h = harness(pod, SharedStore::default(), fast_config());

    let priming = h.manager.pair_and_prime().unwrap();
    assert_eq!(priming.wait(), SetupActionResult::Failure(SetupProgress::Priming));
    assert_eq!(progress(&h), Some(SetupProgress::Priming));
    // One status reply settles it.
    assert_eq!(h.pod.count("get-status"), 1);
}

#[test]
fn unanswered_status_polls_exhaust_verification() {
    let h = unpaired(fast_config());
    h.pod.fail_on("get-status", 3, CommandError::communication());

    let err = h.manager.pair_and_prime().unwrap().finish().unwrap_err();
    assert_eq!(
        err,
        Error::VerificationExhausted(CommandError::communication())
    );
    assert_eq!(h.pod.count("get-status"), 3);
    assert_eq!(progress(&h), Some(SetupProgress::Priming));
}

#[test]
fn lost_status_poll_is_retried_and_step_completes() {
    let h = unpaired(fast_config());
    h.pod.fail_on("get-status", 1, CommandError::communication());

    h.manager.pair_and_prime().unwrap().finish().unwrap();
    assert_eq!(h.pod.count("get-status"), 2);
    assert_eq!(progress(&h), Some(SetupProgress::PrimingFinished));

    h.pod.fail_on("get-status", 2, CommandError::communication());
    h.manager.insert_cannula(schedule()).unwrap().finish().unwrap();
    assert_eq!(h.pod.count("get-status"), 5);
    assert_eq!(progress(&h), Some(SetupProgress::Completed));
}

#[test]
fn failed_prime_leaves_progress_and_runs_no_verification() {
    let h = unpaired(fast_config());
    let refused = CommandError::certain(CommandErrorKind::IllegalSetupProgress);
    h.pod.fail_on("prime", 1, refused);

    let err = h.manager.pair_and_prime().err().unwrap();
    assert_eq!(err, Error::CertainCommandFailure(refused));
    assert_eq!(progress(&h), Some(SetupProgress::AddressAssigned));

    std::thread::sleep(std::time::Duration::from_millis(150));
    assert_eq!(h.pod.count("get-status"), 0);
}

#[test]
fn failed_pairing_creates_no_session() {
    let h = unpaired(fast_config());
    h.pod.fail_on("assign-address", 1, CommandError::communication());
    let err = h.manager.pair_and_prime().err().unwrap();
    assert!(matches!(err, Error::UncertainCommandFailure(_)));
    assert!(h.manager.session().is_none());
    assert!(h.store.snapshot().is_none());
}

#[test]
fn session_survives_manager_restart() {
    let h = unpaired(fast_config());
    h.manager.pair_and_prime().unwrap().finish().unwrap();
    h.manager.insert_cannula(schedule()).unwrap().finish().unwrap();
    let before = h.manager.session().unwrap();

    let resumed = harness(MockPod::running(), h.store.clone(), fast_config());
    assert_eq!(resumed.manager.session(), Some(before));
    assert!(resumed.manager.is_ready_for_delivery());
}

#[test]
fn pending_verification_resolves_when_manager_is_dropped() {
    // Slow enough that the manager is gone before the delay runs out.
    let h = unpaired(PodConfig::time_scaled(50.0));
    let priming = h.manager.pair_and_prime().unwrap();
    drop(h.manager);

    assert_eq!(
        priming.wait_timeout(Duration::from_secs(5)),
        Some(SetupActionResult::VerificationFailure(CommandError::certain(
            CommandErrorKind::Other
        )))
    );
    assert_eq!(h.pod.count("get-status"), 0);
    // The stored session is untouched and can be resumed.
    assert_eq!(
        h.store.snapshot().map(|s| s.setup_progress()),
        Some(SetupProgress::Priming)
    );
}

#[test]
fn invalid_config_is_rejected() {
    let config = PodConfig {
        verification_tries: 0,
        ..PodConfig::default()
    };
    let result = PodManager::new(
        MockPod::new(),
        SharedStore::default(),
        crate::mock_pod::RecordingSink::default(),
        Arc::new(crate::mock_pod::ManualClock::new()),
        config,
    );
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

// ── Against the simulated pod ─────────────────────────────────

fn simulated() -> (PodManager<SimulatedPod, KvSessionStore<MemoryStorage>>, SimulatedPod) {
    let config = PodConfig::time_scaled(1000.0);
    let pod = SimulatedPod::new(&config);
    let manager = PodManager::new(
        pod.clone(),
        KvSessionStore::new(MemoryStorage::new()),
        podcore::adapters::log_sink::LogEventSink::new(),
        Arc::new(SystemClock::default()),
        config,
    )
    .unwrap();
    (manager, pod)
}

#[test]
fn simulated_pod_activates_and_delivers() {
    let (manager, pod) = simulated();
    manager.pair_and_prime().unwrap().finish().unwrap();
    manager.insert_cannula(schedule()).unwrap().finish().unwrap();
    assert!(manager.is_ready_for_delivery());

    let result = manager.bolus(0.5, None).unwrap().wait();
    assert_eq!(result.units_delivered, 0.5);
    assert!(pod.commands_seen() >= 5);
}

#[test]
fn lost_insertion_reply_is_uncertain() {
    let (manager, pod) = simulated();
    manager.pair_and_prime().unwrap().finish().unwrap();
    let nonce_after_prime = manager.session().unwrap().current_nonce();

    pod.inject(RadioFault::LoseReply);
    let task = manager.insert_cannula(schedule());
    // The pod inserted the cannula but the host never heard back.
    assert!(matches!(task, Err(Error::UncertainCommandFailure(_))));
    assert_eq!(
        manager.session().unwrap().setup_progress(),
        SetupProgress::PrimingFinished
    );
    assert_eq!(
        manager.session().unwrap().current_nonce(),
        nonce_after_prime.next()
    );
}
