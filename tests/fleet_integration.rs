//! End-to-end tests of the protocol interface over simulated scopes.

use std::sync::Arc;
use std::time::{Duration, Instant};
use vscope::config::Settings;
use vscope::data::snapshot::{CaptureTiming, SnapshotStore};
use vscope::hardware::fleet::{DeviceFleet, LockPolicy};
use vscope::hardware::mock::{MockScanner, ScopeModel, SharedModel, SIM_PID, SIM_VID};
use vscope::protocol::interface::Interface;
use vscope::protocol::state::RunState;
use vscope::VscopeError;

const CHANNELS: u16 = 3;
const BUFFER_LENGTH: u16 = 1000;

fn settings() -> Settings {
    Settings {
        usb_vid: SIM_VID.to_string(),
        usb_pid: SIM_PID.to_string(),
        onboard_polling_rate: 50_000.0,
        ..Settings::default()
    }
}

struct Bench {
    scanner: MockScanner,
    models: Vec<SharedModel>,
    interface: Interface,
}

async fn bench(count: usize) -> Bench {
    let scanner = MockScanner::new();
    let models = (0..count)
        .map(|index| {
            scanner.add_port(
                &format!("/dev/sim{index}"),
                ScopeModel::new(&format!("sim{index}"), CHANNELS, BUFFER_LENGTH),
            )
        })
        .collect();
    let fleet = Arc::new(DeviceFleet::new(Arc::new(scanner.clone())));
    let interface = Interface::from_settings(fleet, &settings());
    interface.refresh(&settings()).await.unwrap();
    Bench {
        scanner,
        models,
        interface,
    }
}

#[tokio::test]
async fn timing_round_trips_through_registers() {
    let bench = bench(3).await;

    assert!(bench.interface.set_timing(1.0, 0.1).await.unwrap());
    for model in &bench.models {
        let model = model.lock().unwrap();
        assert_eq!((model.divider, model.pretrigger), (50, 100));
    }

    let (acquisition, pretrigger) = bench.interface.get_timing().await.unwrap().unwrap();
    assert!((acquisition - 1.0).abs() < 1e-9);
    assert!((pretrigger - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn timing_disagreement_reads_as_none() {
    let bench = bench(2).await;
    bench.models[1].lock().unwrap().divider = 7;
    assert_eq!(bench.interface.get_timing().await.unwrap(), None);
}

#[tokio::test]
async fn register_values_are_shared_within_tolerance() {
    let bench = bench(2).await;

    bench.models[0].lock().unwrap().registers[3] = 0.0;
    bench.models[1].lock().unwrap().registers[3] = 5e-7;
    assert_eq!(bench.interface.get_buff(3).await.unwrap(), Some(0.0));

    bench.models[1].lock().unwrap().registers[3] = 2e-6;
    assert_eq!(bench.interface.get_buff(3).await.unwrap(), None);
}

#[tokio::test]
async fn register_write_reads_back() {
    let bench = bench(2).await;
    assert_eq!(
        bench.interface.write_register(4, 2.5).await.unwrap(),
        Some(2.5)
    );
    assert_eq!(bench.interface.write_register(99, 1.0).await.unwrap(), None);
}

#[tokio::test]
async fn unrequestable_state_is_never_sent() {
    let bench = bench(2).await;

    assert!(bench.interface.change_state(RunState::Running).await.unwrap());
    assert!(!bench.interface.set_state(3).await.unwrap());
    assert!(!bench
        .interface
        .change_state(RunState::Misconfigured)
        .await
        .unwrap());
    assert_eq!(
        bench.interface.get_run_state().await.unwrap(),
        Some(RunState::Running)
    );
}

#[tokio::test]
async fn failed_state_change_halts_remaining_devices() {
    let bench = bench(2).await;
    assert!(bench.interface.change_state(RunState::Running).await.unwrap());

    bench.scanner.faults("/dev/sim1").unwrap().set_silent(true);
    assert!(!bench
        .interface
        .change_state(RunState::Acquiring)
        .await
        .unwrap());

    assert_eq!(
        bench.interface.get_run_state().await.unwrap(),
        Some(RunState::Halted)
    );
    assert_eq!(bench.interface.fleet().identifiers().await, vec!["sim0"]);
}

#[tokio::test]
async fn silent_device_is_removed_and_reported_alone() {
    let bench = bench(3).await;
    bench.scanner.faults("/dev/sim1").unwrap().set_silent(true);

    let err = bench.interface.get_state().await.unwrap_err();
    match err {
        VscopeError::CommunicationFailure { failed } => assert_eq!(failed, vec!["sim1"]),
        other => panic!("expected a communication failure, got {other:?}"),
    }

    let fleet = bench.interface.fleet();
    assert_eq!(fleet.identifiers().await, vec!["sim0", "sim2"]);
    assert_eq!(bench.interface.get_state().await.unwrap(), Some(0));
}

#[tokio::test]
async fn heterogeneous_fleet_is_rejected() {
    let scanner = MockScanner::new();
    scanner.add_port("/dev/sim0", ScopeModel::new("a", 3, 1000));
    scanner.add_port("/dev/sim1", ScopeModel::new("b", 4, 1000));
    let fleet = Arc::new(DeviceFleet::new(Arc::new(scanner)));
    let interface = Interface::from_settings(Arc::clone(&fleet), &settings());

    let err = interface.refresh(&settings()).await.unwrap_err();
    match err {
        VscopeError::ConfigMismatch {
            reference,
            divergent,
            ..
        } => {
            assert_eq!(reference, "a");
            assert_eq!(divergent, vec!["b: 4ch/1000buf"]);
        }
        other => panic!("expected a configuration mismatch, got {other:?}"),
    }
    assert!(fleet.layout().await.is_none());
    assert!(matches!(
        interface.get_state().await,
        Err(VscopeError::Unconfigured)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bounded_handle_is_busy_during_a_slow_command() {
    let bench = bench(2).await;
    bench
        .scanner
        .faults("/dev/sim0")
        .unwrap()
        .set_latency(Duration::from_millis(500));

    let slow = bench.interface.clone();
    let in_flight = tokio::spawn(async move { slow.get_state().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bounded = bench
        .interface
        .with_lock_policy(LockPolicy::Bounded(Duration::from_millis(10)));
    let started = Instant::now();
    assert!(matches!(
        bounded.set_timing(1.0, 0.1).await,
        Err(VscopeError::Busy)
    ));
    assert!(matches!(bounded.has_devices().await, Err(VscopeError::Busy)));
    assert!(started.elapsed() < Duration::from_millis(250));

    assert_eq!(in_flight.await.unwrap().unwrap(), Some(0));
    bench
        .scanner
        .faults("/dev/sim0")
        .unwrap()
        .set_latency(Duration::ZERO);
    assert!(bounded.set_timing(1.0, 0.1).await.unwrap());
}

#[tokio::test]
async fn empty_fleet_answers_without_error() {
    let bench = bench(0).await;
    assert_eq!(bench.interface.get_state().await.unwrap(), None);
    assert!(!bench.interface.set_timing(1.0, 0.1).await.unwrap());
    assert!(bench.interface.get_frame().await.unwrap().is_empty());
}

#[tokio::test]
async fn capture_persists_and_reloads() {
    let bench = bench(2).await;
    let cache = tempfile::tempdir().unwrap();
    let mut store = SnapshotStore::new(cache.path());
    let timing = CaptureTiming {
        acquisition_time: 1.0,
        pretrigger_time: 0.1,
    };

    let uid = bench
        .interface
        .get_snapshot(&mut store, "bench run", Some(timing))
        .await
        .unwrap();

    let expected = bench.models[1].lock().unwrap().buffer.clone();
    let mut reloaded = SnapshotStore::new(cache.path());
    let report = reloaded.load_from_cache(31).unwrap();
    assert_eq!(report.registered, 1);

    let snapshot = reloaded.get_mut(uid).unwrap();
    assert!(!snapshot.is_loaded());
    assert_eq!(snapshot.description(), "bench run");
    assert_eq!(snapshot.timing(), Some(timing));
    assert_eq!(snapshot.channel_labels(), ["ch0", "ch1", "ch2"]);

    let data = snapshot.get_data().unwrap();
    assert_eq!(data.len(), 2);
    let sim1 = &data["sim1"];
    assert_eq!(sim1.shape(), (CHANNELS as usize, BUFFER_LENGTH as usize));
    assert_eq!(sim1.channel(2).unwrap()[10], expected[10][2]);
}

#[tokio::test]
async fn failed_capture_leaves_no_snapshot() {
    let bench = bench(2).await;
    bench.scanner.faults("/dev/sim0").unwrap().set_silent(true);
    let cache = tempfile::tempdir().unwrap();
    let mut store = SnapshotStore::new(cache.path());

    let err = bench
        .interface
        .get_snapshot(&mut store, "lost", None)
        .await
        .unwrap_err();
    assert!(matches!(err, VscopeError::CommunicationFailure { .. }));
    assert!(store.is_empty());
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}
