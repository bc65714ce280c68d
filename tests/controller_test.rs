//! End-to-end tests for the control loop:
//! - Gear and lockup frames on the simulated bus
//! - Send timeouts that must not stall gear state
//! - Online retraining at the buffer threshold
//! - Bus release on every exit path

use atecu::bus::{BusChannel, BusFrame, FaultKind, SimulatedBus, SimulatedBusHandle};
use atecu::config::{BusBackend, Config, RetrainMode};
use atecu::controller::{
    CycleOutcome, JsonLinesStatusSink, LogStatusSink, ReplaySource, StatusSink, SyntheticDrive,
    TransmissionController, VehicleDataSource,
};
use atecu::lockup::{content_hash, sidecar_path, LockupNet, LockupPredictor, ModelArtifact};
use atecu::types::{GearState, StatusRecord};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

// =====================================================================
// HELPERS
// =====================================================================

fn write_model(dir: &Path) -> PathBuf {
    let path = dir.join("models").join("torque_converter.json");
    ModelArtifact::from_net(&LockupNet::seeded(7))
        .unwrap()
        .save(&path)
        .unwrap();
    path
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.bus.backend = BusBackend::Simulated;
    config.lockup.model_path = Some(write_model(dir));
    config.lockup.retrain_mode = RetrainMode::Inline;
    config
}

/// Status sink that keeps every record for inspection
#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<StatusRecord>>>);

impl StatusSink for Collect {
    fn emit(&mut self, record: &StatusRecord) {
        self.0.lock().unwrap().push(record.clone());
    }
}

fn build(
    config: &Config,
    source: impl VehicleDataSource + 'static,
    sink: impl StatusSink + 'static,
) -> (TransmissionController, SimulatedBusHandle) {
    let (device, handle) = SimulatedBus::new("vcan0");
    let bus = BusChannel::open(Box::new(device), config.bus.bitrate).unwrap();
    let predictor = LockupPredictor::open(&config.lockup).unwrap();
    let controller =
        TransmissionController::new(config, bus, predictor, Box::new(source), Box::new(sink)).unwrap();
    (controller, handle)
}

fn replay(lines: &[&str]) -> ReplaySource {
    let data = lines.join("\n");
    ReplaySource::from_reader(data.as_bytes(), Path::new("test.jsonl")).unwrap()
}

fn reading(speed: f64, throttle: f64) -> String {
    format!(
        r#"{{"throttle":{throttle},"speed":{speed},"rpm":{},"engine_temp":88,"trans_temp":75}}"#,
        800.0 + speed * 35.0
    )
}

// =====================================================================
// GEAR AND LOCKUP FRAMES
// =====================================================================

#[test]
fn test_upshift_sequence_on_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let lines: Vec<String> = [5.0, 25.0, 45.0, 70.0, 70.0]
        .iter()
        .map(|&s| reading(s, 0.3))
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let (mut ctl, handle) = build(&config, replay(&refs), LogStatusSink::new());

    while !matches!(ctl.run_cycle(), CycleOutcome::Finished) {}

    let gears: Vec<u8> = handle
        .sent()
        .iter()
        .filter(|f| f.id() == config.bus.gear_command_id)
        .map(|f| f.payload()[0])
        .collect();
    assert_eq!(gears, vec![1, 2, 3, 4]);

    let lockups = handle
        .sent()
        .iter()
        .filter(|f| f.id() == config.bus.lockup_command_id)
        .count();
    assert_eq!(lockups, 5);
    assert!(handle.sent().iter().all(|f| f.payload().len() == 8));
}

#[test]
fn test_status_records_follow_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let sink = Collect::default();
    let (mut ctl, _handle) = build(
        &config,
        replay(&[
            r#"{"throttle":0.2,"speed":10,"rpm":1150,"engine_temp":85,"trans_temp":70,"efficiency":11.5}"#,
            r#"{"throttle":0.1,"speed":50,"rpm":2550,"engine_temp":85,"trans_temp":70}"#,
        ]),
        sink.clone(),
    );
    ctl.run_cycle();
    ctl.run_cycle();

    let records = sink.0.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].cycle, 1);
    assert_eq!(records[0].gear, GearState::Gear1);
    assert_eq!(records[0].efficiency, Some(11.5));
    assert_eq!(records[1].gear, GearState::Gear3);
    assert_eq!(records[1].efficiency, None);
}

#[test]
fn test_json_status_lines() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let out = tempfile::NamedTempFile::new().unwrap();
    let file = out.reopen().unwrap();
    let (mut ctl, _handle) = build(&config, SyntheticDrive::new(), JsonLinesStatusSink::new(file));
    for _ in 0..3 {
        ctl.run_cycle();
    }
    drop(ctl);

    let text = std::fs::read_to_string(out.path()).unwrap();
    let records: Vec<StatusRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].cycle, 3);
}

// =====================================================================
// BUS FAILURES
// =====================================================================

#[test]
fn test_gear_timeout_does_not_block_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let line = reading(10.0, 0.2);
    let (mut ctl, handle) = build(&config, replay(&[line.as_str(), line.as_str()]), LogStatusSink::new());
    handle.fail_next_send(FaultKind::Timeout);

    assert!(matches!(ctl.run_cycle(), CycleOutcome::Completed(_)));
    assert_eq!(ctl.current_gear(), GearState::Gear1);
    assert_eq!(ctl.stats().send_failures.get("timeout"), Some(&1));

    assert!(matches!(ctl.run_cycle(), CycleOutcome::Completed(_)));
    assert_eq!(ctl.stats().cycles, 2);
}

#[test]
fn test_link_down_is_counted_and_loop_continues() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (mut ctl, handle) = build(&config, SyntheticDrive::new(), LogStatusSink::new());
    handle.fail_next_send(FaultKind::LinkDown);
    handle.fail_next_send(FaultKind::LinkDown);
    for _ in 0..4 {
        assert!(matches!(ctl.run_cycle(), CycleOutcome::Completed(_)));
    }
    assert_eq!(ctl.stats().send_failures.get("link_down"), Some(&2));
    assert_eq!(ctl.stats().cycles, 4);
}

#[test]
fn test_inbound_receive_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (mut ctl, handle) = build(&config, SyntheticDrive::new(), LogStatusSink::new());
    handle.fail_next_receive(FaultKind::AccessDenied);
    handle.push_inbound(BusFrame::new(0x3E8, &[1, 2]).unwrap());
    assert!(matches!(ctl.run_cycle(), CycleOutcome::Completed(_)));
    assert!(matches!(ctl.run_cycle(), CycleOutcome::Completed(_)));
    assert_eq!(ctl.stats().inbound_frames, 1);
}

// =====================================================================
// ONLINE LEARNING
// =====================================================================

#[test]
fn test_retrain_at_threshold_persists_verified_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let model_path = config.lockup.model_path.clone().unwrap();
    let before = std::fs::read(&model_path).unwrap();
    let (mut ctl, _handle) = build(&config, SyntheticDrive::new(), LogStatusSink::new());

    for _ in 0..100 {
        ctl.run_cycle();
    }
    let stats = ctl.predictor().stats().clone();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(ctl.predictor().buffer_len(), 0);

    let after = std::fs::read(&model_path).unwrap();
    assert_ne!(before, after);
    let recorded = std::fs::read_to_string(sidecar_path(&model_path)).unwrap();
    assert_eq!(recorded.trim(), content_hash(&after));
    assert_eq!(stats.model_hash, content_hash(&after));

    // A fresh predictor accepts what was persisted
    LockupPredictor::open(&config.lockup).unwrap();
}

// =====================================================================
// STARTUP AND SHUTDOWN
// =====================================================================

#[test]
fn test_startup_fails_on_tampered_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let path = config.lockup.model_path.clone().unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"\n").unwrap();

    let err = TransmissionController::startup(&config, Box::new(SyntheticDrive::new()), Box::new(LogStatusSink::new()))
        .err()
        .unwrap();
    let message = err.to_string();
    assert!(message.contains("integrity"), "{message}");
    assert!(message.contains("torque_converter.json"), "{message}");
}

#[test]
fn test_startup_fails_without_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::remove_file(sidecar_path(config.lockup.model_path.as_ref().unwrap())).unwrap();
    let result = TransmissionController::startup(&config, Box::new(SyntheticDrive::new()), Box::new(LogStatusSink::new()));
    assert!(matches!(
        result.err(),
        Some(atecu::StartupError::Integrity(atecu::IntegrityError::MissingSidecar { .. }))
    ));
}

#[test]
fn test_startup_with_simulated_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut ctl =
        TransmissionController::startup(&config, Box::new(SyntheticDrive::new()), Box::new(LogStatusSink::new()))
            .unwrap();
    assert!(ctl.bus().is_up());
    assert!(matches!(ctl.run_cycle(), CycleOutcome::Completed(_)));
}

#[test]
fn test_run_closes_bus_after_max_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.control.cadence_hz = 500.0;
    let (ctl, handle) = build(&config, SyntheticDrive::new(), LogStatusSink::new());

    let stats = tokio_test::block_on(ctl.run(Arc::new(AtomicBool::new(true)), Some(10)));
    assert_eq!(stats.cycles, 10);
    assert!(!handle.is_up());
    assert_eq!(handle.bring_down_count(), 1);
}

#[tokio::test]
async fn test_background_retrain_under_running_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.lockup.retrain_mode = RetrainMode::Background;
    config.control.cadence_hz = 1000.0;
    let (ctl, handle) = build(&config, SyntheticDrive::new(), LogStatusSink::new());

    let stats = ctl.run(Arc::new(AtomicBool::new(true)), Some(400)).await;
    assert_eq!(stats.cycles, 400);
    assert!(!handle.is_up());
}
