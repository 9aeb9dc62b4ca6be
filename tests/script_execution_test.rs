//! Integration tests for running experiment scripts through the controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use viperbox_control::config::AppConfig;
use viperbox_control::document::read_document;
use viperbox_control::hardware::mock::MockViperBox;
use viperbox_control::scheduler::{Script, ScriptStep};
use viperbox_control::{ViperController, ViperError};

const PROTOCOL: &str = r#"<Program file_name="protocol">
    <Settings>
        <StimulationWaveformSettings>
            <Configuration start_time="0" box="1" probe="1" stimunit="1-2" polarity="0" pulses="5"
                amplitude1="10" amplitude2="10" duration="600" prephase="0" width1="170"
                interphase="60" width2="170" discharge="200" aftertrain="0"/>
        </StimulationWaveformSettings>
        <StimulationMappingSettings>
            <Mapping start_time="0" box="1" probe="1" stimunit="1" electrodes="1-4"/>
            <Mapping start_time="0" box="1" probe="1" stimunit="2" electrodes="10"/>
        </StimulationMappingSettings>
    </Settings>
    <Instructions>
        <Instruction start_time="0" instruction_type="recording_start"/>
        <Instruction start_time="0.05" instruction_type="stimulation_start" box="1" probe="1" stimunit="1"/>
        <Instruction start_time="0.1" instruction_type="stimulation_start" box="1" probe="1" stimunit="2"/>
        <Instruction start_time="0.15" instruction_type="recording_stop"/>
    </Instructions>
</Program>"#;

fn setup(boxless: bool) -> (TempDir, Arc<MockViperBox>, Arc<ViperController>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.storage.recordings_dir = dir.path().join("Recordings");
    config.storage.journal_dir = dir.path().join("Stimulations");
    config.scheduler.poll_interval_ms = 2;
    let device = Arc::new(MockViperBox::new());
    let controller = Arc::new(ViperController::new(device.clone(), config));
    controller.connect("-", true, boxless).unwrap();
    (dir, device, controller)
}

fn write_script(dir: &TempDir, name: &str, xml: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, xml).unwrap();
    path
}

#[test]
fn boxless_script_runs_to_completion() {
    let (dir, _, controller) = setup(true);
    let script = write_script(&dir, "protocol.xml", PROTOCOL);

    let started = Instant::now();
    controller.run_script(&script).unwrap();
    let report = controller.wait_script().unwrap();

    assert!(report.succeeded(), "failures: {:?}", report.failures);
    // Two settings groups plus four instructions.
    assert_eq!(report.executed, 6);
    assert!(started.elapsed() >= Duration::from_millis(145));
    assert!(!controller.status().recording);

    let journals: Vec<_> = std::fs::read_dir(dir.path().join("Stimulations"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(journals.len(), 1);
    let journal = read_document(&journals[0]).unwrap();
    assert!(journal
        .attr("file_name")
        .unwrap()
        .starts_with("protocol_"));

    let masks: Vec<&str> = journal
        .descendants()
        .into_iter()
        .filter_map(|e| e.attr("SU_bitmask"))
        .collect();
    assert_eq!(masks, ["128", "64"]);

    let mapping_count = journal
        .descendants()
        .into_iter()
        .filter(|e| e.name == "Mapping")
        .count();
    assert_eq!(mapping_count, 2);

    // The journal reads back as a script; settings uploaded before the recording keep -1.
    let replay = Script::load(&journals[0]).unwrap();
    let instructions = replay
        .steps
        .iter()
        .filter(|step| matches!(step, ScriptStep::Instruction { .. }))
        .count();
    assert_eq!(instructions, 4);
    assert!(replay
        .steps
        .iter()
        .filter(|step| matches!(step, ScriptStep::Settings { .. }))
        .all(|step| step.start_time() == -1.0));
}

#[test]
fn script_resets_session_to_first_probe() {
    let (dir, device, controller) = setup(false);
    controller.load_default_settings().unwrap();
    assert_eq!(controller.settings_snapshot().connected().get(&0).map(Vec::len), Some(4));

    let script = write_script(&dir, "protocol.xml", PROTOCOL);
    device.clear_calls();
    controller.run_script(&script).unwrap();
    let report = controller.wait_script().unwrap();
    assert!(report.succeeded(), "failures: {:?}", report.failures);

    assert_eq!(device.calls()[0], "init_probe 0 0");
    assert_eq!(controller.settings_snapshot().connected().get(&0), Some(&vec![0]));
    let settings = controller.settings_snapshot();
    let probe = settings.probe(0, 0).unwrap();
    assert!(probe.channels.is_empty());
    assert_eq!(probe.stim_units.len(), 2);
    assert_eq!(probe.electrode_maps.get(&0), Some(&vec![0, 1, 2, 3]));
    assert!(device
        .calls()
        .contains(&"trigger_stim_units 0 0 128".to_string()));
}

#[test]
fn failing_entry_is_reported_and_script_continues() {
    let (dir, _, controller) = setup(true);
    let script = write_script(
        &dir,
        "bad.xml",
        r#"<Program>
            <Instructions>
                <Instruction start_time="0" instruction_type="stimulation_start" box="1" probe="1" stimunit="1"/>
                <Instruction start_time="0" instruction_type="recording_start"/>
                <Instruction start_time="0" instruction_type="recording_stop"/>
            </Instructions>
        </Program>"#,
    );

    controller.run_script(&script).unwrap();
    let report = controller.wait_script().unwrap();
    assert_eq!(report.executed, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, 0);
    assert_eq!(report.failures[0].1, ViperError::NotRecording.to_string());
}

#[test]
fn invalid_script_is_rejected_before_running() {
    let (dir, _, controller) = setup(true);
    let script = write_script(
        &dir,
        "unordered.xml",
        r#"<Program>
            <Instructions>
                <Instruction start_time="2" instruction_type="recording_start"/>
                <Instruction start_time="1" instruction_type="recording_stop"/>
            </Instructions>
        </Program>"#,
    );
    assert!(controller.run_script(&script).is_err());
    assert!(controller.wait_script().is_err());
}

#[test]
fn abort_stops_waiting_script() {
    let (dir, _, controller) = setup(true);
    let script = write_script(
        &dir,
        "long.xml",
        r#"<Program>
            <Instructions>
                <Instruction start_time="0" instruction_type="recording_start"/>
                <Instruction start_time="30" instruction_type="recording_stop"/>
            </Instructions>
        </Program>"#,
    );

    controller.run_script(&script).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(matches!(
        controller.run_script(&script),
        Err(ViperError::ScriptAlreadyRunning)
    ));

    let started = Instant::now();
    controller.abort_script().unwrap();
    let report = controller.wait_script().unwrap();
    assert!(report.aborted);
    assert_eq!(report.executed, 1);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The recording started by the script is still active until stopped explicitly.
    assert!(controller.status().recording);
    controller.stop_recording().unwrap();
}
