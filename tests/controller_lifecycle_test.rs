//! Integration tests for the controller state machine against the mock device.
//!
//! Covers connection, the snapshot/validate/upload/commit flow, recording guards and the
//! journal written during a boxless session.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use viperbox_control::config::AppConfig;
use viperbox_control::document::{read_document, Element};
use viperbox_control::hardware::mock::MockViperBox;
use viperbox_control::{ViperController, ViperError};

fn setup(device: MockViperBox) -> (TempDir, Arc<MockViperBox>, ViperController) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.storage.recordings_dir = dir.path().join("Recordings");
    config.storage.journal_dir = dir.path().join("Stimulations");
    let device = Arc::new(device);
    let controller = ViperController::new(device.clone(), config);
    (dir, device, controller)
}

fn channel_document(channels: &str, gain: u8) -> String {
    format!(
        r#"<Program><Settings><RecordingSettings>
            <Channel box="1" probe="1" channel="{channels}" references="b,2" gain="{gain}" input="0"/>
        </RecordingSettings></Settings></Program>"#
    )
}

fn waveform_document(amplitude: u32) -> String {
    format!(
        r#"<Program><Settings><StimulationWaveformSettings>
            <Configuration box="1" probe="1" stimunit="1-8" polarity="0" pulses="20"
                amplitude1="{amplitude}" amplitude2="{amplitude}" duration="600" prephase="0"
                width1="170" interphase="60" width2="170" discharge="200" aftertrain="1000"/>
        </StimulationWaveformSettings></Settings></Program>"#
    )
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |entries| entries.count())
}

fn instruction_types(journal: &Element) -> Vec<String> {
    journal
        .descendants()
        .into_iter()
        .filter(|e| e.name == "Instruction")
        .filter_map(|e| e.attr("instruction_type").map(str::to_string))
        .collect()
}

// =============================================================================
// Connection
// =============================================================================

#[test]
fn connect_without_device_fails() {
    let (_dir, _, controller) = setup(MockViperBox::new().with_device_count(0));
    assert!(matches!(
        controller.connect("1", false, false),
        Err(ViperError::NoDeviceFound)
    ));
    assert!(!controller.status().connected);
}

#[test]
fn connect_with_two_devices_fails() {
    let (_dir, device, controller) = setup(MockViperBox::new().with_device_count(2));
    assert!(matches!(
        controller.connect("1", false, false),
        Err(ViperError::MultipleDevicesFound(2))
    ));
    assert_eq!(device.count("open_box"), 0);
}

#[test]
fn probe_that_fails_initialisation_is_left_out() {
    let (_dir, _, controller) = setup(MockViperBox::new().with_failing_probe(0, 1));
    controller.connect("1-2", false, false).unwrap();

    let connected = controller.settings_snapshot().connected();
    assert_eq!(connected.get(&0), Some(&vec![0]));

    let err = controller
        .upload_recording_settings(
            &channel_document("1", 0).replace("probe=\"1\"", "probe=\"2\""),
            false,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, ViperError::UnknownProbe { box_id: 1, .. }));
}

#[test]
fn failed_probe_opening_closes_box() {
    let device = MockViperBox::new();
    device.fail_on("open_probes");
    let (_dir, device, controller) = setup(device);
    assert!(controller.connect("1", false, false).is_err());
    assert_eq!(device.count("close_box"), 1);
    assert!(!controller.status().connected);
}

#[test]
fn disconnect_releases_device() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    controller.disconnect().unwrap();
    assert_eq!(device.count("close_probes"), 1);
    assert_eq!(device.count("close_box"), 1);
    assert!(!controller.status().connected);
    assert!(controller.settings_snapshot().boxes.is_empty());
}

#[test]
fn reconnect_disconnects_first() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    controller.connect("1-2", false, false).unwrap();
    assert_eq!(device.count("close_box"), 1);
    assert_eq!(controller.settings_snapshot().connected().get(&0), Some(&vec![0, 1]));
}

// =============================================================================
// Uploads
// =============================================================================

#[test]
fn recording_upload_reaches_device() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    device.clear_calls();

    controller
        .upload_recording_settings(&channel_document("5", 2), false, false)
        .unwrap();

    let calls = device.calls();
    assert!(calls.contains(&"select_electrode 0 0 4 0".to_string()));
    // Bulk reference is bit 0, reference 2 is bit 2.
    assert!(calls.contains(&"set_reference 0 0 4 5".to_string()));
    assert!(calls.contains(&"set_gain 0 0 4 2".to_string()));
    assert!(calls.contains(&"set_auto_zero 0 0 4 false".to_string()));
    assert_eq!(device.count("write_channel_config"), 1);
    assert!(controller.status().recording_settings_uploaded);
}

#[test]
fn failed_upload_leaves_settings_untouched() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    controller
        .upload_recording_settings(&channel_document("1-4", 1), false, false)
        .unwrap();
    let before = controller.settings_snapshot();

    device.fail_on("set_gain");
    let err = controller
        .upload_recording_settings(&channel_document("1-4", 3), false, false)
        .unwrap_err();
    assert!(matches!(err, ViperError::UploadFailed { .. }));

    assert_eq!(controller.settings_snapshot(), before);
    assert_eq!(controller.uploaded_snapshot(), before);
    assert_eq!(
        controller.settings_snapshot().probe(0, 0).unwrap().channels[&0].gain,
        1
    );
}

#[test]
fn failed_stimulation_upload_leaves_settings_untouched() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    let fresh = controller.settings_snapshot();

    device.fail_on("write_stim_unit_config");
    let err = controller
        .upload_stimulation_settings(&waveform_document(10), false, false)
        .unwrap_err();
    assert!(matches!(err, ViperError::UploadFailed { .. }));
    assert_eq!(controller.settings_snapshot(), fresh);
    assert_eq!(controller.uploaded_snapshot(), fresh);
    assert!(!controller.status().stimulation_settings_uploaded);

    device.clear_failure();
    controller
        .upload_stimulation_settings(&waveform_document(10), false, false)
        .unwrap();
    let before = controller.settings_snapshot();
    assert!(controller.status().stimulation_settings_uploaded);

    device.fail_on("set_output_stage_image");
    assert!(controller
        .upload_stimulation_settings(&waveform_document(20), false, false)
        .is_err());
    assert_eq!(controller.settings_snapshot(), before);
    assert_eq!(controller.uploaded_snapshot(), before);
    assert!(controller.status().stimulation_settings_uploaded);
    assert_eq!(
        controller.settings_snapshot().probe(0, 0).unwrap().stim_units[&0].amplitude1,
        10
    );
}

#[test]
fn invalid_document_makes_no_device_calls() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    device.clear_calls();

    let err = controller
        .upload_recording_settings(&channel_document("1", 4), false, false)
        .unwrap_err();
    assert!(matches!(err, ViperError::InvalidGainOrInput { .. }));
    assert!(device.calls().is_empty());
    assert!(controller.settings_snapshot().probe(0, 0).unwrap().channels.is_empty());
}

#[test]
fn reset_upload_clears_previous_channels() {
    let (_dir, _, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    controller
        .upload_recording_settings(&channel_document("1-10", 0), false, false)
        .unwrap();
    controller
        .upload_recording_settings(&channel_document("3", 0), true, false)
        .unwrap();
    let settings = controller.settings_snapshot();
    let channels = &settings.probe(0, 0).unwrap().channels;
    assert_eq!(channels.keys().copied().collect::<Vec<_>>(), vec![2]);
}

#[test]
fn default_settings_fill_every_probe() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1,2", true, false).unwrap();
    controller.load_default_settings().unwrap();

    let settings = controller.settings_snapshot();
    for probe in [0, 1] {
        let probe_settings = settings.probe(0, probe).unwrap();
        assert_eq!(probe_settings.channels.len(), 64);
        assert_eq!(probe_settings.stim_units.len(), 8);
        assert_eq!(probe_settings.electrode_maps.get(&0), Some(&vec![0]));
    }
    assert_eq!(device.count("write_stim_unit_config"), 16);
    // Emulated hardware skips the channel configuration write.
    assert_eq!(device.count("write_channel_config"), 0);
}

#[test]
fn verify_document_checks_without_uploading() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    device.clear_calls();

    assert!(controller.verify_document(&channel_document("1-64", 0)).is_ok());
    assert!(controller
        .verify_document(&channel_document("65", 0))
        .is_err());
    assert!(device.calls().is_empty());
    assert!(controller.settings_snapshot().probe(0, 0).unwrap().channels.is_empty());
}

// =============================================================================
// Recording and stimulation
// =============================================================================

#[test]
fn recording_needs_every_channel_configured() {
    let (_dir, _, controller) = setup(MockViperBox::new());
    controller.connect("1", false, false).unwrap();
    controller
        .upload_recording_settings(&channel_document("1-10", 0), false, false)
        .unwrap();

    let err = controller.start_recording("trial").unwrap_err();
    assert!(matches!(
        err,
        ViperError::IncompleteRecordingSettings {
            box_id: 1,
            probe: 1,
            configured: 10
        }
    ));
    assert!(!controller.status().recording);
}

#[test]
fn stimulation_guards_follow_session_state() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", true, false).unwrap();

    assert!(matches!(
        controller.start_stimulation("1", "1", "1"),
        Err(ViperError::NotRecording)
    ));

    controller.start_recording("guards").unwrap();
    assert!(matches!(
        controller.start_stimulation("1", "1", "1"),
        Err(ViperError::StimulationSettingsNotUploaded)
    ));
    assert!(matches!(
        controller.upload_recording_settings("", false, true),
        Err(ViperError::RecordingInProgress)
    ));
    assert!(matches!(
        controller.start_recording("again"),
        Err(ViperError::RecordingInProgress)
    ));

    controller
        .upload_stimulation_settings("", false, true)
        .unwrap();
    controller.start_stimulation("1", "1", "1,3").unwrap();
    assert!(device
        .calls()
        .contains(&"trigger_stim_units 0 0 160".to_string()));
    assert_eq!(controller.status().stim_unit_busy.get(&(0, 0)), Some(&160));

    assert!(controller.start_stimulation("1", "1", "9").is_err());
    assert!(controller.start_stimulation("2", "1", "1").is_err());

    controller.stop_recording().unwrap();
    assert!(controller.status().stim_unit_busy.is_empty());
    assert!(matches!(
        controller.stop_recording(),
        Err(ViperError::NotRecording)
    ));
}

#[test]
fn recording_drives_file_stream() {
    let (dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", true, false).unwrap();
    device.clear_calls();

    let message = controller.start_recording("mouse").unwrap();
    assert!(message.contains("mouse_"));
    let calls = device.calls();
    assert!(calls[0].starts_with("set_file_stream 0 "));
    assert!(calls[0].ends_with(".bin"));
    assert_eq!(
        &calls[1..],
        ["enable_file_stream 0 true", "arm 0", "software_trigger 0"]
    );

    controller.stop_recording().unwrap();
    assert!(device
        .calls()
        .contains(&"set_file_stream 0 none".to_string()));
    assert!(dir.path().join("Recordings").is_dir());
}

#[test]
fn unwritable_journal_keeps_device_idle() {
    let (dir, device, controller) = setup(MockViperBox::new());
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();
    let mut config = controller.config().clone();
    config.storage.journal_dir = blocker.join("Stimulations");
    let controller = ViperController::new(device.clone(), config);
    controller.connect("1", true, false).unwrap();
    device.clear_calls();

    assert!(matches!(
        controller.start_recording("blocked"),
        Err(ViperError::Io(_))
    ));
    assert!(device.calls().is_empty());
    assert!(!controller.status().recording);
    assert!(matches!(
        controller.stop_recording(),
        Err(ViperError::NotRecording)
    ));
}

#[test]
fn failed_trigger_closes_file_stream_and_journal() {
    let (dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1", true, false).unwrap();
    device.clear_calls();
    device.fail_on("software_trigger");

    assert!(matches!(
        controller.start_recording("trial"),
        Err(ViperError::Device(_))
    ));
    let calls = device.calls();
    assert_eq!(&calls[calls.len() - 2..], ["arm 0", "set_file_stream 0 none"]);
    assert_eq!(files_in(&dir.path().join("Stimulations")), 0);
    assert!(!controller.status().recording);

    device.clear_failure();
    controller.start_recording("trial").unwrap();
    controller.stop_recording().unwrap();
    assert_eq!(files_in(&dir.path().join("Stimulations")), 1);
}

#[test]
fn partial_stimulation_is_journaled() {
    let (_dir, device, controller) = setup(MockViperBox::new());
    controller.connect("1-2", true, false).unwrap();
    controller.load_default_settings().unwrap();
    controller.start_recording("partial").unwrap();

    device.fail_on("trigger_stim_units 0 1");
    assert!(matches!(
        controller.start_stimulation("1", "1-2", "1"),
        Err(ViperError::Device(_))
    ));
    assert_eq!(device.count("trigger_stim_units"), 2);

    let busy = controller.status().stim_unit_busy;
    assert_eq!(busy.get(&(0, 0)), Some(&128));
    assert!(!busy.contains_key(&(0, 1)));

    let journal = read_document(&controller.journal_path().unwrap()).unwrap();
    let stimulated: Vec<&str> = journal
        .descendants()
        .into_iter()
        .filter(|e| e.attr("instruction_type") == Some("stimulation_start"))
        .filter_map(|e| e.attr("probe"))
        .collect();
    assert_eq!(stimulated, ["1"]);
    controller.stop_recording().unwrap();
}

#[test]
fn boxless_session_writes_ordered_journal() {
    let (dir, device, controller) = setup(MockViperBox::new());
    controller.connect("", false, true).unwrap();
    assert!(controller.status().test_mode);

    controller.start_recording("trial").unwrap();
    let journal_path = controller.journal_path().unwrap();
    assert!(journal_path.starts_with(dir.path().join("Stimulations")));

    controller.start_stimulation("1", "1", "1").unwrap();
    controller.start_stimulation("1", "1", "2").unwrap();
    controller.stop_recording().unwrap();
    assert!(device.calls().is_empty());

    let journal = read_document(&journal_path).unwrap();
    assert_eq!(journal.name, "Recording");
    assert!(journal.attr("file_name").unwrap().starts_with("trial_"));

    let sections: Vec<&str> = journal.children.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(sections, ["Settings", "Instructions", "Settings", "Instructions"]);

    let channels = journal.children[0]
        .descendants()
        .into_iter()
        .filter(|e| e.name == "Channel")
        .count();
    assert_eq!(channels, 64);

    let configuration = journal.children[2]
        .descendants()
        .into_iter()
        .find(|e| e.name == "Configuration")
        .unwrap();
    assert_eq!(configuration.attr("start_time"), Some("-1"));

    assert_eq!(
        instruction_types(&journal),
        [
            "recording_start",
            "stimulation_start",
            "stimulation_start",
            "recording_stop"
        ]
    );
    let masks: Vec<&str> = journal
        .descendants()
        .into_iter()
        .filter_map(|e| e.attr("SU_bitmask"))
        .collect();
    assert_eq!(masks, ["128", "64"]);
}

#[test]
fn boxless_disconnect_reports_mode() {
    let (_dir, _, controller) = setup(MockViperBox::new());
    controller.connect("", false, true).unwrap();
    assert_eq!(
        controller.disconnect().unwrap(),
        "Boxless mode, no connection to ViperBox"
    );
    assert!(!controller.status().connected);
}

#[test]
fn recording_into_existing_folder_uses_unnamed_file() {
    let (dir, _, controller) = setup(MockViperBox::new());
    controller.connect("", false, true).unwrap();
    let folder = dir.path().join("session");
    std::fs::create_dir_all(&folder).unwrap();

    let message = controller
        .start_recording(folder.to_str().unwrap())
        .unwrap();
    assert!(message.contains("unnamed_recording_"));
    let journal = controller.journal_path().unwrap();
    let stem = journal.file_stem().unwrap().to_string_lossy();
    assert!(stem.starts_with("unnamed_recording_"));
    controller.stop_recording().unwrap();
}
