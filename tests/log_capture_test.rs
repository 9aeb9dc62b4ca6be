//! Checks that operational problems surface as log events.
//!
//! `traced_test` installs its own global subscriber, so nothing in this file may call
//! `logging::init`.

use std::sync::Arc;

use tracing_test::traced_test;
use viperbox_control::config::AppConfig;
use viperbox_control::hardware::mock::MockViperBox;
use viperbox_control::ViperController;

fn controller(device: MockViperBox) -> (tempfile::TempDir, ViperController) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.storage.recordings_dir = dir.path().join("Recordings");
    config.storage.journal_dir = dir.path().join("Stimulations");
    (dir, ViperController::new(Arc::new(device), config))
}

#[test]
#[traced_test]
fn failed_probe_initialisation_is_logged() {
    let (_dir, controller) = controller(MockViperBox::new().with_failing_probe(0, 2));
    controller.connect("-", false, false).unwrap();
    assert!(logs_contain("Probe initialisation failed"));
    assert!(logs_contain("Connected to ViperBox"));
}

#[test]
#[traced_test]
fn failed_disconnect_before_reconnect_is_logged() {
    let device = MockViperBox::new();
    device.fail_on("close_box");
    let (_dir, controller) = controller(device);

    controller.connect("1", false, false).unwrap();
    controller.connect("1", false, false).unwrap();
    assert!(logs_contain("Disconnect before reconnect failed"));
    assert!(controller.status().connected);
}
