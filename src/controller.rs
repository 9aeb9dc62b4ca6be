//! Device lifecycle state machine.
//!
//! [`ViperController`] owns one operator session: the live settings, the baseline that was
//! last uploaded to hardware, the connectivity topology, status flags, the active
//! recording with its journal, and the streaming worker.
//!
//! ```text
//! Disconnected ──connect──► Connected ──upload settings──► Connected (settings ready)
//!      ▲                        │                                   │
//!      │                        │                          start_recording
//!      │                        │                                   ▼
//!      └────── disconnect ──────┴────────────── stop_recording ◄─ Recording ─► start_stimulation
//! ```
//!
//! Every operation returns `Ok(feedback)` or an error whose `Display` is the feedback;
//! [`Outcome`] turns either into the `(success, message)` pair served to front ends.
//! Operations in the wrong state return an error and change nothing.
//!
//! Uploads follow snapshot, validate, upload, commit: the live settings are cloned into a
//! working copy, the document is merged into the copy, the copy is pushed to the device,
//! and only then does it replace the live settings and the uploaded baseline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Local;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::document::{
    default_recording_document, default_stimulation_document, parse_settings, read_document,
    settings_records,
};
use crate::error::{AppResult, ViperError};
use crate::hardware::ViperDevice;
use crate::journal::{InstructionKind, Journal, Timing};
use crate::range::{format_indices, parse_indices};
use crate::scheduler::{Script, ScriptHandle, ScriptReport, ScriptRunner, ScriptTarget};
use crate::settings::{
    stim_units_to_bitmask, ChannelSettings, ConnectivityTopology, GeneralSettings, StatusTracking,
    UploadTiming, CHANNELS_PER_PROBE, ELECTRODES_PER_PROBE, PROBES_PER_BOX,
};
use crate::streaming::{self, FrameSink, StreamHandle, StreamStatsSnapshot};
use crate::validation::{
    merge_settings, resolve_targets, verify_parameter, RecordAddress, RecordKind, Scope,
    SettingRecord,
};

/// The only box a session drives.
const BOX: usize = 0;

/// Success flag and feedback message of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl From<AppResult<String>> for Outcome {
    fn from(result: AppResult<String>) -> Self {
        match result {
            Ok(message) => Self {
                success: true,
                message,
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
            },
        }
    }
}

struct ActiveRecording {
    data_path: PathBuf,
    journal: Journal,
    started: Instant,
}

impl ActiveRecording {
    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

#[derive(Default)]
struct Session {
    boxless: bool,
    emulation: bool,
    settings: GeneralSettings,
    uploaded: GeneralSettings,
    topology: ConnectivityTopology,
    status: StatusTracking,
    recording: Option<ActiveRecording>,
    stream: Option<StreamHandle>,
    consumer: Option<Box<dyn FrameSink>>,
    permanent_discharge: Vec<usize>,
}

impl Session {
    /// Forget everything tied to the connection; the consumer and discharge list survive.
    fn clear_connection(&mut self) {
        self.boxless = false;
        self.emulation = false;
        self.settings = GeneralSettings::default();
        self.uploaded = GeneralSettings::default();
        self.topology.clear();
        self.status = StatusTracking::default();
        self.recording = None;
    }

    /// Whether device calls are skipped.
    fn skip_device(&self) -> bool {
        self.boxless
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.status.connected {
            Ok(())
        } else {
            Err(ViperError::NotConnected)
        }
    }

    fn ensure_not_recording(&self) -> AppResult<()> {
        if self.recording.is_some() {
            Err(ViperError::RecordingInProgress)
        } else {
            Ok(())
        }
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Some(sink) = stream.stop() {
                self.consumer = Some(sink);
            }
        }
    }

    /// Timing of an upload that began at `begin`; `(-1, -1)` outside a recording.
    fn upload_timing(&self, begin: Instant) -> UploadTiming {
        match &self.recording {
            Some(active) => {
                let start_time = begin.duration_since(active.started).as_secs_f64();
                UploadTiming {
                    start_time,
                    delta_time: begin.elapsed().as_secs_f64(),
                }
            }
            None => UploadTiming::default(),
        }
    }
}

/// Owner of one ViperBox session. All methods may be called from any thread.
pub struct ViperController {
    device: Arc<dyn ViperDevice>,
    config: AppConfig,
    session: Mutex<Session>,
    script: Mutex<Option<ScriptHandle>>,
}

impl ViperController {
    pub fn new(device: Arc<dyn ViperDevice>, config: AppConfig) -> Self {
        Self {
            device,
            config,
            session: Mutex::new(Session::default()),
            script: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to the box and initialise the probes selected by `probe_selector`.
    ///
    /// With `boxless`, no device is touched: box 1 / probe 1 are synthesised and the
    /// default settings applied. With `emulation`, the driver simulates the hardware.
    pub fn connect(&self, probe_selector: &str, emulation: bool, boxless: bool) -> AppResult<String> {
        let mut session = self.session.lock();
        if session.status.connected {
            info!("Already connected, disconnecting first");
            if let Err(e) = self.disconnect_session(&mut session) {
                warn!(error = %e, "Disconnect before reconnect failed");
            }
        }

        if boxless {
            let mut topology = ConnectivityTopology::new();
            topology.add_probe(BOX, 0);
            let mut records = self.default_records(RecordKind::Channel)?;
            records.extend(self.default_records(RecordKind::Waveform)?);
            let settings =
                merge_settings(&records, topology.empty_settings(), &topology, Scope::All)?;

            session.boxless = true;
            session.emulation = emulation;
            session.topology = topology;
            session.settings = settings.clone();
            session.uploaded = settings;
            session.status = StatusTracking {
                connected: true,
                recording_settings_uploaded: true,
                stimulation_settings_uploaded: true,
                test_mode: true,
                ..Default::default()
            };
            info!("Connected in boxless mode");
            return Ok("Boxless mode: simulated ViperBox with one probe connected".to_string());
        }

        let probes = parse_indices(probe_selector, &(0..PROBES_PER_BOX).collect::<Vec<_>>())?;
        let devices = self.device.discover().map_err(ViperError::device)?;
        match devices.len() {
            0 => return Err(ViperError::NoDeviceFound),
            1 => {}
            n => return Err(ViperError::MultipleDevicesFound(n)),
        }

        let identity = self
            .device
            .open_box(BOX, emulation)
            .map_err(ViperError::device)?;
        if let Err(e) = self.device.open_probes(BOX) {
            if let Err(close) = self.device.close_box(BOX) {
                warn!(error = %close, "Closing box after failed probe opening failed");
            }
            return Err(ViperError::device(e.context("opening probes")));
        }

        let mut topology = ConnectivityTopology::new();
        topology.add_box(BOX);
        for probe in &probes {
            match self.device.init_probe(BOX, *probe) {
                Ok(()) => {
                    topology.add_probe(BOX, *probe);
                    debug!(probe = probe + 1, "Probe initialised");
                }
                Err(e) => warn!(probe = probe + 1, error = %e, "Probe initialisation failed"),
            }
        }

        let mut settings = topology.empty_settings();
        if let Some(box_settings) = settings.boxes.get_mut(&BOX) {
            box_settings.serial = Some(identity.serial.clone());
            box_settings.firmware_version = Some(identity.firmware_version.clone());
        }

        let initialised = topology.probes(BOX);
        session.boxless = false;
        session.emulation = emulation;
        session.topology = topology;
        session.uploaded = settings.clone();
        session.settings = settings;
        session.status = StatusTracking {
            connected: true,
            test_mode: emulation,
            ..Default::default()
        };

        info!(
            serial = %identity.serial,
            firmware = %identity.firmware_version,
            probes = %format_indices(&initialised),
            emulation,
            "Connected to ViperBox"
        );
        Ok(format!(
            "ViperBox {} connected, probe(s) {} initialised",
            identity.serial,
            format_indices(&initialised)
        ))
    }

    /// Stop streaming, release the device and forget the session state.
    pub fn disconnect(&self) -> AppResult<String> {
        let mut session = self.session.lock();
        self.disconnect_session(&mut session)
    }

    /// Disconnect and drop the acquisition consumer.
    pub fn shutdown(&self) -> AppResult<String> {
        if let Some(handle) = self.script.lock().take() {
            handle.abort();
            if let Err(e) = handle.join() {
                warn!(error = %e, "Script did not finish cleanly");
            }
        }
        let mut session = self.session.lock();
        let result = self.disconnect_session(&mut session);
        session.consumer = None;
        info!("Control core shut down");
        result
    }

    fn disconnect_session(&self, session: &mut Session) -> AppResult<String> {
        if session.recording.is_some() {
            if let Err(e) = self.stop_recording_session(session) {
                warn!(error = %e, "Stopping recording during disconnect failed");
            }
        }
        session.stop_stream();

        if session.boxless {
            session.clear_connection();
            return Ok("Boxless mode, no connection to ViperBox".to_string());
        }
        if !session.status.connected {
            return Ok("Not connected to ViperBox".to_string());
        }

        let result = self
            .device
            .close_probes(BOX)
            .and_then(|()| self.device.close_box(BOX));
        session.clear_connection();
        result.map_err(ViperError::device)?;
        info!("Disconnected from ViperBox");
        Ok("Disconnected from ViperBox".to_string())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    fn default_records(&self, kind: RecordKind) -> AppResult<Vec<SettingRecord>> {
        let (override_path, built_in) = match kind {
            RecordKind::Channel => (
                self.config.defaults.recording_settings.as_ref(),
                default_recording_document(),
            ),
            RecordKind::Waveform | RecordKind::Mapping => (
                self.config.defaults.stimulation_settings.as_ref(),
                default_stimulation_document(),
            ),
        };
        let document = match override_path {
            Some(path) => read_document(path)?,
            None => built_in,
        };
        settings_records(&document)
    }

    fn records_for(&self, xml: &str, use_defaults: bool, kind: RecordKind) -> AppResult<Vec<SettingRecord>> {
        if use_defaults {
            self.default_records(kind)
        } else {
            parse_settings(xml)
        }
    }

    /// Validate a recording settings document and upload it.
    ///
    /// `reset` clears all channel settings first; `use_defaults` ignores `xml` and
    /// applies the default recording settings.
    pub fn upload_recording_settings(&self, xml: &str, reset: bool, use_defaults: bool) -> AppResult<String> {
        let records = self.records_for(xml, use_defaults, RecordKind::Channel)?;
        self.upload_recording_records(&records, reset)
    }

    /// Validate a stimulation settings document and upload it.
    pub fn upload_stimulation_settings(&self, xml: &str, reset: bool, use_defaults: bool) -> AppResult<String> {
        let records = self.records_for(xml, use_defaults, RecordKind::Waveform)?;
        self.upload_stimulation_records(&records, reset)
    }

    fn upload_recording_records(&self, records: &[SettingRecord], reset: bool) -> AppResult<String> {
        let mut session = self.session.lock();
        session.ensure_not_recording()?;
        session.ensure_connected()?;

        let mut working = session.settings.clone();
        if reset {
            working.reset_recording_settings();
        }
        let working = merge_settings(records, working, &session.topology, Scope::Recording)?;

        if !session.skip_device() {
            self.push_recording_settings(&working, session.emulation)
                .map_err(|e| ViperError::upload("recording settings", e))?;
        }

        session.uploaded = working.clone();
        session.settings = working;
        session.status.recording_settings_uploaded = true;
        info!(records = records.len(), "Recording settings uploaded");
        Ok("Recording settings uploaded".to_string())
    }

    fn upload_stimulation_records(&self, records: &[SettingRecord], reset: bool) -> AppResult<String> {
        let mut session = self.session.lock();
        session.ensure_connected()?;

        let mut working = session.settings.clone();
        if reset {
            working.reset_stimulation_settings();
        }
        let working = merge_settings(records, working, &session.topology, Scope::Stimulation)?;

        let begin = Instant::now();
        if !session.skip_device() {
            self.push_stimulation_settings(&working, &session.permanent_discharge)
                .map_err(|e| ViperError::upload("stimulation settings", e))?;
        }

        session.status.stim_upload_time = session.upload_timing(begin);
        session.uploaded = working.clone();
        session.settings = working;
        session.status.stimulation_settings_uploaded = true;
        session.status.stimulation_settings_journaled = false;
        info!(records = records.len(), "Stimulation settings uploaded");
        Ok("Stimulation settings uploaded".to_string())
    }

    /// Reset every probe and apply the default recording and stimulation settings.
    pub fn load_default_settings(&self) -> AppResult<String> {
        let mut records = self.default_records(RecordKind::Channel)?;
        records.extend(self.default_records(RecordKind::Waveform)?);

        let mut session = self.session.lock();
        session.ensure_not_recording()?;
        session.ensure_connected()?;

        let mut working = session.settings.clone();
        working.reset_probe_settings();
        let working = merge_settings(&records, working, &session.topology, Scope::All)?;

        if !session.skip_device() {
            self.push_recording_settings(&working, session.emulation)
                .map_err(|e| ViperError::upload("default recording settings", e))?;
            self.push_stimulation_settings(&working, &session.permanent_discharge)
                .map_err(|e| ViperError::upload("default stimulation settings", e))?;
        }

        session.uploaded = working.clone();
        session.settings = working;
        session.status.recording_settings_uploaded = true;
        session.status.stimulation_settings_uploaded = true;
        session.status.stimulation_settings_journaled = false;
        session.status.stim_upload_time = UploadTiming::default();
        info!("Default settings uploaded");
        Ok("Default settings uploaded".to_string())
    }

    fn push_recording_settings(&self, settings: &GeneralSettings, emulation: bool) -> anyhow::Result<()> {
        for (box_id, box_settings) in &settings.boxes {
            for (probe, probe_settings) in &box_settings.probes {
                for (channel, channel_settings) in &probe_settings.channels {
                    self.push_channel(*box_id, *probe, *channel, channel_settings)
                        .with_context(|| {
                            format!("box {} probe {} channel {}", box_id + 1, probe + 1, channel + 1)
                        })?;
                }
                if !emulation {
                    self.device
                        .write_channel_config(*box_id, *probe)
                        .with_context(|| format!("box {} probe {}", box_id + 1, probe + 1))?;
                }
            }
        }
        Ok(())
    }

    fn push_channel(
        &self,
        box_id: usize,
        probe: usize,
        channel: usize,
        settings: &ChannelSettings,
    ) -> anyhow::Result<()> {
        self.device
            .select_electrode(box_id, probe, channel, settings.input)?;
        self.device
            .set_reference(box_id, probe, channel, settings.reference_mask())?;
        self.device.set_gain(box_id, probe, channel, settings.gain)?;
        self.device.set_auto_zero(box_id, probe, channel, false)
    }

    fn push_stimulation_settings(&self, settings: &GeneralSettings, permanent_discharge: &[usize]) -> anyhow::Result<()> {
        for (box_id, box_settings) in &settings.boxes {
            for (probe, probe_settings) in &box_settings.probes {
                let (b, p) = (*box_id, *probe);
                let context = || format!("box {} probe {}", b + 1, p + 1);

                self.device
                    .set_output_stage_image(b, p, &probe_settings.stimulation_image())
                    .with_context(context)?;
                for electrode in 0..ELECTRODES_PER_PROBE {
                    self.device
                        .set_stim_blank(b, p, electrode, true)
                        .with_context(context)?;
                    self.device
                        .set_discharge_permanent(
                            b,
                            p,
                            electrode,
                            permanent_discharge.contains(&electrode),
                        )
                        .with_context(context)?;
                }
                self.device
                    .write_output_stage_config(b, p)
                    .with_context(context)?;
                for (unit, unit_settings) in &probe_settings.stim_units {
                    self.device
                        .write_stim_unit_config(b, p, *unit, unit_settings)
                        .with_context(|| format!("{} stimulation unit {}", context(), unit + 1))?;
                }
            }
        }
        Ok(())
    }

    /// Select electrodes whose discharge switch stays closed; applied on the next
    /// stimulation settings upload.
    pub fn set_permanent_discharge(&self, expr: &str) -> AppResult<String> {
        let electrodes = if expr.trim().is_empty() {
            Vec::new()
        } else {
            parse_indices(expr, &(0..ELECTRODES_PER_PROBE).collect::<Vec<_>>())?
        };
        let message = if electrodes.is_empty() {
            "Permanent discharge cleared".to_string()
        } else {
            format!("Permanent discharge on electrode(s) {}", format_indices(&electrodes))
        };
        self.session.lock().permanent_discharge = electrodes;
        Ok(message)
    }

    /// Validate a settings document against the current connection without uploading.
    pub fn verify_document(&self, xml: &str) -> AppResult<String> {
        let records = parse_settings(xml)?;
        let session = self.session.lock();
        session.ensure_connected()?;
        merge_settings(&records, session.settings.clone(), &session.topology, Scope::All)?;
        Ok(format!("Settings are valid ({} entries)", records.len()))
    }

    /// Validate one named parameter value.
    pub fn verify_parameter(&self, name: &str, value: &str) -> AppResult<String> {
        verify_parameter(name, value)?;
        Ok(format!("{name} = {value} is valid"))
    }

    // =========================================================================
    // Recording and stimulation
    // =========================================================================

    fn recording_path(&self, name: &str, stamp: &str) -> PathBuf {
        let trimmed = name.trim();
        let candidate = Path::new(trimmed);
        if !trimmed.is_empty() && candidate.is_dir() {
            return candidate.join(format!("unnamed_recording_{stamp}.bin"));
        }
        let bare = trimmed.is_empty() || candidate.components().count() == 1;
        if bare {
            let stem = if trimmed.is_empty() {
                "unnamed_recording"
            } else {
                trimmed
            };
            self.config
                .storage
                .recordings_dir
                .join(format!("{stem}_{stamp}.bin"))
        } else {
            candidate.with_extension("bin")
        }
    }

    /// Start recording to a file derived from `name` and open its journal.
    ///
    /// A bare name lands in the recordings folder with a timestamp; a path to an existing
    /// folder gets an unnamed, timestamped file inside it; any other path is used as is
    /// with a `.bin` extension.
    pub fn start_recording(&self, name: &str) -> AppResult<String> {
        let mut session = self.session.lock();
        session.ensure_connected()?;
        session.ensure_not_recording()?;

        if !session.emulation && !session.boxless {
            for (box_id, probes) in session.uploaded.connected() {
                for probe in probes {
                    let configured = session
                        .uploaded
                        .probe(box_id, probe)
                        .map_or(0, |p| p.channels.len());
                    if configured < CHANNELS_PER_PROBE {
                        return Err(ViperError::IncompleteRecordingSettings {
                            box_id: box_id + 1,
                            probe: probe + 1,
                            configured,
                        });
                    }
                }
            }
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let data_path = self.recording_path(name, &stamp);
        if let Some(parent) = data_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file_name = data_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("unnamed_stimulation_record_{stamp}"));
        let journal_path = self
            .config
            .storage
            .journal_dir
            .join(format!("{file_name}.xml"));
        let mut journal = Journal::create(journal_path, &file_name)?;
        if let Err(e) =
            journal.record_recording_settings(&session.uploaded, Timing::BEFORE_RECORDING)
        {
            journal.discard();
            return Err(e);
        }

        let begin = Instant::now();
        if !session.skip_device() {
            let started = self
                .device
                .set_file_stream(BOX, Some(&data_path))
                .and_then(|()| self.device.enable_file_stream(BOX, true))
                .and_then(|()| self.device.arm(BOX))
                .and_then(|()| self.device.software_trigger(BOX));
            if let Err(e) = started {
                self.halt_file_stream();
                journal.discard();
                return Err(ViperError::device(e.context("starting recording")));
            }
        }
        let trigger_time = begin.elapsed().as_secs_f64();

        if let Err(e) = journal.record_instruction(
            InstructionKind::RecordingStart,
            &[],
            Timing::new(0.0, trigger_time),
        ) {
            if !session.skip_device() {
                self.halt_file_stream();
            }
            journal.discard();
            return Err(e);
        }

        if !session.boxless {
            if let Some(consumer) = session.consumer.take() {
                let probe = session.topology.probes(BOX).first().copied().unwrap_or(0);
                match self.device.open_stream(&data_path, probe) {
                    Ok(reader) => {
                        match StreamHandle::start(reader, consumer, &self.config.stream) {
                            Ok(stream) => session.stream = Some(stream),
                            Err(e) => warn!(error = %e, "Could not start streaming worker"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not open sample stream, continuing without streaming");
                        session.consumer = Some(consumer);
                    }
                }
            }
        }

        session.recording = Some(ActiveRecording {
            data_path: data_path.clone(),
            journal,
            started: begin,
        });
        session.status.recording = true;
        session.status.stimulation_settings_journaled = false;
        info!(path = %data_path.display(), "Recording started");
        Ok(format!("Recording started: {}", data_path.display()))
    }

    /// Disarm the box and close its file stream after a recording failed to start.
    fn halt_file_stream(&self) {
        if let Err(e) = self.device.arm(BOX) {
            warn!(error = %e, "Disarming after failed start failed");
        }
        if let Err(e) = self.device.set_file_stream(BOX, None) {
            warn!(error = %e, "Closing file stream after failed start failed");
        }
    }

    /// Stop the active recording and close its journal.
    pub fn stop_recording(&self) -> AppResult<String> {
        let mut session = self.session.lock();
        self.stop_recording_session(&mut session)
    }

    fn stop_recording_session(&self, session: &mut Session) -> AppResult<String> {
        let Some(mut active) = session.recording.take() else {
            return Err(ViperError::NotRecording);
        };
        session.stop_stream();

        let start_time = active.elapsed();
        let begin = Instant::now();
        let device_result = if session.skip_device() {
            Ok(())
        } else {
            self.device
                .arm(BOX)
                .and_then(|()| self.device.set_file_stream(BOX, None))
        };
        let timing = Timing::new(start_time, begin.elapsed().as_secs_f64());
        let journal_result =
            active
                .journal
                .record_instruction(InstructionKind::RecordingStop, &[], timing);

        session.status.recording = false;
        session.status.stim_unit_busy.clear();
        device_result.map_err(|e| ViperError::device(e.context("stopping recording")))?;
        journal_result?;

        info!(path = %active.data_path.display(), "Recording stopped");
        Ok(format!("Recording stopped: {}", active.data_path.display()))
    }

    /// Trigger stimulation units on the selected boxes and probes.
    ///
    /// Targets resolve against the uploaded baseline, so only probes and units that were
    /// configured by a successful upload can be triggered.
    pub fn start_stimulation(&self, boxes: &str, probes: &str, stim_units: &str) -> AppResult<String> {
        let mut session = self.session.lock();
        session.ensure_connected()?;
        if session.recording.is_none() {
            return Err(ViperError::NotRecording);
        }
        if !session.status.stimulation_settings_uploaded {
            return Err(ViperError::StimulationSettingsNotUploaded);
        }

        let baseline = session.uploaded.topology();
        let address = RecordAddress {
            boxes: boxes.to_string(),
            probes: probes.to_string(),
        };
        let mut triggers = Vec::new();
        for (box_id, probe) in resolve_targets(&address, &baseline)? {
            let configured: Vec<usize> = session
                .uploaded
                .probe(box_id, probe)
                .map(|p| p.stim_units.keys().copied().collect())
                .unwrap_or_default();
            let units = parse_indices(stim_units, &configured)?;
            triggers.push((box_id, probe, units));
        }

        let begin = Instant::now();
        let start_time = session.recording.as_ref().map_or(0.0, ActiveRecording::elapsed);
        let mut fired = triggers.len();
        let mut failure = None;
        if !session.skip_device() {
            for (index, (box_id, probe, units)) in triggers.iter().enumerate() {
                if let Err(e) =
                    self.device
                        .trigger_stim_units(*box_id, *probe, stim_units_to_bitmask(units))
                {
                    fired = index;
                    failure = Some(ViperError::device(e.context(format!(
                        "triggering box {} probe {}",
                        box_id + 1,
                        probe + 1
                    ))));
                    break;
                }
            }
        }
        let timing = Timing::new(start_time, begin.elapsed().as_secs_f64());
        let fired = &triggers[..fired];

        // Probes that were triggered are journaled even when a later one failed.
        let session = &mut *session;
        let Some(active) = session.recording.as_mut() else {
            return Err(ViperError::NotRecording);
        };
        if !fired.is_empty() && !session.status.stimulation_settings_journaled {
            let upload = session.status.stim_upload_time;
            active.journal.record_stimulation_settings(
                &session.uploaded,
                Timing::new(upload.start_time, upload.delta_time),
            )?;
            session.status.stimulation_settings_journaled = true;
        }
        for (box_id, probe, units) in fired {
            let mask = stim_units_to_bitmask(units);
            session.status.stim_unit_busy.insert((*box_id, *probe), mask);
            active.journal.record_instruction(
                InstructionKind::StimulationStart,
                &[
                    ("box", (box_id + 1).to_string()),
                    ("probe", (probe + 1).to_string()),
                    ("stimunit", format_indices(units)),
                    ("SU_bitmask", mask.to_string()),
                ],
                timing,
            )?;
        }

        if let Some(e) = failure {
            warn!(
                triggered = fired.len(),
                requested = triggers.len(),
                error = %e,
                "Stimulation stopped at failing probe"
            );
            return Err(e);
        }

        info!(targets = triggers.len(), "Stimulation started");
        Ok(format!("Stimulation started on {} probe(s)", triggers.len()))
    }

    // =========================================================================
    // Streaming consumer
    // =========================================================================

    /// Attach a frame sink; it receives the idle burst now and frames during recordings.
    pub fn attach_consumer(&self, mut sink: Box<dyn FrameSink>) -> AppResult<String> {
        streaming::send_idle_frames(sink.as_mut(), &self.config.stream)?;
        let mut session = self.session.lock();
        if session.stream.is_some() {
            return Err(ViperError::RecordingInProgress);
        }
        session.consumer = Some(sink);
        Ok("Acquisition consumer attached".to_string())
    }

    /// Block until the acquisition client connects on the configured port, then attach it.
    pub fn listen_for_consumer(&self) -> AppResult<String> {
        let (stream, peer) = streaming::accept_consumer(("0.0.0.0", self.config.stream.port))?;
        self.attach_consumer(Box::new(stream))?;
        Ok(format!("Acquisition consumer {peer} attached"))
    }

    pub fn stream_stats(&self) -> Option<StreamStatsSnapshot> {
        self.session.lock().stream.as_ref().map(StreamHandle::stats)
    }

    // =========================================================================
    // Scripts
    // =========================================================================

    /// Validate a script, reset the session to probe 1 of box 1 and run it in the background.
    pub fn run_script(self: &Arc<Self>, path: &Path) -> AppResult<String> {
        let mut slot = self.script.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ViperError::ScriptAlreadyRunning);
        }
        {
            let session = self.session.lock();
            session.ensure_not_recording()?;
            if !session.boxless && !session.status.connected {
                return Err(ViperError::NotConnected);
            }
        }

        let script = Script::load(path)?;

        {
            let mut session = self.session.lock();
            if !session.boxless {
                self.device
                    .init_probe(BOX, 0)
                    .map_err(|e| ViperError::device(e.context("re-initialising probe 1")))?;
            }
            let mut topology = ConnectivityTopology::new();
            topology.add_probe(BOX, 0);
            let settings = topology.empty_settings();
            session.topology = topology;
            session.uploaded = settings.clone();
            session.settings = settings;
            session.status = StatusTracking {
                connected: true,
                test_mode: session.status.test_mode,
                ..Default::default()
            };
        }

        let steps = script.steps.len();
        let target: Arc<dyn ScriptTarget> = Arc::clone(self) as Arc<dyn ScriptTarget>;
        let handle = ScriptRunner::new(target, self.config.scheduler.clone()).spawn(script)?;
        *slot = Some(handle);
        info!(path = %path.display(), steps, "Script started");
        Ok(format!("Script started with {steps} entries"))
    }

    /// Ask the running script to stop before its next entry.
    pub fn abort_script(&self) -> AppResult<String> {
        match self.script.lock().as_ref() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                Ok("Script abort requested".to_string())
            }
            _ => Err(ViperError::Script("no script is running".to_string())),
        }
    }

    /// Wait for the most recent script to finish and return its report.
    pub fn wait_script(&self) -> AppResult<ScriptReport> {
        let handle = self
            .script
            .lock()
            .take()
            .ok_or_else(|| ViperError::Script("no script was started".to_string()))?;
        handle.join()
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn status(&self) -> StatusTracking {
        self.session.lock().status.clone()
    }

    pub fn settings_snapshot(&self) -> GeneralSettings {
        self.session.lock().settings.clone()
    }

    pub fn uploaded_snapshot(&self) -> GeneralSettings {
        self.session.lock().uploaded.clone()
    }

    pub fn settings_json(&self) -> AppResult<String> {
        Ok(self.session.lock().settings.to_json_pretty()?)
    }

    /// Journal of the active recording.
    pub fn journal_path(&self) -> Option<PathBuf> {
        let session = self.session.lock();
        session
            .recording
            .as_ref()
            .map(|r| r.journal.path().to_path_buf())
    }
}

impl ScriptTarget for ViperController {
    fn apply_settings(&self, kind: RecordKind, records: &[SettingRecord]) -> AppResult<String> {
        match Scope::for_kind(kind) {
            Scope::Recording => self.upload_recording_records(records, false),
            _ => self.upload_stimulation_records(records, false),
        }
    }

    fn start_recording(&self, name: &str) -> AppResult<String> {
        ViperController::start_recording(self, name)
    }

    fn start_stimulation(&self, boxes: &str, probes: &str, stim_units: &str) -> AppResult<String> {
        ViperController::start_stimulation(self, boxes, probes, stim_units)
    }

    fn stop_recording(&self) -> AppResult<String> {
        ViperController::stop_recording(self)
    }
}
