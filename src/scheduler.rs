//! Timed script execution.
//!
//! A script is a settings-and-instructions document with the same layout as a stimulation
//! journal:
//!
//! ```xml
//! <Program file_name="mouse">
//!     <Settings>
//!         <RecordingSettings>
//!             <Channel start_time="0" box="1" probe="1" channel="-" references="b" gain="0" input="0"/>
//!         </RecordingSettings>
//!     </Settings>
//!     <Instructions>
//!         <Instruction start_time="0" instruction_type="recording_start"/>
//!         <Instruction start_time="5" instruction_type="stimulation_start" box="1" probe="1" stimunit="1"/>
//!         <Instruction start_time="10" instruction_type="recording_stop"/>
//!     </Instructions>
//! </Program>
//! ```
//!
//! Entries run strictly in document order. Each one waits until its `start_time` (seconds)
//! has elapsed since its anchor: settings entries are anchored at script start, and
//! instructions at the moment the most recent `recording_start` was reached (script start
//! before that). Consecutive settings entries of one group with the same `start_time`
//! are uploaded together. A negative `start_time` (journals use `-1` for settings applied
//! before the recording) runs immediately; anything beyond one week is rejected.
//!
//! A journal parses as a script, but replaying one is not exact: settings uploaded during
//! a recording are journaled with a `start_time` relative to the recording start, while
//! the runner anchors every settings entry at script start, so those uploads run earlier
//! than they did in the recorded session.
//!
//! Waiting polls a monotonic clock at a configurable interval. A failing entry is logged
//! and, unless `continue_on_error` is off, the script moves on to the next entry.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::document::{parse_document, record_from_element, Element};
use crate::error::{AppResult, ViperError};
use crate::journal::InstructionKind;
use crate::validation::{RecordKind, SettingRecord};

/// What a script drives. Implemented by the controller.
pub trait ScriptTarget: Send + Sync {
    /// Validate and upload records of one kind.
    fn apply_settings(&self, kind: RecordKind, records: &[SettingRecord]) -> AppResult<String>;
    fn start_recording(&self, name: &str) -> AppResult<String>;
    fn start_stimulation(&self, boxes: &str, probes: &str, stim_units: &str)
        -> AppResult<String>;
    fn stop_recording(&self) -> AppResult<String>;
}

/// Box, probe and stimulation unit expressions of a stimulation instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulationTarget {
    pub boxes: String,
    pub probes: String,
    pub stim_units: String,
}

/// One executable script entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Settings {
        start_time: f64,
        kind: RecordKind,
        records: Vec<SettingRecord>,
    },
    Instruction {
        start_time: f64,
        kind: InstructionKind,
        target: Option<StimulationTarget>,
    },
}

impl ScriptStep {
    pub fn start_time(&self) -> f64 {
        match self {
            ScriptStep::Settings { start_time, .. } | ScriptStep::Instruction { start_time, .. } => {
                *start_time
            }
        }
    }
}

/// A validated script.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Recording name used by `recording_start`.
    pub file_name: String,
    pub steps: Vec<ScriptStep>,
}

fn invalid(msg: impl Into<String>) -> ViperError {
    ViperError::Script(msg.into())
}

fn group_kind(name: &str) -> Option<(RecordKind, &'static str)> {
    match name {
        "RecordingSettings" => Some((RecordKind::Channel, "Channel")),
        "StimulationWaveformSettings" => Some((RecordKind::Waveform, "Configuration")),
        "StimulationMappingSettings" => Some((RecordKind::Mapping, "Mapping")),
        _ => None,
    }
}

/// Latest accepted `start_time`, in seconds (one week).
pub const MAX_START_TIME_S: f64 = 7.0 * 24.0 * 3600.0;

fn start_time(element: &Element) -> AppResult<f64> {
    let value = if element.name == "Channel" {
        element.optional_f64("start_time")?.unwrap_or(0.0)
    } else {
        element.required_f64("start_time")?
    };
    if !value.is_finite() {
        return Err(ViperError::InvalidNumber {
            attribute: "start_time".to_string(),
            value: value.to_string(),
        });
    }
    if value > MAX_START_TIME_S {
        return Err(invalid(format!(
            "start_time {value} of {} should be at most {MAX_START_TIME_S} seconds",
            element.name
        )));
    }
    Ok(value)
}

fn check_order(last: &mut f64, next: f64, section: &str) -> AppResult<()> {
    if next < *last {
        return Err(invalid(format!(
            "start_time should be increasing or equal within {section}, found {next} after {last}"
        )));
    }
    *last = next;
    Ok(())
}

impl Script {
    /// Read and validate a script file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    /// Parse and validate a script document.
    pub fn parse(xml: &str) -> AppResult<Self> {
        let root = parse_document(xml)?;
        let file_name = match root.name.as_str() {
            "Recording" => root.required("file_name")?.to_string(),
            "Program" => root.attr("file_name").unwrap_or_default().to_string(),
            other => {
                return Err(invalid(format!(
                    "top element should be 'Recording' or 'Program', found '{other}'"
                )))
            }
        };

        let mut steps = Vec::new();
        let mut last_setting = f64::NEG_INFINITY;
        let mut last_instruction = f64::NEG_INFINITY;

        for section in &root.children {
            match section.name.as_str() {
                "Settings" => {
                    for group in &section.children {
                        let (kind, entry_name) = group_kind(&group.name).ok_or_else(|| {
                            invalid(format!("unknown settings group '{}'", group.name))
                        })?;
                        for entry in &group.children {
                            if entry.name != entry_name {
                                return Err(invalid(format!(
                                    "{} should only contain {entry_name} elements, found '{}'",
                                    group.name, entry.name
                                )));
                            }
                            let start = start_time(entry)?;
                            check_order(&mut last_setting, start, "Settings")?;
                            let record = record_from_element(entry)?
                                .ok_or_else(|| invalid(format!("unexpected '{}'", entry.name)))?;

                            let joins_previous = matches!(
                                steps.last(),
                                Some(ScriptStep::Settings { start_time, kind: last_kind, .. })
                                    if *last_kind == kind && *start_time == start
                            );
                            if joins_previous {
                                if let Some(ScriptStep::Settings { records, .. }) = steps.last_mut()
                                {
                                    records.push(record);
                                }
                            } else {
                                steps.push(ScriptStep::Settings {
                                    start_time: start,
                                    kind,
                                    records: vec![record],
                                });
                            }
                        }
                    }
                }
                "Instructions" => {
                    for entry in &section.children {
                        if entry.name != "Instruction" {
                            return Err(invalid(format!(
                                "Instructions should only contain Instruction elements, found '{}'",
                                entry.name
                            )));
                        }
                        let raw_kind = entry.required("instruction_type")?;
                        let kind = InstructionKind::parse(raw_kind).ok_or_else(|| {
                            invalid(format!("unknown instruction_type '{raw_kind}'"))
                        })?;
                        let start = start_time(entry)?;
                        check_order(&mut last_instruction, start, "Instructions")?;

                        let target = match kind {
                            InstructionKind::StimulationStart => Some(StimulationTarget {
                                boxes: entry.required("box")?.to_string(),
                                probes: entry.required("probe")?.to_string(),
                                stim_units: entry.required("stimunit")?.to_string(),
                            }),
                            _ => None,
                        };
                        steps.push(ScriptStep::Instruction {
                            start_time: start,
                            kind,
                            target,
                        });
                    }
                }
                other => {
                    return Err(invalid(format!(
                        "first level children should be Settings or Instructions, found '{other}'"
                    )))
                }
            }
        }

        Ok(Self { file_name, steps })
    }
}

/// Outcome of a finished script run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptReport {
    /// Entries that completed successfully.
    pub executed: usize,
    /// `(entry index, error message)` for every failed entry.
    pub failures: Vec<(usize, String)>,
    pub aborted: bool,
}

impl ScriptReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }
}

/// Handle to a script running on its own thread.
pub struct ScriptHandle {
    abort: Arc<AtomicBool>,
    worker: JoinHandle<ScriptReport>,
}

impl ScriptHandle {
    /// Ask the runner to stop before its next entry.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the runner and return its report.
    pub fn join(self) -> AppResult<ScriptReport> {
        self.worker
            .join()
            .map_err(|_| invalid("script runner panicked"))
    }
}

/// Executes scripts against a [`ScriptTarget`].
pub struct ScriptRunner {
    target: Arc<dyn ScriptTarget>,
    config: SchedulerConfig,
}

impl ScriptRunner {
    pub fn new(target: Arc<dyn ScriptTarget>, config: SchedulerConfig) -> Self {
        Self { target, config }
    }

    /// Run `script` on a dedicated thread.
    pub fn spawn(self, script: Script) -> AppResult<ScriptHandle> {
        let abort = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abort);
        let worker = thread::Builder::new()
            .name("viperbox-script".to_string())
            .spawn(move || self.run(&script, &flag))?;
        Ok(ScriptHandle { abort, worker })
    }

    /// Run `script` on the calling thread.
    pub fn run(&self, script: &Script, abort: &AtomicBool) -> ScriptReport {
        let script_start = Instant::now();
        let mut anchor = script_start;
        let mut report = ScriptReport::default();

        info!(
            steps = script.steps.len(),
            file_name = %script.file_name,
            "Starting script"
        );

        for (index, step) in script.steps.iter().enumerate() {
            if abort.load(Ordering::SeqCst) {
                report.aborted = true;
                break;
            }

            let result = match step {
                ScriptStep::Settings {
                    start_time,
                    kind,
                    records,
                } => {
                    if !self.wait_until(script_start, *start_time, abort) {
                        report.aborted = true;
                        break;
                    }
                    self.target.apply_settings(*kind, records)
                }
                ScriptStep::Instruction {
                    start_time,
                    kind,
                    target,
                } => {
                    if *kind == InstructionKind::RecordingStart {
                        anchor = Instant::now();
                    }
                    if !self.wait_until(anchor, *start_time, abort) {
                        report.aborted = true;
                        break;
                    }
                    self.execute(*kind, target.as_ref(), &script.file_name)
                }
            };

            match result {
                Ok(message) => {
                    debug!(entry = index, %message, "Script entry done");
                    report.executed += 1;
                }
                Err(e) => {
                    warn!(entry = index, error = %e, "Script entry failed");
                    report.failures.push((index, e.to_string()));
                    if !self.config.continue_on_error {
                        error!(entry = index, "Stopping script after failed entry");
                        break;
                    }
                }
            }
        }

        info!(
            executed = report.executed,
            failed = report.failures.len(),
            aborted = report.aborted,
            "Script finished"
        );
        report
    }

    fn execute(
        &self,
        kind: InstructionKind,
        target: Option<&StimulationTarget>,
        file_name: &str,
    ) -> AppResult<String> {
        match (kind, target) {
            (InstructionKind::RecordingStart, _) => self.target.start_recording(file_name),
            (InstructionKind::RecordingStop, _) => self.target.stop_recording(),
            (InstructionKind::StimulationStart, Some(t)) => {
                self.target
                    .start_stimulation(&t.boxes, &t.probes, &t.stim_units)
            }
            (InstructionKind::StimulationStart, None) => {
                Err(invalid("stimulation_start without box, probe and stimunit"))
            }
        }
    }

    /// Poll until `offset` seconds after `anchor`. Returns `false` if aborted meanwhile.
    ///
    /// An offset that cannot be represented as a deadline is never reached; only an abort
    /// ends the wait.
    fn wait_until(&self, anchor: Instant, offset: f64, abort: &AtomicBool) -> bool {
        let deadline = Duration::try_from_secs_f64(offset.max(0.0))
            .ok()
            .and_then(|delay| anchor.checked_add(delay));
        if deadline.is_none() {
            warn!(offset, "start_time is beyond the clock range, waiting for abort");
        }
        let poll = self.config.poll_interval();
        loop {
            if abort.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            match deadline {
                Some(deadline) if now >= deadline => return true,
                Some(deadline) => thread::sleep((deadline - now).min(poll)),
                None => thread::sleep(poll),
            }
        }
    }
}
