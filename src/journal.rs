//! Stimulation record ("stimrec") journal.
//!
//! Every recording gets a journal next to it that lists, in order, the settings that were
//! active and the instructions that were executed. The journal is an XML document:
//!
//! ```xml
//! <Recording file_name="mouse_20240102_101112">
//!     <Settings>
//!         <RecordingSettings>
//!             <Channel start_time="-1" delta_time="-1" box="1" probe="1" channel="1" .../>
//!         </RecordingSettings>
//!     </Settings>
//!     <Instructions>
//!         <Instruction start_time="0" delta_time="0.01" instruction_type="recording_start"/>
//!     </Instructions>
//! </Recording>
//! ```
//!
//! Entries are only ever appended. Settings written after an instruction open a new
//! `Settings` section, so the journal reads top to bottom in execution order. Ids are
//! 1-indexed. The whole document is rewritten to disk after each append.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::document::{render_document, Element};
use crate::error::AppResult;
use crate::range::{format_indices, format_references};
use crate::settings::{GeneralSettings, StimParam};

/// Instruction types shared by journals and scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    RecordingStart,
    StimulationStart,
    RecordingStop,
}

impl InstructionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstructionKind::RecordingStart => "recording_start",
            InstructionKind::StimulationStart => "stimulation_start",
            InstructionKind::RecordingStop => "recording_stop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recording_start" => Some(InstructionKind::RecordingStart),
            "stimulation_start" => Some(InstructionKind::StimulationStart),
            "recording_stop" => Some(InstructionKind::RecordingStop),
            _ => None,
        }
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start time and duration of a journaled action, in seconds since recording start.
///
/// Settings that were already active when the recording started use `(-1, -1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub start_time: f64,
    pub delta_time: f64,
}

impl Timing {
    pub const BEFORE_RECORDING: Timing = Timing {
        start_time: -1.0,
        delta_time: -1.0,
    };

    pub fn new(start_time: f64, delta_time: f64) -> Self {
        Self {
            start_time,
            delta_time,
        }
    }

    fn element(self, name: &str) -> Element {
        Element::new(name)
            .with_attr("start_time", self.start_time.to_string())
            .with_attr("delta_time", self.delta_time.to_string())
    }
}

/// Append-only journal of one recording.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    root: Element,
}

impl Journal {
    /// Create the journal file with an empty leading `Settings` section.
    pub fn create(path: impl Into<PathBuf>, file_name: &str) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut root = Element::new("Recording").with_attr("file_name", file_name);
        root.children.push(Element::new("Settings"));
        let journal = Self { path, root };
        journal.flush()?;
        debug!(path = %journal.path.display(), "Created stimulation journal");
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the journal file of a recording that never started.
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not remove journal");
        }
    }

    /// The in-memory document.
    pub fn document(&self) -> &Element {
        &self.root
    }

    /// Append a channel entry for every configured channel in `settings`.
    pub fn record_recording_settings(
        &mut self,
        settings: &GeneralSettings,
        timing: Timing,
    ) -> AppResult<()> {
        let mut entries = Vec::new();
        for (box_id, box_settings) in &settings.boxes {
            for (probe, probe_settings) in &box_settings.probes {
                for (channel, channel_settings) in &probe_settings.channels {
                    entries.push(
                        timing
                            .element("Channel")
                            .with_attr("box", (box_id + 1).to_string())
                            .with_attr("probe", (probe + 1).to_string())
                            .with_attr("channel", (channel + 1).to_string())
                            .with_attr("references", format_references(&channel_settings.references))
                            .with_attr("gain", channel_settings.gain.to_string())
                            .with_attr("input", channel_settings.input.to_string()),
                    );
                }
            }
        }
        self.settings_group("RecordingSettings").children.extend(entries);
        self.flush()
    }

    /// Append waveform and mapping entries for every configured stimulation unit.
    pub fn record_stimulation_settings(
        &mut self,
        settings: &GeneralSettings,
        timing: Timing,
    ) -> AppResult<()> {
        let mut configurations = Vec::new();
        let mut mappings = Vec::new();
        for (box_id, box_settings) in &settings.boxes {
            for (probe, probe_settings) in &box_settings.probes {
                for (unit, unit_settings) in &probe_settings.stim_units {
                    let mut entry = timing
                        .element("Configuration")
                        .with_attr("box", (box_id + 1).to_string())
                        .with_attr("probe", (probe + 1).to_string())
                        .with_attr("stimunit", (unit + 1).to_string());
                    for param in StimParam::ALL {
                        entry = entry.with_attr(param.name(), unit_settings.get(param).to_string());
                    }
                    configurations.push(entry);
                }
                for (unit, electrodes) in &probe_settings.electrode_maps {
                    mappings.push(
                        timing
                            .element("Mapping")
                            .with_attr("box", (box_id + 1).to_string())
                            .with_attr("probe", (probe + 1).to_string())
                            .with_attr("stimunit", (unit + 1).to_string())
                            .with_attr("electrodes", format_indices(electrodes)),
                    );
                }
            }
        }
        self.settings_group("StimulationWaveformSettings")
            .children
            .extend(configurations);
        self.settings_group("StimulationMappingSettings")
            .children
            .extend(mappings);
        self.flush()
    }

    /// Append an instruction; `extra` attributes follow the instruction type.
    pub fn record_instruction(
        &mut self,
        kind: InstructionKind,
        extra: &[(&str, String)],
        timing: Timing,
    ) -> AppResult<()> {
        let mut entry = timing
            .element("Instruction")
            .with_attr("instruction_type", kind.as_str());
        for (key, value) in extra {
            entry = entry.with_attr(*key, value.clone());
        }

        let needs_section = self
            .root
            .children
            .last()
            .map_or(true, |section| section.name != "Instructions");
        if needs_section {
            self.root.children.push(Element::new("Instructions"));
        }
        if let Some(section) = self.root.children.last_mut() {
            section.children.push(entry);
        }
        self.flush()
    }

    /// Settings group `name` inside the trailing `Settings` section, created as needed.
    fn settings_group(&mut self, name: &str) -> &mut Element {
        let needs_section = self
            .root
            .children
            .last()
            .map_or(true, |section| section.name != "Settings");
        if needs_section {
            self.root.children.push(Element::new("Settings"));
        }
        let last = self.root.children.len() - 1;
        let section = &mut self.root.children[last];

        let index = match section.children.iter().position(|g| g.name == name) {
            Some(index) => index,
            None => {
                section.children.push(Element::new(name));
                section.children.len() - 1
            }
        };
        &mut section.children[index]
    }

    fn flush(&self) -> AppResult<()> {
        std::fs::write(&self.path, render_document(&self.root)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::read_document;
    use crate::settings::{ChannelSettings, StimUnitSettings};

    fn settings() -> GeneralSettings {
        let mut settings = GeneralSettings::default();
        let probe = settings.probe_mut(0, 0);
        probe.channels.insert(0, ChannelSettings::default());
        probe.channels.insert(1, ChannelSettings::default());
        probe.stim_units.insert(0, StimUnitSettings::default());
        probe.electrode_maps.insert(0, vec![0, 4]);
        settings
    }

    #[test]
    fn sections_alternate_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.xml");
        let mut journal = Journal::create(&path, "rec").unwrap();

        journal
            .record_recording_settings(&settings(), Timing::BEFORE_RECORDING)
            .unwrap();
        journal
            .record_instruction(InstructionKind::RecordingStart, &[], Timing::new(0.0, 0.01))
            .unwrap();
        journal
            .record_stimulation_settings(&settings(), Timing::new(1.0, 0.5))
            .unwrap();
        journal
            .record_instruction(
                InstructionKind::StimulationStart,
                &[("box", "1".to_string())],
                Timing::new(2.0, 0.0),
            )
            .unwrap();

        let root = read_document(&path).unwrap();
        assert_eq!(root.attr("file_name"), Some("rec"));
        let sections: Vec<&str> = root.children.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(sections, ["Settings", "Instructions", "Settings", "Instructions"]);

        let channel = &root.children[0].children[0].children[1];
        assert_eq!(channel.attr("channel"), Some("2"));
        assert_eq!(channel.attr("references"), Some("b"));
        assert_eq!(channel.attr("start_time"), Some("-1"));

        let mapping = &root.children[2].children[1].children[0];
        assert_eq!(mapping.name, "Mapping");
        assert_eq!(mapping.attr("electrodes"), Some("1, 5"));
    }

    #[test]
    fn timing_attributes_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path().join("j.xml"), "rec").unwrap();
        journal
            .record_instruction(InstructionKind::RecordingStop, &[], Timing::new(3.5, 0.25))
            .unwrap();
        let instruction = &journal.document().children[1].children[0];
        let keys: Vec<&str> = instruction.attributes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["start_time", "delta_time", "instruction_type"]);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Stimulations").join("j.xml");
        Journal::create(&path, "rec").unwrap();
        assert!(path.exists());
    }
}
