//! Hierarchical hardware settings.
//!
//! Settings form a tree: a [`GeneralSettings`] holds the connected boxes, each
//! [`BoxSettings`] holds its probes, and each [`ProbeSettings`] holds channel, stimulation
//! unit and electrode-mapping entries. Entries only exist once a settings document has
//! configured them, which is how the controller tells "uploaded" from "never configured".
//!
//! All ids in this module are 0-indexed.
//!
//! The controller keeps a live tree and clones it into a working copy for every upload;
//! the copy replaces the live tree only after the hardware accepted it.

pub mod channel;
pub mod stim_unit;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use channel::ChannelSettings;
pub use stim_unit::{stim_units_to_bitmask, StimParam, StimUnitSettings};

/// Boxes addressable by one session.
pub const BOX_COUNT: usize = 4;
/// Probes per box.
pub const PROBES_PER_BOX: usize = 4;
/// Recording channels per probe.
pub const CHANNELS_PER_PROBE: usize = 64;
/// Stimulation units per probe.
pub const STIM_UNITS_PER_PROBE: usize = 8;
/// Stimulation electrodes per probe.
pub const ELECTRODES_PER_PROBE: usize = 128;

/// Boolean matrix of which electrodes each stimulation unit drives.
pub type StimulationImage = [[bool; ELECTRODES_PER_PROBE]; STIM_UNITS_PER_PROBE];

/// Settings of one probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub channels: BTreeMap<usize, ChannelSettings>,
    pub stim_units: BTreeMap<usize, StimUnitSettings>,
    /// Electrodes driven by each stimulation unit, ascending.
    pub electrode_maps: BTreeMap<usize, Vec<usize>>,
}

impl ProbeSettings {
    /// Which electrodes each stimulation unit is connected to.
    pub fn stimulation_image(&self) -> StimulationImage {
        let mut image = [[false; ELECTRODES_PER_PROBE]; STIM_UNITS_PER_PROBE];
        for (unit, electrodes) in &self.electrode_maps {
            let Some(row) = image.get_mut(*unit) else {
                continue;
            };
            for electrode in electrodes {
                if let Some(cell) = row.get_mut(*electrode) {
                    *cell = true;
                }
            }
        }
        image
    }

    pub fn reset_recording(&mut self) {
        self.channels.clear();
    }

    pub fn reset_stimulation(&mut self) {
        self.stim_units.clear();
        self.electrode_maps.clear();
    }
}

/// Settings of one box plus its read-only identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxSettings {
    pub serial: Option<String>,
    pub firmware_version: Option<String>,
    pub probes: BTreeMap<usize, ProbeSettings>,
}

/// Root of the settings tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub boxes: BTreeMap<usize, BoxSettings>,
}

impl GeneralSettings {
    /// Populated boxes mapped to their probe ids.
    pub fn connected(&self) -> BTreeMap<usize, Vec<usize>> {
        self.boxes
            .iter()
            .map(|(id, settings)| (*id, settings.probes.keys().copied().collect()))
            .collect()
    }

    pub fn probe(&self, box_id: usize, probe: usize) -> Option<&ProbeSettings> {
        self.boxes.get(&box_id)?.probes.get(&probe)
    }

    /// Probe settings, creating the box and probe entries if needed.
    pub fn probe_mut(&mut self, box_id: usize, probe: usize) -> &mut ProbeSettings {
        self.boxes
            .entry(box_id)
            .or_default()
            .probes
            .entry(probe)
            .or_default()
    }

    fn probes_mut(&mut self) -> impl Iterator<Item = &mut ProbeSettings> {
        self.boxes.values_mut().flat_map(|b| b.probes.values_mut())
    }

    /// Forget all channel configuration, keeping the box/probe structure.
    pub fn reset_recording_settings(&mut self) {
        self.probes_mut().for_each(ProbeSettings::reset_recording);
    }

    /// Forget all stimulation unit and mapping configuration.
    pub fn reset_stimulation_settings(&mut self) {
        self.probes_mut().for_each(ProbeSettings::reset_stimulation);
    }

    /// Forget every probe-level setting.
    pub fn reset_probe_settings(&mut self) {
        for probe in self.probes_mut() {
            *probe = ProbeSettings::default();
        }
    }

    /// Topology of the populated boxes and probes.
    pub fn topology(&self) -> ConnectivityTopology {
        let mut topology = ConnectivityTopology::new();
        for (box_id, box_settings) in &self.boxes {
            topology.add_box(*box_id);
            for probe in box_settings.probes.keys() {
                topology.add_probe(*box_id, *probe);
            }
        }
        topology
    }

    /// Pretty JSON dump for diagnostics.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Physically attached `(box, probe)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityTopology {
    boxes: BTreeMap<usize, BTreeSet<usize>>,
}

impl ConnectivityTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_box(&mut self, box_id: usize) {
        self.boxes.entry(box_id).or_default();
    }

    pub fn add_probe(&mut self, box_id: usize, probe: usize) {
        self.boxes.entry(box_id).or_default().insert(probe);
    }

    pub fn boxes(&self) -> Vec<usize> {
        self.boxes.keys().copied().collect()
    }

    /// Probes attached to `box_id`; empty when the box is unknown.
    pub fn probes(&self, box_id: usize) -> Vec<usize> {
        self.boxes
            .get(&box_id)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn clear(&mut self) {
        self.boxes.clear();
    }

    /// Settings tree with an empty probe entry for every attached probe.
    pub fn empty_settings(&self) -> GeneralSettings {
        let mut settings = GeneralSettings::default();
        for (box_id, probes) in &self.boxes {
            let entry = settings.boxes.entry(*box_id).or_default();
            for probe in probes {
                entry.probes.insert(*probe, ProbeSettings::default());
            }
        }
        settings
    }
}

/// Timing of the most recent stimulation settings upload, relative to recording start.
///
/// Uploads made while no recording runs are stored as `(-1, -1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadTiming {
    pub start_time: f64,
    pub delta_time: f64,
}

impl Default for UploadTiming {
    fn default() -> Self {
        Self {
            start_time: -1.0,
            delta_time: -1.0,
        }
    }
}

/// Session status flags.
#[derive(Debug, Clone, Default)]
pub struct StatusTracking {
    pub connected: bool,
    pub recording: bool,
    pub recording_settings_uploaded: bool,
    pub stimulation_settings_uploaded: bool,
    /// Whether the current stimulation settings were already copied into the journal.
    pub stimulation_settings_journaled: bool,
    pub test_mode: bool,
    pub stim_upload_time: UploadTiming,
    /// Trigger bitmask last sent per `(box, probe)`.
    pub stim_unit_busy: BTreeMap<(usize, usize), u8>,
}
