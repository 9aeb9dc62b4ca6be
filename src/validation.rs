//! Validation and merge of setting records into a working copy.
//!
//! A settings document is turned into a batch of [`SettingRecord`]s (see
//! [`crate::document`]). [`merge_settings`] resolves each record's box and probe
//! expressions against the physically attached hardware, validates the record's values
//! and writes them into a working copy of the settings tree.
//!
//! The working copy is taken by value. When a record fails, the copy is dropped and the
//! caller's live settings were never touched, so a failed batch needs no rollback.

use crate::error::{AppResult, ViperError};
use crate::range::{parse_indices, parse_reference_mask};
use crate::settings::channel::MAX_GAIN_OR_INPUT;
use crate::settings::{
    ChannelSettings, ConnectivityTopology, GeneralSettings, StimParam, StimUnitSettings,
    CHANNELS_PER_PROBE, ELECTRODES_PER_PROBE, STIM_UNITS_PER_PROBE,
};

/// Box and probe expressions shared by every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAddress {
    pub boxes: String,
    pub probes: String,
}

/// One attribute-addressed settings entry as written in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingRecord {
    /// Recording channel configuration.
    Channel {
        address: RecordAddress,
        channels: String,
        references: String,
        gain: String,
        input: String,
    },
    /// Stimulation unit waveform, values still unverified.
    Waveform {
        address: RecordAddress,
        stim_units: String,
        values: Vec<(StimParam, i64)>,
    },
    /// Stimulation unit to electrode mapping.
    Mapping {
        address: RecordAddress,
        stim_units: String,
        electrodes: String,
    },
}

/// Kind of a setting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Channel,
    Waveform,
    Mapping,
}

impl SettingRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            SettingRecord::Channel { .. } => RecordKind::Channel,
            SettingRecord::Waveform { .. } => RecordKind::Waveform,
            SettingRecord::Mapping { .. } => RecordKind::Mapping,
        }
    }

    pub fn address(&self) -> &RecordAddress {
        match self {
            SettingRecord::Channel { address, .. }
            | SettingRecord::Waveform { address, .. }
            | SettingRecord::Mapping { address, .. } => address,
        }
    }
}

/// Which record kinds a merge admits; other records are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Recording,
    Stimulation,
}

impl Scope {
    pub fn admits(self, kind: RecordKind) -> bool {
        match self {
            Scope::All => true,
            Scope::Recording => kind == RecordKind::Channel,
            Scope::Stimulation => matches!(kind, RecordKind::Waveform | RecordKind::Mapping),
        }
    }

    /// Scope that admits exactly `kind`.
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Channel => Scope::Recording,
            RecordKind::Waveform | RecordKind::Mapping => Scope::Stimulation,
        }
    }
}

/// Validate `batch` and apply it, in order, to `working`.
///
/// Records outside `scope` are ignored. Box and probe expressions resolve against
/// `topology`; anything not attached is rejected.
pub fn merge_settings(
    batch: &[SettingRecord],
    mut working: GeneralSettings,
    topology: &ConnectivityTopology,
    scope: Scope,
) -> AppResult<GeneralSettings> {
    for record in batch.iter().filter(|r| scope.admits(r.kind())) {
        apply_record(record, &mut working, topology)?;
    }
    Ok(working)
}

/// Resolve a record address into concrete `(box, probe)` pairs.
pub fn resolve_targets(
    address: &RecordAddress,
    topology: &ConnectivityTopology,
) -> AppResult<Vec<(usize, usize)>> {
    let boxes = parse_indices(&address.boxes, &topology.boxes()).map_err(|e| match e {
        ViperError::OutOfUniverse { ids, .. } => ViperError::UnknownBox { ids },
        other => other,
    })?;

    let mut targets = Vec::new();
    for box_id in boxes {
        let probes =
            parse_indices(&address.probes, &topology.probes(box_id)).map_err(|e| match e {
                ViperError::OutOfUniverse { ids, .. } => ViperError::UnknownProbe {
                    box_id: box_id + 1,
                    ids,
                },
                other => other,
            })?;
        targets.extend(probes.into_iter().map(|probe| (box_id, probe)));
    }
    Ok(targets)
}

fn universe(n: usize) -> Vec<usize> {
    (0..n).collect()
}

fn apply_record(
    record: &SettingRecord,
    working: &mut GeneralSettings,
    topology: &ConnectivityTopology,
) -> AppResult<()> {
    let targets = resolve_targets(record.address(), topology)?;

    match record {
        SettingRecord::Channel {
            channels,
            references,
            gain,
            input,
            ..
        } => {
            let channels = parse_indices(channels, &universe(CHANNELS_PER_PROBE))?;
            let settings = ChannelSettings {
                references: parse_reference_mask(references)?,
                gain: check_gain_or_input("gain", gain)?,
                input: check_gain_or_input("input", input)?,
            };
            for (box_id, probe) in targets {
                let probe = working.probe_mut(box_id, probe);
                for channel in &channels {
                    probe.channels.insert(*channel, settings);
                }
            }
        }
        SettingRecord::Waveform {
            stim_units, values, ..
        } => {
            let units = parse_indices(stim_units, &universe(STIM_UNITS_PER_PROBE))?;
            let settings = StimUnitSettings::from_values(values)?;
            for (box_id, probe) in targets {
                let probe = working.probe_mut(box_id, probe);
                for unit in &units {
                    probe.stim_units.insert(*unit, settings);
                }
            }
        }
        SettingRecord::Mapping {
            stim_units,
            electrodes,
            ..
        } => {
            let units = parse_indices(stim_units, &universe(STIM_UNITS_PER_PROBE))?;
            let electrodes = parse_indices(electrodes, &universe(ELECTRODES_PER_PROBE))?;
            for (box_id, probe) in targets {
                let probe = working.probe_mut(box_id, probe);
                for unit in &units {
                    probe.electrode_maps.insert(*unit, electrodes.clone());
                }
            }
        }
    }
    Ok(())
}

/// Gain and input are single integers in `0..=3`.
pub fn check_gain_or_input(field: &str, value: &str) -> AppResult<u8> {
    match value.trim().parse::<u8>() {
        Ok(v) if v <= MAX_GAIN_OR_INPUT => Ok(v),
        _ => Err(ViperError::InvalidGainOrInput {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Check one named parameter without touching any settings.
///
/// Accepts every stimulation waveform parameter plus `gain` and `input`.
pub fn verify_parameter(name: &str, value: &str) -> AppResult<()> {
    if name == "gain" || name == "input" {
        return check_gain_or_input(name, value).map(|_| ());
    }
    let param =
        StimParam::from_name(name).ok_or_else(|| ViperError::UnknownParameter(name.to_string()))?;
    let value: i64 = value.trim().parse().map_err(|_| ViperError::InvalidNumber {
        attribute: name.to_string(),
        value: value.to_string(),
    })?;
    param.verify(value)
}
