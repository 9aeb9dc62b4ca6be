//! Mock Hardware Implementations
//!
//! Provides a simulated ViperBox for emulation runs and tests without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockViperBox` - Simulated box that accepts every configuration call and records it
//! - `SimulatedReader` - Endless ramp-plus-noise packet stream
//! - `ScriptedReader` - Packet stream with caller-chosen batch sizes, for underrun tests

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rand::Rng;

use crate::hardware::{BoxIdentity, Packet, SampleReader, ViperDevice};
use crate::settings::{StimUnitSettings, StimulationImage, CHANNELS_PER_PROBE};

// =============================================================================
// MockViperBox - Simulated ViperBox
// =============================================================================

/// Simulated ViperBox.
///
/// Every driver call is appended to a call log as `"<operation> <args...>"`, so tests can
/// assert on the exact sequence the controller issued. Failures can be injected per
/// operation name or per probe initialisation.
///
/// # Example
///
/// ```rust,ignore
/// let device = MockViperBox::new();
/// device.fail_on("write_channel_config");
/// // ... upload recording settings, which now fails ...
/// assert_eq!(device.count("write_channel_config"), 1);
/// ```
pub struct MockViperBox {
    device_count: usize,
    stream_packets: Option<usize>,
    failing_probes: Mutex<HashSet<(usize, usize)>>,
    failing_call: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockViperBox {
    /// One attached box, endless sample stream, no failures.
    pub fn new() -> Self {
        Self {
            device_count: 1,
            stream_packets: None,
            failing_probes: Mutex::new(HashSet::new()),
            failing_call: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Report `count` attached devices during discovery.
    pub fn with_device_count(mut self, count: usize) -> Self {
        self.device_count = count;
        self
    }

    /// Limit every opened sample stream to `packets` packets.
    pub fn with_stream_packets(mut self, packets: usize) -> Self {
        self.stream_packets = Some(packets);
        self
    }

    /// Make initialisation of one probe fail.
    pub fn with_failing_probe(self, box_id: usize, probe: usize) -> Self {
        self.failing_probes.lock().insert((box_id, probe));
        self
    }

    /// Make calls fail until [`MockViperBox::clear_failure`].
    ///
    /// `call` is an operation name (`"set_gain"`) or a call-log prefix with arguments
    /// (`"trigger_stim_units 0 1"`) to fail only matching calls.
    pub fn fail_on(&self, call: &str) {
        *self.failing_call.lock() = Some(call.to_string());
    }

    pub fn clear_failure(&self) {
        *self.failing_call.lock() = None;
    }

    /// Snapshot of the call log.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of logged calls to `operation`.
    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, operation: &str, args: std::fmt::Arguments<'_>) -> Result<()> {
        let entry = format!("{operation} {args}").trim_end().to_string();
        let fails = self
            .failing_call
            .lock()
            .as_deref()
            .is_some_and(|call| entry == call || entry.starts_with(&format!("{call} ")));
        self.calls.lock().push(entry);
        if fails {
            return Err(anyhow!("simulated failure in {operation}"));
        }
        Ok(())
    }
}

impl Default for MockViperBox {
    fn default() -> Self {
        Self::new()
    }
}

impl ViperDevice for MockViperBox {
    fn discover(&self) -> Result<Vec<String>> {
        self.record("discover", format_args!(""))?;
        Ok((0..self.device_count)
            .map(|i| format!("SIM-VIPERBOX-{i}"))
            .collect())
    }

    fn open_box(&self, box_id: usize, emulation: bool) -> Result<BoxIdentity> {
        self.record("open_box", format_args!("{box_id} {emulation}"))?;
        Ok(BoxIdentity {
            serial: format!("SIM-VIPERBOX-{box_id}"),
            firmware_version: "sim-1.0".to_string(),
        })
    }

    fn open_probes(&self, box_id: usize) -> Result<()> {
        self.record("open_probes", format_args!("{box_id}"))
    }

    fn init_probe(&self, box_id: usize, probe: usize) -> Result<()> {
        self.record("init_probe", format_args!("{box_id} {probe}"))?;
        if self.failing_probes.lock().contains(&(box_id, probe)) {
            return Err(anyhow!("probe {probe} on box {box_id} did not respond"));
        }
        Ok(())
    }

    fn close_probes(&self, box_id: usize) -> Result<()> {
        self.record("close_probes", format_args!("{box_id}"))
    }

    fn close_box(&self, box_id: usize) -> Result<()> {
        self.record("close_box", format_args!("{box_id}"))
    }

    fn select_electrode(
        &self,
        box_id: usize,
        probe: usize,
        channel: usize,
        input: u8,
    ) -> Result<()> {
        self.record(
            "select_electrode",
            format_args!("{box_id} {probe} {channel} {input}"),
        )
    }

    fn set_reference(&self, box_id: usize, probe: usize, channel: usize, mask: u16) -> Result<()> {
        self.record(
            "set_reference",
            format_args!("{box_id} {probe} {channel} {mask}"),
        )
    }

    fn set_gain(&self, box_id: usize, probe: usize, channel: usize, gain: u8) -> Result<()> {
        self.record("set_gain", format_args!("{box_id} {probe} {channel} {gain}"))
    }

    fn set_auto_zero(
        &self,
        box_id: usize,
        probe: usize,
        channel: usize,
        enabled: bool,
    ) -> Result<()> {
        self.record(
            "set_auto_zero",
            format_args!("{box_id} {probe} {channel} {enabled}"),
        )
    }

    fn write_channel_config(&self, box_id: usize, probe: usize) -> Result<()> {
        self.record("write_channel_config", format_args!("{box_id} {probe}"))
    }

    fn set_output_stage_image(
        &self,
        box_id: usize,
        probe: usize,
        image: &StimulationImage,
    ) -> Result<()> {
        let active = image.iter().flatten().filter(|cell| **cell).count();
        self.record(
            "set_output_stage_image",
            format_args!("{box_id} {probe} {active}"),
        )
    }

    fn set_stim_blank(
        &self,
        box_id: usize,
        probe: usize,
        electrode: usize,
        enabled: bool,
    ) -> Result<()> {
        self.record(
            "set_stim_blank",
            format_args!("{box_id} {probe} {electrode} {enabled}"),
        )
    }

    fn set_discharge_permanent(
        &self,
        box_id: usize,
        probe: usize,
        electrode: usize,
        enabled: bool,
    ) -> Result<()> {
        self.record(
            "set_discharge_permanent",
            format_args!("{box_id} {probe} {electrode} {enabled}"),
        )
    }

    fn write_output_stage_config(&self, box_id: usize, probe: usize) -> Result<()> {
        self.record("write_output_stage_config", format_args!("{box_id} {probe}"))
    }

    fn write_stim_unit_config(
        &self,
        box_id: usize,
        probe: usize,
        unit: usize,
        settings: &StimUnitSettings,
    ) -> Result<()> {
        self.record(
            "write_stim_unit_config",
            format_args!(
                "{box_id} {probe} {unit} {} {}",
                settings.polarity, settings.pulses
            ),
        )
    }

    fn set_file_stream(&self, box_id: usize, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => self.record(
                "set_file_stream",
                format_args!("{box_id} {}", path.display()),
            ),
            None => self.record("set_file_stream", format_args!("{box_id} none")),
        }
    }

    fn enable_file_stream(&self, box_id: usize, enabled: bool) -> Result<()> {
        self.record("enable_file_stream", format_args!("{box_id} {enabled}"))
    }

    fn arm(&self, box_id: usize) -> Result<()> {
        self.record("arm", format_args!("{box_id}"))
    }

    fn software_trigger(&self, box_id: usize) -> Result<()> {
        self.record("software_trigger", format_args!("{box_id}"))
    }

    fn trigger_stim_units(&self, box_id: usize, probe: usize, mask: u8) -> Result<()> {
        self.record(
            "trigger_stim_units",
            format_args!("{box_id} {probe} {mask}"),
        )
    }

    fn open_stream(&self, path: &Path, probe: usize) -> Result<Box<dyn SampleReader>> {
        self.record("open_stream", format_args!("{} {probe}", path.display()))?;
        Ok(Box::new(SimulatedReader::new(self.stream_packets)))
    }
}

// =============================================================================
// SimulatedReader - Ramp plus noise
// =============================================================================

/// Endless (or bounded) stream of simulated packets.
///
/// Channel `c` carries a slow ramp offset by `c * 100` plus uniform noise. Every
/// thousandth packet has status bit 1 set.
pub struct SimulatedReader {
    remaining: Option<usize>,
    counter: u64,
}

impl SimulatedReader {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            remaining: limit,
            counter: 0,
        }
    }
}

impl SampleReader for SimulatedReader {
    fn read_packets(&mut self, count: usize) -> Result<Vec<Packet>> {
        let count = match self.remaining {
            Some(remaining) => {
                let n = count.min(remaining);
                self.remaining = Some(remaining - n);
                n
            }
            None => count,
        };

        let mut rng = rand::thread_rng();
        let mut packets = Vec::with_capacity(count);
        for _ in 0..count {
            let ramp = (self.counter % 1000) as u16;
            let data = (0..CHANNELS_PER_PROBE)
                .map(|c| 30_000 + (c as u16) * 100 + ramp + rng.gen_range(0..50))
                .collect();
            let status = if self.counter % 1000 == 0 { 0b10 } else { 0 };
            packets.push(Packet { data, status });
            self.counter += 1;
        }
        Ok(packets)
    }
}

// =============================================================================
// ScriptedReader - Fixed batch sizes
// =============================================================================

/// Packet stream that delivers a fixed sequence of batch sizes, then ends.
///
/// Each call to `read_packets` consumes one entry of the script and returns
/// `min(entry, count)` packets. Packet values encode their sequence number.
pub struct ScriptedReader {
    batches: std::collections::VecDeque<usize>,
    channels: usize,
    counter: u16,
}

impl ScriptedReader {
    pub fn new(batches: impl IntoIterator<Item = usize>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
            channels: CHANNELS_PER_PROBE,
            counter: 0,
        }
    }
}

impl SampleReader for ScriptedReader {
    fn read_packets(&mut self, count: usize) -> Result<Vec<Packet>> {
        let Some(batch) = self.batches.pop_front() else {
            return Ok(Vec::new());
        };
        let mut packets = Vec::with_capacity(batch.min(count));
        for _ in 0..batch.min(count) {
            packets.push(Packet {
                data: vec![self.counter; self.channels],
                status: 0,
            });
            self.counter = self.counter.wrapping_add(1);
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_log_and_failure_injection() {
        let device = MockViperBox::new();
        device.set_gain(0, 1, 5, 2).unwrap();
        device.fail_on("write_channel_config");
        assert!(device.write_channel_config(0, 1).is_err());
        device.clear_failure();
        device.write_channel_config(0, 1).unwrap();

        assert_eq!(device.calls()[0], "set_gain 0 1 5 2");
        assert_eq!(device.count("write_channel_config"), 2);
    }

    #[test]
    fn failure_can_target_call_arguments() {
        let device = MockViperBox::new();
        device.fail_on("trigger_stim_units 0 1");
        assert!(device.trigger_stim_units(0, 0, 128).is_ok());
        assert!(device.trigger_stim_units(0, 1, 128).is_err());
        assert!(device.trigger_stim_units(0, 10, 128).is_ok());
    }

    #[test]
    fn failing_probe_only_affects_that_probe() {
        let device = MockViperBox::new().with_failing_probe(0, 2);
        assert!(device.init_probe(0, 1).is_ok());
        assert!(device.init_probe(0, 2).is_err());
    }

    #[test]
    fn bounded_simulated_stream_ends() {
        let mut reader = SimulatedReader::new(Some(700));
        assert_eq!(reader.read_packets(500).unwrap().len(), 500);
        let tail = reader.read_packets(500).unwrap();
        assert_eq!(tail.len(), 200);
        assert_eq!(tail[0].data.len(), CHANNELS_PER_PROBE);
        assert!(reader.read_packets(500).unwrap().is_empty());
    }

    #[test]
    fn scripted_reader_follows_batches() {
        let mut reader = ScriptedReader::new([500, 200]);
        assert_eq!(reader.read_packets(500).unwrap().len(), 500);
        assert_eq!(reader.read_packets(500).unwrap().len(), 200);
        assert!(reader.read_packets(500).unwrap().is_empty());
    }
}
