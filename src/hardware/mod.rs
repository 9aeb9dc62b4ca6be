//! Device capability interface.
//!
//! The vendor driver is opaque to the control core. Everything the controller needs from
//! it is captured by [`ViperDevice`], a synchronous trait mirroring the driver's blocking
//! API, and [`SampleReader`], the handle to a recording's packet stream.
//!
//! # Contract
//!
//! - Methods block until the driver call returned.
//! - Implementations are `Send + Sync`; the controller shares one device between its
//!   operations and the script runner thread.
//! - Errors use `anyhow::Result` so drivers can attach their own context. The controller
//!   maps them into [`crate::error::ViperError`] at the call site.
//!
//! [`mock::MockViperBox`] implements the interface for emulation runs and tests.

pub mod mock;

use std::path::Path;

use anyhow::Result;

use crate::settings::{StimUnitSettings, StimulationImage};

/// Identity reported by a box when it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoxIdentity {
    pub serial: String,
    pub firmware_version: String,
}

/// One sample packet: every physical channel plus the status word.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub data: Vec<u16>,
    pub status: u16,
}

/// Reads sample packets of one probe from an active recording.
pub trait SampleReader: Send {
    /// Read up to `count` packets.
    ///
    /// Returning fewer packets than requested means the recording has not produced them
    /// yet; returning none means the stream is exhausted.
    fn read_packets(&mut self, count: usize) -> Result<Vec<Packet>>;
}

/// Blocking capability interface of the ViperBox driver.
pub trait ViperDevice: Send + Sync {
    /// List attached devices.
    fn discover(&self) -> Result<Vec<String>>;

    /// Open a box. `emulation` asks the driver to simulate the hardware.
    fn open_box(&self, box_id: usize, emulation: bool) -> Result<BoxIdentity>;
    fn open_probes(&self, box_id: usize) -> Result<()>;
    fn init_probe(&self, box_id: usize, probe: usize) -> Result<()>;
    fn close_probes(&self, box_id: usize) -> Result<()>;
    fn close_box(&self, box_id: usize) -> Result<()>;

    // Recording channel configuration
    fn select_electrode(&self, box_id: usize, probe: usize, channel: usize, input: u8)
        -> Result<()>;
    fn set_reference(&self, box_id: usize, probe: usize, channel: usize, mask: u16) -> Result<()>;
    fn set_gain(&self, box_id: usize, probe: usize, channel: usize, gain: u8) -> Result<()>;
    fn set_auto_zero(&self, box_id: usize, probe: usize, channel: usize, enabled: bool)
        -> Result<()>;
    /// Commit staged channel configuration to the probe.
    fn write_channel_config(&self, box_id: usize, probe: usize) -> Result<()>;

    // Stimulation configuration
    fn set_output_stage_image(
        &self,
        box_id: usize,
        probe: usize,
        image: &StimulationImage,
    ) -> Result<()>;
    fn set_stim_blank(&self, box_id: usize, probe: usize, electrode: usize, enabled: bool)
        -> Result<()>;
    fn set_discharge_permanent(
        &self,
        box_id: usize,
        probe: usize,
        electrode: usize,
        enabled: bool,
    ) -> Result<()>;
    /// Commit staged output stage configuration to the probe.
    fn write_output_stage_config(&self, box_id: usize, probe: usize) -> Result<()>;
    fn write_stim_unit_config(
        &self,
        box_id: usize,
        probe: usize,
        unit: usize,
        settings: &StimUnitSettings,
    ) -> Result<()>;

    // Acquisition
    /// Route the box's data to `path`, or stop writing when `None`.
    fn set_file_stream(&self, box_id: usize, path: Option<&Path>) -> Result<()>;
    fn enable_file_stream(&self, box_id: usize, enabled: bool) -> Result<()>;
    /// Arm the box. Arming a running box stops acquisition.
    fn arm(&self, box_id: usize) -> Result<()>;
    fn software_trigger(&self, box_id: usize) -> Result<()>;
    /// Fire the stimulation units selected by `mask` (unit `i` at bit `7 - i`).
    fn trigger_stim_units(&self, box_id: usize, probe: usize, mask: u8) -> Result<()>;

    /// Open a packet reader on a recording file for one probe.
    fn open_stream(&self, path: &Path, probe: usize) -> Result<Box<dyn SampleReader>>;
}
