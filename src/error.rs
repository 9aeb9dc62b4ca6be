//! Custom error types for the control core.
//!
//! This module defines the primary error type, `ViperError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it gives one consistent vocabulary for the failures
//! an operator can run into, from a mistyped channel expression to a probe that refused
//! its configuration.
//!
//! ## Error Hierarchy
//!
//! - **Expression errors** (`MalformedExpression`, `OutOfUniverse`): raised by the range
//!   parser when an identifier-set expression cannot be read or names ids that do not exist.
//! - **Settings errors** (`UnknownBox`, `UnknownProbe`, `InvalidGainOrInput`,
//!   `ParameterOutOfRange`): raised while merging a settings document into a working copy.
//! - **Document errors** (`MissingAttribute`, `InvalidNumber`, `Document`, `Xml`): the
//!   document itself is unreadable or incomplete.
//! - **Lifecycle errors** (`NotConnected`, `RecordingInProgress`, `NotRecording`, ...):
//!   an operation was requested in the wrong controller state.
//! - **Device errors** (`UploadFailed`, `Device`): the hardware capability layer reported
//!   a failure. Live settings are never modified when one of these is returned.
//!
//! The `Display` text of every variant is written for the operator; the controller hands
//! it back verbatim as the failure feedback of an operation.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ViperError>;

/// Errors produced by the ViperBox control core.
#[derive(Error, Debug)]
pub enum ViperError {
    /// Expression violates the identifier-set grammar.
    #[error("Malformed expression '{expr}': {reason}")]
    MalformedExpression { expr: String, reason: String },

    /// Expression names ids that are not part of the allowed universe.
    ///
    /// `ids` lists the offending 1-indexed ids as spans, e.g. `"5-6, 9"`.
    #[error("Expression '{expr}' refers to {ids}, which are not available")]
    OutOfUniverse { expr: String, ids: String },

    /// Settings reference boxes that are not connected (1-indexed spans).
    #[error("Box(es) {ids} are not connected")]
    UnknownBox { ids: String },

    /// Settings reference probes that are not connected on a box (1-indexed spans).
    #[error("Probe(s) {ids} are not connected on box {box_id}")]
    UnknownProbe { box_id: usize, ids: String },

    #[error("Invalid {field} '{value}': must be an integer between 0 and 3")]
    InvalidGainOrInput { field: String, value: String },

    /// Stimulation waveform parameter outside its (step, min, max) constraint.
    #[error("{screen_name} must be between {min} and {max} and a multiple of {step}. It is now {value}.")]
    ParameterOutOfRange {
        screen_name: String,
        min: i64,
        max: i64,
        step: i64,
        value: i64,
    },

    #[error("Unknown stimulation parameter '{0}'")]
    UnknownParameter(String),

    #[error("{element} element is missing attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },

    #[error("Attribute '{attribute}' has non-numeric value '{value}'")]
    InvalidNumber { attribute: String, value: String },

    #[error("Invalid document: {0}")]
    Document(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("No ViperBox found, please check the connection")]
    NoDeviceFound,

    #[error("{0} ViperBoxes found, only one may be connected")]
    MultipleDevicesFound(usize),

    /// A probe in the uploaded baseline does not configure all of its channels.
    #[error("Recording settings of box {box_id}, probe {probe} cover {configured} of 64 channels; upload settings for every channel first")]
    IncompleteRecordingSettings {
        box_id: usize,
        probe: usize,
        configured: usize,
    },

    #[error("Recording in progress, cannot perform this action")]
    RecordingInProgress,

    #[error("No recording in progress, start a recording first")]
    NotRecording,

    #[error("Not connected to ViperBox")]
    NotConnected,

    #[error("Stimulation settings have not been uploaded")]
    StimulationSettingsNotUploaded,

    /// Hardware rejected part of an upload; live settings were left untouched.
    #[error("Failed to upload {what}: {reason}")]
    UploadFailed { what: String, reason: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid script: {0}")]
    Script(String),

    #[error("A script is already running")]
    ScriptAlreadyRunning,

    /// The sample source delivered fewer packets than requested.
    #[error("Stream underrun: requested {requested} packets, received {received}")]
    StreamUnderrun { requested: usize, received: usize },
}

impl ViperError {
    /// Wrap a device capability failure that happened while uploading `what`.
    pub fn upload(what: impl Into<String>, err: anyhow::Error) -> Self {
        ViperError::UploadFailed {
            what: what.into(),
            reason: format!("{err:#}"),
        }
    }

    /// Wrap a device capability failure outside of an upload.
    pub fn device(err: anyhow::Error) -> Self {
        ViperError::Device(format!("{err:#}"))
    }
}
