//! # ViperBox Control Core
//!
//! Headless control core for the ViperBox neural recording and stimulation system. It
//! validates and uploads hardware settings, drives recordings and stimulation, journals
//! every action next to the recording, streams samples to an acquisition client, and
//! replays timed experiment scripts.
//!
//! ## Crate Structure
//!
//! - **`controller`**: `ViperController`, the device lifecycle state machine that every
//!   front end talks to.
//! - **`range`**: the range-expression language (`"1-3,7"`, `"-"`, `"b,2"`) used to select
//!   boxes, probes, channels, stimulation units, electrodes and references.
//! - **`settings`**: the hierarchical settings tree and parameter limits.
//! - **`document`**: XML settings documents and the built-in defaults.
//! - **`validation`**: the merge engine that validates records and applies them to a
//!   working copy of the settings tree.
//! - **`journal`**: the per-recording XML journal of settings and instructions.
//! - **`scheduler`**: timed execution of experiment scripts.
//! - **`streaming`**: frame encoding, notch filtering and paced delivery to the consumer.
//! - **`hardware`**: the `ViperDevice` capability trait and the mock device.
//! - **`config`**: layered configuration (defaults, TOML file, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the `ViperError` enum shared across the crate.

pub mod config;
pub mod controller;
pub mod document;
pub mod error;
pub mod hardware;
pub mod journal;
pub mod logging;
pub mod range;
pub mod scheduler;
pub mod settings;
pub mod streaming;
pub mod validation;

pub use controller::{Outcome, ViperController};
pub use error::{AppResult, ViperError};
