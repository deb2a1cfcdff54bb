//! Logic analyzer capture controller
//!
//! Drives the on-chip analyzer through its control/status registers:
//! select a signal group, set the subsampler and trigger, arm a capture window
//! on the device's circular sample buffer, poll for completion, and upload the
//! window starting `offset` samples before the latched trigger pointer.

mod analyzer;
mod trigger;
mod types;

pub use analyzer::{Analyzer, AnalyzerRegisters, DEFAULT_PREFIX, STATUS_DONE, STATUS_TRIGGERED};
pub use trigger::{TriggerCondition, TriggerValue};
pub use types::{CaptureRequest, CaptureState, UploadedTrace};
