//! Remote register access and logic capture for a USB3 PIPE debug SoC
//!
//! This library talks to a live FPGA over a narrow register bus bridge, reads and
//! writes device registers and memories by their published symbolic names, and
//! drives the on-chip logic analyzer used to debug USB3 link training.
//!
//! # Architecture
//!
//! - **Bridge**: request/response register bus transports (Etherbone over TCP,
//!   UART bridge framing, and an in-memory simulated device)
//! - **AddressMap**: the published CSV register/memory/signal tables
//! - **RemoteClient**: named, typed register and memory access over a bridge
//! - **Analyzer**: the capture state machine (subsampler, trigger, run, wait, upload)
//! - **Trace**: bit-slice decoding and waveform dumps (VCD, CSV, DSLogic)
//!
//! # Example
//!
//! ```no_run
//! use usb3scope::{AddressMap, Analyzer, EtherboneTransport, RemoteClient, TriggerCondition};
//! use usb3scope::trace::{self, WaveformFormat};
//!
//! let map = AddressMap::load_files(&["csr.csv", "analyzer.csv"])?;
//! let mut client = RemoteClient::new(EtherboneTransport::new("localhost:1234"), map);
//! client.open()?;
//!
//! let mut analyzer = Analyzer::new(&mut client, "analyzer")?;
//! analyzer.configure_subsampler(1)?;
//! analyzer.configure_trigger(&TriggerCondition::new().with("polling", 1))?;
//! analyzer.run(8, 64)?;
//! analyzer.wait_done()?;
//! let uploaded = analyzer.upload()?;
//! let decoded = trace::decode(&uploaded, uploaded.layout());
//! trace::save(&decoded, "analyzer.vcd", WaveformFormat::Vcd)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod bridge;
pub mod capture;
pub mod client;
pub mod config;
pub mod map;
pub mod trace;

pub use bridge::{
    BridgeError, EtherboneTransport, Request, Response, SimDevice, Transport, UartTransport,
};
pub use capture::{Analyzer, CaptureRequest, CaptureState, TriggerCondition, TriggerValue, UploadedTrace};
pub use client::RemoteClient;
pub use config::{BridgeConfig, WaitPolicy};
pub use map::{AddressMap, AddressMapEntry, EntryKind, SignalLayout, SignalSpec};
pub use trace::{DecodedSignal, DecodedTrace, WaveformFormat};

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Cannot open bridge at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Device unresponsive accessing '{name}' at 0x{address:08x}: {reason}")]
    DeviceUnresponsive {
        name: String,
        address: u32,
        reason: String,
    },

    #[error("Unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },

    #[error("Index {index} out of range for '{name}' ({count} elements)")]
    IndexOutOfRange {
        name: String,
        index: usize,
        count: usize,
    },

    #[error("Capture did not complete within {timeout:?} (last state: {state})")]
    CaptureTimeout { timeout: Duration, state: String },

    #[error("Malformed address map (line {line}): {reason}")]
    MalformedMap { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid capture window: offset={offset}, length={length}, depth={depth}")]
    InvalidWindow {
        offset: usize,
        length: usize,
        depth: usize,
    },

    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Invalid trigger on '{signal}': {reason}")]
    InvalidTrigger { signal: String, reason: String },

    #[error("'{name}' is {width} bits wide, too wide for a {limit}-bit access")]
    WidthOverflow {
        name: String,
        width: u32,
        limit: u32,
    },

    #[error("Subsampler divisor {value} out of range (1..={max})")]
    SubsamplerOutOfRange { value: u64, max: u64 },

    #[error("Protocol error on '{name}': {reason}")]
    Protocol { name: String, reason: String },

    #[error("Bridge error on '{name}': {source}")]
    Bridge {
        name: String,
        #[source]
        source: BridgeError,
    },

    #[error("Parse error: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, ScopeError>;
