//! Analyzer driver state machine

use super::trigger::TriggerCondition;
use super::types::{CaptureRequest, CaptureState, UploadedTrace};
use crate::bridge::Transport;
use crate::client::RemoteClient;
use crate::config::WaitPolicy;
use crate::map::{AddressMap, AddressMapEntry, MAX_SIGNAL_WIDTH, SignalLayout};
use crate::{Result, ScopeError};
use tracing::{debug, info, warn};

/// Register prefix of the analyzer core in the published map
pub const DEFAULT_PREFIX: &str = "analyzer";

/// Status register: capture window complete
pub const STATUS_DONE: u32 = 0b01;
/// Status register: trigger event seen and pointer latched
pub const STATUS_TRIGGERED: u32 = 0b10;

/// Resolved control/status registers of one analyzer core
#[derive(Debug, Clone)]
pub struct AnalyzerRegisters {
    pub prefix: String,
    /// Group select; absent on single-group cores
    pub mux: Option<AddressMapEntry>,
    pub subsampler: AddressMapEntry,
    pub trigger_mask: AddressMapEntry,
    pub trigger_value: AddressMapEntry,
    pub offset: AddressMapEntry,
    pub length: AddressMapEntry,
    pub enable: AddressMapEntry,
    pub status: AddressMapEntry,
    pub pointer: AddressMapEntry,
    pub mem: AddressMapEntry,
}

impl AnalyzerRegisters {
    /// Resolve every `<prefix>_*` name up front
    pub fn resolve(map: &AddressMap, prefix: &str) -> Result<Self> {
        let register = |suffix: &str| map.register(&format!("{}_{}", prefix, suffix)).cloned();
        let mux_name = format!("{}_mux_value", prefix);
        Ok(Self {
            prefix: prefix.to_string(),
            mux: map.contains(&mux_name).then(|| map.register(&mux_name).cloned()).transpose()?,
            subsampler: register("subsampler_value")?,
            trigger_mask: register("trigger_mask")?,
            trigger_value: register("trigger_value")?,
            offset: register("storage_offset")?,
            length: register("storage_length")?,
            enable: register("storage_enable")?,
            status: register("storage_status")?,
            pointer: register("storage_pointer")?,
            mem: map.memory(&format!("{}_storage_mem", prefix))?.clone(),
        })
    }
}

/// Capture controller bound to one session
///
/// Holds the session exclusively for its lifetime: the device-side capture
/// buffer supports a single run at a time.
pub struct Analyzer<'c, T: Transport> {
    client: &'c mut RemoteClient<T>,
    regs: AnalyzerRegisters,
    layout: SignalLayout,
    /// No signal rows in the map; the layout is the bare capture word
    raw: bool,
    group: usize,
    depth: usize,
    samplerate: Option<f64>,
    subsample: u64,
    request: Option<CaptureRequest>,
    state: CaptureState,
    policy: WaitPolicy,
}

impl<'c, T: Transport> Analyzer<'c, T> {
    pub fn new(client: &'c mut RemoteClient<T>, prefix: &str) -> Result<Self> {
        let map = client.map();
        let regs = AnalyzerRegisters::resolve(map, prefix)?;
        let depth = regs.mem.count;
        let malformed = |reason: String| ScopeError::MalformedMap { line: 0, reason };

        if let Some(configured) = map.analyzer().depth {
            if configured != depth {
                return Err(malformed(format!(
                    "analyzer depth {} does not match {} with {} elements",
                    configured, regs.mem.name, depth
                )));
            }
        }

        let raw = map.layout().is_empty();
        let layout = if raw {
            raw_layout(regs.mem.width)
        } else {
            map.layout().clone()
        };
        let words = layout.words_per_sample();
        if words != regs.mem.words() || words > regs.trigger_mask.words() || words > regs.trigger_value.words() {
            return Err(malformed(format!(
                "{}-bit capture words do not fit {} ({} bits) and the trigger registers",
                layout.data_width(),
                regs.mem.name,
                regs.mem.width
            )));
        }

        let samplerate = map.analyzer().samplerate;
        debug!("Analyzer '{}': depth {}, {} signals", prefix, depth, layout.len());

        Ok(Self {
            client,
            regs,
            layout,
            raw,
            group: 0,
            depth,
            samplerate,
            subsample: 1,
            request: None,
            state: CaptureState::Idle,
            policy: WaitPolicy::default(),
        })
    }

    /// Default completion wait policy for [`Analyzer::wait_done`]
    pub fn with_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Capture buffer depth D
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn registers(&self) -> &AnalyzerRegisters {
        &self.regs
    }

    /// Signals of the selected group
    pub fn layout(&self) -> SignalLayout {
        if self.raw {
            self.layout.clone()
        } else {
            self.layout.group(self.group)
        }
    }

    pub fn request(&self) -> Option<&CaptureRequest> {
        self.request.as_ref()
    }

    /// Select the mux group whose signals are captured
    pub fn configure_group(&mut self, group: usize) -> Result<()> {
        self.expect_configurable("configure_group")?;
        if !self.raw && !self.layout.groups().contains(&group) {
            return Err(ScopeError::UnknownName {
                kind: "signal group",
                name: group.to_string(),
            });
        }
        match self.regs.mux.clone() {
            Some(mux) => self.guard(|a| a.client.write_entry(&mux, group as u64))?,
            None if group == 0 => {}
            None => {
                return Err(ScopeError::UnknownName {
                    kind: "register",
                    name: format!("{}_mux_value", self.regs.prefix),
                });
            }
        }
        self.group = group;
        self.state = CaptureState::Configured;
        debug!("Analyzer group {} selected", group);
        Ok(())
    }

    /// Keep 1 of every `n` samples
    pub fn configure_subsampler(&mut self, n: u64) -> Result<()> {
        self.expect_configurable("configure_subsampler")?;
        let width = self.regs.subsampler.width.min(64);
        let max = if width >= 64 { u64::MAX } else { 1u64 << width };
        if n == 0 || n > max {
            return Err(ScopeError::SubsamplerOutOfRange { value: n, max });
        }
        let subsampler = self.regs.subsampler.clone();
        self.guard(|a| a.client.write_entry(&subsampler, n - 1))?;
        self.subsample = n;
        self.state = CaptureState::Configured;
        debug!("Subsampler set to 1/{}", n);
        Ok(())
    }

    /// Program the trigger mask/value pair; an empty condition free-runs
    pub fn configure_trigger(&mut self, condition: &TriggerCondition) -> Result<()> {
        self.expect_configurable("configure_trigger")?;
        let (mask, value) = condition.compile(&self.layout())?;
        let (mask_reg, value_reg) = (self.regs.trigger_mask.clone(), self.regs.trigger_value.clone());
        self.guard(|a| {
            a.client.write_entry_words(&mask_reg, &mask)?;
            a.client.write_entry_words(&value_reg, &value)
        })?;
        self.state = CaptureState::Configured;
        debug!("Trigger set to {}", condition);
        Ok(())
    }

    /// Arm a capture of `length` samples, `offset` of them before the trigger
    pub fn run(&mut self, offset: usize, length: usize) -> Result<()> {
        if self.state != CaptureState::Configured {
            return Err(self.invalid_state("run"));
        }
        let request = CaptureRequest::new(offset, length).with_subsample(self.subsample);
        self.guard(|a| request.validate(a.depth))?;

        let regs = self.regs.clone();
        self.guard(|a| {
            a.client.write_entry(&regs.offset, offset as u64)?;
            a.client.write_entry(&regs.length, length as u64)?;
            a.client.write_entry(&regs.enable, 1)
        })?;
        self.request = Some(request);
        self.state = CaptureState::Armed;
        info!("Analyzer armed: offset={}, length={}, subsample={}", offset, length, self.subsample);
        Ok(())
    }

    /// Wait for completion using the analyzer's default policy
    pub fn wait_done(&mut self) -> Result<()> {
        let policy = self.policy;
        self.wait_done_with(&policy)
    }

    /// Poll the status register until the done bit is set or `policy` times out
    pub fn wait_done_with(&mut self, policy: &WaitPolicy) -> Result<()> {
        if !matches!(
            self.state,
            CaptureState::Armed | CaptureState::Waiting | CaptureState::Triggered
        ) {
            return Err(self.invalid_state("wait_done"));
        }
        if self.state == CaptureState::Armed {
            self.state = CaptureState::Waiting;
        }

        let status = self.regs.status.clone();
        let mut triggered = self.state == CaptureState::Triggered;
        let outcome = self.client.poll_entry(&status, policy, |value| {
            if !triggered && value & STATUS_TRIGGERED as u64 != 0 {
                triggered = true;
                debug!("Trigger seen");
            }
            value & STATUS_DONE as u64 != 0
        });
        if triggered {
            self.state = CaptureState::Triggered;
        }

        match outcome {
            Ok(Some(_)) => {
                self.state = CaptureState::Uploading;
                info!("Capture done");
                Ok(())
            }
            Ok(None) => {
                let last = self.state;
                self.state = CaptureState::Error;
                warn!("Capture not done after {:?} (state {})", policy.timeout, last);
                Err(ScopeError::CaptureTimeout {
                    timeout: policy.timeout,
                    state: last.to_string(),
                })
            }
            Err(e) => {
                self.state = CaptureState::Error;
                Err(e)
            }
        }
    }

    /// Read the captured window, oldest sample first
    pub fn upload(&mut self) -> Result<UploadedTrace> {
        let request = match (self.state, self.request) {
            (CaptureState::Uploading, Some(request)) => request,
            _ => return Err(self.invalid_state("upload")),
        };
        let depth = self.depth;
        let regs = self.regs.clone();

        let words = self.guard(|a| {
            let pointer = a.client.read_entry(&regs.pointer)? as usize;
            if pointer >= depth {
                return Err(ScopeError::Protocol {
                    name: regs.pointer.name.clone(),
                    reason: format!("trigger pointer {} outside a {}-sample buffer", pointer, depth),
                });
            }
            let start = request.start_index(pointer, depth);
            debug!("Uploading {} samples from index {} (pointer {})", request.length, start, pointer);

            let first = request.length.min(depth - start);
            let mut words = a.client.read_elements(&regs.mem, start, first)?;
            if first < request.length {
                words.extend(a.client.read_elements(&regs.mem, 0, request.length - first)?);
            }
            Ok(words)
        })?;

        let trace = UploadedTrace::new(words, self.layout())?
            .with_trigger_index(request.offset)
            .with_subsample(self.subsample)
            .with_samplerate(self.samplerate);
        self.state = CaptureState::Done;
        info!("Uploaded {}", trace);
        Ok(trace)
    }

    /// Disarm the core and return to CONFIGURED so the run can be retried
    pub fn abort(&mut self) -> Result<()> {
        let enable = self.regs.enable.clone();
        self.guard(|a| a.client.write_entry(&enable, 0))?;
        self.request = None;
        self.state = CaptureState::Configured;
        info!("Analyzer disarmed");
        Ok(())
    }

    fn expect_configurable(&self, operation: &'static str) -> Result<()> {
        match self.state {
            CaptureState::Idle | CaptureState::Configured | CaptureState::Done | CaptureState::Error => Ok(()),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ScopeError {
        ScopeError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    /// Run device I/O, moving to ERROR if it fails
    fn guard<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let result = op(self);
        if let Err(e) = &result {
            warn!("Analyzer fault in state {}: {}", self.state, e);
            self.state = CaptureState::Error;
        }
        result
    }
}

/// The capture word as one `data` signal, or `data_<n>` slices of 128 bits when wider
fn raw_layout(width: u32) -> SignalLayout {
    if width <= MAX_SIGNAL_WIDTH {
        return SignalLayout::packed(width, &[("data", width)]);
    }
    let slices: Vec<(String, u32)> = (0..width)
        .step_by(MAX_SIGNAL_WIDTH as usize)
        .enumerate()
        .map(|(i, lo)| (format!("data_{}", i), (width - lo).min(MAX_SIGNAL_WIDTH)))
        .collect();
    SignalLayout::packed(width, &slices)
}
