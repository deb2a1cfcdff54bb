//! In-memory simulated device
//!
//! [`SimDevice`] answers bus requests from a sparse word store and, when given
//! a [`SimAnalyzer`], models the logic analyzer core: writing 1 to the storage
//! enable register runs a capture over a caller-supplied sample stream
//! (subsampling, trigger match after the pre-trigger fill, circular buffer,
//! latched trigger pointer) and the status register reports triggered/done.
//!
//! Every request is logged, so tests can check exactly which registers were
//! touched. The shared state is reachable through a [`SimHandle`] after the
//! device has been moved into a client.

use super::errors::{BridgeError, BridgeResult};
use super::watchdog::{OperationGuard, Watchdog, WatchdogHandle};
use super::{Request, Response, Transport};
use crate::capture::{AnalyzerRegisters, STATUS_DONE, STATUS_TRIGGERED, TriggerCondition};
use crate::map::{AddressMap, AddressMapEntry};
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// Analyzer core model
#[derive(Debug, Clone)]
pub struct SimAnalyzer {
    registers: AnalyzerRegisters,
    stimulus: Vec<Vec<u32>>,
    never_done: bool,
    status_delay: Option<usize>,
    status: u32,
    status_reads: usize,
}

impl SimAnalyzer {
    /// Model the analyzer `prefix` as published in `map`
    pub fn from_map(map: &AddressMap, prefix: &str) -> Result<Self> {
        Ok(Self {
            registers: AnalyzerRegisters::resolve(map, prefix)?,
            stimulus: Vec::new(),
            never_done: false,
            status_delay: None,
            status: 0,
            status_reads: 0,
        })
    }

    /// Sample stream seen by the probes, one entry per analyzer clock
    /// (least-significant word first)
    pub fn with_stimulus(mut self, samples: Vec<Vec<u32>>) -> Self {
        self.stimulus = samples;
        self
    }

    /// Single-word sample stream
    pub fn with_stimulus_words(self, samples: &[u32]) -> Self {
        let samples = samples.iter().map(|&w| vec![w]).collect();
        self.with_stimulus(samples)
    }

    /// Keep the done bit clear forever
    pub fn never_done(mut self) -> Self {
        self.never_done = true;
        self
    }

    /// Report an idle status for `reads` status reads, then triggered-only once,
    /// then the real status
    pub fn with_status_delay(mut self, reads: usize) -> Self {
        self.status_delay = Some(reads);
        self
    }

    fn reset(&mut self) {
        self.status = 0;
        self.status_reads = 0;
    }

    fn next_status(&mut self) -> u32 {
        if self.never_done {
            return self.status & STATUS_TRIGGERED;
        }
        let reads = self.status_reads;
        self.status_reads += 1;
        match self.status_delay {
            Some(delay) if reads < delay => 0,
            Some(delay) if reads == delay => self.status & STATUS_TRIGGERED,
            _ => self.status,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    words: HashMap<u32, u32>,
    log: Vec<Request>,
    responsive: bool,
    analyzer: Option<SimAnalyzer>,
}

impl SimState {
    fn peek(&self, address: u32) -> u32 {
        self.words.get(&address).copied().unwrap_or(0)
    }

    /// Register value, least-significant word first
    fn register(&self, entry: &AddressMapEntry) -> Vec<u32> {
        let mut words: Vec<u32> = (0..entry.words() as u32)
            .map(|i| self.peek(entry.address + 4 * i))
            .collect();
        words.reverse();
        words
    }

    fn register_value(&self, entry: &AddressMapEntry) -> u64 {
        let words = self.register(entry);
        let lo = words.first().copied().unwrap_or(0) as u64;
        let hi = words.get(1).copied().unwrap_or(0) as u64;
        (hi << 32) | lo
    }

    fn store_element(&mut self, mem: &AddressMapEntry, index: usize, sample: &[u32]) {
        let base = mem.element_address(index);
        for (i, word) in sample.iter().take(mem.words()).enumerate() {
            self.words.insert(base + 4 * i as u32, *word);
        }
    }

    fn read(&mut self, address: u32, count: u8) -> Vec<u32> {
        if count == 1 {
            let status = self
                .analyzer
                .as_mut()
                .filter(|a| a.registers.status.address == address);
            if let Some(analyzer) = status {
                return vec![analyzer.next_status()];
            }
        }
        (0..count as u32).map(|i| self.peek(address + 4 * i)).collect()
    }

    fn write(&mut self, address: u32, data: &[u32]) {
        for (i, word) in data.iter().enumerate() {
            self.words.insert(address + 4 * i as u32, *word);
        }
        let enable = self.analyzer.as_ref().map(|a| a.registers.enable.address);
        if enable == Some(address) {
            if data.first().is_some_and(|w| w & 1 == 1) {
                self.run_capture();
            } else if let Some(analyzer) = self.analyzer.as_mut() {
                analyzer.reset();
            }
        }
    }

    fn run_capture(&mut self) {
        let Some(mut analyzer) = self.analyzer.take() else {
            return;
        };
        analyzer.reset();
        let regs = analyzer.registers.clone();

        let keep_every = self.register_value(&regs.subsampler) as usize + 1;
        let offset = self.register_value(&regs.offset) as usize;
        let length = self.register_value(&regs.length) as usize;
        let mask = self.register(&regs.trigger_mask);
        let value = self.register(&regs.trigger_value);
        let depth = regs.mem.count;

        let mut wp = 0usize;
        let mut captured = 0usize;
        let mut remaining = 0usize;
        let mut trigger = None;

        for sample in analyzer.stimulus.iter().step_by(keep_every) {
            self.store_element(&regs.mem, wp, sample);
            if trigger.is_none() && captured >= offset && TriggerCondition::matches(&mask, &value, sample) {
                trigger = Some(wp);
                remaining = length.saturating_sub(offset);
                analyzer.status |= STATUS_TRIGGERED;
                self.words.insert(regs.pointer.address, wp as u32);
            }
            captured += 1;
            wp = (wp + 1) % depth;

            if trigger.is_some() {
                if remaining > 0 {
                    remaining -= 1;
                }
                if remaining == 0 {
                    analyzer.status |= STATUS_DONE;
                    break;
                }
            }
        }

        debug!(
            "Simulated capture: {} samples kept, trigger at {:?}, status 0b{:02b}",
            captured, trigger, analyzer.status
        );
        self.analyzer = Some(analyzer);
    }
}

/// Shared view of a simulated device's state
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<Request> {
        self.lock().log.clone()
    }

    /// Only the writes
    pub fn writes(&self) -> Vec<Request> {
        self.lock().log.iter().filter(|r| r.is_write()).cloned().collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// An unresponsive device lets every request time out
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    pub fn poke(&self, address: u32, word: u32) {
        self.lock().words.insert(address, word);
    }

    pub fn peek(&self, address: u32) -> u32 {
        self.lock().peek(address)
    }
}

/// Simulated device transport
pub struct SimDevice {
    endpoint: String,
    open: bool,
    refuse_open: bool,
    response_timeout: Duration,
    state: Arc<Mutex<SimState>>,
    _watchdog: Watchdog,
    handle: WatchdogHandle,
}

impl SimDevice {
    pub fn new() -> Self {
        let endpoint = "sim".to_string();
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let handle = watchdog.register_link(&endpoint);
        Self {
            endpoint,
            open: false,
            refuse_open: false,
            response_timeout: Duration::from_millis(10),
            state: Arc::new(Mutex::new(SimState {
                responsive: true,
                ..SimState::default()
            })),
            _watchdog: watchdog,
            handle,
        }
    }

    pub fn with_analyzer(self, analyzer: SimAnalyzer) -> Self {
        self.state.lock().unwrap().analyzer = Some(analyzer);
        self
    }

    /// Store `text` one byte per element of `entry`, NUL-terminated when it fits
    pub fn with_identifier(self, entry: &AddressMapEntry, text: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for (i, byte) in text.bytes().chain(std::iter::once(0)).take(entry.count).enumerate() {
                state.words.insert(entry.element_address(i), byte as u32);
            }
        }
        self
    }

    /// Elapsed time reported by timeouts
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Make [`Transport::open`] fail as if the bridge server were down
    pub fn refuse_open(mut self) -> Self {
        self.refuse_open = true;
        self
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimDevice {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&mut self) -> BridgeResult {
        if self.refuse_open {
            return Err(BridgeError::Connection {
                endpoint: self.endpoint.clone(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn request(&mut self, request: &Request) -> BridgeResult<Response> {
        request.validate()?;
        if !self.open {
            return Err(BridgeError::NotOpen);
        }
        let _guard = OperationGuard::new(&self.handle);
        let mut state = self.state.lock().unwrap();
        state.log.push(request.clone());
        trace!("[{}] {:?}", self.endpoint, request);

        if !state.responsive {
            return Err(BridgeError::Timeout {
                address: request.address(),
                elapsed: self.response_timeout,
            });
        }

        match request {
            Request::Read { address, count } => Ok(Response::Read(state.read(*address, *count))),
            Request::Write { address, data } => {
                state.write(*address, data);
                Ok(Response::Written)
            }
        }
    }

    fn idle_for(&self) -> Duration {
        self.handle.idle_for()
    }
}
