//! Capture request, state, and uploaded trace types

use crate::map::SignalLayout;
use crate::{Result, ScopeError};
use std::fmt;
use std::sync::Arc;

/// Capture controller state
///
/// `Idle → Configured → Armed → Waiting → Triggered → Uploading → Done`, with
/// `Error` reachable from any state when a device or protocol fault is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Configured,
    Armed,
    Waiting,
    Triggered,
    Uploading,
    Done,
    Error,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "IDLE",
            CaptureState::Configured => "CONFIGURED",
            CaptureState::Armed => "ARMED",
            CaptureState::Waiting => "WAITING",
            CaptureState::Triggered => "TRIGGERED",
            CaptureState::Uploading => "UPLOADING",
            CaptureState::Done => "DONE",
            CaptureState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One capture window request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Keep 1 of every `subsample` samples
    pub subsample: u64,
    /// Samples before the trigger event to include
    pub offset: usize,
    /// Total samples to retrieve
    pub length: usize,
}

impl CaptureRequest {
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            subsample: 1,
            offset,
            length,
        }
    }

    pub fn with_subsample(mut self, subsample: u64) -> Self {
        self.subsample = subsample;
        self
    }

    /// Check `0 <= offset <= length <= depth` (and a non-empty window)
    pub fn validate(&self, depth: usize) -> Result<()> {
        if self.length == 0 || self.offset > self.length || self.length > depth {
            return Err(ScopeError::InvalidWindow {
                offset: self.offset,
                length: self.length,
                depth,
            });
        }
        Ok(())
    }

    /// Buffer index of the first uploaded sample given the latched trigger pointer
    #[inline]
    pub fn start_index(&self, trigger_pointer: usize, depth: usize) -> usize {
        (trigger_pointer % depth + depth - self.offset % depth) % depth
    }
}

/// Raw capture words as uploaded, plus everything needed to decode them
///
/// Sample `i` occupies `words[i * words_per_sample..(i + 1) * words_per_sample]`,
/// least-significant bus word first. The word buffer is shared via `Arc` so
/// clones are cheap; the trace is immutable once built.
#[derive(Clone, Debug)]
pub struct UploadedTrace {
    words: Arc<[u32]>,
    words_per_sample: usize,
    layout: SignalLayout,
    trigger_index: usize,
    subsample: u64,
    samplerate: Option<f64>,
}

impl UploadedTrace {
    /// Wrap raw words; their count must be a multiple of the layout's words per sample
    pub fn new(words: Vec<u32>, layout: SignalLayout) -> Result<Self> {
        let words_per_sample = layout.words_per_sample();
        if words.len() % words_per_sample != 0 {
            return Err(ScopeError::ParseError(format!(
                "{} capture words do not split into {}-word samples",
                words.len(),
                words_per_sample
            )));
        }
        Ok(Self {
            words: Arc::from(words),
            words_per_sample,
            layout,
            trigger_index: 0,
            subsample: 1,
            samplerate: None,
        })
    }

    /// Build a trace from per-sample word vectors
    pub fn from_samples(samples: &[Vec<u32>], layout: SignalLayout) -> Result<Self> {
        let wps = layout.words_per_sample();
        let mut words = Vec::with_capacity(samples.len() * wps);
        for (i, sample) in samples.iter().enumerate() {
            if sample.len() != wps {
                return Err(ScopeError::ParseError(format!(
                    "sample {} has {} words, layout needs {}",
                    i,
                    sample.len(),
                    wps
                )));
            }
            words.extend_from_slice(sample);
        }
        Self::new(words, layout)
    }

    /// Index of the trigger sample within the trace (the pretrigger offset)
    pub fn with_trigger_index(mut self, index: usize) -> Self {
        self.trigger_index = index;
        self
    }

    pub fn with_subsample(mut self, subsample: u64) -> Self {
        self.subsample = subsample.max(1);
        self
    }

    /// Analyzer sample clock in Hz, before subsampling
    pub fn with_samplerate(mut self, samplerate: Option<f64>) -> Self {
        self.samplerate = samplerate;
        self
    }

    /// Number of samples
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len() / self.words_per_sample
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Words of sample `index`
    #[inline]
    pub fn sample(&self, index: usize) -> &[u32] {
        let start = index * self.words_per_sample;
        &self.words[start..start + self.words_per_sample]
    }

    pub fn samples(&self) -> impl Iterator<Item = &[u32]> {
        self.words.chunks_exact(self.words_per_sample)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn words_per_sample(&self) -> usize {
        self.words_per_sample
    }

    pub fn layout(&self) -> &SignalLayout {
        &self.layout
    }

    pub fn trigger_index(&self) -> usize {
        self.trigger_index
    }

    pub fn subsample(&self) -> u64 {
        self.subsample
    }

    pub fn samplerate(&self) -> Option<f64> {
        self.samplerate
    }

    /// Time between consecutive trace samples in picoseconds, if the sample clock is known
    pub fn sample_period_ps(&self) -> Option<u64> {
        self.samplerate
            .map(|rate| (1e12 * self.subsample as f64 / rate).round() as u64)
            .filter(|&ps| ps > 0)
    }
}

impl fmt::Display for UploadedTrace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "UploadedTrace[samples={}, words/sample={}, trigger={}, subsample={}]",
            self.len(),
            self.words_per_sample,
            self.trigger_index,
            self.subsample
        )
    }
}
