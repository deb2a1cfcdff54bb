//! Signal layout of analyzer capture words

use std::fmt;

/// Widest signal a layout may carry; decoded values are held in a `u128`
pub const MAX_SIGNAL_WIDTH: u32 = 128;

/// One probed signal inside a capture word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
    pub name: String,
    /// Width in bits (1-128)
    pub width: u32,
    /// Bit offset of the LSB inside the capture word
    pub offset: u32,
    /// Mux group the signal belongs to
    pub group: usize,
}

impl SignalSpec {
    pub fn new(name: impl Into<String>, width: u32, offset: u32, group: usize) -> Self {
        Self {
            name: name.into(),
            width,
            offset,
            group,
        }
    }

    /// One past the MSB
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.width as u64
    }

    /// Largest value the signal can hold
    #[inline]
    pub fn max_value(&self) -> u128 {
        if self.width >= 128 {
            u128::MAX
        } else {
            (1u128 << self.width) - 1
        }
    }
}

impl fmt::Display for SignalSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.width == 1 {
            write!(f, "{}[{}]", self.name, self.offset)
        } else {
            write!(f, "{}[{}:{}]", self.name, self.end() - 1, self.offset)
        }
    }
}

/// Ordered description of how signals are packed into capture words
///
/// Signals keep their declared order; that order is also the order of the
/// decoded series and of the waveform dump. A layout may hold several mux
/// groups; [`SignalLayout::group`] narrows it to the signals captured together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalLayout {
    signals: Vec<SignalSpec>,
    data_width: u32,
}

impl SignalLayout {
    /// Empty layout for capture words of `data_width` bits
    pub fn new(data_width: u32) -> Self {
        Self {
            signals: Vec::new(),
            data_width,
        }
    }

    /// Build a single-group layout by packing `(name, width)` pairs from bit 0 upwards
    pub fn packed<S: AsRef<str>>(data_width: u32, signals: &[(S, u32)]) -> Self {
        let mut offset = 0;
        let signals = signals
            .iter()
            .map(|(name, width)| {
                let spec = SignalSpec::new(name.as_ref(), *width, offset, 0);
                offset += width;
                spec
            })
            .collect();
        Self {
            signals,
            data_width,
        }
    }

    /// Append a signal, checking it against the word width and its group
    pub fn push(&mut self, spec: SignalSpec) -> Result<(), String> {
        if spec.width == 0 || spec.width > MAX_SIGNAL_WIDTH {
            return Err(format!(
                "signal '{}' width {} not in 1..={}",
                spec.name, spec.width, MAX_SIGNAL_WIDTH
            ));
        }
        if spec.end() > self.data_width as u64 {
            return Err(format!(
                "signal {} exceeds the {}-bit capture word",
                spec, self.data_width
            ));
        }
        for other in self.signals.iter().filter(|s| s.group == spec.group) {
            if other.name == spec.name {
                return Err(format!(
                    "duplicate signal '{}' in group {}",
                    spec.name, spec.group
                ));
            }
            if (spec.offset as u64) < other.end() && (other.offset as u64) < spec.end() {
                return Err(format!("signal {} overlaps {}", spec, other));
            }
        }
        self.signals.push(spec);
        Ok(())
    }

    pub fn signals(&self) -> &[SignalSpec] {
        &self.signals
    }

    pub fn data_width(&self) -> u32 {
        self.data_width
    }

    /// Number of 32-bit bus words per capture sample
    pub fn words_per_sample(&self) -> usize {
        self.data_width.div_ceil(32).max(1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Sum of member widths
    pub fn total_width(&self) -> u32 {
        self.signals.iter().map(|s| s.width).sum()
    }

    pub fn find(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Group numbers in first-declared order
    pub fn groups(&self) -> Vec<usize> {
        let mut groups = Vec::new();
        for s in &self.signals {
            if !groups.contains(&s.group) {
                groups.push(s.group);
            }
        }
        groups
    }

    /// Layout restricted to one mux group
    pub fn group(&self, group: usize) -> SignalLayout {
        SignalLayout {
            signals: self
                .signals
                .iter()
                .filter(|s| s.group == group)
                .cloned()
                .collect(),
            data_width: self.data_width,
        }
    }
}
