//! Trigger conditions
//!
//! A condition is an equality constraint over named signals. It is compiled
//! against the active signal layout into a mask/value pair of capture-word
//! width: the analyzer fires on the first sample where
//! `sample & mask == value & mask`. An empty condition compiles to an all-zero
//! mask, which matches every sample (free-running trigger).

use crate::map::SignalLayout;
use crate::trace::bits;
use crate::{Result, ScopeError};
use std::fmt;

/// Required value of one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerValue {
    /// Every bit of the signal must match
    Equals(u128),
    /// The signal does not take part in the match
    DontCare,
    /// Only bits set in `mask` must match `value`
    Pattern { value: u128, mask: u128 },
}

impl TriggerValue {
    /// Parse `42`, `0x2a`, `0b10x1` (x = don't-care bit, MSB first) or `x`
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("x") || text == "-" {
            return Ok(TriggerValue::DontCare);
        }
        if let Some(bits) = text.strip_prefix("0b") {
            if bits.is_empty() || bits.len() > 128 {
                return Err(format!("bad binary pattern '{}'", text));
            }
            let mut value = 0u128;
            let mut mask = 0u128;
            for c in bits.chars() {
                value <<= 1;
                mask <<= 1;
                match c {
                    '0' => mask |= 1,
                    '1' => {
                        mask |= 1;
                        value |= 1;
                    }
                    'x' | 'X' | '-' => {}
                    _ => return Err(format!("bad digit '{}' in pattern '{}'", c, text)),
                }
            }
            let all = if bits.len() == 128 {
                u128::MAX
            } else {
                (1u128 << bits.len()) - 1
            };
            return Ok(if mask == all {
                TriggerValue::Equals(value)
            } else {
                TriggerValue::Pattern { value, mask }
            });
        }
        let parsed = match text.strip_prefix("0x") {
            Some(hex) => u128::from_str_radix(hex, 16),
            None => text.parse(),
        };
        parsed
            .map(TriggerValue::Equals)
            .map_err(|_| format!("bad trigger value '{}'", text))
    }

    /// Mask and value bits for a signal of `width` bits
    fn compile(&self, width: u32) -> std::result::Result<(u128, u128), String> {
        let all = if width >= 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        };
        match *self {
            TriggerValue::DontCare => Ok((0, 0)),
            TriggerValue::Equals(value) => {
                if value & !all != 0 {
                    return Err(format!("value 0x{:x} does not fit in {} bits", value, width));
                }
                Ok((all, value))
            }
            TriggerValue::Pattern { value, mask } => {
                if (mask | value) & !all != 0 {
                    return Err(format!("pattern wider than {} bits", width));
                }
                Ok((mask, value & mask))
            }
        }
    }
}

impl fmt::Display for TriggerValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TriggerValue::Equals(v) => write!(f, "0x{:x}", v),
            TriggerValue::DontCare => write!(f, "x"),
            TriggerValue::Pattern { value, mask } => write!(f, "0x{:x}/0x{:x}", value, mask),
        }
    }
}

/// Ordered signal → value constraints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerCondition {
    terms: Vec<(String, TriggerValue)>,
}

impl TriggerCondition {
    /// Empty condition: free-running trigger
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `signal == value`
    pub fn with(self, signal: impl Into<String>, value: u128) -> Self {
        self.with_value(signal, TriggerValue::Equals(value))
    }

    pub fn with_value(mut self, signal: impl Into<String>, value: TriggerValue) -> Self {
        self.insert(signal, value);
        self
    }

    /// Set the constraint on `signal`, replacing any previous one
    pub fn insert(&mut self, signal: impl Into<String>, value: TriggerValue) {
        let signal = signal.into();
        match self.terms.iter_mut().find(|(name, _)| *name == signal) {
            Some(term) => term.1 = value,
            None => self.terms.push((signal, value)),
        }
    }

    /// Parse `name=value[,name=value...]`; values as in [`TriggerValue::parse`]
    pub fn parse(text: &str) -> Result<Self> {
        let mut condition = Self::new();
        for term in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, value) = term.split_once('=').ok_or_else(|| ScopeError::InvalidTrigger {
                signal: term.to_string(),
                reason: "expected name=value".to_string(),
            })?;
            let value = TriggerValue::parse(value).map_err(|reason| ScopeError::InvalidTrigger {
                signal: name.trim().to_string(),
                reason,
            })?;
            condition.insert(name.trim(), value);
        }
        Ok(condition)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TriggerValue)> {
        self.terms.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Compile into `(mask, value)` capture words, least-significant word first.
    ///
    /// Every term is resolved before anything is returned, so an unknown name or
    /// an oversized value never leaves a half-built trigger behind.
    pub fn compile(&self, layout: &SignalLayout) -> Result<(Vec<u32>, Vec<u32>)> {
        let words = layout.words_per_sample();
        let mut mask = vec![0u32; words];
        let mut value = vec![0u32; words];

        for (name, term) in &self.terms {
            let spec = layout.find(name).ok_or_else(|| ScopeError::UnknownName {
                kind: "signal",
                name: name.clone(),
            })?;
            let (m, v) = term.compile(spec.width).map_err(|reason| ScopeError::InvalidTrigger {
                signal: name.clone(),
                reason,
            })?;
            bits::insert(&mut mask, spec.offset, spec.width, m);
            bits::insert(&mut value, spec.offset, spec.width, v);
        }
        Ok((mask, value))
    }

    /// Whether `sample` satisfies the compiled condition
    pub fn matches(mask: &[u32], value: &[u32], sample: &[u32]) -> bool {
        mask.iter()
            .zip(value)
            .zip(sample)
            .all(|((m, v), s)| s & m == v & m)
    }
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "{{}}");
        }
        let terms: Vec<String> = self
            .terms
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "{{{}}}", terms.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> SignalLayout {
        let mut layout = SignalLayout::packed(40, &[("idle", 1), ("polling", 1), ("fsm", 4)]);
        layout
            .push(crate::map::SignalSpec::new("data", 8, 30, 0))
            .unwrap();
        layout
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(TriggerValue::parse("1").unwrap(), TriggerValue::Equals(1));
        assert_eq!(TriggerValue::parse("0x1f").unwrap(), TriggerValue::Equals(0x1f));
        assert_eq!(TriggerValue::parse("x").unwrap(), TriggerValue::DontCare);
        assert_eq!(TriggerValue::parse("0b101").unwrap(), TriggerValue::Equals(5));
        assert_eq!(
            TriggerValue::parse("0b1x0").unwrap(),
            TriggerValue::Pattern { value: 0b100, mask: 0b101 }
        );
        assert!(TriggerValue::parse("0b102").is_err());
        assert!(TriggerValue::parse("0b").is_err());
        assert!(TriggerValue::parse("high").is_err());
    }

    #[test]
    fn test_empty_condition_is_free_running() {
        let (mask, value) = TriggerCondition::new().compile(&layout()).unwrap();
        assert_eq!(mask, vec![0, 0]);
        assert_eq!(value, vec![0, 0]);
        assert!(TriggerCondition::matches(&mask, &value, &[0xdead_beef, 0xff]));
    }

    #[test]
    fn test_compile_single_bit() {
        let (mask, value) = TriggerCondition::new().with("polling", 1).compile(&layout()).unwrap();
        assert_eq!(mask, vec![0b10, 0]);
        assert_eq!(value, vec![0b10, 0]);
        assert!(TriggerCondition::matches(&mask, &value, &[0b11, 0]));
        assert!(!TriggerCondition::matches(&mask, &value, &[0b01, 0]));
    }

    #[test]
    fn test_compile_spanning_word_boundary() {
        let (mask, value) = TriggerCondition::new().with("data", 0xa5).compile(&layout()).unwrap();
        // bits 30..38: low two bits in word 0, upper six in word 1
        assert_eq!(mask, vec![0xc000_0000, 0x3f]);
        assert_eq!(value, vec![0x4000_0000, 0x29]);
    }

    #[test]
    fn test_unknown_signal_fails_whole_condition() {
        let condition = TriggerCondition::new().with("polling", 1).with("bogus", 0);
        assert!(matches!(
            condition.compile(&layout()),
            Err(ScopeError::UnknownName { kind: "signal", .. })
        ));
    }

    #[test]
    fn test_value_too_wide() {
        let condition = TriggerCondition::new().with("fsm", 0x10);
        assert!(matches!(
            condition.compile(&layout()),
            Err(ScopeError::InvalidTrigger { .. })
        ));
    }

    #[test]
    fn test_parse_condition_and_replace() {
        let condition = TriggerCondition::parse("polling=1, fsm=0b1x1x, polling=0").unwrap();
        let terms: Vec<_> = condition.iter().collect();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0], ("polling", &TriggerValue::Equals(0)));
        assert_eq!(condition.to_string(), "{polling=0x0, fsm=0xa/0xa}");
        assert!(TriggerCondition::parse("polling").is_err());
    }
}
