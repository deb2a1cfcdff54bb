//! Capture word slicing into per-signal series

use super::bits;
use super::{DecodedSignal, DecodedTrace};
use crate::capture::UploadedTrace;
use crate::map::SignalLayout;
use crate::{Result, ScopeError};

/// Split every sample of `trace` into per-signal series, in layout order.
///
/// Pure: the same trace and layout always give the same result.
pub fn decode(trace: &UploadedTrace, layout: &SignalLayout) -> DecodedTrace {
    let mut signals: Vec<DecodedSignal> = layout
        .signals()
        .iter()
        .map(|spec| DecodedSignal {
            name: spec.name.clone(),
            width: spec.width,
            values: Vec::with_capacity(trace.len()),
        })
        .collect();

    for sample in trace.samples() {
        for (signal, spec) in signals.iter_mut().zip(layout.signals()) {
            signal.values.push(bits::extract(sample, spec.offset, spec.width));
        }
    }

    DecodedTrace {
        signals,
        trigger_index: trace.trigger_index(),
        sample_period_ps: trace.sample_period_ps(),
    }
}

/// Pack one value per layout signal (in layout order) into capture words
pub fn encode_sample(layout: &SignalLayout, values: &[u128]) -> Result<Vec<u32>> {
    if values.len() != layout.len() {
        return Err(ScopeError::ParseError(format!(
            "{} values for a layout of {} signals",
            values.len(),
            layout.len()
        )));
    }
    let mut words = vec![0u32; layout.words_per_sample()];
    for (spec, &value) in layout.signals().iter().zip(values) {
        if value > spec.max_value() {
            return Err(ScopeError::WidthOverflow {
                name: spec.name.clone(),
                width: 128 - value.leading_zeros(),
                limit: spec.width,
            });
        }
        bits::insert(&mut words, spec.offset, spec.width, value);
    }
    Ok(words)
}
