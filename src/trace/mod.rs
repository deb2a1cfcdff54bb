//! Trace decoding and waveform dumps
//!
//! [`decode`] turns an [`UploadedTrace`](crate::UploadedTrace) into one value
//! series per signal; [`save`] writes those series as a VCD, CSV, or DSLogic
//! capture archive.

pub mod bits;
mod csv;
mod decode;
mod dsl;
mod vcd;

pub use decode::{decode, encode_sample};
pub use dsl::{DslCapture, DslHeader};

use crate::Result;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Value series of one signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSignal {
    pub name: String,
    pub width: u32,
    pub values: Vec<u128>,
}

/// Named series for every signal of a layout, all of the same length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTrace {
    pub signals: Vec<DecodedSignal>,
    /// Sample index of the trigger event
    pub trigger_index: usize,
    /// Time between samples, when the sample clock is known
    pub sample_period_ps: Option<u64>,
}

impl DecodedTrace {
    /// Number of samples per series
    pub fn len(&self) -> usize {
        self.signals.first().map_or(0, |s| s.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Timestamp of sample `index` in the dump's time unit
    pub(crate) fn timestamp(&self, index: usize) -> u64 {
        index as u64 * self.sample_period_ps.unwrap_or(1)
    }
}

/// Output format of [`save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformFormat {
    /// Value change dump
    Vcd,
    /// One row per sample
    Csv,
    /// DSLogic capture archive
    Dsl,
}

impl WaveformFormat {
    /// Guess the format from a file extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "vcd" => Some(WaveformFormat::Vcd),
            "csv" => Some(WaveformFormat::Csv),
            "dsl" => Some(WaveformFormat::Dsl),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            WaveformFormat::Vcd => "vcd",
            WaveformFormat::Csv => "csv",
            WaveformFormat::Dsl => "dsl",
        }
    }
}

impl fmt::Display for WaveformFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Write `decoded` to `path`
pub fn save<P: AsRef<Path>>(decoded: &DecodedTrace, path: P, format: WaveformFormat) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    match format {
        WaveformFormat::Vcd => {
            let mut out = BufWriter::new(file);
            vcd::write(decoded, &mut out)?;
            out.flush()?;
        }
        WaveformFormat::Csv => {
            let mut out = BufWriter::new(file);
            csv::write(decoded, &mut out)?;
            out.flush()?;
        }
        WaveformFormat::Dsl => dsl::write(decoded, file)?,
    }
    info!(
        "Wrote {} samples of {} signals to {} ({})",
        decoded.len(),
        decoded.signals.len(),
        path.display(),
        format
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace() -> DecodedTrace {
        DecodedTrace {
            signals: vec![
                DecodedSignal {
                    name: "polling".to_string(),
                    width: 1,
                    values: vec![0, 0, 1, 1],
                },
                DecodedSignal {
                    name: "fsm".to_string(),
                    width: 4,
                    values: vec![0, 3, 3, 9],
                },
            ],
            trigger_index: 2,
            sample_period_ps: Some(8000),
        }
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(WaveformFormat::from_path("a/analyzer.vcd"), Some(WaveformFormat::Vcd));
        assert_eq!(WaveformFormat::from_path("x.CSV"), Some(WaveformFormat::Csv));
        assert_eq!(WaveformFormat::from_path("scan.dsl"), Some(WaveformFormat::Dsl));
        assert_eq!(WaveformFormat::from_path("trace.bin"), None);
        assert_eq!(WaveformFormat::from_path("noext"), None);
    }

    #[test]
    fn test_save_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let trace = sample_trace();
        for format in [WaveformFormat::Vcd, WaveformFormat::Csv, WaveformFormat::Dsl] {
            let path = dir.path().join(format!("analyzer.{}", format.extension()));
            save(&trace, &path, format).unwrap();
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
        }
    }

    #[test]
    fn test_save_reports_io_error() {
        let trace = sample_trace();
        let result = save(&trace, "/nonexistent-dir/analyzer.vcd", WaveformFormat::Vcd);
        assert!(matches!(result, Err(crate::ScopeError::Io(_))));
    }

    #[test]
    fn test_trace_accessors() {
        let trace = sample_trace();
        assert_eq!(trace.len(), 4);
        assert_eq!(trace.signal("fsm").unwrap().values[3], 9);
        assert!(trace.signal("nope").is_none());
        assert_eq!(trace.timestamp(3), 24_000);
    }
}
