//! DSLogic capture archives
//!
//! A `.dsl` file is a zip archive holding a `header` text file and one
//! bit-packed block per probe (`L-<probe>/<block>`, LSB first). DSView opens
//! it directly. Signals wider than one bit are stored as `name[i]` probes and
//! regrouped into buses when a capture is read back.

use super::{DecodedSignal, DecodedTrace};
use crate::{Result, ScopeError};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

/// Sample rate recorded when the trace carries no sample clock (1 sample per ns)
const FALLBACK_SAMPLERATE_HZ: f64 = 1e9;

/// Header information from a DSL file
#[derive(Debug, Clone)]
pub struct DslHeader {
    pub total_probes: usize,
    /// Sample rate as written (e.g. "125 MHz")
    pub samplerate: String,
    pub samplerate_hz: f64,
    pub total_samples: u64,
    pub total_blocks: u64,
    /// Samples in every block but the last
    pub samples_per_block: u64,
    /// Probe names indexed by probe number
    pub probe_names: Vec<String>,
    /// Trigger position, when recorded
    pub trigger_pos: Option<u64>,
}

/// Probe names for the signals of `trace`, one per bit
fn probe_names(trace: &DecodedTrace) -> Vec<(usize, u32, String)> {
    let mut probes = Vec::new();
    for (index, signal) in trace.signals.iter().enumerate() {
        if signal.width == 1 {
            probes.push((index, 0, signal.name.clone()));
        } else {
            for bit in 0..signal.width {
                probes.push((index, bit, format!("{}[{}]", signal.name, bit)));
            }
        }
    }
    probes
}

fn format_sample_rate(hz: f64) -> String {
    let (value, unit) = if hz >= 1e9 {
        (hz / 1e9, "GHz")
    } else if hz >= 1e6 {
        (hz / 1e6, "MHz")
    } else if hz >= 1e3 {
        (hz / 1e3, "KHz")
    } else {
        (hz, "Hz")
    };
    format!("{} {}", value, unit)
}

/// Parse a sample rate string (e.g., "50 MHz") into Hz
fn parse_sample_rate(samplerate: &str) -> Option<f64> {
    let parts: Vec<&str> = samplerate.split_whitespace().collect();
    if parts.len() >= 2
        && let Ok(value) = parts[0].parse::<f64>()
    {
        let multiplier = match parts[1] {
            "GHz" => 1_000_000_000.0,
            "MHz" => 1_000_000.0,
            "KHz" | "kHz" => 1_000.0,
            "Hz" => 1.0,
            _ => return None,
        };
        return Some(value * multiplier);
    }
    None
}

/// Extract a single bit from a byte array at the given bit index
#[inline]
fn get_bit(data: &[u8], bit_index: usize) -> bool {
    let byte_index = bit_index / 8;
    let bit_offset = bit_index % 8;

    if byte_index < data.len() {
        (data[byte_index] >> bit_offset) & 1 == 1
    } else {
        false
    }
}

/// Write `trace` as a single-block DSL archive
pub(super) fn write<W: Write + std::io::Seek>(trace: &DecodedTrace, out: W) -> Result<()> {
    let probes = probe_names(trace);
    let samples = trace.len();
    let samplerate_hz = trace
        .sample_period_ps
        .map(|ps| 1e12 / ps as f64)
        .unwrap_or(FALLBACK_SAMPLERATE_HZ);

    let mut header = String::new();
    header.push_str("[version]\nversion = 2\n\n[header]\n");
    header.push_str("driver = usb3scope\ndevice mode = 0\ncapturefile = data\n");
    header.push_str(&format!("total samples = {}\n", samples));
    header.push_str(&format!("total probes = {}\n", probes.len()));
    header.push_str("total blocks = 1\n");
    header.push_str(&format!("samplerate = {}\n", format_sample_rate(samplerate_hz)));
    header.push_str(&format!("trigger pos = {}\n", trace.trigger_index));
    for (probe, (_, _, name)) in probes.iter().enumerate() {
        header.push_str(&format!("probe{} = {}\n", probe, name));
    }

    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut zip = zip::ZipWriter::new(out);
    zip.start_file("header", options)?;
    zip.write_all(header.as_bytes())?;

    for (probe, (signal, bit, _)) in probes.iter().enumerate() {
        let values = &trace.signals[*signal].values;
        let mut block = vec![0u8; samples.div_ceil(8)];
        for (i, value) in values.iter().enumerate() {
            if (*value >> *bit) & 1 == 1 {
                block[i / 8] |= 1 << (i % 8);
            }
        }
        zip.start_file(format!("L-{}/0", probe), options)?;
        zip.write_all(&block)?;
    }
    zip.finish()?;
    debug!("DSL archive: {} probes, {} samples", probes.len(), samples);
    Ok(())
}

/// Reader for DSL capture files
pub struct DslCapture {
    archive: ZipArchive<File>,
    header: DslHeader,
    blocks: HashMap<(usize, u64), Arc<[u8]>>,
}

impl DslCapture {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;
        let header = Self::parse_header(&mut archive)?;
        Ok(Self {
            archive,
            header,
            blocks: HashMap::new(),
        })
    }

    fn parse_header(archive: &mut ZipArchive<File>) -> Result<DslHeader> {
        let mut header_file = archive
            .by_name("header")
            .map_err(|e| ScopeError::ParseError(format!("Cannot find DSL header: {}", e)))?;

        let mut header_content = String::new();
        header_file.read_to_string(&mut header_content)?;
        drop(header_file);

        let mut total_probes: Option<usize> = None;
        let mut samplerate: Option<String> = None;
        let mut total_samples: Option<u64> = None;
        let mut total_blocks: Option<u64> = None;
        let mut trigger_pos: Option<u64> = None;
        let mut probe_names_map: HashMap<usize, String> = HashMap::new();

        for line in header_content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(value) = line.strip_prefix("total probes = ") {
                total_probes = value.parse().ok();
            } else if let Some(value) = line.strip_prefix("samplerate = ") {
                samplerate = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("total samples = ") {
                total_samples = value.parse().ok();
            } else if let Some(value) = line.strip_prefix("total blocks = ") {
                total_blocks = value.parse().ok();
            } else if let Some(value) = line.strip_prefix("trigger pos = ") {
                trigger_pos = value.parse().ok();
            } else if line.starts_with("probe")
                && let Some((probe_part, name)) = line.split_once(" = ")
                && let Some(num_str) = probe_part.strip_prefix("probe")
                && let Ok(probe_num) = num_str.parse::<usize>()
            {
                probe_names_map.insert(probe_num, name.to_string());
            }
        }

        let missing = |field: &str| ScopeError::ParseError(format!("DSL header has no '{}'", field));
        let total_probes = total_probes.ok_or_else(|| missing("total probes"))?;
        let samplerate = samplerate.ok_or_else(|| missing("samplerate"))?;
        let total_samples = total_samples.ok_or_else(|| missing("total samples"))?;
        let total_blocks = total_blocks.ok_or_else(|| missing("total blocks"))?;

        let samplerate_hz = parse_sample_rate(&samplerate)
            .ok_or_else(|| ScopeError::ParseError(format!("Invalid sample rate: {}", samplerate)))?;

        // Blocks are fixed-size except the last
        let samples_per_block = if total_probes == 0 {
            total_samples.max(1)
        } else {
            let mut file = archive
                .by_name("L-0/0")
                .map_err(|_| ScopeError::ParseError("Could not read first block".to_string()))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            (buf.len() as u64 * 8).max(1)
        };

        let probe_names = (0..total_probes)
            .map(|i| {
                probe_names_map
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| format!("Probe{}", i))
            })
            .collect();

        Ok(DslHeader {
            total_probes,
            samplerate,
            samplerate_hz,
            total_samples,
            total_blocks,
            samples_per_block,
            probe_names,
            trigger_pos,
        })
    }

    pub fn header(&self) -> &DslHeader {
        &self.header
    }

    /// Probe number of `name`
    pub fn probe(&self, name: &str) -> Result<usize> {
        self.header
            .probe_names
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| ScopeError::UnknownName {
                kind: "probe",
                name: name.to_string(),
            })
    }

    /// Read a single bit from a probe at a sample position
    pub fn read_bit(&mut self, probe: usize, position: u64) -> Result<bool> {
        if probe >= self.header.total_probes {
            return Err(ScopeError::IndexOutOfRange {
                name: "probe".to_string(),
                index: probe,
                count: self.header.total_probes,
            });
        }
        if position >= self.header.total_samples {
            return Err(ScopeError::IndexOutOfRange {
                name: self.header.probe_names[probe].clone(),
                index: position as usize,
                count: self.header.total_samples as usize,
            });
        }

        let block_num = position / self.header.samples_per_block;
        if block_num >= self.header.total_blocks {
            return Err(ScopeError::ParseError(format!(
                "sample {} falls in block {} of {}",
                position, block_num, self.header.total_blocks
            )));
        }
        let sample_in_block = (position % self.header.samples_per_block) as usize;
        let data = self.block(probe, block_num)?;
        Ok(get_bit(&data, sample_in_block))
    }

    fn block(&mut self, probe: usize, block_num: u64) -> Result<Arc<[u8]>> {
        if let Some(data) = self.blocks.get(&(probe, block_num)) {
            return Ok(data.clone());
        }
        let block_name = format!("L-{}/{}", probe, block_num);
        let mut file = self
            .archive
            .by_name(&block_name)
            .map_err(|_| ScopeError::ParseError(format!("Missing DSL block {}", block_name)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        drop(file);

        let data = Arc::<[u8]>::from(data);
        self.blocks.insert((probe, block_num), data.clone());
        Ok(data)
    }

    /// Read every probe back, regrouping `name[i]` probes into buses
    pub fn to_decoded(&mut self) -> Result<DecodedTrace> {
        let samples = self.header.total_samples as usize;
        let mut signals: Vec<DecodedSignal> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for probe in 0..self.header.total_probes {
            let name = self.header.probe_names[probe].clone();
            let (base, bit) = split_bus_bit(&name);
            let slot = match index.get(base) {
                Some(&slot) => slot,
                None => {
                    signals.push(DecodedSignal {
                        name: base.to_string(),
                        width: 0,
                        values: vec![0; samples],
                    });
                    index.insert(base.to_string(), signals.len() - 1);
                    signals.len() - 1
                }
            };
            signals[slot].width = signals[slot].width.max(bit + 1);
            for i in 0..samples {
                if self.read_bit(probe, i as u64)? {
                    signals[slot].values[i] |= 1u128 << bit;
                }
            }
        }

        let period = (1e12 / self.header.samplerate_hz).round() as u64;
        Ok(DecodedTrace {
            signals,
            trigger_index: self.header.trigger_pos.unwrap_or(0) as usize,
            sample_period_ps: Some(period).filter(|&ps| ps > 0),
        })
    }
}

/// `"fsm[3]"` → `("fsm", 3)`; anything else is a single-bit signal
fn split_bus_bit(name: &str) -> (&str, u32) {
    if let Some(open) = name.rfind('[')
        && let Some(bit) = name[open + 1..].strip_suffix(']')
        && let Ok(bit) = bit.parse::<u32>()
        && bit < 128
    {
        return (&name[..open], bit);
    }
    (name, 0)
}
