//! CSV address map parser
//!
//! Row kinds (blank lines and `#` comments are skipped):
//!
//! ```text
//! csr_base,<name>,<addr>,,
//! csr_register,<name>,<addr>,<size in words>,<ro|rw|wo>
//! memory_region,<name>,<base>,<size in bytes>,<type>
//! memory,<name>,<base>,<count>,<stride>,<width>
//! constant,<name>,<value>,,
//! config,None,<data_width|depth|samplerate>,<value>
//! signal,<group>,<name>,<width>[,<offset>]
//! ```
//!
//! Numbers are decimal or `0x` hex. Signals without an explicit offset are
//! packed directly after the previous signal of the same group.

use super::layout::{SignalLayout, SignalSpec};
use super::{AddressMap, AddressMapEntry, BUS_WORD_BITS};
use crate::{Result, ScopeError};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::debug;

/// Widest capture word a single burst can carry
const MAX_DATA_WIDTH: u32 = BUS_WORD_BITS * 255;

fn malformed(line: usize, reason: impl Into<String>) -> ScopeError {
    ScopeError::MalformedMap {
        line,
        reason: reason.into(),
    }
}

/// Parse a decimal or `0x`-prefixed hex number
pub(crate) fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(&hex.replace('_', ""), 16).ok()
    } else {
        value.replace('_', "").parse().ok()
    }
}

/// A signal row waiting for the capture word width to be known
struct PendingSignal {
    line: usize,
    group: usize,
    name: String,
    width: u32,
    offset: Option<u32>,
}

struct Row<'a> {
    line: usize,
    fields: Vec<&'a str>,
}

impl<'a> Row<'a> {
    fn field(&self, index: usize, what: &str) -> Result<&'a str> {
        match self.fields.get(index) {
            Some(value) if !value.is_empty() => Ok(*value),
            _ => Err(malformed(self.line, format!("missing {}", what))),
        }
    }

    fn optional(&self, index: usize) -> Option<&'a str> {
        self.fields.get(index).copied().filter(|v| !v.is_empty())
    }

    fn number(&self, index: usize, what: &str) -> Result<u64> {
        let raw = self.field(index, what)?;
        parse_number(raw).ok_or_else(|| malformed(self.line, format!("invalid {} '{}'", what, raw)))
    }

    /// Number that must fit `T`
    fn bounded<T: TryFrom<u64>>(&self, index: usize, what: &str) -> Result<T> {
        let value = self.number(index, what)?;
        T::try_from(value).map_err(|_| malformed(self.line, format!("{} {} out of range", what, value)))
    }

    fn address(&self, index: usize) -> Result<u32> {
        let value = self.number(index, "address")?;
        u32::try_from(value)
            .map_err(|_| malformed(self.line, format!("address 0x{:x} exceeds 32 bits", value)))
    }
}

pub(super) fn parse(source: &str) -> Result<AddressMap> {
    let mut map = AddressMap::default();
    let mut signals: Vec<PendingSignal> = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = Row {
            line: index + 1,
            fields: line.split(',').map(str::trim).collect(),
        };

        match row.fields[0] {
            "csr_base" => {
                let name = row.field(1, "name")?;
                let address = row.address(2)?;
                if map.bases.insert(name.to_string(), address).is_some() {
                    return Err(malformed(row.line, format!("duplicate base '{}'", name)));
                }
            }
            "csr_register" => {
                let name = row.field(1, "name")?;
                let address = row.address(2)?;
                let size = row.number(3, "size")?;
                if size == 0 || size > 32 {
                    return Err(malformed(row.line, format!("register '{}' size {} not in 1..=32", name, size)));
                }
                let writable = match row.optional(4).unwrap_or("rw") {
                    "rw" | "wo" => true,
                    "ro" => false,
                    other => return Err(malformed(row.line, format!("unknown register mode '{}'", other))),
                };
                let entry = AddressMapEntry::register(name, address, size as u32 * BUS_WORD_BITS, writable);
                insert_entry(&mut map, row.line, entry)?;
            }
            "memory_region" => {
                let name = row.field(1, "name")?;
                let address = row.address(2)?;
                let size = row.number(3, "size")?;
                if size == 0 || size % 4 != 0 {
                    return Err(malformed(row.line, format!("memory '{}' size {} is not a positive multiple of 4", name, size)));
                }
                if (address as u64).checked_add(size).is_none_or(|end| end > u32::MAX as u64 + 1) {
                    return Err(malformed(row.line, format!("memory '{}' runs past the 32-bit address space", name)));
                }
                let entry = AddressMapEntry::memory(name, address, (size / 4) as usize, 4, BUS_WORD_BITS);
                insert_entry(&mut map, row.line, entry)?;
            }
            "memory" => {
                let name = row.field(1, "name")?;
                let address = row.address(2)?;
                let count: usize = row.bounded(3, "count")?;
                let stride: u32 = row.bounded(4, "stride")?;
                let width: u32 = row.bounded(5, "width")?;
                if count == 0 {
                    return Err(malformed(row.line, format!("memory '{}' has no elements", name)));
                }
                if width == 0 || width > MAX_DATA_WIDTH {
                    return Err(malformed(row.line, format!("memory '{}' width {} out of range", name, width)));
                }
                let entry = AddressMapEntry::memory(name, address, count, stride, width);
                if stride == 0 || stride % 4 != 0 || (stride as usize) < entry.words() * 4 {
                    return Err(malformed(
                        row.line,
                        format!("memory '{}' stride {} is non-monotonic for {}-bit elements", name, stride, width),
                    ));
                }
                let end = (count as u64 - 1)
                    .checked_mul(stride as u64)
                    .and_then(|span| span.checked_add(address as u64 + entry.words() as u64 * 4));
                if end.is_none_or(|end| end > u32::MAX as u64 + 1) {
                    return Err(malformed(row.line, format!("memory '{}' runs past the 32-bit address space", name)));
                }
                insert_entry(&mut map, row.line, entry)?;
            }
            "constant" => {
                let name = row.field(1, "name")?;
                let value = row.optional(2).unwrap_or("None");
                if map.constants.insert(name.to_string(), value.to_string()).is_some() {
                    return Err(malformed(row.line, format!("duplicate constant '{}'", name)));
                }
            }
            "config" => {
                let key = row.field(2, "config key")?;
                match key {
                    "data_width" => {
                        let width: u32 = row.bounded(3, "data_width")?;
                        if width == 0 || width > MAX_DATA_WIDTH {
                            return Err(malformed(row.line, format!("data_width {} out of range", width)));
                        }
                        map.analyzer.data_width = Some(width);
                    }
                    "depth" => {
                        let depth: usize = row.bounded(3, "depth")?;
                        if depth == 0 {
                            return Err(malformed(row.line, "depth must be positive"));
                        }
                        map.analyzer.depth = Some(depth);
                    }
                    "samplerate" => {
                        let raw = row.field(3, "samplerate")?;
                        let rate: f64 = raw
                            .parse()
                            .map_err(|_| malformed(row.line, format!("invalid samplerate '{}'", raw)))?;
                        if rate <= 0.0 {
                            return Err(malformed(row.line, "samplerate must be positive"));
                        }
                        map.analyzer.samplerate = Some(rate);
                    }
                    other => debug!("Ignoring analyzer config key '{}' (line {})", other, row.line),
                }
            }
            "signal" => {
                let group: usize = row.bounded(1, "group")?;
                let name = row.field(2, "name")?.to_string();
                let width: u32 = row.bounded(3, "width")?;
                let offset = match row.optional(4) {
                    Some(_) => Some(row.bounded::<u32>(4, "offset")?),
                    None => None,
                };
                signals.push(PendingSignal {
                    line: row.line,
                    group,
                    name,
                    width,
                    offset,
                });
            }
            other => return Err(malformed(row.line, format!("unknown row kind '{}'", other))),
        }
    }

    map.layout = resolve_signals(map.analyzer.data_width, signals)?;
    if !map.layout.is_empty() && map.analyzer.data_width.is_none() {
        map.analyzer.data_width = Some(map.layout.data_width());
    }
    Ok(map)
}

fn insert_entry(map: &mut AddressMap, line: usize, entry: AddressMapEntry) -> Result<()> {
    match map.entries.entry(entry.name.clone()) {
        Entry::Occupied(_) => Err(malformed(line, format!("duplicate name '{}'", entry.name))),
        Entry::Vacant(slot) => {
            slot.insert(entry);
            Ok(())
        }
    }
}

/// Assign offsets and validate against the capture word width.
///
/// Without a `data_width` row the word is sized to fit the widest group.
fn resolve_signals(data_width: Option<u32>, pending: Vec<PendingSignal>) -> Result<SignalLayout> {
    let mut cursor: HashMap<usize, u32> = HashMap::new();
    let mut placed = Vec::with_capacity(pending.len());
    let mut widest = 0;

    for signal in pending {
        let next = cursor.entry(signal.group).or_insert(0);
        let offset = signal.offset.unwrap_or(*next);
        let end = offset.checked_add(signal.width).ok_or_else(|| {
            malformed(
                signal.line,
                format!("signal '{}' at offset {} runs past bit {}", signal.name, offset, u32::MAX),
            )
        })?;
        if data_width.is_none() && end > MAX_DATA_WIDTH {
            return Err(malformed(
                signal.line,
                format!("signal '{}' ends at bit {}, past the widest capture word", signal.name, end),
            ));
        }
        *next = end;
        widest = widest.max(end);
        placed.push((signal.line, SignalSpec::new(signal.name, signal.width, offset, signal.group)));
    }

    let width = data_width.unwrap_or(widest);
    let mut layout = SignalLayout::new(width);
    for (line, spec) in placed {
        layout.push(spec).map_err(|reason| malformed(line, reason))?;
    }
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::EntryKind;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x82000000"), Some(0x8200_0000));
        assert_eq!(parse_number("0X1f"), Some(0x1f));
        assert_eq!(parse_number("0x8200_0000"), Some(0x8200_0000));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_parse_full_table() {
        let source = "\
#--------------------------------------------------------------------------------
# Auto-generated
#--------------------------------------------------------------------------------
csr_base,lfps_analyzer,0x82000000,,
csr_register,lfps_analyzer_trigger_mask,0x82000004,2,rw
csr_register,lfps_analyzer_storage_status,0x82000020,1,ro
memory,lfps_analyzer_storage_mem,0x90000000,4096,8,40
constant,config_cpu_type,None,,

config,None,data_width,40
config,None,depth,4096
config,None,samplerate,125000000
signal,0,tx_idle,1
signal,0,rx_idle,1
signal,0,ltssm_fsm,4
signal,0,source_data,32
";
        let map = parse(source).unwrap();

        let mask = map.register("lfps_analyzer_trigger_mask").unwrap();
        assert_eq!(mask.width, 64);
        assert_eq!(mask.words(), 2);

        let status = map.register("lfps_analyzer_storage_status").unwrap();
        assert!(!status.writable);

        let mem = map.memory("lfps_analyzer_storage_mem").unwrap();
        assert_eq!(mem.kind, EntryKind::Memory);
        assert_eq!(mem.count, 4096);
        assert_eq!(mem.words(), 2);

        let layout = map.layout();
        assert_eq!(layout.data_width(), 40);
        assert_eq!(layout.find("ltssm_fsm").unwrap().offset, 2);
        assert_eq!(layout.find("source_data").unwrap().offset, 6);
        assert_eq!(map.analyzer().samplerate, Some(125e6));
    }

    #[test]
    fn test_duplicate_names() {
        let source = "csr_register,a,0x0,1,rw\nmemory_region,a,0x100,16,io\n";
        match parse(source) {
            Err(ScopeError::MalformedMap { line, reason }) => {
                assert_eq!(line, 2);
                assert!(reason.contains("duplicate"));
            }
            other => panic!("Expected MalformedMap, got {:?}", other.map(|_| ())),
        }

        assert!(parse("signal,0,x,1\nsignal,0,x,1\n").is_err());
        // Same name in different groups is allowed
        assert!(parse("signal,0,x,1\nsignal,1,x,1\n").is_ok());
    }

    #[test]
    fn test_bad_memory_stride() {
        assert!(parse("memory,m,0x0,16,0,32\n").is_err());
        assert!(parse("memory,m,0x0,16,4,64\n").is_err());
        assert!(parse("memory,m,0x0,16,6,32\n").is_err());
        assert!(parse("memory,m,0x0,16,8,64\n").is_ok());
        assert!(parse("memory,m,0x0,0,4,32\n").is_err());
    }

    #[test]
    fn test_unparsable_rows() {
        assert!(parse("csr_register,a,zzz,1,rw\n").is_err());
        assert!(parse("csr_register,a,0x0,1,xx\n").is_err());
        assert!(parse("bogus,a,0x0\n").is_err());
        assert!(parse("csr_register,a\n").is_err());
        assert!(parse("csr_register,a,0x100000000,1,rw\n").is_err());
        assert!(parse("config,None,samplerate,fast\n").is_err());
        assert!(parse("signal,0,x,1,zz\n").is_err());
    }

    fn assert_malformed(source: &str) {
        match parse(source) {
            Err(ScopeError::MalformedMap { line: 1, .. }) => {}
            other => panic!("Expected MalformedMap for {:?}, got {:?}", source, other.map(|_| ())),
        }
    }

    #[test]
    fn test_out_of_range_numbers() {
        // Signal offsets and widths
        assert_malformed("signal,0,x,1,0xFFFFFFFF\n");
        assert_malformed("signal,0,x,1,0x100000000\n");
        assert_malformed("signal,0,x,4294967297\n");
        assert_malformed("signal,0,x,0xFFFFFFFF,1\n");
        assert_malformed("signal,0,x,1,0x7FFFFFFF\n");
        assert!(matches!(
            parse("config,None,data_width,64\nsignal,0,x,1,0xFFFFFFFF\n"),
            Err(ScopeError::MalformedMap { line: 2, .. })
        ));
        assert!(matches!(
            parse("signal,0,a,1,0xFFFFFFFE\nsignal,0,b,4\n"),
            Err(ScopeError::MalformedMap { .. })
        ));

        // Memory geometry
        assert_malformed("memory,m,0x0,0xFFFFFFFFFFFFFFFF,8,32\n");
        assert_malformed("memory,m,0x0,0x100000000,8,32\n");
        assert_malformed("memory,m,0x0,16,0x100000004,32\n");
        assert_malformed("memory,m,0x0,16,8,0x100000020\n");
        assert_malformed("memory,m,0xFFFFFFF0,8,4,32\n");
        assert!(parse("memory,m,0xFFFFFFE0,8,4,32\n").is_ok());
        assert_malformed("memory_region,r,0xFFFFFFF0,32,io\n");
        assert_malformed("memory_region,r,0x10,0xFFFFFFFFFFFFFFFC,io\n");

        // Analyzer configuration and groups
        assert_malformed("config,None,data_width,0x100000020\n");
        assert_malformed("config,None,depth,0\n");
        assert_malformed("signal,99999999999999999999,x,1\n");
    }

    #[test]
    fn test_signal_exceeding_data_width() {
        let source = "config,None,data_width,8\nsignal,0,a,4\nsignal,0,b,8\n";
        assert!(matches!(parse(source), Err(ScopeError::MalformedMap { line: 3, .. })));
    }

    #[test]
    fn test_explicit_offsets_and_inferred_width() {
        let source = "signal,0,idle,1,0\nsignal,0,polling,1,3\nsignal,0,after,2\n";
        let map = parse(source).unwrap();
        let layout = map.layout();
        assert_eq!(layout.find("after").unwrap().offset, 4);
        assert_eq!(layout.data_width(), 6);
        assert_eq!(map.analyzer().data_width, Some(6));
    }
}
