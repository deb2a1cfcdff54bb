//! Published address map
//!
//! The SoC build emits CSV tables naming every control/status register, memory
//! window, constant, and (for the logic analyzer) the packing of probed signals
//! into capture words. The map is loaded once per session and is read-only
//! afterwards; consumers resolve names into [`AddressMapEntry`] values up front
//! so an unknown name fails before any device I/O.

mod layout;
mod loader;

pub use layout::{MAX_SIGNAL_WIDTH, SignalLayout, SignalSpec};

use crate::{Result, ScopeError};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Capture buffer depth when the map does not say otherwise
pub const DEFAULT_DEPTH: usize = 4096;

/// Bus word width in bits
pub const BUS_WORD_BITS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Register,
    Memory,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryKind::Register => write!(f, "register"),
            EntryKind::Memory => write!(f, "memory"),
        }
    }
}

/// A named register or memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMapEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Byte address of the register, or of element 0 of a memory
    pub address: u32,
    /// Width in bits of the register, or of one memory element
    pub width: u32,
    /// Element count (1 for registers)
    pub count: usize,
    /// Byte distance between memory elements (0 for registers)
    pub stride: u32,
    pub writable: bool,
}

impl AddressMapEntry {
    pub fn register(name: impl Into<String>, address: u32, width: u32, writable: bool) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Register,
            address,
            width,
            count: 1,
            stride: 0,
            writable,
        }
    }

    pub fn memory(name: impl Into<String>, address: u32, count: usize, stride: u32, width: u32) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Memory,
            address,
            width,
            count,
            stride,
            writable: true,
        }
    }

    /// Bus words needed for one register value or memory element
    #[inline]
    pub fn words(&self) -> usize {
        self.width.div_ceil(BUS_WORD_BITS).max(1) as usize
    }

    /// Byte address of memory element `index`; callers bounds-check first
    #[inline]
    pub fn element_address(&self, index: usize) -> u32 {
        self.address.wrapping_add(index as u32 * self.stride)
    }

    /// Bounds-check `index` against the element count
    pub fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.count {
            return Err(ScopeError::IndexOutOfRange {
                name: self.name.clone(),
                index,
                count: self.count,
            });
        }
        Ok(())
    }
}

/// Analyzer core parameters published alongside its signal layout
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzerConfig {
    pub data_width: Option<u32>,
    pub depth: Option<usize>,
    /// Sample clock in Hz, before subsampling
    pub samplerate: Option<f64>,
}

impl AnalyzerConfig {
    pub fn depth(&self) -> usize {
        self.depth.unwrap_or(DEFAULT_DEPTH)
    }
}

/// Immutable name → entry mapping for one SoC
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    entries: HashMap<String, AddressMapEntry>,
    bases: HashMap<String, u32>,
    constants: HashMap<String, String>,
    analyzer: AnalyzerConfig,
    layout: SignalLayout,
}

impl AddressMap {
    /// Parse one CSV table
    pub fn load(source: &str) -> Result<Self> {
        loader::parse(source)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let map = Self::load(&source)?;
        info!(
            "Loaded address map {} ({} entries, {} signals)",
            path.display(),
            map.entries.len(),
            map.layout.len()
        );
        Ok(map)
    }

    /// Load and merge several tables (typically `csr.csv` and `analyzer.csv`)
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut map = AddressMap::default();
        for path in paths {
            map = map.merge(Self::load_file(path)?)?;
        }
        Ok(map)
    }

    /// Union of two maps; a name defined in both is a malformed map
    pub fn merge(mut self, other: AddressMap) -> Result<Self> {
        let dup = |what: &str, name: &str| ScopeError::MalformedMap {
            line: 0,
            reason: format!("{} '{}' defined in more than one table", what, name),
        };
        for (name, entry) in other.entries {
            if self.entries.contains_key(&name) {
                return Err(dup("entry", &name));
            }
            self.entries.insert(name, entry);
        }
        for (name, base) in other.bases {
            if self.bases.insert(name.clone(), base).is_some() {
                return Err(dup("base", &name));
            }
        }
        for (name, value) in other.constants {
            if self.constants.insert(name.clone(), value).is_some() {
                return Err(dup("constant", &name));
            }
        }
        if !other.layout.is_empty() {
            if !self.layout.is_empty() {
                return Err(dup("signal layout", "analyzer"));
            }
            self.layout = other.layout;
        }
        self.analyzer.data_width = other.analyzer.data_width.or(self.analyzer.data_width);
        self.analyzer.depth = other.analyzer.depth.or(self.analyzer.depth);
        self.analyzer.samplerate = other.analyzer.samplerate.or(self.analyzer.samplerate);
        Ok(self)
    }

    /// Resolve a register or memory by name
    pub fn entry(&self, name: &str) -> Result<&AddressMapEntry> {
        self.entries.get(name).ok_or_else(|| ScopeError::UnknownName {
            kind: "register or memory",
            name: name.to_string(),
        })
    }

    pub fn register(&self, name: &str) -> Result<&AddressMapEntry> {
        match self.entries.get(name) {
            Some(entry) if entry.kind == EntryKind::Register => Ok(entry),
            _ => Err(ScopeError::UnknownName {
                kind: "register",
                name: name.to_string(),
            }),
        }
    }

    pub fn memory(&self, name: &str) -> Result<&AddressMapEntry> {
        match self.entries.get(name) {
            Some(entry) if entry.kind == EntryKind::Memory => Ok(entry),
            _ => Err(ScopeError::UnknownName {
                kind: "memory",
                name: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn base(&self, name: &str) -> Result<u32> {
        self.bases
            .get(name)
            .copied()
            .ok_or_else(|| ScopeError::UnknownName {
                kind: "base",
                name: name.to_string(),
            })
    }

    pub fn constant(&self, name: &str) -> Result<&str> {
        self.constants
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ScopeError::UnknownName {
                kind: "constant",
                name: name.to_string(),
            })
    }

    pub fn entries(&self) -> impl Iterator<Item = &AddressMapEntry> {
        self.entries.values()
    }

    pub fn analyzer(&self) -> &AnalyzerConfig {
        &self.analyzer
    }

    /// Full signal layout, all groups
    pub fn layout(&self) -> &SignalLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSR: &str = "\
csr_base,analyzer,0x82000000,,
csr_register,analyzer_storage_enable,0x82000010,1,rw
memory_region,identifier_mem,0x82001000,1024,io
constant,config_clock_frequency,125000000,,
";

    const ANALYZER: &str = "\
config,None,data_width,8
config,None,depth,16
signal,0,idle,1
signal,0,polling,1,3
";

    #[test]
    fn test_entry_lookup() {
        let map = AddressMap::load(CSR).unwrap();
        let enable = map.register("analyzer_storage_enable").unwrap();
        assert_eq!(enable.address, 0x8200_0010);
        assert_eq!(enable.words(), 1);
        assert!(enable.writable);

        let ident = map.memory("identifier_mem").unwrap();
        assert_eq!(ident.count, 256);
        assert_eq!(ident.element_address(3), 0x8200_100c);

        assert_eq!(map.base("analyzer").unwrap(), 0x8200_0000);
        assert_eq!(map.constant("config_clock_frequency").unwrap(), "125000000");
    }

    #[test]
    fn test_unknown_names() {
        let map = AddressMap::load(CSR).unwrap();
        assert!(matches!(
            map.entry("nope"),
            Err(ScopeError::UnknownName { kind: "register or memory", .. })
        ));
        // Kind mismatch reads as unknown for that kind
        assert!(map.memory("analyzer_storage_enable").is_err());
        assert!(map.register("identifier_mem").is_err());
        assert!(map.constant("missing").is_err());
    }

    #[test]
    fn test_check_index_bounds() {
        let entry = AddressMapEntry::memory("mem", 0, 4, 4, 32);
        assert!(entry.check_index(0).is_ok());
        assert!(entry.check_index(3).is_ok());
        assert!(matches!(
            entry.check_index(4),
            Err(ScopeError::IndexOutOfRange { index: 4, count: 4, .. })
        ));
    }

    #[test]
    fn test_merge_tables() {
        let map = AddressMap::load(CSR)
            .unwrap()
            .merge(AddressMap::load(ANALYZER).unwrap())
            .unwrap();
        assert_eq!(map.analyzer().depth(), 16);
        assert_eq!(map.layout().find("polling").unwrap().offset, 3);
        assert!(map.contains("identifier_mem"));
    }

    #[test]
    fn test_merge_rejects_duplicates() {
        let a = AddressMap::load(CSR).unwrap();
        let b = AddressMap::load(CSR).unwrap();
        assert!(matches!(a.merge(b), Err(ScopeError::MalformedMap { .. })));
    }

    #[test]
    fn test_default_depth() {
        let map = AddressMap::load(CSR).unwrap();
        assert_eq!(map.analyzer().depth(), DEFAULT_DEPTH);
    }
}
