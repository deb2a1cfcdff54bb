//! Remote register client
//!
//! Named, typed register and memory access over a [`Transport`]. Names are
//! resolved against the session's [`AddressMap`] before any device I/O, so a
//! typo or an out-of-range index never reaches the bus.
//!
//! ## Word order
//!
//! All multi-word values cross this API least-significant word first. On the
//! device, a register wider than 32 bits stores its most-significant word at
//! the lowest address, so register accesses reverse the word order on the way
//! in and out. Memory elements are laid out least-significant word first and
//! are passed through unchanged.
//!
//! Reads may be retried freely. Writes to control registers have side effects
//! and are never retried here; a timeout is reported to the caller.

use crate::bridge::{BridgeError, MAX_BURST, Request, Transport};
use crate::config::WaitPolicy;
use crate::map::{AddressMap, AddressMapEntry, EntryKind};
use crate::{Result, ScopeError};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Memory holding the SoC identification string, one byte per element
pub const IDENTIFIER_MEM: &str = "identifier_mem";

/// Identifier length read when the map only publishes its base address
const IDENTIFIER_LEN: usize = 256;

/// Register/memory access session
pub struct RemoteClient<T: Transport> {
    transport: T,
    map: Arc<AddressMap>,
}

impl<T: Transport> RemoteClient<T> {
    pub fn new(transport: T, map: AddressMap) -> Self {
        Self::with_shared_map(transport, Arc::new(map))
    }

    /// Session sharing an already loaded map with other sessions
    pub fn with_shared_map(transport: T, map: Arc<AddressMap>) -> Self {
        Self { transport, map }
    }

    /// Open the underlying transport
    pub fn open(&mut self) -> Result<()> {
        self.transport.open().map_err(|e| match e {
            BridgeError::Connection { endpoint, source } => ScopeError::Connection {
                endpoint,
                reason: source.to_string(),
            },
            other => ScopeError::Connection {
                endpoint: self.transport.endpoint().to_string(),
                reason: other.to_string(),
            },
        })?;
        info!("Session open on {}", self.transport.endpoint());
        Ok(())
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn map(&self) -> &AddressMap {
        &self.map
    }

    pub fn shared_map(&self) -> Arc<AddressMap> {
        self.map.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Discard stale response bytes after an abandoned request
    pub fn drain(&mut self) -> usize {
        let dropped = self.transport.drain();
        if dropped > 0 {
            debug!("Drained {} stale bytes from {}", dropped, self.transport.endpoint());
        }
        dropped
    }

    pub fn constant(&self, name: &str) -> Result<&str> {
        self.map.constant(name)
    }

    // Named access

    /// Read a register of up to 64 bits
    pub fn read(&mut self, name: &str) -> Result<u64> {
        let entry = self.map.register(name)?.clone();
        self.read_entry(&entry)
    }

    /// Write a register of up to 64 bits
    pub fn write(&mut self, name: &str, value: u64) -> Result<()> {
        let entry = self.map.register(name)?.clone();
        self.write_entry(&entry, value)
    }

    /// Read a register of any width, least-significant word first
    pub fn read_words(&mut self, name: &str) -> Result<Vec<u32>> {
        let entry = self.map.register(name)?.clone();
        self.read_entry_words(&entry)
    }

    pub fn write_words(&mut self, name: &str, words: &[u32]) -> Result<()> {
        let entry = self.map.register(name)?.clone();
        self.write_entry_words(&entry, words)
    }

    /// Read element `index` (up to 64 bits) of a memory
    pub fn read_memory(&mut self, name: &str, index: usize) -> Result<u64> {
        let entry = self.map.memory(name)?.clone();
        check_u64(&entry)?;
        let words = self.read_element_words(&entry, index)?;
        Ok(join_u64(&words))
    }

    pub fn write_memory(&mut self, name: &str, index: usize, value: u64) -> Result<()> {
        let entry = self.map.memory(name)?.clone();
        let words = split_u64(&entry, value)?;
        self.write_element_words(&entry, index, &words)
    }

    pub fn read_memory_words(&mut self, name: &str, index: usize) -> Result<Vec<u32>> {
        let entry = self.map.memory(name)?.clone();
        self.read_element_words(&entry, index)
    }

    pub fn write_memory_words(&mut self, name: &str, index: usize, words: &[u32]) -> Result<()> {
        let entry = self.map.memory(name)?.clone();
        self.write_element_words(&entry, index, words)
    }

    /// Poll a register until `done` accepts its value or the policy times out.
    ///
    /// Returns the accepted value, or `None` on timeout.
    pub fn poll<F>(&mut self, name: &str, policy: &WaitPolicy, done: F) -> Result<Option<u64>>
    where
        F: FnMut(u64) -> bool,
    {
        let entry = self.map.register(name)?.clone();
        self.poll_entry(&entry, policy, done)
    }

    /// SoC identification string
    ///
    /// Reads the `identifier_mem` memory, or [`IDENTIFIER_LEN`] word-spaced
    /// bytes from the `identifier_mem` base when the map only has a base row.
    pub fn identifier(&mut self) -> Result<String> {
        let entry = if self.map.contains(IDENTIFIER_MEM) {
            self.map.memory(IDENTIFIER_MEM)?.clone()
        } else {
            let base = self.map.base(IDENTIFIER_MEM)?;
            AddressMapEntry::memory(IDENTIFIER_MEM, base, IDENTIFIER_LEN, 4, 8)
        };
        let words = self.read_elements(&entry, 0, entry.count)?;
        let bytes: Vec<u8> = words
            .chunks_exact(entry.words())
            .map(|element| (element[0] & 0xff) as u8)
            .take_while(|&b| b != 0)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // Resolved-entry access

    pub fn read_entry(&mut self, entry: &AddressMapEntry) -> Result<u64> {
        check_u64(entry)?;
        let words = self.read_entry_words(entry)?;
        Ok(join_u64(&words))
    }

    pub fn write_entry(&mut self, entry: &AddressMapEntry, value: u64) -> Result<()> {
        let words = split_u64(entry, value)?;
        self.write_entry_words(entry, &words)
    }

    pub fn read_entry_words(&mut self, entry: &AddressMapEntry) -> Result<Vec<u32>> {
        expect_kind(entry, EntryKind::Register)?;
        let mut words = self.read_burst(&entry.name, entry.address, entry.words())?;
        words.reverse();
        debug!("{} -> {:08x?}", entry.name, words);
        Ok(words)
    }

    pub fn write_entry_words(&mut self, entry: &AddressMapEntry, words: &[u32]) -> Result<()> {
        expect_kind(entry, EntryKind::Register)?;
        if !entry.writable {
            return Err(ScopeError::Protocol {
                name: entry.name.clone(),
                reason: "register is read-only".to_string(),
            });
        }
        let mut data = fit_words(entry, words)?;
        debug!("{} <- {:08x?}", entry.name, data);
        data.reverse();
        self.write_burst(&entry.name, entry.address, &data)
    }

    pub fn read_element_words(&mut self, entry: &AddressMapEntry, index: usize) -> Result<Vec<u32>> {
        expect_kind(entry, EntryKind::Memory)?;
        entry.check_index(index)?;
        self.read_burst(&entry.name, entry.element_address(index), entry.words())
    }

    pub fn write_element_words(&mut self, entry: &AddressMapEntry, index: usize, words: &[u32]) -> Result<()> {
        expect_kind(entry, EntryKind::Memory)?;
        entry.check_index(index)?;
        let data = fit_words(entry, words)?;
        self.write_burst(&entry.name, entry.element_address(index), &data)
    }

    /// Read `count` consecutive elements starting at `start`, flattened.
    ///
    /// Densely packed memories are read in bursts; others element by element.
    pub fn read_elements(&mut self, entry: &AddressMapEntry, start: usize, count: usize) -> Result<Vec<u32>> {
        expect_kind(entry, EntryKind::Memory)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        entry.check_index(start)?;
        entry.check_index(start + count - 1)?;

        let per_element = entry.words();
        if entry.stride as usize == 4 * per_element {
            return self.read_burst(&entry.name, entry.element_address(start), count * per_element);
        }
        let mut words = Vec::with_capacity(count * per_element);
        for index in start..start + count {
            words.extend(self.read_burst(&entry.name, entry.element_address(index), per_element)?);
        }
        Ok(words)
    }

    pub fn poll_entry<F>(&mut self, entry: &AddressMapEntry, policy: &WaitPolicy, mut done: F) -> Result<Option<u64>>
    where
        F: FnMut(u64) -> bool,
    {
        let mut timer = policy.start();
        loop {
            let value = self.read_entry(entry)?;
            if done(value) {
                return Ok(Some(value));
            }
            if !timer.wait() {
                debug!(
                    "Gave up polling {} after {:?} (last value 0x{:x})",
                    entry.name,
                    timer.elapsed(),
                    value
                );
                return Ok(None);
            }
        }
    }

    // Bus level

    fn read_burst(&mut self, name: &str, address: u32, count: usize) -> Result<Vec<u32>> {
        let mut words = Vec::with_capacity(count);
        while words.len() < count {
            let chunk = (count - words.len()).min(MAX_BURST);
            let at = address.wrapping_add(4 * words.len() as u32);
            let response = self.transfer(name, &Request::read(at, chunk as u8))?;
            let data = response
                .into_words(chunk)
                .map_err(|e| translate(name, at, e))?;
            words.extend(data);
        }
        Ok(words)
    }

    fn write_burst(&mut self, name: &str, address: u32, data: &[u32]) -> Result<()> {
        for (i, chunk) in data.chunks(MAX_BURST).enumerate() {
            let at = address.wrapping_add(4 * (i * MAX_BURST) as u32);
            self.transfer(name, &Request::write(at, chunk.to_vec()))?;
        }
        Ok(())
    }

    fn transfer(&mut self, name: &str, request: &Request) -> Result<crate::bridge::Response> {
        trace!("{} {:?}", name, request);
        self.transport
            .request(request)
            .map_err(|e| translate(name, request.address(), e))
    }
}

/// Map a transport fault onto the session error, naming the entry involved
fn translate(name: &str, address: u32, error: BridgeError) -> ScopeError {
    match error {
        BridgeError::Timeout { elapsed, .. } => ScopeError::DeviceUnresponsive {
            name: name.to_string(),
            address,
            reason: format!("no response after {:?}", elapsed),
        },
        BridgeError::Closed => ScopeError::DeviceUnresponsive {
            name: name.to_string(),
            address,
            reason: "link closed".to_string(),
        },
        BridgeError::Connection { endpoint, source } => ScopeError::Connection {
            endpoint,
            reason: source.to_string(),
        },
        other => ScopeError::Bridge {
            name: name.to_string(),
            source: other,
        },
    }
}

fn expect_kind(entry: &AddressMapEntry, kind: EntryKind) -> Result<()> {
    if entry.kind != kind {
        return Err(ScopeError::UnknownName {
            kind: match kind {
                EntryKind::Register => "register",
                EntryKind::Memory => "memory",
            },
            name: entry.name.clone(),
        });
    }
    Ok(())
}

fn check_u64(entry: &AddressMapEntry) -> Result<()> {
    if entry.width > 64 {
        return Err(ScopeError::WidthOverflow {
            name: entry.name.clone(),
            width: entry.width,
            limit: 64,
        });
    }
    Ok(())
}

fn join_u64(words: &[u32]) -> u64 {
    words
        .iter()
        .take(2)
        .enumerate()
        .fold(0u64, |acc, (i, w)| acc | (*w as u64) << (32 * i))
}

fn split_u64(entry: &AddressMapEntry, value: u64) -> Result<Vec<u32>> {
    check_u64(entry)?;
    fit_words(entry, &[value as u32, (value >> 32) as u32])
}

/// Pad `words` to the entry's word count, rejecting bits beyond its width
fn fit_words(entry: &AddressMapEntry, words: &[u32]) -> Result<Vec<u32>> {
    let count = entry.words();
    let used = words
        .iter()
        .rposition(|&w| w != 0)
        .map(|i| 32 * i as u32 + (32 - words[i].leading_zeros()))
        .unwrap_or(0);
    if used > entry.width {
        return Err(ScopeError::WidthOverflow {
            name: entry.name.clone(),
            width: used,
            limit: entry.width,
        });
    }
    let mut data = words.to_vec();
    data.resize(count, 0);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{SimDevice, SimHandle};
    use std::time::Duration;

    const MAP: &str = "\
csr_register,ctrl_scratch,0x100,1,rw
csr_register,ctrl_bus_errors,0x104,1,ro
csr_register,timer_value,0x110,2,rw
csr_register,wide_value,0x120,3,rw
memory_region,identifier_mem,0x1000,128,io
memory,trace_mem,0x2000,600,4,32
memory,sample_mem,0x4000,4,16,40
";

    fn client() -> (RemoteClient<SimDevice>, SimHandle) {
        let device = SimDevice::new();
        let handle = device.handle();
        let mut client = RemoteClient::new(device, AddressMap::load(MAP).unwrap());
        client.open().unwrap();
        (client, handle)
    }

    #[test]
    fn test_register_roundtrip() {
        let (mut client, _) = client();
        client.write("ctrl_scratch", 0x1234_5678).unwrap();
        assert_eq!(client.read("ctrl_scratch").unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_wide_register_msw_at_lowest_address() {
        let (mut client, handle) = client();
        client.write("timer_value", 0x0000_00aa_0000_00bb).unwrap();
        assert_eq!(handle.peek(0x110), 0xaa);
        assert_eq!(handle.peek(0x114), 0xbb);
        assert_eq!(client.read("timer_value").unwrap(), 0x0000_00aa_0000_00bb);
        assert_eq!(client.read_words("timer_value").unwrap(), vec![0xbb, 0xaa]);
    }

    #[test]
    fn test_width_checks() {
        let (mut client, handle) = client();
        assert!(matches!(
            client.read("wide_value"),
            Err(ScopeError::WidthOverflow { limit: 64, .. })
        ));
        assert!(matches!(
            client.write("ctrl_scratch", 1 << 40),
            Err(ScopeError::WidthOverflow { width: 41, limit: 32, .. })
        ));
        client.write_words("wide_value", &[1, 2, 3]).unwrap();
        assert_eq!(handle.peek(0x120), 3);
        assert_eq!(client.read_words("wide_value").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_name_issues_no_request() {
        let (mut client, handle) = client();
        assert!(matches!(
            client.read("ctrl_nope"),
            Err(ScopeError::UnknownName { kind: "register", .. })
        ));
        assert!(matches!(
            client.write("trace_mem", 1),
            Err(ScopeError::UnknownName { .. })
        ));
        assert!(handle.requests().is_empty());
    }

    #[test]
    fn test_read_only_register() {
        let (mut client, handle) = client();
        assert!(matches!(
            client.write("ctrl_bus_errors", 0),
            Err(ScopeError::Protocol { .. })
        ));
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn test_memory_bounds() {
        let (mut client, handle) = client();
        client.write_memory("trace_mem", 0, 7).unwrap();
        client.write_memory("trace_mem", 599, 9).unwrap();
        assert_eq!(handle.peek(0x2000 + 4 * 599), 9);
        assert_eq!(client.read_memory("trace_mem", 0).unwrap(), 7);
        assert_eq!(client.read_memory("trace_mem", 599).unwrap(), 9);

        handle.clear_log();
        assert!(matches!(
            client.read_memory("trace_mem", 600),
            Err(ScopeError::IndexOutOfRange { index: 600, count: 600, .. })
        ));
        assert!(matches!(
            client.write_memory("trace_mem", 600, 0),
            Err(ScopeError::IndexOutOfRange { .. })
        ));
        assert!(handle.requests().is_empty());
    }

    #[test]
    fn test_wide_memory_element_is_ls_word_first() {
        let (mut client, handle) = client();
        client.write_memory_words("sample_mem", 1, &[0x11, 0x22]).unwrap();
        assert_eq!(handle.peek(0x4010), 0x11);
        assert_eq!(handle.peek(0x4014), 0x22);
        assert_eq!(client.read_memory("sample_mem", 1).unwrap(), 0x22_0000_0011);
    }

    #[test]
    fn test_range_read_splits_bursts() {
        let (mut client, handle) = client();
        let entry = client.map().memory("trace_mem").unwrap().clone();
        let words = client.read_elements(&entry, 0, 600).unwrap();
        assert_eq!(words.len(), 600);
        let reads = handle.requests();
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[1], Request::read(0x2000 + 4 * 255, 255));
        assert_eq!(reads[2], Request::read(0x2000 + 4 * 510, 90));
    }

    #[test]
    fn test_sparse_range_read() {
        let (mut client, handle) = client();
        let entry = client.map().memory("sample_mem").unwrap().clone();
        client.write_memory_words("sample_mem", 3, &[5, 6]).unwrap();
        let words = client.read_elements(&entry, 2, 2).unwrap();
        assert_eq!(words, vec![0, 0, 5, 6]);
        assert!(client.read_elements(&entry, 3, 2).is_err());
        assert_eq!(handle.requests().iter().filter(|r| !r.is_write()).count(), 2);
    }

    #[test]
    fn test_timeout_names_register() {
        let (mut client, handle) = client();
        handle.set_responsive(false);
        match client.read("ctrl_scratch") {
            Err(ScopeError::DeviceUnresponsive { name, address, .. }) => {
                assert_eq!(name, "ctrl_scratch");
                assert_eq!(address, 0x100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_refused() {
        let mut client = RemoteClient::new(SimDevice::new().refuse_open(), AddressMap::default());
        assert!(matches!(client.open(), Err(ScopeError::Connection { .. })));
    }

    #[test]
    fn test_identifier() {
        let map = AddressMap::load(MAP).unwrap();
        let entry = map.memory(IDENTIFIER_MEM).unwrap().clone();
        let device = SimDevice::new().with_identifier(&entry, "USB3 PIPE debug SoC");
        let mut client = RemoteClient::new(device, map);
        client.open().unwrap();
        assert_eq!(client.identifier().unwrap(), "USB3 PIPE debug SoC");
    }

    #[test]
    fn test_identifier_from_base_address() {
        let map = AddressMap::load("csr_base,identifier_mem,0x82001800,,\n").unwrap();
        let entry = AddressMapEntry::memory(IDENTIFIER_MEM, 0x8200_1800, 256, 4, 8);
        let device = SimDevice::new().with_identifier(&entry, "LiteX SoC on NeTV2");
        let handle = device.handle();
        let mut client = RemoteClient::new(device, map);
        client.open().unwrap();

        assert_eq!(client.identifier().unwrap(), "LiteX SoC on NeTV2");
        // 256 word-spaced bytes, split at the burst limit
        assert_eq!(
            handle.requests(),
            vec![Request::read(0x8200_1800, 255), Request::read(0x8200_1800 + 4 * 255, 1)]
        );
    }

    #[test]
    fn test_identifier_missing() {
        let mut client = RemoteClient::new(SimDevice::new(), AddressMap::default());
        client.open().unwrap();
        assert!(matches!(
            client.identifier(),
            Err(ScopeError::UnknownName { .. })
        ));
    }

    #[test]
    fn test_poll() {
        let (mut client, handle) = client();
        handle.poke(0x100, 1);
        let policy = WaitPolicy::new(Duration::from_millis(20)).with_poll_interval(Duration::from_millis(1));
        assert_eq!(client.poll("ctrl_scratch", &policy, |v| v == 1).unwrap(), Some(1));
        assert_eq!(client.poll("ctrl_scratch", &policy, |v| v == 2).unwrap(), None);
    }
}
