//! Register bus bridge transports
//!
//! A bridge carries a strictly synchronous request/response protocol: one
//! framed read or write goes out, and the caller blocks until the matching
//! response arrives or the response timeout fires. There are no correlation
//! identifiers on the wire, so a transport must never be shared by two callers
//! without external locking; `request` takes `&mut self` for that reason.

pub mod errors;
pub mod etherbone;
pub mod link;
pub mod sim;
pub mod uart;
pub mod watchdog;

pub use errors::{BridgeError, BridgeResult};
pub use etherbone::EtherboneTransport;
pub use link::Link;
pub use sim::{SimAnalyzer, SimDevice, SimHandle};
pub use uart::UartTransport;
pub use watchdog::{OperationGuard, Watchdog, WatchdogHandle};

/// Largest burst a single bridge frame can carry (8-bit count field)
pub const MAX_BURST: usize = 255;

/// One bus operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `count` consecutive 32-bit words starting at byte `address`
    Read { address: u32, count: u8 },
    /// Write consecutive 32-bit words starting at byte `address`
    Write { address: u32, data: Vec<u32> },
}

impl Request {
    pub fn read(address: u32, count: u8) -> Self {
        Request::Read { address, count }
    }

    pub fn write(address: u32, data: Vec<u32>) -> Self {
        Request::Write { address, data }
    }

    pub fn address(&self) -> u32 {
        match self {
            Request::Read { address, .. } | Request::Write { address, .. } => *address,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Request::Write { .. })
    }

    /// Reject frames the 8-bit count field cannot express
    pub fn validate(&self) -> BridgeResult {
        let count = match self {
            Request::Read { count, .. } => *count as usize,
            Request::Write { data, .. } => data.len(),
        };
        if count == 0 || count > MAX_BURST {
            return Err(BridgeError::Protocol(format!(
                "burst of {} words at 0x{:08x} (must be 1-{})",
                count,
                self.address(),
                MAX_BURST
            )));
        }
        if self.address() % 4 != 0 {
            return Err(BridgeError::Protocol(format!(
                "unaligned address 0x{:08x}",
                self.address()
            )));
        }
        Ok(())
    }
}

/// Response to one [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Words returned by a read, in address order
    Read(Vec<u32>),
    /// A posted write has been flushed to the link
    Written,
}

impl Response {
    /// Unwrap read data, rejecting a mismatched response kind or length
    pub fn into_words(self, expected: usize) -> BridgeResult<Vec<u32>> {
        match self {
            Response::Read(words) if words.len() == expected => Ok(words),
            Response::Read(words) => Err(BridgeError::Protocol(format!(
                "expected {} words, got {}",
                expected,
                words.len()
            ))),
            Response::Written => Err(BridgeError::Protocol(
                "write acknowledgement in reply to a read".to_string(),
            )),
        }
    }
}

/// A register bus session
///
/// Implementations: [`EtherboneTransport`] (TCP to a bridge server),
/// [`UartTransport`] (serial bridge), [`SimDevice`] (in-memory device model).
pub trait Transport: Send {
    /// Human-readable endpoint, used in error messages
    fn endpoint(&self) -> &str;

    /// Establish the byte-stream session
    fn open(&mut self) -> BridgeResult;

    /// Release the session. Closing a closed transport is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Send one framed operation and block until its response or the timeout
    fn request(&mut self, request: &Request) -> BridgeResult<Response>;

    /// Discard any unread bytes left by an abandoned request; returns bytes dropped
    fn drain(&mut self) -> usize {
        0
    }

    /// Time since the last completed request
    fn idle_for(&self) -> std::time::Duration;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn open(&mut self) -> BridgeResult {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn request(&mut self, request: &Request) -> BridgeResult<Response> {
        (**self).request(request)
    }

    fn drain(&mut self) -> usize {
        (**self).drain()
    }

    fn idle_for(&self) -> std::time::Duration {
        (**self).idle_for()
    }
}
