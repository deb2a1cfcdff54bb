//! UART bridge framing
//!
//! Talks directly to the SoC's serial bridge core through a serial device node
//! (line settings are expected to be configured beforehand, e.g. with `stty`).
//!
//! ## Frame format
//!
//! ```text
//! cmd:u8 | count:u8 | word_address:u32 BE | data:u32 BE * count (writes only)
//! ```
//!
//! `cmd` is 0x01 for a burst write and 0x02 for a burst read; the address is a
//! word address (byte address >> 2). A read is answered by `count` big-endian
//! words and nothing else; writes are not acknowledged.
//!
//! A serial device cannot be shut down under a blocked reader, so the device
//! and its reader thread live as long as the transport. `close` parks the link
//! and a later `open` reuses it after dropping whatever arrived in between.

use super::errors::{BridgeError, BridgeResult};
use super::link::Link;
use super::watchdog::{OperationGuard, Watchdog, WatchdogHandle};
use super::{Request, Response, Transport};
use crate::config::BridgeConfig;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, trace};

pub const CMD_WRITE: u8 = 0x01;
pub const CMD_READ: u8 = 0x02;

/// Encode a bus request as a UART bridge frame
pub fn encode(request: &Request) -> Vec<u8> {
    match request {
        Request::Read { address, count } => {
            let mut out = vec![CMD_READ, *count];
            out.extend_from_slice(&(*address >> 2).to_be_bytes());
            out
        }
        Request::Write { address, data } => {
            let mut out = Vec::with_capacity(6 + 4 * data.len());
            out.push(CMD_WRITE);
            out.push(data.len() as u8);
            out.extend_from_slice(&(*address >> 2).to_be_bytes());
            for word in data {
                out.extend_from_slice(&word.to_be_bytes());
            }
            out
        }
    }
}

/// Decode the payload of a read response
pub fn decode_read(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// UART bridge transport
pub struct UartTransport {
    endpoint: String,
    path: Option<PathBuf>,
    config: BridgeConfig,
    link: Option<Link>,
    open: bool,
    watchdog: Watchdog,
    handle: WatchdogHandle,
}

impl UartTransport {
    /// Transport for a serial device node, opened on [`Transport::open`]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = BridgeConfig::default();
        let endpoint = path.display().to_string();
        let watchdog = Watchdog::new(config.inactivity_threshold);
        let handle = watchdog.register_link(&endpoint);
        Self {
            endpoint,
            path: Some(path),
            config,
            link: None,
            open: false,
            watchdog,
            handle,
        }
    }

    /// Transport over an already established byte stream (e.g. a pty or socket pair)
    pub fn from_stream<R, W>(name: impl Into<String>, reader: R, writer: W) -> BridgeResult<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let endpoint = name.into();
        let config = BridgeConfig::default();
        let watchdog = Watchdog::new(config.inactivity_threshold);
        let handle = watchdog.register_link(&endpoint);
        let link = Link::spawn(format!("uart_{}", endpoint), reader, writer, None)?;
        Ok(Self {
            endpoint,
            path: None,
            config,
            link: Some(link),
            open: true,
            watchdog,
            handle,
        })
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.watchdog = Watchdog::new(config.inactivity_threshold);
        self.handle = self.watchdog.register_link(&self.endpoint);
        self.config = config;
        self
    }

    pub fn with_response_timeout(self, timeout: Duration) -> Self {
        let config = self.config.with_response_timeout(timeout);
        self.with_config(config)
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }
}

impl Transport for UartTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&mut self) -> BridgeResult {
        if self.open {
            return Ok(());
        }
        if let Some(link) = self.link.as_mut() {
            let stale = link.drain();
            if !link.is_closed() {
                self.open = true;
                info!("UART bridge on {} reopened ({} stale bytes dropped)", self.endpoint, stale);
                return Ok(());
            }
            self.link = None;
        }
        let Some(path) = self.path.as_ref() else {
            return Err(BridgeError::Closed);
        };
        let connect_err = |source| BridgeError::Connection {
            endpoint: self.endpoint.clone(),
            source,
        };
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(connect_err)?;
        let reader = device.try_clone().map_err(connect_err)?;

        self.link = Some(Link::spawn(format!("uart_{}", self.endpoint), reader, device, None)?);
        self.open = true;
        info!("UART bridge opened on {}", self.endpoint);
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            info!("UART bridge on {} closed", self.endpoint);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn request(&mut self, request: &Request) -> BridgeResult<Response> {
        request.validate()?;
        let link = self
            .link
            .as_mut()
            .filter(|_| self.open)
            .ok_or(BridgeError::NotOpen)?;
        let _guard = OperationGuard::new(&self.handle);

        trace!("[{}] {:?}", self.endpoint, request);
        link.send(&encode(request))?;

        match request {
            Request::Write { .. } => Ok(Response::Written),
            Request::Read { address, count } => {
                let bytes = link.read_exact(4 * *count as usize, self.config.response_timeout, *address)?;
                Ok(Response::Read(decode_read(&bytes)))
            }
        }
    }

    fn drain(&mut self) -> usize {
        match self.link.as_mut().filter(|_| self.open) {
            Some(link) => link.drain(),
            None => 0,
        }
    }

    fn idle_for(&self) -> Duration {
        self.handle.idle_for()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Serial line fed by the test, one chunk per `send`
    struct FedLine(crossbeam_channel::Receiver<Vec<u8>>);

    impl Read for FedLine {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.recv() {
                Ok(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_encode_read_uses_word_address() {
        assert_eq!(
            encode(&Request::read(0x8200_0010, 3)),
            vec![CMD_READ, 3, 0x20, 0x80, 0x00, 0x04]
        );
    }

    #[test]
    fn test_encode_write() {
        assert_eq!(
            encode(&Request::write(0x8, vec![0x0102_0304])),
            vec![CMD_WRITE, 1, 0, 0, 0, 2, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_read_request_over_stream() {
        let out = SharedWriter::default();
        let reply = Cursor::new(vec![0, 0, 0, 0x2a, 0xff, 0xff, 0xff, 0xff]);
        let mut transport = UartTransport::from_stream("pty", reply, out.clone()).unwrap();

        let response = transport.request(&Request::read(0x100, 2)).unwrap();
        assert_eq!(response, Response::Read(vec![0x2a, 0xffff_ffff]));
        assert_eq!(*out.0.lock().unwrap(), vec![CMD_READ, 2, 0, 0, 0, 0x40]);
    }

    #[test]
    fn test_write_is_posted() {
        let out = SharedWriter::default();
        let mut transport = UartTransport::from_stream("pty", Cursor::new(Vec::new()), out.clone()).unwrap();
        assert_eq!(
            transport.request(&Request::write(0, vec![7])).unwrap(),
            Response::Written
        );
        assert_eq!(out.0.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_open_missing_device() {
        let mut transport = UartTransport::new("/nonexistent/ttyUSB99");
        assert!(matches!(transport.open(), Err(BridgeError::Connection { .. })));
    }

    #[test]
    fn test_reopen_reuses_reader_and_drops_stale_bytes() {
        let (line, rx) = crossbeam_channel::unbounded();
        let out = SharedWriter::default();
        let mut transport = UartTransport::from_stream("pty", FedLine(rx), out.clone()).unwrap();

        line.send(vec![0, 0, 0, 1]).unwrap();
        assert_eq!(
            transport.request(&Request::read(0, 1)).unwrap(),
            Response::Read(vec![1])
        );

        transport.close();
        assert!(!transport.is_open());
        assert!(matches!(
            transport.request(&Request::read(0, 1)),
            Err(BridgeError::NotOpen)
        ));

        // Late bytes from the device while the bridge is closed
        line.send(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        transport.open().unwrap();
        assert!(transport.is_open());
        line.send(vec![0, 0, 0, 2]).unwrap();
        assert_eq!(
            transport.request(&Request::read(4, 1)).unwrap(),
            Response::Read(vec![2])
        );
        assert_eq!(out.0.lock().unwrap().len(), 12);
    }

    #[test]
    fn test_reopen_after_stream_end_needs_a_device() {
        let mut transport =
            UartTransport::from_stream("pty", Cursor::new(Vec::new()), SharedWriter::default()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        transport.close();
        assert!(matches!(transport.open(), Err(BridgeError::Closed)));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_short_reply_is_not_a_valid_read() {
        let reply = Cursor::new(vec![0, 0]);
        let mut transport = UartTransport::from_stream("pty", reply, SharedWriter::default())
            .unwrap()
            .with_response_timeout(Duration::from_millis(50));
        assert!(transport.request(&Request::read(0, 1)).is_err());
    }
}
