//! Etherbone framing over TCP
//!
//! The bridge server on the host side of the board (USB-serial or Ethernet)
//! accepts Etherbone packets over a TCP stream. Every packet carries a single
//! record: either a write block (base address + data words) or a read block
//! (return address + one address per word). Reads are answered with a packet
//! whose record holds the data as a write block; writes are posted.
//!
//! ## Wire format (all fields big-endian)
//!
//! ```text
//! packet header  4E 6F | 10 | 44 | 00 00 00 00      magic, version 1, 32-bit addr/port
//! record header  flags | 0F | wcount | rcount
//! write block    base_addr:u32, data:u32 * wcount
//! read block     base_ret_addr:u32, addr:u32 * rcount
//! ```

use super::errors::{BridgeError, BridgeResult};
use super::link::Link;
use super::watchdog::{OperationGuard, Watchdog, WatchdogHandle};
use super::{Request, Response, Transport};
use crate::config::BridgeConfig;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, info, trace};

pub const MAGIC: u16 = 0x4e6f;
const VERSION_FLAGS: u8 = 0x10;
const ADDR_PORT_SIZE: u8 = 0x44;
const BYTE_ENABLE: u8 = 0x0f;

pub const PACKET_HEADER_LEN: usize = 8;
pub const RECORD_HEADER_LEN: usize = 4;

/// Default bridge server endpoint
pub const DEFAULT_ENDPOINT: &str = "localhost:1234";

/// One decoded Etherbone record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Writes { base_address: u32, data: Vec<u32> },
    Reads { return_address: u32, addresses: Vec<u32> },
}

/// Encode a bus request as a single-record packet
pub fn encode(request: &Request) -> Vec<u8> {
    let record = match request {
        Request::Read { address, count } => Record::Reads {
            return_address: 0,
            addresses: (0..*count as u32).map(|i| address + 4 * i).collect(),
        },
        Request::Write { address, data } => Record::Writes {
            base_address: *address,
            data: data.clone(),
        },
    };
    encode_record(&record)
}

pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_HEADER_LEN + RECORD_HEADER_LEN + 4 * 256);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.push(VERSION_FLAGS);
    out.push(ADDR_PORT_SIZE);
    out.extend_from_slice(&[0; 4]);

    match record {
        Record::Writes { base_address, data } => {
            out.extend_from_slice(&[0, BYTE_ENABLE, data.len() as u8, 0]);
            out.extend_from_slice(&base_address.to_be_bytes());
            for word in data {
                out.extend_from_slice(&word.to_be_bytes());
            }
        }
        Record::Reads {
            return_address,
            addresses,
        } => {
            out.extend_from_slice(&[0, BYTE_ENABLE, 0, addresses.len() as u8]);
            out.extend_from_slice(&return_address.to_be_bytes());
            for addr in addresses {
                out.extend_from_slice(&addr.to_be_bytes());
            }
        }
    }
    out
}

/// Validate the 12 leading bytes of a packet; returns `(wcount, rcount)`
pub fn decode_headers(bytes: &[u8]) -> BridgeResult<(usize, usize)> {
    if bytes.len() < PACKET_HEADER_LEN + RECORD_HEADER_LEN {
        return Err(BridgeError::Protocol(format!(
            "short Etherbone header ({} bytes)",
            bytes.len()
        )));
    }
    let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
    if magic != MAGIC {
        return Err(BridgeError::Protocol(format!(
            "bad Etherbone magic 0x{:04x}",
            magic
        )));
    }
    if bytes[2] >> 4 != 1 {
        return Err(BridgeError::Protocol(format!(
            "unsupported Etherbone version {}",
            bytes[2] >> 4
        )));
    }
    let record = &bytes[PACKET_HEADER_LEN..];
    Ok((record[2] as usize, record[3] as usize))
}

/// Decode a complete single-record packet
pub fn decode(bytes: &[u8]) -> BridgeResult<Record> {
    let (wcount, rcount) = decode_headers(bytes)?;
    let body = &bytes[PACKET_HEADER_LEN + RECORD_HEADER_LEN..];
    let words: Vec<u32> = body
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    match (wcount, rcount) {
        (w, 0) if w > 0 && words.len() == w + 1 => Ok(Record::Writes {
            base_address: words[0],
            data: words[1..].to_vec(),
        }),
        (0, r) if r > 0 && words.len() == r + 1 => Ok(Record::Reads {
            return_address: words[0],
            addresses: words[1..].to_vec(),
        }),
        _ => Err(BridgeError::Protocol(format!(
            "unexpected record shape: wcount={}, rcount={}, {} body words",
            wcount,
            rcount,
            words.len()
        ))),
    }
}

/// Etherbone transport over a TCP connection to the bridge server
pub struct EtherboneTransport {
    endpoint: String,
    config: BridgeConfig,
    link: Option<Link>,
    watchdog: Watchdog,
    handle: WatchdogHandle,
}

impl EtherboneTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let config = BridgeConfig::default();
        let watchdog = Watchdog::new(config.inactivity_threshold);
        let handle = watchdog.register_link(&endpoint);
        Self {
            endpoint,
            config,
            link: None,
            watchdog,
            handle,
        }
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

    /// Watchdog for this link (call `start_monitoring_thread` to get wedge warnings)
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }
}

impl Transport for EtherboneTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&mut self) -> BridgeResult {
        if self.link.is_some() {
            return Ok(());
        }
        let connect_err = |source| BridgeError::Connection {
            endpoint: self.endpoint.clone(),
            source,
        };
        let stream = TcpStream::connect(&self.endpoint).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        let reader = stream.try_clone().map_err(connect_err)?;
        let writer = stream.try_clone().map_err(connect_err)?;

        let link = Link::spawn(
            format!("etherbone_{}", self.endpoint),
            reader,
            writer,
            Some(Box::new(move || {
                let _ = stream.shutdown(Shutdown::Both);
            })),
        )?;
        self.link = Some(link);

        info!("Etherbone bridge connected to {}", self.endpoint);
        Ok(())
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("Etherbone bridge to {} closed", self.endpoint);
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn request(&mut self, request: &Request) -> BridgeResult<Response> {
        request.validate()?;
        let link = self.link.as_mut().ok_or(BridgeError::NotOpen)?;
        let _guard = OperationGuard::new(&self.handle);

        trace!("[{}] {:?}", self.endpoint, request);
        link.send(&encode(request))?;

        let Request::Read { address, count } = request else {
            return Ok(Response::Written);
        };

        let timeout = self.config.response_timeout;
        let mut packet = link.read_exact(PACKET_HEADER_LEN + RECORD_HEADER_LEN, timeout, *address)?;
        let (wcount, rcount) = decode_headers(&packet)?;
        if wcount != *count as usize || rcount != 0 {
            return Err(BridgeError::Protocol(format!(
                "read of {} words at 0x{:08x} answered with wcount={}, rcount={}",
                count, address, wcount, rcount
            )));
        }
        packet.extend(link.read_exact(4 * (wcount + 1), timeout, *address)?);

        match decode(&packet)? {
            Record::Writes { data, .. } => Ok(Response::Read(data)),
            Record::Reads { .. } => Err(BridgeError::Protocol(
                "read block in reply to a read".to_string(),
            )),
        }
    }

    fn drain(&mut self) -> usize {
        match self.link.as_mut() {
            Some(link) => link.drain(),
            None => 0,
        }
    }

    fn idle_for(&self) -> Duration {
        self.handle.idle_for()
    }
}

impl Drop for EtherboneTransport {
    fn drop(&mut self) {
        debug!("Dropping Etherbone transport to {}", self.endpoint);
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_encode_read() {
        let bytes = encode(&Request::read(0x8000_1000, 2));
        assert_eq!(
            bytes,
            vec![
                0x4e, 0x6f, 0x10, 0x44, 0, 0, 0, 0, // packet header
                0x00, 0x0f, 0x00, 0x02, // record header
                0, 0, 0, 0, // return address
                0x80, 0x00, 0x10, 0x00, // addr 0
                0x80, 0x00, 0x10, 0x04, // addr 1
            ]
        );
    }

    #[test]
    fn test_encode_write_decodes_back() {
        let bytes = encode(&Request::write(0x40, vec![0xdead_beef, 1]));
        assert_eq!(
            decode(&bytes).unwrap(),
            Record::Writes {
                base_address: 0x40,
                data: vec![0xdead_beef, 1]
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = encode(&Request::read(0, 1));
        bytes[0] = 0x12;
        assert!(matches!(decode(&bytes), Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let mut bytes = encode(&Request::write(0, vec![1, 2, 3]));
        bytes.truncate(bytes.len() - 4);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_open_unreachable_endpoint() {
        // Bind then drop to get a port nothing is listening on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut transport = EtherboneTransport::new(format!("127.0.0.1:{}", port));
        assert!(matches!(transport.open(), Err(BridgeError::Connection { .. })));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_request_without_open() {
        let mut transport = EtherboneTransport::new(DEFAULT_ENDPOINT);
        assert!(matches!(
            transport.request(&Request::read(0, 1)),
            Err(BridgeError::NotOpen)
        ));
    }

    #[test]
    fn test_read_round_trip_against_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut req = vec![0u8; 8 + 4 + 4 + 4];
            sock.read_exact(&mut req).unwrap();
            let Record::Reads { addresses, .. } = decode(&req).unwrap() else {
                panic!("expected a read record");
            };
            let reply = encode_record(&Record::Writes {
                base_address: 0,
                data: addresses.iter().map(|a| a ^ 0xffff_ffff).collect(),
            });
            sock.write_all(&reply).unwrap();
        });

        let mut transport = EtherboneTransport::new(addr.to_string());
        transport.open().unwrap();
        let response = transport.request(&Request::read(0x10, 1)).unwrap();
        assert_eq!(response, Response::Read(vec![0xffff_ffef]));
        server.join().unwrap();
    }

    #[test]
    fn test_read_times_out_when_server_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(200));
            drop(sock);
        });

        let mut transport =
            EtherboneTransport::new(addr.to_string()).with_response_timeout(Duration::from_millis(50));
        transport.open().unwrap();
        assert!(matches!(
            transport.request(&Request::read(0x20, 1)),
            Err(BridgeError::Timeout { address: 0x20, .. })
        ));
        transport.close();
        server.join().unwrap();
    }
}
