//! Byte link with deadline-bounded reads
//!
//! A [`Link`] wraps any blocking byte stream (TCP socket, serial device). A
//! dedicated reader thread pulls chunks off the stream and forwards them over a
//! crossbeam channel, so the request path can wait for a response with
//! `recv_timeout` instead of blocking forever on a wedged device.

use super::errors::{BridgeError, BridgeResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, unbounded};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// Message from the reader thread
enum Chunk {
    Data(Vec<u8>),
    Eof,
    Failed(std::io::Error),
}

/// Bidirectional byte link
pub struct Link {
    name: String,
    writer: Box<dyn Write + Send>,
    chunks: Receiver<Chunk>,
    pending: VecDeque<u8>,
    closed: bool,
    reader: Option<JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Link {
    /// Spawn the reader thread for `reader` and wrap `writer`.
    ///
    /// `on_close` runs when the link is closed and should unblock the reader
    /// (e.g. shut the socket down). Without one, the reader thread is detached
    /// and exits on the next read error or end of stream.
    pub fn spawn<R, W>(
        name: impl Into<String>,
        mut reader: R,
        writer: W,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> BridgeResult<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = unbounded();

        let thread_name = format!("link_{}", name);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            let _ = tx.send(Chunk::Eof);
                            break;
                        }
                        Ok(n) => {
                            if tx.send(Chunk::Data(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = tx.send(Chunk::Failed(e));
                            break;
                        }
                    }
                }
            })?;

        debug!("[{}] Link reader thread started", name);

        Ok(Self {
            name,
            writer: Box::new(writer),
            chunks: rx,
            pending: VecDeque::new(),
            closed: false,
            reader: Some(handle),
            on_close,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stream ended or failed; the link cannot carry further requests
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write a complete frame and flush it
    pub fn send(&mut self, frame: &[u8]) -> BridgeResult {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        trace!("[{}] tx {} bytes", self.name, frame.len());
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read exactly `len` bytes, failing with `Timeout` once `timeout` has elapsed.
    ///
    /// `address` is only used to label the timeout error.
    pub fn read_exact(&mut self, len: usize, timeout: Duration, address: u32) -> BridgeResult<Vec<u8>> {
        let started = Instant::now();
        let deadline = started + timeout;

        while self.pending.len() < len {
            if self.closed {
                return Err(BridgeError::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.chunks.recv_timeout(remaining) {
                Ok(chunk) => self.accept(chunk)?,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BridgeError::Timeout {
                        address,
                        elapsed: started.elapsed(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                    return Err(BridgeError::Closed);
                }
            }
        }

        trace!("[{}] rx {} bytes", self.name, len);
        Ok(self.pending.drain(..len).collect())
    }

    /// Discard everything received so far; returns the number of bytes dropped
    pub fn drain(&mut self) -> usize {
        let mut dropped = self.pending.len();
        self.pending.clear();
        loop {
            match self.chunks.try_recv() {
                Ok(Chunk::Data(data)) => dropped += data.len(),
                Ok(Chunk::Eof) | Ok(Chunk::Failed(_)) | Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        if dropped > 0 {
            debug!("[{}] Drained {} stale bytes", self.name, dropped);
        }
        dropped
    }

    fn accept(&mut self, chunk: Chunk) -> BridgeResult {
        match chunk {
            Chunk::Data(data) => {
                self.pending.extend(data);
                Ok(())
            }
            Chunk::Eof => {
                self.closed = true;
                Err(BridgeError::Closed)
            }
            Chunk::Failed(e) => {
                self.closed = true;
                Err(BridgeError::Io(e))
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        if let Some(on_close) = self.on_close.take() {
            on_close();
            if let Some(handle) = self.reader.take() {
                let _ = handle.join();
            }
        }
        debug!("[{}] Link closed", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Writer that keeps everything written, shared with the test
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

    /// Reader that never returns
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_secs(3600));
            Ok(0)
        }
    }

    #[test]
    fn test_send_and_read_exact() {
        let out = SharedWriter::default();
        let mut link = Link::spawn("test", Cursor::new(vec![1, 2, 3, 4, 5]), out.clone(), None).unwrap();

        link.send(&[0xAA, 0xBB]).unwrap();
        assert_eq!(*out.0.lock().unwrap(), vec![0xAA, 0xBB]);

        assert_eq!(link.read_exact(2, Duration::from_secs(1), 0).unwrap(), vec![1, 2]);
        assert_eq!(link.read_exact(3, Duration::from_secs(1), 0).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_read_past_eof_reports_closed() {
        let mut link = Link::spawn("test", Cursor::new(vec![1]), SharedWriter::default(), None).unwrap();
        assert!(matches!(
            link.read_exact(2, Duration::from_secs(1), 0),
            Err(BridgeError::Closed)
        ));
        assert!(matches!(link.send(&[0]), Err(BridgeError::Closed)));
    }

    #[test]
    fn test_read_times_out() {
        let mut link = Link::spawn("test", Stalled, SharedWriter::default(), None).unwrap();
        let started = Instant::now();
        match link.read_exact(4, Duration::from_millis(30), 0x1234) {
            Err(BridgeError::Timeout { address, .. }) => assert_eq!(address, 0x1234),
            other => panic!("Expected Timeout, got {:?}", other.map(|_| ())),
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_drain_discards_pending() {
        let mut link = Link::spawn("test", Cursor::new(vec![9, 9, 9]), SharedWriter::default(), None).unwrap();
        // Let the reader thread deliver the bytes
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(link.drain(), 3);
    }
}
