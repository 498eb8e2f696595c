//! Frame sources
//!
//! The acquisition thread talks to the peripheral through [`FrameSource`],
//! opened lazily by a [`SourceOpener`] on the acquisition thread itself. The
//! production implementation wraps a `serialport` handle; tests plug in
//! scripted sources.

use crate::Result;
use serialport::{ClearBuffer, SerialPort};
use std::io::Read;
use std::time::Duration;
use tracing::debug;

/// A device that produces framed readings
pub trait FrameSource: Send {
    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read exactly `buf.len()` bytes; only called once they are available
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Discard any unread input
    fn flush(&mut self) -> Result<()>;
}

/// Opens a frame source; called once on the acquisition thread
pub trait SourceOpener: Send + 'static {
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn FrameSource>>;
}

/// Serial port settings for the peripheral
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    /// Timeout for reads of bytes already reported as available
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl SourceOpener for SerialSettings {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }

    fn open(&self) -> Result<Box<dyn FrameSource>> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(self.read_timeout)
            .open()?;
        debug!("Opened serial device {}", self.path);
        Ok(Box::new(SerialFrameSource { port }))
    }
}

/// `serialport`-backed frame source; the port closes on drop
pub struct SerialFrameSource {
    port: Box<dyn SerialPort>,
}

impl FrameSource for SerialFrameSource {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted frame sources for tests

    use super::*;
    use crate::Error;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Source that yields queued chunks, one per poll, then stays idle
    pub struct ScriptedSource {
        chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pending: Vec<u8>,
        fail_reads: bool,
        pub(crate) closed: Arc<AtomicUsize>,
    }

    impl FrameSource for ScriptedSource {
        fn bytes_available(&mut self) -> Result<usize> {
            if self.pending.is_empty() {
                if let Some(chunk) = self.chunks.lock().pop_front() {
                    self.pending = chunk;
                }
            }
            Ok(self.pending.len())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            if self.fail_reads {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device unplugged",
                )));
            }
            if self.pending.len() < buf.len() {
                return Err(Error::Internal("read past available bytes".into()));
            }
            let rest = self.pending.split_off(buf.len());
            buf.copy_from_slice(&self.pending);
            self.pending = rest;
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.pending.clear();
            Ok(())
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opener handing out a [`ScriptedSource`] fed from a shared queue
    #[derive(Clone, Default)]
    pub struct ScriptedOpener {
        pub chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub closed: Arc<AtomicUsize>,
        pub opened: Arc<AtomicUsize>,
        pub fail_open: bool,
        pub fail_reads: bool,
    }

    impl ScriptedOpener {
        pub fn with_chunks(chunks: &[&[u8]]) -> Self {
            let opener = Self::default();
            opener
                .chunks
                .lock()
                .extend(chunks.iter().map(|c| c.to_vec()));
            opener
        }

        pub fn push(&self, chunk: &[u8]) {
            self.chunks.lock().push_back(chunk.to_vec());
        }
    }

    impl SourceOpener for ScriptedOpener {
        fn describe(&self) -> String {
            "scripted source".to_string()
        }

        fn open(&self) -> Result<Box<dyn FrameSource>> {
            if self.fail_open {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such device",
                )));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                chunks: Arc::clone(&self.chunks),
                pending: Vec::new(),
                fail_reads: self.fail_reads,
                closed: Arc::clone(&self.closed),
            }))
        }
    }
}
