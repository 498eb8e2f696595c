//! Acquisition thread: device → mailbox
//!
//! Runs `Opening → Polling → Closing → Terminated` on a dedicated OS thread.
//! The device is polled for available bytes and only read once a whole frame
//! is buffered, so the stop flag is checked at least once per backoff period
//! and never behind a blocking read.

use crate::backoff::IdleBackoff;
use crate::frame::SensorFrame;
use crate::mailbox::FrameBuffer;
use crate::metrics::Metrics;
use crate::serial::{FrameSource, SourceOpener};
use crate::shutdown::ShutdownFlag;
use crate::FRAME_PAYLOAD_LEN;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Acquisition thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    Opening = 0,
    Polling = 1,
    Closing = 2,
    Terminated = 3,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Polling,
            2 => Self::Closing,
            _ => Self::Terminated,
        }
    }
}

/// Observable state cell shared with the bridge
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(AcquisitionState::Opening as u8)))
    }
}

impl StateCell {
    pub fn get(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: AcquisitionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Acquisition tuning
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub backoff: IdleBackoff,
    /// Close the device after this many consecutive read errors (0 = never)
    pub max_read_errors: u32,
    /// Discard unread input after each frame
    pub flush_after_frame: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            backoff: IdleBackoff::default(),
            max_read_errors: 10,
            flush_after_frame: true,
        }
    }
}

/// Why the acquisition thread reached `Terminated`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionExit {
    /// Stop flag observed
    Stopped,
    /// Device could not be opened
    OpenFailed(String),
    /// Too many consecutive read errors
    DeviceFailed(String),
}

/// The producer side of the bridge
pub struct AcquisitionTask<O: SourceOpener> {
    opener: O,
    mailbox: Arc<FrameBuffer>,
    stop: ShutdownFlag,
    state: StateCell,
    metrics: Metrics,
    config: AcquisitionConfig,
    sequence: u64,
}

impl<O: SourceOpener> AcquisitionTask<O> {
    pub fn new(
        opener: O,
        mailbox: Arc<FrameBuffer>,
        stop: ShutdownFlag,
        state: StateCell,
        metrics: Metrics,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            opener,
            mailbox,
            stop,
            state,
            metrics,
            config,
            sequence: 0,
        }
    }

    /// Run the state machine to completion on the current thread
    pub fn run(mut self) -> AcquisitionExit {
        self.state.set(AcquisitionState::Opening);
        info!("Connecting to sensor on {}", self.opener.describe());

        let exit = match self.opener.open() {
            Ok(source) => {
                self.state.set(AcquisitionState::Polling);
                self.poll(source)
            }
            Err(e) => {
                error!("Unable to open serial device: {}", e);
                AcquisitionExit::OpenFailed(e.to_string())
            }
        };

        self.state.set(AcquisitionState::Terminated);
        info!("Finishing acquisition thread ({:?})", exit);
        exit
    }

    fn poll(&mut self, mut source: Box<dyn FrameSource>) -> AcquisitionExit {
        if let Err(e) = source.flush() {
            warn!("Initial flush failed: {}", e);
        }

        let mut backoff = self.config.backoff.clone();
        let mut consecutive_errors = 0u32;

        let exit = loop {
            match self.poll_once(source.as_mut()) {
                Ok(true) => {
                    consecutive_errors = 0;
                    backoff.reset();
                }
                Ok(false) => {
                    if self.stop.is_requested() {
                        break AcquisitionExit::Stopped;
                    }
                    backoff.sleep();
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.metrics.record_read_error();
                    warn!("Serial read failed ({} in a row): {}", consecutive_errors, e);
                    if self.config.max_read_errors > 0
                        && consecutive_errors >= self.config.max_read_errors
                    {
                        break AcquisitionExit::DeviceFailed(e.to_string());
                    }
                    backoff.sleep();
                }
            }

            if self.stop.is_requested() {
                break AcquisitionExit::Stopped;
            }
        };

        self.state.set(AcquisitionState::Closing);
        drop(source);
        debug!("Serial device closed");
        exit
    }

    /// Read one frame if a whole one is buffered; returns whether a frame was stored
    fn poll_once(&mut self, source: &mut dyn FrameSource) -> crate::Result<bool> {
        if source.bytes_available()? < FRAME_PAYLOAD_LEN {
            return Ok(false);
        }

        let mut raw = [0u8; FRAME_PAYLOAD_LEN];
        source.read_exact(&mut raw)?;
        if self.config.flush_after_frame {
            source.flush()?;
        }

        let frame = SensorFrame::new(self.sequence, &raw);
        self.sequence += 1;
        debug!(
            "Captured frame #{}: {}",
            frame.sequence(),
            String::from_utf8_lossy(frame.payload())
        );

        self.metrics.record_capture();
        if self.mailbox.store(frame) {
            self.metrics.record_overwrite();
        }
        Ok(true)
    }
}
