//! Cooperative shutdown flags
//!
//! The publisher and the acquisition thread stop on different triggers, so
//! they observe different flags: the publisher watches `terminate`, set from
//! the interrupt handler, and the acquisition thread watches
//! `acquisition_stop`, set by the bridge once the publisher has exited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-way, shareable stop flag
///
/// Setting it is idempotent. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// The underlying atomic, for registration with an OS signal handler
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner)
    }
}

/// Termination state shared by the bridge
#[derive(Debug, Clone, Default)]
pub struct TerminationState {
    terminate: ShutdownFlag,
    acquisition_stop: ShutdownFlag,
}

impl TerminationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the interrupt handler does: set the terminate flag and nothing else
    pub fn request_terminate(&self) {
        self.terminate.request();
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate.is_requested()
    }

    pub fn terminate_flag(&self) -> &ShutdownFlag {
        &self.terminate
    }

    pub fn acquisition_stop_flag(&self) -> &ShutdownFlag {
        &self.acquisition_stop
    }
}
