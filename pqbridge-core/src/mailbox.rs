//! Single-slot frame mailbox with last-writer-wins semantics
//!
//! The acquisition thread stores every captured frame here and the publisher
//! takes whatever is present. There is no queue: storing over an unconsumed
//! frame replaces it, so a slow publisher only ever sees the newest reading.

use crate::frame::SensorFrame;
use parking_lot::Mutex;
use tracing::debug;

/// Thread-safe single-slot hand-off between one producer and one consumer
///
/// The slot being `Some` is the "fresh frame" flag; both are updated under the
/// same lock, so a frame can never be observed twice or lost between a check
/// and a take.
#[derive(Default)]
pub struct FrameBuffer {
    inner: Mutex<MailboxInner>,
}

#[derive(Default)]
struct MailboxInner {
    slot: Option<SensorFrame>,
    stats: MailboxStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub stored: u64,
    pub taken: u64,
    pub overwritten: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a frame, replacing any unconsumed one
    ///
    /// Returns true if an unconsumed frame was dropped.
    pub fn store(&self, frame: SensorFrame) -> bool {
        let mut inner = self.inner.lock();
        inner.stats.stored += 1;
        let dropped = inner.slot.replace(frame);
        if let Some(old) = &dropped {
            inner.stats.overwritten += 1;
            debug!("Frame #{} overwritten before it was published", old.sequence());
        }
        dropped.is_some()
    }

    /// Take the pending frame, if any
    pub fn try_take(&self) -> Option<SensorFrame> {
        let mut inner = self.inner.lock();
        let frame = inner.slot.take()?;
        inner.stats.taken += 1;
        Some(frame)
    }

    /// Check whether a fresh frame is waiting
    pub fn has_fresh(&self) -> bool {
        self.inner.lock().slot.is_some()
    }

    pub fn stats(&self) -> MailboxStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_store_take() {
        let mailbox = FrameBuffer::new();
        assert!(mailbox.try_take().is_none());

        assert!(!mailbox.store(SensorFrame::new(0, b"12.50,45.20\0")));
        assert!(mailbox.has_fresh());

        let frame = mailbox.try_take().unwrap();
        assert_eq!(frame.payload(), b"12.50,45.20");
        assert!(!mailbox.has_fresh());
        assert!(mailbox.try_take().is_none());
    }

    #[test]
    fn test_overwrite_keeps_newest() {
        let mailbox = FrameBuffer::new();
        mailbox.store(SensorFrame::new(0, b"A"));
        assert!(mailbox.store(SensorFrame::new(1, b"B")));

        let frame = mailbox.try_take().unwrap();
        assert_eq!(frame.payload(), b"B");
        assert_eq!(frame.sequence(), 1);
        assert!(mailbox.try_take().is_none());

        let stats = mailbox.stats();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.taken, 1);
        assert_eq!(stats.overwritten, 1);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let mailbox = Arc::new(FrameBuffer::new());
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                for seq in 0..10_000u64 {
                    mailbox.store(SensorFrame::new(seq, seq.to_string().as_bytes()));
                }
            })
        };

        let mut seen = Vec::new();
        while !producer.is_finished() {
            if let Some(frame) = mailbox.try_take() {
                seen.push(frame.sequence());
            }
        }
        producer.join().unwrap();
        if let Some(frame) = mailbox.try_take() {
            seen.push(frame.sequence());
        }

        // Newest-wins: sequences observed by the consumer only ever increase
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(9_999));

        let stats = mailbox.stats();
        assert_eq!(stats.stored, 10_000);
        assert_eq!(stats.taken as usize, seen.len());
        assert_eq!(stats.taken + stats.overwritten, stats.stored);
    }

    proptest! {
        #[test]
        fn prop_no_duplication(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let mailbox = FrameBuffer::new();
            let mut next_seq = 0u64;
            let mut last_stored: Option<u64> = None;
            let mut taken = HashSet::new();

            for is_store in ops {
                if is_store {
                    let raw = format!("{:013}", next_seq);
                    mailbox.store(SensorFrame::new(next_seq, raw.as_bytes()));
                    last_stored = Some(next_seq);
                    next_seq += 1;
                } else {
                    match mailbox.try_take() {
                        Some(frame) => {
                            // Exactly the bytes of the most recent store
                            prop_assert_eq!(Some(frame.sequence()), last_stored);
                            let expected = format!("{:013}", frame.sequence());
                            prop_assert_eq!(frame.payload(), expected.as_bytes());
                            prop_assert!(taken.insert(frame.sequence()));
                            last_stored = None;
                        }
                        None => prop_assert!(last_stored.is_none()),
                    }
                }
            }
        }
    }
}
