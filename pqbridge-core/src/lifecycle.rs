//! Bridge lifecycle: start acquisition, run the publisher, stop in order
//!
//! The mailbox is shared between the acquisition thread and the publisher
//! through an `Arc`. `stop` joins the thread before releasing the mailbox, and
//! proves the release by reclaiming sole ownership of it.

use crate::acquisition::{
    AcquisitionConfig, AcquisitionExit, AcquisitionState, AcquisitionTask, StateCell,
};
use crate::mailbox::{FrameBuffer, MailboxStats};
use crate::metrics::Metrics;
use crate::publisher::{PublishSummary, PublishTask};
use crate::serial::SourceOpener;
use crate::session::BrokerSession;
use crate::shutdown::{ShutdownFlag, TerminationState};
use crate::{Error, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// What `stop` observed while tearing the bridge down
#[derive(Debug)]
pub struct StopReport {
    pub exit: AcquisitionExit,
    pub final_state: AcquisitionState,
    pub mailbox: MailboxStats,
}

/// A running bridge
pub struct Bridge {
    mailbox: Arc<FrameBuffer>,
    stop: ShutdownFlag,
    state: StateCell,
    handle: JoinHandle<AcquisitionExit>,
}

impl Bridge {
    /// Spawn the acquisition thread against `opener`
    ///
    /// An open failure is not an error here: the thread terminates on its own
    /// and the bridge stays idle until terminated.
    pub fn start<O: SourceOpener>(
        opener: O,
        config: AcquisitionConfig,
        termination: &TerminationState,
        metrics: Metrics,
    ) -> Result<Self> {
        let mailbox = Arc::new(FrameBuffer::new());
        let stop = termination.acquisition_stop_flag().clone();
        let state = StateCell::default();

        let task = AcquisitionTask::new(
            opener,
            Arc::clone(&mailbox),
            stop.clone(),
            state.clone(),
            metrics,
            config,
        );

        let handle = std::thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || task.run())?;

        debug!("Acquisition thread started");
        Ok(Self {
            mailbox,
            stop,
            state,
            handle,
        })
    }

    pub fn state(&self) -> AcquisitionState {
        self.state.get()
    }

    pub fn mailbox(&self) -> &FrameBuffer {
        &self.mailbox
    }

    /// Run the publish loop until `terminate` is set
    pub async fn run<S: BrokerSession>(
        &self,
        publisher: &mut PublishTask<S>,
        terminate: &ShutdownFlag,
    ) -> PublishSummary {
        publisher.run(&self.mailbox, terminate).await
    }

    /// Stop acquisition, join its thread and release the mailbox
    ///
    /// Blocks for at most one acquisition backoff period plus the time to
    /// close the device.
    pub fn stop(self) -> Result<StopReport> {
        info!("Stopping acquisition");
        self.stop.request();

        let exit = self
            .handle
            .join()
            .map_err(|_| Error::Internal("acquisition thread panicked".to_string()))?;

        let final_state = self.state.get();
        if final_state != AcquisitionState::Terminated {
            return Err(Error::Internal(format!(
                "acquisition thread exited in state {:?}",
                final_state
            )));
        }

        let mailbox = Arc::try_unwrap(self.mailbox)
            .map_err(|_| Error::Internal("mailbox still shared after join".to_string()))?;
        let stats = mailbox.stats();
        drop(mailbox);

        info!(
            "Acquisition stopped: {:?}, {} frame(s) stored, {} taken, {} overwritten",
            exit, stats.stored, stats.taken, stats.overwritten
        );
        Ok(StopReport {
            exit,
            final_state,
            mailbox: stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::ClientConnection;
    use crate::serial::mock::ScriptedOpener;
    use crate::session::mock::RecordingSession;
    use crate::session::QualityOfService;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    #[test]
    fn test_rapid_start_stop_cycles() {
        let opener = ScriptedOpener::default();
        let started = Instant::now();

        for _ in 0..100 {
            let termination = TerminationState::new();
            let bridge = Bridge::start(
                opener.clone(),
                AcquisitionConfig::default(),
                &termination,
                Metrics::new(),
            )
            .unwrap();
            let report = bridge.stop().unwrap();
            assert_eq!(report.final_state, AcquisitionState::Terminated);
            assert_eq!(report.exit, AcquisitionExit::Stopped);
        }

        assert_eq!(opener.opened.load(Ordering::SeqCst), 100);
        assert_eq!(opener.closed.load(Ordering::SeqCst), 100);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_open_failure_leaves_bridge_idle() {
        let opener = ScriptedOpener {
            fail_open: true,
            ..Default::default()
        };
        let termination = TerminationState::new();
        let bridge =
            Bridge::start(opener, AcquisitionConfig::default(), &termination, Metrics::new())
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while bridge.state() != AcquisitionState::Terminated {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!bridge.mailbox().has_fresh());

        let report = bridge.stop().unwrap();
        assert!(matches!(report.exit, AcquisitionExit::OpenFailed(_)));
        assert_eq!(report.mailbox.stored, 0);
    }

    #[test]
    fn test_stop_does_not_signal_terminate() {
        let termination = TerminationState::new();
        let bridge = Bridge::start(
            ScriptedOpener::default(),
            AcquisitionConfig::default(),
            &termination,
            Metrics::new(),
        )
        .unwrap();
        bridge.stop().unwrap();

        assert!(termination.acquisition_stop_flag().is_requested());
        assert!(!termination.terminate_requested());
    }

    #[tokio::test]
    async fn test_frame_flows_end_to_end() {
        let opener = ScriptedOpener::with_chunks(&[b"12.50,45.20\r\n"]);
        let termination = TerminationState::new();
        let metrics = Metrics::new();
        let bridge =
            Bridge::start(opener, AcquisitionConfig::default(), &termination, metrics.clone())
                .unwrap();

        let session = RecordingSession::default();
        let published = session.published.clone();
        let connection = ClientConnection::new(
            "ssl://broker:8883",
            "pqbridge-test",
            "test/topic",
            QualityOfService::AtLeastOnce,
            Duration::from_secs(1),
        );
        let mut publisher =
            PublishTask::new(session, connection, Duration::from_millis(5), metrics.clone());

        let terminate = termination.terminate_flag().clone();
        let watcher = {
            let published = published.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(5);
                while published.lock().is_empty() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                terminate.request();
            })
        };

        let summary = bridge.run(&mut publisher, termination.terminate_flag()).await;
        watcher.await.unwrap();
        let report = tokio::task::spawn_blocking(move || bridge.stop())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(published.lock()[0].payload.as_ref(), b"12.50,45.20");
        assert_eq!(report.mailbox.stored, 1);
        assert_eq!(report.mailbox.taken, 1);
        assert_eq!(metrics.frames_captured(), 1);
        assert_eq!(metrics.publishes_total(), 1);
    }
}
