//! Per-channel serialized job queue.
use tokio::sync::{mpsc, oneshot};

use crate::error::ConnectError;

type Job = Box<dyn FnOnce() + Send>;

/// Handle used to schedule work onto a channel's event loop from any context.
#[derive(Clone)]
pub struct ChannelHandle {
    jobs: mpsc::UnboundedSender<Job>,
}

impl ChannelHandle {
    /// Queues `job` behind everything already scheduled on this channel.
    pub fn execute<F>(&self, job: F) -> Result<(), ConnectError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs
            .send(Box::new(job))
            .map_err(|_| ConnectError::ChannelClosed)
    }

    /// Resolves once every job queued before this call has run.
    pub async fn sync(&self) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| ConnectError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Runs the jobs of a single channel one after another.
pub struct EventLoop {
    jobs: mpsc::UnboundedReceiver<Job>,
}

impl EventLoop {
    pub fn new() -> (Self, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { jobs: rx }, ChannelHandle { jobs: tx })
    }

    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            job();
        }
        tracing::trace!("channel event loop finished");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let (event_loop, handle) = EventLoop::new();
        tokio::spawn(event_loop.run());

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = seen.clone();
            handle.execute(move || seen.lock().push(i)).unwrap();
        }
        handle.sync().await.unwrap();
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn execute_after_shutdown_fails() {
        let (event_loop, handle) = EventLoop::new();
        drop(event_loop);
        assert!(matches!(
            handle.execute(|| {}),
            Err(ConnectError::ChannelClosed)
        ));
        assert!(handle.is_closed());
    }
}
