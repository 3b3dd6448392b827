//! Shared bookkeeping for one orchestrator run

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use st_core::error::SessionError;

/// Outcome of one device session
#[derive(Debug)]
pub struct SessionResult {
    /// Local device path
    pub device: String,
    /// Failure, if the session did not end cleanly
    pub error: Option<SessionError>,
}

/// First-error slot and outstanding-task counter shared by a run's tasks
#[derive(Debug, Default)]
pub struct RunResults {
    first_error: Mutex<Option<SessionError>>,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl RunResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new task as outstanding until the returned guard drops
    pub fn start(self: &Arc<Self>) -> TaskGuard {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            results: Arc::clone(self),
        }
    }

    /// Record a finished session. Only the first error is kept.
    pub fn record(&self, result: SessionResult) {
        let Some(error) = result.error else {
            tracing::debug!("{}: session finished cleanly", result.device);
            return;
        };

        let mut slot = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        } else {
            tracing::debug!("{}: additional session error: {}", result.device, error);
        }
    }

    /// Number of tasks still running
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Resolves once no task is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Take the first recorded error
    pub fn take_error(&self) -> Option<SessionError> {
        self.first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Decrements the outstanding counter on drop, including during a panic
#[derive(Debug)]
pub struct TaskGuard {
    results: Arc<RunResults>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.results.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.results.idle.notify_waiters();
        }
    }
}
