// ── Serial executor ──
//
// One task draining an unbounded job queue in submission order. Each
// session owns one, so deliveries within a session keep their order while
// sessions run independently of each other.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Ordered job queue backed by a single tokio task. Cheap to clone.
#[derive(Clone)]
pub struct SerialExecutor {
    name: Arc<str>,
    jobs: mpsc::UnboundedSender<Job>,
    disposed: Arc<AtomicBool>,
}

impl SerialExecutor {
    /// Spawn the draining task on the current runtime.
    pub fn spawn(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let disposed = Arc::new(AtomicBool::new(false));

        let task_name = Arc::clone(&name);
        let task_disposed = Arc::clone(&disposed);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if task_disposed.load(Ordering::Acquire) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!(executor = %task_name, "job panicked");
                }
            }
            debug!(executor = %task_name, "executor drained");
        });

        Self {
            name,
            jobs,
            disposed,
        }
    }

    /// Queue a job. After [`dispose`](Self::dispose) this is a no-op.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            return;
        }
        // The receiver only goes away with the runtime.
        let _ = self.jobs.send(Box::new(job));
    }

    /// Wait until every job submitted before this call has run or been
    /// dropped.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Stop running jobs. Queued and future jobs are dropped. Idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!(executor = %self.name, "executor disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let executor = SerialExecutor::spawn("order");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            executor.submit(move || seen.lock().push(i));
        }
        executor.flush().await;

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_queue() {
        let executor = SerialExecutor::spawn("panics");
        let ran = Arc::new(AtomicBool::new(false));

        executor.submit(|| panic!("job failure"));
        let flag = Arc::clone(&ran);
        executor.submit(move || flag.store(true, Ordering::SeqCst));
        executor.flush().await;

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn submit_after_dispose_is_a_no_op() {
        let executor = SerialExecutor::spawn("disposed");
        executor.dispose();
        executor.dispose();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        executor.submit(move || flag.store(true, Ordering::SeqCst));
        executor.flush().await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(executor.is_disposed());
    }
}
