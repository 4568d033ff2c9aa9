use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Job = BoxFuture<'static, ()>;

/// Runs operations off the UI thread on a fixed set of workers.
///
/// Work is queued in submission order; at most `workers` operations run at once.
/// There is no cancellation and no de-duplication of identical submissions.
#[derive(Clone)]
pub struct Dispatcher {
    queue: async_channel::Sender<Job>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (queue, rx) = async_channel::unbounded::<Job>();

        // Each worker owns a receiver clone; whichever is idle takes the next job.
        for id in 0..workers {
            let rx = rx.clone();
            tauri::async_runtime::spawn(async move {
                while let Ok(job) = rx.recv().await {
                    job.await;
                }
                log::debug!("dispatcher worker {id} stopping");
            });
        }

        Self { queue, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queues an async operation. The handle resolves exactly once.
    pub fn run<T, F>(&self, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let outcome = match std::panic::AssertUnwindSafe(op).catch_unwind().await {
                Ok(res) => res,
                Err(_) => Err(Error::Dispatch("operation panicked".to_string())),
            };
            let _ = tx.send(outcome);
        }
        .boxed();

        if self.queue.try_send(job).is_err() {
            log::error!("dispatcher queue is closed");
        }
        TaskHandle { rx }
    }

    /// Queues a blocking operation (file copy, extraction, process wait).
    pub fn run_blocking<T, F>(&self, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.run(async move {
            tauri::async_runtime::spawn_blocking(op)
                .await
                .map_err(|e| Error::Dispatch(e.to_string()))?
        })
    }
}

/// Completion side of a dispatched operation: either the value or the error, never both.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub async fn outcome(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::Dispatch("worker dropped the task".to_string()))?
    }
}

/// Enforces the one-generation-at-a-time rule.
#[derive(Default)]
pub struct JobSlot {
    busy: AtomicBool,
}

impl JobSlot {
    pub fn try_acquire(&self) -> Result<JobGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(JobGuard { slot: self })
    }
}

pub struct JobGuard<'a> {
    slot: &'a JobSlot,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_success_and_error_separately() {
        let dispatcher = Dispatcher::new(2);

        let ok = dispatcher.run(async { Ok(41 + 1) });
        let err = dispatcher.run(async { Err::<u32, _>(Error::NotFound("no such app".into())) });

        assert_eq!(ok.outcome().await.unwrap(), 42);
        match err.outcome().await {
            Err(Error::NotFound(msg)) => assert_eq!(msg, "no such app"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocking_work_runs_off_the_caller() {
        let dispatcher = Dispatcher::new(1);
        let caller = std::thread::current().id();
        let handle = dispatcher.run_blocking(move || Ok(std::thread::current().id() != caller));
        assert!(handle.outcome().await.unwrap());
    }

    #[tokio::test]
    async fn panics_become_dispatch_errors() {
        let dispatcher = Dispatcher::new(1);
        let handle = dispatcher.run(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(handle.outcome().await, Err(Error::Dispatch(_))));
    }

    #[tokio::test]
    async fn never_runs_more_than_the_worker_count() {
        let dispatcher = Dispatcher::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                dispatcher.run(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for h in handles {
            h.outcome().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn an_idle_worker_picks_up_work_while_another_is_busy() {
        let dispatcher = Dispatcher::new(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = dispatcher.run(async move {
            let _ = release_rx.await;
            Ok("slow")
        });
        let fast = dispatcher.run(async { Ok("fast") });

        let got = tokio::time::timeout(Duration::from_secs(5), fast.outcome())
            .await
            .expect("second worker stayed idle");
        assert_eq!(got.unwrap(), "fast");

        release_tx.send(()).unwrap();
        assert_eq!(slow.outcome().await.unwrap(), "slow");
    }

    #[test]
    fn job_slot_admits_one_job_at_a_time() {
        let slot = JobSlot::default();
        let guard = slot.try_acquire().unwrap();
        assert!(matches!(slot.try_acquire(), Err(Error::Busy)));
        drop(guard);
        assert!(slot.try_acquire().is_ok());
    }
}
