//! Asynchronous compilation scheduler
//!
//! Two fixed pools of worker threads: one for initial/normal compiles, one
//! for low-priority speculative "optimized" recompiles, so background
//! optimization never delays a compile the renderer is about to wait on.
//! Every job carries a one-shot fence that signals on completion whether
//! the compile succeeded, failed, or was cancelled before starting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::fence::Fence;

struct CompileJob {
    run: Box<dyn FnOnce() + Send>,
    fence: Arc<Fence>,
    cancelled: Arc<AtomicBool>,
}

/// Handle to a submitted job: wait on it or cancel it at teardown.
#[derive(Clone)]
pub struct JobHandle {
    fence: Arc<Fence>,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    /// Best-effort cancellation: a job that has not started yet is dropped
    /// (its fence still signals); a running job finishes naturally and the
    /// caller must still wait for it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn wait(&self) {
        self.fence.wait();
    }

    pub fn is_finished(&self) -> bool {
        self.fence.signaled()
    }
}

struct WorkerPool {
    tx: Option<Sender<CompileJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<CompileJob>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || worker_loop(&rx))
                    .expect("failed to spawn compiler thread")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    fn submit(&self, fence: Arc<Fence>, run: Box<dyn FnOnce() + Send>) -> JobHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = JobHandle {
            fence: fence.clone(),
            cancelled: cancelled.clone(),
        };

        let job = CompileJob {
            run,
            fence,
            cancelled,
        };
        // The receiver lives as long as the pool; send can only fail after
        // shutdown has begun, in which case the fence must still signal.
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                handle.fence.signal();
            }
        }
        handle
    }
}

fn worker_loop(rx: &Mutex<Receiver<CompileJob>>) {
    loop {
        let job = {
            let rx = rx.lock();
            rx.recv()
        };
        let Ok(job) = job else {
            break; // queue shut down
        };

        if job.cancelled.load(Ordering::Acquire) {
            tracing::debug!("dropping cancelled compile job");
        } else {
            (job.run)();
        }
        // Idempotent: jobs that record their outcome signal it themselves.
        job.fence.signal();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// The two-priority compilation queue shared by all shader programs.
pub struct CompileQueue {
    normal: WorkerPool,
    low_priority: WorkerPool,
    sync_compile: bool,
}

impl CompileQueue {
    /// `sync_compile` makes `submit` block until the job completes, for
    /// deterministic testing and debugging.
    pub fn new(normal_threads: usize, low_priority_threads: usize, sync_compile: bool) -> Self {
        Self {
            normal: WorkerPool::new("shader-compile", normal_threads),
            low_priority: WorkerPool::new("shader-compile-lowp", low_priority_threads),
            sync_compile,
        }
    }

    /// Enqueue a normal-priority compile. In synchronous mode the calling
    /// thread blocks until the fence signals.
    pub fn submit(&self, fence: Arc<Fence>, run: impl FnOnce() + Send + 'static) -> JobHandle {
        let handle = self.normal.submit(fence, Box::new(run));
        if self.sync_compile {
            handle.wait();
        }
        handle
    }

    /// Enqueue a speculative optimized-variant compile. Always
    /// asynchronous, even in synchronous mode; callers that need
    /// determinism wait on the fence themselves.
    pub fn submit_low_priority(
        &self,
        fence: Arc<Fence>,
        run: impl FnOnce() + Send + 'static,
    ) -> JobHandle {
        self.low_priority.submit(fence, Box::new(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_and_signal() {
        let queue = CompileQueue::new(2, 1, false);
        let ran = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ran = ran.clone();
                queue.submit(Arc::new(Fence::new()), move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in &handles {
            handle.wait();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_sync_compile_blocks_submitter() {
        let queue = CompileQueue::new(1, 1, true);
        let ran = Arc::new(AtomicU64::new(0));

        let ran2 = ran.clone();
        let handle = queue.submit(Arc::new(Fence::new()), move || {
            std::thread::sleep(Duration::from_millis(20));
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        // submit() returned, so the job must already be done.
        assert!(handle.is_finished());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_start_skips_job_but_signals() {
        let queue = CompileQueue::new(1, 1, false);
        let ran = Arc::new(AtomicU64::new(0));

        // Park the single worker so the second job stays queued.
        let gate = Arc::new(Fence::new());
        let gate2 = gate.clone();
        let blocker = queue.submit(Arc::new(Fence::new()), move || gate2.wait());

        let ran2 = ran.clone();
        let victim = queue.submit(Arc::new(Fence::new()), move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        victim.cancel();
        gate.signal();

        victim.wait();
        blocker.wait();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_low_priority_is_async_in_sync_mode() {
        let queue = CompileQueue::new(1, 1, true);
        let gate = Arc::new(Fence::new());
        let gate2 = gate.clone();

        let handle = queue.submit_low_priority(Arc::new(Fence::new()), move || gate2.wait());
        // Must return before the job completes even with sync_compile set.
        assert!(!handle.is_finished());
        gate.signal();
        handle.wait();
    }
}
