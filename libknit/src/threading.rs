//! A bounded pool of worker threads that runs linking tasks and hands their results back through
//! handles. Panics are kept out of task results: they're queued up as faults, which the caller
//! collects when it shuts the pool down.

use crate::error::LinkError;
use crate::error::Result;
use crate::error::warning;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_queue::SegQueue;
use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct WorkerPool {
    pool: ThreadPool,
    faults: Arc<SegQueue<String>>,

    /// Each submitted task holds a clone of this sender until it finishes. Nothing is ever sent;
    /// once every clone has been dropped, `all_done` disconnects.
    in_flight: Sender<()>,
    all_done: Receiver<()>,
}

/// Gives access to the result of a submitted task.
pub(crate) struct TaskHandle<T> {
    label: String,
    result: Receiver<Result<T>>,
}

impl WorkerPool {
    pub(crate) fn new(num_threads: NonZeroUsize) -> Result<WorkerPool> {
        let faults = Arc::new(SegQueue::new());
        let handler_faults = faults.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.get())
            .thread_name(|index| format!("knit-worker-{index}"))
            // Tasks catch their own panics. This only sees a panic that escapes the task wrapper.
            .panic_handler(move |payload| {
                handler_faults.push(format!("worker panicked: {}", panic_message(&*payload)));
            })
            .build()?;
        let (in_flight, all_done) = crossbeam_channel::bounded(0);
        Ok(WorkerPool {
            pool,
            faults,
            in_flight,
            all_done,
        })
    }

    pub(crate) fn submit<T: Send + 'static>(
        &self,
        label: impl Into<String>,
        task: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> TaskHandle<T> {
        let label = label.into();
        let (result_sender, result) = crossbeam_channel::bounded(1);
        let in_flight = self.in_flight.clone();
        let faults = self.faults.clone();
        let task_label = label.clone();
        self.pool.spawn(move || {
            match std::panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(outcome) => {
                    // The handle may have been dropped, in which case nobody wants the result.
                    let _ = result_sender.send(outcome);
                }
                Err(payload) => faults.push(format!(
                    "task `{task_label}` panicked: {}",
                    panic_message(&*payload)
                )),
            }
            drop(in_flight);
        });
        TaskHandle { label, result }
    }

    /// Waits up to `timeout` for in-flight tasks to finish, then shuts down the pool. Returns any
    /// faults that occurred while the pool was running.
    #[tracing::instrument(skip_all, name = "Shut down workers")]
    pub(crate) fn shutdown(self, timeout: Duration) -> Vec<String> {
        let WorkerPool {
            pool,
            faults,
            in_flight,
            all_done,
        } = self;
        drop(in_flight);
        match all_done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => warning(&format!(
                "worker tasks still running after {}ms, shutting down anyway",
                timeout.as_millis()
            )),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        }
        drop(pool);
        let faults: Vec<String> = std::iter::from_fn(|| faults.pop()).collect();
        for fault in &faults {
            tracing::error!("{fault}");
        }
        faults
    }
}

impl<T> TaskHandle<T> {
    /// Blocks until the task completes.
    pub(crate) fn join(self) -> Result<T> {
        match self.result.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(LinkError::WorkerFault(format!(
                "task `{}` ended without producing a result",
                self.label
            ))
            .into()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
