//! Background collection work queue
//!
//! Collection work is message passing: each unit is a [`CollectionTask`]
//! value sent down a channel. With background dispatch a named worker
//! thread drains the channel; with manual dispatch the embedder drains it
//! through `Zone::drain_tasks`.

use super::{GlobalMode, Zone};
use crate::ZoneResult;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// One unit of background work
#[derive(Debug)]
pub(crate) enum CollectionTask {
    /// Run one pending global collection of this mode
    Global(GlobalMode),
    /// Finalize and free garbage found by a deferred thread-local collection
    FinalizeLocal {
        /// Block addresses, each marked locally dead
        garbage: Vec<usize>,
    },
    /// Stop the worker
    Shutdown,
}

/// Channel plus optional worker thread
pub(crate) struct TaskQueue {
    sender: Sender<CollectionTask>,
    receiver: Receiver<CollectionTask>,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Start the worker thread
    pub(crate) fn start(&self, zone: Weak<Zone>, interval: Duration) -> ZoneResult<()> {
        let receiver = self.receiver.clone();
        let handle = thread::Builder::new()
            .name("autozone-collector".to_string())
            .spawn(move || run_loop(zone, receiver, interval))?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Queue a task
    pub(crate) fn enqueue(&self, task: CollectionTask) {
        // The queue owns a receiver, so the channel never disconnects.
        let _ = self.sender.send(task);
    }

    /// Next queued task, without blocking
    pub(crate) fn try_next(&self) -> Option<CollectionTask> {
        self.receiver.try_recv().ok()
    }

    /// Tasks waiting
    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Stop the worker thread
    pub(crate) fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        // The worker can drop the last zone reference itself; never join from it.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        self.enqueue(CollectionTask::Shutdown);

        let start = Instant::now();
        let timeout = Duration::from_secs(2);
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                drop(handle);
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Worker main loop
fn run_loop(zone: Weak<Zone>, receiver: Receiver<CollectionTask>, interval: Duration) {
    loop {
        let task = match receiver.recv_timeout(interval) {
            Ok(CollectionTask::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(task) => Some(task),
            Err(RecvTimeoutError::Timeout) => None,
        };
        let Some(zone) = zone.upgrade() else {
            break;
        };
        match task {
            Some(task) => zone.run_task(task),
            None => {
                zone.poll_suspended_threads();
            }
        }
    }
    debug!(target: "autozone::gc", "collector thread shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_queue_in_order() {
        let queue = TaskQueue::new();
        queue.enqueue(CollectionTask::Global(GlobalMode::Full));
        queue.enqueue(CollectionTask::FinalizeLocal { garbage: vec![0x10] });
        assert_eq!(queue.len(), 2);
        assert!(matches!(
            queue.try_next(),
            Some(CollectionTask::Global(GlobalMode::Full))
        ));
        assert!(matches!(
            queue.try_next(),
            Some(CollectionTask::FinalizeLocal { garbage }) if garbage == vec![0x10]
        ));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_stop_without_worker() {
        let queue = TaskQueue::new();
        assert!(!queue.is_running());
        queue.stop();
        queue.stop();
    }
}
