//! FIFO of deferred tasks shared between submitters and the owning thread

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, trace};

use crate::channel::Channel;
use crate::error::ExecError;
use crate::promise::DeferredTask;
use crate::sync::lock;
use crate::transport::Transport;

struct QueueState<T: Transport> {
    pending: VecDeque<DeferredTask<T>>,
    closed: bool,
}

/// Tasks waiting for the owning thread.
///
/// Any thread may submit. Draining needs `&mut Channel<T>`, which only the
/// owning thread holds.
pub struct TaskQueue<T: Transport> {
    state: Mutex<QueueState<T>>,
    next_id: AtomicU64,
    owner: Mutex<Option<ThreadId>>,
}

impl<T: Transport> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            owner: Mutex::new(None),
        }
    }
}

impl<T: Transport> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the calling thread as the one that drains this queue
    pub(crate) fn claim_owner(&self) {
        *lock(&self.owner) = Some(thread::current().id());
    }

    /// True when called from the thread that drains this queue
    pub fn is_owner(&self) -> bool {
        *lock(&self.owner) == Some(thread::current().id())
    }

    /// Queue `action` for the owning thread and block until it has run.
    ///
    /// On timeout the task stays queued and still runs; only the wait is
    /// abandoned. The owning thread itself cannot wait on its own queue, so
    /// a submit from a task body or consumer callback fails with `Reentrancy`.
    pub fn submit<R, F>(&self, action: F, timeout: Duration) -> Result<R, ExecError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Channel<T>) -> Result<R, ExecError> + Send + 'static,
    {
        if self.is_owner() {
            debug!("TaskQueue::submit: called on the owning thread");
            return Err(ExecError::Reentrancy("submit"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (task, promise) = DeferredTask::new(id, action);
        {
            let mut state = lock(&self.state);
            if state.closed {
                debug!(task_id = id, "TaskQueue::submit: queue closed");
                return Err(ExecError::Stopped);
            }
            state.pending.push_back(task);
        }
        trace!(task_id = id, "TaskQueue::submit: queued");
        promise.wait(timeout)
    }

    /// Run every task queued so far, in order. Returns how many ran.
    ///
    /// The lock is released before any task body runs.
    pub fn drain_and_run(&self, channel: &mut Channel<T>) -> usize {
        let batch = std::mem::take(&mut lock(&self.state).pending);
        let count = batch.len();
        for task in batch {
            trace!(task_id = task.id(), "TaskQueue::drain_and_run: running");
            task.run(channel);
        }
        count
    }

    /// Refuse further submissions and fail everything still queued
    pub fn close(&self) -> usize {
        let leftovers = {
            let mut state = lock(&self.state);
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        let count = leftovers.len();
        if count > 0 {
            debug!(count, "TaskQueue::close: abandoning queued tasks");
        }
        for task in leftovers {
            task.abandon();
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
