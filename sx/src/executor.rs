//! SerializedExecutor: a dedicated owning thread for one connection

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::error::ExecError;
use crate::queue::TaskQueue;
use crate::sync::{Signal, lock};
use crate::transport::Transport;

/// How long dropping a running executor waits for its thread
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Owning-thread settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Thread name, shown in logs and panics
    pub name: String,
    /// Upper bound on each inbound poll; also bounds how long a queued task
    /// waits while the connection is idle
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "serialexec".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Cloneable submit-only view of an executor, for handing to other threads
pub struct ExecutorHandle<T: Transport> {
    queue: Arc<TaskQueue<T>>,
}

impl<T: Transport> Clone for ExecutorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T: Transport> ExecutorHandle<T> {
    pub fn submit<R, F>(&self, action: F, timeout: Duration) -> Result<R, ExecError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Channel<T>) -> Result<R, ExecError> + Send + 'static,
    {
        self.queue.submit(action, timeout)
    }
}

/// Runs a channel's consume loop on its own thread and serializes every
/// foreign access to it.
pub struct SerializedExecutor<T: Transport> {
    name: String,
    queue: Arc<TaskQueue<T>>,
    finished: Arc<Signal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> SerializedExecutor<T> {
    /// Move `channel` onto a new owning thread and start consuming.
    ///
    /// `on_exit` runs on the owning thread after the loop ends and the
    /// connection is closed.
    pub fn start<F>(channel: Channel<T>, config: ExecutorConfig, on_exit: F) -> Result<Self, ExecError>
    where
        F: FnOnce() + Send + 'static,
    {
        debug!(name = %config.name, "SerializedExecutor::start: called");
        let queue = Arc::new(TaskQueue::new());
        let finished = Arc::new(Signal::new());

        let thread = {
            let queue = Arc::clone(&queue);
            let finished = Arc::clone(&finished);
            let poll_interval = config.poll_interval;
            thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || owning_thread(channel, &queue, poll_interval, &finished, on_exit))
                .map_err(ExecError::Spawn)?
        };

        info!(name = %config.name, "Owning thread started");
        Ok(Self {
            name: config.name,
            queue,
            finished,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `action` on the owning thread and return its outcome
    pub fn submit<R, F>(&self, action: F, timeout: Duration) -> Result<R, ExecError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Channel<T>) -> Result<R, ExecError> + Send + 'static,
    {
        self.queue.submit(action, timeout)
    }

    pub fn handle(&self) -> ExecutorHandle<T> {
        ExecutorHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        !self.finished.is_set()
    }

    /// Block until the owning thread has finished, or `timeout` elapses
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.finished.wait(timeout)
    }

    /// Close the connection from the owning thread and join it.
    ///
    /// Stopping an executor whose loop already ended only joins.
    pub fn stop(&self, timeout: Duration) -> Result<(), ExecError> {
        debug!(name = %self.name, ?timeout, "SerializedExecutor::stop: called");
        if self.queue.is_owner() {
            return Err(ExecError::Reentrancy("stop"));
        }
        let deadline = Instant::now() + timeout;

        match self.submit(|channel| Ok(channel.close_suppressed()?), timeout) {
            Ok(()) | Err(ExecError::Stopped) => {}
            Err(ExecError::Timeout(waited)) => return Err(ExecError::Timeout(waited)),
            Err(e) => warn!(name = %self.name, error = %e, "Close failed while stopping"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.finished.wait(remaining) {
            return Err(ExecError::Timeout(timeout));
        }

        if let Some(thread) = lock(&self.thread).take()
            && thread.join().is_err()
        {
            error!(name = %self.name, "Owning thread panicked");
        }
        info!(name = %self.name, "Owning thread stopped");
        Ok(())
    }
}

impl<T: Transport> Drop for SerializedExecutor<T> {
    fn drop(&mut self) {
        if self.is_running()
            && let Err(e) = self.stop(DROP_STOP_TIMEOUT)
        {
            warn!(name = %self.name, error = %e, "Executor dropped while running and did not stop");
        }
    }
}

fn owning_thread<T, F>(
    mut channel: Channel<T>,
    queue: &TaskQueue<T>,
    poll_interval: Duration,
    finished: &Signal,
    on_exit: F,
) where
    T: Transport,
    F: FnOnce(),
{
    if let Err(e) = channel.start_consuming(queue, poll_interval) {
        error!(error = %e, "Consume loop failed");
    }
    queue.close();
    if let Err(e) = channel.close_suppressed() {
        warn!(error = %e, "Failed to close connection after consume loop");
    }
    on_exit();
    finished.set();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryTransport};

    fn running(broker: &MemoryBroker) -> SerializedExecutor<MemoryTransport> {
        let mut channel = Channel::new(broker.connect());
        channel.declare_topic_exchange("ex").unwrap();
        let queue = channel.declare_exclusive_queue().unwrap();
        channel.bind_queue("ex", &queue, "#").unwrap();
        channel.consume(&queue, true, |_, _| {}).unwrap();
        SerializedExecutor::start(channel, ExecutorConfig::default(), || {}).unwrap()
    }

    #[test]
    fn test_submit_returns_task_value() {
        let broker = MemoryBroker::new();
        let executor = running(&broker);
        let value = executor.submit(|_| Ok(21 * 2), Duration::from_secs(5)).unwrap();
        assert_eq!(value, 42);
        executor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_stop_runs_exit_hook_and_rejects_work() {
        let broker = MemoryBroker::new();
        let mut channel = Channel::new(broker.connect());
        channel.declare_topic_exchange("ex").unwrap();
        let queue = channel.declare_exclusive_queue().unwrap();
        channel.consume(&queue, true, |_, _| {}).unwrap();

        let exited = Arc::new(Signal::new());
        let hook = Arc::clone(&exited);
        let executor = SerializedExecutor::start(channel, ExecutorConfig::default(), move || hook.set()).unwrap();

        executor.stop(Duration::from_secs(5)).unwrap();
        assert!(exited.is_set());
        assert!(!executor.is_running());
        assert!(matches!(
            executor.submit(|_| Ok(()), Duration::from_secs(1)),
            Err(ExecError::Stopped)
        ));
    }

    #[test]
    fn test_stop_twice_is_harmless() {
        let broker = MemoryBroker::new();
        let executor = running(&broker);
        executor.stop(Duration::from_secs(5)).unwrap();
        executor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_handle_submits_from_other_thread() {
        let broker = MemoryBroker::new();
        let executor = running(&broker);
        let handle = executor.handle();
        let owner = thread::spawn(move || handle.submit(|_| Ok(thread::current().name().map(str::to_string)), Duration::from_secs(5)))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(owner.as_deref(), Some("serialexec"));
        executor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_drop_stops_owning_thread() {
        let broker = MemoryBroker::new();
        let executor = running(&broker);
        assert_eq!(broker.connection_count(), 1);
        drop(executor);
        assert_eq!(broker.connection_count(), 0);
    }
}
