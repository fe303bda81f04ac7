//! Deferred tasks and the write-once promise a submitter blocks on

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::channel::Channel;
use crate::error::ExecError;
use crate::sync::lock;
use crate::transport::Transport;

struct Slot<R> {
    completed: bool,
    outcome: Option<Result<R, ExecError>>,
}

/// Completion handle for one deferred task.
///
/// The outcome is written exactly once, by whichever of run or abandon gets
/// the task, and taken exactly once by the submitter.
pub struct Promise<R> {
    slot: Mutex<Slot<R>>,
    done: Condvar,
}

impl<R> Default for Promise<R> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                completed: false,
                outcome: None,
            }),
            done: Condvar::new(),
        }
    }
}

impl<R> Promise<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome. Returns false if one was already recorded.
    pub fn complete(&self, outcome: Result<R, ExecError>) -> bool {
        let mut slot = lock(&self.slot);
        if slot.completed {
            return false;
        }
        slot.completed = true;
        slot.outcome = Some(outcome);
        self.done.notify_all();
        true
    }

    pub fn is_completed(&self) -> bool {
        lock(&self.slot).completed
    }

    /// Block until the outcome is recorded or `timeout` elapses.
    ///
    /// A timeout leaves the promise pending; the task still runs later and
    /// its outcome is discarded.
    pub fn wait(&self, timeout: Duration) -> Result<R, ExecError> {
        let guard = lock(&self.slot);
        let (mut slot, _) = self
            .done
            .wait_timeout_while(guard, timeout, |slot| !slot.completed)
            .unwrap_or_else(PoisonError::into_inner);
        if !slot.completed {
            return Err(ExecError::Timeout(timeout));
        }
        slot.outcome.take().unwrap_or(Err(ExecError::AlreadyRetrieved))
    }
}

trait Settle: Send + Sync {
    fn fail(&self, error: ExecError);
}

impl<R: Send> Settle for Promise<R> {
    fn fail(&self, error: ExecError) {
        self.complete(Err(error));
    }
}

type Job<T> = Box<dyn FnOnce(&mut Channel<T>) + Send>;

/// A unit of work queued for the owning thread
pub struct DeferredTask<T: Transport> {
    id: u64,
    job: Job<T>,
    settle: Arc<dyn Settle>,
}

impl<T: Transport> DeferredTask<T> {
    /// Wrap `action` and return the promise its submitter waits on
    pub fn new<R, F>(id: u64, action: F) -> (Self, Arc<Promise<R>>)
    where
        R: Send + 'static,
        F: FnOnce(&mut Channel<T>) -> Result<R, ExecError> + Send + 'static,
    {
        let promise = Arc::new(Promise::new());
        let handoff = Arc::clone(&promise);
        let job: Job<T> = Box::new(move |channel: &mut Channel<T>| {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| action(channel))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(ExecError::TaskFailure(panic_message(payload.as_ref()))),
            };
            if !handoff.complete(outcome) {
                debug!(task_id = id, "DeferredTask: outcome already recorded");
            }
        });
        let settle: Arc<dyn Settle> = promise.clone();
        (Self { id, job, settle }, promise)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run on the owning thread. Consumes the task so it can never run twice.
    pub fn run(self, channel: &mut Channel<T>) {
        (self.job)(channel)
    }

    /// Fail the task without running it
    pub fn abandon(self) {
        debug!(task_id = self.id, "DeferredTask::abandon: called");
        self.settle.fail(ExecError::Stopped);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_outcome_is_write_once() {
        let promise: Promise<u32> = Promise::new();
        assert!(promise.complete(Ok(1)));
        assert!(!promise.complete(Ok(2)));
        assert_eq!(promise.wait(Duration::ZERO).unwrap(), 1);
    }

    #[test]
    fn test_second_wait_reports_already_retrieved() {
        let promise: Promise<u32> = Promise::new();
        promise.complete(Ok(7));
        assert_eq!(promise.wait(Duration::ZERO).unwrap(), 7);
        assert!(matches!(promise.wait(Duration::ZERO), Err(ExecError::AlreadyRetrieved)));
    }

    #[test]
    fn test_wait_times_out_and_stays_pending() {
        let promise: Promise<u32> = Promise::new();
        let result = promise.wait(Duration::from_millis(20));
        assert!(matches!(result, Err(ExecError::Timeout(_))));
        assert!(!promise.is_completed());

        // a late completion is still accepted
        assert!(promise.complete(Ok(3)));
    }

    #[test]
    fn test_failure_is_returned_to_waiter() {
        let promise = Arc::new(Promise::<()>::new());
        let completer = Arc::clone(&promise);
        let handle = thread::spawn(move || {
            completer.complete(Err(ExecError::task_failure("boom")));
        });
        let result = promise.wait(Duration::from_secs(5));
        handle.join().unwrap();
        match result {
            Err(ExecError::TaskFailure(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_panic_message_extracts_payload() {
        let payload = panic::catch_unwind(|| panic!("bad state")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "panicked: bad state");
    }
}
