use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};

/// Callback invoked when a scheduled retry is due.
///
/// The callback can only be invoked once, and is dropped without being invoked if the retry is cancelled.
pub struct RetryCallback(Box<dyn FnOnce() + Send>);

impl RetryCallback {
    /// Creates a new `RetryCallback` from the given closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Invokes the callback, consuming it.
    pub fn invoke(self) {
        (self.0)()
    }
}

impl fmt::Debug for RetryCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCallback").finish_non_exhaustive()
    }
}

/// A one-shot timer that schedules retries.
pub trait RetryTimer: Send {
    /// Arms the timer, invoking `callback` once `delay` has elapsed.
    ///
    /// Any callback that is still pending from an earlier call is cancelled.
    fn arm(&mut self, delay: Duration, callback: RetryCallback);

    /// Disarms the timer, dropping any pending callback without invoking it.
    fn disarm(&mut self);

    /// Returns `true` if a callback is pending.
    fn is_armed(&self) -> bool;
}

/// Creates retry timers.
///
/// Timers are created lazily, the first time a retry is scheduled for a request.
pub trait TimerFactory {
    /// Type of timer created by this factory.
    type Timer: RetryTimer;

    /// Creates a new, disarmed timer.
    fn create_timer(&self) -> Self::Timer;
}

impl<F> TimerFactory for &F
where
    F: TimerFactory + ?Sized,
{
    type Timer = F::Timer;

    fn create_timer(&self) -> Self::Timer {
        (**self).create_timer()
    }
}

/// Creates timers driven by a Tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioTimerFactory {
    handle: Handle,
}

impl TokioTimerFactory {
    /// Creates a new `TokioTimerFactory` that spawns timers on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioTimerFactory` that spawns timers on the current runtime.
    ///
    /// # Panics
    ///
    /// This function panics if called outside the context of a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl TimerFactory for TokioTimerFactory {
    type Timer = TokioRetryTimer;

    fn create_timer(&self) -> Self::Timer {
        TokioRetryTimer {
            handle: self.handle.clone(),
            armed: None,
        }
    }
}

type CallbackSlot = Arc<Mutex<Option<RetryCallback>>>;

struct Armed {
    slot: CallbackSlot,
    task: JoinHandle<()>,
}

/// A retry timer backed by a Tokio task.
///
/// Dropping the timer cancels any pending callback.
pub struct TokioRetryTimer {
    handle: Handle,
    armed: Option<Armed>,
}

impl RetryTimer for TokioRetryTimer {
    fn arm(&mut self, delay: Duration, callback: RetryCallback) {
        self.disarm();

        let slot: CallbackSlot = Arc::new(Mutex::new(Some(callback)));
        let task_slot = Arc::clone(&slot);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;

            // The lock must not be held while the callback runs.
            let callback = task_slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(callback) = callback {
                callback.invoke();
            }
        });

        self.armed = Some(Armed { slot, task });
    }

    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            // The task may already be past its sleep, so the slot has to be emptied before aborting.
            drop(armed.slot.lock().unwrap_or_else(PoisonError::into_inner).take());
            armed.task.abort();
        }
    }

    fn is_armed(&self) -> bool {
        self.armed
            .as_ref()
            .is_some_and(|armed| armed.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
    }
}

impl Drop for TokioRetryTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl fmt::Debug for TokioRetryTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioRetryTimer")
            .field("armed", &self.is_armed())
            .finish()
    }
}
