//! Types related to futures and asynchrony.
//!
//! Kernel launches, transfers and markers are non-blocking submissions;
//! each returns an [`Event`](crate::standard::Event) backed by the shared
//! [`CompletionState`] defined here. A waiter may either block the host
//! thread (`Event::wait_for`) or await the [`CompletionFuture`] from an
//! async context.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context as TaskCx, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{Error, Result as UclResult};
use crate::standard::DeviceError;

/// A cooperative cancellation token.
///
/// Cancellation is observed, never imposed: submitted work runs to
/// completion, but an operation holding the token enqueues no new work
/// after `cancel` has been called. Cloning shares the token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Returns a new, un-cancelled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Requests cancellation of every operation holding a clone of this
    /// token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `Err(Error::Cancelled)` once `cancel` has been called.
    pub fn checkpoint(&self) -> UclResult<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct CompletionInner {
    done: bool,
    // First error observed by the producing stream, if any. `Error` is
    // `Clone` so late waiters observe the same outcome.
    error: Option<Error>,
    completed_at: Option<Instant>,
    wakers: Vec<Waker>,
}

/// Shared completion record for one submitted operation.
///
/// Completed exactly once by the stream worker that executed the
/// operation; observable any number of times.
pub(crate) struct CompletionState {
    inner: Mutex<CompletionInner>,
    cond: Condvar,
    submitted_at: Instant,
}

impl CompletionState {
    pub(crate) fn new() -> Arc<CompletionState> {
        Arc::new(CompletionState {
            inner: Mutex::new(CompletionInner {
                done: false,
                error: None,
                completed_at: None,
                wakers: Vec::new(),
            }),
            cond: Condvar::new(),
            submitted_at: Instant::now(),
        })
    }

    /// Marks the operation complete, storing its outcome and waking every
    /// registered waiter.
    pub(crate) fn complete(&self, outcome: UclResult<()>) {
        let wakers = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(!inner.done, "completion state completed twice");
            inner.done = true;
            inner.error = outcome.err();
            inner.completed_at = Some(Instant::now());
            std::mem::take(&mut inner.wakers)
        };
        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    pub(crate) fn wait(&self) -> UclResult<()> {
        let mut inner = self.inner.lock().unwrap();
        while !inner.done {
            inner = self.cond.wait(inner).unwrap();
        }
        match inner.error {
            Some(ref err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> UclResult<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while !inner.done {
            let now = Instant::now();
            if now >= deadline {
                return Err(DeviceError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        match inner.error {
            Some(ref err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Wall time between submission and completion, if complete.
    pub(crate) fn elapsed(&self) -> Option<Duration> {
        self.inner
            .lock()
            .unwrap()
            .completed_at
            .map(|at| at - self.submitted_at)
    }

    fn poll(&self, cx: &mut TaskCx<'_>) -> Poll<UclResult<()>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return Poll::Ready(match inner.error {
                Some(ref err) => Err(err.clone()),
                None => Ok(()),
            });
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// A future which resolves when the corresponding stream reaches the
/// submission point of the operation it was created from.
///
/// Obtained from [`Event::completion`](crate::standard::Event::completion).
#[must_use = "futures do nothing unless polled"]
pub struct CompletionFuture {
    state: Arc<CompletionState>,
}

impl CompletionFuture {
    pub(crate) fn new(state: Arc<CompletionState>) -> CompletionFuture {
        CompletionFuture { state }
    }
}

impl Future for CompletionFuture {
    type Output = UclResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskCx<'_>) -> Poll<Self::Output> {
        self.state.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_unblocks_waiters() {
        let state = CompletionState::new();
        let waiter = Arc::clone(&state);
        let th = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(10));
        state.complete(Ok(()));
        assert!(th.join().unwrap().is_ok());
        assert!(state.is_complete());
        assert!(state.elapsed().is_some());
    }

    #[test]
    fn cancel_token_checkpoint() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(token.checkpoint().unwrap_err().is_cancelled());
    }
}
