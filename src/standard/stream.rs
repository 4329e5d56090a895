//! A per-accelerator in-order submission queue.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};

use super::accelerator::AccelShared;
use super::event::Event;
use crate::error::{Error, Result as UclResult};
use crate::r#async::CompletionState;
use crate::standard::DeviceError;

/// Stream lifecycle, observable through [`Stream::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Submitted,
    Draining,
}

struct Task {
    run: Box<dyn FnOnce() -> UclResult<()> + Send>,
    done: Arc<CompletionState>,
}

struct StreamInner {
    tx: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Arc<Mutex<StreamState>>,
    accel: Arc<AccelShared>,
    label: String,
}

/// An ordered queue of operations on one accelerator.
///
/// Submissions are non-blocking; operations on one stream complete in
/// submission order, observably serial. Operations on distinct streams
/// of one accelerator may overlap. Dropping a non-idle stream
/// synchronizes first.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(accel: Arc<AccelShared>, label: String) -> Stream {
        let (tx, rx) = unbounded::<Task>();
        let state = Arc::new(Mutex::new(StreamState::Idle));

        // The worker captures only the shared pieces, not the stream
        // itself; the channel closing on drop is its shutdown signal.
        let worker_accel = Arc::clone(&accel);
        let worker_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name(format!("ucl-stream-{}", label))
            .spawn(move || {
                for task in rx.iter() {
                    let outcome = (task.run)();
                    if let Err(ref err) = outcome {
                        worker_accel.latch_hard_failure(err);
                    }
                    // Bookkeeping settles before the completion becomes
                    // observable, so a woken waiter sees the device
                    // idle.
                    if worker_accel.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let mut state = worker_state.lock().unwrap();
                        if *state == StreamState::Submitted {
                            *state = StreamState::Idle;
                        }
                    }
                    task.done.complete(outcome);
                }
            })
            .expect("failed to spawn stream worker");

        Stream {
            inner: Arc::new(StreamInner {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                state,
                accel,
                label,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock().unwrap()
    }

    /// Submits `task` for in-order execution, returning its completion
    /// event. Submission itself does not block.
    pub(crate) fn submit(
        &self,
        task: impl FnOnce() -> UclResult<()> + Send + 'static,
    ) -> UclResult<Event> {
        let done = CompletionState::new();
        let tx = self.inner.tx.lock().unwrap();
        let tx = tx.as_ref().ok_or_else(|| {
            Error::from(DeviceError::Unavailable {
                device: self.inner.label.clone(),
            })
        })?;
        self.inner.accel.inflight.fetch_add(1, Ordering::AcqRel);
        *self.inner.state.lock().unwrap() = StreamState::Submitted;
        if tx
            .send(Task {
                run: Box::new(task),
                done: Arc::clone(&done),
            })
            .is_err()
        {
            self.inner.accel.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(DeviceError::Unavailable {
                device: self.inner.label.clone(),
            }
            .into());
        }
        Ok(Event::new(done))
    }

    /// Enqueues a marker: an empty operation whose event completes when
    /// everything submitted before it has.
    pub fn enqueue_marker(&self) -> UclResult<Event> {
        self.submit(|| Ok(()))
    }

    /// Blocks until all commands in this stream have completed.
    ///
    /// Errors of individual operations surface through their own
    /// events; `finish` itself only fails when the stream is gone.
    pub fn finish(&self) -> UclResult<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == StreamState::Idle {
                return Ok(());
            }
            *state = StreamState::Draining;
        }
        let marker = self.enqueue_marker()?;
        let _ = marker.wait_for();
        *self.inner.state.lock().unwrap() = StreamState::Idle;
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Closing the channel ends the worker after it drains; joining
        // here is the implicit synchronize on dispose.
        if let Some(tx) = self.tx.lock().unwrap().take() {
            drop(tx);
        }
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}
