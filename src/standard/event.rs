//! Completion events for submitted operations.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result as UclResult;
use crate::r#async::{CompletionFuture, CompletionState};

/// A marker for one submitted operation on a stream.
///
/// The event completes when the stream reaches the operation's
/// submission point; waiting on it blocks the calling host thread.
/// Events are cheap to clone and observable from any thread.
#[derive(Clone)]
pub struct Event {
    state: Arc<CompletionState>,
}

impl Event {
    pub(crate) fn new(state: Arc<CompletionState>) -> Event {
        Event { state }
    }

    /// An already-complete event, useful as a neutral dependency.
    pub fn completed() -> Event {
        let state = CompletionState::new();
        state.complete(Ok(()));
        Event { state }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Blocks until the operation completes, returning its outcome.
    pub fn wait_for(&self) -> UclResult<()> {
        self.state.wait()
    }

    /// Like [`wait_for`](Self::wait_for) with an upper bound; elapses
    /// into `DeviceError::Timeout`.
    pub fn wait_for_timeout(&self, timeout: Duration) -> UclResult<()> {
        self.state.wait_timeout(timeout)
    }

    /// A future resolving with the operation's outcome.
    pub fn completion(&self) -> CompletionFuture {
        CompletionFuture::new(Arc::clone(&self.state))
    }

    /// Wall time between submission and completion, once complete.
    pub fn elapsed(&self) -> Option<Duration> {
        self.state.elapsed()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A list of events which can be waited on together.
#[derive(Debug, Clone, Default)]
pub struct EventList {
    events: Vec<Event>,
}

impl EventList {
    pub fn new() -> EventList {
        EventList::default()
    }

    pub fn with_capacity(capacity: usize) -> EventList {
        EventList {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Waits for every event in the list, surfacing the first error.
    pub fn wait_for(&self) -> UclResult<()> {
        for event in &self.events {
            event.wait_for()?;
        }
        Ok(())
    }

    /// Drops completed events from the list, retaining pending ones.
    pub fn clear_completed(&mut self) {
        self.events.retain(|e| !e.is_complete());
    }
}

impl From<Event> for EventList {
    fn from(event: Event) -> EventList {
        EventList {
            events: vec![event],
        }
    }
}

impl From<Vec<Event>> for EventList {
    fn from(events: Vec<Event>) -> EventList {
        EventList { events }
    }
}

impl<'a> IntoIterator for &'a EventList {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
