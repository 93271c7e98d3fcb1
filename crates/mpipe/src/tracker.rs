//! Completion tracking for concurrently relayed parts
//!
//! A [`CompletionTracker`] counts in-flight uploads and remembers whether the
//! decoder has finished. It fires its terminal callback exactly once:
//!
//! + with success when the source is closed and nothing is in flight,
//! + with the first error reported through [`CompletionTracker::cancel`].
//!
//! The tracker is owned by a single task and needs no locking.
//!

use std::fmt;
use std::mem;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// A part was registered after the tracker reached a terminal state
    #[error("TrackerError: Terminated: the tracker has already fired its callback")]
    Terminated,
}

enum State<T, E, F> {
    Pending { data: T, callback: F },
    Succeeded,
    Failed(E),
    /// Placeholder held only while a transition is in progress
    Firing,
}

pub struct CompletionTracker<T, E, F>
where
    F: FnOnce(T, Option<E>),
{
    in_flight: usize,
    source_closed: bool,
    state: State<T, E, F>,
}

impl<T, E, F> CompletionTracker<T, E, F>
where
    E: Clone,
    F: FnOnce(T, Option<E>),
{
    /// Creates a pending tracker owning `data`.
    ///
    /// `callback` receives `data` back on either transition.
    #[must_use]
    pub fn new(data: T, callback: F) -> Self {
        Self {
            in_flight: 0,
            source_closed: false,
            state: State::Pending { data, callback },
        }
    }

    /// Records one more in-flight upload.
    ///
    /// # Errors
    /// Returns [`TrackerError::Terminated`] if the tracker is no longer pending.
    /// Callers must stop admitting parts once the tracker has fired.
    pub fn register(&mut self) -> Result<(), TrackerError> {
        if !self.is_pending() {
            return Err(TrackerError::Terminated);
        }
        self.in_flight += 1;
        Ok(())
    }

    /// Records that one in-flight upload finished successfully.
    ///
    /// Results that arrive after a terminal transition only update the counter.
    pub fn resolve(&mut self) {
        debug_assert!(self.in_flight > 0, "resolve without matching register");
        self.in_flight = self.in_flight.saturating_sub(1);
        self.try_succeed();
    }

    /// Records that the decoder will produce no more parts.
    pub fn mark_source_closed(&mut self) {
        self.source_closed = true;
        self.try_succeed();
    }

    /// Fails the tracker with `err` if it is still pending.
    ///
    /// Later calls are no-ops: the first error wins.
    pub fn cancel(&mut self, err: E) {
        if !self.is_pending() {
            return;
        }
        let stored = err.clone();
        if let State::Pending { data, callback } = mem::replace(&mut self.state, State::Firing) {
            debug!(in_flight = self.in_flight, "tracker failed");
            self.state = State::Failed(stored);
            callback(data, Some(err));
        }
    }

    /// Mutable access to the accumulated payload while pending.
    pub fn data_mut(&mut self) -> Option<&mut T> {
        match &mut self.state {
            State::Pending { data, .. } => Some(data),
            _ => None,
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[must_use]
    pub fn is_source_closed(&self) -> bool {
        self.source_closed
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending { .. })
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        matches!(self.state, State::Succeeded)
    }

    /// The error the tracker failed with, if any
    #[must_use]
    pub fn error(&self) -> Option<&E> {
        match &self.state {
            State::Failed(err) => Some(err),
            _ => None,
        }
    }

    fn try_succeed(&mut self) {
        if !(self.source_closed && self.in_flight == 0 && self.is_pending()) {
            return;
        }
        if let State::Pending { data, callback } = mem::replace(&mut self.state, State::Succeeded) {
            debug!("tracker succeeded");
            callback(data, None);
        }
    }
}

impl<T, E, F> fmt::Debug for CompletionTracker<T, E, F>
where
    E: fmt::Debug,
    F: FnOnce(T, Option<E>),
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Pending { .. } => "Pending",
            State::Succeeded => "Succeeded",
            State::Failed(_) => "Failed",
            State::Firing => "Firing",
        };
        f.debug_struct("CompletionTracker")
            .field("in_flight", &self.in_flight)
            .field("source_closed", &self.source_closed)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}
