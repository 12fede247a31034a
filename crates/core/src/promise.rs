//! One-shot completion cells shared between the parties of a connect attempt.
//!
//! A [`Promise`] starts pending and reaches exactly one terminal [`Outcome`]. Every
//! completion operation is a test-and-set: it reports whether *this* call performed the
//! transition, so racing completers (e.g. a caller cancelling while a handshake succeeds)
//! resolve first-writer-wins and the losers are silent no-ops.
//!
//! Listeners are single-notification: each one runs exactly once, in whatever context
//! completed the promise, or immediately if it is registered after completion.
use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::error::{Cause, ConnectError};

/// Terminal state of a [`Promise`].
#[derive(Debug)]
pub enum Outcome<T = ()> {
    Success(T),
    Failure(Cause),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Outcome::Failure(cause) => Some(cause),
            _ => None,
        }
    }
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Success(value) => Outcome::Success(value.clone()),
            Outcome::Failure(cause) => Outcome::Failure(cause.clone()),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Outcome<T>),
}

pub struct Promise<T = ()> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Marks the promise succeeded. Returns `false` if it had already reached a terminal state.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Marks the promise failed with `cause`. Returns `false` if it was already done.
    pub fn try_failure(&self, cause: Cause) -> bool {
        self.complete(Outcome::Failure(cause))
    }

    /// Cancels the promise. Returns `false` if it was already done.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(Outcome::Success(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.state.lock(), State::Done(Outcome::Cancelled))
    }

    /// The terminal outcome, if the promise has one yet.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// Registers `listener` to run once the promise completes.
    ///
    /// Runs the listener right away, on the calling thread, when the promise is already done.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        listener(&outcome);
    }

    /// Waits for the terminal outcome.
    pub async fn wait(&self) -> Outcome<T> {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.add_listener(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        // the listener is owned by the promise state we hold, so the sender cannot be dropped
        // without firing
        rx.await
            .unwrap_or_else(|_| Outcome::Failure(ConnectError::ChannelClosed.into_cause()))
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Done(outcome.clone());
                    listeners
                }
            }
        };
        // listeners run without the lock held so they may touch this or any other promise
        for listener in listeners {
            listener(&outcome);
        }
        true
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            State::Pending(listeners) => format!("pending ({} listeners)", listeners.len()),
            State::Done(Outcome::Success(_)) => "succeeded".to_owned(),
            State::Done(Outcome::Failure(cause)) => format!("failed: {cause}"),
            State::Done(Outcome::Cancelled) => "cancelled".to_owned(),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
