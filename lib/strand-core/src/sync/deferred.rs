use std::sync::{Arc, Mutex};

use slab::Slab;
use snafu::Snafu;

use super::lock;
use crate::{Callback, EffectError, Io};

/// Deferred error.
#[derive(Debug, Snafu)]
pub enum DeferredError {
    /// The deferred value was already set.
    #[snafu(display("Deferred value was already set."))]
    AlreadySet,
}

enum State<A> {
    Unset(Slab<Callback<A>>),
    Set(A),
}

/// A write-once cell that fibers can wait on.
///
/// `Deferred` starts out empty. Fibers calling [`get`][Self::get] suspend until a value is written, and every waiter
/// observes the same value. Exactly one write ever succeeds.
///
/// Handles are cheap to clone, and all clones refer to the same cell.
pub struct Deferred<A> {
    state: Arc<Mutex<State<A>>>,
}

impl<A> Clone for Deferred<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A> Deferred<A>
where
    A: Clone + Send + 'static,
{
    /// Creates an empty `Deferred`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Unset(Slab::new()))),
        }
    }

    /// Returns an effect which creates an empty `Deferred`.
    pub fn make() -> Io<Self> {
        Io::delay(Self::new)
    }

    /// Returns an effect which waits for the value to be written.
    ///
    /// If the value is already set, it is returned immediately. If the waiting fiber is canceled, its registration is
    /// removed and no value is delivered to it.
    pub fn get(&self) -> Io<A> {
        let state = Arc::clone(&self.state);
        Io::async_(move |callback: Callback<A>| {
            let key = match &mut *lock(&state) {
                State::Set(value) => {
                    callback.succeed(value.clone());
                    return None;
                }
                State::Unset(waiters) => waiters.insert(callback),
            };

            Some(Io::delay(move || {
                if let State::Unset(waiters) = &mut *lock(&state) {
                    waiters.try_remove(key);
                }
            }))
        })
    }

    /// Returns an effect which reads the value without waiting.
    pub fn try_get(&self) -> Io<Option<A>> {
        let state = Arc::clone(&self.state);
        Io::delay(move || match &*lock(&state) {
            State::Set(value) => Some(value.clone()),
            State::Unset(_) => None,
        })
    }

    /// Returns an effect which writes the value and wakes every waiter.
    ///
    /// ## Errors
    ///
    /// If the value was already set, the effect fails with [`DeferredError::AlreadySet`] and the stored value is left
    /// unchanged.
    pub fn complete(&self, value: A) -> Io<()> {
        let state = Arc::clone(&self.state);
        Io::defer(move || {
            if set_value(&state, value) {
                Io::unit()
            } else {
                Io::raise_error(EffectError::new(DeferredError::AlreadySet))
            }
        })
    }

    /// Returns an effect which writes the value if it is not yet set.
    ///
    /// Resolves to `true` if this call set the value.
    pub fn try_complete(&self, value: A) -> Io<bool> {
        let state = Arc::clone(&self.state);
        Io::delay(move || set_value(&state, value))
    }
}

impl<A> Default for Deferred<A>
where
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn set_value<A: Clone + Send + 'static>(state: &Mutex<State<A>>, value: A) -> bool {
    let waiters = {
        let mut state = lock(state);
        match &mut *state {
            State::Set(_) => return false,
            State::Unset(waiters) => {
                let waiters = std::mem::take(waiters);
                *state = State::Set(value.clone());
                waiters
            }
        }
    };

    for (_, callback) in waiters {
        callback.succeed(value.clone());
    }
    true
}
