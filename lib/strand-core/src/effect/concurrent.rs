use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{Callback, Io, Outcome, Poll, TimeoutError};
use crate::{sync::lock, EffectError, Fiber, FiberError};

/// A value of one of two types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Either<L, R> {
    /// The left value.
    Left(L),

    /// The right value.
    Right(R),
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

/// Race result exposing the loser as a live fiber.
type RacePair<A, B> = Either<(Outcome<A>, Fiber<B>), (Fiber<A>, Outcome<B>)>;

impl<A: Send + 'static> Io<A> {
    /// Runs both effects concurrently, returning the outcome of the first to terminate and the other, still running,
    /// as a fiber.
    ///
    /// If the current fiber is canceled while waiting, both fibers are canceled.
    pub fn race_pair<B>(self, other: Io<B>) -> Io<RacePair<A, B>>
    where
        B: Send + 'static,
    {
        Io::uncancelable(move |poll| {
            self.start().flat_map_at(None, move |left| {
                other.start().flat_map_at(None, move |right| {
                    let on_cancel = cancel_both(left.clone(), right.clone());
                    poll.apply(first_done(left.clone(), right.clone()))
                        .on_cancel(on_cancel)
                        .flat_map_at(None, move |side| match side {
                            Side::Left => left.join_taken().map_at(None, move |outcome| Either::Left((outcome, right))),
                            Side::Right => {
                                right.join_taken().map_at(None, move |outcome| Either::Right((left, outcome)))
                            }
                        })
                })
            })
        })
    }

    /// Runs both effects concurrently, returning the value of the first to succeed and canceling the other.
    ///
    /// If the first effect to terminate fails, the other is canceled and the error is raised. If it is canceled, the
    /// result is that of the other effect.
    pub fn race<B>(self, other: Io<B>) -> Io<Either<A, B>>
    where
        B: Send + 'static,
    {
        Io::uncancelable(move |poll| {
            poll.apply(self.race_pair(other)).flat_map_at(None, move |winner| match winner {
                Either::Left((outcome, loser)) => match outcome {
                    Outcome::Succeeded(a) => loser.cancel().map_at(None, move |_| Either::Left(a)),
                    Outcome::Errored(e) => loser.cancel().then(Io::raise_error(e)),
                    Outcome::Canceled => await_survivor(poll, loser).map_at(None, Either::Right),
                },
                Either::Right((loser, outcome)) => match outcome {
                    Outcome::Succeeded(b) => loser.cancel().map_at(None, move |_| Either::Right(b)),
                    Outcome::Errored(e) => loser.cancel().then(Io::raise_error(e)),
                    Outcome::Canceled => await_survivor(poll, loser).map_at(None, Either::Left),
                },
            })
        })
    }

    /// Runs both effects concurrently and pairs their values.
    ///
    /// If either effect fails, the other is canceled and the error is raised. If either is canceled, the other is
    /// canceled too and the current fiber is canceled.
    pub fn both<B>(self, other: Io<B>) -> Io<(A, B)>
    where
        B: Send + 'static,
    {
        Io::uncancelable(move |poll| {
            poll.apply(self.race_pair(other)).flat_map_at(None, move |winner| match winner {
                Either::Left((outcome, right)) => match outcome {
                    Outcome::Succeeded(a) => await_survivor(poll, right).map_at(None, move |b| (a, b)),
                    Outcome::Errored(e) => right.cancel().then(Io::raise_error(e)),
                    Outcome::Canceled => right.cancel().then(cancel_self(poll)),
                },
                Either::Right((left, outcome)) => match outcome {
                    Outcome::Succeeded(b) => await_survivor(poll, left).map_at(None, move |a| (a, b)),
                    Outcome::Errored(e) => left.cancel().then(Io::raise_error(e)),
                    Outcome::Canceled => left.cancel().then(cancel_self(poll)),
                },
            })
        })
    }

    /// Runs every effect concurrently, collecting their values in order.
    ///
    /// The effects are combined pairwise with [`both`][Self::both], so the first failure cancels everything still
    /// running.
    pub fn par_sequence(mut effects: Vec<Io<A>>) -> Io<Vec<A>> {
        match effects.len() {
            0 => Io::pure_at(None, Vec::new()),
            1 => match effects.pop() {
                Some(effect) => effect.map_at(None, |value| vec![value]),
                None => Io::pure_at(None, Vec::new()),
            },
            len => {
                let right = effects.split_off(len / 2);
                Io::par_sequence(effects)
                    .both(Io::par_sequence(right))
                    .map_at(None, |(mut left, right)| {
                        left.extend(right);
                        left
                    })
            }
        }
    }

    /// Runs every effect concurrently, discarding their values.
    pub fn par_sequence_discard(effects: Vec<Io<A>>) -> Io<()> {
        Io::par_sequence(effects).void()
    }

    /// Fails with [`TimeoutError::Elapsed`] if this effect does not complete within `duration`.
    ///
    /// The effect is canceled when the timeout fires.
    pub fn timeout(self, duration: Duration) -> Io<A> {
        let elapsed = Io::raise_error(EffectError::new(TimeoutError::Elapsed { duration }));
        self.timeout_to(duration, elapsed)
    }

    /// Falls back to `fallback` if this effect does not complete within `duration`.
    ///
    /// The effect is canceled when the timeout fires.
    pub fn timeout_to(self, duration: Duration, fallback: Io<A>) -> Io<A> {
        self.race(Io::sleep(duration)).flat_map_at(None, move |winner| match winner {
            Either::Left(value) => Io::pure_at(None, value),
            Either::Right(()) => fallback,
        })
    }
}

/// Waits for the fiber that outlived its sibling, canceling it if the current fiber is canceled meanwhile.
fn await_survivor<A: Send + 'static>(poll: Poll, survivor: Fiber<A>) -> Io<A> {
    let on_cancel = survivor.cancel();
    poll.apply(survivor.join_taken())
        .on_cancel(on_cancel)
        .flat_map_at(None, move |outcome| match outcome {
            Outcome::Succeeded(value) => Io::pure_at(None, value),
            Outcome::Errored(e) => Io::raise_error(e),
            Outcome::Canceled => cancel_self(poll),
        })
}

/// Cancels the current fiber from within a masked region.
///
/// When an enclosing region still masks the cancellation, [`FiberError::Canceled`] is raised instead, unwinding the
/// enclosing regions until the fiber leaves the outermost one and observes the cancellation.
fn cancel_self<A: Send + 'static>(poll: Poll) -> Io<A> {
    poll.apply(Io::canceled())
        .then(Io::raise_error(EffectError::new(FiberError::Canceled)))
}

fn cancel_both<A, B>(left: Fiber<A>, right: Fiber<B>) -> Io<()>
where
    A: Send + 'static,
    B: Send + 'static,
{
    Io::delay_at(None, move || {
        left.request_cancel();
        right.request_cancel();
        (left, right)
    })
    .flat_map_at(None, |(left, right)| left.await_done().then(right.await_done()))
}

/// Resolves with the side whose fiber terminates first.
fn first_done<A, B>(left: Fiber<A>, right: Fiber<B>) -> Io<Side>
where
    A: Send + 'static,
    B: Send + 'static,
{
    Io::async_at(None, move |callback: Callback<Side>| {
        let callback = Arc::new(Mutex::new(Some(callback)));
        let notify = |side: Side| {
            let callback = Arc::clone(&callback);
            move || {
                if let Some(callback) = lock(&callback).take() {
                    callback.succeed(side);
                }
            }
        };

        let left_key = left.on_done(Box::new(notify(Side::Left)));
        let right_key = right.on_done(Box::new(notify(Side::Right)));

        Some(Io::delay_at(None, move || {
            if let Some(key) = left_key {
                left.remove_waiter(key);
            }
            if let Some(key) = right_key {
                right.remove_waiter(key);
            }
        }))
    })
}
