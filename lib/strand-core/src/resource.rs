//! Composable resource acquisition and release.
use std::{
    panic::Location,
    sync::{Arc, Mutex},
};

use crate::{sync::lock, trace::TraceKind, EffectError, ExitCase, FiberError, Io};

/// Releases an acquired resource, given how its use terminated.
pub type Finalizer = Box<dyn FnOnce(ExitCase) -> Io<()> + Send>;

type SharedFinalizer = Arc<Mutex<Option<Finalizer>>>;

/// A description of an acquire/release pair producing a value of type `A`.
///
/// A `Resource` does nothing until used. [`use_`][Resource::use_] acquires it, runs a consumer with the acquired value,
/// and then releases it, whatever way the consumer terminated.
///
/// Acquisition always runs uncancelably, so a resource is either fully acquired, with its release registered, or not
/// acquired at all. Release actions of composed resources run exactly once, in reverse order of acquisition, and when a
/// release action fails the remaining ones still run.
pub struct Resource<A> {
    allocate: Io<(A, Finalizer)>,
}

impl<A: Send + 'static> Resource<A> {
    /// Creates a resource from an acquisition effect and a release function.
    #[track_caller]
    pub fn make<R>(acquire: Io<A>, release: R) -> Self
    where
        A: Clone,
        R: FnOnce(A) -> Io<()> + Send + 'static,
    {
        Self::make_case_at(Location::caller(), acquire, move |value, _| release(value))
    }

    /// Creates a resource whose release function observes how the use of the resource terminated.
    #[track_caller]
    pub fn make_case<R>(acquire: Io<A>, release: R) -> Self
    where
        A: Clone,
        R: FnOnce(A, ExitCase) -> Io<()> + Send + 'static,
    {
        Self::make_case_at(Location::caller(), acquire, release)
    }

    fn make_case_at<R>(location: &'static Location<'static>, acquire: Io<A>, release: R) -> Self
    where
        A: Clone,
        R: FnOnce(A, ExitCase) -> Io<()> + Send + 'static,
    {
        let allocate = Io::uncancelable(move |_| {
            acquire.traced(TraceKind::Acquire, location).map_at(None, move |value: A| {
                let handle = value.clone();
                let finalizer: Finalizer =
                    Box::new(move |case| release(handle, case).traced(TraceKind::Release, location));
                (value, finalizer)
            })
        });
        Self { allocate }
    }

    /// Creates a resource from an effect producing the value together with its release action.
    pub fn from_allocated(allocated: Io<(A, Io<()>)>) -> Self {
        let allocate = Io::uncancelable(move |_| {
            allocated.map_at(None, |(value, release)| {
                let finalizer: Finalizer = Box::new(move |_| release);
                (value, finalizer)
            })
        });
        Self { allocate }
    }

    /// Creates a resource that needs no release.
    pub fn pure(value: A) -> Self {
        Self {
            allocate: Io::pure_at(None, (value, noop_finalizer())),
        }
    }

    /// Creates a resource from an effect that needs no release.
    pub fn eval(acquire: Io<A>) -> Self {
        Self {
            allocate: acquire.map_at(None, |value| (value, noop_finalizer())),
        }
    }

    /// Acquires the resource, runs `f` with it, and releases it.
    ///
    /// `f` runs cancelably. If it fails, a failure of the release is attached to its error as a suppressed error.
    pub fn use_<B, F>(self, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Io<B> + Send + 'static,
    {
        let allocate = self.allocate;
        Io::uncancelable(move |poll| {
            allocate.flat_map_at(None, move |(value, release)| {
                poll.apply(Io::defer(move || f(value))).guarantee_case(release)
            })
        })
    }

    /// Acquires the resource, returning the value together with its release action.
    ///
    /// The caller becomes responsible for running the release action.
    pub fn allocated(self) -> Io<(A, Io<()>)> {
        self.allocate.map_at(None, |(value, release)| {
            (value, Io::defer(move || release(ExitCase::Succeeded)))
        })
    }

    /// Acquires the resource, returning the value together with a release function that takes the exit case.
    pub fn allocated_case(self) -> Io<(A, Finalizer)> {
        self.allocate
    }

    /// Transforms the acquired value.
    pub fn map<B, F>(self, f: F) -> Resource<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |value| Resource::pure(f(value)))
    }

    /// Acquires a dependent resource built from the acquired value.
    ///
    /// The dependent resource is released before this one. If acquiring the dependent resource fails or is canceled,
    /// this one is released before the failure propagates.
    pub fn flat_map<B, F>(self, f: F) -> Resource<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Resource<B> + Send + 'static,
    {
        let allocate = self.allocate;
        let allocate = Io::uncancelable(move |poll| {
            allocate.flat_map_at(None, move |(value, release_outer)| {
                let outer: SharedFinalizer = Arc::new(Mutex::new(Some(release_outer)));
                let on_cancel = Arc::clone(&outer);
                let on_error = Arc::clone(&outer);

                poll.apply(Io::defer(move || f(value).allocate))
                    .on_cancel(Io::defer(move || release_shared(&on_cancel, ExitCase::Canceled)))
                    .handle_error_with(move |e| {
                        release_shared(&on_error, exit_case_of(&e))
                            .attempt()
                            .flat_map_at(None, move |released| Io::raise_error(e.suppressing(released.err())))
                    })
                    .map_at(None, move |(inner_value, release_inner)| {
                        let finalizer: Finalizer = Box::new(move |case: ExitCase| {
                            let outer_case = case.clone();
                            release_in_sequence(
                                release_inner(case),
                                Io::defer(move || release_shared(&outer, outer_case)),
                            )
                        });
                        (inner_value, finalizer)
                    })
            })
        });
        Resource { allocate }
    }

    /// Registers an additional release action that runs after the existing ones.
    pub fn on_finalize(self, finalizer: Io<()>) -> Self {
        self.on_finalize_case(move |_| finalizer)
    }

    /// Registers an additional release action, observing the exit case, that runs after the existing ones.
    pub fn on_finalize_case<F>(self, finalizer: F) -> Self
    where
        F: FnOnce(ExitCase) -> Io<()> + Send + 'static,
    {
        let allocate = self.allocate.map_at(None, move |(value, release)| {
            let combined: Finalizer = Box::new(move |case: ExitCase| {
                let extra_case = case.clone();
                release_in_sequence(release(case), Io::defer(move || finalizer(extra_case)))
            });
            (value, combined)
        });
        Self { allocate }
    }

    /// Acquires both resources concurrently.
    ///
    /// Both are released concurrently as well. If one acquisition fails or is canceled, the other is canceled, and
    /// whatever was acquired is released before the failure or cancellation propagates.
    pub fn both<B>(self, other: Resource<B>) -> Resource<(A, B)>
    where
        B: Send + 'static,
    {
        let left: SharedFinalizer = Arc::new(Mutex::new(None));
        let right: SharedFinalizer = Arc::new(Mutex::new(None));

        let acquire_left = stash(self.allocate, Arc::clone(&left));
        let acquire_right = stash(other.allocate, Arc::clone(&right));

        let allocate = Io::uncancelable(move |poll| {
            let (cancel_left, cancel_right) = (Arc::clone(&left), Arc::clone(&right));
            let (error_left, error_right) = (Arc::clone(&left), Arc::clone(&right));

            poll.apply(acquire_left.both(acquire_right))
                .on_cancel(Io::defer(move || {
                    release_in_parallel(&cancel_left, &cancel_right, ExitCase::Canceled)
                }))
                .handle_error_with(move |e| {
                    release_in_parallel(&error_left, &error_right, exit_case_of(&e))
                        .attempt()
                        .flat_map_at(None, move |released| Io::raise_error(e.suppressing(released.err())))
                })
                .map_at(None, move |pair| {
                    let finalizer: Finalizer = Box::new(move |case| release_in_parallel(&left, &right, case));
                    (pair, finalizer)
                })
        });
        Resource { allocate }
    }

    /// Acquires every resource in order, releasing them in reverse order.
    pub fn sequence(resources: Vec<Resource<A>>) -> Resource<Vec<A>> {
        resources.into_iter().fold(Resource::pure(Vec::new()), |acc, resource| {
            acc.flat_map(move |mut values| {
                resource.map(move |value| {
                    values.push(value);
                    values
                })
            })
        })
    }

    /// Acquires every resource concurrently, releasing them concurrently.
    pub fn par_sequence(mut resources: Vec<Resource<A>>) -> Resource<Vec<A>> {
        match resources.len() {
            0 => Resource::pure(Vec::new()),
            1 => match resources.pop() {
                Some(resource) => resource.map(|value| vec![value]),
                None => Resource::pure(Vec::new()),
            },
            len => {
                let right = resources.split_off(len / 2);
                Resource::par_sequence(resources)
                    .both(Resource::par_sequence(right))
                    .map(|(mut left, right)| {
                        left.extend(right);
                        left
                    })
            }
        }
    }
}

/// How a release action sees an acquisition that unwound with `e`.
///
/// A cancellation that an enclosing region still masks unwinds as [`FiberError::Canceled`].
fn exit_case_of(e: &EffectError) -> ExitCase {
    match e.downcast_ref::<FiberError>() {
        Some(FiberError::Canceled) => ExitCase::Canceled,
        _ => ExitCase::Errored(e.clone()),
    }
}

fn noop_finalizer() -> Finalizer {
    Box::new(|_| Io::unit())
}

/// Acquires uncancelably, parking the release action in `cell` before the acquisition region exits.
fn stash<A: Send + 'static>(allocate: Io<(A, Finalizer)>, cell: SharedFinalizer) -> Io<A> {
    Io::uncancelable(move |_| {
        allocate.map_at(None, move |(value, release)| {
            *lock(&cell) = Some(release);
            value
        })
    })
}

/// Runs the release action parked in `cell`, if it has not run yet.
fn release_shared(cell: &SharedFinalizer, case: ExitCase) -> Io<()> {
    let release = lock(cell).take();
    match release {
        Some(release) => release(case),
        None => Io::unit(),
    }
}

/// Runs `first` then `second`, even if `first` fails, reporting the first failure.
fn release_in_sequence(first: Io<()>, second: Io<()>) -> Io<()> {
    first
        .attempt()
        .flat_map_at(None, move |first| second.attempt().flat_map_at(None, move |second| combine(first, second)))
}

/// Runs both parked release actions concurrently.
fn release_in_parallel(left: &SharedFinalizer, right: &SharedFinalizer, case: ExitCase) -> Io<()> {
    let release_left = release_shared(left, case.clone()).attempt();
    let release_right = release_shared(right, case).attempt();
    release_left
        .both(release_right)
        .flat_map_at(None, |(left, right)| combine(left, right))
}

fn combine(first: Result<(), EffectError>, second: Result<(), EffectError>) -> Io<()> {
    match (first, second) {
        (Ok(()), Ok(())) => Io::unit(),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Io::raise_error(e),
        (Err(first), Err(second)) => Io::raise_error(first.suppressing(Some(second))),
    }
}
