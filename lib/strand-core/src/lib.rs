//! Core primitives of the strand effect runtime.
//!
//! An effect ([`Io`]) is an immutable description of deferred, possibly asynchronous, possibly failing work. Nothing
//! happens when an effect is built: it is handed to a [`Runtime`], which evaluates it on a **fiber**, a lightweight
//! logical thread of execution driven by a trampolined run-loop.
//!
//! # Fibers
//!
//! Every fiber owns a run-loop that walks its effect with an explicit continuation stack, so deeply chained effects
//! never grow the native call stack. A fiber runs synchronously until it reaches an asynchronous boundary, at which
//! point it parks itself and hands control back to the scheduler. Whatever completes the boundary later resumes the
//! fiber, possibly on a different worker thread.
//!
//! Fibers can be joined ([`Fiber::join`]) and canceled ([`Fiber::cancel`]). Cancellation is cooperative: it is observed
//! at asynchronous boundaries, at the exit of uncancelable regions, and whenever a fiber yields. Once observed, the
//! fiber runs its registered finalizers and terminates as [`Outcome::Canceled`].
//!
//! # Resource safety
//!
//! [`Resource`] describes acquire/release pairs that compose sequentially and in parallel. Acquisition always happens
//! inside an uncancelable region, and every release action registered during acquisition runs exactly once, in reverse
//! order of acquisition, whether the consumer succeeds, fails, or is canceled.
//!
//! # Synchronization and supervision
//!
//! [`Deferred`] is a write-once cell that fibers can wait on, and [`Supervisor`] binds the lifecycle of child fibers
//! to a scope: when the scope closes, every child still running is canceled and awaited.
#![deny(warnings)]
#![deny(missing_docs)]

mod config;
pub use self::config::{RuntimeConfiguration, TracingConfiguration};

mod effect;
pub use self::effect::{Callback, Either, ExitCase, Io, Outcome, Poll, TimeoutError};

mod error;
pub use self::error::EffectError;

mod fiber;
pub use self::fiber::{Fiber, FiberError, FiberId};

pub mod resource;
pub use self::resource::Resource;

pub mod runtime;
pub use self::runtime::{DedicatedRuntime, Runtime};

pub mod supervisor;
pub use self::supervisor::Supervisor;

pub mod sync;
pub use self::sync::Deferred;

pub mod trace;
