use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use snafu::ResultExt as _;
use tracing::debug;

use super::{Build, Runtime, RuntimeError};
use crate::{Io, Outcome, RuntimeConfiguration};

/// A runtime that owns its Tokio worker threads.
///
/// Used by programs that do not otherwise run inside Tokio: the dedicated runtime is built from the runtime
/// configuration, and effects are run to completion with [`block_on`][Self::block_on].
pub struct DedicatedRuntime {
    tokio: tokio::runtime::Runtime,
    runtime: Runtime,
}

impl DedicatedRuntime {
    /// Builds a dedicated runtime from the given configuration.
    ///
    /// A single worker thread uses Tokio's "current thread" runtime, and anything more uses the multi-threaded runtime,
    /// with worker threads named `strand-worker-NN`.
    ///
    /// ## Errors
    ///
    /// If the underlying Tokio runtime cannot be built, an error is returned.
    pub fn from_configuration(config: RuntimeConfiguration) -> Result<Self, RuntimeError> {
        let worker_threads = config.worker_threads();
        let tokio = build_tokio_runtime(worker_threads).context(Build)?;
        debug!(worker_threads, "Built dedicated runtime.");

        let runtime = Runtime::from_handle(tokio.handle().clone(), config);
        Ok(Self { tokio, runtime })
    }

    /// Returns the runtime that schedules onto the dedicated threads.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Runs `io` on a new fiber, blocking the current thread until it terminates.
    pub fn block_on<A: Send + 'static>(&self, io: Io<A>) -> Outcome<A> {
        self.tokio.block_on(self.runtime.run(io))
    }
}

fn build_tokio_runtime(worker_threads: usize) -> std::io::Result<tokio::runtime::Runtime> {
    if worker_threads == 1 {
        return tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("strand-worker-00")
            .build();
    }

    let thread_id = Arc::new(AtomicUsize::new(0));
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .thread_name_fn(move || {
            let new_thread_id = thread_id.fetch_add(1, Ordering::SeqCst);
            format!("strand-worker-{:02}", new_thread_id)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_worker_runs_effects() {
        let runtime = DedicatedRuntime::from_configuration(RuntimeConfiguration::default().with_worker_threads(1)).unwrap();
        let outcome = runtime.block_on(Io::pure(20).flat_map(|v| Io::delay(move || v + 1)));
        assert!(matches!(outcome, Outcome::Succeeded(21)));
    }

    #[test]
    fn workers_are_named() {
        let runtime = DedicatedRuntime::from_configuration(RuntimeConfiguration::default().with_worker_threads(2)).unwrap();
        let name = runtime.block_on(Io::delay(|| std::thread::current().name().map(str::to_string)));
        match name {
            Outcome::Succeeded(Some(name)) => assert!(name.starts_with("strand-worker-"), "unexpected name {}", name),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
