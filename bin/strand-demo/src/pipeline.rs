use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use strand_core::{resource::Resource, Fiber, Io, Supervisor, TimeoutError};
use tracing::{debug, info, warn};

use crate::config::PipelineConfiguration;

/// A simulated connection, opened and closed as a resource.
#[derive(Clone, Debug)]
pub struct Connection {
    id: usize,
}

/// What a pipeline run accomplished.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Summary {
    /// Jobs that completed within the timeout.
    pub completed: Vec<usize>,

    /// Jobs that were canceled by the timeout.
    pub timed_out: Vec<usize>,

    /// Heartbeats emitted by the background monitor before it was canceled.
    pub heartbeats: u64,
}

fn connection(id: usize) -> Resource<Connection> {
    Resource::make(
        Io::delay(move || {
            debug!(connection_id = id, "Opened connection.");
            Connection { id }
        }),
        |connection| Io::delay(move || debug!(connection_id = connection.id, "Closed connection.")),
    )
}

fn job(connection: Connection, duration: Duration, timeout: Duration) -> Io<Result<usize, usize>> {
    let id = connection.id;
    Io::sleep(duration)
        .then(Io::pure(id))
        .timeout(timeout)
        .attempt()
        .flat_map(move |result| match result {
            Ok(id) => Io::pure(Ok(id)),
            Err(e) if e.is::<TimeoutError>() => {
                warn!(connection_id = id, "Job timed out.");
                Io::pure(Err(id))
            }
            Err(e) => Io::raise_error(e),
        })
}

fn heartbeat(interval: Duration, beats: Arc<AtomicU64>) -> Io<()> {
    Io::sleep(interval).flat_map(move |_| {
        let total = beats.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(beats = total, "Heartbeat.");
        heartbeat(interval, beats)
    })
}

/// Opens every connection in parallel, runs one supervised job per connection alongside a heartbeat monitor, and
/// returns once all jobs have completed or timed out.
///
/// The monitor is still running when the jobs finish, so it is canceled when the supervisor's scope exits.
pub fn run_pipeline(config: PipelineConfiguration) -> Io<Summary> {
    Io::defer(move || {
        let beats = Arc::new(AtomicU64::new(0));
        let monitor_beats = Arc::clone(&beats);
        let connections = Resource::par_sequence((0..config.connections).map(connection).collect());

        connections
            .use_(move |connections| {
                info!(connections = connections.len(), "Connections ready.");
                Supervisor::scope().use_(move |supervisor| {
                    let monitor = supervisor.supervise(heartbeat(config.heartbeat_interval(), monitor_beats));
                    let jobs = connections
                        .into_iter()
                        .map(|connection| {
                            let duration = config.job_duration(connection.id);
                            supervisor.supervise(job(connection, duration, config.job_timeout()))
                        })
                        .collect::<Vec<_>>();

                    monitor
                        .then(Io::par_sequence(jobs))
                        .flat_map(|fibers| Io::par_sequence(fibers.iter().map(Fiber::join_with_value).collect()))
                })
            })
            .map(move |results| {
                let mut summary = Summary {
                    heartbeats: beats.load(Ordering::Relaxed),
                    ..Summary::default()
                };
                for result in results {
                    match result {
                        Ok(id) => summary.completed.push(id),
                        Err(id) => summary.timed_out.push(id),
                    }
                }
                summary
            })
    })
}

#[cfg(test)]
mod tests {
    use strand_core::{Outcome, Runtime};

    use super::*;

    fn config(connections: usize) -> PipelineConfiguration {
        PipelineConfiguration {
            connections,
            job_duration_ms: 100,
            job_timeout_ms: 250,
            heartbeat_interval_ms: 50,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_jobs_time_out() {
        let runtime = Runtime::try_current().unwrap();

        match runtime.run(run_pipeline(config(4))).await {
            Outcome::Succeeded(summary) => {
                assert_eq!(summary.completed, vec![0, 1]);
                assert_eq!(summary.timed_out, vec![2, 3]);
                assert!(summary.heartbeats >= 4, "only {} heartbeats", summary.heartbeats);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_connections_means_no_jobs() {
        let runtime = Runtime::try_current().unwrap();

        let outcome = runtime.run(run_pipeline(config(0))).await;
        assert!(matches!(outcome, Outcome::Succeeded(summary) if summary.completed.is_empty() && summary.timed_out.is_empty()));
    }
}
