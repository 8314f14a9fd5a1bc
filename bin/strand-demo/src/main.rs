//! Demonstration binary for the strand effect runtime.
//!
//! Loads its configuration from a YAML file and `STRAND_`-prefixed environment variables, builds a dedicated runtime,
//! and runs a pipeline of supervised jobs over a set of connections acquired as resources.

#![deny(warnings)]
#![deny(missing_docs)]

use std::time::Instant;

use clap::Parser as _;
use strand_app::prelude::*;
use strand_core::{DedicatedRuntime, Outcome};
use tracing::{error, info};

mod config;
use self::config::{load_configuration, Cli};

mod pipeline;
use self::pipeline::run_pipeline;

fn main() {
    let started = Instant::now();
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {:?}", e));
            return;
        }
    };

    let runtime = match DedicatedRuntime::from_configuration(config.runtime) {
        Ok(runtime) => runtime,
        Err(e) => {
            fatal_and_exit(format!("failed to build runtime: {}", e));
            return;
        }
    };

    match runtime.block_on(run_pipeline(config.pipeline)) {
        Outcome::Succeeded(summary) => info!(
            completed = summary.completed.len(),
            timed_out = summary.timed_out.len(),
            heartbeats = summary.heartbeats,
            elapsed = ?started.elapsed(),
            "Pipeline finished."
        ),
        Outcome::Errored(e) => {
            error!(error = %e, "Pipeline failed.");
            std::process::exit(1);
        }
        Outcome::Canceled => {
            error!("Pipeline was canceled.");
            std::process::exit(1);
        }
    }
}
