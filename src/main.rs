//! reqrep-loadtest: a request/reply load generator
//!
//! Runs either side of a request/reply exchange over TCP:
//! - server: many workers receive a request, sleep for the delay it
//!   names, then echo the rest back
//! - client: workers send requests with a randomized delay and print
//!   one `.` per completed round trip
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod harness;
mod message;
mod protocol;
mod runtime;
mod worker;

use config::{Config, RoleConfig};
use harness::{Harness, HarnessError};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use worker::DotProgress;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to stderr; stdout carries only the progress dots.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let threads = config.threads.unwrap_or_else(num_cpus);
    info!(
        role = ?config.role,
        threads,
        idle_interval_secs = config.idle_interval.as_secs(),
        "Starting reqrep-loadtest"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), HarnessError> {
    let harness = match &config.role {
        RoleConfig::Server(server) => Harness::server(server).await?,
        RoleConfig::Client(client) => Harness::client(client, Arc::new(DotProgress)).await?,
    };
    harness.run(config.idle_interval).await
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
