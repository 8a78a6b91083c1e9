//! Harness driver.
//!
//! Sets up one socket for the configured role, builds the whole worker batch
//! up front, starts every worker once, then idles. All further progress
//! happens inside the worker tasks as their operations complete. The driver
//! only wakes periodically to log counters, and returns when a worker fails.

use crate::config::{ClientConfig, ServerConfig};
use crate::protocol::DelayPolicy;
use crate::runtime::{AioStats, Endpoint, RepSocket, ReqSocket, TransportError};
use crate::worker::{self, ClientWorker, Counters, Progress, ServerWorker, Worker, WorkerError};
use std::collections::TryReserveError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Harness setup and run failures.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("allocating {count} workers failed: {source}")]
    Alloc {
        count: usize,
        source: TryReserveError,
    },
    #[error("listen: {endpoint}: {source}")]
    Listen {
        endpoint: Endpoint,
        source: TransportError,
    },
    #[error("dial: {endpoint}: {source}")]
    Dial {
        endpoint: Endpoint,
        source: TransportError,
    },
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("all workers exited")]
    NoWorkers,
}

/// Which role the harness plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// A running set of workers.
pub struct Harness {
    role: Role,
    workers: JoinSet<Result<(), WorkerError>>,
    counters: Arc<Counters>,
    op_stats: Vec<Arc<AioStats>>,
    /// Kept alive for the lifetime of the harness.
    _rep: Option<RepSocket>,
    _req: Option<ReqSocket>,
}

impl Harness {
    /// Bind the server endpoint and start `config.workers` server workers.
    pub async fn server(config: &ServerConfig) -> Result<Self, HarnessError> {
        let socket = RepSocket::listen(&config.endpoint)
            .await
            .map_err(|source| HarnessError::Listen {
                endpoint: config.endpoint.clone(),
                source,
            })?;
        let counters = Arc::new(Counters::default());

        let mut batch = alloc_batch(config.workers)?;
        for id in 0..config.workers {
            batch.push(ServerWorker::new(id, socket.context(), Arc::clone(&counters)));
        }

        let local_addr = socket.local_addr();
        let mut harness = Self::new(Role::Server, counters);
        harness.start(batch);
        harness._rep = Some(socket);

        info!(
            address = %local_addr,
            workers = config.workers,
            "Server workers started"
        );
        Ok(harness)
    }

    /// Dial the server once per worker and start `config.workers` client
    /// workers reporting round trips to `progress`.
    pub async fn client(
        config: &ClientConfig,
        progress: Arc<dyn Progress>,
    ) -> Result<Self, HarnessError> {
        let socket = ReqSocket::new();
        let counters = Arc::new(Counters::default());
        let delay = DelayPolicy::new(config.max_delay_ms);

        let mut batch = alloc_batch(config.workers)?;
        for id in 0..config.workers {
            // One pipe per worker so each exercises its own connection.
            socket
                .dial(&config.endpoint)
                .await
                .map_err(|source| HarnessError::Dial {
                    endpoint: config.endpoint.clone(),
                    source,
                })?;
            batch.push(ClientWorker::new(
                id,
                socket.context(),
                delay,
                config.seed,
                Arc::clone(&counters),
                Arc::clone(&progress),
            ));
        }

        let mut harness = Self::new(Role::Client, counters);
        harness.start(batch);
        harness._req = Some(socket);

        info!(
            endpoint = %config.endpoint,
            workers = config.workers,
            max_delay_ms = config.max_delay_ms,
            "Client workers started"
        );
        Ok(harness)
    }

    fn new(role: Role, counters: Arc<Counters>) -> Self {
        Self {
            role,
            workers: JoinSet::new(),
            counters,
            op_stats: Vec::new(),
            _rep: None,
            _req: None,
        }
    }

    /// Move each worker into its own task, where it takes its first step.
    fn start<W: Worker>(&mut self, batch: Vec<W>) {
        self.op_stats.reserve(batch.len());
        for mut worker in batch {
            self.op_stats.push(worker.aio().stats());
            self.workers.spawn(worker::drive(worker));
        }
    }

    /// Role-wide round trip and malformed request counters.
    #[cfg(test)]
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Operation counters of every worker, in worker order.
    #[cfg(test)]
    pub fn op_stats(&self) -> &[Arc<AioStats>] {
        &self.op_stats
    }

    /// Bound address of a server harness.
    #[cfg(test)]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self._rep.as_ref().map(RepSocket::local_addr)
    }

    /// Idle until a worker fails, waking every `idle_interval`.
    ///
    /// Never returns `Ok`: workers run forever unless one fails.
    pub async fn run(mut self, idle_interval: Duration) -> Result<(), HarnessError> {
        let mut idle = tokio::time::interval(idle_interval);
        // The first tick of an interval fires immediately.
        idle.tick().await;

        loop {
            tokio::select! {
                _ = idle.tick() => {
                    let in_flight: u64 = self.op_stats.iter().map(|s| s.outstanding()).sum();
                    debug!(
                        role = ?self.role,
                        round_trips = self.counters.round_trips(),
                        malformed = self.counters.malformed(),
                        in_flight,
                        "Idle wake"
                    );
                }
                joined = self.workers.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => return Err(e.into()),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(HarnessError::NoWorkers),
                },
            }
        }
    }

    /// Stop every worker and wait for their tasks to end.
    #[cfg(test)]
    pub async fn shutdown(mut self) {
        self.workers.shutdown().await;
    }
}

fn alloc_batch<W>(count: usize) -> Result<Vec<W>, HarnessError> {
    let mut batch = Vec::new();
    batch
        .try_reserve_exact(count)
        .map_err(|source| HarnessError::Alloc { count, source })?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::{CountingProgress, RecordingProgress};
    use std::time::Instant;

    async fn server(workers: usize) -> Harness {
        let config = ServerConfig {
            endpoint: "tcp://127.0.0.1:0".parse().unwrap(),
            workers,
        };
        Harness::server(&config).await.unwrap()
    }

    fn client_config(server: &Harness, workers: usize, max_delay_ms: u32) -> ClientConfig {
        ClientConfig {
            endpoint: Endpoint::from_addr(server.local_addr().unwrap()),
            workers,
            max_delay_ms,
            seed: Some(1),
        }
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trips_match_ticks() {
        const ROUND_TRIPS: u64 = 200;

        let server = server(4).await;
        let progress = Arc::new(CountingProgress::default());
        let client = Harness::client(&client_config(&server, 1, 0), progress.clone())
            .await
            .unwrap();
        let counters = Arc::clone(client.counters());

        wait_for("round trips", || counters.round_trips() >= ROUND_TRIPS).await;
        client.shutdown().await;

        assert_eq!(progress.count(), counters.round_trips());
        assert!(progress.count() >= ROUND_TRIPS);
        // Every reply the client counted was sent by the server, which
        // records it one step after queueing it
        let sent = Arc::clone(server.counters());
        wait_for("server count", || sent.round_trips() >= progress.count()).await;
        assert_eq!(server.counters().malformed(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_delay_paces_requests() {
        const REQUESTS: usize = 50;

        let server = server(1).await;
        let progress = Arc::new(RecordingProgress::default());
        let client = Harness::client(&client_config(&server, 1, 100), progress.clone())
            .await
            .unwrap();

        wait_for("paced round trips", || progress.ticks().len() > REQUESTS).await;
        client.shutdown().await;

        let ticks = progress.ticks();
        for pair in ticks.windows(2).take(REQUESTS) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(50), "gap {gap:?} below 50ms");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_operation_per_worker_under_load() {
        let server = server(4).await;
        let progress = Arc::new(CountingProgress::default());
        let client = Harness::client(&client_config(&server, 8, 2), progress.clone())
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(300);
        while Instant::now() < deadline {
            for stats in server.op_stats().iter().chain(client.op_stats()) {
                assert!(stats.outstanding() <= 1);
            }
            tokio::task::yield_now().await;
        }

        // Every worker did real work while being sampled
        assert!(client.op_stats().iter().all(|s| s.completed() > 0));
        assert!(progress.count() > 0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_close_ends_run_with_worker_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            endpoint: Endpoint::from_addr(listener.local_addr().unwrap()),
            workers: 1,
            max_delay_ms: 0,
            seed: None,
        };
        let client = Harness::client(&config, Arc::new(CountingProgress::default()))
            .await
            .unwrap();

        // Accept, then hang up without replying
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.run(Duration::from_millis(10)),
        )
        .await
        .expect("run did not return")
        .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Worker(WorkerError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = ClientConfig {
            endpoint: Endpoint::from_addr(addr),
            workers: 1,
            max_delay_ms: 0,
            seed: None,
        };

        let err = Harness::client(&config, Arc::new(CountingProgress::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::Dial { .. }));
        assert!(err.to_string().starts_with("dial: tcp://127.0.0.1:"));
    }
}
