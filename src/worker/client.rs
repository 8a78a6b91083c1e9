//! Client worker: send a request naming a delay, wait for the reply, repeat.
//!
//! ```text
//! Compose ──► Sending ──► Receiving ─┐
//!    ▲                               │ tick
//!    └───────────────────────────────┘
//! ```
//!
//! A completed round trip composes the next request in the same step, so
//! a worker runs as fast as replies arrive unless its delay paces it.

use crate::message::Message;
use crate::protocol::{encode_delay, DelayPolicy};
use crate::runtime::{Aio, OpKind, ReqContext};
use crate::worker::{Counters, Progress, Worker, WorkerError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// Next action of a client worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Build and send the next request.
    Compose,
    /// Waiting for the request send to complete.
    Sending,
    /// Waiting for the reply.
    Receiving,
}

pub struct ClientWorker {
    id: usize,
    phase: ClientPhase,
    ctx: ReqContext,
    aio: Aio,
    delay: DelayPolicy,
    rng: StdRng,
    counters: Arc<Counters>,
    progress: Arc<dyn Progress>,
}

impl ClientWorker {
    /// Create a worker.
    ///
    /// With a `seed`, worker `id` draws delays from `seed + id`; otherwise
    /// from OS entropy.
    pub fn new(
        id: usize,
        ctx: ReqContext,
        delay: DelayPolicy,
        seed: Option<u64>,
        counters: Arc<Counters>,
        progress: Arc<dyn Progress>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            phase: ClientPhase::Compose,
            ctx,
            aio: Aio::new(),
            delay,
            rng,
            counters,
            progress,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    fn compose(&mut self) -> Result<(), WorkerError> {
        let mut msg = Message::new();
        encode_delay(&mut msg, self.delay.choose(&mut self.rng));

        self.aio.set_msg(msg);
        self.phase = ClientPhase::Sending;
        self.ctx.send(&mut self.aio)?;
        Ok(())
    }
}

impl Worker for ClientWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn aio(&mut self) -> &mut Aio {
        &mut self.aio
    }

    fn step(&mut self) -> Result<(), WorkerError> {
        match self.phase {
            ClientPhase::Compose => self.compose(),

            ClientPhase::Sending => {
                self.aio
                    .result()
                    .map_err(|e| WorkerError::transport(OpKind::Send, e))?;
                self.phase = ClientPhase::Receiving;
                self.ctx.recv(&mut self.aio)?;
                Ok(())
            }

            ClientPhase::Receiving => {
                self.aio
                    .result()
                    .map_err(|e| WorkerError::transport(OpKind::Recv, e))?;
                // Only the round trip matters; the reply is discarded unread.
                drop(self.aio.take_msg());

                self.counters.record_round_trip();
                self.progress.tick();

                self.phase = ClientPhase::Compose;
                self.compose()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Endpoint, ReqSocket};
    use crate::worker::drive;
    use crate::worker::testing::CountingProgress;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one request frame, returning (request id, body).
    async fn read_request(stream: &mut TcpStream) -> Option<(u32, Vec<u8>)> {
        let len = stream.read_u32().await.ok()? as usize;
        let id = stream.read_u32().await.ok()?;
        let mut body = vec![0u8; len - 4];
        stream.read_exact(&mut body).await.ok()?;
        Some((id, body))
    }

    async fn write_reply(stream: &mut TcpStream, id: u32) {
        let mut frame = 4u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&id.to_be_bytes());
        stream.write_all(&frame).await.unwrap();
    }

    async fn peer() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn client(
        addr: SocketAddr,
        max_delay: u32,
        progress: Arc<CountingProgress>,
    ) -> (ReqSocket, ClientWorker, Arc<Counters>) {
        let socket = ReqSocket::new();
        socket.dial(&Endpoint::from_addr(addr)).await.unwrap();
        let counters = Arc::new(Counters::default());
        let worker = ClientWorker::new(
            0,
            socket.context(),
            DelayPolicy::new(max_delay),
            Some(11),
            Arc::clone(&counters),
            progress,
        );
        (socket, worker, counters)
    }

    #[tokio::test]
    async fn test_phase_cycle() {
        let (listener, addr) = peer().await;
        let progress = Arc::new(CountingProgress::default());
        let (_socket, mut worker, counters) = client(addr, 0, Arc::clone(&progress)).await;
        let (mut server, _) = listener.accept().await.unwrap();

        assert_eq!(worker.phase(), ClientPhase::Compose);
        worker.step().unwrap();
        assert_eq!(worker.phase(), ClientPhase::Sending);

        assert_eq!(worker.aio().wait().await, Some(OpKind::Send));
        worker.step().unwrap();
        assert_eq!(worker.phase(), ClientPhase::Receiving);

        let (id, body) = read_request(&mut server).await.unwrap();
        assert_eq!(body, vec![0, 0, 0, 0]);
        write_reply(&mut server, id).await;

        assert_eq!(worker.aio().wait().await, Some(OpKind::Recv));
        worker.step().unwrap();

        // The next request was composed and submitted in the same step
        assert_eq!(worker.phase(), ClientPhase::Sending);
        assert_eq!(worker.aio().outstanding(), Some(OpKind::Send));
        assert_eq!(counters.round_trips(), 1);
        assert_eq!(progress.count(), 1);
    }

    #[tokio::test]
    async fn test_request_delay_in_upper_half() {
        let (listener, addr) = peer().await;
        let progress = Arc::new(CountingProgress::default());
        let (_socket, worker, _counters) = client(addr, 100, progress).await;
        let (mut server, _) = listener.accept().await.unwrap();
        tokio::spawn(drive(worker));

        for _ in 0..50 {
            let (id, body) = read_request(&mut server).await.unwrap();
            assert_eq!(body.len(), 4);
            let delay = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            assert!((50..100).contains(&delay), "delay {delay} out of range");
            write_reply(&mut server, id).await;
        }
    }

    #[tokio::test]
    async fn test_seeded_delays_repeat() {
        let mut first = Vec::new();
        let mut second = Vec::new();

        for delays in [&mut first, &mut second] {
            let (listener, addr) = peer().await;
            let progress = Arc::new(CountingProgress::default());
            let (_socket, worker, _counters) = client(addr, 1000, progress).await;
            let (mut server, _) = listener.accept().await.unwrap();
            let task = tokio::spawn(drive(worker));

            for _ in 0..5 {
                let (id, body) = read_request(&mut server).await.unwrap();
                delays.push(body);
                write_reply(&mut server, id).await;
            }
            task.abort();
        }

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_peer_close_is_fatal() {
        let (listener, addr) = peer().await;
        let progress = Arc::new(CountingProgress::default());
        let (_socket, worker, _counters) = client(addr, 0, Arc::clone(&progress)).await;
        let (mut server, _) = listener.accept().await.unwrap();
        let task = tokio::spawn(drive(worker));

        read_request(&mut server).await.unwrap();
        drop(server);

        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker did not fail")
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Transport {
                op: OpKind::Recv,
                ..
            }
        ));
        assert_eq!(progress.count(), 0);
    }
}
