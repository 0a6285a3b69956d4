//! Shard coordinator.
//!
//! Allocates every shard's memory up front, starts shards one at a time so
//! each can report its bound address, and joins them all before releasing
//! that memory.

use super::event_loop::{self, ShardOutcome, ShardParams, ShardResources};
use crate::config::Config;
use crate::runtime::{sys, BufferPool, SlotTable, StartupError, StopFlag};
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

struct ShardExit {
    outcome: ShardOutcome,
    resources: ShardResources,
}

struct ShardHandle {
    id: usize,
    core: usize,
    local_addr: Option<SocketAddr>,
    thread: JoinHandle<ShardExit>,
}

/// Final state of one shard.
#[derive(Debug)]
pub struct ShardReport {
    pub id: usize,
    pub core: usize,
    pub local_addr: Option<SocketAddr>,
    pub outcome: ShardOutcome,
}

/// A running set of shards sharing one port.
pub struct Server {
    shards: Vec<ShardHandle>,
    local_addr: SocketAddr,
    stop: StopFlag,
}

impl Server {
    /// Start one shard per configured (or available) core.
    ///
    /// Returns once every shard has either come online or failed. Shards
    /// that fail to bind or set up their ring are logged and left out; the
    /// server only fails if none came up.
    pub fn start(config: &Config, stop: StopFlag) -> Result<Self, StartupError> {
        let mut addr = config.listen_addr().map_err(StartupError::Config)?;
        let cores = num_cpus();
        let shard_count = if config.shards == 0 {
            cores
        } else {
            config.shards
        };

        match sys::raise_fd_limit(config.fd_limit()) {
            Ok(limit) => debug!(limit, "Open file limit"),
            Err(e) => warn!(
                wanted = config.fd_limit(),
                error = %e,
                "Failed to raise open file limit"
            ),
        }

        // All-or-nothing: no shard starts unless every shard's memory exists
        let mut resources = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let slots = SlotTable::new(config.max_fds)
                .map_err(|e| StartupError::Alloc(io::Error::new(io::ErrorKind::OutOfMemory, e)))?;
            let buffers = BufferPool::new(config.max_fds, config.max_message_len)
                .map_err(StartupError::Alloc)?;
            resources.push(ShardResources { slots, buffers });
        }

        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        let wait_timeout = Duration::from_millis(config.wait_timeout_ms);

        let mut shards: Vec<ShardHandle> = Vec::with_capacity(shard_count);
        let mut bound = None;

        for (id, mut shard_resources) in resources.into_iter().enumerate() {
            let params = ShardParams {
                id,
                core: id % cores,
                addr,
                backlog,
                queue_depth: config.queue_depth,
                wait_timeout,
                max_message_len: config.max_message_len,
            };
            let core = params.core;
            let (ready_tx, ready_rx) = mpsc::channel();

            let spawned = thread::Builder::new()
                .name(format!("shard-{id}"))
                .spawn(move || {
                    let outcome =
                        event_loop::run_shard(&params, &mut shard_resources, stop, ready_tx);
                    ShardExit {
                        outcome,
                        resources: shard_resources,
                    }
                });

            let thread = match spawned {
                Ok(thread) => thread,
                Err(e) => {
                    stop.request_stop();
                    join_all(shards);
                    return Err(StartupError::Spawn(e));
                }
            };

            let local_addr = match ready_rx.recv() {
                Ok(Ok(local)) => {
                    // Port 0: every later shard joins the port the kernel picked
                    if addr.port() == 0 {
                        addr.set_port(local.port());
                    }
                    bound.get_or_insert(local);
                    Some(local)
                }
                Ok(Err(e)) => {
                    error!(shard = id, error = %e, "Shard failed to start");
                    None
                }
                Err(_) => {
                    error!(shard = id, "Shard exited before reporting readiness");
                    None
                }
            };

            shards.push(ShardHandle {
                id,
                core,
                local_addr,
                thread,
            });
        }

        let local_addr = match bound {
            Some(addr) => addr,
            None => {
                join_all(shards);
                return Err(StartupError::NoShards);
            }
        };

        Ok(Server {
            shards,
            local_addr,
            stop,
        })
    }

    /// Address the shards are listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of shards that came online.
    pub fn shard_count(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.local_addr.is_some())
            .count()
    }

    /// Block until every shard has observed the stop flag and exited.
    pub fn join(self) -> Vec<ShardReport> {
        join_all(self.shards)
    }

    /// Set the stop flag, then join.
    #[allow(dead_code)] // the binary stops through signals
    pub fn shutdown(self) -> Vec<ShardReport> {
        self.stop.request_stop();
        self.join()
    }
}

fn join_all(shards: Vec<ShardHandle>) -> Vec<ShardReport> {
    let mut reports = Vec::with_capacity(shards.len());
    let mut released = Vec::with_capacity(shards.len());

    for shard in shards {
        let outcome = match shard.thread.join() {
            Ok(exit) => {
                released.push(exit.resources);
                exit.outcome
            }
            Err(_) => {
                error!(shard = shard.id, "Shard panicked");
                ShardOutcome::Panicked
            }
        };
        reports.push(ShardReport {
            id: shard.id,
            core: shard.core,
            local_addr: shard.local_addr,
            outcome,
        });
    }

    // Arenas go only after no shard can still be using them
    drop(released);
    reports
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::uring::handler::ShardStats;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(shards: usize) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            shards,
            queue_depth: 64,
            wait_timeout_ms: 20,
            max_fds: 4096,
            max_message_len: 2048,
            ..Config::default()
        }
    }

    /// Start a server, or `None` where the kernel refuses io_uring.
    fn start(config: &Config) -> Option<Server> {
        if io_uring::IoUring::new(8).is_err() {
            eprintln!("io_uring unavailable, skipping");
            return None;
        }
        Some(Server::start(config, StopFlag::detached()).expect("server starts"))
    }

    fn stats(report: &ShardReport) -> ShardStats {
        match &report.outcome {
            ShardOutcome::Stopped(stats) => *stats,
            other => panic!("shard {} ended with {:?}", report.id, other),
        }
    }

    #[tokio::test]
    async fn test_ping_then_pong() {
        let Some(server) = start(&test_config(1)) else {
            return;
        };

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 4];

        stream.write_all(b"ping").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stream.write_all(b"pong").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(stream);
        let reports = server.shutdown();
        assert_eq!(stats(&reports[0]).accepted, 1);
    }

    #[tokio::test]
    async fn test_full_length_payload() {
        let Some(server) = start(&test_config(1)) else {
            return;
        };

        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(&payload).await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        drop(stream);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_silent_client_close() {
        let Some(server) = start(&test_config(1)) else {
            return;
        };

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.shutdown().await.unwrap();

        // Server sees a zero-length read and closes without sending anything
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        let reports = server.shutdown();
        let stats = stats(&reports[0]);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.bytes_echoed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_clients_are_isolated() {
        let Some(server) = start(&test_config(2)) else {
            return;
        };
        let addr = server.local_addr();

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        a.write_all(b"a").await.unwrap();
        b.write_all(b"b").await.unwrap();

        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a");

        drop((a, b));
        let reports = server.shutdown();
        let accepted: u64 = reports.iter().map(|r| stats(r).accepted).sum();
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn test_many_clients_echo_their_own_bytes() {
        let Some(server) = start(&test_config(2)) else {
            return;
        };
        let addr = server.local_addr();

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            tasks.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let msg = [i; 32];
                for _ in 0..4 {
                    stream.write_all(&msg).await.unwrap();
                    let mut buf = [0u8; 32];
                    stream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(buf, msg);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_descriptor_over_ceiling_is_closed() {
        // With a single slot every accepted descriptor is over the ceiling
        let config = Config {
            max_fds: 1,
            ..test_config(1)
        };
        let Some(server) = start(&config) else {
            return;
        };

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        match stream.read(&mut buf).await {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }

        let reports = server.shutdown();
        let stats = stats(&reports[0]);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_and_closes_connections() {
        let Some(server) = start(&test_config(2)) else {
            return;
        };
        let port = server.local_addr().port();
        assert_eq!(server.shard_count(), 2);

        // An idle client keeps a receive in flight on its shard
        let mut idle = TcpStream::connect(server.local_addr()).await.unwrap();
        idle.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        idle.read_exact(&mut buf).await.unwrap();

        let started = Instant::now();
        let reports = server.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(matches!(report.outcome, ShardOutcome::Stopped(_)));
            assert_eq!(report.local_addr.map(|a| a.port()), Some(port));
        }

        // The open connection was closed on the way out
        let n = idle.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_no_shard_can_bind() {
        let config = Config {
            host: "192.0.2.1".to_string(),
            ..test_config(1)
        };
        let result = Server::start(&config, StopFlag::detached());
        assert!(matches!(result, Err(StartupError::NoShards)));
    }

    #[test]
    fn test_invalid_address() {
        let config = Config {
            host: "nowhere".to_string(),
            ..test_config(1)
        };
        let result = Server::start(&config, StopFlag::detached());
        assert!(matches!(result, Err(StartupError::Config(_))));
    }
}
