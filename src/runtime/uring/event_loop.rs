//! io_uring event loop for one shard.
//!
//! Completion-based model: queue operations, submit them, block for at
//! least one completion, then drain and dispatch the whole batch before
//! checking the stop flag again.

use super::handler::{EchoProtocol, Operations, ShardStats};
use super::ring::RingContext;
use crate::runtime::{sys, BufferPool, SlotTable, StopFlag};
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tracing::{error, info, trace, warn};

/// Memory a shard owns for its whole life.
///
/// Allocated by the coordinator before any shard starts and handed back to
/// it when the shard thread finishes.
pub struct ShardResources {
    pub slots: SlotTable,
    pub buffers: BufferPool,
}

/// Fixed parameters of one shard.
#[derive(Debug, Clone)]
pub struct ShardParams {
    pub id: usize,
    pub core: usize,
    pub addr: SocketAddr,
    pub backlog: i32,
    pub queue_depth: u32,
    pub wait_timeout: Duration,
    pub max_message_len: usize,
}

/// How a shard ended.
#[derive(Debug)]
pub enum ShardOutcome {
    /// Listener or ring setup failed; the error went to the coordinator.
    NeverStarted,
    /// Observed the stop flag and shut down.
    Stopped(ShardStats),
    /// The loop hit an unrecoverable ring error.
    Failed(ShardStats, io::Error),
    /// The shard thread panicked.
    Panicked,
}

/// Body of a shard thread.
///
/// Reports the bound listener address (or the setup error) on `ready`
/// before entering the loop.
pub fn run_shard(
    params: &ShardParams,
    resources: &mut ShardResources,
    stop: StopFlag,
    ready: Sender<io::Result<SocketAddr>>,
) -> ShardOutcome {
    let shard = params.id;

    if let Err(e) = sys::pin_to_core(params.core) {
        warn!(shard, core = params.core, error = %e, "Failed to pin shard to core");
    }

    let (mut ctx, local_addr) = match open_ring(params, resources) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return ShardOutcome::NeverStarted;
        }
    };

    if !ctx.has_fast_poll() {
        warn!(shard, "FAST_POLL not available; continuing but expect higher latency");
    }

    info!(
        shard,
        core = params.core,
        addr = %local_addr,
        listener_fd = ctx.listener_fd(),
        queue_depth = params.queue_depth,
        "Ring online"
    );
    let _ = ready.send(Ok(local_addr));

    let mut protocol = EchoProtocol::new(params.max_message_len);
    let result = serve(&mut ctx, &mut protocol, stop);
    let stats = protocol.stats();

    info!(
        shard,
        accepted = stats.accepted,
        rejected = stats.rejected,
        closed = stats.closed,
        bytes_echoed = stats.bytes_echoed,
        "Shard shutting down"
    );
    let abandoned = ctx.shutdown();
    if abandoned > 0 {
        info!(shard, connections = abandoned, "Closed open connections");
    }

    match result {
        Ok(()) => ShardOutcome::Stopped(stats),
        Err(e) => {
            error!(shard, error = %e, "Shard loop failed");
            ShardOutcome::Failed(stats, e)
        }
    }
}

/// Bind the listener, create the ring and queue the first accept.
fn open_ring<'a>(
    params: &ShardParams,
    resources: &'a mut ShardResources,
) -> io::Result<(RingContext<'a>, SocketAddr)> {
    let listener = create_listener_with_reuseport(params.addr, params.backlog)?;
    let mut ctx = RingContext::new(
        params.queue_depth,
        params.wait_timeout,
        listener,
        &mut resources.slots,
        &mut resources.buffers,
    )?;
    let local_addr = ctx.local_addr()?;
    ctx.prepare_accept()?;
    Ok((ctx, local_addr))
}

/// Run until the stop flag is observed at an iteration boundary.
fn serve(
    ctx: &mut RingContext<'_>,
    protocol: &mut EchoProtocol,
    stop: StopFlag,
) -> io::Result<()> {
    while !stop.is_stopped() {
        ctx.submit()?;

        if !ctx.wait_for_completion()? {
            continue;
        }

        let batch = ctx.drain_ready();
        let mut result = Ok(());
        for &completion in &batch {
            match protocol.dispatch(ctx, completion) {
                Ok(transition) => trace!(?transition, "Dispatched completion"),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        ctx.recycle(batch);
        result?;
    }

    Ok(())
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(
    addr: SocketAddr,
    backlog: i32,
) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_share_a_port() {
        let first = create_listener_with_reuseport("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = first.local_addr().unwrap();

        let second = create_listener_with_reuseport(addr, 16).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let (tx, rx) = std::sync::mpsc::channel();
        let params = ShardParams {
            id: 0,
            core: 0,
            // TEST-NET-1 is never a local address
            addr: "192.0.2.1:9000".parse().unwrap(),
            backlog: 16,
            queue_depth: 8,
            wait_timeout: Duration::from_millis(10),
            max_message_len: 64,
        };
        let mut resources = ShardResources {
            slots: SlotTable::new(16).unwrap(),
            buffers: BufferPool::new(16, 64).unwrap(),
        };

        let outcome = run_shard(&params, &mut resources, StopFlag::detached(), tx);
        assert!(matches!(outcome, ShardOutcome::NeverStarted));
        assert!(rx.recv().unwrap().is_err());
    }
}
