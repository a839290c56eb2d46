//! Userspace network stack bridging a TUN device to connection-oriented
//! proxy handlers. A caller feeds raw IP frames in through [`Stack::write`]
//! and receives frames back out through the [`stack::OutputFn`] sink
//! supplied at construction; accepted TCP and UDP flows are handed to the
//! caller's [`TcpConnHandler`]/[`UdpConnHandler`] implementations as plain
//! async byte streams and datagram sockets.

pub mod checksum;
pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod lock;
pub mod logger;
pub mod pipe;
pub mod pool;
pub mod registry;
pub mod reply;
pub mod stack;
pub mod tcp;
pub mod timer;
pub mod udp;

pub use config::StackConfig;
pub use error::{StackError, StackResult};
pub use handler::{DnsCache, FakeDns, TcpConnHandler, UdpConnHandler};
pub use registry::AdapterId;
pub use stack::OutputFn;
pub use tcp::TcpConnection;
pub use timer::StopMode;
pub use udp::UdpConnection;

use stack::StackEngine;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// Entry point. Owns a single-worker-thread tokio runtime (mirroring the
/// stack lock's assumption that one thread drives the embedded stack) plus
/// the engine itself.
pub struct Stack {
    runtime: Runtime,
    engine: Arc<StackEngine>,
}

impl Stack {
    /// Builds a new stack with the given configuration, handler pair, and
    /// egress sink. Does not start the timeout-driving tick loop; call
    /// [`Stack::start_timeouts`] once the caller is ready to receive frames.
    pub fn new(
        config: StackConfig,
        tcp_handler: Arc<dyn TcpConnHandler>,
        udp_handler: Arc<dyn UdpConnHandler>,
        output: Arc<OutputFn>,
    ) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .enable_io()
            .build()?;
        let engine = {
            let _guard = runtime.enter();
            StackEngine::new(config, tcp_handler, udp_handler, output)
        };
        logger::breadcrumb(
            logger::BreadcrumbFlags::STACK,
            format!("stack initialized (mtu={}, ipv6={})", config.normalized_mtu(), config.enable_ipv6),
        );
        Ok(Self { runtime, engine })
    }

    /// Ingress entry point. Validates and admits `frame`, returning the
    /// number of bytes accepted and an error if the frame was rejected or
    /// the stack is closed.
    pub fn write(&self, frame: &[u8]) -> (usize, Option<StackError>) {
        self.engine.write(frame)
    }

    /// Starts the periodic tick that drives the embedded stack's timeouts
    /// and flow admission.
    pub fn start_timeouts(&self) {
        let _guard = self.runtime.enter();
        self.engine.start_timeouts();
    }

    /// Stops the tick loop, either immediately or after a delayed grace
    /// window, without touching live connections.
    pub fn stop_timeouts(&self, mode: StopMode) {
        let _guard = self.runtime.enter();
        self.engine.stop_timeouts(mode);
    }

    pub fn restart_timeouts(&self) {
        let _guard = self.runtime.enter();
        self.engine.restart_timeouts();
    }

    pub fn get_running(&self) -> bool {
        self.engine.get_running()
    }

    /// Aborts every live TCP connection, closes every live UDP flow, and
    /// stops the tick loop.
    pub fn close(&self, mode: StopMode) {
        let _guard = self.runtime.enter();
        self.engine.close(mode);
    }

    pub fn config(&self) -> StackConfig {
        self.engine.config()
    }
}
