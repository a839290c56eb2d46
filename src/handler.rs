//! External interfaces: the handler traits a caller implements to receive
//! terminated TCP and UDP flows, plus the DNS side-module traits for
//! collaborators whose implementation lives outside this crate.
//!
//! Handler methods are async but the traits are used as `Arc<dyn Trait>`, so
//! they return a boxed future by hand rather than depending on an
//! `async-trait`-style macro crate the rest of the stack doesn't otherwise
//! need.

use crate::tcp::TcpConnection;
use crate::udp::UdpConnection;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Invoked once per accepted TCP connection, on a freshly spawned task.
/// Returning an error triggers `Abort` on the connection.
pub trait TcpConnHandler: Send + Sync + 'static {
    fn handle(&self, conn: TcpConnection, remote_addr: SocketAddr) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Invoked once per new UDP flow (`connect`), then once per datagram
/// delivered after a successful connect (`receive_to`).
pub trait UdpConnHandler: Send + Sync + 'static {
    fn connect(&self, conn: UdpConnection, remote_addr: SocketAddr) -> BoxFuture<'static, anyhow::Result<()>>;

    fn receive_to(
        &self,
        conn: UdpConnection,
        data: Vec<u8>,
        dst_addr: SocketAddr,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// A cached DNS answer, keyed by the caller on the first question of a
/// request. Implementation lives outside this crate; the stack only ever
/// consults it through this interface.
pub trait DnsCache: Send + Sync + 'static {
    /// Looks up a previously stored answer for `payload` (a raw DNS
    /// request), returning the cached response bytes if present and unexpired.
    fn query(&self, payload: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Stores a DNS response, keyed by its first question. TTL is taken from
    /// the first answer record.
    fn store(&self, payload: &[u8]) -> anyhow::Result<()>;
}

/// Synthesizes fake A/AAAA answers for domains the caller wants to route
/// through the tunnel without a real upstream resolver.
pub trait FakeDns: Send + Sync + 'static {
    /// Builds a synthetic single-question A/AAAA response with TTL 1.
    fn generate_fake_response(&self, request: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Reverse-maps a previously issued fake address back to its domain.
    fn query_domain(&self, ip: std::net::IpAddr) -> Option<String>;

    fn is_fake_ip(&self, ip: std::net::IpAddr) -> bool;
}
