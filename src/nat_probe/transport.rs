/**
 * nat_probe/transport.rs
 *
 * Datagram transport and hostname resolution used by the probes
 */

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Receive buffer size for STUN responses
const RECV_BUFFER_SIZE: usize = 1024;

/// A bound datagram endpoint
#[async_trait]
pub trait Transport: Send {
    /// Local address the endpoint is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Send one datagram
    async fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Wait up to `timeout` for one datagram; `Ok(None)` on timeout
    async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;

    /// Release the endpoint
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Transport over a tokio UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:local_port`
    pub async fn bind(local_port: u16) -> io::Result<Self> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], local_port))).await
    }

    /// Bind to a specific address; fails if the port is already taken
    pub async fn bind_addr(local_addr: SocketAddr) -> io::Result<Self> {
        let domain = match local_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };

        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(false)?;
        socket.bind(&local_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        tracing::debug!(local = %socket.local_addr()?, "UDP transport bound");

        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&mut self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest).await
    }

    async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buffer)).await {
            Ok(Ok((len, from))) => {
                buffer.truncate(len);
                Ok(Some((buffer, from)))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    fn close(self) -> io::Result<()> {
        let local = self.socket.local_addr()?;
        drop(self.socket);
        tracing::debug!(%local, "UDP transport closed");
        Ok(())
    }
}

/// Hostname to IPv4 resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_ipv4(&self, host: &str) -> Option<Ipv4Addr>;
}

/// System resolver via `tokio::net::lookup_host`
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve_ipv4(&self, host: &str) -> Option<Ipv4Addr> {
        let addrs = match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(host, error = %e, "DNS lookup failed");
                return None;
            }
        };

        addrs
            .map(|addr| addr.ip())
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
    }
}
