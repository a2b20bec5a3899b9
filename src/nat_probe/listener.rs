/**
 * nat_probe/listener.rs
 *
 * Keep a NAT mapping alive on the fixed port and report what arrives on it
 */

use crate::nat_probe::stun::{parse_binding_response, MappedAddress, StunError, StunHeader};
use crate::nat_probe::transport::{Resolver, Transport};
use crate::nat_probe::types::{ProbeError, StunServer};
use crate::nat_probe::ProbeSession;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Refresh period for the STUN mapping
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// How long one receive waits before housekeeping runs
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Something observed while listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEvent {
    /// A refresh reported a different public address
    MappingChanged {
        old: MappedAddress,
        new: MappedAddress,
    },
    /// A refresh confirmed the current public address
    MappingRefreshed(MappedAddress),
    /// STUN response that matches no outstanding request
    LateStunResponse { from: SocketAddr },
    /// Matched STUN response without a usable address
    InvalidStunResponse { from: SocketAddr, error: StunError },
    /// Anything that is not a STUN response, e.g. a peer's hello
    PeerDatagram { from: SocketAddr, text: String },
    /// A refresh could not be sent or was not answered in time
    RefreshFailed { reason: ProbeError },
}

/// Listens on one bound endpoint while periodically refreshing its mapping
pub struct MappingListener<'r, T, R> {
    session: ProbeSession<'r, T, R>,
    server: StunServer,
    external: MappedAddress,
    keepalive_interval: Duration,
}

impl<'r, T: Transport, R: Resolver> MappingListener<'r, T, R> {
    /// Learn the public mapping through `server`.
    ///
    /// On failure the transport is closed and the probe error returned.
    pub async fn start(
        transport: T,
        resolver: &'r R,
        server: StunServer,
        response_timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let mut session = ProbeSession::new(transport, resolver, response_timeout);

        match session.probe_server(&server.host, server.port).await {
            Ok(external) => {
                tracing::info!(%server, public = %external, "Initial mapping discovered");
                Ok(Self {
                    session,
                    server,
                    external,
                    keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
                })
            }
            Err(e) => {
                if let Err(close_err) = session.close() {
                    tracing::warn!(error = %close_err, "Failed to close transport");
                }
                Err(e)
            }
        }
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Current public address
    pub fn external(&self) -> MappedAddress {
        self.external
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.session.local_addr()
    }

    /// Receive until `shutdown` resolves, then close the transport
    pub async fn run<F, S>(mut self, mut on_event: F, shutdown: S) -> io::Result<()>
    where
        F: FnMut(ListenEvent),
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut next_refresh = Instant::now() + self.keepalive_interval;

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = self.session.transport.recv_timeout(POLL_INTERVAL) => received,
            };

            match received {
                Ok(Some((datagram, from))) => self.handle_datagram(&datagram, from, &mut on_event),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Receive failed"),
            }

            for (id, request) in self.session.pending.expire(self.session.response_timeout) {
                tracing::debug!(transaction = %id, server = %request.server, "Refresh expired");
                on_event(ListenEvent::RefreshFailed {
                    reason: ProbeError::Timeout,
                });
            }

            if Instant::now() >= next_refresh {
                if let Err(reason) = self
                    .session
                    .send_request(&self.server.host, self.server.port)
                    .await
                {
                    on_event(ListenEvent::RefreshFailed { reason });
                }
                next_refresh = Instant::now() + self.keepalive_interval;
            }
        }

        self.session.close()
    }

    fn handle_datagram<F: FnMut(ListenEvent)>(&mut self, datagram: &[u8], from: SocketAddr, on_event: &mut F) {
        let is_stun = StunHeader::parse(datagram)
            .map(|header| header.is_binding_response())
            .unwrap_or(false);

        if !is_stun {
            on_event(ListenEvent::PeerDatagram {
                from,
                text: String::from_utf8_lossy(datagram).into_owned(),
            });
            return;
        }

        if self.session.pending.claim(datagram).is_none() {
            on_event(ListenEvent::LateStunResponse { from });
            return;
        }

        match parse_binding_response(datagram) {
            Ok(mapped) if mapped != self.external => {
                let old = std::mem::replace(&mut self.external, mapped);
                tracing::info!(%old, new = %mapped, "Public mapping changed");
                on_event(ListenEvent::MappingChanged { old, new: mapped });
            }
            Ok(mapped) => on_event(ListenEvent::MappingRefreshed(mapped)),
            Err(error) => on_event(ListenEvent::InvalidStunResponse { from, error }),
        }
    }
}
