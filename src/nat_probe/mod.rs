/**
 * nat_probe/mod.rs
 *
 * NAT mapping detection implementing:
 * - Minimal STUN Binding Request / Response codec
 * - Transaction matched probes from one fixed local UDP port
 * - Endpoint independent / dependent classification
 * - Mapping watch and hello sender for hole punching checks
 */

mod hello;
mod listener;
mod pending;
mod stun;
mod transport;
mod types;

pub use hello::{HelloSender, HELLO_INTERVAL};
pub use listener::{ListenEvent, MappingListener, DEFAULT_KEEPALIVE_INTERVAL};
pub use pending::{PendingRequest, PendingTransactions};
pub use stun::{
    decode_binding_response, encode_binding_response, padded_len, parse_binding_response,
    AddressFamily, Attributes, BindingRequest, MappedAddress, StunAttribute, StunError,
    StunHeader, TransactionId, ATTR_MAPPED_ADDRESS, STUN_BINDING_REQUEST, STUN_BINDING_RESPONSE,
    STUN_HEADER_SIZE, STUN_MAGIC_COOKIE,
};
pub use transport::{DnsResolver, Resolver, Transport, UdpTransport};
pub use types::{
    DetectionReport, DetectorConfig, NatClassification, ProbeError, ProbeResult,
    ServerParseError, StunServer, DEFAULT_LOCAL_PORT, DEFAULT_PROBE_INTERVAL,
    DEFAULT_RESPONSE_TIMEOUT, DEFAULT_STUN_PORT, DEFAULT_STUN_SERVERS,
};

use anyhow::{Context, Result};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::time::Instant;

/// One bound endpoint plus the requests outstanding on it.
///
/// Probes run strictly one after another; a datagram is only accepted if
/// it answers the request currently in flight.
pub struct ProbeSession<'r, T, R> {
    transport: T,
    resolver: &'r R,
    pending: PendingTransactions,
    response_timeout: Duration,
}

impl<'r, T: Transport, R: Resolver> ProbeSession<'r, T, R> {
    pub fn new(transport: T, resolver: &'r R, response_timeout: Duration) -> Self {
        Self {
            transport,
            resolver,
            pending: PendingTransactions::new(),
            response_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Send one Binding Request to `host:port` and wait for its response
    pub async fn probe_server(&mut self, host: &str, port: u16) -> Result<MappedAddress, ProbeError> {
        let transaction_id = self.send_request(host, port).await?;

        let outcome = self.await_response(&transaction_id).await;
        if outcome.is_err() {
            self.pending.cancel(&transaction_id);
        }
        outcome
    }

    /// Resolve `host`, register a fresh request and send it without waiting
    pub async fn send_request(&mut self, host: &str, port: u16) -> Result<TransactionId, ProbeError> {
        // Resolution is not retried
        let ip = self
            .resolver
            .resolve_ipv4(host)
            .await
            .ok_or_else(|| ProbeError::Resolution {
                host: host.to_string(),
            })?;
        let server = SocketAddrV4::new(ip, port);

        // Register before sending so a fast response cannot be missed
        let request = BindingRequest::new();
        self.pending.register(request.transaction_id, server);

        if let Err(e) = self
            .transport
            .send_to(&request.encode(), SocketAddr::V4(server))
            .await
        {
            self.pending.cancel(&request.transaction_id);
            return Err(e.into());
        }

        tracing::debug!(
            %server,
            transaction = %request.transaction_id,
            "Binding Request sent"
        );

        Ok(request.transaction_id)
    }

    async fn await_response(&mut self, transaction_id: &TransactionId) -> Result<MappedAddress, ProbeError> {
        let deadline = Instant::now() + self.response_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProbeError::Timeout);
            }

            let Some((datagram, from)) = self.transport.recv_timeout(remaining).await? else {
                return Err(ProbeError::Timeout);
            };

            match self.pending.claim(&datagram) {
                Some((id, request)) if id == *transaction_id => {
                    tracing::debug!(
                        %from,
                        rtt_ms = request.sent_at.elapsed().as_millis() as u64,
                        "Binding Response received"
                    );
                    return parse_binding_response(&datagram).map_err(ProbeError::from);
                }
                Some((id, _)) => {
                    tracing::debug!(%from, transaction = %id, "Dropping response for another request");
                }
                None => {
                    tracing::debug!(%from, len = datagram.len(), "Dropping stale or unsolicited datagram");
                }
            }
        }
    }

    /// Release the transport
    pub fn close(self) -> io::Result<()> {
        self.transport.close()
    }
}

/// Drives the probes of one detection run and classifies the result
pub struct NatDetector<R = DnsResolver> {
    config: DetectorConfig,
    resolver: R,
}

impl NatDetector<DnsResolver> {
    /// Detector using the system resolver
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_resolver(config, DnsResolver)
    }
}

impl<R: Resolver> NatDetector<R> {
    pub fn with_resolver(config: DetectorConfig, resolver: R) -> Self {
        Self { config, resolver }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Bind the configured local port and run every probe from it
    pub async fn detect(&self) -> Result<DetectionReport> {
        let transport = UdpTransport::bind(self.config.local_port)
            .await
            .with_context(|| format!("Failed to bind UDP port {}", self.config.local_port))?;

        Ok(self.detect_on(transport).await)
    }

    /// Probe every configured server over an already bound transport.
    ///
    /// Never fails: unreachable servers just leave their result empty.
    /// The transport is closed before returning.
    pub async fn detect_on<T: Transport>(&self, transport: T) -> DetectionReport {
        let local_port = transport
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.local_port);

        let mut session = ProbeSession::new(transport, &self.resolver, self.config.response_timeout);
        let mut results = Vec::with_capacity(self.config.servers.len());

        for server in &self.config.servers {
            tracing::info!(%server, local_port, "Probing STUN server");

            let outcome = session.probe_server(&server.host, server.port).await;
            match &outcome {
                Ok(mapped) => tracing::info!(%server, public = %mapped, "Public mapping discovered"),
                Err(e) => tracing::warn!(%server, error = %e, "Probe failed"),
            }
            results.push(ProbeResult::new(server, outcome));

            tokio::time::sleep(self.config.probe_interval).await;
        }

        if let Err(e) = session.close() {
            tracing::warn!(error = %e, "Failed to close transport");
        }

        let report = DetectionReport::new(local_port, results);
        tracing::info!(classification = %report.classification, "NAT mapping detection finished");
        report
    }

    /// Probe a single server from the configured local port
    pub async fn probe_once(&self, server: &StunServer) -> Result<ProbeResult> {
        let transport = UdpTransport::bind(self.config.local_port)
            .await
            .with_context(|| format!("Failed to bind UDP port {}", self.config.local_port))?;

        let mut session = ProbeSession::new(transport, &self.resolver, self.config.response_timeout);
        let outcome = session.probe_server(&server.host, server.port).await;

        if let Err(e) = session.close() {
            tracing::warn!(error = %e, "Failed to close transport");
        }

        Ok(ProbeResult::new(server, outcome))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    const SERVER_A: [u8; 4] = [192, 0, 2, 10];
    const SERVER_B: [u8; 4] = [198, 51, 100, 20];

    fn fast_config(servers: &[&str]) -> DetectorConfig {
        DetectorConfig {
            servers: servers.iter().map(|s| s.parse().unwrap()).collect(),
            local_port: DEFAULT_LOCAL_PORT,
            response_timeout: Duration::from_millis(100),
            probe_interval: Duration::from_millis(5),
        }
    }

    fn detector(servers: &[&str]) -> NatDetector<StaticResolver> {
        NatDetector::with_resolver(
            fast_config(servers),
            StaticResolver::with(&[("stun.a.test", SERVER_A), ("stun.b.test", SERVER_B)]),
        )
    }

    fn public(port: u16) -> MappedAddress {
        MappedAddress::ipv4(Ipv4Addr::new(203, 0, 113, 7), port)
    }

    /// Answer every request with a port chosen by destination
    fn by_destination(port_a: u16, port_b: u16) -> impl FnMut(&[u8], SocketAddr) -> Vec<Vec<u8>> + Send {
        move |request, dest| {
            let port = if dest.ip() == Ipv4Addr::from(SERVER_A) { port_a } else { port_b };
            vec![reply_to(request, public(port))]
        }
    }

    #[tokio::test]
    async fn matched_ports_are_endpoint_independent() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, by_destination(40000, 40000));
        let sent = transport.sent.clone();
        let closed = transport.closed.clone();

        let report = detector(&["stun.a.test:3478", "stun.b.test:3478"])
            .detect_on(transport)
            .await;

        assert_eq!(report.classification, NatClassification::EndpointIndependent);
        assert_eq!(report.local_port, DEFAULT_LOCAL_PORT);
        assert_eq!(report.results[0].mapped(), Some(&public(40000)));
        assert_eq!(report.results[1].server_host, "stun.b.test");
        assert_eq!(*closed.lock().unwrap(), 1);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].from.port(), sent[1].from.port());
        assert_eq!(sent[0].to, SocketAddr::from((SERVER_A, 3478)));
        assert_eq!(sent[1].to, SocketAddr::from((SERVER_B, 3478)));
    }

    #[tokio::test]
    async fn mismatched_ports_are_endpoint_dependent() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, by_destination(40000, 40123));
        let report = detector(&["stun.a.test", "stun.b.test"])
            .detect_on(transport)
            .await;

        assert_eq!(report.classification, NatClassification::EndpointDependent);
    }

    #[tokio::test]
    async fn resolution_failure_is_incomplete() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, by_destination(40000, 40000));
        let sent = transport.sent.clone();
        let closed = transport.closed.clone();

        let report = detector(&["stun.unknown.test", "stun.b.test"])
            .detect_on(transport)
            .await;

        assert_eq!(report.classification, NatClassification::Incomplete);
        assert_eq!(
            report.results[0].error(),
            Some(&ProbeError::Resolution {
                host: "stun.unknown.test".into()
            })
        );
        assert!(report.results[1].mapped().is_some());
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(*closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, |request, dest: SocketAddr| {
            if dest.ip() == Ipv4Addr::from(SERVER_A) {
                vec![reply_to(request, public(40000))]
            } else {
                vec![]
            }
        });

        let report = detector(&["stun.a.test", "stun.b.test"])
            .detect_on(transport)
            .await;

        assert_eq!(report.results[1].error(), Some(&ProbeError::Timeout));
        assert_eq!(report.classification, NatClassification::Incomplete);
    }

    #[tokio::test]
    async fn unsolicited_response_is_discarded() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, |request, _dest| {
            let spoofed = encode_binding_response(
                &TransactionId::from_bytes([9u8; 12]),
                &[StunAttribute::new(
                    ATTR_MAPPED_ADDRESS,
                    &public(1111).to_attribute_value(),
                )],
            );
            vec![spoofed, reply_to(request, public(40000))]
        });

        let report = detector(&["stun.a.test", "stun.b.test"])
            .detect_on(transport)
            .await;

        assert_eq!(report.results[0].mapped(), Some(&public(40000)));
        assert_eq!(report.results[1].mapped(), Some(&public(40000)));
        assert_eq!(report.classification, NatClassification::EndpointIndependent);
    }

    #[tokio::test]
    async fn only_unsolicited_responses_time_out() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, |_request, _dest| {
            vec![encode_binding_response(&TransactionId::from_bytes([3u8; 12]), &[])]
        });

        let report = detector(&["stun.a.test"]).detect_on(transport).await;
        assert_eq!(report.results[0].error(), Some(&ProbeError::Timeout));
    }

    #[tokio::test]
    async fn late_response_from_previous_probe_is_rejected() {
        let first_request: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let remembered = first_request.clone();

        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, move |request, dest: SocketAddr| {
            if dest.ip() == Ipv4Addr::from(SERVER_A) {
                // Server A stays silent during its own probe
                *remembered.lock().unwrap() = Some(request.to_vec());
                vec![]
            } else {
                let first = remembered.lock().unwrap().clone().unwrap();
                vec![reply_to(&first, public(1111)), reply_to(request, public(40000))]
            }
        });

        let report = detector(&["stun.a.test", "stun.b.test"])
            .detect_on(transport)
            .await;

        assert_eq!(report.results[0].error(), Some(&ProbeError::Timeout));
        assert_eq!(report.results[1].mapped(), Some(&public(40000)));
        assert!(first_request.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn ipv6_only_response_is_unsupported() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, |request, _dest| {
            let header = StunHeader::parse(request).unwrap();
            let mut value = [0u8; 20];
            value[1] = 0x02;
            vec![encode_binding_response(
                &header.transaction_id,
                &[StunAttribute::new(ATTR_MAPPED_ADDRESS, &value)],
            )]
        });

        let report = detector(&["stun.a.test"]).detect_on(transport).await;
        assert_eq!(
            report.results[0].error(),
            Some(&ProbeError::UnsupportedAddressFamily(0x02))
        );
    }

    #[tokio::test]
    async fn truncated_response_is_malformed() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, |request, _dest| {
            let mut response = reply_to(request, public(40000));
            response.truncate(24);
            vec![response]
        });

        let report = detector(&["stun.a.test"]).detect_on(transport).await;
        assert_eq!(
            report.results[0].error(),
            Some(&ProbeError::Malformed(StunError::NoMappedAddress))
        );
    }

    #[tokio::test]
    async fn send_failure_does_not_stop_run() {
        let mut transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, by_destination(40000, 40000));
        transport.fail_sends_to = Some(SocketAddr::from((SERVER_A, DEFAULT_STUN_PORT)));
        let closed = transport.closed.clone();

        let report = detector(&["stun.a.test", "stun.b.test"])
            .detect_on(transport)
            .await;

        assert!(matches!(report.results[0].error(), Some(ProbeError::Io(_))));
        assert!(report.results[1].mapped().is_some());
        assert_eq!(report.classification, NatClassification::Incomplete);
        assert_eq!(*closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn delay_follows_every_probe() {
        let mut config = fast_config(&["stun.a.test", "stun.b.test"]);
        config.probe_interval = Duration::from_millis(40);
        let detector = NatDetector::with_resolver(
            config,
            StaticResolver::with(&[("stun.a.test", SERVER_A), ("stun.b.test", SERVER_B)]),
        );
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, by_destination(1, 1));

        let started = std::time::Instant::now();
        detector.detect_on(transport).await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn requests_are_plain_binding_requests() {
        let transport = ScriptedTransport::new(DEFAULT_LOCAL_PORT, by_destination(1, 2));
        let sent = transport.sent.clone();
        detector(&["stun.a.test", "stun.b.test"]).detect_on(transport).await;

        let sent = sent.lock().unwrap();
        let first = StunHeader::parse(&sent[0].data).unwrap();
        let second = StunHeader::parse(&sent[1].data).unwrap();
        assert_eq!(first.message_type, STUN_BINDING_REQUEST);
        assert_eq!(first.message_length, 0);
        assert_eq!(first.magic_cookie, STUN_MAGIC_COOKIE);
        assert_ne!(first.transaction_id, second.transaction_id);
    }
}
