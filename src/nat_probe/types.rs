/**
 * nat_probe/types.rs
 *
 * Core types for NAT mapping detection
 */

use crate::nat_probe::stun::{MappedAddress, StunError};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Fixed local UDP port shared by every probe in a run
pub const DEFAULT_LOCAL_PORT: u16 = 0xde1e;

/// Default STUN server port
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Wait for one Binding Response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause after each probe so a rebinding NAT is not measured mid-change
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Reference server pair
pub const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun.voipbuster.com:3478", "stun.miwifi.com:3478"];

/// STUN server endpoint (hostname or IPv4 literal)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl StunServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host[:port]` server string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerParseError {
    #[error("Empty STUN server host")]
    EmptyHost,
    #[error("Invalid STUN server port '{0}'")]
    InvalidPort(String),
}

impl FromStr for StunServer {
    type Err = ServerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ServerParseError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_STUN_PORT),
        };

        if host.is_empty() {
            return Err(ServerParseError::EmptyHost);
        }

        Ok(Self::new(host, port))
    }
}

/// Detection run configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Servers probed in order
    pub servers: Vec<StunServer>,

    /// Local UDP port, bound once for the whole run (0 = OS assigned)
    pub local_port: u16,

    /// Per-probe response timeout
    pub response_timeout: Duration,

    /// Delay inserted after every probe
    pub probe_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            local_port: DEFAULT_LOCAL_PORT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// Why a probe produced no address. None of these abort a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("Could not resolve '{host}' to an IPv4 address")]
    Resolution { host: String },
    #[error("No STUN response before timeout")]
    Timeout,
    #[error("Malformed STUN response: {0}")]
    Malformed(StunError),
    #[error("Unsupported address family 0x{0:02x} in MAPPED-ADDRESS")]
    UnsupportedAddressFamily(u8),
    #[error("Transport error: {0}")]
    Io(String),
}

impl From<StunError> for ProbeError {
    fn from(err: StunError) -> Self {
        match err {
            StunError::UnsupportedFamily(family) => ProbeError::UnsupportedAddressFamily(family),
            other => ProbeError::Malformed(other),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Io(err.to_string())
    }
}

/// Outcome of probing one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub server_host: String,
    pub server_port: u16,
    #[serde(rename = "mapped", serialize_with = "serialize_outcome")]
    pub outcome: Result<MappedAddress, ProbeError>,
}

impl ProbeResult {
    pub fn new(server: &StunServer, outcome: Result<MappedAddress, ProbeError>) -> Self {
        Self {
            server_host: server.host.clone(),
            server_port: server.port,
            outcome,
        }
    }

    pub fn mapped(&self) -> Option<&MappedAddress> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ProbeError> {
        self.outcome.as_ref().err()
    }
}

fn serialize_outcome<S: Serializer>(
    outcome: &Result<MappedAddress, ProbeError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    outcome.as_ref().ok().serialize(serializer)
}

/// NAT mapping behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatClassification {
    /// Same public port for every destination (cone-type)
    EndpointIndependent,
    /// Public port varies by destination (symmetric-type)
    EndpointDependent,
    /// Not enough successful probes to decide
    Incomplete,
}

impl NatClassification {
    /// Classify a run.
    ///
    /// Requires at least two results, all with an address. The public IPs
    /// are not compared, only the ports.
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let mapped: Option<Vec<&MappedAddress>> = results.iter().map(ProbeResult::mapped).collect();

        match mapped {
            Some(mapped) if mapped.len() >= 2 => {
                let first_port = mapped[0].port;
                if mapped.iter().all(|m| m.port == first_port) {
                    NatClassification::EndpointIndependent
                } else {
                    NatClassification::EndpointDependent
                }
            }
            _ => NatClassification::Incomplete,
        }
    }

    /// Short hole punching outlook for the console
    pub fn outlook(&self) -> &'static str {
        match self {
            Self::EndpointIndependent => "UDP hole punching is likely to succeed.",
            Self::EndpointDependent => {
                "Direct hole punching is unlikely; port prediction or a relay is needed."
            }
            Self::Incomplete => "Test incomplete, check the network or try other servers.",
        }
    }
}

impl fmt::Display for NatClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndpointIndependent => write!(f, "Endpoint Independent (cone NAT)"),
            Self::EndpointDependent => write!(f, "Endpoint Dependent (symmetric NAT)"),
            Self::Incomplete => write!(f, "Incomplete"),
        }
    }
}

/// Everything one detection run produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub local_port: u16,
    pub results: Vec<ProbeResult>,
    pub classification: NatClassification,
}

impl DetectionReport {
    pub fn new(local_port: u16, results: Vec<ProbeResult>) -> Self {
        let classification = NatClassification::from_results(&results);
        Self {
            local_port,
            results,
            classification,
        }
    }

    /// Successful probes saw more than one public IP (multi-egress hint)
    pub fn public_ips_differ(&self) -> bool {
        let mut ips = self.results.iter().filter_map(ProbeResult::mapped).map(|m| m.ip);
        match ips.next() {
            Some(first) => ips.any(|ip| ip != first),
            None => false,
        }
    }
}
