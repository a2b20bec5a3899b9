/**
 * nat_probe/stun.rs
 *
 * Minimal STUN codec: Binding Request encoding and MAPPED-ADDRESS extraction
 */

use rand::RngCore;
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// STUN message types
pub const STUN_BINDING_REQUEST: u16 = 0x0001;
pub const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed STUN header size (type, length, cookie, transaction id)
pub const STUN_HEADER_SIZE: usize = 20;

/// STUN attribute types
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// Attribute type + length prefix
const ATTR_HEADER_SIZE: usize = 4;

/// Minimum MAPPED-ADDRESS value: reserved, family, port, IPv4
const MAPPED_ADDRESS_MIN_LEN: usize = 8;

const FAMILY_IPV4: u8 = 0x01;

/// Codec errors explaining why no address could be extracted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    #[error("STUN message too short: {len} bytes")]
    TooShort { len: usize },
    #[error("No MAPPED-ADDRESS attribute found in STUN response")]
    NoMappedAddress,
    #[error("Unsupported address family: 0x{0:02x}")]
    UnsupportedFamily(u8),
}

/// 96-bit STUN transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate 12 independently random bytes
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// STUN message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunHeader {
    pub message_type: u16,
    pub message_length: u16,
    pub magic_cookie: u32,
    pub transaction_id: TransactionId,
}

impl StunHeader {
    /// Parse the first 20 bytes of a datagram. Only the length is checked.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < STUN_HEADER_SIZE {
            return None;
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        Some(Self {
            message_type: u16::from_be_bytes([data[0], data[1]]),
            message_length: u16::from_be_bytes([data[2], data[3]]),
            magic_cookie: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            transaction_id: TransactionId(transaction_id),
        })
    }

    /// Binding Success Response carrying the magic cookie
    pub fn is_binding_response(&self) -> bool {
        self.message_type == STUN_BINDING_RESPONSE && self.magic_cookie == STUN_MAGIC_COOKIE
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&self.message_length.to_be_bytes());
        buf.extend_from_slice(&self.magic_cookie.to_be_bytes());
        buf.extend_from_slice(self.transaction_id.as_bytes());
    }
}

/// Binding Request with no attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
}

impl BindingRequest {
    /// New request with a fresh transaction id
    pub fn new() -> Self {
        Self {
            transaction_id: TransactionId::random(),
        }
    }

    /// Encode the 20-byte request header
    pub fn encode(&self) -> Vec<u8> {
        let header = StunHeader {
            message_type: STUN_BINDING_REQUEST,
            message_length: 0,
            magic_cookie: STUN_MAGIC_COOKIE,
            transaction_id: self.transaction_id,
        };

        let mut request = Vec::with_capacity(STUN_HEADER_SIZE);
        header.write_to(&mut request);
        request
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// A single type-length-value record from the attribute region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunAttribute<'a> {
    pub attr_type: u16,
    pub value: &'a [u8],
}

impl<'a> StunAttribute<'a> {
    pub fn new(attr_type: u16, value: &'a [u8]) -> Self {
        Self { attr_type, value }
    }

    pub fn length(&self) -> u16 {
        self.value.len() as u16
    }

    /// Bytes this attribute occupies on the wire, padding included
    pub fn wire_len(&self) -> usize {
        ATTR_HEADER_SIZE + padded_len(self.value.len())
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.attr_type.to_be_bytes());
        buf.extend_from_slice(&self.length().to_be_bytes());
        buf.extend_from_slice(self.value);
        buf.resize(buf.len() + padded_len(self.value.len()) - self.value.len(), 0);
    }
}

/// Round an attribute length up to the next 4-byte boundary
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Iterator over the attribute region of a STUN message.
///
/// Stops when fewer than 4 bytes remain or when an attribute claims more
/// bytes than the datagram holds. Padding bytes are skipped unchecked.
#[derive(Debug, Clone)]
pub struct Attributes<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Attributes<'a> {
    pub fn new(message: &'a [u8]) -> Self {
        Self {
            data: message,
            offset: STUN_HEADER_SIZE,
        }
    }

    /// Current read cursor, relative to the start of the message
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = StunAttribute<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header_end = self.offset.checked_add(ATTR_HEADER_SIZE)?;
        if header_end > self.data.len() {
            return None;
        }

        let attr_type = u16::from_be_bytes([self.data[self.offset], self.data[self.offset + 1]]);
        let attr_len =
            u16::from_be_bytes([self.data[self.offset + 2], self.data[self.offset + 3]]) as usize;

        let value_end = header_end + attr_len;
        if value_end > self.data.len() {
            self.offset = self.data.len();
            return None;
        }

        let value = &self.data[header_end..value_end];
        self.offset = header_end + padded_len(attr_len);

        Some(StunAttribute { attr_type, value })
    }
}

/// Address family byte of a MAPPED-ADDRESS value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Ipv4,
    Unsupported(u8),
}

impl From<u8> for AddressFamily {
    fn from(value: u8) -> Self {
        match value {
            FAMILY_IPV4 => AddressFamily::Ipv4,
            other => AddressFamily::Unsupported(other),
        }
    }
}

impl AddressFamily {
    pub fn to_byte(self) -> u8 {
        match self {
            AddressFamily::Ipv4 => FAMILY_IPV4,
            AddressFamily::Unsupported(value) => value,
        }
    }
}

/// Public (IP, port) observed by a STUN server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MappedAddress {
    pub family: AddressFamily,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl MappedAddress {
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            family: AddressFamily::Ipv4,
            ip,
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Interpret a MAPPED-ADDRESS attribute value
    pub fn from_attribute_value(value: &[u8]) -> Result<Self, StunError> {
        if value.len() < MAPPED_ADDRESS_MIN_LEN {
            return Err(StunError::TooShort { len: value.len() });
        }

        match AddressFamily::from(value[1]) {
            AddressFamily::Ipv4 => {
                let port = u16::from_be_bytes([value[2], value[3]]);
                let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
                Ok(Self::ipv4(ip, port))
            }
            AddressFamily::Unsupported(family) => Err(StunError::UnsupportedFamily(family)),
        }
    }

    /// Encode as a MAPPED-ADDRESS attribute value
    pub fn to_attribute_value(&self) -> [u8; 8] {
        let mut value = [0u8; 8];
        value[1] = self.family.to_byte();
        value[2..4].copy_from_slice(&self.port.to_be_bytes());
        value[4..8].copy_from_slice(&self.ip.octets());
        value
    }
}

impl fmt::Display for MappedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Extract the first usable IPv4 MAPPED-ADDRESS from a response.
///
/// Magic cookie, message type and transaction id are not checked here.
pub fn parse_binding_response(data: &[u8]) -> Result<MappedAddress, StunError> {
    if data.len() < STUN_HEADER_SIZE {
        return Err(StunError::TooShort { len: data.len() });
    }

    let mut unsupported = None;

    for attr in Attributes::new(data) {
        if attr.attr_type != ATTR_MAPPED_ADDRESS || attr.value.len() < MAPPED_ADDRESS_MIN_LEN {
            continue;
        }

        match MappedAddress::from_attribute_value(attr.value) {
            Ok(mapped) => return Ok(mapped),
            Err(StunError::UnsupportedFamily(family)) => {
                unsupported.get_or_insert(family);
            }
            Err(_) => {}
        }
    }

    Err(unsupported.map_or(StunError::NoMappedAddress, StunError::UnsupportedFamily))
}

/// Option form of [`parse_binding_response`]
pub fn decode_binding_response(data: &[u8]) -> Option<MappedAddress> {
    parse_binding_response(data).ok()
}

/// Build a Binding Success Response carrying the given attributes
pub fn encode_binding_response(
    transaction_id: &TransactionId,
    attributes: &[StunAttribute<'_>],
) -> Vec<u8> {
    let body_len: usize = attributes.iter().map(StunAttribute::wire_len).sum();

    let header = StunHeader {
        message_type: STUN_BINDING_RESPONSE,
        message_length: body_len as u16,
        magic_cookie: STUN_MAGIC_COOKIE,
        transaction_id: *transaction_id,
    };

    let mut response = Vec::with_capacity(STUN_HEADER_SIZE + body_len);
    header.write_to(&mut response);
    for attr in attributes {
        attr.write_to(&mut response);
    }
    response
}
