//! Message framing and the typed payloads exchanged with remote nodes.
//!
//! Every frame is a 24-byte header (network magic, null-padded ASCII command, little-endian
//! payload length, first four bytes of the payload's double SHA-256) followed by the payload.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use schilling_consensus::constants::PROTOCOL_VERSION;
use schilling_consensus::Hash256;
use schilling_primitives::{sha256d, Block, BlockHeader, DecodeError, Decoder, Encoder, Transaction};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 24;
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;
const COMMAND_LEN: usize = 12;

pub const MAX_HEADERS_RESULTS: usize = 2000;
pub const MAX_INV_ENTRIES: usize = 50_000;
pub const MAX_ADDR_RESULTS: usize = 1000;
pub const MAX_LOCATOR_HASHES: usize = 500;
pub const NODE_NETWORK: u64 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("network magic {found:02x?} does not match {expected:02x?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("malformed command field")]
    MalformedCommand,
    #[error("payload of {0} bytes exceeds limit")]
    Oversized(usize),
    #[error("payload checksum mismatch")]
    BadChecksum,
    #[error("malformed {command} payload: {source}")]
    Payload {
        command: String,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A checksummed frame whose payload has not been interpreted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

pub fn encode_frame(
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let name = command.as_bytes();
    if name.is_empty() || name.len() > COMMAND_LEN || !name.iter().all(u8::is_ascii_graphic) {
        return Err(ProtocolError::MalformedCommand);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_LEN];
    command_bytes[..name.len()].copy_from_slice(name);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&sha256d(payload)[..4]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes one frame and returns the number of bytes put on the wire.
pub async fn write_frame<W>(
    writer: &mut W,
    magic: [u8; 4],
    command: &str,
    payload: &[u8],
) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(magic, command, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

pub async fn write_message<W>(
    writer: &mut W,
    magic: [u8; 4],
    message: &NetworkMessage,
) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, magic, message.command(), &message.encode_payload()).await
}

/// Reads one frame, rejecting a foreign magic, a malformed command, an oversized length, or
/// a checksum mismatch.
pub async fn read_frame<R>(reader: &mut R, magic: [u8; 4]) -> Result<RawMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let found = [header[0], header[1], header[2], header[3]];
    if found != magic {
        return Err(ProtocolError::BadMagic {
            expected: magic,
            found,
        });
    }
    let command = parse_command(&header[4..16])?;
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    if header[20..24] != sha256d(&payload)[..4] {
        return Err(ProtocolError::BadChecksum);
    }
    Ok(RawMessage { command, payload })
}

fn parse_command(raw: &[u8]) -> Result<String, ProtocolError> {
    let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    let (name, padding) = raw.split_at(end);
    if name.is_empty()
        || padding.iter().any(|byte| *byte != 0)
        || !name.iter().all(u8::is_ascii_graphic)
    {
        return Err(ProtocolError::MalformedCommand);
    }
    Ok(name.iter().map(|byte| char::from(*byte)).collect())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped(),
            IpAddr::V6(ip6) => ip6,
        };
        Self {
            services,
            ip: ip.octets(),
            port: addr.port(),
        }
    }

    /// The dialable address, if any.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.port == 0 {
            return None;
        }
        let ip6 = Ipv6Addr::from(self.ip);
        let ip = match ip6.to_ipv4_mapped() {
            Some(ip4) => IpAddr::V4(ip4),
            None => IpAddr::V6(ip6),
        };
        if ip.is_unspecified() {
            return None;
        }
        Some(SocketAddr::new(ip, self.port))
    }

    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.services);
        encoder.write_bytes(&self.ip);
        encoder.write_bytes(&self.port.to_be_bytes());
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let services = decoder.read_u64_le()?;
        let ip = decoder.read_fixed::<16>()?;
        let port = u16::from_be_bytes(decoder.read_fixed::<2>()?);
        Ok(Self { services, ip, port })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub receiver: NetAddress,
    pub sender: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Our side of the handshake: no services offered, no relay requested.
    pub fn outbound(remote: SocketAddr, user_agent: &str, start_height: i32) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        Self {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp,
            receiver: NetAddress::new(remote, NODE_NETWORK),
            sender: NetAddress::default(),
            nonce: rand::random(),
            user_agent: user_agent.to_string(),
            start_height,
            relay: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    Other(u32),
}

impl InvType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            other => InvType::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::Other(other) => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InvType,
    pub hash: Hash256,
}

impl Inventory {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrEntry {
    pub time: u32,
    pub address: NetAddress,
}

/// Shared by `getheaders` and `getblocks`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBlocksMessage {
    pub version: i32,
    pub locator: Vec<Hash256>,
    pub stop: Hash256,
}

impl GetBlocksMessage {
    pub fn new(locator: Vec<Hash256>, stop: Hash256) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            locator,
            stop,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<AddrEntry>),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    GetHeaders(GetBlocksMessage),
    GetBlocks(GetBlocksMessage),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Reject(RejectMessage),
    /// A well-formed frame with a command this node does not speak.
    Unknown { command: String, payload: Vec<u8> },
}

impl NetworkMessage {
    pub fn command(&self) -> &str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::Unknown { command, .. } => command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            NetworkMessage::Version(version) => {
                encoder.write_i32_le(version.version);
                encoder.write_u64_le(version.services);
                encoder.write_i64_le(version.timestamp);
                version.receiver.encode_to(&mut encoder);
                version.sender.encode_to(&mut encoder);
                encoder.write_u64_le(version.nonce);
                encoder.write_var_str(&version.user_agent);
                encoder.write_i32_le(version.start_height);
                encoder.write_u8(u8::from(version.relay));
            }
            NetworkMessage::Verack | NetworkMessage::GetAddr => {}
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => {
                encoder.write_u64_le(*nonce);
            }
            NetworkMessage::Addr(entries) => {
                encoder.write_varint(entries.len() as u64);
                for entry in entries {
                    encoder.write_u32_le(entry.time);
                    entry.address.encode_to(&mut encoder);
                }
            }
            NetworkMessage::Inv(items)
            | NetworkMessage::GetData(items)
            | NetworkMessage::NotFound(items) => {
                encoder.write_varint(items.len() as u64);
                for item in items {
                    encoder.write_u32_le(item.kind.as_u32());
                    encoder.write_hash_le(&item.hash);
                }
            }
            NetworkMessage::GetHeaders(request) | NetworkMessage::GetBlocks(request) => {
                encoder.write_i32_le(request.version);
                encoder.write_varint(request.locator.len() as u64);
                for hash in &request.locator {
                    encoder.write_hash_le(hash);
                }
                encoder.write_hash_le(&request.stop);
            }
            NetworkMessage::Headers(headers) => {
                encoder.write_varint(headers.len() as u64);
                for header in headers {
                    header.consensus_encode_to(&mut encoder);
                    encoder.write_varint(0);
                }
            }
            NetworkMessage::Block(block) => return block.consensus_encode(),
            NetworkMessage::Tx(tx) => return tx.consensus_encode(),
            NetworkMessage::Reject(reject) => {
                encoder.write_var_str(&reject.message);
                encoder.write_u8(reject.code);
                encoder.write_var_str(&reject.reason);
                encoder.write_bytes(&reject.data);
            }
            NetworkMessage::Unknown { payload, .. } => return payload.clone(),
        }
        encoder.into_inner()
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            // Trailing version fields added by later protocol revisions are tolerated.
            "version" => return decode_version(&mut decoder).map(NetworkMessage::Version),
            "verack" => NetworkMessage::Verack,
            "getaddr" => NetworkMessage::GetAddr,
            "ping" if decoder.is_empty() => NetworkMessage::Ping(0),
            "ping" => NetworkMessage::Ping(decoder.read_u64_le()?),
            "pong" => NetworkMessage::Pong(decoder.read_u64_le()?),
            "addr" => {
                let count = read_count(&mut decoder, MAX_ADDR_RESULTS)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let time = decoder.read_u32_le()?;
                    let address = NetAddress::decode_from(&mut decoder)?;
                    entries.push(AddrEntry { time, address });
                }
                NetworkMessage::Addr(entries)
            }
            "inv" => NetworkMessage::Inv(decode_inventory(&mut decoder)?),
            "getdata" => NetworkMessage::GetData(decode_inventory(&mut decoder)?),
            "notfound" => NetworkMessage::NotFound(decode_inventory(&mut decoder)?),
            "getheaders" => NetworkMessage::GetHeaders(decode_getblocks(&mut decoder)?),
            "getblocks" => NetworkMessage::GetBlocks(decode_getblocks(&mut decoder)?),
            "headers" => {
                let count = read_count(&mut decoder, MAX_HEADERS_RESULTS)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode_from(&mut decoder)?);
                    let _tx_count = decoder.read_varint()?;
                }
                NetworkMessage::Headers(headers)
            }
            "block" => return Block::consensus_decode(payload).map(NetworkMessage::Block),
            "tx" => return Transaction::consensus_decode(payload).map(NetworkMessage::Tx),
            "reject" => {
                let message = decoder.read_var_str()?;
                let code = decoder.read_u8()?;
                let reason = decoder.read_var_str()?;
                let data = decoder.read_bytes(decoder.remaining())?.to_vec();
                NetworkMessage::Reject(RejectMessage {
                    message,
                    code,
                    reason,
                    data,
                })
            }
            other => {
                return Ok(NetworkMessage::Unknown {
                    command: other.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };
        decoder.finish()?;
        Ok(message)
    }

    pub fn from_raw(raw: &RawMessage) -> Result<Self, ProtocolError> {
        Self::decode(&raw.command, &raw.payload).map_err(|source| ProtocolError::Payload {
            command: raw.command.clone(),
            source,
        })
    }
}

fn read_count(decoder: &mut Decoder<'_>, limit: usize) -> Result<usize, DecodeError> {
    let count = decoder.read_varint()?;
    if count > limit as u64 {
        return Err(DecodeError::LengthTooLarge(count));
    }
    Ok(count as usize)
}

fn decode_version(decoder: &mut Decoder<'_>) -> Result<VersionMessage, DecodeError> {
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    let receiver = NetAddress::decode_from(decoder)?;
    let sender = NetAddress::decode_from(decoder)?;
    let nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    let relay = if decoder.is_empty() {
        true
    } else {
        decoder.read_bool()?
    };
    Ok(VersionMessage {
        version,
        services,
        timestamp,
        receiver,
        sender,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn decode_inventory(decoder: &mut Decoder<'_>) -> Result<Vec<Inventory>, DecodeError> {
    let count = read_count(decoder, MAX_INV_ENTRIES)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = InvType::from_u32(decoder.read_u32_le()?);
        let hash = decoder.read_hash_le()?;
        items.push(Inventory { kind, hash });
    }
    Ok(items)
}

fn decode_getblocks(decoder: &mut Decoder<'_>) -> Result<GetBlocksMessage, DecodeError> {
    let version = decoder.read_i32_le()?;
    let count = read_count(decoder, MAX_LOCATOR_HASHES)?;
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash_le()?);
    }
    let stop = decoder.read_hash_le()?;
    Ok(GetBlocksMessage {
        version,
        locator,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn frame(command: &str, payload: &[u8]) -> Vec<u8> {
        encode_frame(MAGIC, command, payload).expect("frame")
    }

    #[tokio::test]
    async fn reads_back_written_frame() {
        let mut wire = Vec::new();
        let written = write_message(&mut wire, MAGIC, &NetworkMessage::Ping(7))
            .await
            .expect("write");
        assert_eq!(written, HEADER_LEN + 8);

        let raw = read_frame(&mut wire.as_slice(), MAGIC).await.expect("read");
        assert_eq!(raw.command, "ping");
        assert_eq!(NetworkMessage::from_raw(&raw).expect("decode"), NetworkMessage::Ping(7));
    }

    #[tokio::test]
    async fn foreign_magic_is_rejected() {
        let bytes = encode_frame([1, 2, 3, 4], "verack", &[]).expect("frame");
        let err = read_frame(&mut bytes.as_slice(), MAGIC).await.expect_err("magic");
        assert!(matches!(err, ProtocolError::BadMagic { found: [1, 2, 3, 4], .. }));
    }

    #[tokio::test]
    async fn corrupted_payload_fails_checksum() {
        let mut bytes = frame("ping", &7u64.to_le_bytes());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = read_frame(&mut bytes.as_slice(), MAGIC).await.expect_err("checksum");
        assert!(matches!(err, ProtocolError::BadChecksum));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading_payload() {
        let mut bytes = frame("block", &[]);
        bytes[16..20].copy_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        let err = read_frame(&mut bytes.as_slice(), MAGIC).await.expect_err("oversize");
        assert!(matches!(err, ProtocolError::Oversized(len) if len == MAX_PAYLOAD_SIZE + 1));
    }

    #[tokio::test]
    async fn bytes_after_command_terminator_are_malformed() {
        let mut bytes = frame("inv", &[0]);
        bytes[4 + 5] = b'x';
        let err = read_frame(&mut bytes.as_slice(), MAGIC).await.expect_err("command");
        assert!(matches!(err, ProtocolError::MalformedCommand));

        let mut bytes = frame("inv", &[0]);
        bytes[4] = 0x80;
        let err = read_frame(&mut bytes.as_slice(), MAGIC).await.expect_err("command");
        assert!(matches!(err, ProtocolError::MalformedCommand));
    }

    #[test]
    fn unknown_command_is_preserved() {
        let message = NetworkMessage::decode("sendcmpct", &[1, 2]).expect("decode");
        assert_eq!(
            message,
            NetworkMessage::Unknown {
                command: "sendcmpct".to_string(),
                payload: vec![1, 2],
            }
        );
    }

    #[test]
    fn version_without_relay_flag_defaults_to_relay() {
        let remote: SocketAddr = "10.0.0.1:9976".parse().expect("addr");
        let version = VersionMessage::outbound(remote, "/schilling-spv:0.1.0/", 42);
        let mut payload = NetworkMessage::Version(version.clone()).encode_payload();
        payload.pop();

        let NetworkMessage::Version(decoded) =
            NetworkMessage::decode("version", &payload).expect("decode")
        else {
            panic!("expected version");
        };
        assert!(decoded.relay);
        assert_eq!(decoded.start_height, 42);
        assert_eq!(decoded.user_agent, version.user_agent);
        assert_eq!(decoded.receiver.socket_addr(), Some(remote));
    }

    #[test]
    fn header_count_above_limit_is_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_varint(MAX_HEADERS_RESULTS as u64 + 1);
        assert!(matches!(
            NetworkMessage::decode("headers", &encoder.into_inner()),
            Err(DecodeError::LengthTooLarge(_))
        ));
    }

    #[test]
    fn unspecified_addresses_are_not_dialable() {
        let blank = NetAddress::default();
        assert_eq!(blank.socket_addr(), None);
        let addr: SocketAddr = "[2001:db8::1]:19976".parse().expect("addr");
        assert_eq!(NetAddress::new(addr, 0).socket_addr(), Some(addr));
    }
}
