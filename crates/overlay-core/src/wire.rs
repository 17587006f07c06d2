//! Overlay wire format — every message exchanged between the registry and
//! messaging nodes, and between neighboring nodes.
//!
//! A frame is a fixed 5-byte header (type tag, big-endian payload length)
//! followed by the payload. The header and the fixed-size payloads are
//! `#[repr(C, packed)]` zerocopy types; variable payloads (strings, string
//! lists) are written with `bytes`. All integers are big-endian.
//!
//! Frames are decoded exactly once, at the connection boundary, into the
//! closed [`Message`] enum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, I32, I64, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::PeerIdentity;
use crate::stats::StatsSnapshot;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every payload on every overlay connection.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Message type, see [`tag`].
    pub tag: u8,
    /// Payload length in bytes, not including this header.
    pub length: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 5]);

/// Size of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 5;

/// Largest payload a receiver will accept. A full link-weight list for a
/// few hundred peers fits comfortably.
pub const MAX_PAYLOAD: usize = 1 << 20;

impl FrameHeader {
    /// Parse and bound-check a header read off the socket.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<(u8, usize), WireError> {
        let header = FrameHeader::read_from(&bytes[..]).ok_or(WireError::Truncated)?;
        let length = header.length.get() as usize;
        if length > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok((header.tag, length))
    }
}

// ── Fixed payloads ────────────────────────────────────────────────────────────

/// Sent once by the connecting side of an overlay edge.
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct WeightAnnouncementPayload {
    pub port: I32<BigEndian>,
    pub cost: I32<BigEndian>,
}

assert_eq_size!(WeightAnnouncementPayload, [u8; 8]);

/// The five traffic counters in report order.
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StatsPayload {
    pub sent: I64<BigEndian>,
    pub sum_sent: I64<BigEndian>,
    pub received: I64<BigEndian>,
    pub sum_received: I64<BigEndian>,
    pub relayed: I64<BigEndian>,
}

assert_eq_size!(StatsPayload, [u8; 40]);

// ── Type tags ─────────────────────────────────────────────────────────────────

pub mod tag {
    pub const REGISTER_REQUEST: u8 = 1;
    pub const REGISTER_RESPONSE: u8 = 2;
    pub const DEREGISTER_REQUEST: u8 = 3;
    pub const DEREGISTER_RESPONSE: u8 = 4;
    pub const NEIGHBOR_ASSIGNMENT: u8 = 5;
    pub const LINK_WEIGHTS: u8 = 6;
    pub const WEIGHT_ANNOUNCEMENT: u8 = 7;
    pub const ROUND_PREPARE: u8 = 8;
    pub const ROUND_READY: u8 = 9;
    pub const TASK_INITIATE: u8 = 10;
    pub const TASK: u8 = 11;
    pub const TASK_COMPLETE: u8 = 12;
    pub const PULL_TRAFFIC_SUMMARY: u8 = 13;
    pub const TRAFFIC_SUMMARY: u8 = 14;
}

/// Edge weights are integers in this range; 0 means "no edge".
pub const MIN_WEIGHT: u8 = 1;
pub const MAX_WEIGHT: u8 = 9;

// ── Messages ──────────────────────────────────────────────────────────────────

/// One neighbor a node must connect to, with the weight of the shared edge.
/// Encoded as `"host port weight"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub peer: PeerIdentity,
    pub weight: u8,
}

/// One undirected overlay edge. Encoded as `"hostA:portA hostB:portB weight"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkWeight {
    pub a: PeerIdentity,
    pub b: PeerIdentity,
    pub weight: u8,
}

/// Synthetic traffic. Immutable in transit; only the destination consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub destination: PeerIdentity,
    pub payload: i32,
}

/// Every message of the overlay protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Node → registry: register the advertised identity.
    RegisterRequest(PeerIdentity),
    RegisterResponse { success: bool, info: String },
    /// Node → registry: leave the overlay.
    DeregisterRequest(PeerIdentity),
    DeregisterResponse { success: bool, info: String },
    /// Registry → node: neighbors this node must dial.
    NeighborAssignment(Vec<NeighborEntry>),
    /// Registry → every node: the full weighted edge set.
    LinkWeights(Vec<LinkWeight>),
    /// Dialing node → dialed node, first frame on a neighbor link.
    WeightAnnouncement { port: u16, cost: u8 },
    /// Registry → node: reset counters and enter a messaging round.
    RoundPrepare,
    /// Node → registry: counters reset.
    RoundReady,
    /// Registry → node: originate `burst` task messages.
    TaskInitiate { burst: u32 },
    Task(TaskMessage),
    /// Node → registry: burst originated.
    TaskComplete(PeerIdentity),
    PullTrafficSummary,
    TrafficSummary {
        peer: PeerIdentity,
        stats: StatsSnapshot,
    },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::RegisterRequest(_) => tag::REGISTER_REQUEST,
            Message::RegisterResponse { .. } => tag::REGISTER_RESPONSE,
            Message::DeregisterRequest(_) => tag::DEREGISTER_REQUEST,
            Message::DeregisterResponse { .. } => tag::DEREGISTER_RESPONSE,
            Message::NeighborAssignment(_) => tag::NEIGHBOR_ASSIGNMENT,
            Message::LinkWeights(_) => tag::LINK_WEIGHTS,
            Message::WeightAnnouncement { .. } => tag::WEIGHT_ANNOUNCEMENT,
            Message::RoundPrepare => tag::ROUND_PREPARE,
            Message::RoundReady => tag::ROUND_READY,
            Message::TaskInitiate { .. } => tag::TASK_INITIATE,
            Message::Task(_) => tag::TASK,
            Message::TaskComplete(_) => tag::TASK_COMPLETE,
            Message::PullTrafficSummary => tag::PULL_TRAFFIC_SUMMARY,
            Message::TrafficSummary { .. } => tag::TRAFFIC_SUMMARY,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterRequest(_) => "register_request",
            Message::RegisterResponse { .. } => "register_response",
            Message::DeregisterRequest(_) => "deregister_request",
            Message::DeregisterResponse { .. } => "deregister_response",
            Message::NeighborAssignment(_) => "neighbor_assignment",
            Message::LinkWeights(_) => "link_weights",
            Message::WeightAnnouncement { .. } => "weight_announcement",
            Message::RoundPrepare => "round_prepare",
            Message::RoundReady => "round_ready",
            Message::TaskInitiate { .. } => "task_initiate",
            Message::Task(_) => "task",
            Message::TaskComplete(_) => "task_complete",
            Message::PullTrafficSummary => "pull_traffic_summary",
            Message::TrafficSummary { .. } => "traffic_summary",
        }
    }

    /// Encode the payload only (no header).
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::RegisterRequest(id)
            | Message::DeregisterRequest(id)
            | Message::TaskComplete(id) => put_identity(&mut buf, id),
            Message::RegisterResponse { success, info }
            | Message::DeregisterResponse { success, info } => {
                buf.put_u8(u8::from(*success));
                put_string(&mut buf, info);
            }
            Message::NeighborAssignment(entries) => {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| format!("{} {} {}", e.peer.host, e.peer.port, e.weight))
                    .collect();
                put_string_list(&mut buf, &lines);
            }
            Message::LinkWeights(edges) => {
                let lines: Vec<String> = edges
                    .iter()
                    .map(|e| format!("{} {} {}", e.a, e.b, e.weight))
                    .collect();
                put_string_list(&mut buf, &lines);
            }
            Message::WeightAnnouncement { port, cost } => {
                let payload = WeightAnnouncementPayload {
                    port: I32::new(i32::from(*port)),
                    cost: I32::new(i32::from(*cost)),
                };
                buf.put_slice(payload.as_bytes());
            }
            Message::RoundPrepare | Message::RoundReady | Message::PullTrafficSummary => {}
            Message::TaskInitiate { burst } => buf.put_i32(i32::try_from(*burst).unwrap_or(i32::MAX)),
            Message::Task(task) => {
                put_string(&mut buf, &task.destination.to_string());
                buf.put_i32(task.payload);
            }
            Message::TrafficSummary { peer, stats } => {
                put_identity(&mut buf, peer);
                let payload = StatsPayload {
                    sent: I64::new(stats.sent as i64),
                    sum_sent: I64::new(stats.sum_sent),
                    received: I64::new(stats.received as i64),
                    sum_received: I64::new(stats.sum_received),
                    relayed: I64::new(stats.relayed as i64),
                };
                buf.put_slice(payload.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Encode a complete frame: header followed by payload.
    pub fn encode(&self) -> Bytes {
        let payload = self.encode_payload();
        let header = FrameHeader {
            tag: self.tag(),
            length: U32::new(payload.len() as u32),
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Decode a payload whose tag has already been read from the header.
    /// The payload must be consumed exactly.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Message, WireError> {
        let mut r = payload;
        let msg = match tag {
            tag::REGISTER_REQUEST => Message::RegisterRequest(get_identity(&mut r)?),
            tag::DEREGISTER_REQUEST => Message::DeregisterRequest(get_identity(&mut r)?),
            tag::TASK_COMPLETE => Message::TaskComplete(get_identity(&mut r)?),
            tag::REGISTER_RESPONSE => {
                let success = get_u8(&mut r)? != 0;
                let info = get_string(&mut r)?;
                Message::RegisterResponse { success, info }
            }
            tag::DEREGISTER_RESPONSE => {
                let success = get_u8(&mut r)? != 0;
                let info = get_string(&mut r)?;
                Message::DeregisterResponse { success, info }
            }
            tag::NEIGHBOR_ASSIGNMENT => {
                let entries = get_string_list(&mut r)?
                    .iter()
                    .map(|line| parse_neighbor_entry(line))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::NeighborAssignment(entries)
            }
            tag::LINK_WEIGHTS => {
                let edges = get_string_list(&mut r)?
                    .iter()
                    .map(|line| parse_link_weight(line))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::LinkWeights(edges)
            }
            tag::WEIGHT_ANNOUNCEMENT => {
                let payload = WeightAnnouncementPayload::read_from_prefix(r)
                    .ok_or(WireError::Truncated)?;
                r = &r[std::mem::size_of::<WeightAnnouncementPayload>()..];
                Message::WeightAnnouncement {
                    port: port_from_i32(payload.port.get())?,
                    cost: weight_from_i64(i64::from(payload.cost.get()))?,
                }
            }
            tag::ROUND_PREPARE => Message::RoundPrepare,
            tag::ROUND_READY => Message::RoundReady,
            tag::PULL_TRAFFIC_SUMMARY => Message::PullTrafficSummary,
            tag::TASK_INITIATE => {
                let burst = get_i32(&mut r)?;
                if burst < 0 {
                    return Err(WireError::NegativeLength(burst));
                }
                Message::TaskInitiate {
                    burst: burst as u32,
                }
            }
            tag::TASK => {
                let dest = get_string(&mut r)?;
                let destination = dest
                    .parse()
                    .map_err(|_| WireError::MalformedEntry(dest.clone()))?;
                let payload = get_i32(&mut r)?;
                Message::Task(TaskMessage {
                    destination,
                    payload,
                })
            }
            tag::TRAFFIC_SUMMARY => {
                let peer = get_identity(&mut r)?;
                let payload = StatsPayload::read_from_prefix(r).ok_or(WireError::Truncated)?;
                r = &r[std::mem::size_of::<StatsPayload>()..];
                Message::TrafficSummary {
                    peer,
                    stats: StatsSnapshot {
                        sent: counter_from_i64(payload.sent.get())?,
                        sum_sent: payload.sum_sent.get(),
                        received: counter_from_i64(payload.received.get())?,
                        sum_received: payload.sum_received.get(),
                        relayed: counter_from_i64(payload.relayed.get())?,
                    },
                }
            }
            other => return Err(WireError::UnknownTag(other)),
        };
        if !r.is_empty() {
            return Err(WireError::TrailingBytes(r.len()));
        }
        Ok(msg)
    }

    /// Decode one complete frame from the front of `buf`.
    /// Returns the message and the number of bytes consumed.
    pub fn decode_frame(buf: &[u8]) -> Result<(Message, usize), WireError> {
        let header: &[u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(WireError::Truncated)?;
        let (tag, length) = FrameHeader::parse(header)?;
        let payload = buf
            .get(HEADER_LEN..HEADER_LEN + length)
            .ok_or(WireError::Truncated)?;
        Ok((Message::decode(tag, payload)?, HEADER_LEN + length))
    }
}

// ── Entry formats ─────────────────────────────────────────────────────────────

fn parse_neighbor_entry(line: &str) -> Result<NeighborEntry, WireError> {
    let malformed = || WireError::MalformedEntry(line.to_string());
    let mut parts = line.split(' ');
    let (Some(host), Some(port), Some(weight), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    if host.is_empty() {
        return Err(malformed());
    }
    let port = port.parse::<u16>().map_err(|_| malformed())?;
    let weight = weight.parse::<i64>().map_err(|_| malformed())?;
    Ok(NeighborEntry {
        peer: PeerIdentity::new(host, port),
        weight: weight_from_i64(weight)?,
    })
}

fn parse_link_weight(line: &str) -> Result<LinkWeight, WireError> {
    let malformed = || WireError::MalformedEntry(line.to_string());
    let mut parts = line.split(' ');
    let (Some(a), Some(b), Some(weight), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    let a = a.parse::<PeerIdentity>().map_err(|_| malformed())?;
    let b = b.parse::<PeerIdentity>().map_err(|_| malformed())?;
    let weight = weight.parse::<i64>().map_err(|_| malformed())?;
    Ok(LinkWeight {
        a,
        b,
        weight: weight_from_i64(weight)?,
    })
}

fn weight_from_i64(value: i64) -> Result<u8, WireError> {
    if (i64::from(MIN_WEIGHT)..=i64::from(MAX_WEIGHT)).contains(&value) {
        Ok(value as u8)
    } else {
        Err(WireError::InvalidWeight(value))
    }
}

fn port_from_i32(value: i32) -> Result<u16, WireError> {
    u16::try_from(value).map_err(|_| WireError::InvalidPort(value))
}

fn counter_from_i64(value: i64) -> Result<u64, WireError> {
    u64::try_from(value).map_err(|_| WireError::NegativeCounter(value))
}

// ── Primitive codecs ──────────────────────────────────────────────────────────

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn put_string_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_i32(items.len() as i32);
    for item in items {
        put_string(buf, item);
    }
}

fn put_identity(buf: &mut BytesMut, id: &PeerIdentity) {
    put_string(buf, &id.host);
    buf.put_i32(i32::from(id.port));
}

fn get_u8(r: &mut &[u8]) -> Result<u8, WireError> {
    if r.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(r.get_u8())
}

fn get_i32(r: &mut &[u8]) -> Result<i32, WireError> {
    if r.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(r.get_i32())
}

fn get_length(r: &mut &[u8]) -> Result<usize, WireError> {
    let len = get_i32(r)?;
    if len < 0 {
        return Err(WireError::NegativeLength(len));
    }
    Ok(len as usize)
}

fn get_string(r: &mut &[u8]) -> Result<String, WireError> {
    let len = get_length(r)?;
    if r.remaining() < len {
        return Err(WireError::Truncated);
    }
    let s = std::str::from_utf8(&r[..len])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();
    r.advance(len);
    Ok(s)
}

fn get_string_list(r: &mut &[u8]) -> Result<Vec<String>, WireError> {
    let count = get_length(r)?;
    // Each entry needs at least its 4-byte length.
    if r.remaining() < count.saturating_mul(4) {
        return Err(WireError::Truncated);
    }
    (0..count).map(|_| get_string(r)).collect()
}

fn get_identity(r: &mut &[u8]) -> Result<PeerIdentity, WireError> {
    let host = get_string(r)?;
    let port = port_from_i32(get_i32(r)?)?;
    Ok(PeerIdentity::new(host, port))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("negative length field: {0}")]
    NegativeLength(i32),

    #[error("{0} unconsumed bytes after payload")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed entry: {0:?}")]
    MalformedEntry(String),

    #[error("edge weight {0} outside 1..=9")]
    InvalidWeight(i64),

    #[error("port {0} outside 0..=65535")]
    InvalidPort(i32),

    #[error("negative counter: {0}")]
    NegativeCounter(i64),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
