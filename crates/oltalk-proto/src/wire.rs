//! Framed binary wire format.
//!
//! Every frame starts with a fixed 28-byte header (all integers big-endian):
//!
//! ```text
//! [0..4]    magic (0x4F4C544B, "OLTK")
//! [4..6]    protocol version (1)
//! [6..8]    packet type tag
//! [8..12]   flags (reserved, 0)
//! [12..20]  request id (0 for server-initiated deliveries)
//! [20..24]  metadata length
//! [24..28]  binary payload length
//! ```
//!
//! followed by `meta_len` bytes of UTF-8 JSON and `bin_len` bytes of opaque
//! payload (file chunks). Length caps are enforced from the header alone,
//! before any allocation for the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const MAGIC: u32 = 0x4F4C_544B;
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 28;

/// Metadata JSON is capped at 1 MiB.
pub const MAX_META_LEN: usize = 1024 * 1024;

/// Binary payload is capped at 32 MiB.
pub const MAX_BINARY_LEN: usize = 32 * 1024 * 1024;

/// Packet type tags. Tag 6 is reserved; tags 13/14 carry conversation
/// history paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    AuthRegister = 1,
    AuthLogin = 2,
    AuthOk = 3,
    AuthError = 4,
    UserListUpdate = 5,
    PresenceUpdate = 6,
    GroupCreate = 7,
    GroupJoin = 8,
    GroupLeave = 9,
    GroupAdmin = 10,
    MessageSend = 11,
    MessageDeliver = 12,
    HistoryFetch = 13,
    HistoryResponse = 14,
    FileOffer = 15,
    FileAccept = 16,
    FileUploadChunk = 17,
    FileUploadDone = 18,
    FileDownloadRequest = 19,
    FileDownloadChunk = 20,
    FileDone = 21,
}

impl PacketType {
    pub fn from_u16(tag: u16) -> Option<Self> {
        Some(match tag {
            1 => Self::AuthRegister,
            2 => Self::AuthLogin,
            3 => Self::AuthOk,
            4 => Self::AuthError,
            5 => Self::UserListUpdate,
            6 => Self::PresenceUpdate,
            7 => Self::GroupCreate,
            8 => Self::GroupJoin,
            9 => Self::GroupLeave,
            10 => Self::GroupAdmin,
            11 => Self::MessageSend,
            12 => Self::MessageDeliver,
            13 => Self::HistoryFetch,
            14 => Self::HistoryResponse,
            15 => Self::FileOffer,
            16 => Self::FileAccept,
            17 => Self::FileUploadChunk,
            18 => Self::FileUploadDone,
            19 => Self::FileDownloadRequest,
            20 => Self::FileDownloadChunk,
            21 => Self::FileDone,
            _ => return None,
        })
    }
}

/// Fatal framing violations. Any of these closes the connection; recoverable
/// request errors travel inside the metadata envelope instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    BadVersion(u16),
    #[error("metadata length {0} exceeds cap")]
    MetaTooLong(usize),
    #[error("binary length {0} exceeds cap")]
    BinaryTooLong(usize),
    #[error("metadata is not valid utf-8")]
    MetaNotUtf8,
}

/// A decoded frame. `packet_type` stays a raw tag so unknown types reach the
/// dispatcher, which logs and drops them instead of killing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u16,
    pub flags: u32,
    pub request_id: u64,
    pub meta: String,
    pub binary: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, request_id: u64, meta: String) -> Self {
        Self {
            packet_type: packet_type as u16,
            flags: 0,
            request_id,
            meta,
            binary: Vec::new(),
        }
    }

    /// Build a response that echoes a request's raw type tag.
    pub fn new_raw(packet_type: u16, request_id: u64, meta: String) -> Self {
        Self {
            packet_type,
            flags: 0,
            request_id,
            meta,
            binary: Vec::new(),
        }
    }

    pub fn with_binary(
        packet_type: PacketType,
        request_id: u64,
        meta: String,
        binary: Vec<u8>,
    ) -> Self {
        Self {
            packet_type: packet_type as u16,
            flags: 0,
            request_id,
            meta,
            binary,
        }
    }
}

/// Encode a packet into a single contiguous frame.
pub fn encode(packet: &Packet) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + packet.meta.len() + packet.binary.len());
    out.put_u32(MAGIC);
    out.put_u16(VERSION);
    out.put_u16(packet.packet_type);
    out.put_u32(packet.flags);
    out.put_u64(packet.request_id);
    out.put_u32(packet.meta.len() as u32);
    out.put_u32(packet.binary.len() as u32);
    out.put_slice(packet.meta.as_bytes());
    out.put_slice(&packet.binary);
    out.freeze()
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a frame (read
/// more and retry), and consumes exactly the frame's bytes on success. Header
/// violations are fatal and leave the buffer untouched.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    if version != VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let packet_type = u16::from_be_bytes(buf[6..8].try_into().unwrap());
    let flags = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let request_id = u64::from_be_bytes(buf[12..20].try_into().unwrap());
    let meta_len = u32::from_be_bytes(buf[20..24].try_into().unwrap()) as usize;
    let bin_len = u32::from_be_bytes(buf[24..28].try_into().unwrap()) as usize;

    if meta_len > MAX_META_LEN {
        return Err(FrameError::MetaTooLong(meta_len));
    }
    if bin_len > MAX_BINARY_LEN {
        return Err(FrameError::BinaryTooLong(bin_len));
    }

    let total = HEADER_LEN + meta_len + bin_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut frame = buf.split_to(total);
    frame.advance(HEADER_LEN);
    let meta_bytes = frame.split_to(meta_len);
    let meta = String::from_utf8(meta_bytes.to_vec()).map_err(|_| FrameError::MetaNotUtf8)?;
    let binary = frame.to_vec();

    Ok(Some(Packet {
        packet_type,
        flags,
        request_id,
        meta,
        binary,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::with_binary(
            PacketType::FileUploadChunk,
            42,
            r#"{"file_id":"abc","offset":0}"#.to_string(),
            vec![1, 2, 3, 4, 5],
        )
    }

    #[test]
    fn roundtrip() {
        let packet = sample_packet();
        let mut buf = BytesMut::from(&encode(&packet)[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_empty_meta_and_binary() {
        let packet = Packet::new(PacketType::GroupLeave, 7, String::new());
        let mut buf = BytesMut::from(&encode(&packet)[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.meta, "");
        assert!(decoded.binary.is_empty());
        assert_eq!(decoded.request_id, 7);
    }

    #[test]
    fn need_more_for_every_prefix() {
        let frame = encode(&sample_packet());
        for len in 0..frame.len() {
            let mut buf = BytesMut::from(&frame[..len]);
            assert_eq!(decode(&mut buf).unwrap(), None, "prefix of {} bytes", len);
            assert_eq!(buf.len(), len, "partial decode must not consume");
        }
        let mut buf = BytesMut::from(&frame[..]);
        assert!(decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = Packet::new(PacketType::MessageSend, 1, "{}".to_string());
        let b = sample_packet();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&a));
        buf.extend_from_slice(&encode(&b));
        assert_eq!(decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b);
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn reject_bad_magic() {
        let mut frame = BytesMut::from(&encode(&sample_packet())[..]);
        frame[0] = 0xFF;
        assert_eq!(
            decode(&mut frame),
            Err(FrameError::BadMagic(0xFF4C_544B))
        );
    }

    #[test]
    fn reject_bad_version() {
        let mut frame = BytesMut::from(&encode(&sample_packet())[..]);
        frame[4] = 0x00;
        frame[5] = 0x02;
        assert_eq!(decode(&mut frame), Err(FrameError::BadVersion(2)));
    }

    fn header_with_lengths(meta_len: u32, bin_len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(PacketType::FileUploadChunk as u16);
        buf.put_u32(0);
        buf.put_u64(1);
        buf.put_u32(meta_len);
        buf.put_u32(bin_len);
        buf
    }

    #[test]
    fn length_caps_enforced_from_header() {
        // At-cap lengths are accepted: with only the header present the codec
        // asks for more bytes rather than failing.
        let mut buf = header_with_lengths(MAX_META_LEN as u32, MAX_BINARY_LEN as u32);
        assert_eq!(decode(&mut buf).unwrap(), None);

        let mut buf = header_with_lengths(MAX_META_LEN as u32 + 1, 0);
        assert_eq!(
            decode(&mut buf),
            Err(FrameError::MetaTooLong(MAX_META_LEN + 1))
        );

        let mut buf = header_with_lengths(0, MAX_BINARY_LEN as u32 + 1);
        assert_eq!(
            decode(&mut buf),
            Err(FrameError::BinaryTooLong(MAX_BINARY_LEN + 1))
        );
    }

    #[test]
    fn meta_at_cap_roundtrips() {
        let packet = Packet::new(PacketType::MessageSend, 9, "x".repeat(MAX_META_LEN));
        let mut buf = BytesMut::from(&encode(&packet)[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.meta.len(), MAX_META_LEN);
    }

    #[test]
    fn reject_non_utf8_meta() {
        let mut buf = header_with_lengths(2, 0);
        buf.put_slice(&[0xFF, 0xFE]);
        assert_eq!(decode(&mut buf), Err(FrameError::MetaNotUtf8));
    }

    #[test]
    fn unknown_tag_reaches_caller() {
        let mut frame = BytesMut::from(&encode(&sample_packet())[..]);
        frame[6] = 0x00;
        frame[7] = 0x63; // tag 99
        let decoded = decode(&mut frame).unwrap().unwrap();
        assert_eq!(decoded.packet_type, 99);
        assert_eq!(PacketType::from_u16(decoded.packet_type), None);
    }
}
