//! RSocket frame types and their byte-exact codec.
//!
//! Every frame starts with a 6-byte header:
//! ```ascii
//! 0: stream id (u32 BE) - top bit reserved, must be 0
//! 4: frame type (6 bits) | flags (10 bits), packed into a u16 BE
//! ```
//!
//! When the METADATA flag is set, the body starts with a 24-bit big-endian metadata
//!  length followed by that many metadata bytes; the remaining bytes are data.
//!  (METADATA_PUSH and LEASE omit the length since metadata occupies the whole rest
//!  of the body.)
//!
//! The outer 24-bit length prefix used on stream transports is *not* part of this
//!  codec - it belongs to the connection layer.

use crate::buf_ext::{try_get_bytes, BufMutExt, TryBuf};
use crate::error::{ErrorCode, FrameError};
use crate::payload::Payload;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;

pub const FRAME_HEADER_LEN: usize = 6;
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;
/// RequestN value meaning "unbounded": the producer never waits for credit again.
pub const REQUEST_N_UNBOUNDED: u32 = 0x7fff_ffff;
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

const POSITION_MASK: u64 = 0x8000_0000_0000_0000;

/// Frame type values as they appear in the top 6 bits of the type/flags word.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0a,
    Error = 0x0b,
    MetadataPush = 0x0c,
    Resume = 0x0d,
    ResumeOk = 0x0e,
    Ext = 0x3f,
}

/// Flag bits within the 10-bit flags field. Meanings beyond IGNORE/METADATA are
///  specific to the frame type.
pub mod flags {
    pub const IGNORE: u16 = 0x0200;
    pub const METADATA: u16 = 0x0100;
    /// SETUP: a resume token is present.
    pub const RESUME: u16 = 0x0080;
    /// SETUP: lease admission will be honored.
    pub const LEASE: u16 = 0x0040;
    /// KEEPALIVE: the receiver must reply with a keepalive of its own.
    pub const RESPOND: u16 = 0x0080;
    /// REQUEST_*/PAYLOAD: more fragments of this payload follow.
    pub const FOLLOWS: u16 = 0x0080;
    /// PAYLOAD/REQUEST_CHANNEL: the sending side is complete.
    pub const COMPLETE: u16 = 0x0040;
    /// PAYLOAD: this frame carries a payload value.
    pub const NEXT: u16 = 0x0020;
    pub const MASK: u16 = 0x03ff;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub stream_id: u32,
    pub frame_type: FrameType,
    pub flags: u16,
}

impl FrameHeader {
    pub fn new(stream_id: u32, frame_type: FrameType, flags: u16) -> FrameHeader {
        debug_assert!(stream_id <= MAX_STREAM_ID);
        FrameHeader {
            stream_id,
            frame_type,
            flags: flags & flags::MASK,
        }
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.stream_id);
        buf.put_u16(((self.frame_type as u8 as u16) << 10) | (self.flags & flags::MASK));
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader, FrameError> {
        let raw_stream_id = buf.try_get_u32()?;
        if raw_stream_id & 0x8000_0000 != 0 {
            return Err(FrameError::ReservedBit);
        }
        let type_and_flags = buf.try_get_u16()?;
        let raw_type = (type_and_flags >> 10) as u8;
        let frame_type =
            FrameType::try_from(raw_type).map_err(|_| FrameError::UnknownType(raw_type))?;
        Ok(FrameHeader {
            stream_id: raw_stream_id,
            frame_type,
            flags: type_and_flags & flags::MASK,
        })
    }
}

fn ser_payload(buf: &mut BytesMut, payload: &Payload) {
    if let Some(metadata) = &payload.metadata {
        buf.put_u24(metadata.len() as u32);
        buf.put_slice(metadata);
    }
    buf.put_slice(&payload.data);
}

fn deser_payload(buf: &mut Bytes, has_metadata: bool) -> Result<Payload, FrameError> {
    let metadata = if has_metadata {
        let len = buf.try_get_u24()? as usize;
        if len > buf.remaining() {
            return Err(FrameError::MetadataOverrun);
        }
        Some(buf.copy_to_bytes(len))
    } else {
        None
    };
    let data = buf.copy_to_bytes(buf.remaining());
    Ok(Payload { data, metadata })
}

fn payload_wire_len(payload: &Payload) -> usize {
    match &payload.metadata {
        Some(metadata) => 3 + metadata.len() + payload.data.len(),
        None => payload.data.len(),
    }
}

fn metadata_flag(payload: &Payload) -> u16 {
    if payload.metadata.is_some() {
        flags::METADATA
    } else {
        0
    }
}

fn check_position(value: u64, field: &'static str) -> Result<u64, FrameError> {
    if value & POSITION_MASK != 0 {
        return Err(FrameError::InvalidArgument(field));
    }
    Ok(value)
}

fn check_zero_stream_id(header: &FrameHeader) -> Result<(), FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::ExpectedZeroStreamId(
            header.frame_type,
            header.stream_id,
        ));
    }
    Ok(())
}

fn check_nonzero_stream_id(header: &FrameHeader) -> Result<(), FrameError> {
    if header.stream_id == 0 {
        return Err(FrameError::ExpectedNonZeroStreamId(header.frame_type));
    }
    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SetupFrame {
    pub major_version: u16,
    pub minor_version: u16,
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub resume_token: Option<Bytes>,
    pub lease: bool,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

impl SetupFrame {
    fn flags(&self) -> u16 {
        let mut flags = metadata_flag(&self.payload);
        if self.resume_token.is_some() {
            flags |= flags::RESUME;
        }
        if self.lease {
            flags |= flags::LEASE;
        }
        flags
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        buf.put_u32(self.keepalive_interval.as_millis() as u32);
        buf.put_u32(self.max_lifetime.as_millis() as u32);
        if let Some(token) = &self.resume_token {
            buf.put_u16(token.len() as u16);
            buf.put_slice(token);
        }
        buf.put_u8(self.metadata_mime_type.len() as u8);
        buf.put_slice(self.metadata_mime_type.as_bytes());
        buf.put_u8(self.data_mime_type.len() as u8);
        buf.put_slice(self.data_mime_type.as_bytes());
        ser_payload(buf, &self.payload);
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<SetupFrame, FrameError> {
        check_zero_stream_id(&header)?;
        let major_version = body.try_get_u16()?;
        let minor_version = body.try_get_u16()?;
        let keepalive_interval = Duration::from_millis(body.try_get_u32()? as u64);
        let max_lifetime = Duration::from_millis(body.try_get_u32()? as u64);
        let resume_token = if header.has(flags::RESUME) {
            let len = body.try_get_u16()? as usize;
            Some(try_get_bytes(&mut body, len)?)
        } else {
            None
        };
        let metadata_mime_type = deser_mime(&mut body)?;
        let data_mime_type = deser_mime(&mut body)?;
        let payload = deser_payload(&mut body, header.has(flags::METADATA))?;
        Ok(SetupFrame {
            major_version,
            minor_version,
            keepalive_interval,
            max_lifetime,
            resume_token,
            lease: header.has(flags::LEASE),
            metadata_mime_type,
            data_mime_type,
            payload,
        })
    }

    fn body_len(&self) -> usize {
        12 + self.resume_token.as_ref().map(|t| 2 + t.len()).unwrap_or(0)
            + 1
            + self.metadata_mime_type.len()
            + 1
            + self.data_mime_type.len()
            + payload_wire_len(&self.payload)
    }
}

fn deser_mime(body: &mut Bytes) -> Result<String, FrameError> {
    let len = body.try_get_u8()? as usize;
    let raw = try_get_bytes(body, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidArgument("mime type is not UTF-8"))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LeaseFrame {
    pub ttl: Duration,
    pub number_of_requests: u32,
    pub metadata: Option<Bytes>,
}

impl LeaseFrame {
    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ttl.as_millis() as u32);
        buf.put_u32(self.number_of_requests);
        if let Some(metadata) = &self.metadata {
            // metadata occupies the rest of the frame, no length prefix
            buf.put_slice(metadata);
        }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<LeaseFrame, FrameError> {
        check_zero_stream_id(&header)?;
        let ttl = Duration::from_millis(body.try_get_u32()? as u64);
        let number_of_requests = body.try_get_u32()?;
        let metadata = if header.has(flags::METADATA) {
            Some(body.copy_to_bytes(body.remaining()))
        } else {
            None
        };
        Ok(LeaseFrame {
            ttl,
            number_of_requests,
            metadata,
        })
    }

    fn body_len(&self) -> usize {
        8 + self.metadata.as_ref().map(|m| m.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeepaliveFrame {
    pub respond: bool,
    /// Running count of frame bytes received from the peer so far (63 bits).
    pub last_received_position: u64,
    pub data: Bytes,
}

impl KeepaliveFrame {
    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u64(self.last_received_position);
        buf.put_slice(&self.data);
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<KeepaliveFrame, FrameError> {
        check_zero_stream_id(&header)?;
        let last_received_position = check_position(body.try_get_u64()?, "keepalive position")?;
        Ok(KeepaliveFrame {
            respond: header.has(flags::RESPOND),
            last_received_position,
            data: body.copy_to_bytes(body.remaining()),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestResponseFrame {
    pub stream_id: u32,
    pub follows: bool,
    pub payload: Payload,
}

impl RequestResponseFrame {
    fn flags(&self) -> u16 {
        metadata_flag(&self.payload) | if self.follows { flags::FOLLOWS } else { 0 }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<RequestResponseFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        Ok(RequestResponseFrame {
            stream_id: header.stream_id,
            follows: header.has(flags::FOLLOWS),
            payload: deser_payload(&mut body, header.has(flags::METADATA))?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestFnfFrame {
    pub stream_id: u32,
    pub follows: bool,
    pub payload: Payload,
}

impl RequestFnfFrame {
    fn flags(&self) -> u16 {
        metadata_flag(&self.payload) | if self.follows { flags::FOLLOWS } else { 0 }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<RequestFnfFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        Ok(RequestFnfFrame {
            stream_id: header.stream_id,
            follows: header.has(flags::FOLLOWS),
            payload: deser_payload(&mut body, header.has(flags::METADATA))?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestStreamFrame {
    pub stream_id: u32,
    pub initial_request_n: u32,
    pub follows: bool,
    pub payload: Payload,
}

impl RequestStreamFrame {
    fn flags(&self) -> u16 {
        metadata_flag(&self.payload) | if self.follows { flags::FOLLOWS } else { 0 }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<RequestStreamFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        let initial_request_n = deser_request_n(&mut body)?;
        Ok(RequestStreamFrame {
            stream_id: header.stream_id,
            initial_request_n,
            follows: header.has(flags::FOLLOWS),
            payload: deser_payload(&mut body, header.has(flags::METADATA))?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestChannelFrame {
    pub stream_id: u32,
    pub initial_request_n: u32,
    pub follows: bool,
    /// The initiating side will send no further payloads beyond the one in this frame.
    pub complete: bool,
    pub payload: Payload,
}

impl RequestChannelFrame {
    fn flags(&self) -> u16 {
        metadata_flag(&self.payload)
            | if self.follows { flags::FOLLOWS } else { 0 }
            | if self.complete { flags::COMPLETE } else { 0 }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<RequestChannelFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        if header.has(flags::FOLLOWS) && header.has(flags::COMPLETE) {
            return Err(FrameError::InvalidArgument(
                "COMPLETE on a non-final fragment",
            ));
        }
        let initial_request_n = deser_request_n(&mut body)?;
        Ok(RequestChannelFrame {
            stream_id: header.stream_id,
            initial_request_n,
            follows: header.has(flags::FOLLOWS),
            complete: header.has(flags::COMPLETE),
            payload: deser_payload(&mut body, header.has(flags::METADATA))?,
        })
    }
}

fn deser_request_n(body: &mut Bytes) -> Result<u32, FrameError> {
    let n = body.try_get_u32()?;
    if n == 0 {
        return Err(FrameError::InvalidArgument("requestN must be positive"));
    }
    if n > REQUEST_N_UNBOUNDED {
        return Err(FrameError::InvalidArgument("requestN exceeds 31 bits"));
    }
    Ok(n)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestNFrame {
    pub stream_id: u32,
    pub n: u32,
}

impl RequestNFrame {
    fn ser_body(&self, buf: &mut BytesMut) {
        debug_assert!(self.n >= 1 && self.n <= REQUEST_N_UNBOUNDED);
        buf.put_u32(self.n);
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<RequestNFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        Ok(RequestNFrame {
            stream_id: header.stream_id,
            n: deser_request_n(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CancelFrame {
    pub stream_id: u32,
}

impl CancelFrame {
    fn deser(header: FrameHeader) -> Result<CancelFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        Ok(CancelFrame {
            stream_id: header.stream_id,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PayloadFrame {
    pub stream_id: u32,
    pub follows: bool,
    pub complete: bool,
    pub next: bool,
    pub payload: Payload,
}

impl PayloadFrame {
    pub fn next(stream_id: u32, payload: Payload) -> PayloadFrame {
        PayloadFrame {
            stream_id,
            follows: false,
            complete: false,
            next: true,
            payload,
        }
    }

    pub fn next_complete(stream_id: u32, payload: Payload) -> PayloadFrame {
        PayloadFrame {
            stream_id,
            follows: false,
            complete: true,
            next: true,
            payload,
        }
    }

    pub fn complete(stream_id: u32) -> PayloadFrame {
        PayloadFrame {
            stream_id,
            follows: false,
            complete: true,
            next: false,
            payload: Payload::empty(),
        }
    }

    fn flags(&self) -> u16 {
        metadata_flag(&self.payload)
            | if self.follows { flags::FOLLOWS } else { 0 }
            | if self.complete { flags::COMPLETE } else { 0 }
            | if self.next { flags::NEXT } else { 0 }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<PayloadFrame, FrameError> {
        check_nonzero_stream_id(&header)?;
        if !header.has(flags::NEXT) && !header.has(flags::COMPLETE) {
            return Err(FrameError::InvalidArgument(
                "PAYLOAD frame without NEXT or COMPLETE",
            ));
        }
        if header.has(flags::FOLLOWS) && header.has(flags::COMPLETE) {
            return Err(FrameError::InvalidArgument(
                "COMPLETE on a non-final fragment",
            ));
        }
        Ok(PayloadFrame {
            stream_id: header.stream_id,
            follows: header.has(flags::FOLLOWS),
            complete: header.has(flags::COMPLETE),
            next: header.has(flags::NEXT),
            payload: deser_payload(&mut body, header.has(flags::METADATA))?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorFrame {
    pub stream_id: u32,
    pub code: u32,
    pub data: Bytes,
}

impl ErrorFrame {
    pub fn new(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> ErrorFrame {
        ErrorFrame {
            stream_id,
            code: code.into(),
            data: Bytes::from(message.into()),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.code).ok()
    }

    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.code);
        buf.put_slice(&self.data);
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<ErrorFrame, FrameError> {
        Ok(ErrorFrame {
            stream_id: header.stream_id,
            code: body.try_get_u32()?,
            data: body.copy_to_bytes(body.remaining()),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetadataPushFrame {
    /// Kept from the wire so the dispatcher can drop misaddressed pushes; always 0 for
    ///  locally constructed frames.
    pub stream_id: u32,
    pub metadata: Bytes,
}

impl MetadataPushFrame {
    pub fn new(metadata: Bytes) -> MetadataPushFrame {
        MetadataPushFrame {
            stream_id: 0,
            metadata,
        }
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<MetadataPushFrame, FrameError> {
        // NB: a non-zero stream id decodes fine here; the transport drops such frames
        //  with a warning instead of killing the connection
        Ok(MetadataPushFrame {
            stream_id: header.stream_id,
            metadata: body.copy_to_bytes(body.remaining()),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResumeFrame {
    pub major_version: u16,
    pub minor_version: u16,
    pub token: Bytes,
    pub last_received_server_position: u64,
    pub first_available_client_position: u64,
}

impl ResumeFrame {
    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        buf.put_u16(self.token.len() as u16);
        buf.put_slice(&self.token);
        buf.put_u64(self.last_received_server_position);
        buf.put_u64(self.first_available_client_position);
    }

    fn deser(header: FrameHeader, mut body: Bytes) -> Result<ResumeFrame, FrameError> {
        check_zero_stream_id(&header)?;
        let major_version = body.try_get_u16()?;
        let minor_version = body.try_get_u16()?;
        let token_len = body.try_get_u16()? as usize;
        let token = try_get_bytes(&mut body, token_len)?;
        let last_received_server_position =
            check_position(body.try_get_u64()?, "resume server position")?;
        let first_available_client_position =
            check_position(body.try_get_u64()?, "resume client position")?;
        Ok(ResumeFrame {
            major_version,
            minor_version,
            token,
            last_received_server_position,
            first_available_client_position,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResumeOkFrame {
    pub last_received_client_position: u64,
}

impl ResumeOkFrame {
    fn deser(header: FrameHeader, mut body: Bytes) -> Result<ResumeOkFrame, FrameError> {
        check_zero_stream_id(&header)?;
        Ok(ResumeOkFrame {
            last_received_client_position: check_position(
                body.try_get_u64()?,
                "resume-ok position",
            )?,
        })
    }
}

/// A decoded (or to-be-encoded) RSocket frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Setup(SetupFrame),
    Lease(LeaseFrame),
    Keepalive(KeepaliveFrame),
    RequestResponse(RequestResponseFrame),
    RequestFnf(RequestFnfFrame),
    RequestStream(RequestStreamFrame),
    RequestChannel(RequestChannelFrame),
    RequestN(RequestNFrame),
    Cancel(CancelFrame),
    Payload(PayloadFrame),
    Error(ErrorFrame),
    MetadataPush(MetadataPushFrame),
    Resume(ResumeFrame),
    ResumeOk(ResumeOkFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Setup(_) => FrameType::Setup,
            Frame::Lease(_) => FrameType::Lease,
            Frame::Keepalive(_) => FrameType::Keepalive,
            Frame::RequestResponse(_) => FrameType::RequestResponse,
            Frame::RequestFnf(_) => FrameType::RequestFnf,
            Frame::RequestStream(_) => FrameType::RequestStream,
            Frame::RequestChannel(_) => FrameType::RequestChannel,
            Frame::RequestN(_) => FrameType::RequestN,
            Frame::Cancel(_) => FrameType::Cancel,
            Frame::Payload(_) => FrameType::Payload,
            Frame::Error(_) => FrameType::Error,
            Frame::MetadataPush(_) => FrameType::MetadataPush,
            Frame::Resume(_) => FrameType::Resume,
            Frame::ResumeOk(_) => FrameType::ResumeOk,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Setup(_)
            | Frame::Lease(_)
            | Frame::Keepalive(_)
            | Frame::Resume(_)
            | Frame::ResumeOk(_) => 0,
            Frame::RequestResponse(f) => f.stream_id,
            Frame::RequestFnf(f) => f.stream_id,
            Frame::RequestStream(f) => f.stream_id,
            Frame::RequestChannel(f) => f.stream_id,
            Frame::RequestN(f) => f.stream_id,
            Frame::Cancel(f) => f.stream_id,
            Frame::Payload(f) => f.stream_id,
            Frame::Error(f) => f.stream_id,
            Frame::MetadataPush(f) => f.stream_id,
        }
    }

    fn header(&self) -> FrameHeader {
        let (frame_type, flags) = match self {
            Frame::Setup(f) => (FrameType::Setup, f.flags()),
            Frame::Lease(f) => (
                FrameType::Lease,
                if f.metadata.is_some() { flags::METADATA } else { 0 },
            ),
            Frame::Keepalive(f) => (
                FrameType::Keepalive,
                if f.respond { flags::RESPOND } else { 0 },
            ),
            Frame::RequestResponse(f) => (FrameType::RequestResponse, f.flags()),
            Frame::RequestFnf(f) => (FrameType::RequestFnf, f.flags()),
            Frame::RequestStream(f) => (FrameType::RequestStream, f.flags()),
            Frame::RequestChannel(f) => (FrameType::RequestChannel, f.flags()),
            Frame::RequestN(_) => (FrameType::RequestN, 0),
            Frame::Cancel(_) => (FrameType::Cancel, 0),
            Frame::Payload(f) => (FrameType::Payload, f.flags()),
            Frame::Error(_) => (FrameType::Error, 0),
            Frame::MetadataPush(_) => (FrameType::MetadataPush, flags::METADATA),
            Frame::Resume(_) => (FrameType::Resume, 0),
            Frame::ResumeOk(_) => (FrameType::ResumeOk, 0),
        };
        FrameHeader::new(self.stream_id(), frame_type, flags)
    }

    /// Serializes the complete frame (header + body, no outer length prefix).
    pub fn ser(&self, buf: &mut BytesMut) {
        self.header().ser(buf);
        match self {
            Frame::Setup(f) => f.ser_body(buf),
            Frame::Lease(f) => f.ser_body(buf),
            Frame::Keepalive(f) => f.ser_body(buf),
            Frame::RequestResponse(f) => ser_payload(buf, &f.payload),
            Frame::RequestFnf(f) => ser_payload(buf, &f.payload),
            Frame::RequestStream(f) => {
                debug_assert!(f.initial_request_n >= 1);
                buf.put_u32(f.initial_request_n);
                ser_payload(buf, &f.payload);
            }
            Frame::RequestChannel(f) => {
                debug_assert!(f.initial_request_n >= 1);
                buf.put_u32(f.initial_request_n);
                ser_payload(buf, &f.payload);
            }
            Frame::RequestN(f) => f.ser_body(buf),
            Frame::Cancel(_) => {}
            Frame::Payload(f) => ser_payload(buf, &f.payload),
            Frame::Error(f) => f.ser_body(buf),
            Frame::MetadataPush(f) => buf.put_slice(&f.metadata),
            Frame::Resume(f) => f.ser_body(buf),
            Frame::ResumeOk(f) => buf.put_u64(f.last_received_client_position),
        }
    }

    /// Decodes one complete frame. `buf` must hold exactly the frame bytes (the outer
    ///  length prefix already stripped).
    pub fn deser(mut buf: Bytes) -> Result<Frame, FrameError> {
        let header = FrameHeader::deser(&mut buf)?;
        match header.frame_type {
            FrameType::Setup => SetupFrame::deser(header, buf).map(Frame::Setup),
            FrameType::Lease => LeaseFrame::deser(header, buf).map(Frame::Lease),
            FrameType::Keepalive => KeepaliveFrame::deser(header, buf).map(Frame::Keepalive),
            FrameType::RequestResponse => {
                RequestResponseFrame::deser(header, buf).map(Frame::RequestResponse)
            }
            FrameType::RequestFnf => RequestFnfFrame::deser(header, buf).map(Frame::RequestFnf),
            FrameType::RequestStream => {
                RequestStreamFrame::deser(header, buf).map(Frame::RequestStream)
            }
            FrameType::RequestChannel => {
                RequestChannelFrame::deser(header, buf).map(Frame::RequestChannel)
            }
            FrameType::RequestN => RequestNFrame::deser(header, buf).map(Frame::RequestN),
            FrameType::Cancel => CancelFrame::deser(header).map(Frame::Cancel),
            FrameType::Payload => PayloadFrame::deser(header, buf).map(Frame::Payload),
            FrameType::Error => ErrorFrame::deser(header, buf).map(Frame::Error),
            FrameType::MetadataPush => {
                MetadataPushFrame::deser(header, buf).map(Frame::MetadataPush)
            }
            FrameType::Resume => ResumeFrame::deser(header, buf).map(Frame::Resume),
            FrameType::ResumeOk => ResumeOkFrame::deser(header, buf).map(Frame::ResumeOk),
            FrameType::Ext => Err(FrameError::Unsupported(FrameType::Ext)),
        }
    }

    /// Exact byte length of the serialized frame. Used for resume position bookkeeping
    ///  without encoding twice; must stay in lockstep with `ser`.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Frame::Setup(f) => f.body_len(),
            Frame::Lease(f) => f.body_len(),
            Frame::Keepalive(f) => 8 + f.data.len(),
            Frame::RequestResponse(f) => payload_wire_len(&f.payload),
            Frame::RequestFnf(f) => payload_wire_len(&f.payload),
            Frame::RequestStream(f) => 4 + payload_wire_len(&f.payload),
            Frame::RequestChannel(f) => 4 + payload_wire_len(&f.payload),
            Frame::RequestN(_) => 4,
            Frame::Cancel(_) => 0,
            Frame::Payload(f) => payload_wire_len(&f.payload),
            Frame::Error(f) => 4 + f.data.len(),
            Frame::MetadataPush(f) => f.metadata.len(),
            Frame::Resume(f) => 6 + f.token.len() + 16,
            Frame::ResumeOk(_) => 8,
        };
        FRAME_HEADER_LEN + body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(frame.encoded_len(), buf.len(), "encoded_len out of sync with ser");
        Frame::deser(buf.freeze()).unwrap()
    }

    fn setup_frame() -> Frame {
        Frame::Setup(SetupFrame {
            major_version: VERSION_MAJOR,
            minor_version: VERSION_MINOR,
            keepalive_interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
            resume_token: Some(Bytes::from_static(b"token-1")),
            lease: true,
            metadata_mime_type: "application/json".to_string(),
            data_mime_type: "application/binary".to_string(),
            payload: Payload::new("setup-data", Some(Bytes::from_static(b"setup-meta"))),
        })
    }

    #[rstest]
    #[case::setup(setup_frame())]
    #[case::setup_plain(Frame::Setup(SetupFrame {
        major_version: 1,
        minor_version: 0,
        keepalive_interval: Duration::from_millis(500),
        max_lifetime: Duration::from_millis(1500),
        resume_token: None,
        lease: false,
        metadata_mime_type: "text/plain".to_string(),
        data_mime_type: "text/plain".to_string(),
        payload: Payload::empty(),
    }))]
    #[case::lease(Frame::Lease(LeaseFrame {
        ttl: Duration::from_secs(1),
        number_of_requests: 42,
        metadata: Some(Bytes::from_static(b"lease-meta")),
    }))]
    #[case::keepalive(Frame::Keepalive(KeepaliveFrame {
        respond: true,
        last_received_position: 1234567,
        data: Bytes::from_static(b"ka"),
    }))]
    #[case::request_response(Frame::RequestResponse(RequestResponseFrame {
        stream_id: 1,
        follows: false,
        payload: Payload::new("ping", Some(Bytes::from_static(b"m"))),
    }))]
    #[case::request_fnf(Frame::RequestFnf(RequestFnfFrame {
        stream_id: 3,
        follows: true,
        payload: Payload::from_data("fire"),
    }))]
    #[case::request_stream(Frame::RequestStream(RequestStreamFrame {
        stream_id: 5,
        initial_request_n: 2,
        follows: false,
        payload: Payload::from_data("subscribe"),
    }))]
    #[case::request_channel(Frame::RequestChannel(RequestChannelFrame {
        stream_id: 7,
        initial_request_n: REQUEST_N_UNBOUNDED,
        follows: false,
        complete: true,
        payload: Payload::from_data("u0"),
    }))]
    #[case::request_n(Frame::RequestN(RequestNFrame { stream_id: 5, n: 128 }))]
    #[case::cancel(Frame::Cancel(CancelFrame { stream_id: 9 }))]
    #[case::payload_next(Frame::Payload(PayloadFrame::next(5, Payload::from_data("A"))))]
    #[case::payload_next_complete(Frame::Payload(PayloadFrame::next_complete(
        1,
        Payload::new("pong", Some(Bytes::from_static(b"m")))
    )))]
    #[case::payload_complete(Frame::Payload(PayloadFrame::complete(5)))]
    #[case::error(Frame::Error(ErrorFrame::new(4, ErrorCode::ApplicationError, "boom")))]
    #[case::error_zero_sid(Frame::Error(ErrorFrame::new(0, ErrorCode::ConnectionError, "bad")))]
    #[case::metadata_push(Frame::MetadataPush(MetadataPushFrame::new(Bytes::from_static(b"routing"))))]
    #[case::resume(Frame::Resume(ResumeFrame {
        major_version: 1,
        minor_version: 0,
        token: Bytes::from_static(b"token-1"),
        last_received_server_position: 100,
        first_available_client_position: 50,
    }))]
    #[case::resume_ok(Frame::ResumeOk(ResumeOkFrame { last_received_client_position: 77 }))]
    fn test_roundtrip(#[case] frame: Frame) {
        assert_eq!(frame, roundtrip(frame.clone()));
    }

    #[rstest]
    #[case::request_response(
        Frame::RequestResponse(RequestResponseFrame {
            stream_id: 1,
            follows: false,
            payload: Payload::new("ping", Some(Bytes::from_static(b"m"))),
        }),
        vec![0,0,0,1, 0x11,0x00, 0,0,1, b'm', b'p',b'i',b'n',b'g'])]
    #[case::keepalive_respond(
        Frame::Keepalive(KeepaliveFrame {
            respond: true,
            last_received_position: 8,
            data: Bytes::new(),
        }),
        vec![0,0,0,0, 0x0c,0x80, 0,0,0,0,0,0,0,8])]
    #[case::request_n(
        Frame::RequestN(RequestNFrame { stream_id: 3, n: 2 }),
        vec![0,0,0,3, 0x20,0x00, 0,0,0,2])]
    #[case::cancel(
        Frame::Cancel(CancelFrame { stream_id: 9 }),
        vec![0,0,0,9, 0x24,0x00])]
    #[case::payload_next_complete(
        Frame::Payload(PayloadFrame::next_complete(5, Payload::from_data("D"))),
        vec![0,0,0,5, 0x28,0x60, b'D'])]
    #[case::error(
        Frame::Error(ErrorFrame::new(4, ErrorCode::ApplicationError, "no")),
        vec![0,0,0,4, 0x2c,0x00, 0,0,2,1, b'n', b'o'])]
    fn test_exact_bytes(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(expected, buf.to_vec());
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(
            FrameError::Incomplete,
            Frame::deser(Bytes::from_static(&[0, 0, 0])).unwrap_err()
        );
    }

    #[test]
    fn test_reserved_bit_rejected() {
        let bytes = Bytes::from_static(&[0x80, 0, 0, 1, 0x24, 0x00]);
        assert_eq!(FrameError::ReservedBit, Frame::deser(bytes).unwrap_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        // type bits 0x00 are the reserved frame type
        let bytes = Bytes::from_static(&[0, 0, 0, 1, 0x00, 0x00]);
        assert_eq!(FrameError::UnknownType(0), Frame::deser(bytes).unwrap_err());
    }

    #[test]
    fn test_ext_type_unsupported() {
        let bytes = Bytes::from_static(&[0, 0, 0, 0, 0xfc, 0x00]);
        assert_eq!(
            FrameError::Unsupported(FrameType::Ext),
            Frame::deser(bytes).unwrap_err()
        );
    }

    #[test]
    fn test_metadata_overrun_rejected() {
        // PAYLOAD, NEXT|METADATA, declared metadata length 16 but only 2 bytes follow
        let bytes = Bytes::from_static(&[0, 0, 0, 1, 0x29, 0x20, 0, 0, 16, b'x', b'y']);
        assert_eq!(FrameError::MetadataOverrun, Frame::deser(bytes).unwrap_err());
    }

    #[test]
    fn test_setup_with_nonzero_stream_id_rejected() {
        let mut buf = BytesMut::new();
        setup_frame().ser(&mut buf);
        // patch the stream id
        buf[3] = 7;
        assert_eq!(
            FrameError::ExpectedZeroStreamId(FrameType::Setup, 7),
            Frame::deser(buf.freeze()).unwrap_err()
        );
    }

    #[test]
    fn test_request_on_stream_zero_rejected() {
        let bytes = Bytes::from_static(&[0, 0, 0, 0, 0x10, 0x00, b'x']);
        assert_eq!(
            FrameError::ExpectedNonZeroStreamId(FrameType::RequestResponse),
            Frame::deser(bytes).unwrap_err()
        );
    }

    #[test]
    fn test_request_n_zero_rejected() {
        let bytes = Bytes::from_static(&[0, 0, 0, 3, 0x20, 0x00, 0, 0, 0, 0]);
        assert_eq!(
            FrameError::InvalidArgument("requestN must be positive"),
            Frame::deser(bytes).unwrap_err()
        );
    }

    #[test]
    fn test_payload_without_next_or_complete_rejected() {
        let bytes = Bytes::from_static(&[0, 0, 0, 3, 0x28, 0x00]);
        assert_eq!(
            FrameError::InvalidArgument("PAYLOAD frame without NEXT or COMPLETE"),
            Frame::deser(bytes).unwrap_err()
        );
    }

    #[test]
    fn test_follows_with_complete_rejected() {
        // PAYLOAD with FOLLOWS|COMPLETE|NEXT
        let bytes = Bytes::from_static(&[0, 0, 0, 3, 0x28, 0xe0]);
        assert_eq!(
            FrameError::InvalidArgument("COMPLETE on a non-final fragment"),
            Frame::deser(bytes).unwrap_err()
        );
    }

    #[test]
    fn test_keepalive_position_extraction() {
        let frame = roundtrip(Frame::Keepalive(KeepaliveFrame {
            respond: false,
            last_received_position: (1 << 62) + 5,
            data: Bytes::new(),
        }));
        match frame {
            Frame::Keepalive(ka) => {
                assert!(!ka.respond);
                assert_eq!((1 << 62) + 5, ka.last_received_position);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_metadata_push_keeps_nonzero_stream_id() {
        // misaddressed push decodes; dropping it is the transport's call
        let bytes = Bytes::from_static(&[0, 0, 0, 5, 0x31, 0x00, b'm']);
        match Frame::deser(bytes).unwrap() {
            Frame::MetadataPush(push) => {
                assert_eq!(5, push.stream_id);
                assert_eq!(&push.metadata[..], b"m");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
