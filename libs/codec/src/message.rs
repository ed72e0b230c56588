//! Wire Message Framing
//!
//! Every message is a fixed 44-byte big-endian header, followed by the
//! annotation blocks and then the serialized body:
//!
//! ```text
//! 0   magic "TTHR"        4
//! 4   version             u16
//! 6   message type        u16
//! 8   flags               u16
//! 10  sequence number     u16
//! 12  serializer id       u16
//! 14  annotation count    u16
//! 16  annotations length  u32
//! 20  body length         u32
//! 24  correlation id      [u8; 16]
//! 40  header checksum     u32
//! ```
//!
//! The checksum is a CRC32 over the first 40 header bytes.
//!
//! The codec knows the serializer only as an integer tag. When an HMAC key is
//! configured the `HMAC` annotation is always the first block and covers the
//! header, the remaining blocks and the body.

use crate::annotations::{AnnotationTag, Annotations, ANNOTATION_BLOCK_OVERHEAD};
use crate::error::{CodecError, Result};
use crate::security::{MessageAuthenticator, DIGEST_SIZE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};
use tracing::warn;
use uuid::Uuid;

/// Wire format constants
pub struct WireFormat;

impl WireFormat {
    /// Protocol version
    pub const VERSION: u16 = 1;
    /// Magic bytes for message validation
    pub const MAGIC: &'static [u8; 4] = b"TTHR";
    /// Fixed header size in bytes
    pub const HEADER_SIZE: usize = 44;
    /// Header bytes covered by the checksum
    pub const CHECKSUM_OFFSET: usize = 40;
    /// Upper bound on the annotation area, independent of the body limit
    pub const MAX_ANNOTATIONS_SIZE: u32 = 16 * 1024 * 1024;
}

/// Kind of message carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Connect = 1,
    ConnectOk = 2,
    ConnectFail = 3,
    Invoke = 4,
    Result = 5,
    Ping = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Connect,
            2 => MessageType::ConnectOk,
            3 => MessageType::ConnectFail,
            4 => MessageType::Invoke,
            5 => MessageType::Result,
            6 => MessageType::Ping,
            other => return Err(CodecError::UnknownMessageType { msg_type: other }),
        })
    }
}

/// Message flags for special handling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// Body is an error envelope
    pub exception: bool,
    /// Caller does not wait for a reply
    pub oneway: bool,
    /// Body holds several calls (or their outcomes)
    pub batch: bool,
    /// Frame carries an `HMAC` annotation
    pub hmac: bool,
    /// Reply opened, or continues, an item stream
    pub item_stream: bool,
    /// Item stream is exhausted
    pub stream_end: bool,
    /// Connect reply should include object metadata
    pub meta_on_connect: bool,
}

impl MessageFlags {
    const EXCEPTION: u16 = 1 << 0;
    const ONEWAY: u16 = 1 << 1;
    const BATCH: u16 = 1 << 2;
    const HMAC: u16 = 1 << 3;
    const ITEM_STREAM: u16 = 1 << 4;
    const STREAM_END: u16 = 1 << 5;
    const META_ON_CONNECT: u16 = 1 << 6;

    /// Convert flags to their wire representation
    pub fn to_bits(&self) -> u16 {
        let mut bits = 0u16;
        if self.exception {
            bits |= Self::EXCEPTION;
        }
        if self.oneway {
            bits |= Self::ONEWAY;
        }
        if self.batch {
            bits |= Self::BATCH;
        }
        if self.hmac {
            bits |= Self::HMAC;
        }
        if self.item_stream {
            bits |= Self::ITEM_STREAM;
        }
        if self.stream_end {
            bits |= Self::STREAM_END;
        }
        if self.meta_on_connect {
            bits |= Self::META_ON_CONNECT;
        }
        bits
    }

    /// Create flags from their wire representation; unknown bits are ignored
    pub fn from_bits(bits: u16) -> Self {
        Self {
            exception: bits & Self::EXCEPTION != 0,
            oneway: bits & Self::ONEWAY != 0,
            batch: bits & Self::BATCH != 0,
            hmac: bits & Self::HMAC != 0,
            item_stream: bits & Self::ITEM_STREAM != 0,
            stream_end: bits & Self::STREAM_END != 0,
            meta_on_connect: bits & Self::META_ON_CONNECT != 0,
        }
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub seq: u16,
    pub serializer_id: u16,
    pub annotation_count: u16,
    pub annotations_len: u32,
    pub body_len: u32,
    pub correlation_id: Uuid,
    pub checksum: u32,
}

impl MessageHeader {
    /// Bytes following the header for this frame
    pub fn payload_len(&self) -> usize {
        self.annotations_len as usize + self.body_len as usize
    }

    fn compute_checksum(header: &[u8]) -> u32 {
        crc32fast::hash(&header[..WireFormat::CHECKSUM_OFFSET])
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub seq: u16,
    pub serializer_id: u16,
    pub correlation_id: Uuid,
    pub annotations: Annotations,
    pub body: Bytes,
}

impl Message {
    pub fn new(msg_type: MessageType, seq: u16, serializer_id: u16, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            flags: MessageFlags::default(),
            seq,
            serializer_id,
            correlation_id: Uuid::nil(),
            annotations: Annotations::new(),
            body: body.into(),
        }
    }

    /// Reply to `request`, echoing its sequence number and correlation id
    pub fn reply_to(request: &Message, msg_type: MessageType, body: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            ..Self::new(msg_type, request.seq, request.serializer_id, body)
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }
}

/// Encoder/decoder bound to one size limit and optional HMAC key
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    max_message_size: usize,
    authenticator: Option<MessageAuthenticator>,
}

impl MessageCodec {
    /// `max_message_size` of 0 means unlimited
    pub fn new(max_message_size: usize, hmac_key: Option<&[u8]>) -> Result<Self> {
        let authenticator = hmac_key.map(MessageAuthenticator::new).transpose()?;
        Ok(Self {
            max_message_size,
            authenticator,
        })
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn has_hmac(&self) -> bool {
        self.authenticator.is_some()
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if self.max_message_size > 0 && size > self.max_message_size {
            return Err(CodecError::message_too_large(size, self.max_message_size));
        }
        Ok(())
    }

    /// Encode a message into one contiguous frame
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        self.check_size(message.body.len())?;

        let skip = Some(&AnnotationTag::HMAC);
        let user_count = message
            .annotations
            .iter()
            .filter(|(tag, _)| **tag != AnnotationTag::HMAC)
            .count();
        let mut annotation_count = user_count;
        let mut annotations_len = message.annotations.encoded_len(skip);
        let mut flags = message.flags;
        flags.hmac = self.authenticator.is_some();
        if flags.hmac {
            annotation_count += 1;
            annotations_len += ANNOTATION_BLOCK_OVERHEAD + DIGEST_SIZE;
        }
        if annotation_count > u16::MAX as usize || annotations_len > u32::MAX as usize {
            return Err(CodecError::invalid_annotation(0, "too many annotations"));
        }
        let body_len = u32::try_from(message.body.len())
            .map_err(|_| CodecError::message_too_large(message.body.len(), u32::MAX as usize))?;

        let flag_bits = flags.to_bits();

        let mut header = Vec::with_capacity(WireFormat::HEADER_SIZE);
        header.extend_from_slice(WireFormat::MAGIC);
        // Writing into a Vec cannot fail
        let _ = header.write_u16::<BigEndian>(WireFormat::VERSION);
        let _ = header.write_u16::<BigEndian>(message.msg_type as u16);
        let _ = header.write_u16::<BigEndian>(flag_bits);
        let _ = header.write_u16::<BigEndian>(message.seq);
        let _ = header.write_u16::<BigEndian>(message.serializer_id);
        let _ = header.write_u16::<BigEndian>(annotation_count as u16);
        let _ = header.write_u32::<BigEndian>(annotations_len as u32);
        let _ = header.write_u32::<BigEndian>(body_len);
        header.extend_from_slice(message.correlation_id.as_bytes());
        let checksum = MessageHeader::compute_checksum(&header);
        let _ = header.write_u32::<BigEndian>(checksum);

        let mut user_blocks = Vec::with_capacity(annotations_len);
        message.annotations.encode_into(&mut user_blocks, skip);

        let mut frame =
            Vec::with_capacity(WireFormat::HEADER_SIZE + annotations_len + message.body.len());
        frame.extend_from_slice(&header);
        if let Some(auth) = &self.authenticator {
            let digest = auth.sign(&[&header, &user_blocks, &message.body])?;
            frame.extend_from_slice(AnnotationTag::HMAC.as_bytes());
            let _ = frame.write_u32::<BigEndian>(DIGEST_SIZE as u32);
            frame.extend_from_slice(&digest);
        }
        frame.extend_from_slice(&user_blocks);
        frame.extend_from_slice(&message.body);

        Ok(Bytes::from(frame))
    }

    /// Validate and parse the fixed header
    pub fn decode_header(&self, data: &[u8]) -> Result<MessageHeader> {
        if data.len() < WireFormat::HEADER_SIZE {
            return Err(CodecError::message_too_small(
                WireFormat::HEADER_SIZE,
                data.len(),
                "message header",
            ));
        }

        let mut cursor = Cursor::new(&data[..WireFormat::HEADER_SIZE]);
        let mut magic = [0u8; 4];
        read_exact(&mut cursor, &mut magic)?;
        if &magic != WireFormat::MAGIC {
            return Err(CodecError::invalid_magic(*WireFormat::MAGIC, magic));
        }

        let version = read_u16(&mut cursor)?;
        if version != WireFormat::VERSION {
            return Err(CodecError::UnsupportedVersion {
                version,
                supported: WireFormat::VERSION,
            });
        }

        let raw_type = read_u16(&mut cursor)?;
        let flag_bits = read_u16(&mut cursor)?;
        let seq = read_u16(&mut cursor)?;
        let serializer_id = read_u16(&mut cursor)?;
        let annotation_count = read_u16(&mut cursor)?;
        let annotations_len = read_u32(&mut cursor)?;
        let body_len = read_u32(&mut cursor)?;
        let mut correlation = [0u8; 16];
        read_exact(&mut cursor, &mut correlation)?;
        let checksum = read_u32(&mut cursor)?;

        let calculated = MessageHeader::compute_checksum(data);
        if calculated != checksum {
            return Err(CodecError::ChecksumMismatch {
                expected: checksum,
                calculated,
            });
        }

        let msg_type = MessageType::try_from(raw_type)?;
        self.check_size(body_len as usize)?;
        if annotations_len > WireFormat::MAX_ANNOTATIONS_SIZE {
            return Err(CodecError::invalid_annotation(
                WireFormat::HEADER_SIZE,
                format!("annotation area of {} bytes is too large", annotations_len),
            ));
        }

        Ok(MessageHeader {
            version,
            msg_type,
            flags: MessageFlags::from_bits(flag_bits),
            seq,
            serializer_id,
            annotation_count,
            annotations_len,
            body_len,
            correlation_id: Uuid::from_bytes(correlation),
            checksum,
        })
    }

    /// Decode a complete frame (header, annotations, body)
    pub fn decode(&self, frame: &[u8]) -> Result<Message> {
        let header = self.decode_header(frame)?;
        let expected = WireFormat::HEADER_SIZE + header.payload_len();
        if frame.len() != expected {
            return Err(CodecError::message_too_small(
                expected,
                frame.len(),
                "frame length does not match header",
            ));
        }

        let header_bytes = &frame[..WireFormat::HEADER_SIZE];
        let block_end = WireFormat::HEADER_SIZE + header.annotations_len as usize;
        let blocks = &frame[WireFormat::HEADER_SIZE..block_end];
        let body = &frame[block_end..];

        let mut annotations = Annotations::decode(blocks, header.annotation_count as usize)?;

        match (&self.authenticator, header.flags.hmac) {
            (Some(auth), true) => {
                let digest_block = ANNOTATION_BLOCK_OVERHEAD + DIGEST_SIZE;
                if blocks.len() < digest_block || &blocks[..4] != AnnotationTag::HMAC.as_bytes() {
                    return Err(CodecError::authentication("HMAC block missing or misplaced"));
                }
                let digest = annotations
                    .remove(&AnnotationTag::HMAC)
                    .ok_or_else(|| CodecError::authentication("HMAC block missing"))?;
                if let Err(e) = auth.verify(&[header_bytes, &blocks[digest_block..], body], &digest) {
                    warn!(seq = header.seq, msg_type = ?header.msg_type, "Rejecting frame with bad HMAC digest");
                    return Err(e);
                }
            }
            (Some(_), false) => {
                return Err(CodecError::authentication(
                    "message carries no HMAC but a key is configured",
                ));
            }
            (None, true) => {
                return Err(CodecError::authentication(
                    "message carries an HMAC but no key is configured",
                ));
            }
            (None, false) => {}
        }

        let mut flags = header.flags;
        flags.hmac = false;

        Ok(Message {
            msg_type: header.msg_type,
            flags,
            seq: header.seq,
            serializer_id: header.serializer_id,
            correlation_id: header.correlation_id,
            annotations,
            body: Bytes::copy_from_slice(body),
        })
    }
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| CodecError::message_too_small(WireFormat::HEADER_SIZE, 0, "header field"))
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    cursor
        .read_u16::<BigEndian>()
        .map_err(|_| CodecError::message_too_small(WireFormat::HEADER_SIZE, 0, "header field"))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| CodecError::message_too_small(WireFormat::HEADER_SIZE, 0, "header field"))
}
