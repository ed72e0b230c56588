//! Message annotations
//!
//! Out-of-band byte blobs keyed by a 4-character ASCII tag. They travel
//! next to the body without passing through the payload serializer.
//! Wire form of one block: tag (4 bytes) + big-endian `u32` length + data.

use crate::error::{CodecError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};

/// Bytes of block overhead before the annotation data
pub const ANNOTATION_BLOCK_OVERHEAD: usize = 8;

/// Four ASCII characters naming an annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnnotationTag([u8; 4]);

impl AnnotationTag {
    /// Message digest, managed by the codec
    pub const HMAC: AnnotationTag = AnnotationTag(*b"HMAC");
    /// Stream id attached to a reply that opened an item stream
    pub const STREAM: AnnotationTag = AnnotationTag(*b"STRM");
    /// Sub-sequence number of a stream item reply
    pub const SUBSEQ: AnnotationTag = AnnotationTag(*b"SSEQ");

    pub fn new(tag: &str) -> Result<Self> {
        let bytes = tag.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(CodecError::invalid_annotation(
                0,
                format!("tag '{}' must be exactly 4 printable ASCII characters", tag),
            ));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for AnnotationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered tag → blob mapping carried by a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    entries: BTreeMap<AnnotationTag, Bytes>,
}

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: AnnotationTag, data: impl Into<Bytes>) -> Option<Bytes> {
        self.entries.insert(tag, data.into())
    }

    pub fn get(&self, tag: &AnnotationTag) -> Option<&Bytes> {
        self.entries.get(tag)
    }

    pub fn remove(&mut self, tag: &AnnotationTag) -> Option<Bytes> {
        self.entries.remove(tag)
    }

    pub fn contains(&self, tag: &AnnotationTag) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AnnotationTag, &Bytes)> {
        self.entries.iter()
    }

    /// Merge `other` into self, overwriting duplicate tags
    pub fn extend(&mut self, other: &Annotations) {
        for (tag, data) in other.iter() {
            self.entries.insert(*tag, data.clone());
        }
    }

    /// Store a big-endian `u32`
    pub fn insert_u32(&mut self, tag: AnnotationTag, value: u32) {
        self.insert(tag, Bytes::copy_from_slice(&value.to_be_bytes()));
    }

    pub fn get_u32(&self, tag: &AnnotationTag) -> Option<u32> {
        let data = self.get(tag)?;
        let bytes: [u8; 4] = data.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Encoded size of all blocks, optionally skipping one tag
    pub fn encoded_len(&self, skip: Option<&AnnotationTag>) -> usize {
        self.entries
            .iter()
            .filter(|(tag, _)| Some(*tag) != skip)
            .map(|(_, data)| ANNOTATION_BLOCK_OVERHEAD + data.len())
            .sum()
    }

    /// Append every block except `skip` to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>, skip: Option<&AnnotationTag>) {
        for (tag, data) in self.entries.iter().filter(|(tag, _)| Some(*tag) != skip) {
            out.extend_from_slice(tag.as_bytes());
            // Writing into a Vec cannot fail
            let _ = out.write_u32::<BigEndian>(data.len() as u32);
            out.extend_from_slice(data);
        }
    }

    /// Parse exactly `count` blocks occupying all of `data`
    pub fn decode(data: &[u8], count: usize) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut entries = BTreeMap::new();

        for _ in 0..count {
            let offset = cursor.position() as usize;
            let mut tag = [0u8; 4];
            cursor
                .read_exact(&mut tag)
                .map_err(|_| CodecError::invalid_annotation(offset, "truncated tag"))?;
            let len = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| CodecError::invalid_annotation(offset, "truncated length"))?
                as usize;

            let start = cursor.position() as usize;
            let end = start
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| {
                    CodecError::invalid_annotation(
                        offset,
                        format!("declared length {} exceeds block area", len),
                    )
                })?;
            entries.insert(
                AnnotationTag::from_bytes(tag),
                Bytes::copy_from_slice(&data[start..end]),
            );
            cursor.set_position(end as u64);
        }

        if cursor.position() as usize != data.len() {
            return Err(CodecError::invalid_annotation(
                cursor.position() as usize,
                "trailing bytes after last annotation",
            ));
        }

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_validation() {
        assert!(AnnotationTag::new("XRES").is_ok());
        assert!(AnnotationTag::new("toolong").is_err());
        assert!(AnnotationTag::new("ab c").is_err());
        assert_eq!(AnnotationTag::STREAM.to_string(), "STRM");
    }

    #[test]
    fn blocks_decode_back() {
        let mut annotations = Annotations::new();
        annotations.insert(AnnotationTag::new("BLOB").unwrap(), vec![1u8, 2, 3]);
        annotations.insert_u32(AnnotationTag::SUBSEQ, 7);

        let mut out = Vec::new();
        annotations.encode_into(&mut out, None);
        assert_eq!(out.len(), annotations.encoded_len(None));

        let decoded = Annotations::decode(&out, 2).unwrap();
        assert_eq!(decoded, annotations);
        assert_eq!(decoded.get_u32(&AnnotationTag::SUBSEQ), Some(7));
    }

    #[test]
    fn skip_excludes_tag() {
        let mut annotations = Annotations::new();
        annotations.insert(AnnotationTag::HMAC, vec![0u8; 32]);
        annotations.insert(AnnotationTag::new("USER").unwrap(), vec![9u8]);

        let mut out = Vec::new();
        annotations.encode_into(&mut out, Some(&AnnotationTag::HMAC));
        assert_eq!(out.len(), ANNOTATION_BLOCK_OVERHEAD + 1);
    }

    #[test]
    fn truncated_block_is_rejected() {
        let mut out = Vec::new();
        out.extend_from_slice(b"BLOB");
        out.extend_from_slice(&10u32.to_be_bytes());
        out.extend_from_slice(&[1, 2]);
        assert!(matches!(
            Annotations::decode(&out, 1),
            Err(CodecError::InvalidAnnotation { .. })
        ));
    }
}
