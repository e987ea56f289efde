//! Binary codec for the archive header and revision headers
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! header   = magic "RVLT" | version u16 | attributes u32 | revision_count u32
//!          | lock_count u32 | owner str16 | comment_prefix str16
//!          | module_description str32 | access_list list16 | modifier_list list16
//!          | labels (u16 count, label*) | crc32 u32
//! label    = label str16 | revision str16 | floating u8 | depth u16
//!          | major u32 | minor u32 | creator_index u16
//! revision = depth u16 | (major u32, minor u32) * (depth + 1)
//!          | checkin_ms i64 | edit_ms i64 | creator_index u16 | locked u8
//!          | locker_index u16 | tip u8 | compressed u8 | storage u8
//!          | content_size u64 | stored_size u32 | description str32
//! ```
//!
//! The CRC covers every header byte before it.

use crate::error::{ArchiveError, Result};
use crate::header::{ArchiveHeader, Attributes, LabelInfo};
use crate::revision::{MajorMinor, RevisionDescriptor, RevisionHeader, StorageKind};
use chrono::{DateTime, Utc};
use std::io::{self, Read};

/// Magic bytes at the start of every archive.
pub const MAGIC: &[u8; 4] = b"RVLT";

/// Locker index meaning "not locked".
const NO_USER: u16 = 0xFFFF;

// ==================== Encoding ====================

/// Big-endian byte sink.
#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn put_str16(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| ArchiveError::Serialization(format!("string too long: {} bytes", s.len())))?;
        self.put_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn put_str32(&mut self, s: &str) -> Result<()> {
        let len = u32::try_from(s.len())
            .map_err(|_| ArchiveError::Serialization(format!("text too long: {} bytes", s.len())))?;
        self.put_u32(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn put_list16(&mut self, items: &[String]) -> Result<()> {
        let count = u16::try_from(items.len())
            .map_err(|_| ArchiveError::Serialization(format!("list too long: {}", items.len())))?;
        self.put_u16(count);
        for item in items {
            self.put_str16(item)?;
        }
        Ok(())
    }
}

fn modifier_index(header: &ArchiveHeader, user: &str) -> Result<u16> {
    header
        .modifier_list
        .iter()
        .position(|u| u == user)
        .map(|i| i as u16)
        .ok_or_else(|| ArchiveError::invariant(format!("user '{}' missing from modifier list", user)))
}

/// Encode the archive header, including its trailing checksum.
pub fn encode_header(header: &ArchiveHeader) -> Result<Vec<u8>> {
    let mut enc = Encoder::default();
    enc.buf.extend_from_slice(MAGIC);
    enc.put_u16(header.version);
    enc.put_u32(header.attributes.bits());
    enc.put_u32(header.revision_count);
    enc.put_u32(header.lock_count);
    enc.put_str16(&header.owner)?;
    enc.put_str16(&header.comment_prefix)?;
    enc.put_str32(&header.module_description)?;
    enc.put_list16(&header.access_list)?;
    enc.put_list16(&header.modifier_list)?;

    let label_count = u16::try_from(header.labels.len())
        .map_err(|_| ArchiveError::Serialization("too many labels".to_string()))?;
    enc.put_u16(label_count);
    for label in &header.labels {
        enc.put_str16(&label.label)?;
        enc.put_str16(&label.revision_string)?;
        enc.put_bool(label.floating);
        enc.put_u16(label.depth);
        enc.put_u32(label.major);
        enc.put_u32(label.minor);
        enc.put_u16(modifier_index(header, &label.creator)?);
    }

    let checksum = crc32fast::hash(&enc.buf);
    enc.put_u32(checksum);
    Ok(enc.buf)
}

/// Encode one revision header (payload not included).
pub fn encode_revision_header(rev: &RevisionHeader, header: &ArchiveHeader) -> Result<Vec<u8>> {
    let mut enc = Encoder::default();
    let pairs = rev.descriptor.pairs();
    enc.put_u16(rev.depth() as u16);
    for pair in pairs {
        enc.put_u32(pair.major);
        enc.put_u32(pair.minor);
    }
    enc.put_i64(rev.checkin_date.timestamp_millis());
    enc.put_i64(rev.edit_date.timestamp_millis());
    enc.put_u16(modifier_index(header, &rev.creator)?);
    enc.put_bool(rev.is_locked);
    let locker = match (&rev.locker, rev.is_locked) {
        (Some(user), true) => modifier_index(header, user)?,
        _ => NO_USER,
    };
    enc.put_u16(locker);
    enc.put_bool(rev.is_tip);
    enc.put_bool(rev.compressed);
    enc.put_u8(rev.storage.to_u8());
    enc.put_u64(rev.content_size);
    enc.put_u32(rev.stored_size);
    enc.put_str32(&rev.description)?;
    Ok(enc.buf)
}

// ==================== Decoding ====================

/// Big-endian reader that maps truncation to corruption and optionally
/// feeds a running CRC.
struct Decoder<'a, R: Read> {
    inner: &'a mut R,
    crc: Option<crc32fast::Hasher>,
    consumed: u64,
}

impl<'a, R: Read> Decoder<'a, R> {
    fn new(inner: &'a mut R, checksummed: bool) -> Self {
        Self {
            inner,
            crc: checksummed.then(crc32fast::Hasher::new),
            consumed: 0,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ArchiveError::Corruption("archive truncated".to_string())
            }
            _ => ArchiveError::Io(e),
        })?;
        if let Some(crc) = self.crc.as_mut() {
            crc.update(buf);
        }
        self.consumed += buf.len() as u64;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.fill(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ArchiveError::Corruption(format!("invalid flag byte {}", other))),
        }
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    fn string(&mut self, len: usize) -> Result<String> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw).map_err(|e| ArchiveError::Corruption(format!("invalid UTF-8: {}", e)))
    }

    fn str16(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        self.string(len)
    }

    fn str32(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.string(len)
    }

    fn list16(&mut self) -> Result<Vec<String>> {
        let count = self.u16()? as usize;
        (0..count).map(|_| self.str16()).collect()
    }

    fn date(&mut self) -> Result<DateTime<Utc>> {
        let ms = self.i64()?;
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| ArchiveError::Corruption(format!("date out of range: {}", ms)))
    }
}

fn user_at(header: &ArchiveHeader, idx: u16) -> Result<String> {
    header
        .modifier_list
        .get(idx as usize)
        .cloned()
        .ok_or_else(|| ArchiveError::Corruption(format!("modifier index {} out of range", idx)))
}

/// Decode and verify the archive header. Returns the header and its length
/// in bytes.
pub fn decode_header<R: Read>(reader: &mut R) -> Result<(ArchiveHeader, u64)> {
    let mut dec = Decoder::new(reader, true);

    let magic = dec.bytes(4)?;
    if magic.as_slice() != MAGIC {
        return Err(ArchiveError::Corruption("bad magic".to_string()));
    }
    let version = dec.u16()?;
    if version != crate::header::FORMAT_VERSION {
        return Err(ArchiveError::Corruption(format!("unsupported format version {}", version)));
    }
    let attributes = Attributes::from_bits(dec.u32()?);
    let revision_count = dec.u32()?;
    let lock_count = dec.u32()?;
    let owner = dec.str16()?;
    let comment_prefix = dec.str16()?;
    let module_description = dec.str32()?;
    let access_list = dec.list16()?;
    let modifier_list = dec.list16()?;

    let mut header = ArchiveHeader {
        version,
        attributes,
        access_list,
        modifier_list,
        comment_prefix,
        owner,
        module_description,
        labels: Vec::new(),
        revision_count,
        lock_count,
    };

    let label_count = dec.u16()? as usize;
    for _ in 0..label_count {
        let label = dec.str16()?;
        let revision_string = dec.str16()?;
        let floating = dec.bool()?;
        let depth = dec.u16()?;
        let major = dec.u32()?;
        let minor = dec.u32()?;
        let creator = user_at(&header, dec.u16()?)?;
        header.labels.push(LabelInfo {
            label,
            revision_string,
            floating,
            depth,
            major,
            minor,
            creator,
        });
    }

    let computed = dec.crc.take().map(|c| c.finalize()).unwrap_or_default();
    let stored = dec.u32()?;
    if computed != stored {
        return Err(ArchiveError::Corruption(format!(
            "header checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        )));
    }

    Ok((header, dec.consumed))
}

/// Decode one revision header. Returns the header and its encoded length.
pub fn decode_revision_header<R: Read>(
    reader: &mut R,
    header: &ArchiveHeader,
) -> Result<(RevisionHeader, u64)> {
    let mut dec = Decoder::new(reader, false);

    let depth = dec.u16()? as usize;
    let mut pairs = Vec::with_capacity(depth + 1);
    for _ in 0..=depth {
        let major = dec.u32()?;
        let minor = dec.u32()?;
        pairs.push(MajorMinor::new(major, minor));
    }
    let descriptor = RevisionDescriptor::from_pairs(pairs)
        .ok_or_else(|| ArchiveError::Corruption("empty revision descriptor".to_string()))?;
    let checkin_date = dec.date()?;
    let edit_date = dec.date()?;
    let creator = user_at(header, dec.u16()?)?;
    let is_locked = dec.bool()?;
    let locker_idx = dec.u16()?;
    let locker = if is_locked && locker_idx != NO_USER {
        Some(user_at(header, locker_idx)?)
    } else {
        None
    };
    let is_tip = dec.bool()?;
    let compressed = dec.bool()?;
    let storage_byte = dec.u8()?;
    let storage = StorageKind::from_u8(storage_byte)
        .ok_or_else(|| ArchiveError::Corruption(format!("unknown storage kind {}", storage_byte)))?;
    let content_size = dec.u64()?;
    let stored_size = dec.u32()?;
    let description = dec.str32()?;

    let rev = RevisionHeader {
        descriptor,
        checkin_date,
        edit_date,
        creator,
        locker,
        is_locked,
        is_tip,
        compressed,
        storage,
        content_size,
        stored_size,
        description,
    };
    Ok((rev, dec.consumed))
}
