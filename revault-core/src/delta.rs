//! Binary deltas between revisions
//!
//! A delta is the target length followed by copy/insert ops:
//!
//! ```text
//! delta  = target_len u32 | op*
//! op     = 0x00 offset u32 len u32      (copy from base)
//!        | 0x01 len u32 bytes[len]      (insert literal)
//! ```
//!
//! Matching indexes the base in fixed blocks and greedily extends each hit
//! forward, which is enough for the append/edit patterns of source files.

use std::collections::HashMap;

/// Block size used to index the base.
const BLOCK: usize = 16;

const OP_COPY: u8 = 0x00;
const OP_INSERT: u8 = 0x01;

/// Errors from applying a malformed delta.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("delta truncated")]
    Truncated,
    #[error("unknown delta op {0:#04x}")]
    UnknownOp(u8),
    #[error("copy out of range: offset {offset}, len {len}, base {base_len}")]
    CopyOutOfRange { offset: u32, len: u32, base_len: usize },
    #[error("length mismatch: expected {expected}, produced {actual}")]
    LengthMismatch { expected: u32, actual: usize },
}

/// Compute a delta that rebuilds `target` from `base`.
pub fn compute(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(target.len() / 4 + 16);
    out.extend_from_slice(&(target.len() as u32).to_be_bytes());

    let mut index: HashMap<&[u8], usize> = HashMap::new();
    if base.len() >= BLOCK {
        for offset in (0..=base.len() - BLOCK).step_by(BLOCK) {
            index.entry(&base[offset..offset + BLOCK]).or_insert(offset);
        }
    }

    let mut pending_start = 0usize;
    let mut pos = 0usize;
    while pos + BLOCK <= target.len() {
        let hit = index.get(&target[pos..pos + BLOCK]).copied();
        let Some(base_offset) = hit else {
            pos += 1;
            continue;
        };

        let mut len = BLOCK;
        while base_offset + len < base.len()
            && pos + len < target.len()
            && base[base_offset + len] == target[pos + len]
        {
            len += 1;
        }

        push_insert(&mut out, &target[pending_start..pos]);
        out.push(OP_COPY);
        out.extend_from_slice(&(base_offset as u32).to_be_bytes());
        out.extend_from_slice(&(len as u32).to_be_bytes());

        pos += len;
        pending_start = pos;
    }
    push_insert(&mut out, &target[pending_start..]);
    out
}

fn push_insert(out: &mut Vec<u8>, literal: &[u8]) {
    if literal.is_empty() {
        return;
    }
    out.push(OP_INSERT);
    out.extend_from_slice(&(literal.len() as u32).to_be_bytes());
    out.extend_from_slice(literal);
}

fn read_u32(delta: &[u8], pos: &mut usize) -> Result<u32, DeltaError> {
    let bytes = delta.get(*pos..*pos + 4).ok_or(DeltaError::Truncated)?;
    *pos += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Rebuild the target from `base` and an encoded delta.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0usize;
    let expected = read_u32(delta, &mut pos)?;
    let mut out = Vec::with_capacity(expected as usize);

    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        match op {
            OP_COPY => {
                let offset = read_u32(delta, &mut pos)?;
                let len = read_u32(delta, &mut pos)?;
                let start = offset as usize;
                let end = start
                    .checked_add(len as usize)
                    .filter(|end| *end <= base.len())
                    .ok_or(DeltaError::CopyOutOfRange {
                        offset,
                        len,
                        base_len: base.len(),
                    })?;
                out.extend_from_slice(&base[start..end]);
            }
            OP_INSERT => {
                let len = read_u32(delta, &mut pos)? as usize;
                let literal = delta.get(pos..pos + len).ok_or(DeltaError::Truncated)?;
                out.extend_from_slice(literal);
                pos += len;
            }
            other => return Err(DeltaError::UnknownOp(other)),
        }
    }

    if out.len() != expected as usize {
        return Err(DeltaError::LengthMismatch {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}
