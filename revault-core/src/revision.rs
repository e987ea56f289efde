//! Revision numbering and per-revision metadata
//!
//! A revision is addressed by a descriptor: one `(major, minor)` pair per
//! branch level. `1.3` is the fourth trunk revision, `1.3.2.0` is the first
//! revision of the second branch opened off `1.3`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Width each number is padded to in a sortable key.
const SORTABLE_WIDTH: usize = 10;

/// One level of a revision descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MajorMinor {
    pub major: u32,
    pub minor: u32,
}

impl MajorMinor {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Ordered list of `(major, minor)` pairs. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionDescriptor {
    pairs: Vec<MajorMinor>,
}

impl RevisionDescriptor {
    /// The first revision of every archive, `1.0`.
    pub fn initial() -> Self {
        Self {
            pairs: vec![MajorMinor::new(1, 0)],
        }
    }

    /// Build from pairs; `None` if the list is empty.
    pub fn from_pairs(pairs: Vec<MajorMinor>) -> Option<Self> {
        if pairs.is_empty() {
            None
        } else {
            Some(Self { pairs })
        }
    }

    pub fn pairs(&self) -> &[MajorMinor] {
        &self.pairs
    }

    /// Branch depth; 0 for trunk.
    pub fn depth(&self) -> usize {
        self.pairs.len() - 1
    }

    /// The pair at this descriptor's own depth.
    pub fn last(&self) -> MajorMinor {
        self.pairs[self.pairs.len() - 1]
    }

    /// `1.1.2.3` style string.
    pub fn revision_string(&self) -> String {
        self.pairs
            .iter()
            .map(|p| format!("{}.{}", p.major, p.minor))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Zero-padded encoding whose lexicographic order is revision-tree order.
    pub fn sortable_key(&self) -> String {
        self.pairs
            .iter()
            .map(|p| {
                format!(
                    "{:0w$}.{:0w$}",
                    p.major,
                    p.minor,
                    w = SORTABLE_WIDTH
                )
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// The revision this one was derived from.
    pub fn parent(&self) -> Option<RevisionDescriptor> {
        let last = self.last();
        if last.minor > 0 {
            let mut pairs = self.pairs.clone();
            let idx = pairs.len() - 1;
            pairs[idx].minor -= 1;
            Some(Self { pairs })
        } else if self.pairs.len() > 1 {
            Some(Self {
                pairs: self.pairs[..self.pairs.len() - 1].to_vec(),
            })
        } else {
            None
        }
    }

    /// Next revision on the same lineage.
    pub fn next_minor(&self) -> RevisionDescriptor {
        let mut pairs = self.pairs.clone();
        let idx = pairs.len() - 1;
        pairs[idx].minor += 1;
        Self { pairs }
    }

    /// First revision of a new branch opened off this revision.
    pub fn branch(&self, major: u32) -> RevisionDescriptor {
        let mut pairs = self.pairs.clone();
        pairs.push(MajorMinor::new(major, 0));
        Self { pairs }
    }

    /// True when both revisions belong to the same branch lineage.
    pub fn same_lineage(&self, other: &RevisionDescriptor) -> bool {
        if self.pairs.len() != other.pairs.len() {
            return false;
        }
        let d = self.depth();
        self.pairs[..d] == other.pairs[..d] && self.pairs[d].major == other.pairs[d].major
    }

    /// Lineage identity: the pairs above this depth plus the major at it.
    pub fn lineage(&self) -> (&[MajorMinor], u32) {
        let d = self.depth();
        (&self.pairs[..d], self.pairs[d].major)
    }

    /// True when `self` lies on the path from `1.0` to `other` (inclusive).
    pub fn is_ancestor_or_self_of(&self, other: &RevisionDescriptor) -> bool {
        if self.pairs.len() > other.pairs.len() {
            return false;
        }
        let d = self.depth();
        if self.pairs[..d] != other.pairs[..d] {
            return false;
        }
        let mine = self.pairs[d];
        let theirs = other.pairs[d];
        mine.major == theirs.major && mine.minor <= theirs.minor
    }
}

impl fmt::Display for RevisionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.revision_string())
    }
}

/// Error returned for malformed revision strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid revision string: {0}")]
pub struct ParseRevisionError(pub String);

impl FromStr for RevisionDescriptor {
    type Err = ParseRevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numbers: Vec<u32> = s
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseRevisionError(s.to_string()))?;
        if numbers.is_empty() || numbers.len() % 2 != 0 {
            return Err(ParseRevisionError(s.to_string()));
        }
        let pairs = numbers
            .chunks(2)
            .map(|c| MajorMinor::new(c[0], c[1]))
            .collect();
        Ok(Self { pairs })
    }
}

impl PartialOrd for RevisionDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevisionDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sortable_key().cmp(&other.sortable_key())
    }
}

/// How a payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Complete content.
    Full,
    /// Delta against the descriptor parent.
    Delta,
}

impl StorageKind {
    pub fn to_u8(self) -> u8 {
        match self {
            StorageKind::Full => 0,
            StorageKind::Delta => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StorageKind::Full),
            1 => Some(StorageKind::Delta),
            _ => None,
        }
    }
}

/// Metadata for one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionHeader {
    pub descriptor: RevisionDescriptor,
    pub checkin_date: DateTime<Utc>,
    /// Modification time of the workfile that was checked in.
    pub edit_date: DateTime<Utc>,
    pub creator: String,
    pub locker: Option<String>,
    pub is_locked: bool,
    pub is_tip: bool,
    pub compressed: bool,
    pub storage: StorageKind,
    /// Reconstructed (uncompressed) size in bytes.
    pub content_size: u64,
    /// Payload bytes on disk.
    pub stored_size: u32,
    pub description: String,
}

impl RevisionHeader {
    pub fn revision_string(&self) -> String {
        self.descriptor.revision_string()
    }

    pub fn depth(&self) -> usize {
        self.descriptor.depth()
    }

    pub fn sortable_key(&self) -> String {
        self.descriptor.sortable_key()
    }
}

/// Reset `is_tip` so that the highest minor of each lineage is its only tip.
pub fn recompute_tips(revisions: &mut [RevisionHeader]) {
    let mut newest: HashMap<(Vec<MajorMinor>, u32), u32> = HashMap::new();
    for rev in revisions.iter() {
        let (prefix, major) = rev.descriptor.lineage();
        let minor = rev.descriptor.last().minor;
        newest
            .entry((prefix.to_vec(), major))
            .and_modify(|m| *m = (*m).max(minor))
            .or_insert(minor);
    }
    for rev in revisions.iter_mut() {
        let (prefix, major) = rev.descriptor.lineage();
        rev.is_tip = newest.get(&(prefix.to_vec(), major)) == Some(&rev.descriptor.last().minor);
    }
}
