//! Archive header: attributes, user lists, and the label table

use crate::revision::{RevisionDescriptor, RevisionHeader};
use serde::{Deserialize, Serialize};

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Attribute bitfield stored in the archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attributes(u32);

impl Attributes {
    /// Check-in requires holding the lock on the parent revision.
    pub const CHECK_LOCK: u32 = 0x01;
    /// Keywords are expanded on fetch.
    pub const EXPAND_KEYWORDS: u32 = 0x02;
    /// Payloads are zlib-compressed when that makes them smaller.
    pub const COMPRESSION: u32 = 0x04;
    /// Binary content; never keyword-expanded.
    pub const BINARY_FILE: u32 = 0x08;
    /// Later revisions may be stored as deltas.
    pub const COMPUTE_DELTA: u32 = 0x10;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    pub fn without(self, flag: u32) -> Self {
        Self(self.0 & !flag)
    }

    pub fn check_lock(&self) -> bool {
        self.has(Self::CHECK_LOCK)
    }

    pub fn expand_keywords(&self) -> bool {
        self.has(Self::EXPAND_KEYWORDS) && !self.has(Self::BINARY_FILE)
    }

    pub fn compression(&self) -> bool {
        self.has(Self::COMPRESSION)
    }

    pub fn compute_delta(&self) -> bool {
        self.has(Self::COMPUTE_DELTA)
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self(Self::CHECK_LOCK | Self::COMPRESSION | Self::COMPUTE_DELTA)
    }
}

/// One entry of the label table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub label: String,
    /// Revision the label was applied to.
    pub revision_string: String,
    /// Floating labels follow the tip of the labeled lineage.
    pub floating: bool,
    pub depth: u16,
    /// Pair at `depth` of the labeled revision; identifies the lineage.
    pub major: u32,
    pub minor: u32,
    pub creator: String,
}

impl LabelInfo {
    /// Build a label entry for `descriptor`.
    pub fn new(label: &str, descriptor: &RevisionDescriptor, floating: bool, creator: &str) -> Self {
        let last = descriptor.last();
        Self {
            label: label.to_string(),
            revision_string: descriptor.revision_string(),
            floating,
            depth: descriptor.depth() as u16,
            major: last.major,
            minor: last.minor,
            creator: creator.to_string(),
        }
    }

    /// Resolve this label against a revision set.
    ///
    /// A fixed label resolves to its stored revision if present. A floating
    /// label resolves to the tip of the lineage it was applied to; if that
    /// lineage is gone from the set, the tip at the same depth with the
    /// greatest major number wins.
    pub fn resolve(&self, revisions: &[RevisionHeader]) -> Option<String> {
        if !self.floating {
            return revisions
                .iter()
                .find(|r| r.revision_string() == self.revision_string)
                .map(|r| r.revision_string());
        }

        let target: Option<RevisionDescriptor> = self.revision_string.parse().ok();
        if let Some(target) = &target {
            let tip = revisions
                .iter()
                .filter(|r| r.is_tip && r.descriptor.same_lineage(target))
                .max_by(|a, b| a.descriptor.cmp(&b.descriptor));
            if let Some(tip) = tip {
                return Some(tip.revision_string());
            }
        }

        revisions
            .iter()
            .filter(|r| r.is_tip && r.depth() == self.depth as usize)
            .max_by_key(|r| (r.descriptor.last().major, r.descriptor.last().minor))
            .map(|r| r.revision_string())
    }
}

/// Fixed and variable parts of the archive header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub version: u16,
    pub attributes: Attributes,
    /// Users allowed to modify the archive; empty means everyone.
    pub access_list: Vec<String>,
    /// Every user that appears as creator, locker or label creator.
    pub modifier_list: Vec<String>,
    pub comment_prefix: String,
    pub owner: String,
    pub module_description: String,
    pub labels: Vec<LabelInfo>,
    pub revision_count: u32,
    pub lock_count: u32,
}

impl ArchiveHeader {
    pub fn new(owner: &str, attributes: Attributes) -> Self {
        Self {
            version: FORMAT_VERSION,
            attributes,
            access_list: Vec::new(),
            modifier_list: Vec::new(),
            comment_prefix: String::new(),
            owner: owner.to_string(),
            module_description: String::new(),
            labels: Vec::new(),
            revision_count: 0,
            lock_count: 0,
        }
    }

    pub fn find_label(&self, label: &str) -> Option<&LabelInfo> {
        self.labels.iter().find(|l| l.label == label)
    }

    /// Whether `user` may modify this archive.
    pub fn is_accessible_by(&self, user: &str) -> bool {
        self.access_list.is_empty() || self.access_list.iter().any(|u| u == user)
    }

    /// Index of `user` in the modifier list, adding it if needed.
    pub fn intern_modifier(&mut self, user: &str) -> u16 {
        if let Some(idx) = self.modifier_list.iter().position(|u| u == user) {
            return idx as u16;
        }
        self.modifier_list.push(user.to_string());
        (self.modifier_list.len() - 1) as u16
    }
}
