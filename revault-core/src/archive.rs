//! One tracked file's revision tree on disk
//!
//! A `RevisionArchive` is a single file: the archive header followed by
//! `(revision header, payload)` blocks in append order. Payloads hold either
//! full content or a delta against the descriptor parent, optionally
//! zlib-compressed.
//!
//! Every mutation writes a complete new image to a temp file in the same
//! directory and renames it over the original, so readers never observe a
//! partially written archive. The previous image is kept as `<name>.old`
//! when rollback copies are enabled.
//!
//! This type does no locking of its own; see
//! [`ArchiveAccessController`](crate::controller::ArchiveAccessController).

use crate::codec;
use crate::config::EngineConfig;
use crate::delta;
use crate::error::{ArchiveError, FailureReason, Result};
use crate::header::{ArchiveHeader, Attributes, LabelInfo};
use crate::keywords::{self, KeywordContext};
use crate::revision::{RevisionDescriptor, RevisionHeader, StorageKind};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ==================== Operation arguments ====================

/// Which revision a read refers to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RevisionSelector {
    /// The default revision (trunk tip, or the view's default).
    #[default]
    Default,
    Revision(String),
    Label(String),
    /// Newest revision checked in at or before this instant.
    Date(DateTime<Utc>),
}

macro_rules! impl_failure_reason {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FailureReason for $ty {
                fn failure_reason_mut(&mut self) -> &mut Option<String> {
                    &mut self.failure_reason
                }
            }
        )*
    };
}

#[derive(Debug, Clone, Default)]
pub struct CreateArchiveArgs {
    pub user: String,
    pub description: String,
    pub attributes: Attributes,
    pub comment_prefix: String,
    pub module_description: String,
    pub edit_date: Option<DateTime<Utc>>,
    pub checkin_date: Option<DateTime<Utc>>,
    /// Label applied to `1.0` in the create image.
    pub label: Option<String>,
    pub floating_label: bool,
    pub failure_reason: Option<String>,
}

impl CreateArchiveArgs {
    pub fn new(user: &str, description: &str) -> Self {
        Self {
            user: user.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckInArgs {
    pub user: String,
    /// Revision the new content derives from; `None` means the trunk tip.
    pub parent_revision: Option<String>,
    pub description: String,
    pub edit_date: Option<DateTime<Utc>>,
    pub checkin_date: Option<DateTime<Utc>>,
    /// Open a new lineage even when the parent is a tip.
    pub force_branch: bool,
    /// Drop the caller's lock instead of moving it to the new revision.
    pub release_lock: bool,
    /// Label applied to the new revision in the same write.
    pub label: Option<String>,
    pub floating_label: bool,
    pub reuse_label: bool,
    /// Attributes used when the check-in creates the archive.
    pub attributes: Attributes,
    /// Set on success.
    pub new_revision: Option<String>,
    pub failure_reason: Option<String>,
}

impl CheckInArgs {
    pub fn new(user: &str, description: &str) -> Self {
        Self {
            user: user.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetRevisionArgs {
    pub selector: RevisionSelector,
    pub expand_keywords: bool,
    /// Set on success.
    pub resolved_revision: Option<String>,
    pub failure_reason: Option<String>,
}

impl GetRevisionArgs {
    pub fn new(selector: RevisionSelector) -> Self {
        Self {
            selector,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOutArgs {
    pub user: String,
    pub selector: RevisionSelector,
    /// Lock the fetched revision for the user.
    pub lock: bool,
    pub expand_keywords: bool,
    pub resolved_revision: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LockArgs {
    pub user: String,
    /// `None` means the trunk tip.
    pub revision: Option<String>,
    pub resolved_revision: Option<String>,
    pub failure_reason: Option<String>,
}

impl LockArgs {
    pub fn new(user: &str, revision: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            revision: revision.map(str::to_string),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LabelArgs {
    pub user: String,
    pub label: String,
    /// `None` means the trunk tip.
    pub revision: Option<String>,
    pub floating: bool,
    /// Move an existing label instead of rejecting the duplicate.
    pub reuse: bool,
    pub resolved_revision: Option<String>,
    pub failure_reason: Option<String>,
}

impl LabelArgs {
    pub fn new(user: &str, label: &str, revision: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            label: label.to_string(),
            revision: revision.map(str::to_string),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnLabelArgs {
    pub user: String,
    pub label: String,
    pub failure_reason: Option<String>,
}

/// Arguments for header edits and lifecycle operations.
#[derive(Debug, Clone, Default)]
pub struct EditArgs {
    pub user: String,
    pub failure_reason: Option<String>,
}

impl EditArgs {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            failure_reason: None,
        }
    }
}

impl_failure_reason!(
    CreateArchiveArgs,
    CheckInArgs,
    GetRevisionArgs,
    CheckOutArgs,
    LockArgs,
    LabelArgs,
    UnLabelArgs,
    EditArgs,
);

// ==================== Snapshots and resolution ====================

/// Immutable copy of an archive's metadata.
#[derive(Debug, Clone)]
pub struct ArchiveSnapshot {
    pub path: PathBuf,
    pub header: ArchiveHeader,
    pub revisions: Vec<RevisionHeader>,
}

impl ArchiveSnapshot {
    pub fn find(&self, revision: &str) -> Option<&RevisionHeader> {
        self.revisions.iter().find(|r| r.revision_string() == revision)
    }

    pub fn trunk_tip(&self) -> Option<&RevisionHeader> {
        trunk_tip(&self.revisions)
    }
}

fn trunk_tip(revisions: &[RevisionHeader]) -> Option<&RevisionHeader> {
    revisions.iter().find(|r| r.depth() == 0 && r.is_tip)
}

/// Resolve a selector against a revision set whose default revision is
/// `default`. Dates resolve along the default revision's ancestry.
pub(crate) fn resolve_selector(
    revisions: &[RevisionHeader],
    labels: &[LabelInfo],
    default: Option<&str>,
    selector: &RevisionSelector,
) -> std::result::Result<String, String> {
    match selector {
        RevisionSelector::Default => default
            .map(str::to_string)
            .ok_or_else(|| "no default revision".to_string()),
        RevisionSelector::Revision(rev) => revisions
            .iter()
            .find(|r| r.revision_string() == *rev)
            .map(|r| r.revision_string())
            .ok_or_else(|| format!("revision {} not found", rev)),
        RevisionSelector::Label(name) => {
            let label = labels
                .iter()
                .find(|l| l.label == *name)
                .ok_or_else(|| format!("label {} not found", name))?;
            label
                .resolve(revisions)
                .ok_or_else(|| format!("label {} does not resolve to a revision", name))
        }
        RevisionSelector::Date(date) => {
            let tip: RevisionDescriptor = default
                .ok_or_else(|| "no default revision".to_string())?
                .parse()
                .map_err(|e| format!("{}", e))?;
            revisions
                .iter()
                .filter(|r| r.descriptor.is_ancestor_or_self_of(&tip) && r.checkin_date <= *date)
                .max_by(|a, b| a.descriptor.cmp(&b.descriptor))
                .map(|r| r.revision_string())
                .ok_or_else(|| format!("no revision checked in before {}", date))
        }
    }
}

fn validate_label(label: &str) -> std::result::Result<(), String> {
    if label.trim().is_empty() {
        return Err("label must not be empty".to_string());
    }
    Ok(())
}

/// `<path>.old`
pub fn rollback_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

// ==================== Archive ====================

#[derive(Debug, Clone)]
struct StoredRevision {
    header: RevisionHeader,
    payload_offset: u64,
}

/// Binary revision store for one file.
#[derive(Debug)]
pub struct RevisionArchive {
    path: PathBuf,
    compression_level: u32,
    max_delta_chain: usize,
    keep_rollback_copy: bool,
    /// `None` until the archive has been read (or created).
    header: Option<ArchiveHeader>,
    revisions: Vec<StoredRevision>,
}

impl RevisionArchive {
    /// Handle for the archive at `path`. Nothing is read until
    /// [`read_information`](Self::read_information).
    pub fn new(path: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            path: path.into(),
            compression_level: config.compression_level,
            max_delta_chain: config.max_delta_chain,
            keep_rollback_copy: config.keep_rollback_copy,
            header: None,
            revisions: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name used for keyword expansion and notifications.
    pub fn short_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_loaded(&self) -> bool {
        self.header.is_some()
    }

    /// Load header and revision metadata. Idempotent.
    pub fn read_information(&mut self) -> Result<()> {
        if self.header.is_some() {
            return Ok(());
        }
        self.reload()
    }

    /// Re-read metadata from disk unconditionally.
    pub fn reload(&mut self) -> Result<()> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let (header, header_len) = codec::decode_header(&mut reader)?;
        let mut offset = header_len;
        let mut revisions = Vec::with_capacity(header.revision_count as usize);
        for _ in 0..header.revision_count {
            let (rev, len) = codec::decode_revision_header(&mut reader, &header)?;
            offset += len;
            let payload_offset = offset;
            offset += rev.stored_size as u64;
            if offset > file_len {
                return Err(ArchiveError::Corruption(format!(
                    "payload of {} runs past end of {}",
                    rev.revision_string(),
                    self.path.display()
                )));
            }
            reader.seek_relative(rev.stored_size as i64)?;
            revisions.push(StoredRevision {
                header: rev,
                payload_offset,
            });
        }

        debug!(
            "Read {} revisions from {:?}",
            revisions.len(),
            self.path
        );
        self.header = Some(header);
        self.revisions = revisions;
        Ok(())
    }

    fn loaded_header(&self) -> Result<&ArchiveHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| ArchiveError::invariant(format!("{:?} used before it was read", self.path)))
    }

    pub fn header(&self) -> Result<&ArchiveHeader> {
        self.loaded_header()
    }

    pub fn revisions(&self) -> impl Iterator<Item = &RevisionHeader> {
        self.revisions.iter().map(|r| &r.header)
    }

    fn revision_headers(&self) -> Vec<RevisionHeader> {
        self.revisions.iter().map(|r| r.header.clone()).collect()
    }

    pub fn find(&self, revision: &str) -> Option<&RevisionHeader> {
        self.revisions().find(|r| r.revision_string() == revision)
    }

    fn index_of(&self, revision: &str) -> Option<usize> {
        self.revisions
            .iter()
            .position(|r| r.header.revision_string() == revision)
    }

    fn index_of_descriptor(&self, descriptor: &RevisionDescriptor) -> Option<usize> {
        self.revisions
            .iter()
            .position(|r| r.header.descriptor == *descriptor)
    }

    pub fn trunk_tip(&self) -> Option<&RevisionHeader> {
        self.revisions().find(|r| r.depth() == 0 && r.is_tip)
    }

    /// Index of `revision`, or of the trunk tip when `None`.
    fn target_index(&self, revision: Option<&str>) -> std::result::Result<usize, String> {
        match revision {
            Some(rev) => self
                .index_of(rev)
                .ok_or_else(|| format!("revision {} not found", rev)),
            None => self
                .revisions
                .iter()
                .position(|r| r.header.depth() == 0 && r.header.is_tip)
                .ok_or_else(|| "archive has no trunk tip".to_string()),
        }
    }

    pub fn snapshot(&self) -> Result<ArchiveSnapshot> {
        Ok(ArchiveSnapshot {
            path: self.path.clone(),
            header: self.loaded_header()?.clone(),
            revisions: self.revision_headers(),
        })
    }

    /// Resolve a selector against the trunk.
    pub fn resolve(&self, selector: &RevisionSelector) -> std::result::Result<String, String> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| "archive information not loaded".to_string())?;
        let revisions = self.revision_headers();
        let default = self.trunk_tip().map(|r| r.revision_string());
        resolve_selector(&revisions, &header.labels, default.as_deref(), selector)
    }

    // ==================== Reading content ====================

    fn read_payload(&self, file: &mut File, idx: usize) -> std::result::Result<Vec<u8>, String> {
        let stored = &self.revisions[idx];
        let rev = stored.header.revision_string();
        let raw = read_raw(file, stored.payload_offset, stored.header.stored_size)
            .map_err(|e| format!("cannot read payload of {}: {}", rev, e))?;
        if !stored.header.compressed {
            return Ok(raw);
        }
        let mut out = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| format!("cannot decompress payload of {}: {}", rev, e))?;
        Ok(out)
    }

    /// Reconstruct the content of `revision`.
    ///
    /// Walks back through delta parents to the nearest full payload, then
    /// replays the deltas forward. "Not found" and unreadable payloads are
    /// reported as a reason string.
    pub fn fetch_revision(&self, revision: &str) -> std::result::Result<Bytes, String> {
        if self.header.is_none() {
            return Err("archive information not loaded".to_string());
        }
        let idx = self
            .index_of(revision)
            .ok_or_else(|| format!("revision {} not found in {}", revision, self.path.display()))?;

        let mut chain = vec![idx];
        let mut current = idx;
        while self.revisions[current].header.storage == StorageKind::Delta {
            let descriptor = &self.revisions[current].header.descriptor;
            let parent = descriptor
                .parent()
                .and_then(|p| self.index_of_descriptor(&p))
                .ok_or_else(|| format!("delta base of {} is missing", descriptor))?;
            chain.push(parent);
            current = parent;
        }

        let mut file = File::open(&self.path)
            .map_err(|e| format!("cannot open {}: {}", self.path.display(), e))?;
        let mut content = Vec::new();
        while let Some(next) = chain.pop() {
            let payload = self.read_payload(&mut file, next)?;
            content = match self.revisions[next].header.storage {
                StorageKind::Full => payload,
                StorageKind::Delta => delta::apply(&content, &payload).map_err(|e| {
                    format!("bad delta for {}: {}", self.revisions[next].header.descriptor, e)
                })?,
            };
        }

        let expected = self.revisions[idx].header.content_size;
        if content.len() as u64 != expected {
            return Err(format!(
                "revision {} reconstructed to {} bytes, expected {}",
                revision,
                content.len(),
                expected
            ));
        }
        Ok(Bytes::from(content))
    }

    /// Fetch with keyword expansion when the archive allows it.
    pub fn fetch_expanded(&self, revision: &str) -> std::result::Result<Bytes, String> {
        let content = self.fetch_revision(revision)?;
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| "archive information not loaded".to_string())?;
        if !header.attributes.expand_keywords() {
            return Ok(content);
        }
        let rev = self
            .find(revision)
            .ok_or_else(|| format!("revision {} not found", revision))?;
        let short_name = self.short_name();
        let ctx = KeywordContext {
            short_name: &short_name,
            revision: rev,
            comment_prefix: &header.comment_prefix,
        };
        Ok(Bytes::from(keywords::expand(&content, &ctx)))
    }

    /// Fetch `revision` into `dest`.
    pub fn fetch_to(
        &self,
        revision: &str,
        dest: &Path,
        expand: bool,
    ) -> std::result::Result<(), String> {
        let content = if expand {
            self.fetch_expanded(revision)?
        } else {
            self.fetch_revision(revision)?
        };
        fs::write(dest, &content).map_err(|e| format!("cannot write {}: {}", dest.display(), e))
    }

    /// Number of deltas between `descriptor` and its nearest full payload.
    fn delta_chain_len(&self, descriptor: &RevisionDescriptor) -> usize {
        let mut len = 0;
        let mut current = self.index_of_descriptor(descriptor);
        while let Some(idx) = current {
            let rev = &self.revisions[idx].header;
            if rev.storage == StorageKind::Full {
                break;
            }
            len += 1;
            current = rev.descriptor.parent().and_then(|p| self.index_of_descriptor(&p));
        }
        len
    }

    // ==================== Writing ====================

    /// Choose delta/full storage and compression for new content.
    fn encode_payload(
        &self,
        attributes: Attributes,
        parent: Option<&RevisionDescriptor>,
        content: &[u8],
    ) -> Result<(Vec<u8>, StorageKind, bool)> {
        let mut payload = content.to_vec();
        let mut storage = StorageKind::Full;

        if let Some(parent) = parent.filter(|_| attributes.compute_delta()) {
            if self.delta_chain_len(parent) < self.max_delta_chain {
                match self.fetch_revision(&parent.revision_string()) {
                    Ok(base) => {
                        let d = delta::compute(&base, content);
                        if d.len() < content.len() {
                            payload = d;
                            storage = StorageKind::Delta;
                        }
                    }
                    Err(reason) => warn!("Storing full content, delta base unavailable: {}", reason),
                }
            }
        }

        let mut compressed = false;
        if attributes.compression() {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.compression_level));
            encoder.write_all(&payload)?;
            let zipped = encoder.finish()?;
            if zipped.len() < payload.len() {
                payload = zipped;
                compressed = true;
            }
        }

        if u32::try_from(payload.len()).is_err() {
            return Err(ArchiveError::Serialization(format!(
                "payload too large: {} bytes",
                payload.len()
            )));
        }
        Ok((payload, storage, compressed))
    }

    /// Next descriptor for content derived from `parent`.
    fn next_descriptor(&self, parent: &RevisionDescriptor, force_branch: bool) -> RevisionDescriptor {
        let parent_is_tip = self
            .index_of_descriptor(parent)
            .map(|i| self.revisions[i].header.is_tip)
            .unwrap_or(false);
        if parent_is_tip && !force_branch {
            return parent.next_minor();
        }
        let prefix = parent.pairs();
        let fresh = self
            .revisions()
            .map(|r| &r.descriptor)
            .filter(|d| d.pairs().len() == prefix.len() + 1 && d.pairs()[..prefix.len()] == *prefix)
            .map(|d| d.last().major)
            .max()
            .unwrap_or(0)
            + 1;
        parent.branch(fresh)
    }

    /// Write a complete new image and swap it in.
    ///
    /// `revisions` must be the current revisions (in order, possibly edited)
    /// plus one new revision at the end when `appended` is given.
    fn write_image(
        &mut self,
        mut header: ArchiveHeader,
        revisions: Vec<RevisionHeader>,
        appended: Option<&[u8]>,
    ) -> Result<()> {
        let expected = self.revisions.len() + usize::from(appended.is_some());
        if revisions.len() != expected {
            return Err(ArchiveError::invariant(format!(
                "image for {:?} has {} revisions, expected {}",
                self.path,
                revisions.len(),
                expected
            )));
        }

        for rev in &revisions {
            header.intern_modifier(&rev.creator);
            if let Some(locker) = &rev.locker {
                header.intern_modifier(locker);
            }
        }
        let label_creators: Vec<String> = header.labels.iter().map(|l| l.creator.clone()).collect();
        for creator in &label_creators {
            header.intern_modifier(creator);
        }
        header.revision_count = revisions.len() as u32;
        header.lock_count = revisions.iter().filter(|r| r.is_locked).count() as u32;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let tmp_path = dir.join(format!(".{}.{}.tmp", self.short_name(), Uuid::new_v4()));

        let offsets = match self
            .write_temp(&tmp_path, &header, &revisions, appended)
            .and_then(|offsets| self.replace_with(&tmp_path).map(|_| offsets))
        {
            Ok(offsets) => offsets,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                warn!("Failed to write archive {:?}: {}", self.path, e);
                return Err(e);
            }
        };

        self.header = Some(header);
        self.revisions = revisions
            .into_iter()
            .zip(offsets)
            .map(|(header, payload_offset)| StoredRevision {
                header,
                payload_offset,
            })
            .collect();
        Ok(())
    }

    fn write_temp(
        &self,
        tmp_path: &Path,
        header: &ArchiveHeader,
        revisions: &[RevisionHeader],
        appended: Option<&[u8]>,
    ) -> Result<Vec<u64>> {
        let mut source = if self.revisions.is_empty() {
            None
        } else {
            Some(File::open(&self.path)?)
        };
        let mut writer = BufWriter::new(File::create(tmp_path)?);

        let header_bytes = codec::encode_header(header)?;
        writer.write_all(&header_bytes)?;
        let mut offset = header_bytes.len() as u64;
        let mut offsets = Vec::with_capacity(revisions.len());

        for (i, rev) in revisions.iter().enumerate() {
            let rev_bytes = codec::encode_revision_header(rev, header)?;
            writer.write_all(&rev_bytes)?;
            offset += rev_bytes.len() as u64;
            offsets.push(offset);

            match (self.revisions.get(i), source.as_mut()) {
                (Some(stored), Some(src)) => {
                    let raw = read_raw(src, stored.payload_offset, stored.header.stored_size)?;
                    writer.write_all(&raw)?;
                }
                _ => {
                    let payload = appended.ok_or_else(|| {
                        ArchiveError::invariant("appended revision has no payload")
                    })?;
                    writer.write_all(payload)?;
                }
            }
            offset += rev.stored_size as u64;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(offsets)
    }

    fn replace_with(&self, tmp_path: &Path) -> Result<()> {
        if self.keep_rollback_copy && self.path.exists() {
            let old = rollback_path(&self.path);
            let _ = fs::remove_file(&old);
            if fs::hard_link(&self.path, &old).is_err() {
                fs::copy(&self.path, &old)?;
            }
        }
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    // ==================== Mutations ====================

    /// Create the archive with `content` as revision `1.0`.
    pub fn create(&mut self, args: &mut CreateArchiveArgs, content: &[u8]) -> Result<bool> {
        if self.exists() {
            return Ok(args.reject(format!("archive {} already exists", self.path.display())));
        }

        if let Some(label) = &args.label {
            if let Err(reason) = validate_label(label) {
                return Ok(args.reject(reason));
            }
        }

        let mut header = ArchiveHeader::new(&args.user, args.attributes);
        header.comment_prefix = args.comment_prefix.clone();
        header.module_description = args.module_description.clone();
        if let Some(label) = &args.label {
            header.labels.push(LabelInfo::new(
                label,
                &RevisionDescriptor::initial(),
                args.floating_label,
                &args.user,
            ));
        }

        let (payload, storage, compressed) = self.encode_payload(args.attributes, None, content)?;
        let checkin_date = to_millis(args.checkin_date.unwrap_or_else(Utc::now));
        let rev = RevisionHeader {
            descriptor: RevisionDescriptor::initial(),
            checkin_date,
            edit_date: to_millis(args.edit_date.unwrap_or(checkin_date)),
            creator: args.user.clone(),
            locker: None,
            is_locked: false,
            is_tip: true,
            compressed,
            storage,
            content_size: content.len() as u64,
            stored_size: payload.len() as u32,
            description: args.description.clone(),
        };

        self.revisions.clear();
        self.write_image(header, vec![rev], Some(&payload))?;
        info!("Created archive {:?}", self.path);
        Ok(true)
    }

    /// Append a revision derived from `args.parent_revision`.
    pub fn check_in(
        &mut self,
        args: &mut CheckInArgs,
        content: &[u8],
        ignore_locks: bool,
    ) -> Result<bool> {
        self.read_information()?;
        let header = self.loaded_header()?.clone();
        if !header.is_accessible_by(&args.user) {
            return Ok(args.reject(format!(
                "{} may not modify {}",
                args.user,
                self.path.display()
            )));
        }

        let parent_idx = match self.target_index(args.parent_revision.as_deref()) {
            Ok(idx) => idx,
            Err(reason) => return Ok(args.reject(reason)),
        };
        let parent = self.revisions[parent_idx].header.clone();
        let holds_lock = parent.is_locked && parent.locker.as_deref() == Some(args.user.as_str());

        if header.attributes.check_lock() && !ignore_locks && !holds_lock {
            let reason = match parent.locker.as_deref() {
                Some(locker) if parent.is_locked => {
                    format!("revision {} is locked by {}", parent.descriptor, locker)
                }
                _ => format!(
                    "revision {} must be locked by {} before check-in",
                    parent.descriptor, args.user
                ),
            };
            return Ok(args.reject(reason));
        }

        if let Some(label) = &args.label {
            if let Err(reason) = validate_label(label) {
                return Ok(args.reject(reason));
            }
            if header.find_label(label).is_some() && !args.reuse_label {
                return Ok(args.reject(format!("label {} already exists", label)));
            }
        }

        let descriptor = self.next_descriptor(&parent.descriptor, args.force_branch);
        let (payload, storage, compressed) =
            self.encode_payload(header.attributes, Some(&parent.descriptor), content)?;

        let mut revisions = self.revision_headers();
        if holds_lock {
            revisions[parent_idx].is_locked = false;
            revisions[parent_idx].locker = None;
        }
        if descriptor.same_lineage(&parent.descriptor) {
            revisions[parent_idx].is_tip = false;
        }

        let keep_lock = holds_lock && !args.release_lock;
        let checkin_date = to_millis(args.checkin_date.unwrap_or_else(Utc::now));
        revisions.push(RevisionHeader {
            descriptor: descriptor.clone(),
            checkin_date,
            edit_date: to_millis(args.edit_date.unwrap_or(checkin_date)),
            creator: args.user.clone(),
            locker: keep_lock.then(|| args.user.clone()),
            is_locked: keep_lock,
            is_tip: true,
            compressed,
            storage,
            content_size: content.len() as u64,
            stored_size: payload.len() as u32,
            description: args.description.clone(),
        });

        let mut header = header;
        if let Some(label) = &args.label {
            header.labels.retain(|l| l.label != *label);
            header
                .labels
                .push(LabelInfo::new(label, &descriptor, args.floating_label, &args.user));
        }

        self.write_image(header, revisions, Some(&payload))?;
        info!(
            "Checked in {} of {:?} ({:?}, {} bytes stored)",
            descriptor, self.path, storage, payload.len()
        );
        args.new_revision = Some(descriptor.revision_string());
        Ok(true)
    }

    pub fn lock_revision(&mut self, args: &mut LockArgs) -> Result<bool> {
        self.read_information()?;
        let header = self.loaded_header()?.clone();
        if !header.attributes.check_lock() {
            return Ok(args.reject("lock checking is disabled for this archive"));
        }
        if !header.is_accessible_by(&args.user) {
            return Ok(args.reject(format!("{} may not lock revisions of this archive", args.user)));
        }
        let idx = match self.target_index(args.revision.as_deref()) {
            Ok(idx) => idx,
            Err(reason) => return Ok(args.reject(reason)),
        };
        let target = &self.revisions[idx].header;
        if target.is_locked {
            let holder = target.locker.clone().unwrap_or_default();
            return Ok(args.reject(format!(
                "revision {} is already locked by {}",
                target.descriptor, holder
            )));
        }

        let mut revisions = self.revision_headers();
        revisions[idx].is_locked = true;
        revisions[idx].locker = Some(args.user.clone());
        let resolved = revisions[idx].revision_string();
        self.write_image(header, revisions, None)?;
        debug!("{} locked {} of {:?}", args.user, resolved, self.path);
        args.resolved_revision = Some(resolved);
        Ok(true)
    }

    /// Release a lock. Without `force` only the holder may release it.
    pub fn unlock_revision(&mut self, args: &mut LockArgs, force: bool) -> Result<bool> {
        self.read_information()?;
        let header = self.loaded_header()?.clone();
        if !header.attributes.check_lock() {
            return Ok(args.reject("lock checking is disabled for this archive"));
        }
        let idx = match self.target_index(args.revision.as_deref()) {
            Ok(idx) => idx,
            Err(reason) => return Ok(args.reject(reason)),
        };
        let target = &self.revisions[idx].header;
        if !target.is_locked {
            return Ok(args.reject(format!("revision {} is not locked", target.descriptor)));
        }
        if !force && target.locker.as_deref() != Some(args.user.as_str()) {
            let holder = target.locker.clone().unwrap_or_default();
            return Ok(args.reject(format!(
                "revision {} is locked by {}, not {}",
                target.descriptor, holder, args.user
            )));
        }

        let mut revisions = self.revision_headers();
        revisions[idx].is_locked = false;
        revisions[idx].locker = None;
        let resolved = revisions[idx].revision_string();
        self.write_image(header, revisions, None)?;
        debug!("{} unlocked {} of {:?} (forced: {})", args.user, resolved, self.path, force);
        args.resolved_revision = Some(resolved);
        Ok(true)
    }

    pub fn label_revision(&mut self, args: &mut LabelArgs) -> Result<bool> {
        self.read_information()?;
        let mut header = self.loaded_header()?.clone();
        if !header.is_accessible_by(&args.user) {
            return Ok(args.reject(format!("{} may not label this archive", args.user)));
        }
        if let Err(reason) = validate_label(&args.label) {
            return Ok(args.reject(reason));
        }
        let idx = match self.target_index(args.revision.as_deref()) {
            Ok(idx) => idx,
            Err(reason) => return Ok(args.reject(reason)),
        };
        if header.find_label(&args.label).is_some() && !args.reuse {
            return Ok(args.reject(format!("label {} already exists", args.label)));
        }

        let descriptor = self.revisions[idx].header.descriptor.clone();
        header.labels.retain(|l| l.label != args.label);
        header
            .labels
            .push(LabelInfo::new(&args.label, &descriptor, args.floating, &args.user));
        let revisions = self.revision_headers();
        self.write_image(header, revisions, None)?;
        args.resolved_revision = Some(descriptor.revision_string());
        Ok(true)
    }

    pub fn un_label_revision(&mut self, args: &mut UnLabelArgs) -> Result<bool> {
        self.read_information()?;
        let mut header = self.loaded_header()?.clone();
        if !header.is_accessible_by(&args.user) {
            return Ok(args.reject(format!("{} may not label this archive", args.user)));
        }
        if header.find_label(&args.label).is_none() {
            return Ok(args.reject(format!("label {} not found", args.label)));
        }
        header.labels.retain(|l| l.label != args.label);
        let revisions = self.revision_headers();
        self.write_image(header, revisions, None)?;
        Ok(true)
    }

    fn edit_header(&mut self, edit: impl FnOnce(&mut ArchiveHeader)) -> Result<bool> {
        self.read_information()?;
        let mut header = self.loaded_header()?.clone();
        edit(&mut header);
        let revisions = self.revision_headers();
        self.write_image(header, revisions, None)?;
        Ok(true)
    }

    pub fn set_attributes(&mut self, _args: &mut EditArgs, attributes: Attributes) -> Result<bool> {
        self.edit_header(|h| h.attributes = attributes)
    }

    pub fn set_comment_prefix(&mut self, _args: &mut EditArgs, prefix: &str) -> Result<bool> {
        self.edit_header(|h| h.comment_prefix = prefix.to_string())
    }

    pub fn set_module_description(&mut self, _args: &mut EditArgs, description: &str) -> Result<bool> {
        self.edit_header(|h| h.module_description = description.to_string())
    }

    pub fn set_revision_description(
        &mut self,
        args: &mut EditArgs,
        revision: &str,
        description: &str,
    ) -> Result<bool> {
        self.read_information()?;
        let Some(idx) = self.index_of(revision) else {
            return Ok(args.reject(format!("revision {} not found", revision)));
        };
        let header = self.loaded_header()?.clone();
        let mut revisions = self.revision_headers();
        revisions[idx].description = description.to_string();
        self.write_image(header, revisions, None)?;
        Ok(true)
    }

    /// Move the archive file to `new_path`. The rollback copy is discarded.
    pub fn relocate_to(&mut self, new_path: PathBuf) -> Result<()> {
        if let Some(dir) = new_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::rename(&self.path, &new_path)?;
        let _ = fs::remove_file(rollback_path(&self.path));
        info!("Relocated archive {:?} to {:?}", self.path, new_path);
        self.path = new_path;
        Ok(())
    }

    /// Reconstruct every revision and check the structural invariants.
    pub fn verify(&self) -> Result<()> {
        let header = self.loaded_header()?;

        let locked = self.revisions().filter(|r| r.is_locked).count() as u32;
        if locked != header.lock_count {
            return Err(ArchiveError::Corruption(format!(
                "lock count {} but {} revisions are locked",
                header.lock_count, locked
            )));
        }
        if self.revisions.len() as u32 != header.revision_count {
            return Err(ArchiveError::Corruption(format!(
                "revision count {} but {} revisions present",
                header.revision_count,
                self.revisions.len()
            )));
        }

        let mut newest: HashMap<(Vec<_>, u32), u32> = HashMap::new();
        for rev in self.revisions() {
            let (prefix, major) = rev.descriptor.lineage();
            let minor = rev.descriptor.last().minor;
            let entry = newest.entry((prefix.to_vec(), major)).or_insert(minor);
            *entry = (*entry).max(minor);
        }
        for rev in self.revisions() {
            let (prefix, major) = rev.descriptor.lineage();
            let should_be_tip = newest.get(&(prefix.to_vec(), major)) == Some(&rev.descriptor.last().minor);
            if rev.is_tip != should_be_tip {
                return Err(ArchiveError::invariant(format!(
                    "tip flag of {} in {:?} is {}",
                    rev.descriptor, self.path, rev.is_tip
                )));
            }
            if rev.is_locked && rev.locker.is_none() {
                return Err(ArchiveError::Corruption(format!(
                    "revision {} locked without a locker",
                    rev.descriptor
                )));
            }
        }

        for rev in self.revisions() {
            self.fetch_revision(&rev.revision_string())
                .map_err(ArchiveError::Corruption)?;
        }
        Ok(())
    }
}

/// Dates are stored with millisecond precision.
fn to_millis(date: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(date.timestamp_millis()).unwrap_or(date)
}

fn read_raw(file: &mut File, offset: u64, len: u32) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
