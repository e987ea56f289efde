//! Revault Core Library
//!
//! Revision archive engine including:
//! - Single-file revision archives (binary header, revision headers, payloads)
//! - Delta-compressed revision storage with bounded delta chains
//! - Per-archive access controller with locking and change events
//! - Process-wide handle registry (one controller per archive file)
//! - Branch views: read-only date, translucent and opaque projections of trunk
//! - Content digest cache with debounced snapshot persistence

pub mod archive;
pub mod codec;
pub mod config;
pub mod controller;
pub mod delta;
pub mod digest;
pub mod error;
pub mod header;
pub mod keywords;
pub mod listener;
pub mod registry;
pub mod revision;
pub mod view;

pub use archive::{
    ArchiveSnapshot, CheckInArgs, CheckOutArgs, CreateArchiveArgs, EditArgs, GetRevisionArgs,
    LabelArgs, LockArgs, RevisionArchive, RevisionSelector, UnLabelArgs,
};
pub use config::EngineConfig;
pub use controller::ArchiveAccessController;
pub use digest::{ContentDigest, DigestCache, DigestKey};
pub use error::{ArchiveError, FailureReason, Result};
pub use header::{ArchiveHeader, Attributes, LabelInfo};
pub use listener::{ArchiveAction, ArchiveEvent, ArchiveListener, BranchChange, ListenerId};
pub use registry::{ArchiveRegistry, ViewKey};
pub use revision::{MajorMinor, RevisionDescriptor, RevisionHeader, StorageKind};
pub use view::{
    BRANCH_LABEL_PREFIX, BranchKind, BranchOverlay, BranchView, SharedOverlay, ViewSnapshot,
};
