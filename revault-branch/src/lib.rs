//! Revault Branch Library
//!
//! Branch-level services on top of `revault-core`:
//! - Branch catalog (parent links, writable flag)
//! - Change notifier with per-branch tip ownership and batched delivery
//! - Merge classifier for rename/move/delete divergence

pub mod catalog;
pub mod config;
pub mod error;
pub mod merge;
pub mod notifier;

pub use catalog::{BranchCatalog, BranchId, BranchInfo};
pub use config::NotifierConfig;
pub use error::{BranchError, Result};
pub use merge::{BranchFile, ClassifyError, FileLocation, LocationChange, MergeType, classify};
pub use notifier::{ChangeNotifier, FileChange, FileId, Notification, NotificationSink, SubscriptionKey};
