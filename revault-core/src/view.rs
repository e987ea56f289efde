//! Branch views of a trunk archive
//!
//! A view is a projection of the trunk's revision set: [`project`] is a pure
//! function from an [`ArchiveSnapshot`] and a [`BranchKind`] to an immutable
//! [`ViewSnapshot`]. The view never shares mutable state with the trunk:
//! lock flags are cleared, tips are recomputed within the retained set, and
//! labels are limited to those that still resolve.
//!
//! Writable branches (translucent and opaque) store their commits in the
//! trunk archive as a branch lineage. The lineage is tracked by a floating
//! label named `BRANCH:<name>`.

use crate::archive::{
    ArchiveSnapshot, CheckInArgs, EditArgs, GetRevisionArgs, LabelArgs, LockArgs,
    RevisionSelector, UnLabelArgs, resolve_selector,
};
use crate::controller::ArchiveAccessController;
use crate::error::{FailureReason, Result};
use crate::header::LabelInfo;
use crate::listener::{
    ArchiveAction, ArchiveEvent, ArchiveListener, BranchChange, ListenerId,
};
use crate::revision::{RevisionDescriptor, RevisionHeader, recompute_tips};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Prefix of the floating label that records a branch's lineage.
pub const BRANCH_LABEL_PREFIX: &str = "BRANCH:";

/// How a branch derives its view of the trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchKind {
    /// The trunk itself.
    Trunk,
    /// Read-only view as of `anchor`. When `branch_point` is absent the
    /// newest trunk revision at the anchor date is used.
    ReadOnlyDate {
        anchor: DateTime<Utc>,
        branch_point: Option<String>,
    },
    /// Writable branch that shows the live trunk until a file is changed
    /// on it.
    Translucent { name: String },
    /// Writable branch rooted at `label`; unchanged files stay at the label.
    Opaque { name: String, label: String },
}

impl BranchKind {
    pub fn is_read_only(&self) -> bool {
        matches!(self, BranchKind::ReadOnlyDate { .. })
    }

    pub fn is_trunk(&self) -> bool {
        matches!(self, BranchKind::Trunk)
    }

    /// Branch name used in notifications.
    pub fn name(&self) -> String {
        match self {
            BranchKind::Trunk => "trunk".to_string(),
            BranchKind::ReadOnlyDate { anchor, .. } => format!("@{}", anchor.to_rfc3339()),
            BranchKind::Translucent { name } | BranchKind::Opaque { name, .. } => name.clone(),
        }
    }

    /// Label that tracks this branch's lineage in the trunk archive.
    pub fn branch_label(&self) -> Option<String> {
        match self {
            BranchKind::Translucent { name } | BranchKind::Opaque { name, .. } => {
                Some(format!("{}{}", BRANCH_LABEL_PREFIX, name))
            }
            _ => None,
        }
    }
}

/// Immutable result of projecting a trunk snapshot through a branch kind.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    /// Retained revisions in their original append order.
    pub revisions: Vec<RevisionHeader>,
    pub labels: Vec<LabelInfo>,
    pub default_revision: Option<String>,
    retained: HashSet<String>,
}

impl ViewSnapshot {
    pub fn contains(&self, revision: &str) -> bool {
        self.retained.contains(revision)
    }

    pub fn find(&self, revision: &str) -> Option<&RevisionHeader> {
        self.revisions.iter().find(|r| r.revision_string() == revision)
    }

    pub fn resolve(&self, selector: &RevisionSelector) -> std::result::Result<String, String> {
        let revision = resolve_selector(
            &self.revisions,
            &self.labels,
            self.default_revision.as_deref(),
            selector,
        )?;
        if !self.contains(&revision) {
            return Err(format!("revision {} is not visible on this branch", revision));
        }
        Ok(revision)
    }
}

fn ancestors_of(trunk: &ArchiveSnapshot, tip: &RevisionDescriptor) -> Vec<RevisionHeader> {
    trunk
        .revisions
        .iter()
        .filter(|r| r.descriptor.is_ancestor_or_self_of(tip))
        .cloned()
        .collect()
}

fn label_target(trunk: &ArchiveSnapshot, label: &str) -> Option<RevisionDescriptor> {
    trunk
        .header
        .find_label(label)
        .and_then(|l| l.resolve(&trunk.revisions))
        .and_then(|rev| rev.parse().ok())
}

/// Project `trunk` through `kind`.
pub fn project(trunk: &ArchiveSnapshot, kind: &BranchKind) -> ViewSnapshot {
    if let Some(lineage_tip) = kind
        .branch_label()
        .and_then(|label| label_target(trunk, &label))
    {
        return build(trunk, ancestors_of(trunk, &lineage_tip), true);
    }

    match kind {
        BranchKind::Trunk => build(trunk, trunk.revisions.clone(), false),
        BranchKind::ReadOnlyDate {
            anchor,
            branch_point,
        } => {
            let point: Option<RevisionDescriptor> = match branch_point {
                Some(p) => p.parse().ok(),
                None => trunk
                    .revisions
                    .iter()
                    .filter(|r| r.depth() == 0 && r.checkin_date <= *anchor)
                    .map(|r| r.descriptor.clone())
                    .max(),
            };
            let selected = match point {
                Some(point) => {
                    let cutoff = point.sortable_key();
                    trunk
                        .revisions
                        .iter()
                        .filter(|r| {
                            r.descriptor.is_ancestor_or_self_of(&point)
                                && r.sortable_key() <= cutoff
                                && r.checkin_date <= *anchor
                        })
                        .cloned()
                        .collect()
                }
                None => Vec::new(),
            };
            build(trunk, selected, true)
        }
        BranchKind::Translucent { .. } => {
            let selected = trunk
                .revisions
                .iter()
                .filter(|r| r.depth() == 0)
                .cloned()
                .collect();
            build(trunk, selected, true)
        }
        BranchKind::Opaque { label, .. } => {
            let selected = match label_target(trunk, label) {
                Some(target) => ancestors_of(trunk, &target),
                None => Vec::new(),
            };
            build(trunk, selected, true)
        }
    }
}

fn build(trunk: &ArchiveSnapshot, mut revisions: Vec<RevisionHeader>, clear_locks: bool) -> ViewSnapshot {
    if clear_locks {
        for rev in revisions.iter_mut() {
            rev.is_locked = false;
            rev.locker = None;
        }
    }
    recompute_tips(&mut revisions);

    let retained: HashSet<String> = revisions.iter().map(|r| r.revision_string()).collect();
    let labels = trunk
        .header
        .labels
        .iter()
        .filter(|l| l.resolve(&revisions).is_some_and(|rev| retained.contains(&rev)))
        .cloned()
        .collect();

    // The view's default is the tip of its deepest lineage, which for a
    // trunk view is the trunk tip.
    let default_revision = if clear_locks {
        revisions
            .iter()
            .filter(|r| r.is_tip)
            .max_by(|a, b| a.descriptor.cmp(&b.descriptor))
            .map(|r| r.revision_string())
    } else {
        trunk.trunk_tip().map(|r| r.revision_string())
    };

    ViewSnapshot {
        revisions,
        labels,
        default_revision,
        retained,
    }
}

/// Changes recorded against a writable branch without touching the trunk.
///
/// The overlay outlives any single view: the registry hands the same shared
/// overlay to every view it builds for a key, and an external index may
/// persist it and restore it with
/// [`ArchiveRegistry::restore_overlay`](crate::registry::ArchiveRegistry::restore_overlay).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOverlay {
    /// Set when the file has been moved to the branch cemetery.
    pub deleted: bool,
    pub name: Option<String>,
    pub directory: Option<PathBuf>,
}

pub type SharedOverlay = Arc<Mutex<BranchOverlay>>;

struct StaleMarker {
    stale: Arc<AtomicBool>,
}

impl ArchiveListener for StaleMarker {
    fn notify(&self, _event: &ArchiveEvent) -> anyhow::Result<()> {
        self.stale.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One file as seen from one branch.
pub struct BranchView {
    trunk: Arc<ArchiveAccessController>,
    kind: BranchKind,
    current: Mutex<Option<Arc<ViewSnapshot>>>,
    stale: Arc<AtomicBool>,
    listener: Option<ListenerId>,
    overlay: SharedOverlay,
}

impl BranchView {
    /// Build a view of `trunk`. Views other than read-only date views follow
    /// trunk mutations.
    pub fn open(trunk: Arc<ArchiveAccessController>, kind: BranchKind) -> Result<Self> {
        Self::with_overlay(trunk, kind, SharedOverlay::default())
    }

    /// Build a view that records branch changes into `overlay`.
    pub fn with_overlay(
        trunk: Arc<ArchiveAccessController>,
        kind: BranchKind,
        overlay: SharedOverlay,
    ) -> Result<Self> {
        let initial = Arc::new(project(&trunk.snapshot()?, &kind));
        let stale = Arc::new(AtomicBool::new(false));
        let listener = if kind.is_read_only() {
            None
        } else {
            Some(trunk.add_listener(Arc::new(StaleMarker {
                stale: stale.clone(),
            })))
        };
        Ok(Self {
            trunk,
            kind,
            current: Mutex::new(Some(initial)),
            stale,
            listener,
            overlay,
        })
    }

    pub fn kind(&self) -> &BranchKind {
        &self.kind
    }

    pub fn trunk(&self) -> &Arc<ArchiveAccessController> {
        &self.trunk
    }

    pub fn is_read_only(&self) -> bool {
        self.kind.is_read_only()
    }

    /// Current projection, rebuilt if the trunk changed since the last call.
    pub fn snapshot(&self) -> Result<Arc<ViewSnapshot>> {
        let mut current = self.current.lock();
        if self.stale.swap(false, Ordering::SeqCst) {
            *current = None;
        }
        if let Some(view) = current.as_ref() {
            return Ok(view.clone());
        }
        let view = Arc::new(project(&self.trunk.snapshot()?, &self.kind));
        *current = Some(view.clone());
        Ok(view)
    }

    pub fn default_revision(&self) -> Result<Option<String>> {
        Ok(self.snapshot()?.default_revision.clone())
    }

    pub fn overlay(&self) -> BranchOverlay {
        self.overlay.lock().clone()
    }

    /// File name on this branch.
    pub fn short_name(&self) -> String {
        if let Some(name) = self.overlay.lock().name.clone() {
            return name;
        }
        self.trunk
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn deleted_reason(&self) -> Option<String> {
        let deleted = self.overlay.lock().deleted;
        deleted.then(|| {
            format!(
                "{} was deleted on branch {}",
                self.short_name(),
                self.kind.name()
            )
        })
    }

    fn read_only_reason(&self) -> String {
        format!("branch {} is read-only", self.kind.name())
    }

    // ==================== Reads ====================

    pub fn fetch(&self, args: &mut GetRevisionArgs) -> Result<Option<Bytes>> {
        if let Some(reason) = self.deleted_reason() {
            args.reject(reason);
            return Ok(None);
        }
        let revision = match self.snapshot()?.resolve(&args.selector) {
            Ok(rev) => rev,
            Err(reason) => {
                args.reject(reason);
                return Ok(None);
            }
        };
        self.trunk.fetch_revision_string(args, Some(&revision))
    }

    pub fn get_revision(&self, args: &mut GetRevisionArgs, dest: &Path) -> Result<bool> {
        match self.fetch(args)? {
            Some(content) => {
                fs::write(dest, &content)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ==================== Mutations ====================

    /// Check in on this branch. Trunk views honour locks, branch commits do
    /// not.
    pub fn check_in_revision(&self, args: &mut CheckInArgs, content: &[u8]) -> Result<bool> {
        match &self.kind {
            BranchKind::ReadOnlyDate { .. } => return Ok(args.reject(self.read_only_reason())),
            BranchKind::Trunk => return self.trunk.check_in_content(args, content, false),
            _ => {}
        }
        if let Some(reason) = self.deleted_reason() {
            return Ok(args.reject(reason));
        }
        if args.label.is_some() {
            return Ok(args.reject("labels cannot be applied by a branch check-in"));
        }
        let Some(branch_label) = self.kind.branch_label() else {
            return Ok(args.reject(self.read_only_reason()));
        };

        let branch_point = self.snapshot()?.default_revision.clone();
        self.trunk
            .check_in_on_branch(args, content, &branch_label, branch_point.as_deref())
    }

    fn reject_lock(&self, args: &mut LockArgs) -> bool {
        if self.is_read_only() {
            args.reject(self.read_only_reason())
        } else {
            args.reject(format!("locks are not tracked on branch {}", self.kind.name()))
        }
    }

    pub fn lock_revision(&self, args: &mut LockArgs) -> Result<bool> {
        if self.kind.is_trunk() {
            return self.trunk.lock_revision(args);
        }
        Ok(self.reject_lock(args))
    }

    pub fn unlock_revision(&self, args: &mut LockArgs) -> Result<bool> {
        if self.kind.is_trunk() {
            return self.trunk.unlock_revision(args);
        }
        Ok(self.reject_lock(args))
    }

    pub fn break_lock(&self, args: &mut LockArgs) -> Result<bool> {
        if self.kind.is_trunk() {
            return self.trunk.break_lock(args);
        }
        Ok(self.reject_lock(args))
    }

    /// Label a revision visible on this branch.
    pub fn label_revision(&self, args: &mut LabelArgs) -> Result<bool> {
        if self.is_read_only() {
            return Ok(args.reject(self.read_only_reason()));
        }
        if args.label.starts_with(BRANCH_LABEL_PREFIX) {
            return Ok(args.reject(format!("{} labels are reserved", BRANCH_LABEL_PREFIX)));
        }
        if !self.kind.is_trunk() {
            let selector = match &args.revision {
                Some(rev) => RevisionSelector::Revision(rev.clone()),
                None => RevisionSelector::Default,
            };
            match self.snapshot()?.resolve(&selector) {
                Ok(rev) => args.revision = Some(rev),
                Err(reason) => return Ok(args.reject(reason)),
            }
        }
        self.trunk.label_revision(args)
    }

    pub fn un_label_revision(&self, args: &mut UnLabelArgs) -> Result<bool> {
        if self.is_read_only() {
            return Ok(args.reject(self.read_only_reason()));
        }
        if args.label.starts_with(BRANCH_LABEL_PREFIX) {
            return Ok(args.reject(format!("{} labels are reserved", BRANCH_LABEL_PREFIX)));
        }
        self.trunk.un_label_revision(args)
    }

    /// Apply an overlay change on a writable branch and announce it.
    fn change_on_branch(
        &self,
        args: &mut EditArgs,
        change: BranchChange,
        apply: impl FnOnce(&mut BranchOverlay),
    ) -> Result<bool> {
        if self.is_read_only() {
            return Ok(args.reject(self.read_only_reason()));
        }
        if self.kind.is_trunk() {
            return Ok(args.reject("trunk files are renamed, moved and deleted through the archive"));
        }
        if let Some(reason) = self.deleted_reason() {
            return Ok(args.reject(reason));
        }
        apply(&mut *self.overlay.lock());

        let action = ArchiveAction::ChangeOnBranch {
            branch: self.kind.name(),
            change,
        };
        self.trunk
            .publish(&ArchiveEvent::new(self.trunk.path(), action, &args.user));
        Ok(true)
    }

    /// Move the file to this branch's cemetery.
    pub fn delete_on_branch(&self, args: &mut EditArgs) -> Result<bool> {
        self.change_on_branch(args, BranchChange::Delete, |o| o.deleted = true)
    }

    pub fn rename_on_branch(&self, args: &mut EditArgs, new_name: &str) -> Result<bool> {
        let change = BranchChange::Rename {
            old_name: self.short_name(),
            new_name: new_name.to_string(),
        };
        self.change_on_branch(args, change, |o| o.name = Some(new_name.to_string()))
    }

    pub fn move_on_branch(&self, args: &mut EditArgs, new_directory: &Path) -> Result<bool> {
        let old_directory = self.overlay.lock().directory.clone().unwrap_or_else(|| {
            self.trunk
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        });
        let change = BranchChange::Move {
            old_directory,
            new_directory: new_directory.to_path_buf(),
        };
        self.change_on_branch(args, change, |o| {
            o.directory = Some(new_directory.to_path_buf())
        })
    }
}

impl Drop for BranchView {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.trunk.remove_listener(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ArchiveHeader, Attributes};
    use crate::revision::StorageKind;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn rev(s: &str, minutes: i64) -> RevisionHeader {
        RevisionHeader {
            descriptor: s.parse().unwrap(),
            checkin_date: t(minutes),
            edit_date: t(minutes),
            creator: "alice".to_string(),
            locker: Some("alice".to_string()),
            is_locked: true,
            is_tip: false,
            compressed: false,
            storage: StorageKind::Full,
            content_size: 0,
            stored_size: 0,
            description: String::new(),
        }
    }

    fn snapshot(revs: Vec<RevisionHeader>, labels: Vec<LabelInfo>) -> ArchiveSnapshot {
        let mut revisions = revs;
        recompute_tips(&mut revisions);
        let mut header = ArchiveHeader::new("alice", Attributes::default());
        header.labels = labels;
        ArchiveSnapshot {
            path: PathBuf::from("foo.txt"),
            header,
            revisions,
        }
    }

    fn label(name: &str, target: &str, floating: bool) -> LabelInfo {
        LabelInfo::new(name, &target.parse().unwrap(), floating, "alice")
    }

    fn strings(view: &ViewSnapshot) -> Vec<String> {
        view.revisions.iter().map(|r| r.revision_string()).collect()
    }

    #[test]
    fn test_date_view_cuts_by_anchor() {
        let trunk = snapshot(
            vec![rev("1.0", 0), rev("1.1", 10), rev("1.1.1.0", 15), rev("1.2", 20)],
            vec![label("REL1", "1.1", false), label("REL2", "1.2", false)],
        );
        let kind = BranchKind::ReadOnlyDate {
            anchor: t(12),
            branch_point: None,
        };
        let view = project(&trunk, &kind);
        assert_eq!(strings(&view), vec!["1.0", "1.1"]);
        assert_eq!(view.default_revision.as_deref(), Some("1.1"));
        assert!(view.revisions.iter().all(|r| !r.is_locked && r.locker.is_none()));
        assert!(view.find("1.1").unwrap().is_tip);
        assert_eq!(view.labels.len(), 1);
        assert_eq!(
            view.resolve(&RevisionSelector::Label("REL1".to_string())).unwrap(),
            "1.1"
        );
        assert!(view.resolve(&RevisionSelector::Revision("1.2".to_string())).is_err());
    }

    #[test]
    fn test_date_view_off_branch_point() {
        let trunk = snapshot(
            vec![
                rev("1.0", 0),
                rev("1.1", 10),
                rev("1.1.1.0", 15),
                rev("1.2", 20),
                rev("1.1.1.1", 25),
                rev("1.1.2.0", 26),
            ],
            vec![],
        );
        let kind = BranchKind::ReadOnlyDate {
            anchor: t(30),
            branch_point: Some("1.1.1.1".to_string()),
        };
        let view = project(&trunk, &kind);
        assert_eq!(strings(&view), vec!["1.0", "1.1", "1.1.1.0", "1.1.1.1"]);
        assert_eq!(view.default_revision.as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn test_floating_label_resolves_to_view_tip() {
        let trunk = snapshot(
            vec![rev("1.0", 0), rev("1.1", 10), rev("1.2", 20)],
            vec![label("LATEST", "1.0", true)],
        );
        let kind = BranchKind::ReadOnlyDate {
            anchor: t(15),
            branch_point: None,
        };
        let view = project(&trunk, &kind);
        assert_eq!(
            view.resolve(&RevisionSelector::Label("LATEST".to_string())).unwrap(),
            "1.1"
        );
    }

    #[test]
    fn test_translucent_without_lineage_tracks_trunk() {
        let trunk = snapshot(vec![rev("1.0", 0), rev("1.1", 10), rev("1.0.1.0", 12)], vec![]);
        let view = project(
            &trunk,
            &BranchKind::Translucent {
                name: "feature".to_string(),
            },
        );
        assert_eq!(strings(&view), vec!["1.0", "1.1"]);
        assert_eq!(view.default_revision.as_deref(), Some("1.1"));
    }

    #[test]
    fn test_translucent_with_lineage() {
        let trunk = snapshot(
            vec![rev("1.0", 0), rev("1.1", 10), rev("1.1.1.0", 12), rev("1.2", 14), rev("1.1.1.1", 16)],
            vec![label("BRANCH:feature", "1.1.1.0", true)],
        );
        let view = project(
            &trunk,
            &BranchKind::Translucent {
                name: "feature".to_string(),
            },
        );
        assert_eq!(strings(&view), vec!["1.0", "1.1", "1.1.1.0", "1.1.1.1"]);
        assert_eq!(view.default_revision.as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn test_opaque_anchored_at_label() {
        let trunk = snapshot(
            vec![rev("1.0", 0), rev("1.1", 10), rev("1.2", 20)],
            vec![label("REL1", "1.1", false)],
        );
        let kind = BranchKind::Opaque {
            name: "maint".to_string(),
            label: "REL1".to_string(),
        };
        let view = project(&trunk, &kind);
        assert_eq!(view.default_revision.as_deref(), Some("1.1"));

        let missing = BranchKind::Opaque {
            name: "maint".to_string(),
            label: "NOPE".to_string(),
        };
        let view = project(&trunk, &missing);
        assert!(view.revisions.is_empty());
        assert!(view.default_revision.is_none());
    }

    #[test]
    fn test_trunk_view_is_identity() {
        let trunk = snapshot(vec![rev("1.0", 0), rev("1.1", 10)], vec![]);
        let view = project(&trunk, &BranchKind::Trunk);
        assert_eq!(view.revisions, trunk.revisions);
        assert_eq!(view.default_revision.as_deref(), Some("1.1"));
    }

    proptest! {
        #[test]
        fn prop_date_view_respects_anchor_and_ancestry(
            gaps in prop::collection::vec(1i64..30, 1..12),
            branch_at in 0usize..12,
            anchor in 0i64..400,
        ) {
            let mut revs = Vec::new();
            let mut minute = 0;
            for (i, gap) in gaps.iter().enumerate() {
                minute += gap;
                revs.push(rev(&format!("1.{}", i), minute));
            }
            let base = branch_at.min(gaps.len() - 1);
            revs.push(rev(&format!("1.{}.1.0", base), minute + 1));

            let trunk = snapshot(revs, vec![]);
            let kind = BranchKind::ReadOnlyDate { anchor: t(anchor), branch_point: None };
            let view = project(&trunk, &kind);

            let tips: Vec<_> = view.revisions.iter().filter(|r| r.is_tip).collect();
            prop_assert!(tips.len() <= 1);
            for r in &view.revisions {
                prop_assert!(r.checkin_date <= t(anchor));
                prop_assert_eq!(r.depth(), 0);
            }
        }
    }
}
