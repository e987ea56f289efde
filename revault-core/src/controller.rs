//! Serialized access to one archive
//!
//! Exactly one `ArchiveAccessController` exists per physical archive (see
//! [`ArchiveRegistry`](crate::registry::ArchiveRegistry)). Reads share the
//! handle's read lock, mutations take its write lock. Listeners are notified
//! after the write lock has been released, so they may call back into the
//! controller.

use crate::archive::{
    ArchiveSnapshot, CheckInArgs, CheckOutArgs, CreateArchiveArgs, EditArgs, GetRevisionArgs,
    LabelArgs, LockArgs, RevisionArchive, UnLabelArgs,
};
use crate::config::EngineConfig;
use crate::error::{FailureReason, Result};
use crate::header::{ArchiveHeader, Attributes};
use crate::listener::{ArchiveAction, ArchiveEvent, ArchiveListener, ListenerId, ListenerList};
use crate::revision::RevisionHeader;
use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct ArchiveAccessController {
    archive: RwLock<RevisionArchive>,
    listeners: ListenerList,
    cemetery_dir: PathBuf,
}

impl ArchiveAccessController {
    pub fn new(path: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self {
            archive: RwLock::new(RevisionArchive::new(path, config)),
            listeners: ListenerList::new(),
            cemetery_dir: config.cemetery_dir.clone(),
        }
    }

    /// Current archive path (changes on rename, move and delete).
    pub fn path(&self) -> PathBuf {
        self.archive.read().path().to_path_buf()
    }

    pub fn exists(&self) -> bool {
        self.archive.read().exists()
    }

    /// Read lock on a loaded archive.
    fn read_loaded(&self) -> Result<RwLockReadGuard<'_, RevisionArchive>> {
        {
            let guard = self.archive.read();
            if guard.is_loaded() {
                return Ok(guard);
            }
        }
        let mut guard = self.archive.write();
        guard.read_information()?;
        Ok(RwLockWriteGuard::downgrade(guard))
    }

    /// Write lock on a loaded archive.
    fn write_loaded(&self) -> Result<RwLockWriteGuard<'_, RevisionArchive>> {
        let mut guard = self.archive.write();
        guard.read_information()?;
        Ok(guard)
    }

    // ==================== Listeners ====================

    pub fn add_listener(&self, listener: Arc<dyn ArchiveListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Deliver an event to this archive's listeners.
    pub fn publish(&self, event: &ArchiveEvent) {
        self.listeners.publish(event);
    }

    fn fire(&self, path: PathBuf, action: ArchiveAction, user: &str) {
        self.publish(&ArchiveEvent::new(path, action, user));
    }

    // ==================== Reads ====================

    /// Load header and revision metadata. Idempotent.
    pub fn read_information(&self) -> Result<()> {
        self.read_loaded().map(|_| ())
    }

    pub fn header(&self) -> Result<ArchiveHeader> {
        Ok(self.read_loaded()?.header()?.clone())
    }

    pub fn revisions(&self) -> Result<Vec<RevisionHeader>> {
        Ok(self.read_loaded()?.revisions().cloned().collect())
    }

    pub fn snapshot(&self) -> Result<ArchiveSnapshot> {
        self.read_loaded()?.snapshot()
    }

    pub fn verify(&self) -> Result<()> {
        self.read_loaded()?.verify()
    }

    /// Resolve `args.selector` and write the content to `dest`.
    pub fn get_revision(&self, args: &mut GetRevisionArgs, dest: &Path) -> Result<bool> {
        let archive = self.read_loaded()?;
        let revision = match archive.resolve(&args.selector) {
            Ok(rev) => rev,
            Err(reason) => return Ok(args.reject(reason)),
        };
        if let Err(reason) = archive.fetch_to(&revision, dest, args.expand_keywords) {
            return Ok(args.reject(reason));
        }
        args.resolved_revision = Some(revision);
        Ok(true)
    }

    /// Resolve `args.selector` and return the content.
    pub fn fetch(&self, args: &mut GetRevisionArgs) -> Result<Option<Bytes>> {
        self.fetch_revision_string(args, None)
    }

    /// Fetch a concrete revision string, bypassing selector resolution.
    pub(crate) fn fetch_revision_string(
        &self,
        args: &mut GetRevisionArgs,
        revision: Option<&str>,
    ) -> Result<Option<Bytes>> {
        let archive = self.read_loaded()?;
        let revision = match revision {
            Some(rev) => rev.to_string(),
            None => match archive.resolve(&args.selector) {
                Ok(rev) => rev,
                Err(reason) => {
                    args.reject(reason);
                    return Ok(None);
                }
            },
        };
        let fetched = if args.expand_keywords {
            archive.fetch_expanded(&revision)
        } else {
            archive.fetch_revision(&revision)
        };
        match fetched {
            Ok(content) => {
                args.resolved_revision = Some(revision);
                Ok(Some(content))
            }
            Err(reason) => {
                args.reject(reason);
                Ok(None)
            }
        }
    }

    // ==================== Check-in / check-out ====================

    /// Check in the content of `content_file`.
    pub fn check_in_revision(
        &self,
        args: &mut CheckInArgs,
        content_file: &Path,
        ignore_locks: bool,
    ) -> Result<bool> {
        let content = fs::read(content_file)?;
        self.check_in_content(args, &content, ignore_locks)
    }

    /// Check in `content`. Creates the archive when it does not exist yet.
    pub fn check_in_content(
        &self,
        args: &mut CheckInArgs,
        content: &[u8],
        ignore_locks: bool,
    ) -> Result<bool> {
        let mut archive = self.archive.write();
        let path = archive.path().to_path_buf();

        if !archive.exists() {
            let mut create = CreateArchiveArgs {
                user: args.user.clone(),
                description: args.description.clone(),
                attributes: args.attributes,
                edit_date: args.edit_date,
                checkin_date: args.checkin_date,
                label: args.label.clone(),
                floating_label: args.floating_label,
                ..Default::default()
            };
            if !archive.create(&mut create, content)? {
                *args.failure_reason_mut() = create.failure_reason;
                return Ok(false);
            }
            let revision = archive
                .trunk_tip()
                .map(|r| r.revision_string())
                .unwrap_or_default();
            drop(archive);

            args.new_revision = Some(revision.clone());
            self.fire(path.clone(), ArchiveAction::Create { revision }, &args.user);
            self.fire_label(path, args);
            return Ok(true);
        }

        archive.read_information()?;
        if !archive.check_in(args, content, ignore_locks)? {
            return Ok(false);
        }
        drop(archive);
        self.fire_check_in(path, args);
        Ok(true)
    }

    /// Commit `content` onto the branch lineage tracked by `branch_label`.
    ///
    /// The lineage tip is resolved under the write lock, so concurrent branch
    /// commits chain onto each other. When the branch has no lineage yet a
    /// new one is opened off `branch_point`. Locks are not checked.
    pub fn check_in_on_branch(
        &self,
        args: &mut CheckInArgs,
        content: &[u8],
        branch_label: &str,
        branch_point: Option<&str>,
    ) -> Result<bool> {
        let mut archive = self.write_loaded()?;
        let path = archive.path().to_path_buf();

        let revisions: Vec<RevisionHeader> = archive.revisions().cloned().collect();
        let lineage_tip = archive
            .header()?
            .find_label(branch_label)
            .and_then(|label| label.resolve(&revisions));
        match lineage_tip {
            Some(tip) => {
                args.parent_revision = Some(tip);
                args.force_branch = false;
            }
            None => {
                let Some(point) = branch_point else {
                    return Ok(args.reject(format!("no branch point for {}", branch_label)));
                };
                args.parent_revision = Some(point.to_string());
                args.force_branch = true;
            }
        }
        args.label = Some(branch_label.to_string());
        args.floating_label = true;
        args.reuse_label = true;

        if !archive.check_in(args, content, true)? {
            return Ok(false);
        }
        drop(archive);
        self.fire_check_in(path, args);
        Ok(true)
    }

    fn fire_check_in(&self, path: PathBuf, args: &CheckInArgs) {
        let revision = args.new_revision.clone().unwrap_or_default();
        self.fire(
            path.clone(),
            ArchiveAction::CheckIn {
                revision,
                description: args.description.clone(),
            },
            &args.user,
        );
        self.fire_label(path, args);
    }

    fn fire_label(&self, path: PathBuf, args: &CheckInArgs) {
        if let Some(label) = &args.label {
            self.fire(
                path,
                ArchiveAction::Label {
                    label: label.clone(),
                    revision: args.new_revision.clone().unwrap_or_default(),
                    floating: args.floating_label,
                },
                &args.user,
            );
        }
    }

    /// Fetch a revision into `dest`, optionally locking it for the user.
    /// A failed write to `dest` releases the lock again.
    pub fn check_out_revision(&self, args: &mut CheckOutArgs, dest: &Path) -> Result<bool> {
        let mut archive = self.write_loaded()?;
        let path = archive.path().to_path_buf();

        let revision = match archive.resolve(&args.selector) {
            Ok(rev) => rev,
            Err(reason) => return Ok(args.reject(reason)),
        };
        let fetched = if args.expand_keywords {
            archive.fetch_expanded(&revision)
        } else {
            archive.fetch_revision(&revision)
        };
        let content = match fetched {
            Ok(content) => content,
            Err(reason) => return Ok(args.reject(reason)),
        };

        if args.lock {
            let mut lock = LockArgs::new(&args.user, Some(&revision));
            if !archive.lock_revision(&mut lock)? {
                *args.failure_reason_mut() = lock.failure_reason;
                return Ok(false);
            }
        }
        if let Err(e) = fs::write(dest, &content) {
            if args.lock {
                let mut undo = LockArgs::new(&args.user, Some(&revision));
                archive.unlock_revision(&mut undo, true)?;
            }
            return Err(e.into());
        }
        drop(archive);

        args.resolved_revision = Some(revision.clone());
        self.fire(
            path,
            ArchiveAction::CheckOut {
                revision,
                locked: args.lock,
            },
            &args.user,
        );
        Ok(true)
    }

    // ==================== Locks and labels ====================

    /// Run a mutation under the write lock; returns its result and the path.
    fn mutate(
        &self,
        op: impl FnOnce(&mut RevisionArchive) -> Result<bool>,
    ) -> Result<(bool, PathBuf)> {
        let mut archive = self.write_loaded()?;
        let ok = op(&mut *archive)?;
        Ok((ok, archive.path().to_path_buf()))
    }

    pub fn lock_revision(&self, args: &mut LockArgs) -> Result<bool> {
        let (ok, path) = self.mutate(|a| a.lock_revision(args))?;
        if ok {
            let revision = args.resolved_revision.clone().unwrap_or_default();
            self.fire(path, ArchiveAction::Lock { revision }, &args.user);
        }
        Ok(ok)
    }

    pub fn unlock_revision(&self, args: &mut LockArgs) -> Result<bool> {
        self.release(args, false)
    }

    /// Clear a lock regardless of who holds it.
    pub fn break_lock(&self, args: &mut LockArgs) -> Result<bool> {
        self.release(args, true)
    }

    fn release(&self, args: &mut LockArgs, broken: bool) -> Result<bool> {
        let (ok, path) = self.mutate(|a| a.unlock_revision(args, broken))?;
        if ok {
            let revision = args.resolved_revision.clone().unwrap_or_default();
            self.fire(path, ArchiveAction::Unlock { revision, broken }, &args.user);
        }
        Ok(ok)
    }

    pub fn label_revision(&self, args: &mut LabelArgs) -> Result<bool> {
        let (ok, path) = self.mutate(|a| a.label_revision(args))?;
        if ok {
            let action = ArchiveAction::Label {
                label: args.label.clone(),
                revision: args.resolved_revision.clone().unwrap_or_default(),
                floating: args.floating,
            };
            self.fire(path, action, &args.user);
        }
        Ok(ok)
    }

    pub fn un_label_revision(&self, args: &mut UnLabelArgs) -> Result<bool> {
        let (ok, path) = self.mutate(|a| a.un_label_revision(args))?;
        if ok {
            let action = ArchiveAction::UnLabel {
                label: args.label.clone(),
            };
            self.fire(path, action, &args.user);
        }
        Ok(ok)
    }

    // ==================== Header edits ====================

    pub fn set_attributes(&self, args: &mut EditArgs, attributes: Attributes) -> Result<bool> {
        Ok(self.mutate(|a| a.set_attributes(args, attributes))?.0)
    }

    pub fn set_comment_prefix(&self, args: &mut EditArgs, prefix: &str) -> Result<bool> {
        Ok(self.mutate(|a| a.set_comment_prefix(args, prefix))?.0)
    }

    pub fn set_module_description(&self, args: &mut EditArgs, description: &str) -> Result<bool> {
        Ok(self.mutate(|a| a.set_module_description(args, description))?.0)
    }

    pub fn set_revision_description(
        &self,
        args: &mut EditArgs,
        revision: &str,
        description: &str,
    ) -> Result<bool> {
        Ok(self
            .mutate(|a| a.set_revision_description(args, revision, description))?
            .0)
    }

    // ==================== Lifecycle ====================

    /// Move the archive into the cemetery under a unique name.
    pub fn delete_archive(&self, args: &mut EditArgs) -> Result<bool> {
        let mut archive = self.write_loaded()?;
        let old_path = archive.path().to_path_buf();
        let cemetery_path = self
            .cemetery_dir
            .join(format!("{}.{}", archive.short_name(), Uuid::new_v4()));
        archive.relocate_to(cemetery_path.clone())?;
        drop(archive);

        info!("Buried {:?} as {:?}", old_path, cemetery_path);
        self.fire(old_path, ArchiveAction::Remove { cemetery_path }, &args.user);
        Ok(true)
    }

    /// Rename the archive within its directory.
    pub fn rename_archive(&self, args: &mut EditArgs, new_name: &str) -> Result<bool> {
        let mut archive = self.write_loaded()?;
        let old_path = archive.path().to_path_buf();
        let new_path = old_path.with_file_name(new_name);
        if new_path.exists() {
            return Ok(args.reject(format!("{} already exists", new_path.display())));
        }
        archive.relocate_to(new_path.clone())?;
        drop(archive);

        self.fire(old_path, ArchiveAction::Rename { new_path }, &args.user);
        Ok(true)
    }

    /// Move the archive into `new_directory`, keeping its name.
    pub fn move_archive(&self, args: &mut EditArgs, new_directory: &Path) -> Result<bool> {
        let mut archive = self.write_loaded()?;
        let old_path = archive.path().to_path_buf();
        let new_path = new_directory.join(archive.short_name());
        if new_path.exists() {
            return Ok(args.reject(format!("{} already exists", new_path.display())));
        }
        archive.relocate_to(new_path.clone())?;
        drop(archive);

        self.fire(old_path, ArchiveAction::MoveFile { new_path }, &args.user);
        Ok(true)
    }
}
