//! Process-wide archive handle and view caches
//!
//! The registry is the only place controllers are created, which keeps the
//! one-handle-per-file rule: concurrent lookups of the same path always get
//! the same `Arc<ArchiveAccessController>`.
//!
//! Branch overlays are kept per view key, apart from the views themselves, so
//! rebuilding a view does not lose branch deletes, renames or moves. A digest
//! cache attached with [`ArchiveRegistry::set_digest_cache`] listens on every
//! handle and drops digests of removed, renamed or moved archives.

use crate::archive::EditArgs;
use crate::config::EngineConfig;
use crate::controller::ArchiveAccessController;
use crate::digest::DigestCache;
use crate::error::Result;
use crate::view::{BranchKind, BranchOverlay, BranchView, SharedOverlay};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Cache key for a branch view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub project: String,
    pub branch: String,
    pub path: PathBuf,
}

impl ViewKey {
    pub fn new(project: &str, branch: &str, path: &Path) -> Self {
        Self {
            project: project.to_string(),
            branch: branch.to_string(),
            path: path.to_path_buf(),
        }
    }
}

pub struct ArchiveRegistry {
    config: Arc<EngineConfig>,
    handles: Mutex<HashMap<PathBuf, Arc<ArchiveAccessController>>>,
    views: Mutex<HashMap<ViewKey, Arc<BranchView>>>,
    overlays: Mutex<HashMap<ViewKey, SharedOverlay>>,
    digests: Mutex<Option<Arc<DigestCache>>>,
}

impl ArchiveRegistry {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            overlays: Mutex::new(HashMap::new()),
            digests: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The handle for `path`, creating it on first use.
    pub fn open(&self, path: &Path) -> Arc<ArchiveAccessController> {
        let mut handles = self.handles.lock();
        handles
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                debug!("Opening archive handle for {:?}", path);
                let controller = Arc::new(ArchiveAccessController::new(path, &self.config));
                if let Some(cache) = self.digests.lock().as_ref() {
                    controller.add_listener(cache.clone());
                }
                controller
            })
            .clone()
    }

    /// Attach `cache` to every handle, present and future.
    pub fn set_digest_cache(&self, cache: Arc<DigestCache>) {
        let handles = self.handles.lock();
        let mut digests = self.digests.lock();
        if digests.is_some() {
            debug!("Replacing the attached digest cache for new handles only");
        } else {
            for controller in handles.values() {
                controller.add_listener(cache.clone());
            }
        }
        *digests = Some(cache);
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Cached view of the archive at `key.path` on `key.branch`.
    pub fn view(&self, key: ViewKey, kind: BranchKind) -> Result<Arc<BranchView>> {
        if let Some(view) = self.views.lock().get(&key) {
            if *view.kind() == kind {
                return Ok(view.clone());
            }
        }
        let trunk = self.open(&key.path);
        let overlay = self.overlays.lock().entry(key.clone()).or_default().clone();
        let view = Arc::new(BranchView::with_overlay(trunk, kind, overlay)?);
        let mut views = self.views.lock();
        // A concurrent caller may have won the race; keep the first entry.
        let entry = views.entry(key).or_insert_with(|| view.clone());
        if *entry.kind() != *view.kind() {
            *entry = view;
        }
        Ok(entry.clone())
    }

    /// Seed the overlay for `key`, typically from a persisted branch index.
    /// Views already built for `key` see the restored state.
    pub fn restore_overlay(&self, key: ViewKey, overlay: BranchOverlay) {
        let mut overlays = self.overlays.lock();
        let shared = overlays.entry(key).or_default();
        *shared.lock() = overlay;
    }

    /// Every non-empty overlay, for persisting alongside the branch index.
    pub fn overlays(&self) -> Vec<(ViewKey, BranchOverlay)> {
        self.overlays
            .lock()
            .iter()
            .map(|(key, shared)| (key.clone(), shared.lock().clone()))
            .filter(|(_, overlay)| *overlay != BranchOverlay::default())
            .collect()
    }

    fn forget(&self, path: &Path) {
        self.handles.lock().remove(path);
        self.views.lock().retain(|key, _| key.path != path);
    }

    /// Bury the archive in the cemetery and drop its cached handle and views.
    pub fn delete_archive(&self, path: &Path, args: &mut EditArgs) -> Result<bool> {
        let controller = self.open(path);
        let ok = controller.delete_archive(args)?;
        if ok {
            self.forget(path);
            self.overlays.lock().retain(|key, _| key.path != path);
        }
        Ok(ok)
    }

    /// Rename the archive and re-key its handle.
    pub fn rename_archive(&self, path: &Path, args: &mut EditArgs, new_name: &str) -> Result<bool> {
        let controller = self.open(path);
        let ok = controller.rename_archive(args, new_name)?;
        if ok {
            self.rekey(path, controller);
        }
        Ok(ok)
    }

    /// Move the archive and re-key its handle.
    pub fn move_archive(&self, path: &Path, args: &mut EditArgs, new_directory: &Path) -> Result<bool> {
        let controller = self.open(path);
        let ok = controller.move_archive(args, new_directory)?;
        if ok {
            self.rekey(path, controller);
        }
        Ok(ok)
    }

    fn rekey(&self, old_path: &Path, controller: Arc<ArchiveAccessController>) {
        let new_path = controller.path();
        self.forget(old_path);
        let mut overlays = self.overlays.lock();
        let moved: Vec<ViewKey> = overlays
            .keys()
            .filter(|key| key.path == old_path)
            .cloned()
            .collect();
        for key in moved {
            if let Some(overlay) = overlays.remove(&key) {
                overlays.insert(ViewKey::new(&key.project, &key.branch, &new_path), overlay);
            }
        }
        drop(overlays);
        self.handles.lock().insert(new_path, controller);
    }
}
