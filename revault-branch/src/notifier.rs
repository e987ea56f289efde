//! Cross-branch change notification
//!
//! Every writable branch keeps a map from file id to the branch that owns the
//! file's newest revision as seen from that branch. A check-in on branch B
//! claims the file for B and for each writable descendant that has no
//! revision of its own; descendants that committed the file themselves stop
//! the walk.
//!
//! Notifications are queued and delivered by a background worker, which
//! waits `flush_delay_ms` after the first queued item so a burst from one
//! transaction reaches each subscriber as a single batch.

use crate::catalog::{BranchCatalog, BranchId, BranchInfo};
use crate::config::NotifierConfig;
use crate::error::{BranchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use revault_core::{ArchiveAction, ArchiveEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of a file in the external file-identity index.
pub type FileId = u64;

/// Where a client listens: one directory of one branch of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub project: String,
    pub branch: String,
    pub directory: PathBuf,
}

impl SubscriptionKey {
    pub fn new(project: &str, branch: &str, directory: &Path) -> Self {
        Self {
            project: project.to_string(),
            branch: branch.to_string(),
            directory: directory.to_path_buf(),
        }
    }
}

/// A mutation of one file on one branch.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub project: String,
    pub branch: BranchId,
    pub file_id: FileId,
    pub directory: PathBuf,
    pub action: ArchiveAction,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

impl FileChange {
    /// Wrap an archive event that happened on `branch`.
    pub fn from_event(project: &str, branch: BranchId, file_id: FileId, event: &ArchiveEvent) -> Self {
        Self {
            project: project.to_string(),
            branch,
            file_id,
            directory: event
                .archive
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            action: event.action.clone(),
            user: event.user.clone(),
            timestamp: event.timestamp,
        }
    }

    /// Whether the change adds a revision, making its branch the tip owner.
    fn claims_tip(&self) -> bool {
        matches!(
            self.action,
            ArchiveAction::CheckIn { .. } | ArchiveAction::Create { .. }
        )
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub key: SubscriptionKey,
    /// Branch the change was made on.
    pub origin_branch: String,
    pub file_id: FileId,
    pub action: ArchiveAction,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

/// A connected client.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn client_id(&self) -> &str;

    /// Deliver one batch. An error marks the client as disconnected.
    async fn deliver(&self, batch: &[Notification]) -> anyhow::Result<()>;
}

struct NotifierState {
    catalog: BranchCatalog,
    tip_owners: HashMap<BranchId, HashMap<FileId, BranchId>>,
    subscriptions: HashMap<SubscriptionKey, Vec<Arc<dyn NotificationSink>>>,
}

impl NotifierState {
    fn tip_owner(&self, branch: BranchId, file_id: FileId) -> Option<BranchId> {
        std::iter::once(branch)
            .chain(self.catalog.ancestors(branch))
            .find_map(|b| self.tip_owners.get(&b).and_then(|m| m.get(&file_id)).copied())
    }

    fn owns(&self, branch: BranchId, file_id: FileId) -> bool {
        self.tip_owners
            .get(&branch)
            .and_then(|m| m.get(&file_id))
            .is_some_and(|owner| *owner == branch)
    }

    fn notification(target: &BranchInfo, origin: &BranchInfo, change: &FileChange) -> Notification {
        Notification {
            key: SubscriptionKey::new(&change.project, &target.name, &change.directory),
            origin_branch: origin.name.clone(),
            file_id: change.file_id,
            action: change.action.clone(),
            user: change.user.clone(),
            timestamp: change.timestamp,
        }
    }

    /// Update tip owners for `change` and build one notification per
    /// branch that sees it.
    fn fan_out(&mut self, change: &FileChange) -> Result<Vec<(BranchId, Notification)>> {
        let origin = self.catalog.get(change.branch)?.clone();
        let claims = change.claims_tip();
        if claims {
            self.tip_owners
                .entry(origin.id)
                .or_default()
                .insert(change.file_id, origin.id);
        }

        let mut out = vec![(origin.id, Self::notification(&origin, &origin, change))];
        let mut queue: VecDeque<BranchId> = self.catalog.children(origin.id).map(|b| b.id).collect();
        while let Some(id) = queue.pop_front() {
            let target = self.catalog.get(id)?.clone();
            if !target.is_writable() || self.owns(id, change.file_id) {
                continue;
            }
            if claims {
                self.tip_owners
                    .entry(id)
                    .or_default()
                    .insert(change.file_id, origin.id);
            }
            out.push((id, Self::notification(&target, &origin, change)));
            queue.extend(self.catalog.children(id).map(|b| b.id));
        }
        Ok(out)
    }

    fn remove_client(&mut self, client_id: &str) -> usize {
        let mut removed = 0;
        self.subscriptions.retain(|_, sinks| {
            let before = sinks.len();
            sinks.retain(|s| s.client_id() != client_id);
            removed += before - sinks.len();
            !sinks.is_empty()
        });
        removed
    }
}

pub struct ChangeNotifier {
    state: Arc<Mutex<NotifierState>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    batches: Arc<AtomicU64>,
}

impl ChangeNotifier {
    /// Start the notifier and its delivery worker on the current tokio runtime.
    pub fn start(catalog: BranchCatalog, config: &NotifierConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| BranchError::Runtime(format!("notifier needs a tokio runtime: {}", e)))?;
        let state = Arc::new(Mutex::new(NotifierState {
            catalog,
            tip_owners: HashMap::new(),
            subscriptions: HashMap::new(),
        }));
        let batches = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = runtime.spawn(run_worker(
            rx,
            state.clone(),
            config.flush_delay(),
            batches.clone(),
        ));
        info!("Change notifier started (flush delay {:?})", config.flush_delay());
        Ok(Self {
            state,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            batches,
        })
    }

    pub fn add_branch(&self, info: BranchInfo) -> Result<()> {
        self.state.lock().catalog.add(info)
    }

    /// Branch owning the newest revision of `file_id` as seen from `branch`.
    pub fn tip_owner(&self, branch: BranchId, file_id: FileId) -> Option<BranchId> {
        self.state.lock().tip_owner(branch, file_id)
    }

    /// Record a change and queue notifications. Returns the branches that
    /// were notified, origin first.
    pub fn record(&self, change: FileChange) -> Result<Vec<BranchId>> {
        let fanned = self.state.lock().fan_out(&change)?;
        let sender = self
            .queue
            .lock()
            .clone()
            .ok_or(BranchError::NotifierStopped)?;

        let mut targets = Vec::with_capacity(fanned.len());
        for (branch, notification) in fanned {
            sender
                .send(notification)
                .map_err(|_| BranchError::NotifierStopped)?;
            targets.push(branch);
        }
        debug!(
            "Queued file {} change on branch {} for {} branches",
            change.file_id,
            change.branch,
            targets.len()
        );
        Ok(targets)
    }

    /// Subscribe a client. A second subscription by the same client to the
    /// same key replaces the first.
    pub fn subscribe(&self, key: SubscriptionKey, sink: Arc<dyn NotificationSink>) {
        let mut state = self.state.lock();
        let sinks = state.subscriptions.entry(key).or_default();
        sinks.retain(|s| s.client_id() != sink.client_id());
        sinks.push(sink);
    }

    pub fn unsubscribe(&self, key: &SubscriptionKey, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(sinks) = state.subscriptions.get_mut(key) else {
            return false;
        };
        let before = sinks.len();
        sinks.retain(|s| s.client_id() != client_id);
        let removed = sinks.len() != before;
        if sinks.is_empty() {
            state.subscriptions.remove(key);
        }
        removed
    }

    /// Drop a client from every subscription. Returns how many were removed.
    pub fn remove_client(&self, client_id: &str) -> usize {
        self.state.lock().remove_client(client_id)
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Number of batches the worker has delivered.
    pub fn batches_delivered(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Stop accepting changes and wait until everything queued is delivered.
    pub async fn shutdown(&self) {
        self.queue.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Notifier worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    state: Arc<Mutex<NotifierState>>,
    delay: Duration,
    batches: Arc<AtomicU64>,
) {
    while let Some(first) = rx.recv().await {
        tokio::time::sleep(delay).await;
        let mut pending = vec![first];
        while let Ok(next) = rx.try_recv() {
            pending.push(next);
        }
        deliver(&state, pending).await;
        batches.fetch_add(1, Ordering::SeqCst);
    }
    debug!("Notifier worker stopped");
}

async fn deliver(state: &Mutex<NotifierState>, pending: Vec<Notification>) {
    let mut grouped: Vec<(SubscriptionKey, Vec<Notification>)> = Vec::new();
    for notification in pending {
        match grouped.iter_mut().find(|(key, _)| *key == notification.key) {
            Some((_, batch)) => batch.push(notification),
            None => grouped.push((notification.key.clone(), vec![notification])),
        }
    }

    let mut failed: HashSet<String> = HashSet::new();
    for (key, batch) in grouped {
        let sinks = state
            .lock()
            .subscriptions
            .get(&key)
            .cloned()
            .unwrap_or_default();
        for sink in sinks {
            if failed.contains(sink.client_id()) {
                continue;
            }
            if let Err(e) = sink.deliver(&batch).await {
                warn!("Dropping client {}: {:#}", sink.client_id(), e);
                failed.insert(sink.client_id().to_string());
            }
        }
    }

    if !failed.is_empty() {
        let mut state = state.lock();
        for client_id in &failed {
            state.remove_client(client_id);
        }
    }
}
