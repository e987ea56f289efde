//! Mutation notifications
//!
//! Listeners are invoked synchronously after a mutation has been committed
//! and the archive lock released. Publishing iterates over a snapshot of the
//! list, so a listener may add or remove listeners (itself included) while
//! being notified.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Change recorded against one branch only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchChange {
    Rename { old_name: String, new_name: String },
    Move { old_directory: PathBuf, new_directory: PathBuf },
    Delete,
}

/// What happened to an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveAction {
    CheckIn { revision: String, description: String },
    CheckOut { revision: String, locked: bool },
    Lock { revision: String },
    Unlock { revision: String, broken: bool },
    Label { label: String, revision: String, floating: bool },
    UnLabel { label: String },
    Create { revision: String },
    Remove { cemetery_path: PathBuf },
    Rename { new_path: PathBuf },
    MoveFile { new_path: PathBuf },
    ChangeOnBranch { branch: String, change: BranchChange },
}

#[derive(Debug, Clone)]
pub struct ArchiveEvent {
    /// Archive path at the time of the mutation (the old path for moves).
    pub archive: PathBuf,
    pub action: ArchiveAction,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

impl ArchiveEvent {
    pub fn new(archive: PathBuf, action: ArchiveAction, user: &str) -> Self {
        Self {
            archive,
            action,
            user: user.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of archive mutation events.
pub trait ArchiveListener: Send + Sync {
    fn notify(&self, event: &ArchiveEvent) -> anyhow::Result<()>;
}

/// Handle returned by [`ListenerList::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerList {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ArchiveListener>)>>,
}

impl ListenerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ArchiveListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener. Failures are logged and skipped.
    pub fn publish(&self, event: &ArchiveEvent) {
        let snapshot: Vec<Arc<dyn ArchiveListener>> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            if let Err(e) = listener.notify(event) {
                tracing::warn!(
                    "Listener failed for {:?} on {:?}: {}",
                    event.action,
                    event.archive,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        events: Mutex<Vec<ArchiveAction>>,
    }

    impl ArchiveListener for Recorder {
        fn notify(&self, event: &ArchiveEvent) -> anyhow::Result<()> {
            self.events.lock().push(event.action.clone());
            Ok(())
        }
    }

    struct Failing;

    impl ArchiveListener for Failing {
        fn notify(&self, _event: &ArchiveEvent) -> anyhow::Result<()> {
            anyhow::bail!("listener offline")
        }
    }

    /// Removes itself on first notification.
    struct OneShot {
        list: Arc<ListenerList>,
        id: Mutex<Option<ListenerId>>,
        calls: AtomicU64,
    }

    impl ArchiveListener for OneShot {
        fn notify(&self, _event: &ArchiveEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.lock().take() {
                self.list.remove(id);
            }
            Ok(())
        }
    }

    fn event(action: ArchiveAction) -> ArchiveEvent {
        ArchiveEvent::new(PathBuf::from("foo.txt"), action, "alice")
    }

    #[test]
    fn test_publish_reaches_all_and_survives_failures() {
        let list = ListenerList::new();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        list.add(Arc::new(Failing));
        list.add(recorder.clone());

        list.publish(&event(ArchiveAction::Lock {
            revision: "1.0".to_string(),
        }));
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn test_remove_during_publish() {
        let list = Arc::new(ListenerList::new());
        let one_shot = Arc::new(OneShot {
            list: list.clone(),
            id: Mutex::new(None),
            calls: AtomicU64::new(0),
        });
        let id = list.add(one_shot.clone());
        *one_shot.id.lock() = Some(id);

        list.publish(&event(ArchiveAction::UnLabel {
            label: "REL1".to_string(),
        }));
        list.publish(&event(ArchiveAction::UnLabel {
            label: "REL2".to_string(),
        }));
        assert_eq!(one_shot.calls.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let list = ListenerList::new();
        let id = list.add(Arc::new(Failing));
        assert!(list.remove(id));
        assert!(!list.remove(id));
    }
}
