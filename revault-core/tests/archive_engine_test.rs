//! Archive engine integration tests
//!
//! Exercise the public surface end to end: registry handles, controller
//! check-ins, branch views and on-disk recovery files.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use revault_core::archive::rollback_path;
use revault_core::{
    ArchiveAction, ArchiveEvent, ArchiveListener, ArchiveRegistry, BranchChange, BranchKind,
    CheckInArgs, EditArgs, EngineConfig, GetRevisionArgs, LabelArgs, LockArgs, RevisionSelector,
    UnLabelArgs, ViewKey,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry(tmp: &TempDir) -> ArchiveRegistry {
    init_tracing();
    ArchiveRegistry::new(Arc::new(EngineConfig::rooted_at(tmp.path())))
}

fn commit(registry: &ArchiveRegistry, path: &Path, content: &[u8], at: DateTime<Utc>) -> String {
    let mut args = CheckInArgs::new("alice", "change");
    args.checkin_date = Some(at);
    assert!(
        registry.open(path).check_in_content(&mut args, content, true).unwrap(),
        "{:?}",
        args.failure_reason
    );
    args.new_revision.unwrap()
}

fn fetch(view: &revault_core::BranchView, selector: RevisionSelector) -> Option<Vec<u8>> {
    let mut args = GetRevisionArgs::new(selector);
    view.fetch(&mut args).unwrap().map(|b| b.to_vec())
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ArchiveEvent>>,
}

impl ArchiveListener for Recorder {
    fn notify(&self, event: &ArchiveEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[test]
fn test_label_and_date_view() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");

    assert_eq!(commit(&registry, &path, b"A", t(0)), "1.0");
    assert_eq!(commit(&registry, &path, b"AB", t(10)), "1.1");

    let controller = registry.open(&path);
    let mut label = LabelArgs::new("alice", "REL1", Some("1.1"));
    assert!(controller.label_revision(&mut label).unwrap());

    let kind = BranchKind::ReadOnlyDate {
        anchor: t(15),
        branch_point: None,
    };
    let view = registry
        .view(ViewKey::new("proj", "rel", &path), kind)
        .unwrap();
    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.1"));

    let mut by_label = GetRevisionArgs::new(RevisionSelector::Label("REL1".to_string()));
    assert_eq!(view.fetch(&mut by_label).unwrap().unwrap().as_ref(), b"AB");
    assert_eq!(
        fetch(&view, RevisionSelector::Revision("1.0".to_string())).as_deref(),
        Some(&b"A"[..])
    );

    // Trunk moves on; the date view does not.
    commit(&registry, &path, b"ABC", t(20));
    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.1"));
    assert_eq!(fetch(&view, RevisionSelector::Revision("1.2".to_string())), None);
}

#[test]
fn test_content_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("data.bin");
    let contents: Vec<Vec<u8>> = (0..12u8)
        .map(|i| {
            let mut body: Vec<u8> = (0..2048u32).map(|j| (j % 251) as u8).collect();
            body[i as usize * 7] = i;
            body.truncate(1500 + i as usize * 40);
            body
        })
        .collect();

    {
        let registry = registry(&tmp);
        for (i, body) in contents.iter().enumerate() {
            commit(&registry, &path, body, t(i as i64));
        }
    }

    let registry = registry(&tmp);
    let controller = registry.open(&path);
    controller.verify().unwrap();
    for (i, body) in contents.iter().enumerate() {
        let mut args = GetRevisionArgs::new(RevisionSelector::Revision(format!("1.{}", i)));
        assert_eq!(controller.fetch(&mut args).unwrap().unwrap().as_ref(), &body[..]);
    }
}

#[test]
fn test_single_trunk_tip() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");
    for i in 0..5 {
        commit(&registry, &path, format!("v{}", i).as_bytes(), t(i));
    }
    let trunk_tips: Vec<String> = registry
        .open(&path)
        .revisions()
        .unwrap()
        .iter()
        .filter(|r| r.is_tip && r.depth() == 0)
        .map(|r| r.revision_string())
        .collect();
    assert_eq!(trunk_tips, vec!["1.4".to_string()]);
}

#[test]
fn test_translucent_branch_commits() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");
    commit(&registry, &path, b"A", t(0));

    let kind = BranchKind::Translucent {
        name: "feature".to_string(),
    };
    let view = registry
        .view(ViewKey::new("proj", "feature", &path), kind)
        .unwrap();
    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.0"));

    // Unchanged on the branch: trunk commits show through.
    commit(&registry, &path, b"AB", t(5));
    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.1"));

    let mut args = CheckInArgs::new("bob", "branch work");
    assert!(view.check_in_revision(&mut args, b"AB-feature").unwrap());
    assert_eq!(args.new_revision.as_deref(), Some("1.1.1.0"));
    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.1.1.0"));

    let mut args = CheckInArgs::new("bob", "more branch work");
    assert!(view.check_in_revision(&mut args, b"AB-feature-2").unwrap());
    assert_eq!(args.new_revision.as_deref(), Some("1.1.1.1"));

    // Once changed on the branch, trunk commits no longer show through.
    commit(&registry, &path, b"ABC", t(10));
    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.1.1.1"));
    assert_eq!(
        fetch(&view, RevisionSelector::Default).as_deref(),
        Some(&b"AB-feature-2"[..])
    );

    let trunk = registry.open(&path);
    let mut trunk_args = GetRevisionArgs::new(RevisionSelector::Default);
    assert_eq!(trunk.fetch(&mut trunk_args).unwrap().unwrap().as_ref(), b"ABC");

    // Branch bookkeeping labels cannot be touched through the view.
    let mut unlabel = UnLabelArgs {
        user: "bob".to_string(),
        label: "BRANCH:feature".to_string(),
        failure_reason: None,
    };
    assert!(!view.un_label_revision(&mut unlabel).unwrap());
}

#[test]
fn test_branch_overlay_events() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");
    commit(&registry, &path, b"A", t(0));

    let recorder = Arc::new(Recorder::default());
    registry.open(&path).add_listener(recorder.clone());

    let view = registry
        .view(
            ViewKey::new("proj", "feature", &path),
            BranchKind::Translucent {
                name: "feature".to_string(),
            },
        )
        .unwrap();

    let mut args = EditArgs::new("bob");
    assert!(view.rename_on_branch(&mut args, "bar.txt").unwrap());
    assert_eq!(view.short_name(), "bar.txt");
    assert!(view.delete_on_branch(&mut args).unwrap());
    assert!(fetch(&view, RevisionSelector::Default).is_none());

    // The trunk file is untouched.
    assert!(path.exists());

    let changes: Vec<BranchChange> = recorder
        .events
        .lock()
        .iter()
        .filter_map(|e| match &e.action {
            ArchiveAction::ChangeOnBranch { branch, change } if branch == "feature" => {
                Some(change.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![
            BranchChange::Rename {
                old_name: "foo.txt".to_string(),
                new_name: "bar.txt".to_string(),
            },
            BranchChange::Delete,
        ]
    );
}

#[test]
fn test_read_only_view_rejects_mutations() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");
    commit(&registry, &path, b"A", t(0));

    let view = registry
        .view(
            ViewKey::new("proj", "rel", &path),
            BranchKind::ReadOnlyDate {
                anchor: t(30),
                branch_point: None,
            },
        )
        .unwrap();

    let mut check_in = CheckInArgs::new("alice", "nope");
    assert!(!view.check_in_revision(&mut check_in, b"B").unwrap());
    assert!(check_in.failure_reason.is_some());

    let mut lock = LockArgs::new("alice", None);
    assert!(!view.lock_revision(&mut lock).unwrap());

    let mut label = LabelArgs::new("alice", "REL2", None);
    assert!(!view.label_revision(&mut label).unwrap());

    let mut edit = EditArgs::new("alice");
    assert!(!view.delete_on_branch(&mut edit).unwrap());
    assert!(!view.rename_on_branch(&mut edit, "x.txt").unwrap());

    assert_eq!(registry.open(&path).revisions().unwrap().len(), 1);
}

#[test]
fn test_rollback_copy_kept() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");
    commit(&registry, &path, b"A", t(0));
    let before = std::fs::read(&path).unwrap();

    commit(&registry, &path, b"AB", t(1));
    assert_eq!(std::fs::read(rollback_path(&path)).unwrap(), before);

    let leftovers: Vec<String> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_lock_contention_through_registry() {
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(registry(&tmp));
    let path = tmp.path().join("foo.txt");
    commit(&registry, &path, b"A", t(0));

    let handles: Vec<_> = ["alice", "bob", "carol", "dave"]
        .into_iter()
        .map(|user| {
            let registry = registry.clone();
            let path = path.clone();
            std::thread::spawn(move || {
                let mut args = LockArgs::new(user, None);
                (user, registry.open(&path).lock_revision(&mut args).unwrap())
            })
        })
        .collect();
    let results: HashMap<&str, bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.values().filter(|ok| **ok).count(), 1);

    let winner = results.iter().find(|(_, ok)| **ok).map(|(u, _)| *u).unwrap();
    let tip = registry.open(&path).revisions().unwrap().pop().unwrap();
    assert_eq!(tip.locker.as_deref(), Some(winner));
}

#[test]
fn test_concurrent_branch_check_ins_chain() {
    let tmp = TempDir::new().unwrap();
    let registry = registry(&tmp);
    let path = tmp.path().join("foo.txt");
    commit(&registry, &path, b"A", t(0));

    let view = registry
        .view(
            ViewKey::new("proj", "feature", &path),
            BranchKind::Translucent {
                name: "feature".to_string(),
            },
        )
        .unwrap();
    let mut args = CheckInArgs::new("bob", "open branch");
    assert!(view.check_in_revision(&mut args, b"A-feature").unwrap());
    assert_eq!(args.new_revision.as_deref(), Some("1.0.1.0"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let view = view.clone();
            std::thread::spawn(move || {
                let mut args = CheckInArgs::new("bob", &format!("branch work {}", i));
                let ok = view
                    .check_in_revision(&mut args, format!("A-feature-{}", i).as_bytes())
                    .unwrap();
                (ok, args.new_revision)
            })
        })
        .collect();
    let results: Vec<(bool, Option<String>)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|(ok, _)| *ok), "{:?}", results);

    assert_eq!(view.default_revision().unwrap().as_deref(), Some("1.0.1.8"));
    let snapshot = view.snapshot().unwrap();
    for (_, revision) in &results {
        assert!(snapshot.contains(revision.as_deref().unwrap()), "{:?}", revision);
    }
    let branch_tips = registry
        .open(&path)
        .revisions()
        .unwrap()
        .iter()
        .filter(|r| r.is_tip && r.depth() == 1)
        .count();
    assert_eq!(branch_tips, 1);
}
