//! Merge classification
//!
//! Decides how a file diverged between a child branch and its parent since
//! the child was created. Each side is measured against its own location at
//! the branch point, falling back to the other side's when it has no history
//! that far back. Identical divergence on both sides cancels out.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub directory: PathBuf,
    pub name: String,
}

impl FileLocation {
    pub fn new(directory: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            directory: directory.into(),
            name: name.to_string(),
        }
    }
}

/// The file took `location` at `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationChange {
    pub timestamp: DateTime<Utc>,
    pub location: FileLocation,
}

/// One side of the merge: where the file is now and how it got there.
#[derive(Debug, Clone, Default)]
pub struct BranchFile {
    /// `None` when the file is deleted on this branch.
    pub current: Option<FileLocation>,
    /// Chronological; the first entry is the file's creation.
    pub history: Vec<LocationChange>,
}

impl BranchFile {
    pub fn location_at(&self, at: DateTime<Utc>) -> Option<&FileLocation> {
        self.history
            .iter()
            .take_while(|c| c.timestamp <= at)
            .last()
            .map(|c| &c.location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    Simple,
    CreatedOnChild,
    DeletedOnParent,
    DeletedOnChild,

    RenamedOnParent,
    MovedOnParent,
    RenamedAndMovedOnParent,

    RenamedOnChild,
    MovedOnChild,
    RenamedAndMovedOnChild,

    RenamedOnBoth,
    MovedOnBoth,
    RenamedAndMovedOnBoth,
    RenamedOnParentMovedOnChild,
    MovedOnParentRenamedOnChild,
    RenamedAndMovedOnParentRenamedOnChild,
    RenamedAndMovedOnParentMovedOnChild,
    RenamedOnParentRenamedAndMovedOnChild,
    MovedOnParentRenamedAndMovedOnChild,
}

impl MergeType {
    /// Both sides changed the same property to different values.
    pub fn is_conflict(&self) -> bool {
        use MergeType::*;
        matches!(
            self,
            RenamedOnBoth
                | MovedOnBoth
                | RenamedAndMovedOnBoth
                | RenamedAndMovedOnParentRenamedOnChild
                | RenamedAndMovedOnParentMovedOnChild
                | RenamedOnParentRenamedAndMovedOnChild
                | MovedOnParentRenamedAndMovedOnChild
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("file does not exist on the child branch")]
    NotOnChild,

    #[error("file was deleted on both branches")]
    DeletedOnBoth,

    #[error("file was created on the parent after the branch point")]
    CreatedOnParent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Divergence {
    renamed: bool,
    moved: bool,
}

fn divergence(base: &FileLocation, current: &FileLocation) -> Divergence {
    Divergence {
        renamed: base.name != current.name,
        moved: base.directory != current.directory,
    }
}

/// Classify the divergence of `child` from `parent` since `branch_created`.
pub fn classify(
    parent: &BranchFile,
    child: &BranchFile,
    branch_created: DateTime<Utc>,
) -> Result<MergeType, ClassifyError> {
    let parent_base = parent.location_at(branch_created);
    let child_base = child.location_at(branch_created);
    let (parent_base, child_base) = match (parent_base, child_base) {
        (Some(p), Some(c)) => (p, c),
        (Some(p), None) => (p, p),
        (None, Some(c)) => (c, c),
        (None, None) => {
            return match (&parent.current, &child.current) {
                (_, None) => Err(ClassifyError::NotOnChild),
                (None, Some(_)) => Ok(MergeType::CreatedOnChild),
                (Some(_), Some(_)) => Err(ClassifyError::CreatedOnParent),
            };
        }
    };
    let (parent_now, child_now) = match (&parent.current, &child.current) {
        (None, None) => return Err(ClassifyError::DeletedOnBoth),
        (_, None) => return Ok(MergeType::DeletedOnChild),
        (None, _) => return Ok(MergeType::DeletedOnParent),
        (Some(p), Some(c)) => (p, c),
    };

    let mut on_parent = divergence(parent_base, parent_now);
    let mut on_child = divergence(child_base, child_now);
    if on_parent.renamed && on_child.renamed && parent_now.name == child_now.name {
        on_parent.renamed = false;
        on_child.renamed = false;
    }
    if on_parent.moved && on_child.moved && parent_now.directory == child_now.directory {
        on_parent.moved = false;
        on_child.moved = false;
    }

    use MergeType::*;
    let kind = match (
        (on_parent.renamed, on_parent.moved),
        (on_child.renamed, on_child.moved),
    ) {
        ((false, false), (false, false)) => Simple,
        ((true, false), (false, false)) => RenamedOnParent,
        ((false, true), (false, false)) => MovedOnParent,
        ((true, true), (false, false)) => RenamedAndMovedOnParent,
        ((false, false), (true, false)) => RenamedOnChild,
        ((false, false), (false, true)) => MovedOnChild,
        ((false, false), (true, true)) => RenamedAndMovedOnChild,
        ((true, false), (true, false)) => RenamedOnBoth,
        ((false, true), (false, true)) => MovedOnBoth,
        ((true, true), (true, true)) => RenamedAndMovedOnBoth,
        ((true, false), (false, true)) => RenamedOnParentMovedOnChild,
        ((false, true), (true, false)) => MovedOnParentRenamedOnChild,
        ((true, true), (true, false)) => RenamedAndMovedOnParentRenamedOnChild,
        ((true, true), (false, true)) => RenamedAndMovedOnParentMovedOnChild,
        ((true, false), (true, true)) => RenamedOnParentRenamedAndMovedOnChild,
        ((false, true), (true, true)) => MovedOnParentRenamedAndMovedOnChild,
    };
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn file(changes: &[(i64, &str, &str)]) -> BranchFile {
        let history: Vec<LocationChange> = changes
            .iter()
            .map(|(at, dir, name)| LocationChange {
                timestamp: t(*at),
                location: FileLocation::new(*dir, name),
            })
            .collect();
        BranchFile {
            current: history.last().map(|c| c.location.clone()),
            history,
        }
    }

    #[test]
    fn test_unchanged_is_simple() {
        let parent = file(&[(0, "src", "a.rs")]);
        let child = file(&[(0, "src", "a.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::Simple));
    }

    #[test]
    fn test_rename_before_branch_point_is_not_divergence() {
        let parent = file(&[(0, "src", "a.rs"), (5, "src", "b.rs")]);
        let child = file(&[(0, "src", "a.rs"), (5, "src", "b.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::Simple));
    }

    #[test]
    fn test_moved_on_parent_renamed_on_child() {
        let parent = file(&[(0, "src", "a.rs"), (20, "lib", "a.rs")]);
        let child = file(&[(0, "src", "a.rs"), (30, "src", "b.rs")]);
        let kind = classify(&parent, &child, t(10)).unwrap();
        assert_eq!(kind, MergeType::MovedOnParentRenamedOnChild);
        assert!(!kind.is_conflict());
    }

    #[test]
    fn test_identical_divergence_cancels() {
        let parent = file(&[(0, "src", "a.rs"), (20, "src", "b.rs")]);
        let child = file(&[(0, "src", "a.rs"), (25, "src", "b.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::Simple));

        let child = file(&[(0, "src", "a.rs"), (25, "src", "c.rs")]);
        let kind = classify(&parent, &child, t(10)).unwrap();
        assert_eq!(kind, MergeType::RenamedOnBoth);
        assert!(kind.is_conflict());
    }

    #[test]
    fn test_created_and_deleted() {
        let parent = BranchFile::default();
        let child = file(&[(20, "src", "new.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::CreatedOnChild));
        assert_eq!(
            classify(&parent, &BranchFile::default(), t(10)),
            Err(ClassifyError::NotOnChild)
        );

        let parent = file(&[(0, "src", "a.rs")]);
        let mut child = file(&[(0, "src", "a.rs")]);
        child.current = None;
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::DeletedOnChild));

        let mut parent = file(&[(0, "src", "a.rs")]);
        parent.current = None;
        let child = file(&[(0, "src", "a.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::DeletedOnParent));
    }

    #[test]
    fn test_renamed_and_moved_on_child() {
        let parent = file(&[(0, "src", "a.rs")]);
        let child = file(&[(0, "src", "a.rs"), (15, "lib", "b.rs")]);
        assert_eq!(
            classify(&parent, &child, t(10)),
            Ok(MergeType::RenamedAndMovedOnChild)
        );
    }

    #[test]
    fn test_each_side_measured_from_its_own_base() {
        // The child's history records a different location at the branch
        // point; its own move back to src/a.rs is divergence on the child.
        let parent = file(&[(0, "src", "a.rs")]);
        let child = file(&[(0, "old", "a.rs"), (20, "src", "a.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::MovedOnChild));

        let parent = file(&[(0, "old", "a.rs"), (20, "old", "b.rs")]);
        let child = file(&[(0, "src", "a.rs")]);
        assert_eq!(classify(&parent, &child, t(10)), Ok(MergeType::RenamedOnParent));
    }

    #[test]
    fn test_created_on_parent_after_branch_point() {
        let parent = file(&[(20, "src", "late.rs")]);
        let child = file(&[(25, "src", "late.rs")]);
        assert_eq!(
            classify(&parent, &child, t(10)),
            Err(ClassifyError::CreatedOnParent)
        );
    }
}
