//! Branch tree metadata
//!
//! The catalog is supplied by the server layer; it only records which branch
//! derives from which and whether a branch accepts commits. Propagation
//! walks parent links, so branch ids carry no ordering meaning.

use crate::error::{BranchError, Result};
use chrono::{DateTime, Utc};
use revault_core::BranchKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub u32);

impl BranchId {
    pub const TRUNK: BranchId = BranchId(0);
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BranchInfo {
    pub id: BranchId,
    pub name: String,
    /// `None` only for the trunk.
    pub parent: Option<BranchId>,
    pub kind: BranchKind,
    pub created: DateTime<Utc>,
}

impl BranchInfo {
    pub fn new(id: BranchId, name: &str, parent: BranchId, kind: BranchKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent: Some(parent),
            kind,
            created: Utc::now(),
        }
    }

    pub fn is_writable(&self) -> bool {
        !self.kind.is_read_only()
    }
}

#[derive(Debug, Clone)]
pub struct BranchCatalog {
    branches: BTreeMap<BranchId, BranchInfo>,
}

impl Default for BranchCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchCatalog {
    /// Catalog holding only the trunk.
    pub fn new() -> Self {
        let trunk = BranchInfo {
            id: BranchId::TRUNK,
            name: "trunk".to_string(),
            parent: None,
            kind: BranchKind::Trunk,
            created: DateTime::<Utc>::UNIX_EPOCH,
        };
        let mut branches = BTreeMap::new();
        branches.insert(BranchId::TRUNK, trunk);
        Self { branches }
    }

    /// Register a branch. Its parent must already be known.
    pub fn add(&mut self, info: BranchInfo) -> Result<()> {
        if self.branches.contains_key(&info.id) {
            return Err(BranchError::DuplicateBranch(info.id));
        }
        if self.by_name(&info.name).is_some() {
            return Err(BranchError::DuplicateName(info.name));
        }
        match info.parent {
            Some(parent) if self.branches.contains_key(&parent) => {}
            Some(parent) => return Err(BranchError::UnknownBranch(parent)),
            None => return Err(BranchError::DuplicateBranch(BranchId::TRUNK)),
        }
        self.branches.insert(info.id, info);
        Ok(())
    }

    pub fn get(&self, id: BranchId) -> Result<&BranchInfo> {
        self.branches.get(&id).ok_or(BranchError::UnknownBranch(id))
    }

    pub fn by_name(&self, name: &str) -> Option<&BranchInfo> {
        self.branches.values().find(|b| b.name == name)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn children(&self, id: BranchId) -> impl Iterator<Item = &BranchInfo> {
        self.branches.values().filter(move |b| b.parent == Some(id))
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    pub fn ancestors(&self, id: BranchId) -> Vec<BranchId> {
        let mut out = Vec::new();
        let mut current = self.branches.get(&id).and_then(|b| b.parent);
        while let Some(parent) = current {
            if out.contains(&parent) {
                break;
            }
            out.push(parent);
            current = self.branches.get(&parent).and_then(|b| b.parent);
        }
        out
    }

    /// Every branch below `id` in breadth-first order.
    pub fn descendants(&self, id: BranchId) -> Vec<BranchId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<BranchId> = self.children(id).map(|b| b.id).collect();
        while let Some(next) = queue.pop_front() {
            out.push(next);
            queue.extend(self.children(next).map(|b| b.id));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translucent(id: u32, name: &str, parent: u32) -> BranchInfo {
        BranchInfo::new(
            BranchId(id),
            name,
            BranchId(parent),
            BranchKind::Translucent {
                name: name.to_string(),
            },
        )
    }

    #[test]
    fn test_tree_navigation() {
        let mut catalog = BranchCatalog::new();
        // Ids deliberately out of creation order.
        catalog.add(translucent(9, "feature", 0)).unwrap();
        catalog.add(translucent(3, "sub", 9)).unwrap();
        catalog.add(translucent(5, "other", 0)).unwrap();

        assert_eq!(catalog.ancestors(BranchId(3)), vec![BranchId(9), BranchId::TRUNK]);
        assert_eq!(
            catalog.descendants(BranchId::TRUNK),
            vec![BranchId(5), BranchId(9), BranchId(3)]
        );
        assert_eq!(catalog.by_name("sub").unwrap().id, BranchId(3));
    }

    #[test]
    fn test_add_validation() {
        let mut catalog = BranchCatalog::new();
        assert!(matches!(
            catalog.add(translucent(1, "a", 42)),
            Err(BranchError::UnknownBranch(BranchId(42)))
        ));
        catalog.add(translucent(1, "a", 0)).unwrap();
        assert!(matches!(
            catalog.add(translucent(1, "b", 0)),
            Err(BranchError::DuplicateBranch(_))
        ));
        assert!(matches!(
            catalog.add(translucent(2, "a", 0)),
            Err(BranchError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_date_branches_are_read_only() {
        let info = BranchInfo::new(
            BranchId(4),
            "rel",
            BranchId::TRUNK,
            BranchKind::ReadOnlyDate {
                anchor: Utc::now(),
                branch_point: None,
            },
        );
        assert!(!info.is_writable());
        assert!(translucent(1, "a", 0).is_writable());
    }
}
