// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File identity registry: the sandbox directory tree
//!
//! Every file node carries the [`FileIdentity`] it was born with. Identities are
//! never reused, so a file that is removed and created again under the same path
//! is a different file.

use std::collections::{BTreeMap, HashMap};

use crate::error::{FsError, FsResult};
use crate::{DirEntry, FileIdentity};

const ROOT: u64 = 0;

#[derive(Clone, Debug)]
enum NodeKind {
    File,
    Directory { children: BTreeMap<String, u64> },
}

#[derive(Clone, Debug)]
struct Node {
    kind: NodeKind,
}

/// Split a sandbox path into its components.
///
/// Paths are `/`-separated and always relative to the sandbox root; a leading
/// `/`, repeated separators and `.` components are ignored.
pub(crate) fn split_path(path: &str) -> FsResult<Vec<&str>> {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(FsError::InvalidName),
            name if name.contains(['\\', '\0']) => return Err(FsError::InvalidName),
            name => components.push(name),
        }
    }
    Ok(components)
}

/// In-memory directory tree mapping paths to file identities
#[derive(Debug)]
pub struct Registry {
    nodes: HashMap<u64, Node>,
    next_id: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT,
            Node {
                kind: NodeKind::Directory {
                    children: BTreeMap::new(),
                },
            },
        );
        Self { nodes, next_id: 1 }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn children(&self, id: u64) -> FsResult<&BTreeMap<String, u64>> {
        match &self.nodes.get(&id).ok_or(FsError::NotFound)?.kind {
            NodeKind::Directory { children } => Ok(children),
            NodeKind::File => Err(FsError::NotADirectory),
        }
    }

    fn children_mut(&mut self, id: u64) -> FsResult<&mut BTreeMap<String, u64>> {
        match &mut self.nodes.get_mut(&id).ok_or(FsError::NotFound)?.kind {
            NodeKind::Directory { children } => Ok(children),
            NodeKind::File => Err(FsError::NotADirectory),
        }
    }

    fn walk(&self, components: &[&str]) -> FsResult<u64> {
        let mut current = ROOT;
        for name in components {
            current = *self.children(current)?.get(*name).ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    fn is_dir(&self, id: u64) -> bool {
        matches!(self.nodes.get(&id).map(|n| &n.kind), Some(NodeKind::Directory { .. }))
    }

    /// Resolve a path to the identity of the file stored there.
    pub fn resolve(&self, path: &str) -> FsResult<FileIdentity> {
        let id = self.walk(&split_path(path)?)?;
        if self.is_dir(id) {
            return Err(FsError::IsADirectory);
        }
        Ok(FileIdentity(id))
    }

    /// Create a directory if it does not exist yet. The parent must exist.
    pub fn create_directory(&mut self, path: &str) -> FsResult<()> {
        let components = split_path(path)?;
        let Some((name, parent_path)) = components.split_last() else {
            return Ok(());
        };
        let parent = self.walk(parent_path)?;
        if let Some(&existing) = self.children(parent)?.get(*name) {
            return if self.is_dir(existing) {
                Ok(())
            } else {
                Err(FsError::NotADirectory)
            };
        }
        let id = self.allocate_id();
        self.nodes.insert(
            id,
            Node {
                kind: NodeKind::Directory {
                    children: BTreeMap::new(),
                },
            },
        );
        self.children_mut(parent)?.insert((*name).to_string(), id);
        Ok(())
    }

    /// Get or create the file at `path`. Returns the identity and whether it was created.
    pub fn create_file(&mut self, path: &str) -> FsResult<(FileIdentity, bool)> {
        let components = split_path(path)?;
        let (name, parent_path) = components.split_last().ok_or(FsError::IsADirectory)?;
        let parent = self.walk(parent_path)?;
        if let Some(&existing) = self.children(parent)?.get(*name) {
            if self.is_dir(existing) {
                return Err(FsError::IsADirectory);
            }
            return Ok((FileIdentity(existing), false));
        }
        let id = self.allocate_id();
        self.nodes.insert(id, Node { kind: NodeKind::File });
        self.children_mut(parent)?.insert((*name).to_string(), id);
        Ok((FileIdentity(id), true))
    }

    /// Collect every file identity at or below `id`.
    fn files_below(&self, id: u64, out: &mut Vec<FileIdentity>) {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::File) => out.push(FileIdentity(id)),
            Some(NodeKind::Directory { children }) => {
                for &child in children.values() {
                    self.files_below(child, out);
                }
            }
            None => {}
        }
    }

    fn drop_subtree(&mut self, id: u64) {
        if let Some(Node {
            kind: NodeKind::Directory { children },
        }) = self.nodes.remove(&id)
        {
            for child in children.into_values() {
                self.drop_subtree(child);
            }
        }
    }

    /// Remove the entry at `path`.
    ///
    /// A non-empty directory is only removed when `recursive` is set. Nothing is
    /// removed if `is_locked` reports any affected file as locked. Returns the
    /// identities of the removed files.
    pub fn remove_entry(
        &mut self,
        path: &str,
        recursive: bool,
        is_locked: impl Fn(FileIdentity) -> bool,
    ) -> FsResult<Vec<FileIdentity>> {
        let components = split_path(path)?;
        let (name, parent_path) = components.split_last().ok_or(FsError::InvalidArgument)?;
        let parent = self.walk(parent_path)?;
        let id = *self.children(parent)?.get(*name).ok_or(FsError::NotFound)?;

        if !recursive && self.is_dir(id) && !self.children(id)?.is_empty() {
            return Err(FsError::InvalidArgument);
        }

        let mut removed = Vec::new();
        self.files_below(id, &mut removed);
        if removed.iter().any(|&file| is_locked(file)) {
            return Err(FsError::Conflict);
        }

        self.children_mut(parent)?.remove(*name);
        self.drop_subtree(id);
        Ok(removed)
    }

    pub fn list_directory(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let id = self.walk(&split_path(path)?)?;
        Ok(self
            .children(id)?
            .iter()
            .map(|(name, &child)| DirEntry {
                name: name.clone(),
                is_dir: self.is_dir(child),
            })
            .collect())
    }

    /// Number of (files, directories), the root directory included.
    pub fn counts(&self) -> (u32, u32) {
        let dirs = self.nodes.keys().filter(|&&id| self.is_dir(id)).count() as u32;
        (self.nodes.len() as u32 - dirs, dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_paths_resolve_to_one_identity() {
        let mut registry = Registry::new();
        registry.create_directory("dir").unwrap();
        let (id, created) = registry.create_file("dir/OPFS.test").unwrap();
        assert!(created);

        for path in ["dir/OPFS.test", "/dir/OPFS.test", "./dir//OPFS.test", "dir/./OPFS.test/"] {
            assert_eq!(registry.resolve(path).unwrap(), id, "{path}");
        }

        let (again, created) = registry.create_file("/dir/OPFS.test").unwrap();
        assert_eq!(again, id);
        assert!(!created);
    }

    #[test]
    fn resolve_missing_file_is_not_found() {
        let registry = Registry::new();
        assert!(matches!(registry.resolve("missing"), Err(FsError::NotFound)));
        assert!(matches!(registry.resolve("a/b"), Err(FsError::NotFound)));
    }

    #[test]
    fn type_mismatches() {
        let mut registry = Registry::new();
        registry.create_directory("d").unwrap();
        registry.create_file("f").unwrap();

        assert!(matches!(registry.resolve("d"), Err(FsError::IsADirectory)));
        assert!(matches!(registry.resolve("/"), Err(FsError::IsADirectory)));
        assert!(matches!(registry.create_file("d"), Err(FsError::IsADirectory)));
        assert!(matches!(registry.create_directory("f"), Err(FsError::NotADirectory)));
        assert!(matches!(registry.resolve("f/x"), Err(FsError::NotADirectory)));
    }

    #[test]
    fn rejects_escaping_names() {
        let mut registry = Registry::new();
        assert!(matches!(registry.create_file("../etc"), Err(FsError::InvalidName)));
        assert!(matches!(registry.create_file("a\\b"), Err(FsError::InvalidName)));
        assert!(matches!(registry.resolve("x/../y"), Err(FsError::InvalidName)));
    }

    #[test]
    fn removed_and_recreated_file_gets_new_identity() {
        let mut registry = Registry::new();
        let (first, _) = registry.create_file("f").unwrap();
        assert_eq!(registry.remove_entry("f", false, |_| false).unwrap(), vec![first]);
        assert!(matches!(registry.resolve("f"), Err(FsError::NotFound)));

        let (second, created) = registry.create_file("f").unwrap();
        assert!(created);
        assert_ne!(first, second);
    }

    #[test]
    fn remove_respects_locks_and_recursion() {
        let mut registry = Registry::new();
        registry.create_directory("d").unwrap();
        registry.create_directory("d/e").unwrap();
        let (locked, _) = registry.create_file("d/e/f").unwrap();

        assert!(matches!(registry.remove_entry("d", false, |_| false), Err(FsError::InvalidArgument)));
        assert!(matches!(
            registry.remove_entry("d", true, |id| id == locked),
            Err(FsError::Conflict)
        ));
        assert_eq!(registry.resolve("d/e/f").unwrap(), locked);

        assert_eq!(registry.remove_entry("d", true, |_| false).unwrap(), vec![locked]);
        assert_eq!(registry.counts(), (0, 1));
        assert!(matches!(registry.remove_entry("/", true, |_| false), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn lists_sorted_entries() {
        let mut registry = Registry::new();
        registry.create_file("b").unwrap();
        registry.create_directory("a").unwrap();
        let entries = registry.list_directory("/").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "a".into(), is_dir: true },
                DirEntry { name: "b".into(), is_dir: false },
            ]
        );
        assert!(matches!(registry.list_directory("b"), Err(FsError::NotADirectory)));
    }
}
