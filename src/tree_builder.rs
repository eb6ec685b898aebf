/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Mutable, lazily loaded mirror of a git tree.
//!
//! Directories live in an arena and refer to each other through indices;
//! entries marked with an empty mode are deletions that get pruned when
//! the containing tree is written out. Entries are kept in whatever
//! order mutations leave them in and sorted at store time, like
//! fast-import does.

use crate::git::{
    cmp_leaf_name, write_tree_entry, FileMode, GitObjectId, ObjectType, TreeEntry, TreeId, TreeIter,
};
use crate::odb::{Odb, ObjectReference};
use crate::oid::ObjectId;
use crate::util::{die, ImmutBString, ToBoxed};

pub struct Entry {
    pub name: ImmutBString,
    pub mode: FileMode,
    pub oid: GitObjectId,
    pub tree: Option<usize>,
}

pub struct TreeNode {
    pub entries: Vec<Entry>,
    pub dirty: bool,
    // The oid this directory had when it was loaded or last stored.
    stored_oid: TreeId,
}

impl Default for TreeNode {
    fn default() -> TreeNode {
        TreeNode {
            entries: Vec::new(),
            dirty: false,
            stored_oid: TreeId::NULL,
        }
    }
}

pub struct TreeBuilder {
    nodes: Vec<TreeNode>,
    root_oid: TreeId,
}

pub const ROOT: usize = 0;

impl TreeBuilder {
    pub fn new(odb: &Odb, tree: Option<TreeId>) -> TreeBuilder {
        let mut builder = TreeBuilder {
            nodes: Vec::new(),
            root_oid: tree.unwrap_or(TreeId::NULL),
        };
        let root = match tree {
            Some(tree) if !tree.is_null() => builder.load_node(odb, tree),
            _ => builder.alloc_node(),
        };
        assert_eq!(root, ROOT);
        builder
    }

    pub fn root_oid(&self) -> TreeId {
        self.root_oid
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut TreeNode {
        &mut self.nodes[idx]
    }

    fn alloc_node(&mut self) -> usize {
        self.nodes.push(TreeNode::default());
        self.nodes.len() - 1
    }

    fn load_node(&mut self, odb: &Odb, tree: TreeId) -> usize {
        let (typ, buf) = odb
            .read_object(tree.into())
            .unwrap_or_else(|| die!("Missing tree {}", tree));
        if typ != ObjectType::Tree {
            die!("Not a tree: {}", tree);
        }
        let entries = TreeIter::new(&buf)
            .map(|TreeEntry { mode, name, oid }| Entry {
                name,
                mode,
                oid,
                tree: None,
            })
            .collect();
        let idx = self.alloc_node();
        self.nodes[idx].entries = entries;
        self.nodes[idx].stored_oid = tree;
        idx
    }

    /// Loads the subtree behind entry `n` of `node`, if not done yet,
    /// and returns its node index.
    pub fn load_entry_tree(&mut self, odb: &Odb, node: usize, n: usize) -> usize {
        if let Some(tree) = self.nodes[node].entries[n].tree {
            return tree;
        }
        let oid = self.nodes[node].entries[n].oid;
        let tree = if oid.is_null() {
            self.alloc_node()
        } else {
            self.load_node(odb, TreeId::from_unchecked(oid))
        };
        self.nodes[node].entries[n].tree = Some(tree);
        tree
    }

    fn find_entry(&self, node: usize, name: &[u8]) -> Option<usize> {
        self.nodes[node].entries.iter().position(|e| &*e.name == name)
    }

    /// Sets the entry at a slash-separated path, creating intermediate
    /// directories as needed.
    pub fn set(&mut self, odb: &Odb, path: &[u8], oid: GitObjectId, mode: FileMode) {
        let mut node = ROOT;
        let mut components = path.split(|&b| b == b'/').peekable();
        while let Some(name) = components.next() {
            self.nodes[node].dirty = true;
            let pos = self.find_entry(node, name);
            if components.peek().is_none() {
                match pos {
                    Some(n) => {
                        let entry = &mut self.nodes[node].entries[n];
                        entry.mode = mode;
                        entry.oid = oid;
                        entry.tree = None;
                    }
                    None => self.nodes[node].entries.push(Entry {
                        name: name.to_boxed(),
                        mode,
                        oid,
                        tree: None,
                    }),
                }
                return;
            }
            let n = match pos {
                Some(n) => n,
                None => {
                    self.nodes[node].entries.push(Entry {
                        name: name.to_boxed(),
                        mode: FileMode::DIRECTORY,
                        oid: GitObjectId::NULL,
                        tree: None,
                    });
                    self.nodes[node].entries.len() - 1
                }
            };
            if !self.nodes[node].entries[n].mode.is_dir() {
                // A file entry in the way of a directory path gets
                // replaced.
                let entry = &mut self.nodes[node].entries[n];
                entry.mode = FileMode::DIRECTORY;
                entry.oid = GitObjectId::NULL;
                entry.tree = None;
            }
            node = self.load_entry_tree(odb, node, n);
            self.nodes[node].dirty = true;
        }
    }

    /// Removes the entry at a slash-separated path. Directories left
    /// empty are removed as well. Returns whether anything was removed.
    pub fn remove(&mut self, odb: &Odb, path: &[u8]) -> bool {
        self.remove_in(odb, ROOT, path)
    }

    fn remove_in(&mut self, odb: &Odb, node: usize, path: &[u8]) -> bool {
        let (name, rest) = match path.iter().position(|&b| b == b'/') {
            Some(slash) => (&path[..slash], Some(&path[slash + 1..])),
            None => (path, None),
        };
        let Some(n) = self.find_entry(node, name) else {
            return false;
        };
        match rest {
            Some(rest) => {
                if !self.nodes[node].entries[n].mode.is_dir() {
                    return false;
                }
                let child = self.load_entry_tree(odb, node, n);
                if !self.remove_in(odb, child, rest) {
                    return false;
                }
                self.nodes[node].dirty = true;
                let entry = &mut self.nodes[node].entries[n];
                entry.oid = GitObjectId::NULL;
                if self.nodes[child].entries.is_empty() {
                    self.nodes[node].entries.remove(n);
                }
                true
            }
            None => {
                self.nodes[node].entries.remove(n);
                self.nodes[node].dirty = true;
                true
            }
        }
    }

    /// Writes out all modified directories, bottom-up, and returns the
    /// root tree oid. Unmodified subtrees keep their existing oid; each
    /// rewritten tree is deltified against its previous version when
    /// that version is in the current pack.
    pub fn store(&mut self, odb: &mut Odb) -> TreeId {
        if !self.nodes[ROOT].dirty && !self.root_oid.is_null() {
            return self.root_oid;
        }
        let root = self.store_node(odb, ROOT);
        self.root_oid = root;
        root
    }

    fn store_node(&mut self, odb: &mut Odb, idx: usize) -> TreeId {
        for n in 0..self.nodes[idx].entries.len() {
            let Some(child) = self.nodes[idx].entries[n].tree else {
                continue;
            };
            if self.nodes[child].dirty {
                let oid = self.store_node(odb, child);
                self.nodes[idx].entries[n].oid = oid.into();
            }
        }
        let node = &mut self.nodes[idx];
        node.entries.retain(|e| e.mode != FileMode::EMPTY);
        node.entries
            .sort_by(|a, b| cmp_leaf_name(&a.name, a.mode.is_dir(), &b.name, b.mode.is_dir()));
        let mut buf = Vec::new();
        for entry in &node.entries {
            write_tree_entry(&mut buf, entry.mode, &entry.name, entry.oid);
        }
        let reference_oid = node.stored_oid;
        let reference = (!reference_oid.is_null())
            .then(|| odb.find_object(reference_oid.into()))
            .flatten()
            .filter(|e| e.offset > 1 && e.pack_id == odb.pack_id());
        let reference_buf = reference.as_ref().map(|e| odb.unpack_entry(e));
        let result = TreeId::from_unchecked(odb.store_object(
            ObjectType::Tree,
            &buf,
            reference_buf
                .as_ref()
                .zip(reference)
                .map(|(data, e)| ObjectReference {
                    offset: e.offset,
                    depth: e.depth,
                    data,
                })
                .as_ref(),
        ));
        let node = &mut self.nodes[idx];
        node.stored_oid = result;
        node.dirty = false;
        result
    }

    /// Calls `f` with the full path, mode and oid of every file entry,
    /// in stored order, loading subtrees as needed.
    pub fn for_each_file(
        &mut self,
        odb: &Odb,
        f: &mut impl FnMut(&[u8], FileMode, GitObjectId),
    ) {
        let mut path = Vec::new();
        self.for_each_file_in(odb, ROOT, &mut path, f);
    }

    fn for_each_file_in(
        &mut self,
        odb: &Odb,
        node: usize,
        path: &mut Vec<u8>,
        f: &mut impl FnMut(&[u8], FileMode, GitObjectId),
    ) {
        for n in 0..self.nodes[node].entries.len() {
            let entry = &self.nodes[node].entries[n];
            if entry.mode == FileMode::EMPTY {
                continue;
            }
            let len = path.len();
            if !path.is_empty() {
                path.push(b'/');
            }
            path.extend_from_slice(&self.nodes[node].entries[n].name);
            if self.nodes[node].entries[n].mode.is_dir() {
                let child = self.load_entry_tree(odb, node, n);
                self.for_each_file_in(odb, child, path, f);
            } else {
                let entry = &self.nodes[node].entries[n];
                f(path, entry.mode, entry.oid);
            }
            path.truncate(len);
        }
    }
}

/// Resolves a slash-separated path within a stored tree.
pub fn get_tree_entry(
    odb: &Odb,
    tree: TreeId,
    path: &[u8],
) -> Option<(FileMode, GitObjectId)> {
    let mut oid = GitObjectId::from(tree);
    let mut mode = FileMode::DIRECTORY;
    for name in path.split(|&b| b == b'/') {
        if name.is_empty() {
            continue;
        }
        if !mode.is_dir() {
            return None;
        }
        let (typ, buf) = odb.read_object(oid)?;
        if typ != ObjectType::Tree {
            return None;
        }
        let entry = TreeIter::new(&buf).find(|e| &*e.name == name)?;
        oid = entry.oid;
        mode = entry.mode;
    }
    Some((mode, oid))
}

/// Iterator state for the byte-counting walk used by the tree-walk
/// manifest strategy: advancing by N bytes of textual manifest without
/// building the text.
pub struct ManifestWalk {
    stack: Vec<WalkFrame>,
    frame: WalkFrame,
    prefix_len: usize,
}

struct WalkFrame {
    node: usize,
    next_entry: usize,
    // Number of entries that have been seen and weren't removed.
    remaining: usize,
    modified: bool,
}

impl WalkFrame {
    fn new(node: usize) -> WalkFrame {
        WalkFrame {
            node,
            next_entry: 0,
            remaining: 0,
            modified: false,
        }
    }
}

pub const NO_DELETE: bool = false;
pub const DELETE: bool = true;

impl ManifestWalk {
    pub fn new() -> ManifestWalk {
        ManifestWalk {
            stack: Vec::new(),
            frame: WalkFrame::new(ROOT),
            prefix_len: 0,
        }
    }

    fn enter_dir(&mut self, builder: &mut TreeBuilder, odb: &Odb, n: usize) {
        let node = self.frame.node;
        // Because the file names are prefixed with _, their length
        // accounts for the terminal nul or slash of the real path name.
        self.prefix_len += builder.node(node).entries[n].name.len();
        let child = builder.load_entry_tree(odb, node, n);
        self.stack.push(std::mem::replace(&mut self.frame, WalkFrame::new(child)));
    }

    fn leave_dir(&mut self, builder: &mut TreeBuilder) -> bool {
        let Some(parent) = self.stack.pop() else {
            if self.frame.modified {
                builder.node_mut(self.frame.node).dirty = true;
            }
            return false;
        };
        let child = std::mem::replace(&mut self.frame, parent);
        let n = self.frame.next_entry - 1;
        let node = self.frame.node;
        self.prefix_len -= builder.node(node).entries[n].name.len();
        if child.modified {
            builder.node_mut(child.node).dirty = true;
            let entry = &mut builder.node_mut(node).entries[n];
            entry.oid = GitObjectId::NULL;
            if child.remaining == 0 {
                entry.mode = FileMode::EMPTY;
                entry.tree = None;
            }
            self.frame.modified = true;
        }
        if child.remaining > 0 {
            self.frame.remaining += 1;
        }
        true
    }

    /// Walks forward over as many entries as it takes to produce
    /// `length` bytes of textual manifest, removing the visited files
    /// when `delete` is set. Fails if `length` does not fall exactly on
    /// an entry boundary.
    pub fn advance(
        &mut self,
        builder: &mut TreeBuilder,
        odb: &Odb,
        mut length: usize,
        delete: bool,
    ) -> bool {
        while length > 0 {
            let node = self.frame.node;
            let n = self.frame.next_entry;
            if n >= builder.node(node).entries.len() {
                if !self.leave_dir(builder) {
                    return false;
                }
                continue;
            }
            self.frame.next_entry += 1;
            if builder.node(node).entries[n].mode.is_dir() {
                self.enter_dir(builder, odb, n);
                continue;
            }
            let entry = &builder.node(node).entries[n];
            let mut line_len = self.prefix_len + entry.name.len();
            // sha1
            line_len += 40;
            // manifest line attribute is empty for regular files, and
            // has a length of 1 for other types.
            if entry.mode.perms() != 0o644 {
                line_len += 1;
            }
            // newline
            line_len += 1;
            if length < line_len {
                return false;
            }
            if delete {
                let entry = &mut builder.node_mut(node).entries[n];
                entry.mode = FileMode::EMPTY;
                entry.oid = GitObjectId::NULL;
                entry.tree = None;
                self.frame.modified = true;
            } else {
                self.frame.remaining += 1;
            }
            length -= line_len;
        }
        true
    }

    /// Drains the iterator, propagating modification state up to the
    /// root.
    pub fn finish(mut self, builder: &mut TreeBuilder) {
        loop {
            let node = self.frame.node;
            let count = builder.node(node).entries.len();
            self.frame.remaining += count - self.frame.next_entry;
            self.frame.next_entry = count;
            if !self.leave_dir(builder) {
                break;
            }
        }
    }
}
