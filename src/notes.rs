/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Notes trees: persistent 20-byte-key to oid mappings stored as git
//! trees of trees, fanned out by leading hex digits of the key so that
//! no single tree grows too large.

use std::collections::BTreeMap;

use bstr::ByteSlice;

use crate::git::{write_tree_entry, CommitId, FileMode, GitObjectId, ObjectType, TreeId, TreeIter};
use crate::hg::HgObjectId;
use crate::odb::Odb;
use crate::oid::ObjectId;
use crate::util::die;

pub struct NotesTree {
    notes: BTreeMap<GitObjectId, GitObjectId>,
    dirty: bool,
}

impl NotesTree {
    pub fn new() -> NotesTree {
        NotesTree {
            notes: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Seeds the map from the tree of an existing notes commit.
    pub fn new_with(odb: &Odb, c: CommitId) -> NotesTree {
        let mut result = NotesTree::new();
        if c.is_null() {
            return result;
        }
        let (typ, commit) = odb
            .read_object(c.into())
            .unwrap_or_else(|| die!("Missing notes commit {}", c));
        if typ != ObjectType::Commit {
            die!("Invalid notes commit {}", c);
        }
        let commit = crate::git::RawCommit::from_bytes(commit);
        let commit = commit.parse().unwrap_or_else(|| die!("Invalid commit {}", c));
        result.load_subtree(odb, commit.tree().into(), &mut Vec::new());
        result
    }

    fn load_subtree(&mut self, odb: &Odb, tree: GitObjectId, prefix: &mut Vec<u8>) {
        let (typ, buf) = odb
            .read_object(tree)
            .unwrap_or_else(|| die!("Missing notes tree {}", tree));
        if typ != ObjectType::Tree {
            die!("Invalid notes tree {}", tree);
        }
        for entry in TreeIter::new(&buf) {
            if entry.mode.is_dir() {
                let len = prefix.len();
                prefix.extend_from_slice(&entry.name);
                self.load_subtree(odb, entry.oid, prefix);
                prefix.truncate(len);
            } else {
                let mut hex = prefix.clone();
                hex.extend_from_slice(&entry.name);
                let mut key = [0u8; 20];
                if hex.len() == 40 && hex::decode_to_slice(&hex, &mut key).is_ok() {
                    self.notes
                        .insert(GitObjectId::from_raw_bytes(&key).unwrap(), entry.oid);
                } else {
                    warn!("ignoring non-note entry {}", hex.as_bstr());
                }
            }
        }
    }

    pub fn get_note(&self, key: GitObjectId) -> Option<GitObjectId> {
        self.notes.get(&key).copied()
    }

    pub fn add_note(&mut self, key: GitObjectId, note: GitObjectId) {
        if self.notes.insert(key, note) != Some(note) {
            self.dirty = true;
        }
    }

    pub fn remove_note(&mut self, key: GitObjectId) {
        if self.notes.remove(&key).is_some() {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Writes the map out as a fanned-out tree, all values carrying
    /// `mode`, and returns the root tree oid. Only call when dirty.
    pub fn store_tree(&mut self, odb: &mut Odb, mode: FileMode) -> TreeId {
        let entries = self
            .notes
            .iter()
            .map(|(key, value)| {
                let mut hex = [0u8; 40];
                hex::encode_to_slice(key.as_raw_bytes(), &mut hex).unwrap();
                (hex, *value)
            })
            .collect::<Vec<_>>();
        let result = write_fanout_tree(odb, &entries, 0, mode);
        self.dirty = false;
        result
    }
}

fn write_fanout_tree(
    odb: &mut Odb,
    entries: &[([u8; 40], GitObjectId)],
    hex_start: usize,
    mode: FileMode,
) -> TreeId {
    let mut buf = Vec::new();
    if entries.len() <= 256 || hex_start >= 38 {
        for (hex, value) in entries {
            write_tree_entry(&mut buf, mode, &hex[hex_start..], *value);
        }
    } else {
        let mut start = 0;
        while start < entries.len() {
            let fan = &entries[start].0[hex_start..hex_start + 2];
            let end = entries[start..]
                .iter()
                .position(|(hex, _)| &hex[hex_start..hex_start + 2] != fan)
                .map_or(entries.len(), |p| start + p);
            let subtree = write_fanout_tree(odb, &entries[start..end], hex_start + 2, mode);
            write_tree_entry(&mut buf, FileMode::DIRECTORY, fan, subtree.into());
            start = end;
        }
    }
    TreeId::from_unchecked(odb.write_object(ObjectType::Tree, &buf))
}

/// Notes keyed by mercurial node ids (`hg2git`, `files-meta`).
#[allow(non_camel_case_types)]
pub struct hg_notes_tree(NotesTree);

impl hg_notes_tree {
    pub fn new() -> hg_notes_tree {
        hg_notes_tree(NotesTree::new())
    }

    pub fn new_with(odb: &Odb, c: CommitId) -> hg_notes_tree {
        hg_notes_tree(NotesTree::new_with(odb, c))
    }

    pub fn get_note(&self, oid: HgObjectId) -> Option<GitObjectId> {
        self.0
            .get_note(GitObjectId::from_raw_bytes(oid.as_raw_bytes()).unwrap())
    }

    pub fn add_note(&mut self, oid: HgObjectId, note: GitObjectId) {
        self.0
            .add_note(GitObjectId::from_raw_bytes(oid.as_raw_bytes()).unwrap(), note);
    }

    pub fn remove_note(&mut self, oid: HgObjectId) {
        self.0
            .remove_note(GitObjectId::from_raw_bytes(oid.as_raw_bytes()).unwrap());
    }

    pub fn is_dirty(&self) -> bool {
        self.0.is_dirty()
    }

    pub fn store_tree(&mut self, odb: &mut Odb) -> TreeId {
        // gitlink mode, so that git accepts values that are not objects
        // of this repository (they are mercurial sha1s, or point at
        // objects of any type).
        self.0.store_tree(odb, FileMode::GITLINK)
    }
}

/// Notes keyed by git oids (`git2hg`), with blob values.
#[allow(non_camel_case_types)]
pub struct git_notes_tree(NotesTree);

impl git_notes_tree {
    pub fn new() -> git_notes_tree {
        git_notes_tree(NotesTree::new())
    }

    pub fn new_with(odb: &Odb, c: CommitId) -> git_notes_tree {
        git_notes_tree(NotesTree::new_with(odb, c))
    }

    pub fn get_note(&self, oid: GitObjectId) -> Option<GitObjectId> {
        self.0.get_note(oid)
    }

    pub fn add_note(&mut self, oid: GitObjectId, note: GitObjectId) {
        self.0.add_note(oid, note);
    }

    pub fn remove_note(&mut self, oid: GitObjectId) {
        self.0.remove_note(oid);
    }

    pub fn is_dirty(&self) -> bool {
        self.0.is_dirty()
    }

    pub fn store_tree(&mut self, odb: &mut Odb) -> TreeId {
        self.0.store_tree(odb, FileMode::REGULAR)
    }
}
