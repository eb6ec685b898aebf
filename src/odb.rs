/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::git::{hash_object, GitObjectId, ObjectType, EMPTY_BLOB, EMPTY_TREE};
use crate::pack::{
    apply_delta, create_delta, deflate, entry_header, ofs_delta_offset, unpack_object_at,
    FinalizedPack, PackWriter, OBJ_OFS_DELTA,
};
use crate::util::die;

pub const MAX_PACK_ID: u32 = u32::MAX;

/// In-memory record for an object known to the current import session.
/// An offset of 1 means the object is known to live in an older pack.
#[derive(Clone, Copy, Debug)]
pub struct ObjectEntry {
    pub typ: ObjectType,
    pub offset: u64,
    pub depth: u32,
    pub pack_id: u32,
}

/// A prior object in the current pack that a new object can be
/// deltified against.
pub struct ObjectReference<'a> {
    pub offset: u64,
    pub depth: u32,
    pub data: &'a [u8],
}

pub struct Odb {
    pack_dir: PathBuf,
    pack: Option<PackWriter>,
    entries: HashMap<GitObjectId, ObjectEntry>,
    entry_list: Vec<(GitObjectId, u64, u32)>,
    packs: Vec<FinalizedPack>,
    window_size: u64,
    max_depth: u32,
    pack_id: u32,
}

impl Odb {
    pub fn open(git_dir: &Path, window_size: u64) -> Odb {
        let pack_dir = git_dir.join("objects").join("pack");
        let mut packs = Vec::new();
        if let Ok(dir) = fs::read_dir(&pack_dir) {
            for entry in dir.flatten() {
                let path = entry.path();
                if path.extension().map_or(false, |e| e == "idx") {
                    if let Some(pack) = FinalizedPack::open(&path) {
                        packs.push(pack);
                    } else {
                        warn!("ignoring unreadable pack index {}", path.display());
                    }
                }
            }
        }
        Odb {
            pack_dir,
            pack: None,
            entries: HashMap::new(),
            entry_list: Vec::new(),
            packs,
            window_size,
            max_depth: 50,
            pack_id: 0,
        }
    }

    pub fn pack_id(&self) -> u32 {
        self.pack_id
    }

    pub fn object_count(&self) -> usize {
        self.entry_list.len()
    }

    fn pack(&mut self) -> &mut PackWriter {
        let (pack_dir, window_size) = (&self.pack_dir, self.window_size);
        self.pack
            .get_or_insert_with(|| PackWriter::new(pack_dir, window_size))
    }

    /// Stores a git object into the current pack, deltified against
    /// `reference` when that makes it smaller, and returns its oid.
    /// Storing an object already known to the session writes nothing.
    pub fn store_object(
        &mut self,
        typ: ObjectType,
        buf: &[u8],
        reference: Option<&ObjectReference>,
    ) -> GitObjectId {
        let oid = hash_object(typ, buf);
        if self.entries.contains_key(&oid) {
            return oid;
        }

        let delta = reference
            .filter(|r| r.depth < self.max_depth && buf.len() > 20)
            .and_then(|r| {
                let delta = create_delta(r.data, buf);
                (delta.len() < buf.len() - 20).then_some((delta, r.offset, r.depth + 1))
            });

        let pack = self.pack();
        let offset = pack.pack_size();
        let (entry, depth) = match delta {
            Some((delta, base_offset, depth)) => {
                let mut entry = entry_header(OBJ_OFS_DELTA, delta.len() as u64);
                entry.extend_from_slice(&ofs_delta_offset(offset - base_offset));
                entry.extend_from_slice(&deflate(&delta));
                (entry, depth)
            }
            None => {
                let mut entry = entry_header(typ as u8, buf.len() as u64);
                entry.extend_from_slice(&deflate(buf));
                (entry, 0)
            }
        };
        let mut crc = crc32fast::Hasher::new();
        crc.update(&entry);
        pack.write(&entry);

        self.entries.insert(
            oid,
            ObjectEntry {
                typ,
                offset,
                depth,
                pack_id: self.pack_id,
            },
        );
        self.entry_list.push((oid, offset, crc.finalize()));
        oid
    }

    /// Synchronous store without deltification.
    pub fn write_object(&mut self, typ: ObjectType, buf: &[u8]) -> GitObjectId {
        self.store_object(typ, buf, None)
    }

    /// Looks an object up in the session entry map. The in-progress pack
    /// has no index file yet, so this is the only source of truth for
    /// offsets within it.
    pub fn find_object(&self, oid: GitObjectId) -> Option<ObjectEntry> {
        self.entries.get(&oid).copied()
    }

    /// Like `find_object`, but also looks through finalized packs,
    /// recording what it finds as an older-pack entry.
    pub fn lookup_object(&mut self, oid: GitObjectId) -> Option<ObjectEntry> {
        if let Some(entry) = self.entries.get(&oid) {
            return Some(*entry);
        }
        let (typ, _) = self.read_finalized(oid)?;
        let entry = ObjectEntry {
            typ,
            offset: 1,
            depth: 0,
            pack_id: MAX_PACK_ID,
        };
        self.entries.insert(oid, entry);
        Some(entry)
    }

    fn read_finalized(&self, oid: GitObjectId) -> Option<(ObjectType, Vec<u8>)> {
        for pack in &self.packs {
            if let Some(offset) = pack.find(oid) {
                let (typ, data) = unpack_object_at(pack, offset);
                let typ = ObjectType::from_pack_type(typ)
                    .unwrap_or_else(|| die!("invalid object type in pack"));
                return Some((typ, data));
            }
        }
        None
    }

    /// Reconstructs the full content of an object, reading the
    /// in-progress pack through the window machinery.
    pub fn read_object(&self, oid: GitObjectId) -> Option<(ObjectType, Vec<u8>)> {
        match self.entries.get(&oid) {
            Some(entry) if entry.offset > 1 && entry.pack_id == self.pack_id => {
                let pack = self.pack.as_ref().unwrap();
                let (typ, data) = unpack_object_at(pack, entry.offset);
                let typ = ObjectType::from_pack_type(typ)
                    .unwrap_or_else(|| die!("invalid object type in pack"));
                Some((typ, data))
            }
            _ => self.read_finalized(oid),
        }
    }

    /// Reconstructs the content of the entry at a known offset of the
    /// current pack.
    pub fn unpack_entry(&self, entry: &ObjectEntry) -> Vec<u8> {
        assert!(entry.offset > 1 && entry.pack_id == self.pack_id);
        let pack = self.pack.as_ref().unwrap();
        unpack_object_at(pack, entry.offset).1
    }

    pub fn ensure_empty_blob(&mut self) -> GitObjectId {
        let oid = self.store_object(ObjectType::Blob, b"", None);
        assert_eq!(oid, GitObjectId::from(EMPTY_BLOB));
        oid
    }

    pub fn ensure_empty_tree(&mut self) -> GitObjectId {
        let oid = self.store_object(ObjectType::Tree, b"", None);
        assert_eq!(oid, GitObjectId::from(EMPTY_TREE));
        oid
    }

    /// Ends the pack session. With `keep`, the pack is checksummed,
    /// indexed and renamed into place; otherwise, or when no object was
    /// stored at all, it is deleted and the surrounding repository is
    /// left untouched.
    pub fn finalize(&mut self, keep: bool) {
        if let Some(pack) = self.pack.take() {
            if keep && !self.entry_list.is_empty() {
                let path = pack.finalize(&mut self.entry_list);
                if let Some(pack) = FinalizedPack::open(&path.with_extension("idx")) {
                    self.packs.push(pack);
                }
            } else {
                pack.discard();
            }
        }
        self.entries.clear();
        self.entry_list.clear();
        self.pack_id += 1;
    }
}
