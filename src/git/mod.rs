/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;

use bstr::ByteSlice;
use derive_more::Deref;
use getset::CopyGetters;
use hex_literal::hex;
use sha1::Sha1;

use crate::oid::{oid_type, ObjectId};
use crate::util::{FromBytes, ImmutBString, SliceExt};

oid_type!(GitObjectId for Sha1);

macro_rules! git_oid_type {
    ($name:ident($base_type:ident)) => {
        $crate::oid::oid_type!($name($base_type));

        git_oid_type!(@ $name($base_type));
    };
    (@ $name:ident(GitObjectId)) => {};
    (@ $name:ident($base_type:ident)) => {
        impl From<$name> for $crate::git::GitObjectId {
            fn from(oid: $name) -> $crate::git::GitObjectId {
                $crate::git::GitObjectId::from_raw_bytes(
                    $crate::oid::ObjectId::as_raw_bytes(&oid),
                )
                .unwrap()
            }
        }

        impl PartialEq<$crate::git::GitObjectId> for $name {
            fn eq(&self, other: &$crate::git::GitObjectId) -> bool {
                $crate::oid::ObjectId::as_raw_bytes(self)
                    == $crate::oid::ObjectId::as_raw_bytes(other)
            }
        }

        impl PartialEq<$name> for $crate::git::GitObjectId {
            fn eq(&self, other: &$name) -> bool {
                $crate::oid::ObjectId::as_raw_bytes(self)
                    == $crate::oid::ObjectId::as_raw_bytes(other)
            }
        }
    };
}
pub(crate) use git_oid_type;

git_oid_type!(BlobId(GitObjectId));
git_oid_type!(TreeId(GitObjectId));
git_oid_type!(CommitId(GitObjectId));

pub const EMPTY_BLOB: BlobId =
    BlobId::from_raw_bytes_array(hex!("e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"));
pub const EMPTY_TREE: TreeId =
    TreeId::from_raw_bytes_array(hex!("4b825dc642cb6eb9a060e54bf8d69288fbee4904"));

/// Git object types, with the type codes used in packfile entry headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
}

impl ObjectType {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::Tree => "tree",
            ObjectType::Blob => "blob",
            ObjectType::Tag => "tag",
        }
    }

    pub fn from_pack_type(t: u8) -> Option<Self> {
        Some(match t {
            1 => ObjectType::Commit,
            2 => ObjectType::Tree,
            3 => ObjectType::Blob,
            4 => ObjectType::Tag,
            _ => return None,
        })
    }
}

/// Hash of a git object: sha1 over `<type> <len>\0` followed by the body.
pub fn hash_object(typ: ObjectType, buf: &[u8]) -> GitObjectId {
    let mut hash = GitObjectId::create();
    hash.update(typ.type_name().as_bytes());
    hash.update(format!(" {}\0", buf.len()).as_bytes());
    hash.update(buf);
    hash.finalize()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileMode(u16);

impl FileMode {
    pub const EMPTY: FileMode = FileMode(0);
    pub const REGULAR: FileMode = FileMode(0o100644);
    pub const EXECUTABLE: FileMode = FileMode(0o100755);
    pub const SYMLINK: FileMode = FileMode(0o120000);
    pub const DIRECTORY: FileMode = FileMode(0o040000);
    pub const GITLINK: FileMode = FileMode(0o160000);

    pub fn is_dir(&self) -> bool {
        self.0 & 0o170000 == 0o040000
    }

    pub fn is_gitlink(&self) -> bool {
        self.0 & 0o170000 == 0o160000
    }

    pub fn perms(&self) -> u16 {
        self.0 & 0o777
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

impl From<FileMode> for u16 {
    fn from(mode: FileMode) -> u16 {
        mode.0
    }
}

impl From<u16> for FileMode {
    fn from(mode: u16) -> FileMode {
        FileMode(mode)
    }
}

impl FromBytes for FileMode {
    type Err = ();

    fn from_bytes(b: &[u8]) -> Result<Self, Self::Err> {
        let mut mode = 0u16;
        if b.is_empty() || b.len() > 6 {
            return Err(());
        }
        for c in b {
            if !(b'0'..=b'7').contains(c) {
                return Err(());
            }
            mode = mode.checked_mul(8).ok_or(())? + u16::from(c - b'0');
        }
        Ok(FileMode(mode))
    }
}

#[derive(Deref)]
#[deref(forward)]
pub struct RawCommit(ImmutBString);

impl RawCommit {
    pub fn from_bytes(buf: impl Into<ImmutBString>) -> Self {
        RawCommit(buf.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn parse(&self) -> Option<Commit<'_>> {
        let [header, body] = self.as_bytes().splitn_exact(&b"\n\n"[..])?;
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in header.lines() {
            if line.is_empty() {
                break;
            }
            match line.splitn_exact(b' ')? {
                [b"tree", t] => tree = Some(TreeId::from_bytes(t).ok()?),
                [b"parent", p] => parents.push(CommitId::from_bytes(p).ok()?),
                [b"author", a] => author = Some(a),
                [b"committer", a] => committer = Some(a),
                _ => {}
            }
        }
        Some(Commit {
            tree: tree?,
            parents,
            author: author?,
            committer: committer?,
            body,
        })
    }
}

#[derive(CopyGetters)]
pub struct Commit<'a> {
    #[getset(get_copy = "pub")]
    tree: TreeId,
    parents: Vec<CommitId>,
    #[getset(get_copy = "pub")]
    author: &'a [u8],
    #[getset(get_copy = "pub")]
    committer: &'a [u8],
    #[getset(get_copy = "pub")]
    body: &'a [u8],
}

impl Commit<'_> {
    pub fn parents(&self) -> &[CommitId] {
        &self.parents[..]
    }
}

/// One entry of a raw git tree object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: ImmutBString,
    pub oid: GitObjectId,
}

/// Iterates `<mode> SP <name> NUL <oid20>` entries of a raw tree object.
pub struct TreeIter<'a>(&'a [u8]);

impl<'a> TreeIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TreeIter(buf)
    }
}

impl Iterator for TreeIter<'_> {
    type Item = TreeEntry;

    fn next(&mut self) -> Option<TreeEntry> {
        if self.0.is_empty() {
            return None;
        }
        let entry = (|| {
            let [mode, remainder] = self.0.splitn_exact(b' ')?;
            let mode = FileMode::from_bytes(mode).ok()?;
            let [name, remainder] = remainder.splitn_exact(b'\0')?;
            if name.is_empty() || remainder.len() < 20 {
                return None;
            }
            let (oid, remainder) = remainder.split_at(20);
            self.0 = remainder;
            Some(TreeEntry {
                mode,
                name: name.to_vec().into_boxed_slice(),
                oid: GitObjectId::from_raw_bytes(oid).unwrap(),
            })
        })();
        Some(entry.expect("malformed tree"))
    }
}

pub fn write_tree_entry(buf: &mut Vec<u8>, mode: FileMode, name: &[u8], oid: GitObjectId) {
    buf.extend_from_slice(format!("{} ", mode).as_bytes());
    buf.extend_from_slice(name);
    buf.push(b'\0');
    buf.extend_from_slice(oid.as_raw_bytes());
}

/// Compares tree entry names the way git sorts them: as if directory
/// names ended with a slash, so that `foo.bar` comes before directory
/// `foo`.
pub fn cmp_leaf_name(a: &[u8], a_is_tree: bool, b: &[u8], b_is_tree: bool) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    if !a_is_tree && !b_is_tree {
        a.cmp(b)
    } else {
        let shortest_len = std::cmp::min(a.len(), b.len());
        match a[..shortest_len].cmp(&b[..shortest_len]) {
            Ordering::Equal => match a.len().cmp(&b.len()) {
                Ordering::Equal => match (a_is_tree, b_is_tree) {
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    _ => Ordering::Equal,
                },
                Ordering::Greater if b_is_tree => a[shortest_len..].cmp(b"/"),
                Ordering::Less if a_is_tree => b"/"[..].cmp(&b[shortest_len..]),
                o => o,
            },
            o => o,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_hash_object() {
        assert_eq!(
            hash_object(ObjectType::Blob, b"hello\n").to_string(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
        assert_eq!(hash_object(ObjectType::Blob, b""), EMPTY_BLOB);
        assert_eq!(hash_object(ObjectType::Tree, b""), EMPTY_TREE);
    }

    #[test]
    fn test_parse_commit() {
        let raw = RawCommit::from_bytes(
            &b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
               parent ce013625030ba8dba906f756967f9e9ca394464a\n\
               author  <cinnabar@git> 0 +0000\n\
               committer  <cinnabar@git> 0 +0000\n\
               \n\
               body text"[..],
        );
        let commit = raw.parse().unwrap();
        assert_eq!(commit.tree(), EMPTY_TREE);
        assert_eq!(
            commit.parents(),
            &[CommitId::from_str("ce013625030ba8dba906f756967f9e9ca394464a").unwrap()]
        );
        assert_eq!(commit.author(), b" <cinnabar@git> 0 +0000");
        assert_eq!(commit.body(), b"body text");
    }

    #[test]
    fn test_tree_iter_round_trip() {
        let mut buf = Vec::new();
        let a = GitObjectId::from_str("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let b = GitObjectId::from_str("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        write_tree_entry(&mut buf, FileMode::REGULAR, b"foo", a);
        write_tree_entry(&mut buf, FileMode::DIRECTORY, b"sub", b);
        let entries = TreeIter::new(&buf).collect_vec();
        assert_eq!(entries.len(), 2);
        assert_eq!(&*entries[0].name, b"foo");
        assert_eq!(entries[0].mode, FileMode::REGULAR);
        assert_eq!(entries[0].oid, a);
        assert_eq!(&*entries[1].name, b"sub");
        assert!(entries[1].mode.is_dir());
    }

    #[test]
    fn test_cmp_leaf_name() {
        let examples = ["foo", "bar", "foobar", "foo.bar", "foo_", "foo.", "qux"];
        let example_dirs = examples.iter().map(|x| format!("{}/", x)).collect_vec();
        let all_examples = example_dirs.iter().map(|x| &**x).chain(examples);

        for (a, b) in Itertools::cartesian_product(all_examples.clone(), all_examples) {
            let expected = a.cmp(b);
            let (a_stripped, a_is_tree) = a.strip_suffix('/').map_or((a, false), |x| (x, true));
            let (b_stripped, b_is_tree) = b.strip_suffix('/').map_or((b, false), |x| (x, true));
            assert_eq!(
                cmp_leaf_name(
                    a_stripped.as_bytes(),
                    a_is_tree,
                    b_stripped.as_bytes(),
                    b_is_tree
                ),
                expected,
                "comparing {} and {}",
                a,
                b
            );
        }
    }

    #[test]
    fn test_file_mode() {
        assert_eq!(FileMode::from_bytes(b"100644"), Ok(FileMode::REGULAR));
        assert_eq!(FileMode::from_bytes(b"40000"), Ok(FileMode::DIRECTORY));
        assert_eq!(FileMode::from_bytes(b"160000"), Ok(FileMode::GITLINK));
        assert!(FileMode::from_bytes(b"10worse").is_err());
        assert!(FileMode::GITLINK.is_gitlink());
        assert!(!FileMode::GITLINK.is_dir());
        assert_eq!(FileMode::REGULAR.to_string(), "100644");
        assert_eq!(FileMode::from(0o160644u16).perms(), 0o644);
    }
}
