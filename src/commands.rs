/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The command stream read from the driver: a fast-import-like
//! protocol extended with `set` and `store` commands for mercurial
//! data.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use bstr::ByteSlice;

use crate::changegroup::RevChunk;
use crate::git::{CommitId, FileMode, GitObjectId, ObjectType, TreeId, EMPTY_TREE};
use crate::hg::HgObjectId;
use crate::oid::ObjectId;
use crate::store::{SetWhat, Store};
use crate::tree_builder::{get_tree_entry, TreeBuilder};
use crate::util::{die, FromBytes, ReadExt, SliceExt};

// The :h<sha1> syntax resolves through a fixed mark. This is safe
// because each command fully consumes the mark before the next command
// can set it.
const HG_MARK: u64 = 2;

pub struct CommandLoop<R: BufRead, W: Write> {
    input: R,
    output: W,
    pub store: Store,
    marks: HashMap<u64, GitObjectId>,
    pushback: Option<Vec<u8>>,
}

impl<R: BufRead, W: Write> CommandLoop<R, W> {
    pub fn new(store: Store, input: R, output: W) -> CommandLoop<R, W> {
        CommandLoop {
            input,
            output,
            store,
            marks: HashMap::new(),
            pushback: None,
        }
    }

    pub fn run(&mut self) {
        while let Some(line) = self.next_line() {
            if line.is_empty() || line.starts_with(b"#") {
                continue;
            }
            let mut tokens = line.splitn(2, |&b| b == b' ');
            let command = tokens.next().unwrap();
            let arg = tokens.next().unwrap_or(b"");
            match command {
                b"done" => {
                    self.store.require_explicit_termination = false;
                    self.store.cleanup();
                    return;
                }
                b"feature" => self.parse_feature(arg),
                b"set" => self.do_set(arg),
                b"store" => {
                    self.store.require_explicit_termination = true;
                    self.do_store(arg);
                }
                b"blob" => {
                    self.store.require_explicit_termination = true;
                    self.parse_blob();
                }
                b"commit" => {
                    self.store.require_explicit_termination = true;
                    self.parse_commit(arg);
                }
                b"reset" => self.parse_reset(arg),
                b"get-mark" => self.parse_get_mark(arg),
                b"cat-blob" => self.parse_cat_blob(arg),
                b"ls" => self.parse_ls(arg),
                c => die!("Unknown command: {}", c.as_bstr()),
            }
        }
        // The stream ended without an explicit `done`; cleanup discards
        // the pack if one was required.
        self.store.cleanup();
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        if let Some(line) = self.pushback.take() {
            return Some(line);
        }
        let mut buf = Vec::new();
        let n = self.input.read_until(b'\n', &mut buf).unwrap();
        if n == 0 {
            return None;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        Some(buf)
    }

    fn unread_line(&mut self, line: Vec<u8>) {
        assert!(self.pushback.is_none());
        self.pushback = Some(line);
    }

    /// Reads the byte-count payload of a `data <count>` line.
    fn read_data(&mut self, line: &[u8]) -> Vec<u8> {
        let [_, count] = line
            .splitn_exact(b' ')
            .unwrap_or_else(|| die!("Missing data command"));
        if count.starts_with(b"<<") {
            die!("Delimited data is not supported");
        }
        let count =
            usize::from_bytes(count).unwrap_or_else(|_| die!("Invalid data length"));
        let data = self
            .input
            .read_exactly(count)
            .unwrap_or_else(|e| die!("Truncated data: {}", e))
            .into_vec();
        // An optional newline follows the data.
        if self.input.fill_buf().unwrap().first() == Some(&b'\n') {
            self.input.consume(1);
        }
        data
    }

    fn parse_feature(&mut self, arg: &[u8]) {
        let feature = arg.split(|&b| b == b'=').next().unwrap();
        match feature {
            b"force" | b"quiet" | b"notes" => {}
            b"done" => self.store.require_explicit_termination = true,
            f => die!(
                "This version of cinnabar-store does not support feature {}",
                f.as_bstr()
            ),
        }
    }

    /// Resolves a `:<mark>`, `:h<sha1>[:<path>]` or raw sha1 argument
    /// to a git oid.
    fn resolve_dataref(&mut self, s: &[u8]) -> GitObjectId {
        if let Some(mark_ref) = s.strip_prefix(b":") {
            if let Some(hg_ref) = mark_ref.strip_prefix(b"h") {
                return self.resolve_hg_ref(hg_ref);
            }
            let mark =
                u64::from_bytes(mark_ref).unwrap_or_else(|_| die!("Invalid mark ref"));
            return *self
                .marks
                .get(&mark)
                .unwrap_or_else(|| die!("Unknown mark: :{}", mark));
        }
        GitObjectId::from_bytes(s).unwrap_or_else(|_| die!("Invalid sha1"))
    }

    /// The added syntax is `:h<sha1>[:<path>]`: the mercurial sha1 is
    /// resolved through hg2git; with a path, the tree entry at that
    /// path within the resolved object is returned instead, falling
    /// back to the empty tree.
    fn resolve_hg_ref(&mut self, s: &[u8]) -> GitObjectId {
        if s.len() < 40 {
            die!("Invalid sha1");
        }
        let (hex, path) = s.split_at(40);
        let hg_id = HgObjectId::from_bytes(hex).unwrap_or_else(|_| die!("Invalid sha1"));
        let mut oid = self
            .store
            .hg2git
            .get_note(hg_id)
            .unwrap_or_else(|| die!("Unknown mercurial sha1: {}", hg_id));
        if let Some(path) = path.strip_prefix(b":") {
            let tree = self.treeish_to_tree(oid);
            oid = match get_tree_entry(&self.store.odb, tree, path) {
                Some((_, oid)) => oid,
                None => EMPTY_TREE.into(),
            };
        }
        self.marks.insert(HG_MARK, oid);
        oid
    }

    fn treeish_to_tree(&self, oid: GitObjectId) -> TreeId {
        match self.store.odb.read_object(oid) {
            Some((ObjectType::Commit, raw)) => crate::git::RawCommit::from_bytes(raw)
                .parse()
                .unwrap_or_else(|| die!("Invalid commit {}", oid))
                .tree(),
            Some((ObjectType::Tree, _)) => TreeId::from_unchecked(oid),
            _ => die!("Not a tree-ish: {}", oid),
        }
    }

    /// Resolves `from`/`merge` arguments: marks, sha1s, or known refs.
    fn resolve_committish(&mut self, s: &[u8]) -> CommitId {
        let oid = if s.starts_with(b":") {
            self.resolve_dataref(s)
        } else if let Ok(oid) = GitObjectId::from_bytes(s) {
            oid
        } else {
            self.store
                .branches
                .get(s)
                .copied()
                .map(GitObjectId::from)
                .unwrap_or_else(|| die!("Unknown committish: {}", s.as_bstr()))
        };
        CommitId::from_unchecked(oid)
    }

    fn parse_blob(&mut self) {
        let mut mark = None;
        let line = self
            .next_line()
            .unwrap_or_else(|| die!("Truncated blob command"));
        let line = if let Some(mark_arg) = line.strip_prefix(b"mark :") {
            mark = Some(u64::from_bytes(mark_arg).unwrap_or_else(|_| die!("Invalid mark")));
            self.next_line()
                .unwrap_or_else(|| die!("Truncated blob command"))
        } else {
            line
        };
        if !line.starts_with(b"data ") {
            die!("Missing data command");
        }
        let data = self.read_data(&line);
        let oid = self.store.odb.write_object(ObjectType::Blob, &data);
        if let Some(mark) = mark {
            self.marks.insert(mark, oid);
        }
    }

    fn parse_commit(&mut self, ref_name: &[u8]) {
        let ref_name = ref_name.to_vec();
        let mut mark = None;
        let mut author: Option<Vec<u8>> = None;
        let mut committer: Option<Vec<u8>> = None;
        let mut message = None;
        let mut from = None;
        let mut merges = Vec::new();

        loop {
            let line = self
                .next_line()
                .unwrap_or_else(|| die!("Truncated commit command"));
            if let Some(arg) = line.strip_prefix(b"mark :") {
                mark = Some(u64::from_bytes(arg).unwrap_or_else(|_| die!("Invalid mark")));
            } else if let Some(arg) = line.strip_prefix(b"author ") {
                author = Some(arg.to_vec());
            } else if let Some(arg) = line.strip_prefix(b"committer ") {
                committer = Some(arg.to_vec());
            } else if line.starts_with(b"data ") {
                message = Some(self.read_data(&line));
                break;
            } else {
                die!("Unexpected command in commit: {}", line.as_bstr());
            }
        }
        let committer = committer.unwrap_or_else(|| die!("Missing committer in commit"));
        let message = message.unwrap();

        let mut line = self.next_line();
        if let Some(arg) = line.as_deref().and_then(|l| l.strip_prefix(b"from ")) {
            from = Some(self.resolve_committish(arg));
            line = self.next_line();
        }
        while let Some(arg) = line.as_deref().and_then(|l| l.strip_prefix(b"merge ")) {
            merges.push(self.resolve_committish(arg));
            line = self.next_line();
        }

        // Without an explicit `from`, the commit continues the branch.
        let base = from.or_else(|| {
            self.store
                .branches
                .get(&ref_name[..])
                .copied()
                .filter(|c| !c.is_null())
        });
        let base_tree = base.map(|c| self.commit_tree(c));
        let mut tree = TreeBuilder::new(&self.store.odb, base_tree);

        while let Some(change) = line {
            if change.is_empty() {
                break;
            }
            if let Some(arg) = change.strip_prefix(b"M ") {
                self.file_change_m(&mut tree, arg);
            } else if let Some(path) = change.strip_prefix(b"D ") {
                tree.remove(&self.store.odb, &unquote_path(path));
            } else {
                self.unread_line(change);
                break;
            }
            line = self.next_line();
        }

        let tree_id = tree.store(&mut self.store.odb);
        let mut buf = Vec::new();
        writeln!(buf, "tree {}", tree_id).unwrap();
        for parent in base.iter().chain(merges.iter()) {
            writeln!(buf, "parent {}", parent).unwrap();
        }
        buf.extend_from_slice(b"author ");
        buf.extend_from_slice(author.as_deref().unwrap_or(&committer));
        buf.extend_from_slice(b"\ncommitter ");
        buf.extend_from_slice(&committer);
        buf.extend_from_slice(b"\n\n");
        buf.extend_from_slice(&message);
        let cid =
            CommitId::from_unchecked(self.store.odb.store_object(ObjectType::Commit, &buf, None));
        self.store.unregister_shallow(cid);
        self.store.set_branch(&ref_name, cid);
        if let Some(mark) = mark {
            self.marks.insert(mark, cid.into());
        }
        self.store.maybe_reset_notes(&ref_name);
    }

    fn commit_tree(&self, cid: CommitId) -> TreeId {
        match self.store.odb.read_object(cid.into()) {
            Some((ObjectType::Commit, raw)) => crate::git::RawCommit::from_bytes(raw)
                .parse()
                .unwrap_or_else(|| die!("Invalid commit {}", cid))
                .tree(),
            _ => die!("Missing commit {}", cid),
        }
    }

    fn file_change_m(&mut self, tree: &mut TreeBuilder, arg: &[u8]) {
        let [mode, rest] = arg
            .splitn_exact(b' ')
            .unwrap_or_else(|| die!("Invalid file change"));
        let [dataref, path] = rest
            .splitn_exact(b' ')
            .unwrap_or_else(|| die!("Invalid file change"));
        let mode = FileMode::from_bytes(mode).unwrap_or_else(|_| die!("Corrupt mode"));
        // Directory and gitlink modes are accepted as-is: trees of
        // mercurial metadata legitimately point at objects that are not
        // in this repository.
        let mode = match u16::from(mode) {
            0o644 => FileMode::REGULAR,
            0o755 => FileMode::EXECUTABLE,
            0o120000 => FileMode::SYMLINK,
            0o100644 | 0o100755 | 0o040000 | 0o160000 => mode,
            _ => die!("Corrupt mode: {}", mode),
        };
        let oid = if dataref == b"inline" {
            let line = self
                .next_line()
                .unwrap_or_else(|| die!("Truncated file change"));
            if !line.starts_with(b"data ") {
                die!("Missing data command");
            }
            let data = self.read_data(&line);
            self.store.odb.write_object(ObjectType::Blob, &data)
        } else {
            self.resolve_dataref(dataref)
        };
        tree.set(&self.store.odb, &unquote_path(path), oid, mode);
    }

    fn parse_reset(&mut self, ref_name: &[u8]) {
        let ref_name = ref_name.to_vec();
        let cid = match self.next_line() {
            Some(line) => {
                if let Some(arg) = line.strip_prefix(b"from ") {
                    self.resolve_committish(arg)
                } else {
                    self.unread_line(line);
                    CommitId::NULL
                }
            }
            None => CommitId::NULL,
        };
        self.store.set_branch(&ref_name, cid);
        self.store.maybe_reset_notes(&ref_name);
    }

    fn parse_get_mark(&mut self, arg: &[u8]) {
        if !arg.starts_with(b":") {
            die!("Invalid mark");
        }
        let oid = self.resolve_dataref(arg);
        writeln!(self.output, "{}", oid).unwrap();
        self.output.flush().unwrap();
    }

    fn parse_cat_blob(&mut self, arg: &[u8]) {
        let oid = self.resolve_dataref(arg);
        let (typ, data) = self
            .store
            .odb
            .read_object(oid)
            .unwrap_or_else(|| die!("Missing object {}", oid));
        if typ != ObjectType::Blob {
            die!("Not a blob: {}", oid);
        }
        writeln!(self.output, "{} blob {}", oid, data.len()).unwrap();
        self.output.write_all(&data).unwrap();
        self.output.write_all(b"\n").unwrap();
        self.output.flush().unwrap();
    }

    fn parse_ls(&mut self, arg: &[u8]) {
        let [dataref, path] = arg
            .splitn_exact(b' ')
            .unwrap_or_else(|| die!("ls needs a tree-ish and a path"));
        let path = unquote_path(path);
        let oid = self.resolve_dataref(dataref);
        let tree = self.treeish_to_tree(oid);
        match get_tree_entry(&self.store.odb, tree, &path) {
            Some((mode, oid)) => {
                let typ = if mode.is_dir() {
                    "tree"
                } else if mode.is_gitlink() {
                    "commit"
                } else {
                    "blob"
                };
                writeln!(
                    self.output,
                    "{:06o} {} {}\t{}",
                    u16::from(mode),
                    typ,
                    oid,
                    path.as_bstr()
                )
                .unwrap();
            }
            None => {
                writeln!(self.output, "missing {}", path.as_bstr()).unwrap();
            }
        }
        self.output.flush().unwrap();
    }

    fn do_set(&mut self, arg: &[u8]) {
        let args = arg.split(|&b| b == b' ').collect::<Vec<_>>();
        if args.len() != 3 {
            die!("set needs 3 arguments");
        }
        let what =
            SetWhat::from_bytes(args[0]).unwrap_or_else(|_| {
                die!("Unknown kind of object: {}", args[0].as_bstr())
            });
        let hg_id = HgObjectId::from_bytes(args[1]).unwrap_or_else(|_| die!("Invalid sha1"));
        let git_id = self.resolve_dataref(args[2]);
        self.store.do_set(what, hg_id, git_id);
    }

    fn do_store(&mut self, arg: &[u8]) {
        let args = arg.split(|&b| b == b' ').collect::<Vec<_>>();
        match args[0] {
            b"metadata" => {
                if args.len() != 2 {
                    die!("store metadata needs 2 arguments");
                }
                let result = self
                    .store
                    .store_metadata(std::str::from_utf8(args[1]).unwrap_or_else(|_| {
                        die!("Unknown metadata kind: {}", args[1].as_bstr())
                    }));
                writeln!(self.output, "{}", result).unwrap();
                self.output.flush().unwrap();
            }
            b"file" | b"manifest" => {
                if args.len() != 3 {
                    die!("store file needs 3 arguments");
                }
                let delta_node = if args[1] == b"cg2" {
                    None
                } else {
                    Some(HgObjectId::from_bytes(args[1]).unwrap_or_else(|_| {
                        die!("Neither 'cg2' nor a sha1: {}", args[1].as_bstr())
                    }))
                };
                let length =
                    usize::from_bytes(args[2]).unwrap_or_else(|_| die!("Invalid length"));
                let buf = self
                    .input
                    .read_exactly(length)
                    .unwrap_or_else(|e| die!("Truncated chunk: {}", e));
                let chunk = RevChunk::from_memory(buf, delta_node);
                if args[0] == b"file" {
                    self.store.store_file(&chunk);
                } else {
                    self.store.store_manifest(&chunk);
                }
            }
            b"changegroup" => {
                if args.len() != 2 {
                    die!("store changegroup only takes one argument");
                }
                let version = match args[1] {
                    b"1" => 1,
                    b"2" => 2,
                    _ => die!("unsupported version"),
                };
                self.store.store_changegroup(&mut self.input, version);
            }
            kind => die!("Unknown store kind: {}", kind.as_bstr()),
        }
    }
}

/// Unquotes a C-style quoted path, as fast-import emits them.
fn unquote_path(path: &[u8]) -> Vec<u8> {
    let Some(quoted) = path
        .strip_prefix(b"\"")
        .and_then(|p| p.strip_suffix(b"\""))
    else {
        return path.to_vec();
    };
    let mut result = Vec::with_capacity(quoted.len());
    let mut iter = quoted.iter().copied();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            result.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => result.push(b'\\'),
            Some(b'"') => result.push(b'"'),
            Some(b'n') => result.push(b'\n'),
            Some(b't') => result.push(b'\t'),
            Some(c @ b'0'..=b'7') => {
                let mut value = c - b'0';
                for _ in 0..2 {
                    match iter.next() {
                        Some(c @ b'0'..=b'7') => value = value * 8 + (c - b'0'),
                        _ => die!("Invalid quoted path"),
                    }
                }
                result.push(value);
            }
            _ => die!("Invalid quoted path"),
        }
    }
    result
}
