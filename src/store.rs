/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use bstr::ByteSlice;

use crate::changegroup::{read_rev_chunk, RevChunk, RevChunkIter};
use crate::git::{CommitId, FileMode, GitObjectId, ObjectType, RawCommit, TreeId};
use crate::hg::{
    hash_data, split_manifest_line, HgChangesetId, HgFileAttr, HgFileId, HgManifestId, HgObjectId,
};
use crate::notes::{git_notes_tree, hg_notes_tree};
use crate::odb::{Odb, ObjectReference};
use crate::oid::ObjectId;
use crate::tree_builder::{ManifestWalk, TreeBuilder, DELETE, NO_DELETE};
use crate::util::{die, FromBytes, SliceExt};

pub const NOTES_REF: &str = "refs/notes/cinnabar";
pub const HG2GIT_REF: &str = "refs/cinnabar/hg2git";
pub const CHANGESETS_REF: &str = "refs/cinnabar/changesets";
pub const MANIFESTS_REF: &str = "refs/cinnabar/manifests";

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct Checks: i32 {
        const HELPER = 0x1;
        const MANIFESTS = 0x2;
        const TRACEBACK = 0x200;
    }
}

impl Checks {
    pub fn from_config(config: &str) -> Checks {
        let mut checks = Checks::empty();
        for c in config.split(',') {
            match c {
                "" => {}
                "helper" => checks.insert(Checks::HELPER),
                "manifests" => checks.insert(Checks::MANIFESTS),
                "traceback" => checks.insert(Checks::TRACEBACK),
                c => warn!("unknown check: {}", c),
            }
        }
        checks
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct Experiments: i32 {
        const STORE = 0x1;
    }
}

impl Experiments {
    pub fn from_config(config: &str) -> Experiments {
        let mut experiments = Experiments::empty();
        for c in config.split(',') {
            match c {
                "" => {}
                "store" => experiments.insert(Experiments::STORE),
                c => warn!("unknown experiment: {}", c),
            }
        }
        experiments
    }
}

/// Sorted array of head commits for one of the cinnabar refs. Heads
/// are initialized lazily from the ref tip; since the array is always
/// kept sorted, sortedness doubles as the "initialized" flag.
#[derive(Debug, Default)]
pub struct HeadsSet {
    heads: Vec<CommitId>,
    sorted: bool,
}

impl HeadsSet {
    fn ensure(&mut self, odb: &Odb, tip: Option<CommitId>, manifests: bool) {
        if self.sorted {
            return;
        }
        self.sorted = true;
        let Some(commit) = tip.and_then(|tip| read_commit(odb, tip)) else {
            return;
        };
        let commit = commit.parse().unwrap_or_else(|| die!("Invalid commit"));
        for (n, parent) in commit.parents().iter().enumerate() {
            // Skip the first parent when "has-flat-manifest-tree" is
            // there.
            if manifests && n == 0 && commit.body() == b"has-flat-manifest-tree" {
                continue;
            }
            if let Err(pos) = self.heads.binary_search(parent) {
                self.heads.insert(pos, *parent);
            }
        }
    }

    fn add(&mut self, odb: &Odb, oid: CommitId) {
        assert!(self.sorted);
        let commit = read_commit(odb, oid).unwrap_or_else(|| die!("Missing commit {}", oid));
        let commit = commit
            .parse()
            .unwrap_or_else(|| die!("Invalid commit {}", oid));
        for parent in commit.parents() {
            if let Ok(pos) = self.heads.binary_search(parent) {
                self.heads.remove(pos);
            }
        }
        if let Err(pos) = self.heads.binary_search(&oid) {
            self.heads.insert(pos, oid);
        }
    }

    pub fn heads(&self) -> &[CommitId] {
        &self.heads
    }

    pub fn contains(&self, oid: CommitId) -> bool {
        self.heads.binary_search(&oid).is_ok()
    }
}

fn read_commit(odb: &Odb, cid: CommitId) -> Option<RawCommit> {
    let (typ, raw) = odb.read_object(cid.into())?;
    (typ == ObjectType::Commit).then(|| RawCommit::from_bytes(raw))
}

/// The last file revision stored or loaded, kept so that consecutive
/// revisions of the same file apply their deltas and deltify their
/// blobs without re-reading anything.
struct HgFile {
    node: HgFileId,
    // Full mercurial file text, including the \x01\n metadata header
    // when there is one.
    data: Vec<u8>,
    content_offset: usize,
    oid: GitObjectId,
}

impl HgFile {
    fn empty() -> HgFile {
        HgFile {
            node: HgFileId::NULL,
            data: Vec::new(),
            content_offset: 0,
            oid: GitObjectId::NULL,
        }
    }

    fn content(&self) -> &[u8] {
        &self.data[self.content_offset..]
    }
}

/// The last manifest stored or loaded: its mirror tree, and, for the
/// text-rebuild strategy, its full textual form.
struct ManifestState {
    node: HgManifestId,
    cid: CommitId,
    tree: TreeBuilder,
    content: Vec<u8>,
}

pub struct Store {
    pub odb: Odb,
    git_dir: PathBuf,
    checks: Checks,
    experiments: Experiments,
    pub hg2git: hg_notes_tree,
    pub git2hg: git_notes_tree,
    pub files_meta: hg_notes_tree,
    changeset_heads: HeadsSet,
    manifest_heads: HeadsSet,
    pub branches: BTreeMap<Box<[u8]>, CommitId>,
    last_file: Option<HgFile>,
    last_manifest: Option<ManifestState>,
    shallow: BTreeSet<CommitId>,
    update_shallow: bool,
    pub require_explicit_termination: bool,
}

impl Store {
    pub fn open(
        git_dir: &Path,
        window_size: u64,
        checks: Checks,
        experiments: Experiments,
    ) -> Store {
        let odb = Odb::open(git_dir, window_size);
        let branches = read_refs(git_dir);
        let shallow = read_shallow(git_dir);
        Store {
            odb,
            git_dir: git_dir.to_path_buf(),
            checks,
            experiments,
            hg2git: hg_notes_tree::new(),
            git2hg: git_notes_tree::new(),
            files_meta: hg_notes_tree::new(),
            changeset_heads: HeadsSet::default(),
            manifest_heads: HeadsSet::default(),
            branches,
            last_file: None,
            last_manifest: None,
            shallow,
            update_shallow: false,
            require_explicit_termination: false,
        }
    }

    fn resolve_ref(&self, name: &str) -> Option<CommitId> {
        self.branches
            .get(name.as_bytes())
            .copied()
            .filter(|c| !c.is_null())
    }

    pub fn set_branch(&mut self, name: &[u8], cid: CommitId) {
        self.branches.insert(name.to_vec().into_boxed_slice(), cid);
    }

    pub fn changeset_heads(&mut self) -> &[CommitId] {
        let tip = self.resolve_ref(CHANGESETS_REF);
        self.changeset_heads.ensure(&self.odb, tip, false);
        self.changeset_heads.heads()
    }

    pub fn manifest_heads(&mut self) -> &[CommitId] {
        let tip = self.resolve_ref(MANIFESTS_REF);
        self.manifest_heads.ensure(&self.odb, tip, true);
        self.manifest_heads.heads()
    }

    pub fn add_changeset_head(&mut self, cid: CommitId) {
        let tip = self.resolve_ref(CHANGESETS_REF);
        self.changeset_heads.ensure(&self.odb, tip, false);
        self.changeset_heads.add(&self.odb, cid);
    }

    pub fn add_manifest_head(&mut self, cid: CommitId) {
        let tip = self.resolve_ref(MANIFESTS_REF);
        self.manifest_heads.ensure(&self.odb, tip, true);
        self.manifest_heads.add(&self.odb, cid);
    }

    /// Marks a commit as now being present as a full commit, requiring
    /// the shallow file to be rewritten on clean exit.
    pub fn unregister_shallow(&mut self, cid: CommitId) {
        if self.shallow.remove(&cid) {
            self.update_shallow = true;
        }
    }

    /// Stores one mercurial file revision: reconstructs the full text
    /// from its delta, extracts the metadata header if any, and stores
    /// the content as a blob deltified against the previous file
    /// revision when possible.
    pub fn store_file(&mut self, chunk: &RevChunk) {
        let node = HgFileId::from_unchecked(chunk.node());
        // Creating the empty blob is handled when creating the git tree
        // for the corresponding changeset. We have nothing to associate
        // the blob with here.
        if node == HgFileId::EMPTY {
            return;
        }
        let delta_node = HgFileId::from_unchecked(chunk.delta_node());
        if self.last_file.as_ref().map_or(true, |f| f.node != delta_node) {
            self.last_file = Some(if delta_node.is_null() {
                HgFile::empty()
            } else {
                self.load_file(delta_node)
            });
        }
        let last_file = self.last_file.as_ref().unwrap();

        let mut data = Vec::new();
        let mut last_end = 0;
        for diff in chunk.iter_diff() {
            if diff.start() > last_file.data.len() || diff.start() < last_end {
                die!("Malformed file chunk for {}", node);
            }
            data.extend_from_slice(&last_file.data[last_end..diff.start()]);
            data.extend_from_slice(diff.data());
            last_end = diff.end();
        }
        if last_file.data.len() < last_end {
            die!("Malformed file chunk for {}", node);
        }
        data.extend_from_slice(&last_file.data[last_end..]);

        let mut content_offset = 0;
        if data.starts_with(b"\x01\n") {
            let [metadata, _] = data[2..]
                .splitn_exact(&b"\x01\n"[..])
                .unwrap_or_else(|| die!("Malformed file metadata for {}", node));
            content_offset = metadata.len() + 4;
            let metadata_oid = self.odb.write_object(ObjectType::Blob, metadata);
            self.files_meta.add_note(node.into(), metadata_oid);
        }

        let reference = self
            .odb
            .find_object(last_file.oid)
            .filter(|e| e.offset > 1 && e.pack_id == self.odb.pack_id())
            .map(|e| ObjectReference {
                offset: e.offset,
                depth: e.depth,
                data: last_file.content(),
            });
        let oid = self
            .odb
            .store_object(ObjectType::Blob, &data[content_offset..], reference.as_ref());
        self.hg2git.add_note(node.into(), oid);
        self.last_file = Some(HgFile {
            node,
            data,
            content_offset,
            oid,
        });
    }

    fn load_file(&mut self, node: HgFileId) -> HgFile {
        let oid = self
            .hg2git
            .get_note(node.into())
            .unwrap_or_else(|| die!("Cannot find file revision {}", node));
        let (typ, content) = self
            .odb
            .read_object(oid)
            .unwrap_or_else(|| die!("Missing blob for {}", node));
        if typ != ObjectType::Blob {
            die!("Invalid object for {}", node);
        }
        let mut data = Vec::new();
        let mut content_offset = 0;
        if let Some(metadata_oid) = self.files_meta.get_note(node.into()) {
            let (typ, metadata) = self
                .odb
                .read_object(metadata_oid)
                .unwrap_or_else(|| die!("Missing file metadata for {}", node));
            if typ != ObjectType::Blob {
                die!("Invalid file metadata for {}", node);
            }
            data.extend_from_slice(b"\x01\n");
            data.extend_from_slice(&metadata);
            data.extend_from_slice(b"\x01\n");
            content_offset = data.len();
        }
        data.extend_from_slice(&content);
        HgFile {
            node,
            data,
            content_offset,
            oid,
        }
    }

    pub fn store_manifest(&mut self, chunk: &RevChunk) {
        if self.experiments.contains(Experiments::STORE) {
            self.tree_walk_store_manifest(chunk);
        } else {
            self.text_store_manifest(chunk);
        }
    }

    /// Makes `last_manifest` the state of the chunk's delta parent,
    /// reloading it from the stored metadata when the parent isn't the
    /// manifest processed last. With `with_content`, the textual form
    /// is regenerated too.
    fn ensure_last_manifest(&mut self, chunk: &RevChunk, with_content: bool) {
        let node = HgManifestId::from_unchecked(chunk.node());
        let delta_node = HgManifestId::from_unchecked(chunk.delta_node());
        if self.last_manifest.is_none() {
            self.last_manifest = Some(ManifestState {
                node: HgManifestId::NULL,
                cid: CommitId::NULL,
                tree: TreeBuilder::new(&self.odb, None),
                content: Vec::new(),
            });
        }
        if !delta_node.is_null() && delta_node != self.last_manifest.as_ref().unwrap().node {
            let note = self
                .hg2git
                .get_note(delta_node.into())
                .unwrap_or_else(|| die!("Cannot find delta node {} for {}", delta_node, node));
            let cid = CommitId::from_unchecked(note);
            let commit = read_commit(&self.odb, cid)
                .unwrap_or_else(|| die!("Missing manifest commit {}", cid));
            let commit = commit
                .parse()
                .unwrap_or_else(|| die!("Invalid manifest commit {}", cid));
            let mut tree = TreeBuilder::new(&self.odb, Some(commit.tree()));
            let content = if with_content {
                generate_manifest(&mut tree, &self.odb)
            } else {
                Vec::new()
            };
            self.last_manifest = Some(ManifestState {
                node: delta_node,
                cid,
                tree,
                content,
            });
        }
    }

    /// Default manifest strategy: the full previous manifest text is
    /// kept in memory and rebuilt, while removals and additions are
    /// mirrored into the tree.
    fn text_store_manifest(&mut self, chunk: &RevChunk) {
        let node = HgManifestId::from_unchecked(chunk.node());
        let malformed = || die!("Malformed manifest chunk for {}", node);
        self.ensure_last_manifest(chunk, true);
        let state = self.last_manifest.as_mut().unwrap();
        let content = &state.content;

        let mut data = Vec::with_capacity(content.len() + chunk.raw_len());
        let mut last_end = 0;
        for diff in chunk.iter_diff() {
            if diff.start() > content.len() || diff.start() < last_end || diff.start() > diff.end()
            {
                malformed();
            }
            data.extend_from_slice(&content[last_end..diff.start()]);
            data.extend_from_slice(diff.data());
            last_end = diff.end();

            // We assume manifest diffs are line-based.
            if diff.start() > 0 && content[diff.start() - 1] != b'\n' {
                malformed();
            }
            if diff.end() > 0 && content[diff.end() - 1] != b'\n' {
                malformed();
            }

            // Process removed files.
            let mut slice = &content[diff.start()..diff.end()];
            loop {
                match split_manifest_line(&mut slice) {
                    Ok(Some(line)) => {
                        state
                            .tree
                            .remove(&self.odb, &manifest_metadata_path(line.path));
                    }
                    Ok(None) => break,
                    Err(()) => malformed(),
                }
            }

            // Some manifest chunks can have diffs like:
            //   - start: off, end: off, data: string of length len
            //   - start: off, end: off + len, data: ""
            // which is valid, albeit wasteful.
            // What that means, however, is that we can't apply additions
            // to the tree until the end, because a subsequent iteration
            // might be removing what we just added. So we don't do them
            // now, we'll re-iterate the diff later.
        }

        if content.len() < last_end {
            malformed();
        }
        data.extend_from_slice(&content[last_end..]);
        state.content = data;

        self.apply_manifest_additions(chunk);
        self.finish_manifest(chunk);
    }

    /// Alternative strategy: instead of keeping the whole manifest text
    /// around, walk the mirror tree counting the bytes each entry
    /// contributes to the textual form, deleting the stretches the
    /// diffs remove.
    fn tree_walk_store_manifest(&mut self, chunk: &RevChunk) {
        let node = HgManifestId::from_unchecked(chunk.node());
        let malformed = || die!("Malformed manifest chunk for {}", node);
        self.ensure_last_manifest(chunk, false);
        let state = self.last_manifest.as_mut().unwrap();

        let mut walk = ManifestWalk::new();
        let mut last_end = 0;
        for diff in chunk.iter_diff() {
            if diff.start() < last_end || diff.start() > diff.end() {
                malformed();
            }
            if !walk.advance(&mut state.tree, &self.odb, diff.start() - last_end, NO_DELETE) {
                malformed();
            }
            last_end = diff.end();

            // Process removed files.
            if !walk.advance(
                &mut state.tree,
                &self.odb,
                diff.end() - diff.start(),
                DELETE,
            ) {
                malformed();
            }

            // Additions are applied after all the diffs, for the same
            // reason as in the text strategy.
        }
        walk.finish(&mut state.tree);

        self.apply_manifest_additions(chunk);
        self.finish_manifest(chunk);
    }

    fn apply_manifest_additions(&mut self, chunk: &RevChunk) {
        let node = HgManifestId::from_unchecked(chunk.node());
        let state = self.last_manifest.as_mut().unwrap();
        for diff in chunk.iter_diff() {
            let mut slice = diff.data().as_bytes();
            loop {
                match split_manifest_line(&mut slice) {
                    Ok(Some(line)) => {
                        let mode = match line.attr {
                            HgFileAttr::Regular => FileMode::from(0o160644),
                            HgFileAttr::Executable => FileMode::from(0o160755),
                            HgFileAttr::Symlink => FileMode::GITLINK,
                        };
                        let file_node =
                            GitObjectId::from_raw_bytes(line.fid.as_raw_bytes()).unwrap();
                        state.tree.set(
                            &self.odb,
                            &manifest_metadata_path(line.path),
                            file_node,
                            mode,
                        );
                    }
                    Ok(None) => break,
                    Err(()) => die!("Malformed manifest chunk for {}", node),
                }
            }
        }
    }

    fn finish_manifest(&mut self, chunk: &RevChunk) {
        let node = HgManifestId::from_unchecked(chunk.node());
        let state = self.last_manifest.as_mut().unwrap();
        let tree_id = state.tree.store(&mut self.odb);

        let mut data = Vec::new();
        writeln!(data, "tree {}", tree_id).unwrap();
        for parent in [chunk.parent1(), chunk.parent2()] {
            if parent.is_null() {
                continue;
            }
            let parent = HgManifestId::from_unchecked(parent);
            let parent_cid = if parent == state.node {
                state.cid
            } else {
                CommitId::from_unchecked(
                    self.hg2git
                        .get_note(parent.into())
                        .unwrap_or_else(|| die!("Malformed manifest chunk for {}", node)),
                )
            };
            writeln!(data, "parent {}", parent_cid).unwrap();
        }
        data.extend_from_slice(
            b"author  <cinnabar@git> 0 +0000\n\
              committer  <cinnabar@git> 0 +0000\n\
              \n",
        );
        data.extend_from_slice(node.to_string().as_bytes());
        let cid = CommitId::from_unchecked(self.odb.store_object(ObjectType::Commit, &data, None));
        state.node = node;
        state.cid = cid;
        self.hg2git.add_note(node.into(), cid.into());
        self.add_manifest_head(cid);
        self.set_branch(MANIFESTS_REF.as_bytes(), cid);
        if self.checks.contains(Checks::MANIFESTS) && !self.check_manifest(chunk) {
            die!("sha1 mismatch for node {}", node);
        }
    }

    /// Verifies that re-encoding the stored manifest in mercurial
    /// textual form hashes back to the manifest node.
    fn check_manifest(&mut self, chunk: &RevChunk) -> bool {
        let state = self.last_manifest.as_mut().unwrap();
        let content = if self.experiments.contains(Experiments::STORE) {
            generate_manifest(&mut state.tree, &self.odb)
        } else {
            state.content.clone()
        };
        let computed = hash_data(chunk.parent1(), chunk.parent2(), &content);
        computed == HgObjectId::from(state.node)
    }

    /// Upserts a mapping. When an incoming changeset produces a git
    /// commit that already maps to a *different* changeset, invisible
    /// NUL characters are appended to the commit until the resulting
    /// commit maps to this changeset or to nothing.
    pub fn handle_changeset_conflict(
        &mut self,
        hg_id: HgChangesetId,
        git_id: CommitId,
    ) -> CommitId {
        let mut git_id = git_id;
        let mut buf: Option<Vec<u8>> = None;
        while let Some(note) = self.git2hg.get_note(git_id.into()) {
            let (typ, content) = self
                .odb
                .read_object(note)
                .unwrap_or_else(|| die!("Invalid git2hg note for {}", git_id));
            if typ != ObjectType::Blob
                || content.len() < 50
                || !content.starts_with(b"changeset ")
            {
                die!("Invalid git2hg note for {}", git_id);
            }
            let existing = HgChangesetId::from_bytes(&content[10..50])
                .unwrap_or_else(|_| die!("Invalid git2hg note for {}", git_id));
            // We might just already have the changeset in store.
            if existing == hg_id {
                break;
            }
            let buf = buf.get_or_insert_with(|| {
                self.odb
                    .read_object(git_id.into())
                    .unwrap_or_else(|| die!("Missing commit {}", git_id))
                    .1
            });
            buf.push(b'\0');
            git_id =
                CommitId::from_unchecked(self.odb.store_object(ObjectType::Commit, buf, None));
        }
        git_id
    }

    pub fn do_set(&mut self, what: SetWhat, hg_id: HgObjectId, git_id: GitObjectId) {
        match what {
            SetWhat::Changeset => {
                if git_id.is_null() {
                    self.hg2git.remove_note(hg_id);
                } else {
                    self.check_object_type(git_id, ObjectType::Commit);
                    let git_id = self.handle_changeset_conflict(
                        HgChangesetId::from_unchecked(hg_id),
                        CommitId::from_unchecked(git_id),
                    );
                    self.hg2git.add_note(hg_id, git_id.into());
                    self.unregister_shallow(git_id);
                    self.add_changeset_head(git_id);
                }
            }
            SetWhat::ChangesetMeta => {
                let note = self.hg2git.get_note(hg_id);
                if let Some(note) = note {
                    if git_id.is_null() {
                        self.git2hg.remove_note(note);
                    } else {
                        self.check_object_type(git_id, ObjectType::Blob);
                        self.git2hg.add_note(note, git_id);
                    }
                } else if !git_id.is_null() {
                    die!("Invalid sha1");
                }
            }
            SetWhat::Manifest => {
                if git_id.is_null() {
                    self.hg2git.remove_note(hg_id);
                } else {
                    self.check_object_type(git_id, ObjectType::Commit);
                    self.hg2git.add_note(hg_id, git_id);
                    self.add_manifest_head(CommitId::from_unchecked(git_id));
                }
            }
            SetWhat::File => {
                if git_id.is_null() {
                    self.hg2git.remove_note(hg_id);
                } else {
                    self.check_object_type(git_id, ObjectType::Blob);
                    self.hg2git.add_note(hg_id, git_id);
                }
            }
            SetWhat::FileMeta => {
                if git_id.is_null() {
                    self.files_meta.remove_note(hg_id);
                } else {
                    self.check_object_type(git_id, ObjectType::Blob);
                    self.files_meta.add_note(hg_id, git_id);
                }
            }
        }
    }

    fn check_object_type(&mut self, oid: GitObjectId, expected: ObjectType) {
        match self.odb.lookup_object(oid) {
            Some(entry) if entry.typ == expected => {}
            _ => die!("Invalid object"),
        }
    }

    /// Flushes one of the notes trees, returning the new root tree oid,
    /// or the null oid when nothing changed.
    pub fn store_metadata(&mut self, kind: &str) -> GitObjectId {
        let result = match kind {
            "hg2git" => self
                .hg2git
                .is_dirty()
                .then(|| self.hg2git.store_tree(&mut self.odb)),
            "git2hg" => self
                .git2hg
                .is_dirty()
                .then(|| self.git2hg.store_tree(&mut self.odb)),
            "files-meta" => self
                .files_meta
                .is_dirty()
                .then(|| self.files_meta.store_tree(&mut self.odb)),
            kind => die!("Unknown metadata kind: {}", kind),
        };
        result.map_or(GitObjectId::NULL, TreeId::into)
    }

    /// Reinitializes the notes trees when the driver commits or resets
    /// one of the sentinel refs, importing preexisting state.
    pub fn maybe_reset_notes(&mut self, branch: &[u8]) {
        if branch == HG2GIT_REF.as_bytes() {
            if let Some(cid) = self.branches.get(branch).copied().filter(|c| !c.is_null()) {
                self.hg2git = hg_notes_tree::new_with(&self.odb, cid);
            }
        } else if branch == NOTES_REF.as_bytes() {
            if let Some(cid) = self.branches.get(branch).copied().filter(|c| !c.is_null()) {
                self.git2hg = git_notes_tree::new_with(&self.odb, cid);
            }
        }
    }

    /// Reads a changegroup stream: changesets (ignored here, the driver
    /// stores them through separate commands), then manifests, then one
    /// section of revisions per file.
    pub fn store_changegroup<R: std::io::Read>(&mut self, mut input: R, version: u8) {
        for _changeset in RevChunkIter::new(version, &mut input) {}
        for manifest in RevChunkIter::new(version, &mut input) {
            self.store_manifest(&manifest);
        }
        while !read_rev_chunk(&mut input).is_empty() {
            for file in RevChunkIter::new(version, &mut input) {
                self.store_file(&file);
            }
        }
    }

    /// Ends the session. Unless explicit termination was required and
    /// never received, the pack is finalized and refs and shallow
    /// information are written out; otherwise everything is discarded
    /// and the repository is left untouched.
    pub fn cleanup(&mut self) {
        let keep = !self.require_explicit_termination;
        if !keep {
            warn!("Did not receive 'done' command; discarding the pack");
        }
        self.odb.finalize(keep);
        if keep {
            self.dump_branches();
            if self.update_shallow {
                write_shallow(&self.git_dir, &self.shallow);
                self.update_shallow = false;
            }
        }
    }

    fn dump_branches(&self) {
        for (name, cid) in &self.branches {
            let Ok(name) = std::str::from_utf8(name) else {
                continue;
            };
            let path = self.git_dir.join(name);
            if cid.is_null() {
                fs::remove_file(path).ok();
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).ok();
                }
                fs::write(path, format!("{}\n", cid)).unwrap();
            }
        }
    }
}

pub enum SetWhat {
    Changeset,
    ChangesetMeta,
    Manifest,
    File,
    FileMeta,
}

impl FromBytes for SetWhat {
    type Err = ();

    fn from_bytes(b: &[u8]) -> Result<SetWhat, ()> {
        match b {
            b"changeset" => Ok(SetWhat::Changeset),
            b"changeset-metadata" => Ok(SetWhat::ChangesetMeta),
            b"manifest" => Ok(SetWhat::Manifest),
            b"file" => Ok(SetWhat::File),
            b"file-meta" => Ok(SetWhat::FileMeta),
            _ => Err(()),
        }
    }
}

/// Path of a manifest entry inside the metadata tree: every component
/// gets a leading underscore, so that no file name conflicts with
/// git-reserved names like `.git`, and so that component lengths
/// account for the separators of the textual form.
fn manifest_metadata_path(path: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(path.len() + 8);
    for (n, part) in path.split(|&b| b == b'/').enumerate() {
        if n > 0 {
            result.push(b'/');
        }
        result.push(b'_');
        result.extend_from_slice(part);
    }
    result
}

/// Regenerates the mercurial textual form of a manifest from its mirror
/// tree.
fn generate_manifest(tree: &mut TreeBuilder, odb: &Odb) -> Vec<u8> {
    let mut result = Vec::new();
    tree.for_each_file(odb, &mut |path, mode, oid| {
        for (n, part) in path.split(|&b| b == b'/').enumerate() {
            if n > 0 {
                result.push(b'/');
            }
            // Strip the leading underscore.
            result.extend_from_slice(&part[1..]);
        }
        result.push(b'\0');
        result.extend_from_slice(oid.to_string().as_bytes());
        let attr = match mode.perms() {
            0o644 => HgFileAttr::Regular,
            0o755 => HgFileAttr::Executable,
            _ => HgFileAttr::Symlink,
        };
        result.extend_from_slice(attr.as_bstr());
        result.push(b'\n');
    });
    result
}

fn read_refs(git_dir: &Path) -> BTreeMap<Box<[u8]>, CommitId> {
    let mut refs = BTreeMap::new();
    let refs_dir = git_dir.join("refs");
    read_refs_dir(&refs_dir, &mut vec![b"refs".to_vec()], &mut refs);
    refs
}

fn read_refs_dir(
    dir: &Path,
    components: &mut Vec<Vec<u8>>,
    refs: &mut BTreeMap<Box<[u8]>, CommitId>,
) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        components.push(name.as_bytes().to_vec());
        let path = entry.path();
        if path.is_dir() {
            read_refs_dir(&path, components, refs);
        } else if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(cid) = content.trim_end().parse::<CommitId>() {
                let full = components.join(&b"/"[..]);
                refs.insert(full.into_boxed_slice(), cid);
            }
        }
        components.pop();
    }
}

fn read_shallow(git_dir: &Path) -> BTreeSet<CommitId> {
    let mut result = BTreeSet::new();
    if let Ok(content) = fs::read(git_dir.join("shallow")) {
        for line in content.lines() {
            if let Ok(cid) = CommitId::from_bytes(line) {
                result.insert(cid);
            }
        }
    }
    result
}

fn write_shallow(git_dir: &Path, shallow: &BTreeSet<CommitId>) {
    let path = git_dir.join("shallow");
    if shallow.is_empty() {
        fs::remove_file(path).ok();
    } else {
        let mut content = Vec::new();
        for cid in shallow {
            writeln!(content, "{}", cid).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use byteorder::{BigEndian, WriteBytesExt};

    use super::*;
    use crate::git::{TreeIter, EMPTY_TREE};

    fn store(dir: &Path) -> Store {
        Store::open(dir, 1024, Checks::empty(), Experiments::empty())
    }

    fn chunk(
        node: HgObjectId,
        parents: [HgObjectId; 2],
        delta_node: HgObjectId,
        diffs: &[(u32, u32, &[u8])],
    ) -> RevChunk {
        let mut raw = Vec::new();
        raw.extend_from_slice(node.as_raw_bytes());
        raw.extend_from_slice(parents[0].as_raw_bytes());
        raw.extend_from_slice(parents[1].as_raw_bytes());
        raw.extend_from_slice(delta_node.as_raw_bytes());
        // linknode
        raw.extend_from_slice(&[0xff; 20]);
        for (start, end, data) in diffs {
            raw.write_u32::<BigEndian>(*start).unwrap();
            raw.write_u32::<BigEndian>(*end).unwrap();
            raw.write_u32::<BigEndian>(data.len() as u32).unwrap();
            raw.extend_from_slice(data);
        }
        RevChunk::from_memory(raw.into_boxed_slice(), None)
    }

    fn hg(n: u8) -> HgObjectId {
        HgObjectId::from_raw_bytes(&[n; 20]).unwrap()
    }

    const NULL2: [HgObjectId; 2] = [HgObjectId::NULL; 2];

    #[test]
    fn test_store_file_no_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_file(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"hello\n")],
        ));
        let oid = store.hg2git.get_note(hg(1)).unwrap();
        assert_eq!(oid.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(store.odb.read_object(oid).unwrap().1, b"hello\n");
        store.odb.finalize(false);
    }

    #[test]
    fn test_store_file_delta() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_file(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"hello\n")],
        ));
        store.store_file(&chunk(
            hg(2),
            [hg(1), HgObjectId::NULL],
            hg(1),
            &[(0, 6, b"HELLO\n")],
        ));
        let oid = store.hg2git.get_note(hg(2)).unwrap();
        assert_eq!(store.odb.read_object(oid).unwrap().1, b"HELLO\n");
        store.odb.finalize(false);
    }

    #[test]
    fn test_store_file_delta_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_file(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"one\n")],
        ));
        store.store_file(&chunk(
            hg(2),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"unrelated\n")],
        ));
        // The delta parent is no longer the cached file, forcing a
        // reload through hg2git.
        store.store_file(&chunk(
            hg(3),
            [hg(1), HgObjectId::NULL],
            hg(1),
            &[(4, 4, b"two\n")],
        ));
        let oid = store.hg2git.get_note(hg(3)).unwrap();
        assert_eq!(store.odb.read_object(oid).unwrap().1, b"one\ntwo\n");
        store.odb.finalize(false);
    }

    #[test]
    fn test_store_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_file(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"\x01\ncopy: foo\n\x01\ncontent\n")],
        ));
        let metadata_oid = store.files_meta.get_note(hg(1)).unwrap();
        assert_eq!(store.odb.read_object(metadata_oid).unwrap().1, b"copy: foo\n");
        let oid = store.hg2git.get_note(hg(1)).unwrap();
        assert_eq!(store.odb.read_object(oid).unwrap().1, b"content\n");
        // A delta against it applies to the full text, metadata
        // included.
        store.store_file(&chunk(
            hg(2),
            [hg(1), HgObjectId::NULL],
            hg(1),
            &[(14, 22, b"other\n")],
        ));
        let oid = store.hg2git.get_note(hg(2)).unwrap();
        assert_eq!(store.odb.read_object(oid).unwrap().1, b"other\n");
        let metadata_oid = store.files_meta.get_note(hg(2)).unwrap();
        assert_eq!(store.odb.read_object(metadata_oid).unwrap().1, b"copy: foo\n");
        store.odb.finalize(false);
    }

    #[test]
    fn test_store_file_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let c = chunk(hg(1), NULL2, HgObjectId::NULL, &[(0, 0, b"hello\n")]);
        store.store_file(&c);
        let first = store.hg2git.get_note(hg(1)).unwrap();
        let count = store.odb.object_count();
        let c = chunk(hg(1), NULL2, HgObjectId::NULL, &[(0, 0, b"hello\n")]);
        store.store_file(&c);
        assert_eq!(store.hg2git.get_note(hg(1)), Some(first));
        assert_eq!(store.odb.object_count(), count);
        store.odb.finalize(false);
    }

    #[test]
    fn test_empty_file_sentinel_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_file(&chunk(
            HgFileId::EMPTY.into(),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"")],
        ));
        assert_eq!(store.hg2git.get_note(HgFileId::EMPTY.into()), None);
        assert_eq!(store.odb.object_count(), 0);
        store.odb.finalize(false);
    }

    #[test]
    #[should_panic(expected = "Malformed file chunk")]
    fn test_malformed_file_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        // start is past the end of the (empty) delta parent.
        store.store_file(&chunk(hg(1), NULL2, HgObjectId::NULL, &[(4, 4, b"x")]));
    }

    #[test]
    #[should_panic(expected = "Cannot find file revision")]
    fn test_unknown_delta_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_file(&chunk(hg(1), NULL2, hg(42), &[(0, 0, b"x")]));
    }

    const MANIFEST_LINE: &[u8] = b"a\x001234567890123456789012345678901234567890\n";

    fn manifest_commit(store: &Store, node: HgObjectId) -> (CommitId, Vec<u8>) {
        let cid = CommitId::from_unchecked(store.hg2git.get_note(node).unwrap());
        let (typ, raw) = store.odb.read_object(cid.into()).unwrap();
        assert_eq!(typ, ObjectType::Commit);
        (cid, raw)
    }

    #[test]
    fn test_store_manifest_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
        let (cid, raw) = manifest_commit(&store, hg(1));
        // The commit body is the manifest node, with no trailing
        // newline.
        assert!(raw.ends_with(hg(1).to_string().as_bytes()));
        let commit = RawCommit::from_bytes(raw);
        let commit = commit.parse().unwrap();
        assert_eq!(commit.author(), b" <cinnabar@git> 0 +0000");
        assert!(commit.parents().is_empty());
        let (_, tree) = store.odb.read_object(commit.tree().into()).unwrap();
        let entries = TreeIter::new(&tree).collect::<Vec<_>>();
        assert_eq!(entries.len(), 1);
        assert_eq!(&*entries[0].name, b"_a");
        assert_eq!(u16::from(entries[0].mode), 0o160644);
        assert_eq!(
            entries[0].oid.to_string(),
            "1234567890123456789012345678901234567890"
        );
        assert_eq!(store.manifest_heads(), &[cid]);
        store.odb.finalize(false);
    }

    #[test]
    fn test_manifest_removal_then_add_at_same_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
        // Replace the line with one pointing elsewhere, expressed as an
        // insertion at offset 0 followed by a removal of the old line:
        // the addition must survive even though a later diff removed
        // the same byte range.
        let new_line = b"a\x00abcdefabcdefabcdefabcdefabcdefabcdefabcd\n";
        store.store_manifest(&chunk(
            hg(2),
            [hg(1), HgObjectId::NULL],
            hg(1),
            &[
                (0, 0, new_line),
                (0, MANIFEST_LINE.len() as u32, b""),
            ],
        ));
        let (_, raw) = manifest_commit(&store, hg(2));
        let commit = RawCommit::from_bytes(raw);
        let commit = commit.parse().unwrap();
        let (_, tree) = store.odb.read_object(commit.tree().into()).unwrap();
        let entries = TreeIter::new(&tree).collect::<Vec<_>>();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].oid.to_string(),
            "abcdefabcdefabcdefabcdefabcdefabcdefabcd"
        );
        store.odb.finalize(false);
    }

    #[test]
    fn test_manifest_empty_diff_keeps_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
        let (_, raw) = manifest_commit(&store, hg(1));
        let tree1 = RawCommit::from_bytes(raw).parse().unwrap().tree();
        store.store_manifest(&chunk(hg(2), [hg(1), HgObjectId::NULL], hg(1), &[]));
        let (_, raw) = manifest_commit(&store, hg(2));
        let commit = RawCommit::from_bytes(raw);
        let commit = commit.parse().unwrap();
        assert_eq!(commit.tree(), tree1);
        store.odb.finalize(false);
    }

    #[test]
    fn test_manifest_parents_resolved_through_hg2git() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
        let (cid1, _) = manifest_commit(&store, hg(1));
        store.store_manifest(&chunk(
            hg(2),
            [hg(1), HgObjectId::NULL],
            hg(1),
            &[],
        ));
        let (cid2, raw) = manifest_commit(&store, hg(2));
        let commit = RawCommit::from_bytes(raw);
        let commit = commit.parse().unwrap();
        assert_eq!(commit.parents(), &[cid1]);
        // Only the tip remains a head.
        assert_eq!(store.manifest_heads(), &[cid2]);
        assert!(store.manifest_heads.contains(cid2));
        assert!(!store.manifest_heads.contains(cid1));
        store.odb.finalize(false);
    }

    fn run_both_strategies(diffs_per_chunk: &[Vec<(u32, u32, &[u8])>]) -> [Vec<u8>; 2] {
        let mut results = Vec::new();
        for experiments in [Experiments::empty(), Experiments::STORE] {
            let dir = tempfile::tempdir().unwrap();
            let mut store = Store::open(dir.path(), 1024, Checks::empty(), experiments);
            for (n, diffs) in diffs_per_chunk.iter().enumerate() {
                let node = hg(n as u8 + 1);
                let delta = if n == 0 {
                    HgObjectId::NULL
                } else {
                    hg(n as u8)
                };
                store.store_manifest(&chunk(node, [delta, HgObjectId::NULL], delta, diffs));
            }
            let (_, raw) =
                manifest_commit(&store, hg(diffs_per_chunk.len() as u8));
            results.push(raw);
            store.odb.finalize(false);
        }
        [results.remove(0), results.remove(0)]
    }

    #[test]
    fn test_manifest_strategies_are_equivalent() {
        let b_line = b"b/deep\x00bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbx\n";
        let l_line = b"link\x00ccccccccccccccccccccccccccccccccccccccccl\n";
        let a_len = MANIFEST_LINE.len() as u32;
        let b_len = b_line.len() as u32;
        let [text, walk] = run_both_strategies(&[
            vec![(0, 0, {
                let mut initial = MANIFEST_LINE.to_vec();
                initial.extend_from_slice(b_line);
                initial.extend_from_slice(l_line);
                Box::leak(initial.into_boxed_slice())
            })],
            // Remove the b/deep line, add a replacement for the link.
            vec![
                (a_len, a_len + b_len, b""),
                (
                    a_len + b_len,
                    a_len + b_len + l_line.len() as u32,
                    b"link\x00ddddddddddddddddddddddddddddddddddddddddl\n",
                ),
            ],
        ]);
        assert_eq!(text.as_bstr(), walk.as_bstr());
    }

    #[test]
    #[should_panic(expected = "Malformed manifest chunk")]
    fn test_manifest_diff_not_on_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
        store.store_manifest(&chunk(
            hg(2),
            [hg(1), HgObjectId::NULL],
            hg(1),
            &[(5, 5, b"")],
        ));
    }

    #[test]
    #[should_panic(expected = "Malformed manifest chunk")]
    fn test_manifest_bad_attr_byte() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"a\x001234567890123456789012345678901234567890q\n")],
        ));
    }

    #[test]
    fn test_check_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(
            dir.path(),
            1024,
            Checks::MANIFESTS,
            Experiments::empty(),
        );
        let node = hash_data(HgObjectId::NULL, HgObjectId::NULL, MANIFEST_LINE);
        store.store_manifest(&chunk(node, NULL2, HgObjectId::NULL, &[(0, 0, MANIFEST_LINE)]));
        assert!(store.hg2git.get_note(node).is_some());
        store.odb.finalize(false);
    }

    #[test]
    #[should_panic(expected = "sha1 mismatch")]
    fn test_check_manifests_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(
            dir.path(),
            1024,
            Checks::MANIFESTS,
            Experiments::empty(),
        );
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
    }

    fn test_commit(store: &mut Store, body: &[u8]) -> CommitId {
        let mut commit = Vec::new();
        writeln!(commit, "tree {}", EMPTY_TREE).unwrap();
        commit.extend_from_slice(
            b"author  <cinnabar@git> 0 +0000\ncommitter  <cinnabar@git> 0 +0000\n\n",
        );
        commit.extend_from_slice(body);
        CommitId::from_unchecked(store.odb.store_object(ObjectType::Commit, &commit, None))
    }

    #[test]
    fn test_changeset_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.odb.ensure_empty_tree();
        let cid = test_commit(&mut store, b"shared commit");
        let h1 = HgChangesetId::from_unchecked(hg(1));
        let h2 = HgChangesetId::from_unchecked(hg(2));

        store.do_set(SetWhat::Changeset, h1.into(), cid.into());
        let meta1 = store
            .odb
            .write_object(ObjectType::Blob, format!("changeset {}", h1).as_bytes());
        store.do_set(SetWhat::ChangesetMeta, h1.into(), meta1);

        // The second changeset would map to the same commit; it must
        // end up on a different one, with a NUL appended to the body.
        store.do_set(SetWhat::Changeset, h2.into(), cid.into());
        let cid2 = CommitId::from_unchecked(store.hg2git.get_note(h2.into()).unwrap());
        assert_ne!(cid2, cid);
        let (_, raw) = store.odb.read_object(cid2.into()).unwrap();
        assert!(raw.ends_with(b"shared commit\0"));

        let meta2 = store
            .odb
            .write_object(ObjectType::Blob, format!("changeset {}", h2).as_bytes());
        store.do_set(SetWhat::ChangesetMeta, h2.into(), meta2);
        assert_eq!(store.git2hg.get_note(cid.into()), Some(meta1));
        assert_eq!(store.git2hg.get_note(cid2.into()), Some(meta2));

        // Setting the same changeset again maps to the same commit
        // without further conflict handling.
        store.do_set(SetWhat::Changeset, h1.into(), cid.into());
        assert_eq!(
            store.hg2git.get_note(h1.into()),
            Some(GitObjectId::from(cid))
        );
        store.odb.finalize(false);
    }

    #[test]
    #[should_panic(expected = "Invalid object")]
    fn test_set_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let blob = store.odb.write_object(ObjectType::Blob, b"not a commit");
        store.do_set(SetWhat::Changeset, hg(1), blob);
    }

    #[test]
    fn test_store_metadata_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        assert!(store.store_metadata("hg2git").is_null());
        store.store_file(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"hello\n")],
        ));
        let root = store.store_metadata("hg2git");
        assert!(!root.is_null());
        // A second flush with no further change writes nothing.
        assert!(store.store_metadata("hg2git").is_null());
        assert!(store.store_metadata("git2hg").is_null());
        store.odb.finalize(false);
    }

    #[test]
    fn test_heads_init_from_ref_tip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.odb.ensure_empty_tree();
        let p1 = test_commit(&mut store, b"head one");
        let p2 = test_commit(&mut store, b"head two");
        let mut commit = Vec::new();
        writeln!(commit, "tree {}", EMPTY_TREE).unwrap();
        writeln!(commit, "parent {}", p1).unwrap();
        writeln!(commit, "parent {}", p2).unwrap();
        commit.extend_from_slice(
            b"author  <cinnabar@git> 0 +0000\ncommitter  <cinnabar@git> 0 +0000\n\n",
        );
        let tip = CommitId::from_unchecked(store.odb.store_object(
            ObjectType::Commit,
            &commit,
            None,
        ));
        store.set_branch(CHANGESETS_REF.as_bytes(), tip);
        let mut expected = vec![p1, p2];
        expected.sort();
        assert_eq!(store.changeset_heads(), &expected);
        store.odb.finalize(false);
    }

    #[test]
    fn test_manifest_heads_flat_tree_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.odb.ensure_empty_tree();
        let p1 = test_commit(&mut store, b"flat manifests");
        let p2 = test_commit(&mut store, b"real manifest head");
        let mut commit = Vec::new();
        writeln!(commit, "tree {}", EMPTY_TREE).unwrap();
        writeln!(commit, "parent {}", p1).unwrap();
        writeln!(commit, "parent {}", p2).unwrap();
        commit.extend_from_slice(
            b"author  <cinnabar@git> 0 +0000\ncommitter  <cinnabar@git> 0 +0000\n\n\
              has-flat-manifest-tree",
        );
        let tip = CommitId::from_unchecked(store.odb.store_object(
            ObjectType::Commit,
            &commit,
            None,
        ));
        store.set_branch(MANIFESTS_REF.as_bytes(), tip);
        // The first parent is skipped.
        assert_eq!(store.manifest_heads(), &[p2]);
        store.odb.finalize(false);
    }

    #[test]
    fn test_store_changegroup_stream() {
        fn frame(
            node: HgObjectId,
            parents: [HgObjectId; 2],
            diffs: &[(u32, u32, &[u8])],
        ) -> Vec<u8> {
            let mut chunk = Vec::new();
            chunk.extend_from_slice(node.as_raw_bytes());
            chunk.extend_from_slice(parents[0].as_raw_bytes());
            chunk.extend_from_slice(parents[1].as_raw_bytes());
            chunk.extend_from_slice(&[0xff; 20]);
            for (start, end, data) in diffs {
                chunk.write_u32::<BigEndian>(*start).unwrap();
                chunk.write_u32::<BigEndian>(*end).unwrap();
                chunk.write_u32::<BigEndian>(data.len() as u32).unwrap();
                chunk.extend_from_slice(data);
            }
            let mut framed = Vec::new();
            framed
                .write_u32::<BigEndian>(chunk.len() as u32 + 4)
                .unwrap();
            framed.extend_from_slice(&chunk);
            framed
        }

        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let mut stream = Vec::new();
        // Changesets: one chunk, skipped by the store.
        stream.extend_from_slice(&frame(hg(10), NULL2, &[(0, 0, b"whatever")]));
        stream.extend_from_slice(&[0; 4]);
        // Manifests.
        stream.extend_from_slice(&frame(hg(1), NULL2, &[(0, 0, MANIFEST_LINE)]));
        stream.extend_from_slice(&[0; 4]);
        // One file, with two revisions: the first deltas against
        // parent1 (null), the second against the first.
        stream.extend_from_slice(&frame(hg(20), NULL2, &[(0, 0, b"a")]));
        stream.extend_from_slice(&frame(hg(2), NULL2, &[(0, 0, b"hello\n")]));
        stream.extend_from_slice(&frame(
            hg(3),
            [hg(2), HgObjectId::NULL],
            &[(0, 6, b"HELLO\n")],
        ));
        stream.extend_from_slice(&[0; 4]);
        // End of file sections.
        stream.extend_from_slice(&[0; 4]);

        store.store_changegroup(&stream[..], 1);
        assert!(store.hg2git.get_note(hg(10)).is_none());
        assert!(store.hg2git.get_note(hg(1)).is_some());
        let oid = store.hg2git.get_note(hg(3)).unwrap();
        assert_eq!(store.odb.read_object(oid).unwrap().1, b"HELLO\n");
        store.odb.finalize(false);
    }

    #[test]
    fn test_cleanup_without_done_discards_pack() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.require_explicit_termination = true;
        store.store_file(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, b"hello\n")],
        ));
        store.cleanup();
        let pack_dir = dir.path().join("objects").join("pack");
        assert_eq!(fs::read_dir(pack_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_cleanup_writes_refs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.store_manifest(&chunk(
            hg(1),
            NULL2,
            HgObjectId::NULL,
            &[(0, 0, MANIFEST_LINE)],
        ));
        let (cid, _) = manifest_commit(&store, hg(1));
        store.cleanup();
        let content = fs::read_to_string(dir.path().join(MANIFESTS_REF)).unwrap();
        assert_eq!(content.trim_end(), cid.to_string());
        // A new store picks the ref back up; the heads are the tip
        // commit's parents.
        let mut store2 = Store::open(dir.path(), 1024, Checks::empty(), Experiments::empty());
        assert!(store2.manifest_heads().is_empty());
    }

    #[test]
    fn test_shallow_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let cid = CommitId::from_str("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let other = CommitId::from_str("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        fs::write(
            dir.path().join("shallow"),
            format!("{}\n{}\n", cid, other),
        )
        .unwrap();
        let mut store = store(dir.path());
        store.unregister_shallow(cid);
        store.cleanup();
        let content = fs::read_to_string(dir.path().join("shallow")).unwrap();
        assert_eq!(content.trim_end(), other.to_string());
    }
}
