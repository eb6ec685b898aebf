/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Streaming packfile writer.
//!
//! The pack is written append-only, but objects just stored need to be
//! read back almost immediately, to serve as delta bases or to be
//! reconstructed for metadata purposes. To avoid unmapping and remapping
//! the growing file for every read, all writes are mirrored into a tail
//! window covering the last `window_size` bytes of the pack, and when
//! that window slides forward, a read-only window over the preceding
//! data is pinned, overlapping the tail by 20 bytes so that no object
//! boundary ends up in an unreachable gap.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress};

use crate::git::GitObjectId;
use crate::oid::ObjectId;
use crate::util::die;

const PACK_SIGNATURE: &[u8; 4] = b"PACK";
const PACK_VERSION: u32 = 2;
const HASH_BLOCK: usize = 8 * 1024;

pub const OBJ_OFS_DELTA: u8 = 6;
pub const OBJ_REF_DELTA: u8 = 7;

#[cfg(unix)]
fn read_exact_at(f: &File, buf: &mut [u8], offset: u64) {
    use std::os::unix::fs::FileExt;
    f.read_exact_at(buf, offset).unwrap();
}

#[cfg(windows)]
fn read_exact_at(f: &File, buf: &mut [u8], offset: u64) {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = f.seek_read(&mut buf[pos..], offset + pos as u64).unwrap();
        if n == 0 {
            die!("unexpected end of pack file");
        }
        pos += n;
    }
}

#[cfg(unix)]
fn write_all_at(f: &File, buf: &[u8], offset: u64) {
    use std::os::unix::fs::FileExt;
    f.write_all_at(buf, offset).unwrap();
}

#[cfg(windows)]
fn write_all_at(f: &File, buf: &[u8], offset: u64) {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = f.seek_write(&buf[pos..], offset + pos as u64).unwrap();
        pos += n;
    }
}

/// Byte-addressed access into pack data.
pub trait PackData {
    fn data_size(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]);
}

pub struct PackWriter {
    file: File,
    tmp_path: PathBuf,
    pack_dir: PathBuf,
    // Bytes accepted but not yet written to the file.
    buffer: Vec<u8>,
    // Like git's accounting for finished packs, this includes the 20
    // trailing hash bytes that only get written at finalization, so
    // the window arithmetic matches a finished pack's.
    pack_size: u64,
    window_size: u64,
    tail_offset: u64,
    tail: Vec<u8>,
    // Read-only window pinned over the data preceding the tail.
    prev: Option<(u64, Vec<u8>)>,
}

impl PackWriter {
    pub fn new(pack_dir: &Path, window_size: u64) -> PackWriter {
        assert!(window_size >= 1024);
        fs::create_dir_all(pack_dir).unwrap();
        let tmp_path = pack_dir.join(format!("tmp_pack_{}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .unwrap_or_else(|e| die!("Cannot create pack file: {}", e));
        let mut result = PackWriter {
            file,
            tmp_path,
            pack_dir: pack_dir.to_path_buf(),
            buffer: Vec::with_capacity(HASH_BLOCK),
            pack_size: 20,
            window_size,
            tail_offset: 0,
            tail: Vec::with_capacity(window_size as usize + 20),
            prev: None,
        };
        let mut header = Vec::new();
        header.extend_from_slice(PACK_SIGNATURE);
        header.write_u32::<BigEndian>(PACK_VERSION).unwrap();
        // Object count, fixed up at finalization.
        header.write_u32::<BigEndian>(0).unwrap();
        result.write(&header);
        result
    }

    /// Bytes written so far, which is also the offset the next entry
    /// will land at.
    pub fn pack_size(&self) -> u64 {
        self.pack_size - 20
    }

    pub fn write(&mut self, buf: &[u8]) {
        for chunk in buf.chunks(HASH_BLOCK) {
            self.write_chunk(chunk);
        }
    }

    fn write_chunk(&mut self, buf: &[u8]) {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= HASH_BLOCK {
            self.flush();
        }
        self.pack_size += buf.len() as u64;

        let window_size = self.window_size + if self.tail_offset > 0 { 20 } else { 0 };
        if ((self.tail.len() + buf.len()) as u64) < window_size {
            self.tail.extend_from_slice(buf);
        } else {
            self.slide(buf);
        }
        debug_assert_eq!(
            self.tail_offset + self.tail.len() as u64 + 20,
            self.pack_size
        );
    }

    /// Slides the tail window so that it starts at an offset multiple of
    /// the window size minus 20 (we want 20 bytes of overlap with the
    /// preceding window, so that reads around the boundary never fall in
    /// a gap).
    fn slide(&mut self, buf: &[u8]) {
        self.flush();
        let w = self.window_size;
        let offset = ((self.pack_size - 20) / w) * w - 20;
        assert_ne!(offset, self.tail_offset);

        // Pin a window on the data preceding the new tail.
        let win_offset = offset + 20 - w;
        let mut win = vec![0; w as usize];
        read_exact_at(&self.file, &mut win, win_offset);
        self.prev = Some((win_offset, win));

        // The new tail contents come from the old tail up to where it
        // stops, and from the bytes being written for the remainder.
        let boundary = self.pack_size - 20 - buf.len() as u64;
        let mut tail = Vec::with_capacity(w as usize + 20);
        if offset < boundary {
            let start = (offset - self.tail_offset) as usize;
            tail.extend_from_slice(&self.tail[start..]);
        }
        let start_in_buf = offset.saturating_sub(boundary) as usize;
        tail.extend_from_slice(&buf[start_in_buf..]);
        self.tail = tail;
        self.tail_offset = offset;
    }

    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer).unwrap();
            self.buffer.clear();
        }
    }

    /// Deletes the pack without finalizing it.
    pub fn discard(self) {
        drop(self.file);
        fs::remove_file(&self.tmp_path).ok();
    }

    /// Fixes up the object count, appends the pack checksum, writes the
    /// pack index, and gives the pack its final name. `entries` is the
    /// (oid, offset, crc32) list of all stored objects.
    pub fn finalize(mut self, entries: &mut [(GitObjectId, u64, u32)]) -> PathBuf {
        self.flush();
        let mut count_buf = [0; 4];
        BigEndian::write_u32(&mut count_buf, entries.len() as u32);
        write_all_at(&self.file, &count_buf, 8);

        let data_end = self.pack_size - 20;
        let mut hash = GitObjectId::create();
        let mut remaining = data_end;
        let mut offset = 0;
        let mut buf = vec![0; HASH_BLOCK];
        while remaining > 0 {
            let n = std::cmp::min(remaining, HASH_BLOCK as u64) as usize;
            read_exact_at(&self.file, &mut buf[..n], offset);
            hash.update(&buf[..n]);
            offset += n as u64;
            remaining -= n as u64;
        }
        let pack_hash = hash.finalize();
        write_all_at(&self.file, pack_hash.as_raw_bytes(), data_end);
        self.file.sync_data().ok();
        drop(self.file);

        entries.sort_by(|(a, _, _), (b, _, _)| a.cmp(b));
        let idx = write_idx(entries, pack_hash);

        let final_pack = self.pack_dir.join(format!("pack-{}.pack", pack_hash));
        let final_idx = self.pack_dir.join(format!("pack-{}.idx", pack_hash));
        let tmp_idx = self.tmp_path.with_extension("idx");
        fs::write(&tmp_idx, idx).unwrap();
        fs::rename(&self.tmp_path, &final_pack).unwrap();
        fs::rename(&tmp_idx, &final_idx).unwrap();
        final_pack
    }
}

impl PackData for PackWriter {
    fn data_size(&self) -> u64 {
        self.pack_size - 20
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) {
        let mut pos = 0;
        while pos < buf.len() {
            let offset = offset + pos as u64;
            let len = buf.len() - pos;
            if offset >= self.tail_offset {
                let start = (offset - self.tail_offset) as usize;
                if start + len > self.tail.len() {
                    die!("read past the end of the pack");
                }
                buf[pos..].copy_from_slice(&self.tail[start..start + len]);
                return;
            }
            let prev_range = self
                .prev
                .as_ref()
                .filter(|(o, w)| offset >= *o && offset < *o + w.len() as u64);
            let n = if let Some((o, w)) = prev_range {
                let start = (offset - o) as usize;
                let n = std::cmp::min(len, w.len() - start);
                buf[pos..pos + n].copy_from_slice(&w[start..start + n]);
                n
            } else {
                // Everything below the tail window was flushed when the
                // window slid past it.
                let n = std::cmp::min(len as u64, self.tail_offset - offset) as usize;
                read_exact_at(&self.file, &mut buf[pos..pos + n], offset);
                n
            };
            pos += n;
        }
    }
}

/// Writes a version 2 pack index for `entries`, which must be sorted by
/// oid.
fn write_idx(entries: &[(GitObjectId, u64, u32)], pack_hash: GitObjectId) -> Vec<u8> {
    let mut idx = Vec::new();
    idx.extend_from_slice(b"\xfftOc");
    idx.write_u32::<BigEndian>(2).unwrap();
    let mut fanout = [0u32; 256];
    for (oid, _, _) in entries {
        fanout[oid.as_raw_bytes()[0] as usize] += 1;
    }
    let mut cumulative = 0;
    for n in fanout {
        cumulative += n;
        idx.write_u32::<BigEndian>(cumulative).unwrap();
    }
    for (oid, _, _) in entries {
        idx.extend_from_slice(oid.as_raw_bytes());
    }
    for (_, _, crc) in entries {
        idx.write_u32::<BigEndian>(*crc).unwrap();
    }
    let mut large_offsets = Vec::new();
    for (_, offset, _) in entries {
        if *offset < 0x8000_0000 {
            idx.write_u32::<BigEndian>(*offset as u32).unwrap();
        } else {
            idx.write_u32::<BigEndian>(0x8000_0000 | large_offsets.len() as u32)
                .unwrap();
            large_offsets.push(*offset);
        }
    }
    for offset in large_offsets {
        idx.write_u64::<BigEndian>(offset).unwrap();
    }
    idx.extend_from_slice(pack_hash.as_raw_bytes());
    let mut hash = GitObjectId::create();
    hash.update(&idx);
    let idx_hash = hash.finalize();
    idx.extend_from_slice(idx_hash.as_raw_bytes());
    idx
}

/// A pack from a previous session, read through its index.
pub struct FinalizedPack {
    file: File,
    size: u64,
    oids: Vec<GitObjectId>,
    offsets: Vec<u64>,
}

impl FinalizedPack {
    pub fn open(idx_path: &Path) -> Option<FinalizedPack> {
        let mut idx = Vec::new();
        File::open(idx_path).ok()?.read_to_end(&mut idx).ok()?;
        if idx.len() < 8 + 256 * 4 + 40 || &idx[..4] != b"\xfftOc" || BigEndian::read_u32(&idx[4..8]) != 2
        {
            return None;
        }
        let count = BigEndian::read_u32(&idx[8 + 255 * 4..8 + 256 * 4]) as usize;
        let table = 8 + 256 * 4;
        let crc_table = table + count * 20;
        let offset_table = crc_table + count * 4;
        let large_table = offset_table + count * 4;
        if idx.len() < large_table + 40 {
            return None;
        }
        let mut oids = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            oids.push(GitObjectId::from_raw_bytes(&idx[table + i * 20..table + i * 20 + 20]).unwrap());
            let o = BigEndian::read_u32(&idx[offset_table + i * 4..offset_table + i * 4 + 4]);
            if o & 0x8000_0000 != 0 {
                let n = (o & 0x7fff_ffff) as usize;
                offsets.push(BigEndian::read_u64(
                    &idx[large_table + n * 8..large_table + n * 8 + 8],
                ));
            } else {
                offsets.push(u64::from(o));
            }
        }
        let pack_path = idx_path.with_extension("pack");
        let file = File::open(pack_path).ok()?;
        let size = file.metadata().ok()?.len().checked_sub(20)?;
        Some(FinalizedPack {
            file,
            size,
            oids,
            offsets,
        })
    }

    pub fn find(&self, oid: GitObjectId) -> Option<u64> {
        self.oids
            .binary_search(&oid)
            .ok()
            .map(|idx| self.offsets[idx])
    }
}

impl PackData for FinalizedPack {
    fn data_size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) {
        read_exact_at(&self.file, buf, offset);
    }
}

/// Reads the header of the entry at `offset` and reconstructs its full
/// content, recursively resolving delta chains.
pub fn unpack_object_at(pack: &dyn PackData, offset: u64) -> (u8, Vec<u8>) {
    let mut pos = offset;
    let mut byte = [0u8; 1];
    pack.read_at(pos, &mut byte);
    pos += 1;
    let typ = (byte[0] >> 4) & 7;
    let mut size = u64::from(byte[0] & 0xf);
    let mut shift = 4;
    while byte[0] & 0x80 != 0 {
        pack.read_at(pos, &mut byte);
        pos += 1;
        size |= u64::from(byte[0] & 0x7f) << shift;
        shift += 7;
    }
    match typ {
        1..=4 => {
            let (data, _) = inflate_at(pack, pos, size as usize);
            (typ, data)
        }
        OBJ_OFS_DELTA => {
            pack.read_at(pos, &mut byte);
            pos += 1;
            let mut ofs = u64::from(byte[0] & 0x7f);
            while byte[0] & 0x80 != 0 {
                pack.read_at(pos, &mut byte);
                pos += 1;
                ofs = ((ofs + 1) << 7) | u64::from(byte[0] & 0x7f);
            }
            let base_offset = offset
                .checked_sub(ofs)
                .unwrap_or_else(|| die!("invalid delta base offset"));
            let (base_type, base) = unpack_object_at(pack, base_offset);
            let (delta, _) = inflate_at(pack, pos, size as usize);
            (base_type, apply_delta(&base, &delta))
        }
        OBJ_REF_DELTA => die!("ref deltas are not supported in this pack"),
        t => die!("invalid pack entry type {}", t),
    }
}

/// Inflates a zlib stream of known decompressed size starting at
/// `offset`. Returns the data and the compressed length consumed.
fn inflate_at(pack: &dyn PackData, offset: u64, expected: usize) -> (Vec<u8>, u64) {
    let mut inflate = Decompress::new(true);
    let mut output = Vec::with_capacity(expected);
    let mut pos = offset;
    let mut buf = [0u8; 4096];
    loop {
        let avail = std::cmp::min(pack.data_size().saturating_sub(pos), buf.len() as u64) as usize;
        if avail == 0 {
            die!("truncated zlib stream in pack");
        }
        pack.read_at(pos, &mut buf[..avail]);
        let before = inflate.total_in();
        let status = inflate
            .decompress_vec(&buf[..avail], &mut output, FlushDecompress::None)
            .unwrap_or_else(|e| die!("corrupt zlib stream in pack: {}", e));
        pos += inflate.total_in() - before;
        match status {
            flate2::Status::StreamEnd => break,
            _ => {
                if output.len() == output.capacity() {
                    output.reserve(4096);
                }
            }
        }
    }
    if output.len() != expected {
        die!("pack entry size mismatch");
    }
    (output, inflate.total_in())
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> u64 {
    let mut result = 0;
    let mut shift = 0;
    loop {
        let byte = buf[*pos];
        *pos += 1;
        result |= u64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    result
}

/// Entry header for a full (non-delta) object or for the delta data of
/// an OFS_DELTA entry: type and decompressed size.
pub fn entry_header(typ: u8, size: u64) -> Vec<u8> {
    let mut header = Vec::new();
    let mut byte = (typ << 4) | (size & 0xf) as u8;
    let mut size = size >> 4;
    while size != 0 {
        header.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    header.push(byte);
    header
}

/// The offset of an OFS_DELTA base, encoded relative to the delta's own
/// offset.
pub fn ofs_delta_offset(relative: u64) -> Vec<u8> {
    let mut ofs = relative;
    let mut bytes = vec![(ofs & 0x7f) as u8];
    ofs >>= 7;
    while ofs > 0 {
        ofs -= 1;
        bytes.push(0x80 | (ofs & 0x7f) as u8);
        ofs >>= 7;
    }
    bytes.reverse();
    bytes
}

const MAX_COPY: usize = 0xffffff;
const MAX_INSERT: usize = 0x7f;

/// Produces git delta data transforming `src` into `tgt`: the common
/// prefix and suffix become copy instructions, the middle is inserted
/// literally.
pub fn create_delta(src: &[u8], tgt: &[u8]) -> Vec<u8> {
    let prefix = src
        .iter()
        .zip(tgt.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = src[prefix..]
        .iter()
        .rev()
        .zip(tgt[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mut delta = Vec::new();
    write_varint(&mut delta, src.len() as u64);
    write_varint(&mut delta, tgt.len() as u64);
    let mut copy = |delta: &mut Vec<u8>, mut offset: usize, mut len: usize| {
        while len > 0 {
            let n = std::cmp::min(len, MAX_COPY);
            let op_pos = delta.len();
            delta.push(0x80);
            let mut op = 0x80u8;
            for (i, shift) in (0..4).map(|i| (i, i * 8)) {
                let byte = ((offset >> shift) & 0xff) as u8;
                if byte != 0 {
                    delta.push(byte);
                    op |= 1 << i;
                }
            }
            for (i, shift) in (0..3).map(|i| (i, i * 8)) {
                let byte = ((n >> shift) & 0xff) as u8;
                if byte != 0 {
                    delta.push(byte);
                    op |= 0x10 << i;
                }
            }
            delta[op_pos] = op;
            offset += n;
            len -= n;
        }
    };
    if prefix > 0 {
        copy(&mut delta, 0, prefix);
    }
    for chunk in tgt[prefix..tgt.len() - suffix].chunks(MAX_INSERT) {
        delta.push(chunk.len() as u8);
        delta.extend_from_slice(chunk);
    }
    if suffix > 0 {
        copy(&mut delta, src.len() - suffix, suffix);
    }
    delta
}

pub fn apply_delta(src: &[u8], delta: &[u8]) -> Vec<u8> {
    let mut pos = 0;
    let src_size = read_varint(delta, &mut pos);
    if src_size != src.len() as u64 {
        die!("delta base size mismatch");
    }
    let tgt_size = read_varint(delta, &mut pos);
    let mut result = Vec::with_capacity(tgt_size as usize);
    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        if op & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    offset |= (delta[pos] as usize) << (i * 8);
                    pos += 1;
                }
            }
            let mut len = 0usize;
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    len |= (delta[pos] as usize) << (i * 8);
                    pos += 1;
                }
            }
            if len == 0 {
                len = 0x10000;
            }
            if offset + len > src.len() {
                die!("invalid delta copy");
            }
            result.extend_from_slice(&src[offset..offset + len]);
        } else if op != 0 {
            let len = op as usize;
            if pos + len > delta.len() {
                die!("invalid delta insert");
            }
            result.extend_from_slice(&delta[pos..pos + len]);
            pos += len;
        } else {
            die!("invalid delta opcode");
        }
    }
    if result.len() as u64 != tgt_size {
        die!("delta result size mismatch");
    }
    result
}
