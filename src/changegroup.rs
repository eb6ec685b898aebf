/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::io::{copy, Read};

use bstr::{BStr, ByteSlice};
use byteorder::{BigEndian, ByteOrder};

use crate::hg::HgObjectId;
use crate::oid::ObjectId;
use crate::util::{die, ImmutBString};

/// One revision of a changegroup stream: a 80- or 100-byte header
/// followed by a sequence of binary diff parts addressing byte ranges of
/// the delta parent's text.
///
/// Changegroup version 1 does not encode the delta node; it is implied
/// to be the node of the preceding chunk (or parent1 for the first chunk
/// of a section). Version 2 encodes it explicitly.
pub struct RevChunk {
    raw: ImmutBString,
    delta_node: Option<HgObjectId>,
}

impl RevChunk {
    /// Wraps raw chunk bytes. `delta_node` carries the externally
    /// provided delta node when the chunk itself doesn't encode one.
    pub fn from_memory(raw: ImmutBString, delta_node: Option<HgObjectId>) -> RevChunk {
        let data_offset = if delta_node.is_some() { 80 } else { 100 };
        if raw.len() < data_offset {
            die!("Invalid revchunk");
        }
        RevChunk { raw, delta_node }
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn node(&self) -> HgObjectId {
        HgObjectId::from_raw_bytes(&self.raw[0..20]).unwrap()
    }

    pub fn parent1(&self) -> HgObjectId {
        HgObjectId::from_raw_bytes(&self.raw[20..40]).unwrap()
    }

    pub fn parent2(&self) -> HgObjectId {
        HgObjectId::from_raw_bytes(&self.raw[40..60]).unwrap()
    }

    pub fn delta_node(&self) -> HgObjectId {
        self.delta_node
            .unwrap_or_else(|| HgObjectId::from_raw_bytes(&self.raw[60..80]).unwrap())
    }

    pub fn iter_diff(&self) -> RevDiffIter {
        RevDiffIter(&self.raw[if self.delta_node.is_some() { 80 } else { 100 }..])
    }
}

/// Reads one length-prefixed chunk. An empty result marks the end of a
/// section.
pub fn read_rev_chunk<R: Read>(mut r: R) -> ImmutBString {
    let mut buf = [0; 4];
    r.read_exact(&mut buf).unwrap();
    let len = BigEndian::read_u32(&buf) as u64;
    if len == 0 {
        return Box::new([]);
    }
    let len = len
        .checked_sub(4)
        .unwrap_or_else(|| die!("Invalid revchunk length"));
    let mut result = Vec::with_capacity(len.try_into().unwrap());
    copy(&mut r.take(len), &mut result).unwrap();
    if result.len() as u64 != len {
        die!("Unexpected end of changegroup stream");
    }
    result.into_boxed_slice()
}

pub struct RevChunkIter<R: Read> {
    version: u8,
    next_delta_node: Option<HgObjectId>,
    reader: R,
}

impl<R: Read> RevChunkIter<R> {
    pub fn new(version: u8, reader: R) -> Self {
        assert!(version == 1 || version == 2);
        RevChunkIter {
            version,
            next_delta_node: None,
            reader,
        }
    }
}

impl<R: Read> Iterator for RevChunkIter<R> {
    type Item = RevChunk;

    fn next(&mut self) -> Option<RevChunk> {
        let buf = read_rev_chunk(&mut self.reader);
        if buf.is_empty() {
            return None;
        }
        let delta_node = (self.version == 1).then(|| {
            self.next_delta_node
                .take()
                .filter(|d| !d.is_null())
                .unwrap_or_else(|| HgObjectId::from_raw_bytes(&buf[20..40]).unwrap())
        });
        let chunk = RevChunk::from_memory(buf, delta_node);
        if self.version == 1 {
            self.next_delta_node = Some(chunk.node());
        }
        Some(chunk)
    }
}

pub struct RevDiffIter<'a>(&'a [u8]);

/// One diff part: replace bytes `[start, end)` of the delta parent's
/// text with `data`.
pub struct RevDiffPart<'a> {
    start: usize,
    end: usize,
    data: &'a [u8],
}

impl<'a> Iterator for RevDiffIter<'a> {
    type Item = RevDiffPart<'a>;

    fn next(&mut self) -> Option<RevDiffPart<'a>> {
        if self.0.is_empty() {
            return None;
        }
        if self.0.len() < 12 {
            die!("Invalid revchunk");
        }
        let start = usize::try_from(BigEndian::read_u32(&self.0[0..4])).unwrap();
        let end = usize::try_from(BigEndian::read_u32(&self.0[4..8])).unwrap();
        let len = usize::try_from(BigEndian::read_u32(&self.0[8..12])).unwrap();
        let slice = &self.0[12..];
        if slice.len() < len {
            die!("Invalid revchunk");
        }
        let (data, slice) = slice.split_at(len);
        self.0 = slice;
        Some(RevDiffPart { start, end, data })
    }
}

impl RevDiffPart<'_> {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn data(&self) -> &BStr {
        self.data.as_bstr()
    }
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;
    use itertools::Itertools;

    use super::*;

    fn raw_chunk(
        node: [u8; 20],
        parent1: [u8; 20],
        parent2: [u8; 20],
        delta_node: Option<[u8; 20]>,
        diffs: &[(u32, u32, &[u8])],
    ) -> Vec<u8> {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&node);
        chunk.extend_from_slice(&parent1);
        chunk.extend_from_slice(&parent2);
        if let Some(delta_node) = delta_node {
            chunk.extend_from_slice(&delta_node);
        }
        // linknode, unused here
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

    #[test]
    fn test_rev_chunk_cg2() {
        let mut stream = raw_chunk(
            [1; 20],
            [2; 20],
            [0; 20],
            Some([3; 20]),
            &[(0, 6, b"hello\n"), (10, 10, b"world\n")],
        );
        stream.extend_from_slice(&[0; 4]);
        let chunks = RevChunkIter::new(2, &stream[..]).collect_vec();
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.node().as_raw_bytes(), &[1; 20]);
        assert_eq!(chunk.parent1().as_raw_bytes(), &[2; 20]);
        assert!(chunk.parent2().is_null());
        assert_eq!(chunk.delta_node().as_raw_bytes(), &[3; 20]);
        let diffs = chunk.iter_diff().collect_vec();
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].start(), 0);
        assert_eq!(diffs[0].end(), 6);
        assert_eq!(diffs[0].data(), b"hello\n".as_bstr());
        assert_eq!(diffs[1].start(), 10);
        assert_eq!(diffs[1].data(), b"world\n".as_bstr());
    }

    #[test]
    fn test_rev_chunk_cg1_delta_nodes() {
        // First chunk deltas against its parent1, subsequent ones
        // against the preceding chunk.
        let mut stream = raw_chunk([1; 20], [4; 20], [0; 20], None, &[(0, 0, b"a")]);
        stream.extend_from_slice(&raw_chunk([2; 20], [1; 20], [0; 20], None, &[(0, 1, b"b")]));
        stream.extend_from_slice(&[0; 4]);
        let chunks = RevChunkIter::new(1, &stream[..]).collect_vec();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].delta_node().as_raw_bytes(), &[4; 20]);
        assert_eq!(chunks[1].delta_node().as_raw_bytes(), &[1; 20]);
    }

    #[test]
    #[should_panic(expected = "Invalid revchunk")]
    fn test_truncated_diff_part() {
        // A cg2 header followed by a diff part whose length field points
        // past the end of the chunk.
        let mut chunk = vec![0u8; 100];
        chunk.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9]);
        chunk.extend_from_slice(b"abc");
        let mut stream = ((chunk.len() + 4) as u32).to_be_bytes().to_vec();
        stream.extend_from_slice(&chunk);
        let chunks = RevChunkIter::new(2, &stream[..]).collect_vec();
        chunks[0].iter_diff().count();
    }
}
