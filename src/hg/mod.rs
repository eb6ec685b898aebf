/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use bstr::{BStr, ByteSlice};
use hex_literal::hex;
use sha1::Sha1;

use crate::oid::{oid_type, ObjectId};
use crate::util::FromBytes;

oid_type!(HgObjectId for Sha1);

oid_type!(HgChangesetId(HgObjectId));
oid_type!(HgManifestId(HgObjectId));
oid_type!(HgFileId(HgObjectId));

impl HgFileId {
    /// Node id of the empty mercurial file. It hashes its (empty)
    /// content with null parents, so it is the same in every repository,
    /// and mercurial never stores it.
    pub const EMPTY: HgFileId =
        HgFileId::from_raw_bytes_array(hex!("b80de5d138758541c5f05265ad144ab9fa86d1db"));
}

/// Mercurial nodeid of a revision: sha1 of the sorted parent nodeids
/// followed by the revision text.
pub fn hash_data(parent1: HgObjectId, parent2: HgObjectId, data: &[u8]) -> HgObjectId {
    let mut parents = [parent1, parent2];
    parents.sort();
    let mut hash = HgObjectId::create();
    for p in parents {
        hash.update(p.as_raw_bytes());
    }
    hash.update(data);
    hash.finalize()
}

/// File attribute, as recorded in a Mercurial manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HgFileAttr {
    Regular,
    Executable,
    Symlink,
}

impl HgFileAttr {
    pub fn as_bstr(&self) -> &'static BStr {
        match self {
            HgFileAttr::Regular => b"".as_bstr(),
            HgFileAttr::Executable => b"x".as_bstr(),
            HgFileAttr::Symlink => b"l".as_bstr(),
        }
    }
}

impl FromBytes for HgFileAttr {
    type Err = ();

    fn from_bytes(b: &[u8]) -> Result<Self, Self::Err> {
        match b {
            b"" => Ok(HgFileAttr::Regular),
            b"x" => Ok(HgFileAttr::Executable),
            b"l" => Ok(HgFileAttr::Symlink),
            _ => Err(()),
        }
    }
}

/// One line of a mercurial manifest: `<path>\0<40-hex><attr?>\n`.
#[derive(Debug, PartialEq, Eq)]
pub struct ManifestLine<'a> {
    pub path: &'a [u8],
    pub fid: HgFileId,
    pub attr: HgFileAttr,
}

/// Splits the next manifest line off the front of `slice`.
pub fn split_manifest_line<'a>(slice: &mut &'a [u8]) -> Result<Option<ManifestLine<'a>>, ()> {
    if slice.is_empty() {
        return Ok(None);
    }
    let nul = slice.find_byte(b'\0').ok_or(())?;
    let (path, mut remainder) = slice.split_at(nul);
    if path.is_empty() {
        return Err(());
    }
    remainder = &remainder[1..];
    if remainder.len() < 41 {
        return Err(());
    }
    let fid = HgFileId::from_bytes(&remainder[..40]).map_err(|_| ())?;
    remainder = &remainder[40..];
    let attr = match remainder[0] {
        b'x' => {
            remainder = &remainder[1..];
            HgFileAttr::Executable
        }
        b'l' => {
            remainder = &remainder[1..];
            HgFileAttr::Symlink
        }
        b'\n' => HgFileAttr::Regular,
        _ => return Err(()),
    };
    if remainder.first() != Some(&b'\n') {
        return Err(());
    }
    *slice = &remainder[1..];
    Ok(Some(ManifestLine { path, fid, attr }))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_hash_data() {
        // The empty file sentinel is the hash of no content with null
        // parents.
        assert_eq!(
            hash_data(HgObjectId::NULL, HgObjectId::NULL, b""),
            HgObjectId::from(HgFileId::EMPTY)
        );
        // Parents are hashed in sorted order.
        let p1 = HgObjectId::from_raw_bytes(&[2; 20]).unwrap();
        let p2 = HgObjectId::from_raw_bytes(&[1; 20]).unwrap();
        assert_eq!(hash_data(p1, p2, b"data"), hash_data(p2, p1, b"data"));
    }

    #[test]
    fn test_split_manifest_line() {
        let mut buf =
            &b"foo\x001234567890123456789012345678901234567890\n\
               sub/bar\x00123456789012345678901234567890123456789ax\n\
               lnk\x00123456789012345678901234567890123456789bl\n"[..];
        let line = split_manifest_line(&mut buf).unwrap().unwrap();
        assert_eq!(line.path, b"foo");
        assert_eq!(
            line.fid,
            HgFileId::from_str("1234567890123456789012345678901234567890").unwrap()
        );
        assert_eq!(line.attr, HgFileAttr::Regular);
        let line = split_manifest_line(&mut buf).unwrap().unwrap();
        assert_eq!(line.path, b"sub/bar");
        assert_eq!(line.attr, HgFileAttr::Executable);
        let line = split_manifest_line(&mut buf).unwrap().unwrap();
        assert_eq!(line.path, b"lnk");
        assert_eq!(line.attr, HgFileAttr::Symlink);
        assert_eq!(split_manifest_line(&mut buf), Ok(None));
    }

    #[test]
    fn test_split_manifest_line_malformed() {
        // Missing newline.
        let mut buf = &b"foo\x001234567890123456789012345678901234567890"[..];
        assert!(split_manifest_line(&mut buf).is_err());
        // Bad attr byte.
        let mut buf = &b"foo\x001234567890123456789012345678901234567890q\n"[..];
        assert!(split_manifest_line(&mut buf).is_err());
        // Empty path.
        let mut buf = &b"\x001234567890123456789012345678901234567890\n"[..];
        assert!(split_manifest_line(&mut buf).is_err());
    }
}
