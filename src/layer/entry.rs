//! Copyright (C) The ocibake authors.
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful,
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU General Public License for more details.
//!
//! You should have received a copy of the GNU General Public License
//! along with this program.  If not, see <https://www.gnu.org/licenses/>.
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::stat::{major, minor};

use super::{CHECKSUM_XATTR, PAX_CHECKSUM_KEY, PAX_XATTR_PREFIX};
use crate::sha256_writer::Sha256Writer;

/// Tar entry kinds the builder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
}

impl EntryKind {
    pub(crate) fn as_tar(self) -> tar::EntryType {
        match self {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::Hardlink => tar::EntryType::Link,
            EntryKind::Char => tar::EntryType::Char,
            EntryKind::Block => tar::EntryType::Block,
            EntryKind::Fifo => tar::EntryType::Fifo,
        }
    }
}

/// A candidate tar entry built from the upper tree.
///
/// `mode` carries only the twelve permission bits; the file type lives in
/// `kind`. `pax` maps full PAX keys (`SCHILY.xattr.<name>`, the content
/// checksum key) to raw byte values.
pub(crate) struct Entry {
    pub rel: String,
    pub kind: EntryKind,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
    pub linkname: Option<PathBuf>,
    pub device: Option<(u32, u32)>,
    pub pax: BTreeMap<String, Vec<u8>>,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
}

impl Entry {
    /// Build a candidate entry for `abs` from an lstat.
    pub(crate) fn from_path(abs: &Path, rel: String) -> Result<Entry> {
        let meta = fs::symlink_metadata(abs)
            .with_context(|| format!("Failed to stat `{}`", abs.display()))?;
        Entry::from_metadata(abs, rel, &meta)
    }

    /// Build a candidate entry from an already-fetched lstat result. PAX
    /// records are not populated here; see [`Entry::load_regular_pax`].
    pub(crate) fn from_metadata(abs: &Path, rel: String, meta: &Metadata) -> Result<Entry> {
        let file_type = meta.file_type();

        let kind = if file_type.is_file() {
            EntryKind::Regular
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_char_device() {
            EntryKind::Char
        } else if file_type.is_block_device() {
            EntryKind::Block
        } else if file_type.is_fifo() {
            EntryKind::Fifo
        } else {
            anyhow::bail!("`{}` has an unsupported file type", abs.display());
        };

        let linkname = if kind == EntryKind::Symlink {
            Some(
                fs::read_link(abs)
                    .with_context(|| format!("Failed to readlink `{}`", abs.display()))?,
            )
        } else {
            None
        };

        let device = match kind {
            EntryKind::Char | EntryKind::Block => {
                let rdev = meta.rdev();
                Some((major(rdev) as u32, minor(rdev) as u32))
            }
            _ => None,
        };

        Ok(Entry {
            rel,
            kind,
            uid: meta.uid().into(),
            gid: meta.gid().into(),
            mode: meta.mode() & 0o7777,
            mtime: meta.mtime().max(0) as u64,
            size: if kind == EntryKind::Regular { meta.len() } else { 0 },
            linkname,
            device,
            pax: BTreeMap::new(),
            dev: meta.dev(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        })
    }

    /// Populate the PAX records of a regular file: the content SHA-256 and
    /// one `SCHILY.xattr.` record per extended attribute.
    pub(crate) fn load_regular_pax(&mut self, abs: &Path) -> Result<()> {
        let checksum = content_sha256(abs)?;
        self.pax
            .insert(PAX_CHECKSUM_KEY.to_string(), checksum.into_bytes());
        for (name, value) in read_xattrs(abs)? {
            self.pax
                .insert(format!("{}{}", PAX_XATTR_PREFIX, name), value);
        }
        Ok(())
    }

    /// The content checksum recorded in the PAX headers, if any.
    pub(crate) fn checksum(&self) -> Option<&[u8]> {
        self.pax.get(PAX_CHECKSUM_KEY).map(Vec::as_slice)
    }

    /// Convert this entry into a whiteout dummy: a zero-length regular file
    /// named `.wh.<base>` carrying the lower entry's ownership and times.
    pub(crate) fn whiteout(rel: String, uid: u64, gid: u64, mode: u32, mtime: u64) -> Entry {
        Entry {
            rel,
            kind: EntryKind::Regular,
            uid,
            gid,
            mode,
            mtime,
            size: 0,
            linkname: None,
            device: None,
            pax: BTreeMap::new(),
            dev: 0,
            ino: 0,
            nlink: 1,
        }
    }

    pub(crate) fn directory(abs: &Path, rel: String) -> Result<Entry> {
        let entry = Entry::from_path(abs, rel)?;
        anyhow::ensure!(
            entry.kind == EntryKind::Directory,
            "`{}` is not a directory",
            abs.display()
        );
        Ok(entry)
    }
}

/// Content SHA-256 of a regular file, preferring the checksum cached in the
/// `user.checksum.sha256` xattr by the build environment over a fresh read.
fn content_sha256(abs: &Path) -> Result<String> {
    match xattr::get(abs, CHECKSUM_XATTR) {
        Ok(Some(cached)) => String::from_utf8(cached)
            .with_context(|| format!("Invalid cached checksum on `{}`", abs.display())),
        Ok(None) => stream_sha256(abs),
        Err(err) if xattrs_unsupported(&err) => stream_sha256(abs),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to read checksum xattr of `{}`", abs.display()))
        }
    }
}

fn stream_sha256(abs: &Path) -> Result<String> {
    let mut file =
        fs::File::open(abs).with_context(|| format!("Failed to open `{}`", abs.display()))?;
    Sha256Writer::hash_reader(&mut file)
        .with_context(|| format!("Failed to read `{}`", abs.display()))
}

/// All extended attributes of `abs`, keyed by attribute name.
///
/// A filesystem without xattr support yields an empty map. Attribute names
/// must be UTF-8; values are raw bytes.
pub(crate) fn read_xattrs(abs: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let names = match xattr::list(abs) {
        Ok(names) => names,
        Err(err) if xattrs_unsupported(&err) => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to list xattrs of `{}`", abs.display()))
        }
    };

    let mut xattrs = BTreeMap::new();
    for name in names {
        let key = name
            .to_str()
            .with_context(|| {
                format!(
                    "Non-UTF-8 xattr name `{}` on `{}`",
                    name.to_string_lossy(),
                    abs.display()
                )
            })?
            .to_string();
        let value = xattr::get(abs, &name)
            .with_context(|| format!("Failed to get xattr `{}` from `{}`", key, abs.display()))?
            .unwrap_or_default();
        xattrs.insert(key, value);
    }
    Ok(xattrs)
}

fn xattrs_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == Errno::ENOTSUP as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Set a user xattr, skipping the test when the filesystem can't store
    /// them (tmpfs on older kernels).
    pub(crate) fn try_setxattr(path: &Path, name: &str, value: &[u8]) -> bool {
        xattr::set(path, name, value).is_ok()
    }

    #[test]
    fn regular_file_gets_streamed_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();

        let mut entry = Entry::from_path(&path, "a.txt".to_string()).unwrap();
        entry.load_regular_pax(&path).unwrap();
        assert_eq!(entry.kind, EntryKind::Regular);
        assert_eq!(entry.size, 5);
        assert_eq!(
            entry.checksum().unwrap(),
            b"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn cached_checksum_xattr_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        if !try_setxattr(&path, CHECKSUM_XATTR, b"cafe") {
            return;
        }

        let mut entry = Entry::from_path(&path, "a.txt".to_string()).unwrap();
        entry.load_regular_pax(&path).unwrap();
        assert_eq!(entry.checksum().unwrap(), b"cafe");
    }

    #[test]
    fn mode_is_masked_to_permission_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"x").unwrap();

        let entry = Entry::from_path(&path, "a.txt".to_string()).unwrap();
        assert_eq!(entry.mode & !0o7777, 0);
    }

    #[test]
    fn symlink_records_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link");
        std::os::unix::fs::symlink("target", &path).unwrap();

        let entry = Entry::from_path(&path, "link".to_string()).unwrap();
        assert_eq!(entry.kind, EntryKind::Symlink);
        assert_eq!(entry.linkname.as_deref(), Some(Path::new("target")));
        assert!(entry.pax.is_empty());
    }
}
