//! Delta layer construction.
//!
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
use std::fs;
use std::io::{Read, Seek, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;

mod emit;
mod entry;
mod lower;
mod walk;

use emit::Emitter;
use entry::{Entry, EntryKind};
use lower::{LowerEntry, LowerView};
use walk::{join_rel, Walker};

pub(crate) const PAX_CHECKSUM_KEY: &str = "freedesktopsdk.checksum.sha256";
pub(crate) const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";
pub(crate) const CHECKSUM_XATTR: &str = "user.checksum.sha256";

/// Write the tar layer that, overlaid on `lowers`, reproduces the tree at
/// `upper`.
///
/// `lowers` are the parent image's decompressed layer tars, base first.
/// Paths present in the folded lower stack but gone from the upper get OCI
/// whiteout entries; upper files whose stat, xattrs and content match the
/// lower's copy are elided so the lower shines through. Every regular file
/// carries its content SHA-256 as a PAX record, and every xattr a
/// `SCHILY.xattr.` record. When `epoch` is set it overrides the mtime of
/// every emitted entry, making the stream byte-reproducible.
///
/// The end-of-archive trailer is written before the output stream is handed
/// back; the caller rewinds it to hash the diff_id.
pub fn create_layer<W, R>(
    output: W,
    upper: impl AsRef<Path>,
    lowers: &mut [R],
    epoch: Option<u64>,
) -> Result<W>
where
    W: Write,
    R: Read + Seek,
{
    let upper = upper.as_ref();
    let view = LowerView::fold(lowers)?;
    let mut emitter = Emitter::new(output, epoch);

    for visit in Walker::new(upper) {
        let visit = visit?;
        let dir_entry = Entry::directory(&visit.abs, visit.rel.clone())?;
        emitter.append(&dir_entry, None)?;

        // Children the lower stack had here but the upper no longer does
        if let Some(children) = view.dir_contents.get(&visit.rel) {
            for name in children {
                if !visit.has_child(name) {
                    let path = join_rel(&visit.rel, name);
                    let old = &view.files[&path];
                    let whiteout = Entry::whiteout(
                        join_rel(&visit.rel, &format!(".wh.{}", name)),
                        old.uid,
                        old.gid,
                        old.mode & 0o7777,
                        old.mtime,
                    );
                    debug!("whiting out {}", path);
                    emitter.append(&whiteout, None)?;
                }
            }
        }

        for name in &visit.files {
            let abs = visit.abs.join(name);
            let rel = join_rel(&visit.rel, name);
            add_file(&mut emitter, &view, lowers, &abs, rel, epoch)?;
        }
    }

    emitter.finish()
}

fn add_file<W, R>(
    emitter: &mut Emitter<W>,
    view: &LowerView,
    lowers: &mut [R],
    abs: &Path,
    rel: String,
    epoch: Option<u64>,
) -> Result<()>
where
    W: Write,
    R: Read + Seek,
{
    let meta = fs::symlink_metadata(abs)
        .with_context(|| format!("Failed to stat `{}`", abs.display()))?;
    // tar has no representation for sockets
    if meta.file_type().is_socket() {
        debug!("skipping socket {}", rel);
        return Ok(());
    }

    let mut entry = Entry::from_metadata(abs, rel, &meta)?;
    if entry.kind == EntryKind::Regular && entry.nlink > 1 {
        if let Some(first) = emitter.register_inode(entry.dev, entry.ino, &entry.rel) {
            entry.kind = EntryKind::Hardlink;
            entry.linkname = Some(first.into());
            entry.size = 0;
        }
    }
    if entry.kind == EntryKind::Regular {
        entry.load_regular_pax(abs)?;
    }
    if let Some(epoch) = epoch {
        entry.mtime = epoch;
    }

    if let Some(old) = view.files.get(&entry.rel) {
        if unchanged_metadata(&entry, old) {
            match entry.kind {
                EntryKind::Regular => {
                    let lower_checksum = match &old.checksum {
                        Some(checksum) => checksum.clone(),
                        // Lower predates checksum caching; hash its content
                        None => old.content_sha256(lowers)?.into_bytes(),
                    };
                    if entry.checksum() == Some(lower_checksum.as_slice()) {
                        debug!("eliding unchanged {}", entry.rel);
                        emitter.forget_arcname(&entry.rel);
                        return Ok(());
                    }
                }
                EntryKind::Hardlink => {
                    // The lower already carries an identical link
                    debug!("eliding unchanged link {}", entry.rel);
                    return Ok(());
                }
                EntryKind::Symlink => {
                    if old.linkname == entry.linkname {
                        debug!("eliding unchanged symlink {}", entry.rel);
                        return Ok(());
                    }
                }
                _ => bail!(
                    "`{}` matches a lower entry but has unexpected type {:?}",
                    abs.display(),
                    entry.kind
                ),
            }
        }
    }

    if entry.kind == EntryKind::Regular {
        let mut content = fs::File::open(abs)
            .with_context(|| format!("Failed to open `{}`", abs.display()))?;
        emitter.append(&entry, Some(&mut content))
    } else {
        emitter.append(&entry, None)
    }
}

/// Stat-level equivalence between an upper candidate and a lower member.
/// Only the `SCHILY.xattr.` PAX subset takes part; content equality is
/// checked separately through the SHA-256 values. The lower's mode is
/// masked like the upper's, in case its builder left file type bits in.
fn unchanged_metadata(entry: &Entry, old: &LowerEntry) -> bool {
    entry.kind.as_tar() == old.entry_type
        && entry.uid == old.uid
        && entry.gid == old.gid
        && entry.mode == old.mode & 0o7777
        && entry.mtime == old.mtime
        && entry.size == old.size
        && xattr_records(&entry.pax).eq(old.xattrs.iter())
}

fn xattr_records(
    pax: &BTreeMap<String, Vec<u8>>,
) -> impl Iterator<Item = (&String, &Vec<u8>)> {
    pax.iter()
        .filter(|(key, _)| key.starts_with(PAX_XATTR_PREFIX))
}
