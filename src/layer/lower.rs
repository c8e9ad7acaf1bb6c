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
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::walk::join_rel;
use super::{PAX_CHECKSUM_KEY, PAX_XATTR_PREFIX};

const OPAQUE_MARKER: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// A surviving member of the folded lower stack.
///
/// Carries everything the delta comparison needs plus the offset of the
/// member's data in its source tar, so content can be re-read without
/// iterating the archive again.
pub(crate) struct LowerEntry {
    pub tar_id: usize,
    pub entry_type: tar::EntryType,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
    pub linkname: Option<PathBuf>,
    /// `SCHILY.xattr.*` PAX records, full key to raw value.
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Cached content checksum PAX record, if the producing builder wrote one.
    pub checksum: Option<Vec<u8>>,
    data_offset: u64,
}

impl LowerEntry {
    /// Stream this member's content out of its source tar.
    pub(crate) fn content_sha256<R: Read + Seek>(&self, lowers: &mut [R]) -> Result<String> {
        let reader = &mut lowers[self.tar_id];
        reader
            .seek(SeekFrom::Start(self.data_offset))
            .with_context(|| format!("Failed to seek in lower layer {}", self.tar_id))?;
        let mut content = reader.take(self.size);
        crate::sha256_writer::Sha256Writer::hash_reader(&mut content)
            .with_context(|| format!("Failed to read from lower layer {}", self.tar_id))
    }
}

/// The lower stack folded into a flat view: surviving paths and the
/// per-directory listings observed after applying whiteouts.
pub(crate) struct LowerView {
    pub files: HashMap<String, LowerEntry>,
    pub dir_contents: HashMap<String, BTreeSet<String>>,
}

impl LowerView {
    /// Fold the ordered lower tar streams, base first. Whiteout markers are
    /// consumed: `.wh.<name>` removes the named sibling (silently if it was
    /// never there), `.wh..wh..opq` removes everything under its directory.
    pub(crate) fn fold<R: Read + Seek>(lowers: &mut [R]) -> Result<LowerView> {
        let mut files: HashMap<String, LowerEntry> = HashMap::new();

        for (tar_id, reader) in lowers.iter_mut().enumerate() {
            reader
                .seek(SeekFrom::Start(0))
                .with_context(|| format!("Failed to rewind lower layer {}", tar_id))?;
            let mut archive = tar::Archive::new(reader);
            let entries = archive
                .entries()
                .with_context(|| format!("Failed to read lower layer {}", tar_id))?;
            for entry in entries {
                let entry = entry
                    .with_context(|| format!("Corrupt member in lower layer {}", tar_id))?;
                let raw_path = entry
                    .path()
                    .with_context(|| format!("Corrupt member path in lower layer {}", tar_id))?
                    .into_owned();
                let Some(path) = normalize(raw_path.to_str().with_context(|| {
                    format!(
                        "Non-UTF-8 member path `{}` in lower layer {}",
                        raw_path.display(),
                        tar_id
                    )
                })?) else {
                    // The layer root itself; never whiteout-eligible.
                    continue;
                };

                let (parent, base) = split_path(&path);
                if base == OPAQUE_MARKER {
                    if parent == "." {
                        files.clear();
                    } else {
                        let prefix = format!("{}/", parent);
                        files.retain(|p, _| !p.starts_with(&prefix));
                    }
                } else if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
                    files.remove(&join_rel(parent, hidden));
                } else {
                    let lower = read_member(tar_id, entry)
                        .with_context(|| format!("Corrupt member `{}` in lower layer {}", path, tar_id))?;
                    files.insert(path, lower);
                }
            }
        }

        let mut dir_contents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for path in files.keys() {
            let (parent, base) = split_path(path);
            dir_contents
                .entry(parent.to_string())
                .or_default()
                .insert(base.to_string());
        }

        Ok(LowerView { files, dir_contents })
    }
}

fn read_member<R: Read>(tar_id: usize, mut entry: tar::Entry<R>) -> Result<LowerEntry> {
    let mut xattrs = BTreeMap::new();
    let mut checksum = None;
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            let Ok(key) = extension.key() else {
                continue;
            };
            if key == PAX_CHECKSUM_KEY {
                checksum = Some(extension.value_bytes().to_vec());
            } else if key.starts_with(PAX_XATTR_PREFIX) {
                xattrs.insert(key.to_string(), extension.value_bytes().to_vec());
            }
        }
    }

    let header = entry.header();
    Ok(LowerEntry {
        tar_id,
        entry_type: header.entry_type(),
        uid: header.uid()?,
        gid: header.gid()?,
        mode: header.mode()?,
        mtime: header.mtime()?,
        size: entry.size(),
        linkname: entry.link_name()?.map(|name| name.into_owned()),
        xattrs,
        checksum,
        data_offset: entry.raw_file_position(),
    })
}

/// Strip the `./` prefix and any trailing slash from a tar member name.
/// Returns `None` for the root entry itself.
fn normalize(name: &str) -> Option<String> {
    let name = name.strip_prefix("./").unwrap_or(name);
    let name = name.strip_suffix('/').unwrap_or(name);
    if name.is_empty() || name == "." {
        None
    } else {
        Some(name.to_string())
    }
}

/// Split a normalized path into its parent directory (`.` at the top level)
/// and basename.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, base)) => (parent, base),
        None => (".", path),
    }
}
