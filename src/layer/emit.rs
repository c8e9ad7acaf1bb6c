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
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};

use anyhow::{Context, Result};

use super::entry::{Entry, EntryKind};

/// Write-only sink producing the layer's PAX tar stream.
///
/// Owns the inode map used to turn repeat sightings of an inode into
/// `LNKTYPE` entries. The map is pruned through [`Emitter::forget_arcname`]
/// when the delta pass elides an entry it had tentatively registered.
pub(crate) struct Emitter<W: Write> {
    builder: tar::Builder<W>,
    epoch: Option<u64>,
    inodes: HashMap<(u64, u64), String>,
}

impl<W: Write> Emitter<W> {
    pub(crate) fn new(output: W, epoch: Option<u64>) -> Emitter<W> {
        Emitter {
            builder: tar::Builder::new(output),
            epoch,
            inodes: HashMap::new(),
        }
    }

    /// Record the first arcname seen for an inode, or return the existing
    /// one (meaning the caller should emit a hard link to it).
    pub(crate) fn register_inode(&mut self, dev: u64, ino: u64, arcname: &str) -> Option<String> {
        match self.inodes.get(&(dev, ino)) {
            Some(first) => Some(first.clone()),
            None => {
                self.inodes.insert((dev, ino), arcname.to_string());
                None
            }
        }
    }

    /// Drop any inode registration pointing at `arcname`, so a later
    /// hard-linked sibling does not link to a header that was never written.
    pub(crate) fn forget_arcname(&mut self, arcname: &str) {
        self.inodes.retain(|_, first| first != arcname);
    }

    /// Write one entry: a PAX extension block when the entry carries PAX
    /// records, then the header (and content for regular files).
    pub(crate) fn append(&mut self, entry: &Entry, content: Option<&mut dyn Read>) -> Result<()> {
        if !entry.pax.is_empty() {
            self.append_pax(&entry.pax)
                .with_context(|| format!("Failed to write PAX header for `{}`", entry.rel))?;
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry.kind.as_tar());
        header.set_mode(entry.mode);
        header.set_uid(entry.uid);
        header.set_gid(entry.gid);
        header.set_mtime(self.epoch.unwrap_or(entry.mtime));
        header.set_size(if entry.kind == EntryKind::Regular {
            entry.size
        } else {
            0
        });
        if let Some((major, minor)) = entry.device {
            header.set_device_major(major)?;
            header.set_device_minor(minor)?;
        }

        match entry.kind {
            EntryKind::Symlink | EntryKind::Hardlink => {
                let target = entry
                    .linkname
                    .as_ref()
                    .with_context(|| format!("Link entry `{}` has no target", entry.rel))?;
                self.builder
                    .append_link(&mut header, &entry.rel, target)
                    .with_context(|| format!("Failed to append link `{}`", entry.rel))?;
            }
            EntryKind::Directory => {
                let name = if entry.rel == "." {
                    String::from("./")
                } else {
                    format!("{}/", entry.rel)
                };
                self.builder
                    .append_data(&mut header, &name, io::empty())
                    .with_context(|| format!("Failed to append directory `{}`", name))?;
            }
            EntryKind::Regular => {
                let result = match content {
                    Some(content) => self.builder.append_data(&mut header, &entry.rel, content),
                    None => self.builder.append_data(&mut header, &entry.rel, io::empty()),
                };
                result.with_context(|| format!("Failed to append `{}`", entry.rel))?;
            }
            EntryKind::Char | EntryKind::Block | EntryKind::Fifo => {
                self.builder
                    .append_data(&mut header, &entry.rel, io::empty())
                    .with_context(|| format!("Failed to append `{}`", entry.rel))?;
            }
        }
        Ok(())
    }

    // Write the PAX records as an extended header entry. Records go out in
    // map order, so the byte stream is stable for a given record set.
    // Record format: "<len> <key>=<value>\n" where len counts itself.
    // https://mgorny.pl/articles/portability-of-tar-features.html#id25
    fn append_pax(&mut self, pax: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut pax_header = tar::Header::new_ustar();
        let mut pax_data = Vec::new();
        for (key, value) in pax {
            let data_len = key.len() + value.len() + 3;
            // Length of the length field itself
            let mut len_len = 1;
            while data_len + len_len >= 10usize.pow(len_len.try_into().unwrap()) {
                len_len += 1;
            }
            write!(pax_data, "{} ", data_len + len_len)?;
            pax_data.write_all(key.as_bytes())?;
            pax_data.write_all(b"=")?;
            pax_data.write_all(value)?;
            pax_data.write_all(b"\n")?;
        }
        pax_header.set_size(pax_data.len() as u64);
        pax_header.set_entry_type(tar::EntryType::XHeader);
        pax_header.set_cksum();
        self.builder.append(&pax_header, &*pax_data)?;
        Ok(())
    }

    /// Write the end-of-archive trailer and hand back the output stream.
    pub(crate) fn finish(self) -> Result<W> {
        self.builder
            .into_inner()
            .context("Failed to finish layer archive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rel: &str, kind: EntryKind) -> Entry {
        Entry {
            rel: rel.to_string(),
            kind,
            uid: 0,
            gid: 0,
            mode: if kind == EntryKind::Directory { 0o755 } else { 0o644 },
            mtime: 999,
            size: 0,
            linkname: None,
            device: None,
            pax: BTreeMap::new(),
            dev: 0,
            ino: 0,
            nlink: 1,
        }
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn directories_get_trailing_slash() {
        let mut emitter = Emitter::new(Vec::new(), None);
        emitter.append(&entry(".", EntryKind::Directory), None).unwrap();
        emitter.append(&entry("d", EntryKind::Directory), None).unwrap();
        let bytes = emitter.finish().unwrap();
        assert_eq!(entry_names(&bytes), vec!["./", "d/"]);
    }

    #[test]
    fn epoch_overrides_every_mtime() {
        let mut emitter = Emitter::new(Vec::new(), Some(7));
        emitter.append(&entry(".", EntryKind::Directory), None).unwrap();
        let mut file = entry("a.txt", EntryKind::Regular);
        file.size = 2;
        emitter
            .append(&file, Some(&mut b"hi".as_slice() as &mut dyn Read))
            .unwrap();
        let bytes = emitter.finish().unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        for member in archive.entries().unwrap() {
            assert_eq!(member.unwrap().header().mtime().unwrap(), 7);
        }
    }

    #[test]
    fn pax_records_round_trip_in_key_order() {
        let mut file = entry("a.txt", EntryKind::Regular);
        file.size = 2;
        file.pax
            .insert("SCHILY.xattr.user.b".to_string(), b"2".to_vec());
        file.pax
            .insert("SCHILY.xattr.user.a".to_string(), b"1".to_vec());
        file.pax
            .insert("freedesktopsdk.checksum.sha256".to_string(), b"ff".to_vec());

        let mut emitter = Emitter::new(Vec::new(), None);
        emitter
            .append(&file, Some(&mut b"hi".as_slice() as &mut dyn Read))
            .unwrap();
        let bytes = emitter.finish().unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut members = archive.entries().unwrap();
        let mut member = members.next().unwrap().unwrap();
        let keys: Vec<String> = member
            .pax_extensions()
            .unwrap()
            .expect("pax records")
            .map(|ext| ext.unwrap().key().unwrap().to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "SCHILY.xattr.user.a",
                "SCHILY.xattr.user.b",
                "freedesktopsdk.checksum.sha256"
            ]
        );
    }

    #[test]
    fn inode_cache_registers_and_forgets() {
        let mut emitter = Emitter::new(Vec::new(), None);
        assert_eq!(emitter.register_inode(1, 42, "first"), None);
        assert_eq!(
            emitter.register_inode(1, 42, "second"),
            Some("first".to_string())
        );
        emitter.forget_arcname("first");
        assert_eq!(emitter.register_inode(1, 42, "second"), None);
    }

    #[test]
    fn hardlink_entries_reference_first_arcname() {
        let mut emitter = Emitter::new(Vec::new(), None);
        let mut link = entry("copy", EntryKind::Hardlink);
        link.linkname = Some("original".into());
        emitter.append(&link, None).unwrap();
        let bytes = emitter.finish().unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let member = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(member.header().entry_type(), tar::EntryType::Link);
        assert_eq!(
            member.link_name().unwrap().unwrap().to_string_lossy(),
            "original"
        );
    }
}
