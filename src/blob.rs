//! Content-addressed blob storage for OCI layout directories.
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
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use oci_spec::image::{Descriptor, DescriptorBuilder, MediaType};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::sha256_writer::Sha256Writer;

/// A blob being written into an OCI layout directory.
///
/// Data accumulates in a temporary file next to the blob store and is
/// promoted to `blobs/sha256/<digest>` when finished, so the layout never
/// contains a partially written blob.
pub(crate) struct BlobWriter {
    inner: Sha256Writer<NamedTempFile>,
    layout: PathBuf,
    media_type: MediaType,
}

impl BlobWriter {
    pub(crate) fn new(layout: impl AsRef<Path>, media_type: MediaType) -> Result<BlobWriter> {
        let layout = layout.as_ref().to_path_buf();
        // Same filesystem as the blob store, so promotion is a rename
        let tmp = NamedTempFile::new_in(&layout).with_context(|| {
            format!(
                "Failed to create temporary blob in `{}`",
                layout.display()
            )
        })?;
        Ok(BlobWriter {
            inner: Sha256Writer::new(tmp),
            layout,
            media_type,
        })
    }

    /// Promote the blob into the store and return its descriptor.
    pub(crate) fn finish(mut self) -> Result<Descriptor> {
        self.inner.flush()?;
        let (digest, tmp) = self.inner.finish();
        let size: i64 = tmp
            .as_file()
            .metadata()
            .context("Failed to stat temporary blob")?
            .len()
            .try_into()?;

        let blobs_dir = self.layout.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir).with_context(|| {
            format!("Failed to create blobs directory `{}`", blobs_dir.display())
        })?;
        let blob_path = blobs_dir.join(&digest);
        tmp.persist(&blob_path)
            .map_err(|err| err.error)
            .with_context(|| format!("Failed to write blob `{}`", blob_path.display()))?;

        Ok(DescriptorBuilder::default()
            .media_type(self.media_type)
            .digest(format!("sha256:{}", digest))
            .size(size)
            .build()?)
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write a json object with the specified media type to the specified
/// OCI layout directory
pub(crate) fn write_json_blob<T>(
    value: &T,
    media_type: MediaType,
    layout: impl AsRef<Path>,
) -> Result<Descriptor>
where
    T: ?Sized + Serialize,
{
    let mut writer = BlobWriter::new(layout, media_type)?;
    serde_json::to_writer(&mut writer, value).context("Failed to write blob to temporary file")?;
    writer.finish()
}

/// The path of a blob inside a layout directory, from its `algo:hex` digest.
pub(crate) fn blob_path(layout: impl AsRef<Path>, digest: &str) -> Result<PathBuf> {
    let (algorithm, hex) = digest
        .split_once(':')
        .with_context(|| format!("Malformed digest `{}`", digest))?;
    Ok(layout.as_ref().join("blobs").join(algorithm).join(hex))
}
