//! Streaming SHA-256 digests for blobs, diff_ids and content checksums.
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
use openssl::sha::Sha256;
use std::io::{self, Read, Result, Write};

/// A writer wrapper that hashes every byte on its way to the inner sink.
///
/// Blob storage threads its temporary files through this to learn their
/// digest as they are written; [`Sha256Writer::hash_reader`] covers the
/// pull side, for content that is read rather than written (upper files,
/// lower tar members, the finished layer tar).
pub(crate) struct Sha256Writer<W> {
    writer: W,
    sha: Sha256,
}

impl<W> Sha256Writer<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer,
            sha: Sha256::new(),
        }
    }

    /// Consume the wrapper, yielding the lowercase hex digest of everything
    /// written so far along with the inner writer.
    pub(crate) fn finish(self) -> (String, W) {
        (hex::encode(self.sha.finish()), self.writer)
    }
}

impl Sha256Writer<io::Sink> {
    /// Pump a reader to EOF, discarding the bytes, and return the lowercase
    /// hex digest of its content.
    pub(crate) fn hash_reader<R: Read>(reader: &mut R) -> Result<String> {
        let mut writer = Sha256Writer::new(io::sink());
        io::copy(reader, &mut writer)?;
        let (digest, _) = writer.finish();
        Ok(digest)
    }
}

impl<W> Write for Sha256Writer<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        // Hash only what the inner writer accepted, so short writes do not
        // desync the digest from the sink
        let len = self.writer.write(buf)?;
        self.sha.update(&buf[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pull_digests_agree() {
        let mut writer = Sha256Writer::new(Vec::new());
        writer.write_all(b"hello").unwrap();
        let (digest, data) = writer.finish();
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            Sha256Writer::hash_reader(&mut data.as_slice()).unwrap(),
            digest
        );
    }
}
