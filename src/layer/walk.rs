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
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// One directory of the upper tree, with its children partitioned and
/// sorted. `rel` is `.` for the upper root.
pub(crate) struct DirVisit {
    pub abs: PathBuf,
    pub rel: String,
    /// Basenames of subdirectories, ascending. Symlinks to directories are
    /// not directories here.
    pub dirs: Vec<String>,
    /// Basenames of everything else, ascending.
    pub files: Vec<String>,
}

impl DirVisit {
    pub(crate) fn has_child(&self, name: &str) -> bool {
        self.files.binary_search_by(|f| f.as_str().cmp(name)).is_ok()
            || self.dirs.binary_search_by(|d| d.as_str().cmp(name)).is_ok()
    }
}

/// Depth-first traversal of the upper tree.
///
/// Directories pop in ascending lexicographic order; each visit carries the
/// directory's sorted children so the caller can emit files before
/// descending. The root is visited first.
pub(crate) struct Walker {
    stack: Vec<(PathBuf, String)>,
}

impl Walker {
    pub(crate) fn new(upper: &Path) -> Walker {
        Walker {
            stack: vec![(upper.to_path_buf(), String::from("."))],
        }
    }

    fn visit(&mut self, abs: PathBuf, rel: String) -> Result<DirVisit> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let entries = fs::read_dir(&abs)
            .with_context(|| format!("Failed to read directory `{}`", abs.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("Failed to read directory `{}`", abs.display()))?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|name| {
                    anyhow::anyhow!(
                        "Non-UTF-8 file name `{}` in `{}`",
                        name.to_string_lossy(),
                        abs.display()
                    )
                })?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("Failed to stat `{}`", entry.path().display()))?;
            if file_type.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        dirs.sort_unstable();
        files.sort_unstable();

        for dir in dirs.iter().rev() {
            self.stack
                .push((abs.join(dir), join_rel(&rel, dir)));
        }

        Ok(DirVisit { abs, rel, dirs, files })
    }
}

impl Iterator for Walker {
    type Item = Result<DirVisit>;

    fn next(&mut self) -> Option<Self::Item> {
        let (abs, rel) = self.stack.pop()?;
        Some(self.visit(abs, rel))
    }
}

/// Join a child basename onto a layer-relative directory path.
pub(crate) fn join_rel(dir: &str, name: &str) -> String {
    if dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_order_is_depth_first_ascending() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("b/nested")).unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("z.txt"), b"z").unwrap();
        fs::write(tmp.path().join("b/c.txt"), b"c").unwrap();

        let visits: Vec<DirVisit> = Walker::new(tmp.path())
            .collect::<Result<_>>()
            .unwrap();
        let rels: Vec<&str> = visits.iter().map(|v| v.rel.as_str()).collect();
        assert_eq!(rels, vec![".", "a", "b", "b/nested"]);

        assert_eq!(visits[0].dirs, vec!["a", "b"]);
        assert_eq!(visits[0].files, vec!["z.txt"]);
        assert_eq!(visits[2].files, vec!["c.txt"]);
    }

    #[test]
    fn symlink_to_directory_is_not_recursed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", tmp.path().join("link")).unwrap();

        let visits: Vec<DirVisit> = Walker::new(tmp.path())
            .collect::<Result<_>>()
            .unwrap();
        let rels: Vec<&str> = visits.iter().map(|v| v.rel.as_str()).collect();
        assert_eq!(rels, vec![".", "real"]);
        assert_eq!(visits[0].files, vec!["link"]);
    }

    #[test]
    fn children_sorted_within_directory() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["c", "a", "b"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        let visit = Walker::new(tmp.path()).next().unwrap().unwrap();
        assert_eq!(visit.files, vec!["a", "b", "c"]);
        assert!(visit.has_child("b"));
        assert!(!visit.has_child("d"));
    }
}
