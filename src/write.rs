//! Colored status lines on stderr.
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
use std::fmt::Display;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

// Width of the right-aligned label column. Must cover the longest label
// the build pipeline prints ("Creating").
const LABEL_WIDTH: usize = 8;

fn status(label: &str, message: impl Display, color: Color, bold: bool) -> io::Result<()> {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(color)).set_bold(bold);
    stderr.set_color(&spec)?;
    write!(stderr, "{:>width$} ", label, width = LABEL_WIDTH)?;
    stderr.reset()?;
    writeln!(stderr, "{}", message)
}

/// Report progress of a build step on stderr, with a green label.
///
/// # Errors
///
/// Fails only when stderr itself cannot be written to
pub fn ok(label: &str, message: impl Display) -> io::Result<()> {
    status(label, message, Color::Green, false)
}

/// Call out something suspicious that does not stop the build, with a
/// yellow label.
///
/// # Errors
///
/// Fails only when stderr itself cannot be written to
pub fn warn(label: &str, message: impl Display) -> io::Result<()> {
    status(label, message, Color::Yellow, false)
}

/// Report a build failure on stderr, with a bold red label.
///
/// # Errors
///
/// Fails only when stderr itself cannot be written to
pub fn error(label: &str, message: impl Display) -> io::Result<()> {
    status(label, message, Color::Red, true)
}
