//! ocibake CLI
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
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::Verbosity;

/// Main CLI struct
#[derive(Debug, Parser)]
#[clap(
    about = "Declarative OCI image builder",
    long_about = "See 'ocibake help <subcommand>' for more information on a specific subcommand",
    version
)]
pub struct Cli {
    #[clap(subcommand)]
    /// The available subcommand
    pub command: Command,
    /// Verbosity
    #[clap(flatten)]
    pub verbose: Verbosity,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the images described by a recipe into an OCI image layout
    Build {
        /// Path to the build recipe.
        /// By default, ocibake searches for ocibake.yaml in the current directory
        #[clap(short = 'f', long = "file", default_value = "ocibake.yaml")]
        recipe_path: PathBuf,
        /// Directory to write the OCI image layout to.
        /// It is created and initialized if it does not already exist
        #[clap(long = "output", default_value = ".")]
        output: PathBuf,
    },
}
