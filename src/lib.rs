#![deny(missing_docs)]
//! Assemble OCI image layouts from declarative build recipes
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
use std::{path::Path, process::ExitCode, time::Instant};

use anyhow::{Context, Result};
use clap::Parser;

mod blob;
/// Command line interface
pub mod cli;
/// Image assembly from recipes
pub mod image;
/// Delta layer construction
pub mod layer;
mod oci;
/// Build recipe model
pub mod recipe;
mod sha256_writer;
/// Status message output
pub mod write;

use cli::Command;
use recipe::Recipe;

fn load_recipe(recipe_path: impl AsRef<Path>) -> Result<Recipe> {
    let recipe_path = recipe_path.as_ref();
    let contents = std::fs::read_to_string(recipe_path)
        .context(format!("Failed to read `{}`", recipe_path.display()))?;
    serde_yaml::from_str(&contents)
        .context(format!("Invalid recipe `{}`", recipe_path.display()))
}

/// Parse the command line, configure logging from the verbosity flags and
/// run the requested subcommand, turning any failure into an error chain on
/// stderr and a nonzero exit code.
pub fn run() -> ExitCode {
    let args = cli::Cli::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();
    match main(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = write::error("Error", err.to_string());
            err.chain()
                .skip(1)
                .for_each(|cause| eprintln!("caused by: {}", cause));
            ExitCode::FAILURE
        }
    }
}

/// Execute a parsed ocibake subcommand
pub fn main(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Build {
            recipe_path,
            output,
        } => {
            let now = Instant::now();
            let recipe = load_recipe(recipe_path)?;
            image::build_images(&recipe, &output)?;
            let elapsed_time = now.elapsed();
            write::ok(
                "Success",
                format!(
                    "image layout `{}` written in {:2}s",
                    output.display(),
                    elapsed_time.as_secs_f32()
                ),
            )?;
        }
    }
    Ok(())
}
