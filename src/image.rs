//! Assembling images from recipes: layer blobs, configuration, manifests
//! and the image index.
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
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression as GzCompression, GzBuilder};
use log::debug;
use oci_spec::image::{
    Descriptor, History, HistoryBuilder, ImageConfigurationBuilder, ImageManifestBuilder,
    MediaType, RootFsBuilder,
};

use crate::blob::{self, BlobWriter};
use crate::recipe::{Compression, ImageSpec, ParentRef, Recipe};
use crate::{layer, oci, sha256_writer, write};

/// Build every image in the recipe into the OCI layout at `output`,
/// reading `SOURCE_DATE_EPOCH` from the environment for reproducible
/// timestamps.
pub fn build_images(recipe: &Recipe, output: &Path) -> Result<()> {
    build_images_with_epoch(recipe, output, source_date_epoch()?)
}

/// Build every image in the recipe into the OCI layout at `output`, with an
/// explicit reproducibility epoch.
pub fn build_images_with_epoch(
    recipe: &Recipe,
    output: &Path,
    epoch: Option<u64>,
) -> Result<()> {
    oci::init_image_directory(output)?;

    for image in &recipe.images {
        let descriptor = build_image(recipe, image, output, epoch)?;
        oci::insert_manifest(output, descriptor)?;
    }

    if let Some(annotations) = &recipe.annotations {
        let mut index = oci::read_index(output)?;
        index.set_annotations(Some(annotations.clone().into_iter().collect()));
        oci::write_index(output, &index)?;
    }
    Ok(())
}

fn source_date_epoch() -> Result<Option<u64>> {
    match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(value) => {
            let epoch = value
                .parse::<u64>()
                .with_context(|| format!("Failed to parse SOURCE_DATE_EPOCH `{}`", value))?;
            Ok(Some(epoch))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).context("Failed to read SOURCE_DATE_EPOCH"),
    }
}

fn build_image(
    recipe: &Recipe,
    image: &ImageSpec,
    output: &Path,
    epoch: Option<u64>,
) -> Result<Descriptor> {
    let creation_time = match epoch {
        Some(secs) => DateTime::from_timestamp(secs as i64, 0)
            .with_context(|| format!("SOURCE_DATE_EPOCH out of range: `{}`", secs))?,
        None => Utc::now(),
    };
    let created = creation_time.to_rfc3339_opts(SecondsFormat::Secs, true);

    if image.parent.is_none() && image.layer.is_none() {
        write::warn("Warning", "image has no parent and no layer")?;
    }

    let mut layers = Vec::new();
    let mut lower_blobs = Vec::new();
    let mut diff_ids = Vec::new();
    let mut history = Vec::new();
    if let Some(parent) = &image.parent {
        let inherited = inherit_parent_layers(parent, recipe, output, epoch)?;
        layers = inherited.layers;
        lower_blobs = inherited.blobs;
        diff_ids = inherited.diff_ids;
        history = inherited.history;
    }

    if let Some(upper) = &image.layer {
        write::ok("Creating", format!("layer from `{}`", upper.display()))?;
        let (descriptor, diff_id) = build_layer(upper, &lower_blobs, recipe, output, epoch)?;
        layers.push(descriptor);
        diff_ids.push(diff_id);
    }

    let mut hist_builder = HistoryBuilder::default().created(created.clone());
    if image.layer.is_none() {
        hist_builder = hist_builder.empty_layer(true);
    }
    if let Some(author) = &image.author {
        hist_builder = hist_builder.author(author.clone());
    }
    if let Some(comment) = &image.comment {
        hist_builder = hist_builder.comment(comment.clone());
    }
    history.push(hist_builder.build()?);

    write::ok("Writing", "image configuration blob")?;
    let rootfs = RootFsBuilder::default().diff_ids(diff_ids).build()?;
    let mut config_builder = ImageConfigurationBuilder::default()
        .created(created)
        .architecture(image.architecture.clone())
        .os(image.os.clone())
        .rootfs(rootfs)
        .history(history);
    if let Some(author) = &image.author {
        config_builder = config_builder.author(author.clone());
    }
    if let Some(config) = &image.config {
        config_builder = config_builder.config(config.to_oci_config()?);
    }
    let image_config = config_builder.build()?;
    let config_descriptor = blob::write_json_blob(&image_config, MediaType::ImageConfig, output)?;

    write::ok("Writing", "image manifest")?;
    let mut manifest_builder = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layers);
    if let Some(annotations) = &image.annotations {
        manifest_builder = manifest_builder.annotations(
            annotations
                .clone()
                .into_iter()
                .collect::<HashMap<_, _>>(),
        );
    }
    let manifest = manifest_builder.build()?;
    let mut descriptor = blob::write_json_blob(&manifest, MediaType::ImageManifest, output)?;
    descriptor.set_platform(Some(image.platform()?));

    let mut annotations: HashMap<String, String> = image
        .index_annotations
        .clone()
        .map(|map| map.into_iter().collect())
        .unwrap_or_default();
    if let Some(tag) = &image.tag {
        annotations.insert(oci::REF_NAME_ANNOTATION.to_string(), tag.clone());
    }
    if !annotations.is_empty() {
        descriptor.set_annotations(Some(annotations));
    }
    Ok(descriptor)
}

struct InheritedLayers {
    layers: Vec<Descriptor>,
    /// Paths of the re-encoded layer blobs in the output layout, base first
    blobs: Vec<PathBuf>,
    diff_ids: Vec<String>,
    history: Vec<History>,
}

/// Carry the parent image's layers into the output layout, re-encoding each
/// blob at the recipe's compression.
fn inherit_parent_layers(
    parent: &ParentRef,
    recipe: &Recipe,
    output: &Path,
    epoch: Option<u64>,
) -> Result<InheritedLayers> {
    write::ok(
        "Copying",
        format!("layers from parent image `{}`", parent.image.display()),
    )?;
    let (manifest, config) = oci::read_parent_image(&parent.image, parent.index)?;
    let diff_ids = config.rootfs().diff_ids().clone();
    let history = config.history().clone();
    anyhow::ensure!(
        manifest.layers().len() == diff_ids.len(),
        "Parent image `{}` has {} layers but {} diff_ids",
        parent.image.display(),
        manifest.layers().len(),
        diff_ids.len()
    );

    let mut layers = Vec::new();
    let mut blobs = Vec::new();
    for (layer_descriptor, diff_id) in manifest.layers().iter().zip(&diff_ids) {
        let source = blob::blob_path(&parent.image, layer_descriptor.digest())?;
        let descriptor = reencode_layer(
            &source,
            layer_descriptor.media_type(),
            diff_id,
            recipe,
            output,
            epoch,
        )
        .with_context(|| format!("Failed to copy parent layer `{}`", source.display()))?;
        blobs.push(blob::blob_path(output, descriptor.digest())?);
        layers.push(descriptor);
    }

    Ok(InheritedLayers {
        layers,
        blobs,
        diff_ids,
        history,
    })
}

fn reencode_layer(
    source: &Path,
    source_media_type: &MediaType,
    diff_id: &str,
    recipe: &Recipe,
    output: &Path,
    epoch: Option<u64>,
) -> Result<Descriptor> {
    let source_gzipped = source_media_type.to_string().ends_with("+gzip");
    let mut input =
        File::open(source).with_context(|| format!("Failed to open `{}`", source.display()))?;

    match recipe.compression {
        Compression::Gzip => {
            let blob = BlobWriter::new(output, MediaType::ImageLayerGzip)?;
            if source_gzipped {
                // Already in the target encoding; copy the bytes as-is
                let mut blob = blob;
                io::copy(&mut input, &mut blob)?;
                blob.finish()
            } else {
                let mut encoder = gz_encoder(blob, diff_id, recipe, epoch);
                io::copy(&mut input, &mut encoder)?;
                encoder.finish()?.finish()
            }
        }
        Compression::Disabled => {
            let mut blob = BlobWriter::new(output, MediaType::ImageLayer)?;
            if source_gzipped {
                let mut decoder = GzDecoder::new(&mut input);
                io::copy(&mut decoder, &mut blob)?;
            } else {
                io::copy(&mut input, &mut blob)?;
            }
            blob.finish()
        }
    }
}

/// Build the delta layer for `upper` over the given lower blobs and store
/// it as a blob. Returns the blob descriptor and the layer's diff_id.
fn build_layer(
    upper: &Path,
    lower_blobs: &[PathBuf],
    recipe: &Recipe,
    output: &Path,
    epoch: Option<u64>,
) -> Result<(Descriptor, String)> {
    // The layer builder needs seekable, decompressed tar streams; gunzip
    // compressed lowers into scratch files first.
    let mut lowers = Vec::with_capacity(lower_blobs.len());
    for path in lower_blobs {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open lower layer `{}`", path.display()))?;
        let lower = match recipe.compression {
            Compression::Gzip => {
                let mut scratch = scratch_tempfile()?;
                let mut decoder = GzDecoder::new(&mut file);
                io::copy(&mut decoder, &mut scratch).with_context(|| {
                    format!("Failed to decompress lower layer `{}`", path.display())
                })?;
                scratch.seek(SeekFrom::Start(0))?;
                scratch
            }
            Compression::Disabled => file,
        };
        lowers.push(lower);
    }

    let scratch = scratch_tempfile()?;
    let mut tar = layer::create_layer(scratch, upper, &mut lowers, epoch)?;
    tar.flush()?;
    tar.seek(SeekFrom::Start(0))?;
    let diff_id =
        sha256_writer::Sha256Writer::hash_reader(&mut tar).context("Failed to hash layer")?;
    tar.seek(SeekFrom::Start(0))?;

    let descriptor = match recipe.compression {
        Compression::Gzip => {
            let blob = BlobWriter::new(output, MediaType::ImageLayerGzip)?;
            let mut encoder = gz_encoder(blob, &diff_id, recipe, epoch);
            io::copy(&mut tar, &mut encoder).context("Failed to compress layer")?;
            encoder.finish()?.finish()?
        }
        Compression::Disabled => {
            let mut blob = BlobWriter::new(output, MediaType::ImageLayer)?;
            io::copy(&mut tar, &mut blob).context("Failed to store layer")?;
            blob.finish()?
        }
    };

    Ok((descriptor, format!("sha256:{}", diff_id)))
}

/// Gzip encoder with reproducible header fields: the layer's diff_id as the
/// embedded file name and the build epoch (zero otherwise) as the stream
/// mtime.
fn gz_encoder<W: Write>(
    writer: W,
    diff_id: &str,
    recipe: &Recipe,
    epoch: Option<u64>,
) -> flate2::write::GzEncoder<W> {
    let hex = diff_id.split_once(':').map(|(_, hex)| hex).unwrap_or(diff_id);
    let mut builder = GzBuilder::new().filename(hex);
    if let Some(epoch) = epoch {
        builder = builder.mtime(epoch as u32);
    }
    builder.write(writer, GzCompression::new(recipe.compression_level()))
}

/// Image layers regularly exceed memory size, so scratch tars go to
/// /var/tmp rather than a possibly RAM-backed default temp dir.
fn scratch_tempfile() -> Result<File> {
    match tempfile::tempfile_in("/var/tmp") {
        Ok(file) => Ok(file),
        Err(err) => {
            debug!("/var/tmp unavailable ({}), using default temp dir", err);
            tempfile::tempfile().context("Failed to create scratch file")
        }
    }
}
