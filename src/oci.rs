//! OCI image layout functionality
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
use anyhow::{bail, Context, Result};
use oci_spec::image::{
    Descriptor, ImageConfiguration, ImageIndex, ImageManifest, OciLayout, OciLayoutBuilder,
};
use semver::Version;
use std::{fs, path::Path};

use crate::blob::blob_path;

const OCI_LAYOUT_PATH: &str = "oci-layout";
pub(crate) const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Initialize an [OCI image directory](https://github.com/opencontainers/image-spec/blob/main/image-layout.md) if required
///
/// If the directory doesn't exist, it will be created.
/// If the directory exists and is a valid OCI layout directory, return Ok.
/// Returns an error if the directory exists already and is not
/// an OCI image directory
pub(crate) fn init_image_directory(layout: impl AsRef<Path>) -> Result<(), anyhow::Error> {
    // If path exists, check whether it's a valid OCI image directory
    if layout.as_ref().exists() {
        match fs::read_dir(layout.as_ref()) {
            Ok(dir) => {
                // if the directory exists but is empty, then initialize it
                if dir.count() == 0 {
                    init_dir(layout.as_ref())?;
                }

                match OciLayout::from_file(layout.as_ref().join(OCI_LAYOUT_PATH)) {
                    Ok(oci_layout) => {
                        let version = Version::parse(oci_layout.image_layout_version())
                            .context("Failed to parse image layout version from oci-layout file")?;
                        if version.major != u64::from(oci_spec::image::VERSION_MAJOR) {
                            bail!(
                                "Unsupported image layout version found: {}. ocibake only supports oci-layout versions that are semver compatible with {}",
                                version,
                                oci_spec::image::version()
                            )
                        }
                    }
                    Err(e) => {
                        bail!(
                            "Failed to read oci-layout file in directory: {}. Error: {}",
                            layout.as_ref().display(),
                            e
                        )
                    }
                }
            }
            Err(e) => {
                return Err(e).context(format!("Failed to read `{}`", layout.as_ref().display()))
            }
        }
    } else {
        // Path doesn't exist so just create a new OCI image directory
        fs::create_dir_all(layout.as_ref()).context(format!(
            "Failed to create OCI image directory `{}`",
            layout.as_ref().display()
        ))?;

        init_dir(layout.as_ref())?;
    }
    Ok(())
}

/// Create blobs/sha256, index.json and oci-layout file in a directory
fn init_dir(layout: impl AsRef<Path>) -> Result<(), anyhow::Error> {
    // Create blobs directory
    let blobs_dir = layout.as_ref().join("blobs").join("sha256");
    fs::create_dir_all(&blobs_dir).context(format!(
        "Failed to create blobs/sha256 directory `{}`",
        blobs_dir.display()
    ))?;

    // create oci-layout file
    let oci_layout = OciLayoutBuilder::default()
        .image_layout_version(oci_spec::image::version())
        .build()?;
    let oci_layout_path = layout.as_ref().join(OCI_LAYOUT_PATH);
    oci_layout.to_file(&oci_layout_path).context(format!(
        "Failed to write to oci-layout file `{}`",
        oci_layout_path.display()
    ))?;

    // create image index
    let index = oci_spec::image::ImageIndexBuilder::default()
        .manifests(Vec::new())
        .schema_version(2u32)
        .build()?;
    write_index(layout, &index)?;

    Ok(())
}

/// Read a layout's index.json
pub(crate) fn read_index(layout: impl AsRef<Path>) -> Result<ImageIndex> {
    let index_path = layout.as_ref().join("index.json");
    serde_json::from_str(
        &fs::read_to_string(&index_path)
            .context(format!("Failed to read `{}`", index_path.display()))?,
    )
    .context(format!("Failed to parse `{}`", index_path.display()))
}

/// Overwrite a layout's index.json
pub(crate) fn write_index(layout: impl AsRef<Path>, index: &ImageIndex) -> Result<()> {
    let index_path = layout.as_ref().join("index.json");
    let index_file = fs::File::create(&index_path).context(format!(
        "Failed to create index.json file `{}`",
        index_path.display()
    ))?;
    serde_json::to_writer(index_file, index).context(format!(
        "Failed to write to index.json file `{}`",
        index_path.display()
    ))?;
    Ok(())
}

/// Add a manifest descriptor to the image index, removing any existing
/// manifest that carries the same `org.opencontainers.image.ref.name`
/// annotation.
pub(crate) fn insert_manifest(layout: impl AsRef<Path>, descriptor: Descriptor) -> Result<()> {
    let mut index = read_index(&layout)?;
    let tag = descriptor
        .annotations()
        .as_ref()
        .and_then(|map| map.get(REF_NAME_ANNOTATION))
        .cloned();

    let mut manifests = index
        .manifests()
        .iter()
        .filter(|manifest| {
            let name = manifest
                .annotations()
                .as_ref()
                .and_then(|map| map.get(REF_NAME_ANNOTATION));
            match (&tag, name) {
                (Some(tag), Some(name)) => name != tag,
                _ => true,
            }
        })
        .cloned()
        .collect::<Vec<_>>();
    manifests.push(descriptor);
    index.set_manifests(manifests);

    write_index(layout, &index)
}

/// Load the manifest and configuration of the parent image at the given
/// position of its layout's index.json.
pub(crate) fn read_parent_image(
    layout: impl AsRef<Path>,
    index: usize,
) -> Result<(ImageManifest, ImageConfiguration)> {
    let layout = layout.as_ref();
    let image_index = read_index(layout)?;
    let descriptor = image_index.manifests().get(index).with_context(|| {
        format!(
            "Parent image `{}` has no manifest at position {}",
            layout.display(),
            index
        )
    })?;

    let manifest_path = blob_path(layout, descriptor.digest())?;
    let manifest = ImageManifest::from_file(&manifest_path).context(format!(
        "Failed to read parent manifest `{}`",
        manifest_path.display()
    ))?;

    let config_path = blob_path(layout, manifest.config().digest())?;
    let config = ImageConfiguration::from_file(&config_path).context(format!(
        "Failed to read parent image configuration `{}`",
        config_path.display()
    ))?;

    Ok((manifest, config))
}
