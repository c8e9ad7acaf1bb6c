//! Module for ocibake recipe files
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
use oci_spec::{
    image::{Arch, Config, ConfigBuilder, Os, Platform, PlatformBuilder},
    OciSpecError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Compression applied to layer blobs written into the output layout.
#[derive(Debug, Serialize, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Gzip-compressed layers (`…layer.v1.tar+gzip`)
    #[default]
    Gzip,
    /// Uncompressed layers (`…layer.v1.tar`)
    Disabled,
}

/// Build recipe for one or more images written into a single OCI layout
#[derive(Debug, Serialize, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    /// Layer blob compression.
    #[serde(default)]
    pub(crate) compression: Compression,
    /// Gzip compression level, 0-9. Defaults to 5.
    #[serde(default, rename = "compression-level")]
    pub(crate) compression_level: Option<u32>,
    /// The images to build, in order.
    #[serde(default)]
    pub(crate) images: Vec<ImageSpec>,
    /// Annotations for the image index.
    #[serde(default)]
    pub(crate) annotations: Option<BTreeMap<String, String>>,
}

impl Recipe {
    /// Gzip compression level to use for layer blobs
    pub(crate) fn compression_level(&self) -> u32 {
        self.compression_level.unwrap_or(5)
    }
}

/// One image to build
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct ImageSpec {
    /// Platform architecture, e.g. amd64
    pub(crate) architecture: Arch,
    /// Platform OS, e.g. linux
    pub(crate) os: Os,
    #[serde(default, rename = "os.version")]
    pub(crate) os_version: Option<String>,
    #[serde(default, rename = "os.features")]
    pub(crate) os_features: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) variant: Option<String>,
    /// Image author, recorded in the configuration and history
    #[serde(default)]
    pub(crate) author: Option<String>,
    /// History comment for this build step
    #[serde(default)]
    pub(crate) comment: Option<String>,
    /// Tag recorded as org.opencontainers.image.ref.name in the index
    #[serde(default)]
    pub(crate) tag: Option<String>,
    /// Base image whose layers and history this image inherits
    #[serde(default)]
    pub(crate) parent: Option<ParentRef>,
    /// Directory tree to turn into a new layer on top of the parent
    #[serde(default)]
    pub(crate) layer: Option<PathBuf>,
    /// Runtime configuration carried into the image configuration blob
    #[serde(default)]
    pub(crate) config: Option<RuntimeConfig>,
    /// Annotations for the image manifest
    #[serde(default)]
    pub(crate) annotations: Option<BTreeMap<String, String>>,
    /// Annotations for the manifest's descriptor in the image index
    #[serde(default, rename = "index-annotations")]
    pub(crate) index_annotations: Option<BTreeMap<String, String>>,
}

/// Reference to a parent image: an OCI layout on disk and a manifest
/// position within its index
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct ParentRef {
    pub(crate) image: PathBuf,
    #[serde(default)]
    pub(crate) index: usize,
}

impl ImageSpec {
    pub(crate) fn platform(&self) -> Result<Platform, OciSpecError> {
        let mut builder = PlatformBuilder::default()
            .architecture(self.architecture.clone())
            .os(self.os.clone());
        if let Some(version) = &self.os_version {
            builder = builder.os_version(version.clone());
        }
        if let Some(features) = &self.os_features {
            builder = builder.os_features(features.clone());
        }
        if let Some(variant) = &self.variant {
            builder = builder.variant(variant.clone());
        }
        builder.build()
    }
}

#[derive(Debug, Serialize, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
/// Image runtime configuration options
/// Corresponds to the config fields of: https://github.com/opencontainers/image-spec/blob/main/config.md#properties
pub(crate) struct RuntimeConfig {
    #[serde(default)]
    pub(crate) user: Option<String>,
    #[serde(default, rename = "exposed-ports")]
    pub(crate) exposed_ports: Vec<String>,
    #[serde(default)]
    pub(crate) envs: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) entrypoint: Vec<String>,
    #[serde(default)]
    pub(crate) cmd: Vec<String>,
    #[serde(default)]
    pub(crate) volumes: Vec<String>,
    #[serde(default)]
    pub(crate) labels: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) workingdir: Option<String>,
    #[serde(default)]
    pub(crate) stopsignal: Option<String>,
}

impl RuntimeConfig {
    pub(crate) fn to_oci_config(&self) -> Result<Config, OciSpecError> {
        let RuntimeConfig {
            user,
            exposed_ports,
            envs,
            entrypoint,
            cmd,
            volumes,
            labels,
            workingdir,
            stopsignal,
        } = self;
        let mut builder = ConfigBuilder::default()
            .cmd(cmd.clone())
            .volumes(volumes.clone())
            .entrypoint(entrypoint.clone())
            .env(
                envs.iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>(),
            )
            .exposed_ports(exposed_ports.clone())
            .labels(labels.clone().into_iter().collect::<std::collections::HashMap<_, _>>());
        if let Some(user) = user {
            builder = builder.user(user);
        }
        if let Some(stopsignal) = stopsignal {
            builder = builder.stop_signal(stopsignal);
        }
        if let Some(workingdir) = workingdir {
            builder = builder.working_dir(workingdir);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let recipe = r#"
images:
  - architecture: amd64
    os: linux
    layer: rootfs
    config:
      cmd: [ "bash" ]
"#;
        let recipe: Recipe = serde_yaml::from_str(recipe).unwrap();
        assert_eq!(recipe.compression, Compression::Gzip);
        assert_eq!(recipe.compression_level(), 5);
        assert_eq!(recipe.images.len(), 1);
        assert_eq!(recipe.images[0].layer.as_deref(), Some(PathBuf::from("rootfs").as_path()));
    }

    #[test]
    fn parse_parent_and_platform() {
        let recipe = r#"
compression: disabled
images:
  - architecture: arm64
    os: linux
    os.version: "12"
    variant: v8
    tag: latest
    parent:
      image: base
      index: 1
    annotations:
      org.opencontainers.image.title: demo
"#;
        let recipe: Recipe = serde_yaml::from_str(recipe).unwrap();
        assert_eq!(recipe.compression, Compression::Disabled);
        let image = &recipe.images[0];
        assert_eq!(image.parent.as_ref().unwrap().index, 1);
        assert_eq!(image.tag.as_deref(), Some("latest"));

        let platform = image.platform().unwrap();
        assert_eq!(platform.architecture(), &Arch::ARM64);
        assert_eq!(platform.os_version().as_deref(), Some("12"));
        assert_eq!(platform.variant().as_deref(), Some("v8"));
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let recipe = r#"
images:
  - architecture: amd64
    os: linux
    flavour: vanilla
"#;
        assert!(serde_yaml::from_str::<Recipe>(recipe).is_err());
    }

    #[test]
    fn envs_become_sorted_env_strings() {
        let config = r#"
envs:
  PATH: /usr/bin
  HOME: /root
cmd: [ "sh" ]
"#;
        let config: RuntimeConfig = serde_yaml::from_str(config).unwrap();
        let oci = config.to_oci_config().unwrap();
        assert_eq!(
            oci.env().as_ref().unwrap(),
            &vec!["HOME=/root".to_string(), "PATH=/usr/bin".to_string()]
        );
        assert_eq!(oci.cmd().as_ref().unwrap(), &vec!["sh".to_string()]);
    }
}
