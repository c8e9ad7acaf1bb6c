//! Integration tests for recipe-driven image assembly

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use ocibake::image::build_images_with_epoch;
use ocibake::recipe::Recipe;

// Path to ocibake binary under test
const EXE: &str = env!("CARGO_BIN_EXE_ocibake");

fn recipe(yaml: &str) -> Recipe {
    serde_yaml::from_str(yaml).unwrap()
}

fn blob_path(layout: &Path, digest: &str) -> PathBuf {
    let (algorithm, hex) = digest.split_once(':').unwrap();
    layout.join("blobs").join(algorithm).join(hex)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut sha = openssl::sha::Sha256::new();
    sha.update(bytes);
    hex::encode(sha.finish())
}

fn read_index(layout: &Path) -> ImageIndex {
    serde_json::from_str(&fs::read_to_string(layout.join("index.json")).unwrap()).unwrap()
}

fn write_rootfs(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }
}

fn tar_paths(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            entry
                .unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

#[test]
fn build_single_image_with_gzip_layer() {
    let rootfs = tempfile::tempdir().unwrap();
    write_rootfs(rootfs.path(), &[("etc/motd", "hi"), ("greeting", "hello")]);
    let output = tempfile::tempdir().unwrap();

    let recipe = recipe(&format!(
        r#"
images:
  - architecture: amd64
    os: linux
    tag: latest
    author: tester
    layer: {}
    config:
      cmd: [ "sh" ]
"#,
        rootfs.path().display()
    ));
    build_images_with_epoch(&recipe, output.path(), Some(0)).unwrap();

    // Layout markers
    assert!(output.path().join("oci-layout").is_file());
    let index = read_index(output.path());
    assert_eq!(index.manifests().len(), 1);
    let descriptor = &index.manifests()[0];
    assert_eq!(
        descriptor
            .annotations()
            .as_ref()
            .unwrap()
            .get("org.opencontainers.image.ref.name")
            .unwrap(),
        "latest"
    );
    let platform = descriptor.platform().as_ref().unwrap();
    assert_eq!(platform.architecture().to_string(), "amd64");

    // Manifest blob
    let manifest =
        ImageManifest::from_file(blob_path(output.path(), descriptor.digest())).unwrap();
    assert_eq!(manifest.layers().len(), 1);
    let layer_descriptor = &manifest.layers()[0];
    assert_eq!(layer_descriptor.media_type(), &MediaType::ImageLayerGzip);

    // The blob digest addresses the stored bytes
    let blob = fs::read(blob_path(output.path(), layer_descriptor.digest())).unwrap();
    assert_eq!(
        layer_descriptor.digest(),
        &format!("sha256:{}", sha256_hex(&blob))
    );
    assert_eq!(layer_descriptor.size(), blob.len() as i64);

    // Config blob: diff_id is the digest of the uncompressed layer
    let config =
        ImageConfiguration::from_file(blob_path(output.path(), manifest.config().digest()))
            .unwrap();
    assert_eq!(config.created().as_deref(), Some("1970-01-01T00:00:00Z"));
    assert_eq!(config.author().as_deref(), Some("tester"));
    assert_eq!(config.rootfs().diff_ids().len(), 1);
    assert_eq!(config.history().len(), 1);

    let mut tar_bytes = Vec::new();
    flate2::read::GzDecoder::new(blob.as_slice())
        .read_to_end(&mut tar_bytes)
        .unwrap();
    assert_eq!(
        config.rootfs().diff_ids()[0],
        format!("sha256:{}", sha256_hex(&tar_bytes))
    );
    // Within a directory, files come before subdirectories
    assert_eq!(
        tar_paths(&tar_bytes),
        vec!["./", "greeting", "etc/", "etc/motd"]
    );
}

#[test]
fn build_is_reproducible_under_epoch() {
    let rootfs = tempfile::tempdir().unwrap();
    write_rootfs(rootfs.path(), &[("a", "one"), ("b", "two")]);

    let yaml = format!(
        r#"
images:
  - architecture: amd64
    os: linux
    layer: {}
"#,
        rootfs.path().display()
    );

    let mut digests = Vec::new();
    for _ in 0..2 {
        let output = tempfile::tempdir().unwrap();
        build_images_with_epoch(&recipe(&yaml), output.path(), Some(1700000000)).unwrap();
        let index = read_index(output.path());
        digests.push(index.manifests()[0].digest().clone());
    }
    assert_eq!(digests[0], digests[1]);
}

#[test]
fn child_image_layers_over_parent() {
    // Parent image with a file that survives unchanged and one that is
    // removed in the child
    let parent_rootfs = tempfile::tempdir().unwrap();
    write_rootfs(
        parent_rootfs.path(),
        &[("shared", "stable content"), ("removed", "old")],
    );
    let parent_layout = tempfile::tempdir().unwrap();
    let parent_yaml = format!(
        r#"
compression: disabled
images:
  - architecture: amd64
    os: linux
    layer: {}
"#,
        parent_rootfs.path().display()
    );
    build_images_with_epoch(&recipe(&parent_yaml), parent_layout.path(), Some(0)).unwrap();
    let parent_index = read_index(parent_layout.path());
    let parent_manifest = ImageManifest::from_file(blob_path(
        parent_layout.path(),
        parent_index.manifests()[0].digest(),
    ))
    .unwrap();
    let parent_layer_digest = parent_manifest.layers()[0].digest().clone();

    // Child: `shared` untouched, `removed` gone, `extra` added
    let child_rootfs = tempfile::tempdir().unwrap();
    write_rootfs(
        child_rootfs.path(),
        &[("shared", "stable content"), ("extra", "new")],
    );
    let child_layout = tempfile::tempdir().unwrap();
    let child_yaml = format!(
        r#"
compression: disabled
annotations:
  org.example.build: test
images:
  - architecture: amd64
    os: linux
    comment: child build
    parent:
      image: {}
    layer: {}
"#,
        parent_layout.path().display(),
        child_rootfs.path().display()
    );
    build_images_with_epoch(&recipe(&child_yaml), child_layout.path(), Some(0)).unwrap();

    let index = read_index(child_layout.path());
    assert_eq!(
        index
            .annotations()
            .as_ref()
            .unwrap()
            .get("org.example.build")
            .unwrap(),
        "test"
    );
    let manifest = ImageManifest::from_file(blob_path(
        child_layout.path(),
        index.manifests()[0].digest(),
    ))
    .unwrap();
    assert_eq!(manifest.layers().len(), 2);
    // The parent layer was copied verbatim
    assert_eq!(manifest.layers()[0].digest(), &parent_layer_digest);

    // Inherited diff_ids come first; history accumulates
    let config = ImageConfiguration::from_file(blob_path(
        child_layout.path(),
        manifest.config().digest(),
    ))
    .unwrap();
    assert_eq!(config.rootfs().diff_ids().len(), 2);
    assert_eq!(config.history().len(), 2);
    assert_eq!(config.history()[1].comment().as_deref(), Some("child build"));

    // The delta layer holds only the whiteout and the new file
    let delta = fs::read(blob_path(
        child_layout.path(),
        manifest.layers()[1].digest(),
    ))
    .unwrap();
    assert_eq!(tar_paths(&delta), vec!["./", ".wh.removed", "extra"]);
}

#[test]
fn binary_builds_recipe_from_file() {
    let rootfs = tempfile::tempdir().unwrap();
    write_rootfs(rootfs.path(), &[("hello", "world")]);
    let workdir = tempfile::tempdir().unwrap();
    let recipe_path = workdir.path().join("ocibake.yaml");
    fs::write(
        &recipe_path,
        format!(
            r#"
images:
  - architecture: amd64
    os: linux
    tag: smoke
    layer: {}
"#,
            rootfs.path().display()
        ),
    )
    .unwrap();

    let output_dir = workdir.path().join("image");
    let output = Command::new(EXE)
        .arg("build")
        .arg("-f")
        .arg(&recipe_path)
        .arg("--output")
        .arg(&output_dir)
        .env("SOURCE_DATE_EPOCH", "0")
        .output()
        .unwrap();
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(output.status.success());

    assert!(output_dir.join("oci-layout").is_file());
    assert_eq!(read_index(&output_dir).manifests().len(), 1);
}

#[test]
fn binary_reports_missing_recipe() {
    let workdir = tempfile::tempdir().unwrap();
    let output = Command::new(EXE)
        .arg("build")
        .arg("-f")
        .arg("does-not-exist.yaml")
        .current_dir(workdir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(stderr.contains("does-not-exist.yaml"));
}
