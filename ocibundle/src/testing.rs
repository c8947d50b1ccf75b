//! Helpers for building images and bundles inside an
//! [InMemoryRegistry](crate::registry::InMemoryRegistry), used by the
//! test suites. Not intended for production use.

use crate::{
    bundle::{BUNDLE_CONFIG_LABEL, BUNDLE_FILE, IMAGES_LOCK_FILE, IMGPKG_DIR},
    lockconfig::{ImageRef, ImagesLock},
    registry::{
        ImagesReaderWriter, RawManifest, OCI_INDEX_MEDIA_TYPE,
        OCI_MANIFEST_MEDIA_TYPE,
    },
    Digest, ImageName,
};
use flate2::{write::GzEncoder, Compression};
use oci_spec::image::{
    ConfigBuilder, DescriptorBuilder, ImageConfigurationBuilder, ImageIndexBuilder,
    ImageManifestBuilder, MediaType, SCHEMA_VERSION,
};
use std::collections::HashMap;

/// A fresh scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "ocibundle-{}-{}-{}",
        name,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).expect("creating scratch dir");
    dir
}

/// Build an `ImagesLock` naming the given digest references.
pub fn images_lock(refs: &[&str]) -> ImagesLock {
    ImagesLock::new(
        refs.iter()
            .map(|image| ImageRef {
                image: image.to_string(),
                annotations: None,
            })
            .collect(),
    )
}

/// A gzipped tar layer holding the given files.
pub fn gzip_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder
        .into_inner()
        .expect("in-memory tar cannot fail")
        .finish()
        .expect("in-memory gzip cannot fail")
}

fn config_bytes(labels: Option<HashMap<String, String>>) -> Vec<u8> {
    let mut configuration = ImageConfigurationBuilder::default();
    if let Some(labels) = labels {
        let config = ConfigBuilder::default()
            .labels(labels)
            .build()
            .expect("config builder");
        configuration = configuration.config(config);
    }
    let configuration = configuration.build().expect("image configuration builder");
    let mut bytes = Vec::new();
    configuration
        .to_writer(&mut bytes)
        .expect("serializing configuration");
    bytes
}

/// Assemble a single-layer image, store its blobs and manifest, tag
/// it, and return the digest reference.
pub fn push_image_with_layers(
    store: &dyn ImagesReaderWriter,
    image: &ImageName,
    layers: Vec<Vec<u8>>,
    labels: Option<HashMap<String, String>>,
) -> ImageName {
    let config = config_bytes(labels);
    let config_digest = Digest::from_buf_sha256(&config);
    store.put_blob(image, &config_digest, &config).unwrap();
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .size(config.len() as u64)
        .digest(oci_spec::image::Digest::try_from(&config_digest).unwrap())
        .build()
        .unwrap();

    let mut layer_descriptors = Vec::new();
    for layer in &layers {
        let digest = Digest::from_buf_sha256(layer);
        store.put_blob(image, &digest, layer).unwrap();
        layer_descriptors.push(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageLayerGzip)
                .size(layer.len() as u64)
                .digest(oci_spec::image::Digest::try_from(&digest).unwrap())
                .build()
                .unwrap(),
        );
    }

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layer_descriptors)
        .build()
        .unwrap();
    let mut bytes = Vec::new();
    manifest.to_writer(&mut bytes).unwrap();
    let raw = RawManifest::new(bytes, OCI_MANIFEST_MEDIA_TYPE);
    let digest = raw.digest().clone();
    store.put_manifest(image, &raw).unwrap();
    image.with_digest(digest)
}

/// A plain single-file image.
pub fn push_plain_image(
    store: &dyn ImagesReaderWriter,
    image: &ImageName,
    content: &[u8],
) -> ImageName {
    let layer = gzip_layer(&[("file.txt", content)]);
    push_image_with_layers(store, image, vec![layer], None)
}

fn bundle_layer(lock: &ImagesLock, extra_files: &[(&str, &[u8])]) -> Vec<u8> {
    let lock_yaml = lock.to_yaml().unwrap();
    let images_path = format!("{IMGPKG_DIR}/{IMAGES_LOCK_FILE}");
    let bundle_path = format!("{IMGPKG_DIR}/{BUNDLE_FILE}");
    let mut files: Vec<(&str, &[u8])> = vec![
        (images_path.as_str(), lock_yaml.as_bytes()),
        (bundle_path.as_str(), b"apiVersion: imgpkg.carvel.dev/v1alpha1\nkind: Bundle\n"),
    ];
    files.extend_from_slice(extra_files);
    gzip_layer(&files)
}

fn bundle_labels() -> HashMap<String, String> {
    HashMap::from([(BUNDLE_CONFIG_LABEL.to_string(), "true".to_string())])
}

/// A bundle whose `.imgpkg` layer embeds the given lock.
pub fn push_bundle(
    store: &dyn ImagesReaderWriter,
    image: &ImageName,
    lock: &ImagesLock,
    extra_files: &[(&str, &[u8])],
) -> ImageName {
    let layer = bundle_layer(lock, extra_files);
    push_image_with_layers(store, image, vec![layer], Some(bundle_labels()))
}

/// An ill-formed bundle: two layers both contributing `.imgpkg`.
pub fn push_bundle_with_duplicate_layer(
    store: &dyn ImagesReaderWriter,
    image: &ImageName,
    lock: &ImagesLock,
) -> ImageName {
    let first = bundle_layer(lock, &[]);
    let second = bundle_layer(lock, &[("second-layer-marker", b"x".as_slice())]);
    push_image_with_layers(store, image, vec![first, second], Some(bundle_labels()))
}

/// A two-entry image index over freshly pushed child images.
pub fn push_image_index(store: &dyn ImagesReaderWriter, image: &ImageName) -> ImageName {
    let mut manifests = Vec::new();
    for n in 0..2u8 {
        let child = push_plain_image(store, image, &[n]);
        let child_manifest = store.get_manifest(&child).unwrap();
        manifests.push(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageManifest)
                .size(child_manifest.bytes().len() as u64)
                .digest(oci_spec::image::Digest::try_from(child_manifest.digest()).unwrap())
                .build()
                .unwrap(),
        );
    }
    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageIndex)
        .manifests(manifests)
        .build()
        .unwrap();
    let mut bytes = Vec::new();
    index.to_writer(&mut bytes).unwrap();
    let raw = RawManifest::new(bytes, OCI_INDEX_MEDIA_TYPE);
    let digest = raw.digest().clone();
    store.put_manifest(image, &raw).unwrap();
    image.with_digest(digest)
}
