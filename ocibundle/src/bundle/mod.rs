//! Recognize bundles and read the lock they embed.
//!
//! A bundle is an OCI image whose config carries the
//! [BUNDLE_CONFIG_LABEL] and whose layers contain an `.imgpkg`
//! directory with an `ImagesLock` document.

mod contents;
mod locations;
mod pull;

pub use contents::Contents;
pub use locations::{
    fetch_locations, locations_tag, write_locations, ImageLocation, ImageLocationsConfig,
};
pub use pull::{pull, PullOpts};

use crate::{
    error::{Error, Result},
    lockconfig::ImagesLock,
    registry::ImagesReader,
    util::retry,
    ImageName,
};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageManifest};
use std::{
    collections::BTreeMap,
    io::Read,
    path::{Component, Path, PathBuf},
};

/// Config label marking an image as a bundle.
pub const BUNDLE_CONFIG_LABEL: &str = "dev.carvel.imgpkg.bundle";

/// Directory inside a bundle layer holding the lock files.
pub const IMGPKG_DIR: &str = ".imgpkg";
pub const IMAGES_LOCK_FILE: &str = "images.yml";
pub const BUNDLE_FILE: &str = "bundle.yml";

const GZIP_LAYER_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];
const TAR_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Whether the image's config blob labels it as a bundle.
pub fn is_bundle(
    reader: &dyn ImagesReader,
    image: &ImageName,
    manifest: &ImageManifest,
) -> Result<bool> {
    let config = fetch_config(reader, image, manifest)?;
    Ok(has_bundle_label(&config))
}

fn fetch_config(
    reader: &dyn ImagesReader,
    image: &ImageName,
    manifest: &ImageManifest,
) -> Result<ImageConfiguration> {
    let digest = crate::Digest::from_descriptor(manifest.config())?;
    let bytes = retry(|| reader.get_blob(image, &digest))?;
    Ok(ImageConfiguration::from_reader(bytes.as_slice())?)
}

fn has_bundle_label(config: &ImageConfiguration) -> bool {
    config
        .config()
        .as_ref()
        .and_then(|c| c.labels().as_ref())
        .and_then(|labels| labels.get(BUNDLE_CONFIG_LABEL))
        .is_some_and(|value| !value.is_empty())
}

/// The files found in the single `.imgpkg` layer of a bundle.
#[derive(Debug)]
pub struct BundleContentsFiles {
    pub images_lock: ImagesLock,
    pub bundle_file: Option<Vec<u8>>,
}

/// Read the embedded `ImagesLock` out of a bundle's layers.
///
/// Exactly one layer must contribute the `.imgpkg` directory;
/// anything else is an ill-formed bundle.
pub fn read_images_lock(
    reader: &dyn ImagesReader,
    image: &ImageName,
    manifest: &ImageManifest,
) -> Result<BundleContentsFiles> {
    let mut found: Option<BundleContentsFiles> = None;
    let mut layers_with_imgpkg = 0;

    for layer in manifest.layers() {
        let files = imgpkg_files_in_layer(reader, image, layer)?;
        let Some(files) = files else { continue };
        layers_with_imgpkg += 1;
        let lock_bytes = files.get(Path::new(IMAGES_LOCK_FILE)).ok_or_else(|| {
            Error::IllFormedBundle(format!(
                "layer contains an {IMGPKG_DIR} directory without {IMAGES_LOCK_FILE}"
            ))
        })?;
        found = Some(BundleContentsFiles {
            images_lock: ImagesLock::from_bytes(lock_bytes)?,
            bundle_file: files.get(Path::new(BUNDLE_FILE)).cloned(),
        });
    }

    match layers_with_imgpkg {
        1 => Ok(found.expect("exactly one layer matched")),
        0 => Err(Error::IllFormedBundle(format!(
            "no layer contains an {IMGPKG_DIR} directory"
        ))),
        n => Err(Error::IllFormedBundle(format!(
            "expected one layer with an {IMGPKG_DIR} directory, found {n}"
        ))),
    }
}

/// Scan one layer for `.imgpkg/` entries; `None` when the layer has
/// no such directory. Keys are paths relative to `.imgpkg/`.
fn imgpkg_files_in_layer(
    reader: &dyn ImagesReader,
    image: &ImageName,
    layer: &Descriptor,
) -> Result<Option<BTreeMap<PathBuf, Vec<u8>>>> {
    let digest = crate::Digest::from_descriptor(layer)?;
    let blob = retry(|| reader.get_blob(image, &digest))?;
    let mut archive = layer_archive(layer, &blob)?;

    let mut files = BTreeMap::new();
    let mut seen_dir = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = normalized(&entry.path()?);
        let Ok(rel) = path.strip_prefix(IMGPKG_DIR) else {
            continue;
        };
        seen_dir = true;
        if entry.header().entry_type().is_file() {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            files.insert(rel.to_path_buf(), bytes);
        }
    }
    Ok(seen_dir.then_some(files))
}

/// Open a layer blob as a tar archive according to its media type.
fn layer_archive<'a>(
    layer: &Descriptor,
    blob: &'a [u8],
) -> Result<tar::Archive<Box<dyn Read + 'a>>> {
    let media_type = layer.media_type().to_string();
    let reader: Box<dyn Read + 'a> = if GZIP_LAYER_MEDIA_TYPES.contains(&media_type.as_str()) {
        Box::new(flate2::read::GzDecoder::new(blob))
    } else if media_type == TAR_LAYER_MEDIA_TYPE {
        Box::new(blob)
    } else {
        return Err(Error::UnsupportedMediaType(media_type));
    };
    Ok(tar::Archive::new(reader))
}

/// Strip `./` prefixes tar builders like to emit.
fn normalized(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
