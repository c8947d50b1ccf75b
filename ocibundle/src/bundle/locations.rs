//! The locations artifact: a tiny OCI image published next to a
//! copied bundle, recording which of its referenced images are
//! themselves bundles. Its tag is derived from the bundle digest, so
//! consumers can find it without reaching back to the source
//! registry.

use crate::{
    error::{Error, Result},
    lockconfig::LOCK_API_VERSION,
    registry::{ImagesReader, ImagesReaderWriter, RawManifest, OCI_MANIFEST_MEDIA_TYPE},
    util::retry,
    Digest, ImageName, Repository,
};
use flate2::{write::GzEncoder, Compression};
use oci_spec::image::{
    DescriptorBuilder, ImageConfigurationBuilder, ImageManifestBuilder, MediaType,
    SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use std::io::Read;

pub const IMAGE_LOCATIONS_KIND: &str = "ImageLocations";
pub const LOCATIONS_FILE: &str = "image-locations.yml";
const LOCATIONS_TAG_SUFFIX: &str = "image-locations.imgpkg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLocation {
    pub image: String,
    #[serde(rename = "isBundle")]
    pub is_bundle: bool,
}

/// Body of `image-locations.yml`.
///
/// There is no per-image location field: every image a copied bundle
/// references lives in the same repository as the bundle itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLocationsConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub images: Vec<ImageLocation>,
}

impl ImageLocationsConfig {
    pub fn new(images: Vec<ImageLocation>) -> Self {
        ImageLocationsConfig {
            api_version: LOCK_API_VERSION.to_string(),
            kind: IMAGE_LOCATIONS_KIND.to_string(),
            images,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let cfg: ImageLocationsConfig = serde_yaml::from_slice(bytes)?;
        if cfg.kind != IMAGE_LOCATIONS_KIND {
            return Err(Error::LockKindMismatch {
                expected: IMAGE_LOCATIONS_KIND,
                found: cfg.kind,
            });
        }
        Ok(cfg)
    }

    /// Field order and whitespace are fixed so repeated copies emit
    /// byte-identical documents.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(format!("---\n{}", serde_yaml::to_string(self)?))
    }

    /// Whether the entry with this digest is a bundle, if listed.
    pub fn is_bundle(&self, digest: &Digest) -> Option<bool> {
        self.images.iter().find_map(|location| {
            let name = ImageName::parse(&location.image).ok()?;
            (name.digest()? == digest).then_some(location.is_bundle)
        })
    }
}

/// Tag the locations artifact is published under, derived from the
/// bundle's digest: `<algo>-<hex>.image-locations.imgpkg`.
pub fn locations_tag(bundle_digest: &Digest) -> String {
    format!(
        "{}-{}.{}",
        bundle_digest.algorithm, bundle_digest.encoded, LOCATIONS_TAG_SUFFIX
    )
}

fn locations_image(repo: &Repository, bundle_digest: &Digest) -> Result<ImageName> {
    let tag = crate::TagName::new(&locations_tag(bundle_digest))
        .map_err(|_| Error::InvalidDigest(bundle_digest.to_string()))?;
    Ok(repo.tag_image(tag))
}

/// Publish the locations artifact for a copied bundle.
///
/// All bytes are deterministic (fixed tar metadata, fixed config), so
/// every copy of the same bundle publishes the same artifact digest;
/// when the tag already resolves to it, nothing is written.
pub fn write_locations(
    dst: &dyn ImagesReaderWriter,
    repo: &Repository,
    bundle_digest: &Digest,
    cfg: &ImageLocationsConfig,
) -> Result<Digest> {
    let image = locations_image(repo, bundle_digest)?;
    let layer = deterministic_layer(cfg)?;
    let layer_digest = Digest::from_buf_sha256(&layer);

    let config = deterministic_config()?;
    let config_digest = Digest::from_buf_sha256(&config);

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(
            DescriptorBuilder::default()
                .media_type(MediaType::ImageConfig)
                .size(config.len() as u64)
                .digest(oci_spec::image::Digest::try_from(&config_digest)?)
                .build()?,
        )
        .layers(vec![DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .size(layer.len() as u64)
            .digest(oci_spec::image::Digest::try_from(&layer_digest)?)
            .build()?])
        .build()?;
    let mut manifest_bytes = Vec::new();
    manifest.to_writer(&mut manifest_bytes)?;
    let raw = RawManifest::new(manifest_bytes, OCI_MANIFEST_MEDIA_TYPE);

    if retry(|| dst.head_manifest(&image))?.as_ref() == Some(raw.digest()) {
        log::debug!("Locations artifact for {} already present", bundle_digest);
        return Ok(raw.digest().clone());
    }

    retry(|| {
        if !dst.has_blob(&image, &config_digest)? {
            dst.put_blob(&image, &config_digest, &config)?;
        }
        Ok(())
    })?;
    retry(|| {
        if !dst.has_blob(&image, &layer_digest)? {
            dst.put_blob(&image, &layer_digest, &layer)?;
        }
        Ok(())
    })?;
    retry(|| dst.put_manifest(&image, &raw))?;
    Ok(raw.digest().clone())
}

/// Fetch the locations artifact for a bundle, `None` when it was
/// never published (or the write was lost; consumers then assume
/// co-location).
pub fn fetch_locations(
    reader: &dyn ImagesReader,
    repo: &Repository,
    bundle_digest: &Digest,
) -> Result<Option<ImageLocationsConfig>> {
    let image = locations_image(repo, bundle_digest)?;
    let raw = match reader.get_manifest(&image) {
        Ok(raw) => raw,
        Err(Error::NotFound(_)) | Err(Error::TarEntryNotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let manifest = raw.as_image_manifest()?;
    let [layer] = manifest.layers().as_slice() else {
        return Err(Error::IllFormedBundle(format!(
            "locations artifact {} must have exactly one layer",
            image
        )));
    };
    let layer_digest = Digest::from_descriptor(layer)?;
    let blob = retry(|| reader.get_blob(&image, &layer_digest))?;

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(blob.as_slice()));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_os_str() == LOCATIONS_FILE {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(Some(ImageLocationsConfig::from_bytes(&bytes)?));
        }
    }
    Err(Error::IllFormedBundle(format!(
        "locations artifact {} lacks {}",
        image, LOCATIONS_FILE
    )))
}

/// Single-entry tar.gz with pinned metadata; mtime stays 0 to keep
/// the digest stable across runs.
fn deterministic_layer(cfg: &ImageLocationsConfig) -> Result<Vec<u8>> {
    let yaml = cfg.to_yaml()?;
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(yaml.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, LOCATIONS_FILE, yaml.as_bytes())?;
    Ok(builder.into_inner()?.finish()?)
}

fn deterministic_config() -> Result<Vec<u8>> {
    let configuration = ImageConfigurationBuilder::default().build()?;
    let mut bytes = Vec::new();
    configuration.to_writer(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    fn sample_config() -> ImageLocationsConfig {
        ImageLocationsConfig::new(vec![ImageLocation {
            image: "index.docker.io/library/hello-world@sha256:\
                 ebf526c198a14fa138634b9746c50ec38077ec9b3986227e79eb837d26f59dc6"
                .to_string(),
            is_bundle: false,
        }])
    }

    fn bundle_digest() -> Digest {
        Digest::new("sha256:1111111111111111111111111111111111111111111111111111111111111111")
            .unwrap()
    }

    #[test]
    fn tag_derivation() {
        assert_eq!(
            locations_tag(&bundle_digest()),
            "sha256-1111111111111111111111111111111111111111111111111111111111111111.image-locations.imgpkg"
        );
    }

    #[test]
    fn repeated_writes_publish_the_same_digest() {
        let store = InMemoryRegistry::new();
        let repo = Repository::parse("registry.example/relocated").unwrap();
        let cfg = sample_config();

        let mut digests = Vec::new();
        for _ in 0..10 {
            digests.push(write_locations(&store, &repo, &bundle_digest(), &cfg).unwrap());
        }
        assert!(digests.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn fetch_round_trip() {
        let store = InMemoryRegistry::new();
        let repo = Repository::parse("registry.example/relocated").unwrap();
        let cfg = sample_config();

        write_locations(&store, &repo, &bundle_digest(), &cfg).unwrap();
        let fetched = fetch_locations(&store, &repo, &bundle_digest())
            .unwrap()
            .expect("locations must be present");
        assert_eq!(fetched, cfg);
        assert_eq!(
            fetched.is_bundle(
                &Digest::new(
                    "sha256:ebf526c198a14fa138634b9746c50ec38077ec9b3986227e79eb837d26f59dc6"
                )
                .unwrap()
            ),
            Some(false)
        );
    }

    #[test]
    fn absent_locations_is_none() {
        let store = InMemoryRegistry::new();
        let repo = Repository::parse("registry.example/relocated").unwrap();
        assert!(fetch_locations(&store, &repo, &bundle_digest())
            .unwrap()
            .is_none());
    }
}
