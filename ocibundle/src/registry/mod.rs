//! Uniform read/write surface over the places images live: a remote
//! registry, a tar archive, or an in-memory overlay of locally-built
//! images.

mod local;
mod memory;

pub use local::LocalOverlay;
pub use memory::InMemoryRegistry;

use crate::{
    config::RegistryOpts,
    distribution::Client,
    error::{Error, Result},
    Digest, ImageName, Repository,
};
use oci_spec::image::{ImageIndex, ImageManifest};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// A manifest as it exists in a registry: exact bytes, the media type
/// reported for them, and the digest of those bytes.
///
/// Structured parsing is for inspection only; whatever is written
/// back out is `bytes`, verbatim.
#[derive(Debug, Clone)]
pub struct RawManifest {
    bytes: Vec<u8>,
    media_type: String,
    digest: Digest,
}

impl RawManifest {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        let digest = Digest::from_buf_sha256(&bytes);
        RawManifest {
            bytes,
            media_type: media_type.into(),
            digest,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn is_index(&self) -> bool {
        self.media_type == OCI_INDEX_MEDIA_TYPE
            || self.media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
    }

    pub fn is_image_manifest(&self) -> bool {
        self.media_type == OCI_MANIFEST_MEDIA_TYPE
            || self.media_type == DOCKER_MANIFEST_MEDIA_TYPE
    }

    /// Parse as a single-image manifest, for inspection.
    pub fn as_image_manifest(&self) -> Result<ImageManifest> {
        if !self.is_image_manifest() {
            return Err(Error::UnsupportedMediaType(self.media_type.clone()));
        }
        Ok(ImageManifest::from_reader(self.bytes.as_slice())?)
    }

    /// Parse as a multi-arch index, for inspection.
    pub fn as_image_index(&self) -> Result<ImageIndex> {
        if !self.is_index() {
            return Err(Error::UnsupportedMediaType(self.media_type.clone()));
        }
        Ok(ImageIndex::from_reader(self.bytes.as_slice())?)
    }
}

/// Read surface of a registry-shaped store.
pub trait ImagesReader: Send + Sync {
    /// Fetch the manifest a reference points at, as raw bytes.
    fn get_manifest(&self, image: &ImageName) -> Result<RawManifest>;

    /// Resolve a reference to a digest without fetching, `None` when
    /// absent.
    fn head_manifest(&self, image: &ImageName) -> Result<Option<Digest>>;

    /// Fetch a blob by digest from the repository `image` lives in.
    /// Content is verified against the digest.
    fn get_blob(&self, image: &ImageName, digest: &Digest) -> Result<Vec<u8>>;
}

/// Full gateway: reads plus writes and tag listing.
pub trait ImagesReaderWriter: ImagesReader {
    /// Write manifest bytes exactly as provided under `image`'s
    /// identifier (tag or digest).
    fn put_manifest(&self, image: &ImageName, manifest: &RawManifest) -> Result<()>;

    /// Whether the repository already stores the blob.
    fn has_blob(&self, image: &ImageName, digest: &Digest) -> Result<bool>;

    fn put_blob(&self, image: &ImageName, digest: &Digest, data: &[u8]) -> Result<()>;

    /// Try making a blob from `from` available in `image`'s
    /// repository without moving bytes. `false` means the caller
    /// must stream.
    fn mount_blob(
        &self,
        _image: &ImageName,
        _from: &Repository,
        _digest: &Digest,
    ) -> Result<bool> {
        Ok(false)
    }

    fn list_tags(&self, repo: &Repository) -> Result<Vec<String>>;
}

/// Gateway over remote OCI registries.
///
/// One instance serves any number of repositories; per-repository
/// clients (each holding its own auth token) are created on demand.
pub struct RemoteRegistry {
    opts: RegistryOpts,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl RemoteRegistry {
    pub fn new(opts: RegistryOpts) -> Self {
        RemoteRegistry {
            opts,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, repo: &Repository) -> Result<Arc<Client>> {
        let key = repo.to_string();
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(Client::new(
            repo.registry_url()?,
            repo.name.clone(),
            &self.opts,
        )?);
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }
}

impl ImagesReader for RemoteRegistry {
    fn get_manifest(&self, image: &ImageName) -> Result<RawManifest> {
        let client = self.client_for(&image.repository())?;
        let (bytes, media_type) = client.get_manifest(&image.identifier)?;
        Ok(RawManifest::new(bytes, media_type))
    }

    fn head_manifest(&self, image: &ImageName) -> Result<Option<Digest>> {
        let client = self.client_for(&image.repository())?;
        client.head_manifest(&image.identifier)
    }

    fn get_blob(&self, image: &ImageName, digest: &Digest) -> Result<Vec<u8>> {
        let client = self.client_for(&image.repository())?;
        client.get_blob(digest)
    }
}

impl ImagesReaderWriter for RemoteRegistry {
    fn put_manifest(&self, image: &ImageName, manifest: &RawManifest) -> Result<()> {
        let client = self.client_for(&image.repository())?;
        client.put_manifest(&image.identifier, manifest.bytes(), manifest.media_type())
    }

    fn has_blob(&self, image: &ImageName, digest: &Digest) -> Result<bool> {
        let client = self.client_for(&image.repository())?;
        client.head_blob(digest)
    }

    fn put_blob(&self, image: &ImageName, digest: &Digest, data: &[u8]) -> Result<()> {
        let client = self.client_for(&image.repository())?;
        client.put_blob(digest, data)
    }

    fn mount_blob(
        &self,
        image: &ImageName,
        from: &Repository,
        digest: &Digest,
    ) -> Result<bool> {
        // Cross-repo mounts only exist within one registry host
        if image.registry_host() != from.registry_host() {
            return Ok(false);
        }
        let client = self.client_for(&image.repository())?;
        client.mount_blob(digest, &from.name)
    }

    fn list_tags(&self, repo: &Repository) -> Result<Vec<String>> {
        let client = self.client_for(repo)?;
        client.get_tags()
    }
}
