use crate::{
    error::Result,
    registry::{ImagesReader, ImagesReaderWriter, InMemoryRegistry, RawManifest},
    Digest, ImageName, Repository,
};
use std::{collections::HashSet, sync::Mutex};

/// Gateway that serves locally-built images from memory and delegates
/// everything else.
///
/// A lookup whose identifier equals one of the pre-registered digests
/// is answered from the in-memory store; all other reads, and every
/// write, go to the delegate. This is how a freshly built image flows
/// through the copier before it exists in any registry.
pub struct LocalOverlay<'a> {
    delegate: &'a dyn ImagesReaderWriter,
    local: InMemoryRegistry,
    digests: Mutex<HashSet<Digest>>,
}

impl<'a> LocalOverlay<'a> {
    pub fn new(delegate: &'a dyn ImagesReaderWriter) -> Self {
        LocalOverlay {
            delegate,
            local: InMemoryRegistry::new(),
            digests: Mutex::new(HashSet::new()),
        }
    }

    /// Register a built image so reads of its digest are intercepted.
    pub fn register(
        &self,
        image: &ImageName,
        manifest: &RawManifest,
        blobs: &[(Digest, Vec<u8>)],
    ) -> Result<()> {
        let pinned = image.with_digest(manifest.digest().clone());
        self.local.put_manifest(&pinned, manifest)?;
        for (digest, data) in blobs {
            self.local.put_blob(&pinned, digest, data)?;
        }
        self.digests.lock().unwrap().insert(manifest.digest().clone());
        Ok(())
    }

    fn intercepts(&self, image: &ImageName) -> bool {
        image
            .digest()
            .is_some_and(|digest| self.digests.lock().unwrap().contains(digest))
    }
}

impl ImagesReader for LocalOverlay<'_> {
    fn get_manifest(&self, image: &ImageName) -> Result<RawManifest> {
        if self.intercepts(image) {
            return self.local.get_manifest(image);
        }
        self.delegate.get_manifest(image)
    }

    fn head_manifest(&self, image: &ImageName) -> Result<Option<Digest>> {
        if self.intercepts(image) {
            return self.local.head_manifest(image);
        }
        self.delegate.head_manifest(image)
    }

    fn get_blob(&self, image: &ImageName, digest: &Digest) -> Result<Vec<u8>> {
        match self.local.get_blob(image, digest) {
            Ok(data) => Ok(data),
            Err(_) => self.delegate.get_blob(image, digest),
        }
    }
}

impl ImagesReaderWriter for LocalOverlay<'_> {
    fn put_manifest(&self, image: &ImageName, manifest: &RawManifest) -> Result<()> {
        self.delegate.put_manifest(image, manifest)
    }

    fn has_blob(&self, image: &ImageName, digest: &Digest) -> Result<bool> {
        self.delegate.has_blob(image, digest)
    }

    fn put_blob(&self, image: &ImageName, digest: &Digest, data: &[u8]) -> Result<()> {
        self.delegate.put_blob(image, digest, data)
    }

    fn mount_blob(
        &self,
        image: &ImageName,
        from: &Repository,
        digest: &Digest,
    ) -> Result<bool> {
        self.delegate.mount_blob(image, from, digest)
    }

    fn list_tags(&self, repo: &Repository) -> Result<Vec<String>> {
        self.delegate.list_tags(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OCI_MANIFEST_MEDIA_TYPE;

    #[test]
    fn registered_digest_is_served_locally() {
        let remote = InMemoryRegistry::new();
        let overlay = LocalOverlay::new(&remote);

        let manifest = RawManifest::new(
            br#"{"schemaVersion":2}"#.to_vec(),
            OCI_MANIFEST_MEDIA_TYPE,
        );
        let blob = b"config bytes".to_vec();
        let blob_digest = Digest::from_buf_sha256(&blob);
        let image = ImageName::parse("registry.example/app:built").unwrap();

        overlay
            .register(&image, &manifest, &[(blob_digest.clone(), blob.clone())])
            .unwrap();

        let pinned = image.with_digest(manifest.digest().clone());
        // Served from memory even though the delegate has nothing
        assert_eq!(
            overlay.get_manifest(&pinned).unwrap().digest(),
            manifest.digest()
        );
        assert_eq!(overlay.get_blob(&pinned, &blob_digest).unwrap(), blob);

        // Unknown digests delegate (and the delegate is empty)
        let other = image.with_digest(Digest::from_buf_sha256(b"other"));
        assert!(overlay.get_manifest(&other).is_err());
    }

    #[test]
    fn writes_go_to_the_delegate() {
        let remote = InMemoryRegistry::new();
        let overlay = LocalOverlay::new(&remote);
        let image = ImageName::parse("registry.example/app:v1").unwrap();
        let manifest = RawManifest::new(
            br#"{"schemaVersion":2}"#.to_vec(),
            OCI_MANIFEST_MEDIA_TYPE,
        );

        overlay.put_manifest(&image, &manifest).unwrap();
        assert_eq!(
            remote.head_manifest(&image).unwrap(),
            Some(manifest.digest().clone())
        );
    }
}
