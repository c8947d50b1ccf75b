use crate::{
    error::{Error, Result},
    registry::{ImagesReader, ImagesReaderWriter, RawManifest},
    Digest, Identifier, ImageName, Repository,
};
use std::{
    collections::HashMap,
    sync::Mutex,
};

#[derive(Default)]
struct RepoState {
    /// Manifest bytes keyed by their digest
    manifests: HashMap<Digest, RawManifest>,
    /// Mutable tag pointers into `manifests`
    tags: HashMap<String, Digest>,
    blobs: HashMap<Digest, Vec<u8>>,
}

/// Registry-shaped store living entirely in memory.
///
/// Backs the local overlay for just-built images and the test suite.
/// Repositories spring into existence on first write.
#[derive(Default)]
pub struct InMemoryRegistry {
    repos: Mutex<HashMap<String, RepoState>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, image: &ImageName) -> Result<Option<Digest>> {
        let repos = self.repos.lock().unwrap();
        let Some(repo) = repos.get(&image.repository().to_string()) else {
            return Ok(None);
        };
        Ok(match &image.identifier {
            Identifier::Digest(digest) => repo.manifests.contains_key(digest).then(|| digest.clone()),
            Identifier::Tag(tag) => repo.tags.get(tag.as_str()).cloned(),
        })
    }
}

impl ImagesReader for InMemoryRegistry {
    fn get_manifest(&self, image: &ImageName) -> Result<RawManifest> {
        let digest = self
            .resolve(image)?
            .ok_or_else(|| Error::NotFound(image.to_string()))?;
        let repos = self.repos.lock().unwrap();
        repos
            .get(&image.repository().to_string())
            .and_then(|repo| repo.manifests.get(&digest))
            .cloned()
            .ok_or_else(|| Error::NotFound(image.to_string()))
    }

    fn head_manifest(&self, image: &ImageName) -> Result<Option<Digest>> {
        self.resolve(image)
    }

    fn get_blob(&self, image: &ImageName, digest: &Digest) -> Result<Vec<u8>> {
        let repos = self.repos.lock().unwrap();
        repos
            .get(&image.repository().to_string())
            .and_then(|repo| repo.blobs.get(digest))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}@{}", image.repository(), digest)))
    }
}

impl ImagesReaderWriter for InMemoryRegistry {
    fn put_manifest(&self, image: &ImageName, manifest: &RawManifest) -> Result<()> {
        let mut repos = self.repos.lock().unwrap();
        let repo = repos
            .entry(image.repository().to_string())
            .or_default();
        repo.manifests
            .insert(manifest.digest().clone(), manifest.clone());
        if let Identifier::Tag(tag) = &image.identifier {
            // Tags are overwritten freely; digests never repoint
            repo.tags
                .insert(tag.as_str().to_string(), manifest.digest().clone());
        }
        Ok(())
    }

    fn has_blob(&self, image: &ImageName, digest: &Digest) -> Result<bool> {
        let repos = self.repos.lock().unwrap();
        Ok(repos
            .get(&image.repository().to_string())
            .is_some_and(|repo| repo.blobs.contains_key(digest)))
    }

    fn put_blob(&self, image: &ImageName, digest: &Digest, data: &[u8]) -> Result<()> {
        digest.verify(data)?;
        let mut repos = self.repos.lock().unwrap();
        let repo = repos
            .entry(image.repository().to_string())
            .or_default();
        repo.blobs.insert(digest.clone(), data.to_vec());
        Ok(())
    }

    fn mount_blob(
        &self,
        image: &ImageName,
        from: &Repository,
        digest: &Digest,
    ) -> Result<bool> {
        let mut repos = self.repos.lock().unwrap();
        let Some(data) = repos
            .get(&from.to_string())
            .and_then(|repo| repo.blobs.get(digest))
            .cloned()
        else {
            return Ok(false);
        };
        repos
            .entry(image.repository().to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), data);
        Ok(true)
    }

    fn list_tags(&self, repo: &Repository) -> Result<Vec<String>> {
        let repos = self.repos.lock().unwrap();
        let mut tags: Vec<String> = repos
            .get(&repo.to_string())
            .map(|repo| repo.tags.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TagName;

    fn manifest(body: &str) -> RawManifest {
        RawManifest::new(
            body.as_bytes().to_vec(),
            crate::registry::OCI_MANIFEST_MEDIA_TYPE,
        )
    }

    #[test]
    fn manifest_round_trip() {
        let store = InMemoryRegistry::new();
        let m = manifest(r#"{"schemaVersion":2}"#);
        let by_tag = ImageName::parse("registry.example/repo:v1").unwrap();

        store.put_manifest(&by_tag, &m).unwrap();

        let got = store.get_manifest(&by_tag).unwrap();
        assert_eq!(got.bytes(), m.bytes());
        assert_eq!(got.digest(), m.digest());

        let by_digest = by_tag.with_digest(m.digest().clone());
        assert_eq!(store.get_manifest(&by_digest).unwrap().digest(), m.digest());
        assert_eq!(
            store.head_manifest(&by_digest).unwrap(),
            Some(m.digest().clone())
        );
        assert_eq!(store.list_tags(&by_tag.repository()).unwrap(), vec!["v1"]);
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/repo:v1").unwrap();
        assert!(matches!(
            store.get_manifest(&image),
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.head_manifest(&image).unwrap(), None);
    }

    #[test]
    fn blob_round_trip_and_mount() {
        let store = InMemoryRegistry::new();
        let src = ImageName::parse("registry.example/src:v1").unwrap();
        let dst = ImageName::parse("registry.example/dst:v1").unwrap();
        let data = b"layer bytes";
        let digest = Digest::from_buf_sha256(data);

        store.put_blob(&src, &digest, data).unwrap();
        assert!(store.has_blob(&src, &digest).unwrap());
        assert!(!store.has_blob(&dst, &digest).unwrap());

        assert!(store
            .mount_blob(&dst, &src.repository(), &digest)
            .unwrap());
        assert_eq!(store.get_blob(&dst, &digest).unwrap(), data);
    }

    #[test]
    fn corrupt_blob_rejected() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/repo:v1").unwrap();
        let digest = Digest::from_buf_sha256(b"right");
        assert!(matches!(
            store.put_blob(&image, &digest, b"wrong"),
            Err(Error::CorruptBlob { .. })
        ));
    }

    #[test]
    fn tags_overwrite_manifests_stay() {
        let store = InMemoryRegistry::new();
        let repo = Repository::parse("registry.example/repo").unwrap();
        let m1 = manifest(r#"{"schemaVersion":2,"n":1}"#);
        let m2 = manifest(r#"{"schemaVersion":2,"n":2}"#);
        let tagged = repo.tag_image(TagName::new("v1").unwrap());

        store.put_manifest(&tagged, &m1).unwrap();
        store.put_manifest(&tagged, &m2).unwrap();

        // Tag repointed, both manifests still resolvable by digest
        assert_eq!(
            store.head_manifest(&tagged).unwrap(),
            Some(m2.digest().clone())
        );
        assert!(store
            .get_manifest(&repo.digest_image(m1.digest().clone()))
            .is_ok());
    }
}
