use crate::{
    error::{Error, Result},
    imageset::UnprocessedImageRef,
    imagetar::{ArchiveImage, ArchiveManifest, ARCHIVE_MANIFEST_FILE},
    registry::{ImagesReader, RawManifest},
    Digest, Identifier, ImageName, TagName,
};
use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

/// A tar archive acting as a read-only registry.
///
/// Lookups by digest map directly to the equally-named tar entry.
/// Every read reopens the file, so the registry is freely shared
/// across copy workers.
pub struct TarRegistry {
    path: PathBuf,
    index: ArchiveManifest,
    by_digest: HashMap<Digest, usize>,
    by_tag: HashMap<String, usize>,
}

impl TarRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let index_bytes = read_entry_from(path, ARCHIVE_MANIFEST_FILE)?;
        let index: ArchiveManifest = serde_json::from_slice(&index_bytes)?;

        let mut by_digest = HashMap::new();
        let mut by_tag = HashMap::new();
        for (at, image) in index.images.iter().enumerate() {
            by_digest.insert(Digest::new(&image.digest)?, at);
            if let Some(tag) = &image.tag {
                by_tag.insert(tag.clone(), at);
            }
        }
        Ok(TarRegistry {
            path: path.to_path_buf(),
            index,
            by_digest,
            by_tag,
        })
    }

    /// The archive's root images as copy roots, tags preserved.
    /// Archives written before roots were recorded treat every image
    /// as a root; deduplication makes that harmless.
    pub fn root_refs(&self) -> Result<Vec<UnprocessedImageRef>> {
        let mut images: Vec<&ArchiveImage> =
            self.index.images.iter().filter(|i| i.is_root).collect();
        if images.is_empty() {
            images = self.index.images.iter().collect();
        }
        images
            .into_iter()
            .map(|image| {
                let source = ImageName::parse(&image.source_ref)?;
                let tag = image.tag.as_deref().map(TagName::new).transpose()?;
                Ok(UnprocessedImageRef {
                    image: source,
                    tag,
                    annotations: None,
                })
            })
            .collect()
    }

    fn lookup(&self, image: &ImageName) -> Option<&ArchiveImage> {
        let at = match &image.identifier {
            Identifier::Digest(digest) => self.by_digest.get(digest)?,
            Identifier::Tag(tag) => self.by_tag.get(tag.as_str())?,
        };
        self.index.images.get(*at)
    }

    fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        read_entry_from(&self.path, name)
    }
}

fn read_entry_from(path: &Path, name: &str) -> Result<Vec<u8>> {
    let f = fs::File::open(path)?;
    let mut archive = tar::Archive::new(f);
    for entry in archive.entries_with_seek()? {
        let mut entry = entry?;
        if entry.path()?.as_os_str() == name {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    Err(Error::TarEntryNotFound(name.to_string()))
}

impl ImagesReader for TarRegistry {
    fn get_manifest(&self, image: &ImageName) -> Result<RawManifest> {
        let record = self
            .lookup(image)
            .ok_or_else(|| Error::NotFound(image.to_string()))?;
        let digest = Digest::new(&record.digest)?;
        let bytes = self.read_entry(&digest.archive_entry())?;
        digest.verify(&bytes)?;
        Ok(RawManifest::new(bytes, record.media_type.clone()))
    }

    fn head_manifest(&self, image: &ImageName) -> Result<Option<Digest>> {
        Ok(self
            .lookup(image)
            .map(|record| Digest::new(&record.digest))
            .transpose()?)
    }

    fn get_blob(&self, _image: &ImageName, digest: &Digest) -> Result<Vec<u8>> {
        let bytes = self.read_entry(&digest.archive_entry())?;
        digest.verify(&bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        imageset::{resolve, UnprocessedImageRef},
        imagetar::export,
        registry::InMemoryRegistry,
        testing,
    };

    fn exported_bundle() -> (PathBuf, ImageName, ImageName) {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/app:v1").unwrap();
        let dep = testing::push_plain_image(&store, &image, b"dep");
        let lock = testing::images_lock(&[&dep.to_string()]);
        let bundle = testing::push_bundle(&store, &image, &lock, &[]);

        let set = resolve(&store, vec![UnprocessedImageRef::from_image(&bundle)], 4).unwrap();
        let dir = testing::scratch_dir("imagetar");
        let path = dir.join("images.tar");
        export(&set, &store, &path).unwrap();
        (path, bundle, dep)
    }

    #[test]
    fn archive_round_trip() {
        let (path, bundle, dep) = exported_bundle();
        let archive = TarRegistry::open(&path).unwrap();

        // Manifest readable by digest, bytes verified
        let raw = archive.get_manifest(&bundle).unwrap();
        assert_eq!(raw.digest(), bundle.digest().unwrap());
        assert_eq!(
            archive.head_manifest(&dep).unwrap(),
            Some(dep.digest().unwrap().clone())
        );

        // Blobs round-trip too
        let manifest = raw.as_image_manifest().unwrap();
        let layer = Digest::from_descriptor(&manifest.layers()[0]).unwrap();
        assert!(!archive.get_blob(&bundle, &layer).unwrap().is_empty());

        // Only the bundle was a root; flag and tag survive
        let roots = archive.root_refs().unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].image.digest(), bundle.digest());
        let record = archive.lookup(&bundle).unwrap();
        assert!(record.is_bundle);
        assert!(record.is_root);
        assert_eq!(record.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn missing_entries_are_non_retryable() {
        let (path, bundle, _) = exported_bundle();
        let archive = TarRegistry::open(&path).unwrap();

        let ghost = Digest::from_buf_sha256(b"not in the archive");
        let err = archive.get_blob(&bundle, &ghost).unwrap_err();
        assert!(matches!(err, Error::TarEntryNotFound(_)));
        assert!(!err.is_retryable());

        // Unknown manifests are not-found, not tar corruption
        let unknown = bundle.with_digest(ghost);
        assert!(matches!(
            archive.get_manifest(&unknown),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn refuses_to_overwrite_an_archive() {
        let (path, _, _) = exported_bundle();
        let store = InMemoryRegistry::new();
        let set = crate::imageset::ImageSet::default();
        assert!(matches!(
            export(&set, &store, &path),
            Err(Error::FileAlreadyExists(_))
        ));
    }
}
