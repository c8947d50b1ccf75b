//! Pack user directories into a single-layer image and push it
//! through the copy pipeline.

use crate::{
    bundle::{BUNDLE_CONFIG_LABEL, IMAGES_LOCK_FILE, IMGPKG_DIR},
    config::RegistryOpts,
    error::{Error, Result},
    imageset::{copy_image_set, ImageSet, NodeKind, ResolvedNode},
    lockconfig::ImagesLock,
    registry::{ImagesReaderWriter, LocalOverlay, RawManifest, OCI_MANIFEST_MEDIA_TYPE},
    Digest, ImageName,
};
use flate2::{write::GzEncoder, Compression};
use oci_spec::image::{
    ConfigBuilder, DescriptorBuilder, ImageConfigurationBuilder, ImageManifestBuilder,
    MediaType, SCHEMA_VERSION,
};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

/// The files a push uploads, gathered from `-f` flags.
pub struct Contents {
    paths: Vec<PathBuf>,
}

impl Contents {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Contents { paths }
    }

    /// Whether the inputs carry an `.imgpkg` directory, i.e. were
    /// authored as a bundle.
    pub fn presents_as_bundle(&self) -> bool {
        self.imgpkg_dir().is_some()
    }

    fn imgpkg_dir(&self) -> Option<PathBuf> {
        self.paths
            .iter()
            .map(|path| path.join(IMGPKG_DIR))
            .find(|candidate| candidate.is_dir())
    }

    /// Pack the contents as one gzipped tar layer, build the image,
    /// and realize it on `dst` through the local overlay.
    ///
    /// Returns the pushed digest reference.
    pub fn push(
        &self,
        dst: &dyn ImagesReaderWriter,
        image: &ImageName,
        bundle: bool,
        opts: &RegistryOpts,
    ) -> Result<ImageName> {
        match (bundle, self.imgpkg_dir()) {
            (true, None) => {
                return Err(Error::IllFormedBundle(format!(
                    "expected an {IMGPKG_DIR} directory with {IMAGES_LOCK_FILE} in the pushed files"
                )))
            }
            (false, Some(_)) => return Err(Error::ImageWithBundleDir),
            (true, Some(dir)) => {
                // Surface a broken lock at push time, not at copy time
                ImagesLock::from_path(&dir.join(IMAGES_LOCK_FILE))?;
            }
            (false, None) => {}
        }

        let layer = self.build_layer()?;
        let layer_digest = Digest::from_buf_sha256(&layer);

        let config = build_config(bundle)?;
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
        let digest = raw.digest().clone();

        let overlay = LocalOverlay::new(dst);
        overlay.register(
            image,
            &raw,
            &[(layer_digest, layer), (config_digest, config)],
        )?;

        let pinned = image.with_digest(digest.clone());
        let node = ResolvedNode {
            image: pinned.clone(),
            digest: digest.clone(),
            kind: NodeKind::Image,
            tag: image.tag().cloned(),
            annotations: BTreeMap::new(),
        };
        let set = ImageSet {
            nodes: HashMap::from([(digest.clone(), node)]),
            roots: vec![digest],
        };
        copy_image_set(&set, &overlay, dst, &image.repository(), opts.concurrency)?;
        Ok(pinned)
    }

    /// One gzipped tar over every input, file order and metadata
    /// pinned so identical inputs produce identical digests.
    fn build_layer(&self) -> Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for path in &self.paths {
            if path.is_dir() {
                append_dir(&mut builder, path)?;
            } else if path.is_file() {
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| Error::NotADirectory(path.clone()))?;
                append_file(&mut builder, path, Path::new(name))?;
            } else {
                return Err(Error::NotADirectory(path.clone()));
            }
        }
        Ok(builder.into_inner()?.finish()?)
    }
}

fn append_dir<W: std::io::Write>(builder: &mut tar::Builder<W>, root: &Path) -> Result<()> {
    let mut walker: Vec<_> = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Io(e.into()))?;
    walker.retain(|entry| entry.file_type().is_file());
    for entry in walker {
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root");
        append_file(builder, entry.path(), rel)?;
    }
    Ok(())
}

fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    src: &Path,
    dest: &Path,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let data = fs::read(src)?;
    let mode = fs::metadata(src)?.permissions().mode() & 0o777;
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, dest, data.as_slice())?;
    Ok(())
}

fn build_config(bundle: bool) -> Result<Vec<u8>> {
    let mut configuration = ImageConfigurationBuilder::default();
    if bundle {
        let config = ConfigBuilder::default()
            .labels(HashMap::from([(
                BUNDLE_CONFIG_LABEL.to_string(),
                "true".to_string(),
            )]))
            .build()?;
        configuration = configuration.config(config);
    }
    let configuration = configuration.build()?;
    let mut bytes = Vec::new();
    configuration.to_writer(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bundle::{is_bundle, read_images_lock},
        registry::{ImagesReader, InMemoryRegistry},
        testing,
    };

    fn bundle_dir(lock: &ImagesLock) -> PathBuf {
        let dir = testing::scratch_dir("contents");
        fs::create_dir_all(dir.join(IMGPKG_DIR)).unwrap();
        fs::write(
            dir.join(IMGPKG_DIR).join(IMAGES_LOCK_FILE),
            lock.to_yaml().unwrap(),
        )
        .unwrap();
        fs::write(dir.join("app.yml"), "kind: Deployment\n").unwrap();
        dir
    }

    #[test]
    fn push_bundle_sets_the_label_and_embeds_the_lock() {
        let dst = InMemoryRegistry::new();
        let dir = bundle_dir(&testing::images_lock(&[]));
        let image = ImageName::parse("registry.example/pushed:v1").unwrap();

        let pushed = Contents::new(vec![dir])
            .push(&dst, &image, true, &RegistryOpts::default())
            .unwrap();

        let manifest = dst
            .get_manifest(&pushed)
            .unwrap()
            .as_image_manifest()
            .unwrap();
        assert!(is_bundle(&dst, &pushed, &manifest).unwrap());
        let files = read_images_lock(&dst, &pushed, &manifest).unwrap();
        assert!(files.images_lock.images.is_empty());

        // Tag points at the pushed digest
        assert_eq!(
            dst.head_manifest(&image).unwrap(),
            pushed.digest().cloned()
        );
    }

    #[test]
    fn push_is_digest_stable() {
        let dst = InMemoryRegistry::new();
        let dir = bundle_dir(&testing::images_lock(&[]));
        let image = ImageName::parse("registry.example/pushed:v1").unwrap();
        let contents = Contents::new(vec![dir]);

        let first = contents
            .push(&dst, &image, true, &RegistryOpts::default())
            .unwrap();
        let second = contents
            .push(&dst, &image, true, &RegistryOpts::default())
            .unwrap();
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn image_push_rejects_imgpkg_dir() {
        let dst = InMemoryRegistry::new();
        let dir = bundle_dir(&testing::images_lock(&[]));
        let image = ImageName::parse("registry.example/pushed:v1").unwrap();

        let err = Contents::new(vec![dir])
            .push(&dst, &image, false, &RegistryOpts::default())
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Images cannot be pushed with '.imgpkg' directories"));
    }

    #[test]
    fn bundle_push_requires_imgpkg_dir() {
        let dst = InMemoryRegistry::new();
        let dir = testing::scratch_dir("contents-plain");
        fs::write(dir.join("app.yml"), "kind: Deployment\n").unwrap();
        let image = ImageName::parse("registry.example/pushed:v1").unwrap();

        assert!(matches!(
            Contents::new(vec![dir]).push(&dst, &image, true, &RegistryOpts::default()),
            Err(Error::IllFormedBundle(_))
        ));
    }
}
