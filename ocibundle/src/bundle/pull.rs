//! Pull an image or bundle to a local directory, rewriting the
//! embedded lock so every referenced image resolves from the bundle's
//! current repository.

use crate::{
    bundle::{
        fetch_locations, is_bundle, layer_archive, ImageLocationsConfig, IMAGES_LOCK_FILE,
        IMGPKG_DIR,
    },
    error::{Error, Result},
    lockconfig::ImagesLock,
    registry::ImagesReader,
    util::retry,
    Digest, ImageName, Repository,
};
use oci_spec::image::ImageManifest;
use std::{fs, path::Path};

#[derive(Debug, Clone, Default)]
pub struct PullOpts {
    /// The reference was given with `-b`: the manifest must be a
    /// bundle. Without it (`-i`), it must not be.
    pub bundle: bool,
    /// Recurse into referenced bundles, extracting each under
    /// `.imgpkg/bundles/<algo>-<hex>/`.
    pub recursive: bool,
}

/// Pull `image` into `output`, returning the pinned digest reference.
///
/// Image indexes cannot be pulled; supply a specific image digest.
pub fn pull(
    reader: &dyn ImagesReader,
    image: &ImageName,
    output: &Path,
    opts: &PullOpts,
) -> Result<ImageName> {
    let raw = retry(|| reader.get_manifest(image))?;
    if raw.is_index() {
        return Err(Error::NonImage);
    }
    let manifest = raw.as_image_manifest()?;
    let pinned = image.with_digest(raw.digest().clone());

    let bundle = is_bundle(reader, &pinned, &manifest)?;
    match (opts.bundle, bundle) {
        (false, true) => return Err(Error::IsBundle),
        (true, false) => return Err(Error::NotABundle),
        _ => {}
    }

    fs::create_dir_all(output)?;
    unpack_layers(reader, &pinned, &manifest, output)?;

    if bundle {
        let repo = pinned.repository();
        let locations = fetch_locations(reader, &repo, raw.digest())?;
        rewrite_and_recurse(reader, &repo, output, locations.as_ref(), opts.recursive)?;
    }
    Ok(pinned)
}

fn unpack_layers(
    reader: &dyn ImagesReader,
    image: &ImageName,
    manifest: &ImageManifest,
    output: &Path,
) -> Result<()> {
    for layer in manifest.layers() {
        let digest = Digest::from_descriptor(layer)?;
        let blob = retry(|| reader.get_blob(image, &digest))?;
        let mut archive = layer_archive(layer, &blob)?;
        archive.unpack(output)?;
    }
    Ok(())
}

/// Rewrite `.imgpkg/images.yml` so each entry points into `repo`,
/// then recurse into entries that are themselves bundles.
///
/// Only the `image` field of each entry changes; annotations and the
/// document header are preserved.
fn rewrite_and_recurse(
    reader: &dyn ImagesReader,
    repo: &Repository,
    output: &Path,
    locations: Option<&ImageLocationsConfig>,
    recursive: bool,
) -> Result<()> {
    let lock_path = output.join(IMGPKG_DIR).join(IMAGES_LOCK_FILE);
    if !lock_path.is_file() {
        return Err(Error::IllFormedBundle(format!(
            "extracted bundle lacks {}/{}",
            IMGPKG_DIR, IMAGES_LOCK_FILE
        )));
    }
    let mut lock = ImagesLock::from_path(&lock_path)?;

    let mut digests = Vec::new();
    for entry in &mut lock.images {
        let digest = entry
            .image_name()?
            .digest()
            .expect("validated at parse")
            .clone();
        entry.image = repo.digest_image(digest.clone()).to_string();
        digests.push(digest);
    }
    lock.write_to_path(&lock_path)?;

    if !recursive {
        return Ok(());
    }
    for digest in digests {
        if !entry_is_bundle(reader, repo, &digest, locations)? {
            continue;
        }
        let nested = output
            .join(IMGPKG_DIR)
            .join("bundles")
            .join(digest.archive_entry());
        let nested_image = repo.digest_image(digest);
        pull(
            reader,
            &nested_image,
            &nested,
            &PullOpts {
                bundle: true,
                recursive: true,
            },
        )?;
    }
    Ok(())
}

/// Whether a referenced image is itself a bundle, per the locations
/// artifact when available, by inspection otherwise.
fn entry_is_bundle(
    reader: &dyn ImagesReader,
    repo: &Repository,
    digest: &Digest,
    locations: Option<&ImageLocationsConfig>,
) -> Result<bool> {
    if let Some(known) = locations.and_then(|cfg| cfg.is_bundle(digest)) {
        return Ok(known);
    }
    let image = repo.digest_image(digest.clone());
    let raw = retry(|| reader.get_manifest(&image))?;
    if !raw.is_image_manifest() {
        return Ok(false);
    }
    is_bundle(reader, &image, &raw.as_image_manifest()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bundle::{locations_tag, write_locations, ImageLocation},
        registry::InMemoryRegistry,
        testing,
    };

    const IMG_DIGEST: &str =
        "sha256:ebf526c198a14fa138634b9746c50ec38077ec9b3986227e79eb837d26f59dc6";

    #[test]
    fn plain_image_pull_extracts_files() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/app:v1").unwrap();
        let pushed = testing::push_plain_image(&store, &image, b"hello");
        let out = testing::scratch_dir("pull-plain");

        let pulled = pull(&store, &pushed, &out, &PullOpts::default()).unwrap();
        assert_eq!(pulled, pushed);
        assert_eq!(fs::read(out.join("file.txt")).unwrap(), b"hello");
    }

    #[test]
    fn bundle_pull_rewrites_the_lock() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/relocated:v1").unwrap();
        let source_ref = format!("index.docker.io/library/hello-world@{IMG_DIGEST}");
        let lock = testing::images_lock(&[&source_ref]);
        let bundle = testing::push_bundle(&store, &image, &lock, &[]);
        let out = testing::scratch_dir("pull-bundle");

        pull(
            &store,
            &bundle,
            &out,
            &PullOpts {
                bundle: true,
                recursive: false,
            },
        )
        .unwrap();

        let rewritten =
            ImagesLock::from_path(&out.join(IMGPKG_DIR).join(IMAGES_LOCK_FILE)).unwrap();
        assert_eq!(
            rewritten.images[0].image,
            format!("registry.example/relocated@{IMG_DIGEST}")
        );
        // Header untouched
        assert_eq!(rewritten.api_version, lock.api_version);
        assert_eq!(rewritten.kind, lock.kind);
    }

    #[test]
    fn recursive_pull_extracts_nested_bundles() {
        let store = InMemoryRegistry::new();
        let repo_image = ImageName::parse("registry.example/relocated:inner").unwrap();

        let leaf = testing::push_plain_image(&store, &repo_image, b"leaf");
        let inner_lock = testing::images_lock(&[&leaf.to_string()]);
        let inner = testing::push_bundle(&store, &repo_image, &inner_lock, &[]);
        let inner_digest = inner.digest().unwrap().clone();

        let outer_lock = testing::images_lock(&[&inner.to_string()]);
        let outer_image = ImageName::parse("registry.example/relocated:outer").unwrap();
        let outer = testing::push_bundle(&store, &outer_image, &outer_lock, &[]);

        let out = testing::scratch_dir("pull-recursive");
        pull(
            &store,
            &outer,
            &out,
            &PullOpts {
                bundle: true,
                recursive: true,
            },
        )
        .unwrap();

        let nested = out
            .join(IMGPKG_DIR)
            .join("bundles")
            .join(inner_digest.archive_entry());
        assert!(nested.join(IMGPKG_DIR).join(IMAGES_LOCK_FILE).is_file());
        assert!(nested.join(IMGPKG_DIR).join("bundle.yml").is_file());

        let nested_lock =
            ImagesLock::from_path(&nested.join(IMGPKG_DIR).join(IMAGES_LOCK_FILE)).unwrap();
        assert_eq!(nested_lock.images[0].image, leaf.to_string());
    }

    #[test]
    fn locations_artifact_guides_recursion() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/relocated:v1").unwrap();
        let inner_lock = testing::images_lock(&[]);
        let inner = testing::push_bundle(&store, &image, &inner_lock, &[]);

        let outer_lock = testing::images_lock(&[&inner.to_string()]);
        let outer = testing::push_bundle(&store, &image, &outer_lock, &[]);

        // Publish locations marking the inner entry as a bundle
        let repo = image.repository();
        write_locations(
            &store,
            &repo,
            outer.digest().unwrap(),
            &ImageLocationsConfig::new(vec![ImageLocation {
                image: inner.to_string(),
                is_bundle: true,
            }]),
        )
        .unwrap();
        assert!(store
            .get_manifest(
                &ImageName::parse(&format!(
                    "registry.example/relocated:{}",
                    locations_tag(outer.digest().unwrap())
                ))
                .unwrap()
            )
            .is_ok());

        let out = testing::scratch_dir("pull-locations");
        pull(
            &store,
            &outer,
            &out,
            &PullOpts {
                bundle: true,
                recursive: true,
            },
        )
        .unwrap();
        let nested = out
            .join(IMGPKG_DIR)
            .join("bundles")
            .join(inner.digest().unwrap().archive_entry());
        assert!(nested.join(IMGPKG_DIR).join(IMAGES_LOCK_FILE).is_file());
    }

    #[test]
    fn image_index_cannot_be_pulled() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/multi:v1").unwrap();
        let index = testing::push_image_index(&store, &image);
        let out = testing::scratch_dir("pull-index");

        let err = pull(&store, &index, &out, &PullOpts::default()).unwrap_err();
        assert!(err.to_string().contains("Unable to pull non-images"));
    }

    #[test]
    fn bundle_flag_mismatches() {
        let store = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/app:v1").unwrap();
        let bundle = testing::push_bundle(&store, &image, &testing::images_lock(&[]), &[]);
        let plain = testing::push_plain_image(&store, &image, b"x");
        let out = testing::scratch_dir("pull-flags");

        assert!(matches!(
            pull(&store, &bundle, &out, &PullOpts::default()),
            Err(Error::IsBundle)
        ));
        assert!(matches!(
            pull(
                &store,
                &plain,
                &out,
                &PullOpts {
                    bundle: true,
                    recursive: false
                }
            ),
            Err(Error::NotABundle)
        ));
    }
}
