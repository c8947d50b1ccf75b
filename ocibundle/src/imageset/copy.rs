//! Realize a resolved image set in a destination repository.
//!
//! Every node keeps its digest; only the repository changes. Blobs
//! are mounted when source and destination share a registry host,
//! streamed otherwise, and never uploaded twice thanks to a
//! process-wide single-flight map keyed by (host, repo, digest).

use super::{CopyInputs, ImageSet, NodeKind, ResolvedNode};
use crate::{
    bundle::{write_locations, ImageLocation, ImageLocationsConfig},
    config::RegistryOpts,
    error::{Error, Result},
    lockconfig::{BundleLock, ImageRef, ImagesLock},
    registry::{ImagesReader, ImagesReaderWriter},
    util::{each_parallel, retry, SingleFlight},
    Digest, ImageName, Repository,
};
use std::path::Path;

lazy_static::lazy_static! {
    static ref BLOB_FLIGHTS: SingleFlight = SingleFlight::new();
}

/// Source and destination of one processed node, digest carried
/// through.
#[derive(Debug, Clone)]
pub struct ProcessedImageRef {
    pub source: ImageName,
    pub destination: ImageName,
}

pub struct CopyResult {
    pub set: ImageSet,
    pub processed: Vec<ProcessedImageRef>,
}

/// Resolve `inputs` from `src` and realize every node in `repo` on
/// `dst`, publishing a locations artifact per copied bundle.
pub fn copy_to_repo(
    src: &dyn ImagesReader,
    dst: &dyn ImagesReaderWriter,
    inputs: &CopyInputs,
    repo: &Repository,
    opts: &RegistryOpts,
) -> Result<CopyResult> {
    let set = super::resolve_inputs(src, inputs, opts.concurrency)?;
    copy_image_set(&set, src, dst, repo, opts.concurrency)?;

    // A failed locations write does not poison a successful copy;
    // consumers fall back to the co-location invariant.
    for node in set.nodes.values().filter(|node| node.is_bundle()) {
        let cfg = locations_config(&set, node);
        if let Err(err) = write_locations(dst, repo, &node.digest, &cfg) {
            log::warn!(
                "Copy succeeded, but writing the locations artifact for {} failed: {}",
                node.digest,
                err
            );
        }
    }

    let processed = set
        .nodes
        .values()
        .map(|node| ProcessedImageRef {
            source: node.image.clone(),
            destination: repo.digest_image(node.digest.clone()),
        })
        .collect();
    Ok(CopyResult { set, processed })
}

/// Copy every node of a resolved set. Image manifests land first, in
/// parallel; indexes follow children-first, so no manifest is ever
/// committed before what it references.
pub fn copy_image_set(
    set: &ImageSet,
    src: &dyn ImagesReader,
    dst: &dyn ImagesReaderWriter,
    repo: &Repository,
    concurrency: usize,
) -> Result<()> {
    let images: Vec<&ResolvedNode> = set
        .nodes
        .values()
        .filter(|node| !matches!(node.kind, NodeKind::Index { .. }))
        .collect();
    each_parallel(images, concurrency, |node| {
        copy_node(node, src, dst, repo, concurrency)
    })?;

    for node in set.indexes_child_first() {
        copy_node(node, src, dst, repo, concurrency)?;
    }
    Ok(())
}

fn copy_node(
    node: &ResolvedNode,
    src: &dyn ImagesReader,
    dst: &dyn ImagesReaderWriter,
    repo: &Repository,
    concurrency: usize,
) -> Result<()> {
    let dest = repo.digest_image(node.digest.clone());
    let already_present =
        retry(|| dst.head_manifest(&dest))?.as_ref() == Some(&node.digest);

    let raw = if already_present {
        log::debug!("Skipping {}, already present", dest);
        None
    } else {
        let raw = retry(|| src.get_manifest(&node.image))?;
        if raw.is_image_manifest() {
            let manifest = raw.as_image_manifest()?;
            let mut blobs = vec![Digest::from_descriptor(manifest.config())?];
            for layer in manifest.layers() {
                blobs.push(Digest::from_descriptor(layer)?);
            }
            each_parallel(blobs, concurrency, |digest| {
                copy_blob(node, &digest, src, dst, &dest)
            })?;
        }
        // Blobs (and, for indexes, child manifests) are durable now
        retry(|| dst.put_manifest(&dest, &raw))?;
        Some(raw)
    };

    if let Some(tag) = &node.tag {
        let raw = match raw {
            Some(raw) => raw,
            None => retry(|| dst.get_manifest(&dest))?,
        };
        retry(|| dst.put_manifest(&repo.tag_image(tag.clone()), &raw))?;
    }
    Ok(())
}

fn copy_blob(
    node: &ResolvedNode,
    digest: &Digest,
    src: &dyn ImagesReader,
    dst: &dyn ImagesReaderWriter,
    dest: &ImageName,
) -> Result<()> {
    let key = format!(
        "{}|{}|{}",
        dest.registry_host(),
        dest.name.as_str(),
        digest
    );
    BLOB_FLIGHTS.run(&key, || {
        if retry(|| dst.has_blob(dest, digest))? {
            return Ok(());
        }
        let from = node.image.repository();
        if retry(|| dst.mount_blob(dest, &from, digest))? {
            log::debug!("Mounted {} from {}", digest, from);
            return Ok(());
        }
        let data = retry(|| src.get_blob(&node.image, digest))?;
        retry(|| dst.put_blob(dest, digest, &data))
    })
}

fn locations_config(set: &ImageSet, bundle: &ResolvedNode) -> ImageLocationsConfig {
    let NodeKind::Bundle { images_lock } = &bundle.kind else {
        unreachable!("only bundle nodes get a locations artifact");
    };
    let mut seen = std::collections::HashSet::new();
    let images = images_lock
        .images
        .iter()
        .filter(|entry| seen.insert(entry.image.clone()))
        .map(|entry| {
            let is_bundle = entry
                .image_name()
                .ok()
                .and_then(|name| name.digest().cloned())
                .is_some_and(|digest| set.is_bundle(&digest));
            ImageLocation {
                image: entry.image.clone(),
                is_bundle,
            }
        })
        .collect();
    ImageLocationsConfig::new(images)
}

/// Write the `--lock-output` document after a copy: a `BundleLock`
/// for a bundle root, a rewritten `ImagesLock` otherwise.
pub fn write_lock_output(
    inputs: &CopyInputs,
    result: &CopyResult,
    repo: &Repository,
    path: &Path,
) -> Result<()> {
    if inputs.expect_bundle {
        let digest = result.set.roots.first().ok_or(Error::MissingInput)?;
        let tag = inputs.roots[0].tag.as_ref().map(|tag| tag.to_string());
        return BundleLock::new(&repo.digest_image(digest.clone()), tag).write_to_path(path);
    }

    let images = inputs
        .roots
        .iter()
        .map(|root| {
            let digest = match root.image.digest() {
                Some(digest) => digest.clone(),
                // A tag root resolves to exactly one digest
                None => result.set.roots.first().ok_or(Error::MissingInput)?.clone(),
            };
            Ok(ImageRef {
                image: repo.digest_image(digest).to_string(),
                annotations: root.annotations.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    ImagesLock::new(images).write_to_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bundle::{fetch_locations, locations_tag},
        imageset::UnprocessedImageRef,
        registry::InMemoryRegistry,
        testing, TagName,
    };

    fn inputs_for(image: &ImageName, expect_bundle: bool) -> CopyInputs {
        CopyInputs {
            roots: vec![UnprocessedImageRef::from_image(image)],
            expect_bundle,
            expect_plain: !expect_bundle,
        }
    }

    #[test]
    fn bundle_copy_preserves_digests_and_colocates() {
        let src = InMemoryRegistry::new();
        let dst = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/src-one:v1").unwrap();
        let dep = testing::push_plain_image(&src, &image, b"dep bytes");
        let lock = testing::images_lock(&[&dep.to_string()]);
        let bundle = testing::push_bundle(&src, &image, &lock, &[]);
        let repo = Repository::parse("relocated.example/dst-one").unwrap();

        let result = copy_to_repo(
            &src,
            &dst,
            &inputs_for(&bundle, true),
            &repo,
            &RegistryOpts::default(),
        )
        .unwrap();

        // Every node retrievable from the destination by its digest
        for node in result.set.nodes.values() {
            let moved = repo.digest_image(node.digest.clone());
            let raw = dst.get_manifest(&moved).unwrap();
            assert_eq!(raw.digest(), &node.digest);
        }

        // Root tag re-applied at the destination
        let tagged = repo.tag_image(TagName::new("v1").unwrap());
        assert_eq!(
            dst.head_manifest(&tagged).unwrap(),
            bundle.digest().cloned()
        );

        // Locations artifact published under the derived tag
        let locations = fetch_locations(&dst, &repo, bundle.digest().unwrap())
            .unwrap()
            .expect("locations must be written");
        assert_eq!(locations.images.len(), 1);
        assert_eq!(locations.images[0].image, dep.to_string());
        assert!(!locations.images[0].is_bundle);
    }

    #[test]
    fn copy_is_idempotent_including_locations() {
        let src = InMemoryRegistry::new();
        let dst = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/src-two:v1").unwrap();
        let dep = testing::push_plain_image(&src, &image, b"dep");
        let lock = testing::images_lock(&[&dep.to_string()]);
        let bundle = testing::push_bundle(&src, &image, &lock, &[]);
        let repo = Repository::parse("relocated.example/dst-two").unwrap();

        let mut locations_digests = Vec::new();
        for _ in 0..3 {
            copy_to_repo(
                &src,
                &dst,
                &inputs_for(&bundle, true),
                &repo,
                &RegistryOpts::default(),
            )
            .unwrap();
            let tag = TagName::new(&locations_tag(bundle.digest().unwrap())).unwrap();
            locations_digests
                .push(dst.head_manifest(&repo.tag_image(tag)).unwrap().unwrap());
        }
        assert!(locations_digests.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn nested_bundles_mark_is_bundle_in_locations() {
        let src = InMemoryRegistry::new();
        let dst = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/src-three:v1").unwrap();
        let leaf = testing::push_plain_image(&src, &image, b"leaf");
        let inner =
            testing::push_bundle(&src, &image, &testing::images_lock(&[&leaf.to_string()]), &[]);
        let outer =
            testing::push_bundle(&src, &image, &testing::images_lock(&[&inner.to_string()]), &[]);
        let repo = Repository::parse("relocated.example/dst-three").unwrap();

        copy_to_repo(
            &src,
            &dst,
            &inputs_for(&outer, true),
            &repo,
            &RegistryOpts::default(),
        )
        .unwrap();

        let outer_locations = fetch_locations(&dst, &repo, outer.digest().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(outer_locations.images[0].image, inner.to_string());
        assert!(outer_locations.images[0].is_bundle);

        // The nested bundle got its own locations artifact
        let inner_locations = fetch_locations(&dst, &repo, inner.digest().unwrap())
            .unwrap()
            .unwrap();
        assert!(!inner_locations.images[0].is_bundle);
    }

    #[test]
    fn copy_bundle_flag_mismatch_fails() {
        let src = InMemoryRegistry::new();
        let dst = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/src-four:v1").unwrap();
        let plain = testing::push_plain_image(&src, &image, b"plain");
        let repo = Repository::parse("relocated.example/dst-four").unwrap();

        assert!(matches!(
            copy_to_repo(
                &src,
                &dst,
                &inputs_for(&plain, true),
                &repo,
                &RegistryOpts::default(),
            ),
            Err(Error::NotABundle)
        ));
    }

    #[test]
    fn lock_output_rewrites_to_destination() {
        let src = InMemoryRegistry::new();
        let dst = InMemoryRegistry::new();
        let image = ImageName::parse("registry.example/src-five:v1").unwrap();
        let dep = testing::push_plain_image(&src, &image, b"dep");
        let repo = Repository::parse("relocated.example/dst-five").unwrap();

        let mut root = UnprocessedImageRef::from_image(&dep);
        root.annotations = Some(std::collections::BTreeMap::from([(
            "some-annotation".to_string(),
            "some-value".to_string(),
        )]));
        let inputs = CopyInputs {
            roots: vec![root],
            expect_bundle: false,
            expect_plain: false,
        };
        let result =
            copy_to_repo(&src, &dst, &inputs, &repo, &RegistryOpts::default()).unwrap();

        let dir = testing::scratch_dir("lock-output");
        let path = dir.join("relocate-lock.yml");
        write_lock_output(&inputs, &result, &repo, &path).unwrap();

        let lock = ImagesLock::from_path(&path).unwrap();
        assert_eq!(
            lock.images[0].image,
            repo.digest_image(dep.digest().unwrap().clone()).to_string()
        );
        assert_eq!(
            lock.images[0].annotations.as_ref().unwrap()["some-annotation"],
            "some-value"
        );
    }
}
