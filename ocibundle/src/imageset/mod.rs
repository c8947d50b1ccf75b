//! The transitive set of images reachable from a copy's roots.

mod copy;
mod resolve;

pub use copy::{copy_image_set, copy_to_repo, write_lock_output, CopyResult, ProcessedImageRef};
pub use resolve::resolve;

use crate::{
    error::{Error, Result},
    lockconfig::{ImagesLock, Lock},
    registry::ImagesReader,
    Digest, ImageName, TagName,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

/// Resolve the inputs' roots and enforce what the user promised
/// about them (`-b` roots must be bundles, `-i` roots must not be).
pub fn resolve_inputs(
    reader: &dyn ImagesReader,
    inputs: &CopyInputs,
    workers: usize,
) -> Result<ImageSet> {
    let set = resolve(reader, inputs.roots.clone(), workers)?;
    if inputs.expect_bundle && !set.roots.iter().all(|digest| set.is_bundle(digest)) {
        return Err(Error::NotABundle);
    }
    if inputs.expect_plain && set.roots.iter().any(|digest| set.is_bundle(digest)) {
        return Err(Error::IsBundle);
    }
    Ok(set)
}

/// An input to a copy: a reference, the tag to re-apply at the
/// destination (roots only), and the annotations of the lock entry
/// that named it.
#[derive(Debug, Clone)]
pub struct UnprocessedImageRef {
    pub image: ImageName,
    pub tag: Option<TagName>,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl UnprocessedImageRef {
    pub fn from_image(image: &ImageName) -> Self {
        UnprocessedImageRef {
            image: image.clone(),
            tag: image.tag().cloned(),
            annotations: None,
        }
    }
}

/// What the resolver learned a node to be.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Image,
    /// Multi-arch index; children are image manifests copied before
    /// the index itself.
    Index { children: Vec<Digest> },
    /// Bundle with its embedded lock, parsed once during resolution.
    Bundle { images_lock: ImagesLock },
}

#[derive(Debug, Clone)]
pub struct ResolvedNode {
    /// Source reference, pinned to the digest.
    pub image: ImageName,
    pub digest: Digest,
    pub kind: NodeKind,
    /// Tag to re-apply at the destination; roots only.
    pub tag: Option<TagName>,
    /// Annotation sets keyed by referrer digest (empty key for
    /// lock-file inputs).
    pub annotations: BTreeMap<String, BTreeMap<String, String>>,
}

impl ResolvedNode {
    pub fn is_bundle(&self) -> bool {
        matches!(self.kind, NodeKind::Bundle { .. })
    }
}

/// Deduplicated output of a resolve: digest-keyed nodes plus the
/// digests the roots resolved to, in input order.
#[derive(Debug, Default)]
pub struct ImageSet {
    pub nodes: HashMap<Digest, ResolvedNode>,
    pub roots: Vec<Digest>,
}

impl ImageSet {
    pub fn is_bundle(&self, digest: &Digest) -> bool {
        self.nodes.get(digest).is_some_and(ResolvedNode::is_bundle)
    }

    /// Index nodes ordered children-before-parents, so a nested index
    /// is always realized after the indexes it references.
    pub fn indexes_child_first(&self) -> Vec<&ResolvedNode> {
        fn depth(set: &ImageSet, digest: &Digest) -> usize {
            match set.nodes.get(digest).map(|n| &n.kind) {
                Some(NodeKind::Index { children }) => {
                    1 + children.iter().map(|c| depth(set, c)).max().unwrap_or(0)
                }
                _ => 0,
            }
        }
        let mut indexes: Vec<&ResolvedNode> = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Index { .. }))
            .collect();
        indexes.sort_by_key(|n| depth(self, &n.digest));
        indexes
    }
}

/// Roots of a copy plus what kind of root the user promised.
#[derive(Debug, Clone)]
pub struct CopyInputs {
    pub roots: Vec<UnprocessedImageRef>,
    /// Roots must be bundles (`-b` or a `BundleLock` input).
    pub expect_bundle: bool,
    /// Roots must be plain images (`-i` input).
    pub expect_plain: bool,
}

/// What the user asked to copy.
#[derive(Debug, Clone)]
pub enum CopyOrigin {
    Bundle(ImageName),
    Image(ImageName),
    Lock(PathBuf),
}

impl CopyOrigin {
    pub fn from_flags(
        bundle: Option<&str>,
        image: Option<&str>,
        lock: Option<PathBuf>,
    ) -> Result<Self> {
        match (bundle, image, lock) {
            (Some(bundle), None, None) => Ok(CopyOrigin::Bundle(ImageName::parse(bundle)?)),
            (None, Some(image), None) => Ok(CopyOrigin::Image(ImageName::parse(image)?)),
            (None, None, Some(lock)) => Ok(CopyOrigin::Lock(lock)),
            (None, None, None) => Err(Error::MissingInput),
            _ => Err(Error::MixedInput),
        }
    }

    /// Expand into root references; lock files are read here.
    pub fn inputs(&self) -> Result<CopyInputs> {
        match self {
            CopyOrigin::Bundle(image) => Ok(CopyInputs {
                roots: vec![UnprocessedImageRef::from_image(image)],
                expect_bundle: true,
                expect_plain: false,
            }),
            CopyOrigin::Image(image) => Ok(CopyInputs {
                roots: vec![UnprocessedImageRef::from_image(image)],
                expect_bundle: false,
                expect_plain: true,
            }),
            CopyOrigin::Lock(path) => match Lock::from_path(path)? {
                Lock::Bundle(lock) => {
                    let image = lock.image_name()?;
                    let tag = lock
                        .bundle
                        .tag
                        .as_deref()
                        .map(TagName::new)
                        .transpose()?;
                    Ok(CopyInputs {
                        roots: vec![UnprocessedImageRef {
                            image,
                            tag,
                            annotations: None,
                        }],
                        expect_bundle: true,
                        expect_plain: false,
                    })
                }
                Lock::Images(lock) => Ok(CopyInputs {
                    roots: lock
                        .images
                        .iter()
                        .map(|entry| {
                            Ok(UnprocessedImageRef {
                                image: entry.image_name()?,
                                tag: None,
                                annotations: entry.annotations.clone(),
                            })
                        })
                        .collect::<Result<_>>()?,
                    expect_bundle: false,
                    expect_plain: false,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_and_missing_input() {
        assert!(matches!(
            CopyOrigin::from_flags(Some("r.example/b"), Some("r.example/i"), None),
            Err(Error::MixedInput)
        ));
        assert!(matches!(
            CopyOrigin::from_flags(None, None, None),
            Err(Error::MissingInput)
        ));
        assert!(CopyOrigin::from_flags(Some("r.example/b:v1"), None, None).is_ok());
    }
}
