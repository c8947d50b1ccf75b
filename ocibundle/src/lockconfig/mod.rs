//! Lock documents naming images by digest: the `ImagesLock` embedded
//! in a bundle's `.imgpkg` directory and the `BundleLock` users feed
//! to `copy --lock`.

use crate::{
    error::{Error, Result},
    ImageName,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

pub const LOCK_API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";
pub const BUNDLE_LOCK_KIND: &str = "BundleLock";

/// One image entry of an [ImagesLock].
///
/// The `image` field is always a digest reference; annotations ride
/// along untouched through copies and rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageRef {
    /// Parse the digest reference this entry names.
    pub fn image_name(&self) -> Result<ImageName> {
        let name = ImageName::parse(&self.image)?;
        if name.digest().is_none() {
            return Err(Error::InvalidReference(format!(
                "lock entry '{}' must carry a digest",
                self.image
            )));
        }
        Ok(name)
    }
}

/// The list of images a bundle references, embedded at
/// `.imgpkg/images.yml` inside the bundle's layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesLock {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub images: Vec<ImageRef>,
}

impl ImagesLock {
    pub fn new(images: Vec<ImageRef>) -> Self {
        ImagesLock {
            api_version: LOCK_API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            images,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let lock: ImagesLock = serde_yaml::from_slice(bytes)?;
        if lock.kind != IMAGES_LOCK_KIND {
            return Err(Error::LockKindMismatch {
                expected: IMAGES_LOCK_KIND,
                found: lock.kind,
            });
        }
        for entry in &lock.images {
            entry.image_name()?;
        }
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(format!("---\n{}", serde_yaml::to_string(self)?))
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A user-supplied document naming a single bundle by digest,
/// accepted as the root of a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLock {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub bundle: BundleRef,
}

impl BundleLock {
    pub fn new(image: &ImageName, tag: Option<String>) -> Self {
        BundleLock {
            api_version: LOCK_API_VERSION.to_string(),
            kind: BUNDLE_LOCK_KIND.to_string(),
            bundle: BundleRef {
                image: image.to_string(),
                tag,
            },
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let lock: BundleLock = serde_yaml::from_slice(bytes)?;
        if lock.kind != BUNDLE_LOCK_KIND {
            return Err(Error::LockKindMismatch {
                expected: BUNDLE_LOCK_KIND,
                found: lock.kind,
            });
        }
        lock.image_name()?;
        Ok(lock)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    pub fn image_name(&self) -> Result<ImageName> {
        let name = ImageName::parse(&self.bundle.image)?;
        if name.digest().is_none() {
            return Err(Error::InvalidReference(format!(
                "bundle lock '{}' must carry a digest",
                self.bundle.image
            )));
        }
        Ok(name)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(format!("---\n{}", serde_yaml::to_string(self)?))
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

/// A lock file of either kind, dispatched on `kind`.
#[derive(Debug, Clone)]
pub enum Lock {
    Images(ImagesLock),
    Bundle(BundleLock),
}

#[derive(Deserialize)]
struct LockHeader {
    kind: String,
}

impl Lock {
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let header: LockHeader = serde_yaml::from_slice(&bytes)?;
        match header.kind.as_str() {
            IMAGES_LOCK_KIND => Ok(Lock::Images(ImagesLock::from_bytes(&bytes)?)),
            BUNDLE_LOCK_KIND => Ok(Lock::Bundle(BundleLock::from_bytes(&bytes)?)),
            other => Err(Error::LockKindMismatch {
                expected: "ImagesLock or BundleLock",
                found: other.to_string(),
            }),
        }
    }
}
