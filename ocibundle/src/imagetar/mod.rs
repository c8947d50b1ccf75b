//! A set of images as a single seekable tar archive.
//!
//! `manifest.json` at the root enumerates the images; every manifest
//! and blob is a separate entry named by its digest
//! (`sha256-<hex>`, filesystem-safe). The archive serves as a
//! read-only registry on import.

mod read;
mod write;

pub use read::TarRegistry;
pub use write::export;

use serde::{Deserialize, Serialize};

pub const ARCHIVE_MANIFEST_FILE: &str = "manifest.json";

/// Index document stored at the archive root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub images: Vec<ArchiveImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveImage {
    /// Source reference the image was exported from.
    #[serde(rename = "ref")]
    pub source_ref: String,
    pub digest: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Root tag, re-applied on import.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "isBundle")]
    pub is_bundle: bool,
    /// Whether this image was a root of the exported copy, as
    /// opposed to an image reached through a bundle or index.
    #[serde(rename = "isRoot", default)]
    pub is_root: bool,
    pub blobs: Vec<ArchiveBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveBlob {
    pub digest: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
}
