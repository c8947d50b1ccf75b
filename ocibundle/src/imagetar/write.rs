use crate::{
    error::{Error, Result},
    imageset::{ImageSet, NodeKind, ResolvedNode},
    imagetar::{ArchiveBlob, ArchiveImage, ArchiveManifest, ARCHIVE_MANIFEST_FILE},
    registry::ImagesReader,
    util::retry,
    Digest,
};
use chrono::Utc;
use std::{collections::HashSet, fs, path::Path};

/// Export a resolved image set into a tar archive at `path`.
///
/// The archive index comes first, then every manifest and blob as an
/// entry named by digest. Blobs shared between images are stored
/// once.
pub fn export(set: &ImageSet, src: &dyn ImagesReader, path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::FileAlreadyExists(path.to_path_buf()));
    }
    let f = fs::File::create(path)?;
    let mut builder = tar::Builder::new(f);

    // Fetch manifests up front so the index can be the first entry.
    let mut nodes: Vec<&ResolvedNode> = set.nodes.values().collect();
    nodes.sort_by(|a, b| a.digest.cmp(&b.digest));
    let mut manifests = Vec::with_capacity(nodes.len());
    let mut images = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let raw = retry(|| src.get_manifest(&node.image))?;
        let blobs = blob_descriptors(&raw)?;
        images.push(ArchiveImage {
            source_ref: node.image.to_string(),
            digest: node.digest.to_string(),
            media_type: raw.media_type().to_string(),
            tag: node.tag.as_ref().map(|tag| tag.to_string()),
            is_bundle: matches!(node.kind, NodeKind::Bundle { .. }),
            is_root: set.roots.contains(&node.digest),
            blobs,
        });
        manifests.push(raw);
    }

    let index = serde_json::to_vec_pretty(&ArchiveManifest { images })?;
    append_entry(&mut builder, ARCHIVE_MANIFEST_FILE, &index)?;

    let mut written: HashSet<Digest> = HashSet::new();
    for (node, raw) in nodes.iter().zip(&manifests) {
        if written.insert(node.digest.clone()) {
            append_entry(&mut builder, &node.digest.archive_entry(), raw.bytes())?;
        }
        if !raw.is_image_manifest() {
            continue;
        }
        let manifest = raw.as_image_manifest()?;
        let mut blob_digests = vec![Digest::from_descriptor(manifest.config())?];
        for layer in manifest.layers() {
            blob_digests.push(Digest::from_descriptor(layer)?);
        }
        for digest in blob_digests {
            if !written.insert(digest.clone()) {
                continue;
            }
            let data = retry(|| src.get_blob(&node.image, &digest))?;
            append_entry(&mut builder, &digest.archive_entry(), &data)?;
        }
    }

    builder.finish()?;
    Ok(())
}

fn blob_descriptors(raw: &crate::registry::RawManifest) -> Result<Vec<ArchiveBlob>> {
    if !raw.is_image_manifest() {
        return Ok(Vec::new());
    }
    let manifest = raw.as_image_manifest()?;
    let mut blobs = vec![ArchiveBlob {
        digest: manifest.config().digest().to_string(),
        media_type: manifest.config().media_type().to_string(),
        size: manifest.config().size(),
    }];
    for layer in manifest.layers() {
        blobs.push(ArchiveBlob {
            digest: layer.digest().to_string(),
            media_type: layer.media_type().to_string(),
            size: layer.size(),
        });
    }
    Ok(blobs)
}

fn append_entry(
    builder: &mut tar::Builder<fs::File>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp() as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
