//! Walk the graph of bundles and images reachable from a set of
//! roots, deduplicating by digest.
//!
//! Edges follow immutable digests, so the graph is acyclic by
//! construction and a plain seen-set suffices. Distinct digests
//! resolve in parallel; the claim on a digest doubles as a
//! single-flight guard against duplicate manifest fetches.

use super::{ImageSet, NodeKind, ResolvedNode, UnprocessedImageRef};
use crate::{
    bundle,
    error::{Error, Result},
    registry::ImagesReader,
    util::retry,
    Digest, ImageName, TagName,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Condvar, Mutex},
    thread,
};

struct Work {
    image: ImageName,
    tag: Option<TagName>,
    referrer: Option<Digest>,
    annotations: Option<BTreeMap<String, String>>,
    root_index: Option<usize>,
}

struct State {
    queue: VecDeque<Work>,
    in_flight: usize,
    stop: bool,
}

struct Shared<'a> {
    reader: &'a dyn ImagesReader,
    state: Mutex<State>,
    work_available: Condvar,
    claimed: Mutex<HashSet<Digest>>,
    nodes: Mutex<HashMap<Digest, ResolvedNode>>,
    /// Annotation edges landing on already-claimed nodes, merged at
    /// the end.
    edges: Mutex<Vec<(Digest, String, BTreeMap<String, String>)>>,
    roots: Mutex<Vec<(usize, Digest)>>,
    error: Mutex<Option<Error>>,
}

fn referrer_key(referrer: &Option<Digest>) -> String {
    referrer
        .as_ref()
        .map(|digest| digest.to_string())
        .unwrap_or_default()
}

/// Resolve the transitive image set of `roots` with a bounded worker
/// pool. Any fetch failure, and any ill-formed embedded lock, fails
/// the whole resolution.
pub fn resolve(
    reader: &dyn ImagesReader,
    roots: Vec<UnprocessedImageRef>,
    workers: usize,
) -> Result<ImageSet> {
    let queue = roots
        .into_iter()
        .enumerate()
        .map(|(index, root)| Work {
            image: root.image,
            tag: root.tag,
            referrer: None,
            annotations: root.annotations,
            root_index: Some(index),
        })
        .collect();

    let shared = Shared {
        reader,
        state: Mutex::new(State {
            queue,
            in_flight: 0,
            stop: false,
        }),
        work_available: Condvar::new(),
        claimed: Mutex::new(HashSet::new()),
        nodes: Mutex::new(HashMap::new()),
        edges: Mutex::new(Vec::new()),
        roots: Mutex::new(Vec::new()),
        error: Mutex::new(None),
    };

    thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| worker(&shared));
        }
    });

    if let Some(err) = shared.error.into_inner().unwrap() {
        return Err(err);
    }

    let mut nodes = shared.nodes.into_inner().unwrap();
    for (digest, referrer, annotations) in shared.edges.into_inner().unwrap() {
        if let Some(node) = nodes.get_mut(&digest) {
            node.annotations.insert(referrer, annotations);
        }
    }

    let mut root_digests = shared.roots.into_inner().unwrap();
    root_digests.sort_by_key(|(index, _)| *index);
    let mut seen = HashSet::new();
    let roots = root_digests
        .into_iter()
        .map(|(_, digest)| digest)
        .filter(|digest| seen.insert(digest.clone()))
        .collect();

    Ok(ImageSet { nodes, roots })
}

fn worker(shared: &Shared) {
    loop {
        let work = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.stop {
                    return;
                }
                if let Some(work) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break work;
                }
                if state.in_flight == 0 {
                    shared.work_available.notify_all();
                    return;
                }
                state = shared.work_available.wait(state).unwrap();
            }
        };

        let outcome = process(shared, work);

        let mut state = shared.state.lock().unwrap();
        state.in_flight -= 1;
        match outcome {
            Ok(children) => state.queue.extend(children),
            Err(err) => {
                state.stop = true;
                let mut error = shared.error.lock().unwrap();
                if error.is_none() {
                    *error = Some(err);
                }
            }
        }
        shared.work_available.notify_all();
    }
}

fn process(shared: &Shared, work: Work) -> Result<Vec<Work>> {
    // Claim digest-identified work before fetching; a lost claim
    // means another worker owns the node.
    if let Some(digest) = work.image.digest().cloned() {
        if !shared.claimed.lock().unwrap().insert(digest.clone()) {
            record_duplicate(shared, &work, digest);
            return Ok(Vec::new());
        }
    }

    let raw = retry(|| shared.reader.get_manifest(&work.image))?;
    let digest = raw.digest().clone();

    if work.image.digest().is_none()
        && !shared.claimed.lock().unwrap().insert(digest.clone())
    {
        record_duplicate(shared, &work, digest);
        return Ok(Vec::new());
    }

    let pinned = work.image.with_digest(digest.clone());
    let (kind, children) = if raw.is_index() {
        let index = raw.as_image_index()?;
        let child_digests: Vec<Digest> = index
            .manifests()
            .iter()
            .map(Digest::from_descriptor)
            .collect::<Result<_>>()?;
        let children = child_digests
            .iter()
            .map(|child| Work {
                image: pinned.with_digest(child.clone()),
                tag: None,
                referrer: Some(digest.clone()),
                annotations: None,
                root_index: None,
            })
            .collect();
        (
            NodeKind::Index {
                children: child_digests,
            },
            children,
        )
    } else if raw.is_image_manifest() {
        let manifest = raw.as_image_manifest()?;
        if bundle::is_bundle(shared.reader, &pinned, &manifest)? {
            let files = bundle::read_images_lock(shared.reader, &pinned, &manifest)?;
            let children = files
                .images_lock
                .images
                .iter()
                .map(|entry| {
                    Ok(Work {
                        image: entry.image_name()?,
                        tag: None,
                        referrer: Some(digest.clone()),
                        annotations: entry.annotations.clone(),
                        root_index: None,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            (
                NodeKind::Bundle {
                    images_lock: files.images_lock,
                },
                children,
            )
        } else {
            (NodeKind::Image, Vec::new())
        }
    } else {
        return Err(Error::UnsupportedMediaType(raw.media_type().to_string()));
    };

    let mut annotations = BTreeMap::new();
    if let Some(entry_annotations) = work.annotations {
        annotations.insert(referrer_key(&work.referrer), entry_annotations);
    }
    shared.nodes.lock().unwrap().insert(
        digest.clone(),
        ResolvedNode {
            image: pinned,
            digest: digest.clone(),
            kind,
            tag: work.tag,
            annotations,
        },
    );
    if let Some(index) = work.root_index {
        shared.roots.lock().unwrap().push((index, digest));
    }
    Ok(children)
}

fn record_duplicate(shared: &Shared, work: &Work, digest: Digest) {
    if let Some(annotations) = &work.annotations {
        shared.edges.lock().unwrap().push((
            digest.clone(),
            referrer_key(&work.referrer),
            annotations.clone(),
        ));
    }
    if let Some(index) = work.root_index {
        shared.roots.lock().unwrap().push((index, digest));
    }
}
