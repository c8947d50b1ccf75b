use crate::{
    config::RegistryOpts,
    distribution::Keychain,
    error::{Error, Result},
    Digest, Identifier, ImageName, Name,
};
use oci_spec::distribution::TagList;
use std::{io::Read, sync::Mutex};
use url::Url;

/// Media types accepted when pulling manifests, OCI and docker v2s2.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

const DEFAULT_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// A client for the `/v2/<name>/` API endpoint of one repository
///
/// Manifests are handled as raw bytes plus a media type; the bytes
/// put on the wire are exactly the bytes handed in, never a
/// re-serialization, so digests survive the trip.
pub struct Client {
    agent: ureq::Agent,
    /// URL to registry server
    url: Url,
    /// Name of repository
    name: Name,
    /// Credentials gathered from docker/podman config and environment
    keychain: Keychain,
    /// Cached `Authorization` header value
    token: Mutex<Option<String>>,
}

impl Client {
    pub fn new(url: Url, name: Name, opts: &RegistryOpts) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_read(opts.response_header_timeout)
            .build();
        Ok(Client {
            agent,
            url,
            name,
            keychain: Keychain::load(),
            token: Mutex::new(None),
        })
    }

    pub fn from_image_name(image: &ImageName, opts: &RegistryOpts) -> Result<Self> {
        Self::new(image.registry_url()?, image.name.clone(), opts)
    }

    pub fn add_basic_auth(&mut self, host: &str, username: &str, password: &str) {
        self.keychain.insert(host, username, password);
    }

    fn call(&self, req: ureq::Request) -> Result<ureq::Response> {
        self.call_impl(req, None)
    }

    fn call_with_body(&self, req: ureq::Request, body: &[u8]) -> Result<ureq::Response> {
        self.call_impl(req, Some(body))
    }

    /// Perform a request, solving the registry's auth challenge once
    /// and caching the resulting `Authorization` header.
    fn call_impl(&self, req: ureq::Request, body: Option<&[u8]>) -> Result<ureq::Response> {
        let send = |req: ureq::Request| match body {
            Some(bytes) => req.send_bytes(bytes),
            None => req.call(),
        };

        let cached = self.token.lock().unwrap().clone();
        let first = match &cached {
            Some(token) => req.clone().set("Authorization", token),
            None => req.clone(),
        };
        match send(first) {
            Ok(res) => Ok(res),
            Err(ureq::Error::Status(401, res)) => {
                let url = res.get_url().to_string();
                let header = res
                    .header("www-authenticate")
                    .map(str::to_string)
                    .ok_or(Error::Unauthorized(url))?;
                let token = self.keychain.solve(&header, &self.url, &self.name)?;
                *self.token.lock().unwrap() = Some(token.clone());
                send(req.set("Authorization", &token)).map_err(Error::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, url: &Url) -> ureq::Request {
        log::debug!("GET {}", url);
        self.agent.get(url.as_str())
    }

    fn head(&self, url: &Url) -> ureq::Request {
        log::debug!("HEAD {}", url);
        self.agent.head(url.as_str())
    }

    fn put(&self, url: &Url) -> ureq::Request {
        log::debug!("PUT {}", url);
        self.agent.put(url.as_str())
    }

    fn post(&self, url: &Url) -> ureq::Request {
        log::debug!("POST {}", url);
        self.agent.post(url.as_str())
    }

    fn manifest_url(&self, identifier: &Identifier) -> Result<Url> {
        let identifier = match identifier {
            Identifier::Tag(tag) => tag.to_string(),
            Identifier::Digest(digest) => digest.to_string(),
        };
        Ok(self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, identifier))?)
    }

    fn blob_url(&self, digest: &Digest) -> Result<Url> {
        Ok(self
            .url
            .join(&format!("/v2/{}/blobs/{}", self.name, digest))?)
    }

    /// Get tags of `<name>` repository.
    ///
    /// ```text
    /// GET /v2/<name>/tags/list
    /// ```
    pub fn get_tags(&self) -> Result<Vec<String>> {
        let url = self.url.join(&format!("/v2/{}/tags/list", self.name))?;
        let res = self.call(self.get(&url))?;
        let tag_list: TagList = res.into_json()?;
        Ok(tag_list.tags().to_vec())
    }

    /// Get a manifest as the exact bytes stored in the registry.
    ///
    /// ```text
    /// GET /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Returns the bytes and the `Content-Type` the registry reported.
    /// When fetched by digest, the content is verified against it.
    pub fn get_manifest(&self, identifier: &Identifier) -> Result<(Vec<u8>, String)> {
        let url = self.manifest_url(identifier)?;
        let res = self.call(self.get(&url).set("Accept", MANIFEST_ACCEPT))?;
        let media_type = res
            .header("Content-Type")
            .unwrap_or(DEFAULT_MANIFEST_MEDIA_TYPE)
            .to_string();
        let mut bytes = Vec::new();
        res.into_reader().read_to_end(&mut bytes)?;
        if let Identifier::Digest(digest) = identifier {
            digest.verify(&bytes)?;
        }
        Ok((bytes, media_type))
    }

    /// Resolve a reference to its manifest digest without pulling it.
    ///
    /// ```text
    /// HEAD /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Returns `None` when the registry has no such manifest.
    pub fn head_manifest(&self, identifier: &Identifier) -> Result<Option<Digest>> {
        let url = self.manifest_url(identifier)?;
        match self.call(self.head(&url).set("Accept", MANIFEST_ACCEPT)) {
            Ok(res) => match res.header("Docker-Content-Digest") {
                Some(digest) => Ok(Some(Digest::new(digest)?)),
                None => match identifier {
                    // The URL named the digest and the registry said 200
                    Identifier::Digest(digest) => Ok(Some(digest.clone())),
                    Identifier::Tag(_) => {
                        let (bytes, _) = self.get_manifest(identifier)?;
                        Ok(Some(Digest::from_buf_sha256(&bytes)))
                    }
                },
            },
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Push a manifest, bytes untouched.
    ///
    /// ```text
    /// PUT /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Must happen after every blob the manifest names is present.
    pub fn put_manifest(
        &self,
        identifier: &Identifier,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<()> {
        let url = self.manifest_url(identifier)?;
        self.call_with_body(self.put(&url).set("Content-Type", media_type), bytes)?;
        Ok(())
    }

    /// Get blob for given digest, verifying its content hash.
    ///
    /// ```text
    /// GET /v2/<name>/blobs/<digest>
    /// ```
    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let url = self.blob_url(digest)?;
        let res = self.call(self.get(&url))?;
        let mut bytes = Vec::new();
        res.into_reader().read_to_end(&mut bytes)?;
        digest.verify(&bytes)?;
        Ok(bytes)
    }

    /// Whether the repository already stores a blob.
    ///
    /// ```text
    /// HEAD /v2/<name>/blobs/<digest>
    /// ```
    pub fn head_blob(&self, digest: &Digest) -> Result<bool> {
        let url = self.blob_url(digest)?;
        match self.call(self.head(&url)) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Push a blob under a known digest.
    ///
    /// ```text
    /// POST /v2/<name>/blobs/uploads/
    /// PUT  <location>?digest=<digest>
    /// ```
    pub fn put_blob(&self, digest: &Digest, blob: &[u8]) -> Result<()> {
        let url = self.url.join(&format!("/v2/{}/blobs/uploads/", self.name))?;
        let res = self.call(self.post(&url))?;
        let location = self.location_url(&res)?;

        self.call_with_body(
            self.put(&location)
                .query("digest", &digest.to_string())
                .set("Content-Length", &blob.len().to_string())
                .set("Content-Type", "application/octet-stream"),
            blob,
        )?;
        Ok(())
    }

    /// Try a cross-repo mount of a blob that already lives in
    /// `from` on the same registry.
    ///
    /// ```text
    /// POST /v2/<name>/blobs/uploads/?mount=<digest>&from=<repository>
    /// ```
    ///
    /// Returns false if the registry answered with an upload session
    /// instead of a mount; the caller then streams the bytes.
    pub fn mount_blob(&self, digest: &Digest, from: &Name) -> Result<bool> {
        let url = self.url.join(&format!("/v2/{}/blobs/uploads/", self.name))?;
        let res = self.call(
            self.post(&url)
                .query("mount", &digest.to_string())
                .query("from", from.as_str()),
        )?;
        Ok(res.status() == 201)
    }

    fn location_url(&self, res: &ureq::Response) -> Result<Url> {
        let location = res.header("Location").ok_or_else(|| {
            Error::Network("registry response lacks a Location header".to_string())
        })?;
        Ok(Url::parse(location).or_else(|_| self.url.join(location))?)
    }
}
