use crate::{
    error::{Error, Result},
    Digest,
};
use derive_more::Deref;
use regex::Regex;
use std::fmt;
use url::Url;

/// Registry used when a reference does not name one, for docker
/// compatibility.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

lazy_static::lazy_static! {
    // Both patterns are normative, from the OCI distribution spec
    // 1.1.0: repository names and tags respectively.
    static ref REPO_NAME_RE: Regex =
        Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(\/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$")
            .unwrap();
    static ref TAG_RE: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

fn validated(input: &str, re: &Regex, err: impl FnOnce(String) -> Error) -> Result<String> {
    if re.is_match(input) {
        Ok(input.to_string())
    } else {
        Err(err(input.to_string()))
    }
}

/// Repository path within a registry, e.g. `library/hello-world`.
///
/// Validated at construction so a destination computed during a copy
/// can never name a repository the distribution API would reject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

impl Name {
    pub fn new(input: &str) -> Result<Self> {
        Ok(Name(validated(input, &REPO_NAME_RE, Error::InvalidName)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-assigned tag, at most 128 characters.
///
/// Tags are mutable pointers and never participate in image
/// identity; the only tags this crate itself mints are the derived
/// locations-artifact tags, which must fit this grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref)]
pub struct TagName(String);

impl TagName {
    pub fn new(input: &str) -> Result<Self> {
        Ok(TagName(validated(input, &TAG_RE, Error::InvalidTag)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a reference points at inside its repository
///
/// A tag is a mutable, human-assigned pointer. A digest is immutable
/// and verifiable; two references are the same image iff their
/// digests are byte-equal. Tags never participate in identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Tag(TagName),
    Digest(Digest),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Tag(tag) => write!(f, ":{}", tag),
            Identifier::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}

/// Parsed registry coordinate
///
/// ```text
/// registry.example:5000/project/app@sha256:abcd...
/// ^^^^^^^^^^^^^^^^------------------------------- hostname
///                  ^^^^--------------------------- port
///                       ^^^^^^^^^^^--------------- name
///                                  ^^^^^^^^^^^^^^- identifier (tag or digest)
/// ```
///
/// If the first component is not a registry (no `.`, no `:`, not
/// `localhost`), the whole input is the repository name on the
/// default registry:
///
/// ```
/// use ocibundle::{ImageName, Identifier};
/// let name = ImageName::parse("library/hello-world:latest")?;
/// assert_eq!(name.hostname, "index.docker.io");
/// assert_eq!(name.name.as_str(), "library/hello-world");
/// # Ok::<(), ocibundle::error::Error>(())
/// ```
///
/// If the identifier is absent, `latest` is used:
///
/// ```
/// use ocibundle::{ImageName, Identifier};
/// let name = ImageName::parse("registry.example/repo")?;
/// assert!(matches!(name.identifier, Identifier::Tag(ref t) if t.as_str() == "latest"));
/// # Ok::<(), ocibundle::error::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub hostname: String,
    pub port: Option<u16>,
    pub name: Name,
    pub identifier: Identifier,
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.repository(), self.identifier)
    }
}

impl ImageName {
    pub fn parse(input: &str) -> Result<Self> {
        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::new(digest)?)),
            None => (input, None),
        };

        let (host_part, name_part) = match rest.split_once('/') {
            Some((host, name))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host, name)
            }
            _ => (DEFAULT_REGISTRY, rest),
        };

        let (hostname, port) = match host_part.split_once(':') {
            Some((hostname, port)) => (hostname, Some(str::parse(port)?)),
            None => (host_part, None),
        };

        // A tag may precede the digest (`repo:tag@sha256:...`); the
        // digest wins as the identifier.
        let (name, tag) = match name_part.rsplit_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (name_part, None),
        };

        let identifier = match digest {
            Some(digest) => Identifier::Digest(digest),
            None => Identifier::Tag(TagName::new(tag.unwrap_or("latest"))?),
        };

        Ok(ImageName {
            hostname: hostname.to_string(),
            port,
            name: Name::new(name)?,
            identifier,
        })
    }

    /// The repository this reference lives in, without the identifier.
    pub fn repository(&self) -> Repository {
        Repository {
            hostname: self.hostname.clone(),
            port: self.port,
            name: self.name.clone(),
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.identifier {
            Identifier::Digest(digest) => Some(digest),
            Identifier::Tag(_) => None,
        }
    }

    pub fn tag(&self) -> Option<&TagName> {
        match &self.identifier {
            Identifier::Tag(tag) => Some(tag),
            Identifier::Digest(_) => None,
        }
    }

    /// Same repository, digest identifier.
    pub fn with_digest(&self, digest: Digest) -> ImageName {
        self.repository().digest_image(digest)
    }

    /// `hostname[:port]` part used to key connection pools and the
    /// single-flight map.
    pub fn registry_host(&self) -> String {
        self.repository().registry_host()
    }

    /// URL for OCI distribution API endpoint
    pub fn registry_url(&self) -> Result<Url> {
        self.repository().registry_url()
    }
}

/// A repository coordinate: registry host plus name, no identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    pub hostname: String,
    pub port: Option<u16>,
    pub name: Name,
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry_host(), self.name)
    }
}

impl Repository {
    /// Parse a repository coordinate. Tags and digests are rejected;
    /// a destination repository is a place, not an image.
    pub fn parse(input: &str) -> Result<Self> {
        let last_segment = input.rsplit('/').next().unwrap_or(input);
        if input.contains('@') || last_segment.contains(':') {
            return Err(Error::InvalidReference(input.to_string()));
        }
        Ok(ImageName::parse(input)?.repository())
    }

    pub fn registry_host(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }

    /// URL for OCI distribution API endpoint
    pub fn registry_url(&self) -> Result<Url> {
        let host = self.registry_host();
        let url = if self.hostname == "localhost" || self.hostname == "127.0.0.1" {
            format!("http://{}", host)
        } else {
            format!("https://{}", host)
        };
        Ok(Url::parse(&url)?)
    }

    pub fn digest_image(&self, digest: Digest) -> ImageName {
        self.image(Identifier::Digest(digest))
    }

    pub fn tag_image(&self, tag: TagName) -> ImageName {
        self.image(Identifier::Tag(tag))
    }

    pub fn image(&self, identifier: Identifier) -> ImageName {
        ImageName {
            hostname: self.hostname.clone(),
            port: self.port,
            name: self.name.clone(),
            identifier,
        }
    }
}
