use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Digest of contents
///
/// Digest is defined in [OCI image spec](https://github.com/opencontainers/image-spec/blob/v1.0.1/descriptor.md#digests)
/// as a string satisfies following EBNF:
///
/// ```text
/// digest                ::= algorithm ":" encoded
/// algorithm             ::= algorithm-component (algorithm-separator algorithm-component)*
/// algorithm-component   ::= [a-z0-9]+
/// algorithm-separator   ::= [+._-]
/// encoded               ::= [a-zA-Z0-9=_-]+
/// ```
///
/// SHA-256 is the canonical algorithm, but parsing accepts any
/// well-formed algorithm component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

lazy_static::lazy_static! {
    static ref ALGORITHM_RE: Regex = Regex::new(r"^[a-z0-9]+([+._-][a-z0-9]+)*$").unwrap();
    static ref ENCODED_RE: Regex = Regex::new(r"^[a-zA-Z0-9=_-]+$").unwrap();
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::new(&s).map_err(serde::de::Error::custom)
    }
}

impl From<oci_spec::image::Digest> for Digest {
    fn from(digest: oci_spec::image::Digest) -> Self {
        Digest {
            algorithm: digest.algorithm().to_string(),
            encoded: digest.digest().to_string(),
        }
    }
}

impl TryFrom<&Digest> for oci_spec::image::Digest {
    type Error = Error;
    fn try_from(digest: &Digest) -> Result<Self> {
        use std::str::FromStr;
        oci_spec::image::Digest::from_str(&digest.to_string())
            .map_err(|_| Error::InvalidDigest(digest.to_string()))
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let mut iter = input.split(':');
        match (iter.next(), iter.next(), iter.next()) {
            (Some(algorithm), Some(encoded), None)
                if ALGORITHM_RE.is_match(algorithm) && ENCODED_RE.is_match(encoded) =>
            {
                Ok(Digest {
                    algorithm: algorithm.to_string(),
                    encoded: encoded.to_string(),
                })
            }
            _ => Err(Error::InvalidDigest(input.to_string())),
        }
    }

    pub fn from_descriptor(descriptor: &oci_spec::image::Descriptor) -> Result<Self> {
        Self::new(descriptor.digest().as_ref())
    }

    /// Entry name used in tar archives, e.g. `sha256-a1b2...`
    ///
    /// The `:` separator is not filesystem-safe, so entries use `-`.
    pub fn archive_entry(&self) -> String {
        format!("{}-{}", self.algorithm, self.encoded)
    }

    /// Calc digest of a buffer using the SHA-256 algorithm
    pub fn from_buf_sha256(buf: &[u8]) -> Self {
        let hash = Sha256::digest(buf);
        let encoded = base16ct::lower::encode_string(&hash);
        Self {
            algorithm: "sha256".to_string(),
            encoded,
        }
    }

    /// Verify that `buf` hashes to this digest.
    ///
    /// Only SHA-256 digests can be verified; other algorithms pass
    /// through with a debug log.
    pub fn verify(&self, buf: &[u8]) -> Result<()> {
        if self.algorithm != "sha256" {
            log::debug!("Skipping verification of {} digest", self.algorithm);
            return Ok(());
        }
        let actual = Digest::from_buf_sha256(buf);
        if actual == *self {
            Ok(())
        } else {
            Err(Error::CorruptBlob {
                expected: self.clone(),
                actual,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let digest = Digest::new(
            "sha256:ebf526c198a14fa138634b9746c50ec38077ec9b3986227e79eb837d26f59dc6",
        )
        .unwrap();
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(
            digest.encoded,
            "ebf526c198a14fa138634b9746c50ec38077ec9b3986227e79eb837d26f59dc6"
        );

        // Algorithm is not fixed to sha256
        assert!(Digest::new("sha512:abc123").is_ok());

        assert!(Digest::new("no-colon").is_err());
        assert!(Digest::new("sha256:abc:def").is_err());
        assert!(Digest::new("SHA256:abc").is_err());
    }

    #[test]
    fn archive_entry() {
        let digest = Digest::new("sha256:abc123").unwrap();
        assert_eq!(digest.archive_entry(), "sha256-abc123");
    }

    #[test]
    fn verify() {
        let digest = Digest::from_buf_sha256(b"test string");
        assert!(digest.verify(b"test string").is_ok());
        assert!(matches!(
            digest.verify(b"other"),
            Err(Error::CorruptBlob { .. })
        ));
    }
}
