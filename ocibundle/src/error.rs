use crate::Digest;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid name for repository: {0}")]
    InvalidName(String),
    #[error("Invalid reference to image: {0}")]
    InvalidReference(String),
    #[error("Invalid tag: {0}")]
    InvalidTag(String),
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
    #[error(transparent)]
    InvalidPort(#[from] std::num::ParseIntError),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error("Expected only one of image or bundle")]
    MixedInput,
    #[error("Expected either image or bundle")]
    MissingInput,
    #[error("Expected a {expected} lock file, found kind '{found}'")]
    LockKindMismatch { expected: &'static str, found: String },
    #[error("Not a directory, or not exist: {0}")]
    NotADirectory(PathBuf),
    #[error("File already exists: {0}")]
    FileAlreadyExists(PathBuf),

    //
    // Invalid container image
    //
    #[error("Unable to pull non-images, such as image indexes. (hint: provide a specific digest to the image instead)")]
    NonImage,
    #[error("Expected bundle flag when pulling a bundle (hint: Use -b instead of -i for bundles)")]
    IsBundle,
    #[error("Expected bundle image but found plain image (hint: Did you use -i instead of -b?)")]
    NotABundle,
    #[error("Ill-formed bundle: {0}")]
    IllFormedBundle(String),
    #[error("Images cannot be pushed with '.imgpkg' directories, consider using --bundle (-b) option")]
    ImageWithBundleDir,
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("Corrupt blob: expected digest {expected}, content hashes to {actual}")]
    CorruptBlob { expected: Digest, actual: Digest },

    //
    // Error from OCI registry
    //
    #[error("Manifest or blob not found: {0}")]
    NotFound(String),
    #[error("Non-retryable error: unauthorized: {0}")]
    Unauthorized(String),
    #[error("Authentication required for {0}")]
    AuthRequired(String),
    #[error("Unsupported WWW-Authenticate header: {0}")]
    UnsupportedAuthHeader(String),
    #[error("Registry error (status {status}): {message}")]
    Registry { status: u16, message: String },
    #[error("timeout awaiting response headers: {0}")]
    NetworkTimeout(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Uploading blob {key} failed in another worker: {reason}")]
    BlobUpload { key: String, reason: String },
    #[error("Retried 5 times: {0}")]
    RetriesExhausted(#[source] Box<Error>),

    //
    // Tar archive backend
    //
    #[error("Expected to find entry '{0}' in tar archive")]
    TarEntryNotFound(String),

    //
    // System error
    //
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("OCI spec error: {0}")]
    OciSpec(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the copy retry loop may attempt the operation again.
    ///
    /// Unauthorized transport errors, missing archive entries, and
    /// client errors other than 408/429 short-circuit the loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::NetworkTimeout(_) | Error::Io(_) => true,
            Error::Registry { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

impl From<oci_spec::OciSpecError> for Error {
    fn from(e: oci_spec::OciSpecError) -> Self {
        match e {
            oci_spec::OciSpecError::SerDe(e) => Error::Json(e),
            oci_spec::OciSpecError::Io(e) => Error::Io(e),
            other => Error::OciSpec(other.to_string()),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(status, res) => {
                let url = res.get_url().to_string();
                match status {
                    401 => Error::Unauthorized(url),
                    404 => Error::NotFound(url),
                    _ => {
                        let message = res
                            .into_json::<oci_spec::distribution::ErrorResponse>()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|_| url);
                        Error::Registry { status, message }
                    }
                }
            }
            ureq::Error::Transport(t) => {
                let message = t.to_string();
                if message.contains("timed out") || message.contains("timeout") {
                    Error::NetworkTimeout(message)
                } else {
                    Error::Network(message)
                }
            }
        }
    }
}
