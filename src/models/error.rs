use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single remote fetch.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("remote asset {asset} not found in {source_id}")]
    NotFound { source_id: String, asset: String },

    #[error("transport failure fetching {asset}: {reason}")]
    Transport { asset: String, reason: String },

    #[error("incomplete write for {asset}: expected {expected} bytes, wrote {written}")]
    IncompleteWrite {
        asset: String,
        expected: u64,
        written: u64,
    },
}

impl DownloadError {
    pub fn transport(asset: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            asset: asset.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to load {}: {reason}", .path.display())]
pub struct LoadError {
    pub path: PathBuf,
    pub reason: String,
}

impl LoadError {
    pub fn new(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Local entry exists but does not look like a loadable bundle.
#[derive(Debug, Error)]
#[error("{} failed validation: {reason}", .path.display())]
pub struct ValidationFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Why a single load attempt failed. Both kinds go through the same heal loop.
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error(transparent)]
    Load(#[from] LoadError),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate artifact name {0}")]
    DuplicateName(String),
    #[error("duplicate local file name {0}")]
    DuplicateFileName(String),
    #[error("local file name {0:?} must be a single relative path component without a leading dot")]
    InvalidFileName(String),
    #[error("artifact {name}: {reason}")]
    LayoutMismatch { name: String, reason: &'static str },
    #[error("read catalog {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse catalog {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remove {}: {source}", .path.display())]
    Purge {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("inspect {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("resolve model root: {0}")]
    Root(String),
}

/// Terminal failure of `acquire` or `load_local`. No partial bundle exists when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("fetch of {artifact} failed ({failed} of {} fetches failed, participants: {}): {source}", .participants.len(), .participants.join(", "))]
    Download {
        artifact: String,
        participants: Vec<String>,
        failed: usize,
        #[source]
        source: DownloadError,
    },

    #[error("re-fetch of {artifact} failed after {attempts} load attempt(s): {source}")]
    HealFailed {
        artifact: String,
        attempts: u32,
        #[source]
        source: DownloadError,
    },

    #[error("{artifact} still unusable after {attempts} load attempt(s): {source}")]
    RetryExhausted {
        artifact: String,
        attempts: u32,
        #[source]
        source: AttemptFailure,
    },

    #[error("{artifact} failed to load from caller-supplied path: {source}")]
    Load {
        artifact: String,
        #[source]
        source: LoadError,
    },

    #[error("invalid usage for {artifact}: {reason}")]
    Usage { artifact: String, reason: String },

    #[error("local store error for {artifact}: {source}")]
    Store {
        artifact: String,
        #[source]
        source: StoreError,
    },

    #[error("provisioning task for {artifact} did not complete: {reason}")]
    Task { artifact: String, reason: String },
}

impl ProvisionError {
    /// Artifacts implicated by this failure.
    pub fn artifacts(&self) -> Vec<&str> {
        match self {
            Self::Download { participants, .. } => {
                participants.iter().map(String::as_str).collect()
            }
            Self::HealFailed { artifact, .. }
            | Self::RetryExhausted { artifact, .. }
            | Self::Load { artifact, .. }
            | Self::Usage { artifact, .. }
            | Self::Store { artifact, .. }
            | Self::Task { artifact, .. } => vec![artifact.as_str()],
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::HealFailed { attempts, .. } | Self::RetryExhausted { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}
