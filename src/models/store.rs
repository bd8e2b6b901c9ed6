use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::catalog::{ArtifactLayout, ArtifactSpec};
use super::error::{StoreError, ValidationFailure};
use super::metadata::compute_sha256;

const STAGING_FILE_MARKER: &str = ".partial-";
const STAGING_DIR_MARKER: &str = ".unpack-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactState {
    Missing,
    Invalid,
    Valid,
}

/// Resolves the directory that holds every artifact.
pub trait RootResolver: Send + Sync {
    fn resolve(&self) -> Result<PathBuf, StoreError>;
}

#[derive(Debug, Clone)]
pub struct ProjectRootResolver {
    qualifier: String,
    organization: String,
    application: String,
}

impl ProjectRootResolver {
    pub fn new(
        qualifier: impl Into<String>,
        organization: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        Self {
            qualifier: qualifier.into(),
            organization: organization.into(),
            application: application.into(),
        }
    }
}

impl Default for ProjectRootResolver {
    fn default() -> Self {
        Self::new("com", "ModelProvisioning", "ModelProvisioning")
    }
}

impl RootResolver for ProjectRootResolver {
    fn resolve(&self) -> Result<PathBuf, StoreError> {
        let project_dirs = ProjectDirs::from(&self.qualifier, &self.organization, &self.application)
            .ok_or_else(|| StoreError::Root("missing project directories".into()))?;
        let dir = project_dirs.data_dir().join("models");
        create_root(dir)
    }
}

#[derive(Debug, Clone)]
pub struct FixedRoot(pub PathBuf);

impl RootResolver for FixedRoot {
    fn resolve(&self) -> Result<PathBuf, StoreError> {
        create_root(self.0.clone())
    }
}

fn create_root(dir: PathBuf) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(&dir).map_err(|source| StoreError::Inspect {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Filesystem view of the artifact directory. Nothing is cached: every call
/// re-reads the current state of the entry.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_resolver(resolver: &dyn RootResolver) -> Result<Self, StoreError> {
        Ok(Self::new(resolver.resolve()?))
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn path_for(&self, spec: &ArtifactSpec) -> PathBuf {
        spec.path(&self.root)
    }

    pub fn classify(&self, spec: &ArtifactSpec) -> ArtifactState {
        match self.validate(spec) {
            Ok(()) => ArtifactState::Valid,
            Err(_) if !self.entry_exists(spec) => ArtifactState::Missing,
            Err(failure) => {
                debug!(artifact = %spec.name, reason = %failure.reason, "artifact invalid");
                ArtifactState::Invalid
            }
        }
    }

    /// Structural check only; a passing entry may still be rejected by the loader.
    pub fn validate(&self, spec: &ArtifactSpec) -> Result<(), ValidationFailure> {
        let path = self.path_for(spec);
        let fail = |reason: String| ValidationFailure {
            path: path.clone(),
            reason,
        };

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(fail("entry is missing".into()))
            }
            Err(err) => return Err(fail(format!("stat failed: {err}"))),
        };

        match &spec.layout {
            ArtifactLayout::File => {
                if !metadata.is_file() {
                    return Err(fail("expected a regular file".into()));
                }
                let size = metadata.len();
                if size == 0 {
                    return Err(fail("file is empty".into()));
                }
                if let Some(expected) = spec.expected_size_bytes {
                    if size != expected {
                        return Err(fail(format!(
                            "size mismatch: expected {expected} bytes, found {size}"
                        )));
                    }
                }
                if let Some(expected) = &spec.checksum {
                    let actual =
                        compute_sha256(&path).map_err(|err| fail(format!("hash failed: {err}")))?;
                    if !actual.eq_ignore_ascii_case(expected) {
                        return Err(fail(format!(
                            "checksum mismatch: expected {expected}, got {actual}"
                        )));
                    }
                }
            }
            ArtifactLayout::Directory { required } => {
                if !metadata.is_dir() {
                    return Err(fail("expected a directory bundle".into()));
                }
                if let Some(absent) = required.iter().find(|entry| !path.join(entry).exists()) {
                    return Err(fail(format!("bundle is missing {absent}")));
                }
            }
        }
        Ok(())
    }

    /// Removes the entry for `spec` along with staging leftovers from
    /// interrupted fetches. Absent entries are not an error.
    pub fn purge(&self, spec: &ArtifactSpec) -> Result<(), StoreError> {
        let path = self.path_for(spec);
        remove_entry(&path)?;

        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if is_staging_for(&spec.local_file_name, name) {
                    warn!(artifact = %spec.name, staging = name, "removing stale staging entry");
                    remove_entry(&entry.path())?;
                }
            }
        }
        Ok(())
    }

    fn entry_exists(&self, spec: &ArtifactSpec) -> bool {
        fs::symlink_metadata(self.path_for(spec)).is_ok()
    }
}

fn remove_entry(path: &Path) -> Result<(), StoreError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(StoreError::Inspect {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Purge {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Staging file used while a fetch for `local_file_name` is in flight.
pub(crate) fn staging_file_name(local_file_name: &str, id: &uuid::Uuid) -> String {
    format!(".{local_file_name}{STAGING_FILE_MARKER}{}", id.simple())
}

/// Staging directory used while an archive for `local_file_name` is unpacked.
pub(crate) fn staging_dir_name(local_file_name: &str, id: &uuid::Uuid) -> String {
    format!(".{local_file_name}{STAGING_DIR_MARKER}{}", id.simple())
}

fn is_staging_for(local_file_name: &str, candidate: &str) -> bool {
    let Some(rest) = candidate
        .strip_prefix('.')
        .and_then(|rest| rest.strip_prefix(local_file_name))
    else {
        return false;
    };
    let id = rest
        .strip_prefix(STAGING_FILE_MARKER)
        .or_else(|| rest.strip_prefix(STAGING_DIR_MARKER));
    matches!(id, Some(id) if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_spec(name: &str) -> ArtifactSpec {
        ArtifactSpec::new(name, format!("repo/{name}"), "model.onnx", format!("{name}.onnx"))
    }

    fn dir_spec(name: &str) -> ArtifactSpec {
        ArtifactSpec::new(name, format!("repo/{name}"), "bundle.tar.gz", name).with_layout(
            ArtifactLayout::Directory {
                required: vec!["model.onnx".into(), "tokens.txt".into()],
            },
        )
    }

    #[test]
    fn classifies_missing_invalid_and_valid_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let spec = file_spec("seg");

        assert_eq!(store.classify(&spec), ArtifactState::Missing);

        fs::write(store.path_for(&spec), b"").unwrap();
        assert_eq!(store.classify(&spec), ArtifactState::Invalid);

        fs::write(store.path_for(&spec), b"onnx bytes").unwrap();
        assert_eq!(store.classify(&spec), ArtifactState::Valid);
    }

    #[test]
    fn checksum_and_size_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let reference = dir.path().join("reference");
        fs::write(&reference, b"good bytes").unwrap();
        let digest = compute_sha256(&reference).unwrap();

        let spec = file_spec("emb").with_checksum(digest).with_expected_size(10);
        fs::write(store.path_for(&spec), b"bad bytes!").unwrap();
        assert_eq!(store.classify(&spec), ArtifactState::Invalid);

        fs::write(store.path_for(&spec), b"good bytes").unwrap();
        assert_eq!(store.classify(&spec), ArtifactState::Valid);

        fs::write(store.path_for(&spec), b"good").unwrap();
        let failure = store.validate(&spec).unwrap_err();
        assert!(failure.reason.contains("size mismatch"));
    }

    #[test]
    fn directory_bundles_need_required_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let spec = dir_spec("seg");
        let bundle = store.path_for(&spec);

        fs::write(&bundle, b"not a directory").unwrap();
        assert_eq!(store.classify(&spec), ArtifactState::Invalid);
        fs::remove_file(&bundle).unwrap();

        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("model.onnx"), b"weights").unwrap();
        let failure = store.validate(&spec).unwrap_err();
        assert!(failure.reason.contains("tokens.txt"));

        fs::write(bundle.join("tokens.txt"), b"a 1").unwrap();
        assert_eq!(store.classify(&spec), ArtifactState::Valid);
    }

    #[test]
    fn purge_is_idempotent_and_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let seg = dir_spec("seg");
        let emb = file_spec("emb");

        fs::create_dir_all(store.path_for(&seg)).unwrap();
        fs::write(store.path_for(&seg).join("model.onnx"), b"x").unwrap();
        fs::write(store.path_for(&emb), b"y").unwrap();

        store.purge(&seg).unwrap();
        store.purge(&seg).unwrap();

        assert_eq!(store.classify(&seg), ArtifactState::Missing);
        assert_eq!(store.classify(&emb), ArtifactState::Valid);
    }

    #[test]
    fn purge_removes_only_matching_staging_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let seg = file_spec("seg");
        let id = uuid::Uuid::new_v4();

        let own_file = dir.path().join(staging_file_name(&seg.local_file_name, &id));
        let own_dir = dir.path().join(staging_dir_name(&seg.local_file_name, &id));
        let other = dir
            .path()
            .join(staging_file_name("seg.onnx.partial-x", &uuid::Uuid::new_v4()));
        fs::write(&own_file, b"partial").unwrap();
        fs::create_dir_all(&own_dir).unwrap();
        fs::write(&other, b"partial").unwrap();

        store.purge(&seg).unwrap();

        assert!(!own_file.exists());
        assert!(!own_dir.exists());
        assert!(other.exists());
    }

    #[test]
    fn fixed_root_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/models");
        let store = LocalStore::from_resolver(&FixedRoot(nested.clone())).unwrap();
        assert_eq!(store.root(), nested.as_path());
        assert!(nested.is_dir());
    }
}
