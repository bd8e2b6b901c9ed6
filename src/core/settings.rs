use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{ComputeAffinity, DEFAULT_MAX_RETRIES, DEFAULT_REMOTE_BASE};

const CONFIG_FILE: &str = "config.json";
pub const MODELS_DIR_ENV: &str = "PROVISION_MODELS_DIR";
pub const MAX_RETRIES_ENV: &str = "PROVISION_MAX_RETRIES";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisioningSettings {
    pub max_retries: u32,
    pub compute_affinity: ComputeAffinity,
    pub models_dir: Option<PathBuf>,
    pub remote_base_url: String,
    pub auth_token: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub intra_threads: Option<usize>,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            compute_affinity: ComputeAffinity::default(),
            models_dir: None,
            remote_base_url: DEFAULT_REMOTE_BASE.into(),
            auth_token: None,
            catalog_path: None,
            intra_threads: None,
        }
    }
}

pub struct SettingsManager {
    path: PathBuf,
    inner: RwLock<ProvisioningSettings>,
}

impl SettingsManager {
    pub fn new() -> Result<Self> {
        Self::with_path(resolve_config_path()?)
    }

    /// Reads settings from `path`; a missing file yields defaults.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let persisted = load_settings(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(persisted),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted settings with environment overrides applied.
    pub fn read(&self) -> ProvisioningSettings {
        let mut settings = self.inner.read().clone();
        apply_env_overrides(&mut settings, |key| env::var(key).ok());
        settings
    }

    pub fn write(&self, settings: ProvisioningSettings) -> Result<()> {
        let mut guard = self.inner.write();
        *guard = settings;
        persist_settings(self.path.as_path(), &guard)
    }

    pub fn set_compute_affinity(&self, affinity: ComputeAffinity) -> Result<()> {
        let mut guard = self.inner.write();
        if guard.compute_affinity == affinity {
            return Ok(());
        }
        guard.compute_affinity = affinity;
        persist_settings(self.path.as_path(), &guard)
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("com", "ModelProvisioning", "ModelProvisioning")
        .context("missing project directories")?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<ProvisioningSettings> {
    if !path.exists() {
        return Ok(ProvisioningSettings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("config json could not be parsed")
}

fn persist_settings(path: &Path, settings: &ProvisioningSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
    Ok(())
}

fn apply_env_overrides(settings: &mut ProvisioningSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = lookup(MODELS_DIR_ENV).filter(|value| !value.trim().is_empty()) {
        settings.models_dir = Some(PathBuf::from(dir));
    }
    if let Some(raw) = lookup(MAX_RETRIES_ENV) {
        match raw.trim().parse() {
            Ok(retries) => settings.max_retries = retries,
            Err(err) => warn!(value = %raw, %err, "ignoring invalid {MAX_RETRIES_ENV}"),
        }
    }
}
