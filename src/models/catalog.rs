use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::CatalogError;

pub const DEFAULT_REMOTE_BASE: &str = "https://huggingface.co";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactLayout {
    #[default]
    File,
    Directory {
        #[serde(default)]
        required: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    #[default]
    File,
    Zip,
    TarGz,
    TarBz2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    pub name: String,
    pub remote_source_id: String,
    pub remote_asset_name: String,
    pub local_file_name: String,
    #[serde(default)]
    pub layout: ArtifactLayout,
    #[serde(default)]
    pub archive: ArchiveFormat,
    #[serde(default)]
    pub strip_prefix_components: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ArtifactSpec {
    pub fn new(
        name: impl Into<String>,
        remote_source_id: impl Into<String>,
        remote_asset_name: impl Into<String>,
        local_file_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            remote_source_id: remote_source_id.into(),
            remote_asset_name: remote_asset_name.into(),
            local_file_name: local_file_name.into(),
            layout: ArtifactLayout::File,
            archive: ArchiveFormat::File,
            strip_prefix_components: 0,
            expected_size_bytes: None,
            checksum: None,
        }
    }

    #[must_use]
    pub fn with_layout(mut self, layout: ArtifactLayout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn with_archive(mut self, archive: ArchiveFormat, strip_prefix_components: u8) -> Self {
        self.archive = archive;
        self.strip_prefix_components = strip_prefix_components;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn with_expected_size(mut self, size_bytes: u64) -> Self {
        self.expected_size_bytes = Some(size_bytes);
        self
    }

    #[must_use]
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.local_file_name)
    }

    /// File handed to the loader. For directory bundles this is the first
    /// `required` entry, so bundles shipping several models load the declared one.
    #[must_use]
    pub fn load_path(&self, root: &Path) -> PathBuf {
        let path = self.path(root);
        match &self.layout {
            ArtifactLayout::Directory { required } => match required.first() {
                Some(entry) => path.join(entry),
                None => path,
            },
            ArtifactLayout::File => path,
        }
    }

    /// Absolute source ids are used as-is; anything else is treated as a
    /// repository under `base`.
    #[must_use]
    pub fn remote_uri(&self, base: &str) -> String {
        let asset = self.remote_asset_name.trim_start_matches('/');
        let source = self.remote_source_id.trim_end_matches('/');
        if source.starts_with("http://") || source.starts_with("https://") {
            format!("{source}/{asset}")
        } else {
            format!(
                "{}/{}/resolve/main/{}",
                base.trim_end_matches('/'),
                source.trim_start_matches('/'),
                asset
            )
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ArtifactCatalog {
    specs: Vec<ArtifactSpec>,
}

impl ArtifactCatalog {
    pub fn new(specs: Vec<ArtifactSpec>) -> Result<Self, CatalogError> {
        let mut names = HashSet::new();
        let mut files = HashSet::new();
        for spec in &specs {
            if !is_single_component(&spec.local_file_name) {
                return Err(CatalogError::InvalidFileName(spec.local_file_name.clone()));
            }
            if let Some(reason) = layout_mismatch(spec) {
                return Err(CatalogError::LayoutMismatch {
                    name: spec.name.clone(),
                    reason,
                });
            }
            if !names.insert(spec.name.as_str()) {
                return Err(CatalogError::DuplicateName(spec.name.clone()));
            }
            if !files.insert(spec.local_file_name.as_str()) {
                return Err(CatalogError::DuplicateFileName(spec.local_file_name.clone()));
            }
        }
        Ok(Self { specs })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let bytes = fs::read(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let specs: Vec<ArtifactSpec> =
            serde_json::from_slice(&bytes).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(specs)
    }

    pub fn specs(&self) -> &[ArtifactSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ArtifactSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|spec| spec.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Archives unpack into directories; plain downloads stay single files.
fn layout_mismatch(spec: &ArtifactSpec) -> Option<&'static str> {
    match (&spec.layout, spec.archive) {
        (ArtifactLayout::File, ArchiveFormat::File) => None,
        (ArtifactLayout::Directory { .. }, ArchiveFormat::File) => {
            Some("directory layout requires an archive format")
        }
        (ArtifactLayout::File, _) => Some("archives unpack to a directory layout"),
        (ArtifactLayout::Directory { .. }, _) => None,
    }
}

/// Leading dots are reserved for staging entries.
fn is_single_component(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Speaker segmentation and embedding models used by the diarization pipeline.
pub fn default_catalog() -> ArtifactCatalog {
    let specs = vec![
        ArtifactSpec::new(
            "segmentation",
            "https://github.com/k2-fsa/sherpa-onnx/releases/download/speaker-segmentation-models",
            "sherpa-onnx-pyannote-segmentation-3-0.tar.bz2",
            "pyannote-segmentation-3-0",
        )
        .with_layout(ArtifactLayout::Directory {
            required: vec!["model.onnx".into()],
        })
        .with_archive(ArchiveFormat::TarBz2, 1),
        ArtifactSpec::new(
            "embedding",
            "https://github.com/k2-fsa/sherpa-onnx/releases/download/speaker-recongition-models",
            "wespeaker_en_voxceleb_resnet34.onnx",
            "wespeaker-en-voxceleb-resnet34.onnx",
        ),
    ];
    ArtifactCatalog { specs }
}
