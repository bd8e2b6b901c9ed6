use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::LoadError;

/// Hardware execution units a loaded model may run on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComputeAffinity {
    CpuOnly,
    CpuAndAccelerator,
    #[default]
    All,
}

impl ComputeAffinity {
    /// Execution providers in registration order; CPU is always last.
    #[must_use]
    pub fn provider_names(&self) -> &'static [&'static str] {
        match self {
            ComputeAffinity::CpuOnly => &["cpu"],
            ComputeAffinity::CpuAndAccelerator => &["cuda", "cpu"],
            ComputeAffinity::All => &["cuda", "coreml", "directml", "cpu"],
        }
    }
}

/// Opens a validated local artifact into an in-memory handle.
///
/// Loaders must not modify or delete anything at `path`.
pub trait ModelLoader: Send + Sync {
    type Handle: Send + 'static;

    fn load(&self, path: &Path, affinity: ComputeAffinity) -> Result<Self::Handle, LoadError>;
}

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::{Path, PathBuf};

    use ort::{
        execution_providers::{
            CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
            DirectMLExecutionProvider, ExecutionProviderDispatch,
        },
        session::{builder::GraphOptimizationLevel, Session},
    };
    use tracing::debug;

    use super::{ComputeAffinity, ModelLoader};
    use crate::models::error::LoadError;
    use crate::models::metadata::find_first_with_extension;

    pub struct OnnxModel {
        session: Session,
        path: PathBuf,
    }

    impl std::fmt::Debug for OnnxModel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OnnxModel").field("path", &self.path).finish()
        }
    }

    impl OnnxModel {
        pub fn session(&self) -> &Session {
            &self.session
        }

        pub fn session_mut(&mut self) -> &mut Session {
            &mut self.session
        }

        /// The `.onnx` file the session was built from.
        pub fn model_path(&self) -> &Path {
            &self.path
        }

        pub fn into_session(self) -> Session {
            self.session
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct OnnxLoader {
        intra_threads: Option<usize>,
    }

    impl OnnxLoader {
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn with_intra_threads(mut self, threads: Option<usize>) -> Self {
            self.intra_threads = threads.filter(|threads| *threads > 0);
            self
        }
    }

    fn execution_providers(affinity: ComputeAffinity) -> Vec<ExecutionProviderDispatch> {
        affinity
            .provider_names()
            .iter()
            .map(|name| match *name {
                "cuda" => CUDAExecutionProvider::default().build(),
                "coreml" => CoreMLExecutionProvider::default().build(),
                "directml" => DirectMLExecutionProvider::default().build(),
                _ => CPUExecutionProvider::default().build(),
            })
            .collect()
    }

    fn model_file(path: &Path) -> Result<PathBuf, LoadError> {
        if path.is_dir() {
            find_first_with_extension(path, ".onnx")
                .ok_or_else(|| LoadError::new(path, "bundle contains no .onnx model"))
        } else if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(LoadError::new(path, "no such file or directory"))
        }
    }

    impl ModelLoader for OnnxLoader {
        type Handle = OnnxModel;

        fn load(&self, path: &Path, affinity: ComputeAffinity) -> Result<OnnxModel, LoadError> {
            let file = model_file(path)?;
            let mut builder = Session::builder()
                .map_err(|err| LoadError::new(&file, err))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|err| LoadError::new(&file, err))?
                .with_execution_providers(execution_providers(affinity))
                .map_err(|err| LoadError::new(&file, err))?;
            if let Some(threads) = self.intra_threads {
                builder = builder
                    .with_intra_threads(threads)
                    .map_err(|err| LoadError::new(&file, err))?;
            }
            let session = builder
                .commit_from_file(&file)
                .map_err(|err| LoadError::new(&file, err))?;

            debug!(path = %file.display(), ?affinity, "onnx session ready");
            Ok(OnnxModel {
                session,
                path: file,
            })
        }
    }

}

#[cfg(feature = "onnx")]
pub use onnx::{OnnxLoader, OnnxModel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_only_never_registers_accelerators() {
        assert_eq!(ComputeAffinity::CpuOnly.provider_names(), &["cpu"]);
        for affinity in [
            ComputeAffinity::CpuOnly,
            ComputeAffinity::CpuAndAccelerator,
            ComputeAffinity::All,
        ] {
            assert_eq!(affinity.provider_names().last(), Some(&"cpu"));
        }
    }

    #[test]
    fn affinity_uses_kebab_case() {
        let parsed: ComputeAffinity = serde_json::from_str("\"cpu-and-accelerator\"").unwrap();
        assert_eq!(parsed, ComputeAffinity::CpuAndAccelerator);
        assert_eq!(ComputeAffinity::default(), ComputeAffinity::All);
    }
}
