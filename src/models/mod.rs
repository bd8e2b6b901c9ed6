mod catalog;
mod download;
mod error;
mod loader;
mod metadata;
mod orchestrator;
mod recovery;
mod store;

#[cfg(test)]
mod testing;

pub use catalog::{
    default_catalog, ArchiveFormat, ArtifactCatalog, ArtifactLayout, ArtifactSpec,
    DEFAULT_REMOTE_BASE,
};
pub use download::{install, DownloadPlan, HttpFetcher, RemoteFetcher};
pub use error::{
    AttemptFailure, CatalogError, DownloadError, LoadError, ProvisionError, StoreError,
    ValidationFailure,
};
pub use loader::{ComputeAffinity, ModelLoader};
#[cfg(feature = "onnx")]
pub use loader::{OnnxLoader, OnnxModel};
pub use metadata::{compute_sha256, find_first_with_extension, total_size};
pub use orchestrator::{
    LoadedModel, ProvisioningBundle, ProvisioningOrchestrator, DEFAULT_MAX_RETRIES,
};
pub use recovery::{RecoveryCoordinator, RecoveryOutcome};
pub use store::{ArtifactState, FixedRoot, LocalStore, ProjectRootResolver, RootResolver};
