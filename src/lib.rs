pub mod core;
pub mod models;

pub use crate::core::events::{EventSink, ProvisioningEvent};
pub use crate::core::settings::{ProvisioningSettings, SettingsManager};
pub use crate::models::{
    ArtifactCatalog, ArtifactSpec, ComputeAffinity, LocalStore, ProvisionError,
    ProvisioningBundle, ProvisioningOrchestrator,
};
