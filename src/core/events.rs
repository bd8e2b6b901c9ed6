use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

use crate::models::ArtifactState;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProvisioningEvent {
    Scanned { name: String, state: ArtifactState },
    Purged { name: String },
    FetchStarted { name: String },
    FetchFinished { name: String, ok: bool },
    LoadAttempt { name: String, attempt: u32 },
    Healing { name: String, attempt: u32 },
    Loaded { name: String, attempts: u32 },
}

impl ProvisioningEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Scanned { name, .. }
            | Self::Purged { name }
            | Self::FetchStarted { name }
            | Self::FetchFinished { name, .. }
            | Self::LoadAttempt { name, .. }
            | Self::Healing { name, .. }
            | Self::Loaded { name, .. } => name,
        }
    }
}

/// Optional listener for provisioning progress. Emitting never blocks and a
/// dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<Sender<ProvisioningEvent>>,
}

impl EventSink {
    pub fn new(sender: Sender<ProvisioningEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProvisioningEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

pub fn channel() -> (EventSink, Receiver<ProvisioningEvent>) {
    let (sender, receiver) = unbounded();
    (EventSink::new(sender), receiver)
}
