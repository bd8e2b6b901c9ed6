use std::path::Path;

use tracing::{debug, error, warn};

use super::catalog::ArtifactSpec;
use super::download::RemoteFetcher;
use super::error::{AttemptFailure, ProvisionError};
use super::loader::{ComputeAffinity, ModelLoader};
use super::store::LocalStore;
use crate::core::events::{EventSink, ProvisioningEvent};

#[derive(Debug)]
pub struct RecoveryOutcome<H> {
    pub handle: H,
    pub attempts: u32,
}

/// Bounded validate/load loop for one artifact. Every failed attempt is
/// followed by purge then re-fetch before the next attempt, so at most
/// `max_retries + 1` loads are made.
pub struct RecoveryCoordinator<'a, L: ModelLoader> {
    store: &'a LocalStore,
    fetcher: &'a dyn RemoteFetcher,
    loader: &'a L,
    events: &'a EventSink,
    max_retries: u32,
    affinity: ComputeAffinity,
}

impl<'a, L: ModelLoader> RecoveryCoordinator<'a, L> {
    pub fn new(
        store: &'a LocalStore,
        fetcher: &'a dyn RemoteFetcher,
        loader: &'a L,
        events: &'a EventSink,
        max_retries: u32,
        affinity: ComputeAffinity,
    ) -> Self {
        Self {
            store,
            fetcher,
            loader,
            events,
            max_retries,
            affinity,
        }
    }

    pub fn run(&self, spec: &ArtifactSpec) -> Result<RecoveryOutcome<L::Handle>, ProvisionError> {
        let path = self.store.path_for(spec);
        let load_path = spec.load_path(self.store.root());
        let mut retries = 0u32;
        loop {
            let attempt = retries + 1;
            self.events.emit(ProvisioningEvent::LoadAttempt {
                name: spec.name.clone(),
                attempt,
            });

            let failure = match self.attempt(spec, &load_path) {
                Ok(handle) => {
                    debug!(artifact = %spec.name, attempt, "artifact loaded");
                    self.events.emit(ProvisioningEvent::Loaded {
                        name: spec.name.clone(),
                        attempts: attempt,
                    });
                    return Ok(RecoveryOutcome {
                        handle,
                        attempts: attempt,
                    });
                }
                Err(failure) => failure,
            };

            if retries >= self.max_retries {
                error!(artifact = %spec.name, attempts = attempt, %failure, "giving up on artifact");
                return Err(ProvisionError::RetryExhausted {
                    artifact: spec.name.clone(),
                    attempts: attempt,
                    source: failure,
                });
            }
            retries += 1;

            warn!(artifact = %spec.name, attempt, %failure, "artifact unusable, purging and re-fetching");
            self.events.emit(ProvisioningEvent::Healing {
                name: spec.name.clone(),
                attempt: retries,
            });
            self.store
                .purge(spec)
                .map_err(|source| ProvisionError::Store {
                    artifact: spec.name.clone(),
                    source,
                })?;
            self.events.emit(ProvisioningEvent::Purged {
                name: spec.name.clone(),
            });

            self.events.emit(ProvisioningEvent::FetchStarted {
                name: spec.name.clone(),
            });
            let fetched = self.fetcher.fetch(spec, &path);
            self.events.emit(ProvisioningEvent::FetchFinished {
                name: spec.name.clone(),
                ok: fetched.is_ok(),
            });
            if let Err(source) = fetched {
                error!(artifact = %spec.name, attempts = attempt, %source, "re-fetch failed");
                return Err(ProvisionError::HealFailed {
                    artifact: spec.name.clone(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }

    fn attempt(&self, spec: &ArtifactSpec, load_path: &Path) -> Result<L::Handle, AttemptFailure> {
        self.store.validate(spec)?;
        Ok(self.loader.load(load_path, self.affinity)?)
    }
}
