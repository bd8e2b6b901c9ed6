use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::catalog::{ArtifactCatalog, ArtifactSpec};
use super::download::RemoteFetcher;
use super::error::{DownloadError, ProvisionError};
use super::loader::{ComputeAffinity, ModelLoader};
use super::recovery::RecoveryCoordinator;
use super::store::{ArtifactState, LocalStore};
use crate::core::events::{EventSink, ProvisioningEvent};

pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug)]
pub struct LoadedModel<H> {
    pub name: String,
    pub path: PathBuf,
    pub handle: H,
    /// Load attempts made, starting at 1.
    pub attempts: u32,
}

/// Every artifact of the catalog, loaded. Models are kept in catalog order.
#[derive(Debug)]
pub struct ProvisioningBundle<H> {
    models: Vec<LoadedModel<H>>,
    fetched: Vec<String>,
    download_duration: Duration,
    load_duration: Duration,
}

impl<H> ProvisioningBundle<H> {
    pub fn get(&self, name: &str) -> Option<&LoadedModel<H>> {
        self.models.iter().find(|model| model.name == name)
    }

    pub fn models(&self) -> &[LoadedModel<H>] {
        &self.models
    }

    pub fn paths(&self) -> Vec<(&str, &Path)> {
        self.models
            .iter()
            .map(|model| (model.name.as_str(), model.path.as_path()))
            .collect()
    }

    /// Wall-clock span of the fetch phase; zero when nothing was fetched.
    pub fn download_duration(&self) -> Duration {
        self.download_duration
    }

    pub fn load_duration(&self) -> Duration {
        self.load_duration
    }

    /// Artifacts fetched during the fetch phase. Re-fetches made while healing
    /// are not listed.
    pub fn fetched(&self) -> &[String] {
        &self.fetched
    }

    pub fn into_models(self) -> Vec<LoadedModel<H>> {
        self.models
    }
}

type UnitResult<T> = (String, Result<T, JoinError>);

pub struct ProvisioningOrchestrator<L: ModelLoader> {
    catalog: Arc<ArtifactCatalog>,
    store: Arc<LocalStore>,
    fetcher: Arc<dyn RemoteFetcher>,
    loader: Arc<L>,
    max_retries: u32,
    affinity: ComputeAffinity,
    events: EventSink,
}

impl<L> ProvisioningOrchestrator<L>
where
    L: ModelLoader + 'static,
{
    pub fn new(
        catalog: ArtifactCatalog,
        store: LocalStore,
        fetcher: Arc<dyn RemoteFetcher>,
        loader: Arc<L>,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            store: Arc::new(store),
            fetcher,
            loader,
            max_retries: DEFAULT_MAX_RETRIES,
            affinity: ComputeAffinity::default(),
            events: EventSink::disabled(),
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_affinity(mut self, affinity: ComputeAffinity) -> Self {
        self.affinity = affinity;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Makes every catalog artifact present, valid and loaded.
    ///
    /// All fetches settle before any load starts. Either every artifact is
    /// returned loaded or the call fails as a whole.
    pub async fn acquire(&self) -> Result<ProvisioningBundle<L::Handle>, ProvisionError> {
        info!(
            artifacts = self.catalog.len(),
            root = %self.store.root().display(),
            "scanning model store"
        );
        let pending = self.scan().await?;

        let (fetched, download_duration) = if pending.is_empty() {
            info!("all artifacts present, skipping fetch phase");
            (Vec::new(), Duration::ZERO)
        } else {
            let started = Instant::now();
            let fetched = self.fetch_all(pending).await?;
            let elapsed = started.elapsed();
            info!(count = fetched.len(), elapsed_ms = elapsed.as_millis() as u64, "fetch phase complete");
            (fetched, elapsed)
        };

        let started = Instant::now();
        let models = self.load_all().await?;
        let load_duration = started.elapsed();
        info!(
            count = models.len(),
            elapsed_ms = load_duration.as_millis() as u64,
            "load phase complete"
        );

        Ok(ProvisioningBundle {
            models,
            fetched,
            download_duration,
            load_duration,
        })
    }

    /// Loads caller-supplied local files without any recovery. Each reference
    /// is a plain path or a `file://` URL; every catalog artifact must be named
    /// exactly once. Nothing is fetched or deleted.
    pub async fn load_local<I, N, R>(
        &self,
        references: I,
    ) -> Result<ProvisioningBundle<L::Handle>, ProvisionError>
    where
        I: IntoIterator<Item = (N, R)>,
        N: Into<String>,
        R: AsRef<str>,
    {
        let paths = self.resolve_references(references)?;

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for spec in self.catalog.specs() {
            let Some(path) = paths.get(&spec.name).cloned() else {
                continue;
            };
            let loader = Arc::clone(&self.loader);
            let affinity = self.affinity;
            let name = spec.name.clone();
            spawn_unit(&mut tasks, spec.name.clone(), move || {
                debug!(artifact = %name, path = %path.display(), "loading caller-supplied artifact");
                let loaded = loader.load(&path, affinity);
                (path, loaded)
            });
        }

        let mut loaded = HashMap::new();
        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match settle(joined) {
                Ok((name, (path, Ok(handle)))) => {
                    loaded.insert(name, (path, handle));
                }
                Ok((artifact, (_, Err(source)))) => {
                    error!(artifact = %artifact, %source, "caller-supplied artifact failed to load");
                    first_failure.get_or_insert(ProvisionError::Load { artifact, source });
                }
                Err(err) => {
                    first_failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        let models = self
            .catalog
            .specs()
            .iter()
            .filter_map(|spec| {
                loaded.remove(&spec.name).map(|(path, handle)| LoadedModel {
                    name: spec.name.clone(),
                    path,
                    handle,
                    attempts: 1,
                })
            })
            .collect();

        Ok(ProvisioningBundle {
            models,
            fetched: Vec::new(),
            download_duration: Duration::ZERO,
            load_duration: started.elapsed(),
        })
    }

    /// Classification hashes checksummed artifacts, so it runs on the
    /// blocking pool like the fetch and load units.
    async fn scan(&self) -> Result<Vec<ArtifactSpec>, ProvisionError> {
        let catalog = Arc::clone(&self.catalog);
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || scan_store(&catalog, &store, &events))
            .await
            .map_err(|err| ProvisionError::Task {
                artifact: self.catalog.names().join(", "),
                reason: err.to_string(),
            })?
    }

    async fn fetch_all(&self, pending: Vec<ArtifactSpec>) -> Result<Vec<String>, ProvisionError> {
        let participants: Vec<String> = pending.iter().map(|spec| spec.name.clone()).collect();
        let mut tasks = JoinSet::new();
        for spec in pending {
            let fetcher = Arc::clone(&self.fetcher);
            let events = self.events.clone();
            let destination = self.store.path_for(&spec);
            spawn_unit(&mut tasks, spec.name.clone(), move || {
                events.emit(ProvisioningEvent::FetchStarted {
                    name: spec.name.clone(),
                });
                debug!(artifact = %spec.name, destination = %destination.display(), "fetching artifact");
                let result = fetcher.fetch(&spec, &destination);
                events.emit(ProvisioningEvent::FetchFinished {
                    name: spec.name.clone(),
                    ok: result.is_ok(),
                });
                result
            });
        }

        // Every fetch settles before a failure is reported.
        let mut failures: Vec<(String, DownloadError)> = Vec::new();
        let mut panicked = None;
        while let Some(joined) = tasks.join_next().await {
            match settle(joined) {
                Ok((name, Ok(()))) => debug!(artifact = %name, "fetch finished"),
                Ok((name, Err(source))) => {
                    warn!(artifact = %name, %source, "fetch failed");
                    failures.push((name, source));
                }
                Err(err) => {
                    panicked.get_or_insert(err);
                }
            }
        }

        if let Some(err) = panicked {
            return Err(err);
        }
        let failed = failures.len();
        if let Some((artifact, source)) = failures.into_iter().next() {
            error!(artifact = %artifact, failed, "fetch phase failed");
            return Err(ProvisionError::Download {
                artifact,
                participants,
                failed,
                source,
            });
        }
        Ok(participants)
    }

    async fn load_all(&self) -> Result<Vec<LoadedModel<L::Handle>>, ProvisionError> {
        let mut tasks = JoinSet::new();
        for spec in self.catalog.specs().iter().cloned() {
            let store = Arc::clone(&self.store);
            let fetcher = Arc::clone(&self.fetcher);
            let loader = Arc::clone(&self.loader);
            let events = self.events.clone();
            let max_retries = self.max_retries;
            let affinity = self.affinity;
            spawn_unit(&mut tasks, spec.name.clone(), move || {
                let outcome = RecoveryCoordinator::new(
                    &store,
                    fetcher.as_ref(),
                    loader.as_ref(),
                    &events,
                    max_retries,
                    affinity,
                )
                .run(&spec);
                (store.path_for(&spec), outcome)
            });
        }

        let mut loaded = HashMap::new();
        let mut first_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match settle(joined) {
                Ok((name, (path, Ok(outcome)))) => {
                    debug!(artifact = %name, attempts = outcome.attempts, "artifact ready");
                    loaded.insert(name, (path, outcome));
                }
                Ok((_, (_, Err(err)))) | Err(err) => {
                    first_failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_failure {
            error!(error = %err, "load phase failed, discarding loaded artifacts");
            return Err(err);
        }

        Ok(self
            .catalog
            .specs()
            .iter()
            .filter_map(|spec| {
                loaded.remove(&spec.name).map(|(path, outcome)| LoadedModel {
                    name: spec.name.clone(),
                    path,
                    handle: outcome.handle,
                    attempts: outcome.attempts,
                })
            })
            .collect())
    }

    fn resolve_references<I, N, R>(
        &self,
        references: I,
    ) -> Result<HashMap<String, PathBuf>, ProvisionError>
    where
        I: IntoIterator<Item = (N, R)>,
        N: Into<String>,
        R: AsRef<str>,
    {
        let mut paths = HashMap::new();
        for (name, reference) in references {
            let name = name.into();
            if self.catalog.get(&name).is_none() {
                return Err(usage(name, "not part of the catalog"));
            }
            if paths.contains_key(&name) {
                return Err(usage(name, "referenced more than once"));
            }
            let path = parse_local_reference(reference.as_ref())
                .map_err(|reason| usage(name.clone(), reason))?;
            paths.insert(name, path);
        }
        if let Some(spec) = self
            .catalog
            .specs()
            .iter()
            .find(|spec| !paths.contains_key(&spec.name))
        {
            return Err(usage(spec.name.clone(), "no local reference supplied"));
        }
        Ok(paths)
    }
}

/// Classifies every artifact and purges invalid ones. Returns the specs
/// that need fetching, in catalog order.
fn scan_store(
    catalog: &ArtifactCatalog,
    store: &LocalStore,
    events: &EventSink,
) -> Result<Vec<ArtifactSpec>, ProvisionError> {
    let mut pending = Vec::new();
    for spec in catalog.specs() {
        let state = store.classify(spec);
        events.emit(ProvisioningEvent::Scanned {
            name: spec.name.clone(),
            state,
        });
        match state {
            ArtifactState::Valid => {
                debug!(artifact = %spec.name, "artifact present");
            }
            ArtifactState::Missing => {
                debug!(artifact = %spec.name, "artifact missing");
                pending.push(spec.clone());
            }
            ArtifactState::Invalid => {
                warn!(artifact = %spec.name, "artifact invalid, purging before fetch");
                store.purge(spec).map_err(|source| ProvisionError::Store {
                    artifact: spec.name.clone(),
                    source,
                })?;
                events.emit(ProvisioningEvent::Purged {
                    name: spec.name.clone(),
                });
                pending.push(spec.clone());
            }
        }
    }
    Ok(pending)
}

fn usage(artifact: String, reason: impl Into<String>) -> ProvisionError {
    ProvisionError::Usage {
        artifact,
        reason: reason.into(),
    }
}

/// Accepts a plain path or a `file://` URL. Purely lexical.
fn parse_local_reference(reference: &str) -> Result<PathBuf, String> {
    if reference.trim().is_empty() {
        return Err("empty reference".into());
    }
    let Some((scheme, rest)) = reference.split_once("://") else {
        return Ok(PathBuf::from(reference));
    };
    if !scheme.eq_ignore_ascii_case("file") {
        return Err(format!("{scheme}:// is not a local file reference"));
    }
    let rest = rest.strip_prefix("localhost").unwrap_or(rest);
    if !rest.starts_with('/') {
        return Err("file URL must name an absolute path on this host".into());
    }
    Ok(PathBuf::from(rest))
}

fn spawn_unit<T, F>(tasks: &mut JoinSet<UnitResult<T>>, name: String, work: F)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tasks.spawn(async move {
        let result = tokio::task::spawn_blocking(work).await;
        (name, result)
    });
}

fn settle<T>(joined: Result<UnitResult<T>, JoinError>) -> Result<(String, T), ProvisionError> {
    match joined {
        Ok((name, Ok(value))) => Ok((name, value)),
        Ok((artifact, Err(err))) => Err(ProvisionError::Task {
            artifact,
            reason: err.to_string(),
        }),
        Err(err) => Err(ProvisionError::Task {
            artifact: "unknown".into(),
            reason: err.to_string(),
        }),
    }
}
