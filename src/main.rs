use std::{sync::Arc, thread, time::Duration};

use anyhow::{bail, Context, Result};
use model_provisioning::{
    core::{events, settings::SettingsManager},
    models::{
        default_catalog, total_size, ArtifactCatalog, FixedRoot, HttpFetcher, LocalStore,
        OnnxLoader, OnnxModel, ProjectRootResolver, ProvisioningBundle, ProvisioningOrchestrator,
    },
};
use tracing::{debug, error, info, metadata::LevelFilter};

fn setup_logging() {
    let filter = std::env::var("PROVISION_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// `name=reference` pairs switch to loading caller-supplied files.
fn parse_local_args(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((name, reference)) if !name.is_empty() => {
                Ok((name.to_string(), reference.to_string()))
            }
            _ => bail!("expected NAME=PATH, got {arg:?}"),
        })
        .collect()
}

fn report(bundle: &ProvisioningBundle<OnnxModel>) {
    for model in bundle.models() {
        info!(
            artifact = %model.name,
            path = %model.path.display(),
            attempts = model.attempts,
            size_bytes = total_size(&model.path),
            "model ready"
        );
    }
    info!(
        fetched = bundle.fetched().len(),
        download_ms = bundle.download_duration().as_millis() as u64,
        load_ms = bundle.load_duration().as_millis() as u64,
        "provisioning complete"
    );
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let local = parse_local_args(&args)?;

    let settings = SettingsManager::new()?.read();
    let catalog = match &settings.catalog_path {
        Some(path) => ArtifactCatalog::from_json_file(path)
            .with_context(|| format!("loading catalog {path:?}"))?,
        None => default_catalog(),
    };
    let store = match &settings.models_dir {
        Some(dir) => LocalStore::from_resolver(&FixedRoot(dir.clone())),
        None => LocalStore::from_resolver(&ProjectRootResolver::default()),
    }
    .context("resolving model directory")?;

    // The blocking client owns its own runtime and must be built outside ours.
    let fetcher = HttpFetcher::new(settings.remote_base_url.clone())
        .context("building http client")?
        .with_auth_token(settings.auth_token.clone());
    let loader = OnnxLoader::new().with_intra_threads(settings.intra_threads);

    let (sink, receiver) = events::channel();
    let listener = thread::spawn(move || {
        for event in receiver {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!(%json, "provisioning event");
            }
        }
    });

    let orchestrator =
        ProvisioningOrchestrator::new(catalog, store, Arc::new(fetcher), Arc::new(loader))
            .with_max_retries(settings.max_retries)
            .with_affinity(settings.compute_affinity)
            .with_events(sink);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;

    let outcome = runtime.block_on(async {
        if local.is_empty() {
            orchestrator.acquire().await
        } else {
            orchestrator.load_local(local).await
        }
    });
    drop(orchestrator);
    runtime.shutdown_timeout(Duration::from_secs(1));
    let _ = listener.join();

    report(&outcome?);
    Ok(())
}

fn main() {
    setup_logging();

    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}
