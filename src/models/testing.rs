//! In-memory collaborators shared by the recovery and orchestrator tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::catalog::ArtifactSpec;
use super::error::{DownloadError, LoadError};
use super::loader::{ComputeAffinity, ModelLoader};

pub const CORRUPT_PREFIX: &[u8] = b"corrupt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub name: String,
    pub destination_existed: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum FetchFailure {
    NotFound,
    Transport,
}

#[derive(Debug, Default)]
pub struct FakeFetcher {
    payloads: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    failures: HashMap<String, FetchFailure>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<FetchCall>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads are served in order; the last one repeats.
    pub fn serving(self, name: &str, payloads: &[&[u8]]) -> Self {
        self.payloads.lock().insert(
            name.to_string(),
            payloads.iter().map(|payload| payload.to_vec()).collect(),
        );
        self
    }

    pub fn failing(mut self, name: &str, failure: FetchFailure) -> Self {
        self.failures.insert(name.to_string(), failure);
        self
    }

    pub fn delayed(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|call| call.name == name).count()
    }

    fn next_payload(&self, name: &str) -> Vec<u8> {
        let mut payloads = self.payloads.lock();
        match payloads.get_mut(name) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => format!("model:{name}").into_bytes(),
        }
    }
}

impl super::download::RemoteFetcher for FakeFetcher {
    fn fetch(&self, spec: &ArtifactSpec, destination: &Path) -> Result<(), DownloadError> {
        self.calls.lock().push(FetchCall {
            name: spec.name.clone(),
            destination_existed: destination.exists(),
        });
        if let Some(delay) = self.delays.get(&spec.name) {
            thread::sleep(*delay);
        }
        match self.failures.get(&spec.name) {
            Some(FetchFailure::NotFound) => {
                return Err(DownloadError::NotFound {
                    source_id: spec.remote_source_id.clone(),
                    asset: spec.remote_asset_name.clone(),
                })
            }
            Some(FetchFailure::Transport) => {
                return Err(DownloadError::transport(
                    &spec.remote_asset_name,
                    "connection reset by peer",
                ))
            }
            None => {}
        }
        fs::write(destination, self.next_payload(&spec.name))
            .map_err(|err| DownloadError::transport(&spec.remote_asset_name, err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeHandle {
    pub path: PathBuf,
    pub affinity: ComputeAffinity,
}

/// Rejects files starting with [`CORRUPT_PREFIX`] and any file name marked broken.
#[derive(Debug, Default)]
pub struct FakeLoader {
    broken: HashSet<String>,
    delays: HashMap<String, Duration>,
    loads: Mutex<Vec<PathBuf>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_rejecting(mut self, file_name: &str) -> Self {
        self.broken.insert(file_name.to_string());
        self
    }

    pub fn delayed(mut self, file_name: &str, delay: Duration) -> Self {
        self.delays.insert(file_name.to_string(), delay);
        self
    }

    pub fn loads_of(&self, file_name: &str) -> usize {
        self.loads
            .lock()
            .iter()
            .filter(|path| path.file_name().and_then(|name| name.to_str()) == Some(file_name))
            .count()
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().len()
    }
}

impl ModelLoader for FakeLoader {
    type Handle = FakeHandle;

    fn load(&self, path: &Path, affinity: ComputeAffinity) -> Result<FakeHandle, LoadError> {
        self.loads.lock().push(path.to_path_buf());
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        if let Some(delay) = self.delays.get(&file_name) {
            thread::sleep(*delay);
        }
        if self.broken.contains(&file_name) {
            return Err(LoadError::new(path, "incompatible model"));
        }
        let bytes = fs::read(path).map_err(|err| LoadError::new(path, err))?;
        if bytes.starts_with(CORRUPT_PREFIX) {
            return Err(LoadError::new(path, "malformed graph"));
        }
        Ok(FakeHandle {
            path: path.to_path_buf(),
            affinity,
        })
    }
}

pub fn spec(name: &str) -> ArtifactSpec {
    ArtifactSpec::new(name, format!("repo/{name}"), format!("{name}.onnx"), format!("{name}.onnx"))
}
