use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Component, Path, PathBuf},
    time::Duration,
};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use reqwest::{blocking::Client, header::AUTHORIZATION, StatusCode};
use tar::{Archive, EntryType};
use tracing::{debug, info};
use uuid::Uuid;
use zip::read::ZipArchive;

use super::{
    catalog::{ArchiveFormat, ArtifactSpec},
    error::DownloadError,
    store::{staging_dir_name, staging_file_name},
};

const CHUNK_SIZE: usize = 32 * 1024;
const PROGRESS_LOG_INTERVAL: u64 = 8 * 1024 * 1024;

/// Materializes a remote asset at a destination path.
///
/// Implementations must fully replace whatever is at `destination` and must
/// be safe to call again on the same path after a failure.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, spec: &ArtifactSpec, destination: &Path) -> Result<(), DownloadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub uri: String,
    pub source_id: String,
    pub asset: String,
    pub archive_format: ArchiveFormat,
    pub destination: PathBuf,
    pub strip_prefix_components: u8,
    pub expected_size_bytes: Option<u64>,
}

impl DownloadPlan {
    pub fn for_spec(spec: &ArtifactSpec, destination: &Path, base_url: &str) -> Self {
        Self {
            uri: spec.remote_uri(base_url),
            source_id: spec.remote_source_id.clone(),
            asset: spec.remote_asset_name.clone(),
            archive_format: spec.archive,
            destination: destination.to_path_buf(),
            strip_prefix_components: spec.strip_prefix_components,
            // Declared sizes describe the unpacked artifact, not the archive.
            expected_size_bytes: match spec.archive {
                ArchiveFormat::File => spec.expected_size_bytes,
                _ => None,
            },
        }
    }

    #[must_use]
    pub fn staging_path(&self, id: &Uuid) -> PathBuf {
        self.sibling(staging_file_name(&self.file_name(), id))
    }

    #[must_use]
    pub fn unpack_path(&self, id: &Uuid) -> PathBuf {
        self.sibling(staging_dir_name(&self.file_name(), id))
    }

    fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".into())
    }

    fn sibling(&self, name: String) -> PathBuf {
        match self.destination.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        // Callers impose their own deadline; the client never times out on its own.
        let client = Client::builder()
            .user_agent(concat!("model-provisioning/", env!("CARGO_PKG_VERSION")))
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token: None,
        })
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|token| !token.is_empty());
        self
    }

    fn download_to_file(
        &self,
        plan: &DownloadPlan,
        path: &Path,
    ) -> Result<u64, DownloadError> {
        let transport = |reason: String| DownloadError::transport(plan.asset.clone(), reason);

        let mut request = self.client.get(&plan.uri);
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let mut response = request
            .send()
            .map_err(|err| transport(format!("request {}: {err}", plan.uri)))?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Err(DownloadError::NotFound {
                source_id: plan.source_id.clone(),
                asset: plan.asset.clone(),
            });
        }
        if !status.is_success() {
            return Err(transport(format!("download {}: HTTP {status}", plan.uri)));
        }

        let expected = plan.expected_size_bytes.or(response.content_length());
        let incomplete = |written: u64| DownloadError::IncompleteWrite {
            asset: plan.asset.clone(),
            expected: expected.unwrap_or(0),
            written,
        };

        let mut file =
            File::create(path).map_err(|err| transport(format!("create staging file: {err}")))?;
        let mut downloaded = 0u64;
        let mut next_report = PROGRESS_LOG_INTERVAL;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = match response.read(&mut buffer) {
                Ok(read) => read,
                Err(_) if expected.is_some() => return Err(incomplete(downloaded)),
                Err(err) => return Err(transport(format!("read download chunk: {err}"))),
            };
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| transport(format!("write download chunk: {err}")))?;
            downloaded += read as u64;
            if downloaded >= next_report {
                debug!(asset = %plan.asset, downloaded, total = ?expected, "download progress");
                next_report += PROGRESS_LOG_INTERVAL;
            }
        }
        file.sync_all()
            .map_err(|err| transport(format!("flush staging file: {err}")))?;

        if let Some(expected) = expected {
            if downloaded != expected {
                return Err(incomplete(downloaded));
            }
        }
        Ok(downloaded)
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(&self, spec: &ArtifactSpec, destination: &Path) -> Result<(), DownloadError> {
        let plan = DownloadPlan::for_spec(spec, destination, &self.base_url);
        let id = Uuid::new_v4();
        let staging = plan.staging_path(&id);
        let unpack = plan.unpack_path(&id);
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                DownloadError::transport(&plan.asset, format!("create staging directory: {err}"))
            })?;
        }

        info!(artifact = %spec.name, uri = %plan.uri, "fetching artifact");
        let result = self
            .download_to_file(&plan, &staging)
            .and_then(|bytes| {
                install(&plan, &staging, &unpack)
                    .map_err(|err| DownloadError::transport(&plan.asset, err))?;
                Ok(bytes)
            });

        let _ = fs::remove_file(&staging);
        let _ = fs::remove_dir_all(&unpack);

        let bytes = result?;
        info!(artifact = %spec.name, bytes, "artifact fetched");
        Ok(())
    }
}

/// Moves a completed download into place, unpacking archives first.
pub fn install(plan: &DownloadPlan, staging: &Path, unpack: &Path) -> io::Result<()> {
    if plan.archive_format == ArchiveFormat::File {
        clear_destination(&plan.destination)?;
        return fs::rename(staging, &plan.destination);
    }

    fs::create_dir_all(unpack)?;
    let file = File::open(staging)?;
    match plan.archive_format {
        ArchiveFormat::TarGz => extract_tar(plan, unpack, GzDecoder::new(file))?,
        ArchiveFormat::TarBz2 => extract_tar(plan, unpack, BzDecoder::new(file))?,
        ArchiveFormat::Zip => extract_zip(plan, unpack, file)?,
        ArchiveFormat::File => {}
    }
    clear_destination(&plan.destination)?;
    fs::rename(unpack, &plan.destination)
}

fn clear_destination(destination: &Path) -> io::Result<()> {
    match fs::symlink_metadata(destination) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(destination),
        Ok(_) => fs::remove_file(destination),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn extract_tar<R: Read>(plan: &DownloadPlan, root: &Path, reader: R) -> io::Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(dest) = entry_destination(root, &path, plan.strip_prefix_components)? else {
            continue;
        };
        match entry.header().entry_type() {
            EntryType::Link => return Err(escape_error(&path)),
            EntryType::Symlink => {
                let target = entry.link_name()?.unwrap_or_default();
                if !is_contained_link(&target) {
                    return Err(escape_error(&path));
                }
            }
            _ => {}
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

fn extract_zip(plan: &DownloadPlan, root: &Path, file: File) -> io::Result<()> {
    let mut archive = ZipArchive::new(file).map_err(zip_error)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_error)?;
        let path = entry.mangled_name();
        let Some(dest) = entry_destination(root, &path, plan.strip_prefix_components)? else {
            continue;
        };
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&dest)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Symlinks may only point downwards. Hard links are never unpacked since
/// their targets resolve outside the unpack directory.
fn is_contained_link(target: &Path) -> bool {
    let mut components = target.components().peekable();
    components.peek().is_some()
        && components.all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn escape_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("archive entry escapes destination: {}", path.display()),
    )
}

/// `None` for entries consumed entirely by the stripped prefix.
fn entry_destination(root: &Path, path: &Path, strip: u8) -> io::Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in path.components().skip(strip as usize) {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(escape_error(path)),
        }
    }
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(root.join(relative)))
}
