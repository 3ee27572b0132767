//! Directory-backed file store.
//!
//! The storage root holds nothing but `video_<id>.<ext>` files and a hidden
//! `.staging/` directory. There is no catalog: every listing re-reads the
//! filesystem, and a file's `createdAt` is its modification time, which the
//! store stamps when a download is committed.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::extractor::DEFAULT_DOWNLOAD_TIMEOUT;
use crate::metadata::{Container, format_megabytes};
use crate::security::PathGuard;

pub const FILE_PREFIX: &str = "video_";
const STAGING_DIR: &str = ".staging";
const ID_LEN: usize = 12;
const MAX_NAME_ATTEMPTS: usize = 8;
// Slack between a download's timeout firing and its staging dir being dropped.
const STAGING_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl StoredFile {
    pub fn size_label(&self) -> String {
        format_megabytes(self.size_bytes)
    }
}

/// A reserved file name plus its private staging directory.
///
/// Dropping an uncommitted reservation removes the staging directory, so a
/// failed or cancelled download never leaves partial output behind.
#[derive(Debug)]
pub struct Reservation {
    file_name: String,
    staging_dir: PathBuf,
    committed: bool,
}

impl Reservation {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where the extractor should write the artifact.
    pub fn staging_path(&self) -> PathBuf {
        self.staging_dir.join(&self.file_name)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => debug!(file_name = %self.file_name, "discarded staged download"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                staging = %self.staging_dir.display(),
                "failed to discard staged download: {err}"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    guard: PathGuard,
    download_timeout: Duration,
}

impl FileStore {
    /// The root is not touched until first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            guard: PathGuard::new(root),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.storage_root).with_download_timeout(config.download_timeout)
    }

    /// Upper bound on how long a live download can keep a staging directory.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    fn staging_root(&self) -> PathBuf {
        self.root().join(STAGING_DIR)
    }

    /// Reserves `video_<id>.<ext>` and creates its staging directory.
    pub fn reserve_name(&self, extension: &str) -> PipelineResult<Reservation> {
        let container = Container::parse_or_default(extension);
        let staging_root = self.staging_root();
        fs::create_dir_all(&staging_root)?;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = short_id();
            let file_name = format!("{FILE_PREFIX}{id}.{}", container.extension());
            if self.root().join(&file_name).exists() {
                continue;
            }
            let staging_dir = staging_root.join(&id);
            // create_dir fails if another reservation already owns this id.
            match fs::create_dir(&staging_dir) {
                Ok(()) => {
                    return Ok(Reservation {
                        file_name,
                        staging_dir,
                        committed: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(PipelineError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not reserve a unique file name",
        )))
    }

    /// Publishes a staged artifact into the root.
    pub fn commit(&self, mut reservation: Reservation) -> PipelineResult<StoredFile> {
        let staged = reservation.staging_path();
        match fs::metadata(&staged) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => {
                return Err(PipelineError::DownloadFailure(
                    "extractor produced an empty file".into(),
                ));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PipelineError::DownloadFailure(
                    "extractor produced no file".into(),
                ));
            }
            Err(err) => return Err(err.into()),
        }

        fs::File::options()
            .write(true)
            .open(&staged)?
            .set_modified(SystemTime::now())?;

        let target = self.root().join(reservation.file_name());
        fs::rename(&staged, &target)?;
        reservation.committed = true;
        if let Err(err) = fs::remove_dir_all(&reservation.staging_dir) {
            debug!("leaving empty staging directory behind: {err}");
        }

        let meta = fs::metadata(&target)?;
        Ok(StoredFile {
            file_name: reservation.file_name.clone(),
            size_bytes: meta.len(),
            created_at: DateTime::<Utc>::from(meta.modified()?),
        })
    }

    /// PathGuard entry point shared by retrieval and deletion.
    pub fn resolve(&self, file_name: &str) -> PipelineResult<PathBuf> {
        let path = self.guard.resolve(file_name)?;
        if !path.is_file() {
            return Err(PipelineError::FileNotFound);
        }
        Ok(path)
    }

    /// Stored files, most recent first.
    pub fn list(&self) -> PipelineResult<Vec<StoredFile>> {
        let entries = match fs::read_dir(self.root()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            // Entries can vanish between read_dir and stat when a sweep or a
            // delete runs concurrently.
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if !meta.is_file() {
                continue;
            }
            let created = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(StoredFile {
                file_name,
                size_bytes: meta.len(),
                created_at: DateTime::<Utc>::from(created),
            });
        }
        files.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(files)
    }

    /// Removes a stored file. Returns false when it was already gone.
    pub fn delete(&self, file_name: &str) -> PipelineResult<bool> {
        let path = match self.resolve(file_name) {
            Ok(path) => path,
            Err(PipelineError::FileNotFound) => return Ok(false),
            Err(err) => return Err(err),
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(file_name, "deleted stored file");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes every stored file older than `max_age` and returns how many
    /// were removed. Staging directories are reaped too but not counted, and
    /// only once they are older than any live download could be.
    pub fn sweep(&self, max_age: Duration) -> PipelineResult<usize> {
        let started = SystemTime::now();
        let cutoff = DateTime::<Utc>::from(started.checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH));

        let mut removed = 0;
        for file in self.list()? {
            if file.created_at >= cutoff {
                continue;
            }
            match fs::remove_file(self.root().join(&file.file_name)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(file_name = %file.file_name, "sweep could not remove file: {err}"),
            }
        }

        self.reap_staging(started, max_age);
        if removed > 0 {
            info!(removed, "swept expired downloads");
        }
        Ok(removed)
    }

    fn reap_staging(&self, now: SystemTime, max_age: Duration) {
        let max_age = max_age.max(self.download_timeout.saturating_add(STAGING_MARGIN));
        let Ok(entries) = fs::read_dir(self.staging_root()) else {
            return;
        };
        for entry in entries.flatten() {
            let expired = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);
            if expired && let Err(err) = fs::remove_dir_all(entry.path()) {
                debug!(staging = %entry.path().display(), "failed to reap staging entry: {err}");
            }
        }
    }
}

/// Runs store work on the blocking pool. Every async caller goes through
/// here so filesystem calls never stall the runtime.
pub async fn blocking<T, F>(op: F) -> PipelineResult<T>
where
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}
