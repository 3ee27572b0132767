//! Boundary to the external media extractor (`yt-dlp`).
//!
//! This is the only module that spawns processes. Everything above it works
//! with [`RawMetadata`] and [`ExtractorError`] and never sees argument syntax.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::metadata::Container;

pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// Only the tail of stderr is worth logging; yt-dlp can be very chatty.
const STDERR_LOG_LIMIT: usize = 512;

/// Subset of `yt-dlp -J` output the pipeline reads. Everything is optional
/// because extractors for smaller sites omit most fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    pub creator: Option<String>,
    pub channel: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub format_note: Option<String>,
    pub ext: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("extractor binary not found")]
    Unavailable,

    #[error("failed to run extractor: {0}")]
    Spawn(#[source] io::Error),

    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),

    #[error("extractor exited with {0}")]
    Exited(ExitStatus),

    #[error("extractor returned malformed output")]
    Malformed(#[source] serde_json::Error),
}

impl ExtractorError {
    fn normalized(&self) -> &'static str {
        match self {
            Self::Unavailable => "extractor unavailable",
            Self::Spawn(_) => "extractor could not be started",
            Self::Timeout(_) => "extractor timed out",
            Self::Exited(_) => "extractor exited unsuccessfully",
            Self::Malformed(_) => "extractor returned malformed output",
        }
    }

    /// Translation used on the metadata path.
    pub fn into_extraction_failure(self) -> PipelineError {
        match self {
            Self::Unavailable => PipelineError::ToolUnavailable,
            other => PipelineError::ExtractionFailure(other.normalized().into()),
        }
    }

    /// Translation used on the materialization path.
    pub fn into_download_failure(self) -> PipelineError {
        match self {
            Self::Unavailable => PipelineError::ToolUnavailable,
            other => PipelineError::DownloadFailure(other.normalized().into()),
        }
    }
}

/// Capability surface of the extractor.
#[async_trait]
pub trait MediaExtractor: Send + Sync + 'static {
    /// Reads metadata for a single URL without downloading anything.
    async fn fetch_metadata(&self, url: &str) -> Result<RawMetadata, ExtractorError>;

    /// Materializes the selected streams at exactly `destination`.
    async fn fetch_media(
        &self,
        url: &str,
        selector: &str,
        container: Container,
        destination: &Path,
    ) -> Result<(), ExtractorError>;

    /// Reports the tool version; fails when the tool is missing.
    async fn probe(&self) -> Result<String, ExtractorError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    program: PathBuf,
    metadata_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.ytdlp_bin).with_timeouts(config.metadata_timeout, config.download_timeout)
    }

    pub fn with_timeouts(mut self, metadata: Duration, download: Duration) -> Self {
        self.metadata_timeout = metadata;
        self.download_timeout = download;
        self
    }

    /// Spawns the extractor and returns captured stdout.
    ///
    /// `limit` covers the whole call: waiting for the leader and draining both
    /// pipes. Once the leader exits, or on timeout or cancellation, the whole
    /// process group is killed so helpers such as ffmpeg cannot hold the
    /// pipes open.
    async fn run(&self, args: Vec<OsString>, limit: Duration) -> Result<Vec<u8>, ExtractorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ExtractorError::Unavailable,
            _ => ExtractorError::Spawn(err),
        })?;
        let group = ProcessGroup::new(child.id());

        let stdout = child.stdout.take().map(spawn_pipe_reader);
        let stderr = child.stderr.take().map(spawn_pipe_reader);

        let finished = tokio::time::timeout(limit, async {
            let status = child.wait().await?;
            group.kill();
            let stdout = collect_pipe(stdout).await;
            let stderr = collect_pipe(stderr).await;
            Ok::<_, io::Error>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(Ok(done)) => done,
            Ok(Err(err)) => return Err(ExtractorError::Spawn(err)),
            Err(_) => {
                // Pipe readers end on their own once the group is gone.
                group.kill();
                if let Err(err) = child.kill().await {
                    debug!(program = %self.program.display(), "failed to kill timed out extractor: {err}");
                }
                warn!(program = %self.program.display(), ?limit, "extractor timed out");
                return Err(ExtractorError::Timeout(limit));
            }
        };

        if !status.success() {
            warn!(
                program = %self.program.display(),
                %status,
                stderr = %stderr_tail(&stderr),
                "extractor failed"
            );
            return Err(ExtractorError::Exited(status));
        }
        Ok(stdout)
    }
}

/// Kills the extractor's process group at most once, at the latest on drop.
/// `kill_on_drop` alone only reaches the group leader.
struct ProcessGroup {
    pid: Option<u32>,
    killed: AtomicBool,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            killed: AtomicBool::new(false),
        }
    }

    fn kill(&self) {
        if let Some(pid) = self.pid
            && !self.killed.swap(true, Ordering::SeqCst)
        {
            kill_process_group(pid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn fetch_metadata(&self, url: &str) -> Result<RawMetadata, ExtractorError> {
        debug!(url, "fetching metadata");
        let args = [
            "-J",
            "--no-playlist",
            "--no-warnings",
            "--skip-download",
            "--",
            url,
        ]
        .map(OsString::from)
        .to_vec();
        let stdout = self.run(args, self.metadata_timeout).await?;
        serde_json::from_slice(&stdout).map_err(ExtractorError::Malformed)
    }

    async fn fetch_media(
        &self,
        url: &str,
        selector: &str,
        container: Container,
        destination: &Path,
    ) -> Result<(), ExtractorError> {
        debug!(url, selector, destination = %destination.display(), "fetching media");
        let mut args: Vec<OsString> = [
            "-f",
            selector,
            "--merge-output-format",
            container.extension(),
            "--no-playlist",
            "--no-mtime",
            "--no-part",
            "--no-progress",
            "--no-warnings",
            "-o",
        ]
        .map(OsString::from)
        .to_vec();
        args.push(destination.as_os_str().to_owned());
        args.push("--".into());
        args.push(url.into());
        self.run(args, self.download_timeout).await.map(|_| ())
    }

    async fn probe(&self) -> Result<String, ExtractorError> {
        let stdout = self
            .run(vec![OsString::from("--version")], self.metadata_timeout)
            .await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

fn spawn_pipe_reader<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect_pipe(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(STDERR_LOG_LIMIT);
    let start = (start..=trimmed.len())
        .find(|idx| trimmed.is_char_boundary(*idx))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => debug!(pid, "killpg failed: {err}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// In-memory extractor used by unit tests across the crate.
#[cfg(test)]
pub(crate) mod stub {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub(crate) struct StubExtractor {
        pub metadata: Option<RawMetadata>,
        pub media: Option<Vec<u8>>,
        pub delay: Duration,
        pub metadata_calls: AtomicUsize,
        pub media_calls: AtomicUsize,
        active: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl StubExtractor {
        pub(crate) fn new(metadata: Option<RawMetadata>, media: Option<Vec<u8>>) -> Self {
            Self {
                metadata,
                media,
                delay: Duration::ZERO,
                metadata_calls: AtomicUsize::new(0),
                media_calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failure() -> ExtractorError {
            ExtractorError::Malformed(serde_json::from_str::<RawMetadata>("{").unwrap_err())
        }
    }

    #[async_trait]
    impl MediaExtractor for StubExtractor {
        async fn fetch_metadata(&self, _url: &str) -> Result<RawMetadata, ExtractorError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            self.metadata.clone().ok_or_else(Self::failure)
        }

        async fn fetch_media(
            &self,
            _url: &str,
            _selector: &str,
            _container: Container,
            destination: &Path,
        ) -> Result<(), ExtractorError> {
            self.media_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // A partial artifact is written either way so cleanup is observable.
            tokio::fs::write(destination, b"partial").await.unwrap();
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match &self.media {
                Some(bytes) => {
                    tokio::fs::write(destination, bytes).await.unwrap();
                    Ok(())
                }
                None => Err(Self::failure()),
            }
        }

        async fn probe(&self) -> Result<String, ExtractorError> {
            Ok("stub".to_string())
        }
    }
}
