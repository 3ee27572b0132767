//! Turns a chosen quality/extension pair into a stored file.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::extractor::MediaExtractor;
use crate::metadata::Container;
use crate::platform::VideoReference;
use crate::store::{FileStore, StoredFile, blocking};

pub const BEST_SELECTOR: &str = "best";

// Checked in order; the first height contained in the label wins.
const HEIGHT_BOUNDS: &[u32] = &[2160, 1440, 1080, 720, 480, 360, 240, 144];

/// Maps a quality label onto an extractor format selector.
///
/// Unknown labels become "best available" instead of an error, so an odd
/// label from a client never fails the download outright.
pub fn quality_selector(quality_label: &str) -> String {
    let label = quality_label.trim();
    if label.eq_ignore_ascii_case("best") {
        return BEST_SELECTOR.to_string();
    }
    HEIGHT_BOUNDS
        .iter()
        .find(|bound| label.contains(&bound.to_string()))
        .map(|bound| format!("bestvideo[height<={bound}]+bestaudio/best"))
        .unwrap_or_else(|| BEST_SELECTOR.to_string())
}

#[derive(Clone)]
pub struct DownloadExecutor {
    extractor: Arc<dyn MediaExtractor>,
    store: FileStore,
    permits: Arc<Semaphore>,
}

impl DownloadExecutor {
    pub fn new(extractor: Arc<dyn MediaExtractor>, store: FileStore, concurrency: usize) -> Self {
        Self {
            extractor,
            store,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    #[instrument(skip(self))]
    pub async fn execute(
        &self,
        url: &str,
        quality_label: &str,
        extension: &str,
    ) -> PipelineResult<StoredFile> {
        let reference = VideoReference::parse(url)?;
        let container = Container::parse_or_default(extension);
        let selector = quality_selector(quality_label);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::DownloadFailure("executor is shutting down".into()))?;

        // Dropping the reservation on any early return discards staged output.
        let reservation = {
            let store = self.store.clone();
            blocking(move || store.reserve_name(container.extension())).await?
        };
        let destination = reservation.staging_path();
        info!(
            platform = %reference.platform,
            file_name = reservation.file_name(),
            %selector,
            "starting download"
        );

        if let Err(err) = self
            .extractor
            .fetch_media(&reference.url, &selector, container, &destination)
            .await
        {
            warn!(file_name = reservation.file_name(), "download failed: {err}");
            return Err(err.into_download_failure());
        }

        let store = self.store.clone();
        let stored = blocking(move || store.commit(reservation)).await?;
        info!(
            file_name = %stored.file_name,
            size_bytes = stored.size_bytes,
            "download stored"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{RawMetadata, stub::StubExtractor};
    use std::{sync::atomic::Ordering, time::Duration};
    use tempfile::tempdir;

    #[test]
    fn selector_mapping_is_permissive() {
        assert_eq!(quality_selector("Best"), "best");
        assert_eq!(quality_selector("best"), "best");
        assert_eq!(
            quality_selector("1080p"),
            "bestvideo[height<=1080]+bestaudio/best"
        );
        assert_eq!(
            quality_selector("720p60 HDR"),
            "bestvideo[height<=720]+bestaudio/best"
        );
        assert_eq!(
            quality_selector("360p"),
            "bestvideo[height<=360]+bestaudio/best"
        );
        assert_eq!(quality_selector("medium"), "best");
        assert_eq!(quality_selector(""), "best");
    }

    #[tokio::test]
    async fn execute_stores_the_artifact() {
        let dir = tempdir().unwrap();
        let stub = Arc::new(StubExtractor::new(None, Some(b"video-bytes".to_vec())));
        let executor = DownloadExecutor::new(stub, FileStore::new(dir.path()), 2);

        let stored = executor
            .execute("https://youtu.be/abc", "720p", "webm")
            .await
            .unwrap();
        assert!(stored.file_name.ends_with(".webm"));
        assert_eq!(stored.size_bytes, 11);
        assert_eq!(executor.store().list().unwrap(), vec![stored]);
    }

    #[tokio::test]
    async fn failed_download_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let stub = Arc::new(StubExtractor::new(None, None));
        let executor = DownloadExecutor::new(stub.clone(), FileStore::new(dir.path()), 2);

        let err = executor
            .execute("https://vimeo.com/1", "best", "mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DownloadFailure(_)));
        assert_eq!(stub.media_calls.load(Ordering::SeqCst), 1);
        assert!(executor.store().list().unwrap().is_empty());
        let staging = dir.path().join(".staging");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn invalid_urls_never_reach_the_extractor() {
        let dir = tempdir().unwrap();
        let stub = Arc::new(StubExtractor::new(Some(RawMetadata::default()), Some(vec![1])));
        let executor = DownloadExecutor::new(stub.clone(), FileStore::new(dir.path()), 1);
        let err = executor
            .execute("javascript:alert(1)", "best", "mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidUrl(_)));
        assert_eq!(stub.media_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded() {
        let dir = tempdir().unwrap();
        let stub = Arc::new(
            StubExtractor::new(None, Some(b"x".to_vec())).with_delay(Duration::from_millis(50)),
        );
        let executor = DownloadExecutor::new(stub.clone(), FileStore::new(dir.path()), 2);

        let mut tasks = Vec::new();
        for i in 0..6 {
            let executor = executor.clone();
            tasks.push(tokio::spawn(async move {
                executor
                    .execute(&format!("https://youtu.be/v{i}"), "480p", "mp4")
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(stub.media_calls.load(Ordering::SeqCst), 6);
        assert!(stub.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.store().list().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn cancelled_download_discards_staging() {
        let dir = tempdir().unwrap();
        let stub = Arc::new(
            StubExtractor::new(None, Some(b"x".to_vec())).with_delay(Duration::from_secs(10)),
        );
        let executor = DownloadExecutor::new(stub, FileStore::new(dir.path()), 1);

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            executor.execute("https://youtu.be/slow", "best", "mp4"),
        )
        .await;
        assert!(outcome.is_err());
        assert!(executor.store().list().unwrap().is_empty());
        let staging = dir.path().join(".staging");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }
}
