//! Periodic eviction of expired downloads.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::PipelineResult;
use crate::store::{FileStore, blocking};

/// Outcome of the most recent sweep, surfaced by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub finished_at: DateTime<Utc>,
    pub removed: usize,
}

#[derive(Clone)]
pub struct Janitor {
    store: FileStore,
    max_age: Duration,
    interval: Duration,
    last: Arc<RwLock<Option<SweepReport>>>,
}

impl Janitor {
    pub fn new(store: FileStore, max_age: Duration, interval: Duration) -> Self {
        Self {
            store,
            max_age,
            interval,
            last: Arc::new(RwLock::new(None)),
        }
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.last.read().clone()
    }

    /// Runs a single sweep on the blocking pool.
    pub async fn sweep_once(&self) -> PipelineResult<SweepReport> {
        let store = self.store.clone();
        let max_age = self.max_age;
        let removed = blocking(move || store.sweep(max_age)).await?;
        let report = SweepReport {
            finished_at: Utc::now(),
            removed,
        };
        *self.last.write() = Some(report.clone());
        Ok(report)
    }

    /// Sweeps immediately, then on every interval tick until `shutdown`
    /// resolves. Failed sweeps are logged and retried on the next tick.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "janitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(report) => debug!(removed = report.removed, "janitor sweep finished"),
                    Err(err) => error!("janitor sweep failed: {err}"),
                },
            }
        }
        info!("janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::SystemTime};
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn write_aged(root: &std::path::Path, name: &str, age: Duration) {
        let path = root.join(name);
        fs::write(&path, b"bytes").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_once_records_report() {
        let dir = tempdir().unwrap();
        write_aged(dir.path(), "video_old.mp4", 30 * HOUR);
        write_aged(dir.path(), "video_new.mp4", HOUR);
        let janitor = Janitor::new(FileStore::new(dir.path()), 24 * HOUR, HOUR);

        assert!(janitor.last_report().is_none());
        let report = janitor.sweep_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(janitor.last_report(), Some(report));
        assert!(dir.path().join("video_new.mp4").exists());
    }

    #[tokio::test]
    async fn run_sweeps_until_shutdown() {
        let dir = tempdir().unwrap();
        write_aged(dir.path(), "video_old.mp4", 30 * HOUR);
        let janitor = Janitor::new(
            FileStore::new(dir.path()),
            24 * HOUR,
            Duration::from_millis(20),
        );
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(janitor.clone().run(async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!dir.path().join("video_old.mp4").exists());
        assert!(janitor.last_report().is_some());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
