//! Sweeps stale staging directories out of the temp roots.

use super::staging::parse_staging_name;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::{future::Future, io::ErrorKind, path::Path, time};
use tokio::{fs, task::JoinHandle};
use tracing::{debug, info, warn};

/// Outcome of one sweep.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub retained: usize,
    /// Entries that could not be parsed or removed.
    pub skipped: usize,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.removed += other.removed;
        self.retained += other.retained;
        self.skipped += other.skipped;
    }
}

/// Remove every immediate subdirectory of `root` whose name is an epoch
/// millisecond timestamp older than `now - retention`.
///
/// Plain files are ignored. Bad names and failed removals are logged and
/// skipped so one entry cannot halt the sweep. A missing root is an empty
/// sweep.
pub async fn cleanup_directory(
    root: &Path,
    retention: Duration,
    now: DateTime<Utc>,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let cutoff = now - retention;

    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("temp root {} does not exist", root.display());
            return report;
        }
        Err(err) => {
            warn!("cannot read temp root {}: {}", root.display(), err);
            return report;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("error listing {}: {}", root.display(), err);
                break;
            }
        };

        match entry.file_type().await {
            Ok(ft) if ft.is_dir() => {}
            Ok(_) => continue,
            Err(err) => {
                warn!("cannot stat {}: {}", entry.path().display(), err);
                report.skipped += 1;
                continue;
            }
        }

        let name = entry.file_name();
        let Some(created_at) = name.to_str().and_then(parse_staging_name) else {
            warn!(
                "skipping {}: name is not a millisecond timestamp",
                entry.path().display()
            );
            report.skipped += 1;
            continue;
        };

        if created_at >= cutoff {
            report.retained += 1;
            continue;
        }

        let path = entry.path();
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!("removed stale staging directory {}", path.display());
                report.removed += 1;
            }
            Err(err) => {
                warn!("failed to remove {}: {}", path.display(), err);
                report.skipped += 1;
            }
        }
    }

    report
}

/// Run `sweep` every `interval` until the runtime shuts down.
pub fn spawn_periodic<F, Fut>(interval: time::Duration, sweep: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = CleanupReport> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = sweep().await;
            if report.removed > 0 || report.skipped > 0 {
                info!(
                    removed = report.removed,
                    retained = report.retained,
                    skipped = report.skipped,
                    "temp cleanup finished"
                );
            }
        }
    })
}
