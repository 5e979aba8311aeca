use async_trait::async_trait;
use fleet_types::AuditRecord;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Write contract against the history collaborator: append one record,
/// best effort.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

/// Directory-backed store: one pretty-printed
/// `<finished_ms>-<seq>.audit.json` file per record. File names sort
/// newest-last, which `recent` and `prune` rely on.
pub struct FileAuditStore {
    dir: PathBuf,
    seq: AtomicU64,
}

impl FileAuditStore {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            seq: AtomicU64::new(0),
        })
    }

    /// Newest-first listing, at most `limit` records. Unreadable files
    /// are skipped with a warning.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let mut files = self.record_files();
        files.sort_by(|a, b| b.cmp(a));
        let mut records = Vec::new();
        for path in files.into_iter().take(limit) {
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "failed to read audit record");
                }
            }
        }
        records
    }

    /// Age-based and count-based retention. `retention` of `None` and
    /// `max_records` of 0 each disable that dimension. Safe to call
    /// repeatedly; a second call with the same thresholds is a no-op.
    pub fn prune(&self, retention: Option<Duration>, max_records: usize) {
        let mut files = self.record_files();
        files.sort_by(|a, b| b.cmp(a));

        if let Some(retention) = retention {
            let cutoff = unix_ms().saturating_sub(retention.as_millis() as u64);
            files.retain(|path| {
                if finished_ms(path).map(|ms| ms < cutoff).unwrap_or(false) {
                    remove_record(path);
                    false
                } else {
                    true
                }
            });
        }

        if max_records > 0 {
            for path in files.iter().skip(max_records) {
                remove_record(path);
            }
        }
    }

    fn record_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).into_iter().flatten() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read audit directory");
                    continue;
                }
            };
            let path = entry.path();
            if is_record(&path) {
                files.push(path);
            }
        }
        files
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn append(&self, record: &AuditRecord) -> anyhow::Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(
            "{:013}-{:06}.audit.json",
            record.finished_at_ms,
            seq % 1_000_000
        ));
        let payload = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn is_record(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".audit.json"))
        .unwrap_or(false)
}

fn finished_ms(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('-').next())
        .and_then(|prefix| prefix.parse::<u64>().ok())
}

fn read_record(path: &Path) -> anyhow::Result<AuditRecord> {
    let payload = fs::read(path)?;
    let record = serde_json::from_slice(&payload)?;
    Ok(record)
}

fn remove_record(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        tracing::warn!(error = %err, path = %path.display(), "failed to prune audit record");
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(machine_id: i64, finished_at_ms: u64) -> AuditRecord {
        AuditRecord {
            machine_id,
            command: "uptime".to_string(),
            finished_at_ms,
            ..AuditRecord::default()
        }
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::open(dir.path()).unwrap();
        for id in 0..3u64 {
            store
                .append(&record(id as i64, 1_000 + id * 100))
                .await
                .unwrap();
        }
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].machine_id, 2);
        assert_eq!(recent[1].machine_id, 1);
    }

    #[tokio::test]
    async fn count_prune_converges() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::open(dir.path()).unwrap();
        for id in 0..5u64 {
            store
                .append(&record(id as i64, 1_000 + id * 100))
                .await
                .unwrap();
        }
        store.prune(None, 2);
        assert_eq!(store.recent(10).len(), 2);
        // Second call with the same threshold is a no-op.
        store.prune(None, 2);
        let remaining = store.recent(10);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].machine_id, 4);
    }

    #[tokio::test]
    async fn age_prune_keeps_fresh_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::open(dir.path()).unwrap();
        let now = unix_ms();
        let day = 24 * 60 * 60 * 1000u64;
        for age_days in 0..5u64 {
            store
                .append(&record(age_days as i64, now.saturating_sub(age_days * day)))
                .await
                .unwrap();
        }
        let retention = Duration::from_millis(2 * day + day / 2);
        store.prune(Some(retention), 0);
        let remaining = store.recent(10);
        assert_eq!(remaining.len(), 3);
        store.prune(Some(retention), 0);
        assert_eq!(store.recent(10).len(), 3);
    }
}
