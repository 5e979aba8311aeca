use crate::config::AuditConfig;
use crate::store::AuditStore;
use fleet_types::AuditRecord;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Asynchronous, batched, lossy-under-overload audit sink.
///
/// [`AuditWriter::submit`] never blocks: when the bounded queue is
/// full the record is dropped. Persistence backpressure must never
/// stall command execution; loss on overflow is the documented
/// trade-off.
pub struct AuditWriter {
    tx: mpsc::Sender<AuditRecord>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AuditWriter {
    pub fn spawn(store: Arc<dyn AuditStore>, config: AuditConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
        let (tx, rx) = mpsc::channel(batch_size * 4);
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_loop(
            store,
            rx,
            shutdown.clone(),
            flush_interval,
            batch_size,
        ));
        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Best-effort enqueue; silently drops when the queue is full.
    pub fn submit(&self, record: AuditRecord) {
        if self.tx.try_send(record).is_err() {
            tracing::debug!("audit queue full, dropping record");
        }
    }

    /// Stops the background loop, flushing any partially filled batch
    /// first.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().expect("audit worker lock").take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "audit writer task failed");
            }
        }
    }
}

async fn run_loop(
    store: Arc<dyn AuditStore>,
    mut rx: mpsc::Receiver<AuditRecord>,
    shutdown: CancellationToken,
    flush_interval: Duration,
    batch_size: usize,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut batch: Vec<AuditRecord> = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        flush(store.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(store.as_ref(), &mut batch).await;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    // Pick up anything already queued, then final flush.
    while let Ok(record) = rx.try_recv() {
        batch.push(record);
    }
    flush(store.as_ref(), &mut batch).await;
}

async fn flush(store: &dyn AuditStore, batch: &mut Vec<AuditRecord>) {
    for record in batch.drain(..) {
        // Insert failures are absorbed here; audit loss never
        // propagates back to the orchestrator.
        if let Err(err) = store.append(&record).await {
            tracing::warn!(
                error = %err,
                machine = record.machine_id,
                "failed to persist audit record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct CountingStore {
        records: Mutex<Vec<AuditRecord>>,
    }

    #[async_trait]
    impl AuditStore for CountingStore {
        async fn append(&self, record: &AuditRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn record(machine_id: i64) -> AuditRecord {
        AuditRecord {
            machine_id,
            command: "uptime".to_string(),
            ..AuditRecord::default()
        }
    }

    #[tokio::test]
    async fn close_flushes_partial_batch() {
        let store = Arc::new(CountingStore::default());
        let writer = AuditWriter::spawn(
            store.clone(),
            AuditConfig {
                flush_interval_ms: 60_000,
                batch_size: 100,
            },
        );
        writer.submit(record(1));
        writer.submit(record(2));
        writer.close().await;
        assert_eq!(store.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn submit_after_overflow_is_dropped_not_blocking() {
        let store = Arc::new(CountingStore::default());
        let writer = AuditWriter::spawn(
            store.clone(),
            AuditConfig {
                flush_interval_ms: 60_000,
                batch_size: 1,
            },
        );
        // Queue capacity is batch_size * 4; well past that must not
        // block the caller.
        for id in 0..64 {
            writer.submit(record(id));
        }
        writer.close().await;
        assert!(store.records.lock().unwrap().len() <= 64);
    }
}
