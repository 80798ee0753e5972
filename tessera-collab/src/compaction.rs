//! Background compaction.
//!
//! Every `interval` the compactor lists stored documents and folds the log of
//! each one holding at least `delta_threshold` updates into its snapshot.
//! All work goes through the persistence worker, so compaction is ordered
//! with the appends around it.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::persistence::PersistenceHandle;
use crate::storage::StoreError;

/// Compaction configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    /// Time between passes
    pub interval: Duration,
    /// Minimum pending updates before a document is compacted
    pub delta_threshold: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            delta_threshold: 100,
        }
    }
}

impl CompactionConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(50),
            delta_threshold: 1,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub scanned: usize,
    pub compacted: usize,
    pub folded_updates: u64,
}

/// Compact every document whose log has reached `threshold` updates.
pub async fn compact_pass(
    persistence: &PersistenceHandle,
    threshold: u64,
) -> Result<CompactionReport, StoreError> {
    let mut report = CompactionReport::default();

    for doc_id in persistence.list_documents("").await? {
        report.scanned += 1;
        if persistence.pending_updates(&doc_id).await? < threshold.max(1) {
            continue;
        }
        match persistence.compact(&doc_id).await {
            Ok(0) => {}
            Ok(folded) => {
                report.compacted += 1;
                report.folded_updates += folded;
            }
            Err(StoreError::WorkerStopped) => return Err(StoreError::WorkerStopped),
            // One bad document must not stall the others.
            Err(e) => log::error!("Compaction of {doc_id} failed: {e}"),
        }
    }

    Ok(report)
}

/// Run [`compact_pass`] every `config.interval` until `shutdown` flips to true.
pub fn spawn_compactor(
    persistence: PersistenceHandle,
    config: CompactionConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match compact_pass(&persistence, config.delta_threshold).await {
                        Ok(report) if report.compacted > 0 => log::info!(
                            "Compacted {} of {} documents ({} updates folded)",
                            report.compacted, report.scanned, report.folded_updates
                        ),
                        Ok(_) => {}
                        Err(StoreError::WorkerStopped) => break,
                        Err(e) => log::error!("Compaction pass failed: {e}"),
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        log::debug!("Compactor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;
    use tessera_core::{DiagramDoc, Geometry, Node, Operation};

    fn fill(handle: &PersistenceHandle, doc_id: &str, n: usize) {
        let mut doc = DiagramDoc::new();
        for i in 0..n {
            let update = doc
                .apply_local_operation(Operation::PutNode(Node::with_id(
                    format!("n{i}"),
                    "box",
                    Geometry::default(),
                )))
                .unwrap();
            handle.append(doc_id, update.into_bytes()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_pass_respects_threshold() {
        let handle = PersistenceHandle::spawn(Arc::new(MemoryStore::new())).unwrap();
        fill(&handle, "busy", 5);
        fill(&handle, "quiet", 2);

        let report = compact_pass(&handle, 3).await.unwrap();
        assert_eq!(
            report,
            CompactionReport {
                scanned: 2,
                compacted: 1,
                folded_updates: 5
            }
        );
        assert_eq!(handle.pending_updates("busy").await.unwrap(), 0);
        assert_eq!(handle.pending_updates("quiet").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_compactor_runs_and_stops() {
        let handle = PersistenceHandle::spawn(Arc::new(MemoryStore::new())).unwrap();
        fill(&handle, "d1", 4);

        let (tx, rx) = watch::channel(false);
        let task = spawn_compactor(handle.clone(), CompactionConfig::for_testing(), rx);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.pending_updates("d1").await.unwrap() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "compactor never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_compaction_config_default() {
        let config = CompactionConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.delta_threshold, 100);
    }
}
