//! Result sink
//!
//! Persists a completed detection run to the cache off the critical path
//! that delivers the done signal. The task is detached by design: the run's
//! lifecycle never depends on it, and its failure is logged and swallowed
//! because the caller already received authoritative in-band results.

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hoopcut_cache::CacheStore;
use hoopcut_common::DetectionDocument;

/// Persist a detection document in the background
///
/// The returned handle exists for tests; production callers drop it.
pub fn spawn_persist(store: CacheStore, document: DetectionDocument) -> JoinHandle<()> {
    tokio::spawn(async move {
        match store.store_detections(&document).await {
            Ok(()) => debug!(
                "persisted {} detection records to cache",
                document.detections.len()
            ),
            Err(e) => warn!("failed to persist detections to cache: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoopcut_cache::CacheConfig;
    use hoopcut_common::{DetectionSettings, DetectionStats};

    fn sample_document() -> DetectionDocument {
        DetectionDocument {
            settings: DetectionSettings {
                requested_frame_skip: 5,
                effective_frame_skip: 5,
                target_samples: 450,
                confidence_threshold: 0.3,
                max_workers: 4,
                infer_max_width: 640,
            },
            stats: DetectionStats::default(),
            detections: vec![],
        }
    }

    #[tokio::test]
    async fn test_persist_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(CacheConfig {
            dir: dir.path().to_path_buf(),
            enabled: true,
        })
        .unwrap();

        spawn_persist(store.clone(), sample_document())
            .await
            .unwrap();

        let loaded = store.load_detections().await.unwrap();
        assert_eq!(loaded.settings.requested_frame_skip, 5);
    }

    #[tokio::test]
    async fn test_persist_failure_is_swallowed() {
        // A store whose directory has been removed cannot write; the task
        // must still complete cleanly.
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(CacheConfig {
            dir: dir.path().join("gone"),
            enabled: true,
        })
        .unwrap();
        std::fs::remove_dir_all(dir.path().join("gone")).unwrap();

        spawn_persist(store, sample_document()).await.unwrap();
    }
}
