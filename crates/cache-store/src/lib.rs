//! Flat-file result cache
//!
//! One directory, fixed filenames: the uploaded original, the working
//! (remuxed) video, the scene list, the detection sequence, and the last
//! export output. This is deliberately not a general key-value store.
//!
//! Cache enablement is carried as an explicit [`CacheConfig`] rather than
//! process-global state. The enabled flag governs reads and writes of the
//! derived results (scenes, detections); the video files themselves are the
//! service's working storage and are always written.
//!
//! Loads degrade gracefully: a missing, stale, or unparsable entry reads as
//! a miss (logged), never an error surfaced to the caller.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

use hoopcut_common::{ClipError, DetectionDocument, Result, SceneSegment};

/// Fixed cache filenames
pub const ORIGINAL_VIDEO: &str = "original.mp4";
pub const WORKING_VIDEO: &str = "video.mp4";
pub const SCENES_FILE: &str = "scenes.json";
pub const DETECTIONS_FILE: &str = "ball_detections.json";
pub const EXPORT_FILE: &str = "export.mp4";

const ALL_ENTRIES: &[&str] = &[
    ORIGINAL_VIDEO,
    WORKING_VIDEO,
    SCENES_FILE,
    DETECTIONS_FILE,
    EXPORT_FILE,
];

/// Cache location and enablement, passed explicitly to consumers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub enabled: bool,
}

impl CacheConfig {
    /// Read the cache configuration from `HOOPCUT_CACHE_DIR` and
    /// `HOOPCUT_CACHE_ENABLED`
    #[must_use]
    pub fn from_env() -> Self {
        let dir = std::env::var("HOOPCUT_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".cache"));
        let enabled = std::env::var("HOOPCUT_CACHE_ENABLED")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        Self { dir, enabled }
    }
}

/// One entry in a cache status listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub name: String,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch
    pub modified: u64,
}

/// Snapshot of the cache directory contents
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub enabled: bool,
    pub dir: String,
    pub entries: Vec<CacheEntry>,
}

/// Handle to the flat-file cache
#[derive(Clone)]
pub struct CacheStore {
    config: CacheConfig,
}

impl CacheStore {
    /// Create the store, ensuring the directory exists
    ///
    /// # Errors
    ///
    /// Returns `ClipError::CacheIo` when the directory cannot be created.
    pub fn new(config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| ClipError::CacheIo(format!("{}: {e}", config.dir.display())))?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    #[must_use]
    pub fn original_video(&self) -> PathBuf {
        self.config.dir.join(ORIGINAL_VIDEO)
    }

    #[must_use]
    pub fn working_video(&self) -> PathBuf {
        self.config.dir.join(WORKING_VIDEO)
    }

    #[must_use]
    pub fn export_output(&self) -> PathBuf {
        self.config.dir.join(EXPORT_FILE)
    }

    /// Load the cached scene list, `None` on any kind of miss
    pub async fn load_scenes(&self) -> Option<Vec<SceneSegment>> {
        self.load_json(SCENES_FILE).await
    }

    /// Persist the scene list; a no-op when caching is disabled
    ///
    /// # Errors
    ///
    /// Returns `ClipError::CacheIo` on write failure.
    pub async fn store_scenes(&self, scenes: &[SceneSegment]) -> Result<()> {
        self.store_json(SCENES_FILE, &scenes).await
    }

    /// Load the cached detection document, `None` on any kind of miss
    pub async fn load_detections(&self) -> Option<DetectionDocument> {
        self.load_json(DETECTIONS_FILE).await
    }

    /// Persist the detection document; a no-op when caching is disabled
    ///
    /// # Errors
    ///
    /// Returns `ClipError::CacheIo` on write failure.
    pub async fn store_detections(&self, document: &DetectionDocument) -> Result<()> {
        self.store_json(DETECTIONS_FILE, document).await
    }

    /// Remove derived results (scenes, detections) after a new upload
    pub async fn invalidate_results(&self) {
        for name in [SCENES_FILE, DETECTIONS_FILE] {
            match fs::remove_file(self.config.dir.join(name)).await {
                Ok(()) => debug!("invalidated cache entry {name}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to invalidate cache entry {name}: {e}"),
            }
        }
    }

    /// List the known cache entries currently on disk
    pub async fn status(&self) -> CacheStatus {
        let mut entries = Vec::with_capacity(ALL_ENTRIES.len());
        for name in ALL_ENTRIES {
            let Ok(meta) = fs::metadata(self.config.dir.join(name)).await else {
                continue;
            };
            let modified = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            entries.push(CacheEntry {
                name: (*name).to_string(),
                size_bytes: meta.len(),
                modified,
            });
        }
        CacheStatus {
            enabled: self.config.enabled,
            dir: self.config.dir.display().to_string(),
            entries,
        }
    }

    /// Remove all known cache entries, returning how many were deleted
    ///
    /// # Errors
    ///
    /// Returns `ClipError::CacheIo` on the first removal failure.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for name in ALL_ENTRIES {
            match fs::remove_file(self.config.dir.join(name)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ClipError::CacheIo(format!("{name}: {e}"))),
            }
        }
        Ok(removed)
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let path = self.config.dir.join(name);
        if !self.is_fresh(&path).await {
            debug!("cache entry {name} is stale, ignoring");
            return None;
        }
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read cache entry {name}: {e}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!("cache hit for {name}");
                Some(value)
            }
            Err(e) => {
                warn!("failed to parse cache entry {name}: {e}");
                None
            }
        }
    }

    async fn store_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let body = serde_json::to_vec(value)
            .map_err(|e| ClipError::CacheIo(format!("{name}: serialization failed: {e}")))?;
        fs::write(self.config.dir.join(name), body)
            .await
            .map_err(|e| ClipError::CacheIo(format!("{name}: {e}")))?;
        debug!("stored cache entry {name}");
        Ok(())
    }

    /// A derived entry is fresh when it is at least as new as the working
    /// video. With no working video in the cache (an explicit request path
    /// was processed instead), existence is the only check.
    async fn is_fresh(&self, path: &Path) -> bool {
        let Ok(entry_meta) = fs::metadata(path).await else {
            return false;
        };
        let Ok(video_meta) = fs::metadata(self.working_video()).await else {
            return true;
        };
        match (entry_meta.modified(), video_meta.modified()) {
            (Ok(entry), Ok(video)) => entry >= video,
            _ => true,
        }
    }
}
