//! Visualization catalog index and debounced rescans
//!
//! Each sub-directory of the catalog root is named after a symbol and may
//! hold rendered assets for it:
//!
//! ```text
//! polyform_library/
//! └── Ψ₁/
//!     ├── mesh.glb
//!     ├── mesh_simplified.glb
//!     ├── net.svg
//!     └── thumb_256.png
//! ```
//!
//! Rescans are requested often (every ingest batch) but only the last
//! request in a quiet period is executed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Known asset files: (file name, asset key, format)
const ASSET_FILES: [(&str, &str, &str); 4] = [
    ("mesh.glb", "mesh", "glTF"),
    ("mesh_simplified.glb", "mesh_simplified", "glTF"),
    ("net.svg", "net", "SVG"),
    ("thumb_256.png", "thumbnail", "PNG"),
];

/// A single rendered asset on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationAsset {
    pub path: PathBuf,
    pub format: String,
    pub mtime: Option<DateTime<Utc>>,
}

/// All rendered assets found for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizationManifest {
    pub symbol: String,
    pub assets: BTreeMap<String, VisualizationAsset>,
}

/// Scan a catalog root. A missing root yields an empty index.
pub fn scan_visualization_catalog(root: &Path) -> Result<BTreeMap<String, VisualizationManifest>> {
    let mut index = BTreeMap::new();
    if !root.is_dir() {
        debug!(root = %root.display(), "Visualization catalog root missing");
        return Ok(index);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let symbol = entry.file_name().to_string_lossy().into_owned();

        let mut assets = BTreeMap::new();
        for (file_name, key, format) in ASSET_FILES {
            let path = dir.join(file_name);
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().ok().map(DateTime::<Utc>::from);
            assets.insert(
                key.to_string(),
                VisualizationAsset {
                    path,
                    format: format.to_string(),
                    mtime,
                },
            );
        }

        if !assets.is_empty() {
            index.insert(symbol.clone(), VisualizationManifest { symbol, assets });
        }
    }

    Ok(index)
}

/// What a call to run a due refresh did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing was requested
    Idle,
    /// A request exists but its quiet period has not passed
    NotDue,
    /// Another scan is still in progress
    AlreadyRunning,
    /// Scan finished and the index now holds this many symbols
    Completed { symbols: usize },
}

#[derive(Debug, Clone)]
struct PendingRefresh {
    root: PathBuf,
    due_at: Instant,
}

/// Single-slot debounced scheduler.
///
/// Each request replaces the pending one. The caller drives execution by
/// polling [`RefreshScheduler::try_begin`].
#[derive(Debug)]
pub struct RefreshScheduler {
    debounce: Duration,
    pending: Mutex<Option<PendingRefresh>>,
    running: AtomicBool,
}

/// Clears the running flag when the scan ends, including on error
pub struct RunningGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl RefreshScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Schedule a rescan of `root`, replacing any pending request
    pub fn request_at(&self, root: PathBuf, now: Instant) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?;
        if pending.is_some() {
            debug!(root = %root.display(), "Replacing pending visualization refresh");
        }
        *pending = Some(PendingRefresh {
            root,
            due_at: now + self.debounce,
        });
        Ok(())
    }

    /// Put back a claimed request whose scan failed. A request that
    /// arrived while the scan ran is newer and stays in place.
    pub fn requeue_at(&self, root: PathBuf, now: Instant) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?;
        if pending.is_none() {
            *pending = Some(PendingRefresh {
                root,
                due_at: now + self.debounce,
            });
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the pending request if it is due and no scan is running.
    ///
    /// On success the pending slot is emptied and the returned guard holds
    /// the running flag until dropped.
    pub fn try_begin(&self, now: Instant) -> Result<std::result::Result<(PathBuf, RunningGuard<'_>), RefreshOutcome>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))?;

        let due_at = match pending.as_ref() {
            None => return Ok(Err(RefreshOutcome::Idle)),
            Some(p) => p.due_at,
        };
        if now < due_at {
            return Ok(Err(RefreshOutcome::NotDue));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(Err(RefreshOutcome::AlreadyRunning));
        }

        match pending.take() {
            Some(request) => Ok(Ok((
                request.root,
                RunningGuard {
                    running: &self.running,
                },
            ))),
            None => {
                self.running.store(false, Ordering::SeqCst);
                Ok(Err(RefreshOutcome::Idle))
            }
        }
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(2_000))
    }
}

/// Log a completed scan
pub(crate) fn log_refresh(root: &Path, symbols: usize) {
    info!(root = %root.display(), symbols, "Refreshed visualization catalog");
}
