//! Reusable scaffolding component catalog
//!
//! Assets are loaded from a catalog directory:
//!
//! ```text
//! scaffolding/
//! ├── metadata.jsonl            # one asset per line
//! └── compatibility_index.json  # edge signature -> symbols (optional)
//! ```
//!
//! When no compatibility index is present it is derived from the assets'
//! edge signatures.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::registry::visualization::VisualizationManifest;

/// Metadata describing a reusable scaffolding component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaffoldingAsset {
    pub symbol: String,
    #[serde(default)]
    pub symmetry_group: String,
    #[serde(default)]
    pub edge_signatures: Vec<String>,
    #[serde(default)]
    pub scaler_table_ref: String,
    #[serde(default)]
    pub mesh_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_uri: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Incoming asset for a batch commit. Unknown fields are kept as attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetUpdate {
    pub symbol: String,
    #[serde(default)]
    pub symmetry_group: Option<String>,
    #[serde(default)]
    pub edge_signatures: Vec<String>,
    #[serde(default)]
    pub scaler_table_ref: Option<String>,
    #[serde(default)]
    pub mesh_ref: Option<String>,
    #[serde(default)]
    pub thumbnail_uri: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Attach the matching visualization payload to this asset
    #[serde(default)]
    pub commit_visualization: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssetUpdate {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }
}

/// Visualization references attached to a committed asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizationPayload {
    #[serde(default)]
    pub mesh_ref: String,
    #[serde(default)]
    pub net_ref: String,
    #[serde(default)]
    pub thumbnail_uri: String,
}

impl VisualizationPayload {
    /// Names of empty fields. A payload is usable only when this is empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.mesh_ref.trim().is_empty() {
            missing.push("mesh_ref");
        }
        if self.net_ref.trim().is_empty() {
            missing.push("net_ref");
        }
        if self.thumbnail_uri.trim().is_empty() {
            missing.push("thumbnail_uri");
        }
        missing
    }

    fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("mesh_ref".into(), Value::String(self.mesh_ref.clone()));
        map.insert("net_ref".into(), Value::String(self.net_ref.clone()));
        map.insert("thumbnail_uri".into(), Value::String(self.thumbnail_uri.clone()));
        map
    }
}

/// Counters across all batch commits
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub committed: u64,
    pub queued_for_viz: u64,
    pub validation_failures: u64,
}

/// Result of a successful batch commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub committed: Vec<String>,
    pub queued_for_viz: Vec<String>,
}

/// State guarded by the registry's batch lock
#[derive(Debug, Default)]
pub struct ScaffoldingCatalog {
    pub assets: HashMap<String, ScaffoldingAsset>,
    pub compatibility_index: BTreeMap<String, Vec<String>>,
    pub visualization_index: BTreeMap<String, VisualizationManifest>,
    pub stats: BatchStats,
}

impl ScaffoldingCatalog {
    /// Replace assets and compatibility index from a catalog path.
    ///
    /// `catalog_path` may be the directory or the `metadata.jsonl` file itself.
    /// Returns the number of assets loaded.
    pub fn load_from(&mut self, catalog_path: &Path) -> Result<usize> {
        let (metadata_path, compat_path) = resolve_catalog_paths(catalog_path);

        if !metadata_path.exists() {
            debug!(path = %metadata_path.display(), "Scaffolding metadata not found");
            return Ok(0);
        }

        let file = fs::File::open(&metadata_path)?;
        let mut loaded = HashMap::new();
        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let data = line.trim();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<ScaffoldingAsset>(data) {
                Ok(asset) if asset.symbol.trim().is_empty() => {
                    warn!(line = line_number + 1, "Skipping scaffolding asset (missing symbol)");
                }
                Ok(asset) => {
                    loaded.insert(asset.symbol.clone(), asset);
                }
                Err(e) => {
                    warn!(line = line_number + 1, error = %e, "Skipping scaffolding asset line");
                }
            }
        }
        self.assets = loaded;

        let mut compatibility = compat_path
            .map(|path| read_compatibility_index(&path))
            .unwrap_or_default();

        if compatibility.is_empty() {
            for asset in self.assets.values() {
                for signature in &asset.edge_signatures {
                    compatibility
                        .entry(signature.clone())
                        .or_insert_with(Vec::new)
                        .push(asset.symbol.clone());
                }
            }
            for symbols in compatibility.values_mut() {
                symbols.sort();
            }
        }
        self.compatibility_index = compatibility;

        Ok(self.assets.len())
    }

    /// Assets compatible with an edge signature
    pub fn lookup_by_attachment(&self, edge_signature: &str) -> Vec<ScaffoldingAsset> {
        self.compatibility_index
            .get(edge_signature)
            .map(|symbols| {
                symbols
                    .iter()
                    .filter_map(|symbol| self.assets.get(symbol).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Merge a validated batch. Caller holds the batch lock.
    pub(crate) fn apply_batch(
        &mut self,
        assets: Vec<AssetUpdate>,
        payloads: &BTreeMap<String, VisualizationPayload>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for update in assets {
            let symbol = update.symbol.clone();
            let mut asset = self.assets.remove(&symbol).unwrap_or_else(|| ScaffoldingAsset {
                symbol: symbol.clone(),
                symmetry_group: String::new(),
                edge_signatures: Vec::new(),
                scaler_table_ref: String::new(),
                mesh_ref: String::new(),
                thumbnail_uri: None,
                metadata: Map::new(),
            });

            asset.metadata.extend(update.metadata);
            if !update.extra.is_empty() {
                let attributes = asset
                    .metadata
                    .entry("attributes")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(attributes) = attributes {
                    attributes.extend(update.extra);
                }
            }

            if !update.edge_signatures.is_empty() {
                asset.edge_signatures = update.edge_signatures.clone();
            }
            if let Some(group) = update.symmetry_group.filter(|g| !g.is_empty()) {
                asset.symmetry_group = group;
            }
            if let Some(table) = update.scaler_table_ref.filter(|t| !t.is_empty()) {
                asset.scaler_table_ref = table;
            }
            if let Some(mesh) = update.mesh_ref.filter(|m| !m.is_empty()) {
                asset.mesh_ref = mesh;
            }
            if update.thumbnail_uri.is_some() {
                asset.thumbnail_uri = update.thumbnail_uri;
            }

            if update.commit_visualization {
                if let Some(payload) = payloads.get(&symbol) {
                    asset.mesh_ref = payload.mesh_ref.clone();
                    let visualization = asset
                        .metadata
                        .entry("visualization")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(visualization) = visualization {
                        visualization.extend(payload.to_json());
                    }
                    debug!(symbol = %symbol, mesh = %payload.mesh_ref, "Committed visualization");
                    outcome.queued_for_viz.push(symbol.clone());
                }
            }

            for signature in &update.edge_signatures {
                let bucket = self
                    .compatibility_index
                    .entry(signature.clone())
                    .or_insert_with(Vec::new);
                if !bucket.contains(&symbol) {
                    bucket.push(symbol.clone());
                    debug!(signature = %signature, symbol = %symbol, total = bucket.len(), "Mapped edge signature");
                }
            }

            self.assets.insert(symbol.clone(), asset);
            outcome.committed.push(symbol);
        }

        self.stats.committed += outcome.committed.len() as u64;
        self.stats.queued_for_viz += outcome.queued_for_viz.len() as u64;
        outcome
    }
}

/// Reject the whole batch if any payload is incomplete
pub(crate) fn validate_payloads(payloads: &BTreeMap<String, VisualizationPayload>) -> Result<()> {
    for (symbol, payload) in payloads {
        let missing = payload.missing_fields();
        if !missing.is_empty() {
            return Err(EngineError::ValidationIncomplete {
                symbol: symbol.clone(),
                missing: missing.join(", "),
            });
        }
    }
    Ok(())
}

fn resolve_catalog_paths(catalog_path: &Path) -> (PathBuf, Option<PathBuf>) {
    let (metadata_path, compat_path) = if catalog_path.is_dir() {
        (
            catalog_path.join("metadata.jsonl"),
            catalog_path.join("compatibility_index.json"),
        )
    } else {
        (
            catalog_path.to_path_buf(),
            catalog_path.with_file_name("compatibility_index.json"),
        )
    };
    let compat_path = compat_path.exists().then_some(compat_path);
    (metadata_path, compat_path)
}

fn read_compatibility_index(path: &Path) -> BTreeMap<String, Vec<String>> {
    let parsed = fs::read_to_string(path)
        .map_err(EngineError::from)
        .and_then(|content| serde_json::from_str::<Map<String, Value>>(&content).map_err(EngineError::from));

    let raw = match parsed {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse compatibility index");
            return BTreeMap::new();
        }
    };

    let mut index = BTreeMap::new();
    for (signature, symbols) in raw {
        match symbols {
            Value::Array(symbols) => {
                let symbols = symbols
                    .into_iter()
                    .map(|s| match s {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect();
                index.insert(signature, symbols);
            }
            _ => debug!(signature = %signature, "Ignoring malformed compatibility entry"),
        }
    }
    index
}
