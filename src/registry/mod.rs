//! Symbol registry
//!
//! Owns every symbol table used by the codec and the compression tree:
//!
//! - primitives: one code point per supported polygon side count
//! - pairs: a small fixed pool for adjacent primitive pairs
//! - clusters, flexible clusters, assemblies and megas: allocated on
//!   demand, keyed by a content signature, never reassigned
//!
//! The registry also carries the scaffolding asset catalog. Batch commits
//! against it are serialized by an internal lock; plain tier allocation is
//! not, and takes `&mut self`.

pub mod scaffolding;
pub mod tables;
pub mod visualization;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ScaffoldingConfig;
use crate::error::{EngineError, Result};

use self::scaffolding::{
    validate_payloads, AssetUpdate, BatchOutcome, BatchStats, ScaffoldingAsset, ScaffoldingCatalog,
    VisualizationPayload,
};
use self::tables::{is_subscript, normalize_pair, tables, to_subscript};
use self::visualization::{
    log_refresh, scan_visualization_catalog, RefreshOutcome, RefreshScheduler,
    VisualizationManifest,
};

pub use self::tables::{MAX_SIDES, MIN_SIDES, PAIR_POOL_SIZE};

/// Dynamically allocated symbol tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolTier {
    Cluster,
    FlexibleCluster,
    Assembly,
    Mega,
}

impl SymbolTier {
    pub const ALL: [SymbolTier; 4] = [
        SymbolTier::Cluster,
        SymbolTier::FlexibleCluster,
        SymbolTier::Assembly,
        SymbolTier::Mega,
    ];

    /// Leading code point of every symbol in this tier
    pub fn prefix(&self) -> char {
        match self {
            SymbolTier::Cluster => 'Ω',
            SymbolTier::FlexibleCluster => 'Φ',
            SymbolTier::Assembly => 'Ψ',
            SymbolTier::Mega => 'Ξ',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|tier| tier.prefix() == c)
    }
}

/// Outcome of a get-or-create allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub symbol: String,
    pub is_new: bool,
}

/// Serializable registry state.
///
/// `flexible` is omitted when empty so snapshots without flexible clusters
/// keep the three-key shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub clusters: BTreeMap<String, String>,
    #[serde(default)]
    pub assemblies: BTreeMap<String, String>,
    #[serde(default)]
    pub megas: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flexible: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct SymbolMap {
    tier: SymbolTier,
    by_signature: BTreeMap<String, String>,
    by_symbol: HashMap<String, String>,
}

impl SymbolMap {
    fn new(tier: SymbolTier) -> Self {
        Self {
            tier,
            by_signature: BTreeMap::new(),
            by_symbol: HashMap::new(),
        }
    }

    fn allocate(&mut self, signature: &str) -> Allocation {
        if let Some(symbol) = self.by_signature.get(signature) {
            return Allocation {
                symbol: symbol.clone(),
                is_new: false,
            };
        }

        let mut index = self.by_signature.len() + 1;
        let symbol = loop {
            let candidate = format!("{}{}", self.tier.prefix(), to_subscript(index));
            if !self.by_symbol.contains_key(&candidate) {
                break candidate;
            }
            index += 1;
        };

        debug!(tier = ?self.tier, signature, symbol = %symbol, "Allocated symbol");
        self.by_signature.insert(signature.to_string(), symbol.clone());
        self.by_symbol.insert(symbol.clone(), signature.to_string());
        Allocation {
            symbol,
            is_new: true,
        }
    }

    fn replace(&mut self, entries: &BTreeMap<String, String>) {
        self.by_signature = entries.clone();
        self.by_symbol = entries
            .iter()
            .map(|(signature, symbol)| (symbol.clone(), signature.clone()))
            .collect();
    }

    fn signature_of(&self, symbol: &str) -> Option<&str> {
        self.by_symbol.get(symbol).map(String::as_str)
    }
}

/// Registry of all compression symbols
#[derive(Debug)]
pub struct SymbolRegistry {
    clusters: SymbolMap,
    flexible: SymbolMap,
    assemblies: SymbolMap,
    megas: SymbolMap,
    scaffolding: Mutex<ScaffoldingCatalog>,
    refresh: RefreshScheduler,
    visualization_root: PathBuf,
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::with_config(&ScaffoldingConfig::default())
    }

    pub fn with_config(config: &ScaffoldingConfig) -> Self {
        Self {
            clusters: SymbolMap::new(SymbolTier::Cluster),
            flexible: SymbolMap::new(SymbolTier::FlexibleCluster),
            assemblies: SymbolMap::new(SymbolTier::Assembly),
            megas: SymbolMap::new(SymbolTier::Mega),
            scaffolding: Mutex::new(ScaffoldingCatalog::default()),
            refresh: RefreshScheduler::new(Duration::from_millis(config.refresh_debounce_ms)),
            visualization_root: config.visualization_root.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Primitives and pairs
    // ------------------------------------------------------------------

    pub fn primitive_symbol(&self, sides: u32) -> Result<char> {
        tables()
            .primitive_by_sides
            .get(&sides)
            .copied()
            .ok_or(EngineError::UnsupportedPolygon(sides))
    }

    pub fn primitive_sides(&self, symbol: char) -> Result<u32> {
        tables()
            .sides_by_primitive
            .get(&symbol)
            .copied()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))
    }

    /// Pair slot for two primitives in either order, `None` when the pool
    /// has no slot for them
    pub fn pair_symbol(&self, a: char, b: char) -> Option<char> {
        tables().pair_by_members.get(&normalize_pair(a, b)).copied()
    }

    /// Normalized members of a pair slot
    pub fn pair_members(&self, symbol: char) -> Option<(char, char)> {
        tables().members_by_pair.get(&symbol).copied()
    }

    /// `(sides, symbol)` in ascending side order
    pub fn iter_primitives(&self) -> impl Iterator<Item = (u32, char)> + '_ {
        tables().primitive_by_sides.iter().map(|(&s, &c)| (s, c))
    }

    /// `(members, symbol)` in allocation order
    pub fn iter_pairs(&self) -> impl Iterator<Item = ((char, char), char)> + '_ {
        tables().pair_order.iter().copied()
    }

    // ------------------------------------------------------------------
    // Dynamic tiers
    // ------------------------------------------------------------------

    pub fn allocate_cluster(&mut self, signature: &str, flexible: bool) -> Allocation {
        if flexible {
            self.flexible.allocate(signature)
        } else {
            self.clusters.allocate(signature)
        }
    }

    pub fn allocate_assembly(&mut self, signature: &str) -> Allocation {
        self.assemblies.allocate(signature)
    }

    pub fn allocate_mega(&mut self, signature: &str) -> Allocation {
        self.megas.allocate(signature)
    }

    pub fn allocate_tier(&mut self, tier: SymbolTier, signature: &str) -> Allocation {
        self.map_mut(tier).allocate(signature)
    }

    /// Signature behind a cluster symbol, rigid or flexible
    pub fn cluster_signature(&self, symbol: &str) -> Option<&str> {
        self.clusters
            .signature_of(symbol)
            .or_else(|| self.flexible.signature_of(symbol))
    }

    pub fn assembly_signature(&self, symbol: &str) -> Option<&str> {
        self.assemblies.signature_of(symbol)
    }

    pub fn mega_signature(&self, symbol: &str) -> Option<&str> {
        self.megas.signature_of(symbol)
    }

    /// Tier and signature of an allocated symbol.
    ///
    /// Pair glyphs share code points with tier prefixes, so a bare prefix
    /// without subscript digits is never treated as a tier symbol.
    pub fn resolve_tier_symbol(&self, symbol: &str) -> Option<(SymbolTier, &str)> {
        let mut chars = symbol.chars();
        let tier = SymbolTier::from_prefix(chars.next()?)?;
        let digits: Vec<char> = chars.collect();
        if digits.is_empty() || !digits.iter().all(|&c| is_subscript(c)) {
            return None;
        }
        self.map(tier).signature_of(symbol).map(|sig| (tier, sig))
    }

    pub fn symbol_count(&self, tier: SymbolTier) -> usize {
        self.map(tier).by_signature.len()
    }

    fn map(&self, tier: SymbolTier) -> &SymbolMap {
        match tier {
            SymbolTier::Cluster => &self.clusters,
            SymbolTier::FlexibleCluster => &self.flexible,
            SymbolTier::Assembly => &self.assemblies,
            SymbolTier::Mega => &self.megas,
        }
    }

    fn map_mut(&mut self, tier: SymbolTier) -> &mut SymbolMap {
        match tier {
            SymbolTier::Cluster => &mut self.clusters,
            SymbolTier::FlexibleCluster => &mut self.flexible,
            SymbolTier::Assembly => &mut self.assemblies,
            SymbolTier::Mega => &mut self.megas,
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn export_state(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            clusters: self.clusters.by_signature.clone(),
            assemblies: self.assemblies.by_signature.clone(),
            megas: self.megas.by_signature.clone(),
            flexible: self.flexible.by_signature.clone(),
        }
    }

    /// Restore dynamic tiers from a snapshot, replacing current contents
    pub fn load_state(&mut self, snapshot: &RegistrySnapshot) {
        self.clusters.replace(&snapshot.clusters);
        self.flexible.replace(&snapshot.flexible);
        self.assemblies.replace(&snapshot.assemblies);
        self.megas.replace(&snapshot.megas);
        debug!(
            clusters = snapshot.clusters.len(),
            flexible = snapshot.flexible.len(),
            assemblies = snapshot.assemblies.len(),
            megas = snapshot.megas.len(),
            "Loaded registry snapshot"
        );
    }

    // ------------------------------------------------------------------
    // Scaffolding catalog
    // ------------------------------------------------------------------

    fn catalog(&self) -> Result<MutexGuard<'_, ScaffoldingCatalog>> {
        self.scaffolding
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Load scaffolding assets from a catalog directory or metadata file
    pub fn load_scaffolding_assets(&self, catalog_path: &Path) -> Result<usize> {
        let mut catalog = self.catalog()?;
        let loaded = catalog.load_from(catalog_path)?;
        info!(
            path = %catalog_path.display(),
            assets = loaded,
            signatures = catalog.compatibility_index.len(),
            "Loaded scaffolding catalog"
        );
        Ok(loaded)
    }

    pub fn lookup_scaffold(&self, symbol: &str) -> Result<Option<ScaffoldingAsset>> {
        Ok(self.catalog()?.assets.get(symbol).cloned())
    }

    pub fn lookup_by_attachment(&self, edge_signature: &str) -> Result<Vec<ScaffoldingAsset>> {
        Ok(self.catalog()?.lookup_by_attachment(edge_signature))
    }

    pub fn compatibility_index(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.catalog()?.compatibility_index.clone())
    }

    /// Merge a batch of assets atomically.
    ///
    /// Every payload is validated before anything is touched; one incomplete
    /// payload rejects the whole batch. Symbols that committed visualization
    /// trigger a debounced catalog rescan.
    pub fn batch_commit_scaffolding(
        &self,
        assets: Vec<AssetUpdate>,
        payloads: &BTreeMap<String, VisualizationPayload>,
    ) -> Result<BatchOutcome> {
        let outcome = {
            let mut catalog = self.catalog()?;
            if let Err(e) = validate_payloads(payloads) {
                catalog.stats.validation_failures += 1;
                warn!(error = %e, "Rejected scaffolding batch");
                return Err(e);
            }
            catalog.apply_batch(assets, payloads)
        };

        info!(
            committed = outcome.committed.len(),
            queued_for_viz = outcome.queued_for_viz.len(),
            "Committed scaffolding batch"
        );

        if !outcome.queued_for_viz.is_empty() {
            self.refresh
                .request_at(self.visualization_root.clone(), Instant::now())?;
        }
        Ok(outcome)
    }

    pub fn batch_stats(&self) -> Result<BatchStats> {
        Ok(self.catalog()?.stats.clone())
    }

    // ------------------------------------------------------------------
    // Visualization catalog
    // ------------------------------------------------------------------

    /// Request a debounced rescan of `root`, or of the configured root
    pub fn request_visualization_refresh(&self, root: Option<PathBuf>) -> Result<()> {
        self.request_visualization_refresh_at(root, Instant::now())
    }

    pub fn request_visualization_refresh_at(&self, root: Option<PathBuf>, now: Instant) -> Result<()> {
        let root = root.unwrap_or_else(|| self.visualization_root.clone());
        self.refresh.request_at(root, now)
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh.has_pending()
    }

    /// Run the pending rescan if its quiet period has passed. A failed
    /// scan leaves the request pending for the next poll.
    pub fn run_due_refresh(&self, now: Instant) -> Result<RefreshOutcome> {
        self.run_due_refresh_with(now, scan_visualization_catalog)
    }

    fn run_due_refresh_with(
        &self,
        now: Instant,
        scan: impl FnOnce(&Path) -> Result<BTreeMap<String, VisualizationManifest>>,
    ) -> Result<RefreshOutcome> {
        let (root, _guard) = match self.refresh.try_begin(now)? {
            Ok(claimed) => claimed,
            Err(outcome) => return Ok(outcome),
        };

        let index = match scan(&root) {
            Ok(index) => index,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Visualization scan failed, keeping request");
                self.refresh.requeue_at(root, now)?;
                return Err(e);
            }
        };
        let symbols = index.len();
        self.catalog()?.visualization_index = index;
        log_refresh(&root, symbols);
        Ok(RefreshOutcome::Completed { symbols })
    }

    pub fn visualization_manifest(&self, symbol: &str) -> Result<Option<VisualizationManifest>> {
        Ok(self.catalog()?.visualization_index.get(symbol).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_primitive_lookup_round_trip() {
        let registry = SymbolRegistry::new();
        for sides in MIN_SIDES..=MAX_SIDES {
            let symbol = registry.primitive_symbol(sides).unwrap();
            assert_eq!(registry.primitive_sides(symbol).unwrap(), sides);
        }
        assert_eq!(registry.primitive_symbol(3).unwrap(), 'c');
        assert_eq!(registry.primitive_symbol(11).unwrap(), 'a');
    }

    #[test]
    fn test_primitive_lookup_errors() {
        let registry = SymbolRegistry::new();
        assert!(matches!(
            registry.primitive_symbol(2),
            Err(EngineError::UnsupportedPolygon(2))
        ));
        assert!(matches!(
            registry.primitive_symbol(21),
            Err(EngineError::UnsupportedPolygon(21))
        ));
        assert!(matches!(
            registry.primitive_sides('z'),
            Err(EngineError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_pair_lookup_is_order_independent() {
        let registry = SymbolRegistry::new();
        let tri = registry.primitive_symbol(3).unwrap();
        let sq = registry.primitive_symbol(4).unwrap();

        let forward = registry.pair_symbol(tri, sq).unwrap();
        assert_eq!(registry.pair_symbol(sq, tri), Some(forward));
        assert_eq!(registry.pair_members(forward), Some(normalize_pair(tri, sq)));

        // First slot goes to the triangle pair
        assert_eq!(registry.pair_symbol(tri, tri), Some('α'));
        assert_eq!(registry.iter_pairs().count(), PAIR_POOL_SIZE);
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let mut registry = SymbolRegistry::new();

        let first = registry.allocate_assembly("sig-a");
        let again = registry.allocate_assembly("sig-a");
        let other = registry.allocate_assembly("sig-b");

        assert!(first.is_new);
        assert!(!again.is_new);
        assert_eq!(first.symbol, again.symbol);
        assert_eq!(first.symbol, "Ψ₁");
        assert_eq!(other.symbol, "Ψ₂");
        assert_eq!(registry.symbol_count(SymbolTier::Assembly), 2);
        assert_eq!(registry.assembly_signature("Ψ₂"), Some("sig-b"));
    }

    #[test]
    fn test_flexible_and_assembly_maps_are_disjoint() {
        let mut registry = SymbolRegistry::new();

        let flexible = registry.allocate_cluster("shared", true);
        let assembly = registry.allocate_assembly("shared");
        let rigid = registry.allocate_cluster("shared", false);

        assert_eq!(flexible.symbol, "Φ₁");
        assert_eq!(assembly.symbol, "Ψ₁");
        assert_eq!(rigid.symbol, "Ω₁");
        assert!(assembly.is_new);
        assert_eq!(registry.cluster_signature("Φ₁"), Some("shared"));
        assert_eq!(registry.assembly_signature("Φ₁"), None);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut registry = SymbolRegistry::new();
        registry.allocate_cluster("c1", false);
        registry.allocate_cluster("f1", true);
        registry.allocate_assembly("a1");
        registry.allocate_mega("m1");

        let snapshot = registry.export_state();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["clusters"]["c1"], "Ω₁");
        assert_eq!(json["flexible"]["f1"], "Φ₁");

        let mut restored = SymbolRegistry::new();
        restored.load_state(&serde_json::from_value(json).unwrap());
        assert_eq!(restored.export_state(), snapshot);

        // Allocation after restore continues the sequence
        assert_eq!(restored.allocate_assembly("a2").symbol, "Ψ₂");
    }

    #[test]
    fn test_snapshot_without_flexible_key() {
        let snapshot: RegistrySnapshot =
            serde_json::from_str(r#"{"clusters":{},"assemblies":{"x":"Ψ₃"},"megas":{}}"#).unwrap();
        let mut registry = SymbolRegistry::new();
        registry.load_state(&snapshot);

        // Index 1 is free, but allocation must never hand out Ψ₃ again
        assert_eq!(registry.allocate_assembly("y").symbol, "Ψ₂");
        assert_eq!(registry.allocate_assembly("z").symbol, "Ψ₄");

        let json = serde_json::to_value(registry.export_state()).unwrap();
        assert!(json.get("flexible").is_none());
    }

    #[test]
    fn test_resolve_tier_symbol_ignores_pair_glyphs() {
        let mut registry = SymbolRegistry::new();
        registry.allocate_cluster("sig", false);

        assert_eq!(
            registry.resolve_tier_symbol("Ω₁"),
            Some((SymbolTier::Cluster, "sig"))
        );
        assert_eq!(registry.resolve_tier_symbol("Ω"), None);
        assert_eq!(registry.resolve_tier_symbol("Ω₂"), None);
    }

    fn payload(symbol: &str) -> VisualizationPayload {
        VisualizationPayload {
            mesh_ref: format!("{symbol}/mesh.glb"),
            net_ref: format!("{symbol}/net.svg"),
            thumbnail_uri: format!("{symbol}/thumb_256.png"),
        }
    }

    #[test]
    fn test_batch_commit_is_all_or_nothing() {
        let registry = SymbolRegistry::new();

        let mut good = AssetUpdate::new("S1");
        good.edge_signatures = vec!["4-4".into()];
        let bad = AssetUpdate::new("S2");

        let mut payloads = BTreeMap::new();
        payloads.insert("S1".to_string(), payload("S1"));
        payloads.insert(
            "S2".to_string(),
            VisualizationPayload {
                mesh_ref: "S2/mesh.glb".into(),
                ..Default::default()
            },
        );

        let result = registry.batch_commit_scaffolding(vec![good, bad], &payloads);
        assert!(matches!(result, Err(EngineError::ValidationIncomplete { .. })));
        assert!(registry.lookup_scaffold("S1").unwrap().is_none());
        assert!(registry.lookup_by_attachment("4-4").unwrap().is_empty());

        let stats = registry.batch_stats().unwrap();
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.committed, 0);
    }

    #[test]
    fn test_batch_commit_schedules_visualization_refresh() {
        let temp_dir = TempDir::new().unwrap();
        let config = ScaffoldingConfig {
            refresh_debounce_ms: 0,
            visualization_root: temp_dir.path().to_path_buf(),
        };
        let registry = SymbolRegistry::with_config(&config);

        let mut asset = AssetUpdate::new("S1");
        asset.commit_visualization = true;
        asset.edge_signatures = vec!["4-4".into(), "4-4".into()];
        let mut payloads = BTreeMap::new();
        payloads.insert("S1".to_string(), payload("S1"));

        let outcome = registry
            .batch_commit_scaffolding(vec![asset], &payloads)
            .unwrap();
        assert_eq!(outcome.queued_for_viz, vec!["S1"]);
        assert_eq!(registry.compatibility_index().unwrap()["4-4"], vec!["S1"]);
        assert!(registry.refresh_pending());

        let sym_dir = temp_dir.path().join("S1");
        fs::create_dir_all(&sym_dir).unwrap();
        fs::write(sym_dir.join("thumb_256.png"), b"png").unwrap();

        let outcome = registry.run_due_refresh(Instant::now()).unwrap();
        assert_eq!(outcome, RefreshOutcome::Completed { symbols: 1 });
        let manifest = registry.visualization_manifest("S1").unwrap().unwrap();
        assert_eq!(manifest.assets["thumbnail"].format, "PNG");

        assert_eq!(
            registry.run_due_refresh(Instant::now()).unwrap(),
            RefreshOutcome::Idle
        );
    }

    #[test]
    fn test_failed_refresh_stays_pending() {
        let temp_dir = TempDir::new().unwrap();
        let config = ScaffoldingConfig {
            refresh_debounce_ms: 0,
            visualization_root: temp_dir.path().to_path_buf(),
        };
        let registry = SymbolRegistry::with_config(&config);
        registry.request_visualization_refresh(None).unwrap();

        let result = registry.run_due_refresh_with(Instant::now(), |_| {
            Err(EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
        });
        assert!(matches!(result, Err(EngineError::Io(_))));
        assert!(registry.refresh_pending());

        assert_eq!(
            registry.run_due_refresh(Instant::now()).unwrap(),
            RefreshOutcome::Completed { symbols: 0 }
        );
        assert!(!registry.refresh_pending());
    }

    #[test]
    fn test_load_scaffolding_assets_via_registry() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("metadata.jsonl"),
            r#"{"symbol":"S9","symmetry_group":"C6","edge_signatures":["6-6"],"scaler_table_ref":"t","mesh_ref":"m","metadata":{"k":1}}"#,
        )
        .unwrap();

        let registry = SymbolRegistry::new();
        assert_eq!(registry.load_scaffolding_assets(temp_dir.path()).unwrap(), 1);
        let asset = registry.lookup_scaffold("S9").unwrap().unwrap();
        assert_eq!(asset.symmetry_group, "C6");
        assert_eq!(registry.lookup_by_attachment("6-6").unwrap().len(), 1);
    }
}
