//! Local store of atmospheric patterns with cosine-similarity search and a
//! geographic prefilter. A linear scan over the in-memory index is adequate
//! for the catalog sizes a vessel carries (order 10⁵ patterns); the index is
//! persisted as one JSON document and reloaded on init.
//!
//! Writers are exclusive, readers concurrent. An upsert replaces the whole
//! record under the write lock, so a partially-applied put is never visible.
//! Bounding boxes do not wrap the antimeridian; a query box straddling ±180°
//! only matches the unwrapped side.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use serde::{Serialize, Deserialize};
use crate::config::VectorConfig;
use crate::embedding::{AtmosphericVector, cosine_similarity};

pub const EARTH_RADIUS_NM: f64 = 3440.065;

/// Entries scanned between soft-deadline checks.
const DEADLINE_STRIDE: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum VectorStoreError {
    #[error("DegradedMode")]
    DegradedMode(),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JsonError: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSource {
    Graphcast,
    Observation,
    Historical,
    GridFleet,
    GridLearned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtmosphericPattern {
    pub id: String,
    pub embedding: AtmosphericVector,
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub label: Option<String>,
    pub outcome: Option<String>,
    pub source: PatternSource,
}

#[derive(Debug, Clone)]
pub struct Hit {
    pub pattern: AtmosphericPattern,
    pub similarity: f32,
    /// Haversine distance to the query position, `query_nearby` only.
    pub distance_nm: Option<f64>,
    /// Pattern age relative to the query time, `vibe_search` only.
    pub age_hours: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct VibeFilters {
    /// (lat_min, lat_max, lon_min, lon_max)
    pub bbox: Option<(f64, f64, f64, f64)>,
    pub time_range_ms: Option<(i64, i64)>,
    pub sources: Option<Vec<PatternSource>>,
    pub outcome_substring: Option<String>,
    pub limit: usize,
}

pub struct VectorStore {
    index: RwLock<BTreeMap<String, AtmosphericPattern>>,
    index_file: Option<PathBuf>,
    degraded: AtomicBool,
    initialized: AtomicBool,
    dirty: AtomicBool,
    query_deadline_ms: u64,
}

impl VectorStore {
    pub fn new(config: &VectorConfig) -> Self {
        Self {
            index: RwLock::new(BTreeMap::new()),
            index_file: Some(PathBuf::from(&config.index_file)),
            degraded: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            query_deadline_ms: config.query_deadline_ms,
        }
    }

    /// Volatile store without persistence. Used by tests and degraded-mode
    /// fallback wiring.
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(BTreeMap::new()),
            index_file: None,
            degraded: AtomicBool::new(false),
            initialized: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            query_deadline_ms: 200,
        }
    }

    /// Loads the persisted index. Idempotent; a failure leaves the store in
    /// degraded mode (metadata-only puts, empty query results).
    pub fn init(&self) -> Result<(), VectorStoreError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self.try_load() {
            Ok(loaded) => {
                log::info!("vector - Index ready ({} patterns)", loaded);
                self.initialized.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                log::error!("vector - Entering degraded mode : {:?}", e);
                self.degraded.store(true, Ordering::SeqCst);
                self.initialized.store(true, Ordering::SeqCst);
                Err(VectorStoreError::DegradedMode())
            }
        }
    }

    fn try_load(&self) -> Result<usize, VectorStoreError> {
        let path = match &self.index_file {
            Some(path) => path,
            None => return Ok(0),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            return Ok(0);
        }

        let file = std::fs::File::open(path)?;
        let patterns: Vec<AtmosphericPattern> = serde_json::from_reader(std::io::BufReader::new(file))?;
        let loaded = patterns.len();

        let mut index = self.index.write().expect("vector index lock");
        for pattern in patterns {
            index.insert(pattern.id.clone(), pattern);
        }

        Ok(loaded)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.index.read().expect("vector index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upsert by id. The record swap is atomic under the write lock.
    pub fn put(&self, pattern: AtmosphericPattern) -> Result<(), VectorStoreError> {
        {
            let mut index = self.index.write().expect("vector index lock");
            index.insert(pattern.id.clone(), pattern);
        }
        self.dirty.store(true, Ordering::SeqCst);

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<AtmosphericPattern> {
        self.index.read().expect("vector index lock").get(id).cloned()
    }

    pub fn query_similar(&self, embedding: &AtmosphericVector, k: usize, min_similarity: f32) -> Vec<Hit> {
        self.scan(embedding, k, min_similarity, None, None)
    }

    /// Bounding-box prefilter, then similarity. `distance_nm` is Haversine.
    pub fn query_nearby(
        &self,
        embedding: &AtmosphericVector,
        lat: f64,
        lon: f64,
        radius_deg: f64,
        k: usize,
        min_similarity: f32,
    ) -> Vec<Hit> {
        let bbox = (lat - radius_deg, lat + radius_deg, lon - radius_deg, lon + radius_deg);
        let mut hits = self.scan(embedding, k, min_similarity, Some(bbox), None);

        for hit in &mut hits {
            hit.distance_nm = Some(haversine_nm(lat, lon, hit.pattern.lat, hit.pattern.lon));
        }

        hits
    }

    pub fn vibe_search(&self, embedding: &AtmosphericVector, filters: &VibeFilters) -> Vec<Hit> {
        self.vibe_search_at(embedding, filters, chrono::Utc::now().timestamp_millis())
    }

    pub fn vibe_search_at(&self, embedding: &AtmosphericVector, filters: &VibeFilters, now_ms: i64) -> Vec<Hit> {
        let limit = if filters.limit == 0 { usize::MAX } else { filters.limit };
        let mut hits = self.scan(embedding, limit, -1.0, filters.bbox, Some(filters));

        for hit in &mut hits {
            hit.age_hours = Some((now_ms - hit.pattern.timestamp_ms) as f64 / 3_600_000.0);
        }

        hits
    }

    /// Similarity scan with the soft deadline. Results are sorted ascending
    /// by distance; on deadline the partial set scanned so far is returned.
    fn scan(
        &self,
        embedding: &AtmosphericVector,
        k: usize,
        min_similarity: f32,
        bbox: Option<(f64, f64, f64, f64)>,
        filters: Option<&VibeFilters>,
    ) -> Vec<Hit> {
        if self.is_degraded() {
            log::warn!("vector - Query on degraded store");
            return Vec::new();
        }

        let max_distance = 1.0 - min_similarity;
        let started = Instant::now();
        let index = self.index.read().expect("vector index lock");

        let mut scored: Vec<(f32, &AtmosphericPattern)> = Vec::new();
        for (scanned, pattern) in index.values().enumerate() {
            if scanned % DEADLINE_STRIDE == DEADLINE_STRIDE - 1
                && started.elapsed().as_millis() as u64 > self.query_deadline_ms
            {
                log::warn!("vector - Query deadline exceeded after {} of {}", scanned, index.len());
                break;
            }

            if let Some((lat_min, lat_max, lon_min, lon_max)) = bbox {
                if pattern.lat < lat_min || pattern.lat > lat_max || pattern.lon < lon_min || pattern.lon > lon_max {
                    continue;
                }
            }
            if let Some(filters) = filters {
                if !vibe_matches(pattern, filters) {
                    continue;
                }
            }

            let distance = 1.0 - cosine_similarity(embedding.components(), pattern.embedding.components());
            if distance <= max_distance {
                scored.push((distance, pattern));
            }
        }

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(distance, pattern)| Hit {
                pattern: pattern.clone(),
                similarity: 1.0 - distance,
                distance_nm: None,
                age_hours: None,
            })
            .collect()
    }

    /// Writes the index when dirty. Atomic via tempfile rename.
    pub fn flush(&self) -> Result<(), VectorStoreError> {
        if self.is_degraded() {
            return Err(VectorStoreError::DegradedMode());
        }
        let path = match &self.index_file {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let patterns: Vec<AtmosphericPattern> = {
            let index = self.index.read().expect("vector index lock");
            index.values().cloned().collect()
        };

        let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let file = tempfile::NamedTempFile::new_in(&dir)?;
        {
            let mut writer = std::io::BufWriter::new(file.as_file());
            serde_json::to_writer(&mut writer, &patterns)?;
            std::io::Write::flush(&mut writer)?;
        }
        file.persist(&path).map_err(|e| e.error)?;

        log::debug!("vector - Flushed {} patterns to {:?}", patterns.len(), path);

        Ok(())
    }
}

fn vibe_matches(pattern: &AtmosphericPattern, filters: &VibeFilters) -> bool {
    if let Some((start_ms, end_ms)) = filters.time_range_ms {
        if pattern.timestamp_ms < start_ms || pattern.timestamp_ms > end_ms {
            return false;
        }
    }
    if let Some(sources) = &filters.sources {
        if !sources.contains(&pattern.source) {
            return false;
        }
    }
    if let Some(substring) = &filters.outcome_substring {
        match &pattern.outcome {
            Some(outcome) if outcome.to_lowercase().contains(&substring.to_lowercase()) => {}
            _ => return false,
        }
    }

    true
}

/// Great-circle distance in nautical miles.
pub fn haversine_nm(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_NM * c
}

/// Periodic dirty-index flush. Suspended while the emergency machine holds
/// the `pattern_indexing` task.
pub async fn run_flush(
    store: std::sync::Arc<VectorStore>,
    interval_secs: u64,
    emergency: crate::emergency::SharedEmergency,
) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(interval_secs.max(1))).await;

        if crate::emergency::is_task_suspended(&emergency, crate::emergency::TASK_PATTERN_INDEXING) {
            continue;
        }
        if let Err(e) = store.flush() {
            log::error!("vector - Error flushing index : {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn pattern(id: &str, lat: f64, lon: f64, components: &[f32]) -> AtmosphericPattern {
        let mut embedding = [0.0f32; crate::embedding::WIDTH];
        embedding[..components.len()].copy_from_slice(components);

        AtmosphericPattern {
            id: id.to_string(),
            embedding: AtmosphericVector(embedding),
            timestamp_ms: 1_700_000_000_000,
            lat,
            lon,
            label: None,
            outcome: None,
            source: PatternSource::Observation,
        }
    }

    #[test]
    fn put_then_query_returns_the_stored_id_first() {
        let store = VectorStore::in_memory();
        store.put(pattern("a", 0.0, 0.0, &[0.1, -0.4, 0.2])).unwrap();
        store.put(pattern("b", 0.0, 0.0, &[-0.8, 0.1, 0.7])).unwrap();

        let query = pattern("q", 0.0, 0.0, &[0.1, -0.4, 0.2]).embedding;
        let hits = store.query_similar(&query, 1, 0.0);

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.id, "a");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn put_is_an_upsert() {
        let store = VectorStore::in_memory();
        store.put(pattern("a", 0.0, 0.0, &[1.0])).unwrap();
        let mut replacement = pattern("a", 10.0, 20.0, &[0.0, 1.0]);
        replacement.label = Some("updated".to_string());
        store.put(replacement).unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get("a").unwrap();
        assert_eq!(stored.lat, 10.0);
        assert_eq!(stored.label.as_deref(), Some("updated"));
    }

    #[test]
    fn min_similarity_filters_hits() {
        let store = VectorStore::in_memory();
        store.put(pattern("aligned", 0.0, 0.0, &[1.0, 0.0])).unwrap();
        store.put(pattern("orthogonal", 0.0, 0.0, &[0.0, 1.0])).unwrap();

        let query = pattern("q", 0.0, 0.0, &[1.0, 0.0]).embedding;
        let hits = store.query_similar(&query, 10, 0.5);

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.id, "aligned");
    }

    #[test]
    fn nearby_query_respects_the_box_and_computes_haversine() {
        let store = VectorStore::in_memory();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for i in 0..10_000 {
            let lat: f64 = rng.gen_range(-80.0..80.0);
            let lon: f64 = rng.gen_range(-180.0..180.0);
            store.put(pattern(&format!("p{}", i), lat, lon, &[0.5, -0.5, 0.25])).unwrap();
        }
        store.put(pattern("near", 3.0, 4.0, &[0.5, -0.5, 0.25])).unwrap();

        let query = pattern("q", 0.0, 0.0, &[0.5, -0.5, 0.25]).embedding;
        let hits = store.query_nearby(&query, 0.0, 0.0, 5.0, 10_000, 0.6);

        assert!(!hits.is_empty());
        for hit in &hits {
            assert!(hit.pattern.lat.abs() <= 5.0 && hit.pattern.lon.abs() <= 5.0);
        }
        let near = hits.iter().find(|hit| hit.pattern.id == "near").unwrap();
        let distance = near.distance_nm.unwrap();
        assert!((distance - 300.0).abs() <= 2.0, "distance {}", distance);

        // Sorted ascending by distance, i.e. best similarity first.
        for window in hits.windows(2) {
            assert!(window[0].similarity >= window[1].similarity);
        }
    }

    #[test]
    fn vibe_search_applies_every_filter() {
        let store = VectorStore::in_memory();

        let mut squall = pattern("squall", 10.0, -60.0, &[0.3, 0.3]);
        squall.timestamp_ms = 1_000_000;
        squall.outcome = Some("Squall line passed with 40kt gusts".to_string());
        squall.source = PatternSource::GridFleet;
        store.put(squall).unwrap();

        let mut calm = pattern("calm", 10.5, -60.5, &[0.3, 0.3]);
        calm.timestamp_ms = 1_000_000;
        calm.outcome = Some("No event".to_string());
        calm.source = PatternSource::GridFleet;
        store.put(calm).unwrap();

        let mut far = pattern("far", 45.0, 10.0, &[0.3, 0.3]);
        far.timestamp_ms = 1_000_000;
        far.outcome = Some("Squall".to_string());
        far.source = PatternSource::GridFleet;
        store.put(far).unwrap();

        let query = pattern("q", 0.0, 0.0, &[0.3, 0.3]).embedding;
        let filters = VibeFilters {
            bbox: Some((5.0, 15.0, -65.0, -55.0)),
            time_range_ms: Some((0, 2_000_000)),
            sources: Some(vec![PatternSource::GridFleet]),
            outcome_substring: Some("squall".to_string()),
            limit: 10,
        };
        let hits = store.vibe_search_at(&query, &filters, 8_200_000);

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.id, "squall");
        assert!((hits[0].age_hours.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn degraded_store_accepts_puts_and_returns_empty_queries() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let config = VectorConfig {
            index_file: blocker.join("index.json").to_string_lossy().to_string(),
            ..VectorConfig::default()
        };
        let store = VectorStore::new(&config);
        assert!(matches!(store.init(), Err(VectorStoreError::DegradedMode())));
        assert!(store.is_degraded());

        store.put(pattern("a", 0.0, 0.0, &[1.0])).unwrap();
        assert_eq!(store.len(), 1);

        let query = pattern("q", 0.0, 0.0, &[1.0]).embedding;
        assert!(store.query_similar(&query, 5, 0.0).is_empty());
    }

    #[test]
    fn flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = VectorConfig {
            index_file: dir.path().join("patterns.json").to_string_lossy().to_string(),
            ..VectorConfig::default()
        };

        let store = VectorStore::new(&config);
        store.init().unwrap();
        store.init().unwrap(); // idempotent
        store.put(pattern("keep", 1.0, 2.0, &[0.4, 0.1])).unwrap();
        store.flush().unwrap();

        let reloaded = VectorStore::new(&config);
        reloaded.init().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("keep").unwrap().lat, 1.0);
    }

    #[test]
    fn haversine_five_degrees_is_three_hundred_nm() {
        let distance = haversine_nm(0.0, 0.0, 3.0, 4.0);

        assert!((distance - 300.0).abs() <= 2.0, "distance {}", distance);
    }
}
