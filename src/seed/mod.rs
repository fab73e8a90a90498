pub mod codec;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use http::StatusCode;
use serde::{Serialize, Deserialize};
use tokio::sync::{mpsc, broadcast, RwLock};
use crate::config::{SeedConfig, SeedFetchConfig};
use crate::emergency::{SharedEmergency, TASK_SEED_PREFETCH};
use crate::engine::{CoreEvent, EngineEvent};

pub const VAR_U10: &str = "u10";
pub const VAR_V10: &str = "v10";
pub const VAR_PRESSURE: &str = "pressure_msl";

pub const SEED_EXTENSION: &str = "seed.zst";

#[derive(thiserror::Error, Debug)]
pub enum SeedError {
    #[error("Header({0})")]
    Header(String),

    #[error("Version({0})")]
    Version(u16),

    #[error("Shape({0})")]
    Shape(String),

    #[error("UnknownEncoding({0})")]
    UnknownEncoding(u8),

    #[error("Truncated")]
    Truncated(),

    #[error("OutOfRange({0})")]
    OutOfRange(String),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
}

/// Decoded forecast artifact. The buffer is owned here for the lifetime of
/// the handle; consumers share it through `Arc<Seed>`.
#[derive(Debug, Clone)]
pub struct Seed {
    pub seed_id: String,
    pub model_source: String,
    pub forecast_start_time_ms: i64,
    /// Valid times, ascending.
    pub time_steps_ms: Vec<i64>,
    /// Grid axes. Possibly irregular, ascending or descending.
    pub latitudes: Vec<f32>,
    pub longitudes: Vec<f32>,
    pub variables: BTreeMap<String, Values>,
}

#[derive(Debug, Clone)]
pub enum Values {
    Raw(Vec<f32>),
    Quantized { q: Vec<i16>, scale: f32, offset: f32 },
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::Raw(values) => values.len(),
            Values::Quantized { q, .. } => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialized value at `i`. Quantized blocks dequantize on the fly.
    pub fn get(&self, i: usize) -> f32 {
        match self {
            Values::Raw(values) => values[i],
            Values::Quantized { q, scale, offset } => offset + q[i] as f32 * scale,
        }
    }

    /// Streaming materialization, one multiply-add per quantized value.
    pub fn iter(&self) -> Box<dyn Iterator<Item = f32> + '_> {
        match self {
            Values::Raw(values) => Box::new(values.iter().copied()),
            Values::Quantized { q, scale, offset } => {
                Box::new(codec::DequantIter::new(q.iter().copied(), *scale, *offset))
            }
        }
    }
}

impl Seed {
    /// Decompresses and decodes a `.seed.zst` artifact.
    pub fn open(bytes: &[u8]) -> Result<Seed, SeedError> {
        let raw = zstd::decode_all(bytes).map_err(|e| SeedError::Header(format!("zstd: {}", e)))?;

        codec::decode(&raw)
    }

    /// The zstd-framed wire form of this seed.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SeedError> {
        Ok(zstd::encode_all(&codec::encode(self)[..], 3)?)
    }

    pub fn list_variables(&self) -> Vec<&str> {
        self.variables.keys().map(|name| name.as_str()).collect()
    }

    /// Nearest-neighbor sample of `var` at the given time step and position.
    pub fn sample(&self, var: &str, time_idx: usize, lat: f64, lon: f64) -> Result<f32, SeedError> {
        let values = self
            .variables
            .get(var)
            .ok_or_else(|| SeedError::OutOfRange(format!("unknown variable `{}`", var)))?;

        if time_idx >= self.time_steps_ms.len() {
            return Err(SeedError::OutOfRange(format!("time index {} of {}", time_idx, self.time_steps_ms.len())));
        }
        let lat_idx = nearest_index(&self.latitudes, lat as f32)
            .ok_or_else(|| SeedError::OutOfRange(String::from("empty latitude axis")))?;
        let lon_idx = nearest_index(&self.longitudes, lon as f32)
            .ok_or_else(|| SeedError::OutOfRange(String::from("empty longitude axis")))?;

        Ok(values.get(self.flat_index(time_idx, lat_idx, lon_idx)))
    }

    /// Index of the time step nearest to `target_ms`; ties break to earlier.
    pub fn timestep_index_for(&self, target_ms: i64) -> usize {
        let mut best = 0;
        let mut best_delta = i64::MAX;

        for (i, step) in self.time_steps_ms.iter().enumerate() {
            let delta = (target_ms - step).abs();
            if delta < best_delta {
                best = i;
                best_delta = delta;
            }
        }

        best
    }

    /// One `(lat, lon, u10, v10, valid_time)` tuple per grid cell.
    pub fn wind_points(&self, time_idx: usize) -> Result<WindPoints<'_>, SeedError> {
        let u = self
            .variables
            .get(VAR_U10)
            .ok_or_else(|| SeedError::OutOfRange(format!("unknown variable `{}`", VAR_U10)))?;
        let v = self
            .variables
            .get(VAR_V10)
            .ok_or_else(|| SeedError::OutOfRange(format!("unknown variable `{}`", VAR_V10)))?;
        if time_idx >= self.time_steps_ms.len() {
            return Err(SeedError::OutOfRange(format!("time index {} of {}", time_idx, self.time_steps_ms.len())));
        }

        Ok(WindPoints {
            seed: self,
            u,
            v,
            base: time_idx * self.latitudes.len() * self.longitudes.len(),
            timestamp_ms: self.time_steps_ms[time_idx],
            pos: 0,
        })
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.forecast_start_time_ms
    }

    pub fn freshness(&self, now_ms: i64, buckets_h: (i64, i64)) -> Freshness {
        let age_h = self.age_ms(now_ms) / 3_600_000;

        if age_h < buckets_h.0 {
            Freshness::Fresh
        } else if age_h < buckets_h.1 {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    fn flat_index(&self, time_idx: usize, lat_idx: usize, lon_idx: usize) -> usize {
        (time_idx * self.latitudes.len() + lat_idx) * self.longitudes.len() + lon_idx
    }
}

fn nearest_index(axis: &[f32], target: f32) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;

    for (i, value) in axis.iter().enumerate() {
        let delta = (target - value).abs();
        match best {
            Some((_, best_delta)) if delta >= best_delta => {}
            _ => best = Some((i, delta)),
        }
    }

    best.map(|(i, _)| i)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindPoint {
    pub lat: f32,
    pub lon: f32,
    pub u10: f32,
    pub v10: f32,
    pub timestamp_ms: i64,
}

pub struct WindPoints<'a> {
    seed: &'a Seed,
    u: &'a Values,
    v: &'a Values,
    base: usize,
    timestamp_ms: i64,
    pos: usize,
}

impl<'a> Iterator for WindPoints<'a> {
    type Item = WindPoint;

    fn next(&mut self) -> Option<WindPoint> {
        let n_lon = self.seed.longitudes.len();
        if n_lon == 0 || self.pos >= self.seed.latitudes.len() * n_lon {
            return None;
        }

        let flat = self.base + self.pos;
        let point = WindPoint {
            lat: self.seed.latitudes[self.pos / n_lon],
            lon: self.seed.longitudes[self.pos % n_lon],
            u10: self.u.get(flat),
            v10: self.v.get(flat),
            timestamp_ms: self.timestamp_ms,
        };
        self.pos += 1;

        Some(point)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "fresh"),
            Freshness::Stale => write!(f, "stale"),
            Freshness::Expired => write!(f, "expired"),
        }
    }
}

/// Holder of the live forecast handle. Rotation swaps the `Arc` atomically;
/// readers in the engine hot path never block on a rotation in progress.
pub struct SeedStore {
    current: RwLock<Option<Arc<Seed>>>,
}

impl SeedStore {
    pub fn new() -> Self {
        Self { current: RwLock::new(None) }
    }

    pub async fn current(&self) -> Option<Arc<Seed>> {
        self.current.read().await.clone()
    }

    /// Non-blocking read for the engine loop. A rotation in progress yields
    /// `None` and the caller proceeds without a truth check.
    pub fn try_current(&self) -> Option<Arc<Seed>> {
        match self.current.try_read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    pub async fn rotate(&self, seed: Arc<Seed>) {
        let mut current = self.current.write().await;
        *current = Some(seed);
    }
}

impl Default for SeedStore {
    fn default() -> Self {
        Self::new()
    }
}

enum ScanOutcome {
    Loaded { seed_id: String, forecast_start_time_ms: i64 },
    Bad,
}

/// Watches the seed directory, rotates the live handle when a newer artifact
/// appears, and deletes expired artifacts.
pub struct SeedWatcher {
    store: Arc<SeedStore>,
    config: SeedConfig,
    engine_tx: mpsc::Sender<EngineEvent>,
    events: broadcast::Sender<CoreEvent>,
    seen: HashMap<PathBuf, ScanOutcome>,
}

impl SeedWatcher {
    pub fn new(
        store: Arc<SeedStore>,
        config: SeedConfig,
        engine_tx: mpsc::Sender<EngineEvent>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self { store, config, engine_tx, events, seen: HashMap::new() }
    }

    pub async fn run(mut self) {
        log::info!("seed - Start watcher on {}", self.config.dir);

        loop {
            if let Err(e) = self.scan_once(chrono::Utc::now().timestamp_millis()).await {
                log::error!("seed - Error scanning {} : {:?}", self.config.dir, e);
            }
            self.clean(chrono::Utc::now().timestamp_millis()).await;
            tokio::time::sleep(std::time::Duration::from_secs(self.config.scan_interval_secs)).await;
        }
    }

    pub(crate) async fn scan_once(&mut self, now_ms: i64) -> crate::error::Result<()> {
        let dir = PathBuf::from(&self.config.dir);
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_seed_file(&path) || self.seen.contains_key(&path) {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            match Seed::open(&bytes) {
                Ok(seed) => {
                    log::info!("seed - Loaded `{}` from {:?} ({} steps)", seed.seed_id, path, seed.time_steps_ms.len());
                    self.seen.insert(
                        path,
                        ScanOutcome::Loaded {
                            seed_id: seed.seed_id.clone(),
                            forecast_start_time_ms: seed.forecast_start_time_ms,
                        },
                    );
                    self.maybe_rotate(Arc::new(seed), now_ms).await;
                }
                Err(e) => {
                    // Keep the previous handle; a bad artifact is not retried.
                    log::warn!("seed - Error decoding {:?} : {:?}", path, e);
                    self.seen.insert(path, ScanOutcome::Bad);
                }
            }
        }

        Ok(())
    }

    async fn maybe_rotate(&self, seed: Arc<Seed>, now_ms: i64) {
        let current = self.store.current().await;
        let newer = match &current {
            Some(current) => {
                seed.seed_id != current.seed_id && seed.forecast_start_time_ms >= current.forecast_start_time_ms
            }
            None => true,
        };
        if !newer {
            return;
        }

        let freshness = seed.freshness(now_ms, self.config.freshness_buckets_h);
        self.store.rotate(seed.clone()).await;

        let _ = self.events.send(CoreEvent::SeedStateChanged { freshness });
        if let Err(e) = self.engine_tx.send(EngineEvent::SeedRotated(seed)).await {
            log::error!("seed - Error notifying engine : {}", e);
        }
    }

    async fn clean(&mut self, now_ms: i64) {
        let expired_ms = self.config.freshness_buckets_h.1 * 3_600_000;
        let mut removed = Vec::new();

        for (path, outcome) in &self.seen {
            if let ScanOutcome::Loaded { seed_id, forecast_start_time_ms } = outcome {
                if now_ms - forecast_start_time_ms >= expired_ms {
                    log::info!("seed - Delete expired `{}` {:?}", seed_id, path);
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => removed.push(path.clone()),
                        Err(e) => log::error!("seed - Error removing {:?} : {}", path, e),
                    }
                }
            }
        }

        for path in removed {
            self.seen.remove(&path);
        }
    }
}

fn is_seed_file(path: &Path) -> bool {
    path.to_string_lossy().ends_with(SEED_EXTENSION)
}

/// Downloads the regional seed from the satellite gateway into the watched
/// directory. Rotation stays with the watcher.
pub struct SeedFetcher {
    config: SeedFetchConfig,
    dir: PathBuf,
    client: reqwest::Client,
    emergency: SharedEmergency,
}

impl SeedFetcher {
    pub fn new(config: SeedFetchConfig, dir: &str, emergency: SharedEmergency) -> Self {
        Self {
            config,
            dir: PathBuf::from(dir),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
            emergency,
        }
    }

    pub async fn run(self) {
        let url = match (&self.config.enabled, &self.config.url) {
            (true, Some(url)) => url.clone(),
            _ => return,
        };
        log::info!("seed - Start fetcher for {}", url);

        loop {
            tokio::time::sleep(std::time::Duration::from_secs(self.config.interval_secs.max(60))).await;

            if crate::emergency::is_task_suspended(&self.emergency, TASK_SEED_PREFETCH) {
                log::debug!("seed - Prefetch suspended");
                continue;
            }

            match self.fetch(&url).await {
                Ok(Some(seed_id)) => log::info!("seed - Fetched `{}`", seed_id),
                Ok(None) => log::debug!("seed - Nothing new"),
                Err(e) => log::warn!("seed - Error fetching {} : {:?}", url, e),
            }
        }
    }

    async fn fetch(&self, url: &str) -> crate::error::Result<Option<String>> {
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let bytes = response.bytes().await?;
                let seed = Seed::open(bytes.as_ref())?;

                let target = self.dir.join(format!("{}.{}", seed.seed_id, SEED_EXTENSION));
                if target.exists() {
                    return Ok(None);
                }

                tokio::fs::create_dir_all(&self.dir).await?;
                let file = tempfile::NamedTempFile::new_in(&self.dir)?;
                std::io::Write::write_all(&mut file.as_file(), bytes.as_ref())?;
                file.persist(&target).map_err(|e| e.error)?;

                Ok(Some(seed.seed_id))
            }
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(None),
            status => {
                log::warn!("seed - Fetch failed : {}", status);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CoreEvent, EngineEvent};

    fn grid_seed(start_ms: i64, seed_id: &str) -> Seed {
        // Two hourly steps over a 3x4 grid with descending latitudes.
        let latitudes = vec![12.5, 12.0, 11.5];
        let longitudes = vec![-61.0, -60.5, -60.0, -59.5];
        let count = 2 * latitudes.len() * longitudes.len();

        let mut u10 = Vec::with_capacity(count);
        let mut v10 = Vec::with_capacity(count);
        let mut pressure = Vec::with_capacity(count);
        for i in 0..count {
            u10.push((-3000 + (i as i32 * 250) % 6000) as i16);
            v10.push((1000 - (i as i32 * 125) % 2000) as i16);
            pressure.push(101_300.0 - i as f32 * 20.0);
        }

        let mut variables = BTreeMap::new();
        variables.insert(VAR_U10.to_string(), Values::Quantized { q: u10, scale: 0.01, offset: 0.0 });
        variables.insert(VAR_V10.to_string(), Values::Quantized { q: v10, scale: 0.01, offset: 0.0 });
        variables.insert(VAR_PRESSURE.to_string(), Values::Raw(pressure));

        Seed {
            seed_id: seed_id.to_string(),
            model_source: "ECMWF-AIFS-28km".to_string(),
            forecast_start_time_ms: start_ms,
            time_steps_ms: vec![start_ms, start_ms + 3_600_000],
            latitudes,
            longitudes,
            variables,
        }
    }

    #[test]
    fn open_round_trips_through_zstd() {
        let seed = grid_seed(1_753_855_200_000, "seed-a");
        let reopened = Seed::open(&seed.to_bytes().unwrap()).unwrap();

        assert_eq!(reopened.seed_id, "seed-a");
        assert_eq!(reopened.list_variables(), vec![VAR_PRESSURE, VAR_U10, VAR_V10]);
        for variable in reopened.variables.values() {
            assert_eq!(variable.len(), 2 * 3 * 4);
            assert_eq!(variable.iter().count(), variable.len());
        }
    }

    #[test]
    fn sample_picks_the_nearest_cell_on_a_descending_axis() {
        let seed = grid_seed(0, "seed-a");

        // 12.1 is nearest 12.0 (index 1), -60.4 nearest -60.5 (index 1).
        let sampled = seed.sample(VAR_PRESSURE, 0, 12.1, -60.4).unwrap();
        let flat = 1 * seed.longitudes.len() + 1;
        assert_eq!(sampled, 101_300.0 - flat as f32 * 20.0);
    }

    #[test]
    fn sample_rejects_unknown_variable_and_bad_time() {
        let seed = grid_seed(0, "seed-a");

        assert!(matches!(seed.sample("t2m", 0, 12.0, -60.0), Err(SeedError::OutOfRange(_))));
        assert!(matches!(seed.sample(VAR_U10, 9, 12.0, -60.0), Err(SeedError::OutOfRange(_))));
    }

    #[test]
    fn quantized_samples_reproduce_winds_within_half_scale() {
        // u10 spanning -30..30 m/s at 0.01 scale must sample back within 0.005.
        let mut seed = grid_seed(0, "seed-a");
        let count = 2 * 3 * 4;
        let originals: Vec<f32> = (0..count).map(|i| -30.0 + 60.0 * i as f32 / (count - 1) as f32).collect();
        let q: Vec<i16> = originals.iter().map(|v| (v / 0.01).round() as i16).collect();
        seed.variables.insert(VAR_U10.to_string(), Values::Quantized { q, scale: 0.01, offset: 0.0 });

        let reopened = Seed::open(&seed.to_bytes().unwrap()).unwrap();
        for (i, original) in originals.iter().enumerate() {
            let time_idx = i / 12;
            let lat = reopened.latitudes[(i % 12) / 4];
            let lon = reopened.longitudes[i % 4];
            let sampled = reopened.sample(VAR_U10, time_idx, lat as f64, lon as f64).unwrap();
            assert!((sampled - original).abs() <= 0.005, "cell {} : {} vs {}", i, sampled, original);
        }
    }

    #[test]
    fn timestep_index_ties_break_to_earlier() {
        let seed = grid_seed(0, "seed-a");

        assert_eq!(seed.timestep_index_for(-5), 0);
        assert_eq!(seed.timestep_index_for(1_800_000), 0); // exact midpoint
        assert_eq!(seed.timestep_index_for(1_800_001), 1);
        assert_eq!(seed.timestep_index_for(9_000_000), 1);
    }

    #[test]
    fn wind_points_cover_every_cell() {
        let seed = grid_seed(0, "seed-a");

        let points: Vec<WindPoint> = seed.wind_points(1).unwrap().collect();
        assert_eq!(points.len(), 3 * 4);
        assert!(points.iter().all(|p| p.timestamp_ms == 3_600_000));

        let flat = 12 + 5; // time 1, lat index 1, lon index 1
        assert_eq!(points[5].lat, 12.0);
        assert_eq!(points[5].lon, -60.5);
        assert_eq!(points[5].u10, seed.variables[VAR_U10].get(flat));
        assert_eq!(points[5].v10, seed.variables[VAR_V10].get(flat));
    }

    #[test]
    fn freshness_buckets_are_monotonic() {
        let seed = grid_seed(0, "seed-a");

        assert_eq!(seed.freshness(3_600_000, (6, 12)), Freshness::Fresh);
        assert_eq!(seed.freshness(6 * 3_600_000, (6, 12)), Freshness::Stale);
        assert_eq!(seed.freshness(12 * 3_600_000, (6, 12)), Freshness::Expired);
    }

    #[tokio::test]
    async fn watcher_rotates_to_the_newest_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SeedStore::new());
        let (engine_tx, mut engine_rx) = mpsc::channel(8);
        let (events, mut events_rx) = broadcast::channel(8);

        let older = grid_seed(1_000_000, "seed-old");
        let newer = grid_seed(8 * 3_600_000, "seed-new");
        std::fs::write(dir.path().join("a.seed.zst"), older.to_bytes().unwrap()).unwrap();
        std::fs::write(dir.path().join("b.seed.zst"), newer.to_bytes().unwrap()).unwrap();
        std::fs::write(dir.path().join("junk.seed.zst"), b"not a seed").unwrap();

        let config = SeedConfig { dir: dir.path().to_string_lossy().to_string(), ..SeedConfig::default() };
        let mut watcher = SeedWatcher::new(store.clone(), config, engine_tx, events);
        watcher.scan_once(9 * 3_600_000).await.unwrap();

        let current = store.current().await.unwrap();
        assert_eq!(current.seed_id, "seed-new");

        // At least one rotation reached both channels; the last one wins.
        let mut rotated = None;
        while let Ok(event) = engine_rx.try_recv() {
            if let EngineEvent::SeedRotated(seed) = event {
                rotated = Some(seed.seed_id.clone());
            }
        }
        assert_eq!(rotated.as_deref(), Some("seed-new"));
        assert!(matches!(events_rx.try_recv(), Ok(CoreEvent::SeedStateChanged { .. })));
    }

    #[tokio::test]
    async fn watcher_keeps_previous_handle_on_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SeedStore::new());
        let (engine_tx, _engine_rx) = mpsc::channel(8);
        let (events, _events_rx) = broadcast::channel(8);

        std::fs::write(dir.path().join("good.seed.zst"), grid_seed(0, "seed-good").to_bytes().unwrap()).unwrap();

        let config = SeedConfig { dir: dir.path().to_string_lossy().to_string(), ..SeedConfig::default() };
        let mut watcher = SeedWatcher::new(store.clone(), config, engine_tx, events);
        watcher.scan_once(1_000).await.unwrap();
        assert_eq!(store.current().await.unwrap().seed_id, "seed-good");

        std::fs::write(dir.path().join("bad.seed.zst"), b"garbage").unwrap();
        watcher.scan_once(2_000).await.unwrap();

        assert_eq!(store.current().await.unwrap().seed_id, "seed-good");
    }

    #[tokio::test]
    async fn clean_removes_expired_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SeedStore::new());
        let (engine_tx, _engine_rx) = mpsc::channel(8);
        let (events, _events_rx) = broadcast::channel(8);

        let path = dir.path().join("old.seed.zst");
        std::fs::write(&path, grid_seed(0, "seed-old").to_bytes().unwrap()).unwrap();

        let config = SeedConfig { dir: dir.path().to_string_lossy().to_string(), ..SeedConfig::default() };
        let mut watcher = SeedWatcher::new(store.clone(), config, engine_tx, events);
        watcher.scan_once(1_000).await.unwrap();
        watcher.clean(13 * 3_600_000).await;

        assert!(!path.exists());
    }
}
