// Where race data comes from. The pipeline only sees the `DataSource` trait; which concrete
// source answered a request is logged, never visible in the returned data.

use crate::data::{read_laps, read_qualifying, read_results, read_telemetry, RaceData, TelemetryFile};
use crate::error::{DataUnavailableError, SourceError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub const TELEMETRY_FILE: &str = "telemetry.csv";
pub const RESULTS_FILE: &str = "results.csv";
pub const QUALIFYING_FILE: &str = "qualifying.csv";
pub const LAPS_FILE: &str = "laps.csv";

/// One race: `<track>/<race>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RaceKey {
    pub track: String,
    pub race: String,
}

impl RaceKey {
    pub fn new(track: impl Into<String>, race: impl Into<String>) -> Self {
        Self { track: track.into(), race: race.into() }
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.track, self.race)
    }
}

pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn races(&self) -> Result<Vec<RaceKey>, SourceError>;

    fn get_race(&self, key: &RaceKey) -> Result<RaceData, SourceError>;

    fn get_telemetry(&self, track: &str, race: &str) -> Result<TelemetryFile, SourceError> {
        let key = RaceKey::new(track, race);
        self.get_race(&key)?.telemetry.ok_or_else(|| SourceError::NotFound(format!("telemetry for {}", key.id())))
    }

    /// Every car number that appears in any race result.
    fn get_drivers(&self) -> Result<Vec<u32>, SourceError> {
        let mut drivers = BTreeSet::new();
        for key in self.races()? {
            drivers.extend(self.get_race(&key)?.results.iter().map(|r| r.number));
        }
        Ok(drivers.into_iter().collect())
    }
}

/// `<root>/<track>/<race>/{telemetry,results,qualifying,laps}.csv`. Only `results.csv` is required.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn race_dir(&self, key: &RaceKey) -> PathBuf {
        self.root.join(&key.track).join(&key.race)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<String>, SourceError> {
    let entries = fs::read_dir(dir).map_err(|source| SourceError::Io { path: dir.to_path_buf(), source })?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SourceError::Io { path: dir.to_path_buf(), source })?;
        if entry.path().is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}

impl DataSource for LocalFileSource {
    fn name(&self) -> &str {
        "local files"
    }

    fn races(&self) -> Result<Vec<RaceKey>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::NotFound(format!("data root {}", self.root.display())));
        }
        let mut keys = Vec::new();
        for track in subdirs(&self.root)? {
            for race in subdirs(&self.root.join(&track))? {
                let key = RaceKey::new(track.clone(), race);
                if self.race_dir(&key).join(RESULTS_FILE).is_file() {
                    keys.push(key);
                } else {
                    debug!(race = %key.id(), "directory without results skipped");
                }
            }
        }
        Ok(keys)
    }

    fn get_race(&self, key: &RaceKey) -> Result<RaceData, SourceError> {
        let dir = self.race_dir(key);
        let results_path = dir.join(RESULTS_FILE);
        if !results_path.is_file() {
            return Err(SourceError::NotFound(format!("results for {}", key.id())));
        }
        let optional = |name: &str| Some(dir.join(name)).filter(|p| p.is_file());

        let telemetry = match optional(TELEMETRY_FILE).map(read_telemetry).transpose() {
            Ok(t) => t,
            // an unkeyable telemetry export costs the race its telemetry features, not the race
            Err(SourceError::Malformed(err)) => {
                warn!(race = %key.id(), %err, "telemetry file unusable; telemetry features missing for this race");
                None
            }
            Err(e) => return Err(e),
        };
        let qualifying = optional(QUALIFYING_FILE).map(read_qualifying).transpose()?.unwrap_or_default();
        let laps = optional(LAPS_FILE).map(read_laps).transpose()?.unwrap_or_default();
        Ok(RaceData { race_id: key.id(), telemetry, results: read_results(&results_path)?, qualifying, laps })
    }
}

/// In-memory copy of previously loaded races. Created once and passed around explicitly;
/// nothing refreshes it behind the caller's back.
#[derive(Debug, Default)]
pub struct DataCache {
    races: RwLock<BTreeMap<RaceKey, RaceData>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, key: RaceKey, data: RaceData) {
        self.races.write().unwrap_or_else(|e| e.into_inner()).insert(key, data);
    }

    pub fn len(&self) -> usize {
        self.races.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the whole cache with a fresh read of `from`. On error the old contents stay.
    pub fn reload(&self, from: &dyn DataSource) -> Result<usize, SourceError> {
        let mut fresh = BTreeMap::new();
        for key in from.races()? {
            let data = from.get_race(&key)?;
            fresh.insert(key, data);
        }
        let count = fresh.len();
        *self.races.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!(source = from.name(), races = count, "data cache reloaded");
        Ok(count)
    }
}

impl DataSource for DataCache {
    fn name(&self) -> &str {
        "memory cache"
    }

    fn races(&self) -> Result<Vec<RaceKey>, SourceError> {
        Ok(self.races.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect())
    }

    fn get_race(&self, key: &RaceKey) -> Result<RaceData, SourceError> {
        self.races
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("{} in cache", key.id())))
    }
}

/// Tries each source in order, then the cache. Successful reads refresh the cache.
/// When everything fails the caller gets `DataUnavailableError`, never empty data.
pub struct FallbackSource {
    chain: Vec<Arc<dyn DataSource>>,
    cache: Option<Arc<DataCache>>,
}

impl FallbackSource {
    pub fn new(chain: Vec<Arc<dyn DataSource>>, cache: Option<Arc<DataCache>>) -> Self {
        Self { chain, cache }
    }

    fn attempt<T>(
        &self,
        request: String,
        mut call: impl FnMut(&dyn DataSource) -> Result<T, SourceError>,
        mut remember: impl FnMut(&DataCache, &T),
    ) -> Result<T, SourceError> {
        let mut attempts = Vec::new();
        for source in &self.chain {
            match call(source.as_ref()) {
                Ok(v) => {
                    if let Some(cache) = &self.cache {
                        remember(cache, &v);
                    }
                    return Ok(v);
                }
                Err(err) => {
                    warn!(source = source.name(), %request, %err, "data source failed, trying next");
                    attempts.push(format!("{}: {}", source.name(), err));
                }
            }
        }
        if let Some(cache) = &self.cache {
            match call(cache.as_ref()) {
                Ok(v) => {
                    warn!(%request, "serving from memory cache");
                    return Ok(v);
                }
                Err(err) => attempts.push(format!("{}: {}", cache.name(), err)),
            }
        }
        Err(DataUnavailableError { request, attempts }.into())
    }
}

impl DataSource for FallbackSource {
    fn name(&self) -> &str {
        "fallback chain"
    }

    fn races(&self) -> Result<Vec<RaceKey>, SourceError> {
        self.attempt("race list".into(), |s| s.races(), |_, _| {})
    }

    fn get_race(&self, key: &RaceKey) -> Result<RaceData, SourceError> {
        self.attempt(key.id(), |s| s.get_race(key), |cache, data| cache.store(key.clone(), data.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Broken {
        calls: AtomicUsize,
    }

    impl DataSource for Broken {
        fn name(&self) -> &str {
            "warehouse"
        }
        fn races(&self) -> Result<Vec<RaceKey>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::NotFound("connection refused".into()))
        }
        fn get_race(&self, key: &RaceKey) -> Result<RaceData, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::NotFound(key.id()))
        }
    }

    fn race(id: &str) -> RaceData {
        RaceData { race_id: id.into(), telemetry: None, results: Vec::new(), qualifying: Vec::new(), laps: Vec::new() }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("driver_skill_source_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn everything_failing_is_data_unavailable() {
        let fb = FallbackSource::new(
            vec![
                Arc::new(Broken { calls: AtomicUsize::new(0) }) as Arc<dyn DataSource>,
                Arc::new(LocalFileSource::new("/nonexistent/driver_skill")),
            ],
            Some(Arc::new(DataCache::new())),
        );
        match fb.get_race(&RaceKey::new("sonoma", "r1")) {
            Err(SourceError::Unavailable(e)) => {
                assert_eq!(e.request, "sonoma/r1");
                assert_eq!(e.attempts.len(), 3);
            }
            other => panic!("expected DataUnavailableError, got {:?}", other.map(|r| r.race_id)),
        }
    }

    #[test]
    fn cache_serves_when_sources_fail_and_successes_refresh_it() {
        let cache = Arc::new(DataCache::new());
        let key = RaceKey::new("cota", "r2");
        cache.store(key.clone(), race("cota/r2"));
        let broken = Arc::new(Broken { calls: AtomicUsize::new(0) });
        let fb = FallbackSource::new(vec![broken.clone() as Arc<dyn DataSource>], Some(cache.clone()));
        assert_eq!(fb.get_race(&key).unwrap().race_id, "cota/r2");
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);

        let other = Arc::new(DataCache::new());
        other.store(RaceKey::new("vir", "r1"), race("vir/r1"));
        let fb = FallbackSource::new(vec![other as Arc<dyn DataSource>], Some(cache.clone()));
        fb.get_race(&RaceKey::new("vir", "r1")).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn local_source_lists_races_with_results_and_reloads_cache() {
        let root = scratch("local");
        let r1 = root.join("barber").join("r1");
        fs::create_dir_all(&r1).unwrap();
        fs::create_dir_all(root.join("barber").join("empty")).unwrap();
        fs::write(r1.join(RESULTS_FILE), "POSITION;NUMBER;STATUS;LAPS\n1;7;Classified;20\n2;13;Classified;20\n").unwrap();

        let local = LocalFileSource::new(&root);
        assert_eq!(local.races().unwrap(), vec![RaceKey::new("barber", "r1")]);
        assert_eq!(local.get_drivers().unwrap(), vec![7, 13]);
        let data = local.get_race(&RaceKey::new("barber", "r1")).unwrap();
        assert!(data.telemetry.is_none());
        assert!(matches!(local.get_telemetry("barber", "r1"), Err(SourceError::NotFound(_))));

        let cache = DataCache::new();
        assert_eq!(cache.reload(&local).unwrap(), 1);
        assert_eq!(cache.get_drivers().unwrap(), vec![7, 13]);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn unkeyed_telemetry_leaves_race_without_telemetry() {
        let root = scratch("unkeyed");
        let r1 = root.join("sonoma").join("r1");
        fs::create_dir_all(&r1).unwrap();
        fs::write(r1.join(RESULTS_FILE), "POSITION;NUMBER;STATUS;LAPS\n1;7;Classified;20\n").unwrap();
        fs::write(r1.join(TELEMETRY_FILE), "distance,speed\n10.0,120.0\n").unwrap();

        let data = LocalFileSource::new(&root).get_race(&RaceKey::new("sonoma", "r1")).unwrap();
        assert!(data.telemetry.is_none());
        assert_eq!(data.results.len(), 1);
        fs::remove_dir_all(&root).unwrap();
    }
}
