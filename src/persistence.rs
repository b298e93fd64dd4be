use crate::error::{MarketError, MarketResult};
use crate::market::MarketSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const INSTRUMENTS_FILE: &str = "instruments.json";
const LATEST_SNAPSHOT_FILE: &str = "latest_snapshot.json";
const TICKS_FILE: &str = "ticks.jsonl";

/// Durable sink for published snapshots.
pub trait SnapshotStore: Send + Sync {
    fn persist(&self, snapshot: &MarketSnapshot) -> MarketResult<()>;

    fn load_latest(&self) -> MarketResult<Option<MarketSnapshot>>;
}

/// One line of `ticks.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub cycle: u64,
    pub generated_at: DateTime<Utc>,
    pub index_value: f64,
    pub prices: BTreeMap<String, f64>,
}

impl TickRecord {
    fn from_snapshot(snapshot: &MarketSnapshot) -> Self {
        Self {
            cycle: snapshot.cycle,
            generated_at: snapshot.generated_at,
            index_value: snapshot.index.value,
            prices: snapshot
                .states
                .iter()
                .map(|s| (s.symbol.clone(), s.current_price))
                .collect(),
        }
    }
}

/// Runs `op`, retrying once. A second failure is reported as
/// `ServiceUnavailable`.
fn with_retry<T>(what: &str, mut op: impl FnMut() -> MarketResult<T>) -> MarketResult<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!("Writing {} failed ({}), retrying once", what, first);
            op().map_err(|e| MarketError::ServiceUnavailable(format!("{}: {}", what, e)))
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// JSON files
// ──────────────────────────────────────────────────────────────────────────────

/// Stores snapshots under a data directory:
/// `instruments.json` (once), `latest_snapshot.json` (replaced atomically)
/// and `ticks.jsonl` (one line per cycle).
pub struct JsonFileStore {
    dir: PathBuf,
    instruments_written: AtomicBool,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> MarketResult<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            instruments_written: AtomicBool::new(dir.join(INSTRUMENTS_FILE).exists()),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotStore for JsonFileStore {
    fn persist(&self, snapshot: &MarketSnapshot) -> MarketResult<()> {
        if !self.instruments_written.load(Ordering::Relaxed) {
            with_retry(INSTRUMENTS_FILE, || {
                write_json_atomic(&self.dir.join(INSTRUMENTS_FILE), &snapshot.instruments)
            })?;
            self.instruments_written.store(true, Ordering::Relaxed);
        }

        with_retry(LATEST_SNAPSHOT_FILE, || {
            write_json_atomic(&self.dir.join(LATEST_SNAPSHOT_FILE), snapshot)
        })?;

        let record = TickRecord::from_snapshot(snapshot);
        with_retry(TICKS_FILE, || append_jsonl(&self.dir.join(TICKS_FILE), &record))?;

        debug!("Persisted cycle {} to {}", snapshot.cycle, self.dir.display());
        Ok(())
    }

    fn load_latest(&self) -> MarketResult<Option<MarketSnapshot>> {
        let path = self.dir.join(LATEST_SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

/// Writes to a sibling temp file and renames it over `path`, so readers see
/// either the old or the new document.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> MarketResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> MarketResult<()> {
    let line = serde_json::to_string(value)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────────
// In-memory
// ──────────────────────────────────────────────────────────────────────────────

/// Keeps the latest snapshot in memory. Used when no data directory is
/// configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    latest: Mutex<Option<MarketSnapshot>>,
    persisted: Mutex<usize>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Number of snapshots persisted so far.
    pub fn len(&self) -> usize {
        *self.persisted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every subsequent write fail, to exercise degraded mode.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::Relaxed);
    }
}

impl SnapshotStore for MemoryStore {
    fn persist(&self, snapshot: &MarketSnapshot) -> MarketResult<()> {
        with_retry("memory store", || {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(MarketError::Io(std::io::Error::other("store is failing")));
            }
            *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
            *self.persisted.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            Ok(())
        })
    }

    fn load_latest(&self) -> MarketResult<Option<MarketSnapshot>> {
        Ok(self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::market::MarketEngine;
    use crate::registry::InstrumentRegistry;

    fn engine() -> MarketEngine {
        MarketEngine::new(InstrumentRegistry::default_catalog().unwrap(), SimConfig::default()).unwrap()
    }

    #[test]
    fn test_retry_once_then_unavailable() {
        let mut calls = 0;
        let ok = with_retry("flaky", || {
            calls += 1;
            if calls == 1 {
                Err(MarketError::Io(std::io::Error::other("first")))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(ok.unwrap(), 2);

        let mut calls = 0;
        let err = with_retry("broken", || -> MarketResult<()> {
            calls += 1;
            Err(MarketError::Io(std::io::Error::other("always")))
        })
        .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(err, MarketError::ServiceUnavailable(_)));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("data")).unwrap();
        assert!(store.load_latest().unwrap().is_none());

        let mut engine = engine();
        let mut last = None;
        for _ in 0..3 {
            let snapshot = engine.advance_cycle();
            store.persist(&snapshot).unwrap();
            last = Some(snapshot);
        }

        assert!(store.dir().join(INSTRUMENTS_FILE).exists());
        assert!(!store.dir().join("latest_snapshot.json.tmp").exists());
        assert_eq!(store.load_latest().unwrap(), last);

        let ticks: Vec<TickRecord> = std::fs::read_to_string(store.dir().join(TICKS_FILE))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks.iter().map(|t| t.cycle).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(ticks[0].prices.len(), engine.registry().len());
    }

    #[test]
    fn test_reloaded_snapshot_resumes_the_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mut original = engine();
        for _ in 0..40 {
            store.persist(&original.advance_cycle()).unwrap();
        }

        let saved = store.load_latest().unwrap().unwrap();
        assert_eq!(saved.states, original.snapshot().states);

        let mut restarted = engine();
        restarted.restore(&saved);
        for _ in 0..20 {
            let a = original.advance_cycle();
            let b = restarted.advance_cycle();
            assert_eq!(a.states, b.states);
            assert_eq!(a.index, b.index);
        }
    }

    #[test]
    fn test_unwritable_store_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        // a directory where the snapshot file should go makes the rename fail
        std::fs::create_dir(dir.path().join(LATEST_SNAPSHOT_FILE)).unwrap();

        let snapshot = engine().advance_cycle();
        assert!(matches!(
            store.persist(&snapshot),
            Err(MarketError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::default();
        let snapshot = engine().advance_cycle();
        store.persist(&snapshot).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load_latest().unwrap().unwrap().cycle, 1);

        store.set_failing(true);
        assert!(store.persist(&snapshot).is_err());
        assert_eq!(store.len(), 1);
    }
}
