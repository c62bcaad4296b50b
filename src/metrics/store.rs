use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::stats::{ApdexStats, ApdexZone, Stats};

// ─── Keys ────────────────────────────────────────────────────────

/// Metric identity: a name, optionally scoped to the transaction it was
/// recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub name: String,
    pub scope: Option<String>,
}

impl MetricKey {
    pub fn unscoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }
}

// ─── Handles ─────────────────────────────────────────────────────

/// Live view of one store entry.
///
/// Cloning is cheap. After `clear()` or a harvest the handle is detached:
/// it keeps the last values but no longer sees new records.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    cell: Arc<Mutex<Stats>>,
}

impl StatsHandle {
    pub fn get(&self) -> Stats {
        *self.cell.lock()
    }

    pub fn call_count(&self) -> u64 {
        self.cell.lock().call_count
    }

    pub fn total_call_time(&self) -> f64 {
        self.cell.lock().total_call_time
    }

    /// True when both handles point at the same store entry.
    pub fn same_entry(&self, other: &StatsHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

#[derive(Debug, Clone)]
pub struct ApdexHandle {
    cell: Arc<Mutex<ApdexStats>>,
}

impl ApdexHandle {
    pub fn get(&self) -> ApdexStats {
        *self.cell.lock()
    }

    pub fn count(&self) -> u64 {
        self.cell.lock().count()
    }
}

// ─── Drained output ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub name: String,
    pub scope: Option<String>,
    pub stats: Stats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApdexRecord {
    pub name: String,
    pub apdex: ApdexStats,
    pub score: f64,
}

/// Everything a store held at one instant, sorted by key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreContents {
    pub metrics: Vec<MetricRecord>,
    pub apdex: Vec<ApdexRecord>,
}

impl StoreContents {
    pub fn find(&self, name: &str) -> Option<&Stats> {
        self.metrics
            .iter()
            .find(|m| m.scope.is_none() && m.name == name)
            .map(|m| &m.stats)
    }

    pub fn find_apdex(&self, name: &str) -> Option<&ApdexStats> {
        self.apdex.iter().find(|a| a.name == name).map(|a| &a.apdex)
    }
}

// ─── Store ───────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    stats: HashMap<MetricKey, Arc<Mutex<Stats>>>,
    apdex: HashMap<String, Arc<Mutex<ApdexStats>>>,
}

/// Thread-safe metric table.
///
/// Recorders hold the table read lock for the duration of one entry update,
/// and `harvest`/`clear` take the write lock, so a drained snapshot never
/// contains half a record.
#[derive(Default)]
pub struct MetricStore {
    tables: RwLock<Tables>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> StatsHandle {
        self.get_or_create_key(MetricKey::unscoped(name))
    }

    pub fn get_or_create_scoped(&self, name: &str, scope: &str) -> StatsHandle {
        self.get_or_create_key(MetricKey::scoped(name, scope))
    }

    fn get_or_create_key(&self, key: MetricKey) -> StatsHandle {
        if let Some(cell) = self.tables.read().stats.get(&key) {
            return StatsHandle { cell: cell.clone() };
        }
        // Two racing creators both land here; `entry` makes one of them win.
        let mut tables = self.tables.write();
        let cell = tables.stats.entry(key).or_default().clone();
        StatsHandle { cell }
    }

    pub fn get_or_create_apdex(&self, name: &str) -> ApdexHandle {
        if let Some(cell) = self.tables.read().apdex.get(name) {
            return ApdexHandle { cell: cell.clone() };
        }
        let mut tables = self.tables.write();
        let cell = tables.apdex.entry(name.to_owned()).or_default().clone();
        ApdexHandle { cell }
    }

    pub fn record(&self, name: &str, duration: f64, exclusive: f64) {
        self.record_key(MetricKey::unscoped(name), duration, exclusive);
    }

    pub fn record_scoped(&self, name: &str, scope: &str, duration: f64, exclusive: f64) {
        self.record_key(MetricKey::scoped(name, scope), duration, exclusive);
    }

    fn record_key(&self, key: MetricKey, duration: f64, exclusive: f64) {
        {
            let tables = self.tables.read();
            if let Some(cell) = tables.stats.get(&key) {
                cell.lock().record(duration, exclusive);
                return;
            }
        }
        let mut tables = self.tables.write();
        tables
            .stats
            .entry(key)
            .or_default()
            .lock()
            .record(duration, exclusive);
    }

    /// Count an event that has no duration, e.g. an error.
    pub fn increment(&self, name: &str) {
        self.record(name, 0.0, 0.0);
    }

    pub fn record_apdex(&self, name: &str, zone: ApdexZone) {
        {
            let tables = self.tables.read();
            if let Some(cell) = tables.apdex.get(name) {
                cell.lock().record(zone);
                return;
            }
        }
        let mut tables = self.tables.write();
        tables
            .apdex
            .entry(name.to_owned())
            .or_default()
            .lock()
            .record(zone);
    }

    /// Unscoped stats for `name`, or `None` if it was never referenced.
    pub fn get_stats_no_scope(&self, name: &str) -> Option<Stats> {
        self.lookup_key(&MetricKey::unscoped(name))
    }

    /// Same as [`get_stats_no_scope`](Self::get_stats_no_scope); never creates.
    pub fn lookup_stats(&self, name: &str) -> Option<Stats> {
        self.get_stats_no_scope(name)
    }

    pub fn lookup_scoped(&self, name: &str, scope: &str) -> Option<Stats> {
        self.lookup_key(&MetricKey::scoped(name, scope))
    }

    fn lookup_key(&self, key: &MetricKey) -> Option<Stats> {
        self.tables.read().stats.get(key).map(|cell| *cell.lock())
    }

    pub fn lookup_apdex(&self, name: &str) -> Option<ApdexStats> {
        self.tables.read().apdex.get(name).map(|cell| *cell.lock())
    }

    /// Every known metric name, sorted and de-duplicated across scopes.
    pub fn metrics(&self) -> Vec<String> {
        let tables = self.tables.read();
        let names: BTreeSet<&str> = tables
            .stats
            .keys()
            .map(|k| k.name.as_str())
            .chain(tables.apdex.keys().map(String::as_str))
            .collect();
        names.into_iter().map(str::to_owned).collect()
    }

    pub fn len(&self) -> usize {
        let tables = self.tables.read();
        tables.stats.len() + tables.apdex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }

    /// Copy of the current contents without resetting anything.
    pub fn snapshot(&self) -> StoreContents {
        let tables = self.tables.read();
        Self::collect(&tables)
    }

    /// Swap the tables out and return what they held.
    pub fn harvest(&self) -> StoreContents {
        let drained = std::mem::take(&mut *self.tables.write());
        Self::collect(&drained)
    }

    fn collect(tables: &Tables) -> StoreContents {
        let mut metrics: Vec<MetricRecord> = tables
            .stats
            .iter()
            .map(|(key, cell)| MetricRecord {
                name: key.name.clone(),
                scope: key.scope.clone(),
                stats: *cell.lock(),
            })
            .collect();
        metrics.sort_by(|a, b| (&a.name, &a.scope).cmp(&(&b.name, &b.scope)));

        let mut apdex: Vec<ApdexRecord> = tables
            .apdex
            .iter()
            .map(|(name, cell)| {
                let apdex = *cell.lock();
                ApdexRecord {
                    name: name.clone(),
                    score: apdex.score(),
                    apdex,
                }
            })
            .collect();
        apdex.sort_by(|a, b| a.name.cmp(&b.name));

        StoreContents { metrics, apdex }
    }
}
