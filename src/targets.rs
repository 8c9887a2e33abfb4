//! Target set
//!
//! Deduplicated, insertion-ordered collection of scan inputs. A hybrid
//! store: targets live in memory up to a configured budget, then spill into
//! a SQLite table with identical caller-visible semantics, so very large
//! target lists never exhaust memory.
//!
//! Membership is monotone for the lifetime of a scan: targets are added
//! (including from metadata-derived discovery) but never removed. Concurrent
//! `add` calls during iteration are supported; an in-flight iteration
//! snapshots the set size at entry, so late adds are only guaranteed visible
//! to iterations started afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TargetStoreConfig;
use crate::error::Result;

/// A single scan input: host:port, URL, or raw address.
///
/// Identity is the exact input string; metadata is optional pre-resolved
/// context (detected scheme, discovery source) and does not participate in
/// deduplication. Immutable once admitted to the set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub input: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Target {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True when the input carries an explicit scheme (http://, ftp://, ...)
    pub fn is_url(&self) -> bool {
        self.input.contains("://")
    }
}

struct MemoryTier {
    entries: Vec<Arc<Target>>,
    index: std::collections::HashSet<String>,
}

struct SpillTier {
    conn: Connection,
    count: usize,
}

impl SpillTier {
    fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // The set is rebuilt from its inputs on every run; rows left over
        // from a previous run at the same path would shift positions and
        // shadow new targets, so a freshly opened tier always starts empty.
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                input TEXT NOT NULL UNIQUE,
                metadata TEXT NOT NULL
            );
            DELETE FROM targets;
            "#,
        )?;
        Ok(Self { conn, count: 0 })
    }

    fn contains(&self, input: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM targets WHERE input = ?1",
                params![input],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert(&mut self, target: &Target) -> Result<bool> {
        let metadata = serde_json::to_string(&target.metadata)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO targets (input, metadata) VALUES (?1, ?2)",
            params![target.input, metadata],
        )?;
        if inserted > 0 {
            self.count += 1;
        }
        Ok(inserted > 0)
    }

    /// Fetch one page of spilled targets in insertion (rowid) order
    fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Target>> {
        let mut stmt = self.conn.prepare(
            "SELECT input, metadata FROM targets ORDER BY id ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            let input: String = row.get(0)?;
            let metadata: String = row.get(1)?;
            Ok((input, metadata))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (input, metadata) = row?;
            out.push(Target {
                input,
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

/// Spill rows fetched per query during iteration
const SPILL_PAGE: usize = 1024;

/// Hybrid in-memory / on-disk target set
pub struct TargetSet {
    memory_budget: usize,
    memory: RwLock<MemoryTier>,
    spill: Mutex<Option<SpillTier>>,
    spill_path: PathBuf,
    owns_spill_file: bool,
}

impl TargetSet {
    pub fn new(config: &TargetStoreConfig) -> Self {
        let (spill_path, owns_spill_file) = match &config.spill_path {
            Some(path) => (path.clone(), false),
            None => {
                let path = std::env::temp_dir()
                    .join(format!("scanforge-targets-{}.db", uuid::Uuid::new_v4()));
                (path, true)
            }
        };
        Self {
            memory_budget: config.memory_budget.max(1),
            memory: RwLock::new(MemoryTier {
                entries: Vec::new(),
                index: std::collections::HashSet::new(),
            }),
            spill: Mutex::new(None),
            spill_path,
            owns_spill_file,
        }
    }

    /// Insert a target if absent. Returns true when the set grew.
    pub fn add(&self, target: Target) -> Result<bool> {
        {
            let memory = self.memory.read();
            if memory.index.contains(&target.input) {
                return Ok(false);
            }
        }

        let mut spill = self.spill.lock();
        if let Some(tier) = spill.as_ref() {
            if tier.contains(&target.input)? {
                return Ok(false);
            }
        }

        let mut memory = self.memory.write();
        // Re-check under the write lock; a racing add may have won.
        if memory.index.contains(&target.input) {
            return Ok(false);
        }

        if memory.entries.len() < self.memory_budget {
            memory.index.insert(target.input.clone());
            memory.entries.push(Arc::new(target));
            return Ok(true);
        }
        drop(memory);

        if spill.is_none() {
            debug!(
                path = %self.spill_path.display(),
                budget = self.memory_budget,
                "target set spilling to disk"
            );
            *spill = Some(SpillTier::open(&self.spill_path)?);
        }
        let tier = spill.as_mut().expect("spill tier just created");
        tier.insert(&target)
    }

    /// Current number of distinct targets across both tiers
    pub fn count(&self) -> usize {
        let in_memory = self.memory.read().entries.len();
        let spilled = self.spill.lock().as_ref().map_or(0, |t| t.count);
        in_memory + spilled
    }

    /// Visit every target in insertion order. The visitor receives the
    /// target's position (stable for the life of the set) and returns false
    /// to stop early.
    ///
    /// The set size is snapshotted at entry: targets added while the
    /// iteration is in flight are visited by subsequent iterations, not
    /// necessarily this one.
    pub fn iterate<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(usize, Arc<Target>) -> bool,
    {
        let memory_len = self.memory.read().entries.len();
        let spill_len = self.spill.lock().as_ref().map_or(0, |t| t.count);

        for position in 0..memory_len {
            // Lock per entry so concurrent adds are never starved.
            let target = self.memory.read().entries[position].clone();
            if !visitor(position, target) {
                return Ok(());
            }
        }

        // Spilled tier, one page at a time so huge sets never materialize
        // fully in memory
        let mut offset = 0;
        while offset < spill_len {
            let page = {
                let spill = self.spill.lock();
                match spill.as_ref() {
                    Some(tier) => tier.fetch_page(offset, SPILL_PAGE.min(spill_len - offset))?,
                    None => break,
                }
            };
            if page.is_empty() {
                break;
            }
            for (i, target) in page.into_iter().enumerate() {
                if !visitor(memory_len + offset + i, Arc::new(target)) {
                    return Ok(());
                }
            }
            offset += SPILL_PAGE;
        }
        Ok(())
    }

    /// Resolve a target by its iteration position
    pub fn get(&self, position: usize) -> Result<Option<Arc<Target>>> {
        {
            let memory = self.memory.read();
            if position < memory.entries.len() {
                return Ok(Some(memory.entries[position].clone()));
            }
            // The memory tier only stops growing once it hits the budget,
            // so spill positions start exactly at the budget boundary.
            if position < self.memory_budget {
                return Ok(None);
            }
        }
        let spill = self.spill.lock();
        match spill.as_ref() {
            Some(tier) => {
                let page = tier.fetch_page(position - self.memory_budget, 1)?;
                Ok(page.into_iter().next().map(Arc::new))
            }
            None => Ok(None),
        }
    }

    /// Membership test across both tiers
    pub fn contains(&self, input: &str) -> Result<bool> {
        if self.memory.read().index.contains(input) {
            return Ok(true);
        }
        let spill = self.spill.lock();
        match spill.as_ref() {
            Some(tier) => tier.contains(input),
            None => Ok(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Drop for TargetSet {
    fn drop(&mut self) {
        let spilled = self.spill.lock().take();
        if spilled.is_some() && self.owns_spill_file {
            let _ = std::fs::remove_file(&self.spill_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store(budget: usize) -> TargetSet {
        TargetSet::new(&TargetStoreConfig {
            memory_budget: budget,
            spill_path: None,
        })
    }

    #[test]
    fn test_duplicates_collapse() {
        let set = small_store(100);
        assert!(set.add(Target::new("10.0.0.1:80")).unwrap());
        assert!(set.add(Target::new("10.0.0.2:80")).unwrap());
        assert!(!set.add(Target::new("10.0.0.1:80")).unwrap());
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn test_insertion_order_iteration() {
        let set = small_store(100);
        for i in 0..5 {
            set.add(Target::new(format!("host{}:443", i))).unwrap();
        }
        let mut seen = Vec::new();
        set.iterate(|pos, target| {
            seen.push((pos, target.input.clone()));
            true
        })
        .unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], (0, "host0:443".to_string()));
        assert_eq!(seen[4], (4, "host4:443".to_string()));
    }

    #[test]
    fn test_early_stop() {
        let set = small_store(100);
        for i in 0..10 {
            set.add(Target::new(format!("host{}", i))).unwrap();
        }
        let mut visited = 0;
        set.iterate(|_, _| {
            visited += 1;
            visited < 3
        })
        .unwrap();
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_spill_preserves_semantics() {
        let set = small_store(3);
        for i in 0..8 {
            set.add(Target::new(format!("spill{}:22", i))).unwrap();
        }
        // Duplicates collapse across the tier boundary too
        assert!(!set.add(Target::new("spill1:22")).unwrap());
        assert!(!set.add(Target::new("spill6:22")).unwrap());
        assert_eq!(set.count(), 8);
        assert!(set.contains("spill0:22").unwrap());
        assert!(set.contains("spill7:22").unwrap());
        assert!(!set.contains("absent:22").unwrap());

        let mut seen = Vec::new();
        set.iterate(|pos, target| {
            seen.push((pos, target.input.clone()));
            true
        })
        .unwrap();
        let expected: Vec<_> = (0..8).map(|i| (i, format!("spill{}:22", i))).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_adds_during_iteration_visible_next_pass() {
        let set = small_store(100);
        set.add(Target::new("a")).unwrap();
        set.add(Target::new("b")).unwrap();

        let mut first_pass = 0;
        set.iterate(|pos, _| {
            first_pass += 1;
            if pos == 0 {
                set.add(Target::new("c")).unwrap();
            }
            true
        })
        .unwrap();
        // Snapshot at entry: the late add is not part of this pass
        assert_eq!(first_pass, 2);

        let mut second_pass = 0;
        set.iterate(|_, _| {
            second_pass += 1;
            true
        })
        .unwrap();
        assert_eq!(second_pass, 3);
    }

    #[test]
    fn test_get_by_position_across_tiers() {
        let set = small_store(2);
        for i in 0..5 {
            set.add(Target::new(format!("pos{}", i))).unwrap();
        }
        assert_eq!(set.get(0).unwrap().unwrap().input, "pos0");
        assert_eq!(set.get(1).unwrap().unwrap().input, "pos1");
        assert_eq!(set.get(2).unwrap().unwrap().input, "pos2");
        assert_eq!(set.get(4).unwrap().unwrap().input, "pos4");
        assert!(set.get(9).unwrap().is_none());
    }

    #[test]
    fn test_reused_spill_path_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = TargetStoreConfig {
            memory_budget: 1,
            spill_path: Some(dir.path().join("spill.db")),
        };

        // First set spills t1 and leaves the file behind (configured path)
        {
            let set = TargetSet::new(&config);
            set.add(Target::new("t0")).unwrap();
            set.add(Target::new("t1")).unwrap();
            assert_eq!(set.count(), 2);
        }

        // A second set over the same path must not see the old rows:
        // t0 dedupes only against this run, t2 gets position 1.
        let set = TargetSet::new(&config);
        assert!(set.add(Target::new("t0")).unwrap());
        assert!(set.add(Target::new("t2")).unwrap());
        assert_eq!(set.count(), 2);

        let mut seen = Vec::new();
        set.iterate(|pos, target| {
            seen.push((pos, target.input.clone()));
            true
        })
        .unwrap();
        assert_eq!(seen, vec![(0, "t0".to_string()), (1, "t2".to_string())]);
        assert_eq!(set.get(1).unwrap().unwrap().input, "t2");
    }

    #[test]
    fn test_url_detection() {
        assert!(Target::new("https://example.com/login").is_url());
        assert!(!Target::new("192.168.1.1:8080").is_url());
    }
}
