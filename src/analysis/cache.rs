//! Scan cache: previously computed xrefs keyed by method identity.
//!
//! Records stored here are always in RVA space so they survive a change of
//! mapped base between runs. A cached empty range means the method is known
//! to have no xrefs, which is distinct from a cache miss. Besides each
//! method's own xrefs the cache keeps the call sites targeting it, so a
//! users lookup needs no rescan.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::core::address::AddressKind;
use crate::core::call_graph::CallSite;
use crate::core::method::MethodKey;
use crate::core::reference::XrefRecord;
use crate::error::{Result, ScanError};
use crate::log_error;

/// One method's slice of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedScan {
    pub method_key: MethodKey,
    pub xref_range_start: usize,
    pub xref_range_end: usize,
    pub records: Vec<XrefRecord>,
}

impl CachedScan {
    /// Scanned, with nothing found.
    pub fn is_known_empty(&self) -> bool {
        self.xref_range_start == self.xref_range_end
    }
}

/// Keyed lookup of prior scan results, shared by all scan workers.
pub trait ScanCache: Send + Sync {
    fn lookup(&self, key: &MethodKey) -> Option<CachedScan>;

    /// Persist a fresh result. Records must be RVA-based.
    fn store(&self, key: &MethodKey, records: &[XrefRecord]) -> Result<()>;

    /// Call sites targeting the method, as of the last merged graph.
    fn users(&self, key: &MethodKey) -> Option<Vec<CallSite>>;

    /// Persist the call sites targeting the method. Records must be RVA-based.
    fn store_users(&self, key: &MethodKey, sites: &[CallSite]) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ensure_rva(records: &[XrefRecord]) -> Result<()> {
    for r in records {
        r.target.expect_kind(AddressKind::Rva)?;
        r.found_at.expect_kind(AddressKind::Rva)?;
    }
    Ok(())
}

fn ensure_rva_sites(sites: &[CallSite]) -> Result<()> {
    for s in sites {
        ensure_rva(std::slice::from_ref(&s.record))?;
    }
    Ok(())
}

fn poisoned<T>(_: T) -> ScanError {
    ScanError::Cache("cache lock poisoned".into())
}

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryScanCache {
    entries: RwLock<HashMap<MethodKey, Vec<XrefRecord>>>,
    users: RwLock<HashMap<MethodKey, Vec<CallSite>>>,
}

impl MemoryScanCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanCache for MemoryScanCache {
    fn lookup(&self, key: &MethodKey) -> Option<CachedScan> {
        let entries = self.entries.read().ok()?;
        let records = entries.get(key)?.clone();
        Some(CachedScan {
            method_key: key.clone(),
            xref_range_start: 0,
            xref_range_end: records.len(),
            records,
        })
    }

    fn store(&self, key: &MethodKey, records: &[XrefRecord]) -> Result<()> {
        ensure_rva(records)?;
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), records.to_vec());
        Ok(())
    }

    fn users(&self, key: &MethodKey) -> Option<Vec<CallSite>> {
        self.users.read().ok()?.get(key).cloned()
    }

    fn store_users(&self, key: &MethodKey, sites: &[CallSite]) -> Result<()> {
        ensure_rva_sites(sites)?;
        self.users
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), sites.to_vec());
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MethodRange {
    method_key: MethodKey,
    start: usize,
    end: usize,
}

impl MethodRange {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// One flat item vector plus a `[start, end)` range per method.
#[derive(Debug, Serialize, Deserialize)]
struct RangeTable<T> {
    items: Vec<T>,
    ranges: Vec<MethodRange>,
    #[serde(skip)]
    index: HashMap<MethodKey, usize>,
}

impl<T> Default for RangeTable<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ranges: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Clone> RangeTable<T> {
    fn reindex(&mut self) -> Result<()> {
        self.index.clear();
        for (i, r) in self.ranges.iter().enumerate() {
            if r.start > r.end || r.end > self.items.len() {
                return Err(ScanError::Cache(format!(
                    "range [{}, {}) of {} exceeds {} entries",
                    r.start,
                    r.end,
                    r.method_key,
                    self.items.len()
                )));
            }
            self.index.insert(r.method_key.clone(), i);
        }
        Ok(())
    }

    fn get(&self, key: &MethodKey) -> Option<(&MethodRange, &[T])> {
        let range = &self.ranges[*self.index.get(key)?];
        Some((range, &self.items[range.start..range.end]))
    }

    /// Store `items` for `key`. A range of the same length is overwritten in
    /// place; otherwise the items are appended and the old slice is left for
    /// [`compact`](Self::compact).
    fn put(&mut self, key: &MethodKey, items: &[T]) {
        if let Some(i) = self.index.get(key).copied() {
            let (start, len) = (self.ranges[i].start, self.ranges[i].len());
            if len == items.len() {
                self.items[start..start + len].clone_from_slice(items);
                return;
            }
            let range = self.append(key, items);
            self.ranges[i] = range;
        } else {
            let range = self.append(key, items);
            self.index.insert(key.clone(), self.ranges.len());
            self.ranges.push(range);
        }
    }

    fn append(&mut self, key: &MethodKey, items: &[T]) -> MethodRange {
        let start = self.items.len();
        self.items.extend_from_slice(items);
        MethodRange {
            method_key: key.clone(),
            start,
            end: self.items.len(),
        }
    }

    /// Drop slices no range points at.
    fn compact(&mut self) {
        let live: usize = self.ranges.iter().map(MethodRange::len).sum();
        if live == self.items.len() {
            return;
        }
        let mut items = Vec::with_capacity(live);
        for r in &mut self.ranges {
            let start = items.len();
            items.extend_from_slice(&self.items[r.start..r.end]);
            r.start = start;
            r.end = items.len();
        }
        self.items = items;
    }
}

/// On-disk layout: xrefs found in each method, and call sites targeting it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DbContents {
    xrefs: RangeTable<XrefRecord>,
    #[serde(default)]
    users: RangeTable<CallSite>,
}

/// Persistent scan cache backed by a JSON file.
#[derive(Debug, Default)]
pub struct ScanCacheDb {
    path: Option<PathBuf>,
    contents: RwLock<DbContents>,
}

impl ScanCacheDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` if it exists; otherwise start empty. `save` writes back
    /// to the same path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut db = if path.exists() {
            Self::load(path)?
        } else {
            debug!(path = %path.display(), "starting empty scan cache");
            Self::new()
        };
        db.path = Some(path.to_path_buf());
        Ok(db)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut contents: DbContents = serde_json::from_str(&text)?;
        contents
            .xrefs
            .reindex()
            .and_then(|_| contents.users.reindex())
            .map_err(|e| log_error!(e, "loading scan cache"))?;
        ensure_rva(&contents.xrefs.items)?;
        ensure_rva_sites(&contents.users.items)?;
        info!(
            path = %path.as_ref().display(),
            methods = contents.xrefs.ranges.len(),
            records = contents.xrefs.items.len(),
            users = contents.users.items.len(),
            "loaded scan cache"
        );
        Ok(Self {
            path: Some(path.as_ref().to_path_buf()),
            contents: RwLock::new(contents),
        })
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| ScanError::Cache("scan cache has no backing path".into()))?;
        self.save_to(path)
    }

    /// Compact and write the cache as JSON.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut contents = self.contents.write().map_err(poisoned)?;
        contents.xrefs.compact();
        contents.users.compact();
        let json = serde_json::to_string(&*contents)?;
        std::fs::write(path.as_ref(), json)?;
        debug!(path = %path.as_ref().display(), "saved scan cache");
        Ok(())
    }

    /// Xref records held in the flat vector, including stale slices not
    /// yet compacted away.
    pub fn record_count(&self) -> usize {
        self.contents.read().map(|c| c.xrefs.items.len()).unwrap_or(0)
    }
}

impl ScanCache for ScanCacheDb {
    fn lookup(&self, key: &MethodKey) -> Option<CachedScan> {
        let contents = self.contents.read().ok()?;
        let (range, records) = contents.xrefs.get(key)?;
        Some(CachedScan {
            method_key: key.clone(),
            xref_range_start: range.start,
            xref_range_end: range.end,
            records: records.to_vec(),
        })
    }

    fn store(&self, key: &MethodKey, records: &[XrefRecord]) -> Result<()> {
        ensure_rva(records)?;
        self.contents.write().map_err(poisoned)?.xrefs.put(key, records);
        Ok(())
    }

    fn users(&self, key: &MethodKey) -> Option<Vec<CallSite>> {
        let contents = self.contents.read().ok()?;
        contents.users.get(key).map(|(_, sites)| sites.to_vec())
    }

    fn store_users(&self, key: &MethodKey, sites: &[CallSite]) -> Result<()> {
        ensure_rva_sites(sites)?;
        self.contents.write().map_err(poisoned)?.users.put(key, sites);
        Ok(())
    }

    fn len(&self) -> usize {
        self.contents.read().map(|c| c.xrefs.ranges.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::CodeAddress;
    use tempfile::TempDir;

    fn rec(target: u64, at: u64) -> XrefRecord {
        XrefRecord::method(CodeAddress::rva(target), CodeAddress::rva(at))
    }

    #[test]
    fn memory_cache_distinguishes_empty_from_missing() {
        let cache = MemoryScanCache::new();
        let a = MethodKey::new("A::Run");
        let b = MethodKey::new("B::Run");
        cache.store(&a, &[]).unwrap();

        let hit = cache.lookup(&a).unwrap();
        assert!(hit.is_known_empty());
        assert!(cache.lookup(&b).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn mapped_records_are_refused() {
        let cache = MemoryScanCache::new();
        let bad = XrefRecord::method(CodeAddress::mapped(0x10), CodeAddress::rva(0x20));
        assert!(cache.store(&MethodKey::new("k"), &[bad]).is_err());
    }

    #[test]
    fn db_ranges_slice_the_flat_vector() {
        let db = ScanCacheDb::new();
        db.store(&MethodKey::new("a"), &[rec(0x10, 0x1), rec(0x20, 0x2)]).unwrap();
        db.store(&MethodKey::new("b"), &[]).unwrap();
        db.store(&MethodKey::new("c"), &[rec(0x30, 0x3)]).unwrap();

        let c = db.lookup(&MethodKey::new("c")).unwrap();
        assert_eq!((c.xref_range_start, c.xref_range_end), (2, 3));
        assert_eq!(c.records, vec![rec(0x30, 0x3)]);
        assert!(db.lookup(&MethodKey::new("b")).unwrap().is_known_empty());
        assert_eq!(db.len(), 3);
        assert_eq!(db.record_count(), 3);
    }

    #[test]
    fn db_persists_through_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xrefs.json");

        let db = ScanCacheDb::open(&path).unwrap();
        assert!(db.is_empty());
        db.store(&MethodKey::new("a"), &[rec(0x10, 0x1)]).unwrap();
        db.store(&MethodKey::new("b"), &[]).unwrap();
        db.save().unwrap();

        let back = ScanCacheDb::open(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.lookup(&MethodKey::new("a")).unwrap().records, vec![rec(0x10, 0x1)]);
        assert!(back.lookup(&MethodKey::new("b")).unwrap().is_known_empty());
    }

    #[test]
    fn corrupt_ranges_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"xrefs":{"items":[],"ranges":[{"method_key":"a","start":0,"end":4}]}}"#,
        )
        .unwrap();
        assert!(matches!(ScanCacheDb::load(&path), Err(ScanError::Cache(_))));
    }

    #[test]
    fn restore_replaces_range() {
        let db = ScanCacheDb::new();
        let k = MethodKey::new("a");
        db.store(&k, &[rec(0x10, 0x1)]).unwrap();
        db.store(&k, &[]).unwrap();
        assert!(db.lookup(&k).unwrap().is_known_empty());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn restore_of_same_length_reuses_slice() {
        let db = ScanCacheDb::new();
        let k = MethodKey::new("a");
        for _ in 0..10 {
            db.store(&k, &[rec(0x10, 0x1), rec(0x20, 0x2)]).unwrap();
        }
        db.store(&k, &[rec(0x30, 0x3), rec(0x40, 0x4)]).unwrap();
        assert_eq!(db.record_count(), 2);
        assert_eq!(
            db.lookup(&k).unwrap().records,
            vec![rec(0x30, 0x3), rec(0x40, 0x4)]
        );
    }

    #[test]
    fn save_compacts_stale_slices() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xrefs.json");
        let db = ScanCacheDb::open(&path).unwrap();
        let (a, b) = (MethodKey::new("a"), MethodKey::new("b"));
        db.store(&a, &[rec(0x10, 0x1), rec(0x20, 0x2)]).unwrap();
        db.store(&b, &[rec(0x50, 0x5)]).unwrap();
        db.store(&a, &[rec(0x30, 0x3)]).unwrap();
        assert_eq!(db.record_count(), 4);

        db.save().unwrap();
        assert_eq!(db.record_count(), 2);
        let back = ScanCacheDb::open(&path).unwrap();
        assert_eq!(back.record_count(), 2);
        assert_eq!(back.lookup(&a).unwrap().records, vec![rec(0x30, 0x3)]);
        assert_eq!(back.lookup(&b).unwrap().records, vec![rec(0x50, 0x5)]);
    }

    #[test]
    fn users_persist_beside_xrefs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xrefs.json");
        let db = ScanCacheDb::open(&path).unwrap();
        let site = CallSite {
            caller: 0x100,
            record: rec(0x200, 0x104),
        };
        let target = MethodKey::new("B");
        db.store_users(&target, &[site]).unwrap();
        db.store_users(&MethodKey::new("A"), &[]).unwrap();
        db.save().unwrap();

        let back = ScanCacheDb::open(&path).unwrap();
        assert_eq!(back.users(&target), Some(vec![site]));
        assert_eq!(back.users(&MethodKey::new("A")), Some(vec![]));
        assert!(back.users(&MethodKey::new("C")).is_none());
        // Users alone do not make a method's own scan cached.
        assert!(back.lookup(&target).is_none());
    }

    #[test]
    fn memory_cache_keeps_users() {
        let cache = MemoryScanCache::new();
        let site = CallSite {
            caller: 0x100,
            record: rec(0x200, 0x104),
        };
        cache.store_users(&MethodKey::new("B"), &[site]).unwrap();
        assert_eq!(cache.users(&MethodKey::new("B")), Some(vec![site]));
        assert!(cache.is_empty());

        let mapped = CallSite {
            caller: 0x100,
            record: XrefRecord::method(CodeAddress::mapped(0x200), CodeAddress::rva(0x104)),
        };
        assert!(cache.store_users(&MethodKey::new("B"), &[mapped]).is_err());
    }
}
