//! Two-tier build cache.
//!
//! Tier 1 (`base_deps/`) holds the slow-moving dependency tree a west
//! update produces (`.west/`, `zephyr/`, `zmk/`, modules), keyed by
//! `(repository, revision)`. Tier 2 (`keyboard_config/`) holds a complete
//! workspace shell per keyboard, keyed by the base key plus keyboard name,
//! build matrix, and container image. Entries are directories with a
//! `.meta.json`; writes go through a `.tmp` + rename promote under a
//! per-entry lockfile. Lock contention degrades gracefully: the caller
//! proceeds without the cache.

use crate::error::{Error, Result};
use crate::profile::BuildMatrixEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const META_FILE: &str = ".meta.json";
const STATS_FILE: &str = ".stats.json";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(50);
const STATS_FLUSH_EVERY: u32 = 100;

/// Default time-to-live for base dependency entries.
pub const BASE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Default time-to-live for keyboard workspace shells.
pub const CONFIG_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Time-to-live for entries seeded from CLI-supplied inputs.
pub const CLI_SEEDED_TTL: Duration = Duration::from_secs(60 * 60);

/// The two cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// ZMK/Zephyr dependency tree.
    BaseDeps,
    /// Per-keyboard workspace shell.
    KeyboardConfig,
}

impl CacheTier {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::BaseDeps => "base_deps",
            Self::KeyboardConfig => "keyboard_config",
        }
    }

    /// Subdirectories that must exist and be non-empty for a valid entry.
    const fn required_dirs(self) -> &'static [&'static str] {
        match self {
            Self::BaseDeps => &[".west", "zephyr", "zmk"],
            Self::KeyboardConfig => &["config"],
        }
    }
}

/// Metadata stored next to each entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    /// The entry key (hash).
    pub key: String,
    /// The inputs the key was derived from, for validation and inspection.
    pub key_inputs: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last hit time.
    pub last_used_at: DateTime<Utc>,
    /// Expiry horizon in seconds from creation.
    pub ttl_secs: u64,
    /// Metadata format version.
    pub version: u32,
}

/// Persistent hit/miss counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Valid entries served.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Entries removed for expiry or corruption.
    pub evictions: u64,
    /// I/O or validation failures.
    pub errors: u64,
}

/// The process-shared cache directory, owned by an explicit object — no
/// module-level state.
pub struct TwoTierCache {
    root: PathBuf,
    stats: RefCell<CacheStats>,
    ops_since_flush: Cell<u32>,
}

impl TwoTierCache {
    /// Opens (creating if needed) a cache at `root`.
    pub fn new(root: PathBuf) -> Result<Self> {
        for tier in [CacheTier::BaseDeps, CacheTier::KeyboardConfig] {
            let dir = root.join(tier.dir_name());
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::io(format!("creating cache dir {}", dir.display()), e))?;
        }
        let stats = load_stats(&root.join(STATS_FILE));
        Ok(Self {
            root,
            stats: RefCell::new(stats),
            ops_since_flush: Cell::new(0),
        })
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tier-1 key: derived from `(repository, revision)`.
    #[must_use]
    pub fn base_key(repository: &str, revision: &str) -> String {
        hash_inputs(&[("repository", repository), ("revision", revision)])
    }

    /// Tier-2 key: base key ⊕ keyboard ⊕ sorted matrix ⊕ image.
    #[must_use]
    pub fn config_key(
        base_key: &str,
        keyboard: &str,
        matrix: &[BuildMatrixEntry],
        image: &str,
    ) -> String {
        let mut rows: Vec<String> = matrix
            .iter()
            .map(|e| {
                format!(
                    "{}|{}|{}|{}|{}",
                    e.board,
                    e.shield.as_deref().unwrap_or(""),
                    e.artifact_name.as_deref().unwrap_or(""),
                    e.cmake_args.join(","),
                    e.snippet.as_deref().unwrap_or("")
                )
            })
            .collect();
        rows.sort();
        hash_inputs(&[
            ("base", base_key),
            ("keyboard", keyboard),
            ("matrix", &rows.join(";")),
            ("image", image),
        ])
    }

    /// Looks up a valid entry, touching its `last_used_at`.
    ///
    /// Expired or corrupt entries are quarantined (removed) and counted as
    /// evictions; the lookup reports a miss.
    pub fn lookup(&self, tier: CacheTier, key: &str) -> Option<PathBuf> {
        let entry_dir = self.entry_dir(tier, key);
        let result = self.validate_entry(tier, key, &entry_dir);
        match result {
            Ok(Some(mut meta)) => {
                self.bump(|s| s.hits += 1);
                meta.last_used_at = Utc::now();
                let _ = write_meta(&entry_dir.join(META_FILE), &meta);
                debug!(key, tier = tier.dir_name(), "cache hit");
                Some(entry_dir)
            }
            Ok(None) => {
                self.bump(|s| s.misses += 1);
                None
            }
            Err(reason) => {
                warn!(key, reason, "quarantining corrupt cache entry");
                let _ = std::fs::remove_dir_all(&entry_dir);
                self.bump(|s| {
                    s.evictions += 1;
                    s.errors += 1;
                    s.misses += 1;
                });
                None
            }
        }
    }

    /// Validation: present, metadata parses and matches the key, required
    /// directories non-empty, not expired.
    fn validate_entry(
        &self,
        tier: CacheTier,
        key: &str,
        entry_dir: &Path,
    ) -> std::result::Result<Option<CacheMeta>, &'static str> {
        if !entry_dir.is_dir() {
            return Ok(None);
        }
        let meta_path = entry_dir.join(META_FILE);
        let text = std::fs::read_to_string(&meta_path).map_err(|_| "unreadable metadata")?;
        let meta: CacheMeta = serde_json::from_str(&text).map_err(|_| "unparsable metadata")?;
        if meta.key != key {
            return Err("metadata key mismatch");
        }
        let age = Utc::now().signed_duration_since(meta.created_at);
        if age.num_seconds() < 0 || age.num_seconds() as u64 > meta.ttl_secs {
            // Expired entries are removed but are not corruption.
            let _ = std::fs::remove_dir_all(entry_dir);
            self.bump(|s| s.evictions += 1);
            return Ok(None);
        }
        for required in tier.required_dirs() {
            let dir = entry_dir.join(required);
            let non_empty = std::fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if !non_empty {
                return Err("required subdirectory missing or empty");
            }
        }
        Ok(Some(meta))
    }

    /// Copies `source` into the cache under `key`, atomically
    /// (`<entry>.tmp` then rename), guarded by the per-entry lockfile.
    ///
    /// On lock timeout the store is skipped (graceful degradation) and
    /// `None` is returned.
    pub fn store(
        &self,
        tier: CacheTier,
        key: &str,
        source: &Path,
        key_inputs: BTreeMap<String, String>,
        ttl: Duration,
    ) -> Result<Option<PathBuf>> {
        let Some(_lock) = Lockfile::acquire(&self.lock_path(tier, key))? else {
            warn!(key, "cache lock busy; skipping store");
            return Ok(None);
        };

        let entry_dir = self.entry_dir(tier, key);
        let tmp_dir = self.root.join(tier.dir_name()).join(format!("{key}.tmp"));
        let _ = std::fs::remove_dir_all(&tmp_dir);

        copy_dir(source, &tmp_dir)?;
        let meta = CacheMeta {
            key: key.to_string(),
            key_inputs,
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            version: 1,
        };
        write_meta(&tmp_dir.join(META_FILE), &meta)?;

        let _ = std::fs::remove_dir_all(&entry_dir);
        std::fs::rename(&tmp_dir, &entry_dir)
            .map_err(|e| Error::io(format!("promoting cache entry {key}"), e))?;
        self.bump(|_| {});
        Ok(Some(entry_dir))
    }

    /// Copies a cached entry into `dest` (metadata excluded).
    pub fn materialize(&self, entry_dir: &Path, dest: &Path) -> Result<()> {
        copy_dir(entry_dir, dest)?;
        let _ = std::fs::remove_file(dest.join(META_FILE));
        Ok(())
    }

    /// Lists entry metadata for a tier.
    pub fn entries(&self, tier: CacheTier) -> Result<Vec<CacheMeta>> {
        let dir = self.root.join(tier.dir_name());
        let mut metas = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(format!("reading {}", dir.display()), e))?;
        for entry in entries.flatten() {
            let meta_path = entry.path().join(META_FILE);
            if let Ok(text) = std::fs::read_to_string(&meta_path) {
                if let Ok(meta) = serde_json::from_str::<CacheMeta>(&text) {
                    metas.push(meta);
                }
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    /// Removes entries; `tier == None` clears both. Returns removed count.
    pub fn clear(&self, tier: Option<CacheTier>) -> Result<usize> {
        let tiers = match tier {
            Some(t) => vec![t],
            None => vec![CacheTier::BaseDeps, CacheTier::KeyboardConfig],
        };
        let mut removed = 0;
        for tier in tiers {
            let dir = self.root.join(tier.dir_name());
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| Error::io(format!("reading {}", dir.display()), e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                        .map_err(|e| Error::io(format!("removing {}", path.display()), e))?;
                    removed += 1;
                }
            }
        }
        self.bump(|s| s.evictions += removed as u64);
        Ok(removed)
    }

    /// A snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        *self.stats.borrow()
    }

    fn entry_dir(&self, tier: CacheTier, key: &str) -> PathBuf {
        self.root.join(tier.dir_name()).join(key)
    }

    fn lock_path(&self, tier: CacheTier, key: &str) -> PathBuf {
        self.root.join(tier.dir_name()).join(format!(".{key}.lock"))
    }

    fn bump(&self, update: impl FnOnce(&mut CacheStats)) {
        update(&mut self.stats.borrow_mut());
        let ops = self.ops_since_flush.get() + 1;
        if ops >= STATS_FLUSH_EVERY {
            self.flush_stats();
            self.ops_since_flush.set(0);
        } else {
            self.ops_since_flush.set(ops);
        }
    }

    fn flush_stats(&self) {
        let path = self.root.join(STATS_FILE);
        let tmp = self.root.join(format!("{STATS_FILE}.tmp"));
        let stats = *self.stats.borrow();
        if let Ok(text) = serde_json::to_string_pretty(&stats) {
            if std::fs::write(&tmp, text).is_ok() {
                let _ = std::fs::rename(&tmp, &path);
            }
        }
    }
}

impl Drop for TwoTierCache {
    fn drop(&mut self) {
        self.flush_stats();
    }
}

/// An exclusive advisory lockfile; removed on drop.
struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    /// Spins up to the lock timeout; `None` when the lock stays busy.
    fn acquire(path: &Path) -> Result<Option<Self>> {
        let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(Error::io(format!("creating lockfile {}", path.display()), e))
                }
            }
        }
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn hash_inputs(inputs: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in inputs {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn write_meta(path: &Path, meta: &CacheMeta) -> Result<()> {
    let text = serde_json::to_string_pretty(meta).map_err(|e| Error::Json {
        context: "serializing cache metadata".into(),
        source: e,
    })?;
    std::fs::write(path, text).map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

fn load_stats(path: &Path) -> CacheStats {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

/// Recursive directory copy. Symlinks are followed; the ZMK dependency tree
/// does not rely on link identity.
fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let entries = std::fs::read_dir(source)
        .map_err(|e| Error::io(format!("reading {}", source.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("listing directory", e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::io(format!("stat {}", from.display()), e))?;
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)
                .map_err(|e| Error::io(format!("copying {}", from.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_source(dirs: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for dir in dirs {
            let path = tmp.path().join(dir);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("marker"), "x").unwrap();
        }
        tmp
    }

    #[test]
    fn test_keys_are_stable_and_distinct() {
        let a = TwoTierCache::base_key("https://github.com/zmkfirmware/zmk", "main");
        let b = TwoTierCache::base_key("https://github.com/zmkfirmware/zmk", "main");
        let c = TwoTierCache::base_key("https://github.com/zmkfirmware/zmk", "v3.5");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_config_key_matrix_order_insensitive() {
        let left = BuildMatrixEntry {
            board: "glove80_lh".into(),
            shield: None,
            artifact_name: None,
            cmake_args: vec![],
            snippet: None,
        };
        let right = BuildMatrixEntry {
            board: "glove80_rh".into(),
            ..left.clone()
        };
        let key_a = TwoTierCache::config_key("base", "glove80", &[left.clone(), right.clone()], "img");
        let key_b = TwoTierCache::config_key("base", "glove80", &[right, left], "img");
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_store_and_lookup_round_trip() {
        let cache_root = TempDir::new().unwrap();
        let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
        let source = seeded_source(&[".west", "zephyr", "zmk"]);

        let key = TwoTierCache::base_key("repo", "rev");
        assert!(cache.lookup(CacheTier::BaseDeps, &key).is_none());

        let stored = cache
            .store(
                CacheTier::BaseDeps,
                &key,
                source.path(),
                BTreeMap::new(),
                BASE_TTL,
            )
            .unwrap();
        assert!(stored.is_some());

        let hit = cache.lookup(CacheTier::BaseDeps, &key).unwrap();
        assert!(hit.join("zephyr/marker").is_file());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_evicted() {
        let cache_root = TempDir::new().unwrap();
        let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
        let source = seeded_source(&[".west", "zephyr", "zmk"]);

        let key = TwoTierCache::base_key("repo", "rev");
        cache
            .store(
                CacheTier::BaseDeps,
                &key,
                source.path(),
                BTreeMap::new(),
                Duration::from_secs(0),
            )
            .unwrap();

        assert!(cache.lookup(CacheTier::BaseDeps, &key).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_corrupt_entry_quarantined() {
        let cache_root = TempDir::new().unwrap();
        let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
        let source = seeded_source(&[".west", "zephyr", "zmk"]);

        let key = TwoTierCache::base_key("repo", "rev");
        let entry = cache
            .store(CacheTier::BaseDeps, &key, source.path(), BTreeMap::new(), BASE_TTL)
            .unwrap()
            .unwrap();

        // Empty out a required directory.
        std::fs::remove_dir_all(entry.join("zmk")).unwrap();

        assert!(cache.lookup(CacheTier::BaseDeps, &key).is_none());
        assert!(!entry.exists());
        assert_eq!(cache.stats().errors, 1);
    }

    #[test]
    fn test_lockfile_lifecycle() {
        let cache_root = TempDir::new().unwrap();
        let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
        let source = seeded_source(&["config"]);

        let key = "deadbeefdeadbeef";
        let lock_path = cache_root
            .path()
            .join("keyboard_config")
            .join(format!(".{key}.lock"));
        let held = Lockfile::acquire(&lock_path).unwrap().unwrap();
        assert!(lock_path.exists());
        drop(held);
        assert!(!lock_path.exists());

        // With the lock free, store succeeds.
        let stored = cache
            .store(
                CacheTier::KeyboardConfig,
                key,
                source.path(),
                BTreeMap::new(),
                CONFIG_TTL,
            )
            .unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn test_clear_and_entries() {
        let cache_root = TempDir::new().unwrap();
        let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
        let source = seeded_source(&["config"]);
        cache
            .store(
                CacheTier::KeyboardConfig,
                "aaaa",
                source.path(),
                BTreeMap::new(),
                CONFIG_TTL,
            )
            .unwrap();

        assert_eq!(cache.entries(CacheTier::KeyboardConfig).unwrap().len(), 1);
        assert_eq!(cache.clear(None).unwrap(), 1);
        assert!(cache.entries(CacheTier::KeyboardConfig).unwrap().is_empty());
    }

    #[test]
    fn test_stats_persist_across_instances() {
        let cache_root = TempDir::new().unwrap();
        {
            let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
            cache.lookup(CacheTier::BaseDeps, "nope");
            // Dropped here; stats flush to disk.
        }
        let cache = TwoTierCache::new(cache_root.path().to_path_buf()).unwrap();
        assert_eq!(cache.stats().misses, 1);
    }
}
