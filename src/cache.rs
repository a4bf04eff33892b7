//! Two-tier cache for Stage 1/Stage 2 LLM outputs.
//!
//! Tier 1 is an in-process LRU bounded by entry count *and* total bytes
//! (generalized from the teacher sibling's TTL-wrapped `lru::LruCache`
//! store). Tier 2 is a filesystem directory sharded by the first two hex
//! characters of the key, one JSON file per entry, written atomically
//! (temp file, `sync_all`, rename) so a crash mid-write never produces a
//! file Tier 2 would serve back. A Tier 1 miss falls through to Tier 2 and
//! promotes the entry back into Tier 1 on hit.

use crate::error::PipelineError;
use crate::types::{Stage, Stage1Result, Stage2Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Serialize, Deserialize)]
enum CachedPayload {
    Stage1(Stage1Result),
    Stage2(Stage2Result),
}

impl CachedPayload {
    fn stage(&self) -> Stage {
        match self {
            CachedPayload::Stage1(_) => Stage::One,
            CachedPayload::Stage2(_) => Stage::Two,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEntry {
    payload: CachedPayload,
    created_at_ms: u64,
    tokens_used: u32,
    #[serde(skip)]
    size_bytes: usize,
}

struct Tier1 {
    entries: LruCache<String, StoredEntry>,
    total_bytes: usize,
    max_bytes: usize,
}

impl Tier1 {
    fn new(max_entries: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max_entries clamped to >= 1");
        Self { entries: LruCache::new(capacity), total_bytes: 0, max_bytes }
    }

    fn get_fresh(&mut self, key: &str, ttl: Duration, now_ms: u64) -> Option<StoredEntry> {
        let expired = match self.entries.peek(key) {
            Some(entry) => now_ms.saturating_sub(entry.created_at_ms) > ttl.as_millis() as u64,
            None => return None,
        };
        if expired {
            if let Some(evicted) = self.entries.pop(key) {
                self.total_bytes = self.total_bytes.saturating_sub(evicted.size_bytes);
            }
            return None;
        }
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, entry: StoredEntry) {
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.put(key, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        while self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.total_bytes = self.total_bytes.saturating_sub(evicted.size_bytes),
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

/// Hit/miss/eviction counters, exposed via [`Cache::stats`].
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits_stage1: u64,
    pub misses_stage1: u64,
    pub hits_stage2: u64,
    pub misses_stage2: u64,
    pub tokens_saved: u64,
    pub corruption_count: u64,
}

struct Counters {
    hits_stage1: AtomicU64,
    misses_stage1: AtomicU64,
    hits_stage2: AtomicU64,
    misses_stage2: AtomicU64,
    tokens_saved: AtomicU64,
    corruption_count: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            hits_stage1: AtomicU64::new(0),
            misses_stage1: AtomicU64::new(0),
            hits_stage2: AtomicU64::new(0),
            misses_stage2: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
            corruption_count: AtomicU64::new(0),
        }
    }
}

/// Tuning for a [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
    pub ttl: Duration,
    pub tier1_max_entries: usize,
    pub tier1_max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl: Duration::from_secs(604_800),
            tier1_max_entries: 10_000,
            tier1_max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Two-tier content-addressed cache for Stage 1/Stage 2 outputs.
pub struct Cache {
    tier1: Mutex<Tier1>,
    dir: Option<PathBuf>,
    ttl: Duration,
    counters: Counters,
    tmp_counter: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Lowercases and trims a string for use in a cache key, so "Cat" and
/// " cat " key to the same entry.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Serializes `value` with object keys sorted and whitespace normalized
/// so semantically identical Stage 1 results yield the same Stage 2 key
/// regardless of field order. Relies on `serde_json::Map`'s default
/// `BTreeMap` backing (this crate does not enable the `preserve_order`
/// feature) to get key sorting for free.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    let as_value = serde_json::to_value(value)
        .map_err(|e| PipelineError::internal(format!("canonicalize: {e}")))?;
    serde_json::to_string(&as_value).map_err(|e| PipelineError::internal(format!("canonicalize: {e}")))
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// `SHA256("s1|" + normalize(term) + "|" + normalize(kind))`.
pub fn stage1_cache_key(term: &str, kind: Option<&str>) -> String {
    let content = format!("s1|{}|{}", normalize(term), normalize(kind.unwrap_or("")));
    sha256_hex(&content)
}

/// `SHA256("s2|" + normalize(term) + "|" + canonicalJSON(stage1))`.
pub fn stage2_cache_key(term: &str, stage1: &Stage1Result) -> Result<String, PipelineError> {
    let canonical = canonical_json(stage1)?;
    Ok(sha256_hex(&format!("s2|{}|{}", normalize(term), canonical)))
}

fn tier2_path(dir: &Path, stage: Stage, key: &str) -> PathBuf {
    let stage_dir = match stage {
        Stage::One => "stage1",
        Stage::Two => "stage2",
    };
    let shard = if key.len() >= 2 { &key[0..2] } else { key };
    dir.join(stage_dir).join(shard).join(format!("{key}.json"))
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            tier1: Mutex::new(Tier1::new(config.tier1_max_entries, config.tier1_max_bytes)),
            dir: config.dir,
            ttl: config.ttl,
            counters: Counters::default(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub async fn get_stage1(&self, term: &str, kind: Option<&str>) -> Option<Stage1Result> {
        let key = stage1_cache_key(term, kind);
        match self.lookup(Stage::One, &key).await {
            Some(CachedPayload::Stage1(result)) => {
                self.counters.hits_stage1.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            _ => {
                self.counters.misses_stage1.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn save_stage1(&self, term: &str, kind: Option<&str>, result: Stage1Result, tokens_used: u32) {
        let key = stage1_cache_key(term, kind);
        self.store(Stage::One, key, CachedPayload::Stage1(result), tokens_used).await;
    }

    pub async fn get_stage2(&self, key: &str) -> Option<Stage2Result> {
        match self.lookup(Stage::Two, key).await {
            Some(CachedPayload::Stage2(result)) => {
                self.counters.hits_stage2.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            _ => {
                self.counters.misses_stage2.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn save_stage2(&self, key: &str, result: Stage2Result, tokens_used: u32) {
        self.store(Stage::Two, key.to_string(), CachedPayload::Stage2(result), tokens_used).await;
    }

    pub fn clear(&self) {
        self.tier1.lock().expect("Cache.tier1: mutex poisoned").clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits_stage1: self.counters.hits_stage1.load(Ordering::Relaxed),
            misses_stage1: self.counters.misses_stage1.load(Ordering::Relaxed),
            hits_stage2: self.counters.hits_stage2.load(Ordering::Relaxed),
            misses_stage2: self.counters.misses_stage2.load(Ordering::Relaxed),
            tokens_saved: self.counters.tokens_saved.load(Ordering::Relaxed),
            corruption_count: self.counters.corruption_count.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, stage: Stage, key: &str) -> Option<CachedPayload> {
        let now = now_ms();
        if let Some(entry) = self.tier1.lock().expect("Cache.tier1: mutex poisoned").get_fresh(key, self.ttl, now) {
            self.counters.tokens_saved.fetch_add(u64::from(entry.tokens_used), Ordering::Relaxed);
            return Some(entry.payload);
        }

        let dir = self.dir.clone()?;
        let path = tier2_path(&dir, stage, key);
        let ttl = self.ttl;
        let loaded = tokio::task::spawn_blocking(move || read_tier2_file(&path, ttl)).await.ok()?;

        match loaded {
            Ok(Some(entry)) => {
                self.counters.tokens_saved.fetch_add(u64::from(entry.tokens_used), Ordering::Relaxed);
                let payload = entry.payload.clone();
                self.tier1.lock().expect("Cache.tier1: mutex poisoned").insert(key.to_string(), entry);
                Some(payload)
            }
            Ok(None) => None,
            Err(()) => {
                self.counters.corruption_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn store(&self, stage: Stage, key: String, payload: CachedPayload, tokens_used: u32) {
        let created_at_ms = now_ms();
        let size_bytes = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0);
        let entry = StoredEntry { payload, created_at_ms, tokens_used, size_bytes };

        self.tier1.lock().expect("Cache.tier1: mutex poisoned").insert(key.clone(), entry.clone());

        if let Some(dir) = self.dir.clone() {
            let path = tier2_path(&dir, stage, &key);
            let suffix = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
            let _ = tokio::task::spawn_blocking(move || write_tier2_file(&path, &entry, suffix)).await;
        }
    }
}

fn read_tier2_file(path: &Path, ttl: Duration) -> Result<Option<StoredEntry>, ()> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(_) => return Err(()),
    };
    let mut entry: StoredEntry = serde_json::from_slice(&bytes).map_err(|_| ())?;
    entry.size_bytes = bytes.len();

    let now = now_ms();
    if now.saturating_sub(entry.created_at_ms) > ttl.as_millis() as u64 {
        let _ = std::fs::remove_file(path);
        return Ok(None);
    }
    Ok(Some(entry))
}

fn write_tier2_file(path: &Path, entry: &StoredEntry, suffix: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("json.tmp.{}.{suffix}", std::process::id()));
    let bytes = serde_json::to_vec(entry)?;
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::Write::write_all(&mut file, &bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comparison, MnemonicStructure};
    use std::sync::atomic::AtomicU32;

    fn sample_stage1() -> Stage1Result {
        Stage1Result {
            phonetic: "kaet".into(),
            part_of_speech: "noun".into(),
            primary_meaning: "a small domesticated feline".into(),
            secondary_meanings: vec![],
            mnemonic: MnemonicStructure {
                metaphor: "a shadow".into(),
                location: "the windowsill".into(),
                anchor: "purring".into(),
            },
            comparison: Comparison { vs: "kitten".into(), nuance: "age".into() },
            homonyms: vec![],
            keywords: vec!["feline".into()],
        }
    }

    static TEST_DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("flashpipe-cache-test-{}-{id}", std::process::id()))
    }

    #[test]
    fn stage1_key_ignores_case_and_whitespace() {
        assert_eq!(stage1_cache_key("Cat", Some("noun")), stage1_cache_key(" cat ", Some("NOUN")));
    }

    #[test]
    fn stage2_key_is_stable_across_field_order() {
        let stage1 = sample_stage1();
        let key_a = stage2_cache_key("cat", &stage1).unwrap();
        let key_b = stage2_cache_key("cat", &stage1).unwrap();
        assert_eq!(key_a, key_b);
    }

    #[tokio::test]
    async fn save_then_get_round_trips_tier1_only() {
        let cache = Cache::new(CacheConfig::default());
        cache.save_stage1("cat", Some("noun"), sample_stage1(), 120).await;

        let got = cache.get_stage1("cat", Some("noun")).await;
        assert_eq!(got, Some(sample_stage1()));
        assert_eq!(cache.stats().hits_stage1, 1);
    }

    #[tokio::test]
    async fn miss_increments_miss_counter() {
        let cache = Cache::new(CacheConfig::default());
        assert!(cache.get_stage1("unknown", None).await.is_none());
        assert_eq!(cache.stats().misses_stage1, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_a_miss() {
        let mut config = CacheConfig::default();
        config.ttl = Duration::from_millis(1);
        let cache = Cache::new(config);
        cache.save_stage1("cat", None, sample_stage1(), 10).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get_stage1("cat", None).await.is_none());
    }

    #[tokio::test]
    async fn tier2_persists_across_cache_instances() {
        let dir = temp_dir();
        let config = CacheConfig { dir: Some(dir.clone()), ..CacheConfig::default() };

        let first = Cache::new(config.clone());
        first.save_stage1("cat", None, sample_stage1(), 50).await;

        let second = Cache::new(config);
        let got = second.get_stage1("cat", None).await;
        assert_eq!(got, Some(sample_stage1()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupt_tier2_file_counts_as_corruption_not_panic() {
        let dir = temp_dir();
        let key = stage1_cache_key("cat", None);
        let path = tier2_path(&dir, Stage::One, &key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        let config = CacheConfig { dir: Some(dir.clone()), ..CacheConfig::default() };
        let cache = Cache::new(config);

        assert!(cache.get_stage1("cat", None).await.is_none());
        assert_eq!(cache.stats().corruption_count, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn clear_drops_tier1_entries() {
        let cache = Cache::new(CacheConfig::default());
        cache.save_stage1("cat", None, sample_stage1(), 1).await;
        cache.clear();
        assert!(cache.get_stage1("cat", None).await.is_none());
    }
}
