//! Memoizing cache for the context-size decision (spec §4.4: "Cache
//! `(filename, modelSizeBytes, requested) → chosen` for 5 minutes").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    filename: String,
    model_size_bytes: u64,
    requested_context_size: u32,
}

struct CacheEntry {
    chosen: u32,
    was_reduced: bool,
    inserted_at: Instant,
}

/// Read-only lookup never mutates the cache; expired entries are only
/// cleared out lazily on the next write that would have collided with them,
/// matching the teacher's "check then replace" pattern for similar caches.
#[derive(Default)]
pub struct ContextSizeCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ContextSizeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, filename: &str, model_size_bytes: u64, requested_context_size: u32) -> Option<(u32, bool)> {
        let key = CacheKey { filename: filename.to_string(), model_size_bytes, requested_context_size };
        let entries = self.entries.lock().unwrap();
        entries.get(&key).and_then(|entry| {
            if entry.inserted_at.elapsed() < CACHE_TTL {
                Some((entry.chosen, entry.was_reduced))
            } else {
                None
            }
        })
    }

    pub fn put(&self, filename: &str, model_size_bytes: u64, requested_context_size: u32, chosen: u32, was_reduced: bool) {
        let key = CacheKey { filename: filename.to_string(), model_size_bytes, requested_context_size };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, CacheEntry { chosen, was_reduced, inserted_at: Instant::now() });
    }

    /// `clearContextSizeCache` (spec §6).
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit_after_put() {
        let cache = ContextSizeCache::new();
        assert!(cache.get("x.gguf", 1024, 4096).is_none());
        cache.put("x.gguf", 1024, 4096, 2048, true);
        assert_eq!(cache.get("x.gguf", 1024, 4096), Some((2048, true)));
    }

    #[test]
    fn clear_empties_all_entries() {
        let cache = ContextSizeCache::new();
        cache.put("x.gguf", 1024, 4096, 2048, true);
        cache.clear();
        assert!(cache.get("x.gguf", 1024, 4096).is_none());
    }

    #[test]
    fn different_keys_do_not_collide() {
        let cache = ContextSizeCache::new();
        cache.put("x.gguf", 1024, 4096, 2048, true);
        assert!(cache.get("x.gguf", 1024, 8192).is_none());
        assert!(cache.get("y.gguf", 1024, 4096).is_none());
    }
}
