//! Process-wide read-through cache of recently loaded streams.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::event::WritableEvent;

/// A detached copy of a stream's committed state, safe to hand out across
/// units of work. Staged events and children are never cached.
#[derive(Debug, Clone)]
pub struct CachedStream {
    /// Version of the last committed event (-1 if the stream is empty).
    pub committed_version: i64,
    /// Committed events in version order.
    pub events: Vec<WritableEvent>,
}

/// Read-through cache keyed by remote stream name.
///
/// Shared process-wide by the store client and snapshot store, mutated by
/// any worker: every write path evicts the touched stream so readers never
/// observe a stale version for longer than one load. Clone is cheap; all
/// clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct StreamCache {
    entries: Arc<RwLock<HashMap<String, CachedStream>>>,
}

impl StreamCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a stream by name, returning a detached copy on hit.
    pub fn retrieve(&self, stream_name: &str) -> Option<CachedStream> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let hit = entries.get(stream_name).cloned();
        if hit.is_some() {
            tracing::debug!(stream = %stream_name, "stream cache hit");
        } else {
            tracing::debug!(stream = %stream_name, "stream cache miss");
        }
        hit
    }

    /// Insert or replace the cached copy of a stream.
    pub fn insert(&self, stream_name: &str, cached: CachedStream) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(stream_name.to_string(), cached);
    }

    /// Remove a stream from the cache. Called on every write to the stream.
    pub fn evict(&self, stream_name: &str) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .remove(stream_name);
    }

    /// Number of cached streams.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(version: i64) -> CachedStream {
        CachedStream {
            committed_version: version,
            events: Vec::new(),
        }
    }

    #[test]
    fn retrieve_returns_inserted_copy() {
        let cache = StreamCache::new();
        cache.insert("default-order-42", cached(3));

        let hit = cache.retrieve("default-order-42").expect("should hit");
        assert_eq!(hit.committed_version, 3);
    }

    #[test]
    fn retrieve_misses_unknown_stream() {
        let cache = StreamCache::new();
        assert!(cache.retrieve("nope").is_none());
    }

    #[test]
    fn evict_removes_entry() {
        let cache = StreamCache::new();
        cache.insert("s", cached(1));
        cache.evict("s");
        assert!(cache.retrieve("s").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_unknown_stream_is_noop() {
        let cache = StreamCache::new();
        cache.evict("never-cached");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn clones_share_state() {
        let cache = StreamCache::new();
        let other = cache.clone();
        cache.insert("s", cached(2));
        assert!(other.retrieve("s").is_some());
        other.evict("s");
        assert!(cache.retrieve("s").is_none());
    }

    #[test]
    fn insert_replaces_existing_entry() {
        let cache = StreamCache::new();
        cache.insert("s", cached(1));
        cache.insert("s", cached(5));
        assert_eq!(cache.retrieve("s").unwrap().committed_version, 5);
        assert_eq!(cache.len(), 1);
    }
}
