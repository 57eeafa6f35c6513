//! Bounded caches for retrieval results and read-only tool outputs
//!
//! Keys are content-addressed: a SHA-256 over the canonical (sorted-key)
//! JSON encoding of the inputs, so argument ordering never splits cache
//! entries. Eviction is least-recently-used with a fixed capacity; the
//! policy is confined to [`BoundedCache`] so it can be swapped wholesale.

use std::collections::HashMap;

use parking_lot::Mutex;
use runway_core::RetrievedChunk;
use serde_json::Value;
use sha2::{Digest, Sha256};

const DEFAULT_CAPACITY: usize = 256;

/// JSON encoding with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let encoded: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", encoded.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Fixed-capacity LRU map.
struct BoundedCache<V> {
    capacity: usize,
    clock: u64,
    entries: HashMap<String, (u64, V)>,
}

impl<V: Clone> BoundedCache<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|(touched, value)| {
            *touched = clock;
            value.clone()
        })
    }

    fn insert(&mut self, key: String, value: V) {
        self.clock += 1;
        self.entries.insert(key, (self.clock, value));
        if self.entries.len() > self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (touched, _))| *touched)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Cache for retrieval results keyed by tenant, query, and depth.
pub struct RetrievalCache {
    inner: Mutex<BoundedCache<Vec<RetrievedChunk>>>,
}

impl RetrievalCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BoundedCache::new(DEFAULT_CAPACITY)),
        }
    }

    pub fn key(tenant_id: &str, query: &str, top_k: usize) -> String {
        hash_parts(&["retrieval", tenant_id, query, &top_k.to_string()])
    }

    pub fn lookup(&self, key: &str) -> Option<Vec<RetrievedChunk>> {
        self.inner.lock().get(key)
    }

    pub fn store(&self, key: String, chunks: Vec<RetrievedChunk>) {
        self.inner.lock().insert(key, chunks);
    }
}

impl Default for RetrievalCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache for read-only tool outputs keyed by tool name and canonical
/// arguments.
pub struct ToolResultCache {
    inner: Mutex<BoundedCache<Value>>,
}

impl ToolResultCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BoundedCache::new(DEFAULT_CAPACITY)),
        }
    }

    pub fn key(tool_name: &str, arguments: &Value) -> String {
        hash_parts(&["tool", tool_name, &canonical_json(arguments)])
    }

    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key)
    }

    /// Store the output unless another writer got there first; first write
    /// wins so replays observe one stable value.
    pub fn store(&self, key: String, output: Value) {
        let mut inner = self.inner.lock();
        if inner.get(&key).is_none() {
            inner.insert(key, output);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for ToolResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_tool_cache_key_ignores_argument_order() {
        let key_a = ToolResultCache::key("calculator", &json!({"a": 1, "b": 2}));
        let key_b = ToolResultCache::key("calculator", &json!({"b": 2, "a": 1}));
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn test_first_write_wins() {
        let cache = ToolResultCache::new();
        let key = ToolResultCache::key("calculator", &json!({"a": 1}));
        cache.store(key.clone(), json!({"result": 1}));
        cache.store(key.clone(), json!({"result": 2}));
        assert_eq!(cache.lookup(&key), Some(json!({"result": 1})));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        // Touch "a" so "b" is the eviction candidate.
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
    }
}
