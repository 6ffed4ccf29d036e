//! In-memory key/record storage shared by the server (master lookups), the
//! scheduler (remaster verification) and the workers (execution).
//!
//! The map is sharded under `RwLock`s; the deterministic lock manager above
//! it guarantees writers never race on a key, so the locks only make the
//! sharing sound.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use crate::types::{Key, MasterMetadata, Record};

const NUM_SHARDS: usize = 16;

pub struct MemStorage {
    shards: Vec<RwLock<HashMap<Key, Record>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &Key) -> &RwLock<HashMap<Key, Record>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    pub fn read(&self, key: &Key) -> Option<Record> {
        self.shard(key).read().unwrap().get(key).cloned()
    }

    pub fn write(&self, key: Key, record: Record) {
        self.shard(&key).write().unwrap().insert(key, record);
    }

    pub fn delete(&self, key: &Key) -> bool {
        self.shard(key).write().unwrap().remove(key).is_some()
    }

    pub fn master_metadata(&self, key: &Key) -> Option<MasterMetadata> {
        self.shard(key)
            .read()
            .unwrap()
            .get(key)
            .map(|record| record.metadata)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}
