use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

const SHARD_COUNT: usize = 64;

/// Hash map split into reference-counted shards.
///
/// Cloning copies only the shard pointers. A write clones the one shard it touches if that shard
/// is still shared with another map, so a working copy of a large graph pays for what it changes.
pub struct ShardedMap<K, V> {
    shards: Box<[Arc<HashMap<K, V>>]>,
    len: usize,
}

impl<K, V> Clone for ShardedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shards: self.shards.clone(),
            len: self.len,
        }
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.shards.iter().flat_map(|shard| shard.iter()))
            .finish()
    }
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Arc::new(HashMap::new())).collect(),
            len: 0,
        }
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn shard_of(key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.shards[Self::shard_of(key)].get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shards[Self::shard_of(key)].contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let shard = Arc::make_mut(&mut self.shards[Self::shard_of(&key)]);
        let previous = shard.insert(key, value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = Self::shard_of(key);
        if !self.shards[idx].contains_key(key) {
            return None;
        }
        let removed = Arc::make_mut(&mut self.shards[idx]).remove(key);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Mutable access to the value for `key`, inserting `default()` first if absent.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        let idx = Self::shard_of(&key);
        let shard = Arc::make_mut(&mut self.shards[idx]);
        if !shard.contains_key(&key) {
            self.len += 1;
        }
        shard.entry(key).or_insert_with(default)
    }

    /// Apply `update` to the value for `key`; the entry is dropped when `update` returns `false`.
    pub fn update_or_remove(&mut self, key: &K, update: impl FnOnce(&mut V) -> bool) {
        let idx = Self::shard_of(key);
        if !self.shards[idx].contains_key(key) {
            return;
        }
        let shard = Arc::make_mut(&mut self.shards[idx]);
        let keep = match shard.get_mut(key) {
            Some(value) => update(value),
            None => return,
        };
        if !keep {
            shard.remove(key);
            self.len -= 1;
        }
    }

    pub fn clear(&mut self) {
        for shard in self.shards.iter_mut() {
            if !shard.is_empty() {
                *shard = Arc::new(HashMap::new());
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.shards.iter().flat_map(|shard| shard.iter())
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    #[cfg(test)]
    fn shares_shard_with(&self, other: &Self, key: &K) -> bool {
        let idx = Self::shard_of(key);
        Arc::ptr_eq(&self.shards[idx], &other.shards[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_untouched_shards() {
        let mut base: ShardedMap<u32, u32> = ShardedMap::default();
        for i in 0..1000 {
            base.insert(i, i);
        }
        let mut copy = base.clone();
        copy.insert(7, 70);

        assert_eq!(base.get(&7), Some(&7));
        assert_eq!(copy.get(&7), Some(&70));
        assert!(!copy.shares_shard_with(&base, &7));

        let untouched = (0..1000u32)
            .filter(|key| copy.shares_shard_with(&base, key))
            .count();
        assert!(untouched > 900, "only one shard should be copied");
    }

    #[test]
    fn len_tracks_inserts_and_removes() {
        let mut map: ShardedMap<&str, u32> = ShardedMap::default();
        map.insert("a", 1);
        map.insert("a", 2);
        map.insert("b", 3);
        assert_eq!(map.len(), 2);

        map.remove(&"a");
        map.remove(&"missing");
        assert_eq!(map.len(), 1);

        *map.get_or_insert_with("c", || 0) += 5;
        assert_eq!(map.get(&"c"), Some(&5));
        assert_eq!(map.len(), 2);

        map.update_or_remove(&"c", |_| false);
        assert_eq!(map.len(), 1);
        assert!(!map.contains_key(&"c"));

        map.clear();
        assert_eq!(map.len(), 0);
        assert_eq!(map.keys().count(), 0);
    }
}
