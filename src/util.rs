use dashmap::DashMap;

/// A bijective concurrent map: at most one value per key and one key per
/// value. Used for the client-connection <-> player association.
pub struct OneOneDashMap<K, V> {
    forward: DashMap<K, V>,
    backward: DashMap<V, K>,
}

impl<K, V> OneOneDashMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: std::hash::Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            forward: DashMap::new(),
            backward: DashMap::new(),
        }
    }

    pub fn get_by_key(&self, key: &K) -> Option<V> {
        self.forward.get(key).map(|v| v.clone())
    }

    pub fn get_by_value(&self, value: &V) -> Option<K> {
        self.backward.get(value).map(|k| k.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.backward.contains_key(value)
    }

    /// Insert the pair only if neither side is present yet.
    pub fn try_insert(&self, key: K, value: V) -> bool {
        if self.forward.contains_key(&key) || self.backward.contains_key(&value) {
            return false;
        }
        self.forward.insert(key.clone(), value.clone());
        self.backward.insert(value, key);
        true
    }

    pub fn remove_by_key(&self, key: &K) -> Option<V> {
        if let Some((_, value)) = self.forward.remove(key) {
            self.backward.remove(&value);
            return Some(value);
        }
        None
    }

    pub fn remove_by_value(&self, value: &V) -> Option<K> {
        if let Some((_, key)) = self.backward.remove(value) {
            self.forward.remove(&key);
            return Some(key);
        }
        None
    }
}

impl<K, V> Default for OneOneDashMap<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: std::hash::Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_both_ways() {
        let map: OneOneDashMap<u32, String> = OneOneDashMap::new();
        assert!(map.try_insert(1, "a".to_string()));
        assert_eq!(map.get_by_key(&1), Some("a".to_string()));
        assert_eq!(map.get_by_value(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_rejects_duplicate_on_either_side() {
        let map: OneOneDashMap<u32, String> = OneOneDashMap::new();
        assert!(map.try_insert(1, "a".to_string()));
        assert!(!map.try_insert(1, "b".to_string()));
        assert!(!map.try_insert(2, "a".to_string()));
        assert!(map.try_insert(2, "b".to_string()));
    }

    #[test]
    fn test_remove_clears_both_directions() {
        let map: OneOneDashMap<u32, String> = OneOneDashMap::new();
        map.try_insert(1, "a".to_string());
        assert_eq!(map.remove_by_key(&1), Some("a".to_string()));
        assert!(!map.contains_key(&1));
        assert!(!map.contains_value(&"a".to_string()));

        map.try_insert(2, "b".to_string());
        assert_eq!(map.remove_by_value(&"b".to_string()), Some(2));
        assert!(!map.contains_key(&2));
    }
}
