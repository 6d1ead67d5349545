//! Open-addressed hash table.
//!
//! Linear probing over a power-of-two slot array. The table rehashes when
//! live entries exceed 3/4 of the capacity, and compacts (same capacity)
//! when live entries plus tombstones exceed 9/10.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MIN_CAPACITY: usize = 8;

enum Slot<K, V> {
    Empty,
    Tombstone,
    Occupied(K, V),
}

pub struct HTable<K, V> {
    slots: Vec<Slot<K, V>>,
    /// Live entries.
    len: usize,
    /// Live entries plus tombstones.
    used: usize,
}

impl<K: Hash + Eq, V> Default for HTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V> HTable<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn hash(key: &K) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Probe for `key`. Returns the occupied slot index, or the slot where
    /// an insert should land (first tombstone on the way, else the empty).
    fn probe(&self, key: &K) -> (Option<usize>, usize) {
        debug_assert!(!self.slots.is_empty());
        let mut idx = Self::hash(key) as usize & self.mask();
        let mut insert_at = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return (None, insert_at.unwrap_or(idx)),
                Slot::Tombstone => {
                    if insert_at.is_none() {
                        insert_at = Some(idx);
                    }
                }
                Slot::Occupied(k, _) => {
                    if k == key {
                        return (Some(idx), idx);
                    }
                }
            }
            idx = (idx + 1) & self.mask();
        }
    }

    fn rehash(&mut self, capacity: usize) {
        let old = std::mem::replace(
            &mut self.slots,
            (0..capacity).map(|_| Slot::Empty).collect(),
        );
        self.used = self.len;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                let (_, at) = self.probe(&k);
                self.slots[at] = Slot::Occupied(k, v);
            }
        }
    }

    fn reserve_one(&mut self) {
        let cap = self.slots.len();
        if cap == 0 {
            self.rehash(MIN_CAPACITY);
        } else if (self.len + 1) * 4 > cap * 3 {
            self.rehash(cap * 2);
        } else if (self.used + 1) * 10 > cap * 9 {
            // mostly tombstones, compact in place
            self.rehash(cap);
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.reserve_one();
        let (found, at) = self.probe(&key);
        match found {
            Some(idx) => match std::mem::replace(&mut self.slots[idx], Slot::Occupied(key, value))
            {
                Slot::Occupied(_, old) => Some(old),
                _ => unreachable!(),
            },
            None => {
                if matches!(self.slots[at], Slot::Empty) {
                    self.used += 1;
                }
                self.slots[at] = Slot::Occupied(key, value);
                self.len += 1;
                None
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        let (found, _) = self.probe(key);
        found.map(|idx| match &self.slots[idx] {
            Slot::Occupied(_, v) => v,
            _ => unreachable!(),
        })
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.slots.is_empty() {
            return None;
        }
        let (found, _) = self.probe(key);
        found.map(move |idx| match &mut self.slots[idx] {
            Slot::Occupied(_, v) => v,
            _ => unreachable!(),
        })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if self.slots.is_empty() {
            return None;
        }
        let (found, _) = self.probe(key);
        let idx = found?;
        match std::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied(_, v) => {
                self.len -= 1;
                Some(v)
            }
            _ => unreachable!(),
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.len = 0;
        self.used = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut t: HTable<u32, String> = HTable::new();
        assert!(t.is_empty());
        assert_eq!(t.insert(7, "seven".to_string()), None);
        assert_eq!(t.insert(7, "VII".to_string()), Some("seven".to_string()));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&7).map(String::as_str), Some("VII"));
        assert_eq!(t.remove(&7), Some("VII".to_string()));
        assert_eq!(t.remove(&7), None);
        assert!(t.is_empty());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t: HTable<u64, u64> = HTable::new();
        for i in 0..1000 {
            t.insert(i, i * 2);
        }
        assert_eq!(t.len(), 1000);
        for i in 0..1000 {
            assert_eq!(t.get(&i), Some(&(i * 2)));
        }
        // capacity is a power of two and load stays at or below 3/4
        assert!(t.slots.len().is_power_of_two());
        assert!(t.len() * 4 <= t.slots.len() * 3);
    }

    #[test]
    fn tombstone_churn_compacts() {
        let mut t: HTable<u32, u32> = HTable::new();
        // repeated insert/remove of disjoint keys must not degrade probes
        for round in 0..100u32 {
            for i in 0..16u32 {
                t.insert(round * 16 + i, i);
            }
            for i in 0..16u32 {
                assert_eq!(t.remove(&(round * 16 + i)), Some(i));
            }
        }
        assert!(t.is_empty());
        // the slot array stayed bounded despite 1600 dead entries
        assert!(t.slots.len() <= 64);
    }

    #[test]
    fn string_keys() {
        let mut t: HTable<String, u32> = HTable::new();
        t.insert("4e:aa:00:12".to_string(), 1);
        t.insert("4e:aa:00:13".to_string(), 2);
        assert_eq!(t.get(&"4e:aa:00:13".to_string()), Some(&2));
        assert_eq!(t.iter().count(), 2);
    }
}
