//! Open addressing hash table mapping lattice coordinates to dense vertex indices.

/// Marks an empty slot in [`HashTable::entries`].
const EMPTY: usize = usize::MAX;

/// Stores each inserted key once, contiguously in `keys`, and hands out indices in
/// insertion order. Keys are the first `key_size` coordinates of a lattice point, the
/// last one being implied by the points lying on the `x_0 + ... + x_d = 0` hyperplane.
#[derive(Debug, Clone)]
pub(crate) struct HashTable {
    key_size: usize,
    keys: Vec<i32>,
    entries: Vec<usize>,
}

impl HashTable {
    pub(crate) fn new(key_size: usize, capacity_hint: usize) -> Self {
        let capacity = (2 * capacity_hint.max(8)).next_power_of_two();
        HashTable {
            key_size,
            keys: Vec::with_capacity(capacity_hint * key_size),
            entries: vec![EMPTY; capacity],
        }
    }

    /// Number of distinct keys stored.
    pub(crate) fn len(&self) -> usize {
        self.keys.len() / self.key_size
    }

    /// The key stored at index `i`.
    pub(crate) fn key(&self, i: usize) -> &[i32] {
        &self.keys[i * self.key_size..(i + 1) * self.key_size]
    }

    fn hash(key: &[i32]) -> usize {
        key.iter().fold(0usize, |acc, &k| {
            acc.wrapping_add(k as usize).wrapping_mul(2_531_011)
        })
    }

    fn slot(&self, key: &[i32]) -> (usize, Option<usize>) {
        let mask = self.entries.len() - 1;
        let mut h = Self::hash(key) & mask;
        loop {
            match self.entries[h] {
                EMPTY => return (h, None),
                index if self.key(index) == key => return (h, Some(index)),
                _ => h = (h + 1) & mask,
            }
        }
    }

    /// Looks up `key`, returning its index if present.
    pub(crate) fn find(&self, key: &[i32]) -> Option<usize> {
        self.slot(&key[..self.key_size]).1
    }

    /// Looks up `key`, inserting it if it is not present yet.
    pub(crate) fn find_or_insert(&mut self, key: &[i32]) -> usize {
        let key = &key[..self.key_size];
        match self.slot(key) {
            (_, Some(index)) => index,
            (slot, None) => {
                let index = self.len();
                self.keys.extend_from_slice(key);
                self.entries[slot] = index;
                if 2 * self.len() >= self.entries.len() {
                    self.grow();
                }
                index
            }
        }
    }

    fn grow(&mut self) {
        let capacity = 2 * self.entries.len();
        let mask = capacity - 1;
        let mut entries = vec![EMPTY; capacity];
        for index in 0..self.len() {
            let mut h = Self::hash(self.key(index)) & mask;
            while entries[h] != EMPTY {
                h = (h + 1) & mask;
            }
            entries[h] = index;
        }
        self.entries = entries;
    }
}
