//! Generic concurrent hash table (GHT).
//!
//! A chained hash table keyed by `u64` (file descriptor, client id,
//! user id, session id or a string hash) behind one mutex per table.
//!
//! ```text
//!   slots: [ Entry | None | Entry | ... ]      (first entry stored inline)
//!              │              │
//!              ▼              ▼
//!            Box<Entry>     Box<Entry> → Box<Entry>   (collision chain)
//! ```
//!
//! # Contract
//!
//! - `insert` never overwrites: a duplicate key is handed back to the caller.
//! - The load factor `count / size` is kept inside `[MIN_LOAD, MAX_LOAD]`
//!   by doubling on insert and halving on delete, never below the initial
//!   size. The resize happens while the lock of the triggering call is held.
//! - Deleting an inline entry splices its successor into the slot, so a slot
//!   is either empty or holds a live entry.
//! - In owning mode the destructor runs exactly once per value: on `delete`,
//!   `clear`, or when the table is dropped. `remove` hands the value back
//!   and skips the destructor.

use parking_lot::Mutex;
use tracing::warn;

/// Grow when `count / size` exceeds this.
pub const MAX_LOAD: f64 = 0.7;
/// Shrink when `count / size` falls below this.
pub const MIN_LOAD: f64 = 0.2;

/// djb2 string hash (`hash * 33 + c`, seeded with 5381).
///
/// Used to key string identifiers into the table.
pub fn hash_str(s: &str) -> u64 {
    s.bytes().fold(5381u64, |hash, c| {
        (hash << 5).wrapping_add(hash).wrapping_add(c as u64)
    })
}

/// Value destructor for owning tables.
pub type Destructor<V> = Box<dyn Fn(V) + Send + Sync>;

struct Entry<V> {
    key: u64,
    value: V,
    next: Option<Box<Entry<V>>>,
}

struct Table<V> {
    slots: Vec<Option<Entry<V>>>,
    count: usize,
}

impl<V> Table<V> {
    fn with_size(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self { slots, count: 0 }
    }

    #[inline]
    fn index(&self, key: u64) -> usize {
        (key % self.slots.len() as u64) as usize
    }

    #[inline]
    fn load(&self) -> f64 {
        self.count as f64 / self.slots.len() as f64
    }

    fn find(&self, key: u64) -> Option<&V> {
        let mut cursor = self.slots[self.index(key)].as_ref();
        while let Some(entry) = cursor {
            if entry.key == key {
                return Some(&entry.value);
            }
            cursor = entry.next.as_deref();
        }
        None
    }

    fn find_mut(&mut self, key: u64) -> Option<&mut V> {
        let idx = self.index(key);
        let mut cursor = self.slots[idx].as_mut();
        while let Some(entry) = cursor {
            if entry.key == key {
                return Some(&mut entry.value);
            }
            cursor = entry.next.as_deref_mut();
        }
        None
    }

    /// Links an entry without a duplicate check.
    fn link(&mut self, key: u64, value: V) {
        let idx = self.index(key);
        let slot = &mut self.slots[idx];
        if let Some(head) = slot.as_mut() {
            let next = head.next.take();
            head.next = Some(Box::new(Entry { key, value, next }));
        } else {
            *slot = Some(Entry { key, value, next: None });
        }
        self.count += 1;
    }

    fn unlink(&mut self, key: u64) -> Option<V> {
        let idx = self.index(key);

        let head_matches = matches!(&self.slots[idx], Some(e) if e.key == key);
        if head_matches {
            let head = self.slots[idx].take()?;
            let Entry { value, next, .. } = head;
            // Splice the successor into the vacated slot.
            self.slots[idx] = next.map(|boxed| *boxed);
            self.count -= 1;
            return Some(value);
        }

        let mut cursor = self.slots[idx].as_mut()?;
        loop {
            let next_matches = matches!(&cursor.next, Some(n) if n.key == key);
            if next_matches {
                let removed = cursor.next.take()?;
                let Entry { value, next, .. } = *removed;
                cursor.next = next;
                self.count -= 1;
                return Some(value);
            }
            cursor = cursor.next.as_deref_mut()?;
        }
    }

    /// Moves every entry out of the table, leaving it empty.
    fn take_all(&mut self) -> Vec<(u64, V)> {
        let mut out = Vec::with_capacity(self.count);
        for slot in self.slots.iter_mut() {
            let mut cursor = slot.take().map(Box::new);
            while let Some(entry) = cursor {
                let Entry { key, value, next } = *entry;
                out.push((key, value));
                cursor = next;
            }
        }
        self.count = 0;
        out
    }

    fn rehash(&mut self, new_size: usize) {
        let old_count = self.count;
        let entries = self.take_all();
        *self = Table::with_size(new_size);
        for (key, value) in entries {
            self.link(key, value);
        }
        if self.count != old_count {
            warn!(
                old_count,
                new_count = self.count,
                "ght: entry count changed across rehash"
            );
        }
    }
}

/// Mutex-guarded chained hash table keyed by `u64`.
pub struct ConcurrentMap<V> {
    table: Mutex<Table<V>>,
    min_size: usize,
    destructor: Option<Destructor<V>>,
}

impl<V> ConcurrentMap<V> {
    /// Create a borrowing table with `size` initial slots.
    ///
    /// `size` is also the floor for shrinking.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            table: Mutex::new(Table::with_size(size)),
            min_size: size,
            destructor: None,
        }
    }

    /// Create an owning table; `destructor` receives every value the table
    /// disposes of.
    pub fn with_destructor<F>(size: usize, destructor: F) -> Self
    where
        F: Fn(V) + Send + Sync + 'static,
    {
        let mut map = Self::new(size);
        map.destructor = Some(Box::new(destructor));
        map
    }

    /// Insert `value` under `key`.
    ///
    /// Returns the value back if `key` is already present; the existing
    /// entry is left untouched.
    pub fn insert(&self, key: u64, value: V) -> Result<(), V> {
        let mut table = self.table.lock();
        if table.find(key).is_some() {
            return Err(value);
        }
        table.link(key, value);
        if table.load() > MAX_LOAD {
            let new_size = table.slots.len() * 2;
            table.rehash(new_size);
        }
        Ok(())
    }

    /// Delete `key`, disposing of its value. Returns `false` if absent.
    pub fn delete(&self, key: u64) -> bool {
        match self.remove(key) {
            Some(value) => {
                self.dispose(value);
                true
            }
            None => false,
        }
    }

    /// Remove `key` and hand its value to the caller (no destructor).
    pub fn remove(&self, key: u64) -> Option<V> {
        let mut table = self.table.lock();
        let value = table.unlink(key)?;
        let size = table.slots.len();
        if table.load() < MIN_LOAD && size / 2 >= self.min_size {
            table.rehash(size / 2);
        }
        Some(value)
    }

    /// Run `f` on the value for `key` while the table lock is held.
    pub fn with<R>(&self, key: u64, f: impl FnOnce(&V) -> R) -> Option<R> {
        let table = self.table.lock();
        table.find(key).map(f)
    }

    /// Run `f` on a mutable reference to the value for `key`.
    pub fn update<R>(&self, key: u64, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut table = self.table.lock();
        table.find_mut(key).map(f)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.table.lock().find(key).is_some()
    }

    /// First value (in slot order) matching `pred`, cloned out.
    pub fn find(&self, mut pred: impl FnMut(&V) -> bool) -> Option<V>
    where
        V: Clone,
    {
        let table = self.table.lock();
        for slot in &table.slots {
            let mut cursor = slot.as_ref();
            while let Some(entry) = cursor {
                if pred(&entry.value) {
                    return Some(entry.value.clone());
                }
                cursor = entry.next.as_deref();
            }
        }
        None
    }

    /// Visit every live entry under the lock.
    pub fn for_each(&self, mut f: impl FnMut(u64, &V)) {
        let table = self.table.lock();
        for slot in &table.slots {
            let mut cursor = slot.as_ref();
            while let Some(entry) = cursor {
                f(entry.key, &entry.value);
                cursor = entry.next.as_deref();
            }
        }
    }

    /// All keys currently present.
    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        self.for_each(|key, _| keys.push(key));
        keys
    }

    /// Dispose of every value and reset to the initial size.
    pub fn clear(&self) {
        let entries = {
            let mut table = self.table.lock();
            let entries = table.take_all();
            *table = Table::with_size(self.min_size);
            entries
        };
        for (_, value) in entries {
            self.dispose(value);
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of slots.
    pub fn size(&self) -> usize {
        self.table.lock().slots.len()
    }

    fn dispose(&self, value: V) {
        if let Some(destructor) = &self.destructor {
            destructor(value);
        }
    }
}

impl<V: Clone> ConcurrentMap<V> {
    /// Clone of the value for `key`.
    ///
    /// Values are usually `Arc`s or small ids, so this is a refcount bump.
    pub fn get(&self, key: u64) -> Option<V> {
        self.table.lock().find(key).cloned()
    }
}

impl<V> Drop for ConcurrentMap<V> {
    fn drop(&mut self) {
        if self.destructor.is_none() {
            return;
        }
        let entries = self.table.get_mut().take_all();
        for (_, value) in entries {
            self.dispose(value);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_hash_str_djb2() {
        assert_eq!(hash_str(""), 5381);
        assert_eq!(hash_str("a"), 5381 * 33 + 97);
        assert_ne!(hash_str("login"), hash_str("logout"));
    }

    #[test]
    fn test_insert_get_delete() {
        let map = ConcurrentMap::new(8);
        assert!(map.insert(1, "one").is_ok());
        assert!(map.insert(9, "nine").is_ok()); // same slot as 1
        assert_eq!(map.get(1), Some("one"));
        assert_eq!(map.get(9), Some("nine"));
        assert_eq!(map.len(), 2);

        assert!(map.delete(1));
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(9), Some("nine"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let map = ConcurrentMap::new(8);
        assert!(map.insert(42, "first").is_ok());
        assert_eq!(map.insert(42, "second"), Err("second"));
        assert_eq!(map.get(42), Some("first"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_delete_missing_key() {
        let map = ConcurrentMap::new(8);
        map.insert(1, 10u32).unwrap();
        assert!(!map.delete(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_delete_middle_of_chain() {
        let map = ConcurrentMap::new(4);
        // 0, 4, 8 collide in a 4-slot table (before any resize).
        map.insert(0, 'a').unwrap();
        map.insert(4, 'b').unwrap();
        assert!(map.delete(4));
        assert!(map.delete(0));
        assert!(map.is_empty());
        assert!(!map.delete(0));
    }

    #[test]
    fn test_resize_preserves_entries() {
        let map = ConcurrentMap::new(4);
        let mut expected = HashMap::new();

        for key in 0..200u64 {
            let key = key * 7 + 3;
            map.insert(key, key * 10).unwrap();
            expected.insert(key, key * 10);
        }
        assert!(map.size() > 4);
        assert!(map.len() as f64 / map.size() as f64 <= MAX_LOAD);

        for key in 0..180u64 {
            let key = key * 7 + 3;
            assert!(map.delete(key));
            expected.remove(&key);
        }
        assert_eq!(map.len(), expected.len());
        for (key, value) in &expected {
            assert_eq!(map.get(*key), Some(*value));
        }
        let mut keys = map.keys();
        keys.sort_unstable();
        let mut want: Vec<u64> = expected.keys().copied().collect();
        want.sort_unstable();
        assert_eq!(keys, want);
    }

    #[test]
    fn test_shrink_floor() {
        let map = ConcurrentMap::new(16);
        for key in 0..64 {
            map.insert(key, ()).unwrap();
        }
        for key in 0..64 {
            assert!(map.delete(key));
        }
        assert_eq!(map.size(), 16);
    }

    #[test]
    fn test_destructor_called_once() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped);
        let map = ConcurrentMap::with_destructor(4, move |_v: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for key in 0..10 {
            map.insert(key, key as u32).unwrap();
        }
        assert!(map.delete(3));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        // remove hands ownership back, no destructor
        assert_eq!(map.remove(4), Some(4));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        drop(map);
        assert_eq!(dropped.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_update_and_find() {
        let map = ConcurrentMap::new(8);
        map.insert(5, 1u32).unwrap();
        map.insert(6, 2u32).unwrap();
        let updated = map.update(5, |v| {
            *v += 10;
            *v
        });
        assert_eq!(updated, Some(11));
        assert_eq!(map.find(|v| *v == 2), Some(2));
        assert_eq!(map.find(|v| *v == 99), None);
    }

    #[test]
    fn test_concurrent_inserts() {
        let map = Arc::new(ConcurrentMap::new(8));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        map.insert(t * 1000 + i, i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 1000);
        assert_eq!(map.get(3249), Some(249));
    }
}
