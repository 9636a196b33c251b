//! An open-addressing hash table from interned strings to [Value]s.
//!
//! This is the table behind the VM's globals and the string interner itself. Keys are
//! [interned][crate::heap::Heap] strings, so lookups compare keys by pointer; the one
//! content-based probe is [Table::find_string], which the interner uses *before* a string has
//! been interned.
//!
//! Capacity is always a power of two (starting at 8) so the probe sequence can mask instead of
//! dividing, and the table grows once it is 3/4 full. Deletion leaves a tombstone so probe
//! chains stay intact.

use crate::object::{Gc, ObaString};
use crate::value::Value;

const MIN_CAPACITY: usize = 8;

/// A hash table owned by the VM.
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    key: Option<Gc<ObaString>>,
    value: Value,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Entry {
    /// An entry that has never held a key. A tombstone differs: its key is also `None`, but its
    /// value is `true`.
    fn vacant() -> Entry {
        Entry {
            key: None,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !matches!(self.value, Value::Nil)
    }
}

impl Table {
    /// Return a new, empty [Table].
    pub fn new() -> Table {
        Table::default()
    }

    /// Look up `key`. The key must come from the same interner as the keys stored here.
    pub fn get(&self, key: &Gc<ObaString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }

        let entry = &self.entries[self.find_slot(key)];
        entry.key.as_ref().map(|_| entry.value.clone())
    }

    /// Insert or overwrite `key`. Returns true if the key was not present before.
    pub fn set(&mut self, key: Gc<ObaString>, value: Value) -> bool {
        if (self.count + 1) * 4 > self.entries.len() * 3 {
            self.grow();
        }

        let slot = self.find_slot(&key);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }

        *entry = Entry {
            key: Some(key),
            value,
        };
        is_new
    }

    /// Remove `key`, leaving a tombstone. Returns true if the key was present.
    pub fn delete(&mut self, key: &Gc<ObaString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }

        let slot = self.find_slot(key);
        let entry = &mut self.entries[slot];
        if entry.key.is_none() {
            return false;
        }

        *entry = Entry {
            key: None,
            value: Value::Boolean(true),
        };
        true
    }

    /// Content-based lookup of a key: the interner's "is this string already here?" probe.
    pub fn find_string(&self, text: &str, hash: u32) -> Option<Gc<ObaString>> {
        if self.entries.is_empty() {
            return None;
        }

        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    // A truly vacant slot ends the probe chain; a tombstone does not.
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if key.hash() == hash && key.as_str() == text {
                        return Some(Gc::clone(key));
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// The slot where `key` lives, or where it would be inserted: either its own entry, or the
    /// first tombstone on its probe chain, or the vacant slot that ends the chain.
    fn find_slot(&self, key: &Gc<ObaString>) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = key.hash() as usize & mask;
        let mut tombstone = None;

        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    if entry.is_tombstone() {
                        tombstone.get_or_insert(index);
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(candidate) => {
                    if Gc::ptr_eq(candidate, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Double the capacity and rehash. Tombstones are not carried over, so `count` can shrink.
    fn grow(&mut self) {
        let new_capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::vacant(); new_capacity]);

        self.count = 0;
        for entry in old_entries {
            if let Some(key) = entry.key {
                self.count += 1;
                let slot = self.find_slot(&key);
                self.entries[slot] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
            }
        }
    }
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("answer");

        assert!(table.get(&key).is_none());
        assert!(table.set(Gc::clone(&key), Value::from(41.0)));
        // Overwriting is not a new insertion.
        assert!(!table.set(Gc::clone(&key), Value::from(42.0)));

        let value = table.get(&key).expect("key should be present");
        assert!(value.oba_equal(&Value::from(42.0)));
    }

    #[test]
    fn delete_leaves_other_keys_reachable() {
        let mut heap = Heap::new();
        let mut table = Table::new();

        let keys: Vec<_> = (0..32).map(|i| heap.intern(&format!("key{i}"))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(Gc::clone(key), Value::from(i as f64));
        }

        // Delete every other key...
        for key in keys.iter().step_by(2) {
            assert!(table.delete(key));
            assert!(!table.delete(key), "double delete should report absence");
        }

        // ...and the rest must still be found, even through tombstones.
        for (i, key) in keys.iter().enumerate() {
            let value = table.get(key);
            if i % 2 == 0 {
                assert!(value.is_none());
            } else {
                assert!(value.expect("odd keys survive").oba_equal(&Value::from(i as f64)));
            }
        }
    }

    #[test]
    fn growth_keeps_everything() {
        let mut heap = Heap::new();
        let mut table = Table::new();

        let keys: Vec<_> = (0..200).map(|i| heap.intern(&format!("global{i}"))).collect();
        for (i, key) in keys.iter().enumerate() {
            assert!(table.set(Gc::clone(key), Value::from(i as f64)));
        }
        for (i, key) in keys.iter().enumerate() {
            let value = table.get(key).expect("all keys survive growth");
            assert!(value.oba_equal(&Value::from(i as f64)));
        }
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("shared");
        table.set(Gc::clone(&key), Value::Nil);

        let found = table
            .find_string("shared", key.hash())
            .expect("contents are present");
        assert!(Gc::ptr_eq(&found, &key));

        assert!(table
            .find_string("missing", crate::object::hash_string("missing"))
            .is_none());
    }

    #[test]
    fn tombstones_are_reused() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("ghost");

        table.set(Gc::clone(&key), Value::from(1.0));
        table.delete(&key);
        assert!(table.set(Gc::clone(&key), Value::from(2.0)));
        assert!(table
            .get(&key)
            .expect("reinserted key")
            .oba_equal(&Value::from(2.0)));
    }
}
