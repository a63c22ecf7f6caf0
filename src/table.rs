use super::heap::Gc;
use super::value::Value;

const MAX_LOAD: f64 = 0.75;

/// A tombstone is a cleared key with a `true` value; it keeps probe chains
/// intact and is reused on insert.
#[derive(Clone, Copy)]
struct Entry {
    key: Option<Gc>,
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Nil,
};

const TOMBSTONE: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Bool(true),
};

/// Open-addressed table with linear probing. Keys are interned strings, so
/// equality is handle equality once the hashes match; each entry carries the
/// key's content hash so probing and growth never touch the heap.
#[derive(Default)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    fn find_index(entries: &[Entry], key: Gc, hash: u32) -> usize {
        let mut index = hash as usize & (entries.len() - 1);
        let mut tombstone = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & (entries.len() - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![EMPTY; capacity];
        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = Self::find_index(&entries, key, entry.hash);
                entries[dest] = *entry;
                self.count += 1;
            }
        }
        self.entries = entries;
    }

    pub fn get(&self, key: Gc, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[Self::find_index(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Returns whether `key` was new.
    pub fn set(&mut self, key: Gc, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * MAX_LOAD {
            let capacity = if self.entries.len() < 8 {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = Self::find_index(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    pub fn delete(&mut self, key: Gc, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_index(&self.entries, key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = TOMBSTONE;
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Pre-intern lookup: finds an existing key by content without any
    /// allocation. `eq` answers whether a candidate's bytes match.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(Gc) -> bool) -> Option<Gc> {
        if self.count == 0 {
            return None;
        }
        let mut index = hash as usize & (self.entries.len() - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (self.entries.len() - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Weak-set sweep: drops every key `keep` rejects, leaving tombstones.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(Gc) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !keep(key) {
                    *entry = TOMBSTONE;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, Roots};

    fn key(heap: &mut Heap, name: &str) -> (Gc, u32) {
        let r = heap.intern(name, Roots::default());
        (r, heap.string_hash(r))
    }

    #[test]
    fn insert_get_and_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "a");

        assert!(table.get(a, ha).is_none());
        assert!(table.set(a, ha, Value::Number(1.0)));
        assert_eq!(table.get(a, ha), Some(Value::Number(1.0)));
        assert!(!table.set(a, ha, Value::Number(2.0)));
        assert_eq!(table.get(a, ha), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_leaves_a_reusable_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "a");
        let (b, hb) = key(&mut heap, "b");

        table.set(a, ha, Value::Number(1.0));
        table.set(b, hb, Value::Number(2.0));
        assert!(table.delete(a, ha));
        assert!(!table.delete(a, ha));
        assert!(table.get(a, ha).is_none());
        assert_eq!(table.get(b, hb), Some(Value::Number(2.0)));

        table.set(a, ha, Value::Number(3.0));
        assert_eq!(table.get(a, ha), Some(Value::Number(3.0)));
    }

    #[test]
    fn survives_growth() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..64 {
            let (k, h) = key(&mut heap, &format!("key{i}"));
            table.set(k, h, Value::Number(i as f64));
            keys.push((k, h));
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            assert_eq!(table.get(*k, *h), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn add_all_copies_entries() {
        let mut heap = Heap::new();
        let mut from = Table::new();
        let mut to = Table::new();
        let (a, ha) = key(&mut heap, "a");
        let (b, hb) = key(&mut heap, "b");

        from.set(a, ha, Value::Number(1.0));
        to.set(b, hb, Value::Number(2.0));
        to.add_all(&from);
        assert_eq!(to.get(a, ha), Some(Value::Number(1.0)));
        assert_eq!(to.get(b, hb), Some(Value::Number(2.0)));
    }
}
