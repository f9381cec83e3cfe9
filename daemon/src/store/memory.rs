use super::{RecordKey, Store};
use pkgbuilderd_common::errors::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

type FieldKey = (RecordKey, String);

#[derive(Debug, Default)]
struct Tables {
    scalars: BTreeMap<FieldKey, String>,
    lists: HashMap<FieldKey, VecDeque<String>>,
    sets: HashMap<FieldKey, BTreeSet<String>>,
    counters: HashMap<String, i64>,
}

/// Non-persistent store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock()
            .map_err(|_| anyhow!("Memory store lock is poisoned"))
    }
}

fn fk(key: &RecordKey, field: &str) -> FieldKey {
    (key.clone(), field.to_string())
}

impl Store for MemoryStore {
    fn get(&self, key: &RecordKey, field: &str) -> Result<Option<String>> {
        Ok(self.lock()?.scalars.get(&fk(key, field)).cloned())
    }

    fn set(&self, key: &RecordKey, field: &str, value: &str) -> Result<()> {
        self.lock()?.scalars.insert(fk(key, field), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &RecordKey, field: &str) -> Result<()> {
        self.lock()?.scalars.remove(&fk(key, field));
        Ok(())
    }

    fn exists(&self, key: &RecordKey) -> Result<bool> {
        Ok(self.lock()?.scalars.keys().any(|(k, _)| k == key))
    }

    fn list_push(&self, key: &RecordKey, field: &str, value: &str) -> Result<()> {
        self.lock()?.lists.entry(fk(key, field))
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    fn list_items(&self, key: &RecordKey, field: &str) -> Result<Vec<String>> {
        let tables = self.lock()?;
        let items = tables.lists.get(&fk(key, field))
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        Ok(items)
    }

    fn list_pop_front(&self, key: &RecordKey, field: &str) -> Result<Option<String>> {
        let mut tables = self.lock()?;
        Ok(tables.lists.get_mut(&fk(key, field)).and_then(|list| list.pop_front()))
    }

    fn list_remove(&self, key: &RecordKey, field: &str, value: &str) -> Result<usize> {
        let mut tables = self.lock()?;
        let Some(list) = tables.lists.get_mut(&fk(key, field)) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|x| x != value);
        Ok(before - list.len())
    }

    fn list_clear(&self, key: &RecordKey, field: &str) -> Result<()> {
        self.lock()?.lists.remove(&fk(key, field));
        Ok(())
    }

    fn set_add(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool> {
        Ok(self.lock()?.sets.entry(fk(key, field))
            .or_default()
            .insert(value.to_string()))
    }

    fn set_remove(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool> {
        let mut tables = self.lock()?;
        Ok(tables.sets.get_mut(&fk(key, field))
            .map(|set| set.remove(value))
            .unwrap_or(false))
    }

    fn set_members(&self, key: &RecordKey, field: &str) -> Result<BTreeSet<String>> {
        Ok(self.lock()?.sets.get(&fk(key, field)).cloned().unwrap_or_default())
    }

    fn set_contains(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool> {
        Ok(self.lock()?.sets.get(&fk(key, field))
            .map(|set| set.contains(value))
            .unwrap_or(false))
    }

    fn set_clear(&self, key: &RecordKey, field: &str) -> Result<()> {
        self.lock()?.sets.remove(&fk(key, field));
        Ok(())
    }

    fn incr(&self, counter: &str) -> Result<i64> {
        let mut tables = self.lock()?;
        let value = tables.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}
