use pkgbuilderd_common::errors::*;
use std::collections::BTreeSet;
use std::fmt;

mod memory;
mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Identifies one persisted record, e.g. `package:foo` or `build:42`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub namespace: &'static str,
    pub id: String,
}

impl RecordKey {
    pub fn new<I: ToString>(namespace: &'static str, id: I) -> RecordKey {
        RecordKey {
            namespace,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

/// Typed field storage shared by every persisted entity.
///
/// Scalars are stored as text and interpreted by the typed helpers. Lists keep
/// insertion order and may hold duplicates, sets hold unique members without
/// an order.
pub trait Store: Send + Sync {
    fn get(&self, key: &RecordKey, field: &str) -> Result<Option<String>>;

    fn set(&self, key: &RecordKey, field: &str, value: &str) -> Result<()>;

    fn delete(&self, key: &RecordKey, field: &str) -> Result<()>;

    /// Whether any scalar field has been written for this record.
    fn exists(&self, key: &RecordKey) -> Result<bool>;

    fn list_push(&self, key: &RecordKey, field: &str, value: &str) -> Result<()>;

    fn list_items(&self, key: &RecordKey, field: &str) -> Result<Vec<String>>;

    fn list_pop_front(&self, key: &RecordKey, field: &str) -> Result<Option<String>>;

    /// Remove every occurrence of `value`, returns how many were removed.
    fn list_remove(&self, key: &RecordKey, field: &str, value: &str) -> Result<usize>;

    fn list_clear(&self, key: &RecordKey, field: &str) -> Result<()>;

    /// Returns false if the member was already present.
    fn set_add(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool>;

    fn set_remove(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool>;

    fn set_members(&self, key: &RecordKey, field: &str) -> Result<BTreeSet<String>>;

    fn set_contains(&self, key: &RecordKey, field: &str, value: &str) -> Result<bool>;

    fn set_clear(&self, key: &RecordKey, field: &str) -> Result<()>;

    /// Atomically increment a named counter and return the new value.
    fn incr(&self, counter: &str) -> Result<i64>;

    fn get_str(&self, key: &RecordKey, field: &str) -> Result<String> {
        Ok(self.get(key, field)?.unwrap_or_default())
    }

    fn get_bool(&self, key: &RecordKey, field: &str) -> Result<bool> {
        match self.get(key, field)?.as_deref() {
            None | Some("") | Some("0") | Some("false") | Some("False") => Ok(false),
            Some("1") | Some("true") | Some("True") => Ok(true),
            Some(other) => bail!("Field {}.{} is not a bool: {:?}", key, field, other),
        }
    }

    fn set_bool(&self, key: &RecordKey, field: &str, value: bool) -> Result<()> {
        self.set(key, field, if value { "1" } else { "0" })
    }

    fn get_int(&self, key: &RecordKey, field: &str) -> Result<i64> {
        match self.get(key, field)? {
            Some(value) if !value.is_empty() => value.parse()
                .with_context(|| anyhow!("Field {}.{} is not an integer: {:?}", key, field, value)),
            _ => Ok(0),
        }
    }

    fn set_int(&self, key: &RecordKey, field: &str, value: i64) -> Result<()> {
        self.set(key, field, &value.to_string())
    }

    fn set_opt(&self, key: &RecordKey, field: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.set(key, field, value),
            None => self.delete(key, field),
        }
    }

    /// Replace the whole list with `values`.
    fn list_replace(&self, key: &RecordKey, field: &str, values: &[String]) -> Result<()> {
        self.list_clear(key, field)?;
        for value in values {
            self.list_push(key, field, value)?;
        }
        Ok(())
    }

    /// Replace the whole set with `values`.
    fn set_replace(&self, key: &RecordKey, field: &str, values: &BTreeSet<String>) -> Result<()> {
        self.set_clear(key, field)?;
        for value in values {
            self.set_add(key, field, value)?;
        }
        Ok(())
    }
}
