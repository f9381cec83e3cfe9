use crate::store::{RecordKey, Store};
use chrono::{DateTime, Utc};
use pkgbuilderd_common::errors::*;

macro_rules! import_models {
    ($x:ident) => {
        mod $x;
        pub use self::$x::*;
    };
}

import_models!(package);
import_models!(build);
import_models!(transaction);
import_models!(repo_state);

fn get_opt(store: &dyn Store, key: &RecordKey, field: &str) -> Result<Option<String>> {
    Ok(store.get(key, field)?.filter(|v| !v.is_empty()))
}

fn get_time(store: &dyn Store, key: &RecordKey, field: &str) -> Result<Option<DateTime<Utc>>> {
    match get_opt(store, key, field)? {
        Some(value) => {
            let time = DateTime::parse_from_rfc3339(&value)
                .with_context(|| anyhow!("Field {}.{} is not a timestamp: {:?}", key, field, value))?;
            Ok(Some(time.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

fn set_time(store: &dyn Store, key: &RecordKey, field: &str, value: Option<&DateTime<Utc>>) -> Result<()> {
    let value = value.map(|t| t.to_rfc3339());
    store.set_opt(key, field, value.as_deref())
}

fn get_numbers(items: impl IntoIterator<Item = String>) -> Result<Vec<i64>> {
    items.into_iter()
        .map(|x| x.parse::<i64>().with_context(|| anyhow!("Invalid record number: {:?}", x)))
        .collect()
}
