use super::{get_numbers, get_opt, get_time, set_time};
use crate::store::{RecordKey, Store};
use chrono::{DateTime, Utc};
use pkgbuilderd_common::errors::*;
use std::collections::BTreeSet;
use std::path::PathBuf;

const NS: &str = "transaction";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionRecord {
    pub tnum: i64,
    pub packages: BTreeSet<String>,
    pub queue: Vec<String>,
    pub is_running: bool,
    pub is_finished: bool,
    pub building: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initiated_by: Option<String>,
    pub sha_before: Option<String>,
    pub sha_after: Option<String>,
    pub base_path: Option<PathBuf>,
    pub path: Option<PathBuf>,
    pub result_dir: Option<PathBuf>,
    pub builds: Vec<i64>,
    pub completed: BTreeSet<i64>,
    pub failed: BTreeSet<i64>,
}

impl TransactionRecord {
    fn key_for(tnum: i64) -> RecordKey {
        RecordKey::new(NS, tnum)
    }

    pub fn key(&self) -> RecordKey {
        Self::key_for(self.tnum)
    }

    pub fn create(store: &dyn Store, packages: BTreeSet<String>, initiated_by: Option<String>) -> Result<TransactionRecord> {
        let tnum = store.incr("next_tnum")?;
        let txn = TransactionRecord {
            tnum,
            packages,
            initiated_by,
            ..Default::default()
        };
        txn.save(store)?;
        Ok(txn)
    }

    pub fn load(store: &dyn Store, tnum: i64) -> Result<TransactionRecord> {
        let key = Self::key_for(tnum);
        if !store.exists(&key)? {
            bail!("Transaction does not exist: {}", tnum);
        }

        let numbers = |field: &str| -> Result<BTreeSet<i64>> {
            Ok(get_numbers(store.set_members(&key, field)?)?.into_iter().collect())
        };

        Ok(TransactionRecord {
            tnum,
            packages: store.set_members(&key, "packages")?,
            queue: store.list_items(&key, "queue")?,
            is_running: store.get_bool(&key, "is_running")?,
            is_finished: store.get_bool(&key, "is_finished")?,
            building: get_opt(store, &key, "building")?,
            start: get_time(store, &key, "start")?,
            end: get_time(store, &key, "end")?,
            initiated_by: get_opt(store, &key, "initiated_by")?,
            sha_before: get_opt(store, &key, "sha_before")?,
            sha_after: get_opt(store, &key, "sha_after")?,
            base_path: get_opt(store, &key, "base_path")?.map(PathBuf::from),
            path: get_opt(store, &key, "path")?.map(PathBuf::from),
            result_dir: get_opt(store, &key, "result_dir")?.map(PathBuf::from),
            builds: get_numbers(store.list_items(&key, "builds")?)?,
            completed: numbers("completed")?,
            failed: numbers("failed")?,
        })
    }

    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let key = self.key();
        let path_str = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());
        let numbers = |set: &BTreeSet<i64>| set.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>();
        let builds = self.builds.iter().map(|n| n.to_string()).collect::<Vec<_>>();

        store.set_int(&key, "tnum", self.tnum)?;
        store.set_replace(&key, "packages", &self.packages)?;
        store.list_replace(&key, "queue", &self.queue)?;
        store.set_bool(&key, "is_running", self.is_running)?;
        store.set_bool(&key, "is_finished", self.is_finished)?;
        store.set_opt(&key, "building", self.building.as_deref())?;
        set_time(store, &key, "start", self.start.as_ref())?;
        set_time(store, &key, "end", self.end.as_ref())?;
        store.set_opt(&key, "initiated_by", self.initiated_by.as_deref())?;
        store.set_opt(&key, "sha_before", self.sha_before.as_deref())?;
        store.set_opt(&key, "sha_after", self.sha_after.as_deref())?;
        store.set_opt(&key, "base_path", path_str(&self.base_path).as_deref())?;
        store.set_opt(&key, "path", path_str(&self.path).as_deref())?;
        store.set_opt(&key, "result_dir", path_str(&self.result_dir).as_deref())?;
        store.list_replace(&key, "builds", &builds)?;
        store.set_replace(&key, "completed", &numbers(&self.completed))?;
        store.set_replace(&key, "failed", &numbers(&self.failed))?;
        Ok(())
    }

    pub fn set_running(&mut self) {
        self.is_running = true;
        self.is_finished = false;
    }

    pub fn set_finished(&mut self) {
        self.is_running = false;
        self.is_finished = true;
        self.building = None;
    }
}
