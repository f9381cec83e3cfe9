use super::{get_opt, get_time, set_time};
use crate::store::{RecordKey, Store};
use chrono::{DateTime, Utc};
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::{BuildState, ReviewStatus};
use std::collections::BTreeSet;

const NS: &str = "build";

/// One build attempt of one package, keyed by build number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildRecord {
    pub bnum: i64,
    pub tnum: i64,
    pub pkgname: String,
    pub pkgver: String,
    pub pkgrel: String,
    pub epoch: Option<String>,
    pub version_str: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub container: Option<String>,
    pub log_str: String,
    pub completed: bool,
    pub failed: bool,
    pub review_status: ReviewStatus,
    pub review_dev: Option<String>,
    pub review_date: Option<DateTime<Utc>>,
    pub generated_files: BTreeSet<String>,
    pub staging_files: BTreeSet<String>,
}

impl BuildRecord {
    fn key_for(bnum: i64) -> RecordKey {
        RecordKey::new(NS, bnum)
    }

    pub fn key(&self) -> RecordKey {
        Self::key_for(self.bnum)
    }

    /// Allocate the next build number and persist the initial record.
    pub fn create(store: &dyn Store, tnum: i64, pkgname: &str) -> Result<BuildRecord> {
        let bnum = store.incr("next_bnum")?;
        let build = BuildRecord {
            bnum,
            tnum,
            pkgname: pkgname.to_string(),
            ..Default::default()
        };
        build.save(store)?;
        Ok(build)
    }

    pub fn load(store: &dyn Store, bnum: i64) -> Result<BuildRecord> {
        let key = Self::key_for(bnum);
        if !store.exists(&key)? {
            bail!("Build does not exist: {}", bnum);
        }

        let review_status = match get_opt(store, &key, "review_status")? {
            Some(status) => status.parse()
                .map_err(|_| anyhow!("Build {} has invalid review status: {:?}", bnum, status))?,
            None => ReviewStatus::None,
        };

        Ok(BuildRecord {
            bnum,
            tnum: store.get_int(&key, "tnum")?,
            pkgname: store.get_str(&key, "pkgname")?,
            pkgver: store.get_str(&key, "pkgver")?,
            pkgrel: store.get_str(&key, "pkgrel")?,
            epoch: get_opt(store, &key, "epoch")?,
            version_str: store.get_str(&key, "version_str")?,
            start: get_time(store, &key, "start")?,
            end: get_time(store, &key, "end")?,
            container: get_opt(store, &key, "container")?,
            log_str: store.get_str(&key, "log_str")?,
            completed: store.get_bool(&key, "completed")?,
            failed: store.get_bool(&key, "failed")?,
            review_status,
            review_dev: get_opt(store, &key, "review_dev")?,
            review_date: get_time(store, &key, "review_date")?,
            generated_files: store.set_members(&key, "generated_files")?,
            staging_files: store.set_members(&key, "staging_files")?,
        })
    }

    /// Write every field except the captured log lines.
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let key = self.key();
        store.set_int(&key, "bnum", self.bnum)?;
        store.set_int(&key, "tnum", self.tnum)?;
        store.set(&key, "pkgname", &self.pkgname)?;
        store.set(&key, "pkgver", &self.pkgver)?;
        store.set(&key, "pkgrel", &self.pkgrel)?;
        store.set_opt(&key, "epoch", self.epoch.as_deref())?;
        store.set(&key, "version_str", &self.version_str)?;
        set_time(store, &key, "start", self.start.as_ref())?;
        set_time(store, &key, "end", self.end.as_ref())?;
        store.set_opt(&key, "container", self.container.as_deref())?;
        store.set(&key, "log_str", &self.log_str)?;
        store.set_bool(&key, "completed", self.completed)?;
        store.set_bool(&key, "failed", self.failed)?;
        store.set(&key, "review_status", self.review_status.as_ref())?;
        store.set_opt(&key, "review_dev", self.review_dev.as_deref())?;
        set_time(store, &key, "review_date", self.review_date.as_ref())?;
        store.set_replace(&key, "generated_files", &self.generated_files)?;
        store.set_replace(&key, "staging_files", &self.staging_files)?;
        Ok(())
    }

    pub fn push_log_line(&self, store: &dyn Store, line: &str) -> Result<()> {
        store.list_push(&self.key(), "log", line)
    }

    pub fn log_lines(&self, store: &dyn Store) -> Result<Vec<String>> {
        store.list_items(&self.key(), "log")
    }

    pub fn state(&self) -> BuildState {
        if self.failed {
            BuildState::Failed
        } else if self.completed {
            BuildState::Completed
        } else if self.start.is_some() {
            BuildState::Building
        } else {
            BuildState::Pending
        }
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
        self.failed = false;
    }

    pub fn mark_failed(&mut self) {
        self.completed = false;
        self.failed = true;
    }

    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }
}
