use super::{get_numbers, get_opt};
use crate::store::{RecordKey, Store};
use pkgbuilderd_common::errors::*;
use std::collections::BTreeSet;

const NS: &str = "package";

/// Persistent metadata of one package, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Package {
    pub name: String,
    pub pkgver: String,
    pub pkgrel: String,
    pub epoch: Option<String>,
    pub version_str: String,
    pub pkgdesc: String,
    pub url: String,
    pub depends: BTreeSet<String>,
    pub makedepends: BTreeSet<String>,
    pub allowed_in: Vec<String>,

    pub is_monitored: bool,
    pub mon_service: Option<String>,
    pub mon_type: Option<String>,
    pub mon_project: Option<String>,
    pub mon_repo: Option<String>,
    pub mon_match_pattern: Option<String>,
    pub mon_last_result: Option<String>,

    pub auto_sum: bool,
    pub is_metapkg: bool,
    pub push_version: bool,
    pub is_split: bool,
    pub split_packages: Vec<String>,

    pub builds: Vec<i64>,
    pub success_rate: i64,
    pub failure_rate: i64,

    pub recipe_path: Option<String>,
    pub recipe: Option<String>,
    pub is_initialized: bool,
}

impl Package {
    pub fn new(name: &str) -> Package {
        Package {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn key_for(name: &str) -> RecordKey {
        RecordKey::new(NS, name)
    }

    pub fn key(&self) -> RecordKey {
        Self::key_for(&self.name)
    }

    pub fn exists(store: &dyn Store, name: &str) -> Result<bool> {
        store.exists(&Self::key_for(name))
    }

    pub fn load(store: &dyn Store, name: &str) -> Result<Package> {
        let key = Self::key_for(name);
        if !store.exists(&key)? {
            bail!("Package does not exist: {:?}", name);
        }

        Ok(Package {
            name: name.to_string(),
            pkgver: store.get_str(&key, "pkgver")?,
            pkgrel: store.get_str(&key, "pkgrel")?,
            epoch: get_opt(store, &key, "epoch")?,
            version_str: store.get_str(&key, "version_str")?,
            pkgdesc: store.get_str(&key, "pkgdesc")?,
            url: store.get_str(&key, "url")?,
            depends: store.set_members(&key, "depends")?,
            makedepends: store.set_members(&key, "makedepends")?,
            allowed_in: store.list_items(&key, "allowed_in")?,

            is_monitored: store.get_bool(&key, "is_monitored")?,
            mon_service: get_opt(store, &key, "mon_service")?,
            mon_type: get_opt(store, &key, "mon_type")?,
            mon_project: get_opt(store, &key, "mon_project")?,
            mon_repo: get_opt(store, &key, "mon_repo")?,
            mon_match_pattern: get_opt(store, &key, "mon_match_pattern")?,
            mon_last_result: get_opt(store, &key, "mon_last_result")?,

            auto_sum: store.get_bool(&key, "auto_sum")?,
            is_metapkg: store.get_bool(&key, "is_metapkg")?,
            push_version: store.get_bool(&key, "push_version")?,
            is_split: store.get_bool(&key, "is_split")?,
            split_packages: store.list_items(&key, "split_packages")?,

            builds: get_numbers(store.list_items(&key, "builds")?)?,
            success_rate: store.get_int(&key, "success_rate")?,
            failure_rate: store.get_int(&key, "failure_rate")?,

            recipe_path: get_opt(store, &key, "recipe_path")?,
            recipe: get_opt(store, &key, "recipe")?,
            is_initialized: store.get_bool(&key, "is_initialized")?,
        })
    }

    /// Write every field except the build history, which only grows
    /// through [`Package::add_build`].
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let key = self.key();
        store.set(&key, "name", &self.name)?;
        store.set(&key, "pkgver", &self.pkgver)?;
        store.set(&key, "pkgrel", &self.pkgrel)?;
        store.set_opt(&key, "epoch", self.epoch.as_deref())?;
        store.set(&key, "version_str", &self.version_str)?;
        store.set(&key, "pkgdesc", &self.pkgdesc)?;
        store.set(&key, "url", &self.url)?;
        store.set_replace(&key, "depends", &self.depends)?;
        store.set_replace(&key, "makedepends", &self.makedepends)?;
        store.list_replace(&key, "allowed_in", &self.allowed_in)?;

        store.set_bool(&key, "is_monitored", self.is_monitored)?;
        store.set_opt(&key, "mon_service", self.mon_service.as_deref())?;
        store.set_opt(&key, "mon_type", self.mon_type.as_deref())?;
        store.set_opt(&key, "mon_project", self.mon_project.as_deref())?;
        store.set_opt(&key, "mon_repo", self.mon_repo.as_deref())?;
        store.set_opt(&key, "mon_match_pattern", self.mon_match_pattern.as_deref())?;
        store.set_opt(&key, "mon_last_result", self.mon_last_result.as_deref())?;

        store.set_bool(&key, "auto_sum", self.auto_sum)?;
        store.set_bool(&key, "is_metapkg", self.is_metapkg)?;
        store.set_bool(&key, "push_version", self.push_version)?;
        store.set_bool(&key, "is_split", self.is_split)?;
        store.list_replace(&key, "split_packages", &self.split_packages)?;

        store.set_int(&key, "success_rate", self.success_rate)?;
        store.set_int(&key, "failure_rate", self.failure_rate)?;

        store.set_opt(&key, "recipe_path", self.recipe_path.as_deref())?;
        store.set_opt(&key, "recipe", self.recipe.as_deref())?;
        store.set_bool(&key, "is_initialized", self.is_initialized)?;
        Ok(())
    }

    pub fn add_build(&mut self, store: &dyn Store, bnum: i64) -> Result<()> {
        store.list_push(&self.key(), "builds", &bnum.to_string())?;
        self.builds.push(bnum);
        Ok(())
    }

    /// `[epoch:]pkgver-pkgrel` from the current version fields.
    pub fn full_version(&self) -> String {
        let mut version = format!("{}-{}", self.pkgver, self.pkgrel);
        if let Some(epoch) = &self.epoch {
            version = format!("{}:{}", epoch, version);
        }
        version
    }

    pub fn is_allowed_in(&self, repo: &str) -> bool {
        self.allowed_in.iter().any(|r| r == repo)
    }

    /// The build recorded just before `bnum`, if any.
    pub fn previous_build(&self, bnum: i64) -> Option<i64> {
        let idx = self.builds.iter().position(|b| *b == bnum)?;
        if idx > 0 {
            self.builds.get(idx - 1).copied()
        } else {
            None
        }
    }
}
