use crate::store::{RecordKey, Store};
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::PkgRef;
use std::collections::BTreeSet;

const NS: &str = "repo";

/// Persisted view of one (repository, architecture) pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoStateRecord {
    pub name: String,
    pub arch: String,
    pub pkgs_index: BTreeSet<PkgRef>,
    pub pkgs_fs: BTreeSet<PkgRef>,
    pub packages: BTreeSet<String>,
    pub unaccounted_for: BTreeSet<String>,
    pub unparsable: BTreeSet<String>,
    pub locked: bool,
}

fn parse_refs(items: BTreeSet<String>) -> Result<BTreeSet<PkgRef>> {
    items.iter().map(|s| s.parse()).collect()
}

fn format_refs(refs: &BTreeSet<PkgRef>) -> BTreeSet<String> {
    refs.iter().map(|r| r.to_string()).collect()
}

impl RepoStateRecord {
    fn key_for(name: &str, arch: &str) -> RecordKey {
        RecordKey::new(NS, format!("{}/{}", name, arch))
    }

    pub fn key(&self) -> RecordKey {
        Self::key_for(&self.name, &self.arch)
    }

    /// Load the record, an unknown pair starts out empty.
    pub fn load(store: &dyn Store, name: &str, arch: &str) -> Result<RepoStateRecord> {
        let key = Self::key_for(name, arch);
        Ok(RepoStateRecord {
            name: name.to_string(),
            arch: arch.to_string(),
            pkgs_index: parse_refs(store.set_members(&key, "pkgs_index")?)?,
            pkgs_fs: parse_refs(store.set_members(&key, "pkgs_fs")?)?,
            packages: store.set_members(&key, "packages")?,
            unaccounted_for: store.set_members(&key, "unaccounted_for")?,
            unparsable: store.set_members(&key, "unparsable")?,
            locked: store.get_bool(&key, "locked")?,
        })
    }

    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let key = self.key();
        store.set(&key, "name", &self.name)?;
        store.set(&key, "arch", &self.arch)?;
        store.set_replace(&key, "pkgs_index", &format_refs(&self.pkgs_index))?;
        store.set_replace(&key, "pkgs_fs", &format_refs(&self.pkgs_fs))?;
        store.set_replace(&key, "packages", &self.packages)?;
        store.set_replace(&key, "unaccounted_for", &self.unaccounted_for)?;
        store.set_replace(&key, "unparsable", &self.unparsable)?;
        store.set_bool(&key, "locked", self.locked)?;
        store.set_int(&key, "pkg_count_index", self.pkgs_index.len() as i64)?;
        store.set_int(&key, "pkg_count_fs", self.pkgs_fs.len() as i64)?;
        Ok(())
    }

    pub fn set_locked(store: &dyn Store, name: &str, arch: &str, locked: bool) -> Result<()> {
        store.set_bool(&Self::key_for(name, arch), "locked", locked)
    }

    /// Recompute the accounted-for and unaccounted-for sets from the two views.
    pub fn derive(&mut self) {
        self.packages = self.pkgs_index.intersection(&self.pkgs_fs)
            .map(|r| r.name.clone())
            .collect();
        self.unaccounted_for = self.pkgs_index.symmetric_difference(&self.pkgs_fs)
            .map(|r| r.name.clone())
            .collect();
    }
}
