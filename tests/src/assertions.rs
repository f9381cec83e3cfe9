use crate::fixtures::IsolatedEngine;
use pkgbuilderd::models::{RepoStateRecord, TransactionRecord};
use pkgbuilderd_common::PkgRef;

/// Every build of a transaction is either completed or failed, never both.
pub fn assert_builds_partitioned(txn: &TransactionRecord) {
    assert!(txn.completed.is_disjoint(&txn.failed));
    assert_eq!(txn.completed.len() + txn.failed.len(), txn.builds.len());
    for bnum in &txn.builds {
        assert!(txn.completed.contains(bnum) || txn.failed.contains(bnum));
    }
}

/// The package is on disk with its signature and listed in the index.
pub fn assert_published(isolated: &IsolatedEngine, repo: &str, arch: &str, pkg: &PkgRef) {
    let filename = format!("{}-{}-{}.pkg.tar.xz", pkg.name, pkg.version, pkg.arch);
    let path = isolated.repo_dir(repo, arch).join(&filename);
    assert!(path.exists(), "{:?} is missing", path);
    assert!(path.with_file_name(format!("{}.sig", filename)).exists());
    assert!(isolated.index.entries(&isolated.db_path(repo, arch)).contains(pkg));
}

pub fn assert_not_published(isolated: &IsolatedEngine, repo: &str, arch: &str, name: &str) {
    let entries = isolated.index.entries(&isolated.db_path(repo, arch));
    assert!(entries.iter().all(|r| r.name != name), "{} still in index: {:?}", name, entries);

    let dir = isolated.repo_dir(repo, arch);
    if let Ok(files) = std::fs::read_dir(&dir) {
        for file in files {
            let filename = file.unwrap().file_name().to_string_lossy().into_owned();
            assert!(!filename.starts_with(&format!("{}-", name)), "{} left in {:?}", filename, dir);
        }
    }
}

pub fn assert_consistent(state: &RepoStateRecord) {
    assert!(!state.locked);
    assert!(state.unaccounted_for.is_empty(), "unaccounted for: {:?}", state.unaccounted_for);
    assert_eq!(state.pkgs_index, state.pkgs_fs);
}
