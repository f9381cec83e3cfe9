#![cfg(test)]

use crate::assertions::*;
use crate::data::*;
use crate::fixtures::*;
use crate::setup::*;
use pkgbuilderd::handler;
use pkgbuilderd::models::{Package, RepoStateRecord};
use pkgbuilderd_common::{PkgRef, ReviewStatus};
use rstest::rstest;
use std::collections::BTreeSet;
use std::fs;

mod assertions;
mod data;
pub(crate) mod fixtures;
pub mod setup;

#[rstest]
#[tokio::test]
pub async fn batch_is_built_in_dependency_order(isolated_engine: IsolatedEngine) {
    let txn = setup_dependent_packages(&isolated_engine).await;

    assert_eq!(txn.queue, vec![DUMMY_LIBRARY, DUMMY_APPLICATION]);
    assert_eq!(isolated_engine.runtime.created(), vec![DUMMY_LIBRARY, DUMMY_APPLICATION]);
    assert_eq!(txn.completed.len(), 2);
    assert_builds_partitioned(&txn);
    assert_eq!(txn.sha_before.as_deref(), Some("rev-0"));
    assert_eq!(txn.sha_after, txn.sha_before);
}

#[rstest]
#[tokio::test]
pub async fn dependent_is_attempted_after_failed_dependency(isolated_engine: IsolatedEngine) {
    isolated_engine.runtime.fail(DUMMY_LIBRARY);

    let txn = setup_dependent_packages(&isolated_engine).await;

    assert_eq!(isolated_engine.runtime.created(), vec![DUMMY_LIBRARY, DUMMY_APPLICATION]);
    assert_builds_partitioned(&txn);

    let failed = txn.failed.iter()
        .map(|bnum| load_build(&isolated_engine, *bnum).pkgname)
        .collect::<Vec<_>>();
    let completed = txn.completed.iter()
        .map(|bnum| load_build(&isolated_engine, *bnum).pkgname)
        .collect::<Vec<_>>();
    assert_eq!(failed, vec![DUMMY_LIBRARY]);
    assert_eq!(completed, vec![DUMMY_APPLICATION]);
}

#[rstest]
#[tokio::test]
pub async fn cyclic_dependencies_still_build_everything(isolated_engine: IsolatedEngine) {
    add_recipe(&isolated_engine, "ping", &simple_recipe("ping", "1.0", &["pong"]));
    add_recipe(&isolated_engine, "pong", &simple_recipe("pong", "1.0", &["ping"]));

    let txn = run_transaction(&isolated_engine, &["ping", "pong"]).await;

    let built = isolated_engine.runtime.created().into_iter().collect::<BTreeSet<_>>();
    assert_eq!(built, ["ping", "pong"].iter().map(|s| s.to_string()).collect());
    assert_eq!(txn.builds.len(), 2);
    assert_builds_partitioned(&txn);
}

#[rstest]
#[tokio::test]
pub async fn unknown_package_is_dropped_from_transaction(isolated_engine: IsolatedEngine) {
    add_recipe(&isolated_engine, DUMMY_PACKAGE, &simple_recipe(DUMMY_PACKAGE, "1.0", &[]));

    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE, "does-not-exist"]).await;

    assert_eq!(txn.builds.len(), 1);
    assert_eq!(isolated_engine.runtime.created(), vec![DUMMY_PACKAGE]);
    assert!(txn.is_finished);
}

#[rstest]
#[tokio::test]
pub async fn completed_build_is_staged_and_pending_review(isolated_engine: IsolatedEngine) {
    let build = setup_single_staged_package(&isolated_engine).await;

    assert!(build.completed);
    assert!(!build.failed);
    assert_eq!(build.version_str, "1.0-1");
    assert_eq!(build.review_status, ReviewStatus::Pending);
    assert!(!build.staging_files.is_empty());
    assert!(build.log_str.contains("Finished making"));

    let pkg = PkgRef::new(DUMMY_PACKAGE, "1.0-1", ARCH);
    assert_published(&isolated_engine, STAGING, ARCH, &pkg);
    assert_not_published(&isolated_engine, MAIN, ARCH, DUMMY_PACKAGE);

    let state = RepoStateRecord::load(isolated_engine.engine.store.as_ref(), STAGING, ARCH).unwrap();
    assert_consistent(&state);
    assert!(state.packages.contains(DUMMY_PACKAGE));

    let status = &isolated_engine.engine.status;
    assert!(status.pending_review().unwrap().contains(&build.bnum.to_string()));
    assert!(status.now_building().unwrap().is_empty());
    assert!(status.running_transactions().unwrap().is_empty());
    assert!(status.is_idle().unwrap());
    assert_eq!(status.current_status().unwrap(), "Idle");
}

#[rstest]
#[tokio::test]
pub async fn recipe_in_subgroup_is_found(isolated_engine: IsolatedEngine) {
    isolated_engine.host.put(&subgroup_recipe_path("cinnamon", DUMMY_PACKAGE), &simple_recipe(DUMMY_PACKAGE, "4.4", &[]));

    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE]).await;

    assert_eq!(txn.completed.len(), 1);
    assert_published(&isolated_engine, STAGING, ARCH, &PkgRef::new(DUMMY_PACKAGE, "4.4-1", ARCH));
}

#[rstest]
#[tokio::test]
pub async fn failed_container_is_not_staged(isolated_engine: IsolatedEngine) {
    isolated_engine.runtime.fail(DUMMY_PACKAGE);
    add_recipe(&isolated_engine, DUMMY_PACKAGE, &simple_recipe(DUMMY_PACKAGE, "1.0", &[]));

    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE]).await;

    assert_eq!(txn.failed.len(), 1);
    let build = load_build(&isolated_engine, txn.builds[0]);
    assert!(build.failed);
    assert_eq!(build.review_status, ReviewStatus::None);
    assert!(build.staging_files.is_empty());
    assert_not_published(&isolated_engine, STAGING, ARCH, DUMMY_PACKAGE);
}

#[rstest]
#[tokio::test]
pub async fn signing_failure_fails_build(isolated_engine: IsolatedEngine) {
    isolated_engine.signer.break_signing();
    add_recipe(&isolated_engine, DUMMY_PACKAGE, &simple_recipe(DUMMY_PACKAGE, "1.0", &[]));

    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE]).await;

    assert_eq!(txn.failed.len(), 1);
    assert_builds_partitioned(&txn);
    let build = load_build(&isolated_engine, txn.builds[0]);
    assert!(build.generated_files.is_empty());
    assert_not_published(&isolated_engine, STAGING, ARCH, DUMMY_PACKAGE);
}

#[rstest]
#[tokio::test]
pub async fn monitored_release_is_pushed_before_build(isolated_engine: IsolatedEngine) {
    add_recipe(&isolated_engine, DUMMY_PACKAGE, &monitored_recipe(DUMMY_PACKAGE, "1.1"));

    let mut pkg = Package::new(DUMMY_PACKAGE);
    pkg.is_initialized = true;
    pkg.allowed_in = vec![STAGING.to_string(), MAIN.to_string()];
    pkg.pkgver = "1.1".to_string();
    pkg.pkgrel = "1".to_string();
    pkg.version_str = "1.1-1".to_string();
    pkg.mon_last_result = Some("1.2".to_string());
    pkg.save(isolated_engine.engine.store.as_ref()).unwrap();

    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE]).await;
    assert_eq!(txn.completed.len(), 1);

    assert_eq!(isolated_engine.host.commits(), vec!["[pkgbuilderd] updpkg foo 1.2"]);
    assert_eq!(txn.sha_before.as_deref(), Some("rev-0"));
    assert_eq!(txn.sha_after.as_deref(), Some("commit-1"));
    let recipe = isolated_engine.host.file(&recipe_path(DUMMY_PACKAGE)).unwrap();
    assert!(recipe.contains("pkgver=1.2\n"));

    // any packages live in the first architecture and are linked from the others
    let pkg = PkgRef::new(DUMMY_PACKAGE, "1.2-1", "any");
    assert_published(&isolated_engine, STAGING, ARCH, &pkg);
    assert_published(&isolated_engine, STAGING, "i686", &pkg);
    let link = isolated_engine.repo_dir(STAGING, "i686").join("foo-1.2-1-any.pkg.tar.xz");
    assert!(fs::symlink_metadata(link).unwrap().file_type().is_symlink());
}

#[rstest]
#[tokio::test]
pub async fn split_packages_share_the_version(isolated_engine: IsolatedEngine) {
    add_recipe(&isolated_engine, "suite", &split_recipe("suite", &["suite-core", "suite-extras"]));

    let txn = run_transaction(&isolated_engine, &["suite"]).await;
    assert_eq!(txn.completed.len(), 1);

    for child in ["suite-core", "suite-extras"] {
        let pkg = Package::load(isolated_engine.engine.store.as_ref(), child).unwrap();
        assert_eq!(pkg.version_str, "3.2-2");
        assert_published(&isolated_engine, STAGING, ARCH, &PkgRef::new(child, "3.2-2", ARCH));
    }
}

#[rstest]
#[tokio::test]
pub async fn unstageable_artifact_fails_build(isolated_engine: IsolatedEngine) {
    add_recipe(&isolated_engine, "suite", &split_recipe("suite", &["suite-core", "zz:z"]));

    let txn = run_transaction(&isolated_engine, &["suite"]).await;
    assert!(txn.completed.is_empty());
    assert_eq!(txn.failed.len(), 1);
    assert_builds_partitioned(&txn);

    let build = load_build(&isolated_engine, txn.builds[0]);
    assert!(build.failed);
    assert!(!build.completed);
    assert_eq!(build.review_status, ReviewStatus::None);
    assert!(build.staging_files.is_empty());
    assert!(!isolated_engine.engine.status.pending_review().unwrap().contains(&build.bnum.to_string()));

    assert_not_published(&isolated_engine, STAGING, ARCH, "suite-core");
    let state = isolated_engine.engine.sync_repo(STAGING, ARCH).await.unwrap();
    assert!(state.pkgs_fs.is_empty());
    assert!(state.pkgs_index.is_empty());

    let review = isolated_engine.engine.set_review_result(build.bnum, "developer", ReviewStatus::Passed).await;
    assert!(review.is_err());
}

#[rstest]
#[tokio::test]
pub async fn finished_build_cannot_be_followed(isolated_engine: IsolatedEngine) {
    let build = setup_single_staged_package(&isolated_engine).await;
    assert!(isolated_engine.engine.follow_build(build.bnum).is_none());
    assert!(isolated_engine.engine.follow_build(build.bnum + 100).is_none());
}

#[rstest]
#[tokio::test]
pub async fn rebuild_skips_previous_review(isolated_engine: IsolatedEngine) {
    let first = setup_single_staged_package(&isolated_engine).await;
    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE]).await;
    let second = load_build(&isolated_engine, txn.builds[0]);

    assert_eq!(load_build(&isolated_engine, first.bnum).review_status, ReviewStatus::Skip);
    assert_eq!(second.review_status, ReviewStatus::Pending);

    let pending = isolated_engine.engine.status.pending_review().unwrap();
    assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec![second.bnum.to_string()]);

    let pkg = Package::load(isolated_engine.engine.store.as_ref(), DUMMY_PACKAGE).unwrap();
    assert_eq!(pkg.builds, vec![first.bnum, second.bnum]);
    assert_eq!(pkg.success_rate, 100);
}

#[rstest]
#[tokio::test]
pub async fn passed_review_moves_package_into_main(isolated_engine: IsolatedEngine) {
    let build = setup_single_reviewed_package(&isolated_engine, ReviewStatus::Passed).await;

    assert_eq!(build.review_status, ReviewStatus::Passed);
    assert_eq!(build.review_dev.as_deref(), Some("developer"));
    assert!(build.review_date.is_some());

    assert_published(&isolated_engine, MAIN, ARCH, &PkgRef::new(DUMMY_PACKAGE, "1.0-1", ARCH));
    assert_not_published(&isolated_engine, STAGING, ARCH, DUMMY_PACKAGE);
    assert!(isolated_engine.engine.status.pending_review().unwrap().is_empty());

    let state = RepoStateRecord::load(isolated_engine.engine.store.as_ref(), MAIN, ARCH).unwrap();
    assert_consistent(&state);
}

#[rstest]
#[tokio::test]
pub async fn passed_review_extends_allowed_repos(isolated_engine: IsolatedEngine) {
    add_recipe(&isolated_engine, DUMMY_PACKAGE, &staging_only_recipe(DUMMY_PACKAGE));
    let txn = run_transaction(&isolated_engine, &[DUMMY_PACKAGE]).await;

    let store = isolated_engine.engine.store.as_ref();
    assert_eq!(Package::load(store, DUMMY_PACKAGE).unwrap().allowed_in, vec![STAGING]);

    isolated_engine.engine.set_review_result(txn.builds[0], "developer", ReviewStatus::Passed).await.unwrap();

    let pkg = Package::load(store, DUMMY_PACKAGE).unwrap();
    assert!(pkg.is_allowed_in(MAIN));
    assert_published(&isolated_engine, MAIN, ARCH, &PkgRef::new(DUMMY_PACKAGE, "1.0-1", ARCH));
}

#[rstest]
#[tokio::test]
pub async fn failed_review_withdraws_from_staging(isolated_engine: IsolatedEngine) {
    let build = setup_single_reviewed_package(&isolated_engine, ReviewStatus::Failed).await;

    assert_eq!(build.review_status, ReviewStatus::Failed);
    assert!(build.staging_files.is_empty());
    assert_not_published(&isolated_engine, STAGING, ARCH, DUMMY_PACKAGE);
    assert_not_published(&isolated_engine, MAIN, ARCH, DUMMY_PACKAGE);
}

#[rstest]
#[tokio::test]
pub async fn skipped_review_leaves_package_staged(isolated_engine: IsolatedEngine) {
    let build = setup_single_reviewed_package(&isolated_engine, ReviewStatus::Skip).await;

    assert_eq!(build.review_status, ReviewStatus::Skip);
    assert_published(&isolated_engine, STAGING, ARCH, &PkgRef::new(DUMMY_PACKAGE, "1.0-1", ARCH));
    assert_not_published(&isolated_engine, MAIN, ARCH, DUMMY_PACKAGE);
}

#[rstest]
#[tokio::test]
pub async fn review_requires_pending_build(isolated_engine: IsolatedEngine) {
    let build = setup_single_reviewed_package(&isolated_engine, ReviewStatus::Passed).await;
    let engine = &isolated_engine.engine;

    assert!(engine.set_review_result(build.bnum, "developer", ReviewStatus::Failed).await.is_err());
    assert!(engine.set_review_result(build.bnum + 100, "developer", ReviewStatus::Failed).await.is_err());
}

#[rstest]
#[tokio::test]
pub async fn review_result_must_be_final(isolated_engine: IsolatedEngine) {
    let build = setup_single_staged_package(&isolated_engine).await;
    let engine = &isolated_engine.engine;

    assert!(engine.set_review_result(build.bnum, "developer", ReviewStatus::Pending).await.is_err());
    assert!(engine.set_review_result(build.bnum, "developer", ReviewStatus::None).await.is_err());
    assert_eq!(load_build(&isolated_engine, build.bnum).review_status, ReviewStatus::Pending);
}

#[rstest]
#[tokio::test]
pub async fn reconcile_replaces_stale_index_entry(isolated_engine: IsolatedEngine) {
    let dir = isolated_engine.repo_dir(MAIN, ARCH);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("baz-1.0-1-x86_64.pkg.tar.xz"), b"old").unwrap();
    fs::write(dir.join("baz-1.0-1-x86_64.pkg.tar.xz.sig"), b"old").unwrap();
    fs::write(dir.join("baz-1.1-1-x86_64.pkg.tar.xz"), b"new").unwrap();
    isolated_engine.index.insert(&isolated_engine.db_path(MAIN, ARCH), PkgRef::new("baz", "1.0-1", ARCH));

    let state = isolated_engine.engine.sync_repo(MAIN, ARCH).await.unwrap();

    assert_consistent(&state);
    assert_eq!(state.pkgs_index, [PkgRef::new("baz", "1.1-1", ARCH)].into_iter().collect());
    assert!(!dir.join("baz-1.0-1-x86_64.pkg.tar.xz").exists());
    assert!(!dir.join("baz-1.0-1-x86_64.pkg.tar.xz.sig").exists());
    assert!(dir.join("baz-1.1-1-x86_64.pkg.tar.xz").exists());
}

#[rstest]
#[tokio::test]
pub async fn reconcile_is_idempotent(isolated_engine: IsolatedEngine) {
    setup_single_staged_package(&isolated_engine).await;
    let engine = &isolated_engine.engine;

    let first = engine.repos.sync_all(STAGING).await.unwrap();
    let mutations = isolated_engine.index.mutations();
    let second = engine.repos.sync_all(STAGING).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(isolated_engine.index.mutations(), mutations);
    for state in &second {
        assert_consistent(state);
    }
}

#[rstest]
#[tokio::test]
pub async fn worker_runs_queued_transactions(isolated_engine: IsolatedEngine) {
    let engine = &isolated_engine.engine;
    assert!(!handler::work(engine).await.unwrap());

    add_recipe(&isolated_engine, DUMMY_PACKAGE, &simple_recipe(DUMMY_PACKAGE, "1.0", &[]));
    let names = [DUMMY_PACKAGE.to_string()].into_iter().collect();
    engine.enqueue_transaction(names, None).unwrap();

    assert!(handler::work(engine).await.unwrap());
    assert!(engine.status.queued_transactions().unwrap().is_empty());
    assert!(!handler::work(engine).await.unwrap());
    assert_eq!(isolated_engine.runtime.created(), vec![DUMMY_PACKAGE]);
}

#[rstest]
#[tokio::test]
pub async fn empty_batch_is_rejected(isolated_engine: IsolatedEngine) {
    let engine = &isolated_engine.engine;
    assert!(engine.enqueue_transaction(BTreeSet::new(), None).is_err());
    assert!(engine.status.queued_transactions().unwrap().is_empty());
}

#[rstest]
#[tokio::test]
pub async fn finished_transaction_cannot_run_again(isolated_engine: IsolatedEngine) {
    let build = setup_single_staged_package(&isolated_engine).await;
    assert!(isolated_engine.engine.run_transaction(build.tnum).await.is_err());
    assert_eq!(isolated_engine.runtime.created().len(), 1);
}
