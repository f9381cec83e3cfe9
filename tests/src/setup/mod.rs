use crate::data::*;
use crate::fixtures::IsolatedEngine;
use pkgbuilderd::models::{BuildRecord, TransactionRecord};
use pkgbuilderd_common::ReviewStatus;
use std::collections::BTreeSet;

pub fn add_recipe(isolated: &IsolatedEngine, name: &str, text: &str) {
    isolated.host.put(&recipe_path(name), text);
}

/// Queue a transaction and run it the way a worker would.
pub async fn run_transaction(isolated: &IsolatedEngine, names: &[&str]) -> TransactionRecord {
    let names = names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>();
    let tnum = isolated.engine.enqueue_transaction(names, Some("tests".to_string())).unwrap();
    let next = isolated.engine.status.next_transaction().unwrap();
    assert_eq!(next, Some(tnum));
    isolated.engine.run_transaction(tnum).await.unwrap()
}

pub fn load_build(isolated: &IsolatedEngine, bnum: i64) -> BuildRecord {
    BuildRecord::load(isolated.engine.store.as_ref(), bnum).unwrap()
}

pub async fn setup_single_staged_package(isolated: &IsolatedEngine) -> BuildRecord {
    add_recipe(isolated, DUMMY_PACKAGE, &simple_recipe(DUMMY_PACKAGE, "1.0", &[]));
    let txn = run_transaction(isolated, &[DUMMY_PACKAGE]).await;
    assert_eq!(txn.completed.len(), 1);
    load_build(isolated, txn.builds[0])
}

pub async fn setup_single_reviewed_package(isolated: &IsolatedEngine, result: ReviewStatus) -> BuildRecord {
    let build = setup_single_staged_package(isolated).await;
    isolated.engine.set_review_result(build.bnum, "developer", result).await.unwrap()
}

pub async fn setup_dependent_packages(isolated: &IsolatedEngine) -> TransactionRecord {
    add_recipe(isolated, DUMMY_LIBRARY, &simple_recipe(DUMMY_LIBRARY, "2.0", &[]));
    add_recipe(isolated, DUMMY_APPLICATION, &simple_recipe(DUMMY_APPLICATION, "1.0", &[DUMMY_LIBRARY]));
    run_transaction(isolated, &[DUMMY_APPLICATION, DUMMY_LIBRARY]).await
}
