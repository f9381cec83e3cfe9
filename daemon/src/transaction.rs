use crate::container::ImageManager;
use crate::models::{BuildRecord, Package, TransactionRecord};
use crate::recipe::{RecipeLocation, RecipeTree, SourceResolver};
use crate::repo::RepoManager;
use crate::runner::{self, BuildDirs, BuildRunner};
use crate::sorter;
use crate::source::SourceHost;
use crate::status::ClusterState;
use crate::store::Store;
use chrono::Utc;
use pkgbuilderd_common::config::{ConfigFile, FS_SETTLE_DELAY};
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::ReviewStatus;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tokio::time;

/// A package that made it through version resolution.
struct Queued {
    pkg: Package,
    location: RecipeLocation,
}

/// Compute the build order of a batch. Dependencies outside the batch are
/// ignored, packages without any relation to the rest of the batch follow
/// the sorted ones in their original order.
pub fn queue_order(pkgs: &[(String, BTreeSet<String>)]) -> Vec<String> {
    let names = pkgs.iter().map(|(name, _)| name.as_str()).collect::<BTreeSet<_>>();

    let intersecting = pkgs.iter()
        .map(|(name, deps)| {
            let deps = deps.iter()
                .filter(|d| names.contains(d.as_str()) && *d != name)
                .cloned()
                .collect::<BTreeSet<_>>();
            (name.clone(), deps)
        })
        .collect::<Vec<_>>();

    let related = intersecting.iter()
        .flat_map(|(name, deps)| {
            let own = if deps.is_empty() { None } else { Some(name.clone()) };
            own.into_iter().chain(deps.iter().cloned())
        })
        .collect::<BTreeSet<_>>();

    let (mut order, unresolved) = sorter::build_order(
        intersecting.iter()
            .filter(|(name, _)| related.contains(name))
            .cloned()
    );
    if !unresolved.is_empty() {
        warn!("Building {:?} in arbitrary order", unresolved);
    }

    order.extend(
        intersecting.into_iter()
            .map(|(name, _)| name)
            .filter(|name| !related.contains(name))
    );
    order
}

pub struct TransactionRunner {
    store: Arc<dyn Store>,
    status: Arc<ClusterState>,
    runner: Arc<BuildRunner>,
    repos: Arc<RepoManager>,
    host: Arc<dyn SourceHost>,
    images: Arc<ImageManager>,
    config: Arc<ConfigFile>,
    settle_delay: Duration,
}

impl TransactionRunner {
    pub fn new(
        store: Arc<dyn Store>,
        status: Arc<ClusterState>,
        runner: Arc<BuildRunner>,
        repos: Arc<RepoManager>,
        host: Arc<dyn SourceHost>,
        images: Arc<ImageManager>,
        config: Arc<ConfigFile>,
    ) -> TransactionRunner {
        TransactionRunner {
            store,
            status,
            runner,
            repos,
            host,
            images,
            config,
            settle_delay: Duration::from_secs(FS_SETTLE_DELAY),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> TransactionRunner {
        self.settle_delay = delay;
        self
    }

    async fn workdir(&self, txn: &mut TransactionRecord) -> Result<TempDir> {
        let build_dir = self.config.paths.build_dir();
        fs::create_dir_all(&build_dir).await
            .with_context(|| anyhow!("Failed to create build directory: {:?}", build_dir))?;

        let base = tempfile::Builder::new()
            .prefix(&format!("{}_", txn.tnum))
            .tempdir_in(&build_dir)
            .with_context(|| anyhow!("Failed to create transaction directory in {:?}", build_dir))?;

        let result_dir = base.path().join("result");
        fs::create_dir_all(&result_dir).await?;

        txn.base_path = Some(base.path().to_path_buf());
        txn.path = Some(base.path().join("source"));
        txn.result_dir = Some(result_dir);
        Ok(base)
    }

    fn load_package(&self, name: &str) -> Result<Package> {
        let store = self.store.as_ref();
        if Package::exists(store, name)? {
            Package::load(store, name)
        } else {
            Ok(Package::new(name))
        }
    }

    async fn prepare(&self, resolver: &SourceResolver, name: &str) -> Result<Queued> {
        let mut pkg = self.load_package(name)?;
        let (location, recipe) = resolver.load(name).await?;
        let default_repos = [
            self.config.repos.staging().to_string(),
            self.config.repos.main().to_string(),
        ];
        resolver.sync_package(&mut pkg, &location, &recipe, &default_repos);
        let version = resolver.resolve_version(&mut pkg, &location, &recipe).await?;
        pkg.save(self.store.as_ref())?;

        for child in pkg.split_packages.iter().filter(|c| **c != pkg.name) {
            let mut split = self.load_package(child)?;
            split.pkgver = pkg.pkgver.clone();
            split.pkgrel = pkg.pkgrel.clone();
            split.epoch = pkg.epoch.clone();
            split.version_str = pkg.version_str.clone();
            split.is_initialized = true;
            split.save(self.store.as_ref())?;
        }

        info!("Queued {} {}", name, version);
        Ok(Queued { pkg, location })
    }

    async fn promote(&self, build: &mut BuildRecord) -> Result<()> {
        time::sleep(self.settle_delay).await;

        let files = build.generated_files.iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        let staging = self.config.repos.staging();
        let placed = self.repos.publish(staging, &files).await?;

        build.staging_files = placed.iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        build.save(self.store.as_ref())?;
        Ok(())
    }

    /// A completed build that could not be staged counts as failed.
    fn reject(&self, build: &mut BuildRecord) -> Result<()> {
        build.mark_failed();
        build.review_status = ReviewStatus::None;
        build.staging_files.clear();
        build.save(self.store.as_ref())?;
        self.status.remove_pending_review(build.bnum)?;
        self.status.remove_completed(build.bnum)?;
        self.status.add_failed(build.bnum)?;
        Ok(())
    }

    async fn build_all(&self, txn: &mut TransactionRecord, result_root: &Path, mut queued: Vec<Queued>) -> Result<()> {
        let store = self.store.as_ref();

        let deps = queued.iter()
            .map(|q| {
                let deps = q.pkg.depends.union(&q.pkg.makedepends).cloned().collect();
                (q.pkg.name.clone(), deps)
            })
            .collect::<Vec<_>>();
        txn.queue = queue_order(&deps);
        txn.save(store)?;
        info!("Transaction {} build order: {:?}", txn.tnum, txn.queue);

        for name in txn.queue.clone() {
            let Some(idx) = queued.iter().position(|q| q.pkg.name == name) else { continue };
            let Queued { mut pkg, location } = queued.swap_remove(idx);

            txn.building = Some(name.clone());
            txn.save(store)?;

            let dirs = BuildDirs {
                pkg_dir: location.dir.clone(),
                result_dir: result_root.join(&name),
            };

            let mut build = match self.runner.run(&mut pkg, txn.tnum, &dirs).await {
                Ok(build) => build,
                Err(err) => {
                    error!("Build of {} could not be recorded: {:#}", name, err);
                    continue;
                }
            };
            txn.builds.push(build.bnum);

            if build.completed {
                match self.promote(&mut build).await {
                    Ok(()) => {
                        txn.completed.insert(build.bnum);
                    }
                    Err(err) => {
                        error!("Failed to move build {} into staging: {:#}", build.bnum, err);
                        self.reject(&mut build)?;
                        runner::update_rates(store, &mut pkg)?;
                        pkg.save(store)?;
                        txn.failed.insert(build.bnum);
                    }
                }
            } else {
                txn.failed.insert(build.bnum);
            }
            txn.save(store)?;
        }

        Ok(())
    }

    async fn execute(&self, txn: &mut TransactionRecord) -> Result<TempDir> {
        let base = self.workdir(txn).await?;
        txn.save(self.store.as_ref())?;

        let checkout = base.path().join("source");
        txn.sha_before = self.host.checkout(&checkout).await
            .context("Failed to check out recipe tree")?;
        txn.save(self.store.as_ref())?;

        if let Err(err) = self.images.ensure_fresh().await {
            warn!("Failed to refresh build image: {:#}", err);
        }

        let tree = RecipeTree::new(
            &checkout,
            self.config.source.packages_root(),
            self.config.source.recipe_dirs(),
        );
        let resolver = SourceResolver::new(tree, self.host.clone());

        let mut queued = Vec::new();
        for name in &txn.packages {
            match self.prepare(&resolver, name).await {
                Ok(q) => queued.push(q),
                Err(err) => error!("Dropping {} from transaction {}: {:#}", name, txn.tnum, err),
            }
        }
        txn.sha_after = resolver.last_commit().or_else(|| txn.sha_before.clone());
        txn.save(self.store.as_ref())?;

        let result_root = base.path().join("result");
        self.build_all(txn, &result_root, queued).await?;
        Ok(base)
    }

    async fn finish(&self, txn: &mut TransactionRecord, base: Option<TempDir>) -> Result<()> {
        txn.set_finished();
        txn.end = Some(Utc::now());
        txn.save(self.store.as_ref())?;

        for bnum in &txn.builds {
            self.status.remove_now_building(*bnum)?;
        }
        self.status.remove_running_transaction(txn.tnum)?;

        // dropping the TempDir of an aborted transaction removed it already
        if let Some(base) = base {
            let path = base.path().to_path_buf();
            if let Err(err) = base.close() {
                warn!("Failed to remove transaction directory {:?}: {:#}", path, err);
            }
        }

        if self.status.running_transactions()?.is_empty() && self.status.queued_transactions()?.is_empty() {
            self.status.set_idle(true)?;
            self.status.set_status("Idle")?;
        }
        Ok(())
    }

    /// Run a queued transaction to completion.
    pub async fn run(&self, tnum: i64) -> Result<TransactionRecord> {
        let mut txn = TransactionRecord::load(self.store.as_ref(), tnum)?;
        if txn.is_finished {
            bail!("Transaction {} has already finished", tnum);
        }

        txn.set_running();
        txn.start = Some(Utc::now());
        txn.save(self.store.as_ref())?;
        self.status.add_running_transaction(tnum)?;
        self.status.set_idle(false)?;
        self.status.set_status(&format!("Initializing transaction {}", tnum))?;
        info!("Starting transaction {} for {:?}", tnum, txn.packages);

        let (base, outcome) = match self.execute(&mut txn).await {
            Ok(base) => (Some(base), Ok(())),
            Err(err) => {
                error!("Transaction {} aborted: {:#}", tnum, err);
                (None, Err(err))
            }
        };
        self.finish(&mut txn, base).await?;
        outcome?;

        info!("Transaction {} finished: {} completed, {} failed", tnum, txn.completed.len(), txn.failed.len());
        Ok(txn)
    }
}
