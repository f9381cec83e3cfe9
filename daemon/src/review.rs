use crate::models::{BuildRecord, Package};
use crate::pkgfile;
use crate::repo::RepoManager;
use crate::status::ClusterState;
use crate::store::Store;
use chrono::Utc;
use pkgbuilderd_common::config::ConfigFile;
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::ReviewStatus;
use std::path::PathBuf;
use std::sync::Arc;

/// Applies developer review results to finished builds.
pub struct ReviewHandler {
    store: Arc<dyn Store>,
    status: Arc<ClusterState>,
    repos: Arc<RepoManager>,
    config: Arc<ConfigFile>,
}

/// Staged package archives that are real files, symlinks and signatures
/// follow them.
fn staged_packages(build: &BuildRecord) -> Vec<PathBuf> {
    build.staging_files.iter()
        .map(PathBuf::from)
        .filter(|p| {
            let is_pkg = p.file_name()
                .and_then(|n| n.to_str())
                .map(pkgfile::is_package_file)
                .unwrap_or(false);
            let is_file = std::fs::symlink_metadata(p)
                .map(|m| m.file_type().is_file())
                .unwrap_or(false);
            is_pkg && is_file
        })
        .collect()
}

impl ReviewHandler {
    pub fn new(store: Arc<dyn Store>, status: Arc<ClusterState>, repos: Arc<RepoManager>, config: Arc<ConfigFile>) -> ReviewHandler {
        ReviewHandler {
            store,
            status,
            repos,
            config,
        }
    }

    async fn promote(&self, build: &BuildRecord) -> Result<()> {
        let store = self.store.as_ref();
        let main = self.config.repos.main();
        let staging = self.config.repos.staging();

        let mut pkg = Package::load(store, &build.pkgname)?;
        if !pkg.is_allowed_in(main) {
            warn!("{} is not allowed in {}, allowing it because build {} passed review", pkg.name, main, build.bnum);
            pkg.allowed_in.push(main.to_string());
            pkg.save(store)?;
        }

        let files = staged_packages(build);
        if files.is_empty() {
            bail!("Build {} has no staged packages left to move into {}", build.bnum, main);
        }
        let placed = self.repos.publish(main, &files).await?;
        info!("Moved build {} into {}: {:?}", build.bnum, main, placed);

        self.repos.withdraw(staging, &build.staging_files).await
    }

    /// Record a review result. Only builds that are pending review accept
    /// one.
    pub async fn set_review_result(&self, bnum: i64, reviewer: &str, result: ReviewStatus) -> Result<BuildRecord> {
        if !result.is_result() {
            bail!("Invalid review result: {}", result);
        }

        let store = self.store.as_ref();
        let mut build = BuildRecord::load(store, bnum)?;
        if build.review_status != ReviewStatus::Pending {
            bail!("Build {} is not pending review (status is {})", bnum, build.review_status);
        }

        let _status = self.status.status_guard("Processing developer review result.")?;
        info!("{} marked build {} of {} as {}", reviewer, bnum, build.pkgname, result);

        match result {
            ReviewStatus::Passed => {
                self.promote(&build).await?;
                build.staging_files.clear();
            }
            ReviewStatus::Failed => {
                self.repos.withdraw(self.config.repos.staging(), &build.staging_files).await?;
                build.staging_files.clear();
            }
            _ => (),
        }

        build.review_status = result;
        build.review_dev = Some(reviewer.to_string());
        build.review_date = Some(Utc::now());
        build.save(store)?;
        self.status.remove_pending_review(bnum)?;

        Ok(build)
    }
}
