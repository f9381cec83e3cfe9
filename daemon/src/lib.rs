use crate::container::{ContainerRuntime, DockerRuntime, ImageManager};
use crate::live::LiveOutput;
use crate::models::{BuildRecord, RepoStateRecord, TransactionRecord};
use crate::repo::{IndexTool, RepoAddTool, RepoManager};
use crate::review::ReviewHandler;
use crate::runner::BuildRunner;
use crate::sign::{GpgSigner, Signer};
use crate::source::{GitHubHost, SourceHost};
use crate::status::ClusterState;
use crate::store::{SqliteStore, Store};
use crate::transaction::TransactionRunner;
use pkgbuilderd_common::config::{ConfigFile, DEFAULT_INDEX_LOCK_DELAY, FS_SETTLE_DELAY};
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::ReviewStatus;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub mod container;
pub mod db;
pub mod handler;
pub mod live;
pub mod models;
pub mod pkgfile;
pub mod proc;
pub mod recipe;
pub mod repo;
pub mod review;
pub mod runner;
pub mod schema;
pub mod sign;
pub mod sorter;
pub mod source;
pub mod status;
pub mod store;
pub mod transaction;
pub mod util;
pub mod versions;

/// External systems the engine talks to.
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub signer: Arc<dyn Signer>,
    pub host: Arc<dyn SourceHost>,
    pub index: Arc<dyn IndexTool>,
}

impl Collaborators {
    /// Docker, gpg, GitHub and repo-add as configured.
    pub fn from_config(config: &ConfigFile) -> Result<Collaborators> {
        Ok(Collaborators {
            runtime: Arc::new(DockerRuntime::connect(&config.docker)?),
            signer: Arc::new(GpgSigner::new(&config.signing, &config.paths)?),
            host: Arc::new(GitHubHost::new(config.source.clone())?),
            index: Arc::new(RepoAddTool::default()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Timing {
    /// Pause between a finished build and copying its artifacts.
    pub settle: Duration,
    /// Pause between attempts while the index is locked.
    pub index_lock_delay: Duration,
}

impl Default for Timing {
    fn default() -> Timing {
        Timing {
            settle: Duration::from_secs(FS_SETTLE_DELAY),
            index_lock_delay: Duration::from_secs(DEFAULT_INDEX_LOCK_DELAY),
        }
    }
}

/// The build transaction engine, every component wired to the same store
/// and cluster state.
pub struct Engine {
    pub config: Arc<ConfigFile>,
    pub store: Arc<dyn Store>,
    pub status: Arc<ClusterState>,
    pub live: Arc<LiveOutput>,
    pub repos: Arc<RepoManager>,
    pub transactions: Arc<TransactionRunner>,
    pub reviews: Arc<ReviewHandler>,
}

impl Engine {
    pub fn new(config: ConfigFile, store: Arc<dyn Store>, collab: Collaborators, timing: Timing) -> Engine {
        let config = Arc::new(config);
        let status = Arc::new(ClusterState::new(store.clone()));
        let live = Arc::new(LiveOutput::default());

        let repos = Arc::new(
            RepoManager::new(store.clone(), status.clone(), collab.index, &config)
                .with_lock_delay(timing.index_lock_delay)
        );
        let images = Arc::new(ImageManager::new(collab.runtime.clone(), &config.docker));
        let runner = Arc::new(BuildRunner::new(
            store.clone(),
            status.clone(),
            live.clone(),
            collab.runtime,
            collab.signer,
            config.clone(),
        ));
        let transactions = Arc::new(
            TransactionRunner::new(
                store.clone(),
                status.clone(),
                runner,
                repos.clone(),
                collab.host,
                images,
                config.clone(),
            ).with_settle_delay(timing.settle)
        );
        let reviews = Arc::new(ReviewHandler::new(store.clone(), status.clone(), repos.clone(), config.clone()));

        Engine {
            config,
            store,
            status,
            live,
            repos,
            transactions,
            reviews,
        }
    }

    /// Open the configured database and connect to the real collaborators.
    pub fn connect(config: ConfigFile) -> Result<Engine> {
        let database = config.paths.database();
        let url = database.to_str()
            .with_context(|| anyhow!("Database path is not valid utf-8: {:?}", database))?;
        let store = Arc::new(SqliteStore::open(url)?);
        let collab = Collaborators::from_config(&config)?;
        Ok(Engine::new(config, store, collab, Timing::default()))
    }

    /// Create a transaction for a batch of packages and queue it.
    pub fn enqueue_transaction(&self, names: BTreeSet<String>, initiated_by: Option<String>) -> Result<i64> {
        if names.is_empty() {
            bail!("Refusing to queue a transaction without packages");
        }
        let txn = TransactionRecord::create(self.store.as_ref(), names, initiated_by)?;
        self.status.enqueue_transaction(txn.tnum)?;
        info!("Queued transaction {} for {:?}", txn.tnum, txn.packages);
        Ok(txn.tnum)
    }

    pub async fn run_transaction(&self, tnum: i64) -> Result<TransactionRecord> {
        self.transactions.run(tnum).await
    }

    pub async fn set_review_result(&self, bnum: i64, reviewer: &str, result: ReviewStatus) -> Result<BuildRecord> {
        self.reviews.set_review_result(bnum, reviewer, result).await
    }

    /// Follow the output of a running build, None if it is not running.
    pub fn follow_build(&self, bnum: i64) -> Option<broadcast::Receiver<String>> {
        self.live.subscribe(bnum)
    }

    pub async fn sync_repo(&self, repo: &str, arch: &str) -> Result<RepoStateRecord> {
        self.repos.sync(repo, arch).await
    }
}
