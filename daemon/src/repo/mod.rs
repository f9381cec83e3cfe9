pub mod decompress;
pub mod index;

use crate::models::RepoStateRecord;
use crate::pkgfile::{self, PkgFile};
use crate::status::ClusterState;
use crate::store::Store;
use crate::util;
use crate::versions::vercmp;
use pkgbuilderd_common::config::{ConfigFile, DEFAULT_INDEX_LOCK_DELAY};
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::PkgRef;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub use self::index::{IndexError, IndexTool, RepoAddTool};

/// One correction needed to bring the index in line with the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Add this file to the index.
    AddToIndex(String),
    /// Remove this package name from the index.
    RemoveFromIndex(String),
    /// Delete this superseded file.
    DeleteFile(String),
}

/// Decide what to do about every package name that is only known to one
/// side. `files` maps the filesystem view to file names.
pub fn plan_actions(index: &BTreeSet<PkgRef>, files: &BTreeMap<PkgRef, String>) -> Vec<Action> {
    let unaccounted_for = index.iter()
        .filter(|r| !files.contains_key(r))
        .chain(files.keys().filter(|r| !index.contains(r)))
        .map(|r| r.name.as_str())
        .collect::<BTreeSet<_>>();

    let mut add = Vec::new();
    let mut remove = Vec::new();
    let mut delete = Vec::new();

    for name in unaccounted_for {
        let in_index = index.iter()
            .filter(|r| r.name == name)
            .map(|r| r.version.as_str())
            .collect::<Vec<_>>();
        if in_index.len() > 1 {
            error!("Index lists {} more than once: {:?}", name, in_index);
        }
        let in_index = in_index.into_iter().max_by(|a, b| vercmp(a, b));

        let on_disk = files.iter()
            .filter(|(r, _)| r.name == name)
            .collect::<Vec<_>>();

        let Some(latest) = on_disk.iter().map(|(r, _)| r.version.as_str()).max_by(|a, b| vercmp(a, b)) else {
            if in_index.is_some() {
                remove.push(Action::RemoveFromIndex(name.to_string()));
            }
            continue;
        };

        if let Some(current) = in_index {
            if vercmp(current, latest) == Ordering::Greater {
                warn!("Index has {} {} but the newest file is {}, leaving it alone", name, current, latest);
                continue;
            }
        }

        if in_index != Some(latest) {
            if let Some((_, filename)) = on_disk.iter().find(|(r, _)| r.version == latest) {
                add.push(Action::AddToIndex(filename.to_string()));
            }
        }

        for (r, filename) in &on_disk {
            if r.version != latest {
                delete.push(Action::DeleteFile(filename.to_string()));
            }
        }
    }

    add.into_iter().chain(remove).chain(delete).collect()
}

/// Exclusive access to one (repository, architecture) directory.
pub struct RepoLock {
    pub repo: String,
    pub arch: String,
    pub dir: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

#[derive(Debug, Default)]
struct Scan {
    index: BTreeSet<PkgRef>,
    files: BTreeMap<PkgRef, String>,
    unparsable: BTreeSet<String>,
}

pub struct RepoManager {
    store: Arc<dyn Store>,
    status: Arc<ClusterState>,
    tool: Arc<dyn IndexTool>,
    repo_dir: PathBuf,
    architectures: Vec<String>,
    lock_timeout: Duration,
    lock_delay: Duration,
    locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl RepoManager {
    pub fn new(store: Arc<dyn Store>, status: Arc<ClusterState>, tool: Arc<dyn IndexTool>, config: &ConfigFile) -> RepoManager {
        RepoManager {
            store,
            status,
            tool,
            repo_dir: config.paths.repo_dir(),
            architectures: config.repos.architectures(),
            lock_timeout: Duration::from_secs(config.repos.index_lock_timeout()),
            lock_delay: Duration::from_secs(DEFAULT_INDEX_LOCK_DELAY),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lock_delay(mut self, delay: Duration) -> RepoManager {
        self.lock_delay = delay;
        self
    }

    pub fn architectures(&self) -> &[String] {
        &self.architectures
    }

    /// The architecture that receives the real copy of `any` packages.
    pub fn primary_arch(&self) -> Result<&str> {
        self.architectures.first()
            .map(|a| a.as_str())
            .context("No architectures configured")
    }

    pub fn dir(&self, repo: &str, arch: &str) -> PathBuf {
        self.repo_dir.join(repo).join(arch)
    }

    pub fn db_path(&self, repo: &str, arch: &str) -> PathBuf {
        self.dir(repo, arch).join(format!("{}.db.tar.gz", repo))
    }

    pub async fn lock(&self, repo: &str, arch: &str) -> RepoLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|err| err.into_inner());
            locks.entry((repo.to_string(), arch.to_string()))
                .or_default()
                .clone()
        };
        let guard = mutex.lock_owned().await;
        RepoLock {
            repo: repo.to_string(),
            arch: arch.to_string(),
            dir: self.dir(repo, arch),
            _guard: guard,
        }
    }

    /// Lock every architecture of a repository, always in the same order.
    pub async fn lock_all(&self, repo: &str) -> Vec<RepoLock> {
        let mut locks = Vec::new();
        for arch in &self.architectures {
            locks.push(self.lock(repo, arch).await);
        }
        locks
    }

    async fn scan(&self, lock: &RepoLock) -> Result<Scan> {
        let mut scan = Scan {
            index: self.tool.read(&self.db_path(&lock.repo, &lock.arch)).await?,
            ..Default::default()
        };

        util::remove_broken_symlinks(&lock.dir).await?;

        let mut entries = fs::read_dir(&lock.dir).await
            .with_context(|| anyhow!("Failed to list repository directory: {:?}", lock.dir))?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(filename) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if !pkgfile::is_package_file(&filename) {
                continue;
            }
            match PkgFile::parse(&filename) {
                Ok(pkg) => {
                    scan.files.insert(pkg.to_ref(), filename);
                }
                Err(err) => {
                    warn!("{:#}", err);
                    scan.unparsable.insert(filename);
                }
            }
        }

        Ok(scan)
    }

    async fn retry_locked<F, Fut>(&self, what: &str, mut f: F) -> Result<(), IndexError>
        where F: FnMut() -> Fut,
              Fut: std::future::Future<Output = Result<(), IndexError>>,
    {
        let started = Instant::now();
        loop {
            match f().await {
                Err(IndexError::Locked) if started.elapsed() < self.lock_timeout => {
                    warn!("Index is locked, retrying {} in {}s", what, self.lock_delay.as_secs());
                    tokio::time::sleep(self.lock_delay).await;
                }
                Err(IndexError::Locked) => {
                    error!("Gave up waiting for the index lock for {}", what);
                    return Err(IndexError::Locked);
                }
                result => return result,
            }
        }
    }

    async fn apply(&self, lock: &RepoLock, actions: &[Action]) {
        let db = self.db_path(&lock.repo, &lock.arch);
        for action in actions {
            info!("{}/{}: {:?}", lock.repo, lock.arch, action);
            let result = match action {
                Action::AddToIndex(filename) => {
                    let file = lock.dir.join(filename);
                    self.retry_locked(filename, || self.tool.add(&db, &file)).await
                        .map_err(Error::from)
                }
                Action::RemoveFromIndex(name) => {
                    self.retry_locked(name, || self.tool.remove(&db, name)).await
                        .map_err(Error::from)
                }
                Action::DeleteFile(filename) => {
                    util::remove_with_sig(&lock.dir.join(filename)).await
                }
            };
            if let Err(err) = result {
                error!("{}/{}: {:?} failed: {:#}", lock.repo, lock.arch, action, err);
            }
        }
    }

    /// Reconcile a repository directory that is already locked.
    pub async fn sync_locked(&self, lock: &RepoLock) -> Result<RepoStateRecord> {
        fs::create_dir_all(&lock.dir).await
            .with_context(|| anyhow!("Failed to create repository directory: {:?}", lock.dir))?;

        let store = self.store.as_ref();
        RepoStateRecord::set_locked(store, &lock.repo, &lock.arch, true)?;
        let result = self.reconcile(lock).await;
        RepoStateRecord::set_locked(store, &lock.repo, &lock.arch, false)?;
        let mut state = result?;
        state.locked = false;
        Ok(state)
    }

    async fn reconcile(&self, lock: &RepoLock) -> Result<RepoStateRecord> {
        let scan = self.scan(lock).await?;
        let actions = plan_actions(&scan.index, &scan.files);
        let scan = if actions.is_empty() {
            scan
        } else {
            self.apply(lock, &actions).await;
            self.scan(lock).await?
        };

        let mut state = RepoStateRecord::load(self.store.as_ref(), &lock.repo, &lock.arch)?;
        state.pkgs_index = scan.index;
        state.pkgs_fs = scan.files.into_keys().collect();
        state.unparsable = scan.unparsable;
        state.derive();
        state.save(self.store.as_ref())?;

        if !state.unaccounted_for.is_empty() {
            warn!("{}/{}: unaccounted for: {:?}", lock.repo, lock.arch, state.unaccounted_for);
        }
        Ok(state)
    }

    pub async fn sync(&self, repo: &str, arch: &str) -> Result<RepoStateRecord> {
        let _status = self.status.status_guard(&format!("Updating {} repo database.", repo))?;
        let lock = self.lock(repo, arch).await;
        self.sync_locked(&lock).await
    }

    /// Reconcile every architecture of a repository.
    pub async fn sync_all(&self, repo: &str) -> Result<Vec<RepoStateRecord>> {
        let _status = self.status.status_guard(&format!("Updating {} repo database.", repo))?;
        let mut states = Vec::new();
        for lock in self.lock_all(repo).await {
            states.push(self.sync_locked(&lock).await?);
        }
        Ok(states)
    }

    /// Place package files (and their signatures) into every architecture
    /// directory of `repo`, then reconcile. `any` packages are copied into
    /// the primary architecture and symlinked from the others. Returns the
    /// paths that were created.
    ///
    /// Every file name is validated before anything is copied. If placing
    /// fails halfway, the files placed so far are removed again.
    pub async fn publish(&self, repo: &str, files: &[PathBuf]) -> Result<BTreeSet<PathBuf>> {
        let mut pkgs = Vec::new();
        for file in files {
            let filename = file.file_name()
                .and_then(|n| n.to_str())
                .with_context(|| anyhow!("Invalid artifact path: {:?}", file))?;
            if !pkgfile::is_package_file(filename) {
                continue;
            }
            let pkg = PkgFile::parse(filename)
                .with_context(|| anyhow!("Refusing to publish {:?} into {}", file, repo))?;
            pkgs.push((file.as_path(), pkg));
        }

        let _status = self.status.status_guard(&format!("Updating {} repo database.", repo))?;
        let locks = self.lock_all(repo).await;

        let mut placed = BTreeSet::new();
        if let Err(err) = self.place(repo, &pkgs, &mut placed).await {
            for path in placed.iter().rev() {
                if let Err(err) = util::remove_if_exists(path).await {
                    warn!("Failed to remove partially published {:?}: {:#}", path, err);
                }
            }
            return Err(err);
        }

        for lock in &locks {
            self.sync_locked(lock).await?;
        }
        Ok(placed)
    }

    async fn place(&self, repo: &str, pkgs: &[(&Path, PkgFile)], placed: &mut BTreeSet<PathBuf>) -> Result<()> {
        let primary = self.primary_arch()?;

        for (file, pkg) in pkgs {
            let arch = if pkg.is_any() { primary } else { pkg.arch.as_str() };

            let dir = self.dir(repo, arch);
            fs::create_dir_all(&dir).await
                .with_context(|| anyhow!("Failed to create repository directory: {:?}", dir))?;

            placed.insert(util::copy_into(file, &dir).await?);
            let sig = util::with_sig_ext(file);
            if sig.exists() {
                placed.insert(util::copy_into(&sig, &dir).await?);
            }

            if !pkg.is_any() {
                continue;
            }
            for other in self.architectures.iter().filter(|a| a.as_str() != primary) {
                let other_dir = self.dir(repo, other);
                fs::create_dir_all(&other_dir).await
                    .with_context(|| anyhow!("Failed to create repository directory: {:?}", other_dir))?;

                for name in [pkg.filename.clone(), pkg.sig_filename()] {
                    if !dir.join(&name).exists() {
                        continue;
                    }
                    let target = Path::new("..").join(primary).join(&name);
                    let link = other_dir.join(&name);
                    util::symlink_force(&target, &link).await?;
                    placed.insert(link);
                }
            }
        }
        Ok(())
    }

    /// Delete previously published files from `repo` and reconcile.
    pub async fn withdraw(&self, repo: &str, files: &BTreeSet<String>) -> Result<()> {
        let _status = self.status.status_guard(&format!("Updating {} repo database.", repo))?;
        let locks = self.lock_all(repo).await;
        let root = self.repo_dir.join(repo);

        for file in files {
            let path = Path::new(file);
            if !path.starts_with(&root) {
                warn!("Refusing to remove {:?}, it is not inside {:?}", path, root);
                continue;
            }
            util::remove_if_exists(path).await?;
        }

        for lock in &locks {
            self.sync_locked(lock).await?;
        }
        Ok(())
    }
}
