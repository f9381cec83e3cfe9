pub mod fakes;

use crate::fixtures::fakes::{FakeHost, FakeIndex, FakeRuntime, FakeSigner};
use pkgbuilderd::store::MemoryStore;
use pkgbuilderd::{Collaborators, Engine, Timing};
use pkgbuilderd_common::config::ConfigFile;
use rstest::fixture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const PACKAGES_ROOT: &str = "antergos";
pub const STAGING: &str = "antergos-staging";
pub const MAIN: &str = "antergos";
pub const ARCH: &str = "x86_64";

/// An engine running against a temporary directory and fake collaborators.
pub struct IsolatedEngine {
    pub engine: Engine,
    pub runtime: Arc<FakeRuntime>,
    pub signer: Arc<FakeSigner>,
    pub host: Arc<FakeHost>,
    pub index: Arc<FakeIndex>,
    pub dir: TempDir,
}

impl IsolatedEngine {
    pub fn repo_dir(&self, repo: &str, arch: &str) -> PathBuf {
        self.engine.repos.dir(repo, arch)
    }

    pub fn db_path(&self, repo: &str, arch: &str) -> PathBuf {
        self.engine.repos.db_path(repo, arch)
    }
}

#[fixture]
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temporary directory")
}

#[fixture]
pub fn config_file(temp_dir: TempDir) -> (ConfigFile, TempDir) {
    let root = temp_dir.path();
    let mut config = ConfigFile::default();

    config.paths.build_dir = Some(root.join("build"));
    config.paths.repo_dir = Some(root.join("repo"));
    config.paths.scripts_dir = Some(root.join("scripts"));
    config.paths.cache_dir = Some(root.join("cache"));
    config.paths.gnupg_dir = Some(root.join("gnupg"));

    config.source.packages_root = Some(PACKAGES_ROOT.to_string());
    config.source.recipe_dirs = vec!["cinnamon".to_string()];

    config.repos.staging = Some(STAGING.to_string());
    config.repos.main = Some(MAIN.to_string());
    config.repos.architectures = vec![ARCH.to_string(), "i686".to_string()];
    config.repos.index_lock_timeout = Some(1);

    config.docker.build_timeout = Some(60);

    (config, temp_dir)
}

#[fixture]
pub fn isolated_engine(config_file: (ConfigFile, TempDir)) -> IsolatedEngine {
    let (config, dir) = config_file;

    let runtime = Arc::new(FakeRuntime::default());
    let signer = Arc::new(FakeSigner::default());
    let host = Arc::new(FakeHost::default());
    let index = Arc::new(FakeIndex::default());

    let collab = Collaborators {
        runtime: runtime.clone(),
        signer: signer.clone(),
        host: host.clone(),
        index: index.clone(),
    };
    let timing = Timing {
        settle: Duration::ZERO,
        index_lock_delay: Duration::from_millis(10),
    };
    let engine = Engine::new(config, Arc::new(MemoryStore::default()), collab, timing);

    IsolatedEngine {
        engine,
        runtime,
        signer,
        host,
        index,
        dir,
    }
}
