use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const WORKER_DELAY: u64 = 3;
pub const IDLE_DELAY: u64 = 10;
pub const FS_SETTLE_DELAY: u64 = 2;
pub const IMAGE_MAX_AGE: i64 = 24 * 3600;

pub const DEFAULT_BUILD_TIMEOUT: u64 = 36 * 3600;
pub const DEFAULT_INDEX_LOCK_TIMEOUT: u64 = 300;
pub const DEFAULT_INDEX_LOCK_DELAY: u64 = 10;

pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<ConfigFile> {
    let mut config = ConfigFile::default();

    if let Some(c) = load_from("/etc/pkgbuilderd.conf")? {
        config.update(c);
    }

    if let Ok(path) = config_path() {
        if let Some(c) = load_from(path)? {
            config.update(c);
        }
    }

    if let Some(path) = path {
        let c = load_from(path)?
            .ok_or_else(|| format_err!("Failed to read config file"))?;
        config.update(c);
    }

    Ok(config)
}

fn config_path() -> Result<PathBuf> {
    let config_dir = dirs_next::config_dir()
        .ok_or_else(|| format_err!("Failed to find config dir"))?;
    Ok(config_dir.join("pkgbuilderd.conf"))
}

fn load_from<P: AsRef<Path>>(path: P) -> Result<Option<ConfigFile>> {
    if let Ok(buf) = fs::read_to_string(path.as_ref()) {
        debug!("loading config file {:?}", path.as_ref());
        let config = toml::from_str(&buf)
            .context("Failed to load config")?;
        Ok(Some(config))
    } else {
        Ok(None)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub repos: ReposConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl ConfigFile {
    pub fn update(&mut self, c: ConfigFile) {
        self.paths.update(c.paths);
        self.source.update(c.source);
        self.docker.update(c.docker);
        self.signing.update(c.signing);
        self.repos.update(c.repos);
        self.workers.update(c.workers);
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub build_dir: Option<PathBuf>,
    pub repo_dir: Option<PathBuf>,
    pub scripts_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub gnupg_dir: Option<PathBuf>,
    pub database: Option<PathBuf>,
}

impl PathsConfig {
    pub fn update(&mut self, c: PathsConfig) {
        if c.build_dir.is_some() {
            self.build_dir = c.build_dir;
        }
        if c.repo_dir.is_some() {
            self.repo_dir = c.repo_dir;
        }
        if c.scripts_dir.is_some() {
            self.scripts_dir = c.scripts_dir;
        }
        if c.cache_dir.is_some() {
            self.cache_dir = c.cache_dir;
        }
        if c.gnupg_dir.is_some() {
            self.gnupg_dir = c.gnupg_dir;
        }
        if c.database.is_some() {
            self.database = c.database;
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        self.build_dir.clone().unwrap_or_else(|| PathBuf::from("/var/tmp/pkgbuilderd"))
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.repo_dir.clone().unwrap_or_else(|| PathBuf::from("/srv/repo"))
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts_dir.clone().unwrap_or_else(|| PathBuf::from("/usr/share/pkgbuilderd/makepkg"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| PathBuf::from("/var/cache/pacman/pkg"))
    }

    pub fn gnupg_dir(&self) -> PathBuf {
        self.gnupg_dir.clone().unwrap_or_else(|| PathBuf::from("/var/lib/pkgbuilderd/.gnupg"))
    }

    pub fn database(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(|| PathBuf::from("pkgbuilderd.db"))
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub clone_url: Option<String>,
    pub api_url: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub token: Option<String>,
    pub packages_root: Option<String>,
    #[serde(default)]
    pub recipe_dirs: Vec<String>,
}

impl SourceConfig {
    pub fn update(&mut self, c: SourceConfig) {
        if c.clone_url.is_some() {
            self.clone_url = c.clone_url;
        }
        if c.api_url.is_some() {
            self.api_url = c.api_url;
        }
        if c.project.is_some() {
            self.project = c.project;
        }
        if c.repo.is_some() {
            self.repo = c.repo;
        }
        if c.branch.is_some() {
            self.branch = c.branch;
        }
        if c.token.is_some() {
            self.token = c.token;
        }
        if c.packages_root.is_some() {
            self.packages_root = c.packages_root;
        }
        if !c.recipe_dirs.is_empty() {
            self.recipe_dirs = c.recipe_dirs;
        }
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or("https://api.github.com")
    }

    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or("master")
    }

    pub fn packages_root(&self) -> &str {
        self.packages_root.as_deref().unwrap_or("")
    }

    /// Subdirectories searched for a recipe, in order. The empty string is
    /// the flat layout and is always tried last.
    pub fn recipe_dirs(&self) -> Vec<String> {
        let mut dirs = self.recipe_dirs.iter()
            .filter(|d| !d.is_empty())
            .cloned()
            .collect::<Vec<_>>();
        dirs.push(String::new());
        dirs
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub socket: Option<String>,
    pub build_image: Option<String>,
    pub image_context: Option<PathBuf>,
    pub memory_limit: Option<i64>,
    pub cpuset: Option<String>,
    pub build_timeout: Option<u64>,
    pub push_images: Option<bool>,
}

impl DockerConfig {
    pub fn update(&mut self, c: DockerConfig) {
        if c.socket.is_some() {
            self.socket = c.socket;
        }
        if c.build_image.is_some() {
            self.build_image = c.build_image;
        }
        if c.image_context.is_some() {
            self.image_context = c.image_context;
        }
        if c.memory_limit.is_some() {
            self.memory_limit = c.memory_limit;
        }
        if c.cpuset.is_some() {
            self.cpuset = c.cpuset;
        }
        if c.build_timeout.is_some() {
            self.build_timeout = c.build_timeout;
        }
        if c.push_images.is_some() {
            self.push_images = c.push_images;
        }
    }

    pub fn socket(&self) -> &str {
        self.socket.as_deref().unwrap_or("/var/run/docker.sock")
    }

    pub fn build_image(&self) -> &str {
        self.build_image.as_deref().unwrap_or("pkgbuilderd/makepkg")
    }

    pub fn build_timeout(&self) -> u64 {
        self.build_timeout.unwrap_or(DEFAULT_BUILD_TIMEOUT)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    pub key_id: Option<String>,
    pub passphrase: Option<String>,
    pub passphrase_file: Option<PathBuf>,
    pub gpg_bin: Option<PathBuf>,
}

impl SigningConfig {
    pub fn update(&mut self, c: SigningConfig) {
        if c.key_id.is_some() {
            self.key_id = c.key_id;
        }
        if c.passphrase.is_some() {
            self.passphrase = c.passphrase;
        }
        if c.passphrase_file.is_some() {
            self.passphrase_file = c.passphrase_file;
        }
        if c.gpg_bin.is_some() {
            self.gpg_bin = c.gpg_bin;
        }
    }

    pub fn gpg_bin(&self) -> PathBuf {
        self.gpg_bin.clone().unwrap_or_else(|| PathBuf::from("/usr/bin/gpg"))
    }

    pub fn passphrase(&self) -> Result<Option<String>> {
        if let Some(passphrase) = &self.passphrase {
            Ok(Some(passphrase.clone()))
        } else if let Some(path) = &self.passphrase_file {
            let passphrase = fs::read_to_string(path)
                .with_context(|| anyhow!("Failed to read passphrase file: {:?}", path))?;
            Ok(Some(passphrase.trim_end_matches('\n').to_string()))
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReposConfig {
    pub staging: Option<String>,
    pub main: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    pub index_lock_timeout: Option<u64>,
}

impl ReposConfig {
    pub fn update(&mut self, c: ReposConfig) {
        if c.staging.is_some() {
            self.staging = c.staging;
        }
        if c.main.is_some() {
            self.main = c.main;
        }
        if !c.architectures.is_empty() {
            self.architectures = c.architectures;
        }
        if c.index_lock_timeout.is_some() {
            self.index_lock_timeout = c.index_lock_timeout;
        }
    }

    pub fn staging(&self) -> &str {
        self.staging.as_deref().unwrap_or("staging")
    }

    pub fn main(&self) -> &str {
        self.main.as_deref().unwrap_or("main")
    }

    pub fn architectures(&self) -> Vec<String> {
        if self.architectures.is_empty() {
            vec!["x86_64".to_string(), "i686".to_string()]
        } else {
            self.architectures.clone()
        }
    }

    pub fn index_lock_timeout(&self) -> u64 {
        self.index_lock_timeout.unwrap_or(DEFAULT_INDEX_LOCK_TIMEOUT)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub transactions: Option<usize>,
}

impl WorkersConfig {
    pub fn update(&mut self, c: WorkersConfig) {
        if c.transactions.is_some() {
            self.transactions = c.transactions;
        }
    }

    pub fn transactions(&self) -> usize {
        self.transactions.unwrap_or(1).max(1)
    }
}
