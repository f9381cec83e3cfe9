use super::decompress;
use crate::proc;
use async_trait::async_trait;
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::PkgRef;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::{Archive, EntryType};

const INDEX_TOOL_TIMEOUT: u64 = 10 * 60;
const LOCK_MESSAGE: &str = "Failed to acquire lockfile";

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Index is locked by another process")]
    Locked,
    #[error("Index update failed: {0}")]
    Failed(String),
}

/// Reads and mutates the binary package index of one repository directory.
#[async_trait]
pub trait IndexTool: Send + Sync {
    /// Every entry of the index, an index that does not exist yet is empty.
    async fn read(&self, db: &Path) -> Result<BTreeSet<PkgRef>>;

    /// Add a package file, replacing older entries of the same name.
    async fn add(&self, db: &Path, file: &Path) -> Result<(), IndexError>;

    async fn remove(&self, db: &Path, pkgname: &str) -> Result<(), IndexError>;
}

#[derive(Debug, Default)]
struct DescFields {
    name: Option<String>,
    version: Option<String>,
    arch: Option<String>,
}

fn parse_desc(content: &str) -> Result<PkgRef> {
    let mut pkg = DescFields::default();

    let mut iter = content.split('\n');
    while let Some(key) = iter.next() {
        let mut values = Vec::new();
        for value in iter.by_ref() {
            if value.is_empty() {
                break;
            }
            values.push(value.to_string());
        }

        let value = values.into_iter().next();
        match key {
            "%NAME%" => pkg.name = value,
            "%VERSION%" => pkg.version = value,
            "%ARCH%" => pkg.arch = value,
            _ => (),
        }
    }

    Ok(PkgRef {
        name: pkg.name.context("Missing name field")?,
        version: pkg.version.context("Missing version field")?,
        arch: pkg.arch.context("Missing arch field")?,
    })
}

/// Extract `name|version|arch` of every `desc` entry of an alpm database.
pub fn parse_db(bytes: &[u8]) -> Result<BTreeSet<PkgRef>> {
    let mut archive = Archive::new(decompress::open(bytes)?);

    let mut pkgs = BTreeSet::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let is_desc = entry.path()?
            .file_name()
            .map(|n| n == "desc")
            .unwrap_or(false);
        if !is_desc {
            continue;
        }

        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        pkgs.insert(parse_desc(&content)?);
    }

    Ok(pkgs)
}

/// `repo-add`/`repo-remove` from pacman.
#[derive(Debug, Clone)]
pub struct RepoAddTool {
    repo_add: PathBuf,
    repo_remove: PathBuf,
}

impl Default for RepoAddTool {
    fn default() -> RepoAddTool {
        RepoAddTool {
            repo_add: PathBuf::from("repo-add"),
            repo_remove: PathBuf::from("repo-remove"),
        }
    }
}

impl RepoAddTool {
    async fn exec(&self, bin: &Path, args: &[&Path], cwd: Option<&Path>) -> Result<(), IndexError> {
        let mut opts = proc::Options::new(Duration::from_secs(INDEX_TOOL_TIMEOUT));
        if let Some(cwd) = cwd {
            opts = opts.cwd(cwd);
        }
        let (success, output) = proc::run_capture(bin, args, opts).await
            .map_err(|err| IndexError::Failed(format!("{:#}", err)))?;

        if success {
            Ok(())
        } else if output.contains(LOCK_MESSAGE) {
            Err(IndexError::Locked)
        } else {
            Err(IndexError::Failed(output.trim().to_string()))
        }
    }
}

#[async_trait]
impl IndexTool for RepoAddTool {
    async fn read(&self, db: &Path) -> Result<BTreeSet<PkgRef>> {
        let bytes = match tokio::fs::read(db).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Index {:?} does not exist yet", db);
                return Ok(BTreeSet::new());
            }
            Err(err) => return Err(err).with_context(|| anyhow!("Failed to read index: {:?}", db)),
        };
        parse_db(&bytes).with_context(|| anyhow!("Failed to parse index: {:?}", db))
    }

    async fn add(&self, db: &Path, file: &Path) -> Result<(), IndexError> {
        let cwd = db.parent();
        self.exec(&self.repo_add, &[Path::new("-R"), db, file], cwd).await
    }

    async fn remove(&self, db: &Path, pkgname: &str) -> Result<(), IndexError> {
        let cwd = db.parent();
        self.exec(&self.repo_remove, &[db, Path::new(pkgname)], cwd).await
    }
}
