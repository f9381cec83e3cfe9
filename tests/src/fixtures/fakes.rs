use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use pkgbuilderd::container::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use pkgbuilderd::pkgfile::PkgFile;
use pkgbuilderd::recipe::{Recipe, RECIPE_FILENAME};
use pkgbuilderd::repo::{IndexError, IndexTool};
use pkgbuilderd::sign::{sig_path, Signer};
use pkgbuilderd::source::{RemoteFile, SourceHost};
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::PkgRef;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

fn bind_source(spec: &ContainerSpec, guest: &str) -> Option<PathBuf> {
    let suffix = format!(":{}", guest);
    spec.binds.iter()
        .find_map(|b| b.strip_suffix(&suffix))
        .map(PathBuf::from)
}

struct Container {
    name: String,
    pkg_dir: PathBuf,
    result_dir: PathBuf,
}

/// Runs "makepkg" by reading the recipe mounted at /pkg and writing the
/// package it describes into /result.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, Container>>,
    created: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    counter: AtomicUsize,
}

impl FakeRuntime {
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Names of every container created so far, in order.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    /// One archive per package name, split recipes produce several.
    fn artifact_names(recipe: &Recipe) -> Vec<String> {
        let arch = recipe.get_list_field("arch")
            .into_iter()
            .next()
            .filter(|a| a == "any")
            .unwrap_or_else(|| "x86_64".to_string());
        recipe.get_list_field("pkgname")
            .into_iter()
            .map(|name| format!("{}-{}-{}-{}.pkg.tar.xz",
                name,
                recipe.get_field("pkgver"),
                recipe.get_field("pkgrel"),
                arch))
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let pkg_dir = bind_source(spec, "/pkg")
            .ok_or_else(|| RuntimeError::Rejected("no /pkg bind".to_string()))?;
        let result_dir = bind_source(spec, "/result")
            .ok_or_else(|| RuntimeError::Rejected("no /result bind".to_string()))?;

        let id = format!("{}-{}", spec.name, self.counter.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(spec.name.clone());
        self.containers.lock().unwrap().insert(id.clone(), Container {
            name: spec.name.clone(),
            pkg_dir,
            result_dir,
        });
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let container = containers.get(id)
            .ok_or_else(|| RuntimeError::Rejected(format!("no such container: {}", id)))?;
        if self.failing.lock().unwrap().contains(&container.name) {
            return Ok(());
        }

        let text = fs::read_to_string(container.pkg_dir.join(RECIPE_FILENAME))
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        let recipe = Recipe::parse(&text);
        for name in Self::artifact_names(&recipe) {
            fs::write(container.result_dir.join(name), b"package")
                .map_err(|e| RuntimeError::Api(e.to_string()))?;
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let failing = containers.get(id)
            .map(|c| self.failing.lock().unwrap().contains(&c.name))
            .unwrap_or(true);
        Ok(if failing { 1 } else { 0 })
    }

    fn logs<'a>(&'a self, _id: &'a str) -> BoxStream<'a, Result<String, RuntimeError>> {
        stream::iter(vec![
            Ok("==> Making package: started in /pkg\n".to_string()),
            Ok("==> Finished making: packages written to /result\n".to_string()),
        ]).boxed()
    }

    async fn inspect(&self, _id: &str) -> Result<ContainerStatus, RuntimeError> {
        Ok(ContainerStatus::default())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::Rejected(format!("no such container: {}", id))),
        }
    }

    async fn image_created(&self, _image: &str) -> Result<Option<DateTime<Utc>>, RuntimeError> {
        Ok(Some(Utc::now()))
    }

    async fn build_image(&self, _image: &str, _context: &Path) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn push_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSigner {
    broken: AtomicBool,
}

impl FakeSigner {
    pub fn break_signing(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, paths: &[PathBuf]) -> Result<bool> {
        if self.broken.load(Ordering::SeqCst) {
            return Ok(false);
        }
        for path in paths {
            fs::write(sig_path(path), b"signature")?;
        }
        Ok(true)
    }
}

/// A recipe repository kept in memory, checkouts write it to disk.
#[derive(Default)]
pub struct FakeHost {
    files: Mutex<BTreeMap<String, String>>,
    commits: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn put(&self, path: &str, content: &str) {
        self.files.lock().unwrap().insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceHost for FakeHost {
    async fn read_file(&self, path: &str) -> Result<RemoteFile> {
        let content = self.file(path)
            .with_context(|| anyhow!("File not found: {:?}", path))?;
        Ok(RemoteFile {
            sha: format!("{}-{}", path, content.len()),
            content,
        })
    }

    async fn update_file(&self, path: &str, content: &str, _sha: &str, message: &str) -> Result<String> {
        self.put(path, content);
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(format!("commit-{}", commits.len()))
    }

    async fn checkout(&self, dest: &Path) -> Result<Option<String>> {
        for (path, content) in self.files.lock().unwrap().iter() {
            let path = dest.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
        }
        Ok(Some(format!("rev-{}", self.commits.lock().unwrap().len())))
    }
}

/// Package index per database path.
#[derive(Default)]
pub struct FakeIndex {
    entries: Mutex<HashMap<PathBuf, BTreeSet<PkgRef>>>,
    mutations: AtomicUsize,
}

impl FakeIndex {
    pub fn insert(&self, db: &Path, pkg: PkgRef) {
        self.entries.lock().unwrap().entry(db.to_path_buf()).or_default().insert(pkg);
    }

    pub fn entries(&self, db: &Path) -> BTreeSet<PkgRef> {
        self.entries.lock().unwrap().get(db).cloned().unwrap_or_default()
    }

    /// How many add and remove calls were made.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexTool for FakeIndex {
    async fn read(&self, db: &Path) -> Result<BTreeSet<PkgRef>> {
        Ok(self.entries(db))
    }

    async fn add(&self, db: &Path, file: &Path) -> Result<(), IndexError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let filename = file.file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| IndexError::Failed(format!("Invalid file name: {:?}", file)))?;
        let pkg = PkgFile::parse(filename)
            .map_err(|e| IndexError::Failed(e.to_string()))?
            .to_ref();

        let mut entries = self.entries.lock().unwrap();
        let set = entries.entry(db.to_path_buf()).or_default();
        set.retain(|r| r.name != pkg.name);
        set.insert(pkg);
        Ok(())
    }

    async fn remove(&self, db: &Path, pkgname: &str) -> Result<(), IndexError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap()
            .entry(db.to_path_buf())
            .or_default()
            .retain(|r| r.name != pkgname);
        Ok(())
    }
}
