use crate::container::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::live::LiveOutput;
use crate::models::{BuildRecord, Package};
use crate::pkgfile;
use crate::sign::Signer;
use crate::status::ClusterState;
use crate::store::Store;
use chrono::{DateTime, Local, Utc};
use futures::StreamExt;
use pkgbuilderd_common::config::ConfigFile;
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::utils::{percent, human_duration};
use pkgbuilderd_common::ReviewStatus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time;

const BUILD_SCRIPT: &str = "/makepkg/build.sh";
const RESTART_POLLS: usize = 20;
const RESTART_POLL_DELAY: Duration = Duration::from_millis(500);
/// Lines are compared for duplicates after skipping this many characters.
const DEDUP_OFFSET: usize = 25;

/// Drops noise from container output and timestamps what is kept.
#[derive(Debug, Default)]
pub struct LogFilter {
    last: Option<String>,
}

impl LogFilter {
    pub fn push(&mut self, line: &str, now: &DateTime<Local>) -> Option<String> {
        let line = line.trim_end();
        if line.is_empty() || line.contains("PS1=\"") {
            return None;
        }

        let tail = line.chars().skip(DEDUP_OFFSET).collect::<String>();
        if self.last.as_deref() == Some(tail.as_str()) {
            return None;
        }
        self.last = Some(tail);

        let line = line.replace(['\'', '"'], "");
        Some(format!("[{}]: {}", now.format("%m/%d/%Y %I:%M%p"), line))
    }
}

/// Bound a build log to its head and tail.
pub fn truncate_log(mut lines: Vec<String>) -> Vec<String> {
    let keep = if lines.len() > 9001 {
        3000
    } else if lines.len() > 6001 {
        1500
    } else {
        return lines;
    };
    let tail = lines.split_off(lines.len() - keep);
    lines.truncate(keep);
    lines.extend(tail);
    lines
}

pub fn render_log(lines: &[String]) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        out.push_str(&format!("{:>5} {}\n", i + 1, line));
    }
    out.push_str(pkgbuilderd_common::END_OF_LOG);
    out
}

/// Host directories of one package build.
#[derive(Debug, Clone)]
pub struct BuildDirs {
    /// Directory holding the recipe, mounted at `/pkg`.
    pub pkg_dir: PathBuf,
    /// Where the container drops its artifacts, mounted at `/result`.
    pub result_dir: PathBuf,
}

/// Recompute success and failure rate from the finished builds of a package.
pub fn update_rates(store: &dyn Store, pkg: &mut Package) -> Result<()> {
    let mut completed = 0;
    let mut failed = 0;
    for bnum in &pkg.builds {
        match BuildRecord::load(store, *bnum) {
            Ok(build) if build.completed => completed += 1,
            Ok(build) if build.failed => failed += 1,
            Ok(_) => (),
            Err(err) => warn!("Skipping build in rate calculation: {:#}", err),
        }
    }
    let total = completed + failed;
    pkg.success_rate = percent(completed, total);
    pkg.failure_rate = percent(failed, total);
    Ok(())
}

pub struct BuildRunner {
    store: Arc<dyn Store>,
    status: Arc<ClusterState>,
    live: Arc<LiveOutput>,
    runtime: Arc<dyn ContainerRuntime>,
    signer: Arc<dyn Signer>,
    config: Arc<ConfigFile>,
    image: String,
}

impl BuildRunner {
    pub fn new(
        store: Arc<dyn Store>,
        status: Arc<ClusterState>,
        live: Arc<LiveOutput>,
        runtime: Arc<dyn ContainerRuntime>,
        signer: Arc<dyn Signer>,
        config: Arc<ConfigFile>,
    ) -> BuildRunner {
        let image = config.docker.build_image().to_string();
        BuildRunner {
            store,
            status,
            live,
            runtime,
            signer,
            config,
            image,
        }
    }

    fn container_spec(&self, pkg: &Package, dirs: &BuildDirs) -> ContainerSpec {
        let paths = &self.config.paths;
        let bind = |host: &Path, guest: &str| format!("{}:{}", host.display(), guest);

        let mut cmd = vec![BUILD_SCRIPT.to_string()];
        cmd.extend(pkg.depends.iter().chain(pkg.makedepends.iter()).cloned());

        ContainerSpec {
            name: pkg.name.clone(),
            image: self.image.clone(),
            cmd,
            env: vec![
                format!("_AUTOSUMS={}", if pkg.auto_sum { "True" } else { "False" }),
                format!("_PKGNAME={}", pkg.name),
            ],
            binds: vec![
                bind(&paths.cache_dir(), "/var/cache/pacman"),
                bind(&paths.scripts_dir(), "/makepkg"),
                bind(&dirs.pkg_dir, "/pkg"),
                bind(&dirs.result_dir, "/result"),
                bind(&paths.gnupg_dir(), "/root/.gnupg"),
            ],
            memory_limit: self.config.docker.memory_limit,
            cpuset: self.config.docker.cpuset.clone(),
            privileged: false,
        }
    }

    async fn remove_container(&self, id: &str) {
        match self.runtime.remove(id).await {
            Ok(()) => debug!("Removed container {:?}", id),
            Err(RuntimeError::Rejected(_)) => (),
            Err(err) => warn!("Failed to remove container {:?}: {:#}", id, err),
        }
    }

    /// Run the container to completion. Returns the exit code, or None if
    /// the container could not be run or timed out.
    async fn run_container(&self, build: &mut BuildRecord, spec: &ContainerSpec, lines: &mut Vec<String>) -> Option<i64> {
        let id = match self.runtime.create(spec).await {
            Ok(id) => id,
            Err(err) => {
                error!("Create container failed for {:?}: {:#}", spec.name, err);
                return None;
            }
        };
        build.container = Some(id.clone());
        if let Err(err) = build.save(self.store.as_ref()) {
            warn!("Failed to save build {}: {:#}", build.bnum, err);
        }

        if let Err(err) = self.runtime.start(&id).await {
            error!("Start container failed for {:?}: {:#}", spec.name, err);
            return None;
        }

        let bnum = build.bnum;
        let live = &self.live;
        let stream_logs = async {
            let mut filter = LogFilter::default();
            let mut stream = self.runtime.logs(&id);
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        for line in chunk.lines() {
                            if let Some(line) = filter.push(line, &Local::now()) {
                                live.publish(bnum, &line);
                                lines.push(line);
                            }
                        }
                    }
                    Err(err) => {
                        warn!("Log stream of build {} ended early: {:#}", bnum, err);
                        break;
                    }
                }
            }
        };

        let timeout = Duration::from_secs(self.config.docker.build_timeout());
        let result = time::timeout(timeout, async {
            let (_, exit) = futures::join!(stream_logs, self.runtime.wait(&id));
            exit
        }).await;

        match result {
            Ok(Ok(exit)) => Some(self.settled_exit(&id, exit).await),
            Ok(Err(err)) => {
                error!("Waiting for container {:?} failed: {:#}", id, err);
                None
            }
            Err(_) => {
                error!("Build {} exceeded the timeout of {}s, killing container", bnum, timeout.as_secs());
                self.remove_container(&id).await;
                None
            }
        }
    }

    /// A container brought back by its restart policy reports the exit code
    /// of its first run from `wait`. Poll until it stays down and take the
    /// final exit code.
    async fn settled_exit(&self, id: &str, exit: i64) -> i64 {
        for _ in 0..RESTART_POLLS {
            match self.runtime.inspect(id).await {
                Ok(status) if status.restarting || status.running => {
                    debug!("Container {:?} restarted {} times, waiting for it to settle", id, status.restart_count);
                    time::sleep(RESTART_POLL_DELAY).await;
                }
                Ok(status) => {
                    if status.restart_count > 0 {
                        warn!("Container {:?} was restarted {} times", id, status.restart_count);
                    }
                    return status.exit_code.unwrap_or(exit);
                }
                Err(err) => {
                    warn!("Failed to inspect container {:?}: {:#}", id, err);
                    return exit;
                }
            }
        }
        warn!("Container {:?} keeps restarting, treating the build as failed", id);
        if exit == 0 { 1 } else { exit }
    }

    async fn collect_artifacts(result_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut artifacts = Vec::new();
        let mut dir = fs::read_dir(result_dir).await
            .with_context(|| anyhow!("Failed to list result directory: {:?}", result_dir))?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_pkg = path.file_name()
                .and_then(|n| n.to_str())
                .map(pkgfile::is_package_file)
                .unwrap_or(false);
            if is_pkg {
                artifacts.push(path);
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Mark the previous build of this package as skipped if it still waits
    /// for review.
    fn skip_previous_review(&self, pkg: &Package, bnum: i64) -> Result<()> {
        let Some(prev) = pkg.previous_build(bnum) else { return Ok(()) };
        let mut prev = BuildRecord::load(self.store.as_ref(), prev)?;
        if prev.review_status == ReviewStatus::Pending {
            info!("Build {} of {} supersedes build {}, skipping its review", bnum, pkg.name, prev.bnum);
            prev.review_status = ReviewStatus::Skip;
            prev.save(self.store.as_ref())?;
            self.status.remove_pending_review(prev.bnum)?;
        }
        Ok(())
    }

    async fn produce(&self, pkg: &Package, build: &mut BuildRecord, dirs: &BuildDirs, lines: &mut Vec<String>) -> Result<bool> {
        if !dirs.pkg_dir.is_dir() {
            bail!("Package directory does not exist: {:?}", dirs.pkg_dir);
        }
        fs::create_dir_all(&dirs.result_dir).await
            .with_context(|| anyhow!("Failed to create result directory: {:?}", dirs.result_dir))?;

        // leftover from an earlier run
        self.remove_container(&pkg.name).await;

        let spec = self.container_spec(pkg, dirs);
        let exit = self.run_container(build, &spec, lines).await;

        match exit {
            Some(0) => info!("Container {} exited. Return code was 0", pkg.name),
            Some(code) => {
                error!("Container {} exited with a non-zero return code. Return code was {}", pkg.name, code);
                return Ok(false);
            }
            None => return Ok(false),
        }

        let artifacts = Self::collect_artifacts(&dirs.result_dir).await?;
        if artifacts.is_empty() {
            error!("Build {} of {} produced no packages", build.bnum, pkg.name);
            return Ok(false);
        }

        self.live.publish(build.bnum, "Signing packages..");
        if !self.signer.sign(&artifacts).await? {
            error!("Failed to sign packages of build {}", build.bnum);
            return Ok(false);
        }

        for artifact in &artifacts {
            build.generated_files.insert(artifact.to_string_lossy().into_owned());
            let sig = crate::sign::sig_path(artifact);
            if sig.exists() {
                build.generated_files.insert(sig.to_string_lossy().into_owned());
            }
        }
        Ok(true)
    }

    /// Build one package inside a container. The returned record is
    /// finished, either completed or failed. Only an error creating the
    /// record itself is returned as `Err`.
    pub async fn run(&self, pkg: &mut Package, tnum: i64, dirs: &BuildDirs) -> Result<BuildRecord> {
        let mut build = BuildRecord::create(self.store.as_ref(), tnum, &pkg.name)?;
        if let Err(err) = self.execute(pkg, &mut build, dirs).await {
            error!("Build {} of {} aborted: {:#}", build.bnum, pkg.name, err);
            self.abandon(&mut build, &err);
        }
        Ok(build)
    }

    /// Finish a build that broke off halfway as failed, as far as the
    /// store still allows.
    fn abandon(&self, build: &mut BuildRecord, err: &Error) {
        let counted = build.failed;
        build.mark_failed();
        build.review_status = ReviewStatus::None;
        build.generated_files.clear();
        if build.end.is_none() {
            build.end = Some(Utc::now());
        }
        if build.log_str.is_empty() {
            let line = format!("[{}]: {:#}", Local::now().format("%m/%d/%Y %I:%M%p"), err);
            build.log_str = render_log(&[line]);
        }
        if let Err(err) = build.save(self.store.as_ref()) {
            warn!("Failed to save aborted build {}: {:#}", build.bnum, err);
        }

        let bnum = build.bnum;
        let mut updates = vec![
            self.status.remove_pending_review(bnum),
            self.status.remove_completed(bnum),
        ];
        if !counted {
            updates.push(self.status.add_failed(bnum));
        }
        for result in updates {
            if let Err(err) = result {
                warn!("Failed to update status of aborted build {}: {:#}", bnum, err);
            }
        }
        self.live.finish(bnum);
    }

    async fn execute(&self, pkg: &mut Package, build: &mut BuildRecord, dirs: &BuildDirs) -> Result<()> {
        let store = self.store.as_ref();

        build.pkgver = pkg.pkgver.clone();
        build.pkgrel = pkg.pkgrel.clone();
        build.epoch = pkg.epoch.clone();
        build.version_str = pkg.version_str.clone();
        build.start = Some(Utc::now());
        build.save(store)?;

        pkg.add_build(store, build.bnum)?;
        self.status.add_now_building(build.bnum)?;
        self.live.open(build.bnum);
        self.status.set_idle(false)?;
        self.status.set_status(&format!("Building {}-{} with makepkg.", pkg.name, pkg.version_str))?;
        info!("Build {} for {} {} started", build.bnum, pkg.name, pkg.version_str);

        let mut lines = Vec::new();
        let success = match self.produce(pkg, build, dirs, &mut lines).await {
            Ok(success) => success,
            Err(err) => {
                error!("Build {} of {} failed: {:#}", build.bnum, pkg.name, err);
                lines.push(format!("[{}]: {:#}", Local::now().format("%m/%d/%Y %I:%M%p"), err));
                false
            }
        };

        if success {
            build.mark_completed();
            build.review_status = ReviewStatus::Pending;
            if let Err(err) = self.skip_previous_review(pkg, build.bnum) {
                warn!("Failed to update the previous build of {}: {:#}", pkg.name, err);
            }
            self.status.add_pending_review(build.bnum)?;
            self.status.add_completed(build.bnum)?;
            info!("Build {} for {} {} was successful", build.bnum, pkg.name, build.version_str);
        } else {
            build.mark_failed();
            build.generated_files.clear();
            self.status.add_failed(build.bnum)?;
            info!("Build {} for {} {} failed", build.bnum, pkg.name, build.version_str);
        }

        let lines = truncate_log(lines);
        for line in &lines {
            build.push_log_line(store, line)?;
        }
        build.log_str = render_log(&lines);
        let end = Utc::now();
        build.end = Some(end);
        build.save(store)?;
        self.live.finish(build.bnum);
        if let Some(start) = build.start {
            info!("Build {} took {}", build.bnum, human_duration((end - start).num_seconds()));
        }

        if let Some(id) = &build.container {
            self.remove_container(id).await;
        }

        update_rates(store, pkg)?;
        pkg.save(store)?;
        Ok(())
    }
}
