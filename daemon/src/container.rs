use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, PushImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use pkgbuilderd_common::config::{DockerConfig, IMAGE_MAX_AGE};
use pkgbuilderd_common::errors::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: u64 = 120;

/// Errors callers need to tell apart, a build is marked failed for all of
/// them instead of waiting on a runtime that is never going to answer.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container runtime is unreachable: {0}")]
    Unreachable(String),
    #[error("Container runtime rejected the request: {0}")]
    Rejected(String),
    #[error("Container runtime error: {0}")]
    Api(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> RuntimeError {
        use bollard::errors::Error::*;
        match err {
            IOError { .. } | SocketNotFoundError(_) | HyperResponseError { .. } | RequestTimeoutError => {
                RuntimeError::Unreachable(err.to_string())
            }
            DockerResponseServerError { status_code, message } if (400..500).contains(&status_code) => {
                RuntimeError::Rejected(format!("{} (status {})", message, status_code))
            }
            err => RuntimeError::Api(err.to_string()),
        }
    }
}

/// Everything needed to create a build container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    /// `host:container[:mode]`
    pub binds: Vec<String>,
    pub memory_limit: Option<i64>,
    pub cpuset: Option<String>,
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStatus {
    pub restart_count: i64,
    pub restarting: bool,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits, returns the exit code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Follow stdout and stderr of a container until it exits.
    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, RuntimeError>>;

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    /// Force remove a container together with its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Creation time of an image, `None` if it doesn't exist.
    async fn image_created(&self, image: &str) -> Result<Option<DateTime<Utc>>, RuntimeError>;

    async fn build_image(&self, image: &str, context: &Path) -> Result<(), RuntimeError>;

    async fn push_image(&self, image: &str) -> Result<(), RuntimeError>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(config: &DockerConfig) -> Result<DockerRuntime> {
        let docker = Docker::connect_with_unix(config.socket(), CONNECT_TIMEOUT, bollard::API_DEFAULT_VERSION)
            .with_context(|| anyhow!("Failed to connect to docker at {:?}", config.socket()))?;
        Ok(DockerRuntime { docker })
    }
}

/// Pack a directory into an uncompressed tar, the format docker expects as
/// build context.
fn context_tarball(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);
    builder.append_dir_all(".", dir)
        .with_context(|| anyhow!("Failed to pack build context: {:?}", dir))?;
    let buf = builder.into_inner()?;
    Ok(buf)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                memory: spec.memory_limit,
                memory_swap: spec.memory_limit.map(|m| m * 2),
                cpuset_cpus: spec.cpuset.clone(),
                privileged: Some(spec.privileged),
                ..Default::default()
            }),
            ..Default::default()
        };
        let res = self.docker.create_container(Some(options), config).await?;
        for warning in res.warnings {
            warn!("Docker warning for {:?}: {}", spec.name, warning);
        }
        Ok(res.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.start_container(id, None::<StartContainerOptions<String>>).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        let mut code = None;
        while let Some(res) = stream.next().await {
            match res {
                Ok(res) => code = Some(res.status_code),
                // a non-zero exit is reported as error
                Err(bollard::errors::Error::DockerContainerWaitError { code: exit, .. }) => code = Some(exit),
                Err(err) => return Err(err.into()),
            }
        }
        code.ok_or_else(|| RuntimeError::Api(format!("No exit code reported for container {}", id)))
    }

    fn logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, Result<String, RuntimeError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        self.docker.logs(id, Some(options))
            .map_ok(|output| output.to_string())
            .map_err(RuntimeError::from)
            .boxed()
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let res = self.docker.inspect_container(id, None::<InspectContainerOptions>).await?;
        let state = res.state.unwrap_or_default();
        Ok(ContainerStatus {
            restart_count: res.restart_count.unwrap_or(0),
            restarting: state.restarting.unwrap_or(false),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn image_created(&self, image: &str) -> Result<Option<DateTime<Utc>>, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(res) => {
                let created = res.created
                    .and_then(|c| DateTime::parse_from_rfc3339(&c).ok())
                    .map(|c| c.with_timezone(&Utc));
                Ok(created)
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn build_image(&self, image: &str, context: &Path) -> Result<(), RuntimeError> {
        let tarball = context_tarball(context)
            .map_err(|err| RuntimeError::Api(format!("{:#}", err)))?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.to_string(),
            rm: true,
            forcerm: true,
            pull: true,
            nocache: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, Some(Bytes::from(tarball)));
        while let Some(info) = stream.next().await {
            let info = info?;
            if let Some(err) = info.error {
                return Err(RuntimeError::Api(err));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!("docker build: {}", line);
                }
            }
        }
        Ok(())
    }

    async fn push_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = PushImageOptions {
            tag: "latest".to_string(),
        };
        let mut stream = self.docker.push_image(image, Some(options), None);
        while let Some(info) = stream.next().await {
            let info = info?;
            if let Some(err) = info.error {
                return Err(RuntimeError::Api(err));
            }
        }
        Ok(())
    }
}

/// Keeps the build image at most a day old. Concurrent callers wait for a
/// rebuild that is already in progress.
pub struct ImageManager {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    context: Option<PathBuf>,
    push: bool,
    fresh_since: Mutex<Option<DateTime<Utc>>>,
}

impl ImageManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &DockerConfig) -> ImageManager {
        ImageManager {
            runtime,
            image: config.build_image().to_string(),
            context: config.image_context.clone(),
            push: config.push_images.unwrap_or(false),
            fresh_since: Mutex::new(None),
        }
    }

    fn is_fresh(created: &DateTime<Utc>) -> bool {
        Utc::now().signed_duration_since(*created) < ChronoDuration::seconds(IMAGE_MAX_AGE)
    }

    /// Rebuild the image if it is missing or older than a day.
    pub async fn ensure_fresh(&self) -> Result<()> {
        let mut fresh_since = self.fresh_since.lock().await;

        if let Some(since) = &*fresh_since {
            if Self::is_fresh(since) {
                return Ok(());
            }
        }

        let created = self.runtime.image_created(&self.image).await?;
        if let Some(created) = created {
            if Self::is_fresh(&created) {
                *fresh_since = Some(created);
                return Ok(());
            }
        }

        let Some(context) = &self.context else {
            if created.is_some() {
                debug!("No build context for {:?} configured, using existing image", self.image);
                *fresh_since = Some(Utc::now());
                return Ok(());
            }
            bail!("Image {:?} does not exist and docker.image_context is not configured", self.image);
        };

        info!("Building image {:?} from {:?}", self.image, context);
        self.runtime.build_image(&self.image, context).await?;
        if self.push {
            info!("Pushing image {:?}", self.image);
            if let Err(err) = self.runtime.push_image(&self.image).await {
                warn!("Failed to push image {:?}: {:#}", self.image, err);
            }
        }
        *fresh_since = Some(Utc::now());
        Ok(())
    }
}
