use crate::proc;
use async_trait::async_trait;
use data_encoding::BASE64;
use pkgbuilderd_common::config::SourceConfig;
use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::http;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const GIT_TIMEOUT: u64 = 15 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub content: String,
    /// Blob id of this version, required to update the file.
    pub sha: String,
}

/// Where recipes are stored and where version bumps are committed to.
#[async_trait]
pub trait SourceHost: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<RemoteFile>;

    /// Commit new file contents, returns the commit id.
    async fn update_file(&self, path: &str, content: &str, sha: &str, message: &str) -> Result<String>;

    /// Clone the recipe tree into `dest`, returns the checked out revision.
    async fn checkout(&self, dest: &Path) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: String,
    sha: String,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    message: &'a str,
    content: String,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    commit: CommitInfo,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

/// A repository on GitHub, accessed through the contents API and git.
pub struct GitHubHost {
    client: http::Client,
    config: SourceConfig,
    git: PathBuf,
}

impl GitHubHost {
    pub fn new(config: SourceConfig) -> Result<GitHubHost> {
        if config.project.is_none() || config.repo.is_none() {
            bail!("source.project and source.repo need to be configured");
        }
        Ok(GitHubHost {
            client: http::client()?,
            config,
            git: PathBuf::from("/usr/bin/git"),
        })
    }

    fn contents_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/contents/{}",
            self.config.api_url().trim_end_matches('/'),
            self.config.project.as_deref().unwrap_or_default(),
            self.config.repo.as_deref().unwrap_or_default(),
            path.trim_start_matches('/'))
    }

    fn authorize(&self, req: http::RequestBuilder) -> http::RequestBuilder {
        let req = req.header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.config.token {
            req.bearer_auth(token)
        } else {
            req
        }
    }

    fn clone_url(&self) -> String {
        if let Some(url) = &self.config.clone_url {
            url.clone()
        } else {
            format!("https://github.com/{}/{}.git",
                self.config.project.as_deref().unwrap_or_default(),
                self.config.repo.as_deref().unwrap_or_default())
        }
    }
}

#[async_trait]
impl SourceHost for GitHubHost {
    async fn read_file(&self, path: &str) -> Result<RemoteFile> {
        let url = self.contents_url(path);
        debug!("Fetching {:?}", url);
        let res = self.authorize(self.client.get(&url))
            .query(&[("ref", self.config.branch())])
            .send()
            .await?
            .error_for_status()
            .with_context(|| anyhow!("Failed to fetch {:?}", path))?
            .json::<ContentsResponse>()
            .await?;

        if let Some(encoding) = &res.encoding {
            if encoding != "base64" {
                bail!("Unexpected encoding for {:?}: {:?}", path, encoding);
            }
        }

        let content = res.content.replace('\n', "");
        let content = BASE64.decode(content.as_bytes())
            .context("Failed to decode file contents")?;
        let content = String::from_utf8(content)
            .context("Recipe is not valid utf-8")?;

        Ok(RemoteFile {
            content,
            sha: res.sha,
        })
    }

    async fn update_file(&self, path: &str, content: &str, sha: &str, message: &str) -> Result<String> {
        let url = self.contents_url(path);
        info!("Committing {:?}: {:?}", path, message);
        let body = UpdateRequest {
            message,
            content: BASE64.encode(content.as_bytes()),
            sha,
            branch: self.config.branch(),
        };
        let res = self.authorize(self.client.put(&url))
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .with_context(|| anyhow!("Failed to update {:?}", path))?
            .json::<UpdateResponse>()
            .await?;
        Ok(res.commit.sha)
    }

    async fn checkout(&self, dest: &Path) -> Result<Option<String>> {
        let url = self.clone_url();
        let timeout = Duration::from_secs(GIT_TIMEOUT);

        let dest = dest.to_string_lossy().into_owned();
        let args = vec![
            "clone", "--quiet", "--depth", "1",
            "--branch", self.config.branch(),
            url.as_str(), dest.as_str(),
        ];
        let (success, output) = proc::run_capture(&self.git, &args, proc::Options::new(timeout)).await?;
        if !success {
            bail!("git clone of {:?} failed: {}", url, output.trim());
        }

        let (success, output) = proc::run_capture(&self.git, &["rev-parse", "HEAD"],
            proc::Options::new(timeout).cwd(&dest)).await?;
        if success {
            Ok(Some(output.trim().to_string()))
        } else {
            warn!("Failed to determine checked out revision: {}", output.trim());
            Ok(None)
        }
    }
}
