use crate::proc;
use crate::util;
use async_trait::async_trait;
use pkgbuilderd_common::config::{PathsConfig, SigningConfig};
use pkgbuilderd_common::errors::*;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const GPG_TIMEOUT: u64 = 5 * 60;

/// Creates detached signatures for build artifacts.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign every path. Either all of them end up with a valid signature and
    /// true is returned, or none of the signatures created by this call are
    /// kept.
    async fn sign(&self, paths: &[PathBuf]) -> Result<bool>;
}

pub fn sig_path(path: &Path) -> PathBuf {
    util::with_sig_ext(path)
}

pub struct GpgSigner {
    gpg: PathBuf,
    key_id: String,
    passphrase: Option<String>,
    homedir: Option<PathBuf>,
}

impl GpgSigner {
    pub fn new(signing: &SigningConfig, paths: &PathsConfig) -> Result<GpgSigner> {
        let key_id = signing.key_id.clone()
            .context("signing.key_id is not configured")?;
        Ok(GpgSigner {
            gpg: signing.gpg_bin(),
            key_id,
            passphrase: signing.passphrase()?,
            homedir: Some(paths.gnupg_dir()).filter(|d| d.exists()),
        })
    }

    fn base_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--batch")];
        if let Some(homedir) = &self.homedir {
            args.push("--homedir".into());
            args.push(homedir.into());
        }
        args
    }

    async fn verify(&self, path: &Path, sig: &Path) -> Result<bool> {
        let mut args = self.base_args();
        args.push("--verify".into());
        args.push(sig.into());
        args.push(path.into());
        let (success, output) = proc::run_capture(&self.gpg, &args,
            proc::Options::new(Duration::from_secs(GPG_TIMEOUT))).await?;
        if !success {
            debug!("Existing signature {:?} is not valid: {}", sig, output.trim());
        }
        Ok(success)
    }

    async fn detach_sign(&self, path: &Path, sig: &Path, passphrase: &str) -> Result<bool> {
        let mut args = self.base_args();
        args.extend([
            "--yes",
            "--pinentry-mode", "loopback",
            "--passphrase-fd", "0",
            "-u",
        ].into_iter().map(OsString::from));
        args.push(self.key_id.clone().into());
        args.push("--detach-sign".into());
        args.push("--output".into());
        args.push(sig.into());
        args.push(path.into());

        let opts = proc::Options::new(Duration::from_secs(GPG_TIMEOUT))
            .stdin(format!("{}\n", passphrase));
        let (success, output) = proc::run_capture(&self.gpg, &args, opts).await?;
        if !success {
            error!("Signing failed for {:?}: {}", path, output.trim());
        }
        Ok(success)
    }

    async fn sign_all(&self, paths: &[PathBuf], created: &mut Vec<PathBuf>) -> Result<bool> {
        for path in paths {
            let sig = sig_path(path);

            if sig.exists() {
                if self.verify(path, &sig).await? {
                    debug!("Valid signature exists for {:?}", path);
                    continue;
                }
                fs::remove_file(&sig).await
                    .with_context(|| anyhow!("Failed to remove stale signature: {:?}", sig))?;
            }

            let Some(passphrase) = &self.passphrase else {
                error!("No signing passphrase configured");
                return Ok(false);
            };

            info!("Creating detached signature for {:?}", path);
            if !self.detach_sign(path, &sig, passphrase).await? {
                return Ok(false);
            }
            created.push(sig);
        }
        Ok(true)
    }
}

#[async_trait]
impl Signer for GpgSigner {
    async fn sign(&self, paths: &[PathBuf]) -> Result<bool> {
        let mut created = Vec::new();
        let result = self.sign_all(paths, &mut created).await;

        let success = match result {
            Ok(success) => success,
            Err(err) => {
                error!("Signing failed: {:#}", err);
                false
            }
        };

        if !success {
            let sigs = created.into_iter().chain(paths.iter().map(|p| sig_path(p)));
            for sig in sigs {
                if sig.exists() {
                    if let Err(err) = fs::remove_file(&sig).await {
                        warn!("Failed to remove signature {:?}: {:#}", sig, err);
                    }
                }
            }
        }

        Ok(success)
    }
}
