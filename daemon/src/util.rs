use pkgbuilderd_common::errors::*;
use pkgbuilderd_common::SIG_EXT;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Remove a file or symlink, a missing file is not an error.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| anyhow!("Failed to remove {:?}", path)),
    }
}

pub fn with_sig_ext(path: &Path) -> PathBuf {
    let mut sig = OsString::from(path.as_os_str());
    sig.push(SIG_EXT);
    PathBuf::from(sig)
}

/// Remove a package file together with its detached signature.
pub async fn remove_with_sig(path: &Path) -> Result<()> {
    remove_if_exists(path).await?;
    remove_if_exists(&with_sig_ext(path)).await?;
    Ok(())
}

/// Copy `src` into `dir`, replacing whatever is there under the same name.
pub async fn copy_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    let name = src.file_name()
        .with_context(|| anyhow!("Path has no file name: {:?}", src))?;
    let dest = dir.join(name);
    // a symlink at dest would make copy write through it
    remove_if_exists(&dest).await?;
    fs::copy(src, &dest).await
        .with_context(|| anyhow!("Failed to copy {:?} to {:?}", src, dest))?;
    Ok(dest)
}

/// Create or replace a symlink at `link` pointing to `target`.
pub async fn symlink_force(target: &Path, link: &Path) -> Result<()> {
    remove_if_exists(link).await?;
    fs::symlink(target, link).await
        .with_context(|| anyhow!("Failed to create symlink {:?} -> {:?}", link, target))
}

/// Delete every entry of `dir` whose target does not exist.
pub async fn remove_broken_symlinks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut entries = fs::read_dir(dir).await
        .with_context(|| anyhow!("Failed to list directory: {:?}", dir))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if fs::metadata(&path).await.is_err() {
            debug!("Removing broken symlink: {:?}", path);
            remove_with_sig(&path).await?;
            removed.push(path);
        }
    }
    Ok(removed)
}
