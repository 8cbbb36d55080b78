//! Filesystem helpers shared by the planners and the VM runtime.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{fs, process::Command, time};

use crate::{MachinedError, MachinedResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns true if the path exists.
pub fn path_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().symlink_metadata().is_ok()
}

/// Creates `dir` and all missing parents.
pub async fn ensure_dir(dir: impl AsRef<Path>) -> MachinedResult<()> {
    fs::create_dir_all(dir.as_ref()).await?;
    Ok(())
}

/// Polls for `path` to appear, sleeping `interval` between attempts.
///
/// Returns true as soon as the path exists; false after `retries` attempts.
pub async fn wait_for_path(path: impl AsRef<Path>, retries: u32, interval: Duration) -> bool {
    let path = path.as_ref();
    for _ in 0..retries.max(1) {
        if path_exists(path) {
            return true;
        }
        time::sleep(interval).await;
    }
    path_exists(path)
}

/// Copies file content from `src` to `dest`.
///
/// New files are created 0644; if `src` is a symlink the content is copied,
/// not the link.
pub async fn copy_file_bits(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> MachinedResult<()> {
    let (src, dest) = (src.as_ref(), dest.as_ref());
    if src.as_os_str().is_empty() {
        return Err(MachinedError::Validation("source file is empty string".into()));
    }
    if dest.as_os_str().is_empty() {
        return Err(MachinedError::Validation(
            "destination file is empty string".into(),
        ));
    }
    fs::copy(src, dest).await.map_err(|e| {
        MachinedError::custom(anyhow::anyhow!(
            "failed copying {} -> {}: {}",
            src.display(),
            dest.display(),
            e
        ))
    })?;
    Ok(())
}

/// Copies `src` to `dest` preserving sparseness and using reflinks where the
/// filesystem supports them.
pub async fn copy_file_ref_sparse(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
) -> MachinedResult<()> {
    let (src, dest) = (src.as_ref(), dest.as_ref());
    if let Some(parent) = dest.parent() {
        ensure_dir(parent).await?;
    }
    let output = Command::new("cp")
        .args(["--force", "--reflink=auto", "--sparse=auto"])
        .arg(src)
        .arg(dest)
        .output()
        .await?;
    if !output.status.success() {
        return Err(MachinedError::custom(anyhow::anyhow!(
            "cp --reflink=auto {} -> {}: {}",
            src.display(),
            dest.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Searches `$PATH` for an executable with the given name.
pub fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Creates a symlink `link -> target`, replacing `link` if it already exists.
pub async fn force_symlink(
    target: impl AsRef<Path>,
    link: impl AsRef<Path>,
) -> MachinedResult<()> {
    let (target, link) = (target.as_ref(), link.as_ref());
    if !path_exists(target) {
        return Err(MachinedError::AssetMissing(format!(
            "symlink target {} does not exist",
            target.display()
        )));
    }
    match fs::remove_file(link).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::symlink(target, link).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
