//! Destination side effects
//!
//! The final copy of a cached artifact into the third-party plugin
//! directory, and the restart of the external application. Both are
//! opaque actions with a success/failure outcome; neither may leave a
//! partial file behind or take the application down with it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{AppConfig, ARTIFACT_EXT};

/// Destination write failure; the cached artifact is left intact.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("Cannot create plugin directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Cannot write {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

/// External process control failure
#[derive(Debug, thiserror::Error)]
#[error("Restart failed: {0}")]
pub struct RestartError(String);

/// Copy a cached artifact into the plugin directory, all-or-nothing.
///
/// The bytes land in a temp file inside the destination directory and are
/// renamed into place, so a failed write never leaves a partial file at
/// `<plugin_dir>/<id>.lua`.
pub fn install_patch(config: &AppConfig, cached: &Path, id: &str) -> Result<PathBuf, CopyError> {
    let dir = &config.plugin_dir;
    std::fs::create_dir_all(dir).map_err(|e| CopyError::CreateDir(dir.clone(), e))?;

    let dest = dir.join(format!("{}.{}", id, ARTIFACT_EXT));

    let copy = || -> std::io::Result<()> {
        let data = std::fs::read(cached)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &data)?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    };
    copy().map_err(|e| CopyError::Write(dest.clone(), e))?;

    info!("Installed patch {} -> {}", id, dest.display());
    Ok(dest)
}

/// Terminate and relaunch the external application.
///
/// Falls back to a protocol-URL open when the executable is not at its
/// configured path. Returns a short status message for the UI.
pub async fn restart_app(config: &AppConfig) -> Result<String, RestartError> {
    kill_process(&config.app_process);
    tokio::time::sleep(Duration::from_secs(2)).await;

    if config.app_exe.exists() {
        std::process::Command::new(&config.app_exe)
            .spawn()
            .map_err(|e| RestartError(format!("{}: {}", config.app_exe.display(), e)))?;
        Ok("Application restarted".to_string())
    } else {
        open_url("steam://open/main").map_err(|e| RestartError(e.to_string()))?;
        Ok("Restart request sent".to_string())
    }
}

fn kill_process(name: &str) {
    #[cfg(windows)]
    let result = std::process::Command::new("taskkill")
        .args(["/F", "/IM", name])
        .status();

    #[cfg(not(windows))]
    let result = std::process::Command::new("pkill")
        .args(["-f", name])
        .status();

    if let Err(e) = result {
        warn!("Could not terminate {}: {}", name, e);
    }
}

fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(windows)]
    let status = std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .status()?;

    #[cfg(not(windows))]
    let status = std::process::Command::new("xdg-open").arg(url).status()?;

    if !status.success() {
        return Err(std::io::Error::other(format!(
            "launcher exited with {}",
            status
        )));
    }
    Ok(())
}
