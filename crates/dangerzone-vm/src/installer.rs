//! Detecting, downloading and installing Multipass.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{Platform, ProvisionConfig};
use crate::error::{ProvisionError, Result};
use crate::process;
use crate::progress::{CancelFlag, ProgressEvent, ProgressSink};

pub const INSTALLER_FILE_NAME: &str = "multipass.pkg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Installed,
    NotInstalled,
    /// The runtime is not managed by us on this platform.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub target_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Finished(DownloadState),
    /// Stopped on request; the file holds whatever was written so far.
    Cancelled(DownloadState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RuntimeInstaller {
    client: reqwest::Client,
    platform: Platform,
    app_bundle: PathBuf,
    runtime_bin: PathBuf,
    installer_url: String,
    open_bin: PathBuf,
}

impl RuntimeInstaller {
    pub fn new(cfg: &ProvisionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            platform: cfg.platform,
            app_bundle: cfg.app_bundle.clone(),
            runtime_bin: cfg.runtime_bin.clone(),
            installer_url: cfg.installer_url.clone(),
            open_bin: cfg.open_bin.clone(),
        }
    }

    /// App bundle present, binary present, and the binary executable by
    /// "other". Only meaningful on macOS.
    pub fn is_installed(&self) -> InstallStatus {
        if self.platform != Platform::MacOs {
            info!("Multipass support is Mac-only");
            return InstallStatus::NotApplicable;
        }
        if self.app_bundle.is_dir() && self.runtime_bin.exists() && other_executable(&self.runtime_bin)
        {
            InstallStatus::Installed
        } else {
            InstallStatus::NotInstalled
        }
    }

    /// Stream the installer package into `target`, reporting progress after
    /// every chunk. The flag is checked before each chunk is written and
    /// while waiting on the server, so a stalled download still stops.
    pub async fn download(
        &self,
        target: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<DownloadOutcome> {
        info!(url = %self.installer_url, target = %target.display(), "downloading Multipass");
        let mut resp = tokio::select! {
            resp = self.client.get(&self.installer_url).send() => resp?,
            _ = process::cancelled(cancel) => {
                info!("download cancelled before the server answered");
                return Ok(DownloadOutcome::Cancelled(DownloadState {
                    bytes_downloaded: 0,
                    total_bytes: None,
                    target_path: target.to_path_buf(),
                }));
            }
        };
        let status = resp.status();
        if !status.is_success() {
            warn!(%status, "installer download failed");
            return Err(ProvisionError::DownloadFailed {
                status_code: status.as_u16(),
            });
        }

        let mut state = DownloadState {
            bytes_downloaded: 0,
            total_bytes: resp.content_length(),
            target_path: target.to_path_buf(),
        };
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| ProvisionError::io(format!("create {}", target.display()), e))?;

        loop {
            if cancel.is_cancelled() {
                return finish_cancelled(file, state).await;
            }
            let next = tokio::select! {
                chunk = resp.chunk() => chunk?,
                _ = process::cancelled(cancel) => return finish_cancelled(file, state).await,
            };
            let Some(chunk) = next else {
                break;
            };
            if cancel.is_cancelled() {
                return finish_cancelled(file, state).await;
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ProvisionError::io(format!("write {}", target.display()), e))?;
            state.bytes_downloaded += chunk.len() as u64;
            sink.emit(ProgressEvent::Download {
                downloaded: state.bytes_downloaded,
                total: state.total_bytes,
            });
        }

        file.flush()
            .await
            .map_err(|e| ProvisionError::io(format!("flush {}", target.display()), e))?;
        info!(bytes = state.bytes_downloaded, "installer downloaded");
        Ok(DownloadOutcome::Finished(state))
    }

    /// `open -W <pkg>`: hand the package to the system installer and wait
    /// for it to close. The exit code is logged only; the follow-up
    /// [`Self::is_installed`] check decides success. Raising `cancel` kills
    /// the installer and yields [`ProvisionError::Cancelled`].
    pub async fn run_installer(&self, package: &Path, cancel: &CancelFlag) -> Result<()> {
        info!(package = %package.display(), "installing Multipass");
        let mut child = Command::new(&self.open_bin)
            .arg("-W")
            .arg(package)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                command: "open -W".to_string(),
                source,
            })?;
        let status = process::wait_or_kill(&mut child, "open -W", cancel).await?;
        if !status.success() {
            warn!(code = ?status.code(), "installer exited unsuccessfully");
        }
        Ok(())
    }

    /// `open -a <app>` so the Multipass daemon is up before the first query.
    pub async fn open_app(&self) -> Result<()> {
        let status = Command::new(&self.open_bin)
            .arg("-a")
            .arg(&self.app_bundle)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: "open -a".to_string(),
                source,
            })?;
        if !status.success() {
            return Err(ProvisionError::RemoteCommandFailed {
                command: "open -a".to_string(),
                exit_code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    /// Download then install, re-checking presence at the end. A download
    /// failure never reaches the install phase.
    pub async fn install(
        &self,
        scratch_dir: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<InstallOutcome> {
        let package = scratch_dir.join(INSTALLER_FILE_NAME);
        sink.emit(ProgressEvent::status(
            "Downloading Multipass",
            self.installer_url.clone(),
        ));
        match self.download(&package, sink, cancel).await? {
            DownloadOutcome::Finished(_) => {}
            DownloadOutcome::Cancelled(_) => return Ok(InstallOutcome::Cancelled),
        }
        if cancel.is_cancelled() {
            return Ok(InstallOutcome::Cancelled);
        }

        sink.emit(ProgressEvent::status(
            "Installing Multipass",
            package.display().to_string(),
        ));
        match self.run_installer(&package, cancel).await {
            Ok(()) => {}
            Err(ProvisionError::Cancelled) => return Ok(InstallOutcome::Cancelled),
            Err(e) => return Err(e),
        }
        if cancel.is_cancelled() {
            return Ok(InstallOutcome::Cancelled);
        }

        if self.is_installed() != InstallStatus::Installed {
            return Err(ProvisionError::InstallationVerificationFailed);
        }
        if let Err(e) = self.open_app().await {
            warn!(error = %e, "could not open Multipass after install");
        }
        Ok(InstallOutcome::Installed)
    }
}

async fn finish_cancelled(
    mut file: tokio::fs::File,
    state: DownloadState,
) -> Result<DownloadOutcome> {
    file.flush().await.map_err(|e| {
        ProvisionError::io(format!("flush {}", state.target_path.display()), e)
    })?;
    info!(bytes = state.bytes_downloaded, "download cancelled");
    Ok(DownloadOutcome::Cancelled(state))
}

#[cfg(unix)]
fn other_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o001 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn other_executable(path: &Path) -> bool {
    path.is_file()
}
