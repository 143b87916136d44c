//! Stage machine that takes a host from "maybe nothing" to a running VM
//! with the conversion container pulled.
//!
//! Every step first asks whether its work is already done, so running a task
//! twice against the same host is safe. Cancellation is checked before each
//! stage is entered; commands already running are stopped by the process
//! runner, which watches the same flag.

use std::fs;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ProvisionConfig;
use crate::credentials::{CredentialManager, CredentialPair};
use crate::error::{ProvisionError, Result};
use crate::installer::{InstallOutcome, InstallStatus, RuntimeInstaller};
use crate::process::{self, strip_ansi, visible_segment};
use crate::progress::{CancelFlag, ProgressEvent, ProgressSink, Stage};
use crate::registry::{VmRegistry, VmState};
use crate::template;

/// How a provisioning task ended.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    Failed(ProvisionError),
    Cancelled,
}

impl TaskOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Completed => Stage::Completed,
            Self::Failed(_) => Stage::Failed,
            Self::Cancelled => Stage::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn error(&self) -> Option<&ProvisionError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Book-keeping for one run: the current stage, the cancel flag and the
/// error that ended it, if any.
#[derive(Debug)]
pub struct ProvisioningTask {
    stage: Option<Stage>,
    cancel: CancelFlag,
    last_error: Option<ProvisionError>,
}

impl ProvisioningTask {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            stage: None,
            cancel,
            last_error: None,
        }
    }

    /// `None` until the first stage has been entered.
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn last_error(&self) -> Option<&ProvisionError> {
        self.last_error.as_ref()
    }

    /// Move forward to `next`, unless cancellation was requested.
    pub fn enter(&mut self, next: Stage, sink: &dyn ProgressSink) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        debug_assert!(
            !matches!(self.stage, Some(s) if s >= next),
            "stage {next:?} entered after {:?}",
            self.stage
        );
        info!(stage = ?next, "entering stage");
        self.stage = Some(next);
        sink.emit(ProgressEvent::Stage(next));
        Ok(())
    }

    /// Record how the run ended and notify the sink.
    pub fn finish(&mut self, result: Result<()>, sink: &dyn ProgressSink) {
        let (stage, message) = match result {
            Ok(()) => (Stage::Completed, None),
            Err(ProvisionError::Cancelled) => (Stage::Cancelled, None),
            Err(e) => {
                error!(stage = ?self.stage, error = %e, "provisioning failed");
                let message = e.to_string();
                self.last_error = Some(e);
                (Stage::Failed, Some(message))
            }
        };
        info!(stage = ?stage, "provisioning finished");
        self.stage = Some(stage);
        sink.emit(ProgressEvent::Finished { stage, message });
    }

    pub fn into_outcome(self) -> TaskOutcome {
        match self.stage {
            Some(Stage::Completed) => TaskOutcome::Completed,
            Some(Stage::Cancelled) => TaskOutcome::Cancelled,
            _ => TaskOutcome::Failed(self.last_error.unwrap_or_else(|| {
                ProvisionError::Worker("task ended without a result".to_string())
            })),
        }
    }
}

pub struct VmProvisioner {
    cfg: ProvisionConfig,
    installer: RuntimeInstaller,
    credentials: CredentialManager,
    registry: VmRegistry,
}

impl VmProvisioner {
    pub fn new(cfg: ProvisionConfig) -> Self {
        Self {
            installer: RuntimeInstaller::new(&cfg),
            credentials: CredentialManager::new(&cfg),
            registry: VmRegistry::new(&cfg),
            cfg,
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.cfg
    }

    /// Run all stages to a terminal outcome. Exactly one
    /// [`ProgressEvent::Finished`] is emitted, last.
    pub async fn run(&self, sink: &dyn ProgressSink, cancel: &CancelFlag) -> TaskOutcome {
        let mut task = ProvisioningTask::new(cancel.clone());
        let result = self.drive(&mut task, sink).await;
        task.finish(result, sink);
        task.into_outcome()
    }

    /// Run on a background tokio task. The returned handle cancels and
    /// awaits it.
    pub fn spawn<S>(self, sink: S) -> ProvisionHandle
    where
        S: ProgressSink + 'static,
    {
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let join = tokio::spawn(async move { self.run(&sink, &worker_cancel).await });
        ProvisionHandle { cancel, join }
    }

    async fn drive(&self, task: &mut ProvisioningTask, sink: &dyn ProgressSink) -> Result<()> {
        let name = self.cfg.vm_name.as_str();

        task.enter(Stage::CheckingRuntime, sink)?;
        self.ensure_runtime(sink, task.cancel_flag()).await?;

        task.enter(Stage::EnsuringCredentials, sink)?;
        let credentials = self.credentials.ensure().await?;

        task.enter(Stage::QueryingRegistry, sink)?;
        let mut record = self.registry.find(name).await?;

        if record.is_none() {
            task.enter(Stage::CreatingInstance, sink)?;
            self.create_instance(&credentials, sink, task.cancel_flag())
                .await?;
            record = self.registry.find(name).await?;
        }
        let Some(record) = record else {
            return Err(ProvisionError::InstanceNotFoundAfterCreation {
                name: name.to_string(),
            });
        };
        debug!(name, state = %record.state, "found instance");

        if record.state != VmState::Running {
            task.enter(Stage::StartingInstance, sink)?;
            self.start_instance(sink, task.cancel_flag()).await?;
        }

        task.enter(Stage::ConfiguringRemote, sink)?;
        self.configure_remote(sink, task.cancel_flag()).await
    }

    async fn ensure_runtime(&self, sink: &dyn ProgressSink, cancel: &CancelFlag) -> Result<()> {
        match self.installer.is_installed() {
            InstallStatus::Installed => {
                sink.emit(ProgressEvent::status(
                    Stage::CheckingRuntime.title(),
                    "Multipass is installed",
                ));
                Ok(())
            }
            InstallStatus::NotApplicable => {
                debug!("runtime not managed here, using the system multipass");
                Ok(())
            }
            InstallStatus::NotInstalled => {
                let scratch = self.scratch_dir("download-")?;
                match self.installer.install(scratch.path(), sink, cancel).await? {
                    InstallOutcome::Installed => Ok(()),
                    InstallOutcome::Cancelled => Err(ProvisionError::Cancelled),
                }
            }
        }
    }

    async fn create_instance(
        &self,
        credentials: &CredentialPair,
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let template = template::load_template(self.cfg.bootstrap_template.as_deref())?;
        let public_key = credentials.public_key()?;
        // Kept alive until launch returns; multipass reads the file lazily.
        let scratch = self.scratch_dir("launch-")?;
        let bootstrap = template::write_bootstrap(scratch.path(), &template, &public_key)?;

        let mut cmd = Command::new(&self.cfg.runtime_bin);
        cmd.arg("launch")
            .arg("--cpus")
            .arg(self.cfg.cpus.to_string())
            .arg("--mem")
            .arg(&self.cfg.memory)
            .arg("--disk")
            .arg(&self.cfg.disk)
            .arg("--name")
            .arg(&self.cfg.vm_name)
            .arg("--cloud-init")
            .arg(&bootstrap)
            .arg(&self.cfg.image);
        self.run_streaming(&mut cmd, "multipass launch", sink, cancel)
            .await
    }

    async fn start_instance(&self, sink: &dyn ProgressSink, cancel: &CancelFlag) -> Result<()> {
        let name = self.cfg.vm_name.as_str();
        let mut cmd = Command::new(&self.cfg.runtime_bin);
        cmd.arg("start").arg(name);
        self.run_streaming(&mut cmd, "multipass start", sink, cancel)
            .await?;

        let state = self.registry.state_of(name).await?;
        if state != VmState::Running {
            return Err(ProvisionError::InstanceNotRunning {
                name: name.to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Check the container runtime answers inside the VM, then pull the
    /// conversion image so it is current.
    async fn configure_remote(&self, sink: &dyn ProgressSink, cancel: &CancelFlag) -> Result<()> {
        let runtime = self.cfg.container_runtime.as_str();

        sink.emit(ProgressEvent::status(
            Stage::ConfiguringRemote.title(),
            format!("Checking {runtime}"),
        ));
        let mut cmd = self.remote_command(&[runtime, "version"]);
        self.run_streaming(&mut cmd, &format!("{runtime} version"), sink, cancel)
            .await?;

        sink.emit(ProgressEvent::status(
            Stage::ConfiguringRemote.title(),
            format!("Pulling {}", self.cfg.container_image),
        ));
        let mut cmd = self.remote_command(&[runtime, "pull", &self.cfg.container_image]);
        self.run_streaming(&mut cmd, &format!("{runtime} pull"), sink, cancel)
            .await
    }

    fn remote_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.cfg.runtime_bin);
        cmd.arg("exec").arg(&self.cfg.vm_name).arg("--").args(args);
        cmd
    }

    /// Run `cmd`, forwarding its live status line to the sink. Nonzero exit
    /// is an error.
    async fn run_streaming(
        &self,
        cmd: &mut Command,
        label: &str,
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let exit_code = process::run_interactive(cmd, label, cancel, |source, line| {
            sink.emit(ProgressEvent::Output {
                source,
                line: strip_ansi(visible_segment(line)),
            });
        })
        .await?;

        if exit_code != 0 {
            return Err(ProvisionError::RemoteCommandFailed {
                command: label.to_string(),
                exit_code,
            });
        }
        Ok(())
    }

    fn scratch_dir(&self, prefix: &str) -> Result<tempfile::TempDir> {
        let base = &self.cfg.cache_dir;
        fs::create_dir_all(base)
            .map_err(|e| ProvisionError::io(format!("create {}", base.display()), e))?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(base)
            .map_err(|e| ProvisionError::io(format!("create scratch dir in {}", base.display()), e))
    }
}

/// Handle to a task started with [`VmProvisioner::spawn`].
#[derive(Debug)]
pub struct ProvisionHandle {
    cancel: CancelFlag,
    join: JoinHandle<TaskOutcome>,
}

impl ProvisionHandle {
    /// Ask the task to stop. Idempotent; a task that already finished is
    /// unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::Failed(ProvisionError::Worker(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::progress::NullSink;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Recorder {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn stages_advance_in_order() {
        let sink = Recorder::default();
        let mut task = ProvisioningTask::new(CancelFlag::new());
        assert_eq!(task.stage(), None);

        task.enter(Stage::CheckingRuntime, &sink).unwrap();
        task.enter(Stage::QueryingRegistry, &sink).unwrap();
        assert_eq!(task.stage(), Some(Stage::QueryingRegistry));
        task.finish(Ok(()), &sink);

        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![
                ProgressEvent::Stage(Stage::CheckingRuntime),
                ProgressEvent::Stage(Stage::QueryingRegistry),
                ProgressEvent::Finished {
                    stage: Stage::Completed,
                    message: None
                },
            ]
        );
        assert!(task.into_outcome().is_completed());
    }

    #[test]
    fn cancelled_flag_blocks_next_stage() {
        let cancel = CancelFlag::new();
        let mut task = ProvisioningTask::new(cancel.clone());
        task.enter(Stage::CheckingRuntime, &NullSink).unwrap();

        cancel.cancel();
        let err = task.enter(Stage::EnsuringCredentials, &NullSink).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(task.stage(), Some(Stage::CheckingRuntime));

        task.finish(Err(err), &NullSink);
        assert!(task.last_error().is_none());
        assert!(matches!(task.into_outcome(), TaskOutcome::Cancelled));
    }

    #[test]
    fn failure_keeps_error_and_message() {
        let sink = Recorder::default();
        let mut task = ProvisioningTask::new(CancelFlag::new());
        task.enter(Stage::CheckingRuntime, &sink).unwrap();
        task.finish(Err(ProvisionError::InstallationVerificationFailed), &sink);

        assert!(matches!(
            task.last_error(),
            Some(ProvisionError::InstallationVerificationFailed)
        ));
        let events = sink.0.lock().unwrap().clone();
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Finished {
                stage: Stage::Failed,
                message: Some(
                    "installation verification failed: runtime still not installed".to_string()
                ),
            })
        );

        let outcome = task.into_outcome();
        assert_eq!(outcome.stage(), Stage::Failed);
        assert!(matches!(
            outcome.error(),
            Some(ProvisionError::InstallationVerificationFailed)
        ));
    }
}
