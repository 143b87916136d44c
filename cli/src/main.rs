mod sink;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dangerzone_vm::{
    ConfigOverrides, InstallStatus, ProvisionConfig, RuntimeInstaller, TaskOutcome, VmProvisioner,
    VmRegistry,
};
use serde_json::json;
use tracing::{info, warn};

use crate::sink::TerminalSink;

#[derive(Debug, Parser)]
#[command(name = "dangerzone-vm")]
#[command(about = "Provision the Multipass VM that Dangerzone converts documents in")]
struct Cli {
    /// TOML file with configuration overrides
    #[arg(long, env = "DANGERZONE_CONFIG")]
    config: Option<PathBuf>,

    /// Container image to pull inside the VM instead of the default
    #[arg(long)]
    custom_container: Option<String>,

    /// Name of the VM instance
    #[arg(long)]
    vm_name: Option<String>,

    /// Log at debug level (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install Multipass if needed, then create, start and update the VM (default)
    Provision,

    /// Report whether Multipass is installed and the state of the VM
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match load_config(&cli) {
        Ok(cfg) => match cli.cmd.unwrap_or(Command::Provision) {
            Command::Provision => cmd_provision(cfg).await,
            Command::Status => cmd_status(cfg).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Defaults, then the config file, then `DANGERZONE_*` variables, then flags.
fn load_config(cli: &Cli) -> anyhow::Result<ProvisionConfig> {
    let mut cfg = ProvisionConfig::default();
    if let Some(path) = &cli.config {
        cfg = cfg.with_overrides(read_overrides(path)?);
    }
    Ok(cfg.with_env_overrides().with_overrides(ConfigOverrides {
        vm_name: cli.vm_name.clone(),
        container_image: cli.custom_container.clone(),
        ..ConfigOverrides::default()
    }))
}

fn read_overrides(path: &Path) -> anyhow::Result<ConfigOverrides> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

async fn cmd_provision(cfg: ProvisionConfig) -> anyhow::Result<ExitCode> {
    info!(vm = %cfg.vm_name, image = %cfg.container_image, "provisioning");
    let handle = VmProvisioner::new(cfg).spawn(TerminalSink::stderr());

    let cancel = handle.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            cancel.cancel();
        }
    });

    match handle.join().await {
        TaskOutcome::Completed => Ok(ExitCode::SUCCESS),
        TaskOutcome::Cancelled => {
            eprintln!("cancelled");
            Ok(ExitCode::from(130))
        }
        TaskOutcome::Failed(e) => Err(anyhow::Error::new(e).context("provisioning failed")),
    }
}

async fn cmd_status(cfg: ProvisionConfig) -> anyhow::Result<ExitCode> {
    let install = RuntimeInstaller::new(&cfg).is_installed();
    let runtime = match install {
        InstallStatus::Installed => "installed",
        InstallStatus::NotInstalled => "not-installed",
        InstallStatus::NotApplicable => "system",
    };

    let state = if install == InstallStatus::NotInstalled {
        None
    } else {
        let state = VmRegistry::new(&cfg)
            .state_of(&cfg.vm_name)
            .await
            .context("query multipass")?;
        Some(state.to_string())
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "runtime": runtime,
            "vm_name": cfg.vm_name,
            "vm_state": state,
            "container_image": cfg.container_image,
        }))?
    );
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dangerzone.toml");
        std::fs::write(
            &path,
            "vm_name = \"from-file\"\ncpus = 4\ncontainer_image = \"example.org/file\"\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "dangerzone-vm",
            "--config",
            path.to_str().unwrap(),
            "--custom-container",
            "example.org/flag",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.vm_name, "from-file");
        assert_eq!(cfg.cpus, 4);
        assert_eq!(cfg.container_image, "example.org/flag");
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dangerzone.toml");
        std::fs::write(&path, "vm_nmae = \"typo\"\n").unwrap();

        let err = read_overrides(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = read_overrides(Path::new("/nonexistent/dangerzone.toml")).unwrap_err();
        assert!(err.to_string().starts_with("read config"));
    }

    #[test]
    fn subcommand_defaults_to_provision() {
        let cli = Cli::parse_from(["dangerzone-vm", "--vm-name", "dz-test"]);
        assert!(cli.cmd.is_none());
        assert_eq!(load_config(&cli).unwrap().vm_name, "dz-test");

        let cli = Cli::parse_from(["dangerzone-vm", "status"]);
        assert!(matches!(cli.cmd, Some(Command::Status)));
    }
}
