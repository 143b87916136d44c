//! Error types for provisioning the isolated environment.

use thiserror::Error;

use crate::registry::VmState;

/// Why the instance-list payload could not be turned into records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryParseFailure {
    /// The payload is not JSON at all.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// The payload is a JSON value but has no top-level `list` collection.
    #[error("missing top-level `list` key")]
    MissingList,

    /// `list` is present but its entries do not have the expected shape.
    #[error("invalid instance records: {0}")]
    InvalidRecords(String),
}

/// Every way a provisioning task can stop short of `Completed`.
///
/// Each variant is terminal for the task; nothing at this layer retries.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The installer download answered with a non-2xx status.
    #[error("download failed: status code {status_code}")]
    DownloadFailed { status_code: u16 },

    /// The installer ran but the runtime is still not detected.
    #[error("installation verification failed: runtime still not installed")]
    InstallationVerificationFailed,

    /// Key generation ran but the expected key files are not both present.
    #[error("credential generation failed: {reason}")]
    CredentialGenerationFailed { reason: String },

    /// The runtime's instance list could not be parsed.
    #[error("malformed registry output ({failure}): {raw}")]
    MalformedRegistryOutput {
        raw: String,
        failure: RegistryParseFailure,
    },

    /// The instance was launched but the registry still does not list it.
    #[error("instance `{name}` not found after creation")]
    InstanceNotFoundAfterCreation { name: String },

    /// A start command returned but the instance is not running.
    #[error("instance `{name}` is {state} after start, expected Running")]
    InstanceNotRunning { name: String, state: VmState },

    /// An external command exited unsuccessfully.
    #[error("{command} failed with exit code {exit_code}")]
    RemoteCommandFailed { command: String, exit_code: i32 },

    /// An external command could not be started at all.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bootstrap template error: {0}")]
    Template(String),

    /// The background worker ended without producing a result.
    #[error("provisioning worker stopped unexpectedly: {0}")]
    Worker(String),

    /// The caller asked the task to stop. Not a failure; reported as its own outcome.
    #[error("cancelled")]
    Cancelled,
}

impl ProvisionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
