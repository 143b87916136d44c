//! Instance lookup through `multipass list --format json`.
//!
//! Nothing here is cached: the VM can be created, stopped or deleted behind
//! our back, so every lookup is a fresh query.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, RegistryParseFailure, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    NotExists,
    Stopped,
    Starting,
    Running,
    Unknown,
}

impl VmState {
    fn from_runtime(raw: &str) -> Self {
        match raw.trim() {
            "Running" => Self::Running,
            "Stopped" => Self::Stopped,
            "Starting" | "Restarting" => Self::Starting,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotExists => "NotExists",
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub name: String,
    pub state: VmState,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    name: String,
    state: String,
}

/// Parse the runtime's JSON instance list.
///
/// Non-JSON input and JSON without a top-level `list` are reported as
/// different [`RegistryParseFailure`]s; both keep the raw payload.
pub fn parse_instance_list(raw: &str) -> Result<Vec<VmRecord>> {
    let malformed = |failure| ProvisionError::MalformedRegistryOutput {
        raw: raw.to_string(),
        failure,
    };

    let value: Value = serde_json::from_str(raw)
        .map_err(|e| malformed(RegistryParseFailure::InvalidJson(e.to_string())))?;
    let list = value
        .get("list")
        .cloned()
        .ok_or_else(|| malformed(RegistryParseFailure::MissingList))?;
    let instances: Vec<RawInstance> = serde_json::from_value(list)
        .map_err(|e| malformed(RegistryParseFailure::InvalidRecords(e.to_string())))?;

    Ok(instances
        .into_iter()
        .map(|i| VmRecord {
            state: VmState::from_runtime(&i.state),
            name: i.name,
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct VmRegistry {
    runtime_bin: PathBuf,
}

impl VmRegistry {
    pub fn new(cfg: &ProvisionConfig) -> Self {
        Self {
            runtime_bin: cfg.runtime_bin.clone(),
        }
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        let output = Command::new(&self.runtime_bin)
            .arg("list")
            .arg("--format")
            .arg("json")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: "multipass list".to_string(),
                source,
            })?;

        if !output.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "multipass list failed"
            );
            return Err(ProvisionError::RemoteCommandFailed {
                command: "multipass list".to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parse_instance_list(&stdout)?;
        debug!(count = records.len(), "listed instances");
        Ok(records)
    }

    /// First record named `name`, in list order.
    pub async fn find(&self, name: &str) -> Result<Option<VmRecord>> {
        Ok(find_in(self.list().await?, name))
    }

    pub async fn state_of(&self, name: &str) -> Result<VmState> {
        Ok(self
            .find(name)
            .await?
            .map(|r| r.state)
            .unwrap_or(VmState::NotExists))
    }
}

pub(crate) fn find_in(records: Vec<VmRecord>, name: &str) -> Option<VmRecord> {
    records.into_iter().find(|r| r.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_instance() {
        let records =
            parse_instance_list(r#"{"list":[{"name":"dangerzone","state":"Running"}]}"#).unwrap();
        assert_eq!(
            records,
            vec![VmRecord {
                name: "dangerzone".to_string(),
                state: VmState::Running
            }]
        );
    }

    #[test]
    fn parses_full_multipass_output() {
        let raw = r#"{
            "list": [
                {"ipv4": ["192.168.64.2"], "name": "primary", "release": "20.04 LTS", "state": "Stopped"},
                {"ipv4": [], "name": "dangerzone", "release": "20.04 LTS", "state": "Starting"},
                {"ipv4": [], "name": "old", "release": "18.04 LTS", "state": "Deleted"}
            ]
        }"#;
        let states: Vec<_> = parse_instance_list(raw)
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("primary".to_string(), VmState::Stopped),
                ("dangerzone".to_string(), VmState::Starting),
                ("old".to_string(), VmState::Unknown),
            ]
        );
    }

    #[test]
    fn empty_list_is_valid() {
        assert!(parse_instance_list(r#"{"list":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn missing_list_key_is_malformed() {
        match parse_instance_list("{}") {
            Err(ProvisionError::MalformedRegistryOutput { raw, failure }) => {
                assert_eq!(raw, "{}");
                assert_eq!(failure, RegistryParseFailure::MissingList);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn non_json_is_malformed() {
        match parse_instance_list("not json") {
            Err(ProvisionError::MalformedRegistryOutput { raw, failure }) => {
                assert_eq!(raw, "not json");
                assert!(matches!(failure, RegistryParseFailure::InvalidJson(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn records_without_state_are_malformed() {
        let err = parse_instance_list(r#"{"list":[{"name":"dangerzone"}]}"#).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MalformedRegistryOutput {
                failure: RegistryParseFailure::InvalidRecords(_),
                ..
            }
        ));
    }

    #[test]
    fn find_prefers_first_match() {
        let records = vec![
            VmRecord {
                name: "dangerzone".to_string(),
                state: VmState::Stopped,
            },
            VmRecord {
                name: "dangerzone".to_string(),
                state: VmState::Running,
            },
        ];
        assert_eq!(
            find_in(records, "dangerzone").map(|r| r.state),
            Some(VmState::Stopped)
        );
    }

    #[cfg(unix)]
    mod runtime {
        use super::super::*;
        use dangerzone_test_utils::write_fake_executable;

        fn registry_with(script: &str) -> (tempfile::TempDir, VmRegistry) {
            let dir = tempfile::tempdir().unwrap();
            let bin = write_fake_executable(dir.path(), "multipass", script);
            let cfg = ProvisionConfig {
                runtime_bin: bin,
                ..ProvisionConfig::default()
            };
            (dir, VmRegistry::new(&cfg))
        }

        #[tokio::test]
        async fn list_passes_json_format_flag() {
            let (_dir, registry) = registry_with(
                r#"if [ "$1 $2 $3" = "list --format json" ]; then
  echo '{"list":[{"name":"dangerzone","state":"Stopped"}]}'
else
  exit 9
fi"#,
            );
            assert_eq!(
                registry.state_of("dangerzone").await.unwrap(),
                VmState::Stopped
            );
            assert_eq!(
                registry.state_of("other").await.unwrap(),
                VmState::NotExists
            );
        }

        #[tokio::test]
        async fn failing_list_command_is_reported() {
            let (_dir, registry) = registry_with("echo 'daemon not running' >&2; exit 2");
            let err = registry.list().await.unwrap_err();
            assert!(matches!(
                err,
                ProvisionError::RemoteCommandFailed { exit_code: 2, .. }
            ));
        }

        #[tokio::test]
        async fn garbage_output_is_reported_not_swallowed() {
            let (_dir, registry) = registry_with("echo 'list failed: timeout'");
            let err = registry.find("dangerzone").await.unwrap_err();
            assert!(matches!(
                err,
                ProvisionError::MalformedRegistryOutput { .. }
            ));
        }
    }
}
