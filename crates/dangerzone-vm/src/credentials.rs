//! SSH key pair used to reach the Dangerzone VM.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
}

impl CredentialPair {
    /// Both files present is the only validity check; contents are never
    /// inspected.
    pub fn exists(&self) -> bool {
        self.private_key_path.is_file() && self.public_key_path.is_file()
    }

    /// Public key text, trailing newline removed, ready to paste into a
    /// bootstrap template.
    pub fn public_key(&self) -> Result<String> {
        let raw = fs::read_to_string(&self.public_key_path).map_err(|e| {
            ProvisionError::io(format!("read {}", self.public_key_path.display()), e)
        })?;
        Ok(raw.trim_end().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CredentialManager {
    ssh_keygen_bin: PathBuf,
    key_dir: PathBuf,
    pair: CredentialPair,
    comment: String,
}

impl CredentialManager {
    pub fn new(cfg: &ProvisionConfig) -> Self {
        Self {
            ssh_keygen_bin: cfg.ssh_keygen_bin.clone(),
            key_dir: cfg.key_dir.clone(),
            pair: CredentialPair {
                private_key_path: cfg.private_key_path(),
                public_key_path: cfg.public_key_path(),
            },
            comment: cfg.key_comment.clone(),
        }
    }

    pub fn pair(&self) -> CredentialPair {
        self.pair.clone()
    }

    /// Return the existing key pair, or generate one with `ssh-keygen`.
    ///
    /// Generation runs at most once per call and is never retried.
    pub async fn ensure(&self) -> Result<CredentialPair> {
        let pair = self.pair();
        if pair.exists() {
            debug!(key = %pair.private_key_path.display(), "ssh key pair already present");
            return Ok(pair);
        }

        fs::create_dir_all(&self.key_dir).map_err(|e| {
            ProvisionError::io(format!("create key dir {}", self.key_dir.display()), e)
        })?;
        // ssh-keygen prompts before overwriting; clear a half-present pair.
        remove_stale(&pair.private_key_path);
        remove_stale(&pair.public_key_path);

        info!(key = %pair.private_key_path.display(), "generating ssh key pair");
        let output = Command::new(&self.ssh_keygen_bin)
            .arg("-t")
            .arg("ed25519")
            .arg("-N")
            .arg("")
            .arg("-C")
            .arg(&self.comment)
            .arg("-f")
            .arg(&pair.private_key_path)
            .stdin(std::process::Stdio::null())
            .output()
            .await;

        let detail = match output {
            Ok(out) if out.status.success() => None,
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                warn!(code = ?out.status.code(), %stderr, "ssh-keygen exited unsuccessfully");
                Some(format!("ssh-keygen exited with {:?}: {stderr}", out.status.code()))
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn ssh-keygen");
                Some(format!("failed to spawn ssh-keygen: {e}"))
            }
        };

        if pair.exists() {
            return Ok(pair);
        }
        Err(ProvisionError::CredentialGenerationFailed {
            reason: detail.unwrap_or_else(|| {
                format!(
                    "expected {} and {} after ssh-keygen",
                    pair.private_key_path.display(),
                    pair.public_key_path.display()
                )
            }),
        })
    }
}

fn remove_stale(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "could not remove stale key file");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dangerzone_test_utils::write_fake_executable;

    fn manager(dir: &Path, keygen: PathBuf) -> CredentialManager {
        let cfg = ProvisionConfig {
            ssh_keygen_bin: keygen,
            key_dir: dir.join("ssh"),
            ..ProvisionConfig::default()
        };
        CredentialManager::new(&cfg)
    }

    // Fake ssh-keygen: writes `<path>` and `<path>.pub` and records each call.
    fn fake_keygen(dir: &Path) -> PathBuf {
        let log = dir.join("keygen.log");
        write_fake_executable(
            dir,
            "ssh-keygen",
            &format!(
                r#"echo "$@" >> "{log}"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-f" ]; then out="$2"; fi
  shift
done
echo "PRIVATE" > "$out"
echo "ssh-ed25519 AAAAfake dangerzone" > "$out.pub""#,
                log = log.display()
            ),
        )
    }

    #[tokio::test]
    async fn existing_pair_skips_generation() {
        let dir = tempfile::tempdir().unwrap();
        let keygen = fake_keygen(dir.path());
        let mgr = manager(dir.path(), keygen);
        let pair = mgr.pair();
        fs::create_dir_all(dir.path().join("ssh")).unwrap();
        fs::write(&pair.private_key_path, "existing").unwrap();
        fs::write(&pair.public_key_path, "ssh-ed25519 existing\n").unwrap();

        let got = mgr.ensure().await.expect("ensure succeeds");
        assert_eq!(got, pair);
        assert!(!dir.path().join("keygen.log").exists());
        assert_eq!(
            fs::read_to_string(&pair.private_key_path).unwrap(),
            "existing"
        );
        assert_eq!(got.public_key().unwrap(), "ssh-ed25519 existing");
    }

    #[tokio::test]
    async fn missing_pair_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let keygen = fake_keygen(dir.path());
        let mgr = manager(dir.path(), keygen);

        let pair = mgr.ensure().await.expect("ensure succeeds");
        assert!(pair.exists());
        let log = fs::read_to_string(dir.path().join("keygen.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("-t ed25519"));
        assert!(log.contains("-C dangerzone"));
        assert!(log.contains(&format!("-f {}", pair.private_key_path.display())));

        mgr.ensure().await.expect("second ensure succeeds");
        let log = fs::read_to_string(dir.path().join("keygen.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn half_present_pair_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let keygen = fake_keygen(dir.path());
        let mgr = manager(dir.path(), keygen);
        let pair = mgr.pair();
        fs::create_dir_all(dir.path().join("ssh")).unwrap();
        fs::write(&pair.private_key_path, "orphan").unwrap();

        mgr.ensure().await.expect("ensure succeeds");
        assert_eq!(
            fs::read_to_string(&pair.private_key_path).unwrap().trim(),
            "PRIVATE"
        );
    }

    #[tokio::test]
    async fn keygen_that_writes_nothing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let keygen = write_fake_executable(dir.path(), "ssh-keygen", "exit 0");
        let mgr = manager(dir.path(), keygen);

        let err = mgr.ensure().await.expect_err("ensure fails");
        assert!(matches!(
            err,
            ProvisionError::CredentialGenerationFailed { .. }
        ));
    }

    #[tokio::test]
    async fn missing_keygen_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), dir.path().join("no-such-ssh-keygen"));

        let err = mgr.ensure().await.expect_err("ensure fails");
        match err {
            ProvisionError::CredentialGenerationFailed { reason } => {
                assert!(reason.contains("failed to spawn ssh-keygen"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pair_follows_configured_key_name() {
        let cfg = ProvisionConfig {
            key_dir: PathBuf::from("/keys"),
            key_name: "dz_ed25519".to_string(),
            ..ProvisionConfig::default()
        };
        let pair = CredentialManager::new(&cfg).pair();
        assert_eq!(pair.private_key_path, cfg.private_key_path());
        assert_eq!(pair.public_key_path, PathBuf::from("/keys/dz_ed25519.pub"));
    }
}
