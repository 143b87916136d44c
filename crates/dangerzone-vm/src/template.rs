//! cloud-init bootstrap file for a freshly launched VM.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};

/// Token in the template that is replaced by the public key text.
pub const PUBLIC_KEY_PLACEHOLDER: &str = "__DANGERZONE_SSH_PUBLIC_KEY__";

pub const BOOTSTRAP_FILE_NAME: &str = "cloud-init.yaml";

const DEFAULT_TEMPLATE: &str = include_str!("../templates/cloud-init.yaml");

/// Built-in template, or the contents of `override_path` when set.
pub fn load_template(override_path: Option<&Path>) -> Result<String> {
    match override_path {
        None => Ok(DEFAULT_TEMPLATE.to_string()),
        Some(path) => fs::read_to_string(path)
            .map_err(|e| ProvisionError::Template(format!("read {}: {e}", path.display()))),
    }
}

/// Verbatim substitution of every placeholder occurrence. No other
/// templating is applied.
pub fn render_bootstrap(template: &str, public_key: &str) -> String {
    template.replace(PUBLIC_KEY_PLACEHOLDER, public_key)
}

/// Render and write the bootstrap file into `dir`, returning its path.
pub fn write_bootstrap(dir: &Path, template: &str, public_key: &str) -> Result<PathBuf> {
    let path = dir.join(BOOTSTRAP_FILE_NAME);
    fs::write(&path, render_bootstrap(template, public_key))
        .map_err(|e| ProvisionError::io(format!("write {}", path.display()), e))?;
    Ok(path)
}
