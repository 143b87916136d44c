//! Provisioning for the Dangerzone isolated environment: install Multipass if
//! needed, make sure an SSH key pair exists, create and start the VM, and pull
//! the conversion container inside it.
//!
//! [`VmProvisioner`] drives the whole sequence and reports through a
//! [`ProgressSink`]. The pieces it is built from are usable on their own.

#![deny(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod installer;
pub mod process;
pub mod progress;
pub mod provisioner;
pub mod registry;
pub mod template;

pub use config::{ConfigOverrides, Platform, ProvisionConfig};
pub use credentials::{CredentialManager, CredentialPair};
pub use error::{ProvisionError, RegistryParseFailure, Result};
pub use installer::{DownloadOutcome, DownloadState, InstallOutcome, InstallStatus, RuntimeInstaller};
pub use process::{LineBuffer, OutputSource};
pub use progress::{CancelFlag, ChannelSink, NullSink, ProgressEvent, ProgressSink, Stage};
pub use provisioner::{ProvisionHandle, ProvisioningTask, TaskOutcome, VmProvisioner};
pub use registry::{VmRecord, VmRegistry, VmState};
