//! Client (tunnel initiator) configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::{RemoteCommand, DEFAULT_EXEC, DEFAULT_SSH_PORT};

/// Identity files tried, in order, under `~/.ssh` when none is configured
pub const DEFAULT_IDENTITY_NAMES: &[&str] = &[
    "id_ed25519_sertun",
    "id_ecdsa_sertun",
    "id_rsa_sertun",
];

/// Configuration for opening a tunnel to a remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// SSH port used when the target does not name one
    pub port: u16,

    /// Login user on the remote host
    pub username: String,

    /// Private key used for public key authentication
    pub identity_file: Option<PathBuf>,

    /// Host identity ledger (OpenSSH known_hosts layout)
    pub known_hosts: PathBuf,

    /// Record unknown host keys instead of rejecting them
    pub accept_new_hosts: bool,

    /// Executable name/path on the remote system
    pub remote_exec: String,

    /// Replace an existing local symlink
    pub force_link: bool,

    /// Ask the remote side to replace an existing symlink
    pub force_remote_link: bool,

    /// TCP connect + handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Keep-alive interval (0 disables keep-alives)
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            username: whoami::username(),
            identity_file: None,
            known_hosts: ssh_dir().join("known_hosts"),
            accept_new_hosts: false,
            remote_exec: DEFAULT_EXEC.to_string(),
            force_link: false,
            force_remote_link: false,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Identity file to authenticate with: the configured one, else the
    /// first default that exists.
    pub fn resolve_identity(&self) -> Option<PathBuf> {
        if let Some(path) = &self.identity_file {
            return Some(expand_home(path));
        }
        DEFAULT_IDENTITY_NAMES
            .iter()
            .map(|name| ssh_dir().join(name))
            .find(|path| path.exists())
    }

    /// Known hosts path with `~` expanded
    pub fn known_hosts_path(&self) -> PathBuf {
        expand_home(&self.known_hosts)
    }

    /// Keep-alive interval, `None` when disabled
    pub fn keepalive(&self) -> Option<Duration> {
        (!self.keepalive_interval.is_zero()).then_some(self.keepalive_interval)
    }

    /// Remote command template derived from this configuration
    pub fn remote_command(&self) -> RemoteCommand {
        RemoteCommand::new(self.remote_exec.clone()).force_link(self.force_remote_link)
    }
}

fn ssh_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".ssh")
}

/// Expand a leading `~` to the home directory
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
