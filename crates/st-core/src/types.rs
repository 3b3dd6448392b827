//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Name of the remote executable when it is this tool itself
pub const DEFAULT_EXEC: &str = "sertun";

/// Remote endpoint of a tunnel: `hostname[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Create a target from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `hostname[:port]`, using `default_port` when no port is given.
    ///
    /// IPv6 literals must be bracketed when a port is present (`[::1]:2222`).
    pub fn parse_with_port(s: &str, default_port: u16) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSpec {
            kind: "target",
            value: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("empty hostname"));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '['"))?;
            if host.is_empty() {
                return Err(invalid("empty hostname"));
            }
            let port = match tail {
                "" => default_port,
                _ => tail
                    .strip_prefix(':')
                    .ok_or_else(|| invalid("expected ':' after ']'"))?
                    .parse()
                    .map_err(|_| invalid("invalid port"))?,
            };
            return Ok(Self::new(host, port));
        }

        match s.split_once(':') {
            // More than one colon without brackets: a bare IPv6 literal
            Some((_, tail)) if tail.contains(':') => Ok(Self::new(s, default_port)),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(invalid("empty hostname"));
                }
                let port = port.parse().map_err(|_| invalid("invalid port"))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, default_port)),
        }
    }

    /// `host:port` form used for dialing and host verification
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl FromStr for Target {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_port(s, DEFAULT_SSH_PORT)
    }
}

/// One requested device: `localPath` or `localPath:remotePath`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Path of the local endpoint
    pub local: PathBuf,
    /// Path of the matching endpoint on the remote machine
    pub remote: String,
}

impl DeviceSpec {
    /// Create a spec whose remote path equals the local one
    pub fn same(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            local: PathBuf::from(&path),
            remote: path,
        }
    }

    /// Create a spec with distinct local and remote paths
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Name used in logs and error messages
    pub fn name(&self) -> String {
        self.local.display().to_string()
    }
}

impl FromStr for DeviceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidSpec {
            kind: "device spec",
            value: s.to_string(),
            reason: reason.to_string(),
        };

        match s.split_once(':') {
            Some((local, remote)) => {
                if local.is_empty() || remote.is_empty() {
                    return Err(invalid("empty device path"));
                }
                if remote.contains(':') {
                    return Err(invalid("expected at most one ':'"));
                }
                Ok(Self::new(local, remote))
            }
            None if s.is_empty() => Err(invalid("empty device path")),
            None => Ok(Self::same(s)),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local.display(), self.remote)
    }
}

/// Builds the command executed on the remote host for each device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    exec: String,
    force_link: bool,
    debug: bool,
}

impl RemoteCommand {
    /// Command template for the given remote executable
    pub fn new(exec: impl Into<String>) -> Self {
        Self {
            exec: exec.into(),
            force_link: false,
            debug: false,
        }
    }

    /// Ask the remote side to replace an existing symlink
    pub fn force_link(mut self, force: bool) -> Self {
        self.force_link = force;
        self
    }

    /// Ask the remote side to log verbosely
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Whether the executable is this tool, which understands `serve`
    pub fn is_self(&self) -> bool {
        Path::new(&self.exec)
            .file_name()
            .map(|name| name == DEFAULT_EXEC)
            .unwrap_or(false)
    }

    /// Full command line for one remote device path
    pub fn for_device(&self, remote_path: &str) -> String {
        let mut words: Vec<String> = vec![self.exec.clone()];
        if self.is_self() {
            if self.debug {
                words.push("--verbose".to_string());
            }
            words.push("serve".to_string());
            if self.force_link {
                words.push("--force".to_string());
            }
        }
        words.push(shell_words::quote(remote_path).into_owned());
        words.join(" ")
    }
}

impl Default for RemoteCommand {
    fn default() -> Self {
        Self::new(DEFAULT_EXEC)
    }
}
