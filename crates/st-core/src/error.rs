//! Core error types for sertun

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a tunnel run
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Establishing the transport failed
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Host identity verification failed
    #[error("Host verification error: {0}")]
    Trust(#[from] TrustError),

    /// Local device allocation failed
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    /// A remote session failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while establishing the authenticated transport
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The target could not be resolved to any address
    #[error("Could not resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect or handshake did not finish in time
    #[error("Connection to {target} timed out")]
    Timeout { target: String },

    /// Socket-level failure
    #[error("Failed to connect to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The server's host key was not trusted
    #[error("{0}")]
    Trust(#[from] TrustError),

    /// Public key authentication was rejected
    #[error("Authentication rejected for user {user}")]
    AuthRejected { user: String },

    /// No usable identity file
    #[error("Private key not found: {0}")]
    KeyNotFound(String),

    /// Any other SSH protocol failure
    #[error("SSH error: {0}")]
    Ssh(String),
}

/// Host identity verification errors
#[derive(Error, Debug)]
pub enum TrustError {
    /// The ledger file does not exist and new hosts are not accepted
    #[error("Could not verify {host}: known hosts file {path} not found")]
    LedgerMissing { host: String, path: PathBuf },

    /// No ledger entry for the host and new hosts are not accepted
    #[error("Host key verification failed: no entry for {host} in known hosts")]
    UnknownHost { host: String },

    /// The host presented a key different from the recorded one
    #[error("Host key for {host} does not match known hosts: expected {expected}, got {presented}")]
    KeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },

    /// The ledger names the host on a line whose key cannot be read
    #[error("Known hosts entry for {host} on line {line} of {path} is unreadable: {reason}")]
    UnreadableEntry {
        host: String,
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// A host or address string could not be canonicalized
    #[error("Malformed address {0:?}: expected host:port")]
    MalformedAddress(String),

    /// Reading or appending the ledger failed
    #[error("Known hosts I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local device allocation errors
#[derive(Error, Debug)]
pub enum PortError {
    /// The requested path is already a symlink and force was not given
    #[error("Symlink {0} already exists")]
    AlreadyLinked(PathBuf),

    /// Pseudo-terminal allocation or linking failed
    #[error("Failed to allocate pty for {path}: {reason}")]
    AllocationFailed { path: PathBuf, reason: String },

    /// An existing device could not be opened
    #[error("Failed to open device {path}: {source}")]
    DeviceOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Remote session errors, each naming the device it belongs to
#[derive(Error, Debug)]
pub enum SessionError {
    /// The remote shell could not find the configured executable
    #[error("{device}: remote executable not found: {command}")]
    RemoteExecNotFound { device: String, command: String },

    /// The remote command exited with a nonzero status
    #[error("{device}: remote command exited with status {status}")]
    RemoteNonZeroExit { device: String, status: u32 },

    /// The remote command was killed by a signal
    #[error("{device}: remote command killed by signal {signal}")]
    RemoteSignaled { device: String, signal: String },

    /// The channel failed before the command reported an exit status
    #[error("{device}: channel failure: {message}")]
    ChannelFailure { device: String, message: String },
}

impl SessionError {
    /// Device this error belongs to
    pub fn device(&self) -> &str {
        match self {
            SessionError::RemoteExecNotFound { device, .. }
            | SessionError::RemoteNonZeroExit { device, .. }
            | SessionError::RemoteSignaled { device, .. }
            | SessionError::ChannelFailure { device, .. } => device,
        }
    }
}

/// Transport-level failure of a single channel
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ChannelError(pub String);

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Target or device spec could not be parsed
    #[error("Invalid {kind} {value:?}: {reason}")]
    InvalidSpec {
        kind: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_names_device() {
        let err = SessionError::RemoteNonZeroExit {
            device: "/dev/ttyUSB0".to_string(),
            status: 2,
        };
        assert_eq!(err.device(), "/dev/ttyUSB0");
        assert_eq!(
            err.to_string(),
            "/dev/ttyUSB0: remote command exited with status 2"
        );
    }

    #[test]
    fn test_trust_error_converts_into_connect_error() {
        let err: ConnectError = TrustError::UnknownHost {
            host: "example.com".to_string(),
        }
        .into();
        assert!(matches!(err, ConnectError::Trust(TrustError::UnknownHost { .. })));
    }
}
