//! Transport traits
//!
//! The orchestration layer only talks to the secure transport through these
//! traits. The SSH implementation lives in `st-tunnel`; tests drive the same
//! code with in-memory implementations.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ChannelError, ConnectError};
use crate::types::Target;

/// Output and lifecycle events of a remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Bytes written by the remote command to its stdout
    Data(Bytes),
    /// Bytes written by the remote command to its stderr
    Stderr(Bytes),
    /// The remote command exited with this status
    Exit(u32),
    /// The remote command was killed by a signal
    Signaled(String),
    /// The remote side will send no more data
    Eof,
    /// The channel is closed
    Closed,
}

/// Establishes a transport to a target
#[async_trait]
pub trait Connector: Send + Sync {
    /// The connected transport type
    type Transport: Transport;

    /// Connect and authenticate, verifying the host identity
    async fn connect(&self, target: &Target) -> Result<Self::Transport, ConnectError>;
}

/// One authenticated connection able to open independent remote sessions
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Session type opened over this transport
    type Session: RemoteSession;

    /// Open a new session channel
    async fn open_session(&self) -> Result<Self::Session, ChannelError>;

    /// Close the connection, terminating every session opened over it
    async fn close(&self);
}

/// One remote-executed command
#[async_trait]
pub trait RemoteSession: Send + 'static {
    /// Handle feeding the remote command's stdin
    type Input: RemoteInput;

    /// Launch `command` and return a handle to its stdin
    async fn exec(&mut self, command: &str) -> Result<Self::Input, ChannelError>;

    /// Next event from the remote command; `None` once the channel is gone
    async fn recv(&mut self) -> Option<RemoteEvent>;

    /// Signal the remote command to terminate and close the channel
    async fn interrupt(&mut self);
}

/// Writer side of a remote session, usable concurrently with `recv`
#[async_trait]
pub trait RemoteInput: Send + Sync + 'static {
    /// Forward bytes to the remote command's stdin
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Signal end of input; the remote command sees its stdin close
    async fn eof(&self) -> Result<(), ChannelError>;
}
