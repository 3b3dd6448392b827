//! SSH implementation of the transport traits

mod ssh;

pub use ssh::{SshConnector, SshInput, SshSession, SshTransport};
