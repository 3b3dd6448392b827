//! st-tunnel: Serial devices over SSH
//!
//! Connects to a remote host over an authenticated SSH transport, binds each
//! requested local device to a remote command driving the matching remote
//! device, and tears everything down cleanly on completion or interrupt.
//! The same binary provides the remote side through serve mode.

#[cfg(not(unix))]
compile_error!("sertun requires a unix platform (pseudo-terminals and raw descriptors)");

pub mod auth;
pub mod device;
pub mod orchestrator;
pub mod serve;
pub mod session;
pub mod signal;
pub mod transport;

pub use auth::TrustStore;
pub use device::DeviceBridge;
pub use orchestrator::{Orchestrator, RunState};
pub use session::SessionRunner;
pub use transport::SshConnector;
