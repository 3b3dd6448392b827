//! st-core: Core abstractions and configuration for sertun
//!
//! This crate provides the error kinds, configuration, domain types and the
//! transport traits shared by the tunnel runtime and its tests.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::TunnelError;
pub use types::{DeviceSpec, RemoteCommand, Target};
