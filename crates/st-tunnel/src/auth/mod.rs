//! Host authentication
//!
//! Server host keys are checked against an OpenSSH-style known_hosts ledger
//! using trust-on-first-use when explicitly enabled.

mod known_hosts;

pub use known_hosts::{canonical_address, HostIdentity, TrustStore};
