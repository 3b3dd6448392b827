//! Core trait definitions

mod transport;

pub use transport::{Connector, RemoteEvent, RemoteInput, RemoteSession, Transport};
