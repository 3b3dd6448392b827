//! Remote sessions bound to local devices

mod runner;

pub use runner::{SessionRunner, INTERRUPT_TIMEOUT};
