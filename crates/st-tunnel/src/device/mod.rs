//! Local device endpoints

mod bridge;
mod fd;

pub use bridge::DeviceBridge;
