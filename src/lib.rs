//! Mixbridge Library
//!
//! Real-time audio output driver bridging a software mixing engine
//! to the platform audio subsystem.

pub mod audio;
pub mod mixer;

pub use audio::{DriverConfig, DriverError, OutputDriver, OutputHost};
pub use mixer::Mixer;
