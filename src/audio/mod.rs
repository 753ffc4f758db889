//! 音频输出层
//!
//! 分层：驱动（协商/生命周期） → 后端（平台粘合） → 硬件。
//! `driver` 持有所有决策逻辑，`host` 是可替换的硬件接口，
//! macOS 上由 `coreaudio` 实现。

pub mod clock;
#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod driver;
pub mod format;
pub mod host;
pub mod latency;
pub mod timing;

pub use clock::{OverloadReport, SharedClockState};
#[cfg(target_os = "macos")]
pub use coreaudio::CoreAudioHost;
pub use driver::{DriverConfig, DriverError, OutputDriver, RenderEngine};
pub use format::{SampleConverter, StreamFormat};
pub use host::{DeviceId, HostError, OutputHost, OverloadSink};
pub use latency::LatencyModel;
