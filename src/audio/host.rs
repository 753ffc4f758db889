//! 硬件后端接口
//!
//! 把 HAL 的设备/流/属性操作建模为"成功值或带平台错误码的失败"。
//! 致命与可恢复的区分留给驱动按初始化步骤逐个判定，
//! 这里不做任何吞错。

use std::sync::Arc;

use thiserror::Error;

use super::driver::RenderEngine;
use super::format::StreamFormat;

/// 平台错误码（OSStatus 语义）
pub type OsStatus = i32;

/// 硬件设备句柄
pub type DeviceId = u32;

/// 'stop'：位置查询期间设备处于瞬态停止，唯一可恢复的时钟错误码
pub const STATUS_DEVICE_STOPPED: OsStatus = 0x7374_6F70;

/// 把四字符错误码还原为可读形式（不可打印时退回十进制）
pub fn fourcc(status: OsStatus) -> String {
    let bytes = status.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        format!("'{}'", String::from_utf8_lossy(&bytes))
    } else {
        format!("{}", status)
    }
}

/// 硬件操作失败：平台错误码 + 出错的操作
#[derive(Debug, Clone, Error)]
#[error("{what} failed (status {})", fourcc(*.status))]
pub struct HostError {
    pub status: OsStatus,
    pub what: &'static str,
}

impl HostError {
    pub fn new(status: OsStatus, what: &'static str) -> Self {
        Self { status, what }
    }

    /// 是否为瞬态"设备已停止"（位置查询可降级为缓存值）
    pub fn is_device_stopped(&self) -> bool {
        self.status == STATUS_DEVICE_STOPPED
    }
}

/// 过载（错过实时截止期）通知的接收端
///
/// 由硬件子系统在通知线程上调用，必须保持廉价。
pub trait OverloadSink: Send + Sync {
    fn on_overload(&self);
}

/// 硬件输出后端
///
/// 驱动实例对一个后端实例工作。回调的注册/移除就是取消机制：
/// 后端保证 `remove_render` 返回后回调不再被调用、也不会并发重入。
pub trait OutputHost: Send + Sync {
    /// 取默认输出设备；失败（无设备或被占用）时初始化中止
    fn default_output_device(&self) -> Result<DeviceId, HostError>;

    /// 设备名（仅用于日志，取不到就算了）
    fn device_name(&self, device: DeviceId) -> Option<String> {
        let _ = device;
        None
    }

    fn nominal_sample_rate(&self, device: DeviceId) -> Result<f64, HostError>;
    fn set_nominal_sample_rate(&self, device: DeviceId, rate: f64) -> Result<(), HostError>;

    /// 当前输出流的 IOProc 格式
    fn io_format(&self, device: DeviceId) -> Result<StreamFormat, HostError>;
    fn set_io_format(&self, device: DeviceId, format: &StreamFormat) -> Result<(), HostError>;

    /// 每次回调的 I/O 缓冲区帧数
    fn io_buffer_frames(&self, device: DeviceId) -> Result<u32, HostError>;

    fn device_latency_frames(&self, device: DeviceId) -> Result<u32, HostError>;
    /// 流延迟是可选属性：设备不上报时返回 None
    fn stream_latency_frames(&self, device: DeviceId) -> Option<u32>;
    fn safety_offset_frames(&self, device: DeviceId) -> Result<u32, HostError>;

    fn install_overload_listener(
        &self,
        device: DeviceId,
        sink: Arc<dyn OverloadSink>,
    ) -> Result<(), HostError>;
    fn remove_overload_listener(&self, device: DeviceId);

    /// 注册实时回调。后端负责把 `RenderEngine::render` 接到硬件的
    /// IOProc 上；注册后到 `start_render` 之前不会被调用。
    fn install_render(&self, device: DeviceId, engine: Arc<RenderEngine>)
        -> Result<(), HostError>;
    fn start_render(&self, device: DeviceId) -> Result<(), HostError>;
    fn stop_render(&self, device: DeviceId);
    fn remove_render(&self, device: DeviceId);

    /// 设备当前硬件采样时间
    fn current_sample_time(&self, device: DeviceId) -> Result<i64, HostError>;

    /// 归还设备（逆序释放的最后一步）
    fn release_device(&self, device: DeviceId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_printable() {
        assert_eq!(fourcc(STATUS_DEVICE_STOPPED), "'stop'");
    }

    #[test]
    fn test_fourcc_unprintable_falls_back_to_decimal() {
        assert_eq!(fourcc(-50), "-50");
    }

    #[test]
    fn test_device_stopped_detection() {
        assert!(HostError::new(STATUS_DEVICE_STOPPED, "GetCurrentTime").is_device_stopped());
        assert!(!HostError::new(-38, "GetCurrentTime").is_device_stopped());
    }

    #[test]
    fn test_host_error_display() {
        let err = HostError::new(STATUS_DEVICE_STOPPED, "GetCurrentTime");
        assert_eq!(err.to_string(), "GetCurrentTime failed (status 'stop')");
    }
}
