//! 延迟核算
//!
//! 初始化时计算一次端到端输出延迟，之后只读。
//! 引擎用这个值做音画同步补偿；设备重新配置需要整个驱动重启。

/// 输出延迟模型
///
/// 总帧数 = 设备延迟 + 流延迟（设备可能不上报，按 0 计）
///          + 安全偏移 + I/O 缓冲区帧数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyModel {
    pub device_latency_frames: u32,
    pub stream_latency_frames: Option<u32>,
    pub safety_offset_frames: u32,
    pub io_buffer_frames: u32,
    pub nominal_sample_rate: f64,
}

impl LatencyModel {
    pub fn total_frames(&self) -> u64 {
        self.device_latency_frames as u64
            + self.stream_latency_frames.unwrap_or(0) as u64
            + self.safety_offset_frames as u64
            + self.io_buffer_frames as u64
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_frames() as f64 / self.nominal_sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_is_exact_sum() {
        let model = LatencyModel {
            device_latency_frames: 32,
            stream_latency_frames: Some(12),
            safety_offset_frames: 68,
            io_buffer_frames: 512,
            nominal_sample_rate: 48000.0,
        };
        assert_eq!(model.total_frames(), 32 + 12 + 68 + 512);
        assert_eq!(model.total_seconds(), (32 + 12 + 68 + 512) as f64 / 48000.0);
    }

    #[test]
    fn test_missing_stream_latency_contributes_zero() {
        let with = LatencyModel {
            device_latency_frames: 50,
            stream_latency_frames: Some(0),
            safety_offset_frames: 10,
            io_buffer_frames: 512,
            nominal_sample_rate: 44100.0,
        };
        let without = LatencyModel {
            stream_latency_frames: None,
            ..with
        };
        assert_eq!(with.total_frames(), without.total_frames());
        assert_eq!(with.total_seconds(), without.total_seconds());
    }

    #[test]
    fn test_typical_44100_device() {
        // 44100 Hz、512 帧缓冲、50 帧设备延迟、10 帧安全偏移、无流延迟
        let model = LatencyModel {
            device_latency_frames: 50,
            stream_latency_frames: None,
            safety_offset_frames: 10,
            io_buffer_frames: 512,
            nominal_sample_rate: 44100.0,
        };
        assert_eq!(model.total_frames(), 572);
        let secs = model.total_seconds();
        assert!((secs - 572.0 / 44100.0).abs() < f64::EPSILON);
        assert!((secs - 0.01297).abs() < 0.0002);
    }

    #[test]
    fn test_zero_buffer_tolerated() {
        // 查询不到缓冲区大小时按 0 计，延迟模型仍然成立
        let model = LatencyModel {
            device_latency_frames: 50,
            stream_latency_frames: None,
            safety_offset_frames: 10,
            io_buffer_frames: 0,
            nominal_sample_rate: 44100.0,
        };
        assert_eq!(model.total_frames(), 60);
    }
}
