//! 混音器边界
//!
//! 解码/混音属于外部协作方，驱动只消费这个接口。
//! `mix` 必须满足实时契约：有界执行时间、不阻塞、不分配。

use std::sync::atomic::AtomicBool;

/// 驱动消费的混音接口
pub trait Mixer: Send + Sync + 'static {
    /// 向 `out` 填入 `frames` 帧引擎规范格式（16-bit 交织立体声）的样本。
    ///
    /// `out.len() == frames * 2`。`decode_pos` 是这批样本实际播放的
    /// 硬件采样时间，`now` 是当前硬件采样时间。
    /// 从实时回调线程调用：不得阻塞、不得分配、不得做 I/O。
    fn mix(&self, out: &mut [i16], frames: usize, decode_pos: i64, now: i64);

    /// 预混线程主体：持续向混音器内部的环形缓冲生产提前混好的样本。
    ///
    /// 由驱动在一条已提升调度优先级的后台线程上运行，
    /// 实现方应在 `stop` 置位后尽快返回。默认实现直接返回
    /// （适用于在 `mix` 内同步合成的混音器）。
    fn fill_ahead(&self, stop: &AtomicBool) {
        let _ = stop;
    }
}

/// 静音混音器：冒烟测试与缺省回退
pub struct SilenceMixer;

impl Mixer for SilenceMixer {
    fn mix(&self, out: &mut [i16], frames: usize, _decode_pos: i64, _now: i64) {
        let n = (frames * 2).min(out.len());
        out[..n].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_mixer_zeroes_buffer() {
        let mixer = SilenceMixer;
        let mut buf = [1234i16; 8];
        mixer.mix(&mut buf, 4, 0, 0);
        assert_eq!(buf, [0i16; 8]);
    }
}
