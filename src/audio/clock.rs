//! 回调共享时钟状态与过载诊断
//!
//! 写入方只有实时回调线程，读取方是位置查询和过载监听线程。
//! 所有字段都是单字原子量的 Relaxed 读写：读者可能看到略旧的值，
//! 但绝不会看到撕裂的值。实时路径上任何情况下都不取锁。

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// 诊断环形缓冲槽位数（保留最近 16 次混音耗时）
pub const MIX_TIME_SLOTS: usize = 16;

/// 回调共享时钟状态
///
/// 写入热点（回调每次都碰的字段）用 CachePadded 隔离，
/// 避免与读取方产生 false sharing。
pub struct SharedClockState {
    /// 最后一次已知的硬件采样时间
    last_sample_time: CachePadded<AtomicI64>,
    /// 最近若干次混音耗时（纳秒），固定槽位循环覆盖
    mix_times_ns: [AtomicU64; MIX_TIME_SLOTS],
    /// 下一个写入槽位
    mix_time_pos: AtomicUsize,
    /// 最近一次完整回调耗时（纳秒）
    last_render_ns: AtomicU64,
    /// 自上次过载报告以来的回调次数
    render_calls: CachePadded<AtomicU64>,
}

impl SharedClockState {
    pub fn new() -> Self {
        Self {
            last_sample_time: CachePadded::new(AtomicI64::new(0)),
            mix_times_ns: std::array::from_fn(|_| AtomicU64::new(0)),
            mix_time_pos: AtomicUsize::new(0),
            last_render_ns: AtomicU64::new(0),
            render_calls: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// 记录最后已知采样时间（实时路径，普通存储）
    #[inline]
    pub fn store_sample_time(&self, t: i64) {
        self.last_sample_time.store(t, Ordering::Relaxed);
    }

    #[inline]
    pub fn cached_sample_time(&self) -> i64 {
        self.last_sample_time.load(Ordering::Relaxed)
    }

    /// 记录一次回调的耗时（实时路径，无锁无分配）
    #[inline]
    pub fn record_render(&self, mix_ns: u64, total_ns: u64) {
        let pos = self.mix_time_pos.load(Ordering::Relaxed);
        self.mix_times_ns[pos].store(mix_ns, Ordering::Relaxed);
        self.mix_time_pos
            .store((pos + 1) % MIX_TIME_SLOTS, Ordering::Relaxed);
        self.last_render_ns.store(total_ns, Ordering::Relaxed);
        self.render_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn render_calls(&self) -> u64 {
        self.render_calls.load(Ordering::Relaxed)
    }

    /// 生成过载报告并清零回调计数
    ///
    /// 在通知线程上调用。混音耗时按从旧到新排列。
    pub fn overload_report(&self) -> OverloadReport {
        let pos = self.mix_time_pos.load(Ordering::Relaxed);
        let mut mix_times_ns = [0u64; MIX_TIME_SLOTS];
        for (i, slot) in mix_times_ns.iter_mut().enumerate() {
            // pos 指向下一个写入位置，即最旧的槽
            let idx = (pos + i) % MIX_TIME_SLOTS;
            *slot = self.mix_times_ns[idx].load(Ordering::Relaxed);
        }

        OverloadReport {
            mix_times_ns,
            last_render_ns: self.last_render_ns.load(Ordering::Relaxed),
            render_calls: self.render_calls.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for SharedClockState {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次过载通知对应的诊断快照
#[derive(Debug)]
pub struct OverloadReport {
    /// 最近的混音耗时（纳秒），从旧到新
    pub mix_times_ns: [u64; MIX_TIME_SLOTS],
    /// 最近一次完整回调耗时（纳秒）
    pub last_render_ns: u64,
    /// 自上次过载以来的回调次数
    pub render_calls: u64,
}

impl std::fmt::Display for OverloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "last render time: {:.3} ms, render calls: {} (mix times:",
            self.last_render_ns as f64 / 1_000_000.0,
            self.render_calls
        )?;
        for &ns in &self.mix_times_ns {
            write!(f, " {:.3}", ns as f64 / 1_000_000.0)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_time_cache() {
        let clock = SharedClockState::new();
        assert_eq!(clock.cached_sample_time(), 0);
        clock.store_sample_time(48000);
        assert_eq!(clock.cached_sample_time(), 48000);
        clock.store_sample_time(96000);
        assert_eq!(clock.cached_sample_time(), 96000);
    }

    #[test]
    fn test_ring_keeps_most_recent_oldest_first() {
        let clock = SharedClockState::new();

        // 写入超过槽位数的记录，环应只保留最近 16 条
        let total = MIX_TIME_SLOTS as u64 + 7;
        for i in 1..=total {
            clock.record_render(i * 100, i * 200);
        }

        let report = clock.overload_report();
        let expected: Vec<u64> = ((total - MIX_TIME_SLOTS as u64 + 1)..=total)
            .map(|i| i * 100)
            .collect();
        assert_eq!(report.mix_times_ns.to_vec(), expected);
        assert_eq!(report.last_render_ns, total * 200);
    }

    #[test]
    fn test_overload_report_resets_call_counter() {
        let clock = SharedClockState::new();
        for _ in 0..5 {
            clock.record_render(1000, 2000);
        }
        assert_eq!(clock.render_calls(), 5);

        let report = clock.overload_report();
        assert_eq!(report.render_calls, 5);
        assert_eq!(clock.render_calls(), 0);

        // 再次报告看到的是新周期的计数
        clock.record_render(1000, 2000);
        assert_eq!(clock.overload_report().render_calls, 1);
    }

    #[test]
    fn test_partial_ring_pads_with_zero() {
        let clock = SharedClockState::new();
        clock.record_render(500, 900);
        clock.record_render(600, 901);

        let report = clock.overload_report();
        // 未写满时，旧槽为 0，最新两条在末尾
        assert_eq!(report.mix_times_ns[MIX_TIME_SLOTS - 2], 500);
        assert_eq!(report.mix_times_ns[MIX_TIME_SLOTS - 1], 600);
        assert!(report.mix_times_ns[..MIX_TIME_SLOTS - 2]
            .iter()
            .all(|&v| v == 0));
    }

    #[test]
    fn test_report_display_mentions_calls() {
        let clock = SharedClockState::new();
        clock.record_render(1_500_000, 3_000_000);
        let text = clock.overload_report().to_string();
        assert!(text.contains("render calls: 1"));
        assert!(text.contains("3.000 ms"));
    }
}
