//! 回调计时
//!
//! 诊断用的单调时钟：macOS 上用 mach_absolute_time（与 CoreAudio
//! 时间戳同源），其它平台回退到 std 单调时钟。
//! 实时回调内只做读数和减法，ticks → 纳秒的转换放在诊断路径上。

use std::sync::OnceLock;

#[cfg(target_os = "macos")]
mod mach {
    #[repr(C)]
    pub struct mach_timebase_info_t {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn mach_absolute_time() -> u64;
        pub fn mach_timebase_info(info: *mut mach_timebase_info_t) -> i32;
    }
}

/// timebase 全局缓存，只初始化一次
static TIMEBASE: OnceLock<(u32, u32)> = OnceLock::new();

#[cfg(target_os = "macos")]
fn timebase() -> (u32, u32) {
    *TIMEBASE.get_or_init(|| {
        let mut info = mach::mach_timebase_info_t { numer: 0, denom: 0 };
        unsafe { mach::mach_timebase_info(&mut info) };
        (info.numer, info.denom)
    })
}

#[cfg(not(target_os = "macos"))]
fn timebase() -> (u32, u32) {
    *TIMEBASE.get_or_init(|| (1, 1))
}

/// 当前时刻（mach ticks）
#[cfg(target_os = "macos")]
#[inline]
pub fn now_ticks() -> u64 {
    unsafe { mach::mach_absolute_time() }
}

/// 当前时刻（非 macOS：单调纳秒，timebase 1/1，数值上等价）
#[cfg(not(target_os = "macos"))]
#[inline]
pub fn now_ticks() -> u64 {
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_nanos() as u64
}

/// ticks → 纳秒
///
/// Intel 上 timebase 是 1/1，Apple Silicon 上通常 125/3。
/// 回调级别的间隔（< 1 秒）先乘后除不会溢出。
#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let (numer, denom) = timebase();
    ticks * numer as u64 / denom as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let t1 = now_ticks();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = now_ticks();
        assert!(t2 > t1, "monotonic clock should advance");

        let ns = ticks_to_ns(t2 - t1);
        assert!(ns >= 3_000_000, "expected at least 3ms, got {}ns", ns);
    }

    #[test]
    fn test_timebase_sane() {
        let (numer, denom) = timebase();
        assert!(numer > 0);
        assert!(denom > 0);
    }
}
