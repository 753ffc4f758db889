//! 输出驱动
//!
//! 持有硬件输出设备，完成一次性的格式/缓冲协商和延迟核算，
//! 并服务硬件驱动的实时回调。
//!
//! 三条控制线：
//! - 初始化/释放线程：普通优先级，允许阻塞、分配、打日志
//! - 预混线程：提升调度优先级，非实时但对延迟敏感
//! - 实时回调线程：最高优先级，固定周期，硬实时
//!
//! 实时回调内**绝对禁止**：锁、分配、I/O、日志。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;

use super::clock::SharedClockState;
use super::format::{ConvertError, SampleConverter, StreamFormat};
use super::host::{DeviceId, HostError, OutputHost, OverloadSink};
use super::latency::LatencyModel;
use super::timing;
use crate::mixer::Mixer;

/// 查询不到 I/O 缓冲区大小时的混音草稿帧数下限
const MIN_SCRATCH_FRAMES: usize = 4096;

/// 驱动配置，初始化时读取一次
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// 期望的设备名义采样率（Hz）
    pub preferred_sample_rate: u32,
    /// 预混线程的调度优先级
    pub mix_ahead_precedence: i32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            preferred_sample_rate: 44100,
            mix_ahead_precedence: 50,
        }
    }
}

/// 驱动错误
///
/// 只有初始化致命项和时钟硬错误会走到这里；采样率/流格式被拒、
/// 过载监听安装失败都在本地降级并记日志，不构成错误。
/// 实时回调内部的故障被吞掉，绝不上抛。
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("couldn't create default output device ({0})")]
    DeviceUnavailable(HostError),
    #[error("couldn't read the device nominal sample rate ({0})")]
    RateQuery(HostError),
    #[error("couldn't read the stream format ({0})")]
    FormatQuery(HostError),
    #[error("couldn't create the audio converter ({0})")]
    ConverterCreation(#[from] ConvertError),
    #[error("couldn't get latency ({0})")]
    LatencyQuery(HostError),
    #[error("couldn't start the render proc ({0})")]
    CallbackStart(HostError),
    #[error("clock query failed ({0})")]
    ClockQuery(HostError),
    #[error("audio driver is already initialized")]
    AlreadyInitialized,
    #[error("audio driver is not initialized")]
    NotInitialized,
}

/// 实时回调处理器
///
/// 由硬件后端在每个缓冲周期调用一次。所有内存在初始化时
/// 预分配并 mlock，回调内不做任何分配。
pub struct RenderEngine {
    converter: SampleConverter,
    mixer: Arc<dyn Mixer>,
    clock: Arc<SharedClockState>,
    /// 预分配的引擎格式混音草稿
    scratch: UnsafeCell<Vec<i16>>,
    scratch_frames: usize,
}

// 后端保证 IOProc 不并发重入、移除后不再调用，
// scratch 只在回调线程内被触碰。
unsafe impl Send for RenderEngine {}
unsafe impl Sync for RenderEngine {}

impl RenderEngine {
    pub(crate) fn new(
        converter: SampleConverter,
        mixer: Arc<dyn Mixer>,
        clock: Arc<SharedClockState>,
        scratch_frames: usize,
    ) -> Self {
        let samples = converter.engine_samples_for_frames(scratch_frames);
        Self {
            converter,
            mixer,
            clock,
            scratch: UnsafeCell::new(vec![0i16; samples]),
            scratch_frames,
        }
    }

    /// 锁定混音草稿内存，防止回调路径上的 page fault
    pub(crate) fn lock_memory(&self) {
        let scratch = unsafe { &*self.scratch.get() };
        let ptr = scratch.as_ptr() as *const libc::c_void;
        let len = scratch.len() * std::mem::size_of::<i16>();
        let result = unsafe { libc::mlock(ptr, len) };
        if result == 0 {
            log::debug!("Mix scratch buffer locked: {} bytes", len);
        } else {
            log::warn!(
                "Failed to lock mix scratch buffer ({})",
                std::io::Error::last_os_error()
            );
        }
    }

    fn unlock_memory(&self) {
        let scratch = unsafe { &*self.scratch.get() };
        let ptr = scratch.as_ptr() as *const libc::c_void;
        let len = scratch.len() * std::mem::size_of::<i16>();
        unsafe {
            libc::munlock(ptr, len);
        }
    }

    /// 实时回调入口
    ///
    /// `out` 是硬件提供的输出缓冲区，`now` 是当前硬件采样时间，
    /// `output_time` 是这批样本实际播放的硬件采样时间（解码位置）。
    ///
    /// 尺寸契约：无论混音产出如何，`out` 总被完整填满——
    /// 草稿覆盖不到的尾部填静音。内部故障不向硬件上抛。
    ///
    /// **绝对禁止：** 锁、分配、I/O、日志。
    pub fn render(&self, out: &mut [u8], now: i64, output_time: i64) {
        let t0 = timing::now_ticks();

        self.clock.store_sample_time(now);

        // 规范比值换算：硬件字节 → 帧 → 引擎样本
        let frames = self.converter.engine_frames_for_output_bytes(out.len());
        let take = frames.min(self.scratch_frames);
        let samples = self.converter.engine_samples_for_frames(take);

        let scratch = unsafe { &mut *self.scratch.get() };

        let t_mix = timing::now_ticks();
        self.mixer.mix(&mut scratch[..samples], take, output_time, now);
        let mix_ticks = timing::now_ticks().wrapping_sub(t_mix);

        let written = self.converter.convert(&scratch[..samples], out);
        out[written..].fill(0);

        let total_ticks = timing::now_ticks().wrapping_sub(t0);
        self.clock
            .record_render(timing::ticks_to_ns(mix_ticks), timing::ticks_to_ns(total_ticks));
    }

    pub fn output_format(&self) -> &StreamFormat {
        self.converter.output_format()
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 过载通知 → 诊断日志
///
/// 在系统通知线程上运行，读共享时钟状态，格式化后告警。
struct OverloadReporter {
    clock: Arc<SharedClockState>,
}

impl OverloadSink for OverloadReporter {
    fn on_overload(&self) {
        let report = self.clock.overload_report();
        log::warn!("Audio overload. {}", report);
    }
}

/// 已建立的设备会话，随驱动一起严格逆序释放
struct Session {
    device: DeviceId,
    operating_rate: f64,
    latency: LatencyModel,
    listener_installed: bool,
    mix_stop: Arc<AtomicBool>,
    mix_thread: Option<JoinHandle<()>>,
}

/// 音频输出驱动
///
/// 独占持有硬件设备与转换器的生命周期。格式与延迟模型在
/// `initialize` 中计算一次，之后不再变化；重新协商需要完整的
/// `teardown` + 新实例。
pub struct OutputDriver {
    host: Arc<dyn OutputHost>,
    config: DriverConfig,
    clock: Arc<SharedClockState>,
    session: Option<Session>,
}

impl OutputDriver {
    pub fn new(host: Arc<dyn OutputHost>, config: DriverConfig) -> Self {
        Self {
            host,
            config,
            clock: Arc::new(SharedClockState::new()),
            session: None,
        }
    }

    /// 初始化：协商设备、安装回调并启动
    ///
    /// 任何一步失败都会把此前取得的资源逆序归还后才返回，
    /// 不留半开的会话。
    pub fn initialize(&mut self, mixer: Arc<dyn Mixer>) -> Result<(), DriverError> {
        if self.session.is_some() {
            return Err(DriverError::AlreadyInitialized);
        }

        // 1. 取默认输出设备；失败时还没有任何副作用
        let device = self
            .host
            .default_output_device()
            .map_err(DriverError::DeviceUnavailable)?;
        if let Some(name) = self.host.device_name(device) {
            log::info!("Default output device: {}", name);
        }

        // 2. 请求配置的采样率，被拒则采纳设备上报的名义采样率
        let requested = self.config.preferred_sample_rate as f64;
        let operating_rate = match self.host.set_nominal_sample_rate(device, requested) {
            Ok(()) => {
                log::info!("Set the nominal sample rate to {} Hz", requested);
                requested
            }
            Err(e) => {
                log::warn!("Couldn't set the nominal sample rate to {} Hz ({})", requested, e);
                match self.host.nominal_sample_rate(device) {
                    Ok(rate) => {
                        log::info!("Device's nominal sample rate is {} Hz, adopting it", rate);
                        rate
                    }
                    Err(e) => {
                        self.host.release_device(device);
                        return Err(DriverError::RateQuery(e));
                    }
                }
            }
        };

        // 3. 过载监听：纯诊断功能，装不上只记一笔
        let reporter = Arc::new(OverloadReporter {
            clock: Arc::clone(&self.clock),
        });
        let listener_installed = match self.host.install_overload_listener(device, reporter) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Could not install the overload listener ({})", e);
                false
            }
        };

        // 设备相关资源的统一回退路径
        let unwind = |host: &dyn OutputHost| {
            if listener_installed {
                host.remove_overload_listener(device);
            }
            host.release_device(device);
        };

        // 4. 尝试设置规范 IOProc 格式，被拒则顺从设备实际格式
        let preferred_format = StreamFormat::hal_canonical(operating_rate);
        let hw_format = match self.host.set_io_format(device, &preferred_format) {
            Ok(()) => preferred_format,
            Err(e) => {
                log::warn!(
                    "Could not set the IOProc format to the canonical format ({})",
                    e
                );
                match self.host.io_format(device) {
                    Ok(actual) => {
                        log::info!(
                            "Conforming to device format: {} bits, flags 0x{:x}",
                            actual.bits_per_channel,
                            actual.flags
                        );
                        actual
                    }
                    Err(e) => {
                        unwind(&*self.host);
                        return Err(DriverError::FormatQuery(e));
                    }
                }
            }
        };

        // 5. 引擎格式 → 硬件格式的转换器；造不出来就没法出声，致命
        let engine_format = StreamFormat::engine_canonical(operating_rate);
        let converter = match SampleConverter::new(engine_format, hw_format) {
            Ok(c) => c,
            Err(e) => {
                unwind(&*self.host);
                return Err(DriverError::ConverterCreation(e));
            }
        };

        // 6. I/O 缓冲区帧数查不到按 0 计，延迟核算能容忍
        let io_buffer_frames = match self.host.io_buffer_frames(device) {
            Ok(frames) => {
                log::info!("I/O buffer size: {} frames", frames);
                frames
            }
            Err(e) => {
                log::warn!("Could not determine buffer size ({})", e);
                0
            }
        };

        // 7. 延迟核算：引擎靠它做音画同步，读不到就中止
        let device_latency_frames = match self.host.device_latency_frames(device) {
            Ok(frames) => frames,
            Err(e) => {
                unwind(&*self.host);
                return Err(DriverError::LatencyQuery(e));
            }
        };
        let stream_latency_frames = self.host.stream_latency_frames(device);
        match stream_latency_frames {
            Some(frames) => log::info!("Frames of stream latency: {}", frames),
            None => log::warn!("Stream does not report latency"),
        }
        let safety_offset_frames = match self.host.safety_offset_frames(device) {
            Ok(frames) => frames,
            Err(e) => {
                unwind(&*self.host);
                return Err(DriverError::LatencyQuery(e));
            }
        };
        let latency = LatencyModel {
            device_latency_frames,
            stream_latency_frames,
            safety_offset_frames,
            io_buffer_frames,
            nominal_sample_rate: operating_rate,
        };
        log::info!(
            "Frames of latency: {} ({:.5} s)",
            latency.total_frames(),
            latency.total_seconds()
        );

        // 回调处理器：草稿按设备缓冲大小预分配并锁页
        let scratch_frames = (io_buffer_frames as usize).max(MIN_SCRATCH_FRAMES);
        let engine = Arc::new(RenderEngine::new(
            converter,
            Arc::clone(&mixer),
            Arc::clone(&self.clock),
            scratch_frames,
        ));
        engine.lock_memory();

        // 8. 预混线程：外部协作方的循环体，这里只负责提升调度优先级
        let mix_stop = Arc::new(AtomicBool::new(false));
        let mix_thread = {
            let mixer = Arc::clone(&mixer);
            let stop = Arc::clone(&mix_stop);
            let precedence = self.config.mix_ahead_precedence;
            std::thread::Builder::new()
                .name("mix-ahead".to_string())
                .spawn(move || {
                    raise_thread_precedence(precedence);
                    mixer.fill_ahead(&stop);
                })
                .expect("failed to spawn mix-ahead thread")
        };
        let stop_mix = |thread: JoinHandle<()>| {
            mix_stop.store(true, Ordering::Release);
            let _ = thread.join();
        };

        // 9. 注册并启动实时回调
        if let Err(e) = self.host.install_render(device, Arc::clone(&engine)) {
            stop_mix(mix_thread);
            unwind(&*self.host);
            return Err(DriverError::CallbackStart(e));
        }
        if let Err(e) = self.host.start_render(device) {
            self.host.remove_render(device);
            stop_mix(mix_thread);
            unwind(&*self.host);
            return Err(DriverError::CallbackStart(e));
        }

        log::info!(
            "Audio driver initialized: {} Hz, {} bits out, {:.5} s latency",
            operating_rate,
            engine.output_format().bits_per_channel,
            latency.total_seconds()
        );

        self.session = Some(Session {
            device,
            operating_rate,
            latency,
            listener_installed,
            mix_stop,
            mix_thread: Some(mix_thread),
        });
        Ok(())
    }

    /// 释放：停回调、摘回调、停预混线程、归还设备
    ///
    /// 从未初始化或已释放时是无害的空操作。
    pub fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        self.host.stop_render(session.device);
        self.host.remove_render(session.device);
        if session.listener_installed {
            self.host.remove_overload_listener(session.device);
        }

        session.mix_stop.store(true, Ordering::Release);
        if let Some(thread) = session.mix_thread.take() {
            let _ = thread.join();
        }

        self.host.release_device(session.device);
        log::info!("Audio driver torn down");
    }

    /// 当前播放位置（硬件采样时间）
    ///
    /// 设备瞬态停止（'stop'）时返回最近一次成功查询的缓存值；
    /// 其它时钟错误意味着设备级故障，原样上抛。
    pub fn position(&self) -> Result<i64, DriverError> {
        let Some(session) = &self.session else {
            return Err(DriverError::NotInitialized);
        };

        match self.host.current_sample_time(session.device) {
            Ok(t) => {
                self.clock.store_sample_time(t);
                Ok(t)
            }
            Err(e) if e.is_device_stopped() => Ok(self.clock.cached_sample_time()),
            Err(e) => Err(DriverError::ClockQuery(e)),
        }
    }

    /// 端到端输出延迟（秒），初始化前为 0
    pub fn latency_seconds(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.latency.total_seconds())
            .unwrap_or(0.0)
    }

    pub fn latency(&self) -> Option<&LatencyModel> {
        self.session.as_ref().map(|s| &s.latency)
    }

    /// 协商后的实际运行采样率
    pub fn operating_sample_rate(&self) -> Option<f64> {
        self.session.as_ref().map(|s| s.operating_rate)
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for OutputDriver {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// 提升当前线程的调度优先级
///
/// macOS 上用 Mach THREAD_PRECEDENCE_POLICY；其它平台退回 nice 值。
/// 失败只记日志：预混线程在普通优先级下也能工作，只是更容易欠载。
#[cfg(target_os = "macos")]
fn raise_thread_precedence(importance: i32) {
    const THREAD_PRECEDENCE_POLICY: u32 = 3;

    #[repr(C)]
    struct ThreadPrecedencePolicy {
        importance: i32,
    }

    extern "C" {
        fn pthread_mach_thread_np(thread: libc::pthread_t) -> u32;
        fn thread_policy_set(
            thread: u32,
            flavor: u32,
            policy_info: *const std::ffi::c_void,
            count: u32,
        ) -> i32;
    }

    let policy = ThreadPrecedencePolicy { importance };
    let result = unsafe {
        let thread = pthread_mach_thread_np(libc::pthread_self());
        thread_policy_set(
            thread,
            THREAD_PRECEDENCE_POLICY,
            &policy as *const _ as *const std::ffi::c_void,
            1,
        )
    };

    if result == 0 {
        log::debug!("Mix-ahead thread precedence raised to {}", importance);
    } else {
        log::debug!(
            "Failed to raise mix-ahead thread precedence (kern_return: {})",
            result
        );
    }
}

#[cfg(not(target_os = "macos"))]
fn raise_thread_precedence(importance: i32) {
    // nice 值越小优先级越高；需要权限，失败无碍
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, -10) };
    if result == 0 {
        log::debug!("Mix-ahead thread niceness lowered (importance {})", importance);
    } else {
        log::debug!(
            "Failed to lower mix-ahead thread niceness ({})",
            std::io::Error::last_os_error()
        );
    }
}
