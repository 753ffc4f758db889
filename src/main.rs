//! Mixbridge - 实时音频输出驱动演示
//!
//! 打开默认输出设备，协商格式与延迟，播放正弦测试音。
//! 用于在真机上验证驱动的完整初始化/释放路径。

#![allow(dead_code)]

mod audio;
mod mixer;

use clap::Parser;

use crate::mixer::Mixer;

/// Mixbridge - real-time audio output driver demo
#[derive(Parser)]
#[command(name = "mixbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Preferred device sample rate in Hz
    #[arg(short, long, default_value = "44100")]
    rate: u32,

    /// Test tone frequency in Hz
    #[arg(short, long, default_value = "440.0")]
    frequency: f64,

    /// Playback duration in seconds (0 = until Ctrl-C)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// 无状态正弦混音器
///
/// 相位从 `decode_pos`（硬件采样时间）直接推出，不携带可变状态，
/// 满足实时回调的无锁契约，回调乱序/丢失也不会跑调。
struct SineMixer {
    frequency: f64,
    sample_rate: f64,
    amplitude: f64,
}

impl Mixer for SineMixer {
    fn mix(&self, out: &mut [i16], frames: usize, decode_pos: i64, _now: i64) {
        let step = std::f64::consts::TAU * self.frequency / self.sample_rate;
        for frame in 0..frames.min(out.len() / 2) {
            let t = (decode_pos + frame as i64) as f64;
            let sample = ((t * step).sin() * self.amplitude * 32767.0) as i16;
            out[frame * 2] = sample;
            out[frame * 2 + 1] = sample;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    run(&cli)
}

#[cfg(target_os = "macos")]
fn run(cli: &Cli) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::audio::{CoreAudioHost, DriverConfig, OutputDriver};

    let host = Arc::new(CoreAudioHost::new());
    let config = DriverConfig {
        preferred_sample_rate: cli.rate,
        ..DriverConfig::default()
    };
    let mut driver = OutputDriver::new(host, config);

    // 混音器用协商前的期望采样率创建；协商被拒时音高会偏移，
    // 对测试音无妨，真实引擎应在初始化后按实际采样率重建
    let mixer = Arc::new(SineMixer {
        frequency: cli.frequency,
        sample_rate: cli.rate as f64,
        amplitude: 0.2,
    });
    driver.initialize(mixer)?;

    log::info!(
        "Playing a {} Hz tone at {} Hz ({:.2} ms latency), Ctrl-C to stop",
        cli.frequency,
        driver.operating_sample_rate().unwrap_or(cli.rate as f64),
        driver.latency_seconds() * 1000.0
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let started = std::time::Instant::now();
    while running.load(Ordering::SeqCst) {
        if cli.duration > 0 && started.elapsed() >= Duration::from_secs(cli.duration) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if let Ok(position) = driver.position() {
        log::info!("Stopped at hardware sample time {}", position);
    }
    driver.teardown();
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn run(_cli: &Cli) -> anyhow::Result<()> {
    anyhow::bail!("no audio backend available on this platform (CoreAudio only)")
}
