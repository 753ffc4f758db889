//! PCM 流格式描述与样本转换
//!
//! 两个格式贯穿驱动的整个生命周期：
//! - 引擎规范格式：16-bit 有符号整数、双声道、交织、本机字节序（固定）
//! - 硬件 I/O 格式：初始化时协商（首选 Float32 packed），之后不再变化
//!
//! `SampleConverter` 在两者之间做逐次调用无状态的转换，
//! 直接写入硬件提供的字节缓冲区，不分配、不加锁。

use thiserror::Error;

/// 格式标志位（与 CoreAudio LinearPCM 标志同值，便于直接透传 ASBD）
pub const FLAG_IS_FLOAT: u32 = 1 << 0;
pub const FLAG_IS_BIG_ENDIAN: u32 = 1 << 1;
pub const FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
pub const FLAG_IS_PACKED: u32 = 1 << 3;
pub const FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

/// 引擎规范格式的固定参数
pub const ENGINE_CHANNELS: u32 = 2;
pub const ENGINE_BITS: u32 = 16;
pub const ENGINE_BYTES_PER_FRAME: u32 = ENGINE_CHANNELS * ENGINE_BITS / 8;

/// 本机字节序对应的 BIG_ENDIAN 位
#[inline]
fn native_endian_flag() -> u32 {
    if cfg!(target_endian = "big") {
        FLAG_IS_BIG_ENDIAN
    } else {
        0
    }
}

/// PCM 流格式描述
///
/// 不可变：实例一旦构造就不再修改。不变量由 `is_consistent` 表达：
/// bytes_per_frame == bytes_per_packet / frames_per_packet，
/// 且与声道数 × 位深一致（packed 布局）。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
}

impl StreamFormat {
    /// 引擎规范格式：16-bit 有符号、双声道、交织、本机字节序
    pub fn engine_canonical(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            flags: FLAG_IS_SIGNED_INTEGER | FLAG_IS_PACKED | native_endian_flag(),
            bytes_per_packet: ENGINE_BYTES_PER_FRAME,
            frames_per_packet: 1,
            bytes_per_frame: ENGINE_BYTES_PER_FRAME,
            channels_per_frame: ENGINE_CHANNELS,
            bits_per_channel: ENGINE_BITS,
        }
    }

    /// HAL 首选的 IOProc 格式：32-bit float packed 双声道
    pub fn hal_canonical(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            flags: FLAG_IS_FLOAT | FLAG_IS_PACKED | native_endian_flag(),
            bytes_per_packet: 8,
            frames_per_packet: 1,
            bytes_per_frame: 8,
            channels_per_frame: 2,
            bits_per_channel: 32,
        }
    }

    /// 32-bit 有符号整数 packed 格式（部分 DAC 的原生布局）
    pub fn int32_interleaved(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            flags: FLAG_IS_SIGNED_INTEGER | FLAG_IS_PACKED | native_endian_flag(),
            bytes_per_packet: 4 * channels,
            frames_per_packet: 1,
            bytes_per_frame: 4 * channels,
            channels_per_frame: channels,
            bits_per_channel: 32,
        }
    }

    pub fn is_non_interleaved(&self) -> bool {
        self.flags & FLAG_IS_NON_INTERLEAVED != 0
    }

    pub fn is_native_endian(&self) -> bool {
        self.flags & FLAG_IS_BIG_ENDIAN == native_endian_flag()
    }

    /// 描述符自洽性检查
    pub fn is_consistent(&self) -> bool {
        if self.frames_per_packet == 0 || self.channels_per_frame == 0 {
            return false;
        }
        if self.bytes_per_frame != self.bytes_per_packet / self.frames_per_packet {
            return false;
        }
        // packed 布局：每帧字节数 = 声道数 × 位深/8
        self.bytes_per_frame == self.channels_per_frame * self.bits_per_channel / 8
    }
}

/// 转换目标的样本布局分类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Float32,
    Int16,
    Int32,
}

/// 转换器创建失败（初始化致命错误，见驱动契约）
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unsupported output sample layout ({bits} bits, flags 0x{flags:x})")]
    UnsupportedLayout { bits: u32, flags: u32 },
    #[error("output channel count {output} does not match engine channel count {engine}")]
    ChannelMismatch { engine: u32, output: u32 },
    #[error("non-interleaved output layouts are not supported")]
    NonInterleaved,
    #[error("inconsistent output format descriptor")]
    Inconsistent,
}

/// 引擎格式 → 硬件格式的样本转换器
///
/// 逐次调用无状态；所有转换都在调用者提供的缓冲区内完成。
/// 帧数换算只依赖一个规范比值（各自的 bytes_per_frame），
/// 不做任何与位深绑定的移位运算。
pub struct SampleConverter {
    engine: StreamFormat,
    output: StreamFormat,
    kind: SampleKind,
}

impl SampleConverter {
    /// 校验硬件格式可表示后创建转换器
    pub fn new(engine: StreamFormat, output: StreamFormat) -> Result<Self, ConvertError> {
        if output.is_non_interleaved() {
            return Err(ConvertError::NonInterleaved);
        }
        if !output.is_consistent() {
            return Err(ConvertError::Inconsistent);
        }
        if output.channels_per_frame != engine.channels_per_frame {
            return Err(ConvertError::ChannelMismatch {
                engine: engine.channels_per_frame,
                output: output.channels_per_frame,
            });
        }

        let unsupported = ConvertError::UnsupportedLayout {
            bits: output.bits_per_channel,
            flags: output.flags,
        };
        if !output.is_native_endian() {
            return Err(unsupported);
        }

        let is_float = output.flags & FLAG_IS_FLOAT != 0;
        let is_int = output.flags & FLAG_IS_SIGNED_INTEGER != 0;
        let kind = match (is_float, is_int, output.bits_per_channel) {
            (true, _, 32) => SampleKind::Float32,
            (false, true, 16) => SampleKind::Int16,
            (false, true, 32) => SampleKind::Int32,
            _ => return Err(unsupported),
        };

        Ok(Self {
            engine,
            output,
            kind,
        })
    }

    pub fn engine_format(&self) -> &StreamFormat {
        &self.engine
    }

    pub fn output_format(&self) -> &StreamFormat {
        &self.output
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    /// 硬件缓冲区字节数 → 引擎帧数（规范比值，向下取整）
    #[inline]
    pub fn engine_frames_for_output_bytes(&self, output_bytes: usize) -> usize {
        output_bytes / self.output.bytes_per_frame as usize
    }

    /// 引擎帧数 → 引擎交织样本数
    #[inline]
    pub fn engine_samples_for_frames(&self, frames: usize) -> usize {
        frames * self.engine.channels_per_frame as usize
    }

    /// 引擎样本 → 硬件字节，返回写入的字节数
    ///
    /// 实时路径：不分配、不加锁。输入输出长度不匹配时按较小者截断，
    /// 剩余部分由调用者负责（回调用静音填满）。
    pub fn convert(&self, engine: &[i16], output: &mut [u8]) -> usize {
        match self.kind {
            SampleKind::Int16 => {
                let n = engine.len().min(output.len() / 2);
                for (i, &s) in engine[..n].iter().enumerate() {
                    output[i * 2..i * 2 + 2].copy_from_slice(&s.to_ne_bytes());
                }
                n * 2
            }
            SampleKind::Int32 => {
                let n = engine.len().min(output.len() / 4);
                for (i, &s) in engine[..n].iter().enumerate() {
                    // 左对齐到 i32 高 16 位
                    let v = (s as i32) << 16;
                    output[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
                }
                n * 4
            }
            SampleKind::Float32 => {
                let n = engine.len().min(output.len() / 4);
                for (i, &s) in engine[..n].iter().enumerate() {
                    let v = s as f32 / 32768.0;
                    output[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
                }
                n * 4
            }
        }
    }

    /// 硬件字节 → 引擎样本，返回读出的样本数
    ///
    /// 逆向转换，用于环回校验。
    pub fn output_to_engine(&self, output: &[u8], engine: &mut [i16]) -> usize {
        match self.kind {
            SampleKind::Int16 => {
                let n = engine.len().min(output.len() / 2);
                for i in 0..n {
                    engine[i] = i16::from_ne_bytes([output[i * 2], output[i * 2 + 1]]);
                }
                n
            }
            SampleKind::Int32 => {
                let n = engine.len().min(output.len() / 4);
                for i in 0..n {
                    let v = i32::from_ne_bytes([
                        output[i * 4],
                        output[i * 4 + 1],
                        output[i * 4 + 2],
                        output[i * 4 + 3],
                    ]);
                    engine[i] = (v >> 16) as i16;
                }
                n
            }
            SampleKind::Float32 => {
                let n = engine.len().min(output.len() / 4);
                for i in 0..n {
                    let v = f32::from_ne_bytes([
                        output[i * 4],
                        output[i * 4 + 1],
                        output[i * 4 + 2],
                        output[i * 4 + 3],
                    ]);
                    let scaled = (v * 32768.0).round();
                    engine[i] = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                }
                n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_formats_consistent() {
        assert!(StreamFormat::engine_canonical(44100.0).is_consistent());
        assert!(StreamFormat::hal_canonical(48000.0).is_consistent());
        assert!(StreamFormat::int32_interleaved(96000.0, 2).is_consistent());
    }

    #[test]
    fn test_inconsistent_descriptor_rejected() {
        let mut fmt = StreamFormat::hal_canonical(44100.0);
        fmt.bytes_per_frame = 6; // 与声道数 × 位深矛盾
        assert!(!fmt.is_consistent());
        let engine = StreamFormat::engine_canonical(44100.0);
        assert!(matches!(
            SampleConverter::new(engine, fmt),
            Err(ConvertError::Inconsistent)
        ));
    }

    #[test]
    fn test_non_interleaved_rejected() {
        let engine = StreamFormat::engine_canonical(44100.0);
        let mut fmt = StreamFormat::hal_canonical(44100.0);
        fmt.flags |= FLAG_IS_NON_INTERLEAVED;
        assert!(matches!(
            SampleConverter::new(engine, fmt),
            Err(ConvertError::NonInterleaved)
        ));
    }

    #[test]
    fn test_unsupported_bit_depth_rejected() {
        let engine = StreamFormat::engine_canonical(44100.0);
        let mut fmt = StreamFormat::hal_canonical(44100.0);
        // 64-bit float：描述自洽但转换器不支持
        fmt.bits_per_channel = 64;
        fmt.bytes_per_packet = 16;
        fmt.bytes_per_frame = 16;
        assert!(matches!(
            SampleConverter::new(engine, fmt),
            Err(ConvertError::UnsupportedLayout { bits: 64, .. })
        ));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let engine = StreamFormat::engine_canonical(44100.0);
        let fmt = StreamFormat::int32_interleaved(44100.0, 6);
        assert!(matches!(
            SampleConverter::new(engine, fmt),
            Err(ConvertError::ChannelMismatch {
                engine: 2,
                output: 6
            })
        ));
    }

    #[test]
    fn test_int16_identity_roundtrip() {
        let engine = StreamFormat::engine_canonical(44100.0);
        let conv = SampleConverter::new(engine, engine).unwrap();
        assert_eq!(conv.kind(), SampleKind::Int16);

        let input: Vec<i16> = vec![0, 1, -1, 16384, -16384, i16::MAX, i16::MIN, 12345];
        let mut bytes = vec![0u8; input.len() * 2];
        assert_eq!(conv.convert(&input, &mut bytes), input.len() * 2);

        let mut back = vec![0i16; input.len()];
        assert_eq!(conv.output_to_engine(&bytes, &mut back), input.len());
        assert_eq!(back, input);
    }

    #[test]
    fn test_float32_roundtrip_exact() {
        let engine = StreamFormat::engine_canonical(48000.0);
        let conv = SampleConverter::new(engine, StreamFormat::hal_canonical(48000.0)).unwrap();
        assert_eq!(conv.kind(), SampleKind::Float32);

        // i16 的每个值除以 32768 后在 f32 中都是精确的
        let input: Vec<i16> = vec![0, 1, -1, 255, -255, 16383, i16::MAX, i16::MIN];
        let mut bytes = vec![0u8; input.len() * 4];
        assert_eq!(conv.convert(&input, &mut bytes), input.len() * 4);

        let mut back = vec![0i16; input.len()];
        assert_eq!(conv.output_to_engine(&bytes, &mut back), input.len());
        assert_eq!(back, input);
    }

    #[test]
    fn test_int32_roundtrip() {
        let engine = StreamFormat::engine_canonical(96000.0);
        let conv =
            SampleConverter::new(engine, StreamFormat::int32_interleaved(96000.0, 2)).unwrap();
        assert_eq!(conv.kind(), SampleKind::Int32);

        let input: Vec<i16> = vec![1, -1, i16::MAX, i16::MIN];
        let mut bytes = vec![0u8; input.len() * 4];
        conv.convert(&input, &mut bytes);

        let mut back = vec![0i16; input.len()];
        conv.output_to_engine(&bytes, &mut back);
        assert_eq!(back, input);
    }

    #[test]
    fn test_frame_math_single_ratio() {
        let engine = StreamFormat::engine_canonical(44100.0);
        let conv = SampleConverter::new(engine, StreamFormat::hal_canonical(44100.0)).unwrap();

        // 512 帧 float32 双声道 = 4096 字节
        assert_eq!(conv.engine_frames_for_output_bytes(4096), 512);
        assert_eq!(conv.engine_samples_for_frames(512), 1024);
        // 非整帧尾部向下取整
        assert_eq!(conv.engine_frames_for_output_bytes(4097), 512);
    }

    #[test]
    fn test_convert_truncates_to_smaller_side() {
        let engine = StreamFormat::engine_canonical(44100.0);
        let conv = SampleConverter::new(engine, engine).unwrap();

        let input: Vec<i16> = vec![7; 8];
        let mut small = vec![0u8; 6]; // 只放得下 3 个样本
        assert_eq!(conv.convert(&input, &mut small), 6);
    }
}
