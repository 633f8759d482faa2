//! 样本格式与格式转换
//!
//! 外部表示：交织（或按声道平铺）的 little-endian PCM，16-bit 整数或 32-bit 浮点
//! 内部表示：f64 工作缓冲区
//! - Int16: 1:1 映射，不做归一化（数值保持在 ±32767 范围）
//! - Float32: 直接扩展/收窄，不做缩放

use std::fmt;
use std::str::FromStr;

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// 16-bit 有符号整数
    Int16,
    /// 24-bit packed 有符号整数（重采样器不支持）
    Int24,
    /// 32-bit 有符号整数（重采样器不支持）
    Int32,
    /// 32-bit 浮点
    Float32,
}

impl SampleFormat {
    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    /// 重采样引擎是否能处理这种编码
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Int16 | Self::Float32)
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::Float32
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int16 => "s16",
            Self::Int24 => "s24",
            Self::Int32 => "s32",
            Self::Float32 => "f32",
        };
        f.write_str(name)
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s16" | "s16le" | "int16" => Ok(Self::Int16),
            "s24" | "s24le" | "int24" => Ok(Self::Int24),
            "s32" | "s32le" | "int32" => Ok(Self::Int32),
            "f32" | "f32le" | "float32" => Ok(Self::Float32),
            other => Err(format!("unknown sample format: {}", other)),
        }
    }
}

/// 块内样本布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// 交织：LRLRLR...
    Interleaved,
    /// 平铺：LLL...RRR...，每声道连续存放
    Planar,
}

impl Default for Layout {
    fn default() -> Self {
        Self::Interleaved
    }
}

// ============================================================================
// 外部格式 → f64
// ============================================================================

/// 16-bit PCM → f64（连续写入）
///
/// 返回转换的样本数
pub fn s16_to_double(src: &[u8], dst: &mut [f64]) -> usize {
    s16_to_double_dstr(src, dst, 1)
}

/// 16-bit PCM → f64，目标按 `dst_stride` 跨步写入
///
/// 用于把单个声道放进交织的工作缓冲区
pub fn s16_to_double_dstr(src: &[u8], dst: &mut [f64], dst_stride: usize) -> usize {
    let mut count = 0;
    for (chunk, out) in src.chunks_exact(2).zip(dst.iter_mut().step_by(dst_stride)) {
        *out = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        count += 1;
    }
    count
}

/// 32-bit float PCM → f64（连续写入）
pub fn f32_to_double(src: &[u8], dst: &mut [f64]) -> usize {
    f32_to_double_dstr(src, dst, 1)
}

/// 32-bit float PCM → f64，目标按 `dst_stride` 跨步写入
pub fn f32_to_double_dstr(src: &[u8], dst: &mut [f64], dst_stride: usize) -> usize {
    let mut count = 0;
    for (chunk, out) in src.chunks_exact(4).zip(dst.iter_mut().step_by(dst_stride)) {
        *out = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64;
        count += 1;
    }
    count
}

// ============================================================================
// f64 → 外部格式
// ============================================================================

/// f64 → 16-bit PCM（连续读取）
///
/// 四舍五入到最近的偶数（与 rint 一致），饱和到 [-32768, 32767]。
/// 返回被钳位的样本数（非致命，仅供统计）
pub fn double_to_s16(src: &[f64], dst: &mut [u8], dither: Option<&mut DitherState>) -> usize {
    double_to_s16_sstr(src, 1, dst, dither)
}

/// f64 → 16-bit PCM，源按 `src_stride` 跨步读取
pub fn double_to_s16_sstr(
    src: &[f64],
    src_stride: usize,
    dst: &mut [u8],
    mut dither: Option<&mut DitherState>,
) -> usize {
    let mut clipped = 0;
    for (&value, out) in src.iter().step_by(src_stride).zip(dst.chunks_exact_mut(2)) {
        let value = match dither.as_deref_mut() {
            Some(d) => value + d.next_tpdf(),
            None => value,
        };
        let rounded = value.round_ties_even();
        let sample = if rounded > i16::MAX as f64 {
            clipped += 1;
            i16::MAX
        } else if rounded < i16::MIN as f64 {
            clipped += 1;
            i16::MIN
        } else {
            rounded as i16
        };
        out.copy_from_slice(&sample.to_le_bytes());
    }
    clipped
}

/// f64 → 32-bit float PCM（连续读取）
pub fn double_to_f32(src: &[f64], dst: &mut [u8]) {
    double_to_f32_sstr(src, 1, dst)
}

/// f64 → 32-bit float PCM，源按 `src_stride` 跨步读取
pub fn double_to_f32_sstr(src: &[f64], src_stride: usize, dst: &mut [u8]) {
    for (&value, out) in src.iter().step_by(src_stride).zip(dst.chunks_exact_mut(4)) {
        out.copy_from_slice(&(value as f32).to_le_bytes());
    }
}

// ============================================================================
// TPDF dither
// ============================================================================

/// TPDF Dither 状态
///
/// 使用 xorshift32 PRNG，realtime-safe（无分配、无锁）
/// TPDF = 两个均匀随机数相加，产生三角形概率分布，幅度 ±1 LSB
pub struct DitherState {
    /// xorshift32 状态
    state: u32,
}

impl DitherState {
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0xDEADBEEF } else { seed },
        }
    }

    /// 生成下一个随机 u32（xorshift32 算法）
    #[inline(always)]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// 生成 TPDF dither 值，范围 (-1, 1)，单位为 16-bit LSB
    #[inline(always)]
    pub fn next_tpdf(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / 16777216.0; // 2^-24
        let r1 = (self.next_u32() >> 8) as f64 * SCALE;
        let r2 = (self.next_u32() >> 8) as f64 * SCALE;
        r1 + r2 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_s16_roundtrip() {
        let input = s16_bytes(&[0, 1, -1, 16384, -16384, i16::MAX, i16::MIN]);
        let mut doubles = [0.0f64; 7];
        assert_eq!(s16_to_double(&input, &mut doubles), 7);

        // 不做归一化
        assert_eq!(doubles[3], 16384.0);
        assert_eq!(doubles[6], -32768.0);

        let mut output = vec![0u8; input.len()];
        let clipped = double_to_s16(&doubles, &mut output, None);
        assert_eq!(clipped, 0);
        assert_eq!(input, output);
    }

    #[test]
    fn test_f32_roundtrip() {
        let samples = [0.0f32, 0.25, -0.5, 1.0, -1.0, 3.5e-7];
        let input: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut doubles = [0.0f64; 6];
        f32_to_double(&input, &mut doubles);
        assert_eq!(doubles[2], -0.5);

        let mut output = vec![0u8; input.len()];
        double_to_f32(&doubles, &mut output);
        assert_eq!(input, output);
    }

    #[test]
    fn test_s16_saturation_counted() {
        let doubles = [40000.0, -40000.0, 32767.4, -32768.4, 12.0];
        let mut output = vec![0u8; 10];
        let clipped = double_to_s16(&doubles, &mut output, None);
        assert_eq!(clipped, 2);

        let decoded: Vec<i16> = output
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(decoded, vec![i16::MAX, i16::MIN, 32767, -32768, 12]);
    }

    #[test]
    fn test_s16_rounds_half_to_even() {
        let doubles = [0.5, 1.5, 2.5, -0.5, -1.5];
        let mut output = vec![0u8; 10];
        double_to_s16(&doubles, &mut output, None);
        let decoded: Vec<i16> = output
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(decoded, vec![0, 2, 2, 0, -2]);
    }

    #[test]
    fn test_strided_variants() {
        // 两个声道分别写入交织缓冲区
        let left = s16_bytes(&[1, 2, 3]);
        let right = s16_bytes(&[-1, -2, -3]);
        let mut interleaved = [0.0f64; 6];
        s16_to_double_dstr(&left, &mut interleaved, 2);
        s16_to_double_dstr(&right, &mut interleaved[1..], 2);
        assert_eq!(interleaved, [1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);

        // 再按声道取回
        let mut out = vec![0u8; 6];
        double_to_s16_sstr(&interleaved[1..], 2, &mut out, None);
        assert_eq!(out, right);

        let floats = [0.5f64, 9.0, -0.25, 9.0];
        let mut out = vec![0u8; 8];
        double_to_f32_sstr(&floats, 2, &mut out);
        let decoded: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(decoded, vec![0.5, -0.25]);
    }

    #[test]
    fn test_tpdf_range() {
        let mut dither = DitherState::new(12345);
        let mut sum = 0.0;
        for _ in 0..10_000 {
            let d = dither.next_tpdf();
            assert!(d > -1.0 && d < 1.0);
            sum += d;
        }
        // 三角分布均值为 0
        assert!((sum / 10_000.0).abs() < 0.05);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("s16".parse::<SampleFormat>().unwrap(), SampleFormat::Int16);
        assert_eq!("F32".parse::<SampleFormat>().unwrap(), SampleFormat::Float32);
        assert!("u8".parse::<SampleFormat>().is_err());
        assert!(SampleFormat::Int16.is_supported());
        assert!(!SampleFormat::Int24.is_supported());
        assert_eq!(SampleFormat::Int24.bytes_per_sample(), 3);
    }
}
