//! 插值算法
//!
//! 四种算法都从暂存区（历史帧 + 当前块，已转换为 f64）读取，
//! 写入 f64 输出缓冲区。格式转换由调用方完成。
//!
//! 位置约定（单位：输入样本，相对当前块第一帧）：
//! - centre: 第 k 个输出的核中心，o_start + k·o_inc
//! - anchor: 由 i_start 推出的可用性锚点，-i_start·o_inc + k·o_inc
//!
//! 奇数长度时两者相同；偶数长度时 centre 比 anchor 晚半个输出样本。
//! 抽头窗口和最近邻的取样点由 anchor 决定，sinc 权重按 centre 计算。
//!
//! 线性算法是逐输入帧的面积累加：第 k 个输出覆盖输入时间
//! [anchor + halftaps + k·o_inc, anchor + halftaps + (k+1)·o_inc)，
//! 跨块未完成的那个输出的部分和保存在 acc 里。
//!
//! 暂存区的历史长度保证所有读取都落在 [-history, frames) 内，见 `history_frames`

use std::f64::consts::PI;
use std::sync::Arc;

use super::config::{Method, ResamplerConfig};
use super::error::ResampleError;
use super::functable::{self, window_std, FunctionTable, SincKey, DEFAULT_OVERSAMPLE};
use super::floor_eps;
use crate::audio::SampleFormat;

/// 引擎支持的外部样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Pcm {
    Int16,
    Float32,
}

impl Pcm {
    fn from_format(format: SampleFormat) -> Result<Self, ResampleError> {
        match format {
            SampleFormat::Int16 => Ok(Self::Int16),
            SampleFormat::Float32 => Ok(Self::Float32),
            other => Err(ResampleError::UnsupportedFormat(other)),
        }
    }
}

/// 插值核
#[derive(Clone, Debug)]
pub(crate) enum Kernel {
    Nearest,
    Linear,
    SincSlow { cutoff: f64 },
    SincFast { table: Arc<FunctionTable>, stride: usize },
}

/// 绑定好的算法：插值核 × 外部格式
#[derive(Clone, Debug)]
pub(crate) struct Scaler {
    kernel: Kernel,
    pcm: Pcm,
}

/// 当前块的暂存视图
pub(crate) struct Block<'a> {
    /// (history + frames) × channels，交织
    pub staged: &'a [f64],
    /// 暂存区前部的历史帧数
    pub history: usize,
    pub frames: usize,
    pub channels: usize,
}

impl Block<'_> {
    /// 帧号 j（负数为历史帧）在暂存区中的起始下标
    #[inline]
    fn frame_offset(&self, j: i64) -> usize {
        debug_assert!(
            j >= -(self.history as i64) && j < self.frames as i64,
            "frame {} outside [-{}, {})",
            j,
            self.history,
            self.frames
        );
        (j + self.history as i64) as usize * self.channels
    }

    #[inline]
    fn frame(&self, j: i64) -> &[f64] {
        let base = self.frame_offset(j);
        &self.staged[base..base + self.channels]
    }
}

/// 覆盖一个块的所有读取所需的历史帧数
///
/// 块开始时 anchor > -(halftaps + reach)，其中 reach 在稳态下不超过 o_inc
/// （改采样率后可能是旧的 o_inc）。sinc 窗口最远读到
/// floor(anchor - halftaps) ≥ -(L - 1) - ceil(reach)，线性算法补齐部分和时
/// 最远读到 floor(anchor + halftaps)；再留一帧给取整容差
pub(crate) fn history_frames(filter_length: usize, reach: f64) -> usize {
    filter_length + reach.max(0.0).ceil() as usize + 1
}

/// 一次 scale 调用开始时的时间基快照
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor {
    pub centre: f64,
    pub anchor: f64,
    pub step: f64,
    pub halftaps: f64,
    pub filter_length: usize,
}

/// 一个输出样本覆盖的抽头
struct Taps {
    first: i64,
    count: usize,
    /// 第一个抽头到核中心的距离 first - centre
    d_first: f64,
}

impl Cursor {
    /// 第 k 个输出的抽头范围
    ///
    /// 窗口从 floor(anchor - halftaps) 开始共 L 个抽头；
    /// 落在窗函数零点之外（d ≤ -W）的前导抽头直接跳过
    #[inline]
    fn taps(&self, k: usize, block: &Block<'_>) -> Taps {
        let p = self.centre + k as f64 * self.step;
        let anchor = self.anchor + k as f64 * self.step;
        let half_width = self.filter_length as f64 * 0.5;

        let start = floor_eps(anchor - self.halftaps) as i64;
        let end = start + self.filter_length as i64 - 1;
        let live = (p - half_width).floor() as i64 + 1;

        let first = start.max(live);
        debug_assert!(
            start >= -(block.history as i64) && end < block.frames as i64,
            "taps [{}, {}] outside [-{}, {})",
            start,
            end,
            block.history,
            block.frames
        );

        let count = if end >= first {
            (end - first + 1) as usize
        } else {
            0
        };
        Taps {
            first,
            count,
            d_first: first as f64 - p,
        }
    }
}

impl Scaler {
    /// 为配置选择算法
    ///
    /// SincFast 优先使用调用方固定的表（key 必须匹配），否则取进程级缓存
    pub fn bind(
        config: &ResamplerConfig,
        pinned: Option<&Arc<FunctionTable>>,
    ) -> Result<Self, ResampleError> {
        let pcm = Pcm::from_format(config.sample_format)?;
        let cutoff = config.cutoff();

        let kernel = match config.method {
            Method::Nearest => Kernel::Nearest,
            Method::Linear => Kernel::Linear,
            Method::SincSlow => Kernel::SincSlow { cutoff },
            Method::SincFast => {
                let table = match pinned {
                    Some(table) if pinned_matches(table, config.filter_length, cutoff) => {
                        Arc::clone(table)
                    }
                    Some(table) => {
                        log::warn!(
                            "Pinned sinc table {:?} does not match {} taps @ cutoff {:.6}, using cache",
                            table.key(),
                            config.filter_length,
                            cutoff
                        );
                        functable::shared_sinc_table(
                            config.filter_length,
                            DEFAULT_OVERSAMPLE,
                            cutoff,
                        )?
                    }
                    None => functable::shared_sinc_table(
                        config.filter_length,
                        DEFAULT_OVERSAMPLE,
                        cutoff,
                    )?,
                };
                let stride = table
                    .key()
                    .map(|k| k.oversample)
                    .ok_or_else(|| {
                        ResampleError::InvalidConfig("table is not a windowed sinc".to_string())
                    })?;
                Kernel::SincFast { table, stride }
            }
        };

        Ok(Self { kernel, pcm })
    }

    pub fn pcm(&self) -> Pcm {
        self.pcm
    }

    #[cfg(test)]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.kernel, Kernel::Linear)
    }

    /// 计算 `out.len() / channels` 个输出帧
    ///
    /// `acc` 是线性算法跨块的部分和，其他算法不动它
    pub fn run(
        &self,
        block: &Block<'_>,
        cursor: &Cursor,
        acc: &mut [f64],
        out: &mut [f64],
    ) -> Result<(), ResampleError> {
        match &self.kernel {
            Kernel::Nearest => nearest(block, cursor, out),
            Kernel::Linear => linear(block, cursor, acc, out),
            Kernel::SincSlow { cutoff } => sinc_slow(block, cursor, *cutoff, out),
            Kernel::SincFast { table, stride } => sinc_fast(block, cursor, table, *stride, out)?,
        }
        Ok(())
    }
}

fn pinned_matches(table: &FunctionTable, filter_length: usize, cutoff: f64) -> bool {
    match table.key() {
        Some(key) => key == SincKey::new(filter_length, key.oversample, cutoff),
        None => false,
    }
}

// ============================================================================
// 算法
// ============================================================================

/// 取 anchor + halftaps 处的帧（采样保持）
fn nearest(block: &Block<'_>, cursor: &Cursor, out: &mut [f64]) {
    for (k, frame_out) in out.chunks_exact_mut(block.channels).enumerate() {
        let q = cursor.anchor + k as f64 * cursor.step + cursor.halftaps;
        let j = floor_eps(q) as i64;
        frame_out.copy_from_slice(block.frame(j));
    }
}

/// 输入帧 j 占据 [j, j+1)，与 [from, to) 的重叠长度
#[inline]
fn overlap(j: i64, from: f64, to: f64) -> f64 {
    let j = j as f64;
    (to.min(j + 1.0) - from.max(j)).max(0.0)
}

/// 从历史帧补齐第一个输出在块开始前的部分和
///
/// 从其他算法切换过来、或者刚初始化时 acc 里没有有效的部分和
pub(crate) fn prime_linear(block: &Block<'_>, cursor: &Cursor, acc: &mut [f64]) {
    acc.iter_mut().for_each(|a| *a = 0.0);
    let from = cursor.anchor + cursor.halftaps;
    if from >= 0.0 {
        return;
    }
    for j in from.floor() as i64..0 {
        let w = overlap(j, from, 0.0);
        for (a, &x) in acc.iter_mut().zip(block.frame(j)) {
            *a += w * x;
        }
    }
}

/// 逐输入帧走时间轴，按帧落在每个输出区间里的长度加权累加
///
/// 一帧跨过输出区间的右端时输出 acc / o_inc 并清零，
/// 该帧剩余的部分记入下一个输出。块结束时 acc 留着未完成的部分和
fn linear(block: &Block<'_>, cursor: &Cursor, acc: &mut [f64], out: &mut [f64]) {
    let channels = block.channels;
    let outputs = out.len() / channels;
    let base = cursor.anchor + cursor.halftaps;
    let scale = 1.0 / cursor.step;

    let mut k = 0;
    for j in 0..block.frames as i64 {
        let x = block.frame(j);
        let mut from = base + k as f64 * cursor.step;

        while k < outputs {
            let to = base + (k + 1) as f64 * cursor.step;
            if to > (j + 1) as f64 {
                break;
            }
            let w = overlap(j, from, to);
            let frame_out = &mut out[k * channels..(k + 1) * channels];
            for ((o, a), &v) in frame_out.iter_mut().zip(acc.iter_mut()).zip(x) {
                *o = (*a + w * v) * scale;
                *a = 0.0;
            }
            from = to;
            k += 1;
        }

        let to = base + (k + 1) as f64 * cursor.step;
        let w = overlap(j, from, to);
        if w > 0.0 {
            for (a, &v) in acc.iter_mut().zip(x) {
                *a += w * v;
            }
        }
    }

    // 取整容差内最后一个区间的右端可能略超出块尾
    while k < outputs {
        let frame_out = &mut out[k * channels..(k + 1) * channels];
        for (o, a) in frame_out.iter_mut().zip(acc.iter_mut()) {
            *o = *a * scale;
            *a = 0.0;
        }
        k += 1;
    }
}

/// 抽头全部落在窗外或增益为零时退化为采样保持
#[inline]
fn fallback(block: &Block<'_>, cursor: &Cursor, k: usize, frame_out: &mut [f64]) {
    let q = cursor.anchor + k as f64 * cursor.step + cursor.halftaps;
    frame_out.copy_from_slice(block.frame(floor_eps(q) as i64));
}

const MIN_GAIN: f64 = 1e-9;

/// 直接计算的加窗 sinc
///
/// 每个输出样本用一次 sin/cos 重新播种，之后抽头之间
/// 用和角公式递推 sin(θ + δ)、cos(θ + δ)
fn sinc_slow(
    block: &Block<'_>,
    cursor: &Cursor,
    cutoff: f64,
    out: &mut [f64],
) {
    let channels = block.channels;
    let half_width = cursor.filter_length as f64 * 0.5;
    let delta = PI * cutoff;
    let (sin_delta, cos_delta) = delta.sin_cos();
    let mut acc = vec![0.0; channels];

    for (k, frame_out) in out.chunks_exact_mut(channels).enumerate() {
        let taps = cursor.taps(k, block);
        if taps.count == 0 {
            fallback(block, cursor, k, frame_out);
            continue;
        }

        let (mut s, mut c) = (delta * taps.d_first).sin_cos();
        let base = (taps.first + block.history as i64) as usize * channels;
        let mut gain = 0.0;
        acc.iter_mut().for_each(|a| *a = 0.0);

        for tap in 0..taps.count {
            let d = taps.d_first + tap as f64;
            let x = delta * d;
            let kernel = if x.abs() < 1e-9 { 1.0 } else { s / x };
            let w = kernel * window_std(d / half_width);

            let frame = &block.staged[base + tap * channels..base + (tap + 1) * channels];
            for (a, &v) in acc.iter_mut().zip(frame) {
                *a += v * w;
            }
            gain += w;

            let next_s = s * cos_delta + c * sin_delta;
            c = c * cos_delta - s * sin_delta;
            s = next_s;
        }

        if gain.abs() < MIN_GAIN {
            fallback(block, cursor, k, frame_out);
            continue;
        }
        for (o, &a) in frame_out.iter_mut().zip(&acc) {
            *o = a / gain;
        }
    }
}

/// 查表加窗 sinc
///
/// 声道两两一组走融合 FIR，奇数声道数时最后一个声道单独计算
fn sinc_fast(
    block: &Block<'_>,
    cursor: &Cursor,
    table: &FunctionTable,
    stride: usize,
    out: &mut [f64],
) -> Result<(), ResampleError> {
    let channels = block.channels;

    for (k, frame_out) in out.chunks_exact_mut(channels).enumerate() {
        let taps = cursor.taps(k, block);
        if taps.count == 0 {
            fallback(block, cursor, k, frame_out);
            continue;
        }

        let gain = table.weight_sum(taps.d_first, stride, taps.count)?;
        if gain.abs() < MIN_GAIN {
            fallback(block, cursor, k, frame_out);
            continue;
        }

        let base = (taps.first + block.history as i64) as usize * channels;
        let data = &block.staged[base..];

        let mut ch = 0;
        while ch + 1 < channels {
            let (a, b) =
                table.fused_fir_2ch(taps.d_first, stride, &data[ch..], channels, taps.count)?;
            frame_out[ch] = a / gain;
            frame_out[ch + 1] = b / gain;
            ch += 2;
        }
        if ch < channels {
            frame_out[ch] =
                table.fir_1ch(taps.d_first, stride, &data[ch..], channels, taps.count)? / gain;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(centre: f64, step: f64, filter_length: usize) -> Cursor {
        Cursor {
            centre,
            anchor: centre,
            step,
            halftaps: (filter_length as f64 - 1.0) * 0.5,
            filter_length,
        }
    }

    fn mono_block(staged: &[f64], history: usize) -> Block<'_> {
        Block {
            staged,
            history,
            frames: staged.len() - history,
            channels: 1,
        }
    }

    #[test]
    fn test_bind_rejects_wide_formats() {
        for format in [SampleFormat::Int24, SampleFormat::Int32] {
            let config = ResamplerConfig {
                sample_format: format,
                ..Default::default()
            };
            assert_eq!(
                Scaler::bind(&config, None).unwrap_err(),
                ResampleError::UnsupportedFormat(format)
            );
        }
    }

    #[test]
    fn test_bind_uses_matching_pinned_table() {
        let config = ResamplerConfig {
            filter_length: 20,
            input_rate: 48000.0,
            output_rate: 24000.0,
            ..Default::default()
        };
        let table = Arc::new(FunctionTable::windowed_sinc(20, 8, 0.5).unwrap());
        let scaler = Scaler::bind(&config, Some(&table)).unwrap();
        match scaler.kernel() {
            Kernel::SincFast { table: bound, stride } => {
                assert!(Arc::ptr_eq(bound, &table));
                assert_eq!(*stride, 8);
            }
            other => panic!("unexpected kernel {:?}", other),
        }

        // cutoff 不匹配时不使用固定的表
        let other = Arc::new(FunctionTable::windowed_sinc(20, 8, 1.0).unwrap());
        let scaler = Scaler::bind(&config, Some(&other)).unwrap();
        match scaler.kernel() {
            Kernel::SincFast { table: bound, .. } => assert!(!Arc::ptr_eq(bound, &other)),
            other => panic!("unexpected kernel {:?}", other),
        }
    }

    #[test]
    fn test_tap_window_skips_zero_weight_taps() {
        // L = 4：W = 2，halftaps = 1.5
        let staged = vec![0.0; 4 + 16];
        let block = mono_block(&staged, 4);
        let c = Cursor {
            centre: 0.5,
            anchor: 0.0,
            step: 1.0,
            halftaps: 1.5,
            filter_length: 4,
        };
        let taps = c.taps(0, &block);
        // 窗口 [-2, 1]，-2 处 d = -2.5 在窗外
        assert_eq!(taps.first, -1);
        assert_eq!(taps.count, 3);
        assert_eq!(taps.d_first, -1.5);
    }

    #[test]
    fn test_history_covers_earliest_window() {
        for filter_length in [1, 2, 3, 4, 15, 16, 33, 64] {
            for o_inc in [0.3, 0.91875, 1.0, 1.0000208, 3.0, 6.0, 12.0, 12.5] {
                let halftaps = (filter_length as f64 - 1.0) * 0.5;
                let history = history_frames(filter_length, o_inc) as i64;
                // 块开始时锚点的下界
                let anchor = -halftaps - o_inc * (1.0 - 1e-9);

                let start = floor_eps(anchor - halftaps) as i64;
                assert!(start >= -history, "L={} o_inc={}: {} < -{}", filter_length, o_inc, start, history);
                assert!(floor_eps(anchor + halftaps) as i64 >= -history);
                assert!((anchor + halftaps).floor() as i64 >= -history);
            }
        }
    }

    #[test]
    fn test_linear_averages_frames_in_each_interval() {
        // 历史 1 帧 + 4 帧
        let staged = [0.0, 10.0, 20.0, 30.0, 40.0];
        let block = mono_block(&staged, 1);

        // L = 1，o_inc = 2：[0,2) 和 [2,4) 各取两帧平均
        let mut acc = [0.0];
        let mut out = [0.0; 2];
        linear(&block, &cursor(0.0, 2.0, 1), &mut acc, &mut out);
        assert_eq!(out, [15.0, 35.0]);
        assert_eq!(acc, [0.0]);

        // o_inc = 1.5，起点 0.25：[0.25,1.75) [1.75,3.25)，[3.25,4.75) 未完成
        let mut acc = [0.0];
        let mut out = [0.0; 2];
        linear(&block, &cursor(0.25, 1.5, 1), &mut acc, &mut out);
        assert!((out[0] - 15.0).abs() < 1e-12, "{}", out[0]);
        assert!((out[1] - 30.0).abs() < 1e-12, "{}", out[1]);
        assert_eq!(acc, [30.0]);
    }

    #[test]
    fn test_linear_carries_partial_sum_across_blocks() {
        let frames: Vec<f64> = (0..12).map(|i| (i * i) as f64).collect();
        let step = 1.5;

        // 整块
        let mut staged = vec![0.0; 4];
        staged.extend(&frames);
        let mut acc = [0.0];
        let mut whole = [0.0; 8];
        linear(&mono_block(&staged, 4), &cursor(0.0, step, 1), &mut acc, &mut whole);

        // 前 7 帧出 4 个输出（[0,6)），第 5 个输出 [6,7.5) 跨到第二块
        let mut first = vec![0.0; 4];
        first.extend(&frames[..7]);
        let mut acc = [0.0];
        let mut out = vec![0.0; 8];
        linear(&mono_block(&first, 4), &cursor(0.0, step, 1), &mut acc, &mut out[..4]);
        assert_eq!(acc, [36.0]);

        let mut second = frames[3..7].to_vec();
        second.extend(&frames[7..]);
        linear(&mono_block(&second, 4), &cursor(-1.0, step, 1), &mut acc, &mut out[4..]);
        assert_eq!(out, whole);

        // 从历史补齐同样的部分和
        let mut primed = [0.0];
        prime_linear(&mono_block(&second, 4), &cursor(-1.0, step, 1), &mut primed);
        assert_eq!(primed, [36.0]);
    }

    #[test]
    fn test_sinc_slow_matches_table() {
        let filter_length = 12;
        let history = filter_length;
        let staged: Vec<f64> = (0..history + 64)
            .map(|i| (i as f64 * 0.37).sin() + 0.25 * (i as f64 * 1.3).cos())
            .collect();
        let block = mono_block(&staged, history);
        let c = cursor(0.3, 0.87, filter_length);
        let table = FunctionTable::windowed_sinc(filter_length, 4, 0.87).unwrap();

        let mut slow = vec![0.0; 40];
        let mut fast = vec![0.0; 40];
        sinc_slow(&block, &c, 0.87, &mut slow);
        sinc_fast(&block, &c, &table, 4, &mut fast).unwrap();

        for (k, (s, f)) in slow.iter().zip(&fast).enumerate() {
            assert!((s - f).abs() < 5e-3, "output {}: slow={} fast={}", k, s, f);
        }
    }

    #[test]
    fn test_sinc_fast_odd_channel_count() {
        let filter_length = 8;
        let channels = 3;
        let frames = 32;
        let staged: Vec<f64> = (0..(filter_length + frames) * channels)
            .map(|i| {
                let ch = i % channels;
                (ch + 1) as f64 * 100.0
            })
            .collect();
        let block = Block {
            staged: &staged,
            history: filter_length,
            frames,
            channels,
        };
        let table = FunctionTable::windowed_sinc(filter_length, 4, 1.0).unwrap();
        let c = cursor(0.0, 0.75, filter_length);

        let mut out = vec![0.0; 20 * channels];
        sinc_fast(&block, &c, &table, 4, &mut out).unwrap();

        for frame in out.chunks_exact(channels) {
            assert!((frame[0] - 100.0).abs() < 1e-9);
            assert!((frame[1] - 200.0).abs() < 1e-9);
            assert!((frame[2] - 300.0).abs() < 1e-9);
        }
    }
}
