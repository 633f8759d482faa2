//! 重采样模块
//!
//! 任意比例的采样率转换：
//! - Resampler: 时间基、延迟缓冲区、逐块处理
//! - FunctionTable: 预计算的加窗 sinc 表
//! - 四种插值算法：最近邻、线性、直接 sinc、查表 sinc
//!
//! 时间基（单位见各字段说明）在块之间连续推进，
//! 因此任意切分输入得到的输出与整块处理一致

pub mod config;
pub mod error;
pub mod functable;
mod scale;

use std::sync::Arc;

use crate::audio::format::{
    double_to_f32, double_to_f32_sstr, double_to_s16, double_to_s16_sstr, f32_to_double,
    f32_to_double_dstr, s16_to_double, s16_to_double_dstr,
};
use crate::audio::{DitherState, Layout, ResampleStats};

pub use config::{Method, ResamplerConfig};
pub use error::ResampleError;
pub use functable::{FunctionTable, SincKey};

use scale::{history_frames, prime_linear, Block, Cursor, Pcm, Scaler};

/// 位置取整时的容差：距整数不到 EPS 的位置视为该整数
const POSITION_EPSILON: f64 = 1e-9;

/// 时间基簿记误差超过此值视为漂移
const DRIFT_TOLERANCE: f64 = 1e-6;

const DITHER_SEED: u32 = 0x2545_F491;

/// 带容差的向下取整
///
/// 同一时刻经由不同的块切分累加出来的位置只差几个 ulp，
/// 统一吸附到整数后抽头选择才能一致
#[inline]
pub(crate) fn floor_eps(x: f64) -> f64 {
    (x + POSITION_EPSILON).floor()
}

// ============================================================================
// 输出缓冲区
// ============================================================================

/// 由宿主提供输出缓冲区
///
/// 重采样器先算出输出字节数，再向宿主要缓冲区；
/// 返回的切片短于请求长度时 scale 报 `OutputTooSmall`
pub trait BufferProvider {
    fn get_buffer(&mut self, size_bytes: usize) -> &mut [u8];
}

impl BufferProvider for Vec<u8> {
    fn get_buffer(&mut self, size_bytes: usize) -> &mut [u8] {
        self.clear();
        self.resize(size_bytes, 0);
        self.as_mut_slice()
    }
}

/// 一次 scale 调用的输出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub frame_count: usize,
    pub byte_count: usize,
}

// ============================================================================
// 时间基
// ============================================================================

/// 时间基
///
/// - i_inc: 每个输入样本对应的输出样本数
/// - o_inc: 每个输出样本对应的输入样本数
/// - i_start: 下一块开始时已"欠下"的输出位置（输出样本）
/// - o_start: 下一个输出样本的核中心，相对下一块第一帧（输入样本）
///
/// 始终满足 i_start + o_start·i_inc = centre_offset
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timebase {
    pub i_inc: f64,
    pub o_inc: f64,
    pub i_start: f64,
    pub o_start: f64,
    pub halftaps: f64,
    /// 偶数长度滤波器为 0.5，奇数为 0（输出样本）
    pub centre_offset: f64,
}

impl Timebase {
    fn new(config: &ResamplerConfig) -> Self {
        let centre_offset = if config.filter_length % 2 == 0 { 0.5 } else { 0.0 };
        let mut tb = Self {
            i_inc: 0.0,
            o_inc: 0.0,
            i_start: 0.0,
            o_start: 0.0,
            halftaps: 0.0,
            centre_offset,
        };
        tb.derive(config);
        tb.o_start = centre_offset * tb.o_inc;
        tb
    }

    fn derive(&mut self, config: &ResamplerConfig) {
        self.i_inc = config.output_rate / config.input_rate;
        self.o_inc = config.input_rate / config.output_rate;
        self.halftaps = (config.filter_length as f64 - 1.0) * 0.5;
    }

    /// 采样率变化后重新推导
    ///
    /// 保持可用性锚点 -i_start·o_inc 不动，把两个游标换算到新的单位
    fn retime(&mut self, config: &ResamplerConfig) {
        let anchor = -self.i_start * self.o_inc;
        self.derive(config);
        self.i_start = -anchor * self.i_inc;
        self.o_start = anchor + self.centre_offset * self.o_inc;
    }

    fn cursor(&self, filter_length: usize) -> Cursor {
        Cursor {
            centre: self.o_start,
            anchor: -self.i_start * self.o_inc,
            step: self.o_inc,
            halftaps: self.halftaps,
            filter_length,
        }
    }

    /// 一块 input_frames 帧输入能产生的输出帧数
    pub fn output_frames_for(&self, input_frames: usize) -> usize {
        let end = self.i_start + self.i_inc * input_frames as f64 - self.halftaps * self.i_inc;
        floor_eps(end).max(0.0) as usize
    }

    fn advance(&mut self, input_frames: usize, output_frames: usize) {
        let n = input_frames as f64;
        let o = output_frames as f64;
        self.i_start += self.i_inc * n;
        self.o_start += self.o_inc * o - n;
        self.i_start -= o;
    }

    /// 下一块第一个锚点在 -halftaps 之前最多多远（输入样本）
    ///
    /// 稳态下不超过 o_inc；改采样率后锚点不动，可能还是按旧 o_inc 落下的
    fn reach(&self) -> f64 {
        self.o_inc.max(self.i_start * self.o_inc - self.halftaps)
    }

    fn residual(&self) -> f64 {
        self.i_start + self.o_start * self.i_inc - self.centre_offset
    }

    fn resync(&mut self) {
        self.i_start = self.centre_offset - self.o_start * self.i_inc;
    }
}

// ============================================================================
// 重采样器
// ============================================================================

/// 重采样器
///
/// 构造即初始化；参数变化通过 `set_rates` / `set_method` 完成，
/// 它们会调用 `reinit` 重新推导时间基和算法
pub struct Resampler {
    config: ResamplerConfig,
    timebase: Timebase,
    scaler: Scaler,
    pinned: Option<Arc<FunctionTable>>,

    // 上一块最后 history_frames 帧（f64，交织）
    history: Vec<f64>,
    // 线性算法跨块的部分和，每声道一个
    acc: Vec<f64>,
    // acc 是否由上一块的线性算法留下
    acc_live: bool,
    // 历史 + 当前块
    staging: Vec<f64>,
    // 算法输出
    scratch: Vec<f64>,

    dither: Option<DitherState>,
    stats: Arc<ResampleStats>,
}

impl Resampler {
    pub fn new(config: ResamplerConfig) -> Result<Self, ResampleError> {
        Self::init(config, None)
    }

    /// 使用调用方提供的 sinc 表
    ///
    /// 表的 key 与当前配置不符时（例如采样率变了）退回进程级缓存
    pub fn with_table(
        config: ResamplerConfig,
        table: Arc<FunctionTable>,
    ) -> Result<Self, ResampleError> {
        Self::init(config, Some(table))
    }

    fn init(
        config: ResamplerConfig,
        pinned: Option<Arc<FunctionTable>>,
    ) -> Result<Self, ResampleError> {
        config.validate()?;
        let scaler = Scaler::bind(&config, pinned.as_ref())?;
        let timebase = Timebase::new(&config);

        log::debug!(
            "Resampler: {} -> {} Hz, {} ch {}, {} taps {}",
            config.input_rate,
            config.output_rate,
            config.channels,
            config.sample_format,
            config.filter_length,
            config.method
        );

        let history = history_frames(config.filter_length, timebase.reach());

        Ok(Self {
            history: vec![0.0; history * config.channels],
            acc: vec![0.0; config.channels],
            acc_live: false,
            staging: Vec::new(),
            scratch: Vec::new(),
            dither: config.dither.then(|| DitherState::new(DITHER_SEED)),
            stats: Arc::new(ResampleStats::new()),
            config,
            timebase,
            scaler,
            pinned,
        })
    }

    /// 参数变化后重新推导 i_inc / o_inc / halftaps 并重新选择算法
    ///
    /// 失败时状态不变
    pub fn reinit(&mut self) -> Result<(), ResampleError> {
        self.config.validate()?;
        let scaler = Scaler::bind(&self.config, self.pinned.as_ref())?;

        self.scaler = scaler;
        self.timebase.retime(&self.config);
        self.grow_history();
        if self.config.dither != self.dither.is_some() {
            self.dither = self.config.dither.then(|| DitherState::new(DITHER_SEED));
        }

        log::debug!(
            "Resampler reinit: {} -> {} Hz, {}",
            self.config.input_rate,
            self.config.output_rate,
            self.config.method
        );
        Ok(())
    }

    /// 运行中修改采样率
    pub fn set_rates(&mut self, input_rate: f64, output_rate: f64) -> Result<(), ResampleError> {
        let previous = self.config.clone();
        self.config.input_rate = input_rate;
        self.config.output_rate = output_rate;
        if let Err(e) = self.reinit() {
            self.config = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 运行中切换插值方法
    pub fn set_method(&mut self, method: Method) -> Result<(), ResampleError> {
        let previous = self.config.clone();
        self.config.method = method;
        if let Err(e) = self.reinit() {
            self.config = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 回到刚构造完的状态：清空历史和部分和、游标归位、统计清零
    pub fn reset(&mut self) {
        self.timebase = Timebase::new(&self.config);
        self.history.fill(0.0);
        self.acc.fill(0.0);
        self.acc_live = false;
        self.stats.reset();
        if self.dither.is_some() {
            self.dither = Some(DitherState::new(DITHER_SEED));
        }
        log::debug!("Resampler reset");
    }

    pub fn config(&self) -> &ResamplerConfig {
        &self.config
    }

    pub fn timebase(&self) -> &Timebase {
        &self.timebase
    }

    pub fn stats(&self) -> Arc<ResampleStats> {
        Arc::clone(&self.stats)
    }

    /// 输出/输入采样率比
    pub fn ratio(&self) -> f64 {
        self.timebase.i_inc
    }

    /// 群延迟（输入帧）
    pub fn latency_frames(&self) -> f64 {
        self.timebase.halftaps
    }

    /// 下一块 input_frames 帧输入会产生的输出帧数
    pub fn output_frames_for(&self, input_frames: usize) -> usize {
        self.timebase.output_frames_for(input_frames)
    }

    /// 处理一块输入
    ///
    /// `input` 必须正好是 input_frames 帧。输出缓冲区向 provider 索取，
    /// 长度由时间基决定。出错时时间基和历史都不变
    pub fn scale<P>(
        &mut self,
        input: &[u8],
        input_frames: usize,
        provider: &mut P,
    ) -> Result<OutputDescriptor, ResampleError>
    where
        P: BufferProvider + ?Sized,
    {
        let channels = self.config.channels;
        let frame_bytes = self.config.bytes_per_frame();

        let expected = input_frames * frame_bytes;
        if input.len() != expected {
            return Err(ResampleError::InvalidBlock {
                expected,
                actual: input.len(),
            });
        }

        let output_frames = self.timebase.output_frames_for(input_frames);
        let needed = output_frames * frame_bytes;
        let output = provider.get_buffer(needed);
        if output.len() < needed {
            return Err(ResampleError::OutputTooSmall {
                needed,
                actual: output.len(),
            });
        }
        let output = &mut output[..needed];

        log::trace!("scale: {} frames in, {} frames out", input_frames, output_frames);

        let staged_len = self.stage(input, input_frames);
        let scratch_len = output_frames * channels;
        if self.scratch.len() < scratch_len {
            self.scratch.resize(scratch_len, 0.0);
        }

        let block = Block {
            staged: &self.staging[..staged_len],
            history: self.history.len() / channels,
            frames: input_frames,
            channels,
        };
        let cursor = self.timebase.cursor(self.config.filter_length);
        let linear = self.scaler.is_linear();
        if linear && !self.acc_live {
            prime_linear(&block, &cursor, &mut self.acc);
        }
        self.scaler
            .run(&block, &cursor, &mut self.acc, &mut self.scratch[..scratch_len])?;
        self.acc_live = linear;

        let clipped = self.emit(output_frames, output);
        self.commit(staged_len, input_frames, output_frames);

        self.stats.record_block(input_frames, output_frames);
        self.stats.record_clipped(clipped);

        Ok(OutputDescriptor {
            frame_count: output_frames,
            byte_count: needed,
        })
    }

    /// 处理一块输入，输出写入新分配的 Vec
    pub fn process(&mut self, input: &[u8]) -> Result<Vec<u8>, ResampleError> {
        let frames = input.len() / self.config.bytes_per_frame();
        let mut output = Vec::new();
        self.scale(input, frames, &mut output)?;
        Ok(output)
    }

    /// 送入 ceil(halftaps) 帧静音，把仍在延迟线里的输出推出来
    pub fn drain(&mut self) -> Result<Vec<u8>, ResampleError> {
        let frames = self.timebase.halftaps.ceil() as usize;
        let silence = vec![0u8; frames * self.config.bytes_per_frame()];
        self.process(&silence)
    }

    // ========================================================================
    // 内部
    // ========================================================================

    /// 把历史和当前块转换到暂存区，返回暂存的样本数
    fn stage(&mut self, input: &[u8], frames: usize) -> usize {
        let channels = self.config.channels;
        let history_len = self.history.len();
        let total = history_len + frames * channels;

        if self.staging.len() < total {
            log::debug!(
                "Growing staging buffer: {} -> {} samples",
                self.staging.len(),
                total
            );
            self.staging.resize(total, 0.0);
        }

        self.staging[..history_len].copy_from_slice(&self.history);
        if frames == 0 {
            return total;
        }

        let dst = &mut self.staging[history_len..total];
        let plane_bytes = frames * self.config.sample_format.bytes_per_sample();

        match (self.scaler.pcm(), self.config.layout) {
            (Pcm::Int16, Layout::Interleaved) => {
                s16_to_double(input, dst);
            }
            (Pcm::Float32, Layout::Interleaved) => {
                f32_to_double(input, dst);
            }
            (pcm, Layout::Planar) => {
                for (ch, plane) in input.chunks_exact(plane_bytes).enumerate() {
                    let dst = &mut dst[ch..];
                    match pcm {
                        Pcm::Int16 => s16_to_double_dstr(plane, dst, channels),
                        Pcm::Float32 => f32_to_double_dstr(plane, dst, channels),
                    };
                }
            }
        }

        total
    }

    /// 把算法输出转换成外部格式，返回钳位的样本数
    fn emit(&mut self, frames: usize, output: &mut [u8]) -> usize {
        if frames == 0 {
            return 0;
        }

        let channels = self.config.channels;
        let src = &self.scratch[..frames * channels];
        let plane_bytes = frames * self.config.sample_format.bytes_per_sample();
        let mut dither = self.dither.as_mut();

        match (self.scaler.pcm(), self.config.layout) {
            (Pcm::Int16, Layout::Interleaved) => double_to_s16(src, output, dither),
            (Pcm::Float32, Layout::Interleaved) => {
                double_to_f32(src, output);
                0
            }
            (pcm, Layout::Planar) => {
                let mut clipped = 0;
                for (ch, plane) in output.chunks_exact_mut(plane_bytes).enumerate() {
                    let src = &src[ch..];
                    match pcm {
                        Pcm::Int16 => {
                            clipped += double_to_s16_sstr(src, channels, plane, dither.as_deref_mut())
                        }
                        Pcm::Float32 => double_to_f32_sstr(src, channels, plane),
                    }
                }
                clipped
            }
        }
    }

    /// 按当前时间基需要的读取范围加长历史，保留最新的帧
    ///
    /// 只增不减；前面补的零帧不会被读到，锚点在绝对时间上不会后退
    fn grow_history(&mut self) {
        let channels = self.config.channels;
        let needed = history_frames(self.config.filter_length, self.timebase.reach()) * channels;
        let current = self.history.len();
        if needed <= current {
            return;
        }

        log::debug!(
            "Growing history: {} -> {} frames",
            current / channels,
            needed / channels
        );
        let mut history = vec![0.0; needed];
        history[needed - current..].copy_from_slice(&self.history);
        self.history = history;
    }

    /// 算法成功后提交：更新历史和时间基
    fn commit(&mut self, staged_len: usize, input_frames: usize, output_frames: usize) {
        let history_len = self.history.len();
        self.history
            .copy_from_slice(&self.staging[staged_len - history_len..staged_len]);

        self.timebase.advance(input_frames, output_frames);

        let residual = self.timebase.residual();
        if residual.abs() > DRIFT_TOLERANCE {
            log::warn!("Timebase drifted by {:.3e} output samples, resyncing", residual);
            self.timebase.resync();
            self.stats.record_drift(1);
        }
    }
}

// ============================================================================
// 策略
// ============================================================================

/// 重采样策略
#[derive(Clone, Debug, Default)]
pub enum ResamplePolicy {
    /// 保持源采样率，不做重采样
    #[default]
    MatchSource,

    /// 固定输出：使用指定采样率，必要时重采样
    Fixed { target_rate: u32 },
}

impl ResamplePolicy {
    /// 给定源采样率时的输出采样率
    pub fn target_rate(&self, source_rate: u32) -> u32 {
        match self {
            Self::MatchSource => source_rate,
            Self::Fixed { target_rate } => *target_rate,
        }
    }
}
