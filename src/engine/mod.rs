//! 转换引擎
//!
//! 整合解码、重采样、输出各模块：
//! source → Resampler → sink，按块推进，可随时取消

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audio::{Layout, SampleFormat, StatsReport};
use crate::decode::{AudioDecoder, DecodeError, PcmReader};
use crate::resample::{Method, ResampleError, ResamplePolicy, Resampler, ResamplerConfig};

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 输出采样率策略
    pub policy: ResamplePolicy,
    pub method: Method,
    pub filter_length: usize,
    /// 解码和输出使用的样本编码
    pub format: SampleFormat,
    /// 16-bit 输出是否加 TPDF dither
    pub dither: bool,
    /// 每次送入重采样器的帧数
    pub block_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: ResamplePolicy::Fixed { target_rate: 48000 },
            method: Method::SincFast,
            filter_length: 32,
            format: SampleFormat::Float32,
            dither: false,
            block_frames: 4096,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.block_frames == 0 {
            return Err(EngineError::InvalidConfig("block_frames must be at least 1".into()));
        }
        if !self.format.is_supported() {
            return Err(EngineError::InvalidConfig(format!(
                "sample format {} is not supported",
                self.format
            )));
        }
        if let ResamplePolicy::Fixed { target_rate: 0 } = self.policy {
            return Err(EngineError::InvalidConfig("target rate must be positive".into()));
        }
        Ok(())
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Resample error: {0}")]
    Resample(#[from] ResampleError),
    #[error("Output error: {0}")]
    Output(#[from] hound::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// 一次转换的统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub source_rate: u32,
    pub output_rate: u32,
    pub resample: StatsReport,
    /// 被取消时为 true（尾部未冲出）
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Rate: {} Hz -> {} Hz", self.source_rate, self.output_rate)?;
        if self.cancelled {
            writeln!(f, "Cancelled")?;
        }
        let audio_secs = self.resample.frames_in as f64 / self.source_rate.max(1) as f64;
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed > 0.0 {
            writeln!(f, "Speed: {:.1}x realtime", audio_secs / elapsed)?;
        }
        writeln!(f)?;
        write!(f, "{}", self.resample)
    }
}

// ============================================================================
// 数据源与输出
// ============================================================================

/// 按块提供交织 PCM 的数据源
pub trait BlockSource {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;
    fn sample_format(&self) -> SampleFormat;

    /// 读取最多 max_frames 帧，空切片表示结束
    fn read_frames(&mut self, max_frames: usize) -> Result<&[u8], DecodeError>;
}

impl BlockSource for PcmReader {
    fn sample_rate(&self) -> u32 {
        self.decoder().info().sample_rate
    }

    fn channels(&self) -> usize {
        self.decoder().info().channels as usize
    }

    fn sample_format(&self) -> SampleFormat {
        self.decoder().output_format()
    }

    fn read_frames(&mut self, max_frames: usize) -> Result<&[u8], DecodeError> {
        PcmReader::read_frames(self, max_frames)
    }
}

/// 内存中的 PCM 数据源
pub struct MemorySource {
    data: Vec<u8>,
    position: usize,
    sample_rate: u32,
    channels: usize,
    format: SampleFormat,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, sample_rate: u32, channels: usize, format: SampleFormat) -> Self {
        Self {
            data,
            position: 0,
            sample_rate,
            channels,
            format,
        }
    }
}

impl BlockSource for MemorySource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_format(&self) -> SampleFormat {
        self.format
    }

    fn read_frames(&mut self, max_frames: usize) -> Result<&[u8], DecodeError> {
        let frame_bytes = self.channels * self.format.bytes_per_sample();
        let remaining = (self.data.len() - self.position) / frame_bytes;
        let take = max_frames.min(remaining) * frame_bytes;
        let start = self.position;
        self.position += take;
        Ok(&self.data[start..start + take])
    }
}

/// 接收重采样输出
pub trait PcmSink {
    fn write_block(&mut self, bytes: &[u8]) -> Result<(), EngineError>;

    fn finish(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

impl PcmSink for Vec<u8> {
    fn write_block(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// WAV 文件输出
pub struct WavSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    format: SampleFormat,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(
        path: P,
        channels: u16,
        sample_rate: u32,
        format: SampleFormat,
    ) -> Result<Self, EngineError> {
        let (bits_per_sample, sample_format) = match format {
            SampleFormat::Int16 => (16, hound::SampleFormat::Int),
            SampleFormat::Float32 => (32, hound::SampleFormat::Float),
            other => {
                return Err(EngineError::InvalidConfig(format!(
                    "cannot write {} to WAV",
                    other
                )))
            }
        };
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample,
            sample_format,
        };
        Ok(Self {
            writer: Some(hound::WavWriter::create(path, spec)?),
            format,
        })
    }
}

impl PcmSink for WavSink {
    fn write_block(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(EngineError::InvalidConfig("WAV sink already finished".into()));
        };
        match self.format {
            SampleFormat::Float32 => {
                for c in bytes.chunks_exact(4) {
                    writer.write_sample(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))?;
                }
            }
            _ => {
                for c in bytes.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([c[0], c[1]]))?;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EngineError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

// ============================================================================
// 引擎
// ============================================================================

/// 转换引擎
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// 创建新引擎
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn resampler_config(
        &self,
        channels: usize,
        input_rate: u32,
        output_rate: u32,
        sample_format: SampleFormat,
    ) -> ResamplerConfig {
        ResamplerConfig {
            method: self.config.method,
            channels,
            sample_format,
            filter_length: self.config.filter_length,
            input_rate: input_rate as f64,
            output_rate: output_rate as f64,
            layout: Layout::Interleaved,
            dither: self.config.dither,
        }
    }

    /// 把 source 全部重采样后写入 sink
    ///
    /// `running` 变为 false 时在块边界停下，不冲出尾部
    pub fn run<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        running: &AtomicBool,
    ) -> Result<EngineStats, EngineError>
    where
        S: BlockSource + ?Sized,
        K: PcmSink + ?Sized,
    {
        let started = Instant::now();
        let source_rate = source.sample_rate();
        let output_rate = self.config.policy.target_rate(source_rate);

        let mut resampler = Resampler::new(self.resampler_config(
            source.channels(),
            source_rate,
            output_rate,
            source.sample_format(),
        ))?;
        let stats = resampler.stats();
        let frame_bytes = resampler.config().bytes_per_frame();

        log::info!(
            "Resampling {} Hz -> {} Hz ({} ch, {}, {} x{} taps)",
            source_rate,
            output_rate,
            source.channels(),
            source.sample_format(),
            self.config.method,
            self.config.filter_length
        );

        let mut output = Vec::new();
        let mut cancelled = false;

        loop {
            if !running.load(Ordering::Relaxed) {
                log::info!("Conversion cancelled");
                cancelled = true;
                break;
            }

            let block = source.read_frames(self.config.block_frames)?;
            if block.is_empty() {
                log::debug!("Source reached end of stream");
                break;
            }

            let frames = block.len() / frame_bytes;
            resampler.scale(block, frames, &mut output)?;
            sink.write_block(&output)?;
        }

        if !cancelled {
            let tail = resampler.drain()?;
            sink.write_block(&tail)?;
        }
        sink.finish()?;

        let report = stats.report();
        if report.drift_events > 0 {
            log::warn!("{} timebase drift events during conversion", report.drift_events);
        }
        if report.clipped_samples > 0 {
            log::warn!("{} samples clipped", report.clipped_samples);
        }

        Ok(EngineStats {
            source_rate,
            output_rate,
            resample: report,
            cancelled,
            elapsed: started.elapsed(),
        })
    }

    /// 解码文件、重采样并写出 WAV
    pub fn convert_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        output: Q,
        running: &AtomicBool,
    ) -> Result<EngineStats, EngineError> {
        let input = input.as_ref();
        log::info!("Loading: {}", input.display());

        let decoder = AudioDecoder::open(input, self.config.format)?;
        let info = decoder.info().clone();
        log::info!(
            "Format: {} {} Hz, {} ch, {:?} bit",
            info.codec,
            info.sample_rate,
            info.channels,
            info.bit_depth
        );

        let output_rate = self.config.policy.target_rate(info.sample_rate);
        let mut sink = WavSink::create(
            output.as_ref(),
            info.channels as u16,
            output_rate,
            self.config.format,
        )?;
        let mut source = PcmReader::new(decoder);

        self.run(&mut source, &mut sink, running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine_f32(frames: usize, rate: u32) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| {
                let v = (0.5 * (2.0 * PI * 440.0 * i as f64 / rate as f64).sin()) as f32;
                [v, v]
            })
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_fixed_rate_conversion() {
        let engine = Engine::new(EngineConfig {
            block_frames: 1000,
            ..Default::default()
        })
        .unwrap();
        let mut source = MemorySource::new(sine_f32(44100, 44100), 44100, 2, SampleFormat::Float32);
        let mut sink = Vec::new();
        let running = AtomicBool::new(true);

        let stats = engine.run(&mut source, &mut sink, &running).unwrap();
        assert_eq!(stats.output_rate, 48000);
        assert!(!stats.cancelled);

        // 冲出尾部后输出时长与输入一致
        let frames_out = sink.len() / 8;
        assert!((47999..=48001).contains(&frames_out), "{}", frames_out);
        assert_eq!(stats.resample.frames_out as usize, frames_out);
        assert_eq!(stats.resample.drift_events, 0);
    }

    #[test]
    fn test_match_source_keeps_rate() {
        let engine = Engine::new(EngineConfig {
            policy: ResamplePolicy::MatchSource,
            filter_length: 31,
            ..Default::default()
        })
        .unwrap();
        let input = sine_f32(5000, 44100);
        let mut source = MemorySource::new(input.clone(), 44100, 2, SampleFormat::Float32);
        let mut sink = Vec::new();

        let stats = engine.run(&mut source, &mut sink, &AtomicBool::new(true)).unwrap();
        assert_eq!(stats.output_rate, 44100);
        assert_eq!(sink.len(), input.len());
    }

    #[test]
    fn test_cancellation_stops_at_block_boundary() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut source = MemorySource::new(sine_f32(10000, 44100), 44100, 2, SampleFormat::Float32);
        let mut sink = Vec::new();

        let stats = engine.run(&mut source, &mut sink, &AtomicBool::new(false)).unwrap();
        assert!(stats.cancelled);
        assert!(sink.is_empty());
        assert_eq!(stats.resample.blocks, 0);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(Engine::new(EngineConfig {
            block_frames: 0,
            ..Default::default()
        })
        .is_err());
        assert!(Engine::new(EngineConfig {
            format: SampleFormat::Int32,
            ..Default::default()
        })
        .is_err());
        assert!(Engine::new(EngineConfig {
            policy: ResamplePolicy::Fixed { target_rate: 0 },
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_convert_wav_file() {
        let dir = std::env::temp_dir();
        let input = dir.join(format!("engine-in-{}.wav", std::process::id()));
        let output = dir.join(format!("engine-out-{}.wav", std::process::id()));

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&input, spec).unwrap();
        for i in 0..48000 {
            let v = 8000.0 * (2.0 * PI * 1000.0 * i as f64 / 48000.0).sin();
            writer.write_sample(v.round() as i16).unwrap();
        }
        writer.finalize().unwrap();

        let engine = Engine::new(EngineConfig {
            policy: ResamplePolicy::Fixed { target_rate: 16000 },
            format: SampleFormat::Int16,
            ..Default::default()
        })
        .unwrap();
        let stats = engine
            .convert_file(&input, &output, &AtomicBool::new(true))
            .unwrap();
        assert_eq!(stats.source_rate, 48000);

        let reader = hound::WavReader::open(&output).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().bits_per_sample, 16);
        let frames = reader.len() as i64;
        assert!((frames - 16000).abs() <= 1, "{}", frames);

        std::fs::remove_file(input).ok();
        std::fs::remove_file(output).ok();
    }
}
