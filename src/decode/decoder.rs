//! 音频文件解码器
//!
//! 使用 symphonia 库解码音频文件
//! 支持：FLAC, WAV, AIFF, MP3
//!
//! 解码结果直接转换成重采样器的外部格式：
//! 交织 little-endian 的 16-bit 整数或 32-bit 浮点

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::ConvertibleSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::Sample;
use thiserror::Error;

use crate::audio::SampleFormat;

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    /// 文件打开失败
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    /// 格式不支持
    #[error("Unsupported audio format")]
    UnsupportedFormat,
    /// 没有找到音频轨道
    #[error("No audio track found")]
    NoAudioTrack,
    /// 请求的输出编码无法生成
    #[error("Cannot decode to {0}")]
    UnsupportedOutput(SampleFormat),
    /// 解码器创建失败
    #[error("Failed to create decoder: {0}")]
    DecoderCreation(String),
    /// 解码失败
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// 采样率
    pub sample_rate: u32,
    /// 声道数
    pub channels: u32,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    /// 总时长（秒）
    pub duration_secs: Option<f64>,
    /// 格式名称
    pub format: String,
    /// 编解码器名称
    pub codec: String,
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    output: SampleFormat,

    s16: Option<SampleBuffer<i16>>,
    f32: Option<SampleBuffer<f32>>,
    bytes: Vec<u8>,
}

impl AudioDecoder {
    /// 打开音频文件，解码输出为 `output` 编码
    pub fn open<P: AsRef<Path>>(path: P, output: SampleFormat) -> Result<Self, DecodeError> {
        if !output.is_supported() {
            return Err(DecodeError::UnsupportedOutput(output));
        }

        let path = path.as_ref();
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // 提示文件扩展名
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        // 查找第一个音频轨道
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u32)
            .unwrap_or(2);
        let total_frames = codec_params.n_frames;

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec: codec_name,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            output,
            s16: None,
            f32: None,
            bytes: Vec::with_capacity(65536),
        })
    }

    /// 获取音频信息
    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 输出编码
    pub fn output_format(&self) -> SampleFormat {
        self.output
    }

    /// 每帧字节数
    pub fn frame_bytes(&self) -> usize {
        self.info.channels as usize * self.output.bytes_per_sample()
    }

    /// 解码下一个 packet
    ///
    /// 返回交织的 little-endian 字节，空切片表示文件结束
    pub fn decode_next(&mut self) -> Result<&[u8], DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.bytes.clear();
                    return Ok(&self.bytes); // EOF
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            // 跳过非目标轨道
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            self.bytes.clear();
            match self.output {
                SampleFormat::Int16 => {
                    let buf = sample_buffer(&mut self.s16, &decoded);
                    buf.copy_interleaved_ref(decoded);
                    for s in buf.samples() {
                        self.bytes.extend_from_slice(&s.to_le_bytes());
                    }
                }
                SampleFormat::Float32 => {
                    let buf = sample_buffer(&mut self.f32, &decoded);
                    buf.copy_interleaved_ref(decoded);
                    for s in buf.samples() {
                        self.bytes.extend_from_slice(&s.to_le_bytes());
                    }
                }
                other => return Err(DecodeError::UnsupportedOutput(other)),
            }

            return Ok(&self.bytes);
        }
    }
}

/// 取得足够大的交织缓冲区（不够时重建）
fn sample_buffer<'a, S>(
    slot: &'a mut Option<SampleBuffer<S>>,
    decoded: &AudioBufferRef<'_>,
) -> &'a mut SampleBuffer<S>
where
    S: Sample + ConvertibleSample,
{
    let spec = *decoded.spec();
    let needed = decoded.frames() * spec.channels.count();
    let fits = slot.as_ref().is_some_and(|b| b.capacity() >= needed);
    if !fits {
        *slot = None;
    }
    slot.get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec))
}

/// 按帧读取的解码器包装
///
/// 把长短不一的 packet 整理成调用方要求的块长度
pub struct PcmReader {
    decoder: AudioDecoder,
    pending: Vec<u8>,
    position: usize,
    eof: bool,
}

impl PcmReader {
    pub fn new(decoder: AudioDecoder) -> Self {
        Self {
            decoder,
            pending: Vec::with_capacity(65536),
            position: 0,
            eof: false,
        }
    }

    /// 获取解码器引用
    pub fn decoder(&self) -> &AudioDecoder {
        &self.decoder
    }

    /// 读取最多 max_frames 帧
    ///
    /// 只有文件结束时才会返回不足 max_frames 的块；空切片表示结束
    pub fn read_frames(&mut self, max_frames: usize) -> Result<&[u8], DecodeError> {
        let frame_bytes = self.decoder.frame_bytes();
        let wanted = max_frames * frame_bytes;

        while self.pending.len() - self.position < wanted && !self.eof {
            if self.position > 0 {
                self.pending.drain(..self.position);
                self.position = 0;
            }
            let chunk = self.decoder.decode_next()?;
            if chunk.is_empty() {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(chunk);
            }
        }

        let available = self.pending.len() - self.position;
        let take = wanted.min(available / frame_bytes * frame_bytes);
        let start = self.position;
        self.position += take;
        Ok(&self.pending[start..start + take])
    }

    /// 检查是否到达文件末尾
    pub fn is_eof(&self) -> bool {
        self.eof && self.pending.len() == self.position
    }
}
