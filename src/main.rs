//! Roger Resample - 任意比例采样率转换工具
//!
//! 解码音频文件，重采样到目标采样率，写出 WAV

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use roger_resample::audio::SampleFormat;
use roger_resample::decode::AudioDecoder;
use roger_resample::engine::{Engine, EngineConfig};
use roger_resample::resample::{Method, ResamplePolicy};

/// Roger Resample - arbitrary-ratio sample rate converter
#[derive(Parser)]
#[command(name = "roger-resample")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resample a file (or every audio file in a directory) to WAV
    Convert {
        /// Input file or directory
        input: PathBuf,

        /// Output file (or directory when INPUT is a directory)
        output: PathBuf,

        #[command(flatten)]
        options: ConvertOptions,
    },

    /// Show audio file information
    Info {
        /// Audio file
        file: PathBuf,
    },
}

#[derive(Args)]
struct ConvertOptions {
    /// Target sample rate in Hz (omit to keep the source rate)
    #[arg(short, long)]
    rate: Option<u32>,

    /// Interpolation method: nearest, linear, sinc-slow, sinc
    #[arg(short, long, default_value = "sinc")]
    method: Method,

    /// Filter length in taps
    #[arg(short = 'l', long, default_value = "32")]
    filter_length: usize,

    /// Sample format: s16 or f32
    #[arg(short, long, default_value = "f32")]
    format: SampleFormat,

    /// Add TPDF dither before 16-bit output
    #[arg(long)]
    dither: bool,

    /// Frames per processing block
    #[arg(short, long, default_value = "4096")]
    block_frames: usize,
}

impl ConvertOptions {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: match self.rate {
                Some(target_rate) => ResamplePolicy::Fixed { target_rate },
                None => ResamplePolicy::MatchSource,
            },
            method: self.method,
            filter_length: self.filter_length,
            format: self.format,
            dither: self.dither,
            block_frames: self.block_frames,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Convert {
            ref input,
            ref output,
            ref options,
        } => convert(input, output, options),
        Commands::Info { ref file } => show_file_info(file),
    }
}

const AUDIO_EXTENSIONS: &[&str] = &["flac", "wav", "aiff", "aif", "mp3"];

/// 检查文件是否为支持的音频格式
fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 扫描目录中的音频文件（按文件名排序）
fn scan_audio_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_audio_file(path))
        .collect();
    files.sort();
    Ok(files)
}

fn convert(input: &Path, output: &Path, options: &ConvertOptions) -> anyhow::Result<()> {
    let engine = Engine::new(options.engine_config())?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let jobs: Vec<(PathBuf, PathBuf)> = if input.is_dir() {
        let files = scan_audio_files(input)?;
        if files.is_empty() {
            println!("No audio files found in {}", input.display());
            println!("Supported formats: {}", AUDIO_EXTENSIONS.join(", "));
            return Ok(());
        }
        std::fs::create_dir_all(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        files
            .into_iter()
            .filter_map(|file| {
                let stem = file.file_stem()?.to_string_lossy().into_owned();
                let target = output.join(format!("{}.wav", stem));
                Some((file, target))
            })
            .collect()
    } else {
        vec![(input.to_path_buf(), output.to_path_buf())]
    };

    let total = jobs.len();
    for (index, (source, target)) in jobs.iter().enumerate() {
        if !running.load(Ordering::SeqCst) {
            println!("\nConversion interrupted.");
            break;
        }

        if total > 1 {
            println!("[{}/{}] {}", index + 1, total, source.display());
        }

        let stats = engine
            .convert_file(source, target, &running)
            .with_context(|| format!("Failed to convert {}", source.display()))?;

        println!("{} -> {}", source.display(), target.display());
        println!("{}", stats);
    }

    Ok(())
}

/// 显示文件信息
fn show_file_info(file: &Path) -> anyhow::Result<()> {
    let decoder = AudioDecoder::open(file, SampleFormat::Float32)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let info = decoder.info();

    println!("File: {}", file.display());
    println!("Format: {} ({})", info.format, info.codec);
    println!("Sample rate: {} Hz", info.sample_rate);
    println!("Channels: {}", info.channels);
    if let Some(bits) = info.bit_depth {
        println!("Bit depth: {}", bits);
    }
    if let Some(frames) = info.total_frames {
        println!("Frames: {}", frames);
    }
    if let Some(secs) = info.duration_secs {
        println!("Duration: {}:{:05.2}", (secs / 60.0) as u64, secs % 60.0);
    }

    Ok(())
}
