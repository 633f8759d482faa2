//! 音频基础模块
//!
//! 包含：
//! - Format: 样本格式、布局和 f64 工作缓冲区之间的转换
//! - Stats: 重采样统计

pub mod format;
pub mod stats;

pub use format::{DitherState, Layout, SampleFormat};
pub use stats::{ResampleStats, StatsReport};
