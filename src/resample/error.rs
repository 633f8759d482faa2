//! 重采样错误

use thiserror::Error;

use crate::audio::SampleFormat;

/// 重采样错误
///
/// 所有错误都只影响产生它的那次调用；延迟缓冲区只在算法成功后才提交，
/// 因此出错后重采样器仍可继续使用
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResampleError {
    /// 构造参数非法
    #[error("invalid resampler config: {0}")]
    InvalidConfig(String),

    /// 引擎不支持的样本编码
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(SampleFormat),

    /// 声明的帧数与块的字节长度不符
    #[error("invalid block: expected {expected} bytes, got {actual}")]
    InvalidBlock { expected: usize, actual: usize },

    /// 宿主提供的输出缓冲区太小
    #[error("output buffer too small: need {needed} bytes, got {actual}")]
    OutputTooSmall { needed: usize, actual: usize },

    /// 函数表查询越界（调用方 bug）
    #[error("function table lookup out of range: x = {x}, table covers [{start}, {end}]")]
    OutOfRange { x: f64, start: f64, end: f64 },
}
