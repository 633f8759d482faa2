//! 重采样配置

use std::fmt;
use std::str::FromStr;

use super::error::ResampleError;
use crate::audio::{Layout, SampleFormat};

/// 插值方法
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    /// 最近邻（采样保持）
    Nearest,
    /// 线性插值
    Linear,
    /// 直接计算的加窗 sinc（三角递推）
    SincSlow,
    /// 查表加窗 sinc
    SincFast,
}

impl Default for Method {
    fn default() -> Self {
        Self::SincFast
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nearest => "nearest",
            Self::Linear => "linear",
            Self::SincSlow => "sinc-slow",
            Self::SincFast => "sinc",
        };
        f.write_str(name)
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "linear" | "bilinear" => Ok(Self::Linear),
            "sinc-slow" | "sinc_slow" => Ok(Self::SincSlow),
            "sinc" | "sinc-fast" | "sinc_fast" => Ok(Self::SincFast),
            other => Err(format!("unknown resample method: {}", other)),
        }
    }
}

/// 重采样器配置
#[derive(Clone, Debug, PartialEq)]
pub struct ResamplerConfig {
    pub method: Method,
    pub channels: usize,
    pub sample_format: SampleFormat,
    /// 滤波器长度（抽头数）
    /// 奇数为对称核；偶数没有中心抽头，由 init 偏移半个样本
    pub filter_length: usize,
    pub input_rate: f64,
    pub output_rate: f64,
    pub layout: Layout,
    /// 16-bit 输出前是否加 TPDF dither
    pub dither: bool,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            channels: 2,
            sample_format: SampleFormat::Float32,
            filter_length: 16,
            input_rate: 44100.0,
            output_rate: 48000.0,
            layout: Layout::Interleaved,
            dither: false,
        }
    }
}

impl ResamplerConfig {
    /// 检查构造参数
    pub fn validate(&self) -> Result<(), ResampleError> {
        if self.channels < 1 {
            return Err(ResampleError::InvalidConfig(
                "channels must be at least 1".to_string(),
            ));
        }
        if !(self.input_rate > 0.0 && self.input_rate.is_finite()) {
            return Err(ResampleError::InvalidConfig(format!(
                "input rate must be positive, got {}",
                self.input_rate
            )));
        }
        if !(self.output_rate > 0.0 && self.output_rate.is_finite()) {
            return Err(ResampleError::InvalidConfig(format!(
                "output rate must be positive, got {}",
                self.output_rate
            )));
        }
        if self.filter_length < 1 {
            return Err(ResampleError::InvalidConfig(
                "filter length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// 一个块中每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels
    }

    /// 低通截止比例：取两个采样率中较低的那个
    #[inline]
    pub fn cutoff(&self) -> f64 {
        (self.output_rate / self.input_rate).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ResamplerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bytes_per_frame(), 8);
        assert_eq!(config.cutoff(), 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        let bad = [
            ResamplerConfig { channels: 0, ..Default::default() },
            ResamplerConfig { input_rate: 0.0, ..Default::default() },
            ResamplerConfig { output_rate: -48000.0, ..Default::default() },
            ResamplerConfig { output_rate: f64::NAN, ..Default::default() },
            ResamplerConfig { filter_length: 0, ..Default::default() },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ResampleError::InvalidConfig(_))),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_cutoff_follows_lower_rate() {
        let config = ResamplerConfig {
            input_rate: 48000.0,
            output_rate: 32000.0,
            ..Default::default()
        };
        assert!((config.cutoff() - 2.0 / 3.0).abs() < 1e-15);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("sinc".parse::<Method>().unwrap(), Method::SincFast);
        assert_eq!("Sinc-Slow".parse::<Method>().unwrap(), Method::SincSlow);
        assert_eq!("bilinear".parse::<Method>().unwrap(), Method::Linear);
        assert!("cubic".parse::<Method>().is_err());
        assert_eq!(Method::SincFast.to_string(), "sinc");
    }
}
