//! 重采样统计模块
//!
//! 所有计数器都是 lock-free 的：重采样在处理线程上累加，
//! 宿主可以在任意线程通过 `Arc` 读取

use std::sync::atomic::{AtomicU64, Ordering};

/// 重采样诊断计数器
pub struct ResampleStats {
    blocks: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,

    // 16-bit 输出时被钳位的样本数
    clipped_samples: AtomicU64,

    // 内部簿记与预期不符的次数（ArithmeticDrift）
    drift_events: AtomicU64,
}

impl ResampleStats {
    pub fn new() -> Self {
        Self {
            blocks: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            clipped_samples: AtomicU64::new(0),
            drift_events: AtomicU64::new(0),
        }
    }

    /// 记录一次成功的 scale 调用
    #[inline]
    pub fn record_block(&self, frames_in: usize, frames_out: usize) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.frames_in.fetch_add(frames_in as u64, Ordering::Relaxed);
        self.frames_out.fetch_add(frames_out as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_clipped(&self, samples: usize) {
        if samples > 0 {
            self.clipped_samples
                .fetch_add(samples as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_drift(&self, events: u64) {
        if events > 0 {
            self.drift_events.fetch_add(events, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn clipped_samples(&self) -> u64 {
        self.clipped_samples.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn drift_events(&self) -> u64 {
        self.drift_events.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        StatsReport {
            blocks: self.blocks(),
            frames_in: self.frames_in(),
            frames_out: self.frames_out(),
            clipped_samples: self.clipped_samples(),
            drift_events: self.drift_events(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.blocks.store(0, Ordering::Relaxed);
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_out.store(0, Ordering::Relaxed);
        self.clipped_samples.store(0, Ordering::Relaxed);
        self.drift_events.store(0, Ordering::Relaxed);
    }
}

impl Default for ResampleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    pub blocks: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub clipped_samples: u64,
    pub drift_events: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Resample Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Blocks: {}", self.blocks)?;
        writeln!(f, "Frames in: {}", self.frames_in)?;
        writeln!(f, "Frames out: {}", self.frames_out)?;

        let ratio = if self.frames_in > 0 {
            self.frames_out as f64 / self.frames_in as f64
        } else {
            0.0
        };
        writeln!(f, "Effective ratio: {:.6}", ratio)?;
        writeln!(f)?;

        writeln!(f, "Clipped samples: {}", self.clipped_samples)?;
        writeln!(f, "Drift events: {}", self.drift_events)?;

        Ok(())
    }
}
