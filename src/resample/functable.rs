//! 预计算函数表
//!
//! 把解析函数（sinc × 窗函数）及其导数按固定间隔采样，
//! 查表时用三次 Hermite 插值还原任意位置的值。
//!
//! 表建好之后只读，可以通过 `Arc` 在多个重采样器之间共享

use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use super::error::ResampleError;

/// 默认过采样倍数：每个输入样本间隔 4 个表格点
pub const DEFAULT_OVERSAMPLE: usize = 4;

/// 解析函数及其导数
#[derive(Clone, Copy)]
pub struct AnalyticFn {
    pub value: fn(f64) -> f64,
    pub derivative: fn(f64) -> f64,
}

/// sinc(x) = sin(x) / x
pub const SINC: AnalyticFn = AnalyticFn {
    value: sinc,
    derivative: dsinc,
};

/// 标准窗 (1 - u²)²，支撑区间 (-1, 1)
pub const WINDOW_STD: AnalyticFn = AnalyticFn {
    value: window_std,
    derivative: dwindow_std,
};

/// sinc(0) 取极限值 1
pub fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else if x.abs() < 1e-6 {
        1.0 - x * x / 6.0
    } else {
        x.sin() / x
    }
}

pub fn dsinc(x: f64) -> f64 {
    if x.abs() < 1e-6 {
        -x / 3.0
    } else {
        (x.cos() - x.sin() / x) / x
    }
}

pub fn window_std(u: f64) -> f64 {
    if u.abs() < 1.0 {
        let a = 1.0 - u * u;
        a * a
    } else {
        0.0
    }
}

pub fn dwindow_std(u: f64) -> f64 {
    if u.abs() < 1.0 {
        -4.0 * u * (1.0 - u * u)
    } else {
        0.0
    }
}

/// 加窗 sinc 表的身份：同一 key 的表可以互换
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SincKey {
    pub filter_length: usize,
    pub oversample: usize,
    cutoff_bits: u64,
}

impl SincKey {
    pub fn new(filter_length: usize, oversample: usize, cutoff: f64) -> Self {
        Self {
            filter_length,
            oversample,
            cutoff_bits: cutoff.to_bits(),
        }
    }

    pub fn cutoff(&self) -> f64 {
        f64::from_bits(self.cutoff_bits)
    }
}

/// 三次 Hermite 基函数在某个小数位置上的四个系数
#[derive(Clone, Copy, Debug)]
struct HermiteBasis {
    f0: f64,
    f1: f64,
    w0: f64,
    w1: f64,
}

/// 均匀采样的函数表
pub struct FunctionTable {
    start: f64,
    offset: f64,
    len: usize,
    fx: Vec<f64>,
    fdx: Vec<f64>,
    key: Option<SincKey>,
}

impl FunctionTable {
    /// 采样 `kernel(x·scale) · window(x·window_scale)` 及其导数
    ///
    /// 表格点 x = start + offset·i，i ∈ [0, len]，共 len+1 个点。
    /// 导数按乘积法则合成：f' = f1·f2' + f1'·f2
    pub fn build(
        len: usize,
        offset: f64,
        start: f64,
        kernel: AnalyticFn,
        scale: f64,
        window: Option<(AnalyticFn, f64)>,
    ) -> Result<Self, ResampleError> {
        if len == 0 {
            return Err(ResampleError::InvalidConfig(
                "function table needs at least one interval".to_string(),
            ));
        }
        if !(offset > 0.0 && offset.is_finite()) || !start.is_finite() || !scale.is_finite() {
            return Err(ResampleError::InvalidConfig(format!(
                "function table grid is not finite: start={} offset={} scale={}",
                start, offset, scale
            )));
        }

        let mut fx = Vec::with_capacity(len + 1);
        let mut fdx = Vec::with_capacity(len + 1);

        for i in 0..=len {
            let x = start + offset * i as f64;

            let k = (kernel.value)(x * scale);
            let dk = (kernel.derivative)(x * scale) * scale;

            match window {
                Some((w, w_scale)) => {
                    let wv = (w.value)(x * w_scale);
                    let dwv = (w.derivative)(x * w_scale) * w_scale;
                    fx.push(k * wv);
                    fdx.push(k * dwv + dk * wv);
                }
                None => {
                    fx.push(k);
                    fdx.push(dk);
                }
            }
        }

        Ok(Self {
            start,
            offset,
            len,
            fx,
            fdx,
            key: None,
        })
    }

    /// 构建重采样用的加窗 sinc 表
    ///
    /// 自变量单位是输入样本间距。窗半宽 W = filter_length / 2，
    /// 表覆盖 [-(W+1), W+1]，两端各留一个样本的余量
    pub fn windowed_sinc(
        filter_length: usize,
        oversample: usize,
        cutoff: f64,
    ) -> Result<Self, ResampleError> {
        if filter_length == 0 || oversample == 0 {
            return Err(ResampleError::InvalidConfig(format!(
                "windowed sinc needs filter_length >= 1 and oversample >= 1 (got {} / {})",
                filter_length, oversample
            )));
        }
        if !(cutoff > 0.0 && cutoff <= 1.0) {
            return Err(ResampleError::InvalidConfig(format!(
                "cutoff must be in (0, 1], got {}",
                cutoff
            )));
        }

        let half_width = filter_length as f64 * 0.5;
        let len = (filter_length + 2) * oversample;
        let offset = 1.0 / oversample as f64;
        let start = -(half_width + 1.0);

        let mut table = Self::build(
            len,
            offset,
            start,
            SINC,
            PI * cutoff,
            Some((WINDOW_STD, 1.0 / half_width)),
        )?;
        table.key = Some(SincKey::new(filter_length, oversample, cutoff));
        Ok(table)
    }

    #[inline]
    pub fn start(&self) -> f64 {
        self.start
    }

    #[inline]
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// 表格区间数（表格点数为 len + 1）
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// 表覆盖的最大自变量
    #[inline]
    pub fn end(&self) -> f64 {
        self.start + self.offset * self.len as f64
    }

    pub fn key(&self) -> Option<SincKey> {
        self.key
    }

    /// 表格点上的函数值
    #[cfg(test)]
    pub fn values(&self) -> &[f64] {
        &self.fx
    }

    /// 表格点上的导数值
    #[cfg(test)]
    pub fn derivatives(&self) -> &[f64] {
        &self.fdx
    }

    /// 用三次 Hermite 插值求 x 处的值
    ///
    /// x 必须落在 [start, end] 内，越界返回 `OutOfRange`（不做钳位）
    pub fn eval(&self, x: f64) -> Result<f64, ResampleError> {
        let (i, t) = self.locate(x)?;
        let basis = self.basis(t);
        Ok(self.weight(i, &basis))
    }

    /// 双声道融合 FIR
    ///
    /// 第一个抽头位于 x0，之后每个抽头前进 `stride` 个表格点。
    /// 所有抽头共用同一个小数位置，所以 Hermite 系数只算一次；
    /// 每个抽头的权重与对该点单独调用 `eval` 逐位相同。
    ///
    /// `data` 从第一个抽头帧的第 0 个声道开始，帧间距为 `frame_stride`
    pub fn fused_fir_2ch(
        &self,
        x0: f64,
        stride: usize,
        data: &[f64],
        frame_stride: usize,
        tap_count: usize,
    ) -> Result<(f64, f64), ResampleError> {
        if tap_count == 0 {
            return Ok((0.0, 0.0));
        }
        let (i0, basis) = self.prepare_taps(x0, stride, tap_count)?;

        let mut c0 = 0.0;
        let mut c1 = 0.0;
        for (tap, frame) in data.chunks(frame_stride).take(tap_count).enumerate() {
            let w = self.weight(i0 + tap * stride, &basis);
            c0 += frame[0] * w;
            c1 += frame[1] * w;
        }
        Ok((c0, c1))
    }

    /// 单声道版本，用于奇数声道数的最后一个声道
    pub fn fir_1ch(
        &self,
        x0: f64,
        stride: usize,
        data: &[f64],
        frame_stride: usize,
        tap_count: usize,
    ) -> Result<f64, ResampleError> {
        if tap_count == 0 {
            return Ok(0.0);
        }
        let (i0, basis) = self.prepare_taps(x0, stride, tap_count)?;

        let mut c0 = 0.0;
        for (tap, frame) in data.chunks(frame_stride).take(tap_count).enumerate() {
            c0 += frame[0] * self.weight(i0 + tap * stride, &basis);
        }
        Ok(c0)
    }

    /// 同一组抽头的权重之和（直流增益）
    pub fn weight_sum(
        &self,
        x0: f64,
        stride: usize,
        tap_count: usize,
    ) -> Result<f64, ResampleError> {
        if tap_count == 0 {
            return Ok(0.0);
        }
        let (i0, basis) = self.prepare_taps(x0, stride, tap_count)?;
        Ok((0..tap_count)
            .map(|tap| self.weight(i0 + tap * stride, &basis))
            .sum())
    }

    // ========================================================================
    // 内部
    // ========================================================================

    fn out_of_range(&self, x: f64) -> ResampleError {
        ResampleError::OutOfRange {
            x,
            start: self.start,
            end: self.end(),
        }
    }

    /// 定位所在区间 i 和区间内位置 t ∈ [0, 1]
    #[inline]
    fn locate(&self, x: f64) -> Result<(usize, f64), ResampleError> {
        let u = (x - self.start) / self.offset;
        if !(u >= 0.0 && u <= self.len as f64) {
            return Err(self.out_of_range(x));
        }
        let i = u.floor() as usize;
        if i >= self.len {
            // 右端点
            return Ok((self.len - 1, 1.0));
        }
        Ok((i, u - i as f64))
    }

    /// 检查整组抽头都在表内，返回第一个抽头的区间和共用的基函数
    #[inline]
    fn prepare_taps(
        &self,
        x0: f64,
        stride: usize,
        tap_count: usize,
    ) -> Result<(usize, HermiteBasis), ResampleError> {
        let (i0, t) = self.locate(x0)?;
        let last = i0 + (tap_count - 1) * stride;
        if last + 1 > self.len {
            let x_last = x0 + ((tap_count - 1) * stride) as f64 * self.offset;
            return Err(self.out_of_range(x_last));
        }
        Ok((i0, self.basis(t)))
    }

    #[inline]
    fn basis(&self, t: f64) -> HermiteBasis {
        let t2 = t * t;
        let t3 = t2 * t;
        let f1 = 3.0 * t2 - 2.0 * t3;
        HermiteBasis {
            f0: 1.0 - f1,
            f1,
            w0: (t3 - 2.0 * t2 + t) * self.offset,
            w1: (t3 - t2) * self.offset,
        }
    }

    #[inline(always)]
    fn weight(&self, i: usize, b: &HermiteBasis) -> f64 {
        self.fx[i] * b.f0 + self.fx[i + 1] * b.f1 + self.fdx[i] * b.w0 + self.fdx[i + 1] * b.w1
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("start", &self.start)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("key", &self.key)
            .finish()
    }
}

// ============================================================================
// 进程级表缓存
// ============================================================================

/// 按 key 缓存的加窗 sinc 表
///
/// 只保存 `Weak` 引用：最后一个持有者释放后表也随之释放，
/// 下次请求时重新构建
static TABLE_CACHE: OnceLock<Mutex<HashMap<SincKey, Weak<FunctionTable>>>> = OnceLock::new();

/// 取得（必要时构建）共享的加窗 sinc 表
pub fn shared_sinc_table(
    filter_length: usize,
    oversample: usize,
    cutoff: f64,
) -> Result<Arc<FunctionTable>, ResampleError> {
    let key = SincKey::new(filter_length, oversample, cutoff);
    let cache = TABLE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut tables = cache.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(table) = tables.get(&key).and_then(Weak::upgrade) {
        return Ok(table);
    }

    let table = Arc::new(FunctionTable::windowed_sinc(filter_length, oversample, cutoff)?);
    tables.retain(|_, t| t.strong_count() > 0);
    tables.insert(key, Arc::downgrade(&table));

    log::debug!(
        "Built sinc table: {} taps x{} oversample, cutoff {:.6} ({} cached)",
        filter_length,
        oversample,
        cutoff,
        tables.len()
    );

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analytic(x: f64, cutoff: f64, half_width: f64) -> f64 {
        sinc(PI * cutoff * x) * window_std(x / half_width)
    }

    #[test]
    fn test_sinc_removable_singularity() {
        assert_eq!(sinc(0.0), 1.0);
        assert_eq!(dsinc(0.0), 0.0);
        assert!((sinc(1e-9) - 1.0).abs() < 1e-15);
        assert!(sinc(PI).abs() < 1e-15);
    }

    #[test]
    fn test_exact_at_grid_points() {
        let table = FunctionTable::windowed_sinc(16, 4, 1.0).unwrap();
        assert_eq!(table.start(), -9.0);
        assert_eq!(table.end(), 9.0);
        assert_eq!(table.values().len(), table.len() + 1);

        for i in 0..=table.len() {
            let x = table.start() + table.offset() * i as f64;
            assert_eq!(table.eval(x).unwrap(), table.values()[i], "grid point {}", i);
        }
        assert_eq!(table.eval(0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_interpolation_tracks_analytic_curve() {
        let cutoff = 0.75;
        let table = FunctionTable::windowed_sinc(16, 4, cutoff).unwrap();
        let mut x = -8.9;
        while x < 8.9 {
            let expected = analytic(x, cutoff, 8.0);
            let got = table.eval(x).unwrap();
            assert!(
                (got - expected).abs() < 1e-3,
                "x={} expected={} got={}",
                x,
                expected,
                got
            );
            x += 0.0371;
        }
    }

    #[test]
    fn test_derivative_by_product_rule() {
        // 无窗时导数就是 kernel 的导数
        let table = FunctionTable::build(8, 0.5, -2.0, SINC, 2.0, None).unwrap();
        for (i, &d) in table.derivatives().iter().enumerate() {
            let x = -2.0 + 0.5 * i as f64;
            assert!((d - dsinc(2.0 * x) * 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_out_of_range_is_reported() {
        let table = FunctionTable::windowed_sinc(8, 4, 1.0).unwrap();
        assert!(matches!(
            table.eval(table.start() - 0.01),
            Err(ResampleError::OutOfRange { .. })
        ));
        assert!(matches!(
            table.eval(table.end() + 0.01),
            Err(ResampleError::OutOfRange { .. })
        ));
        assert!(table.eval(table.end()).is_ok());

        let data = [0.0; 64];
        // 第一个抽头在表内，但最后一个越界
        assert!(matches!(
            table.fused_fir_2ch(0.0, 4, &data, 2, 8),
            Err(ResampleError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_fused_weights_match_eval() {
        let table = FunctionTable::windowed_sinc(16, 4, 1.0).unwrap();
        // 二进制精确的位置，保证 eval 算出的小数位置与融合路径一致
        let x0 = -8.40625;
        let taps = 16;
        let data: Vec<f64> = (0..taps * 2)
            .map(|i| ((i * 7919) % 113) as f64 - 56.0)
            .collect();

        let (c0, c1) = table.fused_fir_2ch(x0, 4, &data, 2, taps).unwrap();

        let mut r0 = 0.0;
        let mut r1 = 0.0;
        let mut gain = 0.0;
        for tap in 0..taps {
            let w = table.eval(x0 + tap as f64).unwrap();
            r0 += data[tap * 2] * w;
            r1 += data[tap * 2 + 1] * w;
            gain += w;
        }
        assert_eq!(c0, r0);
        assert_eq!(c1, r1);
        assert_eq!(table.weight_sum(x0, 4, taps).unwrap(), gain);

        let mono = table.fir_1ch(x0, 4, &data[1..], 2, taps).unwrap();
        assert_eq!(mono, r1);
    }

    #[test]
    fn test_unit_gain_at_integer_offsets() {
        let table = FunctionTable::windowed_sinc(15, 4, 1.0).unwrap();
        let gain = table.weight_sum(-7.0, 4, 15).unwrap();
        assert!((gain - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_build_rejects_bad_grid() {
        assert!(FunctionTable::build(0, 0.25, 0.0, SINC, 1.0, None).is_err());
        assert!(FunctionTable::build(4, 0.0, 0.0, SINC, 1.0, None).is_err());
        assert!(FunctionTable::windowed_sinc(16, 4, 1.5).is_err());
        assert!(FunctionTable::windowed_sinc(0, 4, 1.0).is_err());
    }

    #[test]
    fn test_shared_cache_reuses_tables() {
        let a = shared_sinc_table(24, 4, 0.5).unwrap();
        let b = shared_sinc_table(24, 4, 0.5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = shared_sinc_table(24, 4, 0.25).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.key().unwrap().cutoff(), 0.25);
    }
}
