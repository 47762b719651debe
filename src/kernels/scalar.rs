//! Portable reference kernels
//!
//! Every primitive in the dispatch table has its reference implementation
//! here. SIMD tiers must match these results exactly for integer code paths
//! and within the documented tolerance for float paths; SIMD tail elements
//! run the same scalar epilogue.

use half::bf16;

use crate::quant::format::{fp8_to_f32, Fp8Kind, Scales};

/// Sign interpretation for packed 4-bit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NibblePolicy {
    /// Nibbles are two's-complement, already in [-8, 7]
    Clip,
    /// Nibbles are biased unsigned; subtract 8 after unpacking
    FullRange,
}

/// Rotary embedding layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeMode {
    /// Rotate adjacent pairs (2i, 2i+1)
    Interleaved,
    /// Rotate split halves (i, i + head_dim/2)
    Split,
}

/// Borrowed integer code storage, 8-bit or packed 4-bit
#[derive(Debug, Clone, Copy)]
pub enum IntCodes<'a> {
    I8(&'a [i8]),
    I4 {
        packed: &'a [u8],
        policy: NibblePolicy,
    },
}

impl<'a> IntCodes<'a> {
    #[inline]
    pub fn get(&self, idx: usize) -> i32 {
        match self {
            IntCodes::I8(codes) => codes[idx] as i32,
            IntCodes::I4 { packed, policy } => {
                let byte = packed[idx / 2];
                let nib = if idx % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                match policy {
                    NibblePolicy::Clip => ((nib as i8) << 4 >> 4) as i32,
                    NibblePolicy::FullRange => nib as i32 - 8,
                }
            }
        }
    }
}

/// Scale/zero-point block index for row `r` of a k-block layout.
///
/// `group == 0` means per-column blocks (the whole reduction dim is one
/// block). `k_offset` is the starting row inside the matrix, so a kernel
/// working on a tile finds its first-block scale at `k_offset / group`.
#[inline]
pub fn block_index(r: usize, k_offset: usize, group: usize, pack_row: usize) -> usize {
    if group == 0 {
        0
    } else {
        (k_offset + r) / (group * pack_row)
    }
}

/// Unpack `dst.len()` 4-bit codes from `dst.len()/2` bytes into signed bytes.
pub fn unpack_i4(src: &[u8], dst: &mut [i8], policy: NibblePolicy) {
    debug_assert_eq!(dst.len(), src.len() * 2);
    for (i, &byte) in src.iter().enumerate() {
        let (lo, hi) = match policy {
            NibblePolicy::Clip => (
                ((byte & 0x0f) as i8) << 4 >> 4,
                ((byte >> 4) as i8) << 4 >> 4,
            ),
            NibblePolicy::FullRange => ((byte & 0x0f) as i8 - 8, (byte >> 4) as i8 - 8),
        };
        dst[i * 2] = lo;
        dst[i * 2 + 1] = hi;
    }
}

/// Dequantize a [rows, cols] integer k-block tile into f32, row-major with
/// destination stride `ld_dst`.
#[allow(clippy::too_many_arguments)]
pub fn dequant_int(
    codes: IntCodes<'_>,
    scales: Scales<'_>,
    zero_points: Option<&[i8]>,
    dst: &mut [f32],
    rows: usize,
    cols: usize,
    ld_dst: usize,
    group: usize,
    pack_row: usize,
    k_offset: usize,
) {
    for r in 0..rows {
        let b = block_index(r, k_offset, group, pack_row);
        for j in 0..cols {
            let c = codes.get(r * cols + j);
            let zp = zero_points.map_or(0, |z| z[b * cols + j] as i32);
            dst[r * ld_dst + j] = (c - zp) as f32 * scales.get(b * cols + j);
        }
    }
}

/// Dequantize a [rows, cols] 4-bit lookup tile (FP4 or NF4) into f32.
#[allow(clippy::too_many_arguments)]
pub fn dequant_lut4(
    packed: &[u8],
    lut: &[f32; 16],
    scales: Scales<'_>,
    dst: &mut [f32],
    rows: usize,
    cols: usize,
    ld_dst: usize,
    group: usize,
    pack_row: usize,
    k_offset: usize,
) {
    for r in 0..rows {
        let b = block_index(r, k_offset, group, pack_row);
        for j in 0..cols {
            let idx = r * cols + j;
            let byte = packed[idx / 2];
            let code = if idx % 2 == 0 { byte & 0x0f } else { byte >> 4 };
            dst[r * ld_dst + j] = lut[code as usize] * scales.get(b * cols + j);
        }
    }
}

/// Dequantize a [rows, cols] 8-bit micro-float tile into f32.
///
/// When the scale buffer is itself a micro-float its exponent contribution
/// folds into the reconstructed value through the product; see
/// [`Scales::get`].
#[allow(clippy::too_many_arguments)]
pub fn dequant_fp8(
    codes: &[u8],
    kind: Fp8Kind,
    scales: Scales<'_>,
    dst: &mut [f32],
    rows: usize,
    cols: usize,
    ld_dst: usize,
    group: usize,
    pack_row: usize,
    k_offset: usize,
) {
    for r in 0..rows {
        let b = block_index(r, k_offset, group, pack_row);
        for j in 0..cols {
            let v = fp8_to_f32(codes[r * cols + j], kind);
            dst[r * ld_dst + j] = v * scales.get(b * cols + j);
        }
    }
}

/// Per-row affine quantization of f32 into u8 with per-block scale and
/// zero-point. `sums`, when present, receives the per-block code sums used
/// later for zero-point bias correction.
///
/// Rounds to nearest, ties away from zero, clamped into [0, 255].
pub fn quantize_row_u8(
    src: &[f32],
    group: usize,
    codes: &mut [u8],
    scales: &mut [f32],
    zero_points: &mut [u8],
    mut sums: Option<&mut [i32]>,
) {
    let group = if group == 0 { src.len() } else { group };
    let n_blocks = src.len().div_ceil(group);
    debug_assert!(scales.len() >= n_blocks && zero_points.len() >= n_blocks);

    for b in 0..n_blocks {
        let lo = b * group;
        let hi = (lo + group).min(src.len());
        let chunk = &src[lo..hi];
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &x in chunk {
            min = min.min(x);
            max = max.max(x);
        }
        min = min.min(0.0);
        max = max.max(0.0);
        let range = max - min;
        let scale = if range > 0.0 { range / 255.0 } else { 1.0 };
        let zp = (-min / scale).round().clamp(0.0, 255.0) as u8;
        scales[b] = scale;
        zero_points[b] = zp;

        let mut block_sum = 0i32;
        for (i, &x) in chunk.iter().enumerate() {
            let q = (x / scale).round() + zp as f32;
            let code = q.clamp(0.0, 255.0) as u8;
            codes[lo + i] = code;
            block_sum += code as i32;
        }
        if let Some(s) = sums.as_deref_mut() {
            s[b] = block_sum;
        }
    }
}

/// Integer dot product for the mixed-precision path: u8 activations against
/// i8 weight codes, i32 accumulate.
pub fn dot_u8_i8(a: &[u8], b: &[i8]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = 0i32;
    for i in 0..a.len() {
        acc += a[i] as i32 * b[i] as i32;
    }
    acc
}

/// Remove the zero-point contributions from an asymmetric integer
/// accumulator over a depth-`k` reduction:
/// `acc - zp_a·Σb - zp_b·Σa + zp_a·zp_b·k`.
#[inline]
pub fn bias_correct(acc: i32, zp_a: i32, sum_a: i32, zp_b: i32, sum_b: i32, k: i32) -> i32 {
    acc - zp_a * sum_b - zp_b * sum_a + zp_a * zp_b * k
}

/// Per-block code sums over strips of `block_rows` rows, one sum per
/// (block, column). Feeds the Σb term of [`bias_correct`].
pub fn row_block_sums(codes: IntCodes<'_>, rows: usize, cols: usize, block_rows: usize, out: &mut [i32]) {
    let block_rows = if block_rows == 0 { rows } else { block_rows };
    let n_blocks = rows.div_ceil(block_rows);
    debug_assert!(out.len() >= n_blocks * cols);
    out[..n_blocks * cols].fill(0);
    for r in 0..rows {
        let b = r / block_rows;
        for j in 0..cols {
            out[b * cols + j] += codes.get(r * cols + j);
        }
    }
}

/// C ← α·A·Bᵀ + β·C with A [m,k] (stride lda), B [n,k] (stride ldb),
/// C [m,n] (stride ldc), all row-major.
#[allow(clippy::too_many_arguments)]
pub fn gemm_f32(
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
) {
    for i in 0..m {
        for j in 0..n {
            let dot = vec_dot(&a[i * lda..i * lda + k], &b[j * ldb..j * ldb + k]);
            let prev = c[i * ldc + j];
            c[i * ldc + j] = alpha * dot + beta * prev;
        }
    }
}

pub fn vec_dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = 0.0f32;
    for i in 0..a.len() {
        acc += a[i] * b[i];
    }
    acc
}

/// y ← y + α·x
pub fn vec_axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    for i in 0..x.len() {
        y[i] += alpha * x[i];
    }
}

/// out ← α·a + β·b
pub fn vec_alpha_beta(alpha: f32, a: &[f32], beta: f32, b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && b.len() == out.len());
    for i in 0..out.len() {
        out[i] = alpha * a[i] + beta * b[i];
    }
}

pub fn vec_add_assign(y: &mut [f32], x: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    for i in 0..y.len() {
        y[i] += x[i];
    }
}

pub fn vec_mul_assign(y: &mut [f32], x: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    for i in 0..y.len() {
        y[i] *= x[i];
    }
}

pub fn vec_clip(x: &mut [f32], lo: f32, hi: f32) {
    for v in x.iter_mut() {
        *v = v.clamp(lo, hi);
    }
}

pub fn vec_silu(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v /= 1.0 + (-*v).exp();
    }
}

/// tanh-form GELU
pub fn vec_gelu(x: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    for v in x.iter_mut() {
        let u = *v;
        *v = 0.5 * u * (1.0 + (SQRT_2_OVER_PI * (u + 0.044715 * u * u * u)).tanh());
    }
}

/// Numerically stable in-place softmax.
///
/// A +∞ entry collapses the row to one-hot at the first such entry; a row of
/// all −∞ resolves to uniform.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let mut max = f32::NEG_INFINITY;
    let mut argmax = 0;
    for (i, &v) in x.iter().enumerate() {
        if v > max {
            max = v;
            argmax = i;
        }
    }
    if max == f32::INFINITY {
        x.fill(0.0);
        x[argmax] = 1.0;
        return;
    }
    if max == f32::NEG_INFINITY {
        let u = 1.0 / x.len() as f32;
        x.fill(u);
        return;
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv;
    }
}

/// In-place layer normalization with optional affine parameters.
pub fn layernorm(x: &mut [f32], gamma: Option<&[f32]>, beta: Option<&[f32]>, eps: f32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let mean = x.iter().sum::<f32>() / n as f32;
    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
    let inv = 1.0 / (var + eps).sqrt();
    for (i, v) in x.iter_mut().enumerate() {
        let mut y = (*v - mean) * inv;
        if let Some(g) = gamma {
            y *= g[i];
        }
        if let Some(b) = beta {
            y += b[i];
        }
        *v = y;
    }
}

/// RMS-norm variant: omits the mean.
pub fn rmsnorm(x: &mut [f32], gamma: Option<&[f32]>, eps: f32) {
    let n = x.len();
    if n == 0 {
        return;
    }
    let ms = x.iter().map(|v| v * v).sum::<f32>() / n as f32;
    let inv = 1.0 / (ms + eps).sqrt();
    for (i, v) in x.iter_mut().enumerate() {
        let mut y = *v * inv;
        if let Some(g) = gamma {
            y *= g[i];
        }
        *v = y;
    }
}

/// Rotary position embedding over consecutive `head_dim` chunks of `x`,
/// rotating by angle `position · theta^(-2i/head_dim)` per frequency `i`.
pub fn rope(x: &mut [f32], head_dim: usize, position: f32, theta: f32, mode: RopeMode) {
    debug_assert!(head_dim % 2 == 0);
    debug_assert!(x.len() % head_dim == 0);
    let half = head_dim / 2;
    for head in x.chunks_mut(head_dim) {
        for i in 0..half {
            let freq = theta.powf(-2.0 * i as f32 / head_dim as f32);
            let angle = position * freq;
            let (sin, cos) = angle.sin_cos();
            let (a, b) = match mode {
                RopeMode::Interleaved => (2 * i, 2 * i + 1),
                RopeMode::Split => (i, i + half),
            };
            let x0 = head[a];
            let x1 = head[b];
            head[a] = x0 * cos - x1 * sin;
            head[b] = x0 * sin + x1 * cos;
        }
    }
}

pub fn reduce_max(x: &[f32]) -> f32 {
    x.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

pub fn reduce_min(x: &[f32]) -> f32 {
    x.iter().copied().fold(f32::INFINITY, f32::min)
}

pub fn reduce_sum(x: &[f32]) -> f32 {
    x.iter().sum()
}

pub fn vec_f32_to_bf16(src: &[f32], dst: &mut [bf16]) {
    debug_assert_eq!(src.len(), dst.len());
    for i in 0..src.len() {
        dst[i] = bf16::from_f32(src[i]);
    }
}

pub fn vec_bf16_to_f32(src: &[bf16], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    for i in 0..src.len() {
        dst[i] = src[i].to_f32();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_clip_sign_extends() {
        // 0xf0 -> lo nibble 0 (0), hi nibble 0xf (-1)
        let mut dst = [0i8; 4];
        unpack_i4(&[0xf0, 0x87], &mut dst, NibblePolicy::Clip);
        assert_eq!(dst, [0, -1, 7, -8]);
    }

    #[test]
    fn unpack_full_range_rebias() {
        let mut dst = [0i8; 4];
        unpack_i4(&[0xf0, 0x08], &mut dst, NibblePolicy::FullRange);
        assert_eq!(dst, [-8, 7, 0, -8]);
    }

    #[test]
    fn dequant_int_asym() {
        // 2x2 tile, one block, zp = 1, scale = 0.5
        let codes = [3i8, -2, 0, 5];
        let scales = [0.5f32; 2];
        let zps = [1i8; 2];
        let mut dst = [0.0f32; 4];
        dequant_int(
            IntCodes::I8(&codes),
            Scales::F32(&scales),
            Some(&zps),
            &mut dst,
            2,
            2,
            2,
            2,
            1,
            0,
        );
        assert_eq!(dst, [1.0, -1.5, -0.5, 2.0]);
    }

    #[test]
    fn dequant_int_respects_k_offset() {
        // Two blocks of 2 rows; starting at k_offset 2 selects block 1
        let codes = [1i8, 1];
        let scales = [1.0f32, 2.0];
        let mut dst = [0.0f32; 2];
        dequant_int(
            IntCodes::I8(&codes),
            Scales::F32(&scales),
            None,
            &mut dst,
            2,
            1,
            1,
            2,
            1,
            2,
        );
        assert_eq!(dst, [2.0, 2.0]);
    }

    #[test]
    fn quantize_row_u8_envelope() {
        let src: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut codes = vec![0u8; 64];
        let mut scales = vec![0.0f32; 2];
        let mut zps = vec![0u8; 2];
        let mut sums = vec![0i32; 2];
        quantize_row_u8(&src, 32, &mut codes, &mut scales, &mut zps, Some(&mut sums));
        for b in 0..2 {
            for i in 0..32 {
                let deq = (codes[b * 32 + i] as i32 - zps[b] as i32) as f32 * scales[b];
                assert!((deq - src[b * 32 + i]).abs() < 1.5 * scales[b]);
            }
            assert_eq!(
                sums[b],
                codes[b * 32..(b + 1) * 32].iter().map(|&c| c as i32).sum::<i32>()
            );
        }
    }

    #[test]
    fn bias_correction_recovers_asym_product() {
        // Small exact case: a = codes - zp_a, b = codes - zp_b
        let a_codes = [130u8, 120, 128, 140];
        let b_codes = [3i8, -1, 0, 2];
        let zp_a = 128;
        let zp_b = 1;
        let acc = a_codes
            .iter()
            .zip(b_codes.iter())
            .map(|(&a, &b)| a as i32 * b as i32)
            .sum::<i32>();
        let sum_a: i32 = a_codes.iter().map(|&a| a as i32).sum();
        let sum_b: i32 = b_codes.iter().map(|&b| b as i32).sum();
        let corrected = bias_correct(acc, zp_a, sum_a, zp_b, sum_b, 4);
        let expected: i32 = a_codes
            .iter()
            .zip(b_codes.iter())
            .map(|(&a, &b)| (a as i32 - zp_a) * (b as i32 - zp_b))
            .sum();
        assert_eq!(corrected, expected);
    }

    #[test]
    fn softmax_handles_overflow_as_one_hot() {
        let mut x = [0.0, f32::INFINITY, 1.0];
        softmax(&mut x);
        assert_eq!(x, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut x = [0.1, 2.0, -3.0, 0.5];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rope_round_trips() {
        let orig: Vec<f32> = (0..8).map(|i| i as f32 * 0.25 - 1.0).collect();
        let mut x = orig.clone();
        rope(&mut x, 8, 3.0, 10000.0, RopeMode::Split);
        rope(&mut x, 8, -3.0, 10000.0, RopeMode::Split);
        for (a, b) in x.iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn rmsnorm_unit_output() {
        let mut x = vec![3.0f32; 16];
        rmsnorm(&mut x, None, 1e-6);
        for v in x {
            assert!((v - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn gemm_alpha_beta() {
        // C <- 2*A*B^T + 0.5*C with 2x3 A, 2x3 B (so C is 2x2)
        let a = [1.0f32, 0.0, 2.0, -1.0, 1.0, 0.0];
        let b = [0.5f32, 1.0, 0.0, 1.0, 1.0, 1.0];
        let mut c = [1.0f32; 4];
        gemm_f32(&a, 3, &b, 3, &mut c, 2, 2, 2, 3, 2.0, 0.5);
        // row0: dot([1,0,2],[0.5,1,0])=0.5 ; dot([1,0,2],[1,1,1])=3
        // row1: dot([-1,1,0],[0.5,1,0])=0.5 ; dot([-1,1,0],[1,1,1])=0
        assert_eq!(c, [1.5, 6.5, 1.5, 0.5]);
    }

    #[test]
    fn gemm_respects_leading_dims() {
        // A rows padded to stride 4, only first 2 columns used
        let a = [1.0f32, 2.0, 9.0, 9.0, 3.0, 4.0, 9.0, 9.0];
        let b = [1.0f32, 1.0];
        let mut c = [0.0f32; 2];
        gemm_f32(&a, 4, &b, 2, &mut c, 1, 2, 1, 2, 1.0, 0.0);
        assert_eq!(c, [3.0, 7.0]);
    }

    #[test]
    fn elementwise_combinations() {
        let a = [1.0f32, -2.0, 3.0];
        let b = [0.5f32, 0.5, 0.5];
        let mut out = [0.0f32; 3];
        vec_alpha_beta(2.0, &a, -1.0, &b, &mut out);
        assert_eq!(out, [1.5, -4.5, 5.5]);

        let mut y = [1.0f32, 1.0, 1.0];
        vec_axpy(3.0, &b, &mut y);
        assert_eq!(y, [2.5, 2.5, 2.5]);

        let mut x = [-5.0f32, 0.2, 7.0];
        vec_clip(&mut x, -1.0, 1.0);
        assert_eq!(x, [-1.0, 0.2, 1.0]);
    }

    #[test]
    fn reductions() {
        let x = [0.5f32, -2.0, 3.0, 1.0];
        assert_eq!(reduce_max(&x), 3.0);
        assert_eq!(reduce_min(&x), -2.0);
        assert_eq!(reduce_sum(&x), 2.5);
    }

    #[test]
    fn silu_and_gelu_fixed_points() {
        let mut x = [0.0f32, 10.0];
        vec_silu(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 10.0).abs() < 1e-2);

        let mut x = [0.0f32, 10.0, -10.0];
        vec_gelu(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 10.0).abs() < 1e-2);
        assert!(x[2].abs() < 1e-2);
    }

    #[test]
    fn layernorm_centers_and_scales() {
        let mut x = vec![1.0f32, 2.0, 3.0, 4.0];
        layernorm(&mut x, None, None, 1e-6);
        let mean: f32 = x.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        let var: f32 = x.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn integer_dot_and_block_sums() {
        let a = [100u8, 200, 0, 50];
        let b = [1i8, -1, 5, 2];
        assert_eq!(dot_u8_i8(&a, &b), 100 - 200 + 0 + 100);

        // 6 elements as [3, 2] with 2-row blocks: a full block and a tail
        let codes = [1i8, 2, 3, 4, 5, 6];
        let mut sums = [0i32; 4];
        row_block_sums(IntCodes::I8(&codes[..]), 3, 2, 2, &mut sums);
        assert_eq!(sums, [4, 6, 5, 6]);
    }

    #[test]
    fn bf16_casts_round_trip() {
        let src = [1.0f32, -0.5, 3.1415926];
        let mut half = [bf16::ZERO; 3];
        let mut back = [0.0f32; 3];
        vec_f32_to_bf16(&src, &mut half);
        vec_bf16_to_f32(&half, &mut back);
        for (a, b) in src.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }
}
