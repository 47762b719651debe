//! Block-quantized weight container
//!
//! A [`QuantMatrix`] owns its layout metadata and either owns its code bytes
//! (fresh from the quantizer) or borrows them from the model mapping through
//! an `Arc`, which keeps the mapping alive for as long as any container
//! references it.

use std::sync::Arc;

use half::bf16;
use memmap2::Mmap;

use crate::kernels::{scalar, IntCodes, Kernels, NibblePolicy};
use crate::quant::format::{
    Fp8Kind, ScaleDType, Scales, TensorDType, WeightDType, FP4_E2M1_TABLE, NF4_TABLE,
};
use crate::utils::{EngineError, Result};

/// Code bytes, owned or borrowed from the model mapping
#[derive(Clone)]
pub enum DataRef {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl DataRef {
    pub fn bytes(&self) -> &[u8] {
        match self {
            DataRef::Owned(v) => v,
            DataRef::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataRef::Owned(v) => v.len(),
            DataRef::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DataRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataRef::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
            DataRef::Mapped { offset, len, .. } => write!(f, "Mapped({offset}+{len})"),
        }
    }
}

#[inline]
fn as_i8(bytes: &[u8]) -> &[i8] {
    // i8 and u8 share size and alignment
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const i8, bytes.len()) }
}

fn f32_from_le(bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.reserve(bytes.len() / 4);
    for c in bytes.chunks_exact(4) {
        out.push(f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
    }
}

/// Dense (unquantized) tensor backing: f32, f16 or bf16 little-endian bytes.
#[derive(Debug, Clone)]
pub struct DenseTensor {
    pub rows: usize,
    pub cols: usize,
    pub dtype: TensorDType,
    data: DataRef,
}

impl DenseTensor {
    pub fn new(rows: usize, cols: usize, dtype: TensorDType, data: DataRef) -> Result<Self> {
        let elem = match dtype {
            TensorDType::F32 => 4,
            TensorDType::F16 | TensorDType::Bf16 => 2,
            TensorDType::Quantized { .. } => {
                return Err(EngineError::Internal(
                    "dense tensor constructed with quantized dtype".into(),
                ))
            }
        };
        if data.len() != rows * cols * elem {
            return Err(EngineError::MalformedModel(format!(
                "dense tensor data size {} does not match {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            dtype,
            data,
        })
    }

    /// Copy row `r` into `dst` as f32.
    pub fn copy_row(&self, r: usize, dst: &mut [f32]) {
        debug_assert!(r < self.rows && dst.len() == self.cols);
        let bytes = self.data.bytes();
        match self.dtype {
            TensorDType::F32 => {
                let base = r * self.cols * 4;
                for (j, c) in bytes[base..base + self.cols * 4].chunks_exact(4).enumerate() {
                    dst[j] = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                }
            }
            TensorDType::F16 => {
                let base = r * self.cols * 2;
                for (j, c) in bytes[base..base + self.cols * 2].chunks_exact(2).enumerate() {
                    dst[j] = half::f16::from_le_bytes([c[0], c[1]]).to_f32();
                }
            }
            TensorDType::Bf16 => {
                let base = r * self.cols * 2;
                for (j, c) in bytes[base..base + self.cols * 2].chunks_exact(2).enumerate() {
                    dst[j] = bf16::from_le_bytes([c[0], c[1]]).to_f32();
                }
            }
            TensorDType::Quantized { .. } => unreachable!(),
        }
    }

    /// Whole tensor as an owned f32 vector.
    pub fn to_f32(&self) -> Vec<f32> {
        let mut out = Vec::new();
        match self.dtype {
            TensorDType::F32 => f32_from_le(self.data.bytes(), &mut out),
            _ => {
                out = vec![0.0; self.rows * self.cols];
                let mut row = vec![0.0f32; self.cols];
                for r in 0..self.rows {
                    self.copy_row(r, &mut row);
                    out[r * self.cols..(r + 1) * self.cols].copy_from_slice(&row);
                }
            }
        }
        out
    }
}

/// Number of scale rows for a k-block layout.
pub fn n_scale_blocks(rows: usize, group_size: usize, pack_row: usize) -> usize {
    if group_size == 0 {
        1
    } else {
        rows.div_ceil(group_size * pack_row)
    }
}

/// Block-quantized [rows, cols] weight matrix.
///
/// Codes are row-major over the reduction dimension (rows); scales and
/// optional zero-points are [n_blocks, cols].
#[derive(Debug, Clone)]
pub struct QuantMatrix {
    pub rows: usize,
    pub cols: usize,
    pub weight: WeightDType,
    pub scale_dtype: ScaleDType,
    pub group_size: usize,
    pub pack_row: usize,
    codes: DataRef,
    scales: DataRef,
    zero_points: Option<DataRef>,
}

impl QuantMatrix {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rows: usize,
        cols: usize,
        weight: WeightDType,
        scale_dtype: ScaleDType,
        group_size: usize,
        pack_row: usize,
        codes: DataRef,
        scales: DataRef,
        zero_points: Option<DataRef>,
    ) -> Result<Self> {
        if !matches!(pack_row, 1 | 2 | 4) {
            return Err(EngineError::MalformedModel(format!(
                "pack_row {pack_row} not in {{1,2,4}}"
            )));
        }
        let n_codes = rows * cols;
        let want_code_bytes = match weight.code_bits() {
            4 => n_codes.div_ceil(2),
            _ => n_codes,
        };
        if codes.len() != want_code_bytes {
            return Err(EngineError::MalformedModel(format!(
                "code buffer {} bytes, expected {want_code_bytes} for {rows}x{cols} {:?}",
                codes.len(),
                weight
            )));
        }
        let n_blocks = n_scale_blocks(rows, group_size, pack_row);
        if scales.len() != n_blocks * cols * scale_dtype.size_bytes() {
            return Err(EngineError::MalformedModel(format!(
                "scale buffer {} bytes, expected {} blocks x {cols} cols",
                scales.len(),
                n_blocks
            )));
        }
        if zero_points.is_some() && !weight.is_integer() {
            return Err(EngineError::MalformedModel(
                "zero points are only valid for integer weights".into(),
            ));
        }
        if let Some(zp) = &zero_points {
            if zp.len() != n_blocks * cols {
                return Err(EngineError::MalformedModel(format!(
                    "zero-point buffer {} bytes, expected {}",
                    zp.len(),
                    n_blocks * cols
                )));
            }
            if weight == WeightDType::Int4 {
                if let Some(bad) = as_i8(zp.bytes()).iter().find(|z| !(-8..=7).contains(*z)) {
                    return Err(EngineError::MalformedModel(format!(
                        "int4 zero-point {bad} outside [-8, 7]"
                    )));
                }
            }
        }
        Ok(Self {
            rows,
            cols,
            weight,
            scale_dtype,
            group_size,
            pack_row,
            codes,
            scales,
            zero_points,
        })
    }

    pub fn dtype(&self) -> TensorDType {
        TensorDType::Quantized {
            weight: self.weight,
            scale: self.scale_dtype,
            has_zero_points: self.zero_points.is_some(),
            group_size: self.group_size,
            pack_row: self.pack_row,
        }
    }

    pub fn code_bytes(&self) -> &[u8] {
        self.codes.bytes()
    }

    pub fn scale_bytes(&self) -> &[u8] {
        self.scales.bytes()
    }

    pub fn zero_point_bytes(&self) -> Option<&[u8]> {
        self.zero_points.as_ref().map(|z| z.bytes())
    }

    fn scales_view(&self) -> Scales<'_> {
        let bytes = self.scales.bytes();
        match self.scale_dtype {
            ScaleDType::F32 => Scales::F32Le(bytes),
            ScaleDType::Bf16 => Scales::Bf16Le(bytes),
            ScaleDType::Fp8E4M3 => Scales::Fp8E4M3(bytes),
        }
    }

    /// Dequantize rows `[k_offset, k_offset + n_rows)` into `dst`
    /// (row-major, `n_rows * cols`).
    pub fn dequant_tile(&self, k_offset: usize, n_rows: usize, dst: &mut [f32]) -> Result<()> {
        if k_offset + n_rows > self.rows || dst.len() < n_rows * self.cols {
            return Err(EngineError::Internal(format!(
                "dequant tile {k_offset}+{n_rows} out of range for {} rows",
                self.rows
            )));
        }
        let cols = self.cols;
        let scales = self.scales_view();
        let elem0 = k_offset * cols;
        match self.weight {
            WeightDType::Int8 => scalar::dequant_int(
                IntCodes::I8(&as_i8(self.codes.bytes())[elem0..elem0 + n_rows * cols]),
                scales,
                self.zero_points.as_ref().map(|z| as_i8(z.bytes())),
                dst,
                n_rows,
                cols,
                cols,
                self.group_size,
                self.pack_row,
                k_offset,
            ),
            WeightDType::Int4 => {
                debug_assert!(elem0 % 2 == 0);
                let packed = &self.codes.bytes()[elem0 / 2..];
                scalar::dequant_int(
                    IntCodes::I4 {
                        packed,
                        policy: NibblePolicy::Clip,
                    },
                    scales,
                    self.zero_points.as_ref().map(|z| as_i8(z.bytes())),
                    dst,
                    n_rows,
                    cols,
                    cols,
                    self.group_size,
                    self.pack_row,
                    k_offset,
                )
            }
            WeightDType::Nf4 => {
                debug_assert!(elem0 % 2 == 0);
                scalar::dequant_lut4(
                    &self.codes.bytes()[elem0 / 2..],
                    &NF4_TABLE,
                    scales,
                    dst,
                    n_rows,
                    cols,
                    cols,
                    self.group_size,
                    self.pack_row,
                    k_offset,
                )
            }
            WeightDType::Fp4E2M1 => {
                debug_assert!(elem0 % 2 == 0);
                scalar::dequant_lut4(
                    &self.codes.bytes()[elem0 / 2..],
                    &FP4_E2M1_TABLE,
                    scales,
                    dst,
                    n_rows,
                    cols,
                    cols,
                    self.group_size,
                    self.pack_row,
                    k_offset,
                )
            }
            WeightDType::Fp8E4M3 => scalar::dequant_fp8(
                &self.codes.bytes()[elem0..elem0 + n_rows * cols],
                Fp8Kind::E4M3,
                scales,
                dst,
                n_rows,
                cols,
                cols,
                self.group_size,
                self.pack_row,
                k_offset,
            ),
            WeightDType::Fp8E5M2 => scalar::dequant_fp8(
                &self.codes.bytes()[elem0..elem0 + n_rows * cols],
                Fp8Kind::E5M2,
                scales,
                dst,
                n_rows,
                cols,
                cols,
                self.group_size,
                self.pack_row,
                k_offset,
            ),
        }
        Ok(())
    }

    /// Whole matrix dequantized into an owned vector.
    pub fn dequantize(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        self.dequant_tile(0, self.rows, &mut out)?;
        Ok(out)
    }

    /// Strip height used for tiled dequantize-and-multiply. One k-block when
    /// blocked, the whole reduction dim when per-column.
    fn strip_rows(&self) -> usize {
        if self.group_size == 0 {
            self.rows
        } else {
            // Strips must start on even element offsets for 4-bit packing;
            // group_size is 32 or 128 so multiples keep this true.
            self.group_size
        }
    }

    /// y ← y + xᵀ·W for a single activation row x of length `rows`.
    ///
    /// Dequantize-to-tile-and-multiply: each k-strip is expanded into
    /// `scratch` and accumulated with the dispatch table's axpy.
    pub fn matvec(
        &self,
        kern: &Kernels,
        x: &[f32],
        y: &mut [f32],
        scratch: &mut Vec<f32>,
    ) -> Result<()> {
        if x.len() != self.rows || y.len() != self.cols {
            return Err(EngineError::Internal(format!(
                "matvec shape mismatch: x {} y {} vs {}x{}",
                x.len(),
                y.len(),
                self.rows,
                self.cols
            )));
        }
        let strip = self.strip_rows();
        scratch.resize(strip * self.cols, 0.0);
        let mut k0 = 0;
        while k0 < self.rows {
            let rs = strip.min(self.rows - k0);
            self.dequant_tile(k0, rs, scratch)?;
            for r in 0..rs {
                let alpha = x[k0 + r];
                if alpha != 0.0 {
                    (kern.vec_axpy)(alpha, &scratch[r * self.cols..(r + 1) * self.cols], y);
                }
            }
            k0 += rs;
        }
        Ok(())
    }

    /// y ← y + xᵀ·W through the mixed-precision integer path: activations
    /// are quantized per k-block to u8, the product is accumulated in i32,
    /// and the zero-point terms are removed with the bias correction before
    /// the per-block post-scale.
    ///
    /// Only defined for asymmetric int8 weights with pack_row 1.
    pub fn matvec_int8(&self, x: &[f32], y: &mut [f32]) -> Result<()> {
        let zero_points = match &self.zero_points {
            Some(z) if self.weight == WeightDType::Int8 && self.pack_row == 1 => z,
            _ => {
                return Err(EngineError::Internal(
                    "integer matvec requires asymmetric int8 weights with pack_row 1".into(),
                ))
            }
        };
        if x.len() != self.rows || y.len() != self.cols {
            return Err(EngineError::Internal(format!(
                "matvec shape mismatch: x {} y {} vs {}x{}",
                x.len(),
                y.len(),
                self.rows,
                self.cols
            )));
        }
        let group = if self.group_size == 0 {
            self.rows
        } else {
            self.group_size
        };
        let n_blocks = self.rows.div_ceil(group);
        let cols = self.cols;
        let w_codes = as_i8(self.codes.bytes());
        let w_zps = as_i8(zero_points.bytes());
        let w_scales = self.scales_view();

        // Activation quantization, one affine block per k-block
        let mut a_codes = vec![0u8; self.rows];
        let mut a_scales = vec![0.0f32; n_blocks];
        let mut a_zps = vec![0u8; n_blocks];
        let mut a_sums = vec![0i32; n_blocks];
        scalar::quantize_row_u8(
            x,
            group,
            &mut a_codes,
            &mut a_scales,
            &mut a_zps,
            Some(&mut a_sums),
        );

        // Per-block weight code sums for the Σb term
        let mut w_sums = vec![0i32; n_blocks * cols];
        scalar::row_block_sums(IntCodes::I8(w_codes), self.rows, cols, group, &mut w_sums);

        for b in 0..n_blocks {
            let r0 = b * group;
            let r1 = (r0 + group).min(self.rows);
            let k = (r1 - r0) as i32;
            let zp_a = a_zps[b] as i32;
            for j in 0..cols {
                let mut acc = 0i32;
                for r in r0..r1 {
                    acc += a_codes[r] as i32 * w_codes[r * cols + j] as i32;
                }
                let corrected = scalar::bias_correct(
                    acc,
                    zp_a,
                    a_sums[b],
                    w_zps[b * cols + j] as i32,
                    w_sums[b * cols + j],
                    k,
                );
                y[j] += corrected as f32 * a_scales[b] * w_scales.get(b * cols + j);
            }
        }
        Ok(())
    }

}

/// A named weight: dense float or block-quantized.
#[derive(Debug, Clone)]
pub enum WeightTensor {
    Dense(DenseTensor),
    Quantized(QuantMatrix),
}

impl WeightTensor {
    pub fn rows(&self) -> usize {
        match self {
            WeightTensor::Dense(t) => t.rows,
            WeightTensor::Quantized(q) => q.rows,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            WeightTensor::Dense(t) => t.cols,
            WeightTensor::Quantized(q) => q.cols,
        }
    }
}
