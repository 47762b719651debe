//! Weight quantization
//!
//! Block quantization of float matrices into the supported weight formats,
//! plus the file-to-file tool surface used by the `nibble-quantize` binary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::quant::block::{n_scale_blocks, DataRef, QuantMatrix};
use crate::quant::format::{
    f32_to_fp8, fp8_to_f32, ComputeDType, Fp8Kind, ScaleDType, TensorDType, WeightDType,
    FP4_E2M1_TABLE, NF4_TABLE,
};
use crate::quant::nibble::NibbleBuffer;
use crate::utils::{EngineError, Result};

/// Symmetric or asymmetric integer quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantAlgo {
    Sym,
    Asym,
}

impl QuantAlgo {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sym" => Ok(Self::Sym),
            "asym" => Ok(Self::Asym),
            other => Err(EngineError::InvalidConfiguration(format!(
                "unknown algo '{other}' (expected sym or asym)"
            ))),
        }
    }
}

/// Quantization tool configuration
///
/// The allowed (weight, scale, compute) combinations are the README table;
/// anything else fails validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizeConfig {
    pub weight_dtype: WeightDType,
    /// 32, 128, or -1 for per-column
    pub group_size: i32,
    pub algo: QuantAlgo,
    pub scale_dtype: ScaleDType,
    pub compute_dtype: ComputeDType,
}

impl Default for QuantizeConfig {
    fn default() -> Self {
        Self {
            weight_dtype: WeightDType::Int4,
            group_size: 32,
            algo: QuantAlgo::Sym,
            scale_dtype: ScaleDType::F32,
            compute_dtype: ComputeDType::F32,
        }
    }
}

impl QuantizeConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.group_size, 32 | 128 | -1) {
            return Err(EngineError::InvalidConfiguration(format!(
                "group_size must be 32, 128 or -1, got {}",
                self.group_size
            )));
        }
        if self.algo == QuantAlgo::Asym && !self.weight_dtype.is_integer() {
            return Err(EngineError::InvalidConfiguration(format!(
                "asym is only valid for integer weights, got {}",
                self.weight_dtype.as_str()
            )));
        }
        if self.compute_dtype == ComputeDType::Int8 && !self.weight_dtype.is_integer() {
            return Err(EngineError::InvalidConfiguration(format!(
                "int8 compute requires integer weights, got {}",
                self.weight_dtype.as_str()
            )));
        }
        let fp8_weight = matches!(
            self.weight_dtype,
            WeightDType::Fp8E4M3 | WeightDType::Fp8E5M2
        );
        if self.scale_dtype == ScaleDType::Fp8E4M3 && !fp8_weight {
            return Err(EngineError::InvalidConfiguration(
                "fp8 scales are only valid for fp8 weights".into(),
            ));
        }
        Ok(())
    }

    /// Block rows; 0 encodes per-column.
    pub fn group(&self) -> usize {
        if self.group_size < 0 {
            0
        } else {
            self.group_size as usize
        }
    }
}

fn encode_scale(s: f32, dtype: ScaleDType, out: &mut Vec<u8>) -> f32 {
    match dtype {
        ScaleDType::F32 => {
            out.extend_from_slice(&s.to_le_bytes());
            s
        }
        ScaleDType::Bf16 => {
            let h = half::bf16::from_f32(s);
            out.extend_from_slice(&h.to_le_bytes());
            h.to_f32()
        }
        ScaleDType::Fp8E4M3 => {
            let b = f32_to_fp8(s, Fp8Kind::E4M3);
            out.push(b);
            fp8_to_f32(b, Fp8Kind::E4M3)
        }
    }
}

fn nearest_code(lut: &[f32; 16], x: f32) -> u8 {
    let mut best = 0u8;
    let mut best_err = f32::INFINITY;
    for (i, &v) in lut.iter().enumerate() {
        let err = (x - v).abs();
        if err < best_err {
            best_err = err;
            best = i as u8;
        }
    }
    best
}

/// Quantize a row-major [rows, cols] f32 matrix per the config.
///
/// Scales are per k-block and column; integer rounding is to nearest, ties
/// away from zero, clamped into the code range.
pub fn quantize_matrix(
    src: &[f32],
    rows: usize,
    cols: usize,
    cfg: &QuantizeConfig,
) -> Result<QuantMatrix> {
    cfg.validate()?;
    if src.len() != rows * cols {
        return Err(EngineError::Internal(format!(
            "quantize input {} elements for {rows}x{cols}",
            src.len()
        )));
    }
    let group = cfg.group();
    let block_rows = if group == 0 { rows } else { group };
    let n_blocks = n_scale_blocks(rows, group, 1);

    let four_bit = cfg.weight_dtype.code_bits() == 4;
    let mut nibbles = NibbleBuffer::new(if four_bit { rows * cols } else { 0 });
    let mut bytes = vec![0u8; if four_bit { 0 } else { rows * cols }];
    let mut scales = Vec::with_capacity(n_blocks * cols * cfg.scale_dtype.size_bytes());
    let asym = cfg.algo == QuantAlgo::Asym;
    let mut zero_points: Vec<u8> = Vec::with_capacity(if asym { n_blocks * cols } else { 0 });

    for b in 0..n_blocks {
        let r0 = b * block_rows;
        let r1 = (r0 + block_rows).min(rows);
        for j in 0..cols {
            let column = (r0..r1).map(|r| src[r * cols + j]);

            // Block statistics
            let mut absmax = 0.0f32;
            let mut min = 0.0f32;
            let mut max = 0.0f32;
            for x in column.clone() {
                absmax = absmax.max(x.abs());
                min = min.min(x);
                max = max.max(x);
            }

            let (raw_scale, zp): (f32, i32) = match (cfg.weight_dtype, asym) {
                (WeightDType::Int8, false) => (if absmax > 0.0 { absmax / 127.0 } else { 1.0 }, 0),
                (WeightDType::Int4, false) => (if absmax > 0.0 { absmax / 7.0 } else { 1.0 }, 0),
                (WeightDType::Int8, true) => {
                    let range = max - min;
                    let s = if range > 0.0 { range / 255.0 } else { 1.0 };
                    (s, -128 - (min / s).round() as i32)
                }
                (WeightDType::Int4, true) => {
                    let range = max - min;
                    let s = if range > 0.0 { range / 15.0 } else { 1.0 };
                    (s, -8 - (min / s).round() as i32)
                }
                (WeightDType::Fp8E4M3, _) => {
                    (if absmax > 0.0 { absmax / 448.0 } else { 1.0 }, 0)
                }
                (WeightDType::Fp8E5M2, _) => {
                    (if absmax > 0.0 { absmax / 57344.0 } else { 1.0 }, 0)
                }
                (WeightDType::Fp4E2M1, _) => (if absmax > 0.0 { absmax / 6.0 } else { 1.0 }, 0),
                (WeightDType::Nf4, _) => (if absmax > 0.0 { absmax } else { 1.0 }, 0),
            };

            // The stored (possibly narrowed) scale is the one codes must
            // reconstruct against.
            let scale = encode_scale(raw_scale, cfg.scale_dtype, &mut scales);
            let scale = if scale > 0.0 { scale } else { 1.0 };
            if asym {
                zero_points.push(zp.clamp(-128, 127) as i8 as u8);
            }

            for (i, x) in column.enumerate() {
                let r = r0 + i;
                let idx = r * cols + j;
                match cfg.weight_dtype {
                    WeightDType::Int8 => {
                        let q = (x / scale).round() as i32 + zp;
                        bytes[idx] = q.clamp(-128, 127) as i8 as u8;
                    }
                    WeightDType::Int4 => {
                        let q = (x / scale).round() as i32 + zp;
                        nibbles.set(idx, (q.clamp(-8, 7) as i8 as u8) & 0x0f);
                    }
                    WeightDType::Fp8E4M3 => {
                        bytes[idx] = f32_to_fp8(x / scale, Fp8Kind::E4M3);
                    }
                    WeightDType::Fp8E5M2 => {
                        bytes[idx] = f32_to_fp8(x / scale, Fp8Kind::E5M2);
                    }
                    WeightDType::Fp4E2M1 => {
                        nibbles.set(idx, nearest_code(&FP4_E2M1_TABLE, x / scale));
                    }
                    WeightDType::Nf4 => {
                        nibbles.set(idx, nearest_code(&NF4_TABLE, x / scale));
                    }
                }
            }
        }
    }

    let codes = if four_bit {
        DataRef::Owned(nibbles.into_bytes())
    } else {
        DataRef::Owned(bytes)
    };
    QuantMatrix::new(
        rows,
        cols,
        cfg.weight_dtype,
        cfg.scale_dtype,
        group,
        1,
        codes,
        DataRef::Owned(scales),
        if asym {
            Some(DataRef::Owned(zero_points))
        } else {
            None
        },
    )
}

/// Whether a stored tensor is a quantization candidate: a 2-D float weight
/// that is not an embedding or norm parameter.
fn is_quantizable(name: &str, dims: &[usize], dtype: TensorDType) -> bool {
    matches!(
        dtype,
        TensorDType::F32 | TensorDType::F16 | TensorDType::Bf16
    ) && dims.len() == 2
        && !name.contains("norm")
        && !name.contains("embed")
}

/// Summary of one file-to-file quantization run
#[derive(Debug, Clone, Serialize)]
pub struct QuantizeReport {
    pub tensors_quantized: usize,
    pub tensors_copied: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Quantize every eligible weight of `input` into `output`.
///
/// Hyperparameters, the tokenizer section, and non-weight tensors are copied
/// through unchanged.
pub fn quantize_file(input: &Path, output: &Path, cfg: &QuantizeConfig) -> Result<QuantizeReport> {
    cfg.validate()?;
    let file = crate::model::format::ModelFile::open(input)?;
    let mut writer =
        crate::model::format::ModelWriter::new(file.hparams().clone(), file.vocab().to_vec());

    let mut quantized = 0usize;
    let mut copied = 0usize;
    for entry in file.tensors() {
        if is_quantizable(&entry.name, &entry.dims, entry.dtype) {
            let dense = file.load_dense(entry)?;
            let data = dense.to_f32();
            let qm = quantize_matrix(&data, entry.dims[0], entry.dims[1], cfg)?;
            debug!(tensor = %entry.name, dtype = cfg.weight_dtype.as_str(), "quantized");
            writer.add_quantized(&entry.name, &qm);
            quantized += 1;
        } else {
            writer.add_raw(&entry.name, &entry.dims, entry.dtype, file.tensor_bytes(entry));
            copied += 1;
        }
    }

    writer.write_to(output)?;
    let input_bytes = std::fs::metadata(input)?.len();
    let output_bytes = std::fs::metadata(output)?.len();
    info!(
        quantized,
        copied,
        input_mb = input_bytes / (1024 * 1024),
        output_mb = output_bytes / (1024 * 1024),
        "quantization finished"
    );
    Ok(QuantizeReport {
        tensors_quantized: quantized,
        tensors_copied: copied,
        input_bytes,
        output_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_disallowed_triples() {
        let bad = QuantizeConfig {
            weight_dtype: WeightDType::Nf4,
            algo: QuantAlgo::Asym,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = QuantizeConfig {
            weight_dtype: WeightDType::Fp4E2M1,
            compute_dtype: ComputeDType::Int8,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = QuantizeConfig {
            weight_dtype: WeightDType::Int4,
            scale_dtype: ScaleDType::Fp8E4M3,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = QuantizeConfig {
            group_size: 64,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        assert!(QuantizeConfig::default().validate().is_ok());
    }

    #[test]
    fn int8_sym_round_trip_on_grid() {
        // Values on the representable grid survive exactly: the block absmax
        // sits on code 127, so the derived scale is the grid step itself.
        let scale = 0.25f32;
        let codes_in: [i32; 10] = [-127, -90, -55, -17, 0, 3, 21, 64, 100, 127];
        let src: Vec<f32> = codes_in.iter().map(|&c| c as f32 * scale).collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Int8,
            group_size: -1,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, 10, 1, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        assert_eq!(deq, src);
    }

    #[test]
    fn int4_sym_round_trip_on_grid() {
        let scale = 0.5f32;
        let codes_in: [i32; 8] = [-7, -4, -2, 0, 1, 3, 5, 7];
        let src: Vec<f32> = codes_in.iter().map(|&c| c as f32 * scale).collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Int4,
            group_size: -1,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, 8, 1, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        assert_eq!(deq, src);
    }

    #[test]
    fn int4_sym_error_bound() {
        // 128x128 sin(i*j/128) with group 32: max abs error <= absmax / 7
        let n = 128;
        let src: Vec<f32> = (0..n * n)
            .map(|idx| {
                let (i, j) = (idx / n, idx % n);
                ((i * j) as f32 / n as f32).sin()
            })
            .collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Int4,
            group_size: 32,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, n, n, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        let absmax = src.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        let bound = absmax / 7.0;
        for (a, b) in deq.iter().zip(src.iter()) {
            assert!((a - b).abs() <= bound + 1e-6);
        }
    }

    #[test]
    fn int4_asym_covers_skewed_range() {
        let src: Vec<f32> = (0..32).map(|i| 1.0 + i as f32 * 0.1).collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Int4,
            group_size: 32,
            algo: QuantAlgo::Asym,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, 32, 1, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        // Asymmetric step is (max-min)/15
        let step = (4.1 - 0.0) / 15.0;
        for (a, b) in deq.iter().zip(src.iter()) {
            assert!((a - b).abs() <= step, "{a} vs {b}");
        }
    }

    #[test]
    fn nf4_reconstruction_error() {
        let src: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.7).sin() * 0.8).collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Nf4,
            group_size: 32,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, 64, 1, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        // Worst-case NF4 gap is ~0.15 of the scale near the tails
        for (a, b) in deq.iter().zip(src.iter()) {
            assert!((a - b).abs() < 0.16 * 0.8 + 1e-6);
        }
    }

    #[test]
    fn fp8_weights_with_fp8_scales() {
        let src: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.4).sin() * 3.0).collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Fp8E4M3,
            group_size: 32,
            scale_dtype: ScaleDType::Fp8E4M3,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, 64, 1, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        // E4M3 carries ~2 decimal digits; fp8 scales add their own rounding
        for (a, b) in deq.iter().zip(src.iter()) {
            assert!((a - b).abs() < 0.5, "{a} vs {b}");
        }
    }

    #[test]
    fn bf16_scales_stay_close() {
        let src: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.03).collect();
        let cfg = QuantizeConfig {
            weight_dtype: WeightDType::Int8,
            group_size: 32,
            scale_dtype: ScaleDType::Bf16,
            ..Default::default()
        };
        let qm = quantize_matrix(&src, 32, 1, &cfg).unwrap();
        let deq = qm.dequantize().unwrap();
        for (a, b) in deq.iter().zip(src.iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }
}
