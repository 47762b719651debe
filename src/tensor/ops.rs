//! Shape-checked tensor operations
//!
//! Thin wrappers that validate shapes, pick the right primitive through the
//! dispatch table, and parallelize the heavy reductions across the engine's
//! worker pool. Activations are f32 tensors; weights stay in their
//! containers and are expanded tile-by-tile.

use rayon::prelude::*;

use crate::kernels::{scalar, Kernels, RopeMode};
use crate::quant::{DenseTensor, WeightTensor};
use crate::tensor::{ScratchArena, Tensor};
use crate::utils::{EngineError, Result};

/// Norm flavor selected by the architecture table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    Layer,
    Rms,
}

/// x · W for activations [T, in] against a weight [in, out].
///
/// Quantized weights go through dequantize-to-tile-and-multiply; the strip
/// loop is split across the worker pool with one partial accumulator per
/// worker.
pub fn matmul(
    kern: &Kernels,
    pool: &rayon::ThreadPool,
    x: &Tensor,
    w: &WeightTensor,
) -> Result<Tensor> {
    if w.rows() != x.h {
        return Err(EngineError::Internal(format!(
            "matmul reduction mismatch: activation {} vs weight {}",
            x.h,
            w.rows()
        )));
    }
    let cols = w.cols();
    let mut out = Tensor::zeros(x.t, cols);

    match w {
        WeightTensor::Dense(d) => dense_matmul(kern, d, x, &mut out),
        WeightTensor::Quantized(q) => {
            if q.group_size != 0 && x.h % q.group_size != 0 {
                return Err(EngineError::Internal(format!(
                    "block K {} does not divide reduction dim {}",
                    q.group_size, x.h
                )));
            }
            let strip = if q.group_size == 0 { q.rows } else { q.group_size };
            let n_strips = q.rows.div_ceil(strip);
            if n_strips == 1 || x.t > 1 {
                // Prefill: tokens are the parallel axis.
                pool.install(|| {
                    out.data_mut()
                        .par_chunks_mut(cols)
                        .enumerate()
                        .try_for_each(|(ti, yrow)| {
                            let mut scratch = Vec::new();
                            q.matvec(kern, x.row(ti), yrow, &mut scratch)
                        })
                })?;
            } else {
                // Single-token decode: contiguous strip ranges are the
                // parallel axis. The range partition depends only on the
                // pool size and the partials are summed in range order, so a
                // fixed thread count gives bit-identical results run to run.
                let xrow = x.row(0);
                let n_chunks = pool.current_num_threads().clamp(1, n_strips);
                let per_chunk = n_strips.div_ceil(n_chunks);
                let partials: Vec<Result<Vec<f32>>> = pool.install(|| {
                    (0..n_chunks)
                        .into_par_iter()
                        .map(|c| {
                            let mut acc = vec![0.0f32; cols];
                            let mut scratch = Vec::new();
                            for s in c * per_chunk..((c + 1) * per_chunk).min(n_strips) {
                                let k0 = s * strip;
                                let rs = strip.min(q.rows - k0);
                                scratch.resize(rs * cols, 0.0);
                                q.dequant_tile(k0, rs, &mut scratch)?;
                                for r in 0..rs {
                                    let alpha = xrow[k0 + r];
                                    if alpha != 0.0 {
                                        (kern.vec_axpy)(
                                            alpha,
                                            &scratch[r * cols..(r + 1) * cols],
                                            &mut acc,
                                        );
                                    }
                                }
                            }
                            Ok(acc)
                        })
                        .collect()
                });
                let yrow = out.row_mut(0);
                for partial in partials {
                    (kern.vec_add_assign)(yrow, &partial?);
                }
            }
            Ok(())
        }
    }?;
    Ok(out)
}

fn dense_matmul(kern: &Kernels, d: &DenseTensor, x: &Tensor, out: &mut Tensor) -> Result<()> {
    let mut wrow = vec![0.0f32; d.cols];
    for r in 0..d.rows {
        d.copy_row(r, &mut wrow);
        for ti in 0..x.t {
            let alpha = x.row(ti)[r];
            if alpha != 0.0 {
                (kern.vec_axpy)(alpha, &wrow, out.row_mut(ti));
            }
        }
    }
    Ok(())
}

/// Add a bias vector to every token row.
pub fn bias_add(kern: &Kernels, x: &mut Tensor, bias: &[f32]) -> Result<()> {
    if bias.len() != x.h {
        return Err(EngineError::Internal(format!(
            "bias length {} vs hidden {}",
            bias.len(),
            x.h
        )));
    }
    for ti in 0..x.t {
        (kern.vec_add_assign)(x.row_mut(ti), bias);
    }
    Ok(())
}

/// In-place norm over every token row.
pub fn norm(
    _kern: &Kernels,
    x: &mut Tensor,
    kind: NormKind,
    gamma: Option<&[f32]>,
    beta: Option<&[f32]>,
    eps: f32,
) -> Result<()> {
    if let Some(g) = gamma {
        if g.len() != x.h {
            return Err(EngineError::Internal(format!(
                "norm gamma length {} vs hidden {}",
                g.len(),
                x.h
            )));
        }
    }
    for ti in 0..x.t {
        match kind {
            NormKind::Rms => scalar::rmsnorm(x.row_mut(ti), gamma, eps),
            NormKind::Layer => scalar::layernorm(x.row_mut(ti), gamma, beta, eps),
        }
    }
    Ok(())
}

/// In-place rotary embedding; one logical position per token row.
pub fn rope(
    x: &mut Tensor,
    head_dim: usize,
    positions: &[usize],
    theta: f32,
    mode: RopeMode,
) -> Result<()> {
    if positions.len() != x.t || head_dim == 0 || x.h % head_dim != 0 {
        return Err(EngineError::Internal(format!(
            "rope shape mismatch: {} positions for {} rows of {}",
            positions.len(),
            x.t,
            x.h
        )));
    }
    for ti in 0..x.t {
        scalar::rope(x.row_mut(ti), head_dim, positions[ti] as f32, theta, mode);
    }
    Ok(())
}

/// Activation applied between the FFN up and down projections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnKind {
    /// SwiGLU: silu(x·W_gate) ⊙ (x·W_up), then down
    Gated,
    /// gelu(x·W_up), then down
    Plain,
}

/// Feed-forward block. `w_gate` must be present exactly when `kind` is
/// gated.
#[allow(clippy::too_many_arguments)]
pub fn ffn(
    kern: &Kernels,
    pool: &rayon::ThreadPool,
    x: &Tensor,
    kind: FfnKind,
    w_gate: Option<&WeightTensor>,
    w_up: &WeightTensor,
    w_down: &WeightTensor,
    up_bias: Option<&[f32]>,
    down_bias: Option<&[f32]>,
) -> Result<Tensor> {
    let mut mid = matmul(kern, pool, x, w_up)?;
    if let Some(b) = up_bias {
        bias_add(kern, &mut mid, b)?;
    }
    match kind {
        FfnKind::Gated => {
            let gate = w_gate.ok_or_else(|| {
                EngineError::Internal("gated ffn without a gate weight".into())
            })?;
            let mut g = matmul(kern, pool, x, gate)?;
            for ti in 0..g.t {
                (kern.vec_silu)(g.row_mut(ti));
            }
            for ti in 0..mid.t {
                (kern.vec_mul_assign)(mid.row_mut(ti), g.row(ti));
            }
        }
        FfnKind::Plain => {
            for ti in 0..mid.t {
                (kern.vec_gelu)(mid.row_mut(ti));
            }
        }
    }
    let mut out = matmul(kern, pool, &mid, w_down)?;
    if let Some(b) = down_bias {
        bias_add(kern, &mut out, b)?;
    }
    Ok(out)
}

/// Key/value views handed out by the cache for one layer.
pub struct AttentionInputs<'a> {
    /// [n_slots, n_kv_head, head_dim]
    pub keys: &'a [f32],
    /// [n_slots, n_kv_head, head_dim]
    pub values: &'a [f32],
    /// Logical position per physical slot, -1 for empty
    pub slot_positions: &'a [i64],
    pub n_slots: usize,
}

/// Scaled-dot-product attention against cached keys/values.
///
/// Causality comes from the slot position map: a query at position p only
/// attends to slots whose logical position is in [0, p].
#[allow(clippy::too_many_arguments)]
pub fn attention(
    kern: &Kernels,
    q: &Tensor,
    inputs: &AttentionInputs<'_>,
    q_positions: &[usize],
    n_head: usize,
    n_kv_head: usize,
    head_dim: usize,
    arena: &mut ScratchArena,
) -> Result<Tensor> {
    if q.h != n_head * head_dim || q_positions.len() != q.t {
        return Err(EngineError::Internal(format!(
            "attention shape mismatch: q {} vs {} heads x {}",
            q.h, n_head, head_dim
        )));
    }
    if n_kv_head == 0 || n_head % n_kv_head != 0 {
        return Err(EngineError::Internal(format!(
            "{n_head} query heads not divisible by {n_kv_head} kv heads"
        )));
    }
    let kv_stride = n_kv_head * head_dim;
    if inputs.keys.len() != inputs.n_slots * kv_stride
        || inputs.values.len() != inputs.keys.len()
        || inputs.slot_positions.len() != inputs.n_slots
    {
        return Err(EngineError::Internal("attention cache view mismatch".into()));
    }

    let group = n_head / n_kv_head;
    let inv_sqrt = 1.0 / (head_dim as f32).sqrt();
    let mut out = Tensor::zeros(q.t, q.h);
    let mut scores = arena.take(inputs.n_slots);

    for ti in 0..q.t {
        let p = q_positions[ti] as i64;
        for h in 0..n_head {
            let kvh = h / group;
            let q_head = &q.row(ti)[h * head_dim..(h + 1) * head_dim];

            for s in 0..inputs.n_slots {
                let sp = inputs.slot_positions[s];
                scores[s] = if sp >= 0 && sp <= p {
                    let k = &inputs.keys[s * kv_stride + kvh * head_dim..][..head_dim];
                    (kern.vec_dot)(q_head, k) * inv_sqrt
                } else {
                    f32::NEG_INFINITY
                };
            }
            (kern.softmax)(&mut scores);

            let out_head = &mut out.row_mut(ti)[h * head_dim..(h + 1) * head_dim];
            for s in 0..inputs.n_slots {
                let w = scores[s];
                if w != 0.0 {
                    let v = &inputs.values[s * kv_stride + kvh * head_dim..][..head_dim];
                    (kern.vec_axpy)(w, v, out_head);
                }
            }
        }
    }

    arena.give(scores);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{quantize_matrix, QuantizeConfig, WeightTensor};

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn matmul_quant_matches_scalar_product() {
        let rows = 64;
        let cols = 6;
        let src: Vec<f32> = (0..rows * cols).map(|i| ((i as f32) * 0.11).sin()).collect();
        let qm = quantize_matrix(&src, rows, cols, &QuantizeConfig::default()).unwrap();
        let dense = qm.dequantize().unwrap();
        let w = WeightTensor::Quantized(qm);

        let x = Tensor::from_vec(1, rows, (0..rows).map(|i| (i as f32 * 0.2).cos()).collect())
            .unwrap();
        let kern = Kernels::reference();
        let out = matmul(&kern, &pool(), &x, &w).unwrap();

        let mut want = vec![0.0f32; cols];
        for r in 0..rows {
            for j in 0..cols {
                want[j] += x.row(0)[r] * dense[r * cols + j];
            }
        }
        for j in 0..cols {
            assert!((out.row(0)[j] - want[j]).abs() < 1e-4);
        }
    }

    #[test]
    fn matmul_rejects_mismatched_reduction() {
        let src = vec![0.0f32; 32];
        let qm = quantize_matrix(
            &src,
            32,
            1,
            &QuantizeConfig {
                group_size: 32,
                ..Default::default()
            },
        )
        .unwrap();
        let w = WeightTensor::Quantized(qm);
        let x = Tensor::zeros(1, 16);
        assert!(matmul(&Kernels::reference(), &pool(), &x, &w).is_err());
    }

    #[test]
    fn attention_single_key_is_identity_over_values() {
        let head_dim = 4;
        let keys = vec![1.0f32, 0.0, 0.0, 0.0];
        let values = vec![0.5f32, -0.5, 1.0, 2.0];
        let slots = vec![0i64];
        let inputs = AttentionInputs {
            keys: &keys,
            values: &values,
            slot_positions: &slots,
            n_slots: 1,
        };
        let q = Tensor::from_vec(1, head_dim, vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let mut arena = ScratchArena::new();
        let out = attention(
            &Kernels::reference(),
            &q,
            &inputs,
            &[0],
            1,
            1,
            head_dim,
            &mut arena,
        )
        .unwrap();
        assert_eq!(out.row(0), &values[..]);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn attention_masks_future_positions() {
        let head_dim = 2;
        // Two slots: position 0 and position 5; query at position 0 must
        // ignore the second.
        let keys = vec![1.0f32, 0.0, 10.0, 10.0];
        let values = vec![1.0f32, 1.0, -9.0, -9.0];
        let slots = vec![0i64, 5];
        let inputs = AttentionInputs {
            keys: &keys,
            values: &values,
            slot_positions: &slots,
            n_slots: 2,
        };
        let q = Tensor::from_vec(1, head_dim, vec![3.0, 0.0]).unwrap();
        let mut arena = ScratchArena::new();
        let out = attention(
            &Kernels::reference(),
            &q,
            &inputs,
            &[0],
            1,
            1,
            head_dim,
            &mut arena,
        )
        .unwrap();
        assert_eq!(out.row(0), &[1.0, 1.0]);
    }
}
