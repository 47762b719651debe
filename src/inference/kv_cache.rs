//! Per-layer key/value cache
//!
//! Each decoder layer owns a [ctx_size, n_kv_head, head_dim] pair of stores,
//! a slot→logical-position map, and a ring cursor. In non-ring mode an
//! append past `ctx_size` is a configuration error; in ring mode the oldest
//! slot is overwritten and `shift_rope_k` re-anchors the rotary phase of
//! every live key so attention geometry survives the wrap without
//! recomputation.

use half::f16;
use tracing::debug;

use crate::inference::params::MemoryType;
use crate::kernels::{scalar, RopeMode};
use crate::tensor::ops::AttentionInputs;
use crate::utils::{EngineError, Result};

/// Key/value storage, precision per `memory_type`
enum KvBuf {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl KvBuf {
    fn new(len: usize, memory: MemoryType) -> Self {
        match memory {
            MemoryType::F32 => KvBuf::F32(vec![0.0; len]),
            MemoryType::F16 | MemoryType::Auto => KvBuf::F16(vec![f16::ZERO; len]),
        }
    }

    fn write(&mut self, offset: usize, src: &[f32]) {
        match self {
            KvBuf::F32(buf) => buf[offset..offset + src.len()].copy_from_slice(src),
            KvBuf::F16(buf) => {
                for (dst, &v) in buf[offset..offset + src.len()].iter_mut().zip(src) {
                    *dst = f16::from_f32(v);
                }
            }
        }
    }

    fn read(&self, offset: usize, dst: &mut [f32]) {
        match self {
            KvBuf::F32(buf) => dst.copy_from_slice(&buf[offset..offset + dst.len()]),
            KvBuf::F16(buf) => {
                let len = dst.len();
                for (dst, &v) in dst.iter_mut().zip(&buf[offset..offset + len]) {
                    *dst = v.to_f32();
                }
            }
        }
    }

    /// Zero-copy view; only the f32 store has one.
    fn as_f32(&self) -> Option<&[f32]> {
        match self {
            KvBuf::F32(buf) => Some(buf),
            KvBuf::F16(_) => None,
        }
    }

    fn len(&self) -> usize {
        match self {
            KvBuf::F32(buf) => buf.len(),
            KvBuf::F16(buf) => buf.len(),
        }
    }
}

struct LayerKv {
    keys: KvBuf,
    values: KvBuf,
    /// Logical position per physical slot, -1 for empty
    slots: Vec<i64>,
    /// Next write slot
    head: usize,
}

/// Session-owned KV cache across all layers.
pub struct KvCache {
    layers: Vec<LayerKv>,
    ctx_size: usize,
    n_kv_head: usize,
    head_dim: usize,
    ring: bool,
}

impl KvCache {
    pub fn new(
        n_layer: usize,
        ctx_size: usize,
        n_kv_head: usize,
        head_dim: usize,
        ring: bool,
        memory: MemoryType,
    ) -> Result<Self> {
        let per_layer = ctx_size
            .checked_mul(n_kv_head)
            .and_then(|v| v.checked_mul(head_dim))
            .ok_or_else(|| {
                EngineError::ResourceExhausted(format!(
                    "kv cache of {ctx_size} x {n_kv_head} x {head_dim} overflows"
                ))
            })?;
        let layers = (0..n_layer)
            .map(|_| LayerKv {
                keys: KvBuf::new(per_layer, memory),
                values: KvBuf::new(per_layer, memory),
                slots: vec![-1; ctx_size],
                head: 0,
            })
            .collect();
        debug!(n_layer, ctx_size, n_kv_head, head_dim, ring, "kv cache allocated");
        Ok(Self {
            layers,
            ctx_size,
            n_kv_head,
            head_dim,
            ring,
        })
    }

    pub fn ctx_size(&self) -> usize {
        self.ctx_size
    }

    pub fn kv_stride(&self) -> usize {
        self.n_kv_head * self.head_dim
    }

    /// Live (written, still addressable) slot count for a layer.
    pub fn live(&self, layer: usize) -> usize {
        self.layers[layer].slots.iter().filter(|&&p| p >= 0).count()
    }

    /// Slot position map for a layer.
    pub fn slots(&self, layer: usize) -> &[i64] {
        &self.layers[layer].slots
    }

    /// Write one (k, v) pair at the head slot and advance. Returns the
    /// physical slot written.
    pub fn append(&mut self, layer: usize, k: &[f32], v: &[f32], position: i64) -> Result<usize> {
        let stride = self.kv_stride();
        if k.len() != stride || v.len() != stride {
            return Err(EngineError::Internal(format!(
                "kv append of {} floats, expected {stride}",
                k.len()
            )));
        }
        let ctx = self.ctx_size;
        let ring = self.ring;
        let l = &mut self.layers[layer];
        if !ring && l.slots[l.head] >= 0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "context window of {ctx} tokens exceeded; enable shift_roped_k or raise ctx_size"
            )));
        }
        let slot = l.head;
        l.keys.write(slot * stride, k);
        l.values.write(slot * stride, v);
        l.slots[slot] = position;
        l.head = (l.head + 1) % ctx;
        Ok(slot)
    }

    /// Views for the attention op. Half-precision stores are expanded into
    /// the provided scratch buffers; the f32 store is borrowed directly.
    pub fn gather_attention_inputs<'a>(
        &'a self,
        layer: usize,
        k_scratch: &'a mut Vec<f32>,
        v_scratch: &'a mut Vec<f32>,
    ) -> AttentionInputs<'a> {
        let l = &self.layers[layer];
        let (keys, values): (&[f32], &[f32]) = match (l.keys.as_f32(), l.values.as_f32()) {
            (Some(k), Some(v)) => (k, v),
            _ => {
                k_scratch.resize(l.keys.len(), 0.0);
                v_scratch.resize(l.values.len(), 0.0);
                l.keys.read(0, &mut k_scratch[..]);
                l.values.read(0, &mut v_scratch[..]);
                (&k_scratch[..], &v_scratch[..])
            }
        };
        AttentionInputs {
            keys,
            values,
            slot_positions: &l.slots,
            n_slots: self.ctx_size,
        }
    }

    /// Re-anchor ring positions: subtract `delta` from every live logical
    /// position and rotate every live key's rotary phase by the same shift.
    ///
    /// Only meaningful in ring mode. `shift_rope_k(d)` followed by
    /// `shift_rope_k(-d)` restores an attention-equivalent state.
    pub fn shift_rope_k(&mut self, delta: i64, theta: f32, mode: RopeMode) -> Result<()> {
        if !self.ring {
            return Err(EngineError::Internal(
                "shift_rope_k is only valid in ring mode".into(),
            ));
        }
        let stride = self.kv_stride();
        let head_dim = self.head_dim;
        let ctx = self.ctx_size;
        let mut row = vec![0.0f32; stride];
        for l in &mut self.layers {
            for slot in 0..ctx {
                if l.slots[slot] < 0 {
                    continue;
                }
                l.keys.read(slot * stride, &mut row);
                scalar::rope(&mut row, head_dim, -delta as f32, theta, mode);
                l.keys.write(slot * stride, &row);
                l.slots[slot] -= delta;
            }
        }
        debug!(delta, "rope phases re-anchored");
        Ok(())
    }

    /// Oldest live logical position, if any slot is live.
    pub fn oldest_position(&self, layer: usize) -> Option<i64> {
        self.layers[layer]
            .slots
            .iter()
            .copied()
            .filter(|&p| p >= 0)
            .min()
    }
}
