//! Immutable model descriptor
//!
//! Built once from the mapped file at load time: hyperparameters, the
//! architecture recipe, the vocabulary, and every named weight. Projection
//! weights stay in their (possibly quantized) containers backed by the
//! mapping; small vectors (norm gains, biases) are upcast to f32 once here
//! so the per-token loop never touches half-precision storage.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::model::format::{HyperParams, ModelFile};
use crate::model::graph::{required_tensors, resolve_name, Architecture};
use crate::model::vocab::Vocab;
use crate::quant::{DenseTensor, WeightTensor};
use crate::utils::{EngineError, Result};

/// A loaded, immutable model.
pub struct ModelDescriptor {
    pub hparams: HyperParams,
    pub arch: Architecture,
    pub vocab: Vocab,
    embedding: DenseTensor,
    weights: HashMap<String, WeightTensor>,
    /// Norm gains/biases and projection biases, upcast to f32
    vectors: HashMap<String, Vec<f32>>,
}

impl ModelDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let file = ModelFile::open(path)?;
        let hparams = file.hparams().clone();
        let arch = Architecture::from_tag(hparams.arch_tag)?;
        let spec = arch.spec();

        if hparams.n_layer == 0
            || hparams.n_embd == 0
            || hparams.n_head == 0
            || hparams.head_dim == 0
            || hparams.ctx_max == 0
        {
            return Err(EngineError::MalformedModel(
                "hyperparameter block contains zeros".into(),
            ));
        }
        if hparams.n_kv_head == 0 || hparams.n_head % hparams.n_kv_head != 0 {
            return Err(EngineError::MalformedModel(format!(
                "{} query heads not divisible by {} kv heads",
                hparams.n_head, hparams.n_kv_head
            )));
        }
        if hparams.head_dim % 2 != 0 {
            return Err(EngineError::MalformedModel(format!(
                "head_dim {} must be even for rotary embedding",
                hparams.head_dim
            )));
        }
        if hparams.eos_token_id >= hparams.n_vocab {
            return Err(EngineError::MalformedModel(format!(
                "eos id {} outside vocab of {}",
                hparams.eos_token_id, hparams.n_vocab
            )));
        }

        let n_embd = hparams.n_embd as usize;
        let n_vocab = hparams.n_vocab as usize;
        let n_ff = hparams.n_ff as usize;
        let q_dim = (hparams.n_head * hparams.head_dim) as usize;
        let kv_dim = (hparams.n_kv_head * hparams.head_dim) as usize;
        let n_layer = hparams.n_layer as usize;

        let mut weights = HashMap::new();
        let mut vectors = HashMap::new();

        let load_vector = |file: &ModelFile, name: &str, len: usize| -> Result<Vec<f32>> {
            let entry = file
                .find(name)
                .ok_or_else(|| EngineError::MalformedModel(format!("missing tensor '{name}'")))?;
            let dense = file.load_dense(entry)?;
            let v = dense.to_f32();
            if v.len() != len {
                return Err(EngineError::MalformedModel(format!(
                    "tensor '{name}' has {} elements, expected {len}",
                    v.len()
                )));
            }
            Ok(v)
        };

        // Embedding and head-side tensors
        let embedding = {
            let entry = file.find(spec.embedding).ok_or_else(|| {
                EngineError::MalformedModel(format!("missing tensor '{}'", spec.embedding))
            })?;
            let dense = file.load_dense(entry)?;
            if dense.rows != n_vocab || dense.cols != n_embd {
                return Err(EngineError::MalformedModel(format!(
                    "embedding is {}x{}, expected {n_vocab}x{n_embd}",
                    dense.rows, dense.cols
                )));
            }
            dense
        };
        vectors.insert(
            spec.final_norm.to_string(),
            load_vector(&file, spec.final_norm, n_embd)?,
        );
        if spec.norm == crate::tensor::ops::NormKind::Layer {
            let bias_name = spec.final_norm.replace(".weight", ".bias");
            if file.find(&bias_name).is_some() {
                vectors.insert(bias_name.clone(), load_vector(&file, &bias_name, n_embd)?);
            }
        }

        // Projection weights, shape-checked per role
        let load_weight = |file: &ModelFile,
                               name: &str,
                               rows: usize,
                               cols: usize|
         -> Result<WeightTensor> {
            let entry = file
                .find(name)
                .ok_or_else(|| EngineError::MalformedModel(format!("missing tensor '{name}'")))?;
            let w = file.load_weight(entry)?;
            if w.rows() != rows || w.cols() != cols {
                return Err(EngineError::MalformedModel(format!(
                    "tensor '{name}' is {}x{}, expected {rows}x{cols}",
                    w.rows(),
                    w.cols()
                )));
            }
            Ok(w)
        };

        weights.insert(
            spec.output.to_string(),
            load_weight(&file, spec.output, n_embd, n_vocab)?,
        );

        for layer in 0..n_layer {
            let shapes: [(&str, usize, usize); 6] = [
                ("blk.{}.attn_q.weight", n_embd, q_dim),
                ("blk.{}.attn_k.weight", n_embd, kv_dim),
                ("blk.{}.attn_v.weight", n_embd, kv_dim),
                ("blk.{}.attn_output.weight", q_dim, n_embd),
                ("blk.{}.ffn_up.weight", n_embd, n_ff),
                ("blk.{}.ffn_down.weight", n_ff, n_embd),
            ];
            for (pattern, rows, cols) in shapes {
                let name = resolve_name(pattern, layer);
                weights.insert(name.clone(), load_weight(&file, &name, rows, cols)?);
                if spec.has_bias {
                    let bias_name = name.replace(".weight", ".bias");
                    if file.find(&bias_name).is_some() {
                        vectors.insert(bias_name.clone(), load_vector(&file, &bias_name, cols)?);
                    }
                }
            }
            if spec.ffn == crate::tensor::ops::FfnKind::Gated {
                let name = resolve_name("blk.{}.ffn_gate.weight", layer);
                weights.insert(name.clone(), load_weight(&file, &name, n_embd, n_ff)?);
            }
            for pattern in ["blk.{}.attn_norm.weight", "blk.{}.ffn_norm.weight"] {
                let name = resolve_name(pattern, layer);
                vectors.insert(name.clone(), load_vector(&file, &name, n_embd)?);
                if spec.norm == crate::tensor::ops::NormKind::Layer {
                    let bias_name = name.replace(".weight", ".bias");
                    if file.find(&bias_name).is_some() {
                        vectors.insert(bias_name.clone(), load_vector(&file, &bias_name, n_embd)?);
                    }
                }
            }
        }

        // The graph table and the loaded set must agree.
        for name in required_tensors(spec, n_layer) {
            if name != spec.embedding
                && !weights.contains_key(&name)
                && !vectors.contains_key(&name)
            {
                return Err(EngineError::Internal(format!(
                    "graph requires '{name}' but the loader did not resolve it"
                )));
            }
        }

        let vocab = Vocab::new(file.vocab().to_vec(), hparams.eos_token_id);
        info!(
            arch = arch.name(),
            n_layer,
            n_embd,
            n_vocab,
            ctx_max = hparams.ctx_max,
            "model loaded"
        );
        Ok(Self {
            hparams,
            arch,
            vocab,
            embedding,
            weights,
            vectors,
        })
    }

    pub fn weight(&self, name: &str) -> Result<&WeightTensor> {
        self.weights.get(name).ok_or_else(|| {
            EngineError::Internal(format!("weight '{name}' not resolved at load"))
        })
    }

    pub fn vector(&self, name: &str) -> Result<&[f32]> {
        self.vectors
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| EngineError::Internal(format!("vector '{name}' not resolved at load")))
    }

    pub fn vector_opt(&self, name: &str) -> Option<&[f32]> {
        self.vectors.get(name).map(|v| v.as_slice())
    }

    /// Copy one embedding row into `dst`.
    pub fn embed_token(&self, id: u32, dst: &mut [f32]) -> Result<()> {
        if id >= self.hparams.n_vocab {
            return Err(EngineError::Internal(format!(
                "token id {id} outside vocab of {}",
                self.hparams.n_vocab
            )));
        }
        self.embedding.copy_row(id as usize, dst);
        Ok(())
    }

    pub fn n_layer(&self) -> usize {
        self.hparams.n_layer as usize
    }

    pub fn n_embd(&self) -> usize {
        self.hparams.n_embd as usize
    }

    pub fn n_vocab(&self) -> usize {
        self.hparams.n_vocab as usize
    }
}
