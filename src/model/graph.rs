//! Per-architecture decoder layer graphs
//!
//! Every layer of a given model executes one fixed op sequence. The
//! sequence is data: a static table of (op kind, weight-name patterns)
//! entries per architecture, plus the knobs that vary across the decoder
//! family (norm flavor, FFN flavor, residual placement, RoPE layout, bias
//! presence). Nothing is discovered at runtime.

use crate::kernels::RopeMode;
use crate::tensor::ops::{FfnKind, NormKind};
use crate::utils::{EngineError, Result};

/// Supported architecture tags (stored in the model header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// RMS-norm, SwiGLU, pre-norm, rotary on split halves, no biases;
    /// covers the Llama/Mistral family including grouped-query variants
    Llama,
    /// LayerNorm, plain GELU FFN, pre-norm, interleaved rotary, biased
    /// projections
    NeoX,
}

impl Architecture {
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Llama),
            1 => Ok(Self::NeoX),
            other => Err(EngineError::MalformedModel(format!(
                "unknown architecture tag {other}"
            ))),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::Llama => 0,
            Self::NeoX => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::NeoX => "neox",
        }
    }

    pub fn spec(self) -> &'static ArchSpec {
        match self {
            Self::Llama => &LLAMA_SPEC,
            Self::NeoX => &NEOX_SPEC,
        }
    }
}

/// Residual placement relative to the norm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualStyle {
    PreNorm,
    PostNorm,
}

/// One step of the per-layer op sequence. Weight name patterns contain a
/// `{}` placeholder for the layer index.
#[derive(Debug)]
pub struct LayerStep {
    pub op: OpKind,
    pub weights: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Norm ahead of the attention block
    AttnNorm,
    /// QKV projection, rotary update, cache append, attention, output
    /// projection, residual
    Attention,
    /// Norm ahead of the feed-forward block
    FfnNorm,
    /// Feed-forward block, residual
    FeedForward,
}

/// The fixed decoder recipe for one architecture
#[derive(Debug)]
pub struct ArchSpec {
    pub arch: Architecture,
    pub norm: NormKind,
    pub ffn: FfnKind,
    pub residual: ResidualStyle,
    pub rope: RopeMode,
    pub has_bias: bool,
    pub norm_eps: f32,
    pub steps: &'static [LayerStep],
    /// Non-layer tensors: embedding, final norm, output projection
    pub embedding: &'static str,
    pub final_norm: &'static str,
    pub output: &'static str,
}

static LLAMA_SPEC: ArchSpec = ArchSpec {
    arch: Architecture::Llama,
    norm: NormKind::Rms,
    ffn: FfnKind::Gated,
    residual: ResidualStyle::PreNorm,
    rope: RopeMode::Split,
    has_bias: false,
    norm_eps: 1e-5,
    steps: &[
        LayerStep {
            op: OpKind::AttnNorm,
            weights: &["blk.{}.attn_norm.weight"],
        },
        LayerStep {
            op: OpKind::Attention,
            weights: &[
                "blk.{}.attn_q.weight",
                "blk.{}.attn_k.weight",
                "blk.{}.attn_v.weight",
                "blk.{}.attn_output.weight",
            ],
        },
        LayerStep {
            op: OpKind::FfnNorm,
            weights: &["blk.{}.ffn_norm.weight"],
        },
        LayerStep {
            op: OpKind::FeedForward,
            weights: &[
                "blk.{}.ffn_gate.weight",
                "blk.{}.ffn_up.weight",
                "blk.{}.ffn_down.weight",
            ],
        },
    ],
    embedding: "token_embd.weight",
    final_norm: "output_norm.weight",
    output: "output.weight",
};

static NEOX_SPEC: ArchSpec = ArchSpec {
    arch: Architecture::NeoX,
    norm: NormKind::Layer,
    ffn: FfnKind::Plain,
    residual: ResidualStyle::PreNorm,
    rope: RopeMode::Interleaved,
    has_bias: true,
    norm_eps: 1e-5,
    steps: &[
        LayerStep {
            op: OpKind::AttnNorm,
            weights: &["blk.{}.attn_norm.weight"],
        },
        LayerStep {
            op: OpKind::Attention,
            weights: &[
                "blk.{}.attn_q.weight",
                "blk.{}.attn_k.weight",
                "blk.{}.attn_v.weight",
                "blk.{}.attn_output.weight",
            ],
        },
        LayerStep {
            op: OpKind::FfnNorm,
            weights: &["blk.{}.ffn_norm.weight"],
        },
        LayerStep {
            op: OpKind::FeedForward,
            weights: &["blk.{}.ffn_up.weight", "blk.{}.ffn_down.weight"],
        },
    ],
    embedding: "token_embd.weight",
    final_norm: "output_norm.weight",
    output: "output.weight",
};

/// Substitute the layer index into a weight-name pattern.
pub fn resolve_name(pattern: &str, layer: usize) -> String {
    pattern.replacen("{}", &layer.to_string(), 1)
}

/// Every weight name a model of `n_layer` layers must provide.
pub fn required_tensors(spec: &ArchSpec, n_layer: usize) -> Vec<String> {
    let mut names = vec![
        spec.embedding.to_string(),
        spec.final_norm.to_string(),
        spec.output.to_string(),
    ];
    for layer in 0..n_layer {
        for step in spec.steps {
            for pattern in step.weights {
                names.push(resolve_name(pattern, layer));
            }
        }
    }
    names
}
