//! nibble-engine: block-quantized CPU inference for decoder-only
//! transformers
//!
//! The crate has two load-bearing halves: a block-quantized linear-algebra
//! engine (packed 4/8-bit integer and micro-float weights, SIMD-dispatched
//! kernels) and a transformer decode loop (per-layer KV cache with optional
//! ring eviction, prefill + incremental decode, seeded sampling).
//!
//! ## Example
//!
//! ```no_run
//! use nibble_engine::{Engine, GenerationParams};
//!
//! let engine = Engine::load(std::path::Path::new("model.nbq"), 8).unwrap();
//! let params = GenerationParams::default()
//!     .with_ctx_size(1024)
//!     .with_n_predict(64)
//!     .with_seed(42);
//! let mut session = engine.open_session(vec![1, 15, 209], params).unwrap();
//! while let Some(token) = session.next_token().unwrap() {
//!     println!("{token}");
//! }
//! ```

pub mod inference;
pub mod kernels;
pub mod model;
pub mod quant;
pub mod tensor;
pub mod utils;

pub use inference::{
    DecodeSession, Engine, GenerationParams, MemoryType, SessionState, SessionStats,
};
pub use kernels::{CpuFeatures, IsaTier, Kernels};
pub use model::{Architecture, HyperParams, ModelDescriptor, ModelFile, ModelWriter, TokenId, Tokenizer, Vocab};
pub use quant::{
    quantize_file, quantize_matrix, QuantAlgo, QuantizeConfig, ScaleDType, WeightDType,
};
pub use utils::{EngineError, Result};
