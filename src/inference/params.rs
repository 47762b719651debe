//! Generation parameters

use serde::{Deserialize, Serialize};

use crate::utils::{EngineError, Result};

/// KV cache storage precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Resolves to f16
    #[default]
    Auto,
    F16,
    F32,
}

impl MemoryType {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "f32" | "fp32" => Self::F32,
            "f16" | "fp16" => Self::F16,
            _ => Self::Auto,
        }
    }
}

/// Parameters for one decode session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Context window for this session; must not exceed the model maximum
    pub ctx_size: usize,

    /// Largest number of prompt tokens pushed through one prefill pass
    pub batch_size_truncate: usize,

    /// Worker threads for the numeric primitives
    pub threads: usize,

    /// Number of tokens to generate (-1 = until a stop condition)
    pub n_predict: i32,

    /// Sampling seed (< 0 draws one from the OS entropy pool)
    pub seed: i64,

    /// Temperature (0.0 = argmax)
    pub temperature: f32,

    /// Top-k cutoff (0 = disabled)
    pub top_k: i32,

    /// Top-p nucleus mass (1.0 = disabled)
    pub top_p: f32,

    /// Repeat penalty (1.0 = disabled)
    pub repeat_penalty: f32,

    /// Window of recent tokens the repeat penalty looks at (-1 = all)
    pub keep: i32,

    /// Ring-buffer KV eviction with rotary phase re-anchoring
    pub shift_roped_k: bool,

    /// KV cache storage precision
    pub memory_type: MemoryType,

    /// Extra terminator token ids on top of the model eos
    pub stop_tokens: Vec<u32>,

    /// Abort with NumericFault when logits go NaN/Inf
    pub numeric_guard: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            ctx_size: 512,
            batch_size_truncate: 512,
            threads: num_cpus::get(),
            n_predict: -1,
            seed: -1,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            keep: -1,
            shift_roped_k: false,
            memory_type: MemoryType::Auto,
            stop_tokens: vec![],
            numeric_guard: false,
        }
    }
}

impl GenerationParams {
    /// Validate against a model's context maximum.
    pub fn validate(&self, ctx_max: u32) -> Result<()> {
        if self.ctx_size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "ctx_size must be positive".to_string(),
            ));
        }
        if self.ctx_size > ctx_max as usize {
            return Err(EngineError::InvalidConfiguration(format!(
                "ctx_size {} exceeds model maximum {ctx_max}",
                self.ctx_size
            )));
        }
        if self.batch_size_truncate == 0 {
            return Err(EngineError::InvalidConfiguration(
                "batch_size_truncate must be positive".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(EngineError::InvalidConfiguration(
                "thread count must be positive".to_string(),
            ));
        }
        if self.temperature < 0.0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if self.top_k < 0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "top_k must be non-negative, got {}",
                self.top_k
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::InvalidConfiguration(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.repeat_penalty < 1.0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "repeat_penalty must be >= 1, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    pub fn with_ctx_size(mut self, ctx_size: usize) -> Self {
        self.ctx_size = ctx_size;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_shift_roped_k(mut self, on: bool) -> Self {
        self.shift_roped_k = on;
        self
    }
}
