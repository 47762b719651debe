//! Engine: loaded model + worker pool + kernel table
//!
//! One engine instance serves one decode session at a time. Weights are
//! read-only after load and shared with the workers without locking; the
//! session owns all mutable state.

use std::path::Path;

use tracing::info;

use crate::inference::params::GenerationParams;
use crate::inference::session::DecodeSession;
use crate::kernels::Kernels;
use crate::model::{ModelDescriptor, TokenId};
use crate::utils::{EngineError, Result};

pub struct Engine {
    model: ModelDescriptor,
    pool: rayon::ThreadPool,
    kern: &'static Kernels,
    threads: usize,
}

impl Engine {
    /// Load a model file and build the worker pool.
    pub fn load(path: &Path, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(EngineError::InvalidConfiguration(
                "thread count must be positive".to_string(),
            ));
        }
        let model = ModelDescriptor::load(path)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("nibble-worker-{i}"))
            .build()
            .map_err(|e| EngineError::ResourceExhausted(format!("worker pool: {e}")))?;
        let kern = Kernels::get();
        info!(
            threads,
            tier = kern.tier.name(),
            arch = model.arch.name(),
            "engine ready"
        );
        Ok(Self {
            model,
            pool,
            kern,
            threads,
        })
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    pub fn kernels(&self) -> &'static Kernels {
        self.kern
    }

    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Open a decode session over a prompt.
    pub fn open_session(
        &self,
        prompt: Vec<TokenId>,
        params: GenerationParams,
    ) -> Result<DecodeSession<'_>> {
        DecodeSession::open(self, prompt, params)
    }

    /// Run a whole session to completion and collect the output ids.
    pub fn generate(&self, prompt: Vec<TokenId>, params: GenerationParams) -> Result<Vec<TokenId>> {
        let mut session = self.open_session(prompt, params)?;
        let mut out = Vec::new();
        while let Some(id) = session.next_token()? {
            out.push(id);
        }
        Ok(out)
    }
}
