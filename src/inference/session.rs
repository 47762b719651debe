//! Decode session
//!
//! One session owns a KV cache and walks Idle → Prefill → Decode →
//! Finished. Tokens come out through a pull interface: the caller asks for
//! the next token and may simply stop asking; the cache is dropped with the
//! session. Any mid-decode error finishes the session; no partial step is
//! retried.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::inference::engine::Engine;
use crate::inference::kv_cache::KvCache;
use crate::inference::params::GenerationParams;
use crate::inference::sampler::{apply_repeat_penalty, Sampler};
use crate::kernels::Kernels;
use crate::model::graph::{ArchSpec, OpKind, ResidualStyle};
use crate::model::{graph, ModelDescriptor, TokenId};
use crate::tensor::{ops, ScratchArena, Tensor};
use crate::utils::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Prefill,
    Decode,
    Finished,
}

/// Timing and throughput snapshot for one session
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill_ms: f64,
    pub decode_ms: f64,
}

impl SessionStats {
    pub fn decode_tokens_per_second(&self) -> f64 {
        if self.decode_ms > 0.0 {
            self.generated_tokens as f64 / (self.decode_ms / 1000.0)
        } else {
            0.0
        }
    }
}

/// One decode session against a loaded engine.
pub struct DecodeSession<'a> {
    engine: &'a Engine,
    id: Uuid,
    params: GenerationParams,
    state: SessionState,
    cancelled: bool,
    cache: KvCache,
    arena: ScratchArena,
    sampler: Sampler,
    prompt: Vec<TokenId>,
    /// Prompt + generated ids, the repeat-penalty window source
    history: Vec<TokenId>,
    /// Next logical position (re-anchored in ring mode)
    n_past: i64,
    produced: usize,
    stats: SessionStats,
    k_scratch: Vec<f32>,
    v_scratch: Vec<f32>,
}

impl<'a> DecodeSession<'a> {
    pub(crate) fn open(
        engine: &'a Engine,
        prompt: Vec<TokenId>,
        params: GenerationParams,
    ) -> Result<Self> {
        let model = engine.model();
        params.validate(model.hparams.ctx_max)?;
        for &id in &prompt {
            if id >= model.hparams.n_vocab {
                return Err(EngineError::InvalidConfiguration(format!(
                    "prompt token {id} outside vocab of {}",
                    model.hparams.n_vocab
                )));
            }
        }

        let cache = KvCache::new(
            model.n_layer(),
            params.ctx_size,
            model.hparams.n_kv_head as usize,
            model.hparams.head_dim as usize,
            params.shift_roped_k,
            params.memory_type,
        )?;

        let seed = if params.seed < 0 {
            rand::random::<u64>()
        } else {
            params.seed as u64
        };
        let sampler = Sampler::new(params.temperature, params.top_k, params.top_p, seed);

        let id = Uuid::new_v4();
        info!(
            session = %id,
            prompt_tokens = prompt.len(),
            ctx_size = params.ctx_size,
            shift_roped_k = params.shift_roped_k,
            "session opened"
        );
        Ok(Self {
            engine,
            id,
            params,
            state: SessionState::Idle,
            cancelled: false,
            cache,
            arena: ScratchArena::new(),
            sampler,
            history: prompt.clone(),
            prompt,
            n_past: 0,
            produced: 0,
            stats: SessionStats::default(),
            k_scratch: Vec::new(),
            v_scratch: Vec::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Release the session; the next pull reports `Cancelled`.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.state = SessionState::Finished;
        debug!(session = %self.id, "session cancelled");
    }

    /// Pull the next sampled token. `Ok(None)` means the session finished
    /// cleanly; errors abort the session.
    pub fn next_token(&mut self) -> Result<Option<TokenId>> {
        if self.cancelled {
            return Err(EngineError::Cancelled);
        }
        if self.state == SessionState::Finished {
            return Ok(None);
        }
        if self.params.n_predict >= 0 && self.produced >= self.params.n_predict as usize {
            self.finish("n_predict reached");
            return Ok(None);
        }

        let result = self.advance();
        if let Err(e) = &result {
            warn!(session = %self.id, error = %e, "session aborted");
            self.state = SessionState::Finished;
        }
        result
    }

    /// Iterator adapter over [`Self::next_token`].
    pub fn tokens(&mut self) -> TokenStream<'_, 'a> {
        TokenStream { session: self }
    }

    fn finish(&mut self, why: &str) {
        if self.state != SessionState::Finished {
            debug!(session = %self.id, why, "session finished");
            self.state = SessionState::Finished;
            self.arena.reset();
        }
    }

    fn advance(&mut self) -> Result<Option<TokenId>> {
        let logits = match self.state {
            SessionState::Idle => {
                if self.prompt.is_empty() {
                    return Err(EngineError::InvalidConfiguration(
                        "cannot generate from an empty prompt".into(),
                    ));
                }
                self.state = SessionState::Prefill;
                let started = Instant::now();
                let logits = self.prefill()?;
                self.stats.prompt_tokens = self.prompt.len();
                self.stats.prefill_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.state = SessionState::Decode;
                logits
            }
            SessionState::Decode => {
                let started = Instant::now();
                let last = *self.history.last().ok_or_else(|| {
                    EngineError::Internal("decode state with empty history".into())
                })?;
                let logits = self.step(&[last], true)?.ok_or_else(|| {
                    EngineError::Internal("decode step produced no logits".into())
                })?;
                self.stats.decode_ms += started.elapsed().as_secs_f64() * 1000.0;
                logits
            }
            SessionState::Prefill | SessionState::Finished => {
                return Err(EngineError::Internal(format!(
                    "next_token in state {:?}",
                    self.state
                )))
            }
        };

        let mut logits = logits;
        if self.params.numeric_guard {
            if let Some(bad) = logits.iter().find(|l| !l.is_finite()) {
                return Err(EngineError::NumericFault(format!(
                    "non-finite logit {bad} at decode step {}",
                    self.produced
                )));
            }
        }

        let window = if self.params.keep < 0 {
            &self.history[..]
        } else {
            let keep = (self.params.keep as usize).min(self.history.len());
            &self.history[self.history.len() - keep..]
        };
        apply_repeat_penalty(&mut logits, window, self.params.repeat_penalty);

        let token = self.sampler.sample(&logits);
        self.produced += 1;
        self.stats.generated_tokens = self.produced;

        if token == self.engine.model().hparams.eos_token_id
            || self.params.stop_tokens.contains(&token)
        {
            self.finish("terminator token");
            return Ok(None);
        }
        self.history.push(token);
        Ok(Some(token))
    }

    /// Push the whole prompt through in batches; only the last batch
    /// produces logits.
    fn prefill(&mut self) -> Result<Vec<f32>> {
        let prompt = self.prompt.clone();
        let batch = self.params.batch_size_truncate;
        let mut logits = None;
        let n_chunks = prompt.len().div_ceil(batch);
        for (i, chunk) in prompt.chunks(batch).enumerate() {
            let want_logits = i + 1 == n_chunks;
            logits = self.step(chunk, want_logits)?;
        }
        logits.ok_or_else(|| EngineError::Internal("prefill produced no logits".into()))
    }

    /// One forward pass over `tokens`; returns final-position logits when
    /// asked. Updates the KV cache in place.
    fn step(&mut self, tokens: &[TokenId], want_logits: bool) -> Result<Option<Vec<f32>>> {
        let engine = self.engine;
        let model = engine.model();
        let spec = model.arch.spec();
        let kern = engine.kernels();
        let pool = engine.pool();
        let head_dim = model.hparams.head_dim as usize;
        let theta = model.hparams.rope_theta();
        let t = tokens.len();

        // Ring re-anchor: once the oldest live key's position passes
        // ctx_size, rotate all phases back so positions stay bounded.
        if self.params.shift_roped_k {
            if let Some(oldest) = self.cache.oldest_position(0) {
                if oldest >= self.cache.ctx_size() as i64 {
                    self.cache.shift_rope_k(oldest, theta, spec.rope)?;
                    self.n_past -= oldest;
                }
            }
        }

        let positions: Vec<usize> = (0..t).map(|i| self.n_past as usize + i).collect();

        let mut hidden = Tensor::zeros(t, model.n_embd());
        for (ti, &tok) in tokens.iter().enumerate() {
            model.embed_token(tok, hidden.row_mut(ti))?;
        }

        for layer in 0..model.n_layer() {
            let mut pending_norm: Option<String> = None;
            for step in spec.steps {
                match step.op {
                    OpKind::AttnNorm | OpKind::FfnNorm => {
                        pending_norm = Some(graph::resolve_name(step.weights[0], layer));
                    }
                    OpKind::Attention | OpKind::FeedForward => {
                        let norm_name = pending_norm.take().ok_or_else(|| {
                            EngineError::Internal("block step without a preceding norm".into())
                        })?;
                        let input = match spec.residual {
                            ResidualStyle::PreNorm => {
                                let mut x = hidden.clone();
                                norm_in_place(kern, model, spec, &norm_name, &mut x)?;
                                x
                            }
                            ResidualStyle::PostNorm => hidden.clone(),
                        };
                        let out = if step.op == OpKind::Attention {
                            self.attention_block(step.weights, layer, &input, &positions, head_dim)?
                        } else {
                            self.ffn_block(step.weights, layer, &input)?
                        };
                        for ti in 0..t {
                            (kern.vec_add_assign)(hidden.row_mut(ti), out.row(ti));
                        }
                        if spec.residual == ResidualStyle::PostNorm {
                            norm_in_place(kern, model, spec, &norm_name, &mut hidden)?;
                        }
                    }
                }
            }
        }

        self.n_past += t as i64;

        if !want_logits {
            return Ok(None);
        }

        // Logits for the final position only
        let mut last = Tensor::zeros(1, model.n_embd());
        last.row_mut(0).copy_from_slice(hidden.row(t - 1));
        norm_in_place(kern, model, spec, spec.final_norm, &mut last)?;
        let logits = ops::matmul(kern, pool, &last, model.weight(spec.output)?)?;
        Ok(Some(logits.into_vec()))
    }

    fn attention_block(
        &mut self,
        weights: &[&str],
        layer: usize,
        input: &Tensor,
        positions: &[usize],
        head_dim: usize,
    ) -> Result<Tensor> {
        let engine = self.engine;
        let model = engine.model();
        let spec = model.arch.spec();
        let kern = engine.kernels();
        let pool = engine.pool();
        let theta = model.hparams.rope_theta();

        let wq = graph::resolve_name(weights[0], layer);
        let wk = graph::resolve_name(weights[1], layer);
        let wv = graph::resolve_name(weights[2], layer);
        let wo = graph::resolve_name(weights[3], layer);

        let mut q = ops::matmul(kern, pool, input, model.weight(&wq)?)?;
        let mut k = ops::matmul(kern, pool, input, model.weight(&wk)?)?;
        let mut v = ops::matmul(kern, pool, input, model.weight(&wv)?)?;
        for (proj, name) in [(&mut q, &wq), (&mut k, &wk), (&mut v, &wv)] {
            if let Some(b) = model.vector_opt(&name.replace(".weight", ".bias")) {
                ops::bias_add(kern, proj, b)?;
            }
        }
        ops::rope(&mut q, head_dim, positions, theta, spec.rope)?;
        ops::rope(&mut k, head_dim, positions, theta, spec.rope)?;

        for ti in 0..input.t {
            self.cache
                .append(layer, k.row(ti), v.row(ti), positions[ti] as i64)?;
        }

        let inputs =
            self.cache
                .gather_attention_inputs(layer, &mut self.k_scratch, &mut self.v_scratch);
        let attn = ops::attention(
            kern,
            &q,
            &inputs,
            positions,
            model.hparams.n_head as usize,
            model.hparams.n_kv_head as usize,
            head_dim,
            &mut self.arena,
        )?;
        let mut out = ops::matmul(kern, pool, &attn, model.weight(&wo)?)?;
        if let Some(b) = model.vector_opt(&wo.replace(".weight", ".bias")) {
            ops::bias_add(kern, &mut out, b)?;
        }
        Ok(out)
    }

    fn ffn_block(&mut self, weights: &[&str], layer: usize, input: &Tensor) -> Result<Tensor> {
        let engine = self.engine;
        let model = engine.model();
        let spec = model.arch.spec();
        let kern = engine.kernels();
        let pool = engine.pool();

        let (gate, up, down) = if weights.len() == 3 {
            (
                Some(graph::resolve_name(weights[0], layer)),
                graph::resolve_name(weights[1], layer),
                graph::resolve_name(weights[2], layer),
            )
        } else {
            (
                None,
                graph::resolve_name(weights[0], layer),
                graph::resolve_name(weights[1], layer),
            )
        };
        let gate_w = match &gate {
            Some(name) => Some(model.weight(name)?),
            None => None,
        };
        ops::ffn(
            kern,
            pool,
            input,
            spec.ffn,
            gate_w,
            model.weight(&up)?,
            model.weight(&down)?,
            model.vector_opt(&up.replace(".weight", ".bias")),
            model.vector_opt(&down.replace(".weight", ".bias")),
        )
    }
}

fn norm_in_place(
    kern: &Kernels,
    model: &ModelDescriptor,
    spec: &ArchSpec,
    weight_name: &str,
    x: &mut Tensor,
) -> Result<()> {
    let gamma = model.vector(weight_name)?;
    let beta = model.vector_opt(&weight_name.replace(".weight", ".bias"));
    ops::norm(kern, x, spec.norm, Some(gamma), beta, spec.norm_eps)
}

/// Pull iterator over a session's tokens. Errors surface once, then the
/// stream ends.
pub struct TokenStream<'s, 'e> {
    session: &'s mut DecodeSession<'e>,
}

impl<'s, 'e> Iterator for TokenStream<'s, 'e> {
    type Item = Result<TokenId>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.session.next_token() {
            Ok(Some(id)) => Some(Ok(id)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
