//! Token sampling
//!
//! Temperature / top-k / top-p sampling with a repeat penalty over a recent
//! window, drawn from a seeded xorshift generator so fixed-seed runs are
//! reproducible. Zero temperature short-circuits to argmax.

use crate::model::TokenId;

/// xorshift64* generator; deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub fn new(seed: u64) -> Self {
        Self {
            // The all-zero state is a fixed point
            state: if seed == 0 { 0x9e3779b97f4a7c15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    /// Uniform in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Divide positive logits by the penalty and multiply negative ones, for
/// every id in the recent window. Penalty 1.0 is a no-op.
pub fn apply_repeat_penalty(logits: &mut [f32], recent: &[TokenId], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &id in recent {
        if let Some(l) = logits.get_mut(id as usize) {
            if *l > 0.0 {
                *l /= penalty;
            } else {
                *l *= penalty;
            }
        }
    }
}

/// Sampler state for one session
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: i32,
    top_p: f32,
    rng: XorShiftRng,
}

impl Sampler {
    pub fn new(temperature: f32, top_k: i32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_k,
            top_p,
            rng: XorShiftRng::new(seed),
        }
    }

    /// Draw the next token id from a logit row.
    pub fn sample(&mut self, logits: &[f32]) -> TokenId {
        if self.temperature == 0.0 {
            return argmax(logits);
        }

        // Candidates sorted by logit, best first
        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, l)| !l.is_nan())
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 && (self.top_k as usize) < candidates.len() {
            candidates.truncate(self.top_k as usize);
        }

        // Softmax over the kept candidates
        let inv_t = 1.0 / self.temperature;
        let max = candidates.first().map(|c| c.1).unwrap_or(0.0);
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|(_, l)| ((l - max) * inv_t).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        // Nucleus cut: smallest prefix reaching the top-p mass
        if self.top_p < 1.0 {
            let mut cum = 0.0;
            let mut keep = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cum += p;
                if cum >= self.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
            probs.truncate(keep);
            let sum: f32 = probs.iter().sum();
            for p in probs.iter_mut() {
                *p /= sum;
            }
        }

        let draw = self.rng.next_f32();
        let mut cum = 0.0;
        for (i, p) in probs.iter().enumerate() {
            cum += p;
            if draw < cum {
                return candidates[i].0 as TokenId;
            }
        }
        candidates.last().map(|c| c.0 as TokenId).unwrap_or(0)
    }
}

fn argmax(logits: &[f32]) -> TokenId {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &l) in logits.iter().enumerate() {
        if l > best_val {
            best_val = l;
            best = i;
        }
    }
    best as TokenId
}
