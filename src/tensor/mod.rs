//! Activation tensors
//!
//! Activations are always dense f32 on the compute path; bf16 storage is
//! converted at the boundaries. Weights stay in their quantized containers
//! (see [`crate::quant`]).

pub mod arena;
pub mod ops;

pub use arena::ScratchArena;

use crate::utils::{EngineError, Result};

/// A dense [tokens, hidden] activation tensor. The batch dimension is
/// carried by the decode controller; a tensor is one batch row.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub t: usize,
    pub h: usize,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(t: usize, h: usize) -> Self {
        Self {
            t,
            h,
            data: vec![0.0; t * h],
        }
    }

    pub fn from_vec(t: usize, h: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != t * h {
            return Err(EngineError::Internal(format!(
                "tensor data {} elements for shape [{t}, {h}]",
                data.len()
            )));
        }
        Ok(Self { t, h, data })
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.h..(i + 1) * self.h]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.h..(i + 1) * self.h]
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}
