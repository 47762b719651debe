//! SIMD-dispatched numeric primitives
//!
//! The dispatch table is populated once at startup from the probed
//! instruction-set tier; call sites go through the table and never branch on
//! CPU features themselves. Tiers without their own implementation of an
//! operation resolve downward, ending at the scalar reference.

pub mod cpu;
pub mod scalar;

#[cfg(target_arch = "x86_64")]
mod avx2;
#[cfg(target_arch = "x86_64")]
mod avx512;

use std::sync::OnceLock;

pub use cpu::{CpuFeatures, IsaTier};
pub use scalar::{IntCodes, NibblePolicy, RopeMode};

/// Dispatch table keyed by operation; one instance per tier.
///
/// Operations not listed here (k-block dequantization, RoPE, norms,
/// reductions with strides) are driven by the table's vector primitives or
/// run the scalar reference directly; they are bandwidth-bound and gain
/// nothing from wider registers.
#[derive(Clone, Copy)]
pub struct Kernels {
    pub tier: IsaTier,
    pub vec_dot: fn(&[f32], &[f32]) -> f32,
    pub vec_axpy: fn(f32, &[f32], &mut [f32]),
    pub vec_add_assign: fn(&mut [f32], &[f32]),
    pub vec_mul_assign: fn(&mut [f32], &[f32]),
    pub unpack_i4: fn(&[u8], &mut [i8], NibblePolicy),
    pub softmax: fn(&mut [f32]),
    pub vec_silu: fn(&mut [f32]),
    pub vec_gelu: fn(&mut [f32]),
}

static DISPATCH: OnceLock<Kernels> = OnceLock::new();

impl Kernels {
    /// The table for the best tier this host supports, built once.
    pub fn get() -> &'static Kernels {
        DISPATCH.get_or_init(|| {
            let tier = CpuFeatures::get().best_tier;
            tracing::info!(tier = tier.name(), "kernel dispatch table selected");
            Self::for_tier(tier)
        })
    }

    /// The scalar reference table.
    pub fn reference() -> Kernels {
        Kernels {
            tier: IsaTier::Scalar,
            vec_dot: scalar::vec_dot,
            vec_axpy: scalar::vec_axpy,
            vec_add_assign: scalar::vec_add_assign,
            vec_mul_assign: scalar::vec_mul_assign,
            unpack_i4: scalar::unpack_i4,
            softmax: scalar::softmax,
            vec_silu: scalar::vec_silu,
            vec_gelu: scalar::vec_gelu,
        }
    }

    /// Build the table for an explicit tier. Callers must ensure the host
    /// actually supports `tier` (see [`CpuFeatures::supports`]); tests
    /// iterate the supported tiers and cross-check against the reference.
    pub fn for_tier(tier: IsaTier) -> Kernels {
        let mut k = Self::reference();
        k.tier = tier;
        #[cfg(target_arch = "x86_64")]
        {
            if tier >= IsaTier::Avx2 {
                k.vec_dot = avx2::vec_dot;
                k.vec_axpy = avx2::vec_axpy;
                k.vec_add_assign = avx2::vec_add_assign;
                k.vec_mul_assign = avx2::vec_mul_assign;
                k.unpack_i4 = avx2::unpack_i4;
            }
            if tier >= IsaTier::Avx512f {
                k.vec_dot = avx512::vec_dot;
                k.vec_axpy = avx512::vec_axpy;
            }
            // Avx512Vnni and Amx resolve downward until their integer tile
            // kernels ship.
        }
        k
    }
}
