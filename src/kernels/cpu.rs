//! CPU feature probe and instruction-set tiers
//!
//! The host is probed exactly once; the result is a process-lifetime
//! read-only record. Call sites never branch on features directly; they go
//! through the dispatch table in [`super::Kernels`], which is populated from
//! the probed tier at startup.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Instruction-set tiers, totally ordered from weakest to strongest.
///
/// Every primitive has a `Scalar` reference implementation. A tier without
/// its own implementation of some primitive resolves downward to the best
/// implementation below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsaTier {
    /// Portable reference kernels, no SIMD
    Scalar,
    /// 256-bit vectors, requires AVX2 + FMA
    Avx2,
    /// 512-bit vectors, AVX-512 foundation
    Avx512f,
    /// AVX-512 with integer dot-product extensions
    Avx512Vnni,
    /// Advanced matrix extensions (probed, resolves downward)
    Amx,
}

impl IsaTier {
    pub fn name(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Avx2 => "avx2",
            Self::Avx512f => "avx512f",
            Self::Avx512Vnni => "avx512vnni",
            Self::Amx => "amx",
        }
    }

    /// All tiers at or below this one, strongest first.
    pub fn fallback_chain(self) -> impl Iterator<Item = IsaTier> {
        const ORDER: [IsaTier; 5] = [
            IsaTier::Amx,
            IsaTier::Avx512Vnni,
            IsaTier::Avx512f,
            IsaTier::Avx2,
            IsaTier::Scalar,
        ];
        ORDER.into_iter().filter(move |t| *t <= self)
    }
}

/// Detected CPU capabilities
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub best_tier: IsaTier,
    pub avx2: bool,
    pub fma: bool,
    pub avx512f: bool,
    pub avx512vnni: bool,
    pub amx_int8: bool,
}

static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

impl CpuFeatures {
    /// Probe the host CPU. The first call performs the detection; subsequent
    /// calls return the cached record.
    pub fn get() -> &'static CpuFeatures {
        FEATURES.get_or_init(Self::probe)
    }

    #[cfg(target_arch = "x86_64")]
    fn probe() -> CpuFeatures {
        let avx2 = std::arch::is_x86_feature_detected!("avx2");
        let fma = std::arch::is_x86_feature_detected!("fma");
        let avx512f = std::arch::is_x86_feature_detected!("avx512f");
        let avx512vnni = std::arch::is_x86_feature_detected!("avx512vnni");
        // AMX needs OS tile-state opt-in on top of CPUID; treated as absent
        // until tile kernels ship.
        let amx_int8 = false;

        let best_tier = if avx512vnni {
            IsaTier::Avx512Vnni
        } else if avx512f {
            IsaTier::Avx512f
        } else if avx2 && fma {
            IsaTier::Avx2
        } else {
            IsaTier::Scalar
        };

        CpuFeatures {
            best_tier,
            avx2,
            fma,
            avx512f,
            avx512vnni,
            amx_int8,
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn probe() -> CpuFeatures {
        CpuFeatures {
            best_tier: IsaTier::Scalar,
            avx2: false,
            fma: false,
            avx512f: false,
            avx512vnni: false,
            amx_int8: false,
        }
    }

    /// Whether kernels for `tier` may run on this host.
    pub fn supports(&self, tier: IsaTier) -> bool {
        tier <= self.best_tier
    }
}
