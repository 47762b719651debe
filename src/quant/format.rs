//! Scalar and weight storage formats
//!
//! Weight formats are 4/8-bit integer plus the micro-float family (E4M3,
//! E5M2, E2M1) and NF4, a 16-entry normal-quantile lookup. Scales ride along
//! per k-block in f32, bf16, or E4M3.

use half::bf16;
use serde::{Deserialize, Serialize};

use crate::utils::{EngineError, Result};

/// Weight storage format for a quantized tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightDType {
    /// Signed 4-bit integer, two codes per byte
    Int4,
    /// Signed 8-bit integer
    Int8,
    /// 8-bit micro-float, 4 exponent / 3 mantissa bits
    Fp8E4M3,
    /// 8-bit micro-float, 5 exponent / 2 mantissa bits
    Fp8E5M2,
    /// 4-bit micro-float, 2 exponent / 1 mantissa bit
    Fp4E2M1,
    /// 4-bit normal-float lookup
    Nf4,
}

impl WeightDType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int4 => "int4",
            Self::Int8 => "int8",
            Self::Fp8E4M3 => "fp8_e4m3",
            Self::Fp8E5M2 => "fp8_e5m2",
            Self::Fp4E2M1 => "fp4_e2m1",
            Self::Nf4 => "nf4",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "int4" => Ok(Self::Int4),
            "int8" => Ok(Self::Int8),
            "fp8_e4m3" => Ok(Self::Fp8E4M3),
            "fp8_e5m2" => Ok(Self::Fp8E5M2),
            "fp4_e2m1" => Ok(Self::Fp4E2M1),
            "nf4" => Ok(Self::Nf4),
            other => Err(EngineError::InvalidConfiguration(format!(
                "unknown weight dtype '{other}'"
            ))),
        }
    }

    /// Bits per stored code
    pub fn code_bits(self) -> usize {
        match self {
            Self::Int8 | Self::Fp8E4M3 | Self::Fp8E5M2 => 8,
            Self::Int4 | Self::Fp4E2M1 | Self::Nf4 => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int4 | Self::Int8)
    }
}

/// Scale storage format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDType {
    F32,
    Bf16,
    Fp8E4M3,
}

impl ScaleDType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::Bf16 => "bf16",
            Self::Fp8E4M3 => "fp8_e4m3",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "f32" | "fp32" => Ok(Self::F32),
            "bf16" => Ok(Self::Bf16),
            "fp8_e4m3" | "fp8" => Ok(Self::Fp8E4M3),
            other => Err(EngineError::InvalidConfiguration(format!(
                "unknown scale dtype '{other}'"
            ))),
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::Bf16 => 2,
            Self::Fp8E4M3 => 1,
        }
    }
}

/// Compute path the quantized tensor is intended for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDType {
    F32,
    Bf16,
    Int8,
}

impl ComputeDType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "fp32",
            Self::Bf16 => "bf16",
            Self::Int8 => "int8",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fp32" | "f32" => Ok(Self::F32),
            "bf16" => Ok(Self::Bf16),
            "int8" => Ok(Self::Int8),
            other => Err(EngineError::InvalidConfiguration(format!(
                "unknown compute dtype '{other}'"
            ))),
        }
    }
}

/// NF4 dequantization table: quantiles of a unit normal, normalized to
/// [-1, 1], code 7 pinned to exactly zero.
pub const NF4_TABLE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// E2M1 dequantization table, indexed by the 4-bit code (bit 3 = sign).
pub const FP4_E2M1_TABLE: [f32; 16] = [
    0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0, -0.0, -0.5, -1.0, -1.5, -2.0, -3.0, -4.0, -6.0,
];

/// 8-bit micro-float flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fp8Kind {
    E4M3,
    E5M2,
}

/// Decode an 8-bit micro-float byte.
///
/// E4M3 carries bias 7 and no infinities (0x7f/0xff decode to NaN); E5M2 is
/// IEEE-like with bias 15, infinities and NaNs.
pub fn fp8_to_f32(bits: u8, kind: Fp8Kind) -> f32 {
    let sign = if bits & 0x80 != 0 { -1.0f32 } else { 1.0 };
    match kind {
        Fp8Kind::E4M3 => {
            let e = ((bits >> 3) & 0x0f) as i32;
            let m = (bits & 0x07) as f32;
            if e == 0x0f && bits & 0x07 == 0x07 {
                return f32::NAN;
            }
            if e == 0 {
                sign * (m / 8.0) * (-6.0f32).exp2()
            } else {
                sign * (1.0 + m / 8.0) * ((e - 7) as f32).exp2()
            }
        }
        Fp8Kind::E5M2 => {
            let e = ((bits >> 2) & 0x1f) as i32;
            let m = (bits & 0x03) as f32;
            if e == 0x1f {
                return if m == 0.0 { sign * f32::INFINITY } else { f32::NAN };
            }
            if e == 0 {
                sign * (m / 4.0) * (-14.0f32).exp2()
            } else {
                sign * (1.0 + m / 4.0) * ((e - 15) as f32).exp2()
            }
        }
    }
}

/// Encode f32 into an 8-bit micro-float, round to nearest, clamped to the
/// format's finite range.
pub fn f32_to_fp8(x: f32, kind: Fp8Kind) -> u8 {
    // (mantissa bits, bias, max unbiased exponent, mantissa cap at the top
    // exponent, largest finite value). E4M3 spends its top exponent on
    // finite values and reserves only mantissa 7 for NaN.
    let (mant_bits, bias, max_e, top_mant, max_finite) = match kind {
        Fp8Kind::E4M3 => (3u32, 7i32, 8i32, 6u32, 448.0f32),
        Fp8Kind::E5M2 => (2u32, 15i32, 15i32, 3u32, 57344.0f32),
    };
    if x.is_nan() {
        return match kind {
            Fp8Kind::E4M3 => 0x7f,
            Fp8Kind::E5M2 => 0x7e,
        };
    }
    let sign = if x.is_sign_negative() { 0x80u8 } else { 0 };
    let mag = x.abs().min(max_finite);
    if mag == 0.0 {
        return sign;
    }

    let mant_scale = (1u32 << mant_bits) as f32;
    let min_normal_exp = 1 - bias;
    let e = mag.log2().floor() as i32;
    if e < min_normal_exp {
        // Subnormal: unit is 2^(min_normal_exp - mant_bits)
        let unit = ((min_normal_exp - mant_bits as i32) as f32).exp2();
        let q = (mag / unit).round() as u32;
        if q >= mant_scale as u32 {
            return sign | (1 << mant_bits) as u8; // rounded up into the first normal
        }
        return sign | q as u8;
    }
    let mut e = e;
    let mut frac = mag / (e as f32).exp2();
    // log2/exp2 round-off can land frac outside [1, 2)
    if frac >= 2.0 {
        e += 1;
        frac /= 2.0;
    } else if frac < 1.0 {
        e -= 1;
        frac *= 2.0;
    }
    let mut m = ((frac - 1.0) * mant_scale).round() as u32;
    if m >= 1 << mant_bits {
        m = 0;
        e += 1;
    }
    if e > max_e || (e == max_e && m > top_mant) {
        e = max_e;
        m = top_mant;
    }
    sign | (((e + bias) as u8) << mant_bits) | m as u8
}

/// Borrowed view over a scale buffer; values upcast to f32 per use.
///
/// The `*Le` variants read little-endian bytes directly, so byte buffers
/// straight out of the mapping or the quantizer need no alignment or copy.
#[derive(Debug, Clone, Copy)]
pub enum Scales<'a> {
    F32(&'a [f32]),
    Bf16(&'a [bf16]),
    F32Le(&'a [u8]),
    Bf16Le(&'a [u8]),
    Fp8E4M3(&'a [u8]),
}

impl<'a> Scales<'a> {
    #[inline]
    pub fn get(&self, i: usize) -> f32 {
        match self {
            Scales::F32(s) => s[i],
            Scales::Bf16(s) => s[i].to_f32(),
            Scales::F32Le(b) => {
                f32::from_le_bytes([b[i * 4], b[i * 4 + 1], b[i * 4 + 2], b[i * 4 + 3]])
            }
            Scales::Bf16Le(b) => bf16::from_le_bytes([b[i * 2], b[i * 2 + 1]]).to_f32(),
            Scales::Fp8E4M3(s) => fp8_to_f32(s[i], Fp8Kind::E4M3),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Scales::F32(s) => s.len(),
            Scales::Bf16(s) => s.len(),
            Scales::F32Le(b) => b.len() / 4,
            Scales::Bf16Le(b) => b.len() / 2,
            Scales::Fp8E4M3(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// On-disk dtype tag for a tensor directory entry.
///
/// Layout: bits 0-7 element kind, bits 8-9 scale dtype, bit 10 zero-point
/// presence, bits 11-12 log2(pack_row), bits 16-31 group size (0 means
/// per-column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDType {
    /// Dense f32, no block metadata
    F32,
    /// Dense f16
    F16,
    /// Dense bf16
    Bf16,
    /// Block-quantized weight
    Quantized {
        weight: WeightDType,
        scale: ScaleDType,
        has_zero_points: bool,
        group_size: usize,
        pack_row: usize,
    },
}

const KIND_F32: u32 = 0;
const KIND_F16: u32 = 1;
const KIND_BF16: u32 = 2;
const KIND_INT8: u32 = 3;
const KIND_INT4: u32 = 4;
const KIND_E4M3: u32 = 5;
const KIND_E5M2: u32 = 6;
const KIND_E2M1: u32 = 7;
const KIND_NF4: u32 = 8;

impl TensorDType {
    pub fn to_tag(self) -> u32 {
        match self {
            Self::F32 => KIND_F32,
            Self::F16 => KIND_F16,
            Self::Bf16 => KIND_BF16,
            Self::Quantized {
                weight,
                scale,
                has_zero_points,
                group_size,
                pack_row,
            } => {
                let kind = match weight {
                    WeightDType::Int8 => KIND_INT8,
                    WeightDType::Int4 => KIND_INT4,
                    WeightDType::Fp8E4M3 => KIND_E4M3,
                    WeightDType::Fp8E5M2 => KIND_E5M2,
                    WeightDType::Fp4E2M1 => KIND_E2M1,
                    WeightDType::Nf4 => KIND_NF4,
                };
                let scale_bits = match scale {
                    ScaleDType::F32 => 0u32,
                    ScaleDType::Bf16 => 1,
                    ScaleDType::Fp8E4M3 => 2,
                };
                let pack_bits = match pack_row {
                    1 => 0u32,
                    2 => 1,
                    4 => 2,
                    _ => 0,
                };
                kind | (scale_bits << 8)
                    | ((has_zero_points as u32) << 10)
                    | (pack_bits << 11)
                    | ((group_size as u32) << 16)
            }
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        let kind = tag & 0xff;
        let weight = match kind {
            KIND_F32 => return Ok(Self::F32),
            KIND_F16 => return Ok(Self::F16),
            KIND_BF16 => return Ok(Self::Bf16),
            KIND_INT8 => WeightDType::Int8,
            KIND_INT4 => WeightDType::Int4,
            KIND_E4M3 => WeightDType::Fp8E4M3,
            KIND_E5M2 => WeightDType::Fp8E5M2,
            KIND_E2M1 => WeightDType::Fp4E2M1,
            KIND_NF4 => WeightDType::Nf4,
            other => {
                return Err(EngineError::MalformedModel(format!(
                    "unknown dtype tag kind {other}"
                )))
            }
        };
        let scale = match (tag >> 8) & 0x3 {
            0 => ScaleDType::F32,
            1 => ScaleDType::Bf16,
            2 => ScaleDType::Fp8E4M3,
            other => {
                return Err(EngineError::MalformedModel(format!(
                    "unknown scale dtype bits {other}"
                )))
            }
        };
        let has_zero_points = (tag >> 10) & 1 == 1;
        let pack_row = 1usize << ((tag >> 11) & 0x3);
        if pack_row == 8 {
            return Err(EngineError::MalformedModel(
                "pack_row field out of range".into(),
            ));
        }
        let group_size = (tag >> 16) as usize;
        Ok(Self::Quantized {
            weight,
            scale,
            has_zero_points,
            group_size,
            pack_row,
        })
    }
}
