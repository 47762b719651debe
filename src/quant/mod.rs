pub mod block;
pub mod format;
pub mod nibble;
pub mod quantize;

pub use block::{DataRef, DenseTensor, QuantMatrix, WeightTensor};
pub use format::{ComputeDType, Fp8Kind, ScaleDType, Scales, TensorDType, WeightDType};
pub use nibble::NibbleBuffer;
pub use quantize::{quantize_file, quantize_matrix, QuantAlgo, QuantizeConfig, QuantizeReport};
