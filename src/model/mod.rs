pub mod descriptor;
pub mod format;
pub mod graph;
pub mod vocab;

pub use descriptor::ModelDescriptor;
pub use format::{HyperParams, ModelFile, ModelWriter, TensorEntry, VocabEntry};
pub use graph::{ArchSpec, Architecture, LayerStep, OpKind, ResidualStyle};
pub use vocab::{TokenId, Tokenizer, Vocab};
