pub mod engine;
pub mod kv_cache;
pub mod params;
pub mod sampler;
pub mod session;

pub use engine::Engine;
pub use kv_cache::KvCache;
pub use params::{GenerationParams, MemoryType};
pub use sampler::{apply_repeat_penalty, Sampler, XorShiftRng};
pub use session::{DecodeSession, SessionState, SessionStats, TokenStream};
