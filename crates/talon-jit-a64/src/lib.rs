//! AArch64 backend: register allocation, instruction encoding, IR lowering,
//! and the block translation pipeline.

pub mod a64;
pub mod abi;
pub mod codegen;
pub mod regalloc;
pub mod translate;

pub use codegen::EmitError;
pub use translate::{translate_block, TranslateError, Translation};
