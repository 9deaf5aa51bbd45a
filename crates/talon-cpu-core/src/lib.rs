//! Guest CPU state, the lazy EFLAGS engine, guest memory management with
//! self-modifying-code detection, the translation cache, and the reference
//! IR interpreter.

pub mod cache;
pub mod eflags;
pub mod interp;
pub mod mem;
pub mod state;

pub use cache::{BlockId, ExitInfo, ExitKind, TranslationCache};
pub use eflags::{Eflags, FlagOp};
pub use mem::{GuestBus, MemError, MemoryManager, PageProt};
pub use state::CpuState;
