//! x87 FPU, MMX and SSE state with 80-bit extended-precision arithmetic.
//!
//! The register bank is one physical file with two tagged views: the x87
//! rotating stack and the MMX flat registers that alias its low 64 bits.
//! Transitions between the views rewrite the tag word; see [`state::FpuBank`].

pub mod arith;
pub mod f80;
pub mod state;
pub mod transcendental;

pub use f80::{F80, F80Class};
pub use state::{FpuBank, Tag};
pub use transcendental::HelperStatus;
