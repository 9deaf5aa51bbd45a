//! Block translation pipeline: allocate registers, emit AArch64 code, and
//! provide the branch patcher the translation cache's chaining pass uses.
//!
//! Decoding stays with the caller so a failed decode never reaches the
//! backend; a failed emission likewise produces no partial artifacts.

use thiserror::Error;

use talon_cpu_core::cache::{ExitInfo, PatchOutcome, PatchRequest};
use talon_x86::ir::IrBlock;

use crate::a64::patch_branch_site;
use crate::codegen::{emit_block, EmitError};
use crate::regalloc::allocate;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// A finished translation, ready for the cache.
pub struct Translation {
    pub code: Vec<u8>,
    pub exits: Vec<ExitInfo>,
}

/// Lowers one IR block to host code.
pub fn translate_block(block: &IrBlock) -> Result<Translation, TranslateError> {
    let map = allocate(block);
    let emitted = emit_block(block, &map)?;
    tracing::trace!(
        entry = format_args!("{:#x}", block.start),
        bytes = emitted.code.len(),
        exits = emitted.exits.len(),
        "translated block"
    );
    Ok(Translation {
        code: emitted.code,
        exits: emitted.exits,
    })
}

/// Branch patcher for [`talon_cpu_core::cache::TranslationCache::chain`]:
/// writes a direct `B` when the displacement fits the 26-bit immediate and
/// falls back to the reserved long-form veneer otherwise.
pub fn chain_patcher(req: PatchRequest<'_>) -> PatchOutcome {
    let site_abs = req.code[req.site..].as_ptr() as u64;
    let target_abs = site_abs.wrapping_add(req.rel as u64);
    if patch_branch_site(req.code, req.site, req.rel, target_abs) {
        PatchOutcome::PatchedLong
    } else {
        PatchOutcome::Patched
    }
}
