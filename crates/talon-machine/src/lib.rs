//! Embedder façade: one opaque [`Machine`] owning the guest CPU state, the
//! memory manager, the translation cache and the JIT context.
//!
//! The embedder supplies guest memory and event hooks through a
//! [`GuestBus`] at construction; afterwards it drives the dispatcher loop
//! with [`Machine::execute`], which translates on miss and returns the next
//! guest address. On AArch64 hosts the emitted code runs natively; on other
//! hosts the retained IR runs through the reference interpreter so the full
//! pipeline stays exercised.

mod error;
mod helpers;

pub use error::{error_string, last_error, CoreError};
pub use talon_cpu_core::mem::{FlatTestBus, GuestBus};

use talon_cpu_core::cache::{BlockId, StoreError, TranslationCache};
#[cfg(not(target_arch = "aarch64"))]
use talon_cpu_core::interp::{self, BlockExit};
use talon_cpu_core::mem::{MemConfig, MemoryManager};
use talon_cpu_core::state::CpuState;
use talon_fpu::{F80, FpuBank};
use talon_jit_a64::abi::JitCtx;
use talon_jit_a64::translate::{chain_patcher, translate_block};
use talon_types::{BarrierKind, Gpr, LogLevel, Width};
use talon_x86::ir::Inst;
use talon_x86::{decode_block, BlockLimits};

use crate::error::{clear_last_error, set_last_error};
use crate::helpers::Runtime;

/// Configuration fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub page_size: u32,
    /// Executable-arena budget in bytes.
    pub code_cache_bytes: usize,
    pub smc_detection: bool,
    /// Conservative memory model: data-memory barriers around
    /// guest-observable stores.
    pub conservative_memory: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            page_size: 4096,
            code_cache_bytes: 16 * 1024 * 1024,
            smc_detection: true,
            conservative_memory: false,
        }
    }
}

/// Whole-state snapshot for atomic save/restore through the façade.
#[derive(Debug, Clone)]
pub struct CpuSnapshot {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub fpu: FpuBank,
}

/// Cache statistics exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks: usize,
    pub chained_blocks: usize,
}

pub struct Machine {
    mem: Box<MemoryManager>,
    tc: Box<TranslationCache>,
    state: Box<CpuState>,
    ctx: Box<JitCtx>,
    _runtime: Box<Runtime>,
    pending_barriers: Vec<BarrierKind>,
    decode_window: usize,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").finish_non_exhaustive()
    }
}

impl Machine {
    /// Initializes the translator around the embedder's bus.
    pub fn new(bus: Box<dyn GuestBus>, cfg: JitConfig) -> Result<Machine, CoreError> {
        clear_last_error();
        if !cfg.page_size.is_power_of_two() || cfg.code_cache_bytes == 0 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        let mem = Box::new(MemoryManager::new(
            bus,
            MemConfig {
                page_size: cfg.page_size,
                smc_detection: cfg.smc_detection,
                conservative: cfg.conservative_memory,
            },
        ));
        let capacity = (cfg.code_cache_bytes / 256).max(64);
        let tc = Box::new(TranslationCache::new(cfg.code_cache_bytes, capacity));
        let mut state = Box::new(CpuState::new());

        let runtime = Box::new(Runtime {
            mem: &*mem,
            tc: &*tc,
        });
        let ctx = Box::new(JitCtx {
            state: &mut *state,
            runtime: (&*runtime as *const Runtime).cast_mut().cast(),
            pending_exception: 0,
            pending_addr: 0,
            scratch16: [0; 32],
            helpers: helpers::build_table(),
        });

        tracing::debug!(
            page_size = cfg.page_size,
            arena_bytes = cfg.code_cache_bytes,
            smc = cfg.smc_detection,
            "translator initialized"
        );
        Ok(Machine {
            mem,
            tc,
            state,
            ctx,
            _runtime: runtime,
            pending_barriers: Vec::new(),
            decode_window: 1024,
        })
    }

    // ---- translation ----

    /// Ensures a translation exists for `addr`, storing and chaining it.
    pub fn translate(&mut self, addr: u32) -> Result<BlockId, CoreError> {
        clear_last_error();
        if let Some(id) = self.tc.lookup(addr) {
            return Ok(id);
        }
        let mut window = vec![0u8; self.decode_window];
        self.mem.read_block(addr, &mut window);
        let limits = BlockLimits {
            max_bytes: self.decode_window,
            max_insts: 2048,
        };
        let (func, len) = decode_block(&window, addr, limits).map_err(|err| {
            self.mem
                .log(LogLevel::Warning, &format!("decode failed: {err}"));
            set_last_error(CoreError::TranslationFailed)
        })?;
        let mut block = func.blocks.into_iter().next().unwrap();
        if !self.pending_barriers.is_empty() {
            let barriers: Vec<Inst> = self
                .pending_barriers
                .drain(..)
                .map(|kind| Inst::Barrier { kind })
                .collect();
            block.insts.splice(0..0, barriers);
        }

        let translation = translate_block(&block).map_err(|err| {
            self.mem
                .log(LogLevel::Warning, &format!("emit failed: {err}"));
            set_last_error(CoreError::TranslationFailed)
        })?;
        let id = self
            .tc
            .store(addr, len as u32, block, &translation.code, translation.exits)
            .map_err(|StoreError::ArenaFull| set_last_error(CoreError::MemoryAllocation))?;
        self.mem.register_code_pages(addr, len as u32);
        self.tc.chain(addr, &mut chain_patcher);
        Ok(id)
    }

    /// True when a translation exists (does not touch recency).
    #[must_use]
    pub fn lookup(&self, addr: u32) -> bool {
        self.tc.contains(addr)
    }

    /// Executes the block at `addr` (translating on miss) and returns the
    /// next guest address. EIP is updated to the returned address.
    pub fn execute(&mut self, addr: u32) -> Result<u32, CoreError> {
        let id = self.translate(addr)?;
        clear_last_error();
        let next = self.run_block(id)?;
        self.state.eip = next;
        Ok(next)
    }

    /// Dispatcher convenience: executes until the guest reaches `stop`, a
    /// HLT, or `max_blocks` is exhausted.
    pub fn run_until(&mut self, entry: u32, stop: u32, max_blocks: usize) -> Result<u32, CoreError> {
        let mut eip = entry;
        for _ in 0..max_blocks {
            let next = self.execute(eip)?;
            if next == stop {
                return Ok(next);
            }
            eip = next;
        }
        Err(set_last_error(CoreError::ExecutionFailed))
    }

    #[cfg(target_arch = "aarch64")]
    fn run_block(&mut self, id: BlockId) -> Result<u32, CoreError> {
        let entry = self
            .tc
            .entry_ptr(id)
            .ok_or_else(|| set_last_error(CoreError::ExecutionFailed))?;
        self.ctx.pending_exception = 0;
        let f: extern "C" fn(*mut JitCtx) -> u32 = unsafe { std::mem::transmute(entry) };
        let next = f(&mut *self.ctx);
        if self.ctx.pending_exception != 0 {
            let vector = (self.ctx.pending_exception - 1) as u8;
            let addr = self.ctx.pending_addr;
            self.deliver_vector(vector, addr);
            self.ctx.pending_exception = 0;
            return Ok(addr);
        }
        Ok(next)
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn run_block(&mut self, id: BlockId) -> Result<u32, CoreError> {
        // Non-AArch64 host: run the retained IR through the reference
        // interpreter; the emitted code was still produced and cached.
        let ir = self
            .tc
            .ir_of(id)
            .ok_or_else(|| set_last_error(CoreError::ExecutionFailed))?;
        match interp::execute_block(&ir, &mut self.state, &self.mem, &self.tc) {
            Ok(BlockExit::Jump(next)) => Ok(next),
            Ok(BlockExit::Interrupt { vector, next }) => {
                self.mem
                    .with_bus(|bus| bus.software_interrupt(vector, next));
                Ok(next)
            }
            Ok(BlockExit::Halt { next }) => Ok(next),
            Err(fault) => {
                self.mem
                    .deliver_guest_exception(fault.exception, 0, fault.addr);
                Ok(fault.addr)
            }
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn deliver_vector(&self, vector: u8, addr: u32) {
        use talon_types::Exception;
        let exception = match vector {
            0 => Exception::DivideError,
            6 => Exception::InvalidOpcode,
            14 => Exception::PageFault,
            16 => Exception::X87Fpu,
            19 => Exception::SimdFloat,
            _ => Exception::GeneralProtection,
        };
        self.mem.deliver_guest_exception(exception, 0, addr);
    }

    // ---- invalidation and SMC ----

    pub fn invalidate_range(&mut self, addr: u32, len: u32) {
        self.tc.invalidate_range(addr, addr.wrapping_add(len.max(1)));
    }

    pub fn notify_modified(&mut self, addr: u32, len: u32) {
        self.mem.notify_modified(&self.tc, addr, len);
    }

    pub fn register_code_memory(&mut self, addr: u32, len: u32) {
        self.mem.register_code_pages(addr, len);
    }

    /// Write-protection fault entry; `Ok(true)` when the fault belonged to
    /// a code page and was handled.
    pub fn handle_protection_fault(&mut self, addr: u32) -> Result<bool, CoreError> {
        clear_last_error();
        match self.mem.handle_protection_fault(&self.tc, addr) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    pub fn cache_flush(&mut self) {
        self.tc.flush();
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            blocks: self.tc.len(),
            chained_blocks: self.tc.chained_count(),
        }
    }

    // ---- guest memory (SMC-aware write path) ----

    #[must_use]
    pub fn read_u8(&self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    #[must_use]
    pub fn read_u32(&self, addr: u32) -> u32 {
        self.mem.read_u32(addr)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        self.mem.write_u8(&self.tc, addr, u32::from(value));
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.mem.write_u32(&self.tc, addr, value);
    }

    // ---- register access ----
    // Indices 0..7 are EAX..EDI in x86 order, 8 is EIP, 9 is EFLAGS.

    pub fn reg(&mut self, index: usize) -> Result<u32, CoreError> {
        clear_last_error();
        match index {
            0..=7 => Ok(self.state.gpr[index]),
            8 => Ok(self.state.eip),
            9 => Ok(self.state.eflags.value()),
            _ => Err(set_last_error(CoreError::InvalidParameter)),
        }
    }

    pub fn set_reg(&mut self, index: usize, value: u32) -> Result<(), CoreError> {
        clear_last_error();
        match index {
            0..=7 => {
                self.state.gpr[index] = value;
                Ok(())
            }
            8 => {
                self.state.eip = value;
                Ok(())
            }
            9 => {
                self.state.eflags.set_value(value);
                Ok(())
            }
            _ => Err(set_last_error(CoreError::InvalidParameter)),
        }
    }

    pub fn gpr(&mut self, reg: Gpr) -> u32 {
        self.state.read_gpr(reg, Width::W32, false)
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u32) {
        self.state.write_gpr(reg, Width::W32, false, value);
    }

    pub fn eflags(&mut self) -> u32 {
        self.state.eflags.value()
    }

    pub fn set_eflags(&mut self, value: u32) {
        self.state.eflags.set_value(value);
    }

    pub fn mmx(&mut self, index: usize) -> Result<u64, CoreError> {
        clear_last_error();
        if index >= 8 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        Ok(self.state.fpu.mmx_read(index as u8))
    }

    pub fn set_mmx(&mut self, index: usize, value: u64) -> Result<(), CoreError> {
        clear_last_error();
        if index >= 8 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        self.state.fpu.mmx_write(index as u8, value);
        Ok(())
    }

    pub fn xmm(&mut self, index: usize) -> Result<[u8; 16], CoreError> {
        clear_last_error();
        if index >= 8 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        Ok(self.state.fpu.xmm[index].to_le_bytes())
    }

    pub fn set_xmm(&mut self, index: usize, value: [u8; 16]) -> Result<(), CoreError> {
        clear_last_error();
        if index >= 8 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        self.state.fpu.xmm[index] = u128::from_le_bytes(value);
        Ok(())
    }

    /// ST(i) as its 80-bit image; empty slots read as zero.
    pub fn fpu_st(&mut self, index: usize) -> Result<[u8; 10], CoreError> {
        clear_last_error();
        if index >= 8 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        Ok(self
            .state
            .fpu
            .st_peek(index as u8)
            .unwrap_or(F80::ZERO)
            .bytes())
    }

    pub fn set_fpu_st(&mut self, index: usize, value: [u8; 10]) -> Result<(), CoreError> {
        clear_last_error();
        if index >= 8 {
            return Err(set_last_error(CoreError::InvalidParameter));
        }
        self.state.fpu.st_write(index as u8, F80::from_bytes(value));
        Ok(())
    }

    /// Direct FPU-bank access for tests and save-state paths.
    pub fn fpu(&mut self) -> &mut FpuBank {
        &mut self.state.fpu
    }

    // ---- snapshot ----

    pub fn snapshot(&mut self) -> CpuSnapshot {
        CpuSnapshot {
            gpr: self.state.gpr,
            eip: self.state.eip,
            eflags: self.state.eflags.value(),
            fpu: self.state.fpu.clone(),
        }
    }

    pub fn restore(&mut self, snap: &CpuSnapshot) {
        self.state.gpr = snap.gpr;
        self.state.eip = snap.eip;
        self.state.eflags.set_value(snap.eflags);
        self.state.fpu = snap.fpu.clone();
    }

    /// Queues a barrier to be lowered at the head of the next translated
    /// block.
    pub fn insert_barrier(&mut self, kind: BarrierKind) {
        self.pending_barriers.push(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_register_index_sets_last_error() {
        let mut m = Machine::new(Box::new(FlatTestBus::new(0x1000)), JitConfig::default()).unwrap();
        assert!(m.reg(10).is_err());
        assert_eq!(last_error(), CoreError::InvalidParameter.code());
        assert!(m.reg(0).is_ok());
        assert_eq!(last_error(), 0);
    }

    #[test]
    fn rejects_bad_config() {
        let err = Machine::new(
            Box::new(FlatTestBus::new(0x100)),
            JitConfig {
                page_size: 1000,
                ..JitConfig::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, CoreError::InvalidParameter);
    }
}
