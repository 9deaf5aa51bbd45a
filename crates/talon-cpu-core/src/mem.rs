//! Guest memory management: the host bus interface, the page map,
//! self-modifying-code detection on code pages, and memory barriers.
//!
//! The embedder owns guest memory; every access goes through the
//! [`GuestBus`] it supplied at init. The memory manager adds the page map
//! on top: registering translated code marks its pages, strips their write
//! permission, and routes every later guest store through the
//! invalidate-write-rearm-barrier sequence.

use std::collections::HashMap;
use std::sync::Mutex;

use bitflags::bitflags;
use thiserror::Error;

use talon_types::{BarrierKind, Exception, LogLevel};

use crate::cache::TranslationCache;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    #[error("unaligned length for page operation: {len:#x}")]
    UnalignedLength { len: u32 },
    #[error("protection fault at {addr:#010x} is not owned by the core")]
    NotCode { addr: u32 },
}

bitflags! {
    /// Guest page protection, tracked per page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Host-side guest memory and event interface, fixed at init.
///
/// Widths default to byte composition so a minimal embedder only implements
/// `read_u8`/`write_u8`; production embedders override the wide accessors.
pub trait GuestBus: Send {
    fn read_u8(&self, addr: u32) -> u8;
    fn write_u8(&mut self, addr: u32, value: u8);

    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }
    fn read_u32(&self, addr: u32) -> u32 {
        u32::from(self.read_u16(addr)) | (u32::from(self.read_u16(addr.wrapping_add(2))) << 16)
    }
    fn read_u64(&self, addr: u32) -> u64 {
        u64::from(self.read_u32(addr)) | (u64::from(self.read_u32(addr.wrapping_add(4))) << 32)
    }
    fn write_u16(&mut self, addr: u32, value: u16) {
        let b = value.to_le_bytes();
        self.write_u8(addr, b[0]);
        self.write_u8(addr.wrapping_add(1), b[1]);
    }
    fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_u16(addr, value as u16);
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
    }
    fn write_u64(&mut self, addr: u32, value: u64) {
        self.write_u32(addr, value as u32);
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32);
    }
    fn read_block(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(addr.wrapping_add(i as u32));
        }
    }
    fn write_block(&mut self, addr: u32, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *b);
        }
    }

    /// Host logging hook; levels follow the embedder convention
    /// (0 error .. 3 debug).
    fn log(&self, _level: LogLevel, _message: &str) {}

    /// Guest-visible exception delivery.
    fn guest_exception(&mut self, _exception: Exception, _code: u32, _addr: u32) {}

    /// INT n reached translated code; the embedder owns the vector table.
    fn software_interrupt(&mut self, _vector: u8, _next_eip: u32) {}
}

#[derive(Debug, Clone, Copy)]
struct Page {
    prot: PageProt,
    contains_code: bool,
    dirty: bool,
}

impl Page {
    fn plain() -> Page {
        Page {
            prot: PageProt::READ | PageProt::WRITE,
            contains_code: false,
            dirty: false,
        }
    }
}

/// Memory manager configuration, fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    pub page_size: u32,
    pub smc_detection: bool,
    /// Conservative memory model: data-memory barrier around every
    /// guest-observable store.
    pub conservative: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            page_size: 4096,
            smc_detection: true,
            conservative: false,
        }
    }
}

pub struct MemoryManager {
    bus: Mutex<Box<dyn GuestBus>>,
    pages: Mutex<HashMap<u32, Page>>,
    cfg: MemConfig,
}

impl MemoryManager {
    pub fn new(bus: Box<dyn GuestBus>, cfg: MemConfig) -> MemoryManager {
        assert!(cfg.page_size.is_power_of_two());
        MemoryManager {
            bus: Mutex::new(bus),
            pages: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.cfg.page_size
    }

    #[must_use]
    pub fn page_base(&self, addr: u32) -> u32 {
        addr & !(self.cfg.page_size - 1)
    }

    pub fn with_bus<R>(&self, f: impl FnOnce(&mut dyn GuestBus) -> R) -> R {
        let mut bus = self.bus.lock().unwrap();
        f(bus.as_mut())
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let bus = self.bus.lock().unwrap();
        bus.log(level, message);
    }

    pub fn deliver_guest_exception(&self, exception: Exception, code: u32, addr: u32) {
        let mut bus = self.bus.lock().unwrap();
        bus.guest_exception(exception, code, addr);
    }

    // Read path: no page-map interaction.

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.bus.lock().unwrap().read_u8(addr)
    }
    pub fn read_u16(&self, addr: u32) -> u16 {
        self.bus.lock().unwrap().read_u16(addr)
    }
    pub fn read_u32(&self, addr: u32) -> u32 {
        self.bus.lock().unwrap().read_u32(addr)
    }
    pub fn read_u64(&self, addr: u32) -> u64 {
        self.bus.lock().unwrap().read_u64(addr)
    }
    pub fn read_block(&self, addr: u32, buf: &mut [u8]) {
        self.bus.lock().unwrap().read_block(addr, buf);
    }
    pub fn read_u128(&self, addr: u32) -> u128 {
        let mut buf = [0u8; 16];
        self.read_block(addr, &mut buf);
        u128::from_le_bytes(buf)
    }

    // Write path: code pages get invalidate-write-rearm with barriers.

    pub fn write_u8(&self, tc: &TranslationCache, addr: u32, value: u32) {
        self.write_common(tc, addr, 1, |bus| bus.write_u8(addr, value as u8));
    }
    pub fn write_u16(&self, tc: &TranslationCache, addr: u32, value: u32) {
        self.write_common(tc, addr, 2, |bus| bus.write_u16(addr, value as u16));
    }
    pub fn write_u32(&self, tc: &TranslationCache, addr: u32, value: u32) {
        self.write_common(tc, addr, 4, |bus| bus.write_u32(addr, value));
    }
    pub fn write_u64(&self, tc: &TranslationCache, addr: u32, value: u64) {
        self.write_common(tc, addr, 8, |bus| bus.write_u64(addr, value));
    }
    pub fn write_u128(&self, tc: &TranslationCache, addr: u32, value: u128) {
        let bytes = value.to_le_bytes();
        self.write_common(tc, addr, 16, |bus| bus.write_block(addr, &bytes));
    }
    pub fn write_block(&self, tc: &TranslationCache, addr: u32, buf: &[u8]) {
        self.write_common(tc, addr, buf.len() as u32, |bus| bus.write_block(addr, buf));
    }

    fn write_common(
        &self,
        tc: &TranslationCache,
        addr: u32,
        len: u32,
        commit: impl FnOnce(&mut dyn GuestBus),
    ) {
        let code_pages = if self.cfg.smc_detection {
            self.code_pages_overlapping(addr, len)
        } else {
            Vec::new()
        };

        if code_pages.is_empty() {
            if self.cfg.conservative {
                barrier(BarrierKind::DataMemory);
            }
            let mut bus = self.bus.lock().unwrap();
            commit(bus.as_mut());
            if self.cfg.conservative {
                barrier(BarrierKind::DataMemory);
            }
            return;
        }

        // Guest store into translated code. Lock order: page map, then TC.
        let mut pages = self.pages.lock().unwrap();
        let mut saved: Vec<(u32, PageProt)> = Vec::new();
        for page in &code_pages {
            let entry = pages.entry(*page).or_insert_with(Page::plain);
            saved.push((*page, entry.prot));
            tc.invalidate_range(*page, page.wrapping_add(self.cfg.page_size));
            entry.prot |= PageProt::WRITE;
            entry.dirty = true;
            entry.contains_code = false;
            tracing::debug!(
                page = format_args!("{page:#x}"),
                at = format_args!("{addr:#x}"),
                "guest store hit code page; translations invalidated"
            );
        }

        {
            let mut bus = self.bus.lock().unwrap();
            commit(bus.as_mut());
        }

        for (page, prot) in saved {
            if let Some(entry) = pages.get_mut(&page) {
                entry.prot = prot;
            }
        }

        // Publish the modified bytes before any retranslation executes.
        barrier(BarrierKind::DataSync);
        barrier(BarrierKind::InstructionSync);
    }

    fn code_pages_overlapping(&self, addr: u32, len: u32) -> Vec<u32> {
        let pages = self.pages.lock().unwrap();
        let first = self.page_base(addr);
        let last = self.page_base(addr.wrapping_add(len.saturating_sub(1).max(0)));
        let mut out = Vec::new();
        let mut page = first;
        loop {
            if pages.get(&page).is_some_and(|p| p.contains_code) {
                out.push(page);
            }
            if page == last {
                break;
            }
            page = page.wrapping_add(self.cfg.page_size);
        }
        out
    }

    /// Marks the pages covering `[addr, addr+len)` as containing translated
    /// code and strips their write permission; the next guest store traps.
    pub fn register_code_pages(&self, addr: u32, len: u32) {
        let mut pages = self.pages.lock().unwrap();
        let mut page = self.page_base(addr);
        let last = self.page_base(addr.wrapping_add(len.saturating_sub(1)));
        loop {
            let entry = pages.entry(page).or_insert_with(Page::plain);
            entry.contains_code = true;
            entry.prot.remove(PageProt::WRITE);
            if page == last {
                break;
            }
            page = page.wrapping_add(self.cfg.page_size);
        }
    }

    #[must_use]
    pub fn page_contains_code(&self, addr: u32) -> bool {
        let pages = self.pages.lock().unwrap();
        pages
            .get(&self.page_base(addr))
            .is_some_and(|p| p.contains_code)
    }

    #[must_use]
    pub fn page_prot(&self, addr: u32) -> PageProt {
        let pages = self.pages.lock().unwrap();
        pages
            .get(&self.page_base(addr))
            .map_or(PageProt::READ | PageProt::WRITE, |p| p.prot)
    }

    #[must_use]
    pub fn page_dirty(&self, addr: u32) -> bool {
        let pages = self.pages.lock().unwrap();
        pages.get(&self.page_base(addr)).is_some_and(|p| p.dirty)
    }

    /// Embedder notification that guest memory changed behind the core's
    /// back: invalidates intersecting translations and re-arms protection.
    pub fn notify_modified(&self, tc: &TranslationCache, addr: u32, len: u32) {
        let mut pages = self.pages.lock().unwrap();
        let mut page = self.page_base(addr);
        let last = self.page_base(addr.wrapping_add(len.saturating_sub(1)));
        loop {
            if let Some(entry) = pages.get_mut(&page) {
                if entry.contains_code {
                    tc.invalidate_range(page, page.wrapping_add(self.cfg.page_size));
                    entry.contains_code = false;
                    entry.prot.insert(PageProt::WRITE);
                }
                entry.dirty = true;
            }
            if page == last {
                break;
            }
            page = page.wrapping_add(self.cfg.page_size);
        }
        barrier(BarrierKind::DataSync);
        barrier(BarrierKind::InstructionSync);
    }

    /// Write-protection fault entry point (signal-handler path). Bounded
    /// work, no allocation from the executable arena. Lock order: page map,
    /// then TC.
    pub fn handle_protection_fault(
        &self,
        tc: &TranslationCache,
        fault_addr: u32,
    ) -> Result<(), MemError> {
        let page = self.page_base(fault_addr);
        let mut pages = self.pages.lock().unwrap();
        let Some(entry) = pages.get_mut(&page) else {
            return Err(MemError::NotCode { addr: fault_addr });
        };
        if !entry.contains_code {
            return Err(MemError::NotCode { addr: fault_addr });
        }
        tc.invalidate_range(page, page.wrapping_add(self.cfg.page_size));
        entry.contains_code = false;
        entry.prot.insert(PageProt::WRITE);
        entry.dirty = true;
        barrier(BarrierKind::DataSync);
        barrier(BarrierKind::InstructionSync);
        tracing::debug!(
            addr = format_args!("{fault_addr:#x}"),
            "write-protection fault handled; page re-armed writable"
        );
        Ok(())
    }
}

/// Host-level memory barrier. On AArch64 these lower to the architectural
/// DMB/DSB/ISB; elsewhere a sequentially consistent fence stands in.
pub fn barrier(kind: BarrierKind) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        match kind {
            BarrierKind::DataMemory => core::arch::asm!("dmb ish"),
            BarrierKind::DataSync => core::arch::asm!("dsb ish"),
            BarrierKind::InstructionSync => core::arch::asm!("isb"),
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = kind;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Instruction-cache maintenance for freshly written code.
#[allow(unused_variables)]
pub fn flush_icache_range(start: *const u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        // Clean data cache to the point of unification, invalidate the
        // instruction cache, then synchronize.
        let line = 64usize;
        let mut p = start as usize & !(line - 1);
        let end = start as usize + len;
        while p < end {
            core::arch::asm!("dc cvau, {0}", in(reg) p);
            p += line;
        }
        core::arch::asm!("dsb ish");
        let mut p = start as usize & !(line - 1);
        while p < end {
            core::arch::asm!("ic ivau, {0}", in(reg) p);
            p += line;
        }
        core::arch::asm!("dsb ish");
        core::arch::asm!("isb");
    }
}

/// Flat test bus backed by a byte vector; mirrors the embedder contract for
/// unit and integration tests.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    pub exceptions: Vec<(Exception, u32, u32)>,
}

impl FlatTestBus {
    #[must_use]
    pub fn new(size: usize) -> FlatTestBus {
        FlatTestBus {
            mem: vec![0; size],
            exceptions: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    #[must_use]
    pub fn mem(&self) -> &[u8] {
        &self.mem
    }
}

impl GuestBus for FlatTestBus {
    fn read_u8(&self, addr: u32) -> u8 {
        self.mem.get(addr as usize).copied().unwrap_or(0)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        if let Some(slot) = self.mem.get_mut(addr as usize) {
            *slot = value;
        }
    }

    fn guest_exception(&mut self, exception: Exception, code: u32, addr: u32) {
        self.exceptions.push((exception, code, addr));
    }
}
