//! Translation cache: fingerprint-indexed translated blocks, direct block
//! chaining, cascaded invalidation, and the executable arena backing the
//! emitted code.
//!
//! Blocks live in an id-indexed slab; the chaining graph (exits and incoming
//! links) holds block ids, never references, because guest control flow is
//! cyclic. One mutex guards the map, the slab and the arena together so the
//! asynchronous SMC fault path can invalidate safely.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use thiserror::Error;

use talon_x86::ir::IrBlock;

pub type BlockId = u32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("executable arena exhausted")]
    ArenaFull,
}

/// Exit kinds; only the first three are deterministic and chainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Jmp,
    Cond,
    Fallthrough,
    Indirect,
    Ret,
}

impl ExitKind {
    #[must_use]
    pub fn chainable(self) -> bool {
        matches!(self, ExitKind::Jmp | ExitKind::Cond | ExitKind::Fallthrough)
    }
}

/// One control-flow exit of a translated block. Conditional exits carry two
/// patch sites (taken and fall-through).
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub target: u32,
    pub target_false: u32,
    /// Byte offset of the branch instruction within the block's host code.
    pub patch_offset: usize,
    pub patch_offset_false: usize,
    pub patched: bool,
    pub patched_false: bool,
    /// Set when an out-of-range patch used the long-form veneer; further
    /// patches must respect the longer site.
    pub long_patched: bool,
    /// Original instruction words, restored on unchain.
    orig_insn: u32,
    orig_insn_false: u32,
}

impl ExitInfo {
    #[must_use]
    pub fn jmp(target: u32, patch_offset: usize) -> ExitInfo {
        ExitInfo {
            kind: ExitKind::Jmp,
            target,
            target_false: 0,
            patch_offset,
            patch_offset_false: 0,
            patched: false,
            patched_false: false,
            long_patched: false,
            orig_insn: 0,
            orig_insn_false: 0,
        }
    }

    #[must_use]
    pub fn cond(target: u32, site: usize, target_false: u32, site_false: usize) -> ExitInfo {
        ExitInfo {
            kind: ExitKind::Cond,
            target,
            target_false,
            patch_offset: site,
            patch_offset_false: site_false,
            patched: false,
            patched_false: false,
            long_patched: false,
            orig_insn: 0,
            orig_insn_false: 0,
        }
    }

    #[must_use]
    pub fn unchained(kind: ExitKind) -> ExitInfo {
        ExitInfo {
            kind,
            target: 0,
            target_false: 0,
            patch_offset: 0,
            patch_offset_false: 0,
            patched: false,
            patched_false: false,
            long_patched: false,
            orig_insn: 0,
            orig_insn_false: 0,
        }
    }
}

#[derive(Debug)]
pub struct TranslatedBlock {
    pub id: BlockId,
    pub guest_addr: u32,
    pub guest_size: u32,
    pub code_offset: usize,
    pub code_len: usize,
    pub exits: Vec<ExitInfo>,
    pub incoming: HashSet<BlockId>,
    pub linked: bool,
    /// Retained IR, used by the reference interpreter backend.
    pub ir: IrBlock,
}

/// A request to patch one branch site, handed to the emitter's patcher.
pub struct PatchRequest<'a> {
    /// The whole host-code span of the source block, writable.
    pub code: &'a mut [u8],
    /// Branch instruction offset within `code`.
    pub site: usize,
    /// Byte displacement from the branch instruction to the target's host
    /// entry (target_address − site_address).
    pub rel: i64,
    pub kind: ExitKind,
}

/// Result of one patch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Direct branch written.
    Patched,
    /// Long-form veneer used.
    PatchedLong,
    /// Site could not be patched (left for the dispatcher).
    Skipped,
}

pub type Patcher<'p> = dyn FnMut(PatchRequest<'_>) -> PatchOutcome + 'p;

struct Inner {
    slab: Vec<Option<TranslatedBlock>>,
    free: Vec<BlockId>,
    /// addr → id; doubles as the recency list for capacity eviction.
    map: LruCache<u32, BlockId>,
    arena: arena::CodeArena,
}

/// The translation cache. All methods are `&self`; one internal mutex
/// serializes the map, slab and arena (the SMC fault handler may call in
/// from another thread).
pub struct TranslationCache {
    inner: Mutex<Inner>,
}

impl TranslationCache {
    /// `arena_bytes` bounds emitted code; `capacity` bounds live blocks
    /// (LRU eviction beyond it).
    #[must_use]
    pub fn new(arena_bytes: usize, capacity: usize) -> TranslationCache {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        TranslationCache {
            inner: Mutex::new(Inner {
                slab: Vec::new(),
                free: Vec::new(),
                map: LruCache::new(cap),
                arena: arena::CodeArena::new(arena_bytes),
            }),
        }
    }

    /// Looks up a block and promotes its recency.
    pub fn lookup(&self, guest_addr: u32) -> Option<BlockId> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.get(&guest_addr).copied()
    }

    /// Non-promoting lookup.
    pub fn contains(&self, guest_addr: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.map.peek(&guest_addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks participating in the chain graph.
    pub fn chained_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .slab
            .iter()
            .flatten()
            .filter(|b| b.linked || !b.incoming.is_empty())
            .count()
    }

    /// Runs `f` against a block, if present. Test and introspection hook.
    pub fn with_block<R>(&self, guest_addr: u32, f: impl FnOnce(&TranslatedBlock) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        let id = *inner.map.peek(&guest_addr)?;
        inner.slab[id as usize].as_ref().map(f)
    }

    /// Host entry pointer for a stored block.
    pub fn entry_ptr(&self, id: BlockId) -> Option<*const u8> {
        let inner = self.inner.lock().unwrap();
        let block = inner.slab.get(id as usize)?.as_ref()?;
        Some(inner.arena.ptr_at(block.code_offset))
    }

    /// Clones the retained IR of a block (interpreter backend).
    pub fn ir_of(&self, id: BlockId) -> Option<IrBlock> {
        let inner = self.inner.lock().unwrap();
        inner
            .slab
            .get(id as usize)?
            .as_ref()
            .map(|b| b.ir.clone())
    }

    pub fn guest_range_of(&self, id: BlockId) -> Option<(u32, u32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .slab
            .get(id as usize)?
            .as_ref()
            .map(|b| (b.guest_addr, b.guest_size))
    }

    /// Stores a freshly translated block. An existing block at the same
    /// address is invalidated first; capacity overflow evicts the least
    /// recently used block through the same invalidation path. The host
    /// bytes are committed through the write-then-execute guard with an
    /// instruction-cache flush before they become reachable.
    pub fn store(
        &self,
        guest_addr: u32,
        guest_size: u32,
        ir: IrBlock,
        code: &[u8],
        exits: Vec<ExitInfo>,
    ) -> Result<BlockId, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.peek(&guest_addr).is_some() {
            tracing::debug!(addr = format_args!("{guest_addr:#x}"), "overwriting translated block");
            Self::invalidate_locked(&mut inner, guest_addr);
        }
        while inner.map.len() >= inner.map.cap().get() {
            let (evict_addr, _) = inner.map.peek_lru().map(|(a, i)| (*a, *i)).unwrap();
            tracing::debug!(addr = format_args!("{evict_addr:#x}"), "evicting LRU block");
            Self::invalidate_locked(&mut inner, evict_addr);
        }

        let code_offset = inner
            .arena
            .alloc(code.len())
            .ok_or(StoreError::ArenaFull)?;
        inner.arena.with_writable(|arena| {
            arena.write(code_offset, code);
        });

        let id = match inner.free.pop() {
            Some(id) => id,
            None => {
                inner.slab.push(None);
                (inner.slab.len() - 1) as BlockId
            }
        };
        let block = TranslatedBlock {
            id,
            guest_addr,
            guest_size,
            code_offset,
            code_len: code.len(),
            exits,
            incoming: HashSet::new(),
            linked: false,
            ir,
        };
        inner.slab[id as usize] = Some(block);
        inner.map.put(guest_addr, id);
        tracing::trace!(
            addr = format_args!("{guest_addr:#x}"),
            id,
            bytes = code.len(),
            "stored translated block"
        );
        Ok(id)
    }

    /// Attempts to patch every deterministic exit of `guest_addr`'s block
    /// whose target is already translated. Idempotent: already-patched exits
    /// are skipped.
    pub fn chain(&self, guest_addr: u32, patcher: &mut Patcher<'_>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(&id) = inner.map.peek(&guest_addr) else {
            return;
        };

        // Collect the work first: (exit index, false-leg?, target id).
        let mut jobs: Vec<(usize, bool, BlockId)> = Vec::new();
        {
            let block = inner.slab[id as usize].as_ref().unwrap();
            for (i, exit) in block.exits.iter().enumerate() {
                if !exit.kind.chainable() {
                    continue;
                }
                if !exit.patched {
                    if let Some(&tid) = inner.map.peek(&exit.target) {
                        jobs.push((i, false, tid));
                    }
                }
                if exit.kind == ExitKind::Cond && !exit.patched_false {
                    if let Some(&tid) = inner.map.peek(&exit.target_false) {
                        jobs.push((i, true, tid));
                    }
                }
            }
        }
        if jobs.is_empty() {
            return;
        }

        let inner = &mut *inner;
        let (src_off, src_len) = {
            let b = inner.slab[id as usize].as_ref().unwrap();
            (b.code_offset, b.code_len)
        };
        for (i, false_leg, tid) in jobs {
            let (target_off, target_addr) = {
                let t = inner.slab[tid as usize].as_ref().unwrap();
                (t.code_offset, t.guest_addr)
            };
            let (site, kind) = {
                let b = inner.slab[id as usize].as_ref().unwrap();
                let e = &b.exits[i];
                (
                    if false_leg { e.patch_offset_false } else { e.patch_offset },
                    e.kind,
                )
            };
            let rel = target_off as i64 - (src_off + site) as i64;
            let outcome = inner.arena.with_writable(|arena| {
                let code = arena.slice_mut(src_off, src_len);
                let orig = u32::from_le_bytes(code[site..site + 4].try_into().unwrap());
                let outcome = patcher(PatchRequest {
                    code,
                    site,
                    rel,
                    kind,
                });
                (orig, outcome)
            });
            let (orig, outcome) = outcome;
            if outcome == PatchOutcome::Skipped {
                continue;
            }
            {
                let b = inner.slab[id as usize].as_mut().unwrap();
                let e = &mut b.exits[i];
                if false_leg {
                    e.patched_false = true;
                    e.orig_insn_false = orig;
                } else {
                    e.patched = true;
                    e.orig_insn = orig;
                }
                if outcome == PatchOutcome::PatchedLong {
                    e.long_patched = true;
                }
                b.linked = true;
            }
            inner.slab[tid as usize]
                .as_mut()
                .unwrap()
                .incoming
                .insert(id);
            tracing::trace!(
                from = format_args!("{guest_addr:#x}"),
                to = format_args!("{target_addr:#x}"),
                "chained blocks"
            );
        }
    }

    /// Removes every patch into and out of the block at `guest_addr`.
    pub fn unchain(&self, guest_addr: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.map.peek(&guest_addr) {
            Self::unchain_locked(&mut inner, id);
        }
    }

    /// Invalidates one block: cascades over incoming links, restores their
    /// branch sites to the dispatcher path, then drops the block.
    pub fn invalidate(&self, guest_addr: u32) {
        let mut inner = self.inner.lock().unwrap();
        Self::invalidate_locked(&mut inner, guest_addr);
    }

    /// Invalidates every block whose guest range overlaps `[lo, hi)`.
    pub fn invalidate_range(&self, lo: u32, hi: u32) {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<u32> = inner
            .map
            .iter()
            .filter_map(|(addr, id)| {
                let b = inner.slab[*id as usize].as_ref()?;
                let start = b.guest_addr;
                let end = b.guest_addr.wrapping_add(b.guest_size.max(1));
                (start < hi && end > lo).then_some(*addr)
            })
            .collect();
        for addr in victims {
            Self::invalidate_locked(&mut inner, addr);
        }
    }

    /// Drops every block.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let all: Vec<u32> = inner.map.iter().map(|(a, _)| *a).collect();
        for addr in all {
            Self::invalidate_locked(&mut inner, addr);
        }
    }

    fn unchain_locked(inner: &mut Inner, id: BlockId) {
        let (addr, exits, incoming) = {
            let b = inner.slab[id as usize].as_mut().unwrap();
            if !b.linked && b.incoming.is_empty() {
                return;
            }
            let exits = b.exits.clone();
            let incoming: Vec<BlockId> = b.incoming.iter().copied().collect();
            (b.guest_addr, exits, incoming)
        };

        // Outgoing: remove this block from its targets' incoming sets and
        // restore the patched sites.
        for exit in &exits {
            for (patched, target, site, orig) in [
                (exit.patched, exit.target, exit.patch_offset, exit.orig_insn),
                (
                    exit.patched_false,
                    exit.target_false,
                    exit.patch_offset_false,
                    exit.orig_insn_false,
                ),
            ] {
                if !patched {
                    continue;
                }
                if let Some(&tid) = inner.map.peek(&target) {
                    if let Some(t) = inner.slab[tid as usize].as_mut() {
                        t.incoming.remove(&id);
                    }
                }
                let (off, len) = {
                    let b = inner.slab[id as usize].as_ref().unwrap();
                    (b.code_offset, b.code_len)
                };
                inner.arena.with_writable(|arena| {
                    let code = arena.slice_mut(off, len);
                    code[site..site + 4].copy_from_slice(&orig.to_le_bytes());
                });
            }
        }

        // Incoming: clear every caller patch that targets this block.
        for cid in incoming {
            let Some(c) = inner.slab[cid as usize].as_ref() else {
                continue;
            };
            let (c_off, c_len) = (c.code_offset, c.code_len);
            let mut restores: Vec<(usize, u32)> = Vec::new();
            {
                let c = inner.slab[cid as usize].as_mut().unwrap();
                for e in &mut c.exits {
                    if e.patched && e.target == addr {
                        e.patched = false;
                        restores.push((e.patch_offset, e.orig_insn));
                    }
                    if e.patched_false && e.target_false == addr {
                        e.patched_false = false;
                        restores.push((e.patch_offset_false, e.orig_insn_false));
                    }
                }
                c.linked = c.exits.iter().any(|e| e.patched || e.patched_false);
            }
            inner.arena.with_writable(|arena| {
                let code = arena.slice_mut(c_off, c_len);
                for (site, orig) in &restores {
                    code[*site..*site + 4].copy_from_slice(&orig.to_le_bytes());
                }
            });
        }

        let b = inner.slab[id as usize].as_mut().unwrap();
        for e in &mut b.exits {
            e.patched = false;
            e.patched_false = false;
        }
        b.incoming.clear();
        b.linked = false;
    }

    fn invalidate_locked(inner: &mut Inner, guest_addr: u32) {
        let Some(&id) = inner.map.peek(&guest_addr) else {
            return;
        };
        Self::unchain_locked(inner, id);
        inner.map.pop(&guest_addr);
        inner.slab[id as usize] = None;
        inner.free.push(id);
        tracing::trace!(addr = format_args!("{guest_addr:#x}"), "invalidated block");
    }
}

mod arena {
    //! Executable arena with write-then-execute toggling. The region is
    //! never writable and executable at once: writers run inside
    //! [`CodeArena::with_writable`], and the drop back to execute mode
    //! flushes the instruction cache for the touched range.

    pub struct CodeArena {
        #[cfg(unix)]
        base: *mut u8,
        #[cfg(not(unix))]
        buf: Vec<u8>,
        cap: usize,
        used: usize,
    }

    // The raw base pointer is only dereferenced under the cache mutex.
    unsafe impl Send for CodeArena {}

    impl CodeArena {
        pub fn new(cap: usize) -> CodeArena {
            let cap = cap.max(4096).next_multiple_of(4096);
            #[cfg(unix)]
            {
                let base = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        cap,
                        libc::PROT_READ | libc::PROT_EXEC,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                assert!(base != libc::MAP_FAILED, "executable arena mmap failed");
                CodeArena {
                    base: base.cast(),
                    cap,
                    used: 0,
                }
            }
            #[cfg(not(unix))]
            {
                CodeArena {
                    buf: vec![0; cap],
                    cap,
                    used: 0,
                }
            }
        }

        /// Bump-allocates a 16-byte-aligned span; None when exhausted.
        pub fn alloc(&mut self, len: usize) -> Option<usize> {
            let off = self.used.next_multiple_of(16);
            if off.checked_add(len)? > self.cap {
                return None;
            }
            self.used = off + len;
            Some(off)
        }

        pub fn ptr_at(&self, offset: usize) -> *const u8 {
            #[cfg(unix)]
            {
                unsafe { self.base.add(offset) }
            }
            #[cfg(not(unix))]
            {
                self.buf[offset..].as_ptr()
            }
        }

        /// Runs `f` with the arena writable, then returns it to execute-only
        /// and synchronizes the instruction cache.
        pub fn with_writable<R>(&mut self, f: impl FnOnce(&mut CodeArena) -> R) -> R {
            #[cfg(unix)]
            unsafe {
                libc::mprotect(
                    self.base.cast(),
                    self.cap,
                    libc::PROT_READ | libc::PROT_WRITE,
                );
            }
            let r = f(self);
            #[cfg(unix)]
            unsafe {
                libc::mprotect(
                    self.base.cast(),
                    self.cap,
                    libc::PROT_READ | libc::PROT_EXEC,
                );
            }
            crate::mem::flush_icache_range(self.ptr_at(0), self.used);
            r
        }

        /// Copies bytes in; caller must be inside `with_writable`.
        pub fn write(&mut self, offset: usize, bytes: &[u8]) {
            self.slice_mut(offset, bytes.len()).copy_from_slice(bytes);
        }

        pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
            #[cfg(unix)]
            unsafe {
                std::slice::from_raw_parts_mut(self.base.add(offset), len)
            }
            #[cfg(not(unix))]
            {
                &mut self.buf[offset..offset + len]
            }
        }
    }

    impl Drop for CodeArena {
        fn drop(&mut self) {
            #[cfg(unix)]
            unsafe {
                libc::munmap(self.base.cast(), self.cap);
            }
        }
    }
}
