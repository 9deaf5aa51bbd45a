//! Linear-scan register allocation over one IR block.
//!
//! One pass computes each vreg's live range `[first, last]`, use count and
//! flags; vregs are then walked in ascending start order, expiring finished
//! intervals back to the free lists and spilling the lowest-priority active
//! vreg of the needed class when a pool runs dry.

use std::collections::HashMap;

use talon_types::DataType;
use talon_x86::ir::{Inst, IrBlock, Terminator, Vreg, VregRole};

/// Physical register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Gpr,
    Neon,
}

impl RegClass {
    #[must_use]
    pub fn of(ty: DataType) -> RegClass {
        if ty.needs_neon() {
            RegClass::Neon
        } else {
            RegClass::Gpr
        }
    }
}

/// Where a vreg lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Gpr(u8),
    Neon(u8),
    /// Spilled: byte offset into the block's spill area.
    Spill { offset: u32, class: RegClass },
}

impl Assignment {
    #[must_use]
    pub fn is_spill(&self) -> bool {
        matches!(self, Assignment::Spill { .. })
    }
}

/// Allocatable GPRs: x0..x27 excluding x16/x17 (platform/veneer) and x28
/// (context base).
pub const GPR_POOL: &[u8] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];
/// Allocatable NEON registers: v8..v31 (v0..v7 are emitter scratch).
pub const NEON_POOL: &[u8] = &[
    8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31,
];

#[derive(Debug, Clone)]
struct Lifetime {
    vreg: Vreg,
    start: u32,
    end: u32,
    uses: u32,
    x86_mapped: bool,
    in_loop: bool,
    priority: f32,
}

/// Allocation result for one block.
#[derive(Debug, Clone, Default)]
pub struct RegMap {
    assignments: HashMap<u32, Assignment>,
    /// Total spill-area bytes, 16-byte aligned.
    pub spill_size: u32,
}

impl RegMap {
    #[must_use]
    pub fn get(&self, vreg: Vreg) -> Assignment {
        self.assignments[&vreg.id]
    }

    #[must_use]
    pub fn lookup(&self, id: u32) -> Option<Assignment> {
        self.assignments.get(&id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Runs allocation for a block.
#[must_use]
pub fn allocate(block: &IrBlock) -> RegMap {
    let lifetimes = compute_lifetimes(block);
    linear_scan(lifetimes)
}

fn compute_lifetimes(block: &IrBlock) -> Vec<Lifetime> {
    let mut table: HashMap<u32, Lifetime> = HashMap::new();
    fn touch(table: &mut HashMap<u32, Lifetime>, v: Vreg, role: VregRole, idx: u32) {
        let entry = table.entry(v.id).or_insert(Lifetime {
            vreg: v,
            start: idx,
            end: idx,
            uses: 0,
            x86_mapped: false,
            in_loop: false,
            priority: 0.0,
        });
        entry.end = entry.end.max(idx);
        if role == VregRole::Use {
            entry.uses += 1;
        }
    }

    for (idx, inst) in block.insts.iter().enumerate() {
        let idx = idx as u32;
        inst.visit_vregs(|v, role| touch(&mut table, v, role, idx));
        // Direct images of guest registers get the architectural-mapping
        // priority boost.
        match inst {
            Inst::ReadReg { dst, .. } | Inst::MmxRead { dst, .. } | Inst::XmmRead { dst, .. } => {
                if let Some(lt) = table.get_mut(&dst.id) {
                    lt.x86_mapped = true;
                }
            }
            Inst::WriteReg { src, .. } | Inst::MmxWrite { src, .. } | Inst::XmmWrite { src, .. } => {
                if let Some(lt) = table.get_mut(&src.id) {
                    lt.x86_mapped = true;
                }
            }
            _ => {}
        }
    }
    let term_idx = block.insts.len() as u32;
    block
        .term
        .visit_vregs(|v, role| touch(&mut table, v, role, term_idx));

    // A terminator that branches back into this block makes the whole block
    // a loop body; its values are flagged accordingly.
    let block_is_loop = match block.term {
        Terminator::Jmp { target } => target == block.start,
        Terminator::Jcc { target, .. } | Terminator::JccVreg { target, .. } => {
            target == block.start
        }
        _ => false,
    };

    let mut lifetimes: Vec<Lifetime> = table.into_values().collect();
    let max_uses = lifetimes.iter().map(|l| l.uses).max().unwrap_or(1).max(1);
    let max_len = lifetimes
        .iter()
        .map(|l| l.end - l.start)
        .max()
        .unwrap_or(1)
        .max(1);
    for lt in &mut lifetimes {
        lt.in_loop = block_is_loop;
        let len = lt.end - lt.start;
        lt.priority = 10_000.0 * f32::from(u8::from(lt.x86_mapped))
            + 500.0 * f32::from(u8::from(lt.in_loop))
            + 100.0 * (lt.uses as f32 / max_uses as f32)
            + 50.0 * (1.0 - len as f32 / max_len as f32);
    }
    lifetimes.sort_by_key(|l| (l.start, l.vreg.id));
    lifetimes
}

struct SpillAllocator {
    next: u32,
}

impl SpillAllocator {
    fn new() -> SpillAllocator {
        SpillAllocator { next: 0 }
    }

    fn alloc(&mut self, ty: DataType) -> u32 {
        // Reloads go through full-width ldr x / ldr q, so slots take the
        // register width, not the value width.
        let (size, align) = if ty.needs_neon() { (16, 16) } else { (8, 8) };
        let offset = self.next.next_multiple_of(align);
        self.next = offset + size;
        offset
    }

    fn total(&self) -> u32 {
        self.next.next_multiple_of(16)
    }
}

fn linear_scan(lifetimes: Vec<Lifetime>) -> RegMap {
    let mut map = RegMap::default();
    let mut free_gpr: Vec<u8> = GPR_POOL.to_vec();
    let mut free_neon: Vec<u8> = NEON_POOL.to_vec();
    // Active intervals, with their current physical register.
    let mut active: Vec<(Lifetime, u8)> = Vec::new();
    let mut spills = SpillAllocator::new();

    for lt in lifetimes {
        // Expire intervals that ended before this one starts.
        let mut i = 0;
        while i < active.len() {
            if active[i].0.end < lt.start {
                let (expired, reg) = active.swap_remove(i);
                match RegClass::of(expired.vreg.ty) {
                    RegClass::Gpr => free_gpr.push(reg),
                    RegClass::Neon => free_neon.push(reg),
                }
            } else {
                i += 1;
            }
        }

        let class = RegClass::of(lt.vreg.ty);
        let free = match class {
            RegClass::Gpr => &mut free_gpr,
            RegClass::Neon => &mut free_neon,
        };
        if let Some(reg) = free.pop() {
            let assignment = match class {
                RegClass::Gpr => Assignment::Gpr(reg),
                RegClass::Neon => Assignment::Neon(reg),
            };
            map.assignments.insert(lt.vreg.id, assignment);
            active.push((lt, reg));
            continue;
        }

        // Pool dry: spill the lowest-priority active interval of this class
        // (possibly the incoming one itself).
        let victim_idx = active
            .iter()
            .enumerate()
            .filter(|(_, (a, _))| RegClass::of(a.vreg.ty) == class)
            .min_by(|(_, (a, _)), (_, (b, _))| a.priority.total_cmp(&b.priority))
            .map(|(i, _)| i);

        match victim_idx {
            Some(vi) if active[vi].0.priority < lt.priority => {
                let (victim, reg) = active.swap_remove(vi);
                let offset = spills.alloc(victim.vreg.ty);
                map.assignments
                    .insert(victim.vreg.id, Assignment::Spill { offset, class });
                tracing::trace!(vreg = victim.vreg.id, offset, "spilled vreg");
                let assignment = match class {
                    RegClass::Gpr => Assignment::Gpr(reg),
                    RegClass::Neon => Assignment::Neon(reg),
                };
                map.assignments.insert(lt.vreg.id, assignment);
                active.push((lt, reg));
            }
            _ => {
                let offset = spills.alloc(lt.vreg.ty);
                map.assignments
                    .insert(lt.vreg.id, Assignment::Spill { offset, class });
                tracing::trace!(vreg = lt.vreg.id, offset, "spilled incoming vreg");
            }
        }
    }

    map.spill_size = spills.total();
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_types::{FlagSet, Gpr, Width};
    use talon_x86::ir::IrBuilder;

    fn simple_block() -> IrBlock {
        let mut b = IrBuilder::new();
        let v0 = b.const_val(5, DataType::I32);
        b.push(Inst::WriteReg {
            reg: Gpr::Eax,
            width: Width::W32,
            high8: false,
            src: v0,
        });
        b.finish(0x1000, Terminator::Jmp { target: 0x1005 })
    }

    #[test]
    fn every_vreg_gets_exactly_one_assignment() {
        let block = simple_block();
        let map = allocate(&block);
        assert_eq!(map.len(), 1);
        assert!(matches!(map.lookup(0), Some(Assignment::Gpr(_))));
    }

    #[test]
    fn float_vregs_get_neon_registers() {
        let mut b = IrBuilder::new();
        let v = b.vreg(DataType::F32);
        b.push(Inst::XmmRead { dst: v, xmm: 0 });
        b.push(Inst::XmmWrite { xmm: 1, src: v });
        let block = b.finish(0, Terminator::Jmp { target: 4 });
        let map = allocate(&block);
        assert!(matches!(map.get(v), Assignment::Neon(_)));
    }

    #[test]
    fn no_live_overlap_shares_a_register() {
        // Many simultaneously-live vregs: all defined first, used at the end.
        let mut b = IrBuilder::new();
        let mut regs = Vec::new();
        for _ in 0..30 {
            regs.push(b.const_val(1, DataType::I32));
        }
        let mut acc = regs[0];
        for r in &regs[1..] {
            let dst = b.vreg(DataType::I32);
            b.push(Inst::Alu {
                op: talon_x86::ir::AluOp::Add,
                dst,
                lhs: acc,
                rhs: *r,
                flags: FlagSet::empty(),
            });
            acc = dst;
        }
        let block = b.finish(0, Terminator::Jmp { target: 4 });
        let map = allocate(&block);

        // Rebuild live ranges and check the invariant directly.
        let mut ranges: HashMap<u32, (u32, u32)> = HashMap::new();
        for (idx, inst) in block.insts.iter().enumerate() {
            inst.visit_vregs(|v, _| {
                let e = ranges.entry(v.id).or_insert((idx as u32, idx as u32));
                e.1 = idx as u32;
            });
        }
        let ids: Vec<u32> = ranges.keys().copied().collect();
        for (i, &a) in ids.iter().enumerate() {
            for &b_id in &ids[i + 1..] {
                let (a_s, a_e) = ranges[&a];
                let (b_s, b_e) = ranges[&b_id];
                let overlap = a_s <= b_e && b_s <= a_e;
                if !overlap {
                    continue;
                }
                let ra = map.lookup(a).unwrap();
                let rb = map.lookup(b_id).unwrap();
                if let (Assignment::Gpr(x), Assignment::Gpr(y)) = (ra, rb) {
                    assert_ne!(x, y, "vregs {a} and {b_id} overlap in x{x}");
                }
            }
        }
    }

    #[test]
    fn pool_exhaustion_spills_lowest_priority() {
        // More simultaneously-live integer vregs than the pool holds.
        let mut b = IrBuilder::new();
        let mut regs = Vec::new();
        for _ in 0..(GPR_POOL.len() + 4) {
            regs.push(b.const_val(7, DataType::I32));
        }
        // One heavily-used vreg that must stay in a register.
        let hot = b.const_val(1, DataType::I32);
        let mut acc = hot;
        for _ in 0..6 {
            let dst = b.vreg(DataType::I32);
            b.push(Inst::Alu {
                op: talon_x86::ir::AluOp::Add,
                dst,
                lhs: acc,
                rhs: hot,
                flags: FlagSet::empty(),
            });
            acc = dst;
        }
        // Keep all of `regs` live to the end.
        for r in &regs {
            b.push(Inst::WriteReg {
                reg: Gpr::Eax,
                width: Width::W32,
                high8: false,
                src: *r,
            });
        }
        b.push(Inst::WriteReg {
            reg: Gpr::Ebx,
            width: Width::W32,
            high8: false,
            src: acc,
        });
        let block = b.finish(0, Terminator::Jmp { target: 4 });
        let map = allocate(&block);

        let spilled = (0..map.len() as u32)
            .filter_map(|id| map.lookup(id))
            .filter(Assignment::is_spill)
            .count();
        assert!(spilled >= 4, "expected spills, got {spilled}");
        assert!(map.spill_size >= 16);
        assert_eq!(map.spill_size % 16, 0);
    }

    #[test]
    fn spill_slots_do_not_alias() {
        let mut b = IrBuilder::new();
        let mut regs = Vec::new();
        for _ in 0..(GPR_POOL.len() + 8) {
            regs.push(b.const_val(7, DataType::I32));
        }
        for r in &regs {
            b.push(Inst::WriteReg {
                reg: Gpr::Eax,
                width: Width::W32,
                high8: false,
                src: *r,
            });
        }
        let block = b.finish(0, Terminator::Jmp { target: 4 });
        let map = allocate(&block);
        let mut offsets = Vec::new();
        for id in 0..regs.len() as u32 {
            if let Some(Assignment::Spill { offset, .. }) = map.lookup(id) {
                assert!(!offsets.contains(&offset), "aliased spill slot {offset}");
                offsets.push(offset);
            }
        }
        assert!(!offsets.is_empty());
    }

    #[test]
    fn self_loop_blocks_boost_priorities() {
        let mut b = IrBuilder::new();
        let v = b.const_val(1, DataType::I32);
        let nz = b.vreg(DataType::I8);
        b.push(Inst::SetNz { dst: nz, src: v });
        let block = b.finish(
            0x100,
            Terminator::JccVreg {
                cond: nz,
                target: 0x100,
                fallthrough: 0x108,
            },
        );
        // Loop flag feeds priority; allocation still succeeds and assigns
        // both vregs.
        let map = allocate(&block);
        assert_eq!(map.len(), 2);
    }
}
