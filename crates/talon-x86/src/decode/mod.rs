//! Table-driven 32-bit x86 decoder.
//!
//! One call decodes one basic block: instructions are lowered to IR until the
//! first control-transfer instruction, which becomes the block terminator.
//! Memory operands become base/index/scale/disp references; the decoder never
//! touches guest memory contents itself.

mod fpu;
mod simd;

use thiserror::Error;

use talon_types::{Cond, DataType, FlagSet, Gpr, Width};

use crate::ir::{
    AluOp, Inst, IrBlock, IrBuilder, IrFunction, MemRef, ShiftOp, Terminator, Vreg,
};

/// Decode limits for a single block.
#[derive(Debug, Clone, Copy)]
pub struct BlockLimits {
    pub max_bytes: usize,
    pub max_insts: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        BlockLimits {
            max_bytes: 4096,
            max_insts: 2048,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("code ended mid-instruction at {addr:#010x}")]
    UnexpectedEof { addr: u32 },
    #[error("unsupported opcode {opcode:#x} at {addr:#010x}")]
    Unsupported { opcode: u32, addr: u32 },
    #[error("invalid instruction encoding at {addr:#010x}")]
    Invalid { addr: u32 },
    #[error("no block terminator within {limit} bytes of {addr:#010x}")]
    BlockTooLong { addr: u32, limit: usize },
}

/// Decodes one basic block starting at `addr` from `bytes` (which represent
/// guest memory at that address). Returns the IR function and the number of
/// guest bytes consumed.
pub fn decode_block(
    bytes: &[u8],
    addr: u32,
    limits: BlockLimits,
) -> Result<(IrFunction, usize), DecodeError> {
    let mut dec = Dec {
        bytes,
        pos: 0,
        start: addr,
        insn_start: 0,
        b: IrBuilder::new(),
        opsize16: false,
        sse_prefix: SsePrefix::None,
    };
    loop {
        if dec.pos >= limits.max_bytes || dec.b.len() >= limits.max_insts {
            return Err(DecodeError::BlockTooLong {
                addr,
                limit: limits.max_bytes,
            });
        }
        dec.insn_start = dec.pos;
        dec.opsize16 = false;
        dec.sse_prefix = SsePrefix::None;
        if let Some(term) = dec.insn()? {
            let consumed = dec.pos;
            let block = dec.b.finish(addr, term);
            debug_assert!(block.ssa_ok());
            tracing::trace!(
                entry = format_args!("{addr:#x}"),
                bytes = consumed,
                insts = block.insts.len(),
                "decoded block"
            );
            return Ok((
                IrFunction {
                    entry: addr,
                    blocks: vec![block],
                },
                consumed,
            ));
        }
    }
}

/// Decodes a single block and returns just the entry [`IrBlock`]; test helper.
pub fn decode_one(bytes: &[u8], addr: u32) -> Result<IrBlock, DecodeError> {
    let (func, _) = decode_block(bytes, addr, BlockLimits::default())?;
    Ok(func.blocks.into_iter().next().unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SsePrefix {
    None,
    Op66,
    F3,
    F2,
}

/// Register-or-memory operand from mod-R/M.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Rm {
    Reg(u8),
    Mem(MemRef),
}

pub(crate) struct Dec<'a> {
    bytes: &'a [u8],
    pos: usize,
    start: u32,
    insn_start: usize,
    pub(crate) b: IrBuilder,
    pub(crate) opsize16: bool,
    pub(crate) sse_prefix: SsePrefix,
}

impl<'a> Dec<'a> {
    pub(crate) fn cur_addr(&self) -> u32 {
        self.start.wrapping_add(self.insn_start as u32)
    }

    /// Guest address of the byte after the current position.
    pub(crate) fn next_addr(&self) -> u32 {
        self.start.wrapping_add(self.pos as u32)
    }

    /// Peeks the next byte without consuming it.
    pub(crate) fn bytes_peek(&self) -> Option<&u8> {
        self.bytes.get(self.pos)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof {
                addr: self.cur_addr(),
            })?;
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.u8()? as u16;
        let hi = self.u8()? as u16;
        Ok(lo | (hi << 8))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.u16()? as u32;
        let hi = self.u16()? as u32;
        Ok(lo | (hi << 16))
    }

    fn unsupported(&self, opcode: u32) -> DecodeError {
        DecodeError::Unsupported {
            opcode,
            addr: self.cur_addr(),
        }
    }

    fn invalid(&self) -> DecodeError {
        DecodeError::Invalid {
            addr: self.cur_addr(),
        }
    }

    /// Operand width of the current instruction's "v" forms.
    pub(crate) fn opw(&self) -> Width {
        if self.opsize16 {
            Width::W16
        } else {
            Width::W32
        }
    }

    pub(crate) fn int_ty(&self, w: Width) -> DataType {
        match w {
            Width::W8 => DataType::I8,
            Width::W16 => DataType::I16,
            Width::W32 => DataType::I32,
            Width::W64 => DataType::I64,
        }
    }

    /// Reads the immediate matching `w` (imm8/imm16/imm32).
    pub(crate) fn imm(&mut self, w: Width) -> Result<i64, DecodeError> {
        Ok(match w {
            Width::W8 => self.u8()? as i64,
            Width::W16 => self.u16()? as i64,
            _ => self.u32()? as i64,
        })
    }

    pub(crate) fn read_gpr32(&mut self, idx: u8) -> Vreg {
        let reg = Gpr::from_index(idx).unwrap();
        let dst = self.b.vreg(DataType::I32);
        self.b.push(Inst::ReadReg {
            dst,
            reg,
            width: Width::W32,
            high8: false,
        });
        dst
    }

    pub(crate) fn read_gpr(&mut self, idx: u8, w: Width) -> Vreg {
        let (reg, high8) = if w == Width::W8 && idx >= 4 {
            (Gpr::from_index(idx - 4).unwrap(), true)
        } else {
            (Gpr::from_index(idx).unwrap(), false)
        };
        let dst = self.b.vreg(self.int_ty(w));
        self.b.push(Inst::ReadReg {
            dst,
            reg,
            width: w,
            high8,
        });
        dst
    }

    pub(crate) fn write_gpr(&mut self, idx: u8, w: Width, src: Vreg) {
        let (reg, high8) = if w == Width::W8 && idx >= 4 {
            (Gpr::from_index(idx - 4).unwrap(), true)
        } else {
            (Gpr::from_index(idx).unwrap(), false)
        };
        self.b.push(Inst::WriteReg {
            reg,
            width: w,
            high8,
            src,
        });
    }

    /// Parses mod-R/M (and SIB/displacement) for a memory access of type
    /// `ty`. Returns the `reg` field and the r/m operand.
    pub(crate) fn modrm(&mut self, ty: DataType) -> Result<(u8, Rm), DecodeError> {
        let m = self.u8()?;
        let mode = m >> 6;
        let reg = (m >> 3) & 7;
        let rm = m & 7;
        if mode == 3 {
            return Ok((reg, Rm::Reg(rm)));
        }

        let mut base: Option<u8> = Some(rm);
        let mut index: Option<(u8, u8)> = None;
        let mut disp: i32 = 0;
        if rm == 4 {
            let sib = self.u8()?;
            let scale = 1u8 << (sib >> 6);
            let idx = (sib >> 3) & 7;
            let b = sib & 7;
            if idx != 4 {
                index = Some((idx, scale));
            }
            base = Some(b);
            if b == 5 && mode == 0 {
                base = None;
                disp = self.u32()? as i32;
            }
        } else if rm == 5 && mode == 0 {
            base = None;
            disp = self.u32()? as i32;
        }
        match mode {
            1 => disp = self.u8()? as i8 as i32,
            2 => disp = self.u32()? as i32,
            _ => {}
        }

        let base_v = base.map(|r| self.read_gpr32(r));
        let index_v = index.map(|(r, _)| self.read_gpr32(r));
        let scale = index.map_or(1, |(_, s)| s);
        Ok((
            reg,
            Rm::Mem(MemRef {
                base: base_v,
                index: index_v,
                scale,
                disp,
                ty,
            }),
        ))
    }

    /// Like [`Self::modrm`] but requires a memory operand.
    pub(crate) fn modrm_mem(&mut self, ty: DataType) -> Result<(u8, MemRef), DecodeError> {
        match self.modrm(ty)? {
            (reg, Rm::Mem(m)) => Ok((reg, m)),
            _ => Err(self.invalid()),
        }
    }

    pub(crate) fn rm_load(&mut self, rm: Rm, w: Width) -> Vreg {
        match rm {
            Rm::Reg(idx) => self.read_gpr(idx, w),
            Rm::Mem(mut mem) => {
                mem.ty = self.int_ty(w);
                let dst = self.b.vreg(mem.ty);
                self.b.push(Inst::Load { dst, mem });
                dst
            }
        }
    }

    pub(crate) fn rm_store(&mut self, rm: Rm, w: Width, src: Vreg) {
        match rm {
            Rm::Reg(idx) => self.write_gpr(idx, w, src),
            Rm::Mem(mut mem) => {
                mem.ty = self.int_ty(w);
                self.b.push(Inst::Store { mem, src });
            }
        }
    }

    pub(crate) fn const_v(&mut self, value: i64, ty: DataType) -> Vreg {
        self.b.const_val(value, ty)
    }

    fn alu(&mut self, op: AluOp, lhs: Vreg, rhs: Vreg, flags: FlagSet) -> Vreg {
        let dst = self.b.vreg(lhs.ty);
        self.b.push(Inst::Alu {
            op,
            dst,
            lhs,
            rhs,
            flags,
        });
        dst
    }

    /// ESP-relative push of an I16/I32 value.
    pub(crate) fn push_val(&mut self, v: Vreg) {
        let size = v.ty.size_bytes() as i64;
        let esp = self.read_gpr32(4);
        let c = self.const_v(size, DataType::I32);
        let nesp = self.alu(AluOp::Sub, esp, c, FlagSet::empty());
        self.write_gpr(4, Width::W32, nesp);
        self.b.push(Inst::Store {
            mem: MemRef {
                base: Some(nesp),
                index: None,
                scale: 1,
                disp: 0,
                ty: v.ty,
            },
            src: v,
        });
    }

    /// ESP-relative pop.
    pub(crate) fn pop_val(&mut self, ty: DataType) -> Vreg {
        let esp = self.read_gpr32(4);
        let dst = self.b.vreg(ty);
        self.b.push(Inst::Load {
            dst,
            mem: MemRef {
                base: Some(esp),
                index: None,
                scale: 1,
                disp: 0,
                ty,
            },
        });
        let c = self.const_v(ty.size_bytes() as i64, DataType::I32);
        let nesp = self.alu(AluOp::Add, esp, c, FlagSet::empty());
        self.write_gpr(4, Width::W32, nesp);
        dst
    }

    /// EFLAGS read-modify-write helper for CLC/STC/CMC/CLD/STD/SAHF.
    fn flags_rmw(&mut self, and_mask: u32, xor_mask: u32, or_src: Option<Vreg>) {
        let f = self.b.vreg(DataType::I32);
        self.b.push(Inst::ReadFlags { dst: f });
        let m = self.const_v(and_mask as i64, DataType::I32);
        let mut v = self.alu(AluOp::And, f, m, FlagSet::empty());
        if xor_mask != 0 {
            let x = self.const_v(xor_mask as i64, DataType::I32);
            v = self.alu(AluOp::Xor, v, x, FlagSet::empty());
        }
        if let Some(or_v) = or_src {
            v = self.alu(AluOp::Or, v, or_v, FlagSet::empty());
        }
        self.b.push(Inst::WriteFlags { src: v });
    }

    /// Decodes one instruction; returns a terminator when the block ends.
    fn insn(&mut self) -> Result<Option<Terminator>, DecodeError> {
        // Prefixes.
        let opcode = loop {
            let byte = self.u8()?;
            match byte {
                0x66 => {
                    self.opsize16 = true;
                    if self.sse_prefix == SsePrefix::None {
                        self.sse_prefix = SsePrefix::Op66;
                    }
                }
                0x67 => return Err(self.unsupported(0x67)),
                0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 => {
                    // Segment overrides are accepted and ignored: flat model.
                }
                0xf0 => {
                    // LOCK: accepted; atomicity is the conservative memory
                    // model's concern, not the decoder's.
                }
                0xf2 => self.sse_prefix = SsePrefix::F2,
                0xf3 => self.sse_prefix = SsePrefix::F3,
                other => break other,
            }
        };

        match opcode {
            0x0f => return self.twobyte(),
            0xd8..=0xdf => {
                fpu::decode(self, opcode)?;
                return Ok(None);
            }
            _ => {}
        }

        let w = self.opw();
        match opcode {
            // ALU block: add/or/adc/sbb/and/sub/xor/cmp.
            0x00..=0x3d if (opcode & 7) <= 5 => {
                let kind = opcode >> 3;
                let form = opcode & 7;
                let op = match kind {
                    0 => Some(AluOp::Add),
                    1 => Some(AluOp::Or),
                    2 => Some(AluOp::Adc),
                    3 => Some(AluOp::Sbb),
                    4 => Some(AluOp::And),
                    5 => Some(AluOp::Sub),
                    6 => Some(AluOp::Xor),
                    _ => None, // CMP
                };
                let width = if form & 1 == 0 { Width::W8 } else { w };
                match form {
                    0 | 1 => {
                        // r/m ← r/m op r
                        let (reg, rm) = self.modrm(self.int_ty(width))?;
                        let lhs = self.rm_load(rm, width);
                        let rhs = self.read_gpr(reg, width);
                        match op {
                            Some(op) => {
                                let dst = self.alu(op, lhs, rhs, FlagSet::ALU);
                                self.rm_store(rm, width, dst);
                            }
                            None => self.b.push(Inst::CmpFlags { lhs, rhs }),
                        }
                    }
                    2 | 3 => {
                        // r ← r op r/m
                        let (reg, rm) = self.modrm(self.int_ty(width))?;
                        let lhs = self.read_gpr(reg, width);
                        let rhs = self.rm_load(rm, width);
                        match op {
                            Some(op) => {
                                let dst = self.alu(op, lhs, rhs, FlagSet::ALU);
                                self.write_gpr(reg, width, dst);
                            }
                            None => self.b.push(Inst::CmpFlags { lhs, rhs }),
                        }
                    }
                    _ => {
                        // AL/eAX ← AL/eAX op imm
                        let lhs = self.read_gpr(0, width);
                        let imm = self.imm(width)?;
                        let rhs = self.const_v(imm, self.int_ty(width));
                        match op {
                            Some(op) => {
                                let dst = self.alu(op, lhs, rhs, FlagSet::ALU);
                                self.write_gpr(0, width, dst);
                            }
                            None => self.b.push(Inst::CmpFlags { lhs, rhs }),
                        }
                    }
                }
                Ok(None)
            }

            // INC/DEC r.
            0x40..=0x4f => {
                let idx = opcode & 7;
                let dec = opcode >= 0x48;
                let lhs = self.read_gpr(idx, w);
                let one = self.const_v(1, self.int_ty(w));
                let op = if dec { AluOp::Sub } else { AluOp::Add };
                let dst = self.alu(op, lhs, one, FlagSet::ALU.without(FlagSet::CF));
                self.write_gpr(idx, w, dst);
                Ok(None)
            }

            // PUSH/POP r.
            0x50..=0x57 => {
                let v = self.read_gpr(opcode & 7, w);
                self.push_val(v);
                Ok(None)
            }
            0x58..=0x5f => {
                let v = self.pop_val(self.int_ty(w));
                self.write_gpr(opcode & 7, w, v);
                Ok(None)
            }

            // PUSHA/POPA.
            0x60 => {
                let esp0 = self.read_gpr32(4);
                for idx in 0..8u8 {
                    let v = if idx == 4 { esp0 } else { self.read_gpr32(idx) };
                    self.push_val(v);
                }
                Ok(None)
            }
            0x61 => {
                for idx in (0..8u8).rev() {
                    let v = self.pop_val(DataType::I32);
                    if idx != 4 {
                        self.write_gpr(idx, Width::W32, v);
                    }
                }
                Ok(None)
            }

            // PUSH imm.
            0x68 => {
                let imm = self.imm(w)?;
                let v = self.const_v(imm, self.int_ty(w));
                self.push_val(v);
                Ok(None)
            }
            0x6a => {
                let imm = self.u8()? as i8 as i64;
                let v = self.const_v(imm, self.int_ty(w));
                self.push_val(v);
                Ok(None)
            }

            // IMUL r, r/m, imm.
            0x69 | 0x6b => {
                let (reg, rm) = self.modrm(self.int_ty(w))?;
                let lhs = self.rm_load(rm, w);
                let imm = if opcode == 0x69 {
                    match w {
                        Width::W16 => self.u16()? as i16 as i64,
                        _ => self.u32()? as i32 as i64,
                    }
                } else {
                    self.u8()? as i8 as i64
                };
                let rhs = self.const_v(imm, self.int_ty(w));
                let dst = self.b.vreg(self.int_ty(w));
                self.b.push(Inst::Imul { dst, lhs, rhs });
                self.write_gpr(reg, w, dst);
                Ok(None)
            }

            // Jcc rel8.
            0x70..=0x7f => {
                let cond = Cond::from_encoding(opcode & 0xf).unwrap();
                let rel = self.u8()? as i8 as i32;
                let fallthrough = self.next_addr();
                let target = fallthrough.wrapping_add(rel as u32);
                Ok(Some(Terminator::Jcc {
                    cond,
                    target,
                    fallthrough,
                }))
            }

            // Group 1: ALU r/m, imm.
            0x80 | 0x81 | 0x83 => {
                let width = if opcode == 0x80 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                let imm = if opcode == 0x83 {
                    self.u8()? as i8 as i64
                } else {
                    self.imm(width)?
                };
                let lhs = self.rm_load(rm, width);
                let rhs = self.const_v(imm, self.int_ty(width));
                let op = match reg {
                    0 => Some(AluOp::Add),
                    1 => Some(AluOp::Or),
                    2 => Some(AluOp::Adc),
                    3 => Some(AluOp::Sbb),
                    4 => Some(AluOp::And),
                    5 => Some(AluOp::Sub),
                    6 => Some(AluOp::Xor),
                    _ => None,
                };
                match op {
                    Some(op) => {
                        let dst = self.alu(op, lhs, rhs, FlagSet::ALU);
                        self.rm_store(rm, width, dst);
                    }
                    None => self.b.push(Inst::CmpFlags { lhs, rhs }),
                }
                Ok(None)
            }

            // TEST r/m, r.
            0x84 | 0x85 => {
                let width = if opcode == 0x84 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                let lhs = self.rm_load(rm, width);
                let rhs = self.read_gpr(reg, width);
                self.b.push(Inst::TestFlags { lhs, rhs });
                Ok(None)
            }

            // XCHG r/m, r.
            0x86 | 0x87 => {
                let width = if opcode == 0x86 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                let a = self.rm_load(rm, width);
                let b = self.read_gpr(reg, width);
                self.rm_store(rm, width, b);
                self.write_gpr(reg, width, a);
                Ok(None)
            }

            // MOV.
            0x88 | 0x89 => {
                let width = if opcode == 0x88 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                let v = self.read_gpr(reg, width);
                self.rm_store(rm, width, v);
                Ok(None)
            }
            0x8a | 0x8b => {
                let width = if opcode == 0x8a { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                let v = self.rm_load(rm, width);
                self.write_gpr(reg, width, v);
                Ok(None)
            }

            // LEA.
            0x8d => {
                let (reg, mem) = self.modrm_mem(DataType::Ptr)?;
                let dst = self.b.vreg(DataType::I32);
                self.b.push(Inst::Lea { dst, mem });
                self.write_gpr(reg, w, dst);
                Ok(None)
            }

            // POP r/m32.
            0x8f => {
                let (reg, rm) = self.modrm(self.int_ty(w))?;
                if reg != 0 {
                    return Err(self.invalid());
                }
                let v = self.pop_val(self.int_ty(w));
                self.rm_store(rm, w, v);
                Ok(None)
            }

            // NOP / XCHG eAX, r.
            0x90 => Ok(None),
            0x91..=0x97 => {
                let idx = opcode & 7;
                let a = self.read_gpr(0, w);
                let b = self.read_gpr(idx, w);
                self.write_gpr(0, w, b);
                self.write_gpr(idx, w, a);
                Ok(None)
            }

            // CBW/CWDE.
            0x98 => {
                if self.opsize16 {
                    let al = self.read_gpr(0, Width::W8);
                    let ax = self.b.vreg(DataType::I16);
                    self.b.push(Inst::Ext {
                        dst: ax,
                        src: al,
                        sign: true,
                    });
                    self.write_gpr(0, Width::W16, ax);
                } else {
                    let ax = self.read_gpr(0, Width::W16);
                    let eax = self.b.vreg(DataType::I32);
                    self.b.push(Inst::Ext {
                        dst: eax,
                        src: ax,
                        sign: true,
                    });
                    self.write_gpr(0, Width::W32, eax);
                }
                Ok(None)
            }
            // CWD/CDQ.
            0x99 => {
                let a = self.read_gpr(0, w);
                let shift = self.const_v(i64::from(w.bits() - 1), self.int_ty(w));
                let hi = self.b.vreg(self.int_ty(w));
                self.b.push(Inst::Shift {
                    op: ShiftOp::Sar,
                    dst: hi,
                    src: a,
                    count: shift,
                    flags: FlagSet::empty(),
                });
                self.write_gpr(2, w, hi);
                Ok(None)
            }

            // WAIT: no pending-exception model at decode level.
            0x9b => Ok(None),

            // PUSHF/POPF.
            0x9c => {
                let f = self.b.vreg(DataType::I32);
                self.b.push(Inst::ReadFlags { dst: f });
                let f16;
                let v = if self.opsize16 {
                    f16 = self.b.vreg(DataType::I16);
                    self.b.push(Inst::Ext {
                        dst: f16,
                        src: f,
                        sign: false,
                    });
                    f16
                } else {
                    f
                };
                self.push_val(v);
                Ok(None)
            }
            0x9d => {
                let v = self.pop_val(self.int_ty(w));
                let v32 = if self.opsize16 {
                    let x = self.b.vreg(DataType::I32);
                    self.b.push(Inst::Ext {
                        dst: x,
                        src: v,
                        sign: false,
                    });
                    x
                } else {
                    v
                };
                self.b.push(Inst::WriteFlags { src: v32 });
                Ok(None)
            }

            // SAHF/LAHF.
            0x9e => {
                let ah = self.read_gpr(4, Width::W8);
                let ah32 = self.b.vreg(DataType::I32);
                self.b.push(Inst::Ext {
                    dst: ah32,
                    src: ah,
                    sign: false,
                });
                let m = self.const_v(0xd5, DataType::I32);
                let masked = self.alu(AluOp::And, ah32, m, FlagSet::empty());
                self.flags_rmw(!0xd5u32, 0, Some(masked));
                Ok(None)
            }
            0x9f => {
                let f = self.b.vreg(DataType::I32);
                self.b.push(Inst::ReadFlags { dst: f });
                let m = self.const_v(0xd5, DataType::I32);
                let low = self.alu(AluOp::And, f, m, FlagSet::empty());
                let fixed = self.const_v(0x02, DataType::I32);
                let low = self.alu(AluOp::Or, low, fixed, FlagSet::empty());
                let ah = self.b.vreg(DataType::I8);
                self.b.push(Inst::Ext {
                    dst: ah,
                    src: low,
                    sign: false,
                });
                self.write_gpr(4, Width::W8, ah);
                Ok(None)
            }

            // MOV AL/eAX ↔ moffs32.
            0xa0 | 0xa1 | 0xa2 | 0xa3 => {
                let width = if opcode & 1 == 0 { Width::W8 } else { w };
                let disp = self.u32()? as i32;
                let mem = MemRef::absolute(disp, self.int_ty(width));
                if opcode < 0xa2 {
                    let dst = self.b.vreg(mem.ty);
                    self.b.push(Inst::Load { dst, mem });
                    self.write_gpr(0, width, dst);
                } else {
                    let src = self.read_gpr(0, width);
                    self.b.push(Inst::Store { mem, src });
                }
                Ok(None)
            }

            // TEST AL/eAX, imm.
            0xa8 | 0xa9 => {
                let width = if opcode == 0xa8 { Width::W8 } else { w };
                let lhs = self.read_gpr(0, width);
                let imm = self.imm(width)?;
                let rhs = self.const_v(imm, self.int_ty(width));
                self.b.push(Inst::TestFlags { lhs, rhs });
                Ok(None)
            }

            // MOV r, imm.
            0xb0..=0xb7 => {
                let imm = self.u8()? as i64;
                let v = self.const_v(imm, DataType::I8);
                self.write_gpr(opcode & 7, Width::W8, v);
                Ok(None)
            }
            0xb8..=0xbf => {
                let imm = self.imm(w)?;
                let v = self.const_v(imm, self.int_ty(w));
                self.write_gpr(opcode & 7, w, v);
                Ok(None)
            }

            // Group 2 shifts/rotates.
            0xc0 | 0xc1 | 0xd0 | 0xd1 | 0xd2 | 0xd3 => {
                let width = if opcode & 1 == 0 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                let count = match opcode {
                    0xc0 | 0xc1 => {
                        let c = self.u8()? as i64;
                        self.const_v(c, DataType::I8)
                    }
                    0xd0 | 0xd1 => self.const_v(1, DataType::I8),
                    _ => self.read_gpr(1, Width::W8), // CL
                };
                let op = match reg {
                    0 => ShiftOp::Rol,
                    1 => ShiftOp::Ror,
                    2 => ShiftOp::Rcl,
                    3 => ShiftOp::Rcr,
                    4 | 6 => ShiftOp::Shl,
                    5 => ShiftOp::Shr,
                    _ => ShiftOp::Sar,
                };
                let flags = match op {
                    ShiftOp::Shl | ShiftOp::Shr | ShiftOp::Sar => FlagSet::ALU,
                    _ => FlagSet::CF | FlagSet::OF,
                };
                let src = self.rm_load(rm, width);
                let dst = self.b.vreg(self.int_ty(width));
                self.b.push(Inst::Shift {
                    op,
                    dst,
                    src,
                    count,
                    flags,
                });
                self.rm_store(rm, width, dst);
                Ok(None)
            }

            // RET (imm16).
            0xc2 => {
                let imm = self.u16()? as i64;
                let addr = self.pop_val(DataType::I32);
                let esp = self.read_gpr32(4);
                let c = self.const_v(imm, DataType::I32);
                let nesp = self.alu(AluOp::Add, esp, c, FlagSet::empty());
                self.write_gpr(4, Width::W32, nesp);
                Ok(Some(Terminator::Ret { addr }))
            }
            0xc3 => {
                let addr = self.pop_val(DataType::I32);
                Ok(Some(Terminator::Ret { addr }))
            }

            // MOV r/m, imm.
            0xc6 | 0xc7 => {
                let width = if opcode == 0xc6 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                if reg != 0 {
                    return Err(self.invalid());
                }
                let imm = self.imm(width)?;
                let v = self.const_v(imm, self.int_ty(width));
                self.rm_store(rm, width, v);
                Ok(None)
            }

            // LEAVE.
            0xc9 => {
                let ebp = self.read_gpr32(5);
                self.write_gpr(4, Width::W32, ebp);
                let v = self.pop_val(DataType::I32);
                self.write_gpr(5, Width::W32, v);
                Ok(None)
            }

            // INT3 / INT imm8.
            0xcc => Ok(Some(Terminator::Interrupt {
                vector: 3,
                next: self.next_addr(),
            })),
            0xcd => {
                let vector = self.u8()?;
                Ok(Some(Terminator::Interrupt {
                    vector,
                    next: self.next_addr(),
                }))
            }

            // LOOPNE/LOOPE/LOOP/JECXZ (rel8).
            0xe0..=0xe3 => {
                let rel = self.u8()? as i8 as i32;
                let fallthrough = self.next_addr();
                let target = fallthrough.wrapping_add(rel as u32);
                let cond = if opcode == 0xe3 {
                    // JECXZ: taken when ECX == 0.
                    let ecx = self.read_gpr32(1);
                    let nz = self.b.vreg(DataType::I8);
                    self.b.push(Inst::SetNz { dst: nz, src: ecx });
                    let one = self.const_v(1, DataType::I8);
                    self.alu(AluOp::Xor, nz, one, FlagSet::empty())
                } else {
                    // LOOP family decrements ECX without touching flags.
                    let ecx = self.read_gpr32(1);
                    let one = self.const_v(1, DataType::I32);
                    let necx = self.alu(AluOp::Sub, ecx, one, FlagSet::empty());
                    self.write_gpr(1, Width::W32, necx);
                    let nz = self.b.vreg(DataType::I8);
                    self.b.push(Inst::SetNz { dst: nz, src: necx });
                    match opcode {
                        0xe2 => nz,
                        0xe1 => {
                            let zf = self.b.vreg(DataType::I8);
                            self.b.push(Inst::EvalCond {
                                dst: zf,
                                cond: Cond::Z,
                            });
                            self.alu(AluOp::And, nz, zf, FlagSet::empty())
                        }
                        _ => {
                            let nzf = self.b.vreg(DataType::I8);
                            self.b.push(Inst::EvalCond {
                                dst: nzf,
                                cond: Cond::Nz,
                            });
                            self.alu(AluOp::And, nz, nzf, FlagSet::empty())
                        }
                    }
                };
                Ok(Some(Terminator::JccVreg {
                    cond,
                    target,
                    fallthrough,
                }))
            }

            // CALL rel32.
            0xe8 => {
                let rel = self.u32()? as i32;
                let next = self.next_addr();
                let ret = self.const_v(next as i64, DataType::I32);
                self.push_val(ret);
                Ok(Some(Terminator::Jmp {
                    target: next.wrapping_add(rel as u32),
                }))
            }
            // JMP rel32 / rel8.
            0xe9 => {
                let rel = self.u32()? as i32;
                let next = self.next_addr();
                Ok(Some(Terminator::Jmp {
                    target: next.wrapping_add(rel as u32),
                }))
            }
            0xeb => {
                let rel = self.u8()? as i8 as i32;
                let next = self.next_addr();
                Ok(Some(Terminator::Jmp {
                    target: next.wrapping_add(rel as u32),
                }))
            }

            // HLT.
            0xf4 => Ok(Some(Terminator::Halt {
                next: self.next_addr(),
            })),

            // Flag manipulation.
            0xf5 => {
                self.flags_rmw(u32::MAX, talon_types::EFLAGS_CF, None);
                Ok(None)
            }
            0xf8 => {
                self.flags_rmw(!talon_types::EFLAGS_CF, 0, None);
                Ok(None)
            }
            0xf9 => {
                let one = self.const_v(i64::from(talon_types::EFLAGS_CF), DataType::I32);
                self.flags_rmw(u32::MAX, 0, Some(one));
                Ok(None)
            }
            0xfc => {
                self.flags_rmw(!talon_types::EFLAGS_DF, 0, None);
                Ok(None)
            }
            0xfd => {
                let df = self.const_v(i64::from(talon_types::EFLAGS_DF), DataType::I32);
                self.flags_rmw(u32::MAX, 0, Some(df));
                Ok(None)
            }

            // Group 3.
            0xf6 | 0xf7 => {
                let width = if opcode == 0xf6 { Width::W8 } else { w };
                let (reg, rm) = self.modrm(self.int_ty(width))?;
                match reg {
                    0 | 1 => {
                        let lhs = self.rm_load(rm, width);
                        let imm = self.imm(width)?;
                        let rhs = self.const_v(imm, self.int_ty(width));
                        self.b.push(Inst::TestFlags { lhs, rhs });
                    }
                    2 => {
                        let srcv = self.rm_load(rm, width);
                        let dst = self.b.vreg(self.int_ty(width));
                        self.b.push(Inst::Not { dst, src: srcv });
                        self.rm_store(rm, width, dst);
                    }
                    3 => {
                        let srcv = self.rm_load(rm, width);
                        let dst = self.b.vreg(self.int_ty(width));
                        self.b.push(Inst::Neg {
                            dst,
                            src: srcv,
                            flags: FlagSet::ALU,
                        });
                        self.rm_store(rm, width, dst);
                    }
                    4 | 5 => {
                        let signed = reg == 5;
                        let rhs = self.rm_load(rm, width);
                        let lhs = self.read_gpr(0, width);
                        let dst_hi = self.b.vreg(self.int_ty(width));
                        let dst_lo = self.b.vreg(self.int_ty(width));
                        self.b.push(Inst::MulWide {
                            signed,
                            dst_hi,
                            dst_lo,
                            lhs,
                            rhs,
                        });
                        match width {
                            Width::W8 => {
                                self.write_gpr(0, Width::W8, dst_lo);
                                self.write_gpr(4, Width::W8, dst_hi); // AH
                            }
                            _ => {
                                self.write_gpr(0, width, dst_lo);
                                self.write_gpr(2, width, dst_hi); // eDX
                            }
                        }
                    }
                    _ => {
                        let signed = reg == 7;
                        let divisor = self.rm_load(rm, width);
                        let (hi, lo) = match width {
                            Width::W8 => (self.read_gpr(4, Width::W8), self.read_gpr(0, Width::W8)),
                            _ => (self.read_gpr(2, width), self.read_gpr(0, width)),
                        };
                        let dst_quot = self.b.vreg(self.int_ty(width));
                        let dst_rem = self.b.vreg(self.int_ty(width));
                        self.b.push(Inst::DivRem {
                            signed,
                            dst_quot,
                            dst_rem,
                            hi,
                            lo,
                            divisor,
                        });
                        match width {
                            Width::W8 => {
                                self.write_gpr(0, Width::W8, dst_quot);
                                self.write_gpr(4, Width::W8, dst_rem);
                            }
                            _ => {
                                self.write_gpr(0, width, dst_quot);
                                self.write_gpr(2, width, dst_rem);
                            }
                        }
                    }
                }
                Ok(None)
            }

            // Group 4: INC/DEC r/m8.
            0xfe => {
                let (reg, rm) = self.modrm(DataType::I8)?;
                if reg > 1 {
                    return Err(self.invalid());
                }
                let lhs = self.rm_load(rm, Width::W8);
                let one = self.const_v(1, DataType::I8);
                let op = if reg == 0 { AluOp::Add } else { AluOp::Sub };
                let dst = self.alu(op, lhs, one, FlagSet::ALU.without(FlagSet::CF));
                self.rm_store(rm, Width::W8, dst);
                Ok(None)
            }

            // Group 5.
            0xff => {
                let (reg, rm) = self.modrm(self.int_ty(w))?;
                match reg {
                    0 | 1 => {
                        let lhs = self.rm_load(rm, w);
                        let one = self.const_v(1, self.int_ty(w));
                        let op = if reg == 0 { AluOp::Add } else { AluOp::Sub };
                        let dst = self.alu(op, lhs, one, FlagSet::ALU.without(FlagSet::CF));
                        self.rm_store(rm, w, dst);
                        Ok(None)
                    }
                    2 => {
                        // CALL r/m32.
                        let target = self.rm_load(rm, Width::W32);
                        let next = self.next_addr();
                        let ret = self.const_v(next as i64, DataType::I32);
                        self.push_val(ret);
                        Ok(Some(Terminator::Indirect { addr: target }))
                    }
                    4 => {
                        let target = self.rm_load(rm, Width::W32);
                        Ok(Some(Terminator::Indirect { addr: target }))
                    }
                    6 => {
                        let v = self.rm_load(rm, w);
                        self.push_val(v);
                        Ok(None)
                    }
                    _ => Err(self.unsupported(0xff00 | u32::from(reg))),
                }
            }

            other => Err(self.unsupported(u32::from(other))),
        }
    }

    /// 0x0F two-byte map.
    fn twobyte(&mut self) -> Result<Option<Terminator>, DecodeError> {
        let opcode = self.u8()?;
        let w = self.opw();
        match opcode {
            // CMOVcc.
            0x40..=0x4f => {
                let cond = Cond::from_encoding(opcode & 0xf).unwrap();
                let (reg, rm) = self.modrm(self.int_ty(w))?;
                let if_true = self.rm_load(rm, w);
                let if_false = self.read_gpr(reg, w);
                let c = self.b.vreg(DataType::I8);
                self.b.push(Inst::EvalCond { dst: c, cond });
                let dst = self.b.vreg(self.int_ty(w));
                self.b.push(Inst::Select {
                    dst,
                    cond: c,
                    if_true,
                    if_false,
                });
                self.write_gpr(reg, w, dst);
                Ok(None)
            }

            // Jcc rel32.
            0x80..=0x8f => {
                let cond = Cond::from_encoding(opcode & 0xf).unwrap();
                let rel = self.u32()? as i32;
                let fallthrough = self.next_addr();
                let target = fallthrough.wrapping_add(rel as u32);
                Ok(Some(Terminator::Jcc {
                    cond,
                    target,
                    fallthrough,
                }))
            }

            // SETcc.
            0x90..=0x9f => {
                let cond = Cond::from_encoding(opcode & 0xf).unwrap();
                let (_, rm) = self.modrm(DataType::I8)?;
                let c = self.b.vreg(DataType::I8);
                self.b.push(Inst::EvalCond { dst: c, cond });
                self.rm_store(rm, Width::W8, c);
                Ok(None)
            }

            // IMUL r, r/m.
            0xaf => {
                let (reg, rm) = self.modrm(self.int_ty(w))?;
                let rhs = self.rm_load(rm, w);
                let lhs = self.read_gpr(reg, w);
                let dst = self.b.vreg(self.int_ty(w));
                self.b.push(Inst::Imul { dst, lhs, rhs });
                self.write_gpr(reg, w, dst);
                Ok(None)
            }

            // MOVZX/MOVSX.
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let srcw = if opcode & 1 == 0 { Width::W8 } else { Width::W16 };
                let sign = opcode >= 0xbe;
                let (reg, rm) = self.modrm(self.int_ty(srcw))?;
                let src = self.rm_load(rm, srcw);
                let dst = self.b.vreg(self.int_ty(w));
                self.b.push(Inst::Ext { dst, src, sign });
                self.write_gpr(reg, w, dst);
                Ok(None)
            }

            other => simd::twobyte(self, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_truncated_instruction() {
        // mov eax, imm32 with only two immediate bytes present.
        let err = decode_one(&[0xb8, 0x01, 0x02], 0x1000).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof { addr: 0x1000 });
    }

    #[test]
    fn rejects_unsupported_opcode() {
        // 0x0f 0xa2 = CPUID, outside the supported profile.
        let err = decode_one(&[0x0f, 0xa2], 0x2000).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { .. }));
    }
}
