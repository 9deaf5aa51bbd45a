//! MMX and SSE decoding: the vector portion of the 0x0F two-byte map.
//!
//! A 0x66 prefix moves the packed-integer forms onto the XMM file; 0xF3
//! selects the scalar-single forms of the SSE float ops. The decoder lowers
//! to vector-typed vregs; MMX mode transitions happen when the IR executes,
//! not here.

use talon_types::{BarrierKind, DataType, Width};

use super::{Dec, DecodeError, Rm, SsePrefix};
use crate::ir::{Inst, PackedOp, Terminator, VFloatOp, Vreg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    B,
    H,
    S,
    D,
}

fn v64(lane: Lane) -> DataType {
    match lane {
        Lane::B => DataType::V64B8,
        Lane::H => DataType::V64H4,
        Lane::S => DataType::V64S2,
        Lane::D => DataType::V64D1,
    }
}

fn v128(lane: Lane) -> DataType {
    match lane {
        Lane::B => DataType::V128B16,
        Lane::H => DataType::V128H8,
        Lane::S => DataType::V128S4,
        Lane::D => DataType::V128D2,
    }
}

impl<'a> Dec<'a> {
    fn is_xmm(&self) -> bool {
        self.sse_prefix == SsePrefix::Op66
    }

    fn vec_ty(&self, lane: Lane) -> DataType {
        if self.is_xmm() {
            v128(lane)
        } else {
            v64(lane)
        }
    }

    fn vec_read(&mut self, idx: u8, ty: DataType) -> Vreg {
        let dst = self.b.vreg(ty);
        if ty.size_bytes() == 16 || self.is_xmm() {
            self.b.push(Inst::XmmRead { dst, xmm: idx });
        } else {
            self.b.push(Inst::MmxRead { dst, mm: idx });
        }
        dst
    }

    fn vec_write(&mut self, idx: u8, src: Vreg) {
        if src.ty.size_bytes() == 16 || self.is_xmm() {
            self.b.push(Inst::XmmWrite { xmm: idx, src });
        } else {
            self.b.push(Inst::MmxWrite { mm: idx, src });
        }
    }

    fn vec_rm_load(&mut self, rm: Rm, ty: DataType) -> Vreg {
        match rm {
            Rm::Reg(idx) => self.vec_read(idx, ty),
            Rm::Mem(mut mem) => {
                mem.ty = ty;
                let dst = self.b.vreg(ty);
                self.b.push(Inst::Load { dst, mem });
                dst
            }
        }
    }

    fn vec_rm_store(&mut self, rm: Rm, src: Vreg) {
        match rm {
            Rm::Reg(idx) => self.vec_write(idx, src),
            Rm::Mem(mut mem) => {
                mem.ty = src.ty;
                self.b.push(Inst::Store { mem, src });
            }
        }
    }

    /// `reg ← reg op r/m` packed-integer form. Pack ops narrow: the
    /// destination lane differs from the source lane.
    fn packed(&mut self, op: PackedOp, src_lane: Lane, dst_lane: Lane) -> Result<(), DecodeError> {
        let sty = self.vec_ty(src_lane);
        let dty = self.vec_ty(dst_lane);
        let (reg, rm) = self.modrm(sty)?;
        let lhs = self.vec_read(reg, sty);
        let rhs = self.vec_rm_load(rm, sty);
        let dst = self.b.vreg(dty);
        self.b.push(Inst::Packed { op, dst, lhs, rhs });
        self.vec_write(reg, dst);
        Ok(())
    }

    /// Packed shift with the count taken from r/m (low 64 bits).
    fn packed_shift_rm(&mut self, op: PackedOp, lane: Lane) -> Result<(), DecodeError> {
        self.packed(op, lane, lane)
    }

    /// Packed shift with an immediate count (groups 0x71..0x73). mod must be
    /// 3; the r/m field names the destination register.
    fn packed_shift_imm(&mut self, op: PackedOp, lane: Lane) -> Result<(), DecodeError> {
        let ty = self.vec_ty(lane);
        let m = self.u8()?;
        if m < 0xc0 {
            return Err(DecodeError::Invalid {
                addr: self.cur_addr(),
            });
        }
        let idx = m & 7;
        let count = self.u8()? as i64;
        let lhs = self.vec_read(idx, ty);
        let rhs = self.b.const_val(count, ty);
        let dst = self.b.vreg(ty);
        self.b.push(Inst::Packed { op, dst, lhs, rhs });
        self.vec_write(idx, dst);
        Ok(())
    }

    /// Reads lane 0 of an XMM register or an m32 as an F32 value.
    fn scalar_rm_load(&mut self, rm: Rm) -> Vreg {
        match rm {
            Rm::Reg(idx) => {
                let dst = self.b.vreg(DataType::F32);
                self.b.push(Inst::XmmRead { dst, xmm: idx });
                dst
            }
            Rm::Mem(mut mem) => {
                mem.ty = DataType::F32;
                let dst = self.b.vreg(DataType::F32);
                self.b.push(Inst::Load { dst, mem });
                dst
            }
        }
    }

    /// Writes an F32 result into lane 0 of `xmm`, preserving upper lanes.
    fn scalar_writeback(&mut self, xmm: u8, value: Vreg) {
        let base = self.b.vreg(DataType::V128S4);
        self.b.push(Inst::XmmRead { dst: base, xmm });
        let merged = self.b.vreg(DataType::V128S4);
        self.b.push(Inst::InsertF32 {
            dst: merged,
            base,
            src: value,
        });
        self.b.push(Inst::XmmWrite { xmm, src: merged });
    }

    /// SSE float arithmetic: packed (PS) or, under 0xF3, scalar (SS).
    fn sse_float(&mut self, op: VFloatOp) -> Result<(), DecodeError> {
        if self.sse_prefix == SsePrefix::F3 {
            let (reg, rm) = self.modrm(DataType::F32)?;
            let lhs = self.b.vreg(DataType::F32);
            self.b.push(Inst::XmmRead { dst: lhs, xmm: reg });
            let rhs = self.scalar_rm_load(rm);
            let dst = self.b.vreg(DataType::F32);
            self.b.push(Inst::VFloat { op, dst, lhs, rhs });
            self.scalar_writeback(reg, dst);
        } else {
            let (reg, rm) = self.modrm(DataType::V128S4)?;
            let lhs = self.vec_read_x(reg, DataType::V128S4);
            let rhs = self.vec_rm_load_x(rm, DataType::V128S4);
            let dst = self.b.vreg(DataType::V128S4);
            self.b.push(Inst::VFloat { op, dst, lhs, rhs });
            self.b.push(Inst::XmmWrite { xmm: reg, src: dst });
        }
        Ok(())
    }

    /// XMM read regardless of the 0x66 prefix (PS forms have none).
    fn vec_read_x(&mut self, idx: u8, ty: DataType) -> Vreg {
        let dst = self.b.vreg(ty);
        self.b.push(Inst::XmmRead { dst, xmm: idx });
        dst
    }

    fn vec_rm_load_x(&mut self, rm: Rm, ty: DataType) -> Vreg {
        match rm {
            Rm::Reg(idx) => self.vec_read_x(idx, ty),
            Rm::Mem(mut mem) => {
                mem.ty = ty;
                let dst = self.b.vreg(ty);
                self.b.push(Inst::Load { dst, mem });
                dst
            }
        }
    }
}

pub(super) fn twobyte(dec: &mut Dec, opcode: u8) -> Result<Option<Terminator>, DecodeError> {
    let unsupported = |dec: &Dec<'_>| DecodeError::Unsupported {
        opcode: 0x0f00 | u32::from(opcode),
        addr: dec.cur_addr(),
    };

    match opcode {
        // MOVUPS/MOVSS load; MOVAPS load.
        0x10 | 0x28 => {
            if dec.sse_prefix == SsePrefix::F3 && opcode == 0x10 {
                let (reg, rm) = dec.modrm(DataType::F32)?;
                match rm {
                    Rm::Mem(_) => {
                        // MOVSS xmm, m32 zeroes the upper lanes.
                        let v = dec.scalar_rm_load(rm);
                        dec.b.push(Inst::XmmWrite { xmm: reg, src: v });
                    }
                    Rm::Reg(_) => {
                        let v = dec.scalar_rm_load(rm);
                        dec.scalar_writeback(reg, v);
                    }
                }
            } else {
                let (reg, rm) = dec.modrm(DataType::V128S4)?;
                let v = dec.vec_rm_load_x(rm, DataType::V128S4);
                dec.b.push(Inst::XmmWrite { xmm: reg, src: v });
            }
            Ok(None)
        }
        // MOVUPS/MOVSS store; MOVAPS store.
        0x11 | 0x29 => {
            if dec.sse_prefix == SsePrefix::F3 && opcode == 0x11 {
                let (reg, rm) = dec.modrm(DataType::F32)?;
                let v = dec.b.vreg(DataType::F32);
                dec.b.push(Inst::XmmRead { dst: v, xmm: reg });
                match rm {
                    Rm::Mem(mut mem) => {
                        mem.ty = DataType::F32;
                        dec.b.push(Inst::Store { mem, src: v });
                    }
                    Rm::Reg(idx) => dec.scalar_writeback(idx, v),
                }
            } else {
                let (reg, rm) = dec.modrm(DataType::V128S4)?;
                let v = dec.vec_read_x(reg, DataType::V128S4);
                match rm {
                    Rm::Mem(mut mem) => {
                        mem.ty = DataType::V128S4;
                        dec.b.push(Inst::Store { mem, src: v });
                    }
                    Rm::Reg(idx) => dec.b.push(Inst::XmmWrite { xmm: idx, src: v }),
                }
            }
            Ok(None)
        }

        // UNPCKLPS/UNPCKHPS.
        0x14 => {
            let save = dec.sse_prefix;
            dec.sse_prefix = SsePrefix::Op66; // force XMM file
            let r = dec.packed(PackedOp::UnpackLo, Lane::S, Lane::S);
            dec.sse_prefix = save;
            r.map(|()| None)
        }
        0x15 => {
            let save = dec.sse_prefix;
            dec.sse_prefix = SsePrefix::Op66;
            let r = dec.packed(PackedOp::UnpackHi, Lane::S, Lane::S);
            dec.sse_prefix = save;
            r.map(|()| None)
        }

        // CVTSI2SS.
        0x2a if dec.sse_prefix == SsePrefix::F3 => {
            let (reg, rm) = dec.modrm(DataType::I32)?;
            let src = dec.rm_load(rm, Width::W32);
            let dst = dec.b.vreg(DataType::F32);
            dec.b.push(Inst::CvtIntToF32 { dst, src });
            dec.scalar_writeback(reg, dst);
            Ok(None)
        }
        // CVTTSS2SI / CVTSS2SI.
        0x2c | 0x2d if dec.sse_prefix == SsePrefix::F3 => {
            let (reg, rm) = dec.modrm(DataType::F32)?;
            let src = dec.scalar_rm_load(rm);
            let dst = dec.b.vreg(DataType::I32);
            dec.b.push(Inst::CvtF32ToInt {
                dst,
                src,
                trunc: opcode == 0x2c,
            });
            dec.write_gpr(reg, Width::W32, dst);
            Ok(None)
        }

        // UCOMISS/COMISS.
        0x2e | 0x2f => {
            let (reg, rm) = dec.modrm(DataType::F32)?;
            let lhs = dec.b.vreg(DataType::F32);
            dec.b.push(Inst::XmmRead { dst: lhs, xmm: reg });
            let rhs = dec.scalar_rm_load(rm);
            dec.b.push(Inst::SseComi {
                lhs,
                rhs,
                quiet: opcode == 0x2e,
            });
            Ok(None)
        }

        // SQRTPS/SQRTSS.
        0x51 => {
            if dec.sse_prefix == SsePrefix::F3 {
                let (reg, rm) = dec.modrm(DataType::F32)?;
                let src = dec.scalar_rm_load(rm);
                let dst = dec.b.vreg(DataType::F32);
                dec.b.push(Inst::VFloatSqrt { dst, src });
                dec.scalar_writeback(reg, dst);
            } else {
                let (reg, rm) = dec.modrm(DataType::V128S4)?;
                let src = dec.vec_rm_load_x(rm, DataType::V128S4);
                let dst = dec.b.vreg(DataType::V128S4);
                dec.b.push(Inst::VFloatSqrt { dst, src });
                dec.b.push(Inst::XmmWrite { xmm: reg, src: dst });
            }
            Ok(None)
        }

        // ANDPS/ANDNPS/ORPS/XORPS: bitwise on the XMM file.
        0x54 | 0x55 | 0x56 | 0x57 => {
            let op = match opcode {
                0x54 => PackedOp::And,
                0x55 => PackedOp::AndNot,
                0x56 => PackedOp::Or,
                _ => PackedOp::Xor,
            };
            let (reg, rm) = dec.modrm(DataType::V128S4)?;
            let lhs = dec.vec_read_x(reg, DataType::V128S4);
            let rhs = dec.vec_rm_load_x(rm, DataType::V128S4);
            let dst = dec.b.vreg(DataType::V128S4);
            dec.b.push(Inst::Packed { op, dst, lhs, rhs });
            dec.b.push(Inst::XmmWrite { xmm: reg, src: dst });
            Ok(None)
        }

        0x58 => dec.sse_float(VFloatOp::Add).map(|()| None),
        0x59 => dec.sse_float(VFloatOp::Mul).map(|()| None),
        0x5c => dec.sse_float(VFloatOp::Sub).map(|()| None),
        0x5d => dec.sse_float(VFloatOp::Min).map(|()| None),
        0x5e => dec.sse_float(VFloatOp::Div).map(|()| None),
        0x5f => dec.sse_float(VFloatOp::Max).map(|()| None),

        // Unpack/pack/compare groups.
        0x60 => dec.packed(PackedOp::UnpackLo, Lane::B, Lane::B).map(|()| None),
        0x61 => dec.packed(PackedOp::UnpackLo, Lane::H, Lane::H).map(|()| None),
        0x62 => dec.packed(PackedOp::UnpackLo, Lane::S, Lane::S).map(|()| None),
        0x63 => dec.packed(PackedOp::PackSs, Lane::H, Lane::B).map(|()| None),
        0x64 => dec.packed(PackedOp::CmpGt, Lane::B, Lane::B).map(|()| None),
        0x65 => dec.packed(PackedOp::CmpGt, Lane::H, Lane::H).map(|()| None),
        0x66 => dec.packed(PackedOp::CmpGt, Lane::S, Lane::S).map(|()| None),
        0x67 => dec.packed(PackedOp::PackUs, Lane::H, Lane::B).map(|()| None),
        0x68 => dec.packed(PackedOp::UnpackHi, Lane::B, Lane::B).map(|()| None),
        0x69 => dec.packed(PackedOp::UnpackHi, Lane::H, Lane::H).map(|()| None),
        0x6a => dec.packed(PackedOp::UnpackHi, Lane::S, Lane::S).map(|()| None),
        0x6b => dec.packed(PackedOp::PackSs, Lane::S, Lane::H).map(|()| None),

        // MOVD to vector.
        0x6e => {
            let (reg, rm) = dec.modrm(DataType::I32)?;
            let v = dec.rm_load(rm, Width::W32);
            dec.vec_write_from_int(reg, v);
            Ok(None)
        }
        // MOVQ/MOVDQA/MOVDQU load.
        0x6f => {
            let ty = if dec.is_xmm() || dec.sse_prefix == SsePrefix::F3 {
                DataType::V128S4
            } else {
                DataType::V64S2
            };
            let (reg, rm) = dec.modrm(ty)?;
            let v = if ty.size_bytes() == 16 {
                dec.vec_rm_load_x(rm, ty)
            } else {
                dec.vec_rm_load(rm, ty)
            };
            if ty.size_bytes() == 16 {
                dec.b.push(Inst::XmmWrite { xmm: reg, src: v });
            } else {
                dec.b.push(Inst::MmxWrite { mm: reg, src: v });
            }
            Ok(None)
        }

        // Shift-immediate groups.
        0x71 => {
            let (op, lane) = shift_group_op(dec, Lane::H)?;
            dec.packed_shift_imm(op, lane).map(|()| None)
        }
        0x72 => {
            let (op, lane) = shift_group_op(dec, Lane::S)?;
            dec.packed_shift_imm(op, lane).map(|()| None)
        }
        0x73 => {
            let (op, lane) = shift_group_op(dec, Lane::D)?;
            dec.packed_shift_imm(op, lane).map(|()| None)
        }

        0x74 => dec.packed(PackedOp::CmpEq, Lane::B, Lane::B).map(|()| None),
        0x75 => dec.packed(PackedOp::CmpEq, Lane::H, Lane::H).map(|()| None),
        0x76 => dec.packed(PackedOp::CmpEq, Lane::S, Lane::S).map(|()| None),

        0x77 => {
            dec.b.push(Inst::Emms);
            Ok(None)
        }

        // MOVD from vector.
        0x7e => {
            let (reg, rm) = dec.modrm(DataType::I32)?;
            let v = dec.vec_read_low32(reg);
            dec.rm_store(rm, Width::W32, v);
            Ok(None)
        }
        // MOVQ/MOVDQA store.
        0x7f => {
            let ty = if dec.is_xmm() || dec.sse_prefix == SsePrefix::F3 {
                DataType::V128S4
            } else {
                DataType::V64S2
            };
            let (reg, rm) = dec.modrm(ty)?;
            let v = if ty.size_bytes() == 16 {
                dec.vec_read_x(reg, ty)
            } else {
                dec.vec_read(reg, ty)
            };
            dec.vec_rm_store(rm, v);
            Ok(None)
        }

        // Group 15: LDMXCSR/STMXCSR and fences.
        0xae => {
            let m = *dec.bytes_peek().ok_or(DecodeError::UnexpectedEof {
                addr: dec.cur_addr(),
            })?;
            if m >= 0xc0 {
                let m = dec.u8()?;
                let kind = match (m >> 3) & 7 {
                    5 => BarrierKind::DataMemory, // LFENCE
                    6 => BarrierKind::DataSync,   // MFENCE
                    7 => BarrierKind::DataMemory, // SFENCE
                    _ => return Err(unsupported(dec)),
                };
                dec.b.push(Inst::Barrier { kind });
            } else {
                let (reg, mem) = dec.modrm_mem(DataType::I32)?;
                match reg {
                    2 => {
                        let dst = dec.b.vreg(DataType::I32);
                        dec.b.push(Inst::Load { dst, mem });
                        dec.b.push(Inst::SetMxcsr { src: dst });
                    }
                    3 => {
                        let v = dec.b.vreg(DataType::I32);
                        dec.b.push(Inst::GetMxcsr { dst: v });
                        dec.b.push(Inst::Store { mem, src: v });
                    }
                    _ => return Err(unsupported(dec)),
                }
            }
            Ok(None)
        }

        // CMPPS/CMPSS.
        0xc2 => {
            if dec.sse_prefix == SsePrefix::F3 {
                let (reg, rm) = dec.modrm(DataType::F32)?;
                let lhs = dec.b.vreg(DataType::F32);
                dec.b.push(Inst::XmmRead { dst: lhs, xmm: reg });
                let rhs = dec.scalar_rm_load(rm);
                let pred = dec.u8()?;
                if pred > 7 {
                    return Err(DecodeError::Invalid {
                        addr: dec.cur_addr(),
                    });
                }
                let dst = dec.b.vreg(DataType::F32);
                dec.b.push(Inst::VFloatCmp {
                    dst,
                    lhs,
                    rhs,
                    pred,
                });
                dec.scalar_writeback(reg, dst);
            } else {
                let (reg, rm) = dec.modrm(DataType::V128S4)?;
                let lhs = dec.vec_read_x(reg, DataType::V128S4);
                let rhs = dec.vec_rm_load_x(rm, DataType::V128S4);
                let pred = dec.u8()?;
                if pred > 7 {
                    return Err(DecodeError::Invalid {
                        addr: dec.cur_addr(),
                    });
                }
                let dst = dec.b.vreg(DataType::V128S4);
                dec.b.push(Inst::VFloatCmp {
                    dst,
                    lhs,
                    rhs,
                    pred,
                });
                dec.b.push(Inst::XmmWrite { xmm: reg, src: dst });
            }
            Ok(None)
        }

        // SHUFPS.
        0xc6 => {
            let (reg, rm) = dec.modrm(DataType::V128S4)?;
            let lhs = dec.vec_read_x(reg, DataType::V128S4);
            let rhs = dec.vec_rm_load_x(rm, DataType::V128S4);
            let imm = dec.u8()?;
            let dst = dec.b.vreg(DataType::V128S4);
            dec.b.push(Inst::Shuffle { dst, lhs, rhs, imm });
            dec.b.push(Inst::XmmWrite { xmm: reg, src: dst });
            Ok(None)
        }

        // Shifts by register/memory count.
        0xd1 => dec.packed_shift_rm(PackedOp::Srl, Lane::H).map(|()| None),
        0xd2 => dec.packed_shift_rm(PackedOp::Srl, Lane::S).map(|()| None),
        0xd3 => dec.packed_shift_rm(PackedOp::Srl, Lane::D).map(|()| None),
        0xd5 => dec.packed(PackedOp::MulLo, Lane::H, Lane::H).map(|()| None),
        0xd8 => dec.packed(PackedOp::SubSatU, Lane::B, Lane::B).map(|()| None),
        0xd9 => dec.packed(PackedOp::SubSatU, Lane::H, Lane::H).map(|()| None),
        0xdb => dec.packed(PackedOp::And, Lane::S, Lane::S).map(|()| None),
        0xdc => dec.packed(PackedOp::AddSatU, Lane::B, Lane::B).map(|()| None),
        0xdd => dec.packed(PackedOp::AddSatU, Lane::H, Lane::H).map(|()| None),
        0xdf => dec.packed(PackedOp::AndNot, Lane::S, Lane::S).map(|()| None),
        0xe1 => dec.packed_shift_rm(PackedOp::Sra, Lane::H).map(|()| None),
        0xe2 => dec.packed_shift_rm(PackedOp::Sra, Lane::S).map(|()| None),
        0xe5 => dec.packed(PackedOp::MulHi, Lane::H, Lane::H).map(|()| None),
        0xe8 => dec.packed(PackedOp::SubSat, Lane::B, Lane::B).map(|()| None),
        0xe9 => dec.packed(PackedOp::SubSat, Lane::H, Lane::H).map(|()| None),
        0xeb => dec.packed(PackedOp::Or, Lane::S, Lane::S).map(|()| None),
        0xec => dec.packed(PackedOp::AddSat, Lane::B, Lane::B).map(|()| None),
        0xed => dec.packed(PackedOp::AddSat, Lane::H, Lane::H).map(|()| None),
        0xef => dec.packed(PackedOp::Xor, Lane::S, Lane::S).map(|()| None),
        0xf1 => dec.packed_shift_rm(PackedOp::Sll, Lane::H).map(|()| None),
        0xf2 => dec.packed_shift_rm(PackedOp::Sll, Lane::S).map(|()| None),
        0xf3 => dec.packed_shift_rm(PackedOp::Sll, Lane::D).map(|()| None),
        0xf8 => dec.packed(PackedOp::Sub, Lane::B, Lane::B).map(|()| None),
        0xf9 => dec.packed(PackedOp::Sub, Lane::H, Lane::H).map(|()| None),
        0xfa => dec.packed(PackedOp::Sub, Lane::S, Lane::S).map(|()| None),
        0xfc => dec.packed(PackedOp::Add, Lane::B, Lane::B).map(|()| None),
        0xfd => dec.packed(PackedOp::Add, Lane::H, Lane::H).map(|()| None),
        0xfe => dec.packed(PackedOp::Add, Lane::S, Lane::S).map(|()| None),

        _ => Err(unsupported(dec)),
    }
}

/// Shift-immediate group dispatch: /2 = SRL, /4 = SRA, /6 = SLL.
fn shift_group_op(dec: &Dec, lane: Lane) -> Result<(PackedOp, Lane), DecodeError> {
    let m = dec.bytes_peek().copied().ok_or(DecodeError::UnexpectedEof {
        addr: dec.cur_addr(),
    })?;
    let op = match (m >> 3) & 7 {
        2 => PackedOp::Srl,
        4 if lane != Lane::D => PackedOp::Sra,
        6 => PackedOp::Sll,
        _ => {
            return Err(DecodeError::Unsupported {
                opcode: u32::from(m),
                addr: dec.cur_addr(),
            })
        }
    };
    Ok((op, lane))
}

impl<'a> Dec<'a> {
    /// MOVD-to-vector write: zero-extends a 32-bit value into mm/xmm.
    fn vec_write_from_int(&mut self, idx: u8, src: Vreg) {
        if self.is_xmm() {
            self.b.push(Inst::XmmWrite { xmm: idx, src });
        } else {
            self.b.push(Inst::MmxWrite { mm: idx, src });
        }
    }

    /// MOVD-from-vector read: the low 32 bits of mm/xmm.
    fn vec_read_low32(&mut self, idx: u8) -> Vreg {
        let dst = self.b.vreg(DataType::I32);
        if self.is_xmm() {
            self.b.push(Inst::XmmRead { dst, xmm: idx });
        } else {
            self.b.push(Inst::MmxRead { dst, mm: idx });
        }
        dst
    }
}
