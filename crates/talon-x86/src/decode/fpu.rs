//! x87 escape decoding (opcodes 0xD8..0xDF).
//!
//! mod != 3 encodes a memory operand whose type derives from the escape
//! byte and reg field; mod == 3 selects ST(i) via the low three bits, with
//! the transcendental and constant-load groups keyed by exact mod-R/M value
//! under 0xD9.

use talon_types::DataType;

use super::{Dec, DecodeError};
use crate::ir::{FpuArithOp, FpuConst, FpuTransOp, Inst};

fn arith_op(reg: u8) -> Option<FpuArithOp> {
    match reg {
        0 => Some(FpuArithOp::Add),
        1 => Some(FpuArithOp::Mul),
        4 => Some(FpuArithOp::Sub),
        5 => Some(FpuArithOp::Subr),
        6 => Some(FpuArithOp::Div),
        7 => Some(FpuArithOp::Divr),
        _ => None, // 2/3 are FCOM/FCOMP
    }
}

pub(super) fn decode(dec: &mut Dec, escape: u8) -> Result<(), DecodeError> {
    let err = |dec: &Dec<'_>, modrm: u8| DecodeError::Unsupported {
        opcode: (u32::from(escape) << 8) | u32::from(modrm),
        addr: dec.cur_addr(),
    };

    // Peek mod to know whether a memory operand follows.
    let modrm_byte = *dec
        .bytes_peek()
        .ok_or(DecodeError::UnexpectedEof {
            addr: dec.cur_addr(),
        })?;
    let is_mem = modrm_byte < 0xc0;

    match (escape, is_mem) {
        // Dyadic arithmetic and comparison against memory.
        (0xd8, true) | (0xdc, true) | (0xda, true) | (0xde, true) => {
            let ty = match escape {
                0xd8 => DataType::F32,
                0xdc => DataType::F64,
                0xda => DataType::I32,
                _ => DataType::I16,
            };
            let (reg, mem) = dec.modrm_mem(ty)?;
            match reg {
                2 | 3 => dec.b.push(Inst::FpuCom {
                    mem: Some(mem),
                    st: 0,
                    pops: if reg == 3 { 1 } else { 0 },
                }),
                _ => {
                    let op = arith_op(reg).unwrap();
                    dec.b.push(Inst::FpuArith {
                        op,
                        st: 0,
                        st0_dst: true,
                        pop: false,
                        mem: Some(mem),
                    });
                }
            }
            Ok(())
        }

        // ST(0) op ST(i) register forms.
        (0xd8, false) => {
            let m = dec.u8()?;
            let st = m & 7;
            match m & 0xf8 {
                0xc0 => push_arith(dec, FpuArithOp::Add, st, true, false),
                0xc8 => push_arith(dec, FpuArithOp::Mul, st, true, false),
                0xd0 => dec.b.push(Inst::FpuCom {
                    mem: None,
                    st,
                    pops: 0,
                }),
                0xd8 => dec.b.push(Inst::FpuCom {
                    mem: None,
                    st,
                    pops: 1,
                }),
                0xe0 => push_arith(dec, FpuArithOp::Sub, st, true, false),
                0xe8 => push_arith(dec, FpuArithOp::Subr, st, true, false),
                0xf0 => push_arith(dec, FpuArithOp::Div, st, true, false),
                _ => push_arith(dec, FpuArithOp::Divr, st, true, false),
            }
            Ok(())
        }

        (0xd9, true) => {
            let (reg, _) = peek_reg(dec);
            match reg {
                0 => {
                    let (_, mem) = dec.modrm_mem(DataType::F32)?;
                    dec.b.push(Inst::FpuLoadMem { mem });
                }
                2 | 3 => {
                    let (r, mem) = dec.modrm_mem(DataType::F32)?;
                    dec.b.push(Inst::FpuStoreMem { mem, pop: r == 3 });
                }
                5 => {
                    let (_, mem) = dec.modrm_mem(DataType::I16)?;
                    dec.b.push(Inst::FpuSetCw { mem });
                }
                7 => {
                    let (_, mem) = dec.modrm_mem(DataType::I16)?;
                    dec.b.push(Inst::FpuGetCw { mem });
                }
                other => return Err(err(dec, other << 3)),
            }
            Ok(())
        }

        (0xd9, false) => {
            let m = dec.u8()?;
            match m {
                0xc0..=0xc7 => dec.b.push(Inst::FpuLoadSt { i: m & 7 }),
                0xc8..=0xcf => dec.b.push(Inst::FpuExchange { i: m & 7 }),
                0xd0 => {} // FNOP
                0xe0 => dec.b.push(Inst::FpuChs),
                0xe1 => dec.b.push(Inst::FpuAbs),
                0xe4 => dec.b.push(Inst::FpuTst),
                0xe5 => dec.b.push(Inst::FpuXam),
                0xe8 => dec.b.push(Inst::FpuConstLoad { k: FpuConst::One }),
                0xe9 => dec.b.push(Inst::FpuConstLoad { k: FpuConst::L2t }),
                0xea => dec.b.push(Inst::FpuConstLoad { k: FpuConst::L2e }),
                0xeb => dec.b.push(Inst::FpuConstLoad { k: FpuConst::Pi }),
                0xec => dec.b.push(Inst::FpuConstLoad { k: FpuConst::Lg2 }),
                0xed => dec.b.push(Inst::FpuConstLoad { k: FpuConst::Ln2 }),
                0xee => dec.b.push(Inst::FpuConstLoad { k: FpuConst::Zero }),
                0xf0 => dec.b.push(Inst::FpuTrans { op: FpuTransOp::F2xm1 }),
                0xf1 => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Yl2x }),
                0xf2 => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Ptan }),
                0xf3 => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Patan }),
                0xf4 => dec.b.push(Inst::FpuTrans {
                    op: FpuTransOp::Xtract,
                }),
                0xf5 => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Prem1 }),
                0xf6 => dec.b.push(Inst::FpuDecStp),
                0xf7 => dec.b.push(Inst::FpuIncStp),
                0xf8 => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Prem }),
                0xf9 => dec.b.push(Inst::FpuTrans {
                    op: FpuTransOp::Yl2xp1,
                }),
                0xfa => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Sqrt }),
                0xfb => dec.b.push(Inst::FpuTrans {
                    op: FpuTransOp::Sincos,
                }),
                0xfc => dec.b.push(Inst::FpuTrans {
                    op: FpuTransOp::Rndint,
                }),
                0xfd => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Scale }),
                0xfe => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Sin }),
                0xff => dec.b.push(Inst::FpuTrans { op: FpuTransOp::Cos }),
                other => return Err(err(dec, other)),
            }
            Ok(())
        }

        (0xda, false) => {
            let m = dec.u8()?;
            if m == 0xe9 {
                // FUCOMPP
                dec.b.push(Inst::FpuCom {
                    mem: None,
                    st: 1,
                    pops: 2,
                });
                Ok(())
            } else {
                Err(err(dec, m))
            }
        }

        (0xdb, true) => {
            let (reg, _) = peek_reg(dec);
            match reg {
                0 => {
                    let (_, mem) = dec.modrm_mem(DataType::I32)?;
                    dec.b.push(Inst::FpuIntLoad { mem });
                }
                2 | 3 => {
                    let (r, mem) = dec.modrm_mem(DataType::I32)?;
                    dec.b.push(Inst::FpuIntStore { mem, pop: r == 3 });
                }
                5 => {
                    let (_, mem) = dec.modrm_mem(DataType::F80)?;
                    dec.b.push(Inst::FpuLoadMem { mem });
                }
                7 => {
                    let (_, mem) = dec.modrm_mem(DataType::F80)?;
                    dec.b.push(Inst::FpuStoreMem { mem, pop: true });
                }
                other => return Err(err(dec, other << 3)),
            }
            Ok(())
        }

        (0xdb, false) => {
            let m = dec.u8()?;
            match m {
                0xe2 => dec.b.push(Inst::FpuClearEx),
                0xe3 => dec.b.push(Inst::FpuInit),
                other => return Err(err(dec, other)),
            }
            Ok(())
        }

        (0xdc, false) => {
            let m = dec.u8()?;
            let st = m & 7;
            // Destination is ST(i); sub/div senses are reversed vs 0xD8.
            match m & 0xf8 {
                0xc0 => push_arith(dec, FpuArithOp::Add, st, false, false),
                0xc8 => push_arith(dec, FpuArithOp::Mul, st, false, false),
                0xe0 => push_arith(dec, FpuArithOp::Subr, st, false, false),
                0xe8 => push_arith(dec, FpuArithOp::Sub, st, false, false),
                0xf0 => push_arith(dec, FpuArithOp::Divr, st, false, false),
                0xf8 => push_arith(dec, FpuArithOp::Div, st, false, false),
                other => return Err(err(dec, other)),
            }
            Ok(())
        }

        (0xdd, true) => {
            let (reg, _) = peek_reg(dec);
            match reg {
                0 => {
                    let (_, mem) = dec.modrm_mem(DataType::F64)?;
                    dec.b.push(Inst::FpuLoadMem { mem });
                }
                2 | 3 => {
                    let (r, mem) = dec.modrm_mem(DataType::F64)?;
                    dec.b.push(Inst::FpuStoreMem { mem, pop: r == 3 });
                }
                7 => {
                    let (_, mem) = dec.modrm_mem(DataType::I16)?;
                    dec.b.push(Inst::FpuGetSw { mem: Some(mem) });
                }
                other => return Err(err(dec, other << 3)),
            }
            Ok(())
        }

        (0xdd, false) => {
            let m = dec.u8()?;
            let st = m & 7;
            match m & 0xf8 {
                0xc0 => dec.b.push(Inst::FpuFree { i: st }),
                0xd0 => dec.b.push(Inst::FpuStoreSt { i: st, pop: false }),
                0xd8 => dec.b.push(Inst::FpuStoreSt { i: st, pop: true }),
                0xe0 => dec.b.push(Inst::FpuCom {
                    mem: None,
                    st,
                    pops: 0,
                }),
                0xe8 => dec.b.push(Inst::FpuCom {
                    mem: None,
                    st,
                    pops: 1,
                }),
                other => return Err(err(dec, other)),
            }
            Ok(())
        }

        (0xde, false) => {
            let m = dec.u8()?;
            let st = m & 7;
            match m & 0xf8 {
                0xc0 => push_arith(dec, FpuArithOp::Add, st, false, true),
                0xc8 => push_arith(dec, FpuArithOp::Mul, st, false, true),
                0xd8 if st == 1 => dec.b.push(Inst::FpuCom {
                    mem: None,
                    st: 1,
                    pops: 2,
                }),
                0xe0 => push_arith(dec, FpuArithOp::Subr, st, false, true),
                0xe8 => push_arith(dec, FpuArithOp::Sub, st, false, true),
                0xf0 => push_arith(dec, FpuArithOp::Divr, st, false, true),
                0xf8 => push_arith(dec, FpuArithOp::Div, st, false, true),
                other => return Err(err(dec, other)),
            }
            Ok(())
        }

        (0xdf, true) => {
            let (reg, _) = peek_reg(dec);
            match reg {
                0 => {
                    let (_, mem) = dec.modrm_mem(DataType::I16)?;
                    dec.b.push(Inst::FpuIntLoad { mem });
                }
                2 | 3 => {
                    let (r, mem) = dec.modrm_mem(DataType::I16)?;
                    dec.b.push(Inst::FpuIntStore { mem, pop: r == 3 });
                }
                5 => {
                    let (_, mem) = dec.modrm_mem(DataType::I64)?;
                    dec.b.push(Inst::FpuIntLoad { mem });
                }
                7 => {
                    let (_, mem) = dec.modrm_mem(DataType::I64)?;
                    dec.b.push(Inst::FpuIntStore { mem, pop: true });
                }
                other => return Err(err(dec, other << 3)),
            }
            Ok(())
        }

        (0xdf, false) => {
            let m = dec.u8()?;
            if m == 0xe0 {
                dec.b.push(Inst::FpuGetSw { mem: None });
                Ok(())
            } else {
                Err(err(dec, m))
            }
        }

        _ => Err(err(dec, modrm_byte)),
    }
}

fn push_arith(dec: &mut Dec, op: FpuArithOp, st: u8, st0_dst: bool, pop: bool) {
    dec.b.push(Inst::FpuArith {
        op,
        st,
        st0_dst,
        pop,
        mem: None,
    });
}

/// Peeks the reg field of the next mod-R/M byte without consuming it.
fn peek_reg(dec: &Dec) -> (u8, u8) {
    let m = dec.bytes_peek().copied().unwrap_or(0);
    ((m >> 3) & 7, m & 7)
}
