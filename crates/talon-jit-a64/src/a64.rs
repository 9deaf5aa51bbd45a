//! AArch64 instruction encoding.
//!
//! Emits 32-bit little-endian words into a growing buffer. Only the subset
//! the code generator lowers to is covered; every method encodes exactly one
//! instruction. Branch targets inside a block go through [`Asm::label`] /
//! [`Asm::bind`]; cross-block branches are left as patchable sites for the
//! translation cache's chaining pass.

/// Condition codes (AArch64 encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    Eq = 0x0,
    Ne = 0x1,
    Hs = 0x2,
    Lo = 0x3,
    Mi = 0x4,
    Pl = 0x5,
    Vs = 0x6,
    Vc = 0x7,
    Hi = 0x8,
    Ls = 0x9,
    Ge = 0xa,
    Lt = 0xb,
    Gt = 0xc,
    Le = 0xd,
    Al = 0xe,
}

/// Vector arrangement for NEON three-same operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arr {
    /// size field: 0 = byte, 1 = half, 2 = word, 3 = double.
    pub size: u32,
    /// Q bit: 0 = 64-bit vector, 1 = 128-bit vector.
    pub q: u32,
}

impl Arr {
    pub const B8: Arr = Arr { size: 0, q: 0 };
    pub const B16: Arr = Arr { size: 0, q: 1 };
    pub const H4: Arr = Arr { size: 1, q: 0 };
    pub const H8: Arr = Arr { size: 1, q: 1 };
    pub const S2: Arr = Arr { size: 2, q: 0 };
    pub const S4: Arr = Arr { size: 2, q: 1 };
    pub const D1: Arr = Arr { size: 3, q: 0 };
    pub const D2: Arr = Arr { size: 3, q: 1 };
}

/// An unresolved forward-branch site.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

/// Maximum forward/backward reach of a `B` (±128 MiB).
pub const B_RANGE: i64 = 1 << 27;
/// Maximum reach of `B.cond`/`CBZ`/`CBNZ` (±1 MiB).
pub const BCOND_RANGE: i64 = 1 << 20;

#[derive(Debug, Default)]
pub struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    #[must_use]
    pub fn new() -> Asm {
        Asm::default()
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn word(&mut self, w: u32) {
        self.buf.extend_from_slice(&w.to_le_bytes());
    }

    /// Rewrites an already-emitted word (label fixups, fault legs).
    pub fn patch_word(&mut self, site: usize, w: u32) {
        self.buf[site..site + 4].copy_from_slice(&w.to_le_bytes());
    }

    // ---- moves and immediates ----

    /// MOVZ (16-bit immediate, shifted).
    pub fn movz(&mut self, x: bool, rd: u8, imm16: u16, hw: u8) {
        self.word(
            (u32::from(x) << 31)
                | 0x5280_0000
                | (u32::from(hw) << 21)
                | (u32::from(imm16) << 5)
                | u32::from(rd),
        );
    }

    /// MOVK.
    pub fn movk(&mut self, x: bool, rd: u8, imm16: u16, hw: u8) {
        self.word(
            (u32::from(x) << 31)
                | 0x7280_0000
                | (u32::from(hw) << 21)
                | (u32::from(imm16) << 5)
                | u32::from(rd),
        );
    }

    /// Materializes a 32-bit constant.
    pub fn mov_imm32(&mut self, rd: u8, value: u32) {
        self.movz(false, rd, value as u16, 0);
        if value >> 16 != 0 {
            self.movk(false, rd, (value >> 16) as u16, 1);
        }
    }

    /// Materializes a 64-bit constant.
    pub fn mov_imm64(&mut self, rd: u8, value: u64) {
        self.movz(true, rd, value as u16, 0);
        for hw in 1..4u8 {
            let chunk = (value >> (16 * hw)) as u16;
            if chunk != 0 {
                self.movk(true, rd, chunk, hw);
            }
        }
    }

    /// MOV register (ORR with the zero register).
    pub fn mov_reg(&mut self, x: bool, rd: u8, rm: u8) {
        self.word(
            (u32::from(x) << 31) | 0x2A00_03E0 | (u32::from(rm) << 16) | u32::from(rd),
        );
    }

    // ---- integer ALU ----

    fn rrr(&mut self, base: u32, x: bool, rd: u8, rn: u8, rm: u8) {
        self.word(
            (u32::from(x) << 31)
                | base
                | (u32::from(rm) << 16)
                | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }

    pub fn add_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x0B00_0000, x, rd, rn, rm);
    }
    pub fn adds_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x2B00_0000, x, rd, rn, rm);
    }
    pub fn sub_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x4B00_0000, x, rd, rn, rm);
    }
    pub fn subs_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x6B00_0000, x, rd, rn, rm);
    }
    pub fn adc(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x1A00_0000, x, rd, rn, rm);
    }
    pub fn sbc(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x5A00_0000, x, rd, rn, rm);
    }
    pub fn and_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x0A00_0000, x, rd, rn, rm);
    }
    pub fn orr_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x2A00_0000, x, rd, rn, rm);
    }
    pub fn eor_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x4A00_0000, x, rd, rn, rm);
    }
    /// ORN: rd = rn | !rm (MVN when rn = zr).
    pub fn orn_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x2A20_0000, x, rd, rn, rm);
    }
    /// BIC: rd = rn & !rm.
    pub fn bic_reg(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x0A20_0000, x, rd, rn, rm);
    }

    pub fn add_imm(&mut self, x: bool, rd: u8, rn: u8, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.word(
            (u32::from(x) << 31)
                | 0x1100_0000
                | (imm12 << 10)
                | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }
    pub fn sub_imm(&mut self, x: bool, rd: u8, rn: u8, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.word(
            (u32::from(x) << 31)
                | 0x5100_0000
                | (imm12 << 10)
                | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }
    /// CMP immediate (SUBS zr).
    pub fn cmp_imm(&mut self, x: bool, rn: u8, imm12: u32) {
        self.word(
            (u32::from(x) << 31)
                | 0x7100_0000
                | (imm12 << 10)
                | (u32::from(rn) << 5)
                | 31,
        );
    }

    /// ADD with a left-shifted second operand (address arithmetic).
    pub fn add_reg_lsl(&mut self, x: bool, rd: u8, rn: u8, rm: u8, shift: u8) {
        self.word(
            (u32::from(x) << 31)
                | 0x0B00_0000
                | (u32::from(rm) << 16)
                | (u32::from(shift) << 10)
                | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }

    /// UBFX rd, rn, #lsb, #width (32-bit).
    pub fn ubfx(&mut self, rd: u8, rn: u8, lsb: u8, width: u8) {
        let immr = u32::from(lsb);
        let imms = u32::from(lsb + width - 1);
        self.word(0x5300_0000 | (immr << 16) | (imms << 10) | (u32::from(rn) << 5) | u32::from(rd));
    }

    /// LSR immediate.
    pub fn lsr_imm(&mut self, x: bool, rd: u8, rn: u8, shift: u8) {
        if x {
            self.word(
                0xD340_0000
                    | (u32::from(shift) << 16)
                    | (63 << 10)
                    | (u32::from(rn) << 5)
                    | u32::from(rd),
            );
        } else {
            self.word(
                0x5300_0000
                    | (u32::from(shift) << 16)
                    | (31 << 10)
                    | (u32::from(rn) << 5)
                    | u32::from(rd),
            );
        }
    }

    /// ASR immediate (32-bit).
    pub fn asr_imm(&mut self, rd: u8, rn: u8, shift: u8) {
        self.word(
            0x1300_0000 | (u32::from(shift) << 16) | (31 << 10) | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }

    /// SXTW xd, wn.
    pub fn sxtw(&mut self, rd: u8, rn: u8) {
        self.word(0x9340_7C00 | (u32::from(rn) << 5) | u32::from(rd));
    }

    /// STP/LDP of d registers, signed offset.
    pub fn stp_d(&mut self, vt: u8, vt2: u8, rn: u8, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) & 0x7f) as u32;
        self.word(
            0x6D00_0000
                | (imm7 << 15)
                | (u32::from(vt2) << 10)
                | (u32::from(rn) << 5)
                | u32::from(vt),
        );
    }
    pub fn ldp_d(&mut self, vt: u8, vt2: u8, rn: u8, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) & 0x7f) as u32;
        self.word(
            0x6D40_0000
                | (imm7 << 15)
                | (u32::from(vt2) << 10)
                | (u32::from(rn) << 5)
                | u32::from(vt),
        );
    }

    /// ORR vector used as a full-register move.
    pub fn v_mov(&mut self, q: bool, vd: u8, vn: u8) {
        self.vrrr(
            0x0E20_1C00,
            Arr {
                size: 2,
                q: q.into(),
            },
            vd,
            vn,
            vn,
        );
    }

    // Variable shifts.
    pub fn lslv(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x1AC0_2000, x, rd, rn, rm);
    }
    pub fn lsrv(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x1AC0_2400, x, rd, rn, rm);
    }
    pub fn asrv(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.rrr(0x1AC0_2800, x, rd, rn, rm);
    }

    pub fn mul(&mut self, x: bool, rd: u8, rn: u8, rm: u8) {
        self.word(
            (u32::from(x) << 31)
                | 0x1B00_7C00
                | (u32::from(rm) << 16)
                | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }
    pub fn smulh(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0x9B40_7C00 | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rd));
    }
    pub fn umulh(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0x9BC0_7C00 | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rd));
    }
    pub fn smull(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0x9B20_7C00 | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rd));
    }
    pub fn umull(&mut self, rd: u8, rn: u8, rm: u8) {
        self.word(0x9BA0_7C00 | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rd));
    }

    /// SXTB/SXTH/SXTW onto a 64-bit destination is not needed; 32-bit forms.
    pub fn sxtb(&mut self, rd: u8, rn: u8) {
        self.word(0x1300_1C00 | (u32::from(rn) << 5) | u32::from(rd));
    }
    pub fn sxth(&mut self, rd: u8, rn: u8) {
        self.word(0x1300_3C00 | (u32::from(rn) << 5) | u32::from(rd));
    }
    pub fn uxtb(&mut self, rd: u8, rn: u8) {
        self.word(0x5300_1C00 | (u32::from(rn) << 5) | u32::from(rd));
    }
    pub fn uxth(&mut self, rd: u8, rn: u8) {
        self.word(0x5300_3C00 | (u32::from(rn) << 5) | u32::from(rd));
    }

    /// CSET rd, cc (CSINC from zr on the inverted condition).
    pub fn cset(&mut self, rd: u8, cc: Cc) {
        let inv = (cc as u32) ^ 1;
        self.word(0x1A9F_07E0 | (inv << 12) | u32::from(rd));
    }
    /// CSEL rd = cc ? rn : rm.
    pub fn csel(&mut self, x: bool, rd: u8, rn: u8, rm: u8, cc: Cc) {
        self.word(
            (u32::from(x) << 31)
                | 0x1A80_0000
                | (u32::from(rm) << 16)
                | ((cc as u32) << 12)
                | (u32::from(rn) << 5)
                | u32::from(rd),
        );
    }

    // ---- loads and stores (unsigned scaled immediate) ----

    fn ldst(&mut self, base: u32, scale: u32, rt: u8, rn: u8, offset: u32) {
        debug_assert_eq!(offset % (1 << scale), 0, "unscaled offset");
        let imm12 = offset >> scale;
        debug_assert!(imm12 < 4096);
        self.word(base | (imm12 << 10) | (u32::from(rn) << 5) | u32::from(rt));
    }

    pub fn ldrb(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0x3940_0000, 0, rt, rn, offset);
    }
    pub fn ldrh(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0x7940_0000, 1, rt, rn, offset);
    }
    pub fn ldr_w(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0xB940_0000, 2, rt, rn, offset);
    }
    pub fn ldr_x(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0xF940_0000, 3, rt, rn, offset);
    }
    pub fn strb(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0x3900_0000, 0, rt, rn, offset);
    }
    pub fn strh(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0x7900_0000, 1, rt, rn, offset);
    }
    pub fn str_w(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0xB900_0000, 2, rt, rn, offset);
    }
    pub fn str_x(&mut self, rt: u8, rn: u8, offset: u32) {
        self.ldst(0xF900_0000, 3, rt, rn, offset);
    }
    pub fn ldr_s(&mut self, vt: u8, rn: u8, offset: u32) {
        self.ldst(0xBD40_0000, 2, vt, rn, offset);
    }
    pub fn str_s(&mut self, vt: u8, rn: u8, offset: u32) {
        self.ldst(0xBD00_0000, 2, vt, rn, offset);
    }
    pub fn ldr_d(&mut self, vt: u8, rn: u8, offset: u32) {
        self.ldst(0xFD40_0000, 3, vt, rn, offset);
    }
    pub fn str_d(&mut self, vt: u8, rn: u8, offset: u32) {
        self.ldst(0xFD00_0000, 3, vt, rn, offset);
    }
    pub fn ldr_q(&mut self, vt: u8, rn: u8, offset: u32) {
        self.ldst(0x3DC0_0000, 4, vt, rn, offset);
    }
    pub fn str_q(&mut self, vt: u8, rn: u8, offset: u32) {
        self.ldst(0x3D80_0000, 4, vt, rn, offset);
    }

    /// STP x-pair, signed offset form.
    pub fn stp_x(&mut self, rt: u8, rt2: u8, rn: u8, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) & 0x7f) as u32;
        self.word(
            0xA900_0000
                | (imm7 << 15)
                | (u32::from(rt2) << 10)
                | (u32::from(rn) << 5)
                | u32::from(rt),
        );
    }
    pub fn ldp_x(&mut self, rt: u8, rt2: u8, rn: u8, offset: i32) {
        debug_assert_eq!(offset % 8, 0);
        let imm7 = ((offset / 8) & 0x7f) as u32;
        self.word(
            0xA940_0000
                | (imm7 << 15)
                | (u32::from(rt2) << 10)
                | (u32::from(rn) << 5)
                | u32::from(rt),
        );
    }
    pub fn stp_q(&mut self, vt: u8, vt2: u8, rn: u8, offset: i32) {
        debug_assert_eq!(offset % 16, 0);
        let imm7 = ((offset / 16) & 0x7f) as u32;
        self.word(
            0xAD00_0000
                | (imm7 << 15)
                | (u32::from(vt2) << 10)
                | (u32::from(rn) << 5)
                | u32::from(vt),
        );
    }
    pub fn ldp_q(&mut self, vt: u8, vt2: u8, rn: u8, offset: i32) {
        debug_assert_eq!(offset % 16, 0);
        let imm7 = ((offset / 16) & 0x7f) as u32;
        self.word(
            0xAD40_0000
                | (imm7 << 15)
                | (u32::from(vt2) << 10)
                | (u32::from(rn) << 5)
                | u32::from(vt),
        );
    }

    // ---- branches ----

    /// Unconditional `B` with a zero offset; the site is patched later.
    pub fn b_placeholder(&mut self) -> usize {
        let site = self.offset();
        self.word(0x1400_0000); // b .
        site
    }

    /// `B` to a known in-buffer offset.
    pub fn b_to(&mut self, target: usize) {
        let rel = target as i64 - self.offset() as i64;
        self.word(encode_b(rel).expect("in-buffer branch out of range"));
    }

    /// B.cond with a label resolved later.
    pub fn bcond_fwd(&mut self, cc: Cc) -> Label {
        let site = self.offset();
        self.word(0x5400_0000 | cc as u32);
        Label(site)
    }

    pub fn cbz_fwd(&mut self, x: bool, rt: u8) -> Label {
        let site = self.offset();
        self.word((u32::from(x) << 31) | 0x3400_0000 | u32::from(rt));
        Label(site)
    }

    pub fn cbnz_fwd(&mut self, x: bool, rt: u8) -> Label {
        let site = self.offset();
        self.word((u32::from(x) << 31) | 0x3500_0000 | u32::from(rt));
        Label(site)
    }

    /// Binds a forward label to the current position.
    pub fn bind(&mut self, label: Label) {
        let rel = self.offset() as i64 - label.0 as i64;
        debug_assert_eq!(rel % 4, 0);
        let imm19 = ((rel / 4) as u32) & 0x7ffff;
        let site = label.0;
        let mut w = u32::from_le_bytes(self.buf[site..site + 4].try_into().unwrap());
        w |= imm19 << 5;
        self.buf[site..site + 4].copy_from_slice(&w.to_le_bytes());
    }

    pub fn br(&mut self, rn: u8) {
        self.word(0xD61F_0000 | (u32::from(rn) << 5));
    }
    pub fn blr(&mut self, rn: u8) {
        self.word(0xD63F_0000 | (u32::from(rn) << 5));
    }
    pub fn ret(&mut self) {
        self.word(0xD65F_03C0);
    }
    pub fn nop(&mut self) {
        self.word(0xD503_201F);
    }
    pub fn brk(&mut self, imm: u16) {
        self.word(0xD420_0000 | (u32::from(imm) << 5));
    }

    // ---- barriers ----

    pub fn dmb_ish(&mut self) {
        self.word(0xD503_3BBF);
    }
    pub fn dsb_ish(&mut self) {
        self.word(0xD503_3B9F);
    }
    pub fn isb(&mut self) {
        self.word(0xD503_3FDF);
    }

    // ---- NEON ----

    fn vrrr(&mut self, base: u32, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.word(
            base | (arr.q << 30)
                | (arr.size << 22)
                | (u32::from(vm) << 16)
                | (u32::from(vn) << 5)
                | u32::from(vd),
        );
    }

    pub fn v_add(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_8400, arr, vd, vn, vm);
    }
    pub fn v_sub(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x2E20_8400, arr, vd, vn, vm);
    }
    pub fn v_sqadd(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_0C00, arr, vd, vn, vm);
    }
    pub fn v_uqadd(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x2E20_0C00, arr, vd, vn, vm);
    }
    pub fn v_sqsub(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_2C00, arr, vd, vn, vm);
    }
    pub fn v_uqsub(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x2E20_2C00, arr, vd, vn, vm);
    }
    pub fn v_mul(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_9C00, arr, vd, vn, vm);
    }
    pub fn v_cmeq(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x2E20_8C00, arr, vd, vn, vm);
    }
    pub fn v_cmgt(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_3400, arr, vd, vn, vm);
    }
    pub fn v_zip1(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E00_3800, arr, vd, vn, vm);
    }
    pub fn v_zip2(&mut self, arr: Arr, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E00_7800, arr, vd, vn, vm);
    }

    /// Bitwise ops encode the operation in the size field.
    pub fn v_and(&mut self, q: bool, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_1C00, Arr { size: 0, q: q.into() }, vd, vn, vm);
    }
    pub fn v_orr(&mut self, q: bool, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_1C00, Arr { size: 2, q: q.into() }, vd, vn, vm);
    }
    pub fn v_eor(&mut self, q: bool, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x2E20_1C00, Arr { size: 0, q: q.into() }, vd, vn, vm);
    }
    /// BIC: vd = vn & !vm.
    pub fn v_bic(&mut self, q: bool, vd: u8, vn: u8, vm: u8) {
        self.vrrr(0x0E20_1C00, Arr { size: 1, q: q.into() }, vd, vn, vm);
    }

    pub fn v_fadd4s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4E20_D400 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn v_fsub4s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4EA0_D400 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn v_fmul4s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x6E20_DC00 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn v_fdiv4s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x6E20_FC00 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn v_fmin4s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4EA0_F400 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn v_fmax4s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x4E20_F400 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn v_fsqrt4s(&mut self, vd: u8, vn: u8) {
        self.word(0x6EA1_F800 | (u32::from(vn) << 5) | u32::from(vd));
    }

    // Scalar single-precision.
    pub fn fadd_s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x1E20_2800 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn fsub_s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x1E20_3800 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn fmul_s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x1E20_0800 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn fdiv_s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x1E20_1800 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn fmin_s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x1E20_5800 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn fmax_s(&mut self, vd: u8, vn: u8, vm: u8) {
        self.word(0x1E20_4800 | (u32::from(vm) << 16) | (u32::from(vn) << 5) | u32::from(vd));
    }
    pub fn fsqrt_s(&mut self, vd: u8, vn: u8) {
        self.word(0x1E21_C000 | (u32::from(vn) << 5) | u32::from(vd));
    }
    /// SCVTF s-from-w.
    pub fn scvtf_s_w(&mut self, vd: u8, rn: u8) {
        self.word(0x1E22_0000 | (u32::from(rn) << 5) | u32::from(vd));
    }

    /// INS vd.s[0], vn.s[0].
    pub fn ins_s0(&mut self, vd: u8, vn: u8) {
        self.word(0x6E04_0400 | (u32::from(vn) << 5) | u32::from(vd));
    }
    /// FMOV general ↔ vector transfers.
    pub fn fmov_w_s(&mut self, rd: u8, vn: u8) {
        self.word(0x1E26_0000 | (u32::from(vn) << 5) | u32::from(rd));
    }
    pub fn fmov_s_w(&mut self, vd: u8, rn: u8) {
        self.word(0x1E27_0000 | (u32::from(rn) << 5) | u32::from(vd));
    }
    pub fn fmov_x_d(&mut self, rd: u8, vn: u8) {
        self.word(0x9E66_0000 | (u32::from(vn) << 5) | u32::from(rd));
    }
    pub fn fmov_d_x(&mut self, vd: u8, rn: u8) {
        self.word(0x9E67_0000 | (u32::from(rn) << 5) | u32::from(vd));
    }
}

/// Encodes `B` with a byte displacement; `None` when out of the 26-bit
/// range.
#[must_use]
pub fn encode_b(rel_bytes: i64) -> Option<u32> {
    if rel_bytes % 4 != 0 {
        return None;
    }
    let words = rel_bytes / 4;
    if !(-(1 << 25)..(1 << 25)).contains(&words) {
        return None;
    }
    Some(0x1400_0000 | ((words as u32) & 0x03ff_ffff))
}

/// Encodes `B.cond` with a byte displacement; `None` outside the 19-bit
/// range.
#[must_use]
pub fn encode_bcond(cc: Cc, rel_bytes: i64) -> Option<u32> {
    if rel_bytes % 4 != 0 {
        return None;
    }
    let words = rel_bytes / 4;
    if !(-(1 << 18)..(1 << 18)).contains(&words) {
        return None;
    }
    Some(0x5400_0000 | (((words as u32) & 0x7ffff) << 5) | cc as u32)
}

/// Patches a direct-branch site in place. Within `B` range the site becomes
/// a direct branch; outside it, the long-form veneer reserved after the
/// site (LDR literal + BR + 8-byte target) is filled in and the site
/// branches to it. Returns whether the long form was used.
pub fn patch_branch_site(code: &mut [u8], site: usize, rel_bytes: i64, target_abs: u64) -> bool {
    if let Some(b) = encode_b(rel_bytes) {
        code[site..site + 4].copy_from_slice(&b.to_le_bytes());
        false
    } else {
        // Veneer layout starting at site+4: LDR x17, #8 ; BR x17 ; .quad.
        let ldr = 0x5800_0000u32 | ((8 / 4) << 5) | 17;
        code[site + 4..site + 8].copy_from_slice(&ldr.to_le_bytes());
        let br = 0xD61F_0000u32 | (17 << 5);
        code[site + 8..site + 12].copy_from_slice(&br.to_le_bytes());
        code[site + 12..site + 20].copy_from_slice(&target_abs.to_le_bytes());
        // Site branches into the veneer (always in range: +4).
        let b = encode_b(4).unwrap();
        code[site..site + 4].copy_from_slice(&b.to_le_bytes());
        true
    }
}

/// Words reserved after a patchable exit site for the long-form veneer
/// (LDR literal, BR, and the 8-byte literal).
pub const VENEER_WORDS: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    fn words(asm: &Asm) -> Vec<u32> {
        asm.bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn basic_encodings_match_reference_words() {
        let mut a = Asm::new();
        a.movz(false, 0, 5, 0); // movz w0, #5
        a.ret();
        a.nop();
        a.dmb_ish();
        a.dsb_ish();
        a.isb();
        assert_eq!(
            words(&a),
            vec![0x528000A0, 0xD65F03C0, 0xD503201F, 0xD5033BBF, 0xD5033B9F, 0xD5033FDF]
        );
    }

    #[test]
    fn alu_and_memory_encodings() {
        let mut a = Asm::new();
        a.add_reg(false, 0, 1, 2); // add w0, w1, w2
        a.subs_reg(true, 3, 4, 5); // subs x3, x4, x5
        a.ldr_w(7, 28, 16); // ldr w7, [x28, #16]
        a.str_x(2, 31, 8); // str x2, [sp, #8]
        assert_eq!(
            words(&a),
            vec![0x0B020020, 0xEB050083, 0xB9401387, 0xF90007E2]
        );
    }

    #[test]
    fn branch_encoding_ranges() {
        // Exactly at the +26-bit limit (last representable word delta).
        assert!(encode_b(((1i64 << 25) - 1) * 4).is_some());
        assert!(encode_b((1i64 << 25) * 4).is_none());
        assert!(encode_b(-(1i64 << 25) * 4).is_some());
        assert!(encode_b((-(1i64 << 25) - 1) * 4).is_none());

        assert!(encode_bcond(Cc::Eq, ((1i64 << 18) - 1) * 4).is_some());
        assert!(encode_bcond(Cc::Eq, (1i64 << 18) * 4).is_none());

        assert_eq!(encode_b(0), Some(0x14000000));
        assert_eq!(encode_b(4), Some(0x14000001));
        assert_eq!(encode_b(-4), Some(0x17FFFFFF));
    }

    #[test]
    fn forward_label_binding() {
        let mut a = Asm::new();
        let l = a.cbz_fwd(false, 0);
        a.nop();
        a.nop();
        a.bind(l);
        a.ret();
        let w = words(&a);
        // cbz w0, +12 bytes = 3 words.
        assert_eq!(w[0], 0x34000000 | (3 << 5));
    }

    #[test]
    fn short_patch_writes_direct_branch() {
        let mut code = vec![0u8; 64];
        let long = patch_branch_site(&mut code, 0, 64, 0);
        assert!(!long);
        let w = u32::from_le_bytes(code[0..4].try_into().unwrap());
        assert_eq!(w, 0x14000010);
    }

    #[test]
    fn out_of_range_patch_uses_veneer() {
        let mut code = vec![0u8; 64];
        let far = (1i64 << 27) + 16; // beyond ±128MiB
        let long = patch_branch_site(&mut code, 0, far, 0x1234_5678_9abc);
        assert!(long);
        // Site branches to the veneer...
        let site = u32::from_le_bytes(code[0..4].try_into().unwrap());
        assert_eq!(site, 0x14000001);
        // ...which loads the literal and branches through x17.
        let ldr = u32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!(ldr, 0x58000000 | (2 << 5) | 17);
        let br = u32::from_le_bytes(code[8..12].try_into().unwrap());
        assert_eq!(br, 0xD61F0000 | (17 << 5));
        let lit = u64::from_le_bytes(code[12..20].try_into().unwrap());
        assert_eq!(lit, 0x1234_5678_9abc);
    }

    #[test]
    fn mov_imm_materializes_wide_constants() {
        let mut a = Asm::new();
        a.mov_imm32(0, 0x12345678);
        let w = words(&a);
        assert_eq!(w.len(), 2);
        assert_eq!(w[0], 0x52800000 | (0x5678 << 5));
        assert_eq!(w[1], 0x72A00000 | (0x1234 << 5));
    }
}
