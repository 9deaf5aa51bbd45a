//! The emitted-code ABI leans on the state block's `repr(C)` layout; pin
//! the offsets the generated loads and stores assume.

use memoffset::offset_of;

use talon_cpu_core::state::CpuState;
use talon_jit_a64::abi;

#[test]
fn gpr_file_is_at_the_front_of_the_state_block() {
    assert_eq!(offset_of!(CpuState, gpr), abi::STATE_GPR as usize);
    assert_eq!(offset_of!(CpuState, eip), abi::STATE_EIP as usize);
}

#[test]
fn gpr_offsets_follow_x86_register_order() {
    // EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI.
    for i in 0..8 {
        assert_eq!(abi::gpr_offset(i), (i * 4) as u32);
    }
}

#[test]
fn helper_table_is_dense() {
    use talon_jit_a64::abi::helper;
    assert_eq!(helper::READ_U8, 0);
    assert_eq!(helper::PACKED_FALLBACK + 1, helper::COUNT);
}

#[test]
fn ctx_is_ffi_stable() {
    // A helper signature change that grows the table or moves the scratch
    // buffer breaks already-emitted code; the constants are the contract.
    assert_eq!(abi::CTX_STATE, 0);
    assert!(abi::CTX_HELPERS > abi::CTX_SCRATCH16);
}
