//! Black-box coverage of the buffer-with-cursor code generator (spec.md
//! §4.3): label resolution, relocation bookkeeping, and raw emission
//! helpers, independent of the compiler that drives them.

use rho::bytecode::codegen::{CodeGenerator, FixupWidth, RelocationKind};
use rho::bytecode::op_code::{OpCode, Operand};

#[test]
fn absolute_label_patches_the_raw_target_offset() {
    let mut cg = CodeGenerator::new();
    let target = cg.make_and_mark_label();
    cg.put_op(OpCode::Nop);
    cg.put_op(OpCode::MkFn);
    cg.put_label(target, FixupWidth::W4, true);
    cg.fix_labels();
    assert_eq!(cg.pending_fixup_count(), 0);

    let code = cg.code();
    let patched = i32::from_le_bytes(code[2..6].try_into().unwrap());
    assert_eq!(patched, 0, "absolute addressing patches the label's raw offset, unadjusted");
}

#[test]
fn relocations_are_recorded_in_emission_order() {
    let mut cg = CodeGenerator::new();
    cg.put_op(OpCode::AllocGlobals);
    cg.add_relocation(RelocationKind::Gp, 1, "");
    cg.put_short(0);
    cg.put_short(4);

    cg.put_op(OpCode::GetGlobal);
    cg.add_relocation(RelocationKind::Gv, 4, "Other");
    cg.put_short(0);
    cg.put_short(0);

    let (code, relocations) = cg.into_code();
    assert_eq!(relocations.len(), 2);
    assert_eq!(relocations[0].kind, RelocationKind::Gp);
    assert_eq!(relocations[0].offset, 1);
    assert_eq!(relocations[1].kind, RelocationKind::Gv);
    assert_eq!(relocations[1].target, "Other");
    assert_eq!(code.len(), 1 + 4 + 1 + 4);
}

#[test]
fn cstr_emission_is_nul_terminated() {
    let mut cg = CodeGenerator::new();
    cg.put_cstr("ok");
    let code = cg.code();
    assert_eq!(code, &[b'o', b'k', 0]);
}

#[test]
fn unresolved_fixup_count_drops_to_zero_once_its_label_is_marked() {
    let mut cg = CodeGenerator::new();
    cg.put_op(OpCode::Jmp);
    let end = cg.make_label();
    cg.put_label(end, FixupWidth::W4, false);
    assert_eq!(cg.pending_fixup_count(), 1);
    cg.mark_label(end);
    cg.fix_labels();
    assert_eq!(cg.pending_fixup_count(), 0);
}

#[test]
fn operand_table_matches_every_opcode_this_generator_emits_fixed_width_immediates_for() {
    assert_eq!(OpCode::PushInt32.operands(), &[Operand::I32]);
    assert_eq!(OpCode::CallBuiltin.operands(), &[Operand::U16, Operand::U8]);
    assert_eq!(OpCode::Nop.operands(), &[] as &[Operand]);
}
