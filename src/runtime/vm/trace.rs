//! `--trace`-style instruction tracing (disabled by default via
//! [`Vm::set_trace`]): prints the opcode mnemonic, its decoded immediates,
//! and the stack depth at the point of execution, one line per
//! instruction, to help a user debugging a runtime fault without
//! attaching a real debugger (§1's non-goal — this is deliberately not
//! one).

use super::{read_cstr, read_f64, read_i32, read_u16, read_u8};
use crate::bytecode::{OpCode, Operand};
use crate::runtime::vm::Vm;

impl Vm {
    pub(super) fn trace_instruction(&self, code: &[u8], op_offset: usize, op: OpCode) {
        let mut cursor = op_offset + 1;
        let mut rendered = Vec::new();
        for operand in op.operands() {
            let text = match operand {
                Operand::U8 => read_u8(code, &mut cursor).to_string(),
                Operand::U16 => read_u16(code, &mut cursor).to_string(),
                Operand::I32 => read_i32(code, &mut cursor).to_string(),
                Operand::F64 => read_f64(code, &mut cursor).to_string(),
                Operand::Str => format!("{:?}", read_cstr(code, &mut cursor)),
            };
            rendered.push(text);
        }
        eprintln!(
            "{op_offset:06} {op:<16} {:<24} sp={} bp={}",
            rendered.join(", "),
            self.stack.len(),
            self.bp,
        );
    }
}
