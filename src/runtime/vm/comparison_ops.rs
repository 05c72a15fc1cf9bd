//! Comparison opcodes (§4.6 "Comparisons"): `eq`/`neq` use structural
//! equality (`Value::structural_eq`), the ordering comparisons require
//! both operands to be numbers, and `eq_many` is the k-ary "all equal to
//! the first" check pattern matching's repeated-variable chains and
//! `match`'s subject comparisons both reduce to.

use super::{read_i32, Control, Vm, VmError};
use crate::bytecode::OpCode;
use crate::runtime::value::Value;

impl Vm {
    pub(super) fn op_compare(&mut self, op: OpCode) -> Result<Control, VmError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = match op {
            OpCode::CmpEq => lhs.structural_eq(&rhs, &self.heap),
            OpCode::CmpNeq => !lhs.structural_eq(&rhs, &self.heap),
            OpCode::CmpLt | OpCode::CmpLte | OpCode::CmpGt | OpCode::CmpGte => {
                let (a, b) = (self.require_number(&lhs)?, self.require_number(&rhs)?);
                let ord = a.compare(b);
                match op {
                    OpCode::CmpLt => ord.is_lt(),
                    OpCode::CmpLte => ord.is_le(),
                    OpCode::CmpGt => ord.is_gt(),
                    OpCode::CmpGte => ord.is_ge(),
                    _ => unreachable!(),
                }
            }
            other => unreachable!("op_compare called with non-comparison opcode {other:?}"),
        };
        self.push(Value::Bool(result)).map(|_| Control::Continue)
    }

    /// `eq_many count` (0x36): pops `count` values, pushes `true` iff
    /// every one compares structurally equal to the first popped.
    pub(super) fn op_compare_eq_many(
        &mut self,
        code: &[u8],
        ptr: &mut usize,
    ) -> Result<Control, VmError> {
        let count = read_i32(code, ptr) as usize;
        if count == 0 {
            return self.push(Value::Bool(true)).map(|_| Control::Continue);
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        let first = &values[0];
        let all_eq = values
            .iter()
            .all(|v| v.structural_eq(first, &self.heap));
        self.push(Value::Bool(all_eq)).map(|_| Control::Continue)
    }

    fn require_number<'a>(&self, value: &'a Value) -> Result<&'a crate::numeric::Num, VmError> {
        value.as_number().ok_or_else(|| {
            VmError::TypeError(format!("expected a number, found {}", value.type_name()))
        })
    }
}
