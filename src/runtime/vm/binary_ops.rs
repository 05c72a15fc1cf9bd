//! Arithmetic and logical opcodes (§4.6 "Stack/arithmetic"): dispatches on
//! operand type the way the spec requires — numeric ops go through the
//! opaque [`Num`] library, `%` on a string LHS is printf-style `{n}`
//! interpolation over a list RHS instead of numeric modulo.

use super::{Control, Vm, VmError};
use crate::bytecode::OpCode;
use crate::numeric::Num;
use crate::runtime::heap::{GcHandle, HeapObject};
use crate::runtime::value::Value;

impl Vm {
    pub(super) fn op_arith(&mut self, op: OpCode) -> Result<Control, VmError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        if op == OpCode::Mod {
            if let Value::Str(h) = &lhs {
                let formatted = self.format_template(*h, &rhs)?;
                let handle = self.heap.alloc(HeapObject::Str(formatted));
                self.push(Value::Str(handle))?;
                self.heap.unprotect(handle);
                return Ok(Control::Continue);
            }
        }

        let (a, b) = (self.require_number(&lhs)?, self.require_number(&rhs)?);
        let result = match op {
            OpCode::Add => a.add(b),
            OpCode::Sub => a.sub(b),
            OpCode::Mul => a.mul(b),
            OpCode::Div => a
                .div(b)
                .ok_or_else(|| VmError::TypeError("division by zero".into()))?,
            OpCode::Pow => a.pow(b),
            OpCode::Mod => a
                .modulo(b)
                .ok_or_else(|| VmError::TypeError("modulo by zero".into()))?,
            other => unreachable!("op_arith called with non-arithmetic opcode {other:?}"),
        };
        self.push(Value::Number(result)).map(|_| Control::Continue)
    }

    pub(super) fn op_logic(&mut self, op: OpCode) -> Result<Control, VmError> {
        match op {
            OpCode::Not => {
                let v = self.pop()?;
                let truthy = v.is_truthy(&self.heap);
                self.push(Value::Bool(!truthy)).map(|_| Control::Continue)
            }
            OpCode::And => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = if lhs.is_truthy(&self.heap) { rhs } else { lhs };
                self.push(result).map(|_| Control::Continue)
            }
            OpCode::Or => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = if lhs.is_truthy(&self.heap) { lhs } else { rhs };
                self.push(result).map(|_| Control::Continue)
            }
            other => unreachable!("op_logic called with non-logical opcode {other:?}"),
        }
    }

    fn require_number<'a>(&self, value: &'a Value) -> Result<&'a Num, VmError> {
        value.as_number().ok_or_else(|| {
            VmError::TypeError(format!("expected a number, found {}", value.type_name()))
        })
    }

    /// `"hello {0}, you have {1}" % '("world" "messages")` (§4.6): `{n}`
    /// placeholders index the RHS list positionally; the RHS may also be a
    /// single non-list value, substituted for every `{0}`.
    fn format_template(&self, template: GcHandle, arg: &Value) -> Result<String, VmError> {
        let HeapObject::Str(template) = self.heap.get(template) else {
            unreachable!("Value::Str handle must point at HeapObject::Str")
        };
        let items = self.format_args(arg)?;

        let mut out = String::with_capacity(template.len());
        let bytes = template.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'{' {
                if let Some(close) = template[i..].find('}') {
                    let digits = &template[i + 1..i + close];
                    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                        let n: usize = digits.parse().unwrap();
                        let value = items.get(n).ok_or_else(|| {
                            VmError::BadFormatString(format!(
                                "placeholder {{{n}}} has no corresponding argument"
                            ))
                        })?;
                        out.push_str(&value.display(&self.heap));
                        i += close + 1;
                        continue;
                    }
                }
            }
            let ch = template[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
        Ok(out)
    }

    /// The RHS of `%` is either a proper list (positional args) or a bare
    /// value substituted for `{0}` alone.
    fn format_args(&self, arg: &Value) -> Result<Vec<Value>, VmError> {
        match arg {
            Value::EmptyList => Ok(Vec::new()),
            Value::Cons(_) => {
                let mut items = Vec::new();
                let mut cur = arg.clone();
                loop {
                    match cur {
                        Value::Cons(h) => {
                            let HeapObject::Cons(car, cdr) = self.heap.get(h) else {
                                unreachable!()
                            };
                            items.push(car.clone());
                            cur = cdr.clone();
                        }
                        Value::EmptyList => break,
                        other => {
                            return Err(VmError::BadFormatString(format!(
                                "'%' argument list has a non-nil tail: {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Ok(items)
            }
            Value::Vector(h) => {
                let HeapObject::Vector(items) = self.heap.get(*h) else {
                    unreachable!()
                };
                Ok(items.clone())
            }
            other => Ok(vec![other.clone()]),
        }
    }
}
