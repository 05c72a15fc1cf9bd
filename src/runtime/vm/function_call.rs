//! Calls, returns, closures, and upvalues (§4.4's calling convention,
//! §4.5): frame headers live directly on the value stack rather than in a
//! parallel `Vec<Frame>` the way `examples/sger-flux`'s `Frame` does —
//! every `call`/`ret`/`close` here is just stack-slot arithmetic around
//! `self.bp`.

use num_traits::ToPrimitive;

use super::{read_i32, read_u8, Control, Vm, VmError, BUILTIN_LEN, BUILTIN_PARSE_INT, BUILTIN_PRINT};
use crate::bytecode::OpCode;
use crate::numeric::Num;
use crate::runtime::heap::{Closure, HeapObject, UpvalueCell};
use crate::runtime::value::Value;

impl Vm {
    fn callee_closure(&self, value: &Value) -> Result<Closure, VmError> {
        match value {
            Value::Function(h) => match self.heap.get(*h) {
                HeapObject::Function(c) => Ok(c.clone()),
                _ => unreachable!("Value::Function handle must point at HeapObject::Function"),
            },
            other => Err(VmError::TypeError(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    /// `call argc` (0x22, §4.4): `stack[sp-1]` is the callee, `argc`
    /// already-reversed arguments sit below it. Pushes a 6-cell header
    /// (`bp+0..=bp+5`) and jumps into the callee's own code, which begins
    /// with its own `push_nils` for locals.
    pub(super) fn op_call(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let argc = read_u8(code, ptr);
        self.do_call(argc, false, ptr)
    }

    /// `call0 argc` (0x2E): identical to `call`, except the new frame's
    /// inherited micro-frame pointer is always `0` rather than copied
    /// from the caller — used by the top-level wrapper, which has no
    /// caller micro-frame to inherit from.
    pub(super) fn op_call0(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let argc = read_u8(code, ptr);
        self.do_call(argc, true, ptr)
    }

    fn do_call(&mut self, argc: u8, is_call0: bool, ptr: &mut usize) -> Result<Control, VmError> {
        let callee = self.peek(0)?.clone();
        let closure = self.callee_closure(&callee)?;
        let new_bp = self.stack.len();
        let saved_bp = self.bp;
        let ret_addr = *ptr;
        let inherited_mf = if is_call0 {
            0
        } else {
            self.stack[self.bp + 4].as_internal()
        };

        self.push(Value::Internal(saved_bp as i64))?; // bp+0: saved bp
        self.push(Value::Internal(ret_addr as i64))?; // bp+1: return address
        self.push(callee)?; // bp+2: callee closure (direct-access copy)
        self.push(Value::Internal(argc as i64))?; // bp+3: argc
        self.push(Value::Internal(inherited_mf))?; // bp+4: micro-frame pointer
        self.push(Value::Nil)?; // bp+5: arg-pack placeholder

        self.bp = new_bp;
        *ptr = closure.offset as usize;
        Ok(Control::Continue)
    }

    /// `ret` (0x23): collapses the header, locals, and arguments back
    /// down to exactly one cell holding the return value, and restores
    /// the caller's `bp`/instruction pointer.
    pub(super) fn op_ret(&mut self, ptr: &mut usize) -> Result<Control, VmError> {
        let retv = self.pop()?;
        let argc = self.stack[self.bp + 3].as_internal() as usize;
        let ret_addr = self.stack[self.bp + 1].as_internal() as usize;
        let pbp = self.bp;
        self.bp = self.stack[pbp].as_internal() as usize;
        let new_len = pbp - argc;
        self.stack.truncate(new_len);
        self.stack[new_len - 1] = retv;
        *ptr = ret_addr;
        Ok(Control::Continue)
    }

    /// `tail_call` (0x2B): `$(...)` in tail position never pushes a new
    /// callee (`compiler::compile_call`'s self-tail-call path goes
    /// straight from the reversed argument list to a bare `tail_call`),
    /// so unlike the original this reuses the current frame's own callee
    /// at `bp+2` rather than popping a fresh one off the stack.
    pub(super) fn op_tail_call(&mut self, ptr: &mut usize) -> Result<Control, VmError> {
        let closure = self.callee_closure(&self.stack[self.bp + 2].clone())?;
        let argc = self.stack[self.bp + 3].as_internal() as usize;
        let top = self.stack.len();
        for i in 0..argc {
            self.stack[self.bp - 2 - i] = self.stack[top - 1 - i].clone();
        }
        self.stack.truncate(self.bp + 6);
        *ptr = closure.offset as usize;
        Ok(Control::Continue)
    }

    /// `mk_fn target` (0x21): a plain function value with no captured
    /// environment.
    pub(super) fn op_mk_fn(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let target = read_i32(code, ptr) as u32;
        let handle = self.heap.alloc(HeapObject::Function(Closure {
            offset: target,
            env: Vec::new(),
        }));
        self.push(Value::Function(handle))?;
        self.heap.unprotect(handle);
        Ok(Control::Continue)
    }

    /// `mk_closure nfree target` (0x24), followed inline by `nfree` 2-byte
    /// capture directives — each one a full `get_local idx` / `get_arg
    /// idx` / `get_free idx` instruction, exactly as
    /// `compiler::emit_captures` emits them (not a bespoke directive
    /// encoding; reusing the existing opcodes self-describes which kind
    /// of capture each one is). Unlike the original C++, the new
    /// closure's environment holds *only* these `nfree` entries — no
    /// verbatim prefix-copy of the enclosing closure's own environment.
    pub(super) fn op_mk_closure(
        &mut self,
        code: &[u8],
        ptr: &mut usize,
    ) -> Result<Control, VmError> {
        let nfree = read_u8(code, ptr);
        let target = read_i32(code, ptr) as u32;
        let mut env = Vec::with_capacity(nfree as usize);
        for _ in 0..nfree {
            let op_byte = read_u8(code, ptr);
            let op = OpCode::from_byte(op_byte)
                .unwrap_or_else(|| panic!("malformed capture directive byte 0x{op_byte:02X}"));
            let idx = read_u8(code, ptr) as usize;
            let handle = match op {
                OpCode::GetLocal => self.open_upvalue_for(self.bp + 6 + idx),
                OpCode::GetArg => self.open_upvalue_for(self.bp - 2 - idx),
                OpCode::GetFree => {
                    let enclosing = self.callee_closure(&self.stack[self.bp + 2].clone())?;
                    enclosing.env[idx]
                }
                other => panic!("invalid capture directive opcode {other:?}"),
            };
            env.push(handle);
        }
        let handle = self.heap.alloc(HeapObject::Function(Closure {
            offset: target,
            env,
        }));
        self.push(Value::Function(handle))?;
        self.heap.unprotect(handle);
        Ok(Control::Continue)
    }

    /// Finds (or allocates) the open upvalue cell for stack slot
    /// `stack_idx`, deduplicating against every currently-live upvalue so
    /// two closures capturing the same binding share one cell.
    fn open_upvalue_for(&mut self, stack_idx: usize) -> crate::runtime::heap::GcHandle {
        for &h in self.heap.live_upvalues() {
            if let HeapObject::Upvalue(UpvalueCell::Open(idx)) = self.heap.get(h) {
                if *idx == stack_idx {
                    return h;
                }
            }
        }
        let h = self.heap.alloc(HeapObject::Upvalue(UpvalueCell::Open(stack_idx)));
        self.heap.unprotect(h);
        h
    }

    pub(super) fn op_get_free(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let idx = read_u8(code, ptr) as usize;
        let closure = self.callee_closure(&self.stack[self.bp + 2].clone())?;
        let handle = closure.env[idx];
        let value = Value::follow_upvalue(handle, &self.heap, &self.stack).clone();
        self.push(value)
            .map(|_| Control::Continue)
    }

    /// Peek-only (§9 Open Question decisions): writes through an open
    /// cell's stack slot or a closed cell's stored value without popping
    /// the assigned value off the stack, consistent with
    /// `set_local`/`set_arg`/`set_global`.
    pub(super) fn op_set_free(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let idx = read_u8(code, ptr) as usize;
        let value = self.peek(0)?.clone();
        let closure = self.callee_closure(&self.stack[self.bp + 2].clone())?;
        let handle = closure.env[idx];
        match self.heap.get_mut(handle) {
            HeapObject::Upvalue(UpvalueCell::Open(stack_idx)) => {
                let stack_idx = *stack_idx;
                self.stack[stack_idx] = value;
            }
            HeapObject::Upvalue(UpvalueCell::Closed(stored)) => *stored = value,
            _ => unreachable!("env handle must point at an upvalue cell"),
        }
        Ok(Control::Continue)
    }

    pub(super) fn op_get_arg(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let idx = read_u8(code, ptr) as usize;
        let value = self.stack[self.bp - 2 - idx].clone();
        self.push(value).map(|_| Control::Continue)
    }

    pub(super) fn op_set_arg(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let idx = read_u8(code, ptr) as usize;
        let value = self.peek(0)?.clone();
        self.stack[self.bp - 2 - idx] = value;
        Ok(Control::Continue)
    }

    pub(super) fn op_get_local(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let idx = read_u8(code, ptr) as usize;
        let value = self.stack[self.bp + 6 + idx].clone();
        self.push(value).map(|_| Control::Continue)
    }

    pub(super) fn op_set_local(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let idx = read_u8(code, ptr) as usize;
        let value = self.peek(0)?.clone();
        self.stack[self.bp + 6 + idx] = value;
        Ok(Control::Continue)
    }

    /// `get_fun` (0x2C): pushes the currently executing closure, for a
    /// bare (non-tail, non-call) reference to `$`.
    pub(super) fn op_get_fun(&mut self) -> Result<Control, VmError> {
        let value = self.stack[self.bp + 2].clone();
        self.push(value).map(|_| Control::Continue)
    }

    /// `close local_count` (0x2D): on the way out of a function whose
    /// bindings were captured by an inner closure, converts every
    /// still-open upvalue cell pointing into this frame's locals or
    /// arguments into a closed one holding a copy of the value, so the
    /// inner closure keeps working after this frame's stack slots are
    /// reused.
    pub(super) fn op_close(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let local_count = read_u8(code, ptr) as usize;
        let argc = self.stack[self.bp + 3].as_internal() as usize;
        let locals_lo = self.bp + 5;
        let locals_hi = self.bp + 6 + local_count;
        let args_lo = self.bp - 1 - argc;
        let args_hi = self.bp - 1;
        let owned = self.heap.live_upvalues().to_vec();
        for h in owned {
            if let HeapObject::Upvalue(UpvalueCell::Open(idx)) = self.heap.get(h) {
                let idx = *idx;
                if (locals_lo..locals_hi).contains(&idx) || (args_lo..args_hi).contains(&idx) {
                    let value = self.stack[idx].clone();
                    *self.heap.get_mut(h) = HeapObject::Upvalue(UpvalueCell::Closed(value));
                }
            }
        }
        Ok(Control::Continue)
    }

    /// `pack_args start` (0x2F): collects the caller's arguments from
    /// `start` onward into a vector and writes it into the pre-reserved
    /// `bp+5` slot (the variadic `...args` pack), without pushing.
    pub(super) fn op_pack_args(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let start = read_u8(code, ptr) as usize;
        let argc = self.stack[self.bp + 3].as_internal() as usize;
        let mut items = Vec::with_capacity(argc.saturating_sub(start));
        for i in start..argc {
            items.push(self.stack[self.bp - 2 - i].clone());
        }
        let handle = self.heap.alloc(HeapObject::Vector(items));
        self.stack[self.bp + 5] = Value::Vector(handle);
        self.heap.unprotect(handle);
        Ok(Control::Continue)
    }

    pub(super) fn op_get_arg_pack(&mut self) -> Result<Control, VmError> {
        let value = self.stack[self.bp + 5].clone();
        self.push(value).map(|_| Control::Continue)
    }

    /// `push_microframe` (0xB0): pops a decimal-digit precision count and
    /// pushes a 3-cell record `[parent_mf_ptr, prec_bits, prec_digits]`,
    /// wiring it in as the frame's new current micro-frame.
    pub(super) fn op_push_microframe(&mut self) -> Result<Control, VmError> {
        let digits_val = self.pop()?;
        let digits = self.as_int(&digits_val)?;
        let bits = prec_base10_to_bits(digits);
        let start = self.stack.len();
        let parent = self.stack[self.bp + 4].as_internal();
        self.push(Value::Internal(parent))?;
        self.push(Value::Internal(bits))?;
        self.push(Value::Internal(digits))?;
        self.stack[self.bp + 4] = Value::Internal(start as i64);
        Ok(Control::Continue)
    }

    /// `pop_microframe` (0xB1): restores the parent micro-frame pointer
    /// and collapses the record down to the body's result value.
    pub(super) fn op_pop_microframe(&mut self) -> Result<Control, VmError> {
        let start = self.stack[self.bp + 4].as_internal() as usize;
        let parent = self.stack[start].as_internal();
        self.stack[self.bp + 4] = Value::Internal(parent);
        let result = self.pop()?;
        self.stack[start] = result;
        self.stack.truncate(start + 1);
        Ok(Control::Continue)
    }

    /// `call_builtin index argc` (0x70, §4.6): every builtin so far is
    /// arity-1, so only `stack[sp-1]` is actually consulted; the full
    /// `argc` cells are still collapsed down to the one result, at the
    /// position of the first argument.
    pub(super) fn op_call_builtin(
        &mut self,
        code: &[u8],
        ptr: &mut usize,
    ) -> Result<Control, VmError> {
        let index = super::read_u16(code, ptr);
        let argc = read_u8(code, ptr) as usize;
        let arg = self.peek(0)?.clone();
        let result = self.invoke_builtin(index, &arg)?;
        let target = self.stack.len() - argc;
        self.stack.truncate(target);
        self.stack.push(result);
        Ok(Control::Continue)
    }

    fn invoke_builtin(&mut self, index: u16, arg: &Value) -> Result<Value, VmError> {
        match index {
            BUILTIN_PRINT => {
                if let Value::Str(h) = arg {
                    let HeapObject::Str(s) = self.heap.get(*h) else {
                        unreachable!()
                    };
                    println!("{s}");
                } else {
                    println!("{}", arg.display(&self.heap));
                }
                Ok(Value::Nil)
            }
            BUILTIN_PARSE_INT => {
                let Value::Str(h) = arg else {
                    return Err(VmError::TypeError(
                        "parse_int expects a string".to_string(),
                    ));
                };
                let HeapObject::Str(s) = self.heap.get(*h) else {
                    unreachable!()
                };
                let n = s
                    .parse::<num_bigint::BigInt>()
                    .map_err(|_| VmError::TypeError(format!("'{s}' is not a valid integer")))?;
                Ok(Value::Number(Num::Int(n)))
            }
            BUILTIN_LEN => Ok(Value::Number(Num::from_i64(self.value_len(arg)))),
            other => Err(VmError::TypeError(format!("no builtin with index {other}"))),
        }
    }

    /// `len(v)`: vector element count, or a list's cons-chain length
    /// (`0` for an improper list that never bottoms out at `[]`, matching
    /// the original rather than treating it as an error).
    fn value_len(&self, value: &Value) -> i64 {
        match value {
            Value::Vector(h) => {
                let HeapObject::Vector(items) = self.heap.get(*h) else {
                    unreachable!()
                };
                items.len() as i64
            }
            Value::EmptyList => 0,
            Value::Cons(_) => {
                let mut cur = value.clone();
                let mut n = 0i64;
                loop {
                    match cur {
                        Value::Cons(h) => {
                            let HeapObject::Cons(_, cdr) = self.heap.get(h) else {
                                unreachable!()
                            };
                            n += 1;
                            cur = cdr.clone();
                        }
                        Value::EmptyList => return n,
                        _ => return 0,
                    }
                }
            }
            _ => 0,
        }
    }
}

/// `util/float.cpp`'s `prec_base10_to_bits`: kept even though
/// `numeric::Num::Float` is a plain `f64` and `push_float` (§9, a
/// documented simplification) never consults it, so the micro-frame
/// record it feeds stays faithful for any future introspection.
fn prec_base10_to_bits(digits: i64) -> i64 {
    let bits = (digits as f64 * 3.5).ceil() as i64 + 16;
    bits.div_ceil(32) * 32
}

#[allow(unused_imports)]
use ToPrimitive as _;
