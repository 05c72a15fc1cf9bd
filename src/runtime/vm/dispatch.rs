//! Central instruction dispatch (§4.6, §6): the `Nop`/constant/stack/jump/
//! global opcodes live here directly; arithmetic, comparisons, and
//! list/vector/pattern structural ops are delegated to their own modules
//! so this match stays a flat table of one-liners.

use super::{
    read_cstr, read_f64, read_i32, read_u16, read_u8, relative_target, Control, Vm, VmError,
};
use crate::bytecode::OpCode;
use crate::numeric::Num;
use crate::runtime::heap::HeapObject;
use crate::runtime::value::Value;

impl Vm {
    pub(super) fn dispatch(
        &mut self,
        code: &[u8],
        ptr: &mut usize,
        op: OpCode,
    ) -> Result<Control, VmError> {
        match op {
            OpCode::Nop => Ok(Control::Continue),
            OpCode::PushInt32 => {
                let v = read_i32(code, ptr);
                self.push(Value::Number(Num::from_i64(v as i64)))?;
                Ok(Control::Continue)
            }
            OpCode::PushNil => self.push(Value::Nil).map(|_| Control::Continue),

            OpCode::DupN => {
                let offset = read_i32(code, ptr) as usize;
                let value = self.peek(offset)?.clone();
                self.push(value).map(|_| Control::Continue)
            }
            OpCode::Dup => {
                let value = self.peek(0)?.clone();
                self.push(value).map(|_| Control::Continue)
            }
            OpCode::Pop => self.pop().map(|_| Control::Continue),
            OpCode::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow);
                }
                self.stack.swap(len - 1, len - 2);
                Ok(Control::Continue)
            }
            OpCode::PopN => {
                let n = read_u8(code, ptr) as usize;
                let len = self
                    .stack
                    .len()
                    .checked_sub(n)
                    .ok_or(VmError::StackUnderflow)?;
                self.stack.truncate(len);
                Ok(Control::Continue)
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow | OpCode::Mod => {
                self.op_arith(op)
            }
            OpCode::And | OpCode::Or | OpCode::Not => self.op_logic(op),

            OpCode::GetArgPack => self.op_get_arg_pack(),
            OpCode::MkFn => self.op_mk_fn(code, ptr),
            OpCode::Call => self.op_call(code, ptr),
            OpCode::Ret => self.op_ret(ptr),
            OpCode::MkClosure => self.op_mk_closure(code, ptr),
            OpCode::GetFree => self.op_get_free(code, ptr),
            OpCode::GetArg => self.op_get_arg(code, ptr),
            OpCode::SetArg => self.op_set_arg(code, ptr),
            OpCode::GetLocal => self.op_get_local(code, ptr),
            OpCode::SetLocal => self.op_set_local(code, ptr),
            OpCode::SetFree => self.op_set_free(code, ptr),
            OpCode::TailCall => self.op_tail_call(ptr),
            OpCode::GetFun => self.op_get_fun(),
            OpCode::Close => self.op_close(code, ptr),
            OpCode::Call0 => self.op_call0(code, ptr),
            OpCode::PackArgs => self.op_pack_args(code, ptr),

            OpCode::CmpEq
            | OpCode::CmpNeq
            | OpCode::CmpLt
            | OpCode::CmpLte
            | OpCode::CmpGt
            | OpCode::CmpGte => self.op_compare(op),
            OpCode::CmpEqMany => self.op_compare_eq_many(code, ptr),

            OpCode::Jmp => {
                let imm_start = *ptr;
                let off = read_i32(code, ptr);
                *ptr = relative_target(imm_start, 4, off);
                Ok(Control::Continue)
            }
            OpCode::Jt => {
                let imm_start = *ptr;
                let off = read_i32(code, ptr);
                let cond = self.pop()?;
                if cond.is_truthy(&self.heap) {
                    *ptr = relative_target(imm_start, 4, off);
                }
                Ok(Control::Continue)
            }
            OpCode::Jf => {
                let imm_start = *ptr;
                let off = read_i32(code, ptr);
                let cond = self.pop()?;
                if !cond.is_truthy(&self.heap) {
                    *ptr = relative_target(imm_start, 4, off);
                }
                Ok(Control::Continue)
            }

            OpCode::PushEmptyList => self.push(Value::EmptyList).map(|_| Control::Continue),
            OpCode::Cons => self.op_cons(),
            OpCode::Car => self.op_car(),
            OpCode::Cdr => self.op_cdr(),

            OpCode::PushPvar => self.op_push_pvar(code, ptr),
            OpCode::Match => self.op_match(code, ptr),

            OpCode::CallBuiltin => self.op_call_builtin(code, ptr),

            OpCode::PushSint => {
                let idx = read_u16(code, ptr) as i64;
                self.push(Value::Number(Num::from_i64(idx)))
                    .map(|_| Control::Continue)
            }
            OpCode::PushNils => {
                let count = read_u8(code, ptr);
                for _ in 0..count {
                    self.push(Value::Nil)?;
                }
                Ok(Control::Continue)
            }
            OpCode::PushTrue => self.push(Value::Bool(true)).map(|_| Control::Continue),
            OpCode::PushFalse => self.push(Value::Bool(false)).map(|_| Control::Continue),
            OpCode::PushAtom => {
                let num = read_i32(code, ptr) as u32;
                self.push(Value::Atom(num)).map(|_| Control::Continue)
            }
            OpCode::PushCstr => {
                let s = read_cstr(code, ptr);
                let handle = self.heap.alloc(HeapObject::Str(s));
                self.push(Value::Str(handle))?;
                self.heap.unprotect(handle);
                Ok(Control::Continue)
            }
            OpCode::PushFloat => {
                let v = read_f64(code, ptr);
                let digits = self.current_precision_digits();
                self.push(Value::Number(Num::from_f64(v).round_to_digits(digits)))
                    .map(|_| Control::Continue)
            }

            OpCode::MkVec => self.op_mk_vec(code, ptr),
            OpCode::VecGetHard => self.op_vec_get_hard(code, ptr),
            OpCode::VecGet => self.op_vec_get(),
            OpCode::VecSet => self.op_vec_set(),

            OpCode::AllocGlobals => {
                let page = read_u16(code, ptr) as usize;
                let count = read_u16(code, ptr) as usize;
                if page >= self.globals.len() {
                    self.globals.resize(page + 1, Vec::new());
                }
                if self.globals[page].is_empty() {
                    self.globals[page] = vec![Value::Nil; count];
                } else if self.globals[page].len() < count {
                    self.globals[page].resize(count, Value::Nil);
                }
                Ok(Control::Continue)
            }
            OpCode::GetGlobal => {
                let page = read_u16(code, ptr) as usize;
                let idx = read_u16(code, ptr) as usize;
                let value = self
                    .globals
                    .get(page)
                    .and_then(|p| p.get(idx))
                    .cloned()
                    .ok_or_else(|| {
                        VmError::IndexOutOfRange {
                            index: idx as i64,
                            len: self.globals.get(page).map(|p| p.len()).unwrap_or(0),
                        }
                    })?;
                self.push(value).map(|_| Control::Continue)
            }
            OpCode::SetGlobal => {
                let page = read_u16(code, ptr) as usize;
                let idx = read_u16(code, ptr) as usize;
                let value = self.peek(0)?.clone();
                let slot = self
                    .globals
                    .get_mut(page)
                    .and_then(|p| p.get_mut(idx))
                    .ok_or(VmError::IndexOutOfRange { index: idx as i64, len: 0 })?;
                *slot = value;
                Ok(Control::Continue)
            }
            OpCode::DefAtom => {
                let num = read_i32(code, ptr) as usize;
                let name = read_cstr(code, ptr);
                if num >= self.atom_names.len() {
                    self.atom_names.resize(num + 1, None);
                }
                self.atom_names[num] = Some(name);
                Ok(Control::Continue)
            }

            OpCode::PushMicroframe => self.op_push_microframe(),
            OpCode::PopMicroframe => self.op_pop_microframe(),

            OpCode::Breakpoint => {
                let _id = read_i32(code, ptr);
                Ok(Control::Continue)
            }
            OpCode::Exit => Ok(Control::Halt),
        }
    }

    /// Reads the innermost live micro-frame's decimal-digit precision
    /// (`bp+4` points at its 3-cell record, §3), used by `push_float` to
    /// round the literal to the precision in effect where it's evaluated.
    /// Always valid by the time user code runs a `push_float`: the
    /// top-level shape establishes the root micro-frame before compiling
    /// any statement (§4.4).
    pub(super) fn current_precision_digits(&self) -> i64 {
        let mf = self.stack[self.bp + 4].as_internal() as usize;
        self.stack[mf + 2].as_internal()
    }
}
