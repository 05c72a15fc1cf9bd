//! List, vector, and pattern opcodes (§4.6 "Lists"/"Vectors"/"Patterns"):
//! `cons`/`car`/`cdr` over the heap's cons cells, `vec_get`'s polymorphism
//! over both vectors and cons pairs, and the `push_pvar`/`match` pair that
//! drives structural pattern matching — compiled patterns are themselves
//! ordinary `cons`/literal/`push_pvar` bytecode (§4.4 "Match"), so `match`
//! walks two already-built [`Value`]s rather than interpreting a separate
//! pattern AST at runtime.

use super::{read_i32, read_u16, Control, Vm, VmError};
use crate::runtime::heap::HeapObject;
use crate::runtime::value::Value;

impl Vm {
    pub(super) fn op_cons(&mut self) -> Result<Control, VmError> {
        let cdr = self.pop()?;
        let car = self.pop()?;
        let handle = self.heap.alloc(HeapObject::Cons(car, cdr));
        self.push(Value::Cons(handle))?;
        self.heap.unprotect(handle);
        Ok(Control::Continue)
    }

    pub(super) fn op_car(&mut self) -> Result<Control, VmError> {
        let value = self.pop()?;
        let Value::Cons(h) = value else {
            return Err(VmError::TypeError(format!(
                "car expects a cons cell, found {}",
                value.type_name()
            )));
        };
        let HeapObject::Cons(car, _) = self.heap.get(h) else {
            unreachable!()
        };
        let car = car.clone();
        self.push(car).map(|_| Control::Continue)
    }

    pub(super) fn op_cdr(&mut self) -> Result<Control, VmError> {
        let value = self.pop()?;
        let Value::Cons(h) = value else {
            return Err(VmError::TypeError(format!(
                "cdr expects a cons cell, found {}",
                value.type_name()
            )));
        };
        let HeapObject::Cons(_, cdr) = self.heap.get(h) else {
            unreachable!()
        };
        let cdr = cdr.clone();
        self.push(cdr).map(|_| Control::Continue)
    }

    pub(super) fn op_mk_vec(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let count = read_u16(code, ptr) as usize;
        let len = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(VmError::StackUnderflow)?;
        let items: Vec<Value> = self.stack.split_off(len);
        let handle = self.heap.alloc(HeapObject::Vector(items));
        self.push(Value::Vector(handle))?;
        self.heap.unprotect(handle);
        Ok(Control::Continue)
    }

    /// `vec_get_hard index` (0x91): the index is a bytecode immediate,
    /// not a popped value, for the compiler's own fixed-offset reads.
    pub(super) fn op_vec_get_hard(
        &mut self,
        code: &[u8],
        ptr: &mut usize,
    ) -> Result<Control, VmError> {
        let index = read_u16(code, ptr) as usize;
        let value = self.pop()?;
        let Value::Vector(h) = value else {
            return Err(VmError::TypeError(format!(
                "vec_get_hard expects a vector, found {}",
                value.type_name()
            )));
        };
        let HeapObject::Vector(items) = self.heap.get(h) else {
            unreachable!()
        };
        let item = items.get(index).cloned().ok_or(VmError::IndexOutOfRange {
            index: index as i64,
            len: items.len(),
        })?;
        self.push(item).map(|_| Control::Continue)
    }

    /// `vec_get` (0x92): polymorphic over vectors (arbitrary integer
    /// index) and cons cells (index restricted to `0`/`1`, i.e. `car`/
    /// `cdr` by subscript).
    pub(super) fn op_vec_get(&mut self) -> Result<Control, VmError> {
        let index_val = self.pop()?;
        let target = self.pop()?;
        let index = self.as_int(&index_val)?;
        match target {
            Value::Vector(h) => {
                let HeapObject::Vector(items) = self.heap.get(h) else {
                    unreachable!()
                };
                let item = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or(VmError::IndexOutOfRange {
                        index,
                        len: items.len(),
                    })?;
                self.push(item).map(|_| Control::Continue)
            }
            Value::Cons(h) => {
                let HeapObject::Cons(car, cdr) = self.heap.get(h) else {
                    unreachable!()
                };
                let item = match index {
                    0 => car.clone(),
                    1 => cdr.clone(),
                    other => return Err(VmError::IndexOutOfRange { index: other, len: 2 }),
                };
                self.push(item).map(|_| Control::Continue)
            }
            other => Err(VmError::TypeError(format!(
                "subscript expects a vector or cons cell, found {}",
                other.type_name()
            ))),
        }
    }

    pub(super) fn op_vec_set(&mut self) -> Result<Control, VmError> {
        let value = self.pop()?;
        let index_val = self.pop()?;
        let target = self.pop()?;
        let index = self.as_int(&index_val)?;
        let Value::Vector(h) = target else {
            return Err(VmError::TypeError(format!(
                "vec_set expects a vector, found {}",
                target.type_name()
            )));
        };
        let len = match self.heap.get_mut(h) {
            HeapObject::Vector(items) => items.len(),
            _ => unreachable!(),
        };
        let i = usize::try_from(index).ok().filter(|&i| i < len).ok_or(
            VmError::IndexOutOfRange { index, len },
        )?;
        let HeapObject::Vector(items) = self.heap.get_mut(h) else {
            unreachable!()
        };
        items[i] = value.clone();
        self.push(value).map(|_| Control::Continue)
    }

    /// `push_pvar pv` (0x60): pushes a compile-time marker carrying the
    /// pattern-variable's block-relative slot; only ever consumed by the
    /// immediately following `match`.
    pub(super) fn op_push_pvar(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let pv = read_i32(code, ptr) as u32;
        self.push(Value::PatternVar(pv)).map(|_| Control::Continue)
    }

    /// `match loff` (0x61): pops the compiled pattern template and the
    /// subject, structurally compares them, and on success writes every
    /// bound pattern variable into `locals[bp+6+loff+relative_slot]`
    /// before pushing `true`; on failure, pushes `false` without binding
    /// anything (the compiler discards any partial writes by not using
    /// them — this implementation additionally never performs a partial
    /// write at all, collecting bindings before applying them).
    pub(super) fn op_match(&mut self, code: &[u8], ptr: &mut usize) -> Result<Control, VmError> {
        let loff = read_i32(code, ptr) as usize;
        let pattern = self.pop()?;
        let subject = self.pop()?;

        let mut bindings = Vec::new();
        let matched = self.match_pattern(&pattern, &subject, &mut bindings);
        if matched {
            for (slot, value) in bindings {
                self.stack[self.bp + 6 + loff + slot as usize] = value;
            }
        }
        self.push(Value::Bool(matched)).map(|_| Control::Continue)
    }

    /// Structural match per §6 "Patterns": atoms/ints/bools/strings/nil/
    /// empty-list compare by value equality, `cons` recurses into both
    /// sides, and a `PatternVar` marker always succeeds and records a
    /// binding rather than comparing.
    fn match_pattern(&self, pattern: &Value, subject: &Value, bindings: &mut Vec<(u32, Value)>) -> bool {
        match pattern {
            Value::PatternVar(slot) => {
                bindings.push((*slot, subject.clone()));
                true
            }
            Value::Cons(ph) => {
                let Value::Cons(sh) = subject else {
                    return false;
                };
                let HeapObject::Cons(pcar, pcdr) = self.heap.get(*ph) else {
                    unreachable!()
                };
                let HeapObject::Cons(scar, scdr) = self.heap.get(*sh) else {
                    unreachable!()
                };
                let (pcar, pcdr, scar, scdr) =
                    (pcar.clone(), pcdr.clone(), scar.clone(), scdr.clone());
                self.match_pattern(&pcar, &scar, bindings) && self.match_pattern(&pcdr, &scdr, bindings)
            }
            _ => pattern.structural_eq(subject, &self.heap),
        }
    }
}
