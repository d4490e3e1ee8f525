//! Execution state shared by the interpreter and the specialized fast path.

use crate::compiler::ast::CmpOp;
use crate::error::RenderError;
use crate::types::{Addr, SlotIdx};
use crate::value::Value;

struct LoopFrame {
    slot: SlotIdx,
    items: std::vec::IntoIter<Value>,
    /// Binding shadowed by this loop, restored at `ForEnd`.
    saved: Option<Value>,
}

/// Operand stack, locals and output of one activation (a template render or
/// a macro call).
pub(crate) struct Machine {
    stack: Vec<Value>,
    locals: Vec<Option<Value>>,
    loops: Vec<LoopFrame>,
    shared: Vec<Value>,
    pub(crate) out: String,
}

impl Machine {
    pub(crate) fn new(slots: usize, shared: u32) -> Self {
        Self {
            stack: Vec::with_capacity(16),
            locals: vec![None; slots],
            loops: Vec::new(),
            shared: vec![Value::Null; shared as usize],
            out: String::new(),
        }
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self, pc: usize) -> Result<Value, RenderError> {
        self.stack.pop().ok_or(RenderError::StackUnderflow { pc })
    }

    /// Pop `n` values, returned in push order.
    pub(crate) fn pop_n(&mut self, n: usize, pc: usize) -> Result<Vec<Value>, RenderError> {
        if self.stack.len() < n {
            return Err(RenderError::StackUnderflow { pc });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub(crate) fn local(&self, slot: SlotIdx) -> Option<&Value> {
        self.locals.get(slot as usize).and_then(Option::as_ref)
    }

    /// Locals currently bound, by slot index.
    pub(crate) fn bound_locals(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.locals
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
    }

    pub(crate) fn bind_params(&mut self, params: &[SlotIdx], args: Vec<Value>) {
        let mut args = args.into_iter();
        for &slot in params {
            let value = args.next().unwrap_or(Value::Null);
            if let Some(local) = self.locals.get_mut(slot as usize) {
                *local = Some(value);
            }
        }
    }

    pub(crate) fn load_shared(&self, slot: u32, pc: usize) -> Result<Value, RenderError> {
        self.shared
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| malformed(pc, format!("shared slot {slot} out of bounds")))
    }

    pub(crate) fn store_shared(&mut self, slot: u32, pc: usize) -> Result<(), RenderError> {
        let value = self.pop(pc)?;
        let target = self
            .shared
            .get_mut(slot as usize)
            .ok_or_else(|| malformed(pc, format!("shared slot {slot} out of bounds")))?;
        *target = value;
        Ok(())
    }

    pub(crate) fn concat(&mut self, n: u32, pc: usize) -> Result<(), RenderError> {
        let parts = self.pop_n(n as usize, pc)?;
        self.push(Value::concat(&parts));
        Ok(())
    }

    pub(crate) fn compare(&mut self, op: CmpOp, pc: usize) -> Result<(), RenderError> {
        let rhs = self.pop(pc)?;
        let lhs = self.pop(pc)?;
        let equal = lhs.loose_eq(&rhs);
        self.push(Value::Bool(match op {
            CmpOp::Eq => equal,
            CmpOp::Ne => !equal,
        }));
        Ok(())
    }

    pub(crate) fn not(&mut self, pc: usize) -> Result<(), RenderError> {
        let v = self.pop(pc)?;
        self.push(Value::Bool(!v.is_truthy()));
        Ok(())
    }

    /// Pops the condition; returns the jump target when it is falsy.
    pub(crate) fn jump_if_false(&mut self, target: Addr, pc: usize) -> Result<Option<usize>, RenderError> {
        let cond = self.pop(pc)?;
        Ok((!cond.is_truthy()).then_some(target as usize))
    }

    pub(crate) fn emit(&mut self, pc: usize) -> Result<(), RenderError> {
        let v = self.pop(pc)?;
        self.out.push_str(&v.to_output());
        Ok(())
    }

    pub(crate) fn emit_raw(&mut self, pc: usize) -> Result<(), RenderError> {
        let v = self.pop(pc)?;
        self.out.push_str(&v.to_text());
        Ok(())
    }

    /// Returns the number of items and where to continue.
    pub(crate) fn for_start(
        &mut self,
        slot: SlotIdx,
        exit: Addr,
        pc: usize,
    ) -> Result<(usize, usize), RenderError> {
        let iterable = self.pop(pc)?;
        let items = iterable.iter_items();
        let count = items.len();
        let mut items = items.into_iter();
        let Some(first) = items.next() else {
            return Ok((0, exit as usize));
        };
        let local = self
            .locals
            .get_mut(slot as usize)
            .ok_or_else(|| malformed(pc, format!("slot {slot} out of bounds")))?;
        let saved = local.replace(first);
        self.loops.push(LoopFrame { slot, items, saved });
        Ok((count, pc + 1))
    }

    pub(crate) fn for_next(&mut self, slot: SlotIdx, body: Addr, pc: usize) -> Result<usize, RenderError> {
        let frame = self
            .loops
            .last_mut()
            .ok_or_else(|| malformed(pc, "FOR_NEXT outside a loop".to_string()))?;
        match frame.items.next() {
            Some(item) => {
                if let Some(local) = self.locals.get_mut(slot as usize) {
                    *local = Some(item);
                }
                Ok(body as usize)
            }
            None => Ok(pc + 1),
        }
    }

    pub(crate) fn for_end(&mut self, pc: usize) -> Result<(), RenderError> {
        let frame = self
            .loops
            .pop()
            .ok_or_else(|| malformed(pc, "FOR_END outside a loop".to_string()))?;
        if let Some(local) = self.locals.get_mut(frame.slot as usize) {
            *local = frame.saved;
        }
        Ok(())
    }
}

pub(crate) fn malformed(pc: usize, message: String) -> RenderError {
    RenderError::Malformed { pc, message }
}
