//! Call frames.
//!
//! Each activation owns its operand stack, its locals and the loop and try
//! blocks it has entered. The caller of a frame is simply the previous entry
//! in the VM's frame vector.

use std::rc::Rc;

use crate::error::InternalError;

use super::chunk::FunctionDef;
use super::heap::HeapId;
use super::value::{Members, Value};

/// Entered by `BEGIN_LOOP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopBlock {
    /// Operand stack height at loop entry.
    pub height: usize,
    /// Number of try blocks open at loop entry.
    pub try_depth: usize,
}

/// Entered by `TRY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryBlock {
    pub catch_pc: usize,
    pub height: usize,
    pub loop_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The top-level body of a program; names resolve to globals.
    Module,
    Function,
    /// A constructor running for one level of an instance chain.
    Constructor { class: HeapId, super_called: bool },
}

#[derive(Debug)]
pub struct Frame {
    pub def: Rc<FunctionDef>,
    /// Loaded program whose symbols and constants `def` indexes.
    pub unit: usize,
    pub pc: usize,
    pub stack: Vec<Value>,
    pub locals: Members,
    pub loop_blocks: Vec<LoopBlock>,
    pub try_blocks: Vec<TryBlock>,
    pub self_value: Option<Value>,
    /// Returned in place of the popped value when set.
    pub retval: Option<Value>,
    pub kind: FrameKind,
    /// Drop the result instead of pushing it onto the caller.
    pub discard_result: bool,
}

impl Frame {
    pub fn new(def: Rc<FunctionDef>, unit: usize, kind: FrameKind) -> Self {
        Self {
            def,
            unit,
            pc: 0,
            stack: Vec::with_capacity(16),
            locals: Members::default(),
            loop_blocks: Vec::new(),
            try_blocks: Vec::new(),
            self_value: None,
            retval: None,
            kind,
            discard_result: false,
        }
    }

    pub fn is_module(&self) -> bool {
        self.kind == FrameKind::Module
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, InternalError> {
        self.stack.pop().ok_or(InternalError::StackUnderflow)
    }

    /// The value `depth` slots below the top.
    pub fn peek(&self, depth: usize) -> Result<Value, InternalError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|index| self.stack[index])
            .ok_or(InternalError::StackUnderflow)
    }

    /// Pop the top `n` values, bottom first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, InternalError> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or(InternalError::StackUnderflow)?;
        Ok(self.stack.split_off(start))
    }

    /// Source line of the instruction being executed.
    pub fn line(&self) -> u32 {
        self.def.line_at(self.pc.saturating_sub(1))
    }

    /// Heap handles this frame keeps alive.
    pub fn roots(&self, out: &mut Vec<HeapId>) {
        out.extend(self.stack.iter().filter_map(|v| v.heap_id()));
        out.extend(self.locals.values().filter_map(|v| v.heap_id()));
        out.extend(self.self_value.and_then(Value::heap_id));
        out.extend(self.retval.and_then(Value::heap_id));
        if let FrameKind::Constructor { class, .. } = self.kind {
            out.push(class);
        }
    }
}
