//! Tree-to-bytecode compiler.
//!
//! Single pass, depth first: every node appends instructions to the buffer of
//! the function currently being compiled. Forward jumps go through the
//! function's jump-target table: a slot is reserved when the jump is emitted
//! and patched once the destination address is reached.

use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexSet;

use crate::ast::{Node, NodeKind, Position};
use crate::error::CompileError;

use super::chunk::{CompiledProgram, Constant, FunctionDef};
use super::opcode::{Instruction, Opcode};

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Largest argument count a call instruction can carry.
pub const MAX_ARGS: usize = u8::MAX as usize;

const MAX_INDEX: usize = u16::MAX as usize;

/// Identity of a deduplicated constant. Doubles compare by bit pattern so
/// `0.0` and `-0.0` stay distinct and NaNs share a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Null,
    Bool(bool),
    Long(i64),
    Double(u64),
    Str(Rc<str>),
}

impl ConstantKey {
    /// Functions and classes are never shared.
    fn of(constant: &Constant) -> Option<Self> {
        match constant {
            Constant::Null => Some(ConstantKey::Null),
            Constant::Bool(b) => Some(ConstantKey::Bool(*b)),
            Constant::Long(n) => Some(ConstantKey::Long(*n)),
            Constant::Double(d) => Some(ConstantKey::Double(d.to_bits())),
            Constant::Str(s) => Some(ConstantKey::Str(s.clone())),
            Constant::Function(_) | Constant::Class(_) => None,
        }
    }
}

/// Tracks what kind of function is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Constructor,
}

/// Jump-target slots for `continue` and `break` in the innermost loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopContext {
    pub continue_slot: usize,
    pub exit_slot: usize,
}

/// Per-function compilation state.
pub struct FunctionState {
    pub def: FunctionDef,
    pub function_type: FunctionType,
    pub loops: Vec<LoopContext>,
}

impl FunctionState {
    fn new(def: FunctionDef, function_type: FunctionType) -> Self {
        Self {
            def,
            function_type,
            loops: Vec::new(),
        }
    }
}

/// The compiler: transforms a tree into a [`CompiledProgram`].
pub struct Compiler {
    source_name: String,
    symbols: IndexSet<Rc<str>, ahash::RandomState>,
    constants: Vec<Constant>,
    interned: AHashMap<ConstantKey, u16>,
    /// The function being built.
    pub state: FunctionState,
    /// Functions whose compilation is suspended by a nested definition.
    enclosing: Vec<FunctionState>,
}

impl Compiler {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            symbols: IndexSet::default(),
            constants: Vec::new(),
            interned: AHashMap::new(),
            state: FunctionState::new(FunctionDef::new("<main>", 1), FunctionType::Script),
            enclosing: Vec::new(),
        }
    }

    /// Compile a `Program` tree.
    pub fn compile(tree: &Node<'_>, source_name: impl Into<String>) -> CompileResult<CompiledProgram> {
        if tree.kind != NodeKind::Program {
            return Err(CompileError::malformed(
                format!("expected a Program root, found {}", tree.kind.name()),
                tree.pos,
            ));
        }
        let mut compiler = Compiler::new(source_name);
        for stmt in tree.children {
            compiler.compile_stmt(stmt)?;
        }
        let end = Position::new(compiler.last_line(), 0);
        let main = compiler.finish_current(end)?;

        tracing::debug!(
            "compiled '{}': {} instructions, {} symbols, {} constants",
            compiler.source_name,
            main.len(),
            compiler.symbols.len(),
            compiler.constants.len()
        );

        Ok(CompiledProgram {
            source_name: compiler.source_name,
            symbols: compiler.symbols,
            constants: compiler.constants,
            main: Rc::new(main),
        })
    }

    // --- Emission helpers ---

    pub fn emit(&mut self, opcode: Opcode, arg: u16, flag: u8, line: u32) -> usize {
        self.state
            .def
            .emit(Instruction::new(opcode, arg, flag), line)
    }

    pub fn emit_op(&mut self, opcode: Opcode, line: u32) -> usize {
        self.emit(opcode, 0, 0, line)
    }

    pub fn emit_arg(&mut self, opcode: Opcode, arg: u16, line: u32) -> usize {
        self.emit(opcode, arg, 0, line)
    }

    pub fn current_address(&self) -> usize {
        self.state.def.len()
    }

    /// Line of the most recently emitted instruction.
    pub fn last_line(&self) -> u32 {
        self.state.def.lines.last().copied().unwrap_or(1)
    }

    /// Reserve a jump-target slot whose address is not yet known.
    pub fn new_target(&mut self, pos: Position) -> CompileResult<usize> {
        if self.state.def.jump_targets.len() >= MAX_INDEX {
            return Err(CompileError::too_many("jump targets", MAX_INDEX, pos));
        }
        Ok(self.state.def.reserve_target())
    }

    /// Patch `slot` to the next instruction's address.
    pub fn mark_target(&mut self, slot: usize) {
        let here = self.current_address();
        self.state.def.patch_target(slot, here);
    }

    /// Emit a jump through `slot`.
    pub fn emit_jump(&mut self, opcode: Opcode, slot: usize, keep: bool, line: u32) -> usize {
        self.emit(opcode, slot as u16, keep as u8, line)
    }

    pub fn symbol(&mut self, name: &str, pos: Position) -> CompileResult<u16> {
        if let Some(index) = self.symbols.get_index_of(name) {
            return Ok(index as u16);
        }
        if self.symbols.len() >= MAX_INDEX {
            return Err(CompileError::too_many("symbols", MAX_INDEX, pos));
        }
        let (index, _) = self.symbols.insert_full(Rc::from(name));
        Ok(index as u16)
    }

    /// Add a constant to the pool and return its index. Scalars and strings
    /// are deduplicated.
    pub fn add_constant(&mut self, constant: Constant, pos: Position) -> CompileResult<u16> {
        let key = ConstantKey::of(&constant);
        if let Some(index) = key.as_ref().and_then(|key| self.interned.get(key)) {
            return Ok(*index);
        }
        if self.constants.len() >= MAX_INDEX {
            return Err(CompileError::too_many("constants", MAX_INDEX, pos));
        }
        let index = self.constants.len() as u16;
        self.constants.push(constant);
        if let Some(key) = key {
            self.interned.insert(key, index);
        }
        Ok(index)
    }

    pub fn emit_constant(&mut self, constant: Constant, pos: Position) -> CompileResult<()> {
        let index = self.add_constant(constant, pos)?;
        self.emit_arg(Opcode::LoadConst, index, pos.line);
        Ok(())
    }

    // --- Function compilation ---

    /// Suspend the current function and start compiling a new one.
    pub fn start_function(&mut self, def: FunctionDef, function_type: FunctionType) {
        let fresh = FunctionState::new(def, function_type);
        let outer = std::mem::replace(&mut self.state, fresh);
        self.enclosing.push(outer);
    }

    /// Finish the current function and resume the enclosing one.
    pub fn finish_function(&mut self, end: Position) -> CompileResult<FunctionDef> {
        let def = self.finish_current(end)?;
        if let Some(outer) = self.enclosing.pop() {
            self.state = outer;
        }
        Ok(def)
    }

    fn finish_current(&mut self, end: Position) -> CompileResult<FunctionDef> {
        // Implicit `return null`
        self.emit_constant(Constant::Null, end)?;
        self.emit_op(Opcode::IReturn, end.line);

        let placeholder = FunctionDef::new("", end.line);
        let def = std::mem::replace(&mut self.state.def, placeholder);
        if let Some(index) = def.unresolved_target() {
            return Err(CompileError::UnresolvedJump {
                function: def.name.to_string(),
                index,
                pos: end,
            });
        }
        Ok(def)
    }

    pub fn function_type(&self) -> FunctionType {
        self.state.function_type
    }

    // --- Loop context ---

    pub fn begin_loop(&mut self, continue_slot: usize, exit_slot: usize) {
        self.state.loops.push(LoopContext {
            continue_slot,
            exit_slot,
        });
    }

    pub fn end_loop(&mut self) {
        self.state.loops.pop();
    }

    pub fn innermost_loop(&self) -> Option<LoopContext> {
        self.state.loops.last().copied()
    }
}

/// Look up a required child, reporting a malformed node otherwise.
pub fn child<'a>(node: &Node<'a>, index: usize, what: &str) -> CompileResult<&'a Node<'a>> {
    node.child(index).ok_or_else(|| {
        CompileError::malformed(
            format!("{} node is missing its {}", node.kind.name(), what),
            node.pos,
        )
    })
}

/// The name payload of a node, reporting a malformed node otherwise.
pub fn name_of<'a>(node: &Node<'a>) -> CompileResult<&'a str> {
    node.name().ok_or_else(|| {
        CompileError::malformed(format!("{} node has no name", node.kind.name()), node.pos)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstArena;
    use crate::vm::opcode::Instruction;

    fn opcodes(def: &FunctionDef) -> Vec<Opcode> {
        def.code
            .iter()
            .map(|w| Instruction::decode(*w).expect("valid").opcode)
            .collect()
    }

    #[test]
    fn test_compile_return_sum() {
        let arena = AstArena::new();
        let sum = arena.binary(NodeKind::Add, arena.long(1), arena.long(2));
        let tree = arena.program(&[arena.ret(Some(sum))]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        assert_eq!(
            opcodes(&program.main),
            vec![
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::IAdd,
                Opcode::IReturn,
                Opcode::LoadConst,
                Opcode::IReturn,
            ]
        );
    }

    #[test]
    fn test_constants_and_symbols_are_interned() {
        let arena = AstArena::new();
        let tree = arena.program(&[
            arena.set("x", arena.string("hi")),
            arena.set("x", arena.string("hi")),
        ]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        assert_eq!(program.symbols.len(), 1);
        let strings = program
            .constants
            .iter()
            .filter(|c| matches!(c, Constant::Str(_)))
            .count();
        assert_eq!(strings, 1);
    }

    #[test]
    fn test_root_must_be_program() {
        let arena = AstArena::new();
        let err = Compiler::compile(arena.long(1), "t").unwrap_err();
        assert!(matches!(err, CompileError::Malformed { .. }));
    }

    #[test]
    fn test_every_instruction_has_a_line() {
        let arena = AstArena::new();
        let first = arena.at(1, 1).set("x", arena.long(5));
        let second = arena.at(2, 1).ret(Some(arena.ident("x")));
        let tree = arena.program(&[first, second]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        assert_eq!(program.main.lines.len(), program.main.code.len());
        assert_eq!(program.main.lines[0], 1);
        assert_eq!(program.main.lines[2], 2);
    }

    #[test]
    fn test_constant_pool_shares_equal_scalars() {
        let mut compiler = Compiler::new("t");
        let pos = Position::default();
        let mut add = |c: Constant| compiler.add_constant(c, pos).expect("fits");

        let first: Vec<u16> = (0..1000).map(|n| add(Constant::Long(n))).collect();
        let again: Vec<u16> = (0..1000).map(|n| add(Constant::Long(n))).collect();
        assert_eq!(first, again);
        assert_eq!(first, (0..1000).collect::<Vec<u16>>());

        assert_ne!(add(Constant::Double(0.0)), add(Constant::Double(-0.0)));
        assert_eq!(add(Constant::Double(f64::NAN)), add(Constant::Double(f64::NAN)));
        assert_ne!(add(Constant::Long(1)), add(Constant::Double(1.0)));
        assert_eq!(add(Constant::Str("a".into())), add(Constant::Str("a".into())));

        let def = Rc::new(FunctionDef::new("f", 1));
        assert_ne!(
            add(Constant::Function(def.clone())),
            add(Constant::Function(def))
        );
    }
}
