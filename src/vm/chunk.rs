//! Compiled code: function definitions, constants and whole programs.

use std::rc::Rc;

use indexmap::IndexSet;

use super::opcode::Instruction;
use crate::error::InternalError;

/// Placeholder stored in a jump-target slot until it is patched.
pub const UNPATCHED: u32 = u32::MAX;

/// Name of the method run when a class is instantiated.
pub const CONSTRUCTOR_NAME: &str = "constructor";

/// A constant value stored in a program's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(Rc<str>),
    /// A compiled function body.
    Function(Rc<FunctionDef>),
    /// The methods of a class, turned into a class object by `DEFINE_CLASS`.
    Class(Rc<ClassTemplate>),
}

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: Rc<str>,
    /// Collects the remaining arguments into an array.
    pub rest: bool,
}

/// A compiled function (or the top-level program body).
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Rc<str>,
    pub params: Vec<Param>,
    /// Packed instructions.
    pub code: Vec<u32>,
    /// Instruction addresses referenced by jump arguments.
    pub jump_targets: Vec<u32>,
    /// Source line of each instruction, parallel to `code`.
    pub lines: Vec<u32>,
    /// Line of the definition itself.
    pub line: u32,
    /// Defined inside a class body; needs an instance to run.
    pub is_method: bool,
    pub is_constructor: bool,
}

impl FunctionDef {
    pub fn new(name: impl Into<Rc<str>>, line: u32) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            code: Vec::new(),
            jump_targets: Vec::new(),
            lines: Vec::new(),
            line,
            is_method: false,
            is_constructor: false,
        }
    }

    /// Append an instruction and record its source line. Returns its address.
    pub fn emit(&mut self, instruction: Instruction, line: u32) -> usize {
        let address = self.code.len();
        self.code.push(instruction.encode());
        self.lines.push(line);
        address
    }

    /// Reserve an unpatched jump-target slot.
    pub fn reserve_target(&mut self) -> usize {
        self.jump_targets.push(UNPATCHED);
        self.jump_targets.len() - 1
    }

    /// Point a reserved slot at `address`.
    pub fn patch_target(&mut self, slot: usize, address: usize) {
        self.jump_targets[slot] = address as u32;
    }

    /// The first unpatched slot, if any.
    pub fn unresolved_target(&self) -> Option<usize> {
        self.jump_targets.iter().position(|t| *t == UNPATCHED)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn instruction(&self, address: usize) -> Result<Instruction, InternalError> {
        let word = self
            .code
            .get(address)
            .copied()
            .ok_or_else(|| InternalError::Corrupt(format!("pc {} outside '{}'", address, self.name)))?;
        Instruction::decode(word)
    }

    pub fn target(&self, slot: u16) -> Result<usize, InternalError> {
        match self.jump_targets.get(slot as usize) {
            Some(&address) if address != UNPATCHED => Ok(address as usize),
            _ => Err(InternalError::bad_operand("jump", slot)),
        }
    }

    pub fn line_at(&self, address: usize) -> u32 {
        self.lines
            .get(address)
            .or_else(|| self.lines.last())
            .copied()
            .unwrap_or(self.line)
    }

    pub fn has_rest(&self) -> bool {
        self.params.last().is_some_and(|p| p.rest)
    }

    /// Number of arguments that must be supplied.
    pub fn required_params(&self) -> usize {
        if self.has_rest() {
            self.params.len() - 1
        } else {
            self.params.len()
        }
    }

    pub fn accepts(&self, argc: usize) -> bool {
        if self.has_rest() {
            argc >= self.required_params()
        } else {
            argc == self.params.len()
        }
    }
}

/// The compiled methods of a class.
#[derive(Debug, Clone)]
pub struct ClassTemplate {
    pub name: Rc<str>,
    pub methods: Vec<Rc<FunctionDef>>,
}

/// A compiled program: the top-level body plus the symbol and constant
/// tables its instructions index into.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    /// File name used in error reports.
    pub source_name: String,
    pub symbols: IndexSet<Rc<str>, ahash::RandomState>,
    pub constants: Vec<Constant>,
    pub main: Rc<FunctionDef>,
}

impl CompiledProgram {
    pub fn symbol(&self, index: u16) -> Option<&Rc<str>> {
        self.symbols.get_index(index as usize)
    }

    /// Every function in the program, the main body first.
    pub fn functions(&self) -> Vec<Rc<FunctionDef>> {
        let mut out = vec![self.main.clone()];
        for constant in &self.constants {
            match constant {
                Constant::Function(def) => out.push(def.clone()),
                Constant::Class(template) => out.extend(template.methods.iter().cloned()),
                _ => {}
            }
        }
        out
    }
}
