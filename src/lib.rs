//! Marrow: a bytecode compiler and stack VM for a small dynamic language.
//!
//! This is the library root that exports all modules.
//!
//! # Pipeline
//!
//! - **Tree**: a syntax tree built with [`ast::AstArena`] or loaded from a
//!   JSON [`ast::TreeDocument`]
//! - **Compile**: [`compile`] lowers the tree to a [`vm::CompiledProgram`]
//! - **Execute**: [`execute`] runs the program on a fresh [`vm::Vm`]

#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::new_without_default)]
#![allow(clippy::collapsible_else_if)]

pub mod ast;
pub mod config;
pub mod error;
pub mod vm;

use ast::{AstArena, Node, TreeDocument};
use config::VmConfig;
use error::{CompileError, MarrowError};
use vm::{CompiledProgram, Compiler, ExitStatus, Vm};

/// Compile a syntax tree. `source_name` is the file name used in error
/// reports and backtraces.
pub fn compile(tree: &Node<'_>, source_name: &str) -> Result<CompiledProgram, CompileError> {
    Compiler::compile(tree, source_name)
}

/// Decode a JSON tree document and compile it.
pub fn compile_json(text: &str) -> Result<CompiledProgram, MarrowError> {
    let document = TreeDocument::from_json(text)?;
    let arena = AstArena::new();
    let root = document.build(&arena)?;
    Ok(Compiler::compile(root, document.source.as_str())?)
}

/// Run a compiled program on a VM configured from the environment.
pub fn execute(program: &CompiledProgram) -> ExitStatus {
    execute_with_config(program, VmConfig::from_env())
}

pub fn execute_with_config(program: &CompiledProgram, config: VmConfig) -> ExitStatus {
    let mut vm = Vm::with_config(config);
    vm::execute(&mut vm, program)
}

/// Compile and run a JSON tree document, returning the display form of the
/// program's result.
pub fn run_json(text: &str) -> Result<String, MarrowError> {
    let program = compile_json(text)?;
    let mut vm = Vm::with_config(VmConfig::from_env());
    let value = vm.execute(&program)?;
    Ok(vm.display(value))
}
