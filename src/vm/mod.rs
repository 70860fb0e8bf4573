//! Bytecode VM: compiles syntax trees to packed instructions and executes
//! them on a stack machine with a counted, collected heap.

pub mod chunk;
pub mod compiler;
pub mod compiler_classes;
pub mod compiler_exprs;
pub mod compiler_stmts;
pub mod disassembler;
pub mod frame;
mod gc;
pub mod heap;
pub mod natives;
pub mod opcode;
pub mod ops;
pub mod trace;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;
pub mod vm_calls;
pub mod vm_classes;
pub mod vm_exceptions;

pub use chunk::{CompiledProgram, Constant, FunctionDef};
pub use compiler::Compiler;
pub use disassembler::disassemble;
pub use heap::{GcReport, Heap, HeapId};
pub use natives::{NativeContext, NativeFn, OutputBuffer};
pub use opcode::{Instruction, Opcode};
pub use trace::{TraceLog, TraceRecord, TraceSink, WriterTrace};
pub use value::Value;
pub use vm::{execute, ExitStatus, Vm};
