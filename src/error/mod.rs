//! Error types for all phases.
//!
//! Compile errors and internal errors abort evaluation. Language-level
//! exceptions ([`Exception`]) travel through the VM's pending-exception slot
//! and can be caught by `try`; only when no handler exists do they surface to
//! the host as [`RuntimeError::Uncaught`].

use std::fmt;

use thiserror::Error;

use crate::ast::{NodeKind, Position};

/// Errors loading a serialized tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Invalid tree document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown node kind '{kind}' at line {line}")]
    UnknownKind { kind: String, line: u32 },

    #[error("Missing or invalid literal for {kind} node at line {line}")]
    BadLiteral { kind: String, line: u32 },
}

impl TreeError {
    pub fn unknown_kind(kind: impl Into<String>, line: u32) -> Self {
        Self::UnknownKind {
            kind: kind.into(),
            line,
        }
    }

    pub fn bad_literal(kind: impl Into<String>, line: u32) -> Self {
        Self::BadLiteral {
            kind: kind.into(),
            line,
        }
    }
}

/// Bytecode compilation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Unsupported {kind} node at {pos}")]
    Unsupported { kind: &'static str, pos: Position },

    #[error("{message} at {pos}")]
    Malformed { message: String, pos: Position },

    #[error("'{keyword}' outside of a loop at {pos}")]
    LoopControlOutsideLoop { keyword: &'static str, pos: Position },

    #[error("Too many {what} (limit {limit}) at {pos}")]
    TooMany {
        what: &'static str,
        limit: usize,
        pos: Position,
    },

    #[error("Unresolved jump target {index} in '{function}' at {pos}")]
    UnresolvedJump {
        function: String,
        index: usize,
        pos: Position,
    },
}

impl CompileError {
    pub fn unsupported(kind: NodeKind, pos: Position) -> Self {
        Self::Unsupported {
            kind: kind.name(),
            pos,
        }
    }

    pub fn malformed(message: impl Into<String>, pos: Position) -> Self {
        Self::Malformed {
            message: message.into(),
            pos,
        }
    }

    pub fn outside_loop(keyword: &'static str, pos: Position) -> Self {
        Self::LoopControlOutsideLoop { keyword, pos }
    }

    pub fn too_many(what: &'static str, limit: usize, pos: Position) -> Self {
        Self::TooMany { what, limit, pos }
    }

    pub fn pos(&self) -> Position {
        match self {
            Self::Unsupported { pos, .. } => *pos,
            Self::Malformed { pos, .. } => *pos,
            Self::LoopControlOutsideLoop { pos, .. } => *pos,
            Self::TooMany { pos, .. } => *pos,
            Self::UnresolvedJump { pos, .. } => *pos,
        }
    }

    pub fn line(&self) -> u32 {
        self.pos().line
    }

    pub fn column(&self) -> u32 {
        self.pos().column
    }
}

/// The type tag of a language-level exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Raised by `throw`.
    Exception,
    ArgumentError,
    TypeError,
    KeyError,
    NameError,
    RuntimeError,
    InvalidOperation,
}

impl ExceptionKind {
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::Exception => "Exception",
            ExceptionKind::ArgumentError => "ArgumentError",
            ExceptionKind::TypeError => "TypeError",
            ExceptionKind::KeyError => "KeyError",
            ExceptionKind::NameError => "NameError",
            ExceptionKind::RuntimeError => "RuntimeError",
            ExceptionKind::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pending language-level exception: a (type, message) pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Exception {
    pub kind: ExceptionKind,
    pub message: String,
}

impl Exception {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn thrown(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Exception, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::ArgumentError, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::TypeError, message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::KeyError, message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::NameError, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::RuntimeError, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::InvalidOperation, message)
    }

    pub fn wrong_arity(name: &str, expected: usize, got: usize) -> Self {
        Self::argument(format!(
            "{}() expects {} argument{}, got {}",
            name,
            expected,
            if expected == 1 { "" } else { "s" },
            got
        ))
    }
}

/// Violations of the VM's own invariants. Never catchable by `try`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("dangling heap handle #{index} (generation {generation})")]
    DanglingHandle { index: u32, generation: u32 },

    #[error("invalid operand {arg} for {opcode}")]
    BadOperand { opcode: &'static str, arg: u16 },

    #[error("no active frame")]
    NoFrame,

    #[error("{0}")]
    Corrupt(String),
}

impl InternalError {
    pub fn bad_operand(opcode: &'static str, arg: u16) -> Self {
        Self::BadOperand { opcode, arg }
    }
}

/// Outcome of a faulting operation inside the VM.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// A catchable language exception.
    Throw(Exception),
    /// An internal invariant violation; aborts evaluation.
    Fatal(InternalError),
}

impl From<Exception> for Fault {
    fn from(err: Exception) -> Self {
        Fault::Throw(err)
    }
}

impl From<InternalError> for Fault {
    fn from(err: InternalError) -> Self {
        Fault::Fatal(err)
    }
}

/// Result type for VM operations.
pub type OpResult<T> = Result<T, Fault>;

/// One line of a backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceEntry {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// An exception that reached the top of the call stack without a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtException {
    pub kind: ExceptionKind,
    pub message: String,
    pub file: String,
    pub line: u32,
    /// Innermost frame first; the module frame is not listed.
    pub backtrace: Vec<BacktraceEntry>,
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} in {}:{}",
            self.kind, self.message, self.file, self.line
        )?;
        for entry in &self.backtrace {
            write!(f, "\n  at {} ({}:{})", entry.function, entry.file, entry.line)?;
        }
        Ok(())
    }
}

/// Errors surfaced by [`crate::vm::Vm::execute`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Uncaught(UncaughtException),

    #[error("internal error: {error} in {file}:{line}")]
    Internal {
        error: InternalError,
        file: String,
        line: u32,
    },
}

impl RuntimeError {
    /// The exception type, for uncaught language exceptions.
    pub fn kind(&self) -> Option<ExceptionKind> {
        match self {
            Self::Uncaught(uncaught) => Some(uncaught.kind),
            Self::Internal { .. } => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Uncaught(uncaught) => uncaught.message.clone(),
            Self::Internal { error, .. } => error.to_string(),
        }
    }
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum MarrowError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
