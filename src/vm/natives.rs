//! Native functions: the calling contract, the builtins and native modules.
//!
//! A native receives its arguments packed into a single array on the heap
//! and returns a value, a language exception or an internal fault.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use crate::error::{Exception, InternalError, OpResult};

use super::heap::{Heap, HeapId};
use super::ops;
use super::value::{HeapData, Value};

/// A native returns its result, a language exception (`Fault::Throw`) or an
/// internal error (`Fault::Fatal`), which aborts the run.
pub type NativeFn = fn(&mut NativeContext<'_>, HeapId) -> OpResult<Value>;

/// What a native can reach while it runs.
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub output: &'a mut dyn Write,
    pub input: &'a mut dyn BufRead,
}

impl NativeContext<'_> {
    /// The packed argument list.
    pub fn args(&self, args: HeapId) -> OpResult<Vec<Value>> {
        match self.heap.data(args)? {
            HeapData::Array(items) => Ok(items.clone()),
            _ => Err(InternalError::Corrupt("native arguments must be an array".into()).into()),
        }
    }

    /// The argument list, checked against an exact count.
    pub fn expect_args(&self, name: &str, args: HeapId, count: usize) -> OpResult<Vec<Value>> {
        let values = self.args(args)?;
        if values.len() != count {
            return Err(Exception::wrong_arity(name, count, values.len()).into());
        }
        Ok(values)
    }

    pub fn stringify(&self, value: Value) -> OpResult<String> {
        ops::stringify(self.heap, value)
    }

    pub fn type_name(&self, value: Value) -> OpResult<&'static str> {
        ops::type_name(self.heap, value)
    }

    pub fn alloc_str(&mut self, text: &str) -> Value {
        self.heap.alloc_str(text)
    }

    pub fn number(&self, name: &str, value: Value) -> OpResult<f64> {
        match value {
            Value::Long(n) => Ok(n as f64),
            Value::Double(d) => Ok(d),
            other => Err(Exception::type_error(format!(
                "{}() expects a number, got '{}'",
                name,
                self.type_name(other)?
            ))
            .into()),
        }
    }
}

/// Global functions installed in every VM.
pub const BUILTINS: &[(&str, NativeFn)] = &[
    ("print", native_print),
    ("readline", native_readline),
    ("str", native_str),
    ("len", native_len),
    ("type", native_type),
];

/// The `math` module, available through `import math`.
pub const MATH_MODULE: &[(&str, NativeFn)] = &[
    ("sqrt", math_sqrt),
    ("floor", math_floor),
    ("abs", math_abs),
];

fn io_error(err: io::Error) -> Exception {
    Exception::runtime(format!("I/O error: {}", err))
}

fn native_print(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let mut line = String::new();
    for (i, value) in ctx.args(args)?.into_iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&ctx.stringify(value)?);
    }
    writeln!(ctx.output, "{}", line).map_err(io_error)?;
    Ok(Value::Null)
}

fn native_readline(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    ctx.expect_args("readline", args, 0)?;
    let mut line = String::new();
    if ctx.input.read_line(&mut line).map_err(io_error)? == 0 {
        return Ok(Value::Null);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(ctx.alloc_str(trimmed))
}

fn native_str(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let values = ctx.expect_args("str", args, 1)?;
    let text = ctx.stringify(values[0])?;
    Ok(ctx.alloc_str(&text))
}

fn native_len(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let values = ctx.expect_args("len", args, 1)?;
    let len = match values[0] {
        Value::Ref(id) => match ctx.heap.data(id)? {
            HeapData::Str(s) => Some(s.len()),
            HeapData::Array(items) => Some(items.len()),
            HeapData::Map(map) => Some(map.len()),
            _ => None,
        },
        _ => None,
    };
    match len {
        Some(len) => Ok(Value::Long(len as i64)),
        None => Err(Exception::type_error(format!(
            "object of type '{}' has no len()",
            ctx.type_name(values[0])?
        ))
        .into()),
    }
}

fn native_type(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let values = ctx.expect_args("type", args, 1)?;
    let name = ctx.type_name(values[0])?;
    Ok(ctx.alloc_str(name))
}

fn math_sqrt(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let values = ctx.expect_args("sqrt", args, 1)?;
    Ok(Value::Double(ctx.number("sqrt", values[0])?.sqrt()))
}

fn math_floor(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let values = ctx.expect_args("floor", args, 1)?;
    match values[0] {
        Value::Long(n) => Ok(Value::Long(n)),
        other => Ok(Value::Double(ctx.number("floor", other)?.floor())),
    }
}

fn math_abs(ctx: &mut NativeContext<'_>, args: HeapId) -> OpResult<Value> {
    let values = ctx.expect_args("abs", args, 1)?;
    match values[0] {
        Value::Long(n) => n
            .checked_abs()
            .map(Value::Long)
            .ok_or_else(|| Exception::runtime("integer overflow").into()),
        other => Ok(Value::Double(ctx.number("abs", other)?.abs())),
    }
}

/// A cloneable in-memory writer, for capturing program output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Rc<RefCell<Vec<u8>>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
