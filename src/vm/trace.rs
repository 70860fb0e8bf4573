//! Instruction tracing.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Receives one record per instruction, just before it executes.
pub trait TraceSink {
    fn instruction(&mut self, address: usize, opcode: &'static str, arg: u16);
}

/// Writes `0004 LOAD_NAME 2` lines.
pub struct WriterTrace<W: Write> {
    writer: W,
}

impl<W: Write> WriterTrace<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> TraceSink for WriterTrace<W> {
    fn instruction(&mut self, address: usize, opcode: &'static str, arg: u16) {
        // A failing trace writer must not change execution.
        let _ = writeln!(self.writer, "{:04} {} {}", address, opcode, arg);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub address: usize,
    pub opcode: &'static str,
    pub arg: u16,
}

/// Collects records in memory; clone it before handing it to the VM to
/// read them back afterwards.
#[derive(Debug, Clone, Default)]
pub struct TraceLog(Rc<RefCell<Vec<TraceRecord>>>);

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.0.borrow().clone()
    }
}

impl TraceSink for TraceLog {
    fn instruction(&mut self, address: usize, opcode: &'static str, arg: u16) {
        self.0.borrow_mut().push(TraceRecord {
            address,
            opcode,
            arg,
        });
    }
}
