//! Bytecode disassembler for debug output.

use std::fmt::Write;

use super::chunk::{CompiledProgram, Constant, FunctionDef};
use super::opcode::{Instruction, Opcode};

/// Disassemble every function of a program, the main body first.
pub fn disassemble(program: &CompiledProgram) -> String {
    let mut out = String::new();
    for (i, def) in program.functions().iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        disassemble_function(program, def, &mut out);
    }
    out
}

fn disassemble_function(program: &CompiledProgram, def: &FunctionDef, out: &mut String) {
    let rest = if def.has_rest() { "+" } else { "" };
    let _ = writeln!(
        out,
        "== {} (arity={}{}) ==",
        def.name,
        def.required_params(),
        rest
    );
    for (address, word) in def.code.iter().enumerate() {
        let line = def.line_at(address);
        let line_str = if address > 0 && def.line_at(address - 1) == line {
            "   |".to_string()
        } else {
            format!("{:4}", line)
        };
        let _ = write!(out, "{:04} {} ", address, line_str);
        match Instruction::decode(*word) {
            Ok(instruction) => disassemble_instruction(program, def, instruction, out),
            Err(_) => {
                let _ = write!(out, "<bad instruction {:#010x}>", word);
            }
        }
        out.push('\n');
    }
}

fn disassemble_instruction(
    program: &CompiledProgram,
    def: &FunctionDef,
    instruction: Instruction,
    out: &mut String,
) {
    let Instruction { opcode, arg, flag } = instruction;
    let name = opcode.name();
    if opcode == Opcode::LoadConst {
        let constant = program.constants.get(arg as usize);
        let _ = write!(out, "{:<18} {:>5} ({})", name, arg, format_constant(constant));
    } else if opcode == Opcode::CallMethod {
        let _ = write!(out, "{:<18} {:>5} ({}/{})", name, arg, symbol(program, arg), flag);
    } else if opcode.takes_symbol() {
        let _ = write!(out, "{:<18} {:>5} ({})", name, arg, symbol(program, arg));
    } else if opcode.is_jump() {
        let target = def
            .target(arg)
            .map(|t| format!("-> {:04}", t))
            .unwrap_or_else(|_| "-> ????".to_string());
        let _ = write!(out, "{:<18} {:>5} ({})", name, arg, target);
    } else if arg != 0 {
        let _ = write!(out, "{:<18} {:>5}", name, arg);
    } else {
        out.push_str(name);
    }
    if flag != 0 && opcode != Opcode::CallMethod {
        out.push_str(" *");
    }
}

fn symbol(program: &CompiledProgram, index: u16) -> String {
    match program.symbol(index) {
        Some(name) => name.to_string(),
        None => format!("?{}", index),
    }
}

fn format_constant(constant: Option<&Constant>) -> String {
    match constant {
        Some(Constant::Null) => "null".to_string(),
        Some(Constant::Bool(b)) => b.to_string(),
        Some(Constant::Long(n)) => n.to_string(),
        Some(Constant::Double(d)) => format!("{:?}", d),
        Some(Constant::Str(s)) => format!("{:?}", s),
        Some(Constant::Function(f)) => format!("<fn {}>", f.name),
        Some(Constant::Class(c)) => format!("<class {}>", c.name),
        None => "???".to_string(),
    }
}
