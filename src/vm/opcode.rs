//! Bytecode opcodes and the packed 32-bit instruction format.
//!
//! An instruction packs into one word: the low 8 bits hold the opcode, the
//! next 16 bits the argument and the top 8 bits a flag. What the argument
//! indexes (constant pool, symbol table, jump-target table or a count)
//! depends on the opcode.

use std::fmt;

use crate::error::InternalError;

/// Operation code of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // --- Constants & names ---
    /// Push a constant. arg: constant index.
    LoadConst,
    /// Push a variable (locals, then globals). arg: symbol.
    LoadName,
    /// Bind the top of the stack to a name. arg: symbol; flag: pop instead of peek.
    StoreName,
    /// Push the current instance.
    LoadSelf,

    // --- Stack manipulation ---
    Pop,
    Dup,
    /// Duplicate the top two values.
    Dup2,
    /// Move the top value down so it sits below the next arg-1 values.
    Rot,

    // --- Arithmetic ---
    IAdd,
    IMinus,
    ITimes,
    IDiv,
    IRem,
    ILshft,
    IRshft,

    // --- Unary ---
    IUnaryMinus,
    IUnaryPlus,
    IUnaryNot,

    // --- Comparison ---
    IEqual,
    INequal,
    ILt,
    IGt,
    ILte,
    IGte,
    /// Membership: `[item, container]` → bool.
    IIn,

    // --- Control flow ---
    /// Unconditional jump. arg: jump-target index.
    Jmp,
    /// Jump if the top is falsy. arg: jump-target index; flag: keep the value.
    Jmpz,
    /// Jump if the top is truthy. arg: jump-target index; flag: keep the value.
    Jmpnz,

    // --- Loop bracketing ---
    /// Enter a loop: record stack height and try depth.
    BeginLoop,
    /// Leave an iteration: reset the stack to the loop's entry height.
    ExitLoopContinue,
    /// Leave the loop: reset and pop the loop block.
    EndLoop,

    // --- Exceptions ---
    /// Push a try block. arg: jump-target index of the handler.
    Try,
    /// Pop the try block after the body completed normally.
    EndTry,
    /// Bind the pending exception's message. arg: symbol.
    SetupCatch,
    /// Raise the top of the stack.
    IThrow,

    // --- Data construction ---
    /// Build an array from the top arg values.
    InitArray,
    /// Build a map from the top arg key/value pairs.
    InitObj,

    // --- Property & index access ---
    /// Read a property. arg: symbol.
    GetProp,
    /// `[object, value]` → set property. arg: symbol; flag: discard the value.
    SetProp,
    /// `[container, index]` → element.
    LoadSubscript,
    /// `[container, index, value]` → set element. flag: discard the value.
    StoreSubscript,

    // --- Calls ---
    /// Call `[callee, args..]`. arg: argument count.
    Call,
    /// Call a method on `[receiver, args..]`. arg: symbol; flag: argument count.
    CallMethod,
    /// Call the base constructor from a constructor. arg: argument count.
    CallSuper,
    /// Return from the current frame.
    IReturn,

    // --- Definitions ---
    /// Bind the function on top of the stack. arg: symbol.
    DefineFunction,
    /// Create a class from `[base?, template]` and bind it. arg: symbol; flag: has base.
    DefineClass,
    /// Bind a registered native module. arg: symbol.
    Import,
}

impl Opcode {
    /// Every opcode, indexed by its byte value.
    pub const ALL: [Opcode; 48] = [
        Opcode::LoadConst,
        Opcode::LoadName,
        Opcode::StoreName,
        Opcode::LoadSelf,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::Dup2,
        Opcode::Rot,
        Opcode::IAdd,
        Opcode::IMinus,
        Opcode::ITimes,
        Opcode::IDiv,
        Opcode::IRem,
        Opcode::ILshft,
        Opcode::IRshft,
        Opcode::IUnaryMinus,
        Opcode::IUnaryPlus,
        Opcode::IUnaryNot,
        Opcode::IEqual,
        Opcode::INequal,
        Opcode::ILt,
        Opcode::IGt,
        Opcode::ILte,
        Opcode::IGte,
        Opcode::IIn,
        Opcode::Jmp,
        Opcode::Jmpz,
        Opcode::Jmpnz,
        Opcode::BeginLoop,
        Opcode::ExitLoopContinue,
        Opcode::EndLoop,
        Opcode::Try,
        Opcode::EndTry,
        Opcode::SetupCatch,
        Opcode::IThrow,
        Opcode::InitArray,
        Opcode::InitObj,
        Opcode::GetProp,
        Opcode::SetProp,
        Opcode::LoadSubscript,
        Opcode::StoreSubscript,
        Opcode::Call,
        Opcode::CallMethod,
        Opcode::CallSuper,
        Opcode::IReturn,
        Opcode::DefineFunction,
        Opcode::DefineClass,
        Opcode::Import,
    ];

    pub fn from_byte(byte: u8) -> Result<Opcode, InternalError> {
        Self::ALL
            .get(byte as usize)
            .copied()
            .ok_or(InternalError::UnknownOpcode(byte))
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::StoreName => "STORE_NAME",
            Opcode::LoadSelf => "LOAD_SELF",
            Opcode::Pop => "POP",
            Opcode::Dup => "DUP",
            Opcode::Dup2 => "DUP2",
            Opcode::Rot => "ROT",
            Opcode::IAdd => "IADD",
            Opcode::IMinus => "IMINUS",
            Opcode::ITimes => "ITIMES",
            Opcode::IDiv => "IDIV",
            Opcode::IRem => "IREM",
            Opcode::ILshft => "ILSHFT",
            Opcode::IRshft => "IRSHFT",
            Opcode::IUnaryMinus => "IUNARYMINUS",
            Opcode::IUnaryPlus => "IUNARYPLUS",
            Opcode::IUnaryNot => "IUNARYNOT",
            Opcode::IEqual => "IEQUAL",
            Opcode::INequal => "INEQUAL",
            Opcode::ILt => "ILT",
            Opcode::IGt => "IGT",
            Opcode::ILte => "ILTE",
            Opcode::IGte => "IGTE",
            Opcode::IIn => "IIN",
            Opcode::Jmp => "JMP",
            Opcode::Jmpz => "JMPZ",
            Opcode::Jmpnz => "JMPNZ",
            Opcode::BeginLoop => "BEGIN_LOOP",
            Opcode::ExitLoopContinue => "EXIT_LOOP_CONTINUE",
            Opcode::EndLoop => "END_LOOP",
            Opcode::Try => "TRY",
            Opcode::EndTry => "END_TRY",
            Opcode::SetupCatch => "SETUP_CATCH",
            Opcode::IThrow => "ITHROW",
            Opcode::InitArray => "INITARRAY",
            Opcode::InitObj => "INITOBJ",
            Opcode::GetProp => "GETPROP",
            Opcode::SetProp => "SETPROP",
            Opcode::LoadSubscript => "LOAD_SUBSCRIPT",
            Opcode::StoreSubscript => "STORE_SUBSCRIPT",
            Opcode::Call => "CALL",
            Opcode::CallMethod => "CALL_METHOD",
            Opcode::CallSuper => "CALL_SUPER",
            Opcode::IReturn => "IRETURN",
            Opcode::DefineFunction => "DEFINE_FUNCTION",
            Opcode::DefineClass => "DEFINE_CLASS",
            Opcode::Import => "IMPORT",
        }
    }

    /// Opcodes whose argument is a jump-target index.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jmp | Opcode::Jmpz | Opcode::Jmpnz | Opcode::Try
        )
    }

    /// Opcodes whose argument is a symbol index.
    pub fn takes_symbol(self) -> bool {
        matches!(
            self,
            Opcode::LoadName
                | Opcode::StoreName
                | Opcode::SetupCatch
                | Opcode::GetProp
                | Opcode::SetProp
                | Opcode::CallMethod
                | Opcode::DefineFunction
                | Opcode::DefineClass
                | Opcode::Import
        )
    }

    /// Opcodes that may allocate heap objects; the collector only runs
    /// before one of these.
    pub fn allocates(self) -> bool {
        matches!(
            self,
            Opcode::IAdd
                | Opcode::SetupCatch
                | Opcode::InitArray
                | Opcode::InitObj
                | Opcode::LoadSubscript
                | Opcode::Call
                | Opcode::CallMethod
                | Opcode::CallSuper
                | Opcode::DefineClass
                | Opcode::Import
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub arg: u16,
    pub flag: u8,
}

impl Instruction {
    pub fn new(opcode: Opcode, arg: u16, flag: u8) -> Self {
        Self { opcode, arg, flag }
    }

    pub fn simple(opcode: Opcode) -> Self {
        Self::new(opcode, 0, 0)
    }

    pub fn with_arg(opcode: Opcode, arg: u16) -> Self {
        Self::new(opcode, arg, 0)
    }

    pub fn encode(self) -> u32 {
        (self.opcode as u32) | ((self.arg as u32) << 8) | ((self.flag as u32) << 24)
    }

    pub fn decode(word: u32) -> Result<Instruction, InternalError> {
        let opcode = Opcode::from_byte((word & 0xff) as u8)?;
        Ok(Instruction {
            opcode,
            arg: ((word >> 8) & 0xffff) as u16,
            flag: (word >> 24) as u8,
        })
    }

    pub fn flagged(self) -> bool {
        self.flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_discriminants() {
        for (byte, opcode) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*opcode as usize, byte);
        }
    }

    #[test]
    fn test_packing_layout() {
        let word = Instruction::new(Opcode::CallMethod, 0x1234, 3).encode();
        assert_eq!(word & 0xff, Opcode::CallMethod as u32);
        assert_eq!((word >> 8) & 0xffff, 0x1234);
        assert_eq!(word >> 24, 3);

        let decoded = Instruction::decode(word).expect("valid word");
        assert_eq!(decoded.opcode, Opcode::CallMethod);
        assert_eq!(decoded.arg, 0x1234);
        assert!(decoded.flagged());
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            Instruction::decode(0xff),
            Err(InternalError::UnknownOpcode(0xff))
        );
    }
}
