//! The bytecode virtual machine: a stack-based fetch/decode/execute loop.
//!
//! Language calls never recurse on the native stack. Handlers return a
//! [`Flow`] and [`Vm::run`] pushes or pops frames accordingly.

use std::io::{self, BufRead, BufReader, Write};
use std::rc::Rc;

use crate::config::VmConfig;
use crate::error::{Exception, Fault, InternalError, OpResult, RuntimeError};

use super::chunk::{CompiledProgram, Constant};
use super::frame::{Frame, FrameKind, LoopBlock, TryBlock};
use super::heap::{GcReport, Heap};
use super::natives::{NativeFn, BUILTINS, MATH_MODULE};
use super::opcode::{Instruction, Opcode};
use super::ops::{self, BinaryOp, Compare};
use super::trace::TraceSink;
use super::value::{
    ClassObject, FunctionObject, HeapData, MapKey, Members, NativeFunction, Value, ValueMap,
};

/// A program loaded into the VM: its symbols and its materialized
/// constants, pinned for the lifetime of the VM.
#[derive(Debug)]
pub struct LoadedUnit {
    pub source_name: Rc<str>,
    pub symbols: Vec<Rc<str>>,
    pub constants: Vec<Value>,
}

/// How a run ended, as a process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    UncaughtException,
    InternalError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::UncaughtException => 1,
            ExitStatus::InternalError => 70,
        }
    }
}

impl<T> From<&Result<T, RuntimeError>> for ExitStatus {
    fn from(result: &Result<T, RuntimeError>) -> Self {
        match result {
            Ok(_) => ExitStatus::Success,
            Err(RuntimeError::Uncaught(_)) => ExitStatus::UncaughtException,
            Err(RuntimeError::Internal { .. }) => ExitStatus::InternalError,
        }
    }
}

/// What the driver does after an instruction.
#[derive(Debug)]
pub enum Flow {
    Next,
    /// Push a new activation.
    Call(Frame),
    /// Pop the current activation, handing the value to its caller.
    Return(Value),
}

/// The bytecode VM.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) heap: Heap,
    pub(crate) frames: Vec<Frame>,
    pub(crate) globals: Members,
    pub(crate) modules: Members,
    pub(crate) units: Vec<LoadedUnit>,
    /// The exception being handled, between unwinding and `SETUP_CATCH`.
    pub(crate) pending: Option<Exception>,
    pub(crate) tracer: Option<Box<dyn TraceSink>>,
    pub(crate) output: Box<dyn Write>,
    pub(crate) input: Box<dyn BufRead>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Self {
            heap: Heap::new(config.gc_threshold),
            frames: Vec::with_capacity(64),
            globals: Members::default(),
            modules: Members::default(),
            units: Vec::new(),
            pending: None,
            tracer: None,
            output: Box::new(io::stdout()),
            input: Box::new(BufReader::new(io::stdin())),
            config,
        };
        for (name, func) in BUILTINS {
            vm.register_native(name, *func);
        }
        vm.register_module("math", MATH_MODULE);
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub fn set_input(&mut self, input: Box<dyn BufRead>) {
        self.input = input;
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn TraceSink>) {
        self.tracer = Some(tracer);
    }

    fn native_value(&mut self, name: &str, func: NativeFn) -> Value {
        let native = NativeFunction {
            name: Rc::from(name),
            func,
        };
        Value::Ref(self.heap.alloc(HeapData::Function(FunctionObject::Native(native))))
    }

    /// Bind a native function as a global.
    pub fn register_native(&mut self, name: &str, func: NativeFn) {
        let value = self.native_value(name, func);
        // A fresh object with no children cannot fail to count.
        let _ = self.heap.inc_ref(value);
        if let Some(old) = self.globals.insert(Rc::from(name), value) {
            let _ = self.heap.dec_ref(old);
        }
    }

    /// Register a module of natives that programs can `import`.
    pub fn register_module(&mut self, name: &str, functions: &[(&str, NativeFn)]) {
        let mut map = ValueMap::default();
        for (function_name, func) in functions {
            let value = self.native_value(function_name, *func);
            map.insert(MapKey::Str(Rc::from(*function_name)), value);
        }
        let module = Value::Ref(self.heap.alloc(HeapData::Map(map)));
        let _ = self.heap.inc_ref(module);
        if let Some(old) = self.modules.insert(Rc::from(name), module) {
            let _ = self.heap.dec_ref(old);
        }
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    /// Display form of a value, as `print` would show it.
    pub fn display(&self, value: Value) -> String {
        ops::stringify(&self.heap, value).unwrap_or_else(|_| "<invalid>".to_string())
    }

    /// Load a program and run its top-level body to completion.
    ///
    /// The returned value is not pinned and stays valid until the next
    /// collection.
    pub fn execute(&mut self, program: &CompiledProgram) -> Result<Value, RuntimeError> {
        let unit = self.load(program).map_err(|error| RuntimeError::Internal {
            error,
            file: program.source_name.clone(),
            line: program.main.line,
        })?;
        self.frames.clear();
        self.pending = None;
        self.frames
            .push(Frame::new(program.main.clone(), unit, FrameKind::Module));
        tracing::trace!("running '{}' as unit {}", program.source_name, unit);
        self.run()
    }

    /// Materialize a program's constants as pinned heap values.
    pub(crate) fn load(&mut self, program: &CompiledProgram) -> Result<usize, InternalError> {
        let unit = self.units.len();
        let mut constants = Vec::with_capacity(program.constants.len());
        for constant in &program.constants {
            let value = match constant {
                Constant::Null => Value::Null,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Long(n) => Value::Long(*n),
                Constant::Double(d) => Value::Double(*d),
                Constant::Str(s) => self.heap.alloc_str(s),
                Constant::Function(def) => Value::Ref(self.heap.alloc(HeapData::Function(
                    FunctionObject::Lang {
                        def: def.clone(),
                        unit,
                    },
                ))),
                Constant::Class(template) => {
                    let mut members = Members::default();
                    for method in &template.methods {
                        let function = FunctionObject::Lang {
                            def: method.clone(),
                            unit,
                        };
                        let value = Value::Ref(self.heap.alloc(HeapData::Function(function)));
                        members.insert(method.name.clone(), value);
                    }
                    Value::Ref(self.heap.alloc(HeapData::Class(ClassObject {
                        name: template.name.clone(),
                        base: None,
                        members,
                    })))
                }
            };
            self.heap.inc_ref(value)?;
            constants.push(value);
        }
        self.units.push(LoadedUnit {
            source_name: Rc::from(program.source_name.as_str()),
            symbols: program.symbols.iter().cloned().collect(),
            constants,
        });
        Ok(unit)
    }

    /// The driver loop.
    fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let flow = match self.step() {
                Ok(flow) => flow,
                Err(Fault::Throw(exception)) => {
                    self.unwind(exception)?;
                    continue;
                }
                Err(Fault::Fatal(error)) => return Err(self.abort(error)),
            };
            match flow {
                Flow::Next => {}
                Flow::Call(frame) => self.push_frame(frame),
                Flow::Return(value) => {
                    let frame = self.pop_frame().map_err(|error| self.abort(error))?;
                    match self.frames.last_mut() {
                        None => return Ok(value),
                        Some(caller) if !frame.discard_result => caller.push(value),
                        Some(_) => {}
                    }
                }
            }
        }
    }

    /// Turn an internal error into the run's result, dropping all frames.
    pub(crate) fn abort(&mut self, error: InternalError) -> RuntimeError {
        let (file, line) = self.location();
        tracing::error!("internal error in {}:{}: {}", file, line, error);
        while let Some(frame) = self.frames.pop() {
            for value in frame.locals.values() {
                // The heap may be what failed; release what still counts.
                let _ = self.heap.dec_ref(*value);
            }
        }
        self.pending = None;
        RuntimeError::Internal { error, file, line }
    }

    /// File and line of the instruction being executed.
    pub(crate) fn location(&self) -> (String, u32) {
        match self.frames.last() {
            Some(frame) => (self.source_name(frame.unit), frame.line()),
            None => (String::from("<unknown>"), 0),
        }
    }

    pub(crate) fn source_name(&self, unit: usize) -> String {
        self.units
            .get(unit)
            .map(|u| u.source_name.to_string())
            .unwrap_or_default()
    }

    pub(crate) fn push_frame(&mut self, frame: Frame) {
        tracing::trace!("enter '{}' (depth {})", frame.def.name, self.frames.len() + 1);
        self.frames.push(frame);
    }

    /// Pop the current frame and release its locals.
    pub(crate) fn pop_frame(&mut self) -> Result<Frame, InternalError> {
        let frame = self.frames.pop().ok_or(InternalError::NoFrame)?;
        for value in frame.locals.values() {
            self.heap.dec_ref(*value)?;
        }
        tracing::trace!("leave '{}' (depth {})", frame.def.name, self.frames.len());
        Ok(frame)
    }

    /// Fetch, decode and execute one instruction.
    pub(crate) fn step(&mut self) -> OpResult<Flow> {
        let frame = self.frames.last_mut().ok_or(InternalError::NoFrame)?;
        let address = frame.pc;
        let instruction = frame.def.instruction(address)?;
        frame.pc += 1;

        if let Some(tracer) = self.tracer.as_mut() {
            tracer.instruction(address, instruction.opcode.name(), instruction.arg);
        }
        if instruction.opcode.allocates() && (self.config.gc_stress || self.heap.should_collect())
        {
            self.collect_garbage()?;
        }
        self.dispatch(instruction)
    }

    // --- Frame access ---

    pub(crate) fn current(&mut self) -> Result<&mut Frame, InternalError> {
        self.frames.last_mut().ok_or(InternalError::NoFrame)
    }

    pub(crate) fn pop(&mut self) -> Result<Value, InternalError> {
        self.current()?.pop()
    }

    pub(crate) fn push(&mut self, value: Value) -> Result<(), InternalError> {
        self.current()?.push(value);
        Ok(())
    }

    fn peek(&mut self, depth: usize) -> Result<Value, InternalError> {
        self.current()?.peek(depth)
    }

    fn unit(&self) -> Result<&LoadedUnit, InternalError> {
        let frame = self.frames.last().ok_or(InternalError::NoFrame)?;
        self.units
            .get(frame.unit)
            .ok_or_else(|| InternalError::Corrupt(format!("unit {} not loaded", frame.unit)))
    }

    pub(crate) fn symbol(&self, arg: u16) -> Result<Rc<str>, InternalError> {
        self.unit()?
            .symbols
            .get(arg as usize)
            .cloned()
            .ok_or_else(|| InternalError::bad_operand("symbol", arg))
    }

    fn constant(&self, arg: u16) -> Result<Value, InternalError> {
        self.unit()?
            .constants
            .get(arg as usize)
            .copied()
            .ok_or_else(|| InternalError::bad_operand("LOAD_CONST", arg))
    }

    fn jump(&mut self, arg: u16) -> Result<(), InternalError> {
        let frame = self.current()?;
        frame.pc = frame.def.target(arg)?;
        Ok(())
    }

    // --- Names ---

    fn load_name(&mut self, name: &str) -> OpResult<Value> {
        let frame = self.current()?;
        if let Some(value) = frame.locals.get(name) {
            return Ok(*value);
        }
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| Exception::name_error(format!("name '{}' is not defined", name)).into())
    }

    /// Bind a name: the module frame writes globals, any other frame its
    /// locals. The new value is counted before the old one is released.
    pub(crate) fn bind_name(&mut self, name: Rc<str>, value: Value) -> Result<(), InternalError> {
        self.heap.inc_ref(value)?;
        let frame = self.frames.last_mut().ok_or(InternalError::NoFrame)?;
        let old = if frame.is_module() {
            self.globals.insert(name, value)
        } else {
            frame.locals.insert(name, value)
        };
        if let Some(old) = old {
            self.heap.dec_ref(old)?;
        }
        Ok(())
    }

    // --- Dispatch ---

    fn dispatch(&mut self, instruction: Instruction) -> OpResult<Flow> {
        let Instruction { opcode, arg, flag } = instruction;
        match opcode {
            Opcode::LoadConst => {
                let value = self.constant(arg)?;
                self.push(value)?;
            }
            Opcode::LoadName => {
                let name = self.symbol(arg)?;
                let value = self.load_name(&name)?;
                self.push(value)?;
            }
            Opcode::StoreName => {
                let name = self.symbol(arg)?;
                let value = if flag != 0 { self.pop()? } else { self.peek(0)? };
                self.bind_name(name, value)?;
            }
            Opcode::LoadSelf => {
                let value = self
                    .current()?
                    .self_value
                    .ok_or_else(|| Exception::name_error("'self' is not bound"))?;
                self.push(value)?;
            }

            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let value = self.peek(0)?;
                self.push(value)?;
            }
            Opcode::Dup2 => {
                let below = self.peek(1)?;
                let top = self.peek(0)?;
                self.push(below)?;
                self.push(top)?;
            }
            Opcode::Rot => {
                let frame = self.current()?;
                let value = frame.pop()?;
                let depth = (arg as usize).saturating_sub(1);
                let at = frame
                    .stack
                    .len()
                    .checked_sub(depth)
                    .ok_or(InternalError::StackUnderflow)?;
                frame.stack.insert(at, value);
            }

            Opcode::IAdd => self.binary(BinaryOp::Add)?,
            Opcode::IMinus => self.binary(BinaryOp::Sub)?,
            Opcode::ITimes => self.binary(BinaryOp::Mul)?,
            Opcode::IDiv => self.binary(BinaryOp::Div)?,
            Opcode::IRem => self.binary(BinaryOp::Rem)?,
            Opcode::ILshft => self.binary(BinaryOp::Shl)?,
            Opcode::IRshft => self.binary(BinaryOp::Shr)?,

            Opcode::IUnaryMinus => {
                let value = self.pop()?;
                let result = ops::negate(&self.heap, value)?;
                self.push(result)?;
            }
            Opcode::IUnaryPlus => {
                let value = self.pop()?;
                let result = ops::unary_plus(&self.heap, value)?;
                self.push(result)?;
            }
            Opcode::IUnaryNot => {
                let value = self.pop()?;
                let result = !ops::truthy(&self.heap, value)?;
                self.push(Value::Bool(result))?;
            }

            Opcode::IEqual | Opcode::INequal => {
                let r = self.pop()?;
                let l = self.pop()?;
                let equal = ops::equal(&self.heap, l, r)?;
                self.push(Value::Bool(equal == (opcode == Opcode::IEqual)))?;
            }
            Opcode::ILt => self.compare(Compare::Lt)?,
            Opcode::IGt => self.compare(Compare::Gt)?,
            Opcode::ILte => self.compare(Compare::Lte)?,
            Opcode::IGte => self.compare(Compare::Gte)?,
            Opcode::IIn => {
                let container = self.pop()?;
                let item = self.pop()?;
                let found = ops::contains(&self.heap, item, container)?;
                self.push(Value::Bool(found))?;
            }

            Opcode::Jmp => self.jump(arg)?,
            Opcode::Jmpz | Opcode::Jmpnz => {
                let cond = if flag != 0 { self.peek(0)? } else { self.pop()? };
                if ops::truthy(&self.heap, cond)? == (opcode == Opcode::Jmpnz) {
                    self.jump(arg)?;
                }
            }

            Opcode::BeginLoop => {
                let frame = self.current()?;
                let block = LoopBlock {
                    height: frame.stack.len(),
                    try_depth: frame.try_blocks.len(),
                };
                frame.loop_blocks.push(block);
            }
            Opcode::ExitLoopContinue | Opcode::EndLoop => {
                let frame = self.current()?;
                let block = *frame
                    .loop_blocks
                    .last()
                    .ok_or_else(|| InternalError::Corrupt("no loop block to exit".into()))?;
                frame.stack.truncate(block.height);
                frame.try_blocks.truncate(block.try_depth);
                if opcode == Opcode::EndLoop {
                    frame.loop_blocks.pop();
                }
            }

            Opcode::Try => {
                let frame = self.current()?;
                let block = TryBlock {
                    catch_pc: frame.def.target(arg)?,
                    height: frame.stack.len(),
                    loop_depth: frame.loop_blocks.len(),
                };
                frame.try_blocks.push(block);
            }
            Opcode::EndTry => {
                self.current()?
                    .try_blocks
                    .pop()
                    .ok_or_else(|| InternalError::Corrupt("END_TRY without a try block".into()))?;
            }
            Opcode::SetupCatch => {
                let exception = self
                    .pending
                    .take()
                    .ok_or_else(|| InternalError::Corrupt("catch without an exception".into()))?;
                let name = self.symbol(arg)?;
                let message = self.heap.alloc_str(&exception.message);
                self.bind_name(name, message)?;
            }
            Opcode::IThrow => {
                let value = self.pop()?;
                let message = ops::stringify(&self.heap, value)?;
                return Err(Exception::thrown(message).into());
            }

            Opcode::InitArray => {
                let items = self.current()?.pop_n(arg as usize)?;
                let array = self.heap.alloc_array(items);
                self.push(array)?;
            }
            Opcode::InitObj => {
                let flat = self.current()?.pop_n(arg as usize * 2)?;
                let mut map = ValueMap::default();
                for pair in flat.chunks_exact(2) {
                    let key = ops::map_key(&self.heap, pair[0])?;
                    map.insert(key, pair[1]);
                }
                let object = Value::Ref(self.heap.alloc(HeapData::Map(map)));
                self.push(object)?;
            }
            Opcode::GetProp => {
                let name = self.symbol(arg)?;
                let target = self.pop()?;
                let value = ops::get_attr(&mut self.heap, target, &name)?;
                self.push(value)?;
            }
            Opcode::SetProp => {
                let name = self.symbol(arg)?;
                let value = self.pop()?;
                let target = self.pop()?;
                ops::set_attr(&mut self.heap, target, &name, value)?;
                if flag == 0 {
                    self.push(value)?;
                }
            }
            Opcode::LoadSubscript => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = ops::get_index(&mut self.heap, container, index)?;
                self.push(value)?;
            }
            Opcode::StoreSubscript => {
                let value = self.pop()?;
                let index = self.pop()?;
                let container = self.pop()?;
                ops::set_index(&mut self.heap, container, index, value)?;
                if flag == 0 {
                    self.push(value)?;
                }
            }

            Opcode::Call => return self.call_value(arg as usize),
            Opcode::CallMethod => return self.call_method(arg, flag as usize),
            Opcode::CallSuper => return self.call_super(arg as usize),
            Opcode::IReturn => {
                let frame = self.current()?;
                let value = frame.pop()?;
                return Ok(Flow::Return(frame.retval.unwrap_or(value)));
            }

            Opcode::DefineFunction => {
                let name = self.symbol(arg)?;
                let function = self.pop()?;
                self.bind_name(name, function)?;
            }
            Opcode::DefineClass => self.define_class(arg, flag != 0)?,
            Opcode::Import => {
                let name = self.symbol(arg)?;
                let module = self
                    .modules
                    .get(&name)
                    .copied()
                    .ok_or_else(|| Exception::name_error(format!("no module named '{}'", name)))?;
                self.bind_name(name, module)?;
            }
        }
        Ok(Flow::Next)
    }

    fn binary(&mut self, op: BinaryOp) -> OpResult<()> {
        let r = self.pop()?;
        let l = self.pop()?;
        let result = ops::binary(&mut self.heap, op, l, r)?;
        self.push(result)?;
        Ok(())
    }

    fn compare(&mut self, op: Compare) -> OpResult<()> {
        let r = self.pop()?;
        let l = self.pop()?;
        let result = ops::compare(&self.heap, op, l, r)?;
        self.push(Value::Bool(result))?;
        Ok(())
    }

    /// Collect now, whatever the threshold.
    pub fn collect_garbage(&mut self) -> Result<GcReport, InternalError> {
        let roots = self.roots();
        self.heap.collect(&roots)
    }
}

/// Run `program` on `vm`, reporting uncaught errors through the log.
pub fn execute(vm: &mut Vm, program: &CompiledProgram) -> ExitStatus {
    let result = vm.execute(program);
    if let Err(err) = &result {
        tracing::error!("{}", err);
    }
    ExitStatus::from(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstArena, Node, NodeKind};
    use crate::error::ExceptionKind;
    use crate::vm::chunk::FunctionDef;
    use crate::vm::compiler::Compiler;
    use crate::vm::natives::OutputBuffer;
    use pretty_assertions::assert_eq;

    fn run_tree(vm: &mut Vm, tree: &Node<'_>) -> Result<String, RuntimeError> {
        let program = Compiler::compile(tree, "test.mw").expect("compiles");
        let value = vm.execute(&program)?;
        Ok(vm.display(value))
    }

    fn eval(tree: &Node<'_>) -> Result<String, RuntimeError> {
        run_tree(&mut Vm::new(), tree)
    }

    #[test]
    fn test_return_sum() {
        let arena = AstArena::new();
        let sum = arena.binary(NodeKind::Add, arena.long(1), arena.long(2));
        let tree = arena.program(&[arena.ret(Some(sum))]);
        assert_eq!(eval(tree), Ok("3".to_string()));
    }

    #[test]
    fn test_reassignment_releases_old_value_once() {
        let arena = AstArena::new();
        let tree = arena.program(&[
            arena.set("x", arena.string("first")),
            arena.set("x", arena.string("second")),
        ]);
        let mut vm = Vm::new();
        run_tree(&mut vm, tree).expect("runs");

        let unit = vm.units.last().expect("unit");
        let first = unit
            .constants
            .iter()
            .copied()
            .find(|v| vm.display(*v) == "first")
            .expect("constant");
        // Pinned once at load; the binding's reference was released.
        assert_eq!(vm.heap.refcount(first.heap_id().expect("ref")), Ok(1));
        let second = vm.global("x").expect("bound");
        assert_eq!(vm.heap.refcount(second.heap_id().expect("ref")), Ok(2));
    }

    #[test]
    fn test_increment_binding() {
        let arena = AstArena::new();
        let tree = arena.program(&[
            arena.set("x", arena.long(5)),
            arena.set("x", arena.binary(NodeKind::Add, arena.ident("x"), arena.long(1))),
            arena.ret(Some(arena.ident("x"))),
        ]);
        assert_eq!(eval(tree), Ok("6".to_string()));
    }

    #[test]
    fn test_undefined_name() {
        let arena = AstArena::new();
        let tree = arena.program(&[arena.ret(Some(arena.ident("missing")))]);
        let err = eval(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::NameError));
        assert_eq!(err.message(), "name 'missing' is not defined");
    }

    #[test]
    fn test_loop_exit_truncates_leftover_values() {
        // 0 LOAD_CONST; 1 BEGIN_LOOP; 2 TRY -> 6; 3-4 LOAD_CONST x2;
        // 5 EXIT_LOOP_CONTINUE; 6 LOAD_CONST; 7 END_LOOP; 8 IRETURN
        let mut main = FunctionDef::new("<main>", 1);
        let load = Instruction::new(Opcode::LoadConst, 0, 0);
        main.emit(load, 1);
        main.emit(Instruction::simple(Opcode::BeginLoop), 1);
        let catch = main.reserve_target();
        main.emit(Instruction::new(Opcode::Try, catch as u16, 0), 1);
        main.emit(load, 1);
        main.emit(load, 1);
        main.emit(Instruction::simple(Opcode::ExitLoopContinue), 1);
        main.patch_target(catch, 6);
        main.emit(load, 1);
        main.emit(Instruction::simple(Opcode::EndLoop), 1);
        main.emit(Instruction::simple(Opcode::IReturn), 1);
        let program = CompiledProgram {
            source_name: "loop.mw".to_string(),
            symbols: Default::default(),
            constants: vec![Constant::Long(7)],
            main: Rc::new(main),
        };

        let mut vm = Vm::new();
        let unit = vm.load(&program).expect("loads");
        vm.frames
            .push(Frame::new(program.main.clone(), unit, FrameKind::Module));
        let step = |vm: &mut Vm| assert!(matches!(vm.step(), Ok(Flow::Next)));

        step(&mut vm);
        step(&mut vm);
        let entry = vm.frames[0].loop_blocks[0];
        assert_eq!(entry.height, 1);
        for _ in 0..3 {
            step(&mut vm);
        }
        assert_eq!(vm.frames[0].stack.len(), 3);
        assert_eq!(vm.frames[0].try_blocks.len(), 1);

        // EXIT_LOOP_CONTINUE: back to the entry height, try blocks dropped.
        step(&mut vm);
        let frame = &vm.frames[0];
        assert_eq!(frame.stack.len(), entry.height);
        assert!(frame.try_blocks.is_empty());
        assert_eq!(frame.loop_blocks.len(), 1);

        // END_LOOP: truncates again and leaves the loop.
        step(&mut vm);
        step(&mut vm);
        let frame = &vm.frames[0];
        assert_eq!(frame.stack.len(), entry.height);
        assert!(frame.loop_blocks.is_empty());
        assert!(matches!(vm.step(), Ok(Flow::Return(Value::Long(7)))));
    }

    #[test]
    fn test_continue_inside_loop_keeps_results() {
        let arena = AstArena::new();
        // i = 0; while (i < 5) { i = i + 1; if (i == 3) { continue; } [i, i][0]; }
        let body = arena.block(&[
            arena.set("i", arena.binary(NodeKind::Add, arena.ident("i"), arena.long(1))),
            arena.if_else(
                arena.binary(NodeKind::Eq, arena.ident("i"), arena.long(3)),
                arena.block(&[arena.cont()]),
                None,
            ),
            arena.index(arena.array(&[arena.ident("i"), arena.ident("i")]), arena.long(0)),
        ]);
        let tree = arena.program(&[
            arena.set("i", arena.long(0)),
            arena.while_loop(
                arena.binary(NodeKind::Lt, arena.ident("i"), arena.long(5)),
                body,
            ),
            arena.ret(Some(arena.ident("i"))),
        ]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let mut vm = Vm::new();
        let log = crate::vm::trace::TraceLog::new();
        vm.set_tracer(Box::new(log.clone()));
        let value = vm.execute(&program).expect("runs");
        assert_eq!(vm.display(value), "5");
        assert!(log
            .records()
            .iter()
            .any(|r| r.opcode == "EXIT_LOOP_CONTINUE"));
    }

    #[test]
    fn test_break_inside_try_resets_try_depth() {
        let arena = AstArena::new();
        // while (true) { try { break; } catch (e) {} } throw "after";
        let guarded = arena.try_catch(arena.block(&[arena.brk()]), "e", arena.block(&[]));
        let tree = arena.program(&[
            arena.while_loop(arena.boolean(true), arena.block(&[guarded])),
            arena.throw(arena.string("after")),
        ]);
        let err = eval(tree).unwrap_err();
        // The stale try block would have caught this.
        assert_eq!(err.kind(), Some(ExceptionKind::Exception));
        assert_eq!(err.message(), "after");
    }

    #[test]
    fn test_print_goes_to_output() {
        let arena = AstArena::new();
        let call = arena.call_named("print", &[arena.string("a"), arena.long(1), arena.double(2.5)]);
        let tree = arena.program(&[call]);
        let output = OutputBuffer::new();
        let mut vm = Vm::new();
        vm.set_output(Box::new(output.clone()));
        run_tree(&mut vm, tree).expect("runs");
        assert_eq!(output.contents(), "a 1 2.5\n");
    }

    #[test]
    fn test_exit_status_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::UncaughtException.code(), 1);
        assert_eq!(ExitStatus::InternalError.code(), 70);

        let arena = AstArena::new();
        let tree = arena.program(&[arena.throw(arena.string("x"))]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        assert_eq!(execute(&mut Vm::new(), &program), ExitStatus::UncaughtException);
    }

    #[test]
    fn test_gc_stress_gives_same_result() {
        let arena = AstArena::new();
        // xs = []; for (i = 0; i < 50; i++) { xs.push("n" + i); } return xs[49];
        let body = arena.block(&[arena.method(
            arena.ident("xs"),
            "push",
            &[arena.binary(NodeKind::Add, arena.string("n"), arena.ident("i"))],
        )]);
        let tree = arena.program(&[
            arena.set("xs", arena.array(&[])),
            arena.for_loop(
                arena.set("i", arena.long(0)),
                arena.binary(NodeKind::Lt, arena.ident("i"), arena.long(50)),
                arena.step(NodeKind::PostInc, arena.ident("i")),
                body,
            ),
            arena.ret(Some(arena.index(arena.ident("xs"), arena.long(49)))),
        ]);
        let normal = eval(tree);
        let mut stressed = Vm::with_config(VmConfig::default().gc_stress(true));
        assert_eq!(normal, Ok("n49".to_string()));
        assert_eq!(run_tree(&mut stressed, tree), normal);
        assert!(stressed.heap().collections() > 50);
    }

    #[test]
    fn test_import_native_module() {
        let arena = AstArena::new();
        let call = arena.method(arena.ident("math"), "sqrt", &[arena.long(16)]);
        let tree = arena.program(&[arena.import("math"), arena.ret(Some(call))]);
        assert_eq!(eval(tree), Ok("4.0".to_string()));

        let tree = arena.program(&[arena.import("nope")]);
        assert_eq!(eval(tree).unwrap_err().kind(), Some(ExceptionKind::NameError));
    }
}
