//! Exception unwinding: find the nearest try block, dropping frames on the
//! way, or report the exception to the host.

use crate::error::{BacktraceEntry, Exception, RuntimeError, UncaughtException};

use super::vm::Vm;

impl Vm {
    /// Transfer control to the innermost handler for `exception`.
    ///
    /// On success the exception is left pending for `SETUP_CATCH` and the
    /// handling frame resumes at its catch address. Without a handler every
    /// frame is released and the exception is returned as uncaught.
    pub(crate) fn unwind(&mut self, exception: Exception) -> Result<(), RuntimeError> {
        let backtrace = self.backtrace();
        let (file, line) = self.location();

        loop {
            let Some(frame) = self.frames.last_mut() else {
                break;
            };
            if let Some(block) = frame.try_blocks.pop() {
                frame.stack.truncate(block.height);
                frame.loop_blocks.truncate(block.loop_depth);
                frame.pc = block.catch_pc;
                tracing::debug!(
                    "{} caught in '{}' at {:04}",
                    exception.kind,
                    frame.def.name,
                    block.catch_pc
                );
                self.pending = Some(exception);
                return Ok(());
            }
            if let Err(error) = self.pop_frame() {
                return Err(self.abort(error));
            }
        }

        self.pending = None;
        Err(RuntimeError::Uncaught(UncaughtException {
            kind: exception.kind,
            message: exception.message,
            file,
            line,
            backtrace,
        }))
    }

    /// Function frames from innermost outwards, with the line each one was
    /// executing.
    fn backtrace(&self) -> Vec<BacktraceEntry> {
        self.frames
            .iter()
            .rev()
            .filter(|frame| !frame.is_module())
            .map(|frame| BacktraceEntry {
                function: frame.def.name.to_string(),
                file: self.source_name(frame.unit),
                line: frame.line(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{AstArena, Node, NodeKind};
    use crate::error::{BacktraceEntry, ExceptionKind, Fault, RuntimeError};
    use crate::vm::compiler::Compiler;
    use crate::vm::frame::{Frame, FrameKind};
    use crate::vm::opcode::Opcode;
    use crate::vm::vm::{Flow, Vm};
    use pretty_assertions::assert_eq;

    fn run(vm: &mut Vm, tree: &Node<'_>) -> Result<String, RuntimeError> {
        let program = Compiler::compile(tree, "errors.mw").expect("compiles");
        let value = vm.execute(&program)?;
        Ok(vm.display(value))
    }

    fn catch_message<'a>(arena: &'a AstArena, body: &'a Node<'a>) -> &'a Node<'a> {
        arena.try_catch(
            arena.block(&[body]),
            "e",
            arena.block(&[arena.ret(Some(arena.ident("e")))]),
        )
    }

    /// Step the module body until its next instruction is `IRETURN`,
    /// handing faults to `unwind` the way the driver does.
    fn step_to_return(vm: &mut Vm, tree: &Node<'_>) {
        let program = Compiler::compile(tree, "errors.mw").expect("compiles");
        let unit = vm.load(&program).expect("loads");
        vm.frames
            .push(Frame::new(program.main.clone(), unit, FrameKind::Module));
        loop {
            let frame = &vm.frames[0];
            let next = frame.def.instruction(frame.pc).expect("instruction");
            if next.opcode == Opcode::IReturn {
                return;
            }
            match vm.step() {
                Ok(Flow::Next) => {}
                Err(Fault::Throw(exception)) => vm.unwind(exception).expect("handled"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_throw_is_caught_with_message() {
        let arena = AstArena::new();
        let tree = arena.program(&[catch_message(&arena, arena.throw(arena.string("boom")))]);
        let mut vm = Vm::new();
        assert_eq!(run(&mut vm, tree), Ok("boom".to_string()));
        assert!(vm.pending.is_none());
    }

    #[test]
    fn test_handler_leaves_clean_frame() {
        let arena = AstArena::new();
        // try { throw "boom"; } catch (e) { r = e; } return r;
        let tree = arena.program(&[
            arena.try_catch(
                arena.block(&[arena.throw(arena.string("boom"))]),
                "e",
                arena.block(&[arena.set("r", arena.ident("e"))]),
            ),
            arena.ret(Some(arena.ident("r"))),
        ]);
        let mut vm = Vm::new();
        step_to_return(&mut vm, tree);

        assert!(vm.pending.is_none());
        let frame = &vm.frames[0];
        assert!(frame.try_blocks.is_empty());
        assert!(frame.loop_blocks.is_empty());
        // Only the loaded `r` waits to be returned.
        assert_eq!(frame.stack.len(), 1);
        assert_eq!(vm.display(frame.stack[0]), "boom");
    }

    #[test]
    fn test_throw_from_nested_call_unwinds_frames() {
        let arena = AstArena::new();
        let inner = arena.function("inner", &[], arena.block(&[arena.throw(arena.long(7))]));
        let outer = arena.function(
            "outer",
            &[],
            arena.block(&[arena.ret(Some(arena.call_named("inner", &[])))]),
        );
        // The partially built sum must not survive the unwind.
        let sum = arena.binary(NodeKind::Add, arena.long(1), arena.call_named("outer", &[]));
        let tree = arena.program(&[
            inner,
            outer,
            arena.set("r", arena.string("unset")),
            arena.try_catch(
                arena.block(&[arena.set("r", sum)]),
                "e",
                arena.block(&[arena.set("r", arena.ident("e"))]),
            ),
            arena.ret(Some(arena.ident("r"))),
        ]);
        let mut vm = Vm::new();
        assert_eq!(run(&mut vm, tree), Ok("7".to_string()));
    }

    #[test]
    fn test_runtime_errors_are_catchable() {
        let arena = AstArena::new();
        let out_of_range = arena.index(
            arena.array(&[arena.long(1), arena.long(2), arena.long(3)]),
            arena.long(5),
        );
        let tree = arena.program(&[catch_message(&arena, out_of_range)]);
        assert_eq!(run(&mut Vm::new(), tree), Ok("index 5 out of range".to_string()));

        let missing = arena.prop(arena.map(&[(arena.string("a"), arena.long(1))]), "b");
        let tree = arena.program(&[catch_message(&arena, missing)]);
        assert_eq!(run(&mut Vm::new(), tree), Ok("property 'b' not found".to_string()));
    }

    #[test]
    fn test_uncaught_error_kind() {
        let arena = AstArena::new();
        let out_of_range = arena.index(arena.array(&[arena.long(1)]), arena.long(5));
        let tree = arena.program(&[out_of_range]);
        let err = run(&mut Vm::new(), tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::KeyError));
    }

    #[test]
    fn test_handler_is_consumed_once() {
        let arena = AstArena::new();
        // try { throw "a" } catch (e) {} throw "b";
        let tree = arena.program(&[
            arena.try_catch(
                arena.block(&[arena.throw(arena.string("a"))]),
                "e",
                arena.block(&[]),
            ),
            arena.throw(arena.string("b")),
        ]);
        let err = run(&mut Vm::new(), tree).unwrap_err();
        assert_eq!(err.message(), "b");
    }

    #[test]
    fn test_uncaught_backtrace() {
        let arena = AstArena::new();
        arena.at(2, 5);
        let throw = arena.throw(arena.string("deep"));
        arena.at(1, 1);
        let inner = arena.function("inner", &[], arena.block(&[throw]));
        arena.at(5, 5);
        let call_inner = arena.call_named("inner", &[]);
        arena.at(4, 1);
        let outer = arena.function("outer", &[], arena.block(&[call_inner]));
        arena.at(8, 1);
        let call_outer = arena.call_named("outer", &[]);
        let tree = arena.program(&[inner, outer, call_outer]);

        let mut vm = Vm::new();
        let err = run(&mut vm, tree).unwrap_err();
        let RuntimeError::Uncaught(uncaught) = err else {
            panic!("expected an uncaught exception");
        };
        assert_eq!(uncaught.kind, ExceptionKind::Exception);
        assert_eq!((uncaught.file.as_str(), uncaught.line), ("errors.mw", 2));
        assert_eq!(
            uncaught.backtrace,
            vec![
                BacktraceEntry {
                    function: "inner".to_string(),
                    file: "errors.mw".to_string(),
                    line: 2,
                },
                BacktraceEntry {
                    function: "outer".to_string(),
                    file: "errors.mw".to_string(),
                    line: 5,
                },
            ]
        );
        assert!(vm.frames.is_empty());
    }
}
