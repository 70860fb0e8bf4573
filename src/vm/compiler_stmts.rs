//! Statement compilation: blocks, control flow, exceptions, imports.

use crate::ast::{Node, NodeKind};
use crate::error::CompileError;

use super::chunk::Constant;
use super::compiler::{child, name_of, CompileResult, Compiler};
use super::opcode::Opcode;

impl Compiler {
    /// Compile a node in statement position. Expressions leave nothing on
    /// the stack.
    pub fn compile_stmt(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let line = node.line();
        match node.kind {
            NodeKind::Block => {
                for stmt in node.children {
                    self.compile_stmt(stmt)?;
                }
            }
            NodeKind::Empty => {}
            NodeKind::If => self.compile_if(node)?,
            NodeKind::While => {
                let cond = child(node, 0, "condition")?;
                let body = child(node, 1, "body")?;
                self.compile_loop(node, cond, None, body)?;
            }
            NodeKind::For => {
                let init = child(node, 0, "initializer")?;
                let cond = child(node, 1, "condition")?;
                let step = child(node, 2, "step")?;
                let body = child(node, 3, "body")?;
                self.compile_stmt(init)?;
                self.compile_loop(node, cond, Some(step), body)?;
            }
            NodeKind::Break => {
                let ctx = self
                    .innermost_loop()
                    .ok_or_else(|| CompileError::outside_loop("break", node.pos))?;
                self.emit_jump(Opcode::Jmp, ctx.exit_slot, false, line);
            }
            NodeKind::Continue => {
                let ctx = self
                    .innermost_loop()
                    .ok_or_else(|| CompileError::outside_loop("continue", node.pos))?;
                self.emit_jump(Opcode::Jmp, ctx.continue_slot, false, line);
            }
            NodeKind::Return => {
                match node.child(0) {
                    Some(value) => self.compile_expr(value)?,
                    None => self.emit_constant(Constant::Null, node.pos)?,
                }
                self.emit_op(Opcode::IReturn, line);
            }
            NodeKind::Throw => {
                self.compile_expr(child(node, 0, "value")?)?;
                self.emit_op(Opcode::IThrow, line);
            }
            NodeKind::Try => self.compile_try(node)?,
            NodeKind::Function => self.compile_function_def(node)?,
            NodeKind::Class => self.compile_class_def(node)?,
            NodeKind::Import => {
                let name = self.symbol(name_of(node)?, node.pos)?;
                self.emit_arg(Opcode::Import, name, line);
            }
            NodeKind::Assign
            | NodeKind::AddAssign
            | NodeKind::SubAssign
            | NodeKind::MulAssign
            | NodeKind::DivAssign
            | NodeKind::RemAssign
            | NodeKind::PreInc
            | NodeKind::PreDec
            | NodeKind::PostInc
            | NodeKind::PostDec => {
                // The store itself drops the value.
                self.compile_store(node, true)?;
            }
            kind if kind.is_expression() => {
                self.compile_expr(node)?;
                self.emit_op(Opcode::Pop, line);
            }
            kind => return Err(CompileError::unsupported(kind, node.pos)),
        }
        Ok(())
    }

    /// `if` / `else if` / `else`. Arms with empty bodies are not emitted.
    fn compile_if(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let line = node.line();
        let cond = child(node, 0, "condition")?;
        let then_branch = child(node, 1, "then branch")?;
        let else_branch = node.child(2).filter(|b| !is_empty_body(b));
        let has_then = !is_empty_body(then_branch);

        self.compile_expr(cond)?;

        match (has_then, else_branch) {
            (false, None) => {
                self.emit_op(Opcode::Pop, line);
            }
            (false, Some(else_branch)) => {
                let end = self.new_target(node.pos)?;
                self.emit_jump(Opcode::Jmpnz, end, false, line);
                self.compile_stmt(else_branch)?;
                self.mark_target(end);
            }
            (true, None) => {
                let end = self.new_target(node.pos)?;
                self.emit_jump(Opcode::Jmpz, end, false, line);
                self.compile_stmt(then_branch)?;
                self.mark_target(end);
            }
            (true, Some(else_branch)) => {
                let next = self.new_target(node.pos)?;
                let end = self.new_target(node.pos)?;
                self.emit_jump(Opcode::Jmpz, next, false, line);
                self.compile_stmt(then_branch)?;
                self.emit_jump(Opcode::Jmp, end, false, line);
                self.mark_target(next);
                self.compile_stmt(else_branch)?;
                self.mark_target(end);
            }
        }
        Ok(())
    }

    /// Shared lowering of `while` and `for`:
    ///
    /// ```text
    ///       BEGIN_LOOP
    /// top:  <cond> JMPZ exit
    ///       <body>
    /// cont: EXIT_LOOP_CONTINUE
    ///       <step>
    ///       JMP top
    /// exit: END_LOOP
    /// ```
    fn compile_loop(
        &mut self,
        node: &Node<'_>,
        cond: &Node<'_>,
        step: Option<&Node<'_>>,
        body: &Node<'_>,
    ) -> CompileResult<()> {
        let line = node.line();
        let top = self.new_target(node.pos)?;
        let cont = self.new_target(node.pos)?;
        let exit = self.new_target(node.pos)?;

        self.emit_op(Opcode::BeginLoop, line);
        self.mark_target(top);
        if !cond.is_empty_node() {
            self.compile_expr(cond)?;
            self.emit_jump(Opcode::Jmpz, exit, false, line);
        }

        self.begin_loop(cont, exit);
        let body_result = self.compile_stmt(body);
        self.end_loop();
        body_result?;

        self.mark_target(cont);
        self.emit_op(Opcode::ExitLoopContinue, line);
        if let Some(step) = step {
            self.compile_stmt(step)?;
        }
        self.emit_jump(Opcode::Jmp, top, false, line);
        self.mark_target(exit);
        self.emit_op(Opcode::EndLoop, line);
        Ok(())
    }

    /// ```text
    ///        TRY catch
    ///        <body>
    ///        END_TRY
    ///        JMP end
    /// catch: SETUP_CATCH name
    ///        <handler>
    /// end:
    /// ```
    fn compile_try(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let line = node.line();
        let body = child(node, 0, "body")?;
        let var = child(node, 1, "catch variable")?;
        let handler = child(node, 2, "handler")?;
        let var = self.symbol(name_of(var)?, var.pos)?;

        let catch = self.new_target(node.pos)?;
        let end = self.new_target(node.pos)?;

        self.emit_jump(Opcode::Try, catch, false, line);
        self.compile_stmt(body)?;
        self.emit_op(Opcode::EndTry, line);
        self.emit_jump(Opcode::Jmp, end, false, line);

        self.mark_target(catch);
        self.emit_arg(Opcode::SetupCatch, var, handler.line());
        self.compile_stmt(handler)?;
        self.mark_target(end);
        Ok(())
    }
}

/// True for `Empty` and for blocks without statements.
fn is_empty_body(node: &Node<'_>) -> bool {
    match node.kind {
        NodeKind::Empty => true,
        NodeKind::Block => node.children.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{AstArena, NodeKind};
    use crate::error::CompileError;
    use crate::vm::chunk::FunctionDef;
    use crate::vm::compiler::Compiler;
    use crate::vm::opcode::{Instruction, Opcode};

    fn opcodes(def: &FunctionDef) -> Vec<Opcode> {
        def.code
            .iter()
            .map(|w| Instruction::decode(*w).expect("valid").opcode)
            .collect()
    }

    #[test]
    fn test_while_lowering() {
        let arena = AstArena::new();
        let cond = arena.binary(NodeKind::Lt, arena.ident("i"), arena.long(3));
        let body = arena.block(&[arena.step(NodeKind::PostInc, arena.ident("i"))]);
        let tree = arena.program(&[arena.while_loop(cond, body)]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let ops = opcodes(&program.main);
        assert_eq!(ops[0], Opcode::BeginLoop);
        let exit_loop = ops
            .iter()
            .position(|op| *op == Opcode::ExitLoopContinue)
            .expect("iteration end");
        assert_eq!(ops[exit_loop + 1], Opcode::Jmp);
        assert_eq!(ops[exit_loop + 2], Opcode::EndLoop);
        assert_eq!(program.main.unresolved_target(), None);
    }

    #[test]
    fn test_empty_if_is_elided() {
        let arena = AstArena::new();
        let stmt = arena.if_else(arena.ident("x"), arena.block(&[]), None);
        let tree = arena.program(&[stmt]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let ops = opcodes(&program.main);
        assert_eq!(ops[..2], [Opcode::LoadName, Opcode::Pop]);
        assert!(!ops.contains(&Opcode::Jmpz));
    }

    #[test]
    fn test_try_lowering() {
        let arena = AstArena::new();
        let body = arena.block(&[arena.throw(arena.string("boom"))]);
        let handler = arena.block(&[arena.ret(Some(arena.ident("e")))]);
        let tree = arena.program(&[arena.try_catch(body, "e", handler)]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let ops = opcodes(&program.main);
        assert_eq!(
            ops[..7],
            [
                Opcode::Try,
                Opcode::LoadConst,
                Opcode::IThrow,
                Opcode::EndTry,
                Opcode::Jmp,
                Opcode::SetupCatch,
                Opcode::LoadName,
            ]
        );
        let catch = Instruction::decode(program.main.code[0]).expect("valid");
        assert_eq!(program.main.target(catch.arg), Ok(5));
    }

    #[test]
    fn test_break_outside_loop() {
        let arena = AstArena::new();
        let tree = arena.program(&[arena.at(2, 5).brk()]);
        let err = Compiler::compile(tree, "t").unwrap_err();
        assert!(matches!(err, CompileError::LoopControlOutsideLoop { keyword: "break", .. }));
        assert_eq!(err.line(), 2);
    }

    #[test]
    fn test_unsupported_statement() {
        let arena = AstArena::new();
        let params = arena.node(
            NodeKind::Params,
            &[],
            crate::ast::Literal::None,
            arena.position(),
        );
        let tree = arena.program(&[params]);
        let err = Compiler::compile(tree, "t").unwrap_err();
        assert_eq!(
            err,
            CompileError::Unsupported {
                kind: "Params",
                pos: arena.position(),
            }
        );
    }
}
