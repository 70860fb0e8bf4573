//! Expression compilation.
//!
//! Assignment forms share [`Compiler::compile_store`]. The machine has no
//! addressable lvalues, so compound assignment and increment/decrement are
//! lowered to read-modify-write sequences that re-push the container (and
//! index) with `DUP`/`DUP2` and reorder with `ROT` before the final store.

use crate::ast::{Literal, Node, NodeKind};
use crate::error::CompileError;

use super::chunk::Constant;
use super::compiler::{child, name_of, CompileResult, Compiler, FunctionType, MAX_ARGS};
use super::opcode::Opcode;

impl Compiler {
    /// Compile a node that leaves exactly one value on the stack.
    pub fn compile_expr(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let line = node.line();
        match node.kind {
            NodeKind::Long | NodeKind::Double | NodeKind::Str => {
                let constant = match node.literal {
                    Literal::Long(n) => Constant::Long(n),
                    Literal::Double(d) => Constant::Double(d),
                    Literal::Str(s) => Constant::Str(s.into()),
                    _ => {
                        return Err(CompileError::malformed(
                            format!("{} literal without a payload", node.kind.name()),
                            node.pos,
                        ))
                    }
                };
                self.emit_constant(constant, node.pos)?;
            }
            NodeKind::True => self.emit_constant(Constant::Bool(true), node.pos)?,
            NodeKind::False => self.emit_constant(Constant::Bool(false), node.pos)?,
            NodeKind::Null => self.emit_constant(Constant::Null, node.pos)?,
            NodeKind::Identifier => {
                let name = self.symbol(name_of(node)?, node.pos)?;
                self.emit_arg(Opcode::LoadName, name, line);
            }
            NodeKind::SelfRef => {
                if !matches!(
                    self.function_type(),
                    FunctionType::Method | FunctionType::Constructor
                ) {
                    return Err(CompileError::malformed("'self' outside of a method", node.pos));
                }
                self.emit_op(Opcode::LoadSelf, line);
            }
            kind if kind.is_arithmetic_or_comparison() => {
                self.compile_expr(child(node, 0, "left operand")?)?;
                self.compile_expr(child(node, 1, "right operand")?)?;
                self.emit_op(binary_opcode(kind), line);
            }
            NodeKind::And | NodeKind::Or => {
                // Short circuit: the left value is the result when it decides.
                let jump = if node.kind == NodeKind::And {
                    Opcode::Jmpz
                } else {
                    Opcode::Jmpnz
                };
                let end = self.new_target(node.pos)?;
                self.compile_expr(child(node, 0, "left operand")?)?;
                self.emit_jump(jump, end, true, line);
                self.emit_op(Opcode::Pop, line);
                self.compile_expr(child(node, 1, "right operand")?)?;
                self.mark_target(end);
            }
            NodeKind::Neg | NodeKind::Plus | NodeKind::Not => {
                self.compile_expr(child(node, 0, "operand")?)?;
                let opcode = match node.kind {
                    NodeKind::Neg => Opcode::IUnaryMinus,
                    NodeKind::Plus => Opcode::IUnaryPlus,
                    _ => Opcode::IUnaryNot,
                };
                self.emit_op(opcode, line);
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
            | NodeKind::PostDec => self.compile_store(node, false)?,
            NodeKind::Array => {
                let count = self.count(node.children.len(), "array items", node)?;
                for item in node.children {
                    self.compile_expr(item)?;
                }
                self.emit_arg(Opcode::InitArray, count, line);
            }
            NodeKind::Map => {
                if node.children.len() % 2 != 0 {
                    return Err(CompileError::malformed(
                        "map literal with a key but no value",
                        node.pos,
                    ));
                }
                let count = self.count(node.children.len() / 2, "map entries", node)?;
                for item in node.children {
                    self.compile_expr(item)?;
                }
                self.emit_arg(Opcode::InitObj, count, line);
            }
            NodeKind::Property => {
                self.compile_expr(child(node, 0, "object")?)?;
                let name = self.symbol(name_of(node)?, node.pos)?;
                self.emit_arg(Opcode::GetProp, name, line);
            }
            NodeKind::Subscript => {
                self.compile_expr(child(node, 0, "object")?)?;
                self.compile_expr(child(node, 1, "index")?)?;
                self.emit_op(Opcode::LoadSubscript, line);
            }
            NodeKind::Call => self.compile_call(node)?,
            NodeKind::SuperCall => {
                let argc = self.arg_count(node.children.len(), node)?;
                for arg in node.children {
                    self.compile_expr(arg)?;
                }
                self.emit_arg(Opcode::CallSuper, argc as u16, line);
            }
            kind => return Err(CompileError::unsupported(kind, node.pos)),
        }
        Ok(())
    }

    fn compile_call(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let line = node.line();
        let callee = child(node, 0, "callee")?;
        let args = &node.children[1..];
        let argc = self.arg_count(args.len(), node)?;

        if callee.kind == NodeKind::Property {
            // Method call: the receiver stays below the arguments.
            self.compile_expr(child(callee, 0, "receiver")?)?;
            for arg in args {
                self.compile_expr(arg)?;
            }
            let name = self.symbol(name_of(callee)?, callee.pos)?;
            self.emit(Opcode::CallMethod, name, argc, line);
        } else {
            self.compile_expr(callee)?;
            for arg in args {
                self.compile_expr(arg)?;
            }
            self.emit_arg(Opcode::Call, argc as u16, line);
        }
        Ok(())
    }

    /// Assignment, compound assignment and increment/decrement. With
    /// `discard` the store consumes the value instead of leaving it.
    pub fn compile_store(&mut self, node: &Node<'_>, discard: bool) -> CompileResult<()> {
        let target = child(node, 0, "target")?;
        match node.kind {
            NodeKind::Assign => {
                let value = child(node, 1, "value")?;
                self.compile_plain_store(target, value, discard)
            }
            NodeKind::PostInc | NodeKind::PostDec if !discard => {
                let opcode = if node.kind == NodeKind::PostInc {
                    Opcode::IAdd
                } else {
                    Opcode::IMinus
                };
                self.compile_postfix(node, target, opcode)
            }
            kind => {
                let (opcode, operand) = match kind {
                    NodeKind::AddAssign => (Opcode::IAdd, node.child(1)),
                    NodeKind::SubAssign => (Opcode::IMinus, node.child(1)),
                    NodeKind::MulAssign => (Opcode::ITimes, node.child(1)),
                    NodeKind::DivAssign => (Opcode::IDiv, node.child(1)),
                    NodeKind::RemAssign => (Opcode::IRem, node.child(1)),
                    NodeKind::PreInc | NodeKind::PostInc => (Opcode::IAdd, None),
                    _ => (Opcode::IMinus, None),
                };
                if matches!(
                    kind,
                    NodeKind::AddAssign
                        | NodeKind::SubAssign
                        | NodeKind::MulAssign
                        | NodeKind::DivAssign
                        | NodeKind::RemAssign
                ) && operand.is_none()
                {
                    return Err(CompileError::malformed(
                        format!("{} node is missing its value", kind.name()),
                        node.pos,
                    ));
                }
                self.compile_update(node, target, opcode, operand, discard)
            }
        }
    }

    fn compile_plain_store(
        &mut self,
        target: &Node<'_>,
        value: &Node<'_>,
        discard: bool,
    ) -> CompileResult<()> {
        let line = target.line();
        let flag = discard as u8;
        match target.kind {
            NodeKind::Identifier => {
                self.compile_expr(value)?;
                let name = self.symbol(name_of(target)?, target.pos)?;
                self.emit(Opcode::StoreName, name, flag, line);
            }
            NodeKind::Property => {
                self.compile_expr(child(target, 0, "object")?)?;
                self.compile_expr(value)?;
                let name = self.symbol(name_of(target)?, target.pos)?;
                self.emit(Opcode::SetProp, name, flag, line);
            }
            NodeKind::Subscript => {
                self.compile_expr(child(target, 0, "object")?)?;
                self.compile_expr(child(target, 1, "index")?)?;
                self.compile_expr(value)?;
                self.emit(Opcode::StoreSubscript, 0, flag, line);
            }
            _ => {
                return Err(CompileError::malformed(
                    "invalid assignment target",
                    target.pos,
                ))
            }
        }
        Ok(())
    }

    /// `target op= operand`, or `target op= 1` when `operand` is absent.
    fn compile_update(
        &mut self,
        node: &Node<'_>,
        target: &Node<'_>,
        opcode: Opcode,
        operand: Option<&Node<'_>>,
        discard: bool,
    ) -> CompileResult<()> {
        let line = node.line();
        let flag = discard as u8;
        match target.kind {
            NodeKind::Identifier => {
                let name = self.symbol(name_of(target)?, target.pos)?;
                self.emit_arg(Opcode::LoadName, name, line);
                self.compile_operand(operand, node)?;
                self.emit_op(opcode, line);
                self.emit(Opcode::StoreName, name, flag, line);
            }
            NodeKind::Property => {
                let name = self.symbol(name_of(target)?, target.pos)?;
                self.compile_expr(child(target, 0, "object")?)?;
                self.emit_op(Opcode::Dup, line);
                self.emit_arg(Opcode::GetProp, name, line);
                self.compile_operand(operand, node)?;
                self.emit_op(opcode, line);
                self.emit(Opcode::SetProp, name, flag, line);
            }
            NodeKind::Subscript => {
                self.compile_expr(child(target, 0, "object")?)?;
                self.compile_expr(child(target, 1, "index")?)?;
                self.emit_op(Opcode::Dup2, line);
                self.emit_op(Opcode::LoadSubscript, line);
                self.compile_operand(operand, node)?;
                self.emit_op(opcode, line);
                self.emit(Opcode::StoreSubscript, 0, flag, line);
            }
            _ => {
                return Err(CompileError::malformed(
                    "invalid assignment target",
                    target.pos,
                ))
            }
        }
        Ok(())
    }

    /// Postfix increment/decrement whose old value is the result.
    fn compile_postfix(
        &mut self,
        node: &Node<'_>,
        target: &Node<'_>,
        opcode: Opcode,
    ) -> CompileResult<()> {
        let line = node.line();
        match target.kind {
            NodeKind::Identifier => {
                // [old] -> [old, old] -> [old, new] -> [old]
                let name = self.symbol(name_of(target)?, target.pos)?;
                self.emit_arg(Opcode::LoadName, name, line);
                self.emit_op(Opcode::Dup, line);
                self.compile_operand(None, node)?;
                self.emit_op(opcode, line);
                self.emit(Opcode::StoreName, name, 1, line);
            }
            NodeKind::Property => {
                // [obj, old, old] -> ROT 3 -> [old, obj, old] -> [old, obj, new] -> [old]
                let name = self.symbol(name_of(target)?, target.pos)?;
                self.compile_expr(child(target, 0, "object")?)?;
                self.emit_op(Opcode::Dup, line);
                self.emit_arg(Opcode::GetProp, name, line);
                self.emit_op(Opcode::Dup, line);
                self.emit_arg(Opcode::Rot, 3, line);
                self.compile_operand(None, node)?;
                self.emit_op(opcode, line);
                self.emit(Opcode::SetProp, name, 1, line);
            }
            NodeKind::Subscript => {
                // [obj, idx, old, old] -> ROT 4 -> [old, obj, idx, old] -> ... -> [old]
                self.compile_expr(child(target, 0, "object")?)?;
                self.compile_expr(child(target, 1, "index")?)?;
                self.emit_op(Opcode::Dup2, line);
                self.emit_op(Opcode::LoadSubscript, line);
                self.emit_op(Opcode::Dup, line);
                self.emit_arg(Opcode::Rot, 4, line);
                self.compile_operand(None, node)?;
                self.emit_op(opcode, line);
                self.emit(Opcode::StoreSubscript, 0, 1, line);
            }
            _ => {
                return Err(CompileError::malformed(
                    "invalid increment target",
                    target.pos,
                ))
            }
        }
        Ok(())
    }

    fn compile_operand(&mut self, operand: Option<&Node<'_>>, node: &Node<'_>) -> CompileResult<()> {
        match operand {
            Some(operand) => self.compile_expr(operand),
            None => self.emit_constant(Constant::Long(1), node.pos),
        }
    }

    fn count(&self, len: usize, what: &'static str, node: &Node<'_>) -> CompileResult<u16> {
        u16::try_from(len).map_err(|_| CompileError::too_many(what, u16::MAX as usize, node.pos))
    }

    fn arg_count(&self, len: usize, node: &Node<'_>) -> CompileResult<u8> {
        if len > MAX_ARGS {
            return Err(CompileError::too_many("call arguments", MAX_ARGS, node.pos));
        }
        Ok(len as u8)
    }
}

fn binary_opcode(kind: NodeKind) -> Opcode {
    match kind {
        NodeKind::Add => Opcode::IAdd,
        NodeKind::Sub => Opcode::IMinus,
        NodeKind::Mul => Opcode::ITimes,
        NodeKind::Div => Opcode::IDiv,
        NodeKind::Rem => Opcode::IRem,
        NodeKind::Shl => Opcode::ILshft,
        NodeKind::Shr => Opcode::IRshft,
        NodeKind::Eq => Opcode::IEqual,
        NodeKind::Neq => Opcode::INequal,
        NodeKind::Lt => Opcode::ILt,
        NodeKind::Gt => Opcode::IGt,
        NodeKind::Lte => Opcode::ILte,
        NodeKind::Gte => Opcode::IGte,
        _ => Opcode::IIn,
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{AstArena, NodeKind};
    use crate::error::CompileError;
    use crate::vm::chunk::FunctionDef;
    use crate::vm::compiler::Compiler;
    use crate::vm::opcode::{Instruction, Opcode};

    fn decoded(def: &FunctionDef) -> Vec<Instruction> {
        def.code
            .iter()
            .map(|w| Instruction::decode(*w).expect("valid"))
            .collect()
    }

    #[test]
    fn test_statement_store_carries_discard_flag() {
        let arena = AstArena::new();
        let tree = arena.program(&[arena.set("x", arena.long(5))]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let code = decoded(&program.main);
        assert_eq!(code[1].opcode, Opcode::StoreName);
        assert!(code[1].flagged());
        assert_ne!(code[2].opcode, Opcode::Pop);
    }

    #[test]
    fn test_postfix_property_sequence() {
        let arena = AstArena::new();
        let target = arena.prop(arena.ident("o"), "n");
        let value = arena.step(NodeKind::PostInc, target);
        let tree = arena.program(&[arena.ret(Some(value))]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let ops: Vec<Opcode> = decoded(&program.main).iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops[..9],
            [
                Opcode::LoadName,
                Opcode::Dup,
                Opcode::GetProp,
                Opcode::Dup,
                Opcode::Rot,
                Opcode::LoadConst,
                Opcode::IAdd,
                Opcode::SetProp,
                Opcode::IReturn,
            ]
        );
    }

    #[test]
    fn test_compound_subscript_repushes_container() {
        let arena = AstArena::new();
        let target = arena.index(arena.ident("xs"), arena.long(0));
        let stmt = arena.compound(NodeKind::MulAssign, target, arena.long(2));
        let tree = arena.program(&[stmt]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let ops: Vec<Opcode> = decoded(&program.main).iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops[..7],
            [
                Opcode::LoadName,
                Opcode::LoadConst,
                Opcode::Dup2,
                Opcode::LoadSubscript,
                Opcode::LoadConst,
                Opcode::ITimes,
                Opcode::StoreSubscript,
            ]
        );
    }

    #[test]
    fn test_method_call_packs_argc_in_flag() {
        let arena = AstArena::new();
        let call = arena.method(arena.ident("xs"), "push", &[arena.long(1), arena.long(2)]);
        let tree = arena.program(&[call]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let call = decoded(&program.main)
            .into_iter()
            .find(|i| i.opcode == Opcode::CallMethod)
            .expect("method call");
        assert_eq!(call.flag, 2);
        assert_eq!(program.symbol(call.arg).map(|s| &**s), Some("push"));
    }

    #[test]
    fn test_self_outside_method() {
        let arena = AstArena::new();
        let tree = arena.program(&[arena.ret(Some(arena.self_ref()))]);
        let err = Compiler::compile(tree, "t").unwrap_err();
        assert!(matches!(err, CompileError::Malformed { .. }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let arena = AstArena::new();
        let tree = arena.program(&[arena.assign(arena.long(1), arena.long(2))]);
        assert!(Compiler::compile(tree, "t").is_err());
    }
}
