//! Function and class definition compilation.
//!
//! Bodies are compiled into their own [`FunctionDef`]s; the enclosing
//! function then loads the result as a constant and binds it by name, so
//! functions and classes are ordinary runtime values.

use std::rc::Rc;

use crate::ast::{Node, NodeKind, Position};
use crate::error::CompileError;

use super::chunk::{ClassTemplate, Constant, FunctionDef, Param, CONSTRUCTOR_NAME};
use super::compiler::{child, name_of, CompileResult, Compiler, FunctionType};
use super::opcode::Opcode;

impl Compiler {
    /// `function name(params) { body }` in statement position.
    pub fn compile_function_def(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let def = self.compile_function_body(node, FunctionType::Function)?;
        let name = self.symbol(name_of(node)?, node.pos)?;
        self.emit_constant(Constant::Function(Rc::new(def)), node.pos)?;
        self.emit_arg(Opcode::DefineFunction, name, node.line());
        Ok(())
    }

    /// Compile a `Function` node's body into a fresh definition.
    pub fn compile_function_body(
        &mut self,
        node: &Node<'_>,
        function_type: FunctionType,
    ) -> CompileResult<FunctionDef> {
        let name = name_of(node)?;
        let params = child(node, 0, "parameter list")?;
        let body = child(node, 1, "body")?;

        let mut def = FunctionDef::new(name, node.line());
        def.params = parse_params(params)?;
        def.is_method = matches!(
            function_type,
            FunctionType::Method | FunctionType::Constructor
        );
        def.is_constructor = function_type == FunctionType::Constructor;

        self.start_function(def, function_type);
        self.compile_stmt(body)?;
        let end = Position::new(self.last_line().max(node.line()), 0);
        self.finish_function(end)
    }

    /// `class Name [: Base] { methods }`.
    pub fn compile_class_def(&mut self, node: &Node<'_>) -> CompileResult<()> {
        let line = node.line();
        let class_name = name_of(node)?;
        let base = child(node, 0, "base")?;
        let body = child(node, 1, "body")?;

        let mut methods = Vec::with_capacity(body.children.len());
        for member in body.children {
            if member.kind != NodeKind::Function {
                return Err(CompileError::malformed(
                    format!(
                        "class '{}' may only contain methods, found {}",
                        class_name,
                        member.kind.name()
                    ),
                    member.pos,
                ));
            }
            let function_type = if name_of(member)? == CONSTRUCTOR_NAME {
                FunctionType::Constructor
            } else {
                FunctionType::Method
            };
            let def = self.compile_function_body(member, function_type)?;
            if methods.iter().any(|m: &Rc<FunctionDef>| m.name == def.name) {
                return Err(CompileError::malformed(
                    format!("duplicate method '{}' in class '{}'", def.name, class_name),
                    member.pos,
                ));
            }
            methods.push(Rc::new(def));
        }

        let has_base = match base.kind {
            NodeKind::Empty => false,
            NodeKind::Identifier => {
                let base_name = self.symbol(name_of(base)?, base.pos)?;
                self.emit_arg(Opcode::LoadName, base_name, line);
                true
            }
            _ => {
                return Err(CompileError::malformed(
                    "base class must be a name",
                    base.pos,
                ))
            }
        };

        let template = ClassTemplate {
            name: class_name.into(),
            methods,
        };
        let name = self.symbol(class_name, node.pos)?;
        self.emit_constant(Constant::Class(Rc::new(template)), node.pos)?;
        self.emit(Opcode::DefineClass, name, has_base as u8, line);
        Ok(())
    }
}

/// Read a `Params` node. A rest parameter may only appear last.
fn parse_params(node: &Node<'_>) -> CompileResult<Vec<Param>> {
    if node.kind != NodeKind::Params {
        return Err(CompileError::malformed(
            format!("expected a parameter list, found {}", node.kind.name()),
            node.pos,
        ));
    }
    let mut params: Vec<Param> = Vec::with_capacity(node.children.len());
    for (i, param) in node.children.iter().enumerate() {
        let rest = match param.kind {
            NodeKind::Identifier => false,
            NodeKind::Rest => true,
            kind => return Err(CompileError::unsupported(kind, param.pos)),
        };
        if rest && i + 1 != node.children.len() {
            return Err(CompileError::malformed(
                "rest parameter must be the last parameter",
                param.pos,
            ));
        }
        let name = name_of(param)?;
        if params.iter().any(|p| &*p.name == name) {
            return Err(CompileError::malformed(
                format!("duplicate parameter '{}'", name),
                param.pos,
            ));
        }
        params.push(Param {
            name: name.into(),
            rest,
        });
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use crate::ast::AstArena;
    use crate::error::CompileError;
    use crate::vm::chunk::Constant;
    use crate::vm::compiler::Compiler;
    use crate::vm::opcode::{Instruction, Opcode};

    #[test]
    fn test_function_is_bound_in_enclosing_body() {
        let arena = AstArena::new();
        let body = arena.block(&[arena.ret(Some(arena.ident("a")))]);
        let tree = arena.program(&[arena.function("id", &["a"], body)]);
        let program = Compiler::compile(tree, "t").expect("compiles");

        let first = Instruction::decode(program.main.code[0]).expect("valid");
        let second = Instruction::decode(program.main.code[1]).expect("valid");
        assert_eq!(first.opcode, Opcode::LoadConst);
        assert_eq!(second.opcode, Opcode::DefineFunction);
        match &program.constants[first.arg as usize] {
            Constant::Function(def) => {
                assert_eq!(&*def.name, "id");
                assert_eq!(def.params.len(), 1);
            }
            other => panic!("expected function constant, got {:?}", other),
        }
    }

    #[test]
    fn test_class_with_base_sets_flag() {
        let arena = AstArena::new();
        let ctor = arena.function("constructor", &[], arena.block(&[]));
        let greet = arena.function("greet", &[], arena.block(&[]));
        let tree = arena.program(&[arena.class("Dog", Some("Animal"), &[ctor, greet])]);
        let program = Compiler::compile(tree, "t").expect("compiles");

        let define = program
            .main
            .code
            .iter()
            .map(|w| Instruction::decode(*w).expect("valid"))
            .find(|i| i.opcode == Opcode::DefineClass)
            .expect("class definition");
        assert!(define.flagged());

        let template = program
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Class(t) => Some(t.clone()),
                _ => None,
            })
            .expect("class template");
        assert!(template.methods[0].is_constructor);
        assert!(!template.methods[1].is_constructor);
    }

    #[test]
    fn test_rest_must_be_last() {
        let arena = AstArena::new();
        let f = arena.function("f", &["...rest", "a"], arena.block(&[]));
        let err = Compiler::compile(arena.program(&[f]), "t").unwrap_err();
        assert!(matches!(err, CompileError::Malformed { .. }));
    }

    #[test]
    fn test_nested_function_resumes_outer_body() {
        let arena = AstArena::new();
        let inner = arena.function("inner", &[], arena.block(&[]));
        let outer_body = arena.block(&[inner, arena.ret(Some(arena.long(7)))]);
        let tree = arena.program(&[arena.function("outer", &[], outer_body)]);
        let program = Compiler::compile(tree, "t").expect("compiles");
        let names: Vec<String> = program
            .functions()
            .iter()
            .map(|f| f.name.to_string())
            .collect();
        assert!(names.contains(&"inner".to_string()));
        assert!(names.contains(&"outer".to_string()));
    }
}
