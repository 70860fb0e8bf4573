//! Class definition and instance construction.
//!
//! An instance of a derived class is a chain of instances, one per class
//! level, linked through `base_instance`. Each level's constructor runs
//! with that level's instance as `self`. A base constructor without
//! parameters runs automatically before the derived one; a base
//! constructor with parameters runs only through `super(...)`.

use std::rc::Rc;

use crate::error::{Exception, InternalError, OpResult};

use super::chunk::{FunctionDef, CONSTRUCTOR_NAME};
use super::frame::FrameKind;
use super::heap::HeapId;
use super::ops;
use super::value::{ClassObject, FunctionObject, HeapData, InstanceObject, Members, Value};
use super::vm::{Flow, Vm};

impl Vm {
    /// `DEFINE_CLASS name has_base`: `[base?, template]` → a new class bound
    /// to `name`.
    pub(crate) fn define_class(&mut self, symbol: u16, has_base: bool) -> OpResult<()> {
        let name = self.symbol(symbol)?;
        let template = self.pop()?;
        let base = if has_base {
            let base = self.pop()?;
            if ops::as_class(&self.heap, base)?.is_none() {
                return Err(Exception::type_error(format!(
                    "base class must be a class, not '{}'",
                    ops::type_name(&self.heap, base)?
                ))
                .into());
            }
            base.heap_id()
        } else {
            None
        };

        let (class_name, members) = match ops::as_class(&self.heap, template)? {
            Some(class) => (class.name.clone(), class.members.clone()),
            None => return Err(InternalError::Corrupt("class template expected".into()).into()),
        };
        let class = self.heap.alloc(HeapData::Class(ClassObject {
            name: class_name,
            base,
            members,
        }));
        self.bind_name(name, Value::Ref(class))?;
        Ok(())
    }

    /// Calling a class: build the instance chain and schedule constructors.
    pub(crate) fn construct(&mut self, class: Value, args: Vec<Value>) -> OpResult<Flow> {
        let class_id = class
            .heap_id()
            .ok_or_else(|| InternalError::Corrupt("class expected".into()))?;
        let instance = self.instantiate(class_id)?;

        if self.own_constructor(class_id)?.is_some() {
            self.push_constructor(class_id, instance, args, false)?;
        } else {
            if !args.is_empty() {
                return Err(Exception::argument(format!(
                    "{}() takes no arguments, got {}",
                    self.class_name(class_id)?,
                    args.len()
                ))
                .into());
            }
            self.push(instance)?;
            self.run_base_constructors(instance)?;
        }
        Ok(Flow::Next)
    }

    /// Allocate one instance per class level, base first.
    fn instantiate(&mut self, class_id: HeapId) -> OpResult<Value> {
        let mut levels = vec![class_id];
        let mut current = class_id;
        while let Some(base) = self.class(current)?.base {
            levels.push(base);
            current = base;
        }

        let mut below = None;
        for class in levels.into_iter().rev() {
            let instance = self.heap.alloc(HeapData::Instance(InstanceObject {
                class,
                properties: Members::default(),
                base_instance: below,
            }));
            below = Some(instance);
        }
        below
            .map(Value::Ref)
            .ok_or_else(|| InternalError::Corrupt("empty class chain".into()).into())
    }

    fn class(&self, id: HeapId) -> Result<&ClassObject, InternalError> {
        match self.heap.data(id)? {
            HeapData::Class(class) => Ok(class),
            _ => Err(InternalError::Corrupt("class expected".into())),
        }
    }

    fn class_name(&self, id: HeapId) -> Result<Rc<str>, InternalError> {
        Ok(self.class(id)?.name.clone())
    }

    /// The constructor a class defines itself. Constructors are not
    /// inherited.
    fn own_constructor(&self, class: HeapId) -> Result<Option<(Rc<FunctionDef>, usize)>, InternalError> {
        let Some(member) = self.class(class)?.members.get(CONSTRUCTOR_NAME).copied() else {
            return Ok(None);
        };
        match member.heap_id().map(|id| self.heap.data(id)).transpose()? {
            Some(HeapData::Function(FunctionObject::Lang { def, unit })) => {
                Ok(Some((def.clone(), *unit)))
            }
            _ => Ok(None),
        }
    }

    fn instance_parts(&self, instance: Value) -> Result<(HeapId, Option<HeapId>), InternalError> {
        match instance.heap_id().map(|id| self.heap.data(id)).transpose()? {
            Some(HeapData::Instance(instance)) => Ok((instance.class, instance.base_instance)),
            _ => Err(InternalError::Corrupt("instance expected".into())),
        }
    }

    /// Push the constructor frame for one level, then any parameterless
    /// base constructors on top of it so they run first.
    fn push_constructor(
        &mut self,
        class: HeapId,
        instance: Value,
        args: Vec<Value>,
        discard_result: bool,
    ) -> OpResult<()> {
        let (def, unit) = self
            .own_constructor(class)?
            .ok_or_else(|| InternalError::Corrupt("constructor expected".into()))?;
        let kind = FrameKind::Constructor {
            class,
            super_called: false,
        };
        let mut frame = self.enter_function(def, unit, kind, Some(instance), args)?;
        frame.retval = Some(instance);
        frame.discard_result = discard_result;
        self.push_frame(frame);
        self.run_base_constructors(instance)
    }

    /// Schedule the nearest base constructor below `instance` when it takes
    /// no parameters. Levels without a constructor are skipped.
    fn run_base_constructors(&mut self, instance: Value) -> OpResult<()> {
        let (_, mut level) = self.instance_parts(instance)?;
        while let Some(base_instance) = level {
            let base_instance = Value::Ref(base_instance);
            let (class, below) = self.instance_parts(base_instance)?;
            match self.own_constructor(class)? {
                Some((def, _)) if !def.params.is_empty() => return Ok(()),
                Some(_) => return self.push_constructor(class, base_instance, Vec::new(), true),
                None => level = below,
            }
        }
        Ok(())
    }

    /// `CALL_SUPER argc`: run the base constructor explicitly.
    pub(crate) fn call_super(&mut self, argc: usize) -> OpResult<Flow> {
        let args = self.current()?.pop_n(argc)?;
        let frame = self.current()?;
        let (class, instance) = match (frame.kind, frame.self_value) {
            (FrameKind::Constructor { super_called: true, .. }, _) => {
                return Err(Exception::invalid_operation("super() called more than once").into())
            }
            (FrameKind::Constructor { class, .. }, Some(instance)) => (class, instance),
            _ => {
                return Err(
                    Exception::invalid_operation("super() called outside of a constructor").into(),
                )
            }
        };

        let Some(base) = self.class(class)?.base else {
            return Err(Exception::invalid_operation(format!(
                "class '{}' has no base class",
                self.class_name(class)?
            ))
            .into());
        };
        match self.own_constructor(base)? {
            Some((def, _)) if !def.params.is_empty() => {}
            Some(_) => {
                return Err(Exception::invalid_operation(format!(
                    "the constructor of '{}' takes no arguments and runs automatically",
                    self.class_name(base)?
                ))
                .into())
            }
            None => {
                return Err(Exception::invalid_operation(format!(
                    "base class '{}' has no constructor",
                    self.class_name(base)?
                ))
                .into())
            }
        }
        let (_, base_instance) = self.instance_parts(instance)?;
        let base_instance = base_instance
            .map(Value::Ref)
            .ok_or_else(|| InternalError::Corrupt("instance chain is shorter than its class chain".into()))?;

        if let FrameKind::Constructor { super_called, .. } = &mut self.current()?.kind {
            *super_called = true;
        }
        self.push_constructor(base, base_instance, args, false)?;
        Ok(Flow::Next)
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{AstArena, Node, NodeKind};
    use crate::error::{ExceptionKind, RuntimeError};
    use crate::vm::compiler::Compiler;
    use crate::vm::vm::Vm;
    use pretty_assertions::assert_eq;

    fn run(tree: &Node<'_>) -> Result<String, RuntimeError> {
        let program = Compiler::compile(tree, "classes.mw").expect("compiles");
        let mut vm = Vm::new();
        let value = vm.execute(&program)?;
        Ok(vm.display(value))
    }

    fn log_push<'a>(arena: &'a AstArena, text: &str) -> &'a Node<'a> {
        arena.method(arena.ident("log"), "push", &[arena.string(text)])
    }

    #[test]
    fn test_parameterless_base_constructor_runs_first() {
        let arena = AstArena::new();
        let a_ctor = arena.function("constructor", &[], arena.block(&[log_push(&arena, "A")]));
        let b_ctor = arena.function("constructor", &[], arena.block(&[log_push(&arena, "B")]));
        let tree = arena.program(&[
            arena.set("log", arena.array(&[])),
            arena.class("A", None, &[a_ctor]),
            arena.class("B", Some("A"), &[b_ctor]),
            arena.call_named("B", &[]),
            arena.ret(Some(arena.ident("log"))),
        ]);
        assert_eq!(run(tree), Ok("[\"A\", \"B\"]".to_string()));
    }

    #[test]
    fn test_base_without_derived_constructor_still_runs() {
        let arena = AstArena::new();
        let a_ctor = arena.function("constructor", &[], arena.block(&[log_push(&arena, "A")]));
        let tree = arena.program(&[
            arena.set("log", arena.array(&[])),
            arena.class("A", None, &[a_ctor]),
            arena.class("B", Some("A"), &[]),
            arena.set("b", arena.call_named("B", &[])),
            arena.ret(Some(arena.ident("log"))),
        ]);
        assert_eq!(run(tree), Ok("[\"A\"]".to_string()));
    }

    #[test]
    fn test_super_passes_arguments() {
        let arena = AstArena::new();
        let a_ctor = arena.function(
            "constructor",
            &["x"],
            arena.block(&[arena.assign(arena.prop(arena.self_ref(), "x"), arena.ident("x"))]),
        );
        let b_ctor = arena.function(
            "constructor",
            &["y"],
            arena.block(&[
                arena.super_call(&[arena.binary(NodeKind::Mul, arena.ident("y"), arena.long(2))]),
                arena.assign(arena.prop(arena.self_ref(), "y"), arena.ident("y")),
            ]),
        );
        let b = arena.call_named("B", &[arena.long(5)]);
        let tree = arena.program(&[
            arena.class("A", None, &[a_ctor]),
            arena.class("B", Some("A"), &[b_ctor]),
            arena.set("b", b),
            arena.ret(Some(arena.binary(
                NodeKind::Add,
                arena.prop(arena.ident("b"), "x"),
                arena.prop(arena.ident("b"), "y"),
            ))),
        ]);
        assert_eq!(run(tree), Ok("15".to_string()));
    }

    #[test]
    fn test_super_on_parameterless_base_is_invalid() {
        let arena = AstArena::new();
        let a_ctor = arena.function("constructor", &[], arena.block(&[]));
        let b_ctor = arena.function("constructor", &[], arena.block(&[arena.super_call(&[])]));
        let tree = arena.program(&[
            arena.class("A", None, &[a_ctor]),
            arena.class("B", Some("A"), &[b_ctor]),
            arena.call_named("B", &[]),
        ]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::InvalidOperation));
    }

    #[test]
    fn test_super_outside_constructor_is_invalid() {
        let arena = AstArena::new();
        let f = arena.function("f", &[], arena.block(&[arena.super_call(&[])]));
        let tree = arena.program(&[f, arena.call_named("f", &[])]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::InvalidOperation));
        assert_eq!(err.message(), "super() called outside of a constructor");
    }

    #[test]
    fn test_super_twice_is_invalid() {
        let arena = AstArena::new();
        let a_ctor = arena.function("constructor", &["x"], arena.block(&[]));
        let b_ctor = arena.function(
            "constructor",
            &[],
            arena.block(&[
                arena.super_call(&[arena.long(1)]),
                arena.super_call(&[arena.long(2)]),
            ]),
        );
        let tree = arena.program(&[
            arena.class("A", None, &[a_ctor]),
            arena.class("B", Some("A"), &[b_ctor]),
            arena.call_named("B", &[]),
        ]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.message(), "super() called more than once");
    }

    #[test]
    fn test_inherited_method_sees_derived_self() {
        let arena = AstArena::new();
        let greet = arena.function(
            "greet",
            &[],
            arena.block(&[arena.ret(Some(arena.binary(
                NodeKind::Add,
                arena.string("hi "),
                arena.prop(arena.self_ref(), "name"),
            )))]),
        );
        let b_ctor = arena.function(
            "constructor",
            &["n"],
            arena.block(&[arena.assign(arena.prop(arena.self_ref(), "name"), arena.ident("n"))]),
        );
        let b = arena.call_named("B", &[arena.string("bo")]);
        let tree = arena.program(&[
            arena.class("A", None, &[greet]),
            arena.class("B", Some("A"), &[b_ctor]),
            arena.ret(Some(arena.method(b, "greet", &[]))),
        ]);
        assert_eq!(run(tree), Ok("hi bo".to_string()));
    }

    #[test]
    fn test_class_without_constructor_rejects_arguments() {
        let arena = AstArena::new();
        let tree = arena.program(&[
            arena.class("A", None, &[]),
            arena.call_named("A", &[arena.long(1)]),
        ]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::ArgumentError));
    }

    #[test]
    fn test_constructor_cannot_be_called_directly() {
        let arena = AstArena::new();
        let ctor = arena.function("constructor", &[], arena.block(&[]));
        let tree = arena.program(&[
            arena.class("A", None, &[ctor]),
            arena.set("a", arena.call_named("A", &[])),
            arena.method(arena.ident("a"), "constructor", &[]),
        ]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::InvalidOperation));
    }

    #[test]
    fn test_base_must_be_a_class() {
        let arena = AstArena::new();
        let tree = arena.program(&[
            arena.set("A", arena.long(1)),
            arena.class("B", Some("A"), &[]),
        ]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::TypeError));
        assert_eq!(err.message(), "base class must be a class, not 'long'");
    }

    #[test]
    fn test_method_without_instance() {
        let arena = AstArena::new();
        let m = arena.function("m", &[], arena.block(&[]));
        let tree = arena.program(&[
            arena.class("A", None, &[m]),
            arena.method(arena.ident("A"), "m", &[]),
        ]);
        let err = run(tree).unwrap_err();
        assert_eq!(err.kind(), Some(ExceptionKind::RuntimeError));
    }
}
