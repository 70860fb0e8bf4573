//! Bump arena for syntax trees.
//!
//! Nodes are never freed individually: the whole arena is released as one
//! block once compilation has finished. The builder methods stamp every node
//! with the arena's current position (see [`AstArena::at`]).

use std::cell::Cell;

use bumpalo::Bump;

use super::node::{Literal, Node, NodeKind, Position};

/// Owns every node of one or more trees.
pub struct AstArena {
    bump: Bump,
    cursor: Cell<Position>,
}

impl AstArena {
    pub fn new() -> Self {
        Self {
            bump: Bump::new(),
            cursor: Cell::new(Position::new(1, 1)),
        }
    }

    /// Set the position stamped onto subsequently built nodes.
    pub fn at(&self, line: u32, column: u32) -> &Self {
        self.cursor.set(Position::new(line, column));
        self
    }

    pub fn position(&self) -> Position {
        self.cursor.get()
    }

    /// Bytes currently held by the arena's chunks.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    pub fn alloc_str<'a>(&'a self, text: &str) -> &'a str {
        self.bump.alloc_str(text)
    }

    /// Allocate a node with an explicit position.
    pub fn node<'a>(
        &'a self,
        kind: NodeKind,
        children: &[&'a Node<'a>],
        literal: Literal<'a>,
        pos: Position,
    ) -> &'a Node<'a> {
        let children = self.bump.alloc_slice_copy(children);
        self.bump.alloc(Node {
            kind,
            children,
            literal,
            pos,
        })
    }

    fn make<'a>(
        &'a self,
        kind: NodeKind,
        children: &[&'a Node<'a>],
        literal: Literal<'a>,
    ) -> &'a Node<'a> {
        self.node(kind, children, literal, self.cursor.get())
    }

    fn named<'a>(&'a self, kind: NodeKind, name: &str, children: &[&'a Node<'a>]) -> &'a Node<'a> {
        let name = self.alloc_str(name);
        self.make(kind, children, Literal::Name(name))
    }

    // --- Leaves ---

    pub fn program<'a>(&'a self, stmts: &[&'a Node<'a>]) -> &'a Node<'a> {
        self.make(NodeKind::Program, stmts, Literal::None)
    }

    pub fn long<'a>(&'a self, value: i64) -> &'a Node<'a> {
        self.make(NodeKind::Long, &[], Literal::Long(value))
    }

    pub fn double<'a>(&'a self, value: f64) -> &'a Node<'a> {
        self.make(NodeKind::Double, &[], Literal::Double(value))
    }

    pub fn string<'a>(&'a self, value: &str) -> &'a Node<'a> {
        let value = self.alloc_str(value);
        self.make(NodeKind::Str, &[], Literal::Str(value))
    }

    pub fn boolean<'a>(&'a self, value: bool) -> &'a Node<'a> {
        let kind = if value { NodeKind::True } else { NodeKind::False };
        self.make(kind, &[], Literal::None)
    }

    pub fn null<'a>(&'a self) -> &'a Node<'a> {
        self.make(NodeKind::Null, &[], Literal::None)
    }

    pub fn ident<'a>(&'a self, name: &str) -> &'a Node<'a> {
        self.named(NodeKind::Identifier, name, &[])
    }

    pub fn self_ref<'a>(&'a self) -> &'a Node<'a> {
        self.make(NodeKind::SelfRef, &[], Literal::None)
    }

    pub fn empty<'a>(&'a self) -> &'a Node<'a> {
        self.make(NodeKind::Empty, &[], Literal::None)
    }

    pub fn brk<'a>(&'a self) -> &'a Node<'a> {
        self.make(NodeKind::Break, &[], Literal::None)
    }

    pub fn cont<'a>(&'a self) -> &'a Node<'a> {
        self.make(NodeKind::Continue, &[], Literal::None)
    }

    // --- Operators ---

    pub fn binary<'a>(
        &'a self,
        kind: NodeKind,
        left: &'a Node<'a>,
        right: &'a Node<'a>,
    ) -> &'a Node<'a> {
        self.make(kind, &[left, right], Literal::None)
    }

    pub fn unary<'a>(&'a self, kind: NodeKind, operand: &'a Node<'a>) -> &'a Node<'a> {
        self.make(kind, &[operand], Literal::None)
    }

    pub fn assign<'a>(&'a self, target: &'a Node<'a>, value: &'a Node<'a>) -> &'a Node<'a> {
        self.make(NodeKind::Assign, &[target, value], Literal::None)
    }

    /// Shorthand for `name = value`.
    pub fn set<'a>(&'a self, name: &str, value: &'a Node<'a>) -> &'a Node<'a> {
        let target = self.ident(name);
        self.assign(target, value)
    }

    /// Compound assignment such as `target += value`.
    pub fn compound<'a>(
        &'a self,
        kind: NodeKind,
        target: &'a Node<'a>,
        value: &'a Node<'a>,
    ) -> &'a Node<'a> {
        self.make(kind, &[target, value], Literal::None)
    }

    /// Prefix or postfix increment/decrement.
    pub fn step<'a>(&'a self, kind: NodeKind, target: &'a Node<'a>) -> &'a Node<'a> {
        self.make(kind, &[target], Literal::None)
    }

    // --- Collections and access ---

    pub fn array<'a>(&'a self, items: &[&'a Node<'a>]) -> &'a Node<'a> {
        self.make(NodeKind::Array, items, Literal::None)
    }

    pub fn map<'a>(&'a self, entries: &[(&'a Node<'a>, &'a Node<'a>)]) -> &'a Node<'a> {
        let flat: Vec<&'a Node<'a>> = entries.iter().flat_map(|(k, v)| [*k, *v]).collect();
        self.make(NodeKind::Map, &flat, Literal::None)
    }

    pub fn prop<'a>(&'a self, object: &'a Node<'a>, name: &str) -> &'a Node<'a> {
        self.named(NodeKind::Property, name, &[object])
    }

    pub fn index<'a>(&'a self, object: &'a Node<'a>, index: &'a Node<'a>) -> &'a Node<'a> {
        self.make(NodeKind::Subscript, &[object, index], Literal::None)
    }

    pub fn call<'a>(&'a self, callee: &'a Node<'a>, args: &[&'a Node<'a>]) -> &'a Node<'a> {
        let mut children = Vec::with_capacity(args.len() + 1);
        children.push(callee);
        children.extend_from_slice(args);
        self.make(NodeKind::Call, &children, Literal::None)
    }

    /// Call a global by name: `name(args)`.
    pub fn call_named<'a>(&'a self, name: &str, args: &[&'a Node<'a>]) -> &'a Node<'a> {
        let callee = self.ident(name);
        self.call(callee, args)
    }

    /// Method call: `object.name(args)`.
    pub fn method<'a>(
        &'a self,
        object: &'a Node<'a>,
        name: &str,
        args: &[&'a Node<'a>],
    ) -> &'a Node<'a> {
        let callee = self.prop(object, name);
        self.call(callee, args)
    }

    pub fn super_call<'a>(&'a self, args: &[&'a Node<'a>]) -> &'a Node<'a> {
        self.make(NodeKind::SuperCall, args, Literal::None)
    }

    // --- Statements ---

    pub fn block<'a>(&'a self, stmts: &[&'a Node<'a>]) -> &'a Node<'a> {
        self.make(NodeKind::Block, stmts, Literal::None)
    }

    pub fn if_else<'a>(
        &'a self,
        cond: &'a Node<'a>,
        then: &'a Node<'a>,
        otherwise: Option<&'a Node<'a>>,
    ) -> &'a Node<'a> {
        match otherwise {
            Some(otherwise) => self.make(NodeKind::If, &[cond, then, otherwise], Literal::None),
            None => self.make(NodeKind::If, &[cond, then], Literal::None),
        }
    }

    pub fn while_loop<'a>(&'a self, cond: &'a Node<'a>, body: &'a Node<'a>) -> &'a Node<'a> {
        self.make(NodeKind::While, &[cond, body], Literal::None)
    }

    pub fn for_loop<'a>(
        &'a self,
        init: &'a Node<'a>,
        cond: &'a Node<'a>,
        step: &'a Node<'a>,
        body: &'a Node<'a>,
    ) -> &'a Node<'a> {
        self.make(NodeKind::For, &[init, cond, step, body], Literal::None)
    }

    pub fn ret<'a>(&'a self, value: Option<&'a Node<'a>>) -> &'a Node<'a> {
        match value {
            Some(value) => self.make(NodeKind::Return, &[value], Literal::None),
            None => self.make(NodeKind::Return, &[], Literal::None),
        }
    }

    pub fn throw<'a>(&'a self, value: &'a Node<'a>) -> &'a Node<'a> {
        self.make(NodeKind::Throw, &[value], Literal::None)
    }

    pub fn try_catch<'a>(
        &'a self,
        body: &'a Node<'a>,
        catch_var: &str,
        handler: &'a Node<'a>,
    ) -> &'a Node<'a> {
        let var = self.ident(catch_var);
        self.make(NodeKind::Try, &[body, var, handler], Literal::None)
    }

    /// Function definition. A parameter written `...name` is a rest parameter.
    pub fn function<'a>(&'a self, name: &str, params: &[&str], body: &'a Node<'a>) -> &'a Node<'a> {
        let params: Vec<&'a Node<'a>> = params
            .iter()
            .map(|param| match param.strip_prefix("...") {
                Some(rest) => self.named(NodeKind::Rest, rest, &[]),
                None => self.ident(param),
            })
            .collect();
        let params = self.make(NodeKind::Params, &params, Literal::None);
        self.named(NodeKind::Function, name, &[params, body])
    }

    pub fn class<'a>(
        &'a self,
        name: &str,
        base: Option<&str>,
        methods: &[&'a Node<'a>],
    ) -> &'a Node<'a> {
        let base = match base {
            Some(base) => self.ident(base),
            None => self.empty(),
        };
        let body = self.block(methods);
        self.named(NodeKind::Class, name, &[base, body])
    }

    pub fn import<'a>(&'a self, name: &str) -> &'a Node<'a> {
        self.named(NodeKind::Import, name, &[])
    }
}

impl Default for AstArena {
    fn default() -> Self {
        Self::new()
    }
}
