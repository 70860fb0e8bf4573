//! Tree node types.

use std::fmt;

/// A source position (1-based line and column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Root node; children are top-level statements.
    Program,

    // --- Leaves ---
    /// Integer literal: 42
    Long,
    /// Floating point literal: 3.14
    Double,
    /// String literal: "hello"
    Str,
    True,
    False,
    Null,
    /// Name reference: foo
    Identifier,
    /// The current instance: self
    SelfRef,
    /// Placeholder for an absent optional child (e.g. a `for` clause).
    Empty,
    Break,
    Continue,

    // --- Binary operators (left, right) ---
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    /// Membership test: x in items
    In,
    /// Short-circuit conjunction: a && b
    And,
    /// Short-circuit disjunction: a || b
    Or,

    // --- Unary operators (operand) ---
    Neg,
    Plus,
    Not,

    // --- Assignment (target, value) ---
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    RemAssign,

    // --- Increment / decrement (target) ---
    PreInc,
    PreDec,
    PostInc,
    PostDec,

    // --- Collections and access ---
    /// Array literal: [a, b, c]
    Array,
    /// Map literal, children alternate key and value: {"a": 1}
    Map,
    /// Property access, name in the literal: obj.name
    Property,
    /// Index access: obj[index]
    Subscript,
    /// Call, callee first then arguments: f(a, b)
    Call,
    /// Base constructor call inside a constructor: super(a, b)
    SuperCall,

    // --- Statements ---
    Block,
    /// if (cond) then [else]
    If,
    /// while (cond) body
    While,
    /// for (init; cond; step) body
    For,
    /// return [value]
    Return,
    /// throw value
    Throw,
    /// try body catch (name) handler
    Try,
    /// Function definition, name in the literal; children are params and body.
    Function,
    /// Parameter list of identifiers and rest parameters.
    Params,
    /// Variadic final parameter: ...rest
    Rest,
    /// Class definition, name in the literal; children are base (or Empty) and body.
    Class,
    /// import name
    Import,
}

impl NodeKind {
    /// Binary operator kinds that map directly onto one instruction.
    pub fn is_arithmetic_or_comparison(self) -> bool {
        matches!(
            self,
            NodeKind::Add
                | NodeKind::Sub
                | NodeKind::Mul
                | NodeKind::Div
                | NodeKind::Rem
                | NodeKind::Shl
                | NodeKind::Shr
                | NodeKind::Eq
                | NodeKind::Neq
                | NodeKind::Lt
                | NodeKind::Gt
                | NodeKind::Lte
                | NodeKind::Gte
                | NodeKind::In
        )
    }

    /// Kinds that produce a value when compiled as an expression.
    pub fn is_expression(self) -> bool {
        self.is_arithmetic_or_comparison()
            || matches!(
                self,
                NodeKind::Long
                    | NodeKind::Double
                    | NodeKind::Str
                    | NodeKind::True
                    | NodeKind::False
                    | NodeKind::Null
                    | NodeKind::Identifier
                    | NodeKind::SelfRef
                    | NodeKind::And
                    | NodeKind::Or
                    | NodeKind::Neg
                    | NodeKind::Plus
                    | NodeKind::Not
                    | NodeKind::Assign
                    | NodeKind::AddAssign
                    | NodeKind::SubAssign
                    | NodeKind::MulAssign
                    | NodeKind::DivAssign
                    | NodeKind::RemAssign
                    | NodeKind::PreInc
                    | NodeKind::PreDec
                    | NodeKind::PostInc
                    | NodeKind::PostDec
                    | NodeKind::Array
                    | NodeKind::Map
                    | NodeKind::Property
                    | NodeKind::Subscript
                    | NodeKind::Call
                    | NodeKind::SuperCall
            )
    }

    /// Parse a kind from its name, as used by serialized trees.
    pub fn from_name(name: &str) -> Option<NodeKind> {
        ALL_KINDS.iter().copied().find(|kind| kind.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Program => "Program",
            NodeKind::Long => "Long",
            NodeKind::Double => "Double",
            NodeKind::Str => "Str",
            NodeKind::True => "True",
            NodeKind::False => "False",
            NodeKind::Null => "Null",
            NodeKind::Identifier => "Identifier",
            NodeKind::SelfRef => "SelfRef",
            NodeKind::Empty => "Empty",
            NodeKind::Break => "Break",
            NodeKind::Continue => "Continue",
            NodeKind::Add => "Add",
            NodeKind::Sub => "Sub",
            NodeKind::Mul => "Mul",
            NodeKind::Div => "Div",
            NodeKind::Rem => "Rem",
            NodeKind::Shl => "Shl",
            NodeKind::Shr => "Shr",
            NodeKind::Eq => "Eq",
            NodeKind::Neq => "Neq",
            NodeKind::Lt => "Lt",
            NodeKind::Gt => "Gt",
            NodeKind::Lte => "Lte",
            NodeKind::Gte => "Gte",
            NodeKind::In => "In",
            NodeKind::And => "And",
            NodeKind::Or => "Or",
            NodeKind::Neg => "Neg",
            NodeKind::Plus => "Plus",
            NodeKind::Not => "Not",
            NodeKind::Assign => "Assign",
            NodeKind::AddAssign => "AddAssign",
            NodeKind::SubAssign => "SubAssign",
            NodeKind::MulAssign => "MulAssign",
            NodeKind::DivAssign => "DivAssign",
            NodeKind::RemAssign => "RemAssign",
            NodeKind::PreInc => "PreInc",
            NodeKind::PreDec => "PreDec",
            NodeKind::PostInc => "PostInc",
            NodeKind::PostDec => "PostDec",
            NodeKind::Array => "Array",
            NodeKind::Map => "Map",
            NodeKind::Property => "Property",
            NodeKind::Subscript => "Subscript",
            NodeKind::Call => "Call",
            NodeKind::SuperCall => "SuperCall",
            NodeKind::Block => "Block",
            NodeKind::If => "If",
            NodeKind::While => "While",
            NodeKind::For => "For",
            NodeKind::Return => "Return",
            NodeKind::Throw => "Throw",
            NodeKind::Try => "Try",
            NodeKind::Function => "Function",
            NodeKind::Params => "Params",
            NodeKind::Rest => "Rest",
            NodeKind::Class => "Class",
            NodeKind::Import => "Import",
        }
    }
}

const ALL_KINDS: &[NodeKind] = &[
    NodeKind::Program,
    NodeKind::Long,
    NodeKind::Double,
    NodeKind::Str,
    NodeKind::True,
    NodeKind::False,
    NodeKind::Null,
    NodeKind::Identifier,
    NodeKind::SelfRef,
    NodeKind::Empty,
    NodeKind::Break,
    NodeKind::Continue,
    NodeKind::Add,
    NodeKind::Sub,
    NodeKind::Mul,
    NodeKind::Div,
    NodeKind::Rem,
    NodeKind::Shl,
    NodeKind::Shr,
    NodeKind::Eq,
    NodeKind::Neq,
    NodeKind::Lt,
    NodeKind::Gt,
    NodeKind::Lte,
    NodeKind::Gte,
    NodeKind::In,
    NodeKind::And,
    NodeKind::Or,
    NodeKind::Neg,
    NodeKind::Plus,
    NodeKind::Not,
    NodeKind::Assign,
    NodeKind::AddAssign,
    NodeKind::SubAssign,
    NodeKind::MulAssign,
    NodeKind::DivAssign,
    NodeKind::RemAssign,
    NodeKind::PreInc,
    NodeKind::PreDec,
    NodeKind::PostInc,
    NodeKind::PostDec,
    NodeKind::Array,
    NodeKind::Map,
    NodeKind::Property,
    NodeKind::Subscript,
    NodeKind::Call,
    NodeKind::SuperCall,
    NodeKind::Block,
    NodeKind::If,
    NodeKind::While,
    NodeKind::For,
    NodeKind::Return,
    NodeKind::Throw,
    NodeKind::Try,
    NodeKind::Function,
    NodeKind::Params,
    NodeKind::Rest,
    NodeKind::Class,
    NodeKind::Import,
];

/// Literal payload carried by leaf nodes and by named definitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal<'a> {
    None,
    Long(i64),
    Double(f64),
    Str(&'a str),
    /// An identifier, property, function, class or parameter name.
    Name(&'a str),
}

/// A node in the syntax tree. All nodes and their child slices are owned by
/// the arena that built them.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    pub kind: NodeKind,
    pub children: &'a [&'a Node<'a>],
    pub literal: Literal<'a>,
    pub pos: Position,
}

impl<'a> Node<'a> {
    pub fn child(&self, index: usize) -> Option<&'a Node<'a>> {
        self.children.get(index).copied()
    }

    pub fn line(&self) -> u32 {
        self.pos.line
    }

    /// The name payload of identifiers and named definitions.
    pub fn name(&self) -> Option<&'a str> {
        match self.literal {
            Literal::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_empty_node(&self) -> bool {
        self.kind == NodeKind::Empty
    }
}
