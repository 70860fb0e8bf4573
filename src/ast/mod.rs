//! Syntax tree consumed by the compiler.
//!
//! Trees are produced by an external front end (or by [`AstArena`]'s builder
//! methods) and live in a bump arena for the duration of compilation. The
//! compiler only reads them: it dispatches on [`NodeKind`], walks the ordered
//! children and, for leaves, reads the [`Literal`] payload.

pub mod arena;
pub mod json;
pub mod node;

pub use arena::AstArena;
pub use json::TreeDocument;
pub use node::{Literal, Node, NodeKind, Position};
