//! Serialized syntax trees.
//!
//! The CLI consumes trees produced by an external front end as JSON
//! documents. A document is decoded with serde into owned [`TreeNode`]s and
//! then copied into an [`AstArena`] for compilation.

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

use super::arena::AstArena;
use super::node::{Literal, Node, NodeKind, Position};

/// A whole serialized program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDocument {
    /// File name reported in backtraces.
    #[serde(default = "default_source")]
    pub source: String,
    pub root: TreeNode,
}

fn default_source() -> String {
    "<tree>".to_string()
}

/// One serialized node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
    /// Literal payload of `Long`, `Double` and `Str` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Name payload of identifiers, properties and definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl TreeDocument {
    pub fn from_json(text: &str) -> Result<Self, TreeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Copy the document into `arena`, returning the root node.
    pub fn build<'a>(&self, arena: &'a AstArena) -> Result<&'a Node<'a>, TreeError> {
        self.root.build(arena)
    }
}

impl TreeNode {
    fn build<'a>(&self, arena: &'a AstArena) -> Result<&'a Node<'a>, TreeError> {
        let kind = NodeKind::from_name(&self.kind)
            .ok_or_else(|| TreeError::unknown_kind(&self.kind, self.line))?;
        let children = self
            .children
            .iter()
            .map(|child| child.build(arena))
            .collect::<Result<Vec<_>, _>>()?;
        let literal = self.literal(kind, arena)?;
        Ok(arena.node(
            kind,
            &children,
            literal,
            Position::new(self.line, self.column),
        ))
    }

    fn literal<'a>(&self, kind: NodeKind, arena: &'a AstArena) -> Result<Literal<'a>, TreeError> {
        let bad = || TreeError::bad_literal(kind.name(), self.line);
        let literal = match kind {
            NodeKind::Long => {
                let value = self.value.as_ref().and_then(|v| v.as_i64()).ok_or_else(bad)?;
                Literal::Long(value)
            }
            NodeKind::Double => {
                let value = self.value.as_ref().and_then(|v| v.as_f64()).ok_or_else(bad)?;
                Literal::Double(value)
            }
            NodeKind::Str => {
                let value = self.value.as_ref().and_then(|v| v.as_str()).ok_or_else(bad)?;
                Literal::Str(arena.alloc_str(value))
            }
            NodeKind::Identifier
            | NodeKind::Property
            | NodeKind::Function
            | NodeKind::Rest
            | NodeKind::Class
            | NodeKind::Import => {
                let name = self.name.as_deref().ok_or_else(bad)?;
                Literal::Name(arena.alloc_str(name))
            }
            _ => Literal::None,
        };
        Ok(literal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_builds_into_arena() {
        let doc = TreeDocument::from_json(
            r#"{
                "source": "sum.mw",
                "root": {"kind": "Program", "children": [
                    {"kind": "Return", "line": 1, "children": [
                        {"kind": "Add", "children": [
                            {"kind": "Long", "value": 1},
                            {"kind": "Identifier", "name": "x", "line": 1, "column": 12}
                        ]}
                    ]}
                ]}
            }"#,
        )
        .expect("valid json");
        assert_eq!(doc.source, "sum.mw");

        let arena = AstArena::new();
        let root = doc.build(&arena).expect("valid tree");
        let add = root.children[0].children[0];
        assert_eq!(add.kind, NodeKind::Add);
        assert_eq!(add.children[1].name(), Some("x"));
        assert_eq!(add.children[1].pos, Position::new(1, 12));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let doc = TreeDocument::from_json(r#"{"root": {"kind": "Lambda", "line": 4}}"#)
            .expect("valid json");
        let arena = AstArena::new();
        let err = doc.build(&arena).unwrap_err();
        assert_eq!(err.to_string(), "Unknown node kind 'Lambda' at line 4");
    }

    #[test]
    fn test_missing_literal_is_rejected() {
        let doc = TreeDocument::from_json(r#"{"root": {"kind": "Long"}}"#).expect("valid json");
        let arena = AstArena::new();
        assert!(matches!(
            doc.build(&arena),
            Err(TreeError::BadLiteral { .. })
        ));
    }
}
