//! Item definition graph.
//!
//! A layout is an immutable tree of [`ItemNode`]s rooted at a [`GroupNode`].
//! Graphs are produced by the [`compiler`] and shared read-only (through
//! [`Arc`]) by every record of a format, and by every layout that inlines them
//! with a `group:` declaration.
//!
//! ## Node kinds
//!
//! - [`GroupNode`]: ordered children, an optional condition and a [`Branch`] tag
//! - [`FieldNode`]: a byte range rendered as hex or as decoded text
//! - [`ValueNode`]: a named expression, stored as a meta-item or hidden item

pub mod compiler;

use encoding_rs::Encoding;
use std::sync::Arc;

pub use compiler::{LayoutLibrary, LayoutSource};

/// Position of a group inside an if/elsif/else chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Branch {
    /// Not part of a chain (layout roots)
    #[default]
    None,
    /// Opens a chain
    If,
    /// Continues a chain; skipped once an earlier sibling was added
    Elsif,
    /// Closes a chain; skipped once an earlier sibling was added
    Else,
}

impl Branch {
    /// Returns true for the branches that yield to an already-taken sibling
    pub fn is_continuation(self) -> bool {
        matches!(self, Branch::Elsif | Branch::Else)
    }
}

/// A node of the item definition graph
#[derive(Debug, Clone)]
pub enum ItemNode {
    /// Nested group
    Group(Arc<GroupNode>),
    /// Byte-range field
    Field(Arc<FieldNode>),
    /// Expression stored as a meta-item
    Meta(ValueNode),
    /// Expression stored as a hidden item
    Hidden(ValueNode),
}

impl ItemNode {
    /// Returns the node's declared name
    pub fn name(&self) -> &str {
        match self {
            ItemNode::Group(group) => group.name(),
            ItemNode::Field(field) => field.name(),
            ItemNode::Meta(value) | ItemNode::Hidden(value) => value.name(),
        }
    }

    /// Returns the branch tag (groups only)
    pub fn branch(&self) -> Branch {
        match self {
            ItemNode::Group(group) => group.branch(),
            _ => Branch::None,
        }
    }
}

/// A group of nodes, optionally gated by a condition
#[derive(Debug, Clone)]
pub struct GroupNode {
    name: String,
    children: Vec<ItemNode>,
    condition: Option<String>,
    branch: Branch,
}

impl GroupNode {
    /// Creates a new group
    pub fn new(
        name: impl Into<String>,
        children: Vec<ItemNode>,
        condition: Option<String>,
        branch: Branch,
    ) -> Self {
        Self {
            name: name.into(),
            children,
            condition: condition.filter(|c| !c.trim().is_empty()),
            branch,
        }
    }

    /// Group name; empty names add no segment to item paths
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered children
    pub fn children(&self) -> &[ItemNode] {
        &self.children
    }

    /// Condition gating the group, if any
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    /// Branch tag
    pub fn branch(&self) -> Branch {
        self.branch
    }
}

/// How a field's byte length is determined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LengthSpec {
    /// Constant length
    Fixed(usize),
    /// From the field offset to the end of the record (`-1`)
    ToEnd,
    /// Evaluated per record, with `offset` in scope
    Expression(String),
}

impl LengthSpec {
    /// Parses a length declaration.
    ///
    /// Literal integers become fixed lengths; `-1` means "to end of record".
    /// Anything else is kept as an expression. Returns `None` for other
    /// negative literals.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let digits = text.strip_prefix(['+', '-']).unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Some(LengthSpec::Expression(text.to_string()));
        }
        match text.parse::<i64>() {
            Ok(-1) => Some(LengthSpec::ToEnd),
            Ok(n) if n >= 0 => usize::try_from(n).ok().map(LengthSpec::Fixed),
            Ok(_) => None,
            Err(_) => Some(LengthSpec::Expression(text.to_string())),
        }
    }
}

/// How a field's bytes are rendered
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Uppercase hex
    Hex,
    /// Text decoded with the given encoding
    String(&'static Encoding),
}

/// A byte-range field
#[derive(Debug, Clone)]
pub struct FieldNode {
    name: String,
    kind: FieldKind,
    length: LengthSpec,
    value_expression: Option<String>,
}

impl FieldNode {
    /// Creates a new field
    pub fn new(
        name: impl Into<String>,
        kind: FieldKind,
        length: LengthSpec,
        value_expression: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            length,
            value_expression: value_expression.filter(|e| !e.trim().is_empty()),
        }
    }

    /// Creates a hex field without a value expression
    pub fn hex(name: impl Into<String>, length: LengthSpec) -> Self {
        Self::new(name, FieldKind::Hex, length, None)
    }

    /// Field name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rendering kind
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Length declaration
    pub fn length(&self) -> &LengthSpec {
        &self.length
    }

    /// Expression transforming the raw rendering, with `value` and `offset` in scope
    pub fn value_expression(&self) -> Option<&str> {
        self.value_expression.as_deref()
    }
}

/// A named expression (meta or hidden item)
#[derive(Debug, Clone)]
pub struct ValueNode {
    name: String,
    expression: String,
}

impl ValueNode {
    /// Creates a new value node
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }

    /// Item name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value expression
    pub fn expression(&self) -> &str {
        &self.expression
    }
}
