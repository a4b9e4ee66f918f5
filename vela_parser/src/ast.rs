//! The abstract syntax tree.
//!
//! A [`Tree`] owns its nodes in an arena and addresses them by [`NodeId`];
//! container nodes hold the ids of their children. The indirection is what
//! lets the parser widen positions and mark whitespace cuts on nodes that
//! are already placed, and lets the expander fill the `tree` slot of
//! `extends`/`import`/`include` nodes in place.
//!
//! Sub-trees resolved by the expander attach as `Arc<Tree>`: once a tree is
//! published through the cache it is shared between workers and must not be
//! mutated.

use std::fmt;
use std::sync::Arc;

use vela_core::{Context, Position};

/// Index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// A parsed source file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tree {
    /// Absolute path of the source, filled by the expander.
    pub path: String,
    /// The context the source was parsed in.
    pub context: Context,
    /// The root nodes.
    pub nodes: Vec<NodeId>,
    arena: Vec<Node>,
}

impl Tree {
    /// Create an empty tree.
    #[must_use]
    pub fn new(path: impl Into<String>, context: Context) -> Self {
        Self {
            path: path.into(),
            context,
            nodes: Vec::new(),
            arena: Vec::new(),
        }
    }

    /// Add a node to the arena, returning its id. The node is not yet
    /// attached to any parent.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.arena.len() as u32);
        self.arena.push(node);
        id
    }

    /// The node with the given id.
    #[inline]
    #[must_use]
    pub fn get(&self, id: NodeId) -> &Node {
        &self.arena[id.0 as usize]
    }

    /// Mutable access to the node with the given id.
    #[inline]
    #[must_use]
    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.arena[id.0 as usize]
    }

    /// The number of nodes in the arena.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether the arena is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// Whitespace cut offsets on a text node.
///
/// `left` bytes are trimmed from the start of the text and `right` bytes
/// from its end when the template is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cut {
    pub left: usize,
    pub right: usize,
}

/// How an assignment binds its variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentType {
    /// `=`
    Simple,
    /// `:=`
    Declaration,
    /// `++`
    Increment,
    /// `--`
    Decrement,
}

/// An identifier with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub pos: Position,
    pub name: String,
}

impl Identifier {
    /// Create an identifier.
    #[must_use]
    pub fn new(pos: Position, name: impl Into<String>) -> Self {
        Self {
            pos,
            name: name.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// An assignment statement or clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub pos: Position,
    /// Assignment targets. Empty for a bare type-switch guard.
    pub variables: Vec<Expression>,
    pub typ: AssignmentType,
    /// Right-hand side values; empty for `++` and `--`.
    pub values: Vec<Expression>,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.variables.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        match self.typ {
            AssignmentType::Simple => f.write_str(" = ")?,
            AssignmentType::Declaration => f.write_str(" := ")?,
            AssignmentType::Increment => return f.write_str("++"),
            AssignmentType::Decrement => return f.write_str("--"),
        }
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// An operator in a unary or binary expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Not,
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    And,
    Or,
}

impl Operator {
    /// The operator as written in source.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Operator::Not => "!",
            Operator::Addition => "+",
            Operator::Subtraction => "-",
            Operator::Multiplication => "*",
            Operator::Division => "/",
            Operator::Modulo => "%",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::And => "&&",
            Operator::Or => "||",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Identifier(Identifier),
    Int {
        pos: Position,
        value: i64,
    },
    Float {
        pos: Position,
        value: f64,
    },
    String {
        pos: Position,
        value: String,
    },
    Parenthesis {
        pos: Position,
        expr: Box<Expression>,
    },
    UnaryOperator {
        pos: Position,
        op: Operator,
        expr: Box<Expression>,
    },
    BinaryOperator {
        pos: Position,
        op: Operator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Call {
        pos: Position,
        func: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Index {
        pos: Position,
        expr: Box<Expression>,
        index: Box<Expression>,
    },
    Slicing {
        pos: Position,
        expr: Box<Expression>,
        low: Option<Box<Expression>>,
        high: Option<Box<Expression>>,
    },
    Selector {
        pos: Position,
        expr: Box<Expression>,
        ident: String,
    },
    /// `expr.(T)`; `typ` is `None` for the `expr.(type)` switch guard.
    TypeAssertion {
        pos: Position,
        expr: Box<Expression>,
        typ: Option<Box<Expression>>,
    },
}

impl Expression {
    /// The position of the expression.
    #[must_use]
    pub fn pos(&self) -> &Position {
        match self {
            Expression::Identifier(ident) => &ident.pos,
            Expression::Int { pos, .. }
            | Expression::Float { pos, .. }
            | Expression::String { pos, .. }
            | Expression::Parenthesis { pos, .. }
            | Expression::UnaryOperator { pos, .. }
            | Expression::BinaryOperator { pos, .. }
            | Expression::Call { pos, .. }
            | Expression::Index { pos, .. }
            | Expression::Slicing { pos, .. }
            | Expression::Selector { pos, .. }
            | Expression::TypeAssertion { pos, .. } => pos,
        }
    }

    /// The identifier, if the expression is one.
    #[must_use]
    pub fn as_identifier(&self) -> Option<&Identifier> {
        match self {
            Expression::Identifier(ident) => Some(ident),
            _ => None,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Identifier(ident) => write!(f, "{ident}"),
            Expression::Int { value, .. } => write!(f, "{value}"),
            Expression::Float { value, .. } => write!(f, "{value}"),
            Expression::String { value, .. } => write!(f, "{value:?}"),
            Expression::Parenthesis { expr, .. } => write!(f, "({expr})"),
            Expression::UnaryOperator { op, expr, .. } => write!(f, "{op}{expr}"),
            Expression::BinaryOperator {
                op, left, right, ..
            } => write!(f, "{left} {op} {right}"),
            Expression::Call {
                func, arguments, ..
            } => {
                write!(f, "{func}(")?;
                for (i, arg) in arguments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Expression::Index { expr, index, .. } => write!(f, "{expr}[{index}]"),
            Expression::Slicing {
                expr, low, high, ..
            } => {
                write!(f, "{expr}[")?;
                if let Some(low) = low {
                    write!(f, "{low}")?;
                }
                f.write_str(":")?;
                if let Some(high) = high {
                    write!(f, "{high}")?;
                }
                f.write_str("]")
            }
            Expression::Selector { expr, ident, .. } => write!(f, "{expr}.{ident}"),
            Expression::TypeAssertion { expr, typ, .. } => match typ {
                Some(typ) => write!(f, "{expr}.({typ})"),
                None => write!(f, "{expr}.(type)"),
            },
        }
    }
}

/// A node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Raw template text.
    Text {
        pos: Position,
        text: String,
        cut: Cut,
    },
    /// A `{# ... #}` comment; `text` excludes the delimiters.
    Comment { pos: Position, text: String },
    /// A `{{ expr }}` show statement.
    Value {
        pos: Position,
        expr: Expression,
        context: Context,
    },
    /// An URL attribute value containing template code.
    Url {
        pos: Position,
        tag: String,
        attribute: String,
        children: Vec<NodeId>,
    },
    If {
        pos: Position,
        init: Option<Assignment>,
        condition: Expression,
        /// The then branch, always a `Block`.
        then: NodeId,
        /// The else branch: another `If` or a `Block`.
        els: Option<NodeId>,
    },
    Block {
        pos: Position,
        nodes: Vec<NodeId>,
    },
    For {
        pos: Position,
        init: Option<Assignment>,
        condition: Option<Expression>,
        post: Option<Assignment>,
        body: Vec<NodeId>,
    },
    ForRange {
        pos: Position,
        assignment: Assignment,
        body: Vec<NodeId>,
    },
    Switch {
        pos: Position,
        init: Option<Assignment>,
        expr: Option<Expression>,
        cases: Vec<NodeId>,
    },
    TypeSwitch {
        pos: Position,
        init: Option<Assignment>,
        /// The guard: `v := e.(type)` or a bare `e.(type)` with no
        /// variables.
        assignment: Assignment,
        cases: Vec<NodeId>,
    },
    Case {
        pos: Position,
        /// `None` expressions mark the `default` case.
        expressions: Vec<Expression>,
        body: Vec<NodeId>,
        fallthrough_: bool,
    },
    Macro {
        pos: Position,
        ident: Identifier,
        parameters: Vec<Identifier>,
        body: Vec<NodeId>,
        is_variadic: bool,
        context: Context,
    },
    ShowMacro {
        pos: Position,
        import: Option<Identifier>,
        name: Identifier,
        arguments: Vec<Expression>,
        context: Context,
    },
    Include {
        pos: Position,
        path: String,
        context: Context,
        /// Filled by the expander.
        tree: Option<Arc<Tree>>,
    },
    Import {
        pos: Position,
        ident: Option<Identifier>,
        path: String,
        context: Context,
        /// Filled by the expander.
        tree: Option<Arc<Tree>>,
    },
    Extends {
        pos: Position,
        path: String,
        context: Context,
        /// Filled by the expander.
        tree: Option<Arc<Tree>>,
    },
    Assignment(Assignment),
    /// An expression statement.
    Expr(Expression),
    Break { pos: Position },
    Continue { pos: Position },
    Label {
        pos: Position,
        ident: Identifier,
        statement: Option<NodeId>,
    },
    Package { pos: Position, name: String },
    /// A `go` statement.
    Go { pos: Position, call: Expression },
}

impl Node {
    /// The position of the node.
    #[must_use]
    pub fn pos(&self) -> &Position {
        match self {
            Node::Text { pos, .. }
            | Node::Comment { pos, .. }
            | Node::Value { pos, .. }
            | Node::Url { pos, .. }
            | Node::If { pos, .. }
            | Node::Block { pos, .. }
            | Node::For { pos, .. }
            | Node::ForRange { pos, .. }
            | Node::Switch { pos, .. }
            | Node::TypeSwitch { pos, .. }
            | Node::Case { pos, .. }
            | Node::Macro { pos, .. }
            | Node::ShowMacro { pos, .. }
            | Node::Include { pos, .. }
            | Node::Import { pos, .. }
            | Node::Extends { pos, .. }
            | Node::Break { pos }
            | Node::Continue { pos }
            | Node::Label { pos, .. }
            | Node::Package { pos, .. }
            | Node::Go { pos, .. } => pos,
            Node::Assignment(a) => &a.pos,
            Node::Expr(e) => e.pos(),
        }
    }

    /// Mutable access to the position of the node.
    pub fn pos_mut(&mut self) -> &mut Position {
        match self {
            Node::Text { pos, .. }
            | Node::Comment { pos, .. }
            | Node::Value { pos, .. }
            | Node::Url { pos, .. }
            | Node::If { pos, .. }
            | Node::Block { pos, .. }
            | Node::For { pos, .. }
            | Node::ForRange { pos, .. }
            | Node::Switch { pos, .. }
            | Node::TypeSwitch { pos, .. }
            | Node::Case { pos, .. }
            | Node::Macro { pos, .. }
            | Node::ShowMacro { pos, .. }
            | Node::Include { pos, .. }
            | Node::Import { pos, .. }
            | Node::Extends { pos, .. }
            | Node::Break { pos }
            | Node::Continue { pos }
            | Node::Label { pos, .. }
            | Node::Package { pos, .. }
            | Node::Go { pos, .. } => pos,
            Node::Assignment(a) => &mut a.pos,
            Node::Expr(e) => match e {
                Expression::Identifier(ident) => &mut ident.pos,
                Expression::Int { pos, .. }
                | Expression::Float { pos, .. }
                | Expression::String { pos, .. }
                | Expression::Parenthesis { pos, .. }
                | Expression::UnaryOperator { pos, .. }
                | Expression::BinaryOperator { pos, .. }
                | Expression::Call { pos, .. }
                | Expression::Index { pos, .. }
                | Expression::Slicing { pos, .. }
                | Expression::Selector { pos, .. }
                | Expression::TypeAssertion { pos, .. } => pos,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_ids_are_stable() {
        let mut tree = Tree::new("", Context::Html);
        let a = tree.add(Node::Text {
            pos: Position::default(),
            text: "a".into(),
            cut: Cut::default(),
        });
        let b = tree.add(Node::Break {
            pos: Position::default(),
        });
        assert_eq!(a, NodeId(0));
        assert_eq!(b, NodeId(1));
        match tree.get(a) {
            Node::Text { text, .. } => assert_eq!(text, "a"),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn test_expression_display() {
        let pos = Position::default();
        let expr = Expression::BinaryOperator {
            pos,
            op: Operator::Addition,
            left: Box::new(Expression::Identifier(Identifier::new(pos, "x"))),
            right: Box::new(Expression::Int { pos, value: 2 }),
        };
        assert_eq!(expr.to_string(), "x + 2");
        let guard = Expression::TypeAssertion {
            pos,
            expr: Box::new(Expression::Identifier(Identifier::new(pos, "v"))),
            typ: None,
        };
        assert_eq!(guard.to_string(), "v.(type)");
    }

    #[test]
    fn test_assignment_display() {
        let pos = Position::default();
        let a = Assignment {
            pos,
            variables: vec![Expression::Identifier(Identifier::new(pos, "n"))],
            typ: AssignmentType::Declaration,
            values: vec![Expression::Int { pos, value: 5 }],
        };
        assert_eq!(a.to_string(), "n := 5");
        let inc = Assignment {
            pos,
            variables: vec![Expression::Identifier(Identifier::new(pos, "n"))],
            typ: AssignmentType::Increment,
            values: vec![],
        };
        assert_eq!(inc.to_string(), "n++");
    }
}
