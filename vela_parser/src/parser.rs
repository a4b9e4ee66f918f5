//! The statement parser.
//!
//! [`parse_source`] tokenizes with the built-in lexer and hands off to
//! [`parse_tokens`], which consumes any [`TokenSource`]. Template contexts
//! interleave text, `{{ }}` show statements and `{% %}` statements;
//! program mode (`Context::None`) parses plain statements with braces.
//!
//! The parser keeps the open-container path from the root to the insertion
//! point on an ancestor stack of arena ids. Closing a container (`end`,
//! `}`) widens its position and pops it; `extends`/`import`/`include`
//! nodes are produced unresolved, with their `tree` slot left empty for
//! the expander.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use vela_core::{Context, Position, VelaError, VelaResult};

use crate::ast::{
    Assignment, AssignmentType, Cut, Expression, Identifier, Node, NodeId, Operator, Tree,
};
use crate::expr::{parse_expr, parse_expr_list, unquote_string};
use crate::lexer::Lexer;
use crate::path::valid_path;
use crate::token::{Token, TokenKind, TokenSource};

/// Parser configuration.
#[derive(Clone, Default)]
pub struct ParseOptions {
    /// Accept `$`-prefixed identifiers (deprecated form).
    pub dollar_identifier: bool,
    /// Reject the `go` statement.
    pub disallow_go_stmt: bool,
    /// Reject `{{ ... }}`, the short form of the show statement.
    pub no_parse_short_show_stmt: bool,
    /// Applied to every parsed tree before expansion.
    #[allow(clippy::type_complexity)]
    pub tree_transformer: Option<Arc<dyn Fn(&mut Tree) -> VelaResult<()> + Send + Sync>>,
}

impl fmt::Debug for ParseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseOptions")
            .field("dollar_identifier", &self.dollar_identifier)
            .field("disallow_go_stmt", &self.disallow_go_stmt)
            .field("no_parse_short_show_stmt", &self.no_parse_short_show_stmt)
            .field("tree_transformer", &self.tree_transformer.is_some())
            .finish()
    }
}

/// Parse `src` in the context `ctx`. `Extends`, `Import` and `Include`
/// nodes are not expanded; use [`crate::expand::Parser`] for an expanded
/// tree.
pub fn parse_source(src: &[u8], ctx: Context, options: &ParseOptions) -> VelaResult<Tree> {
    if !ctx.is_entry() {
        return Err(VelaError::syntax(
            Position::at(1, 1, 0),
            "invalid context: valid contexts are None, Text, HTML, CSS and Script",
        ));
    }
    let mut lex = Lexer::new(src, ctx).with_dollar_identifier(options.dollar_identifier);
    parse_tokens(&mut lex, ctx, options)
}

/// Parse a token stream in the context `ctx`. This is the entry point for
/// external tokenizers that track HTML sub-contexts.
pub fn parse_tokens<T: TokenSource>(
    lex: &mut T,
    ctx: Context,
    options: &ParseOptions,
) -> VelaResult<Tree> {
    let mut parsing = Parsing {
        lex,
        tree: Tree::new("", ctx),
        ancestors: SmallVec::new(),
        is_extended: false,
        is_in_macro: false,
        cut_spaces_token: false,
        done: false,
        ctx,
        last_fallthrough_pos: Position::default(),
        options,
    };
    if ctx == Context::None {
        parsing.run_program()?;
    } else {
        parsing.run_template()?;
    }
    Ok(parsing.tree)
}

struct Parsing<'a, T: TokenSource> {
    lex: &'a mut T,
    tree: Tree,
    /// Open containers from the root (excluded) to the insertion point.
    ancestors: SmallVec<[NodeId; 8]>,
    is_extended: bool,
    is_in_macro: bool,
    /// Whether the current line holds a token eligible for space cutting.
    cut_spaces_token: bool,
    /// Set when an EOF has been consumed inside a statement.
    done: bool,
    ctx: Context,
    last_fallthrough_pos: Position,
    options: &'a ParseOptions,
}

/// Whether `bytes` contains only space characters.
fn contains_only_spaces(bytes: &str) -> bool {
    bytes
        .bytes()
        .all(|b| b == b' ' || b == b'\t' || b == b'\n' || b == b'\r')
}

/// Cut the leading and trailing spaces of a line holding a single
/// directive. `first` and `last` are the initial and final text nodes of
/// the line.
fn cut_spaces(tree: &mut Tree, first: Option<NodeId>, last: Option<NodeId>) {
    let mut first_cut = 0;
    if let Some(id) = first {
        // Spaces can be cut if the text after its last newline contains
        // only spaces and tabs.
        let Node::Text { text, .. } = tree.get(id) else {
            return;
        };
        let bytes = text.as_bytes();
        let mut found = false;
        for i in (0..bytes.len()).rev() {
            let c = bytes[i];
            if c == b'\n' {
                first_cut = i + 1;
                found = true;
                break;
            }
            if c != b' ' && c != b'\t' && c != b'\r' {
                return;
            }
        }
        if !found {
            first_cut = 0;
        }
    }
    if let Some(id) = last {
        let Node::Text { text, .. } = tree.get(id) else {
            return;
        };
        let bytes = text.as_bytes();
        let mut last_cut = bytes.len();
        for (i, &c) in bytes.iter().enumerate() {
            if c == b'\n' {
                last_cut = i + 1;
                break;
            }
            if c != b' ' && c != b'\t' && c != b'\r' {
                return;
            }
        }
        if let Node::Text { cut, .. } = tree.get_mut(id) {
            cut.left = last_cut;
        }
    }
    if let Some(id) = first {
        if let Node::Text { text, cut, .. } = tree.get_mut(id) {
            cut.right = text.len() - first_cut;
        }
    }
}

impl<T: TokenSource> Parsing<'_, T> {
    #[inline]
    fn next(&mut self) -> VelaResult<Token> {
        self.lex.next_token()
    }

    fn syntax(&self, pos: Position, message: impl Into<String>) -> VelaError {
        VelaError::syntax(pos, message)
    }

    #[inline]
    fn parent(&self) -> Option<NodeId> {
        self.ancestors.last().copied()
    }

    fn is_terminator(&self, kind: TokenKind) -> bool {
        if self.ctx == Context::None {
            kind == TokenKind::Semicolon
        } else {
            kind == TokenKind::EndStatement
        }
    }

    fn is_block_open(&self, kind: TokenKind) -> bool {
        if self.ctx == Context::None {
            kind == TokenKind::LeftBraces
        } else {
            kind == TokenKind::EndStatement
        }
    }

    /// Attach `child` to the current parent.
    fn add_child(&mut self, child: NodeId) {
        let is_case = matches!(self.tree.get(child), Node::Case { .. });
        let Some(parent) = self.parent() else {
            self.tree.nodes.push(child);
            return;
        };
        match self.tree.get_mut(parent) {
            Node::Url { children, .. } => children.push(child),
            Node::Macro { body, .. } => body.push(child),
            Node::For { body, .. } => body.push(child),
            Node::ForRange { body, .. } => body.push(child),
            Node::Block { nodes, .. } => nodes.push(child),
            Node::If { els, .. } => {
                if els.is_some() {
                    panic!("child already added to if node");
                }
                *els = Some(child);
            }
            Node::Switch { cases, .. } | Node::TypeSwitch { cases, .. } => {
                if is_case {
                    cases.push(child);
                } else {
                    let last = *cases.last().expect("switch case list is empty");
                    match self.tree.get_mut(last) {
                        Node::Case { body, .. } => body.push(child),
                        _ => panic!("switch case list holds a non-case node"),
                    }
                }
            }
            _ => panic!("unexpected parent node"),
        }
    }

    /// Detach and return the last child of `parent` (`None` for the root).
    fn detach_last_child(&mut self, parent: Option<NodeId>) -> NodeId {
        let Some(parent) = parent else {
            return self.tree.nodes.pop().expect("no child to detach");
        };
        match self.tree.get_mut(parent) {
            Node::Macro { body, .. } | Node::For { body, .. } | Node::ForRange { body, .. } => {
                body.pop().expect("no child to detach")
            }
            Node::Block { nodes, .. } => nodes.pop().expect("no child to detach"),
            _ => panic!("unexpected parent node"),
        }
    }

    // =========================================================================
    // Top-level loops
    // =========================================================================

    fn run_program(&mut self) -> VelaResult<()> {
        loop {
            let tok = self.next()?;
            match tok.kind {
                TokenKind::Eof => {
                    if !self.ancestors.is_empty() {
                        return Err(self.syntax(tok.pos, "unexpected EOF, expecting }"));
                    }
                    return Ok(());
                }
                // Empty statement.
                TokenKind::Semicolon => {}
                _ => self.parse_statement(tok)?,
            }
            if self.done {
                return Ok(());
            }
        }
    }

    fn run_template(&mut self) -> VelaResult<()> {
        // Current line, tracked at token end.
        let mut line = 0u32;
        // First and last text nodes of the current line.
        let mut first_text: Option<NodeId> = None;
        let mut last_text: Option<NodeId> = None;
        // Number of non-text tokens in the current line.
        let mut tokens_in_line = 0u32;

        loop {
            let tok = self.next()?;
            let is_eof = tok.kind == TokenKind::Eof;

            let text_id = if tok.kind == TokenKind::Text {
                Some(self.tree.add(Node::Text {
                    pos: tok.pos,
                    text: tok.txt.clone(),
                    cut: Cut::default(),
                }))
            } else {
                None
            };

            // Lines close at the first token that ends on a later line, or
            // at the end of the source.
            let end_line = match tok.kind {
                TokenKind::Text => {
                    tok.pos.line + tok.txt.bytes().filter(|&b| b == b'\n').count() as u32
                }
                _ => tok.pos.line,
            };
            if line < end_line || is_eof {
                if self.cut_spaces_token && tokens_in_line == 1 {
                    let last = if is_eof {
                        if last_text == first_text {
                            None
                        } else {
                            last_text
                        }
                    } else {
                        text_id
                    };
                    cut_spaces(&mut self.tree, first_text, last);
                }
                line = end_line;
                first_text = text_id;
                last_text = text_id;
                self.cut_spaces_token = false;
                tokens_in_line = 0;
            } else if text_id.is_some() {
                last_text = text_id;
            }

            match tok.kind {
                TokenKind::Eof => {
                    if !self.ancestors.is_empty() {
                        return Err(self.syntax(tok.pos, "unexpected EOF, expecting {% end %}"));
                    }
                    return Ok(());
                }

                TokenKind::Text => {
                    // Inside a switch, text is only legal in a case body.
                    if let Some(parent) = self.parent() {
                        if let Node::Switch { cases, .. } | Node::TypeSwitch { cases, .. } =
                            self.tree.get(parent)
                        {
                            if cases.is_empty() {
                                if contains_only_spaces(&tok.txt) {
                                    continue;
                                }
                                return Err(self.syntax(
                                    tok.pos,
                                    "unexpected text, expecting case of default or {% end %}",
                                ));
                            }
                            let last = *cases.last().expect("cases checked non-empty");
                            if let Node::Case {
                                fallthrough_: true, ..
                            } = self.tree.get(last)
                            {
                                if contains_only_spaces(&tok.txt) {
                                    continue;
                                }
                                return Err(self.syntax(
                                    self.last_fallthrough_pos,
                                    "fallthrough statement out of place",
                                ));
                            }
                        }
                    }
                    self.add_child(text_id.expect("text token without node"));
                }

                TokenKind::StartUrl => {
                    let id = self.tree.add(Node::Url {
                        pos: tok.pos,
                        tag: tok.tag,
                        attribute: tok.att,
                        children: Vec::new(),
                    });
                    self.add_child(id);
                    self.ancestors.push(id);
                }

                TokenKind::EndUrl => {
                    let id = self
                        .ancestors
                        .pop()
                        .expect("end of URL without an open URL");
                    self.tree.get_mut(id).pos_mut().end = tok.pos.end.saturating_sub(1);
                }

                TokenKind::StartStatement => {
                    tokens_in_line += 1;
                    self.parse_statement(tok)?;
                }

                TokenKind::StartValue => {
                    if self.options.no_parse_short_show_stmt {
                        return Err(self.syntax(tok.pos, "short show statement not allowed"));
                    }
                    if self.is_extended && !self.is_in_macro {
                        return Err(self.syntax(tok.pos, "value statement outside macro"));
                    }
                    tokens_in_line += 1;
                    let (expr, tok2) = parse_expr(None, self.lex)?;
                    let Some(expr) = expr else {
                        return Err(self.syntax(tok2.pos, "expecting expression"));
                    };
                    if tok2.kind != TokenKind::EndValue {
                        return Err(
                            self.syntax(tok2.pos, format!("unexpected {tok2}, expecting }}}}"))
                        );
                    }
                    let id = self.tree.add(Node::Value {
                        pos: tok.pos.with_end(tok2.pos.end),
                        expr,
                        context: tok.ctx,
                    });
                    self.add_child(id);
                }

                TokenKind::Comment => {
                    tokens_in_line += 1;
                    let text = tok.txt[2..tok.txt.len() - 2].to_string();
                    let id = self.tree.add(Node::Comment { pos: tok.pos, text });
                    self.add_child(id);
                    self.cut_spaces_token = true;
                }

                _ => {
                    return Err(self.syntax(tok.pos, format!("unexpected {tok}")));
                }
            }
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn parse_statement(&mut self, tok: Token) -> VelaResult<()> {
        let pos = tok.pos;
        let tok = if self.ctx == Context::None {
            tok
        } else {
            self.next()?
        };

        // A switch with no cases only accepts case, default and end.
        if let Some(parent) = self.parent() {
            let empty = match self.tree.get(parent) {
                Node::Switch { cases, .. } | Node::TypeSwitch { cases, .. } => cases.is_empty(),
                _ => false,
            };
            if empty
                && !matches!(
                    tok.kind,
                    TokenKind::Case
                        | TokenKind::Default
                        | TokenKind::End
                        | TokenKind::RightBraces
                )
            {
                return Err(self.syntax(
                    tok.pos,
                    format!("unexpected {tok}, expecting case of default or {{% end %}}"),
                ));
            }
        }

        match tok.kind {
            TokenKind::For => self.stmt_for(pos),
            TokenKind::Break => self.stmt_break(pos, tok),
            TokenKind::Continue => self.stmt_continue(pos, tok),
            TokenKind::Switch => self.stmt_switch(pos),
            TokenKind::Case => self.stmt_case(pos, tok),
            TokenKind::Default => self.stmt_default(pos, tok),
            TokenKind::Fallthrough => self.stmt_fallthrough(pos, tok),
            TokenKind::RightBraces => self.stmt_right_brace(tok),
            TokenKind::Else => self.stmt_else(tok, pos),
            TokenKind::If => self.stmt_if(tok, pos),
            TokenKind::Include => self.stmt_include(pos, tok),
            TokenKind::Show => self.stmt_show(pos, tok),
            TokenKind::Extends => self.stmt_extends(pos, tok),
            TokenKind::Import => self.stmt_import(pos, tok),
            TokenKind::Macro => self.stmt_macro(pos, tok),
            TokenKind::End => self.stmt_end(pos, tok),
            TokenKind::Package => self.stmt_package(pos, tok),
            TokenKind::Go => self.stmt_go(pos, tok),
            _ => self.stmt_expression(pos, tok),
        }
    }

    fn stmt_for(&mut self, pos: Position) -> VelaResult<()> {
        let (variables, tok) = parse_expr_list(None, self.lex)?;
        let mut node: Option<Node> = None;
        let mut tok = tok;
        match tok.kind {
            TokenKind::In => {
                // for ident in expr
                if variables.is_empty() {
                    return Err(self.syntax(tok.pos, "unexpected in, expected expression"));
                }
                if variables.len() > 1 {
                    return Err(
                        self.syntax(*variables[1].pos(), "expected only one expression")
                    );
                }
                let Some(ident) = variables[0].as_identifier().cloned() else {
                    return Err(self.syntax(tok.pos, "unexpected in, expected assignment"));
                };
                if ident.name == "_" {
                    return Err(self.syntax(ident.pos, "cannot use _ as value"));
                }
                let ipos = ident.pos;
                let blank = Expression::Identifier(Identifier::new(
                    Position::new(ipos.line, ipos.column, ipos.start, ipos.start),
                    "_",
                ));
                let (expr, tok2) = parse_expr(None, self.lex)?;
                let Some(expr) = expr else {
                    return Err(
                        self.syntax(tok2.pos, format!("unexpected {tok2}, expecting expression"))
                    );
                };
                let assignment = Assignment {
                    pos: Position::new(ipos.line, ipos.column, ipos.start, expr.pos().end),
                    variables: vec![blank, Expression::Identifier(ident)],
                    typ: AssignmentType::Declaration,
                    values: vec![expr],
                };
                tok = tok2;
                node = Some(Node::ForRange {
                    pos,
                    assignment,
                    body: Vec::new(),
                });
            }
            TokenKind::LeftBraces | TokenKind::EndStatement => {
                if (self.ctx == Context::None) != (tok.kind == TokenKind::LeftBraces) {
                    return Err(self.syntax(
                        tok.pos,
                        format!("unexpected {tok}, expecting expression or %}}"),
                    ));
                }
                // for, or for condition
                if variables.len() > 1 {
                    return Err(
                        self.syntax(tok.pos, format!("unexpected {tok}, expecting expression"))
                    );
                }
                let condition = variables.into_iter().next();
                node = Some(Node::For {
                    pos,
                    init: None,
                    condition,
                    post: None,
                    body: Vec::new(),
                });
            }
            TokenKind::Range => {
                // for range expr
                if !variables.is_empty() {
                    return Err(
                        self.syntax(tok.pos, "unexpected range, expecting := or = or comma")
                    );
                }
                let tpos = tok.pos;
                let (expr, tok2) = parse_expr(None, self.lex)?;
                let Some(expr) = expr else {
                    return Err(
                        self.syntax(tok2.pos, format!("unexpected {tok2}, expecting expression"))
                    );
                };
                let assignment = Assignment {
                    pos: tpos.with_end(expr.pos().end),
                    variables: Vec::new(),
                    typ: AssignmentType::Simple,
                    values: vec![expr],
                };
                tok = tok2;
                node = Some(Node::ForRange {
                    pos,
                    assignment,
                    body: Vec::new(),
                });
            }
            TokenKind::SimpleAssignment
            | TokenKind::Declaration
            | TokenKind::Increment
            | TokenKind::Decrement
            | TokenKind::Semicolon => {
                let mut init: Option<Assignment> = None;
                let mut assignment_type = AssignmentType::Simple;
                if tok.kind != TokenKind::Semicolon {
                    if variables.is_empty() {
                        return Err(
                            self.syntax(tok.pos, format!("unexpected {tok}, expecting expression"))
                        );
                    }
                    if tok.kind == TokenKind::Declaration {
                        assignment_type = AssignmentType::Declaration;
                    }
                    let vars = variables.clone();
                    let (parsed, tok2) = self.parse_assignment(vars, tok)?;
                    if parsed.is_none() && tok2.kind != TokenKind::Range {
                        return Err(self.syntax(
                            tok2.pos,
                            format!("unexpected {tok2}, expecting expression"),
                        ));
                    }
                    init = parsed;
                    tok = tok2;
                }
                if tok.kind == TokenKind::Range {
                    // for index[, ident] := range expr
                    if variables.len() > 2 {
                        return Err(self.syntax(tok.pos, "too many variables in range"));
                    }
                    let (expr, tok2) = parse_expr(None, self.lex)?;
                    let Some(expr) = expr else {
                        return Err(self.syntax(
                            tok2.pos,
                            format!("unexpected {tok2}, expecting expression"),
                        ));
                    };
                    let vpos = *variables[0].pos();
                    let assignment = Assignment {
                        pos: Position::new(vpos.line, vpos.column, vpos.start, expr.pos().end),
                        variables,
                        typ: assignment_type,
                        values: vec![expr],
                    };
                    tok = tok2;
                    node = Some(Node::ForRange {
                        pos,
                        assignment,
                        body: Vec::new(),
                    });
                } else {
                    // for [init]; [condition]; [post]
                    let (condition, tok2) = parse_expr(None, self.lex)?;
                    if tok2.kind != TokenKind::Semicolon {
                        return Err(
                            self.syntax(tok2.pos, format!("unexpected {tok2}, expected semicolon"))
                        );
                    }
                    let (post_variables, tok3) = parse_expr_list(None, self.lex)?;
                    let mut post: Option<Assignment> = None;
                    let mut tok3 = tok3;
                    if !post_variables.is_empty() {
                        let ppos = tok3.pos;
                        let (parsed, tok4) = self.parse_assignment(post_variables, tok3)?;
                        let Some(parsed) = parsed else {
                            return Err(self.syntax(tok4.pos, "expecting expression"));
                        };
                        if parsed.typ == AssignmentType::Declaration {
                            return Err(self.syntax(
                                ppos,
                                "cannot declare in post statement of for loop",
                            ));
                        }
                        post = Some(parsed);
                        tok3 = tok4;
                    }
                    tok = tok3;
                    node = Some(Node::For {
                        pos,
                        init,
                        condition,
                        post,
                        body: Vec::new(),
                    });
                }
            }
            _ => {}
        }
        if node.is_none() || !self.is_block_open(tok.kind) {
            return Err(self.syntax(
                tok.pos,
                format!("unexpected {tok}, expecting expression or %}}"),
            ));
        }
        let mut node = node.expect("for node checked above");
        node.pos_mut().end = tok.pos.end;
        let id = self.tree.add(node);
        self.add_child(id);
        self.ancestors.push(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_break(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        let breakable = self.ancestors.iter().rev().any(|&id| {
            matches!(
                self.tree.get(id),
                Node::For { .. } | Node::ForRange { .. } | Node::Switch { .. }
            )
        });
        if !breakable {
            return Err(self.syntax(tok.pos, "break is not in a loop or switch"));
        }
        let tok = self.next()?;
        if !self.is_terminator(tok.kind) {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let id = self.tree.add(Node::Break {
            pos: pos.with_end(tok.pos.end),
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_continue(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        let in_loop = self.ancestors.iter().rev().any(|&id| {
            matches!(self.tree.get(id), Node::For { .. } | Node::ForRange { .. })
        });
        if !in_loop {
            return Err(self.syntax(tok.pos, "continue is not in a loop"));
        }
        let tok = self.next()?;
        if !self.is_terminator(tok.kind) {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let id = self.tree.add(Node::Continue {
            pos: pos.with_end(tok.pos.end),
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_switch(&mut self, pos: Position) -> VelaResult<()> {
        let tok = self.next()?;
        let node = if self.is_block_open(tok.kind) {
            Node::Switch {
                pos: pos.with_end(tok.pos.end),
                init: None,
                expr: None,
                cases: Vec::new(),
            }
        } else {
            let (mut node, tok) = self.parse_switch_clauses(tok)?;
            if !self.is_block_open(tok.kind) {
                return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
            }
            *node.pos_mut() = pos.with_end(tok.pos.end);
            node
        };
        let id = self.tree.add(node);
        self.add_child(id);
        self.ancestors.push(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    /// Parse the clauses after `switch` up to the block opener: an
    /// optional init assignment and an optional guard, which may be a
    /// plain expression or a type-switch guard.
    fn parse_switch_clauses(&mut self, first: Token) -> VelaResult<(Node, Token)> {
        let pos = first.pos;
        let (exprs, tok) = parse_expr_list(Some(first), self.lex)?;

        if tok.kind.is_assignment() {
            if exprs.is_empty() {
                return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting expression")));
            }
            let (assignment, tok2) = self.parse_assignment(exprs, tok)?;
            let Some(assignment) = assignment else {
                return Err(self.syntax(tok2.pos, "expecting expression"));
            };
            if self.is_block_open(tok2.kind) {
                // The assignment is the guard itself: `switch v := e.(type)`.
                if !is_type_guard(&assignment) {
                    return Err(
                        self.syntax(tok2.pos, format!("{assignment} used as value"))
                    );
                }
                return Ok((
                    Node::TypeSwitch {
                        pos,
                        init: None,
                        assignment,
                        cases: Vec::new(),
                    },
                    tok2,
                ));
            }
            if tok2.kind != TokenKind::Semicolon {
                return Err(self.syntax(tok2.pos, format!("unexpected {tok2}, expecting %}}")));
            }
            // The assignment was the init; parse the guard clause.
            let (node, tok3) = self.parse_switch_guard(pos, Some(assignment))?;
            return Ok((node, tok3));
        }

        // No assignment: a bare guard expression.
        self.switch_guard_from_exprs(pos, None, exprs, tok)
    }

    fn parse_switch_guard(
        &mut self,
        pos: Position,
        init: Option<Assignment>,
    ) -> VelaResult<(Node, Token)> {
        let tok = self.next()?;
        if self.is_block_open(tok.kind) {
            return Ok((
                Node::Switch {
                    pos,
                    init,
                    expr: None,
                    cases: Vec::new(),
                },
                tok,
            ));
        }
        let (exprs, tok2) = parse_expr_list(Some(tok), self.lex)?;
        if tok2.kind.is_assignment() {
            if exprs.is_empty() {
                return Err(
                    self.syntax(tok2.pos, format!("unexpected {tok2}, expecting expression"))
                );
            }
            let (assignment, tok3) = self.parse_assignment(exprs, tok2)?;
            let Some(assignment) = assignment else {
                return Err(self.syntax(tok3.pos, "expecting expression"));
            };
            if !is_type_guard(&assignment) {
                return Err(self.syntax(tok3.pos, format!("{assignment} used as value")));
            }
            return Ok((
                Node::TypeSwitch {
                    pos,
                    init,
                    assignment,
                    cases: Vec::new(),
                },
                tok3,
            ));
        }
        self.switch_guard_from_exprs(pos, init, exprs, tok2)
    }

    fn switch_guard_from_exprs(
        &mut self,
        pos: Position,
        init: Option<Assignment>,
        exprs: Vec<Expression>,
        tok: Token,
    ) -> VelaResult<(Node, Token)> {
        if exprs.len() > 1 {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let Some(guard) = exprs.into_iter().next() else {
            return Err(self.syntax(
                tok.pos,
                format!("unexpected {tok}, expecting expression or %}}"),
            ));
        };
        if matches!(guard, Expression::TypeAssertion { typ: None, .. }) {
            // `switch e.(type)`: a guard with no bound variable.
            let gpos = *guard.pos();
            let assignment = Assignment {
                pos: gpos,
                variables: Vec::new(),
                typ: AssignmentType::Simple,
                values: vec![guard],
            };
            return Ok((
                Node::TypeSwitch {
                    pos,
                    init,
                    assignment,
                    cases: Vec::new(),
                },
                tok,
            ));
        }
        Ok((
            Node::Switch {
                pos,
                init,
                expr: Some(guard),
                cases: Vec::new(),
            },
            tok,
        ))
    }

    fn stmt_case(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        let Some(parent) = self.parent() else {
            return Err(self.syntax(tok.pos, "unexpected case"));
        };
        let is_type_switch = match self.tree.get(parent) {
            Node::Switch { .. } => false,
            Node::TypeSwitch { .. } => true,
            _ => return Err(self.syntax(tok.pos, "unexpected case")),
        };
        let (expressions, tok) = parse_expr_list(None, self.lex)?;
        let terminator_ok = if self.ctx == Context::None {
            tok.kind == TokenKind::Colon
        } else {
            tok.kind == TokenKind::EndStatement
        };
        if !terminator_ok {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        if is_type_switch {
            // Literals are values, not types. Other expressions are left
            // to the type checker.
            for expr in &expressions {
                match expr {
                    Expression::Identifier(ident)
                        if ident.name == "true" || ident.name == "false" =>
                    {
                        return Err(self.syntax(
                            tok.pos,
                            format!("{} (type bool) is not a type", ident.name),
                        ));
                    }
                    Expression::Int { .. } => {
                        return Err(
                            self.syntax(tok.pos, format!("{expr} (type int) is not a type"))
                        );
                    }
                    Expression::Float { .. } => {
                        return Err(
                            self.syntax(tok.pos, format!("{expr} (type float) is not a type"))
                        );
                    }
                    Expression::String { .. } => {
                        return Err(
                            self.syntax(tok.pos, format!("{expr} (type string) is not a type"))
                        );
                    }
                    _ => {}
                }
            }
        }
        let id = self.tree.add(Node::Case {
            pos: pos.with_end(tok.pos.end),
            expressions,
            body: Vec::new(),
            fallthrough_: false,
        });
        self.add_child(id);
        Ok(())
    }

    fn stmt_default(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        let Some(parent) = self.parent() else {
            return Err(self.syntax(tok.pos, "unexpected default"));
        };
        let cases = match self.tree.get(parent) {
            Node::Switch { cases, .. } | Node::TypeSwitch { cases, .. } => cases.clone(),
            _ => return Err(self.syntax(tok.pos, "unexpected default")),
        };
        for case in cases {
            if let Node::Case {
                expressions, pos, ..
            } = self.tree.get(case)
            {
                if expressions.is_empty() {
                    return Err(self.syntax(
                        tok.pos,
                        format!("multiple defaults in switch (first at {pos})"),
                    ));
                }
            }
        }
        let tok = self.next()?;
        let terminator_ok = if self.ctx == Context::None {
            tok.kind == TokenKind::Colon
        } else {
            tok.kind == TokenKind::EndStatement
        };
        if !terminator_ok {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let id = self.tree.add(Node::Case {
            pos: pos.with_end(tok.pos.end),
            expressions: Vec::new(),
            body: Vec::new(),
            fallthrough_: false,
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_fallthrough(&mut self, _pos: Position, tok: Token) -> VelaResult<()> {
        self.last_fallthrough_pos = tok.pos;
        let tok = self.next()?;
        if !self.is_terminator(tok.kind) {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let Some(parent) = self.parent() else {
            return Err(self.syntax(tok.pos, "fallthrough statement out of place"));
        };
        match self.tree.get(parent) {
            Node::Switch { cases, .. } => {
                let last = *cases.last().expect("switch case list is empty");
                match self.tree.get_mut(last) {
                    Node::Case { fallthrough_, .. } => {
                        if *fallthrough_ {
                            return Err(
                                self.syntax(tok.pos, "fallthrough statement out of place")
                            );
                        }
                        *fallthrough_ = true;
                    }
                    _ => panic!("switch case list holds a non-case node"),
                }
            }
            Node::TypeSwitch { .. } => {
                return Err(self.syntax(tok.pos, "cannot fallthrough in type switch"));
            }
            _ => {
                return Err(self.syntax(tok.pos, "fallthrough statement out of place"));
            }
        }
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_right_brace(&mut self, tok: Token) -> VelaResult<()> {
        if self.ctx != Context::None {
            return Err(self.syntax(
                tok.pos,
                format!("unexpected {tok}, expecting for, if, show, extends, include, macro or end"),
            ));
        }
        if self.ancestors.is_empty() {
            return Err(self.syntax(tok.pos, "not opened brace"));
        }
        let braces_end = tok.pos.end;
        let closed = self.ancestors.pop().expect("ancestors checked non-empty");
        self.tree.get_mut(closed).pos_mut().end = braces_end;
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Else => {
                let pos = tok.pos;
                self.stmt_else(tok, pos)
            }
            TokenKind::Semicolon => {
                while let Some(&parent) = self.ancestors.last() {
                    if matches!(self.tree.get(parent), Node::If { .. }) {
                        self.tree.get_mut(parent).pos_mut().end = braces_end;
                        self.ancestors.pop();
                    } else {
                        break;
                    }
                }
                Ok(())
            }
            TokenKind::Eof => {
                if !self.ancestors.is_empty() {
                    return Err(self.syntax(tok.pos, "unexpected EOF, expecting }"));
                }
                self.done = true;
                Ok(())
            }
            _ => Err(self.syntax(
                tok.pos,
                format!("unexpected {tok} at end of statement"),
            )),
        }
    }

    fn stmt_else(&mut self, tok: Token, pos: Position) -> VelaResult<()> {
        if self.ctx == Context::None {
            if self.ancestors.is_empty() {
                return Err(self.syntax(tok.pos, "unexpected else"));
            }
        } else {
            // Close the then block.
            let Some(&parent) = self.ancestors.last() else {
                return Err(self.syntax(tok.pos, "unexpected else"));
            };
            if !matches!(self.tree.get(parent), Node::Block { .. }) {
                return Err(self.syntax(tok.pos, "unexpected else"));
            }
            self.ancestors.pop();
        }
        let Some(&parent) = self.ancestors.last() else {
            return Err(self.syntax(tok.pos, "unexpected else at end of statement"));
        };
        if !matches!(self.tree.get(parent), Node::If { .. }) {
            return Err(self.syntax(tok.pos, "unexpected else at end of statement"));
        }
        self.cut_spaces_token = true;
        let tok = self.next()?;
        if self.is_block_open(tok.kind) {
            // A plain else block.
            let block = self.tree.add(Node::Block {
                pos: tok.pos,
                nodes: Vec::new(),
            });
            self.add_child(block);
            self.ancestors.push(block);
            return Ok(());
        }
        if tok.kind != TokenKind::If {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting if or %}}")));
        }
        self.stmt_if(tok, pos)
    }

    fn stmt_if(&mut self, if_tok: Token, stmt_pos: Position) -> VelaResult<()> {
        let if_pos = if_tok.pos;
        let (expressions, tok) = parse_expr_list(None, self.lex)?;
        if expressions.is_empty() {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting expression")));
        }
        let mut assignment: Option<Assignment> = None;
        let expr: Expression;
        let mut tok = tok;
        if expressions.len() > 1
            || tok.kind == TokenKind::SimpleAssignment
            || tok.kind == TokenKind::Declaration
        {
            let (parsed, tok2) = self.parse_assignment(expressions, tok)?;
            let Some(parsed) = parsed else {
                return Err(self.syntax(tok2.pos, "expecting expression"));
            };
            if tok2.kind != TokenKind::Semicolon {
                return Err(self.syntax(tok2.pos, format!("{parsed} used as value")));
            }
            let (cond, tok3) = parse_expr(None, self.lex)?;
            let Some(cond) = cond else {
                return Err(self.syntax(tok3.pos, "missing condition in if statement"));
            };
            assignment = Some(parsed);
            expr = cond;
            tok = tok3;
        } else {
            expr = expressions
                .into_iter()
                .next()
                .expect("expressions checked non-empty");
        }
        if !self.is_block_open(tok.kind) {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let then = self.tree.add(Node::Block {
            pos: tok.pos,
            nodes: Vec::new(),
        });
        let parent_is_if = self
            .parent()
            .is_some_and(|id| matches!(self.tree.get(id), Node::If { .. }));
        let if_pos = if parent_is_if {
            if_pos
        } else {
            stmt_pos.with_end(tok.pos.end)
        };
        let id = self.tree.add(Node::If {
            pos: if_pos,
            init: assignment,
            condition: expr,
            then,
            els: None,
        });
        self.add_child(id);
        self.ancestors.push(id);
        self.ancestors.push(then);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_include(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if self.ctx == Context::None {
            return Err(self.syntax(tok.pos, "include statement not in template"));
        }
        if self.is_extended && !self.is_in_macro {
            return Err(self.syntax(tok.pos, "include statement outside macro"));
        }
        if tok.ctx == Context::Attribute || tok.ctx == Context::UnquotedAttribute {
            return Err(self.syntax(tok.pos, "include statement inside an attribute value"));
        }
        let tok = self.next()?;
        if tok.kind != TokenKind::InterpretedString && tok.kind != TokenKind::RawString {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting string")));
        }
        let path = unquote_string(&tok.txt);
        if !valid_path(&path) {
            return Err(self.syntax(tok.pos, format!("invalid path {path:?}")));
        }
        let tok = self.next()?;
        if tok.kind != TokenKind::EndStatement {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting ( or %}}")));
        }
        let id = self.tree.add(Node::Include {
            pos: pos.with_end(tok.pos.end),
            path,
            context: tok.ctx,
            tree: None,
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_show(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if self.ctx == Context::None {
            return Err(self.syntax(tok.pos, "show statement not in template"));
        }
        if self.is_extended && !self.is_in_macro {
            return Err(self.syntax(tok.pos, "show statement outside macro"));
        }
        if tok.ctx == Context::Attribute || tok.ctx == Context::UnquotedAttribute {
            return Err(self.syntax(tok.pos, "show statement inside an attribute value"));
        }
        let tok = self.next()?;
        if tok.kind != TokenKind::Identifier {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting identifier")));
        }
        if tok.txt == "_" {
            return Err(self.syntax(tok.pos, "cannot use _ as value"));
        }
        let mut macro_ident = Identifier::new(tok.pos, tok.txt);
        let mut import: Option<Identifier> = None;
        let mut tok = self.next()?;
        if tok.kind == TokenKind::Period {
            let next = self.next()?;
            if next.kind != TokenKind::Identifier {
                return Err(
                    self.syntax(next.pos, format!("unexpected {next}, expecting identifier"))
                );
            }
            if next.txt == "_" {
                return Err(self.syntax(next.pos, "cannot use _ as value"));
            }
            import = Some(macro_ident);
            macro_ident = Identifier::new(next.pos, next.txt);
            if !macro_ident
                .name
                .chars()
                .next()
                .is_some_and(char::is_uppercase)
            {
                return Err(self.syntax(
                    next.pos,
                    format!("cannot refer to unexported macro {}", macro_ident.name),
                ));
            }
            tok = self.next()?;
        }
        let mut arguments: Vec<Expression> = Vec::new();
        if tok.kind == TokenKind::LeftParenthesis {
            loop {
                let (expr, tok2) = parse_expr(None, self.lex)?;
                let Some(expr) = expr else {
                    return Err(self.syntax(
                        tok2.pos,
                        format!("unexpected {tok2}, expecting expression"),
                    ));
                };
                arguments.push(expr);
                if tok2.kind == TokenKind::RightParenthesis {
                    break;
                }
                if tok2.kind != TokenKind::Comma {
                    return Err(
                        self.syntax(tok2.pos, format!("unexpected {tok2}, expecting , or )"))
                    );
                }
            }
            tok = self.next()?;
            if tok.kind != TokenKind::EndStatement {
                return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
            }
        }
        if tok.kind != TokenKind::EndStatement {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting ( or %}}")));
        }
        let id = self.tree.add(Node::ShowMacro {
            pos: pos.with_end(tok.pos.end),
            import,
            name: macro_ident,
            arguments,
            context: tok.ctx,
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_extends(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if self.ctx == Context::None {
            return Err(self.syntax(tok.pos, "extends statement not in template"));
        }
        if self.is_extended {
            return Err(self.syntax(tok.pos, "extends already exists"));
        }
        if !self.tree.nodes.is_empty() {
            let only_leading_text = self.tree.nodes.len() == 1
                && matches!(self.tree.get(self.tree.nodes[0]), Node::Text { .. });
            if !only_leading_text {
                return Err(self.syntax(tok.pos, "extends can only be the first statement"));
            }
        }
        if tok.ctx != self.ctx {
            match tok.ctx {
                Context::Attribute | Context::UnquotedAttribute => {
                    return Err(self.syntax(tok.pos, "extends inside an attribute value"));
                }
                Context::Script => {
                    return Err(self.syntax(tok.pos, "extends inside a script tag"));
                }
                Context::Css => {
                    return Err(self.syntax(tok.pos, "extends inside a style tag"));
                }
                _ => {}
            }
        }
        let tok = self.next()?;
        if tok.kind != TokenKind::InterpretedString && tok.kind != TokenKind::RawString {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting string")));
        }
        let path = unquote_string(&tok.txt);
        if !valid_path(&path) {
            return Err(self.syntax(tok.pos, format!("invalid extends path {path:?}")));
        }
        let tok = self.next()?;
        if tok.kind != TokenKind::EndStatement {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let id = self.tree.add(Node::Extends {
            pos: pos.with_end(tok.pos.end),
            path,
            context: tok.ctx,
            tree: None,
        });
        self.add_child(id);
        self.is_extended = true;
        Ok(())
    }

    fn stmt_import(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if tok.ctx != self.ctx {
            match tok.ctx {
                Context::Attribute | Context::UnquotedAttribute => {
                    return Err(self.syntax(tok.pos, "import inside an attribute value"));
                }
                Context::Script => {
                    return Err(self.syntax(tok.pos, "import inside a script tag"));
                }
                Context::Css => {
                    return Err(self.syntax(tok.pos, "import inside a style tag"));
                }
                _ => {}
            }
        }
        self.check_clear_of_containers(&tok)?;
        let mut tok = self.next()?;
        let mut ident: Option<Identifier> = None;
        if tok.kind == TokenKind::Identifier {
            ident = Some(Identifier::new(tok.pos, tok.txt.clone()));
            tok = self.next()?;
        }
        if tok.kind != TokenKind::InterpretedString && tok.kind != TokenKind::RawString {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting string")));
        }
        let path = unquote_string(&tok.txt);
        if !valid_path(&path) {
            return Err(self.syntax(tok.pos, format!("invalid import path {path:?}")));
        }
        let tok = self.next()?;
        if !self.is_terminator(tok.kind) {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
        }
        let id = self.tree.add(Node::Import {
            pos: pos.with_end(tok.pos.end),
            ident,
            path,
            context: tok.ctx,
            tree: None,
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    /// Import and macro statements are only legal outside open for, if and
    /// macro containers.
    fn check_clear_of_containers(&self, tok: &Token) -> VelaResult<()> {
        for &id in self.ancestors.iter().rev() {
            match self.tree.get(id) {
                Node::For { .. } | Node::ForRange { .. } => {
                    return Err(
                        self.syntax(tok.pos, format!("unexpected {tok}, expecting end for"))
                    );
                }
                Node::If { .. } => {
                    return Err(
                        self.syntax(tok.pos, format!("unexpected {tok}, expecting end if"))
                    );
                }
                Node::Macro { .. } => {
                    return Err(
                        self.syntax(tok.pos, format!("unexpected {tok}, expecting end macro"))
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn stmt_macro(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if self.ctx == Context::None {
            return Err(self.syntax(tok.pos, "macro statement not in template"));
        }
        if tok.ctx == Context::Attribute || tok.ctx == Context::UnquotedAttribute {
            return Err(self.syntax(tok.pos, "macro inside an attribute value"));
        }
        self.check_clear_of_containers(&tok)?;
        let tok = self.next()?;
        if tok.kind != TokenKind::Identifier {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting identifier")));
        }
        if tok.txt == "_" {
            return Err(self.syntax(tok.pos, "cannot use _ as value"));
        }
        let ident = Identifier::new(tok.pos, tok.txt);
        let mut tok = self.next()?;
        let mut parameters: Vec<Identifier> = Vec::new();
        let mut ellipsis_pos: Option<Position> = None;
        if tok.kind == TokenKind::LeftParenthesis {
            loop {
                let param = self.next()?;
                if param.kind != TokenKind::Identifier {
                    return Err(
                        self.syntax(param.pos, format!("unexpected {param}, expecting identifier"))
                    );
                }
                if let Some(epos) = ellipsis_pos {
                    return Err(self.syntax(epos, "cannot use ... with non-final parameter"));
                }
                parameters.push(Identifier::new(param.pos, param.txt));
                let mut sep = self.next()?;
                if sep.kind == TokenKind::Ellipsis {
                    ellipsis_pos = Some(sep.pos);
                    sep = self.next()?;
                }
                if sep.kind == TokenKind::RightParenthesis {
                    break;
                }
                if sep.kind != TokenKind::Comma {
                    return Err(self.syntax(sep.pos, format!("unexpected {sep}, expecting , or )")));
                }
            }
            tok = self.next()?;
            if tok.kind != TokenKind::EndStatement {
                return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
            }
        } else if tok.kind != TokenKind::EndStatement {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting ( or %}}")));
        }
        let id = self.tree.add(Node::Macro {
            pos: pos.with_end(tok.pos.end),
            ident,
            parameters,
            body: Vec::new(),
            is_variadic: ellipsis_pos.is_some(),
            context: tok.ctx,
        });
        self.add_child(id);
        self.ancestors.push(id);
        self.cut_spaces_token = true;
        self.is_in_macro = true;
        Ok(())
    }

    fn stmt_end(&mut self, _pos: Position, tok: Token) -> VelaResult<()> {
        if self.ctx == Context::None {
            return Err(self.syntax(tok.pos, "end statement not in template"));
        }
        let parent_is_url = self
            .parent()
            .is_some_and(|id| matches!(self.tree.get(id), Node::Url { .. }));
        if parent_is_url || self.ancestors.is_empty() {
            return Err(self.syntax(tok.pos, format!("unexpected {tok}")));
        }
        if self
            .parent()
            .is_some_and(|id| matches!(self.tree.get(id), Node::Block { .. }))
        {
            self.ancestors.pop();
        }
        let parent = self.parent().expect("ancestors checked non-empty");
        let mut tok = self.next()?;
        if tok.kind != TokenKind::EndStatement {
            // `end for`, `end if`, `end macro`, `end switch`.
            let keyword = tok;
            tok = self.next()?;
            if tok.kind != TokenKind::EndStatement {
                return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
            }
            let expected = match self.tree.get(parent) {
                Node::For { .. } | Node::ForRange { .. } => Some(("for", TokenKind::For)),
                Node::If { .. } => Some(("if", TokenKind::If)),
                Node::Macro { .. } => Some(("macro", TokenKind::Macro)),
                Node::Switch { .. } | Node::TypeSwitch { .. } => {
                    Some(("switch", TokenKind::Switch))
                }
                _ => None,
            };
            if let Some((name, kind)) = expected {
                if keyword.kind != kind {
                    return Err(self.syntax(
                        keyword.pos,
                        format!("unexpected {keyword}, expecting {name} or %}}"),
                    ));
                }
            }
        }
        let ended_macro = matches!(self.tree.get(parent), Node::Macro { .. });
        self.tree.get_mut(parent).pos_mut().end = tok.pos.end;
        self.ancestors.pop();
        // An end closes the whole chain of if statements it belongs to.
        while let Some(&id) = self.ancestors.last() {
            if matches!(self.tree.get(id), Node::If { .. }) {
                self.tree.get_mut(id).pos_mut().end = tok.pos.end;
                self.ancestors.pop();
            } else {
                break;
            }
        }
        if ended_macro {
            self.is_in_macro = false;
        }
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_package(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if self.ctx != Context::None {
            return Err(self.syntax(tok.pos, "unexpected package"));
        }
        if self.parent().is_some() || !self.tree.nodes.is_empty() {
            return Err(self.syntax(tok.pos, "unexpected package"));
        }
        let name = self.next()?;
        if name.kind != TokenKind::Identifier {
            return Err(self.syntax(name.pos, format!("unexpected {name}, expecting name")));
        }
        let tok = self.next()?;
        if tok.kind != TokenKind::Semicolon {
            return Err(self.syntax(
                tok.pos,
                format!("unexpected {tok}, expecting semicolon or newline"),
            ));
        }
        let id = self.tree.add(Node::Package {
            pos: pos.with_end(tok.pos.end),
            name: name.txt,
        });
        self.add_child(id);
        Ok(())
    }

    fn stmt_go(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        if self.options.disallow_go_stmt {
            return Err(self.syntax(tok.pos, "\"go\" statement not available"));
        }
        let (expr, tok2) = parse_expr(None, self.lex)?;
        let Some(expr) = expr else {
            return Err(
                self.syntax(tok2.pos, format!("unexpected {tok2}, expecting expression"))
            );
        };
        if !matches!(expr, Expression::Call { .. }) {
            return Err(self.syntax(*expr.pos(), "expression in go must be function call"));
        }
        if !self.is_terminator(tok2.kind) {
            return Err(self.syntax(tok2.pos, format!("unexpected {tok2}, expecting %}}")));
        }
        let id = self.tree.add(Node::Go {
            pos: pos.with_end(tok2.pos.end),
            call: expr,
        });
        self.add_child(id);
        self.cut_spaces_token = true;
        Ok(())
    }

    fn stmt_expression(&mut self, pos: Position, tok: Token) -> VelaResult<()> {
        let (expressions, tok) = parse_expr_list(Some(tok), self.lex)?;
        if expressions.is_empty() {
            return Err(self.syntax(
                tok.pos,
                format!("unexpected {tok}, expecting for, if, show, extends, include, macro or end"),
            ));
        }
        // A label: a single identifier followed by a colon, program mode.
        if self.ctx == Context::None
            && tok.kind == TokenKind::Colon
            && expressions.len() == 1
        {
            if let Some(ident) = expressions[0].as_identifier().cloned() {
                return self.stmt_label(pos, ident, tok);
            }
        }
        if expressions.len() > 1 || tok.kind.is_assignment() {
            let (assignment, tok2) = self.parse_assignment(expressions, tok)?;
            let Some(mut assignment) = assignment else {
                return Err(self.syntax(tok2.pos, "expecting expression"));
            };
            if !self.is_terminator(tok2.kind) {
                return Err(self.syntax(tok2.pos, format!("unexpected {tok2}, expecting %}}")));
            }
            assignment.pos = pos.with_end(tok2.pos.end);
            let id = self.tree.add(Node::Assignment(assignment));
            self.add_child(id);
            self.cut_spaces_token = true;
        } else {
            let expr = expressions
                .into_iter()
                .next()
                .expect("expressions checked non-empty");
            if let Some(ident) = expr.as_identifier() {
                if ident.name == "_" {
                    return Err(self.syntax(*expr.pos(), "cannot use _ as value"));
                }
            }
            if !self.is_terminator(tok.kind) {
                return Err(self.syntax(tok.pos, format!("unexpected {tok}, expecting %}}")));
            }
            let id = self.tree.add(Node::Expr(expr));
            self.add_child(id);
            self.cut_spaces_token = true;
        }
        Ok(())
    }

    fn stmt_label(&mut self, pos: Position, ident: Identifier, colon: Token) -> VelaResult<()> {
        let label = self.tree.add(Node::Label {
            pos: pos.with_end(colon.pos.end),
            ident,
            statement: None,
        });
        self.add_child(label);
        let tok = self.next()?;
        match tok.kind {
            TokenKind::For | TokenKind::Switch => {
                // The labeled statement stays open on the ancestor stack;
                // detach it from the parent it was added under and hang it
                // off the label instead.
                let depth = self.ancestors.len();
                self.parse_statement(tok)?;
                let statement = self.ancestors[depth];
                let parent = if depth == 0 {
                    None
                } else {
                    Some(self.ancestors[depth - 1])
                };
                let detached = self.detach_last_child(parent);
                debug_assert_eq!(detached, statement);
                match self.tree.get_mut(label) {
                    Node::Label { statement: slot, .. } => *slot = Some(statement),
                    _ => panic!("label node expected"),
                }
                Ok(())
            }
            _ => Err(self.syntax(
                tok.pos,
                format!("unexpected {tok}, expecting for or switch"),
            )),
        }
    }

    /// Parse an assignment following the already-parsed targets, or return
    /// `None` when no value follows the operator (as in `for k := range`).
    fn parse_assignment(
        &mut self,
        variables: Vec<Expression>,
        tok: Token,
    ) -> VelaResult<(Option<Assignment>, Token)> {
        let typ = match tok.kind {
            TokenKind::SimpleAssignment => AssignmentType::Simple,
            TokenKind::Declaration => AssignmentType::Declaration,
            TokenKind::Increment => AssignmentType::Increment,
            TokenKind::Decrement => AssignmentType::Decrement,
            _ => {
                return Err(
                    self.syntax(tok.pos, format!("unexpected {tok}, expecting := or = or comma"))
                );
            }
        };
        for v in &variables {
            let ok = match v {
                Expression::Identifier(_) => true,
                Expression::Selector { .. } | Expression::Index { .. } => {
                    typ != AssignmentType::Declaration
                }
                Expression::UnaryOperator { op, .. } => *op == Operator::Multiplication,
                _ => false,
            };
            if !ok {
                return Err(self.syntax(*v.pos(), format!("{v} used as value")));
            }
        }
        let assign_pos = tok.pos;
        let vpos = *variables[0].pos();
        let mut pos = Position::new(vpos.line, vpos.column, vpos.start, tok.pos.end);
        match typ {
            AssignmentType::Simple | AssignmentType::Declaration => {
                let (values, tok) = parse_expr_list(None, self.lex)?;
                if values.is_empty() {
                    return Ok((None, tok));
                }
                if values.len() == 1 {
                    let mismatch = match values[0] {
                        Expression::Call { .. } => false,
                        Expression::Index { .. }
                        | Expression::Selector { .. }
                        | Expression::TypeAssertion { .. } => variables.len() > 2,
                        _ => variables.len() > 1,
                    };
                    if mismatch {
                        return Err(self.syntax(
                            assign_pos,
                            format!(
                                "assignment mismatch: {} variables but 1 values",
                                variables.len()
                            ),
                        ));
                    }
                } else if variables.len() != values.len() {
                    return Err(self.syntax(
                        assign_pos,
                        format!(
                            "assignment mismatch: {} variables but {} values",
                            variables.len(),
                            values.len()
                        ),
                    ));
                }
                pos.end = values.last().expect("values checked non-empty").pos().end;
                Ok((
                    Some(Assignment {
                        pos,
                        variables,
                        typ,
                        values,
                    }),
                    tok,
                ))
            }
            AssignmentType::Increment | AssignmentType::Decrement => {
                if variables.len() > 1 {
                    return Err(self.syntax(
                        tok.pos,
                        format!("unexpected {tok}, expecting := or = or comma"),
                    ));
                }
                if let Some(ident) = variables[0].as_identifier() {
                    if ident.name == "_" {
                        return Err(self.syntax(*variables[0].pos(), "cannot use _ as value"));
                    }
                }
                let tok = self.next()?;
                Ok((
                    Some(Assignment {
                        pos,
                        variables,
                        typ,
                        values: Vec::new(),
                    }),
                    tok,
                ))
            }
        }
    }
}

/// Whether an assignment is a type-switch guard: a declaration of one
/// variable from a single `expr.(type)` value.
fn is_type_guard(assignment: &Assignment) -> bool {
    assignment.typ == AssignmentType::Declaration
        && assignment.variables.len() == 1
        && assignment.values.len() == 1
        && matches!(
            assignment.values[0],
            Expression::TypeAssertion { typ: None, .. }
        )
}
