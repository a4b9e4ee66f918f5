//! Integration tests for the statement parser, covering both template and
//! program mode.

use vela_core::{Context, Position, VelaError};
use vela_parser::ast::{AssignmentType, Expression, Node, NodeId};
use vela_parser::{parse_source, parse_tokens, ParseOptions, Token, TokenKind, Tree};

fn parse(src: &str, ctx: Context) -> Tree {
    parse_source(src.as_bytes(), ctx, &ParseOptions::default())
        .unwrap_or_else(|err| panic!("parse error: {err}"))
}

fn parse_err(src: &str, ctx: Context) -> VelaError {
    parse_source(src.as_bytes(), ctx, &ParseOptions::default())
        .err()
        .expect("expected a parse error")
}

fn error_message(err: &VelaError) -> String {
    match err {
        VelaError::Syntax { message, .. } => message.clone(),
        other => panic!("expected a syntax error, got {other:?}"),
    }
}

// =============================================================================
// Template mode
// =============================================================================

#[test]
fn test_text_value_text() {
    let tree = parse("a{{ x }}b", Context::Html);
    assert_eq!(tree.nodes.len(), 3);
    assert!(matches!(tree.get(tree.nodes[0]), Node::Text { .. }));
    match tree.get(tree.nodes[1]) {
        Node::Value { expr, context, .. } => {
            assert_eq!(expr.to_string(), "x");
            assert_eq!(*context, Context::Html);
        }
        other => panic!("unexpected node {other:?}"),
    }
    assert!(matches!(tree.get(tree.nodes[2]), Node::Text { .. }));
}

#[test]
fn test_if_else_chain() {
    let tree = parse("{% if x %}a{% else if y %}b{% else %}c{% end %}", Context::Html);
    assert_eq!(tree.nodes.len(), 1);
    let Node::If { then, els, .. } = tree.get(tree.nodes[0]) else {
        panic!("expected an if node");
    };
    let Node::Block { nodes, .. } = tree.get(*then) else {
        panic!("expected a then block");
    };
    assert_eq!(nodes.len(), 1);
    let Node::If { els: inner_els, .. } = tree.get(els.expect("missing else")) else {
        panic!("expected an else-if node");
    };
    let Node::Block { .. } = tree.get(inner_els.expect("missing final else")) else {
        panic!("expected a final else block");
    };
}

#[test]
fn test_end_with_keyword() {
    parse("{% if x %}a{% end if %}", Context::Html);
    parse("{% for %}a{% end for %}", Context::Html);
    let err = parse_err("{% if x %}a{% end for %}", Context::Html);
    assert_eq!(error_message(&err), "unexpected for, expecting if or %}");
}

#[test]
fn test_for_forms() {
    // Infinite.
    let tree = parse("{% for %}a{% end %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::For {
            init: None,
            condition: None,
            post: None,
            ..
        } => {}
        other => panic!("unexpected node {other:?}"),
    }
    // Condition only.
    let tree = parse("{% for x > 3 %}a{% end %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::For {
            condition: Some(cond),
            ..
        } => assert_eq!(cond.to_string(), "x > 3"),
        other => panic!("unexpected node {other:?}"),
    }
    // C-style.
    let tree = parse("{% for i := 0; i < 10; i++ %}a{% end %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::For {
            init: Some(init),
            condition: Some(_),
            post: Some(post),
            ..
        } => {
            assert_eq!(init.typ, AssignmentType::Declaration);
            assert_eq!(post.typ, AssignmentType::Increment);
        }
        other => panic!("unexpected node {other:?}"),
    }
    // Range.
    let tree = parse("{% for k, v := range items %}a{% end %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::ForRange { assignment, .. } => {
            assert_eq!(assignment.variables.len(), 2);
            assert_eq!(assignment.typ, AssignmentType::Declaration);
        }
        other => panic!("unexpected node {other:?}"),
    }
    // Bare range.
    let tree = parse("{% for range items %}a{% end %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::ForRange { assignment, .. } => assert!(assignment.variables.is_empty()),
        other => panic!("unexpected node {other:?}"),
    }
    // The in form desugars to a range with a blank key.
    let tree = parse("{% for p in products %}a{% end %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::ForRange { assignment, .. } => {
            assert_eq!(assignment.variables.len(), 2);
            assert_eq!(assignment.variables[0].to_string(), "_");
            assert_eq!(assignment.variables[1].to_string(), "p");
        }
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_too_many_range_variables() {
    let err = parse_err("{% for a, b, c := range items %}{% end %}", Context::Html);
    assert_eq!(error_message(&err), "too many variables in range");
}

#[test]
fn test_declaration_in_post_statement() {
    let err = parse_err("{% for i := 0; i < 10; j := 2 %}{% end %}", Context::Html);
    assert_eq!(
        error_message(&err),
        "cannot declare in post statement of for loop"
    );
}

#[test]
fn test_break_and_continue_placement() {
    parse("{% for %}{% break %}{% end %}", Context::Html);
    parse("{% for %}{% continue %}{% end %}", Context::Html);
    parse(
        "{% switch x %}{% case 1 %}{% break %}{% end %}",
        Context::Html,
    );
    let err = parse_err("{% break %}", Context::Html);
    assert_eq!(error_message(&err), "break is not in a loop or switch");
    let err = parse_err("{% continue %}", Context::Html);
    assert_eq!(error_message(&err), "continue is not in a loop");
    let err = parse_err(
        "{% switch x %}{% case 1 %}{% continue %}{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "continue is not in a loop");
}

#[test]
fn test_switch_cases_and_default() {
    let tree = parse(
        "{% switch x %}{% case 1, 2 %}a{% case 3 %}b{% default %}c{% end switch %}",
        Context::Html,
    );
    let Node::Switch { expr, cases, .. } = tree.get(tree.nodes[0]) else {
        panic!("expected a switch node");
    };
    assert_eq!(expr.as_ref().map(ToString::to_string).as_deref(), Some("x"));
    assert_eq!(cases.len(), 3);
    match tree.get(cases[0]) {
        Node::Case {
            expressions, body, ..
        } => {
            assert_eq!(expressions.len(), 2);
            assert_eq!(body.len(), 1);
        }
        other => panic!("unexpected node {other:?}"),
    }
    match tree.get(cases[2]) {
        Node::Case { expressions, .. } => assert!(expressions.is_empty()),
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_switch_with_init() {
    let tree = parse(
        "{% switch x := f(); x %}{% case 1 %}a{% end %}",
        Context::Html,
    );
    let Node::Switch { init, expr, .. } = tree.get(tree.nodes[0]) else {
        panic!("expected a switch node");
    };
    assert!(init.is_some());
    assert_eq!(expr.as_ref().map(ToString::to_string).as_deref(), Some("x"));
}

#[test]
fn test_multiple_defaults_rejected() {
    let err = parse_err(
        "{% switch x %}{% default %}a{% default %}b{% end %}",
        Context::Html,
    );
    assert!(error_message(&err).starts_with("multiple defaults in switch"));
}

#[test]
fn test_text_before_first_case() {
    // Whitespace is discarded, anything else is an error.
    parse("{% switch x %}  \n{% case 1 %}a{% end %}", Context::Html);
    let err = parse_err("{% switch x %}oops{% case 1 %}a{% end %}", Context::Html);
    assert_eq!(
        error_message(&err),
        "unexpected text, expecting case of default or {% end %}"
    );
}

#[test]
fn test_fallthrough_rules() {
    parse(
        "{% switch x %}{% case 1 %}a{% fallthrough %}{% case 2 %}b{% end %}",
        Context::Html,
    );
    let err = parse_err(
        "{% switch x %}{% case 1 %}{% fallthrough %}{% fallthrough %}{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "fallthrough statement out of place");
    let err = parse_err(
        "{% switch v := y.(type) %}{% case int %}{% fallthrough %}{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "cannot fallthrough in type switch");
    let err = parse_err("{% for %}{% fallthrough %}{% end %}", Context::Html);
    assert_eq!(error_message(&err), "fallthrough statement out of place");
}

#[test]
fn test_type_switch_guard_forms() {
    let tree = parse(
        "{% switch v := y.(type) %}{% case int %}a{% end %}",
        Context::Html,
    );
    let Node::TypeSwitch { assignment, .. } = tree.get(tree.nodes[0]) else {
        panic!("expected a type switch node");
    };
    assert_eq!(assignment.variables.len(), 1);
    let tree = parse("{% switch y.(type) %}{% case int %}a{% end %}", Context::Html);
    let Node::TypeSwitch { assignment, .. } = tree.get(tree.nodes[0]) else {
        panic!("expected a type switch node");
    };
    assert!(assignment.variables.is_empty());
}

#[test]
fn test_type_switch_rejects_literal_cases() {
    let err = parse_err(
        "{% switch y.(type) %}{% case 5 %}a{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "5 (type int) is not a type");
    let err = parse_err(
        "{% switch y.(type) %}{% case 1.5 %}a{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "1.5 (type float) is not a type");
    let err = parse_err(
        "{% switch y.(type) %}{% case \"s\" %}a{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "\"s\" (type string) is not a type");
    let err = parse_err(
        "{% switch y.(type) %}{% case true %}a{% end %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "true (type bool) is not a type");
    // Identifiers and selectors are left to the type checker.
    parse(
        "{% switch y.(type) %}{% case int, fmt.Stringer %}a{% end %}",
        Context::Html,
    );
}

#[test]
fn test_extends_must_be_first() {
    let err = parse_err(
        "{% if x %}a{% end %}{% extends \"/base.html\" %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "extends can only be the first statement");
    // Leading text alone is fine.
    parse("  \n{% extends \"/base.html\" %}", Context::Html);
}

#[test]
fn test_extends_only_once() {
    let err = parse_err(
        "{% extends \"/a.html\" %}{% extends \"/b.html\" %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "extends already exists");
}

#[test]
fn test_value_statement_outside_macro_in_extended_file() {
    let err = parse_err("{% extends \"/base.html\" %}{{ x }}", Context::Html);
    assert_eq!(error_message(&err), "value statement outside macro");
    parse(
        "{% extends \"/base.html\" %}{% macro Body %}{{ x }}{% end macro %}",
        Context::Html,
    );
}

#[test]
fn test_include_outside_macro_in_extended_file() {
    let err = parse_err(
        "{% extends \"/base.html\" %}{% include \"/a.html\" %}",
        Context::Html,
    );
    assert_eq!(error_message(&err), "include statement outside macro");
}

#[test]
fn test_macro_parameters() {
    let tree = parse("{% macro Card(title, rows...) %}x{% end macro %}", Context::Html);
    let Node::Macro {
        ident,
        parameters,
        is_variadic,
        body,
        ..
    } = tree.get(tree.nodes[0])
    else {
        panic!("expected a macro node");
    };
    assert_eq!(ident.name, "Card");
    assert_eq!(parameters.len(), 2);
    assert!(is_variadic);
    assert_eq!(body.len(), 1);
}

#[test]
fn test_variadic_must_be_final() {
    let err = parse_err("{% macro M(a..., b) %}{% end %}", Context::Html);
    assert_eq!(error_message(&err), "cannot use ... with non-final parameter");
}

#[test]
fn test_show_macro() {
    let tree = parse("{% show Header %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::ShowMacro { name, import, .. } => {
            assert_eq!(name.name, "Header");
            assert!(import.is_none());
        }
        other => panic!("unexpected node {other:?}"),
    }
    let tree = parse("{% show ui.Card(1, x) %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::ShowMacro {
            name,
            import,
            arguments,
            ..
        } => {
            assert_eq!(name.name, "Card");
            assert_eq!(import.as_ref().map(|i| i.name.as_str()), Some("ui"));
            assert_eq!(arguments.len(), 2);
        }
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_show_of_unexported_macro_is_rejected() {
    let err = parse_err("{% show ui.card %}", Context::Html);
    assert_eq!(error_message(&err), "cannot refer to unexported macro card");
}

#[test]
fn test_include_node_is_unresolved() {
    let tree = parse("{% include \"/partial.html\" %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::Include { path, tree, .. } => {
            assert_eq!(path, "/partial.html");
            assert!(tree.is_none());
        }
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_template_statements_rejected_in_program_mode() {
    for src in [
        "include \"/a.html\"\n",
        "show X\n",
        "macro M\n",
        "extends \"/a.html\"\n",
    ] {
        // In program mode these lex as plain identifiers, so they fail as
        // expressions, not as template statements.
        assert!(parse_source(src.as_bytes(), Context::None, &ParseOptions::default()).is_err());
    }
}

#[test]
fn test_comment_node() {
    let tree = parse("a{# note #}b", Context::Html);
    match tree.get(tree.nodes[1]) {
        Node::Comment { text, .. } => assert_eq!(text, " note "),
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_unexpected_end() {
    let err = parse_err("{% end %}", Context::Html);
    assert_eq!(error_message(&err), "unexpected end");
}

#[test]
fn test_unclosed_statement_at_eof() {
    let err = parse_err("{% if x %}a", Context::Html);
    assert_eq!(error_message(&err), "unexpected EOF, expecting {% end %}");
}

// =============================================================================
// Whitespace cutting
// =============================================================================

fn text_cut(tree: &Tree, id: NodeId) -> (usize, usize) {
    match tree.get(id) {
        Node::Text { cut, .. } => (cut.left, cut.right),
        other => panic!("expected a text node, got {other:?}"),
    }
}

#[test]
fn test_cut_spaces_around_single_directive_line() {
    let tree = parse("a\n  {% if x %}  \nb{% end %}", Context::Html);
    // Nodes: text "a\n  ", if, (then holds text "  \nb"...)
    let (_, right) = text_cut(&tree, tree.nodes[0]);
    assert_eq!(right, 2, "spaces before the directive are cut");
    let Node::If { then, .. } = tree.get(tree.nodes[1]) else {
        panic!("expected an if node");
    };
    let Node::Block { nodes, .. } = tree.get(*then) else {
        panic!("expected a block");
    };
    let (left, _) = text_cut(&tree, nodes[0]);
    assert_eq!(left, 3, "spaces and the newline after the directive are cut");
}

#[test]
fn test_no_cut_when_line_has_content() {
    let tree = parse("a {# c #} b", Context::Html);
    let (_, right) = text_cut(&tree, tree.nodes[0]);
    let (left, _) = text_cut(&tree, tree.nodes[2]);
    assert_eq!(right, 0);
    assert_eq!(left, 0);
}

#[test]
fn test_no_cut_with_two_directives_in_line() {
    let tree = parse("  {# a #}{# b #}  \nx", Context::Html);
    let (_, right) = text_cut(&tree, tree.nodes[0]);
    assert_eq!(right, 0);
}

#[test]
fn test_cut_at_end_of_source() {
    let tree = parse("  {# c #}  ", Context::Html);
    let (_, right) = text_cut(&tree, tree.nodes[0]);
    assert_eq!(right, 2);
    let (left, _) = text_cut(&tree, tree.nodes[2]);
    assert_eq!(left, 2);
}

// =============================================================================
// Program mode
// =============================================================================

#[test]
fn test_program_statements() {
    let tree = parse("package main\nx := 1\nx = x + 2\nx++\n", Context::None);
    assert_eq!(tree.nodes.len(), 4);
    assert!(matches!(tree.get(tree.nodes[0]), Node::Package { .. }));
    match tree.get(tree.nodes[1]) {
        Node::Assignment(a) => assert_eq!(a.typ, AssignmentType::Declaration),
        other => panic!("unexpected node {other:?}"),
    }
    match tree.get(tree.nodes[3]) {
        Node::Assignment(a) => assert_eq!(a.typ, AssignmentType::Increment),
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_program_if_else() {
    let tree = parse("if x {\n\ty = 1\n} else {\n\ty = 2\n}\n", Context::None);
    assert_eq!(tree.nodes.len(), 1);
    let Node::If { els, .. } = tree.get(tree.nodes[0]) else {
        panic!("expected an if node");
    };
    assert!(els.is_some());
}

#[test]
fn test_program_for_and_label() {
    let tree = parse("loop: for {\n\tbreak\n}\n", Context::None);
    assert_eq!(tree.nodes.len(), 1);
    let Node::Label {
        ident, statement, ..
    } = tree.get(tree.nodes[0])
    else {
        panic!("expected a label node");
    };
    assert_eq!(ident.name, "loop");
    let Node::For { body, .. } = tree.get(statement.expect("label without statement")) else {
        panic!("expected a for node");
    };
    assert_eq!(body.len(), 1);
}

#[test]
fn test_program_go_statement() {
    let tree = parse("go f(x)\n", Context::None);
    match tree.get(tree.nodes[0]) {
        Node::Go { call, .. } => assert_eq!(call.to_string(), "f(x)"),
        other => panic!("unexpected node {other:?}"),
    }
    let err = parse_err("go x\n", Context::None);
    assert_eq!(error_message(&err), "expression in go must be function call");
}

#[test]
fn test_disallow_go_statement() {
    let options = ParseOptions {
        disallow_go_stmt: true,
        ..ParseOptions::default()
    };
    let err = parse_source(b"go f()\n", Context::None, &options)
        .err()
        .expect("expected an error");
    assert_eq!(error_message(&err), "\"go\" statement not available");
}

#[test]
fn test_not_opened_brace() {
    let err = parse_err("}\n", Context::None);
    assert_eq!(error_message(&err), "not opened brace");
}

#[test]
fn test_unclosed_brace_at_eof() {
    let err = parse_err("if x {\n", Context::None);
    assert_eq!(error_message(&err), "unexpected EOF, expecting }");
}

#[test]
fn test_blank_identifier_as_value() {
    let err = parse_err("{% _ %}", Context::Html);
    assert_eq!(error_message(&err), "cannot use _ as value");
}

#[test]
fn test_assignment_mismatch() {
    let err = parse_err("{% a, b = 1, 2, 3 %}", Context::Html);
    assert_eq!(
        error_message(&err),
        "assignment mismatch: 2 variables but 3 values"
    );
    // A single call may fan out to several variables.
    parse("{% a, b = f() %}", Context::Html);
}

// =============================================================================
// Options and external token sources
// =============================================================================

#[test]
fn test_no_parse_short_show_stmt() {
    let options = ParseOptions {
        no_parse_short_show_stmt: true,
        ..ParseOptions::default()
    };
    let err = parse_source(b"a{{ x }}", Context::Html, &options)
        .err()
        .expect("expected an error");
    assert_eq!(error_message(&err), "short show statement not allowed");
}

#[test]
fn test_invalid_entry_context() {
    let err = parse_source(b"", Context::Attribute, &ParseOptions::default())
        .err()
        .expect("expected an error");
    assert!(error_message(&err).starts_with("invalid context"));
}

#[test]
fn test_include_inside_attribute_value() {
    use vela_parser::token::VecTokenSource;
    let pos = Position::new(1, 1, 0, 1);
    let tokens = vec![
        Token::new(TokenKind::StartStatement, "{%", pos, Context::Html),
        Token::new(TokenKind::Include, "include", pos, Context::Attribute),
    ];
    let err = parse_tokens(
        &mut VecTokenSource::new(tokens),
        Context::Html,
        &ParseOptions::default(),
    )
    .err()
    .expect("expected an error");
    assert_eq!(
        error_message(&err),
        "include statement inside an attribute value"
    );
}

#[test]
fn test_extends_inside_script_tag() {
    use vela_parser::token::VecTokenSource;
    let pos = Position::new(1, 1, 0, 1);
    let tokens = vec![
        Token::new(TokenKind::StartStatement, "{%", pos, Context::Html),
        Token::new(TokenKind::Extends, "extends", pos, Context::Script),
    ];
    let err = parse_tokens(
        &mut VecTokenSource::new(tokens),
        Context::Html,
        &ParseOptions::default(),
    )
    .err()
    .expect("expected an error");
    assert_eq!(error_message(&err), "extends inside a script tag");
}

#[test]
fn test_url_nodes_from_external_tokens() {
    use vela_parser::token::VecTokenSource;
    let pos = Position::new(1, 1, 0, 1);
    let tokens = vec![
        Token::new(TokenKind::StartUrl, "", pos, Context::Html).with_tag_att("a", "href"),
        Token::new(TokenKind::Text, "/home", pos, Context::Attribute),
        Token::new(TokenKind::EndUrl, "", pos, Context::Html),
        Token::new(TokenKind::Eof, "", pos, Context::Html),
    ];
    let tree = parse_tokens(
        &mut VecTokenSource::new(tokens),
        Context::Html,
        &ParseOptions::default(),
    )
    .expect("parse failed");
    let Node::Url {
        tag,
        attribute,
        children,
        ..
    } = tree.get(tree.nodes[0])
    else {
        panic!("expected an URL node");
    };
    assert_eq!(tag, "a");
    assert_eq!(attribute, "href");
    assert_eq!(children.len(), 1);
}

#[test]
fn test_expression_statement_in_template() {
    let tree = parse("{% f(x) %}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::Expr(expr) => assert_eq!(expr.to_string(), "f(x)"),
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_every_node_carries_a_position() {
    let tree = parse(
        "a{{ x }}{% if y %}b{% end %}{% for %}{% break %}{% end %}",
        Context::Html,
    );
    for i in 0..tree.len() as u32 {
        let node = tree.get(NodeId(i));
        let pos = node.pos();
        assert!(pos.line >= 1, "node {node:?} has no line");
    }
}

#[test]
fn test_if_with_init_assignment() {
    let tree = parse("{% if v := f(); v > 0 %}a{% end %}", Context::Html);
    let Node::If {
        init: Some(init),
        condition,
        ..
    } = tree.get(tree.nodes[0])
    else {
        panic!("expected an if with init");
    };
    assert_eq!(init.typ, AssignmentType::Declaration);
    assert_eq!(condition.to_string(), "v > 0");
}

#[test]
fn test_assignment_used_as_value() {
    let err = parse_err("{% if v := f() %}a{% end %}", Context::Html);
    assert!(error_message(&err).ends_with("used as value"));
}

#[test]
fn test_value_expression_kinds() {
    let tree = parse("{{ user.Name }}{{ items[0] }}{{ s[1:2] }}{{ (a + b) * c }}", Context::Html);
    let kinds: Vec<String> = tree
        .nodes
        .iter()
        .map(|&id| match tree.get(id) {
            Node::Value { expr, .. } => expr.to_string(),
            other => panic!("unexpected node {other:?}"),
        })
        .collect();
    assert_eq!(kinds, vec!["user.Name", "items[0]", "s[1:2]", "(a + b) * c"]);
}

#[test]
fn test_expression_node_variants() {
    let tree = parse("{{ !done && n % 2 == 0 }}", Context::Html);
    match tree.get(tree.nodes[0]) {
        Node::Value { expr, .. } => match expr {
            Expression::BinaryOperator { .. } => {}
            other => panic!("unexpected expression {other:?}"),
        },
        other => panic!("unexpected node {other:?}"),
    }
}
