//! Early errors: source the grammar accepts but V8 refuses to compile.
//!
//! The lowered module runs as the body of a strict-mode, non-async function,
//! so strict-mode rules apply and a top-level `return` or `await` is an error
//! here even though the wrapper would make one compile or fail later.

use super::syntax::at;
use crate::error::PackagingError;
use std::collections::HashMap;
use tree_sitter::{Node, Tree};

const FUNCTION_KINDS: &[&str] = &[
    "function_declaration",
    "function_expression",
    "function",
    "generator_function_declaration",
    "generator_function",
    "arrow_function",
    "method_definition",
];

const LOOP_KINDS: &[&str] = &[
    "for_statement",
    "for_in_statement",
    "while_statement",
    "do_statement",
];

const REGEX_FLAGS: &str = "dgimsuvy";

#[derive(Debug, Clone, Default)]
struct Context<'s> {
    in_function: bool,
    is_async: bool,
    in_loop: bool,
    in_switch: bool,
    labels: Vec<&'s str>,
}

/// Reject the early errors a strict-mode function body can raise.
pub(super) fn check(tree: &Tree, source: &str) -> Result<(), PackagingError> {
    visit(tree.root_node(), source, &Context::default())
}

fn visit<'s>(node: Node<'_>, src: &'s str, ctx: &Context<'s>) -> Result<(), PackagingError> {
    let kind = node.kind();

    if FUNCTION_KINDS.contains(&kind) {
        let inner = Context {
            in_function: true,
            is_async: has_token(node, "async"),
            ..Context::default()
        };
        return children(node, src, &inner);
    }
    if LOOP_KINDS.contains(&kind) {
        if kind == "for_in_statement" && has_token(node, "await") && !ctx.is_async {
            return Err(at(node, "`for await` is only valid in async functions".to_string()));
        }
        let inner = Context {
            in_loop: true,
            ..ctx.clone()
        };
        return children(node, src, &inner);
    }

    match kind {
        "class_static_block" => return children(node, src, &Context::default()),
        "switch_statement" => {
            let inner = Context {
                in_switch: true,
                ..ctx.clone()
            };
            return children(node, src, &inner);
        }
        "labeled_statement" => {
            let mut inner = ctx.clone();
            if let Some(label) = node.child_by_field_name("label") {
                inner.labels.push(&src[label.byte_range()]);
            }
            return children(node, src, &inner);
        }
        "return_statement" if !ctx.in_function => {
            return Err(at(node, "`return` outside of a function".to_string()));
        }
        "await_expression" if !ctx.is_async => {
            return Err(at(node, "`await` is only valid in async functions".to_string()));
        }
        "break_statement" | "continue_statement" => jump(node, src, ctx)?,
        "with_statement" => {
            return Err(at(node, "`with` is not allowed in strict mode".to_string()));
        }
        "regex" => regex_flags(node, src)?,
        "number" => {
            let text = &src[node.byte_range()];
            if text.len() > 1 && text.starts_with('0') && text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(at(
                    node,
                    format!("legacy octal literal `{text}` is not allowed in strict mode"),
                ));
            }
        }
        "unary_expression" => {
            let deletes = node
                .child_by_field_name("operator")
                .is_some_and(|op| &src[op.byte_range()] == "delete");
            let of_identifier = node
                .child_by_field_name("argument")
                .is_some_and(|arg| arg.kind() == "identifier");
            if deletes && of_identifier {
                return Err(at(
                    node,
                    "`delete` of a plain name is not allowed in strict mode".to_string(),
                ));
            }
        }
        "program" | "statement_block" => duplicate_bindings(node, src)?,
        _ => {}
    }

    children(node, src, ctx)
}

fn children<'s>(node: Node<'_>, src: &'s str, ctx: &Context<'s>) -> Result<(), PackagingError> {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit(child, src, ctx)?;
    }
    Ok(())
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .any(|child| !child.is_named() && child.kind() == token);
    found
}

fn jump(node: Node<'_>, src: &str, ctx: &Context<'_>) -> Result<(), PackagingError> {
    let keyword = if node.kind() == "break_statement" { "break" } else { "continue" };
    if let Some(label) = node.child_by_field_name("label") {
        let label = &src[label.byte_range()];
        if !ctx.labels.contains(&label) {
            return Err(at(node, format!("undefined label `{label}`")));
        }
        return Ok(());
    }
    let allowed = ctx.in_loop || (keyword == "break" && ctx.in_switch);
    if allowed {
        Ok(())
    } else {
        Err(at(node, format!("`{keyword}` outside of a loop")))
    }
}

fn regex_flags(node: Node<'_>, src: &str) -> Result<(), PackagingError> {
    let Some(flags) = node.child_by_field_name("flags") else {
        return Ok(());
    };
    let text = &src[flags.byte_range()];
    let mut seen = String::new();
    for flag in text.chars() {
        if !REGEX_FLAGS.contains(flag) || seen.contains(flag) {
            return Err(at(flags, format!("invalid regular expression flags `{text}`")));
        }
        seen.push(flag);
    }
    if seen.contains('u') && seen.contains('v') {
        return Err(at(flags, format!("invalid regular expression flags `{text}`")));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Lexical,
    Var,
    Function,
}

/// `let`, `const`, `class` and import bindings may not share a name with any
/// other declaration in the same scope.
fn duplicate_bindings(scope: Node<'_>, src: &str) -> Result<(), PackagingError> {
    let mut seen: HashMap<&str, Binding> = HashMap::new();
    let mut cursor = scope.walk();
    for statement in scope.named_children(&mut cursor) {
        let declaration = match statement.kind() {
            "export_statement" => match statement.child_by_field_name("declaration") {
                Some(declaration) => declaration,
                None => continue,
            },
            _ => statement,
        };

        let mut names = Vec::new();
        let binding = match declaration.kind() {
            "lexical_declaration" | "variable_declaration" => {
                let mut inner = declaration.walk();
                for declarator in declaration.named_children(&mut inner) {
                    if let Some(name) = declarator.child_by_field_name("name") {
                        pattern_names(name, &mut names);
                    }
                }
                if declaration.kind() == "lexical_declaration" {
                    Binding::Lexical
                } else {
                    Binding::Var
                }
            }
            "class_declaration" => {
                names.extend(declaration.child_by_field_name("name"));
                Binding::Lexical
            }
            "function_declaration" | "generator_function_declaration" => {
                names.extend(declaration.child_by_field_name("name"));
                Binding::Function
            }
            "import_statement" => {
                import_names(declaration, &mut names);
                Binding::Lexical
            }
            _ => continue,
        };

        for name in names {
            let text = &src[name.byte_range()];
            match seen.get(text) {
                Some(previous) if binding == Binding::Lexical || *previous == Binding::Lexical => {
                    return Err(at(name, format!("`{text}` has already been declared")));
                }
                Some(_) => {}
                None => {
                    seen.insert(text, binding);
                }
            }
        }
    }
    Ok(())
}

fn pattern_names<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>) {
    match node.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => out.push(node),
        "pair_pattern" => {
            if let Some(value) = node.child_by_field_name("value") {
                pattern_names(value, out);
            }
        }
        "assignment_pattern" | "object_assignment_pattern" => {
            if let Some(left) = node.child_by_field_name("left") {
                pattern_names(left, out);
            }
        }
        "object_pattern" | "array_pattern" | "rest_pattern" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                pattern_names(child, out);
            }
        }
        _ => {}
    }
}

fn import_names<'t>(statement: Node<'t>, out: &mut Vec<Node<'t>>) {
    let mut cursor = statement.walk();
    let Some(clause) = statement
        .named_children(&mut cursor)
        .find(|child| child.kind() == "import_clause")
    else {
        return;
    };

    let mut cursor = clause.walk();
    for part in clause.named_children(&mut cursor) {
        match part.kind() {
            "identifier" => out.push(part),
            "namespace_import" => {
                let mut inner = part.walk();
                out.extend(part.named_children(&mut inner).filter(|n| n.kind() == "identifier"));
            }
            "named_imports" => {
                let mut inner = part.walk();
                for spec in part.named_children(&mut inner) {
                    if spec.kind() != "import_specifier" {
                        continue;
                    }
                    out.extend(
                        spec.child_by_field_name("alias")
                            .or_else(|| spec.child_by_field_name("name")),
                    );
                }
            }
            _ => {}
        }
    }
}
