//! Parse-time validation of generated source.
//!
//! Sources are parsed with the tree-sitter TSX grammar, which is a superset
//! of JavaScript + JSX. Anything the grammar flags as an error or a missing
//! token is rejected, and so is TypeScript-only syntax: the sandbox runs the
//! lowered output as plain JavaScript. Early errors V8 would raise at compile
//! time are checked last.

use crate::error::PackagingError;
use tree_sitter::{Node, Parser, Tree};

/// Deepest syntax tree the lowering pass will walk. The lowering is
/// recursive, so this bounds its stack use on hostile input.
pub const MAX_NESTING: usize = 400;

/// Node kinds that only exist in TypeScript, with a readable name.
const TYPESCRIPT_ONLY: &[(&str, &str)] = &[
    ("type_annotation", "type annotation"),
    ("interface_declaration", "interface declaration"),
    ("type_alias_declaration", "type alias"),
    ("enum_declaration", "enum"),
    ("as_expression", "`as` cast"),
    ("satisfies_expression", "`satisfies` expression"),
    ("non_null_expression", "non-null assertion"),
    ("type_arguments", "type arguments"),
    ("type_parameters", "type parameters"),
    ("abstract_class_declaration", "abstract class"),
    ("ambient_declaration", "`declare` statement"),
    ("internal_module", "namespace"),
    ("optional_parameter", "optional parameter"),
    ("accessibility_modifier", "accessibility modifier"),
    ("implements_clause", "`implements` clause"),
];

/// Parse `source` and reject anything the sandbox could not evaluate.
pub fn parse(source: &str) -> Result<Tree, PackagingError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_typescript::LANGUAGE_TSX.into())
        .map_err(|e| PackagingError::Parser(e.to_string()))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| PackagingError::Parser("parser returned no tree".to_string()))?;

    validate(&tree, source)?;
    super::early::check(&tree, source)?;
    Ok(tree)
}

fn validate(tree: &Tree, source: &str) -> Result<(), PackagingError> {
    let root = tree.root_node();
    let has_error = root.has_error();
    let mut typescript: Option<(Node<'_>, &'static str)> = None;

    // Iterative pre-order walk: the first error in document order wins, and
    // the depth bound is enforced before anything recursive touches the tree.
    let mut cursor = root.walk();
    let mut depth = 0usize;
    loop {
        let node = cursor.node();

        if depth > MAX_NESTING {
            return Err(at(
                node,
                format!("nesting deeper than {MAX_NESTING} levels"),
            ));
        }

        if has_error && (node.is_error() || node.is_missing()) {
            return Err(describe_error(node, source));
        }

        if typescript.is_none() {
            if let Some((_, what)) = TYPESCRIPT_ONLY.iter().find(|(kind, _)| *kind == node.kind()) {
                typescript = Some((node, what));
            }
        }

        if cursor.goto_first_child() {
            depth += 1;
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return match typescript {
                    Some((node, what)) => Err(at(
                        node,
                        format!("TypeScript syntax is not supported: {what}"),
                    )),
                    None => Ok(()),
                };
            }
            depth -= 1;
        }
    }
}

fn describe_error(node: Node<'_>, source: &str) -> PackagingError {
    if node.is_missing() {
        return at(node, format!("missing `{}`", node.kind()));
    }

    let text = node.utf8_text(source.as_bytes()).unwrap_or("");
    let snippet: String = text
        .trim()
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(24)
        .collect();

    if snippet.is_empty() {
        at(node, "unexpected end of input".to_string())
    } else {
        at(node, format!("unexpected `{snippet}`"))
    }
}

pub(super) fn at(node: Node<'_>, message: String) -> PackagingError {
    let position = node.start_position();
    PackagingError::SyntaxInvalid {
        line: position.row + 1,
        column: position.column + 1,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syntax_error(source: &str) -> (usize, String) {
        match parse(source) {
            Err(PackagingError::SyntaxInvalid { line, message, .. }) => (line, message),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_accepts_jsx_component() {
        let source = r#"
            const Card = ({ title }) => (
              <div className="card">
                <h2>{title}</h2>
                <>{[1, 2].map((n) => <span key={n}>{n}</span>)}</>
              </div>
            );
            export default Card;
        "#;
        assert!(parse(source).is_ok());
    }

    #[test]
    fn test_rejects_unbalanced_braces() {
        let (line, _) = syntax_error("function App() {\n  return <div>hi</div>;\n");
        assert!(line >= 1);
    }

    #[test]
    fn test_rejects_unclosed_jsx() {
        let source = "const App = () => (\n  <div>\n    <span>text\n  </div>\n);\n";
        assert!(matches!(
            parse(source),
            Err(PackagingError::SyntaxInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            parse("const = = 4 ;;; }"),
            Err(PackagingError::SyntaxInvalid { .. })
        ));
    }

    #[test]
    fn test_rejects_type_annotations() {
        let (line, message) =
            syntax_error("const x = 1;\nfunction App(props: { title: string }) { return null; }");
        assert_eq!(line, 2);
        assert!(message.contains("type annotation"), "{message}");
    }

    #[test]
    fn test_rejects_interfaces() {
        let (_, message) = syntax_error("interface Props { title: string }\nconst App = () => null;");
        assert!(message.contains("interface"), "{message}");
    }

    #[test]
    fn test_rejects_generic_calls() {
        let (_, message) = syntax_error("const [v] = useState<string>('');");
        assert!(message.contains("type arguments"), "{message}");
    }

    #[test]
    fn test_rejects_duplicate_lexical_bindings() {
        let (line, message) = syntax_error("const a = 1;\nconst a = 2;");
        assert_eq!(line, 2);
        assert!(message.contains("`a` has already been declared"), "{message}");

        let (_, message) = syntax_error("import React from 'react';\nfunction React() {}");
        assert!(message.contains("`React`"), "{message}");

        let (_, message) = syntax_error("function f() { var x; let { y: [x] } = {}; }");
        assert!(message.contains("`x`"), "{message}");
    }

    #[test]
    fn test_allows_var_redeclaration_and_shadowing() {
        assert!(parse("var a = 1;\nvar a = 2;\nfunction f() { const a = 3; return a; }").is_ok());
        assert!(parse("const a = 1;\n{ const a = 2; }").is_ok());
    }

    #[test]
    fn test_rejects_await_outside_async() {
        let (_, message) = syntax_error("const data = await fetch('https://unpkg.com/x.json');");
        assert!(message.contains("`await`"), "{message}");

        let (_, message) = syntax_error("function load() { return await fetch('/'); }");
        assert!(message.contains("`await`"), "{message}");

        assert!(parse("const load = async () => { const r = await fetch('/'); return r; };").is_ok());
        assert!(parse("async function load() { for await (const x of y) {} }").is_ok());
    }

    #[test]
    fn test_rejects_stray_break_and_continue() {
        let (_, message) = syntax_error("function A() { break; }");
        assert!(message.contains("`break` outside of a loop"), "{message}");

        let (_, message) = syntax_error("for (;;) { [1].forEach(() => { continue; }); }");
        assert!(message.contains("`continue` outside of a loop"), "{message}");

        let (_, message) = syntax_error("for (;;) { break missing; }");
        assert!(message.contains("undefined label"), "{message}");

        assert!(parse("outer: for (;;) { for (;;) { continue outer; } }").is_ok());
        assert!(parse("switch (x) { case 1: break; default: }").is_ok());
    }

    #[test]
    fn test_rejects_invalid_regex_flags() {
        let (_, message) = syntax_error("const r = /a/gg;");
        assert!(message.contains("flags `gg`"), "{message}");
        assert!(matches!(parse("const r = /a/q;"), Err(PackagingError::SyntaxInvalid { .. })));
        assert!(parse("const r = /a/gimsuy;").is_ok());
    }

    #[test]
    fn test_rejects_top_level_return() {
        let (line, message) = syntax_error("const App = () => null;\nreturn App;");
        assert_eq!(line, 2);
        assert!(message.contains("`return` outside of a function"), "{message}");
    }

    #[test]
    fn test_rejects_sloppy_mode_only_syntax() {
        assert!(syntax_error("with (Math) { max(1, 2); }").1.contains("`with`"));
        assert!(syntax_error("const mode = 0755;").1.contains("octal"));
        assert!(syntax_error("var x; delete x;").1.contains("`delete`"));
    }

    #[test]
    fn test_rejects_excessive_nesting() {
        let source = format!("const x = {}1{};", "[".repeat(MAX_NESTING + 10), "]".repeat(MAX_NESTING + 10));
        let (_, message) = syntax_error(&source);
        assert!(message.contains("nesting"), "{message}");
    }
}
