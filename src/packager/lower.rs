//! Lowering of a validated JSX module into a plain function body.
//!
//! The output is the module's text with three kinds of rewrites applied in
//! place; everything else is copied byte for byte:
//!
//! - JSX becomes `createElement` calls against the bundled runtime,
//! - `import` of the runtime becomes local bindings (other imports are
//!   rejected),
//! - `export` is stripped and recorded in an [`ExportTable`], as are legacy
//!   `window.X = …` registrations.

use crate::error::PackagingError;
use crate::source::EntryPoint;
use tree_sitter::{Node, Tree};

pub(crate) const H: &str = "__preview_h__";
pub(crate) const FRAGMENT: &str = "__preview_fragment__";
pub(crate) const REACT: &str = "__preview_react__";
pub(crate) const REACT_DOM: &str = "__preview_react_dom__";
const DEFAULT_BINDING: &str = "__preview_default__";

/// Module specifiers served by the bundled runtime.
const RUNTIME_MODULES: &[&str] = &["react", "react/jsx-runtime", "react-dom", "react-dom/client"];

/// Globals that generated code historically registered its component on.
const LEGACY_GLOBALS: &[&str] = &["window", "globalThis", "self"];

const STYLESHEET_EXTENSIONS: &[&str] = &[".css", ".scss", ".sass", ".less"];

/// Exported and top-level bindings of a lowered module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
    /// Local binding holding the default export.
    pub default: Option<String>,
    /// `(exported name, local binding)` pairs.
    pub named: Vec<(String, String)>,
    /// `window.X = …` registrations, rewritten to private bindings.
    pub legacy: Vec<(String, String)>,
    /// Top-level declarations, exported or not.
    pub declared: Vec<String>,
}

impl ExportTable {
    /// Resolve the binding the bootstrap should hand to the runtime.
    pub fn resolve(&self, entry: &EntryPoint) -> Option<&str> {
        match entry {
            EntryPoint::Default => self.default.as_deref(),
            EntryPoint::Named(name) => lookup(&self.named, name)
                .or_else(|| lookup(&self.legacy, name))
                .or_else(|| {
                    self.declared
                        .iter()
                        .find(|declared| *declared == name)
                        .map(String::as_str)
                }),
        }
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    // Last registration wins, as it would for an assignment.
    pairs
        .iter()
        .rev()
        .find(|(exported, _)| exported == name)
        .map(|(_, local)| local.as_str())
}

#[derive(Debug)]
pub(crate) struct Lowered {
    /// Runtime import bindings, one statement per line.
    pub prelude: String,
    /// The module body with imports, exports and JSX rewritten.
    pub body: String,
    pub exports: ExportTable,
}

pub(crate) fn lower(tree: &Tree, source: &str) -> Result<Lowered, PackagingError> {
    let mut lowering = Lowering {
        src: source,
        prelude: String::new(),
        exports: ExportTable::default(),
    };
    let body = lowering.program(tree.root_node())?;
    Ok(Lowered {
        prelude: lowering.prelude,
        body,
        exports: lowering.exports,
    })
}

struct Lowering<'s> {
    src: &'s str,
    prelude: String,
    exports: ExportTable,
}

impl<'s> Lowering<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        &self.src[node.byte_range()]
    }

    fn program(&mut self, root: Node<'_>) -> Result<String, PackagingError> {
        let mut out = String::with_capacity(self.src.len() + self.src.len() / 2);
        let mut cursor = 0;

        for i in 0..root.child_count() {
            let Some(statement) = root.child(i) else {
                continue;
            };
            out.push_str(&self.src[cursor..statement.start_byte()]);

            match statement.kind() {
                "import_statement" => self.import(statement, &mut out)?,
                "export_statement" => self.export(statement, &mut out)?,
                "expression_statement" => {
                    if !self.legacy_registration(statement, &mut out) {
                        self.emit(statement, &mut out);
                    }
                }
                _ => {
                    let names = declared_names(statement, self.src);
                    self.exports.declared.extend(names);
                    self.emit(statement, &mut out);
                }
            }
            cursor = statement.end_byte();
        }
        out.push_str(&self.src[cursor..]);
        Ok(out)
    }

    fn import(&mut self, statement: Node<'_>, out: &mut String) -> Result<(), PackagingError> {
        let line = statement.start_position().row + 1;
        let specifier = statement
            .child_by_field_name("source")
            .map(|s| unquote(self.text(s)))
            .unwrap_or_default();
        let clause = named_children(statement)
            .into_iter()
            .find(|child| child.kind() == "import_clause");

        if RUNTIME_MODULES.contains(&specifier.as_str()) {
            let target = if specifier.starts_with("react-dom") { REACT_DOM } else { REACT };
            if let Some(clause) = clause {
                self.bind_import(clause, target);
            }
        } else if clause.is_none()
            && STYLESHEET_EXTENSIONS
                .iter()
                .any(|ext| specifier.ends_with(ext))
        {
            tracing::warn!(%specifier, line, "dropping stylesheet import");
        } else {
            return Err(PackagingError::UnsupportedImport { specifier, line });
        }

        blank(self.text(statement), out);
        Ok(())
    }

    fn bind_import(&mut self, clause: Node<'_>, target: &str) {
        let mut destructured = Vec::new();

        for part in named_children(clause) {
            match part.kind() {
                "identifier" => {
                    self.prelude
                        .push_str(&format!("const {} = {target};\n", self.text(part)));
                }
                "namespace_import" => {
                    if let Some(name) = named_children(part)
                        .into_iter()
                        .find(|n| n.kind() == "identifier")
                    {
                        self.prelude
                            .push_str(&format!("const {} = {target};\n", self.text(name)));
                    }
                }
                "named_imports" => {
                    for spec in named_children(part) {
                        if spec.kind() != "import_specifier" {
                            continue;
                        }
                        let Some(name) = spec.child_by_field_name("name") else {
                            continue;
                        };
                        let name = unquote(self.text(name));
                        match spec.child_by_field_name("alias") {
                            Some(alias) => {
                                destructured.push(format!("{name}: {}", self.text(alias)))
                            }
                            None => destructured.push(name),
                        }
                    }
                }
                _ => {}
            }
        }

        if !destructured.is_empty() {
            self.prelude.push_str(&format!(
                "const {{ {} }} = {target};\n",
                destructured.join(", ")
            ));
        }
    }

    fn export(&mut self, statement: Node<'_>, out: &mut String) -> Result<(), PackagingError> {
        if let Some(source) = statement.child_by_field_name("source") {
            return Err(PackagingError::UnsupportedImport {
                specifier: unquote(self.text(source)),
                line: statement.start_position().row + 1,
            });
        }

        let is_default = children(statement)
            .into_iter()
            .any(|child| child.kind() == "default");

        if let Some(declaration) = statement.child_by_field_name("declaration") {
            let names = declared_names(declaration, self.src);
            if is_default {
                self.exports.default = names.first().cloned();
            } else {
                self.exports
                    .named
                    .extend(names.iter().map(|n| (n.clone(), n.clone())));
            }
            self.exports.declared.extend(names);
            self.emit(declaration, out);
            return Ok(());
        }

        if let Some(value) = statement.child_by_field_name("value") {
            out.push_str("const ");
            out.push_str(DEFAULT_BINDING);
            out.push_str(" = (");
            self.emit(value, out);
            out.push_str(");");
            self.exports.default = Some(DEFAULT_BINDING.to_string());
            return Ok(());
        }

        if let Some(clause) = named_children(statement)
            .into_iter()
            .find(|child| child.kind() == "export_clause")
        {
            for spec in named_children(clause) {
                if spec.kind() != "export_specifier" {
                    continue;
                }
                let Some(local) = spec.child_by_field_name("name") else {
                    continue;
                };
                let local = unquote(self.text(local));
                let exported = spec
                    .child_by_field_name("alias")
                    .map(|alias| unquote(self.text(alias)))
                    .unwrap_or_else(|| local.clone());
                if exported == "default" {
                    self.exports.default = Some(local);
                } else {
                    self.exports.named.push((exported, local));
                }
            }
        }

        blank(self.text(statement), out);
        Ok(())
    }

    /// `window.App = expr;` becomes `var __preview_global_App__ = (expr);`.
    fn legacy_registration(&mut self, statement: Node<'_>, out: &mut String) -> bool {
        let Some(assignment) = statement
            .named_child(0)
            .filter(|n| n.kind() == "assignment_expression")
        else {
            return false;
        };
        let Some(target) = assignment
            .child_by_field_name("left")
            .filter(|n| n.kind() == "member_expression")
        else {
            return false;
        };
        let (Some(object), Some(property), Some(value)) = (
            target.child_by_field_name("object"),
            target.child_by_field_name("property"),
            assignment.child_by_field_name("right"),
        ) else {
            return false;
        };
        if object.kind() != "identifier" || !LEGACY_GLOBALS.contains(&self.text(object)) {
            return false;
        }
        if property.kind() != "property_identifier" {
            return false;
        }

        let name = self.text(property).to_string();
        let binding = format!("__preview_global_{name}__");
        out.push_str("var ");
        out.push_str(&binding);
        out.push_str(" = (");
        self.emit(value, out);
        out.push_str(");");
        self.exports.legacy.push((name, binding));
        true
    }

    /// Copy `node` verbatim, lowering any JSX inside it.
    fn emit(&self, node: Node<'_>, out: &mut String) {
        if is_jsx(node.kind()) {
            self.element(node, out);
            return;
        }
        if node.child_count() == 0 {
            out.push_str(self.text(node));
            return;
        }

        let mut cursor = node.start_byte();
        for i in 0..node.child_count() {
            let Some(child) = node.child(i) else {
                continue;
            };
            out.push_str(&self.src[cursor..child.start_byte()]);
            self.emit(child, out);
            cursor = child.end_byte();
        }
        out.push_str(&self.src[cursor..node.end_byte()]);
    }

    fn element(&self, node: Node<'_>, out: &mut String) {
        let opening = match node.kind() {
            "jsx_self_closing_element" => Some(node),
            "jsx_fragment" => None,
            _ => node.child_by_field_name("open_tag"),
        };

        out.push_str(H);
        out.push('(');
        match opening.and_then(|o| o.child_by_field_name("name")) {
            Some(name) => self.tag(name, out),
            None => out.push_str(FRAGMENT),
        }
        out.push_str(", ");
        match opening {
            Some(opening) => self.props(opening, out),
            None => out.push_str("null"),
        }
        if node.kind() != "jsx_self_closing_element" {
            self.children(node, opening, out);
        }
        out.push(')');
    }

    /// Children are the expressions and elements between the tags; every
    /// byte in between them is JSX text, entities included.
    fn children(&self, node: Node<'_>, opening: Option<Node<'_>>, out: &mut String) {
        let named = named_children(node);
        let start = match opening {
            Some(opening) => opening.end_byte(),
            None => named
                .iter()
                .find(|c| c.kind() == "jsx_opening_element")
                .map_or(node.start_byte() + 2, |o| o.end_byte()),
        };
        let end = node
            .child_by_field_name("close_tag")
            .or_else(|| named.iter().rev().find(|c| c.kind() == "jsx_closing_element").copied())
            .map_or(node.end_byte(), |c| c.start_byte());

        let mut cursor = start;
        for kid in named {
            if kid.start_byte() < start || kid.end_byte() > end {
                continue;
            }
            if !is_jsx(kid.kind()) && kid.kind() != "jsx_expression" {
                continue;
            }
            self.text_child(&self.src[cursor..kid.start_byte()], out);
            self.child(kid, out);
            cursor = kid.end_byte();
        }
        if cursor < end {
            self.text_child(&self.src[cursor..end], out);
        }
    }

    fn text_child(&self, raw: &str, out: &mut String) {
        let text = jsx_text(raw);
        if !text.is_empty() {
            out.push_str(", ");
            out.push_str(&js_string(&decode_entities(&text)));
        }
    }

    fn tag(&self, name: Node<'_>, out: &mut String) {
        let text = self.text(name);
        let intrinsic = match name.kind() {
            "identifier" => {
                text.starts_with(|c: char| c.is_ascii_lowercase()) || text.contains('-')
            }
            "jsx_namespace_name" => true,
            _ => false,
        };
        if intrinsic {
            out.push_str(&js_string(text));
        } else {
            out.push_str(text);
        }
    }

    fn props(&self, opening: Node<'_>, out: &mut String) {
        let mut entries = Vec::new();

        for attribute in named_children(opening) {
            match attribute.kind() {
                "jsx_attribute" => {
                    let parts = named_children(attribute);
                    let Some(key) = parts.first() else {
                        continue;
                    };
                    let mut entry = js_string(self.text(*key));
                    entry.push_str(": ");
                    match parts.get(1) {
                        None => entry.push_str("true"),
                        Some(value) => self.attribute_value(*value, &mut entry),
                    }
                    entries.push(entry);
                }
                "jsx_expression" => {
                    if let Some(spread) = expression_inside(attribute) {
                        let mut entry = String::new();
                        self.emit(spread, &mut entry);
                        entries.push(entry);
                    }
                }
                _ => {}
            }
        }

        if entries.is_empty() {
            out.push_str("null");
        } else {
            out.push_str("{ ");
            out.push_str(&entries.join(", "));
            out.push_str(" }");
        }
    }

    fn attribute_value(&self, value: Node<'_>, out: &mut String) {
        match value.kind() {
            "string" => out.push_str(&js_string(&decode_entities(&unquote(self.text(value))))),
            "jsx_expression" => match expression_inside(value) {
                Some(expression) => self.emit(expression, out),
                None => out.push_str("undefined"),
            },
            _ => self.emit(value, out),
        }
    }

    fn child(&self, kid: Node<'_>, out: &mut String) {
        if kid.kind() == "jsx_expression" {
            if let Some(expression) = expression_inside(kid) {
                out.push_str(", ");
                self.emit(expression, out);
            }
        } else {
            out.push_str(", ");
            self.emit(kid, out);
        }
    }
}

fn is_jsx(kind: &str) -> bool {
    matches!(kind, "jsx_element" | "jsx_self_closing_element" | "jsx_fragment")
}

fn children(node: Node<'_>) -> Vec<Node<'_>> {
    (0..node.child_count()).filter_map(|i| node.child(i)).collect()
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    (0..node.named_child_count())
        .filter_map(|i| node.named_child(i))
        .collect()
}

/// The expression between the braces of `{…}`, skipping comments.
fn expression_inside(node: Node<'_>) -> Option<Node<'_>> {
    named_children(node)
        .into_iter()
        .find(|child| child.kind() != "comment")
}

fn declared_names(declaration: Node<'_>, src: &str) -> Vec<String> {
    let text = |n: Node<'_>| src[n.byte_range()].to_string();
    match declaration.kind() {
        "function_declaration" | "generator_function_declaration" | "class_declaration" => {
            declaration.child_by_field_name("name").map(text).into_iter().collect()
        }
        "lexical_declaration" | "variable_declaration" => named_children(declaration)
            .into_iter()
            .filter(|d| d.kind() == "variable_declarator")
            .filter_map(|d| d.child_by_field_name("name"))
            .filter(|name| name.kind() == "identifier")
            .map(text)
            .collect(),
        _ => Vec::new(),
    }
}

/// Replace a removed statement with as many newlines as it spanned so that
/// line numbers in runtime stacks still match the generated source.
fn blank(removed: &str, out: &mut String) {
    out.extend(removed.chars().filter(|c| *c == '\n'));
}

fn unquote(literal: &str) -> String {
    let trimmed = literal.trim();
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open @ ('"' | '\'' | '`')), Some(close)) if open == close => chars.as_str().to_string(),
        _ => trimmed.to_string(),
    }
}

pub(crate) fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// JSX text whitespace: lines are trimmed where they meet a line break, blank
/// lines vanish, and the remaining lines are joined with single spaces.
fn jsx_text(raw: &str) -> String {
    let lines: Vec<&str> = raw.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let last_non_empty = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .unwrap_or(0);

    let mut text = String::new();
    for (i, line) in lines.iter().enumerate() {
        let mut piece: &str = line;
        if i != 0 {
            piece = piece.trim_start_matches([' ', '\t']);
        }
        if i != lines.len() - 1 {
            piece = piece.trim_end_matches([' ', '\t']);
        }
        if piece.is_empty() {
            continue;
        }
        text.push_str(&piece.replace('\t', " "));
        if i != last_non_empty {
            text.push(' ');
        }
    }
    text
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| entity(&tail[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    if let Some(code) = name.strip_prefix('#') {
        let value = match code.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => code.parse().ok()?,
        };
        return char::from_u32(value);
    }
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "hellip" => '…',
        "mdash" => '—',
        "ndash" => '–',
        "middot" => '·',
        "times" => '×',
        "larr" => '←',
        "rarr" => '→',
        "laquo" => '«',
        "raquo" => '»',
        "bull" => '•',
        _ => return None,
    };
    Some(c)
}
