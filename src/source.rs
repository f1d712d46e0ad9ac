//! Generated source plus its declared entry point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which binding of the generated module is the component to render.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    /// The module's default export.
    Default,
    /// A named export, a legacy `window.<name>` registration, or a top-level
    /// declaration, in that order.
    Named(String),
}

impl EntryPoint {
    /// Parses the CLI / wire form: `default` selects the default export,
    /// anything else is a binding name.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "default" => EntryPoint::Default,
            name => EntryPoint::Named(name.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            EntryPoint::Default => "default",
            EntryPoint::Named(name) => name,
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Untrusted generated source text together with its entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceUnit {
    pub source: String,
    pub entry: EntryPoint,
}

impl SourceUnit {
    pub fn new(source: impl Into<String>, entry: EntryPoint) -> Self {
        Self {
            source: source.into(),
            entry,
        }
    }

    /// Source whose component is the binding `name`.
    pub fn named(source: impl Into<String>, name: &str) -> Self {
        Self::new(source, EntryPoint::Named(name.to_string()))
    }

    /// Source whose component is its default export.
    pub fn default_export(source: impl Into<String>) -> Self {
        Self::new(source, EntryPoint::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_parse() {
        assert_eq!(EntryPoint::parse("default"), EntryPoint::Default);
        assert_eq!(EntryPoint::parse("  "), EntryPoint::Default);
        assert_eq!(EntryPoint::parse("App"), EntryPoint::Named("App".into()));
    }

    #[test]
    fn test_entry_label() {
        assert_eq!(EntryPoint::Default.to_string(), "default");
        assert_eq!(SourceUnit::named("x", "Card").entry.label(), "Card");
    }
}
