//! Source Packager - turns generated JSX into a self-contained sandbox script.
//!
//! Packaging is a pure function of the [`SourceUnit`]: the source is
//! validated, parsed, lowered to plain JavaScript and wrapped together with the
//! pinned preview runtime. [`Packager`] adds a bounded cache in front of it.

mod document;
mod early;
mod lower;
pub mod syntax;

pub use document::{DocumentKey, PackagedDocument, RUNTIME_SCRIPT, RUNTIME_VERSION};
pub use lower::ExportTable;

use crate::config::PackagerConfig;
use crate::error::PackagingError;
use crate::source::{EntryPoint, SourceUnit};
use moka::sync::Cache;
use std::sync::Arc;

/// Default source size limit used by [`package`].
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 256 * 1024;

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Package `unit` with the default size limit.
pub fn package(unit: &SourceUnit) -> Result<PackagedDocument, PackagingError> {
    package_with_limit(unit, DEFAULT_MAX_SOURCE_BYTES)
}

pub fn package_with_limit(
    unit: &SourceUnit,
    max_source_bytes: usize,
) -> Result<PackagedDocument, PackagingError> {
    if unit.source.trim().is_empty() {
        return Err(PackagingError::Empty);
    }
    if unit.source.len() > max_source_bytes {
        return Err(PackagingError::TooLarge {
            size: unit.source.len(),
            max: max_source_bytes,
        });
    }
    if let EntryPoint::Named(name) = &unit.entry {
        if !is_identifier(name) {
            return Err(PackagingError::InvalidEntry(name.clone()));
        }
    }

    let tree = syntax::parse(&unit.source)?;
    let lowered = lower::lower(&tree, &unit.source)?;
    let binding = lowered.exports.resolve(&unit.entry).map(str::to_string);
    let key = DocumentKey::of(unit);

    if binding.is_none() {
        tracing::warn!(
            entry = %unit.entry,
            key = %key,
            "entry point not defined by source; sandbox will render a diagnostic"
        );
    }

    Ok(PackagedDocument::assemble(
        key,
        unit.entry.clone(),
        binding,
        &lowered,
    ))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$');
    starts_well
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        && !RESERVED_WORDS.contains(&name)
}

/// Caching front for [`package_with_limit`]. Cheap to clone.
#[derive(Clone)]
pub struct Packager {
    max_source_bytes: usize,
    cache: Cache<DocumentKey, Arc<PackagedDocument>>,
}

impl Packager {
    pub fn new(config: &PackagerConfig) -> Self {
        Self {
            max_source_bytes: config.max_source_bytes,
            cache: Cache::new(config.cache_capacity),
        }
    }

    pub fn package(&self, unit: &SourceUnit) -> Result<Arc<PackagedDocument>, PackagingError> {
        let key = DocumentKey::of(unit);
        if let Some(document) = self.cache.get(&key) {
            tracing::debug!(key = %key, "packaged document cache hit");
            return Ok(document);
        }

        let document = Arc::new(package_with_limit(unit, self.max_source_bytes)?);
        self.cache.insert(key, Arc::clone(&document));
        tracing::debug!(key = %key, bytes = document.script.len(), "packaged document");
        Ok(document)
    }

    pub fn cached_documents(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

impl Default for Packager {
    fn default() -> Self {
        Self::new(&PackagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUTTON: &str = r#"
import React, { useState } from 'react';

export default function Button({ label = "Click me" }) {
  const [count, setCount] = useState(0);
  return (
    <button className="btn" onClick={() => setCount(count + 1)}>
      {label} ({count})
    </button>
  );
}
"#;

    #[test]
    fn test_package_is_deterministic() {
        let unit = SourceUnit::default_export(BUTTON);
        let a = package(&unit).unwrap();
        let b = package(&unit).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.script, b.script);
        assert_eq!(a.binding.as_deref(), Some("Button"));
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(
            package(&SourceUnit::default_export("  \n\t")).unwrap_err(),
            PackagingError::Empty
        );
    }

    #[test]
    fn test_too_large() {
        let unit = SourceUnit::default_export("const a = 1;\n".repeat(10));
        assert!(matches!(
            package_with_limit(&unit, 16),
            Err(PackagingError::TooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_invalid_entry_names() {
        for name in ["1App", "my-app", "class", "a b"] {
            assert_eq!(
                package(&SourceUnit::named(BUTTON, name)).unwrap_err(),
                PackagingError::InvalidEntry(name.to_string()),
            );
        }
    }

    #[test]
    fn test_syntax_error_never_produces_document() {
        let result = package(&SourceUnit::default_export("export default () => <div>;"));
        assert!(matches!(result, Err(PackagingError::SyntaxInvalid { .. })));
    }

    #[test]
    fn test_unresolved_entry_still_packages() {
        let doc = package(&SourceUnit::named("const Other = () => null;", "App")).unwrap();
        assert!(!doc.is_resolved());
        assert!(doc.script.contains(";return undefined;"));
    }

    #[test]
    fn test_script_layout() {
        let doc = package(&SourceUnit::default_export(BUTTON)).unwrap();
        assert!(doc.script.starts_with(&format!("// {RUNTIME_VERSION} entry=default key=")));
        assert!(doc.script.contains(
            "globalThis.__previewMount(\"default\", function (__preview_react__, __preview_react_dom__) {"
        ));
        assert!(doc.script.contains("const { useState } = __preview_react__;"));
        assert!(doc.script.contains(";return Button;"));
        assert!(doc.script.trim_end().ends_with("});"));
        assert!(!doc.script.contains("<button"));
        assert_eq!(doc.runtime, RUNTIME_SCRIPT);
    }

    #[test]
    fn test_document_script_never_names_the_bridge() {
        let doc = package(&SourceUnit::default_export(BUTTON)).unwrap();
        assert!(!doc.script.contains("bridge"));
        assert!(!doc.script.contains("__previewBridge"));
        assert!(!doc.script.contains("__preview_runtime__"));
    }

    #[test]
    fn test_packager_caches_by_key() {
        let packager = Packager::default();
        let unit = SourceUnit::default_export(BUTTON);
        let a = packager.package(&unit).unwrap();
        let b = packager.package(&unit).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(packager.cached_documents(), 1);
    }

    #[test]
    fn test_packager_does_not_cache_errors() {
        let packager = Packager::default();
        assert!(packager.package(&SourceUnit::default_export("")).is_err());
        assert_eq!(packager.cached_documents(), 0);
    }
}
