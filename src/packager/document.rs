//! The packaged, self-contained script handed to a sandbox.

use crate::packager::lower::{js_string, Lowered, FRAGMENT, H, REACT, REACT_DOM};
use crate::source::{EntryPoint, SourceUnit};
use sha2::{Digest, Sha256};
use std::fmt;

/// Version of the bundled preview runtime. Part of every document key, so
/// bumping it invalidates cached documents.
pub const RUNTIME_VERSION: &str = "preview-runtime/1.0.0";

/// The pinned runtime as a classic script. It takes the bridge off the
/// global object and keeps it in its own closure, leaving only a single-use
/// `__previewMount` behind for the document.
pub const RUNTIME_SCRIPT: &str = concat!(
    "(function (bridge) {\n\"use strict\";\n",
    include_str!("../js/runtime.js"),
    "\n})(globalThis.__previewBridge);\n"
);

/// SHA-256 over the runtime version, the entry and the source text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentKey([u8; 32]);

impl DocumentKey {
    pub fn of(unit: &SourceUnit) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(RUNTIME_VERSION.as_bytes());
        hasher.update([0]);
        match &unit.entry {
            EntryPoint::Default => hasher.update(b"d"),
            EntryPoint::Named(name) => {
                hasher.update(b"n:");
                hasher.update(name.as_bytes());
            }
        }
        hasher.update([0]);
        hasher.update(unit.source.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::LowerHex for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:x}")
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentKey({self:x})")
    }
}

/// Immutable executable artifact derived from one [`SourceUnit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedDocument {
    pub key: DocumentKey,
    pub entry: EntryPoint,
    /// Local binding the entry resolved to, `None` when the source does not
    /// define it. Such documents still mount and render a diagnostic.
    pub binding: Option<String>,
    /// Runtime script, evaluated before [`script`](Self::script).
    pub runtime: &'static str,
    /// Classic script holding the lowered module. It sees React through
    /// parameters and nothing of the bridge.
    pub script: String,
}

impl PackagedDocument {
    pub(crate) fn assemble(
        key: DocumentKey,
        entry: EntryPoint,
        binding: Option<String>,
        lowered: &Lowered,
    ) -> Self {
        let mut script = String::with_capacity(lowered.body.len() + 512);

        script.push_str(&format!(
            "// {RUNTIME_VERSION} entry={} key={key:x}\n",
            entry.label()
        ));
        script.push_str(&format!(
            "globalThis.__previewMount({}, function ({REACT}, {REACT_DOM}) {{\n\"use strict\";\n",
            js_string(entry.label())
        ));
        script.push_str(&format!(
            "const {H} = {REACT}.createElement;\n\
             const {FRAGMENT} = {REACT}.Fragment;\n"
        ));
        script.push_str(&lowered.prelude);
        script.push_str(&lowered.body);
        script.push_str(&format!(
            "\n;return {};\n}});\n",
            binding.as_deref().unwrap_or("undefined")
        ));

        Self {
            key,
            entry,
            binding,
            runtime: RUNTIME_SCRIPT,
            script,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.binding.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_depends_on_entry_and_source() {
        let a = DocumentKey::of(&SourceUnit::named("x", "App"));
        let b = DocumentKey::of(&SourceUnit::named("x", "Card"));
        let c = DocumentKey::of(&SourceUnit::default_export("x"));
        let d = DocumentKey::of(&SourceUnit::named("y", "App"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a, DocumentKey::of(&SourceUnit::named("x", "App")));
    }

    #[test]
    fn test_runtime_keeps_the_bridge() {
        assert!(RUNTIME_SCRIPT.starts_with("(function (bridge) {"));
        assert!(RUNTIME_SCRIPT.trim_end().ends_with("})(globalThis.__previewBridge);"));
        assert!(RUNTIME_SCRIPT.contains("__previewMount"));
    }

    #[test]
    fn test_key_hex() {
        let key = DocumentKey::of(&SourceUnit::default_export("x"));
        let hex = key.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
