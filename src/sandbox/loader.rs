//! Module loader for preview isolates.
//!
//! A packaged document is a single classic script with its runtime bundled
//! in, so there is nothing to load. Every `import()` the generated code
//! attempts is refused: no network, no filesystem, no data or blob URLs.

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSpecifier, RequestedModuleType, ResolutionKind,
};

const REMOTE_SCHEMES: &[&str] = &["http://", "https://", "data:", "blob:"];

#[derive(Debug, Default, Clone, Copy)]
pub struct SealedLoader;

impl ModuleLoader for SealedLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if REMOTE_SCHEMES.iter().any(|scheme| specifier.starts_with(scheme)) {
            return Err(anyhow!("Remote imports are forbidden: {}", specifier));
        }
        Err(anyhow!(
            "Module '{}' is not available in the preview sandbox; only the bundled runtime can be used",
            specifier
        ))
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        ModuleLoadResponse::Sync(Err(anyhow!(
            "Access denied: {}",
            module_specifier
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_remote_urls() {
        let result = SealedLoader.resolve(
            "https://unpkg.com/react@18/umd/react.development.js",
            "<preview>",
            ResolutionKind::DynamicImport,
        );
        assert!(result.unwrap_err().to_string().contains("Remote imports are forbidden"));
    }

    #[test]
    fn test_blocks_relative_and_bare_imports() {
        for specifier in ["./chunk.js", "../../../etc/passwd", "lodash", "file:///etc/passwd"] {
            let result = SealedLoader.resolve(specifier, "<preview>", ResolutionKind::Import);
            assert!(
                result.unwrap_err().to_string().contains("not available"),
                "{specifier}"
            );
        }
    }

    #[test]
    fn test_blocks_data_urls() {
        let result = SealedLoader.resolve(
            "data:text/javascript,export default 1",
            "<preview>",
            ResolutionKind::DynamicImport,
        );
        assert!(result.is_err());
    }
}
