//! Configuration for the preview service.
//!
//! Every section has working defaults, so an empty TOML file (or none at all)
//! is a valid configuration:
//!
//! ```toml
//! [sandbox]
//! max_heap_size = 67108864
//! timeout_ms = 5000
//! allowed_origins = ["https://unpkg.com"]
//! console_capacity = 1000
//!
//! [packager]
//! max_source_bytes = 262144
//! cache_capacity = 64
//!
//! [page]
//! title = "Component Preview"
//! stylesheets = []
//! ```

use crate::error::ConfigError;
use crate::packager::DEFAULT_MAX_SOURCE_BYTES;
use crate::sandbox::network::DEFAULT_MAX_BODY_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// The pinned runtime CDN. The only origin a sandbox may reach by default.
pub const RUNTIME_CDN: &str = "https://unpkg.com";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub sandbox: SandboxConfig,
    pub packager: PackagerConfig,
    pub page: PageConfig,
}

impl PreviewConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Stylesheets are fetched by the host page, so they must come from an
    /// origin the sandbox is allowed to reach as well.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for href in &self.page.stylesheets {
            let url = Url::parse(href)
                .map_err(|e| ConfigError::Invalid(format!("stylesheet `{href}`: {e}")))?;
            let origin = url.origin().ascii_serialization();
            let allowed = self.sandbox.allowed_origins.iter().any(|entry| {
                Url::parse(entry).is_ok_and(|u| u.origin().ascii_serialization() == origin)
            });
            if !allowed {
                return Err(ConfigError::Invalid(format!(
                    "stylesheet `{href}` is not served from an allowed origin"
                )));
            }
        }
        if self.sandbox.console_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.console_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Limits and capabilities of one sandbox instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single render in milliseconds (default: 5000ms, None = unlimited)
    pub timeout_ms: Option<u64>,
    /// Allowed origins for fetch() (empty = fetch disabled)
    pub allowed_origins: Vec<String>,
    /// Maximum response body size for fetch()
    pub max_fetch_bytes: usize,
    /// Console lines that may be undelivered before the bridge starts dropping
    pub console_capacity: usize,
    /// How long unmount waits for the sandbox thread to exit
    pub teardown_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout_ms: Some(5_000),
            allowed_origins: vec![RUNTIME_CDN.to_string()],
            max_fetch_bytes: DEFAULT_MAX_BODY_BYTES,
            console_capacity: 1_000,
            teardown_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagerConfig {
    pub max_source_bytes: usize,
    /// Packaged documents kept in memory.
    pub cache_capacity: u64,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            cache_capacity: 64,
        }
    }
}

/// Host page around rendered markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub title: String,
    /// Pinned stylesheet URLs linked from the page.
    pub stylesheets: Vec<String>,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            title: "Component Preview".to_string(),
            stylesheets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = PreviewConfig::from_toml_str("").unwrap();
        assert_eq!(config, PreviewConfig::default());
        assert_eq!(config.sandbox.allowed_origins, vec![RUNTIME_CDN.to_string()]);
    }

    #[test]
    fn test_partial_sections() {
        let config = PreviewConfig::from_toml_str(
            "[sandbox]\ntimeout_ms = 250\n\n[page]\ntitle = \"Button\"\n",
        )
        .unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(250));
        assert_eq!(config.sandbox.max_heap_size, Some(64 * 1024 * 1024));
        assert_eq!(config.page.title, "Button");
    }

    #[test]
    fn test_stylesheet_must_match_allowed_origin() {
        let ok = "[page]\nstylesheets = [\"https://unpkg.com/tailwindcss@2/dist/tailwind.min.css\"]\n";
        assert!(PreviewConfig::from_toml_str(ok).is_ok());

        let bad = "[page]\nstylesheets = [\"https://cdn.evil.example/x.css\"]\n";
        assert!(matches!(
            PreviewConfig::from_toml_str(bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_zero_console_capacity() {
        assert!(PreviewConfig::from_toml_str("[sandbox]\nconsole_capacity = 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[packager]\ncache_capacity = 8").unwrap();
        let config = PreviewConfig::load(file.path()).unwrap();
        assert_eq!(config.packager.cache_capacity, 8);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            PreviewConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
