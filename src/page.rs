//! Host page framing and viewport emulation.
//!
//! Markup rendered by a sandbox is shown inside an `<iframe sandbox>` with no
//! script execution and an opaque origin, so it cannot reach the host page's
//! cookies, storage or frame. Viewport sizes are applied to the container
//! around the frame; the sandbox never knows about them.

use crate::config::PageConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Emulated device viewport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Viewport {
    Mobile,
    Tablet,
    #[default]
    Desktop,
}

impl Viewport {
    /// CSS `(width, height)` of the mounting container.
    pub fn dimensions(&self) -> (&'static str, &'static str) {
        match self {
            Viewport::Mobile => ("375px", "667px"),
            Viewport::Tablet => ("768px", "1024px"),
            Viewport::Desktop => ("100%", "100%"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Viewport::Mobile => "mobile",
            Viewport::Tablet => "tablet",
            Viewport::Desktop => "desktop",
        }
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Viewport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mobile" => Ok(Viewport::Mobile),
            "tablet" => Ok(Viewport::Tablet),
            "desktop" => Ok(Viewport::Desktop),
            other => Err(format!(
                "unknown viewport `{other}` (expected mobile, tablet or desktop)"
            )),
        }
    }
}

const BASE_STYLE: &str = "body {\n  margin: 0;\n  padding: 20px;\n  font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', 'Roboto', sans-serif;\n  background: white;\n}\n* {\n  box-sizing: border-box;\n}";

/// Complete HTML document around server-rendered `markup`.
///
/// The page carries a Content-Security-Policy that forbids scripts outright
/// and only admits inline styles plus stylesheets from the configured
/// origins.
pub fn render_page(markup: &str, config: &PageConfig) -> String {
    let mut style_sources = vec!["'unsafe-inline'".to_string()];
    for href in &config.stylesheets {
        if let Ok(url) = url::Url::parse(href) {
            let origin = url.origin().ascii_serialization();
            if origin != "null" && !style_sources.contains(&origin) {
                style_sources.push(origin);
            }
        }
    }
    let csp = format!(
        "default-src 'none'; script-src 'none'; style-src {}; img-src data:; font-src data:; base-uri 'none'; form-action 'none'",
        style_sources.join(" ")
    );

    let mut page = String::with_capacity(markup.len() + 1024);
    page.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    page.push_str("<meta charset=\"UTF-8\">\n");
    page.push_str(&format!(
        "<meta http-equiv=\"Content-Security-Policy\" content=\"{}\">\n",
        escape_attribute(&csp)
    ));
    page.push_str(
        "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n",
    );
    page.push_str(&format!("<title>{}</title>\n", escape_text(&config.title)));
    for href in &config.stylesheets {
        page.push_str(&format!(
            "<link rel=\"stylesheet\" href=\"{}\">\n",
            escape_attribute(href)
        ));
    }
    page.push_str("<style>\n");
    page.push_str(BASE_STYLE);
    page.push_str("\n</style>\n</head>\n<body>\n<div id=\"root\">");
    page.push_str(markup);
    page.push_str("</div>\n</body>\n</html>\n");
    page
}

/// Frame `page` for the host UI, sized for `viewport`.
///
/// The empty `sandbox` attribute applies every restriction: no scripts, no
/// same-origin access, no top navigation, no forms, no popups.
pub fn frame(page: &str, viewport: Viewport) -> String {
    let (width, height) = viewport.dimensions();
    format!(
        "<div class=\"preview-viewport\" data-viewport=\"{viewport}\" style=\"width: {width}; height: {height}; max-width: 100%; margin: 0 auto;\">\
<iframe sandbox=\"\" referrerpolicy=\"no-referrer\" title=\"Component Preview\" style=\"width: 100%; height: 100%; border: 0;\" srcdoc=\"{}\"></iframe>\
</div>",
        escape_attribute(page)
    )
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(value: &str) -> String {
    escape_text(value)
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_parse() {
        assert_eq!("Mobile".parse::<Viewport>().unwrap(), Viewport::Mobile);
        assert_eq!("tablet".parse::<Viewport>().unwrap(), Viewport::Tablet);
        assert!("watch".parse::<Viewport>().is_err());
        assert_eq!(Viewport::default(), Viewport::Desktop);
    }

    #[test]
    fn test_page_forbids_scripts() {
        let page = render_page("<button>Hi</button>", &PageConfig::default());
        assert!(page.contains("script-src 'none'"));
        assert!(page.contains("<div id=\"root\"><button>Hi</button></div>"));
        assert!(page.contains("<title>Component Preview</title>"));
        assert!(!page.contains("<script"));
    }

    #[test]
    fn test_page_stylesheets_join_csp() {
        let config = PageConfig {
            title: "<Card>".into(),
            stylesheets: vec!["https://unpkg.com/tailwindcss@2/dist/tailwind.min.css".into()],
        };
        let page = render_page("", &config);
        assert!(page.contains("style-src 'unsafe-inline' https://unpkg.com;"));
        assert!(page.contains("<link rel=\"stylesheet\" href=\"https://unpkg.com/tailwindcss@2/dist/tailwind.min.css\">"));
        assert!(page.contains("<title>&lt;Card&gt;</title>"));
    }

    #[test]
    fn test_frame_escapes_srcdoc() {
        let framed = frame("<p class=\"x\">a & b</p>", Viewport::Mobile);
        assert!(framed.contains("sandbox=\"\""));
        assert!(framed.contains("width: 375px; height: 667px;"));
        assert!(framed.contains("srcdoc=\"&lt;p class=&quot;x&quot;&gt;a &amp; b&lt;/p&gt;\""));
        assert!(!framed.contains("allow-scripts"));
    }
}
