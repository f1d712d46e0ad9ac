//! Allow-listed `fetch` for preview isolates.
//!
//! Security model:
//! - only URLs whose origin is on the allow-list can be fetched (by default
//!   just the pinned runtime CDN)
//! - redirects are followed by hand, only within the same allowed origin and
//!   at most [`MAX_REDIRECTS`] times
//! - response bodies are capped; the render timeout bounds the rest

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use url::Url;

pub const MAX_REDIRECTS: usize = 5;

/// Default cap on a response body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Origins a sandbox may reach.
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    allowed_origins: Vec<String>,
    max_body_bytes: usize,
}

impl NetworkPolicy {
    /// Entries are normalised to their origin, so `https://unpkg.com/` and
    /// `https://unpkg.com` are equivalent. Unparseable entries never match.
    pub fn new(allowed: &[String], max_body_bytes: usize) -> Self {
        let allowed_origins = allowed
            .iter()
            .filter_map(|entry| match Url::parse(entry) {
                Ok(url) => Some(url.origin().ascii_serialization()),
                Err(err) => {
                    tracing::warn!(%entry, %err, "ignoring invalid allowed origin");
                    None
                }
            })
            .filter(|origin| origin != "null")
            .collect();
        Self {
            allowed_origins,
            max_body_bytes,
        }
    }

    /// Policy that refuses everything.
    pub fn deny_all() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_body_bytes: 0,
        }
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    pub fn is_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

/// Request info passed from JS
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response info returned to JS
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_preview_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let policy = {
        let state_ref = state.borrow();
        state_ref
            .try_borrow::<NetworkPolicy>()
            .cloned()
            .unwrap_or_else(NetworkPolicy::deny_all)
    };

    do_fetch(request, &policy).await
}

async fn do_fetch(
    request: FetchRequest,
    policy: &NetworkPolicy,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let mut url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !policy.is_allowed(&url) {
        tracing::warn!(origin = %url.origin().ascii_serialization(), "fetch blocked");
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            policy.allowed_origins
        )
        .into());
    }

    // Redirects are followed by hand below.
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let mut method = parse_method(request.method.as_deref())?;
    let mut body = request.body;
    let mut redirects = 0;

    let response = loop {
        let mut builder = client.request(method.clone(), url.clone());
        if let Some(headers) = &request.headers {
            for (key, value) in headers {
                builder = builder.header(key, value);
            }
        }
        if let Some(body) = body.take() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| anyhow!("Fetch failed: {}", e))?;

        if !response.status().is_redirection() {
            break response;
        }
        let Some(location) = response.headers().get("location") else {
            break response;
        };

        redirects += 1;
        if redirects > MAX_REDIRECTS {
            return Err(anyhow!("Fetch blocked: more than {} redirects", MAX_REDIRECTS).into());
        }

        let location = location
            .to_str()
            .map_err(|_| anyhow!("Invalid redirect location"))?;
        let next = response
            .url()
            .join(location)
            .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

        if next.origin() != url.origin() {
            return Err(anyhow!(
                "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                next.origin().ascii_serialization(),
                url.origin().ascii_serialization()
            )
            .into());
        }
        if !policy.is_allowed(&next) {
            return Err(anyhow!(
                "Fetch blocked: redirect origin '{}' is not in the allowlist",
                next.origin().ascii_serialization()
            )
            .into());
        }

        tracing::debug!(from = %url, to = %next, "following redirect");
        url = next;
        method = Method::GET;
    };

    let status = response.status();
    let final_url = response.url().to_string();

    let mut headers = HashMap::new();
    for (key, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(key.to_string(), v.to_string());
        }
    }

    let body = read_capped(response, policy.max_body_bytes).await?;

    Ok(FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers,
        url: final_url,
        body,
    })
}

fn parse_method(method: Option<&str>) -> Result<Method, anyhow::Error> {
    match method.unwrap_or("GET").to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        other => Err(anyhow!("Unsupported HTTP method: {}", other)),
    }
}

async fn read_capped(
    mut response: reqwest::Response,
    max_bytes: usize,
) -> Result<String, anyhow::Error> {
    if let Some(length) = response.content_length() {
        if length > max_bytes as u64 {
            return Err(anyhow!(
                "Response body of {} bytes exceeds the {} byte limit",
                length,
                max_bytes
            ));
        }
    }

    let mut buf = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?
    {
        if buf.len() + chunk.len() > max_bytes {
            return Err(anyhow!("Response body exceeds the {} byte limit", max_bytes));
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str]) -> NetworkPolicy {
        let origins: Vec<String> = origins.iter().map(|o| o.to_string()).collect();
        NetworkPolicy::new(&origins, DEFAULT_MAX_BODY_BYTES)
    }

    #[test]
    fn test_origin_matching() {
        let policy = policy(&["https://api.example.com", "http://localhost:3000/"]);

        // Allowed
        assert!(policy.is_allowed(&Url::parse("https://api.example.com/users").unwrap()));
        assert!(policy.is_allowed(&Url::parse("https://api.example.com/").unwrap()));
        assert!(policy.is_allowed(&Url::parse("http://localhost:3000/api").unwrap()));

        // Not allowed
        assert!(!policy.is_allowed(&Url::parse("https://evil.com/api").unwrap()));
        assert!(!policy.is_allowed(&Url::parse("http://api.example.com/users").unwrap())); // http vs https
        assert!(!policy.is_allowed(&Url::parse("https://api.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist() {
        assert!(!policy(&[]).is_allowed(&Url::parse("https://anything.com").unwrap()));
        assert!(!NetworkPolicy::deny_all().is_allowed(&Url::parse("https://unpkg.com").unwrap()));
    }

    #[test]
    fn test_invalid_entries_ignored() {
        let policy = policy(&["not a url", "data:text/plain,hi", "https://unpkg.com/react@18/"]);
        assert_eq!(policy.allowed_origins(), ["https://unpkg.com".to_string()]);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(parse_method(None).unwrap(), Method::GET);
        assert_eq!(parse_method(Some("post")).unwrap(), Method::POST);
        assert!(parse_method(Some("TRACE")).is_err());
    }

    #[tokio::test]
    async fn test_blocked_before_any_request() {
        let request = FetchRequest {
            url: "https://evil.example/steal".into(),
            method: None,
            headers: None,
            body: None,
        };
        let err = do_fetch(request, &policy(&["https://unpkg.com"])).await.unwrap_err();
        assert!(err.to_string().contains("not in the allowlist"));
    }
}
