//! Rust side of the sandbox `fetch` override.
//!
//! Root-relative paths (`/data/posts.json`) are served from the build output
//! directory on disk, so render code can load the same files the deployed
//! site will. Every other URL goes to the network through `reqwest`, limited
//! to an optional origin allowlist. Redirects are followed only within the
//! original origin.

use anyhow::anyhow;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use url::Url;

/// Fetch settings stored in the runtime's op state.
#[derive(Debug, Clone, Default)]
pub struct FetchState {
    /// Build output directory; root-relative paths are read from here.
    pub out_dir: PathBuf,
    /// Network origins render code may reach. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl FetchState {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }

    /// On-disk file for a root-relative request path, or `None` when the
    /// path would leave the output directory.
    pub fn local_path(&self, request_path: &str) -> Option<PathBuf> {
        let path = request_path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_start_matches('/');
        let mut resolved = self.out_dir.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

/// True for `/path` but not for protocol-relative `//host/path`.
pub fn is_local_request(url: &str) -> bool {
    url.starts_with('/') && !url.starts_with("//")
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
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

impl FetchResponse {
    fn local(url: &str, status: u16, status_text: &str, body: String) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            status_text: status_text.to_string(),
            headers: HashMap::new(),
            url: url.to_string(),
            body,
        }
    }
}

#[op2(async)]
#[serde]
pub async fn op_prerender_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let config = {
        let state_ref = state.borrow();
        state_ref.borrow::<FetchState>().clone()
    };

    if is_local_request(&request.url) {
        return read_local(&request.url, &config).await;
    }
    do_fetch(request, config).await
}

async fn read_local(
    url: &str,
    config: &FetchState,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let Some(path) = config.local_path(url) else {
        return Ok(FetchResponse::local(url, 403, "Forbidden", String::new()));
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => {
            tracing::debug!(url, path = %path.display(), "served fetch from output directory");
            Ok(FetchResponse::local(url, 200, "OK", body))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(url, "fetch of missing output file");
            Ok(FetchResponse::local(url, 404, "Not Found", String::new()))
        }
        Err(e) => Err(anyhow!("Failed to read '{}': {}", path.display(), e)),
    }
}

/// Network fetch (can be called recursively for redirects)
async fn do_fetch(
    request: FetchRequest,
    config: FetchState,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !config.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            config.allowed_origins
        ));
    }

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let method = match request.method.as_deref().unwrap_or("GET").to_uppercase().as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "PATCH" => Method::PATCH,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        other => return Err(anyhow!("Unsupported HTTP method: {}", other)),
    };

    let mut req_builder = client.request(method, url.clone());
    if let Some(ref headers) = request.headers {
        for (key, value) in headers {
            req_builder = req_builder.header(key, value);
        }
    }
    if let Some(body) = request.body {
        req_builder = req_builder.body(body);
    }

    tracing::debug!(url = %url, "sandbox network fetch");
    let response = req_builder
        .send()
        .await
        .map_err(|e| anyhow!("Fetch failed: {}", e))?;

    let status = response.status();
    let final_url = response.url().clone();

    if status.is_redirection() {
        if let Some(location) = response.headers().get("location") {
            let location_str = location
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let redirect_url = final_url
                .join(location_str)
                .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

            if redirect_url.origin() != url.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    redirect_url.origin().ascii_serialization(),
                    url.origin().ascii_serialization()
                ));
            }

            let redirect_request = FetchRequest {
                url: redirect_url.to_string(),
                method: Some("GET".to_string()),
                headers: request.headers.clone(),
                body: None,
            };
            return Box::pin(do_fetch(redirect_request, config)).await;
        }
    }

    let mut resp_headers = HashMap::new();
    for (key, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            resp_headers.insert(key.to_string(), v.to_string());
        }
    }

    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

    Ok(FetchResponse {
        ok: status.is_success(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers: resp_headers,
        url: final_url.to_string(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(out_dir: &Path, allowed: &[&str]) -> FetchState {
        FetchState {
            out_dir: out_dir.to_path_buf(),
            allowed_origins: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_origin_matching() {
        let config = state(
            Path::new("dist"),
            &["https://api.example.com", "http://localhost:3000"],
        );

        assert!(config.is_origin_allowed(&Url::parse("https://api.example.com/users").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("http://localhost:3000/api").unwrap()));

        assert!(!config.is_origin_allowed(&Url::parse("https://evil.com/api").unwrap()));
        assert!(!config.is_origin_allowed(&Url::parse("http://api.example.com/users").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&Url::parse("https://api.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist_allows_network() {
        let config = state(Path::new("dist"), &[]);
        assert!(config.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[test]
    fn test_local_request_detection() {
        assert!(is_local_request("/posts.json"));
        assert!(!is_local_request("//cdn.example.com/x.json"));
        assert!(!is_local_request("https://example.com/x.json"));
        assert!(!is_local_request("posts.json"));
    }

    #[test]
    fn test_local_paths_stay_in_out_dir() {
        let config = state(Path::new("/site/dist"), &[]);
        assert_eq!(
            config.local_path("/data/posts.json?v=2"),
            Some(PathBuf::from("/site/dist/data/posts.json"))
        );
        assert_eq!(config.local_path("/../secret.txt"), None);
    }

    #[tokio::test]
    async fn test_read_local_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/posts.json"), r#"[{"id":1}]"#).unwrap();
        let config = state(dir.path(), &[]);

        let found = read_local("/data/posts.json", &config).await.unwrap();
        assert!(found.ok);
        assert_eq!(found.body, r#"[{"id":1}]"#);

        let missing = read_local("/nope.json", &config).await.unwrap();
        assert!(!missing.ok);
        assert_eq!(missing.status, 404);

        let escaped = read_local("/../x", &config).await.unwrap();
        assert_eq!(escaped.status, 403);
    }
}
