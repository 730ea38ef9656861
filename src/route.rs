//! Routes, the fake `location`, and link normalization.

use std::rc::Rc;

use serde::{Serialize, Serializer};
use url::Url;

/// A page path to prerender.
///
/// `url` is a normalized pathname. `discovered_by` records which route's
/// links produced this one; it is only used for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub url: String,
    pub discovered_by: Option<Rc<Route>>,
}

impl Route {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            discovered_by: None,
        }
    }

    pub fn discovered(url: impl Into<String>, by: Rc<Route>) -> Self {
        Self {
            url: url.into(),
            discovered_by: Some(by),
        }
    }

    /// Discovery chain from the seed route down to this one.
    pub fn provenance(&self) -> Vec<&str> {
        let mut chain = vec![self.url.as_str()];
        let mut current = self.discovered_by.as_deref();
        while let Some(route) = current {
            chain.push(route.url.as_str());
            current = route.discovered_by.as_deref();
        }
        chain.reverse();
        chain
    }

    /// Output asset name: `index.html` under the route's directory, unless
    /// the route already names an `.html` file.
    pub fn asset_name(&self) -> String {
        asset_name(&self.url)
    }
}

impl Serialize for Route {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Route", 2)?;
        state.serialize_field("url", &self.url)?;
        match &self.discovered_by {
            Some(by) => state.serialize_field("discoveredBy", by.as_ref())?,
            None => state.skip_field("discoveredBy")?,
        }
        state.end()
    }
}

pub fn asset_name(url: &str) -> String {
    let out_dir = url.trim_matches('/');
    if out_dir.is_empty() {
        "index.html".to_string()
    } else if out_dir.ends_with(".html") {
        out_dir.to_string()
    } else {
        format!("{out_dir}/index.html")
    }
}

/// Strip the trailing slash of a pathname, keeping the root as `/`.
pub fn normalize_pathname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Resolve `link` against `origin` and return its normalized pathname.
///
/// Cross-origin and unparsable links yield `None`; they are never crawled.
pub fn same_origin_pathname(link: &str, origin: &Url) -> Option<String> {
    let resolved = origin.join(link.trim()).ok()?;
    if resolved.origin() != origin.origin() {
        return None;
    }
    Some(normalize_pathname(resolved.path()))
}

/// The `location` object exposed to rendering code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Location {
    pub href: String,
    pub origin: String,
    pub protocol: String,
    pub host: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl Location {
    pub fn from_url(url: &Url) -> Self {
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{hostname}:{port}")
        };
        Self {
            href: url.to_string(),
            origin: url.origin().ascii_serialization(),
            protocol: format!("{}:", url.scheme()),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
            hash: url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("http://localhost").unwrap()
    }

    #[test]
    fn test_asset_names() {
        assert_eq!(asset_name("/"), "index.html");
        assert_eq!(asset_name("/about"), "about/index.html");
        assert_eq!(asset_name("/blog/post/"), "blog/post/index.html");
        assert_eq!(asset_name("/404.html"), "404.html");
    }

    #[test]
    fn test_same_origin_pathname() {
        let origin = origin();
        assert_eq!(same_origin_pathname("/about/", &origin).as_deref(), Some("/about"));
        assert_eq!(same_origin_pathname("contact", &origin).as_deref(), Some("/contact"));
        assert_eq!(
            same_origin_pathname("http://localhost/a?x=1#top", &origin).as_deref(),
            Some("/a")
        );
        assert_eq!(same_origin_pathname("#top", &origin).as_deref(), Some("/"));
        assert_eq!(same_origin_pathname("https://external.com/x", &origin), None);
        assert_eq!(same_origin_pathname("http://localhost:8080/x", &origin), None);
        assert_eq!(same_origin_pathname("mailto:hi@example.com", &origin), None);
    }

    #[test]
    fn test_normalize_pathname() {
        assert_eq!(normalize_pathname("/"), "/");
        assert_eq!(normalize_pathname(""), "/");
        assert_eq!(normalize_pathname("/a/b/"), "/a/b");
        assert_eq!(normalize_pathname("404"), "/404");
    }

    #[test]
    fn test_location_fields() {
        let url = Url::parse("http://localhost:3000/blog/post?page=2#comments").unwrap();
        let location = Location::from_url(&url);
        assert_eq!(location.origin, "http://localhost:3000");
        assert_eq!(location.protocol, "http:");
        assert_eq!(location.host, "localhost:3000");
        assert_eq!(location.hostname, "localhost");
        assert_eq!(location.port, "3000");
        assert_eq!(location.pathname, "/blog/post");
        assert_eq!(location.search, "?page=2");
        assert_eq!(location.hash, "#comments");
    }

    #[test]
    fn test_route_serializes_provenance() {
        let root = Rc::new(Route::new("/"));
        let about = Rc::new(Route::discovered("/about", root));
        let team = Route::discovered("/about/team", about);

        assert_eq!(team.provenance(), vec!["/", "/about", "/about/team"]);
        let json = serde_json::to_value(&team).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "url": "/about/team",
                "discoveredBy": { "url": "/about", "discoveredBy": { "url": "/" } }
            })
        );
    }
}
