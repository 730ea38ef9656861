//! Configuration for the prerender step and the bundler input it works with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PrerenderError, Result};

/// Origin used for `location` and for deciding which links are same-origin.
pub const DEFAULT_ORIGIN: &str = "http://localhost";

/// Selector that receives rendered markup when none is configured.
pub const DEFAULT_RENDER_TARGET: &str = "body";

/// User-facing prerender options.
///
/// Loaded from a TOML file, then overridden by CLI flags:
///
/// ```toml
/// prerenderScript = "src/index.tsx"
/// renderTarget = "#app"
/// additionalPrerenderRoutes = ["/404"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrerenderConfig {
    /// Script exporting `prerender`. Skips discovery when set.
    pub prerender_script: Option<PathBuf>,
    /// CSS selector where rendered HTML is inserted.
    pub render_target: String,
    /// Routes rendered in addition to `/`, even if no page links to them.
    pub additional_prerender_routes: Vec<String>,
    /// Abort the crawl once this many routes have been queued (None = unbounded).
    pub max_routes: Option<usize>,
    /// Keep source maps in the final output.
    pub sourcemap: bool,
    /// Fake origin routes are resolved against.
    pub origin: String,
    /// Maximum time for a single route render in milliseconds (None = unlimited).
    pub timeout_ms: Option<u64>,
    /// Origins the sandboxed `fetch` may reach over the network (empty = any).
    pub fetch_allowed_origins: Vec<String>,
}

impl Default for PrerenderConfig {
    fn default() -> Self {
        Self {
            prerender_script: None,
            render_target: DEFAULT_RENDER_TARGET.to_string(),
            additional_prerender_routes: Vec::new(),
            max_routes: None,
            sourcemap: false,
            origin: DEFAULT_ORIGIN.to_string(),
            timeout_ms: None,
            fetch_allowed_origins: Vec::new(),
        }
    }
}

impl PrerenderConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| PrerenderError::io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PrerenderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.render_target.trim().is_empty() {
            return Err(PrerenderError::Config(
                "renderTarget must not be empty".to_string(),
            ));
        }
        if self.max_routes == Some(0) {
            return Err(PrerenderError::Config(
                "maxRoutes must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(PrerenderError::Config(
                "timeoutMs must be greater than 0".to_string(),
            ));
        }
        url::Url::parse(&self.origin)
            .map_err(|e| PrerenderError::Config(format!("invalid origin '{}': {e}", self.origin)))?;
        Ok(())
    }
}

/// The bundler's configured entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputOption {
    Single(PathBuf),
    List(Vec<PathBuf>),
    Named(BTreeMap<String, PathBuf>),
}

impl InputOption {
    /// All configured paths, in declaration order.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Single(path) => vec![path.as_path()],
            Self::List(paths) => paths.iter().map(PathBuf::as_path).collect(),
            Self::Named(map) => map.values().map(PathBuf::as_path).collect(),
        }
    }
}

/// How strictly the bundler keeps the export signature of entry chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreserveEntrySignatures {
    #[default]
    Strict,
    AllowExtension,
    ExportsOnly,
    False,
}

/// The slice of the bundler's resolved build configuration this crate reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    /// Project root; relative script paths resolve against it.
    pub root: PathBuf,
    /// Build output directory.
    pub out_dir: PathBuf,
    pub input: Option<InputOption>,
    #[serde(default)]
    pub preserve_entry_signatures: PreserveEntrySignatures,
}

impl BuildOptions {
    pub fn new(root: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let out_dir = out_dir.into();
        let out_dir = if out_dir.is_absolute() {
            out_dir
        } else {
            root.join(out_dir)
        };
        Self {
            root,
            out_dir,
            input: None,
            preserve_entry_signatures: PreserveEntrySignatures::default(),
        }
    }

    pub fn with_input(mut self, input: InputOption) -> Self {
        self.input = Some(input);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PrerenderConfig::default();
        assert_eq!(config.render_target, "body");
        assert_eq!(config.origin, "http://localhost");
        assert!(config.additional_prerender_routes.is_empty());
        assert!(config.max_routes.is_none());
        assert!(!config.sourcemap);
    }

    #[test]
    fn test_from_toml_camel_case() {
        let config = PrerenderConfig::from_toml(
            r##"
            prerenderScript = "src/index.tsx"
            renderTarget = "#app"
            additionalPrerenderRoutes = ["/404"]
            maxRoutes = 50
            "##,
        )
        .unwrap();

        assert_eq!(config.prerender_script, Some(PathBuf::from("src/index.tsx")));
        assert_eq!(config.render_target, "#app");
        assert_eq!(config.additional_prerender_routes, vec!["/404".to_string()]);
        assert_eq!(config.max_routes, Some(50));
        assert_eq!(config.origin, DEFAULT_ORIGIN);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(PrerenderConfig::from_toml("renderTarget = \"  \"").is_err());
        assert!(PrerenderConfig::from_toml("maxRoutes = 0").is_err());
        assert!(PrerenderConfig::from_toml("origin = \"not a url\"").is_err());
        assert!(PrerenderConfig::from_toml("unknown = [").is_err());
    }

    #[test]
    fn test_input_option_shapes() {
        let single: InputOption = serde_json::from_str(r#""index.html""#).unwrap();
        assert_eq!(single.paths(), vec![Path::new("index.html")]);

        let list: InputOption = serde_json::from_str(r#"["a.html", "b.js"]"#).unwrap();
        assert_eq!(list.paths().len(), 2);

        let named: InputOption = serde_json::from_str(r#"{"main": "index.html"}"#).unwrap();
        assert!(matches!(named, InputOption::Named(_)));
    }

    #[test]
    fn test_relative_out_dir_joins_root() {
        let build = BuildOptions::new("/project", "dist");
        assert_eq!(build.out_dir, PathBuf::from("/project/dist"));
        let build = BuildOptions::new("/project", "/elsewhere/out");
        assert_eq!(build.out_dir, PathBuf::from("/elsewhere/out"));
    }
}
