//! The sandbox the prerender entry runs in.
//!
//! [`SandboxEnvironment`] owns the temporary directory that compiled chunks
//! are copied into and the `location` state shared with rendering code.
//! Module loading sits behind [`EntryLoader`] so the crawler can be driven by
//! a fake loader in tests; [`crate::runtime::DenoLoader`] is the real one.
//!
//! Routes must be rendered one at a time: `location` and the other shims are
//! shared by every render in the runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use url::Url;

use crate::bundle::Bundle;
use crate::config::BuildOptions;
use crate::error::{PrerenderError, Result};
use crate::head::Head;
use crate::route::{Location, Route};

/// Prefix of sandbox directories, used to find stale leftovers.
pub const SANDBOX_PREFIX: &str = "headless-prerender-";

/// Sandboxes untouched for this long belong to builds that are gone.
/// Younger ones may be in use by a concurrent build of the same project.
pub const STALE_SANDBOX_AGE: Duration = Duration::from_secs(60 * 60);

/// What the user's `prerender` function returned for a route.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "RawResult")]
pub struct PrerenderResult {
    pub html: Option<String>,
    pub head: Option<Head>,
    pub links: Vec<String>,
    pub data: Option<serde_json::Value>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct FullResult {
    html: Option<String>,
    head: Option<Head>,
    links: Option<Vec<serde_json::Value>>,
    data: Option<serde_json::Value>,
}

/// A bare string result is the body HTML.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawResult {
    Html(String),
    Full(FullResult),
}

impl From<RawResult> for PrerenderResult {
    fn from(raw: RawResult) -> Self {
        match raw {
            RawResult::Html(html) => Self {
                html: Some(html),
                ..Self::default()
            },
            RawResult::Full(full) => Self {
                html: full.html,
                head: full.head,
                // Non-string links cannot name a route.
                links: full
                    .links
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|link| match link {
                        serde_json::Value::String(url) => Some(url),
                        _ => None,
                    })
                    .collect(),
                data: full.data,
            },
        }
    }
}

/// Argument passed to `prerender({ ssr: true, url, route })`.
#[derive(Debug, Clone, Serialize)]
pub struct RenderArgs {
    pub ssr: bool,
    pub url: String,
    pub route: Route,
}

impl RenderArgs {
    pub fn new(route: &Route) -> Self {
        Self {
            ssr: true,
            url: route.url.clone(),
            route: route.clone(),
        }
    }
}

/// A loaded `prerender` export.
#[async_trait(?Send)]
pub trait PrerenderFn {
    /// Render one route. `Ok(None)` means the function returned null/undefined.
    async fn call(
        &mut self,
        env: &SandboxEnvironment,
        args: &RenderArgs,
    ) -> anyhow::Result<Option<PrerenderResult>>;
}

/// Loads the entry chunk from the sandbox and hands back its `prerender`.
#[async_trait(?Send)]
pub trait EntryLoader {
    type Prerender: PrerenderFn;

    async fn load_entry_point(
        &mut self,
        env: &SandboxEnvironment,
        path: &Path,
    ) -> anyhow::Result<Self::Prerender>;
}

/// Directory where sandboxes are created: the project's module cache when
/// there is one, the system temp dir otherwise.
pub fn sandbox_parent(root: &Path) -> PathBuf {
    let node_modules = root.join("node_modules");
    if node_modules.is_dir() {
        node_modules.join(".cache")
    } else {
        std::env::temp_dir()
    }
}

/// Remove sandbox directories left behind by earlier builds, keeping any
/// modified within `max_age`.
fn clean_stale(parent: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(parent) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SANDBOX_PREFIX) {
            continue;
        }
        // A modification time in the future also counts as fresh.
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        if age.is_none_or(|age| age < max_age) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "could not remove stale sandbox")
            }
        }
    }
    removed
}

/// Per-build sandbox state.
pub struct SandboxEnvironment {
    dir: TempDir,
    canonical_dir: PathBuf,
    out_dir: PathBuf,
    origin: Url,
    location: Location,
}

impl SandboxEnvironment {
    /// Create an empty sandbox for `build`, resolving routes against `origin`.
    pub fn create(build: &BuildOptions, origin: &str) -> Result<Self> {
        let parent = sandbox_parent(&build.root);
        std::fs::create_dir_all(&parent).map_err(|e| PrerenderError::io(&parent, e))?;
        // Only sweep the project cache; the system temp dir is shared with
        // other builds.
        if parent != std::env::temp_dir() {
            let removed = clean_stale(&parent, STALE_SANDBOX_AGE);
            if removed > 0 {
                tracing::debug!(removed, "removed stale sandbox directories");
            }
        }

        let dir = tempfile::Builder::new()
            .prefix(SANDBOX_PREFIX)
            .tempdir_in(&parent)
            .map_err(|e| PrerenderError::io(&parent, e))?;
        let canonical_dir = dir
            .path()
            .canonicalize()
            .map_err(|e| PrerenderError::io(dir.path(), e))?;

        let manifest = canonical_dir.join("package.json");
        std::fs::write(&manifest, r#"{"type":"module"}"#)
            .map_err(|e| PrerenderError::io(&manifest, e))?;

        let origin = Url::parse(origin)
            .map_err(|e| PrerenderError::Config(format!("invalid origin '{origin}': {e}")))?;
        let location = Location::from_url(&origin);
        tracing::info!(dir = %canonical_dir.display(), "created prerender sandbox");

        Ok(Self {
            dir,
            canonical_dir,
            out_dir: build.out_dir.clone(),
            origin,
            location,
        })
    }

    /// Canonical path of the sandbox directory.
    pub fn dir(&self) -> &Path {
        &self.canonical_dir
    }

    /// Directory same-origin `fetch` requests are served from.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Point `location` at `url`, resolved against the sandbox origin.
    pub fn set_location(&mut self, url: &str) -> Result<()> {
        let resolved = self
            .origin
            .join(url)
            .map_err(|e| PrerenderError::Config(format!("invalid route url '{url}': {e}")))?;
        self.location = Location::from_url(&resolved);
        Ok(())
    }

    /// Sandbox path of an output chunk.
    pub fn chunk_path(&self, file_name: &str) -> PathBuf {
        file_name
            .split('/')
            .fold(self.canonical_dir.clone(), |path, part| path.join(part))
    }

    /// Copy every script chunk into the sandbox, keeping output-relative
    /// paths so imports between chunks resolve.
    pub fn write_chunks(&self, bundle: &Bundle) -> Result<usize> {
        let mut written = 0;
        for chunk in bundle.chunks() {
            let path = self.chunk_path(&chunk.file_name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PrerenderError::io(parent, e))?;
            }
            std::fs::write(&path, &chunk.code).map_err(|e| PrerenderError::io(&path, e))?;
            written += 1;
        }
        tracing::debug!(chunks = written, "copied chunks into sandbox");
        Ok(written)
    }

    /// Output-relative chunk name for a path inside the sandbox.
    pub fn chunk_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.canonical_dir).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Delete the sandbox now instead of on drop.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| PrerenderError::io(path, e))
    }
}
