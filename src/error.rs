//! Prerender errors.
//!
//! Discovery and sandbox failures abort the whole build. A route whose render
//! returns nothing is not an error: it is logged and skipped by the crawler.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a prerender build step.
#[derive(Error, Debug)]
pub enum PrerenderError {
    #[error("{0}")]
    Discovery(String),

    /// Importing or invoking the sandboxed module threw. `message` already
    /// carries the guidance text and, when resolvable, the original source frame.
    #[error("{message}")]
    SandboxLoad { message: String, located: bool },

    #[error("Detected `prerender` export, but it is not a function")]
    NotAFunction,

    #[error("Render target `{selector}` not found in the HTML template (route {route})")]
    RenderTargetMissing { selector: String, route: String },

    #[error("Invalid HTML template: {0}")]
    Template(String),

    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JavaScript runtime error: {0}")]
    Js(String),

    #[error("Route limit of {0} exceeded while crawling; raise `maxRoutes` or check the links your renderer returns")]
    RouteLimit(usize),
}

pub type Result<T> = std::result::Result<T, PrerenderError>;

impl PrerenderError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
