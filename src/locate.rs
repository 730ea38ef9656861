//! Error Locator: map a failure inside the sandbox back to original source.
//!
//! The first stack frame that points into the sandbox is resolved through
//! the chunk's source map. When that works the error carries a code frame
//! from the original file; when it does not, the message says so instead of
//! guessing.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use ariadne::{Config, Label, Report, ReportKind, Source};
use oxc_sourcemap::SourceMap;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::bundle::Bundle;
use crate::error::PrerenderError;

static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(file://[^\s()]+|/[^\s()]+):(\d+):(\d+)").expect("valid regex")
});

const UNLOCATED: &str = "unable to locate source map";

/// An exception thrown by sandboxed JavaScript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
#[serde(default)]
pub struct JsFailure {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl From<&deno_core::error::JsError> for JsFailure {
    fn from(err: &deno_core::error::JsError) -> Self {
        Self {
            name: err.name.clone().unwrap_or_else(|| "Error".to_string()),
            message: err
                .message
                .clone()
                .unwrap_or_else(|| err.exception_message.clone()),
            stack: err.stack.clone().unwrap_or_default(),
        }
    }
}

impl JsFailure {
    pub fn is_reference_error(&self) -> bool {
        self.name == "ReferenceError"
    }

    fn guidance(&self) -> String {
        if self.is_reference_error() {
            format!(
                "{} usually means browser-only code ran during prerendering. \
                 Guard it with `if (typeof window !== \"undefined\")` so it only runs in the browser.",
                self.name
            )
        } else {
            "If this code relies on browser APIs, guard it with \
             `if (typeof window !== \"undefined\")` so it is skipped during prerendering."
                .to_string()
        }
    }
}

/// A position in an original source file. Line and column are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub line: u32,
    pub column: u32,
    /// Rendered code frame, when the source text was available.
    pub frame: Option<String>,
}

/// Chunk position from a stack frame. Line and column are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    path: PathBuf,
    line: u32,
    column: u32,
}

#[derive(Debug, Clone)]
struct ChunkMap {
    json: String,
    /// Output-relative name of the map (or of the chunk, for inline maps).
    base: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct MapRoot {
    source_root: Option<String>,
}

/// Lexically resolve `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 0-indexed line/column to a char offset in `content`.
fn char_offset(content: &str, line: u32, column: u32) -> Option<usize> {
    let mut offset = 0;
    for (i, text) in content.split_inclusive('\n').enumerate() {
        if i == line as usize {
            let width = text.trim_end_matches(['\n', '\r']).chars().count();
            return Some(offset + (column as usize).min(width));
        }
        offset += text.chars().count();
    }
    None
}

fn code_frame(path: &str, content: &str, offset: usize, message: &str) -> Option<String> {
    let end = offset + 1;
    let mut out = Vec::new();
    Report::build(ReportKind::Error, path.to_string(), offset)
        .with_config(Config::default().with_color(false))
        .with_message(message)
        .with_label(Label::new((path.to_string(), offset..end)).with_message("thrown here"))
        .finish()
        .write((path.to_string(), Source::from(content)), &mut out)
        .ok()?;
    String::from_utf8(out).ok()
}

/// Resolves sandbox stack traces through the bundle's source maps.
#[derive(Debug, Clone)]
pub struct ErrorLocator {
    sandbox_dir: PathBuf,
    out_dir: PathBuf,
    root: PathBuf,
    maps: HashMap<String, ChunkMap>,
}

impl ErrorLocator {
    pub fn new(sandbox_dir: &Path, root: &Path, out_dir: &Path, bundle: &Bundle) -> Self {
        let maps = bundle
            .chunks()
            .filter_map(|chunk| {
                let json = chunk.map.clone()?;
                let base = chunk
                    .map_file
                    .clone()
                    .unwrap_or_else(|| chunk.file_name.clone());
                Some((chunk.file_name.clone(), ChunkMap { json, base }))
            })
            .collect();
        Self {
            sandbox_dir: sandbox_dir.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            root: root.to_path_buf(),
            maps,
        }
    }

    /// Turn a sandbox failure into the error that aborts the build.
    ///
    /// Errors that are already [`PrerenderError`]s pass through unchanged.
    pub fn locate(&self, err: anyhow::Error) -> PrerenderError {
        let err = match err.downcast::<PrerenderError>() {
            Ok(prerender) => return prerender,
            Err(err) => err,
        };
        let failure = match err.downcast::<JsFailure>() {
            Ok(failure) => failure,
            Err(err) => match err.downcast_ref::<deno_core::error::JsError>() {
                Some(js) => JsFailure::from(js),
                // No stack to map, but still worth the guidance.
                None => JsFailure {
                    name: "Error".to_string(),
                    message: format!("{err:#}"),
                    stack: String::new(),
                },
            },
        };
        self.describe(&failure)
    }

    fn describe(&self, failure: &JsFailure) -> PrerenderError {
        let mut message = format!("{failure}\n\n{}", failure.guidance());
        let location = self.find_location(&failure.stack, &failure.to_string());
        let located = location.is_some();
        match location {
            Some(loc) => {
                message.push_str(&format!(
                    "\n\n  at {}:{}:{}",
                    loc.path.display(),
                    loc.line,
                    loc.column
                ));
                if let Some(frame) = loc.frame {
                    message.push_str("\n\n");
                    message.push_str(frame.trim_end());
                }
            }
            None => {
                message.push_str("\n\n");
                message.push_str(UNLOCATED);
            }
        }
        tracing::debug!(located, "resolved sandbox error");
        PrerenderError::SandboxLoad { message, located }
    }

    /// First stack frame whose file lies inside the sandbox.
    fn sandbox_frame(&self, stack: &str) -> Option<Frame> {
        STACK_FRAME.captures_iter(stack).find_map(|caps| {
            let raw = caps.get(1)?.as_str();
            let path = if raw.starts_with("file://") {
                Url::parse(raw).ok()?.to_file_path().ok()?
            } else {
                PathBuf::from(raw)
            };
            if !path.starts_with(&self.sandbox_dir) {
                return None;
            }
            Some(Frame {
                path,
                line: caps.get(2)?.as_str().parse().ok()?,
                column: caps.get(3)?.as_str().parse().ok()?,
            })
        })
    }

    /// Original location of the first sandbox frame in `stack`.
    pub fn find_location(&self, stack: &str, message: &str) -> Option<SourceLocation> {
        let frame = self.sandbox_frame(stack)?;
        let rel = frame.path.strip_prefix(&self.sandbox_dir).ok()?;
        let chunk_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let chunk_map = self.maps.get(&chunk_name)?;

        let map = SourceMap::from_json_string(&chunk_map.json).ok()?;
        let table = map.generate_lookup_table();
        let token = map.lookup_token(
            &table,
            frame.line.saturating_sub(1),
            frame.column.saturating_sub(1),
        )?;
        let source_id = token.get_source_id()?;
        let (src_line, src_col) = (token.get_src_line(), token.get_src_col());
        let source = map.get_source(source_id)?.to_string();
        let embedded = map.get_source_content(source_id).map(|s| s.to_string());

        let path = self.resolve_source(chunk_map, &source);
        let content = embedded.or_else(|| std::fs::read_to_string(&path).ok());
        let display = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone());
        let frame = content.as_deref().and_then(|content| {
            let offset = char_offset(content, src_line, src_col)?;
            code_frame(&display.to_string_lossy(), content, offset, message)
        });

        Some(SourceLocation {
            path: display,
            line: src_line + 1,
            column: src_col + 1,
            frame,
        })
    }

    fn resolve_source(&self, chunk_map: &ChunkMap, source: &str) -> PathBuf {
        let source_root = serde_json::from_str::<MapRoot>(&chunk_map.json)
            .ok()
            .and_then(|root| root.source_root)
            .unwrap_or_default();
        let joined = format!("{source_root}{source}");
        if let Some(path) = joined
            .strip_prefix("file://")
            .and_then(|_| Url::parse(&joined).ok())
            .and_then(|url| url.to_file_path().ok())
        {
            return path;
        }
        let candidate = Path::new(&joined);
        if candidate.is_absolute() {
            return normalize(candidate);
        }
        let mut base = self.out_dir.clone();
        let mut parts: Vec<&str> = chunk_map.base.split('/').collect();
        parts.pop();
        for part in parts {
            base.push(part);
        }
        normalize(&base.join(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::OutputChunk;
    use oxc_sourcemap::SourceMapBuilder;

    const FOO_TSX: &str = "import { h } from 'preact';\n\nexport function Foo() {\n  const a = 1;\n  const b = 2;\n  const c = 3;\n  const d = 4;\n  const e = 5;\n  const f = 6;\n  const width = document.body.clientWidth;\n  return h('div', null, width);\n}\n";

    fn foo_map() -> String {
        let mut builder = SourceMapBuilder::default();
        builder.set_file("index.js");
        let id = builder.set_source_and_content("../../src/Foo.tsx", FOO_TSX);
        // Generated line 3 col 14 comes from line 10 col 16 (`document`).
        builder.add_token(2, 14, 9, 16, Some(id), None);
        builder.into_sourcemap().to_json_string()
    }

    fn locator(sandbox: &Path, map: Option<String>) -> ErrorLocator {
        let mut bundle = Bundle::new();
        bundle.insert_chunk(OutputChunk {
            file_name: "assets/index.js".to_string(),
            code: String::new(),
            exports: vec!["prerender".to_string()],
            map,
            map_file: Some("assets/index.js.map".to_string()),
            facade_module_id: None,
        });
        ErrorLocator::new(sandbox, Path::new("/project"), Path::new("/project/dist"), &bundle)
    }

    fn reference_error(sandbox: &str) -> JsFailure {
        JsFailure {
            name: "ReferenceError".to_string(),
            message: "document is not defined".to_string(),
            stack: format!(
                "ReferenceError: document is not defined\n    at Foo (file://{sandbox}/assets/index.js:3:15)\n    at prerender (file://{sandbox}/assets/index.js:9:3)"
            ),
        }
    }

    #[test]
    fn test_resolves_reference_error_to_original_source() {
        let sandbox = Path::new("/tmp/headless-prerender-abc");
        let locator = locator(sandbox, Some(foo_map()));
        let err = locator.locate(anyhow::Error::new(reference_error("/tmp/headless-prerender-abc")));

        let PrerenderError::SandboxLoad { message, located } = err else {
            panic!("expected a sandbox load error");
        };
        assert!(located);
        assert!(message.starts_with("ReferenceError: document is not defined"));
        assert!(message.contains("typeof window !== \"undefined\""));
        assert!(message.contains("src/Foo.tsx:10:17"), "{message}");
        assert!(message.contains("document.body.clientWidth"), "{message}");
        assert!(!message.contains(UNLOCATED));
    }

    #[test]
    fn test_missing_map_is_reported() {
        let sandbox = Path::new("/tmp/headless-prerender-abc");
        let locator = locator(sandbox, None);
        let err = locator.locate(anyhow::Error::new(reference_error("/tmp/headless-prerender-abc")));

        let PrerenderError::SandboxLoad { message, located } = err else {
            panic!("expected a sandbox load error");
        };
        assert!(!located);
        assert!(message.ends_with(UNLOCATED));
    }

    #[test]
    fn test_frames_outside_sandbox_are_ignored() {
        let locator = locator(Path::new("/tmp/headless-prerender-abc"), Some(foo_map()));
        let stack = "TypeError: x is not a function\n    at ext:prerender_runtime/bootstrap.js:90:20\n    at file:///elsewhere/index.js:3:15";
        assert_eq!(locator.find_location(stack, "TypeError"), None);
    }

    #[test]
    fn test_generic_errors_get_generic_guidance() {
        let failure = JsFailure {
            name: "TypeError".to_string(),
            message: "x is not a function".to_string(),
            stack: String::new(),
        };
        assert!(!failure.is_reference_error());
        assert!(failure.guidance().starts_with("If this code relies on browser APIs"));
    }

    #[test]
    fn test_prerender_errors_pass_through() {
        let locator = locator(Path::new("/tmp/sandbox"), None);
        let err = locator.locate(PrerenderError::NotAFunction.into());
        assert!(matches!(err, PrerenderError::NotAFunction));

    }

    #[test]
    fn test_runtime_failures_without_stack_are_described() {
        let locator = locator(Path::new("/tmp/sandbox"), None);
        let err = locator.locate(anyhow::anyhow!("Promise resolution is still pending"));
        let PrerenderError::SandboxLoad { message, located } = err else {
            panic!("expected a sandbox load error");
        };
        assert!(!located);
        assert!(message.starts_with("Error: Promise resolution is still pending"));
        assert!(message.contains("typeof window !== \"undefined\""));
        assert!(message.ends_with(UNLOCATED));
    }

    #[test]
    fn test_char_offset() {
        assert_eq!(char_offset("ab\ncd\n", 1, 1), Some(4));
        assert_eq!(char_offset("ab\ncd", 1, 9), Some(5));
        assert_eq!(char_offset("ab", 3, 0), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/project/dist/assets/../../src/Foo.tsx")),
            PathBuf::from("/project/src/Foo.tsx")
        );
    }
}
