//! Locate the script that exports `prerender`.
//!
//! Runs before the build: reads the entry HTML document, collects its local
//! `<script src>` tags and picks the first one whose source exports
//! `prerender`. The chosen script is then added to the bundler's inputs.

use std::path::{Path, PathBuf};

use crate::config::{BuildOptions, InputOption, PreserveEntrySignatures};
use crate::error::{PrerenderError, Result};
use crate::exports::exports_prerender;

/// Input name used when the bundler input is a named mapping.
pub const PRERENDER_ENTRY_NAME: &str = "prerenderEntry";

/// Pick the HTML document among the configured inputs.
pub fn find_entry_html(input: &InputOption) -> Option<&Path> {
    match input {
        InputOption::Single(path) => Some(path.as_path()),
        _ => input
            .paths()
            .into_iter()
            .find(|path| path.to_string_lossy().ends_with("html")),
    }
}

/// `src` of every `<script>` that is not loaded from an `https:` URL, in
/// document order.
pub fn local_scripts(html: &str) -> Result<Vec<String>> {
    let dom = tl::parse(html, tl::ParserOptions::default())
        .map_err(|e| PrerenderError::Discovery(format!("Unable to parse entry HTML: {e:?}")))?;
    let parser = dom.parser();
    let Some(scripts) = dom.query_selector("script") else {
        return Ok(Vec::new());
    };

    let mut sources = Vec::new();
    for handle in scripts {
        let Some(tag) = handle.get(parser).and_then(|node| node.as_tag()) else {
            continue;
        };
        let Some(src) = tag.attributes().get("src").flatten() else {
            continue;
        };
        let src = src.as_utf8_str().trim().to_string();
        if src.is_empty() || src.starts_with("https:") {
            continue;
        }
        sources.push(src);
    }
    Ok(sources)
}

fn resolve_script(root: &Path, src: &str) -> PathBuf {
    root.join(src.trim_start_matches('/'))
}

/// Find the local script in the entry HTML that exports `prerender`.
pub fn discover_prerender_script(build: &BuildOptions) -> Result<PathBuf> {
    let input = build
        .input
        .as_ref()
        .ok_or_else(|| PrerenderError::Discovery("Unable to detect entry HTML".to_string()))?;
    let entry_html = find_entry_html(input)
        .ok_or_else(|| PrerenderError::Discovery("Unable to detect entry HTML".to_string()))?;
    let entry_html = if entry_html.is_absolute() {
        entry_html.to_path_buf()
    } else {
        build.root.join(entry_html)
    };

    let html = std::fs::read_to_string(&entry_html)
        .map_err(|e| PrerenderError::io(&entry_html, e))?;
    let scripts = local_scripts(&html)?;
    if scripts.is_empty() {
        return Err(PrerenderError::Discovery(
            "No local scripts found in entry HTML".to_string(),
        ));
    }

    for src in &scripts {
        let path = resolve_script(&build.root, src);
        let code = std::fs::read_to_string(&path).map_err(|e| PrerenderError::io(&path, e))?;
        if exports_prerender(&code, &path) {
            tracing::debug!(script = %path.display(), "found prerender entry script");
            return Ok(path);
        }
    }

    Err(PrerenderError::Discovery(format!(
        "Unable to detect prerender entry script (checked: {})",
        scripts.join(", ")
    )))
}

/// Add `script` to the bundler's inputs so it is compiled next to the
/// primary entry, and allow the bundler to extend entry signatures.
pub fn augment_input(build: &mut BuildOptions, script: PathBuf) {
    build.input = Some(match build.input.take() {
        None => InputOption::Single(script),
        Some(InputOption::Single(path)) => InputOption::List(vec![path, script]),
        Some(InputOption::List(mut paths)) => {
            paths.push(script);
            InputOption::List(paths)
        }
        Some(InputOption::Named(mut map)) => {
            map.insert(PRERENDER_ENTRY_NAME.to_string(), script);
            InputOption::Named(map)
        }
    });
    build.preserve_entry_signatures = PreserveEntrySignatures::AllowExtension;
}

/// Resolve the prerender script (explicit path wins over discovery) and
/// register it as a build input. Returns the script path.
pub fn prepare_build_input(
    build: &mut BuildOptions,
    explicit: Option<&Path>,
) -> Result<PathBuf> {
    let script = match explicit {
        Some(path) => path.to_path_buf(),
        None => discover_prerender_script(build)?,
    };
    if build.input.is_some() {
        augment_input(build, script.clone());
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    const INDEX: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <script src="https://cdn.example.com/analytics.js"></script>
    <script type="module" src="/src/polyfills.ts"></script>
    <script type="module" src="/src/index.tsx"></script>
    <script>console.log("inline")</script>
  </head>
  <body></body>
</html>"#;

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("index.html"), INDEX).unwrap();
        fs::write(dir.path().join("src/polyfills.ts"), "export const ready: boolean = true;").unwrap();
        fs::write(
            dir.path().join("src/index.tsx"),
            "export function App() { return <div />; }\nexport async function prerender() { return { html: '' }; }",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_local_scripts_skip_remote_and_inline() {
        let scripts = local_scripts(INDEX).unwrap();
        assert_eq!(scripts, vec!["/src/polyfills.ts", "/src/index.tsx"]);
    }

    #[test]
    fn test_discovers_exporting_script() {
        let dir = project();
        let build = BuildOptions::new(dir.path(), "dist")
            .with_input(InputOption::Single(dir.path().join("index.html")));
        let script = discover_prerender_script(&build).unwrap();
        assert_eq!(script, dir.path().join("src/index.tsx"));
    }

    #[test]
    fn test_no_local_scripts_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("index.html"),
            r#"<html><head><script src="https://cdn.example.com/a.js"></script></head></html>"#,
        )
        .unwrap();
        let build = BuildOptions::new(dir.path(), "dist")
            .with_input(InputOption::Single(PathBuf::from("index.html")));
        let err = discover_prerender_script(&build).unwrap_err();
        assert!(err.to_string().contains("No local scripts"));
    }

    #[test]
    fn test_no_exporting_script_is_an_error() {
        let dir = project();
        fs::write(dir.path().join("src/index.tsx"), "export const App = 1;").unwrap();
        let build = BuildOptions::new(dir.path(), "dist")
            .with_input(InputOption::Single(PathBuf::from("index.html")));
        let err = discover_prerender_script(&build).unwrap_err();
        assert!(matches!(err, PrerenderError::Discovery(_)));
        assert!(err.to_string().contains("Unable to detect prerender entry script"));
    }

    #[test]
    fn test_no_html_input_is_an_error() {
        let build = BuildOptions::new("/project", "dist")
            .with_input(InputOption::List(vec![PathBuf::from("src/main.ts")]));
        let err = discover_prerender_script(&build).unwrap_err();
        assert!(err.to_string().contains("Unable to detect entry HTML"));
    }

    #[test]
    fn test_augment_input_shapes() {
        let script = PathBuf::from("/p/src/index.tsx");

        let mut build = BuildOptions::new("/p", "dist")
            .with_input(InputOption::Single(PathBuf::from("index.html")));
        augment_input(&mut build, script.clone());
        assert_eq!(
            build.input,
            Some(InputOption::List(vec![PathBuf::from("index.html"), script.clone()]))
        );
        assert_eq!(
            build.preserve_entry_signatures,
            PreserveEntrySignatures::AllowExtension
        );

        let mut named = BTreeMap::new();
        named.insert("main".to_string(), PathBuf::from("index.html"));
        let mut build = BuildOptions::new("/p", "dist").with_input(InputOption::Named(named));
        augment_input(&mut build, script.clone());
        let Some(InputOption::Named(map)) = &build.input else {
            panic!("expected named input");
        };
        assert_eq!(map.get(PRERENDER_ENTRY_NAME), Some(&script));
    }

    #[test]
    fn test_explicit_script_skips_discovery() {
        let mut build = BuildOptions::new("/missing", "dist")
            .with_input(InputOption::Single(PathBuf::from("index.html")));
        let script = prepare_build_input(&mut build, Some(Path::new("/missing/entry.tsx"))).unwrap();
        assert_eq!(script, PathBuf::from("/missing/entry.tsx"));
        assert!(matches!(build.input, Some(InputOption::List(ref paths)) if paths.len() == 2));
    }
}
