//! The prerender build step.
//!
//! Runs after the bundler has produced its output: picks the chunk that
//! exports `prerender`, loads it in the sandbox, crawls routes from `/`,
//! composes each result into `index.html` and adds the pages to the bundle.

use std::path::Path;

use crate::bundle::{Bundle, OutputChunk, INDEX_HTML};
use crate::compose::Compositor;
use crate::config::{BuildOptions, PrerenderConfig};
use crate::crawl::{crawl, Crawler};
use crate::error::{PrerenderError, Result};
use crate::exports::PRERENDER_EXPORT;
use crate::locate::ErrorLocator;
use crate::runtime::{DenoLoader, SandboxConfig};
use crate::sandbox::{EntryLoader, SandboxEnvironment};

/// What a prerender run produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrerenderReport {
    /// Routes whose render returned a result, in visit order.
    pub rendered: Vec<String>,
    /// Routes whose render returned nothing.
    pub skipped: Vec<String>,
    /// Output files written or replaced.
    pub emitted: Vec<String>,
}

fn relative_to_root(build: &BuildOptions, script: &Path) -> String {
    let rel = script.strip_prefix(&build.root).unwrap_or(script);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Choose the chunk to load.
///
/// Prefers the chunk built from `prerender_script`; otherwise takes the first
/// chunk exporting `prerender` in file-name order.
pub fn select_prerender_chunk<'a>(
    bundle: &'a Bundle,
    build: &BuildOptions,
    prerender_script: Option<&Path>,
) -> Result<&'a OutputChunk> {
    let candidates: Vec<&OutputChunk> = bundle
        .chunks()
        .filter(|chunk| chunk.exports.iter().any(|e| e == PRERENDER_EXPORT))
        .collect();

    if let Some(script) = prerender_script {
        let wanted = relative_to_root(build, script);
        let wanted = wanted.trim_start_matches("./");
        if let Some(chunk) = candidates.iter().find(|chunk| {
            chunk
                .facade_module_id
                .as_deref()
                .is_some_and(|id| id.trim_start_matches('/') == wanted)
        }) {
            return Ok(chunk);
        }
    }

    let first = candidates
        .first()
        .copied()
        .ok_or_else(|| PrerenderError::Discovery("Cannot detect module with `prerender` export".to_string()))?;
    if candidates.len() > 1 {
        let names: Vec<&str> = candidates.iter().map(|c| c.file_name.as_str()).collect();
        tracing::warn!(
            chosen = %first.file_name,
            candidates = ?names,
            "several chunks export `prerender`; using the first"
        );
    }
    Ok(first)
}

/// Prerender every reachable route into `bundle`.
pub async fn prerender<L: EntryLoader>(
    config: &PrerenderConfig,
    build: &BuildOptions,
    bundle: &mut Bundle,
    loader: &mut L,
) -> Result<PrerenderReport> {
    config.validate()?;
    let template = bundle
        .asset_text(INDEX_HTML)
        .ok_or_else(|| PrerenderError::Template(format!("`{INDEX_HTML}` is missing from the build output")))?
        .to_string();
    let entry_name = select_prerender_chunk(bundle, build, config.prerender_script.as_deref())?
        .file_name
        .clone();

    let mut env = SandboxEnvironment::create(build, &config.origin)?;
    env.write_chunks(bundle)?;
    let locator = ErrorLocator::new(env.dir(), &build.root, &build.out_dir, bundle);

    let entry_path = env.chunk_path(&entry_name);
    let mut entry = loader
        .load_entry_point(&env, &entry_path)
        .await
        .map_err(|e| locator.locate(e))?;
    tracing::info!(entry = %entry_name, "loaded prerender entry");

    let compositor = Compositor::new(template, config.render_target.clone());
    let mut crawler = Crawler::new(
        env.origin().clone(),
        &config.additional_prerender_routes,
        config.max_routes,
    )?;
    let mut emitted = Vec::new();

    let summary = crawl(&mut entry, &mut env, &mut crawler, &locator, |route, result| {
        let html = compositor.compose(&route.url, result)?;
        if route.url == "/" {
            bundle.set_asset_source(INDEX_HTML, html)?;
            emitted.push(INDEX_HTML.to_string());
        } else {
            let name = route.asset_name();
            bundle.emit_asset(name.clone(), html);
            emitted.push(name);
        }
        tracing::info!(route = %route.url, "prerendered route");
        Ok(())
    })
    .await?;

    if !config.sourcemap {
        let stripped = bundle.strip_source_maps();
        tracing::debug!(stripped, "removed source maps from output");
    }
    if let Err(e) = env.close() {
        tracing::warn!(error = %e, "could not remove prerender sandbox");
    }

    let report = PrerenderReport {
        rendered: summary.rendered,
        skipped: summary.skipped,
        emitted,
    };
    tracing::info!(
        rendered = report.rendered.len(),
        skipped = report.skipped.len(),
        "prerender complete"
    );
    Ok(report)
}

/// Prerender a build already written to `build.out_dir`, in place.
pub async fn prerender_output_dir(
    config: &PrerenderConfig,
    build: &BuildOptions,
) -> Result<PrerenderReport> {
    let mut bundle = Bundle::from_dir(&build.out_dir)?;
    let mut loader = DenoLoader::new(SandboxConfig::from(config));
    let report = prerender(config, build, &mut bundle, &mut loader).await?;
    let written = bundle.write_to(&build.out_dir)?;
    tracing::debug!(written, out_dir = %build.out_dir.display(), "wrote prerendered output");
    Ok(report)
}
