//! In-memory view of the bundler's output.
//!
//! File names are relative to the output directory with `/` separators and
//! iterate in lexicographic order, so every pass over the bundle is
//! deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Deserialize;

use crate::error::{PrerenderError, Result};
use crate::exports::module_exports;

/// The primary HTML document, used as the prerender template.
pub const INDEX_HTML: &str = "index.html";

const SOURCE_MAPPING_URL: &str = "//# sourceMappingURL=";
const INLINE_MAP_PREFIX: &str = "data:application/json;base64,";

/// A compiled script.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub file_name: String,
    pub code: String,
    /// Names exported by the chunk.
    pub exports: Vec<String>,
    /// Source map JSON, if one was emitted.
    pub map: Option<String>,
    /// Output-relative name of the external `.map` file.
    pub map_file: Option<String>,
    /// Source module this chunk is the entry facade for, relative to the project root.
    pub facade_module_id: Option<String>,
}

/// Any non-script output file.
#[derive(Debug, Clone)]
pub struct OutputAsset {
    pub file_name: String,
    pub source: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum OutputItem {
    Chunk(OutputChunk),
    Asset(OutputAsset),
}

/// Mapping from output file name to chunk or asset.
#[derive(Debug, Default)]
pub struct Bundle {
    items: BTreeMap<String, OutputItem>,
    dirty: BTreeSet<String>,
    removed: BTreeSet<String>,
}

/// Entry of Vite's `.vite/manifest.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    file: String,
    src: Option<String>,
    #[serde(default)]
    is_entry: bool,
}

fn is_script(file_name: &str) -> bool {
    file_name.ends_with(".js") || file_name.ends_with(".mjs")
}

fn relative_name(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| PrerenderError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PrerenderError::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| PrerenderError::io(&path, e))?;
        if file_type.is_dir() {
            collect_files(&path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

/// Split a trailing `sourceMappingURL` comment off `code`.
fn source_mapping_url(code: &str) -> Option<(usize, &str)> {
    let start = code.rfind(SOURCE_MAPPING_URL)?;
    let line_start = code[..start].rfind('\n').map_or(0, |i| i + 1);
    if !code[line_start..start].trim().is_empty() {
        return None;
    }
    let url = code[start + SOURCE_MAPPING_URL.len()..].lines().next()?.trim();
    Some((line_start, url))
}

fn decode_inline_map(url: &str) -> Option<String> {
    let payload = url.strip_prefix(INLINE_MAP_PREFIX)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Resolve `target` relative to the directory of `file_name`, both output-relative.
fn join_output_path(file_name: &str, target: &str) -> String {
    let mut parts: Vec<&str> = file_name.split('/').collect();
    parts.pop();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every file under `out_dir`.
    ///
    /// Scripts become chunks with their exports analysed and their source map
    /// attached (external `.map` file or inline data URI). `.map` files that
    /// belong to a chunk are not listed as assets. If Vite's manifest is
    /// present, entry chunks learn their facade module.
    pub fn from_dir(out_dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        collect_files(out_dir, &mut files)?;
        files.sort();

        let mut raw: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for path in &files {
            let Some(name) = relative_name(out_dir, path) else {
                continue;
            };
            let bytes = std::fs::read(path).map_err(|e| PrerenderError::io(path, e))?;
            raw.insert(name, bytes);
        }

        let mut bundle = Self::new();
        let mut claimed_maps = BTreeSet::new();
        for (name, bytes) in &raw {
            if !is_script(name) {
                continue;
            }
            let code = String::from_utf8_lossy(bytes).into_owned();
            let mut map = None;
            let mut map_file = None;
            if let Some((_, url)) = source_mapping_url(&code) {
                if let Some(inline) = decode_inline_map(url) {
                    map = Some(inline);
                } else {
                    let target = join_output_path(name, url);
                    if let Some(content) = raw.get(&target) {
                        map = Some(String::from_utf8_lossy(content).into_owned());
                        claimed_maps.insert(target.clone());
                        map_file = Some(target);
                    }
                }
            }
            let exports = module_exports(&code, Path::new(name));
            bundle.items.insert(
                name.clone(),
                OutputItem::Chunk(OutputChunk {
                    file_name: name.clone(),
                    code,
                    exports,
                    map,
                    map_file,
                    facade_module_id: None,
                }),
            );
        }
        for (name, bytes) in raw {
            if is_script(&name) || claimed_maps.contains(&name) {
                continue;
            }
            bundle.items.insert(
                name.clone(),
                OutputItem::Asset(OutputAsset {
                    file_name: name,
                    source: bytes,
                }),
            );
        }

        bundle.apply_manifest(".vite/manifest.json");
        bundle.apply_manifest("manifest.json");
        tracing::debug!(
            out_dir = %out_dir.display(),
            chunks = bundle.chunks().count(),
            items = bundle.items.len(),
            "loaded bundle"
        );
        Ok(bundle)
    }

    fn apply_manifest(&mut self, name: &str) {
        let Some(OutputItem::Asset(asset)) = self.items.get(name) else {
            return;
        };
        let Ok(manifest) = serde_json::from_slice::<BTreeMap<String, ManifestEntry>>(&asset.source)
        else {
            return;
        };
        for (key, entry) in manifest {
            if !entry.is_entry {
                continue;
            }
            if let Some(OutputItem::Chunk(chunk)) = self.items.get_mut(&entry.file) {
                if chunk.facade_module_id.is_none() {
                    chunk.facade_module_id = Some(entry.src.unwrap_or(key));
                }
            }
        }
    }

    pub fn insert_chunk(&mut self, chunk: OutputChunk) {
        self.items
            .insert(chunk.file_name.clone(), OutputItem::Chunk(chunk));
    }

    pub fn insert_asset(&mut self, file_name: impl Into<String>, source: impl Into<Vec<u8>>) {
        let file_name = file_name.into();
        self.items.insert(
            file_name.clone(),
            OutputItem::Asset(OutputAsset {
                file_name,
                source: source.into(),
            }),
        );
    }

    pub fn get(&self, file_name: &str) -> Option<&OutputItem> {
        self.items.get(file_name)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Script chunks in file-name order.
    pub fn chunks(&self) -> impl Iterator<Item = &OutputChunk> {
        self.items.values().filter_map(|item| match item {
            OutputItem::Chunk(chunk) => Some(chunk),
            OutputItem::Asset(_) => None,
        })
    }

    pub fn chunk(&self, file_name: &str) -> Option<&OutputChunk> {
        match self.items.get(file_name) {
            Some(OutputItem::Chunk(chunk)) => Some(chunk),
            _ => None,
        }
    }

    /// Text of an asset, if present and valid UTF-8.
    pub fn asset_text(&self, file_name: &str) -> Option<&str> {
        match self.items.get(file_name) {
            Some(OutputItem::Asset(asset)) => std::str::from_utf8(&asset.source).ok(),
            _ => None,
        }
    }

    /// Replace the source of an existing asset.
    pub fn set_asset_source(&mut self, file_name: &str, source: String) -> Result<()> {
        match self.items.get_mut(file_name) {
            Some(OutputItem::Asset(asset)) => {
                asset.source = source.into_bytes();
                self.dirty.insert(file_name.to_string());
                Ok(())
            }
            _ => Err(PrerenderError::Template(format!(
                "no asset named `{file_name}` in the bundle"
            ))),
        }
    }

    /// Add a new asset to the output, replacing any asset of the same name.
    pub fn emit_asset(&mut self, file_name: impl Into<String>, source: String) {
        let file_name = file_name.into();
        self.insert_asset(file_name.clone(), source);
        self.removed.remove(&file_name);
        self.dirty.insert(file_name);
    }

    /// Files changed or added since the bundle was loaded.
    pub fn dirty_files(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Drop source maps: `.map` files are scheduled for removal and
    /// `sourceMappingURL` comments are cut from chunk code.
    pub fn strip_source_maps(&mut self) -> usize {
        let mut stripped = 0;
        for item in self.items.values_mut() {
            let OutputItem::Chunk(chunk) = item else {
                continue;
            };
            if chunk.map.is_none() {
                continue;
            }
            if let Some((line_start, _)) = source_mapping_url(&chunk.code) {
                chunk.code.truncate(line_start);
                self.dirty.insert(chunk.file_name.clone());
            }
            chunk.map = None;
            if let Some(map_file) = chunk.map_file.take() {
                self.removed.insert(map_file);
            }
            stripped += 1;
        }
        let stray_maps: Vec<String> = self
            .items
            .keys()
            .filter(|name| name.ends_with(".js.map") || name.ends_with(".mjs.map"))
            .cloned()
            .collect();
        for name in stray_maps {
            self.items.remove(&name);
            self.dirty.remove(&name);
            self.removed.insert(name);
        }
        stripped
    }

    /// Persist changed files to `out_dir` and delete removed ones.
    pub fn write_to(&self, out_dir: &Path) -> Result<usize> {
        let mut written = 0;
        for name in &self.dirty {
            let path = out_dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PrerenderError::io(parent, e))?;
            }
            let bytes = match self.items.get(name) {
                Some(OutputItem::Chunk(chunk)) => chunk.code.as_bytes(),
                Some(OutputItem::Asset(asset)) => asset.source.as_slice(),
                None => continue,
            };
            std::fs::write(&path, bytes).map_err(|e| PrerenderError::io(&path, e))?;
            written += 1;
        }
        for name in &self.removed {
            let path = out_dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PrerenderError::io(&path, e)),
            }
        }
        Ok(written)
    }
}
