//! Module loader confined to the prerender sandbox directory.
//!
//! Compiled chunks import each other with relative specifiers, so everything
//! the entry needs is already inside the sandbox. Remote URLs, paths that
//! escape the directory and non-script files are refused.

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::path::{Path, PathBuf};

const REMOTE_SCHEMES: &[&str] = &["http://", "https://", "data:", "blob:"];

/// Resolves and loads ES modules from the sandbox directory only.
pub struct SandboxedLoader {
    sandbox_dir: PathBuf,
}

impl SandboxedLoader {
    pub fn new(sandbox_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let canonical = sandbox_dir.as_ref().canonicalize().map_err(|e| {
            anyhow!(
                "Failed to open sandbox directory '{}': {}",
                sandbox_dir.as_ref().display(),
                e
            )
        })?;

        if !canonical.is_dir() {
            return Err(anyhow!(
                "Sandbox path '{}' is not a directory",
                canonical.display()
            ));
        }

        Ok(Self {
            sandbox_dir: canonical,
        })
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    /// Symlinks and `..` are resolved before the containment check.
    fn is_inside_sandbox(&self, path: &Path) -> bool {
        path.canonicalize()
            .map(|canonical| canonical.starts_with(&self.sandbox_dir))
            .unwrap_or(false)
    }

    fn is_script(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("js") | Some("mjs")
        )
    }

    fn check(&self, path: &Path) -> Result<(), Error> {
        if !self.is_inside_sandbox(path) {
            return Err(anyhow!(
                "Cannot import '{}': it is outside the prerender sandbox",
                path.display()
            ));
        }
        if !Self::is_script(path) {
            return Err(anyhow!(
                "Cannot import '{}': only .js and .mjs chunks can be loaded",
                path.display()
            ));
        }
        Ok(())
    }
}

impl ModuleLoader for SandboxedLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if REMOTE_SCHEMES.iter().any(|s| specifier.starts_with(s)) {
            return Err(anyhow!(
                "Remote import '{}' is not available during prerender",
                specifier
            ));
        }

        let resolved = if specifier.starts_with("./") || specifier.starts_with("../") {
            let referrer_url = ModuleSpecifier::parse(referrer)
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            referrer_url
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))?
        } else if specifier.starts_with("file://") {
            ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid file URL '{}': {}", specifier, e))?
        } else if specifier.starts_with('/') {
            ModuleSpecifier::from_file_path(specifier)
                .map_err(|_| anyhow!("Invalid absolute path: {}", specifier))?
        } else {
            // Chunk names emitted without a leading "./"
            ModuleSpecifier::from_file_path(self.sandbox_dir.join(specifier))
                .map_err(|_| anyhow!("Invalid module specifier: {}", specifier))?
        };

        if resolved.scheme() != "file" {
            return Err(anyhow!(
                "Only file:// modules can be imported, got: {}",
                resolved.scheme()
            ));
        }

        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;
        self.check(&path)?;

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let load = || -> Result<ModuleSource, Error> {
            let path = module_specifier
                .to_file_path()
                .map_err(|_| anyhow!("Invalid file path: {}", module_specifier))?;
            self.check(&path)?;
            let code = std::fs::read_to_string(&path)
                .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
            Ok(ModuleSource::new(
                ModuleType::JavaScript,
                ModuleSourceCode::String(code.into()),
                module_specifier,
                None,
            ))
        };
        ModuleLoadResponse::Sync(load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn referrer(dir: &Path, name: &str) -> String {
        ModuleSpecifier::from_file_path(dir.canonicalize().unwrap().join(name))
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_blocks_remote_urls() {
        let dir = tempdir().unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();

        let result = loader.resolve(
            "https://cdn.example.com/react.js",
            &referrer(dir.path(), "entry.js"),
            ResolutionKind::Import,
        );
        assert!(result.unwrap_err().to_string().contains("Remote import"));
    }

    #[test]
    fn test_blocks_escape_from_sandbox() {
        let root = tempdir().unwrap();
        let sandbox = root.path().join("sandbox");
        fs::create_dir(&sandbox).unwrap();
        fs::write(root.path().join("secret.js"), "export default 1;").unwrap();
        let loader = SandboxedLoader::new(&sandbox).unwrap();

        let result = loader.resolve(
            "../secret.js",
            &referrer(&sandbox, "entry.js"),
            ResolutionKind::Import,
        );
        assert!(result.unwrap_err().to_string().contains("outside the prerender sandbox"));
    }

    #[test]
    fn test_resolves_nested_chunks() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("assets")).unwrap();
        fs::write(dir.path().join("assets/dep.js"), "export default 1;").unwrap();
        fs::write(dir.path().join("shared.mjs"), "export default 2;").unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();
        let entry = referrer(dir.path(), "assets/entry.js");

        assert!(loader.resolve("./dep.js", &entry, ResolutionKind::Import).is_ok());
        assert!(loader.resolve("../shared.mjs", &entry, ResolutionKind::Import).is_ok());
        assert!(loader.resolve("shared.mjs", &entry, ResolutionKind::Import).is_ok());
    }

    #[test]
    fn test_blocks_non_script_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        let loader = SandboxedLoader::new(dir.path()).unwrap();

        let result = loader.resolve(
            "./package.json",
            &referrer(dir.path(), "entry.js"),
            ResolutionKind::Import,
        );
        assert!(result.unwrap_err().to_string().contains("only .js and .mjs"));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempdir().unwrap();
        assert!(SandboxedLoader::new(dir.path().join("missing")).is_err());
    }
}
