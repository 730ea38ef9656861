//! Static export analysis for ES modules.
//!
//! Parses with oxc and lists the names a module exports, without evaluating it.

use std::path::Path;

use oxc::allocator::Allocator;
use oxc::ast::ast::Statement;
use oxc_ecmascript::BoundNames;
use oxc::parser::Parser;
use oxc::span::SourceType;

/// Export name the prerender entry must provide.
pub const PRERENDER_EXPORT: &str = "prerender";

/// List the value exports of `code`.
///
/// `filename` only selects the dialect (`.ts`, `.tsx`, `.jsx`, ...); unknown
/// extensions parse as plain ES modules. A module that fails to parse is
/// treated as exporting nothing. `export * from` is not followed.
pub fn module_exports(code: &str, filename: &Path) -> Vec<String> {
    let source_type = SourceType::from_path(filename)
        .unwrap_or_else(|_| SourceType::mjs())
        .with_module(true);
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        tracing::debug!(
            file = %filename.display(),
            errors = ret.errors.len(),
            "module did not parse, assuming no exports"
        );
        return Vec::new();
    }

    let mut names = Vec::new();
    for stmt in &ret.program.body {
        match stmt {
            Statement::ExportNamedDeclaration(decl) => {
                if decl.export_kind.is_type() {
                    continue;
                }
                if let Some(declaration) = &decl.declaration {
                    if declaration.is_type() {
                        continue;
                    }
                    declaration.bound_names(&mut |ident| names.push(ident.name.to_string()));
                }
                for specifier in &decl.specifiers {
                    if specifier.export_kind.is_type() {
                        continue;
                    }
                    names.push(specifier.exported.name().to_string());
                }
            }
            Statement::ExportDefaultDeclaration(_) => names.push("default".to_string()),
            Statement::ExportAllDeclaration(decl) => {
                if let Some(exported) = &decl.exported {
                    names.push(exported.name().to_string());
                }
            }
            _ => {}
        }
    }
    names
}

/// Whether `code` exports a binding named `prerender`.
pub fn exports_prerender(code: &str, filename: &Path) -> bool {
    module_exports(code, filename)
        .iter()
        .any(|name| name == PRERENDER_EXPORT)
}
