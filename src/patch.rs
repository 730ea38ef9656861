//! Guard clauses for the bundler's browser-only runtime helpers.
//!
//! The async-import preloader and the module-preload polyfill both touch
//! `document` unconditionally. When prerendering there is no `window`, so we
//! splice a guard into their source during the transform step. The helpers'
//! wording differs across bundler versions; every rule whose text matches is
//! applied, and a helper that matches none passes through untouched.

use oxc_sourcemap::{SourceMap, SourceMapBuilder};

/// A literal substitution in a helper's source.
#[derive(Debug, Clone, Copy)]
pub struct PatchRule {
    pub name: &'static str,
    pub find: &'static str,
    pub replace: &'static str,
}

/// A runtime helper identified by a stable substring of its module id.
#[derive(Debug, Clone, Copy)]
pub struct HelperPatch {
    pub id_marker: &'static str,
    pub rules: &'static [PatchRule],
}

pub const PRELOAD_HELPER: HelperPatch = HelperPatch {
    id_marker: "vite/preload-helper",
    rules: &[
        // through vite 5.0.4
        PatchRule {
            name: "preload-skip-condition",
            find: "if (!__VITE_IS_MODERN__ || !deps || deps.length === 0) {",
            replace: "if (!__VITE_IS_MODERN__ || !deps || deps.length === 0 || typeof window === 'undefined') {",
        },
        // vite 5.0.5+
        PatchRule {
            name: "preload-run-condition",
            find: "if (__VITE_IS_MODERN__ && deps && deps.length > 0) {",
            replace: "if (__VITE_IS_MODERN__ && deps && deps.length > 0 && typeof window !== 'undefined') {",
        },
        // vite 2.x
        PatchRule {
            name: "preload-links-lookup",
            find: "const links = document.getElementsByTagName('link');",
            replace: "if (typeof window === 'undefined') return Promise.resolve().then(() => baseModule());\nconst links = document.getElementsByTagName('link');",
        },
    ],
};

pub const MODULEPRELOAD_POLYFILL: HelperPatch = HelperPatch {
    id_marker: "vite/modulepreload-polyfill",
    rules: &[
        PatchRule {
            name: "polyfill-rel-list",
            find: "const relList = document.createElement('link').relList",
            replace: "if (typeof window === 'undefined') return;\nconst relList = document.createElement('link').relList",
        },
        PatchRule {
            name: "polyfill-rel-list-double-quoted",
            find: "const relList = document.createElement(\"link\").relList",
            replace: "if (typeof window === 'undefined') return;\nconst relList = document.createElement(\"link\").relList",
        },
    ],
};

/// Helpers patched during the transform step, in lookup order.
pub const HELPER_PATCHES: &[HelperPatch] = &[PRELOAD_HELPER, MODULEPRELOAD_POLYFILL];

/// Transformed helper source with a map back to the original.
#[derive(Debug)]
pub struct PatchedModule {
    pub code: String,
    pub map: SourceMap,
    /// Names of the rules that matched.
    pub applied: Vec<&'static str>,
}

enum Segment<'a> {
    Original(usize, usize),
    Inserted(&'a str, usize),
}

/// Transform hook: patch `code` if `id` names a known helper.
///
/// Returns `None` when the module is not a helper or no rule matched.
pub fn transform(code: &str, id: &str) -> Option<PatchedModule> {
    let helper = HELPER_PATCHES
        .iter()
        .find(|helper| id.contains(helper.id_marker))?;
    let patched = apply_rules(code, id, helper.rules);
    if patched.is_none() {
        tracing::warn!(
            module = id,
            "runtime helper did not match any known variant, leaving it unpatched"
        );
    }
    patched
}

/// Apply every matching rule (first occurrence each) to `code`.
pub fn apply_rules(code: &str, source_name: &str, rules: &[PatchRule]) -> Option<PatchedModule> {
    let mut matches: Vec<(usize, &PatchRule)> = rules
        .iter()
        .filter_map(|rule| code.find(rule.find).map(|pos| (pos, rule)))
        .collect();
    if matches.is_empty() {
        return None;
    }
    matches.sort_by_key(|(pos, _)| *pos);

    let mut segments = Vec::new();
    let mut applied = Vec::new();
    let mut cursor = 0;
    for (pos, rule) in matches {
        if pos < cursor {
            continue;
        }
        segments.push(Segment::Original(cursor, pos));
        segments.push(Segment::Inserted(rule.replace, pos));
        cursor = pos + rule.find.len();
        applied.push(rule.name);
    }
    segments.push(Segment::Original(cursor, code.len()));

    let (out, map) = render_segments(code, source_name, &segments);
    Some(PatchedModule {
        code: out,
        map,
        applied,
    })
}

/// Line and UTF-16 column of a byte offset.
fn position_at(code: &str, offset: usize) -> (u32, u32) {
    let before = &code[..offset];
    let line = before.matches('\n').count() as u32;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let col = before[line_start..].encode_utf16().count() as u32;
    (line, col)
}

fn is_boundary(ch: char) -> bool {
    ch.is_whitespace() || "(){}[];,.=!&|<>?:+-*/".contains(ch)
}

fn render_segments(code: &str, source_name: &str, segments: &[Segment<'_>]) -> (String, SourceMap) {
    let mut builder = SourceMapBuilder::default();
    builder.set_file(source_name);
    let src_id = builder.set_source_and_content(source_name, code);

    let mut out = String::with_capacity(code.len() + 128);
    let (mut dst_line, mut dst_col) = (0u32, 0u32);

    for segment in segments {
        match *segment {
            Segment::Original(start, end) => {
                if start == end {
                    continue;
                }
                let (mut src_line, mut src_col) = position_at(code, start);
                builder.add_token(dst_line, dst_col, src_line, src_col, Some(src_id), None);
                let mut prev_boundary = false;
                for ch in code[start..end].chars() {
                    if prev_boundary && !is_boundary(ch) {
                        builder.add_token(dst_line, dst_col, src_line, src_col, Some(src_id), None);
                    }
                    out.push(ch);
                    if ch == '\n' {
                        dst_line += 1;
                        src_line += 1;
                        dst_col = 0;
                        src_col = 0;
                        prev_boundary = true;
                    } else {
                        let width = ch.len_utf16() as u32;
                        dst_col += width;
                        src_col += width;
                        prev_boundary = is_boundary(ch);
                    }
                }
            }
            Segment::Inserted(text, original_pos) => {
                // The replacement maps to where the matched text started; lines
                // it adds carry no mapping of their own.
                let (src_line, src_col) = position_at(code, original_pos);
                builder.add_token(dst_line, dst_col, src_line, src_col, Some(src_id), None);
                for ch in text.chars() {
                    out.push(ch);
                    if ch == '\n' {
                        dst_line += 1;
                        dst_col = 0;
                    } else {
                        dst_col += ch.len_utf16() as u32;
                    }
                }
            }
        }
    }

    (out, builder.into_sourcemap())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRELOAD_V5: &str = "export const __vitePreload = function preload(baseModule, deps, importerUrl) {\n  let promise = Promise.resolve();\n  if (__VITE_IS_MODERN__ && deps && deps.length > 0) {\n    const links = document.getElementsByTagName(\"link\");\n  }\n  return promise.then(() => baseModule());\n};\n";

    const PRELOAD_V4: &str = "export const __vitePreload = function preload(baseModule, deps) {\n  if (!__VITE_IS_MODERN__ || !deps || deps.length === 0) {\n    return baseModule();\n  }\n};\n";

    const POLYFILL: &str = "export function polyfill() {\n  const relList = document.createElement('link').relList;\n  if (relList && relList.supports && relList.supports('modulepreload')) {\n    return;\n  }\n}\n";

    fn original_line(map: &SourceMap, line: u32, col: u32) -> Option<u32> {
        let table = map.generate_lookup_table();
        map.lookup_token(&table, line, col).map(|t| t.get_src_line())
    }

    #[test]
    fn test_patches_current_preload_helper() {
        let patched = transform(PRELOAD_V5, "\0vite/preload-helper.js").unwrap();
        assert_eq!(patched.applied, vec!["preload-run-condition"]);
        assert!(patched
            .code
            .contains("deps.length > 0 && typeof window !== 'undefined') {"));
        assert_eq!(patched.code.lines().count(), PRELOAD_V5.lines().count());
    }

    #[test]
    fn test_patches_older_preload_helper() {
        let patched = transform(PRELOAD_V4, "/node_modules/vite/preload-helper").unwrap();
        assert_eq!(patched.applied, vec!["preload-skip-condition"]);
        assert!(patched
            .code
            .contains("deps.length === 0 || typeof window === 'undefined') {"));
    }

    #[test]
    fn test_patches_modulepreload_polyfill() {
        let patched = transform(POLYFILL, "\0vite/modulepreload-polyfill.js").unwrap();
        assert_eq!(patched.applied, vec!["polyfill-rel-list"]);
        let guard = patched.code.find("if (typeof window === 'undefined') return;").unwrap();
        let touch = patched.code.find("document.createElement").unwrap();
        assert!(guard < touch);
    }

    #[test]
    fn test_unknown_variant_passes_through() {
        assert!(transform("export const __vitePreload = () => {};", "vite/preload-helper").is_none());
    }

    #[test]
    fn test_other_modules_are_ignored() {
        assert!(transform(PRELOAD_V5, "/src/main.tsx").is_none());
    }

    #[test]
    fn test_map_survives_inserted_lines() {
        let patched = transform(POLYFILL, "vite/modulepreload-polyfill").unwrap();
        // Output gains one line; the `if (relList ...` line moves from 2 to 3.
        let out_line = patched
            .code
            .lines()
            .position(|l| l.contains("if (relList"))
            .unwrap() as u32;
        assert_eq!(out_line, 3);
        assert_eq!(original_line(&patched.map, out_line, 2), Some(2));
        assert_eq!(original_line(&patched.map, 0, 0), Some(0));
    }

    #[test]
    fn test_position_at_counts_utf16() {
        let code = "a\né😀x";
        assert_eq!(position_at(code, 0), (0, 0));
        assert_eq!(position_at(code, 2), (1, 0));
        assert_eq!(position_at(code, code.len() - 1), (1, 3));
    }
}
