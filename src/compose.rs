//! Merge a route's render result into the HTML template.
//!
//! Every call re-parses the pristine template, so nothing written for one
//! route can leak into another. The template is located with `tl` and edited
//! by splicing at the byte offsets of the tags it finds; markup outside the
//! edited spots is preserved exactly.

use std::ops::Range;

use crate::error::{PrerenderError, Result};
use crate::head::enc;
use crate::sandbox::PrerenderResult;
use crate::sanitize::data_script;

/// Byte offsets of an element inside the template.
#[derive(Debug, Clone, Copy)]
struct TagSpan {
    start: usize,
    inner_start: usize,
    inner_end: usize,
}

/// Length of the opening tag at the start of `text`, quotes respected.
fn open_tag_len(text: &str) -> Option<usize> {
    let mut quote = None;
    for (i, b) in text.bytes().enumerate().skip(1) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'>') => return Some(i + 1),
            _ => {}
        }
    }
    None
}

impl TagSpan {
    fn of(source: &str, tag: &tl::HTMLTag<'_>) -> Result<Self> {
        let raw = tag.raw().as_bytes();
        let base = source.as_ptr() as usize;
        let ptr = raw.as_ptr() as usize;
        if ptr < base || ptr + raw.len() > base + source.len() {
            return Err(PrerenderError::Template(
                "parsed element does not point into the template".to_string(),
            ));
        }
        let start = ptr - base;
        let end = start + raw.len();
        let text = &source[start..end];
        let open_len = open_tag_len(text).ok_or_else(|| {
            PrerenderError::Template(format!("unterminated tag at byte {start}"))
        })?;

        let closing = format!("</{}", tag.name().as_utf8_str().to_ascii_lowercase());
        let inner_end = match text.to_ascii_lowercase().rfind(&closing) {
            Some(i) if i >= open_len => start + i,
            _ => end,
        };
        Ok(Self {
            start,
            inner_start: start + open_len,
            inner_end,
        })
    }
}

fn first_tag<'b, 'a>(dom: &'b tl::VDom<'a>, selector: &'b str) -> Option<&'b tl::HTMLTag<'a>> {
    let handle = dom.query_selector(selector)?.next()?;
    handle.get(dom.parser())?.as_tag()
}

/// Byte range of attribute `name` in an opening tag, from the whitespace
/// before it to the end of its value. Quoted values are skipped whole.
fn find_attr(open_tag: &str, tag_name_len: usize, name: &str) -> Option<Range<usize>> {
    let bytes = open_tag.as_bytes();
    let mut i = (1 + tag_name_len).min(bytes.len());
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len()
            && !matches!(bytes[i], b'=' | b'>' | b'/')
            && !bytes[i].is_ascii_whitespace()
        {
            i += 1;
        }
        let name_end = i;
        if name_start == name_end {
            // Stray `/` or the closing `>`.
            if i < bytes.len() && bytes[i] == b'>' {
                return None;
            }
            i += 1;
            continue;
        }

        let mut j = i;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j < bytes.len() && bytes[j] == b'=' {
            j += 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            match bytes.get(j) {
                Some(&q @ (b'"' | b'\'')) => {
                    j += 1;
                    while j < bytes.len() && bytes[j] != q {
                        j += 1;
                    }
                    j = (j + 1).min(bytes.len());
                }
                _ => {
                    while j < bytes.len() && bytes[j] != b'>' && !bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                }
            }
            i = j;
        }

        if open_tag[name_start..name_end].eq_ignore_ascii_case(name) {
            return Some(start..i);
        }
    }
    None
}

/// Set `lang` on an opening tag, replacing any existing value.
fn set_lang(open_tag: &str, tag_name_len: usize, value: &str) -> String {
    let attr = format!(" lang=\"{value}\"");
    if let Some(range) = find_attr(open_tag, tag_name_len, "lang") {
        let mut out = open_tag.to_string();
        out.replace_range(range, &attr);
        return out;
    }
    let insert_at = (1 + tag_name_len).min(open_tag.len());
    let mut out = open_tag.to_string();
    out.insert_str(insert_at, &attr);
    out
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

fn apply_edits(source: &str, edits: Vec<Edit>) -> String {
    let mut ordered: Vec<(usize, Edit)> = edits.into_iter().enumerate().collect();
    // Back to front; at equal offsets the later edit goes in first so the
    // earlier one ends up in front of it.
    ordered.sort_by(|(ia, a), (ib, b)| b.start.cmp(&a.start).then(ib.cmp(ia)));
    let mut out = source.to_string();
    for (_, edit) in ordered {
        out.replace_range(edit.start..edit.end, &edit.text);
    }
    out
}

/// Builds the final HTML for each rendered route.
#[derive(Debug, Clone)]
pub struct Compositor {
    template: String,
    render_target: String,
}

impl Compositor {
    pub fn new(template: impl Into<String>, render_target: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            render_target: render_target.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render_target(&self) -> &str {
        &self.render_target
    }

    /// Compose the document for `route` from a fresh copy of the template.
    pub fn compose(&self, route: &str, result: &PrerenderResult) -> Result<String> {
        let source = self.template.as_str();
        let dom = tl::parse(source, tl::ParserOptions::default())
            .map_err(|e| PrerenderError::Template(format!("{e:?}")))?;
        let parser = dom.parser();
        let head = result.head.clone().unwrap_or_default();
        let mut edits = Vec::new();

        if let Some(head_tag) = first_tag(&dom, "head") {
            let span = TagSpan::of(source, head_tag)?;

            if !head.title.is_empty() {
                let title = enc(&head.title);
                let existing = head_tag
                    .query_selector(parser, "title")
                    .and_then(|mut it| it.next())
                    .and_then(|handle| handle.get(parser))
                    .and_then(|node| node.as_tag());
                match existing {
                    Some(title_tag) => {
                        let title_span = TagSpan::of(source, title_tag)?;
                        edits.push(Edit {
                            start: title_span.inner_start,
                            end: title_span.inner_end,
                            text: title,
                        });
                    }
                    None => edits.push(Edit {
                        start: span.inner_start,
                        end: span.inner_start,
                        text: format!("<title>{title}</title>"),
                    }),
                }
            }

            let elements = head.serialized_elements();
            if !elements.is_empty() {
                edits.push(Edit {
                    start: span.inner_end,
                    end: span.inner_end,
                    text: elements.concat(),
                });
            }
        }

        if !head.lang.is_empty() {
            if let Some(html_tag) = first_tag(&dom, "html") {
                let span = TagSpan::of(source, html_tag)?;
                let open_tag = &source[span.start..span.inner_start];
                let name_len = html_tag.name().as_bytes().len();
                edits.push(Edit {
                    start: span.start,
                    end: span.inner_start,
                    text: set_lang(open_tag, name_len, &enc(&head.lang)),
                });
            }
        }

        let target = first_tag(&dom, &self.render_target).ok_or_else(|| {
            PrerenderError::RenderTargetMissing {
                selector: self.render_target.clone(),
                route: route.to_string(),
            }
        })?;
        let span = TagSpan::of(source, target)?;
        let mut body = result.html.clone().unwrap_or_default();
        if let Some(data) = &result.data {
            let script = data_script(data).map_err(|e| {
                PrerenderError::Template(format!("cannot embed `data` for route {route}: {e}"))
            })?;
            body.push_str(&script);
        }
        if !body.is_empty() {
            edits.push(Edit {
                start: span.inner_start,
                end: span.inner_start,
                text: body,
            });
        }

        Ok(apply_edits(source, edits))
    }
}
