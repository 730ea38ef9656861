//! Per-route document head data and its serialization.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Tags rendered without children or a closing tag.
const VOID_HEAD_TAGS: &[&str] = &["link", "meta", "base"];

/// Deserialize `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Head metadata returned by a route's render.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Head {
    #[serde(deserialize_with = "null_as_default")]
    pub lang: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub elements: Vec<HeadElement>,
}

/// A `<head>` child: opaque text, a list, or a structured node.
///
/// Objects without a string `type` (such as a component vnode whose
/// function type was lost in transfer) land in `Other` and render as nothing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HeadElement {
    Node {
        #[serde(rename = "type")]
        tag: String,
        #[serde(default, deserialize_with = "null_as_default")]
        props: BTreeMap<String, Value>,
        #[serde(default)]
        children: Option<Box<HeadElement>>,
    },
    List(Vec<HeadElement>),
    Text(String),
    Other(Value),
}

/// Escape text for use in HTML content or a double-quoted attribute.
pub fn enc(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn prop_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn serialize_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(serialize_value).collect(),
        Value::Object(_) => match serde_json::from_value::<HeadElement>(value.clone()) {
            Ok(HeadElement::Other(_)) | Err(_) => String::new(),
            Ok(el) => serialize_element(&el),
        },
        other => other.to_string(),
    }
}

/// Render a head element to HTML.
///
/// Props are emitted in sorted order so structurally equal elements always
/// serialize to the same string. `children`/`textContent` props become the
/// element's content.
pub fn serialize_element(element: &HeadElement) -> String {
    match element {
        HeadElement::Text(text) => text.clone(),
        HeadElement::List(items) => items.iter().map(serialize_element).collect(),
        HeadElement::Other(Value::Object(_)) => String::new(),
        HeadElement::Other(value) => serialize_value(value),
        HeadElement::Node {
            tag,
            props,
            children,
        } => {
            let mut s = format!("<{tag}");
            let mut content = children.as_deref().map(serialize_element);
            for (name, value) in props {
                if name == "children" || name == "textContent" {
                    if !value.is_null() {
                        content = Some(serialize_value(value));
                    }
                    continue;
                }
                let Some(text) = prop_text(value) else {
                    continue;
                };
                s.push_str(&format!(" {name}=\"{}\"", enc(&text)));
            }
            s.push('>');
            if !VOID_HEAD_TAGS.contains(&tag.as_str()) {
                if let Some(content) = content {
                    s.push_str(&content);
                }
                s.push_str(&format!("</{tag}>"));
            }
            s
        }
    }
}

impl Head {
    /// Serialized elements, deduplicated by their HTML, in first-seen order.
    pub fn serialized_elements(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.elements
            .iter()
            .map(serialize_element)
            .filter(|html| !html.is_empty() && seen.insert(html.clone()))
            .collect()
    }
}
