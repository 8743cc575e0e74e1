//! Parse stage: raw bytes -> plain text, dispatched on MIME type.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde_json::Value;

use crate::error::ParseError;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static SCRIPT_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)>")
        .expect("script-block regex")
});
static XML_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("xml-tag regex"));

/// How deep into nested JSON structures text extraction descends.
const MAX_JSON_DEPTH: usize = 5;

/// Extract plain text from a fetched body based on its content type.
///
/// HTML drops script/style content and collapses whitespace; JSON flattens
/// text-valued leaves; XML strips element markup; everything else is
/// lossy-decoded and whitespace-collapsed.
pub fn parse(body: &[u8], content_type: &str) -> Result<String, ParseError> {
    let text = String::from_utf8_lossy(body);
    let lowered = content_type.to_ascii_lowercase();

    if lowered.contains("html") {
        Ok(parse_html(&text))
    } else if lowered.contains("json") {
        parse_json(&text)
    } else if lowered.contains("xml") {
        Ok(parse_xml(&text))
    } else {
        Ok(collapse_whitespace(&text))
    }
}

fn parse_html(html: &str) -> String {
    let stripped = SCRIPT_BLOCKS.replace_all(html, " ");
    let document = Html::parse_document(&stripped);
    let text: String = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    collapse_whitespace(&text)
}

fn parse_json(raw: &str) -> Result<String, ParseError> {
    let value: Value = serde_json::from_str(raw)?;
    let mut parts = Vec::new();
    collect_json_text(&value, MAX_JSON_DEPTH, &mut parts);
    Ok(parts.join(" "))
}

fn collect_json_text(value: &Value, depth: usize, out: &mut Vec<String>) {
    if depth == 0 {
        return;
    }
    match value {
        Value::String(s) => {
            if !s.is_empty() {
                out.push(s.clone());
            }
        }
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                collect_json_text(item, depth - 1, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_json_text(item, depth - 1, out);
            }
        }
        Value::Null => {}
    }
}

fn parse_xml(xml: &str) -> String {
    let stripped = XML_TAGS.replace_all(xml, " ");
    collapse_whitespace(&stripped)
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_string()
}
