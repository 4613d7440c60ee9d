//! HTML handling: markdown-ish text conversion for board API payloads and
//! JSON-LD extraction for crawled pages.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;

static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<h[1-6][^>]*>(.*?)</h[1-6]>").expect("valid regex")
});
static RE_STRONG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:strong|b)[^>]*>(.*?)</(?:strong|b)>").expect("valid regex")
});
static RE_EM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(?:em|i)[^>]*>(.*?)</(?:em|i)>").expect("valid regex"));
static RE_LI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").expect("valid regex"));
static RE_BR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static RE_P_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<p[^>]*>").expect("valid regex"));
static RE_P_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</p>").expect("valid regex"));
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static RE_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n").expect("valid regex"));
static RE_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static RE_NUM_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(\d+);").expect("valid regex"));

fn unescape_entities(text: &str) -> String {
    let replaced = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    RE_NUM_ENTITY
        .replace_all(&replaced, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Flatten HTML to plain text with collapsed whitespace.
pub fn clean_html(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let text = unescape_entities(html);
    let text = RE_TAG.replace_all(&text, " ");
    RE_WS.replace_all(&text, " ").trim().to_string()
}

/// Convert HTML to simple markdown, preserving headings, emphasis, and
/// list structure. Board APIs ship descriptions as HTML; stored records
/// keep them readable.
pub fn html_to_markdown(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let mut text = unescape_entities(html);
    text = RE_HEADING.replace_all(&text, "\n## $1\n").into_owned();
    text = RE_STRONG.replace_all(&text, "**$1**").into_owned();
    text = RE_EM.replace_all(&text, "*$1*").into_owned();
    text = RE_LI.replace_all(&text, "\n- $1").into_owned();
    text = RE_BR.replace_all(&text, "\n").into_owned();
    text = RE_P_OPEN.replace_all(&text, "\n").into_owned();
    text = RE_P_CLOSE.replace_all(&text, "\n").into_owned();
    text = RE_TAG.replace_all(&text, "").into_owned();
    text = RE_BLANK_LINES.replace_all(&text, "\n\n").into_owned();
    text.trim().to_string()
}

/// Pull the first JSON-LD `JobPosting` object out of a page, looking
/// inside `@graph` wrappers as well. Used as a crawl fallback when a
/// board URL does not match any API pattern.
pub fn job_posting_json_ld(html: &str) -> Option<JsonValue> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;

    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(&raw) else {
            continue;
        };
        if let Some(posting) = find_job_posting(&value) {
            return Some(posting.clone());
        }
    }
    None
}

fn find_job_posting(value: &JsonValue) -> Option<&JsonValue> {
    match value {
        JsonValue::Object(map) => {
            if map.get("@type").and_then(JsonValue::as_str) == Some("JobPosting") {
                return Some(value);
            }
            map.get("@graph").and_then(find_job_posting)
        }
        JsonValue::Array(items) => items.iter().find_map(find_job_posting),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_conversion_keeps_structure() {
        let html = "<h2>About</h2><p>We fight <strong>malaria</strong>.</p>\
                    <ul><li>Plan</li><li>Execute</li></ul><br>Done";
        let md = html_to_markdown(html);
        assert!(md.contains("## About"));
        assert!(md.contains("**malaria**"));
        assert!(md.contains("- Plan"));
        assert!(md.contains("- Execute"));
        assert!(!md.contains('<'));
    }

    #[test]
    fn entities_are_unescaped() {
        assert_eq!(clean_html("Research&nbsp;&amp;&nbsp;Policy"), "Research & Policy");
        assert_eq!(clean_html("<p>T&#233;l&#233;travail</p>"), "Télétravail");
    }

    #[test]
    fn clean_html_collapses_whitespace() {
        assert_eq!(clean_html("<div>  a\n\n  <span>b</span></div>"), "a b");
        assert_eq!(clean_html(""), "");
    }

    #[test]
    fn json_ld_job_posting_is_found_in_graph() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@context":"https://schema.org","@graph":[
              {"@type":"Organization","name":"Acme"},
              {"@type":"JobPosting","title":"Field Officer","datePosted":"2026-02-01"}
            ]}</script>
        </head><body></body></html>"#;
        let posting = job_posting_json_ld(html).expect("posting");
        assert_eq!(posting.get("title").and_then(|v| v.as_str()), Some("Field Officer"));
    }

    #[test]
    fn json_ld_absent_yields_none() {
        assert!(job_posting_json_ld("<html><body>no data</body></html>").is_none());
        let not_posting = r#"<script type="application/ld+json">{"@type":"Article"}</script>"#;
        assert!(job_posting_json_ld(not_posting).is_none());
    }
}
