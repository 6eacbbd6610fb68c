use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::work_item::CommentLink;

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
            .unwrap_or_else(|e| panic!("anchor regex: {e}"))
    })
}

fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s<>"']+"#).unwrap_or_else(|e| panic!("url regex: {e}"))
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").unwrap_or_else(|e| panic!("tag regex: {e}")))
}

/// Extract hyperlinks from comment HTML, deduplicated by URL in first-seen order.
///
/// Anchors contribute their visible text as the title; bare URLs in the
/// remaining text use the URL itself.
pub fn extract_links(html: &str) -> Vec<CommentLink> {
    let mut links = Vec::new();
    let mut seen = HashSet::new();

    for cap in anchor_re().captures_iter(html) {
        let url = decode_entities(cap[1].trim());
        if !is_web_url(&url) || !seen.insert(url.clone()) {
            continue;
        }
        let text = decode_entities(tag_re().replace_all(&cap[2], "").trim());
        let title = if text.is_empty() { url.clone() } else { text };
        links.push(CommentLink { title, url });
    }

    let without_anchors = anchor_re().replace_all(html, " ");
    let without_tags = tag_re().replace_all(&without_anchors, " ");
    for m in bare_url_re().find_iter(&without_tags) {
        let url = decode_entities(m.as_str().trim_end_matches(['.', ',', ')', ';']));
        if seen.insert(url.clone()) {
            links.push(CommentLink {
                title: url.clone(),
                url,
            });
        }
    }

    links
}

/// Merge link lists from several comments, keeping the first title seen per URL.
pub fn dedupe_links(links: impl IntoIterator<Item = CommentLink>) -> Vec<CommentLink> {
    let mut seen = HashSet::new();
    links
        .into_iter()
        .filter(|link| seen.insert(link.url.clone()))
        .collect()
}

fn is_web_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}
