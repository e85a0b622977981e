use std::collections::BTreeSet;

use anyhow::{Context, Result};
use regex::Regex;

use crate::cluster::LangLinks;

/// Canonical interwiki block: one `[[language:Title]]` per line, ordered by language code.
pub fn render_block(links: &LangLinks) -> String {
    links
        .iter()
        .map(|(language, title)| format!("[[{language}:{}]]", normalize_title(title).replace(' ', "_")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip inline tags for `emitted` and append them as the canonical block.
pub fn rewrite(content: &str, emitted: &LangLinks) -> Result<String> {
    rewrite_with_stale(content, emitted, &LangLinks::new())
}

/// Like [`rewrite`], also stripping tags for `stale`, the links the page reported before.
pub fn rewrite_with_stale(content: &str, emitted: &LangLinks, stale: &LangLinks) -> Result<String> {
    let targets = emitted
        .iter()
        .chain(stale.iter())
        .map(|(language, title)| (language.as_str(), title.as_str()))
        .collect::<BTreeSet<_>>();
    let stripped = strip_tags(content, &targets)?;
    let body = stripped.trim();
    let block = render_block(emitted);

    Ok(match (body.is_empty(), block.is_empty()) {
        (_, true) => body.to_string(),
        (true, false) => block,
        (false, false) => format!("{body}\n\n{block}"),
    })
}

/// Remove every `[[language:title]]` tag matching one of `targets`.
///
/// Spaces and underscores in titles are interchangeable and whitespace is
/// tolerated inside the brackets.
pub fn strip_tags(content: &str, targets: &BTreeSet<(&str, &str)>) -> Result<String> {
    if targets.is_empty() {
        return Ok(content.to_string());
    }
    let pattern = targets
        .iter()
        .map(|(language, title)| tag_pattern(language, title))
        .collect::<Vec<_>>()
        .join("|");
    let regex = Regex::new(&format!(r"\[\[\s*(?:{pattern})\s*\]\]"))
        .context("failed to compile interwiki tag pattern")?;

    let mut current = content.to_string();
    // removal can splice a new tag together out of the surrounding text
    loop {
        let next = regex.replace_all(&current, "").into_owned();
        if next == current {
            return Ok(current);
        }
        current = next;
    }
}

/// Spaces and underscores are the same character in a title; neither survives at the ends.
fn normalize_title(title: &str) -> String {
    title.replace('_', " ").trim().to_string()
}

fn tag_pattern(language: &str, title: &str) -> String {
    let title = regex::escape(&normalize_title(title)).replace(' ', "[ _]");
    format!(r"{}\s*:\s*{title}", regex::escape(language))
}
