//! Link Discoverer and auth-redirect adaptation (spec §4.6).
//!
//! Runs after a successful page fetch, off the scheduling thread. Extracts
//! page and media candidates from the raw HTML, resolves and classifies
//! them, and reports an auth redirect so the caller can skip discovery on a
//! login-page response.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::filter::UrlFilter;
use crate::types::TaskType;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "svg", "ico", "mp4", "mp3", "wav", "avi", "mov", "wmv",
    "mkv", "pdf", "zip", "tar", "gz", "rar", "7z", "dmg", "exe", "iso", "ppt", "pptx", "doc",
    "docx", "xls", "xlsx",
];

const TRACKING_PARAM_PREFIXES: &[&str] = &["utm_"];
const TRACKING_PARAM_NAMES: &[&str] = &["hsutk", "__hstc", "__hssc", "__hsfp", "mc_cid", "mc_eid"];

const AUTH_PATH_PREFIXES: &[&str] = &["/auth/", "/oauth/", "/login", "/signin"];

/// A link found by [`discover_links`], already classified and depth-budgeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub url: String,
    pub depth: i64,
    pub task_type: TaskType,
}

static SELECTORS: LazyLock<Vec<(Selector, &'static str)>> = LazyLock::new(|| {
    vec![
        (Selector::parse("a[href]").unwrap(), "href"),
        (Selector::parse("link[href]").unwrap(), "href"),
        (Selector::parse("img[src]").unwrap(), "src"),
        (Selector::parse("img[srcset]").unwrap(), "srcset"),
        (Selector::parse("video[src]").unwrap(), "src"),
        (Selector::parse("audio[src]").unwrap(), "src"),
        (Selector::parse("source[src]").unwrap(), "src"),
        (Selector::parse("video[poster]").unwrap(), "poster"),
        (
            Selector::parse(r#"meta[property="og:image"]"#).unwrap(),
            "content",
        ),
        (
            Selector::parse(r#"meta[property="twitter:image"]"#).unwrap(),
            "content",
        ),
        (
            Selector::parse(r#"meta[name="twitter:image"]"#).unwrap(),
            "content",
        ),
        (Selector::parse("object[data]").unwrap(), "data"),
        (Selector::parse("embed[src]").unwrap(), "src"),
    ]
});

/// Walks `html` (already read off the async executor via `spawn_blocking`
/// by the caller), resolving every candidate against `base_url`, and
/// returns the admissible, classified, deduplicated set (spec §4.6 steps 3-6).
///
/// `remaining_depth` is the depth value on the task that was just fetched;
/// page children get `remaining_depth - 1`.
pub fn discover_links(
    html: &str,
    base_url: &Url,
    remaining_depth: i64,
    filter: &UrlFilter,
) -> Vec<DiscoveredLink> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for (selector, attr) in SELECTORS.iter() {
        for element in document.select(selector) {
            let Some(raw) = element.value().attr(attr) else {
                continue;
            };
            for candidate in split_srcset(attr, raw) {
                if let Some(link) = classify_candidate(&candidate, base_url, remaining_depth, filter) {
                    if seen.insert(link.url.clone()) {
                        out.push(link);
                    }
                }
            }
        }
    }
    out
}

fn split_srcset<'a>(attr: &str, raw: &'a str) -> Vec<&'a str> {
    if attr != "srcset" {
        return vec![raw];
    }
    raw.split(',')
        .filter_map(|candidate| candidate.trim().split_whitespace().next())
        .collect()
}

fn classify_candidate(
    raw: &str,
    base_url: &Url,
    remaining_depth: i64,
    filter: &UrlFilter,
) -> Option<DiscoveredLink> {
    let mut resolved = base_url.join(raw).ok()?;
    resolved.set_fragment(None);

    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    let host = resolved.host_str()?.to_string();
    if !filter.is_admissible(&host, resolved.path()) {
        return None;
    }
    if urls_equal_ignoring_fragment(&resolved, base_url) {
        return None;
    }

    if is_binary_extension(resolved.path()) {
        strip_tracking_params(&mut resolved);
        return Some(DiscoveredLink {
            url: resolved.to_string(),
            depth: 0,
            task_type: TaskType::Media,
        });
    }

    if remaining_depth <= 1 {
        return None;
    }

    Some(DiscoveredLink {
        url: resolved.to_string(),
        depth: remaining_depth - 1,
        task_type: TaskType::Page,
    })
}

fn urls_equal_ignoring_fragment(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}

fn is_binary_extension(path: &str) -> bool {
    let Some(ext) = path.rsplit('.').next() else {
        return false;
    };
    if ext == path {
        return false;
    }
    BINARY_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
}

fn strip_tracking_params(url: &mut Url) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
    }
}

fn is_tracking_param(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    TRACKING_PARAM_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
        || TRACKING_PARAM_NAMES.iter().any(|name| lower == *name)
}

/// Result of inspecting a fetch's final URL for an authentication redirect
/// (spec §4.6). When `redirected` is true, the caller must skip link
/// discovery for this response.
#[derive(Debug, Clone, Default)]
pub struct AuthRedirectOutcome {
    pub redirected: bool,
}

/// Inspects `final_url` (the fetcher's `metadata.url`, or the task URL if
/// absent) and, on an auth redirect, adds runtime deny patterns to `filter`
/// for the matched host.
pub fn detect_auth_redirect(final_url: &str, filter: &UrlFilter) -> AuthRedirectOutcome {
    let Ok(parsed) = Url::parse(final_url) else {
        return AuthRedirectOutcome::default();
    };
    let path = parsed.path();
    let is_auth_path = AUTH_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix));
    if !is_auth_path {
        return AuthRedirectOutcome::default();
    }
    let Some(host) = parsed.host_str() else {
        return AuthRedirectOutcome::default();
    };

    filter.add_runtime_deny(host, "/auth/**");

    if path.starts_with("/auth/login") {
        if let Some(continue_path) = parsed
            .query_pairs()
            .find(|(key, _)| key == "continue")
            .map(|(_, value)| value.into_owned())
        {
            let continue_path = continue_path.trim_end_matches('/');
            if !continue_path.is_empty() {
                filter.add_runtime_deny(host, &format!("{continue_path}/**"));
            }
        }
    }

    AuthRedirectOutcome { redirected: true }
}
