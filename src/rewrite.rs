//! HLS playlist rewriting
//!
//! Points every segment, key and sub-playlist reference in a playlist back
//! at the proxy endpoint. Only URI-bearing lines and `URI="..."` attributes
//! are touched; every other byte, line endings included, is preserved.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

/// Media type recorded for rewritten playlists.
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Path of the proxy endpoint on the relay's public origin.
pub const PROXY_PATH: &str = "/proxy";

/// Extensions of bare URI lines that are rewritten.
const REWRITTEN_EXTENSIONS: &[&str] = &[
    ".ts", ".m3u8", ".m3u", ".m4s", ".mp4", ".aac", ".key", ".vtt", ".webvtt",
];

static URI_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"URI="([^"]*)""#).expect("URI attribute pattern is valid"));

/// Build `<origin>/proxy?m3u8=<percent-encoded target>`.
#[must_use]
pub fn proxy_url(proxy_origin: &str, target: &str) -> String {
    format!(
        "{}{PROXY_PATH}?m3u8={}",
        proxy_origin.trim_end_matches('/'),
        urlencoding::encode(target)
    )
}

/// Rewrite `playlist` so its references route through `proxy_origin`.
///
/// Relative references resolve against the directory of `base_url`.
/// References already in proxy form are left alone.
#[must_use]
pub fn rewrite(playlist: &str, base_url: &str, proxy_origin: &str) -> String {
    let base = Url::parse(base_url).ok();
    let proxy_prefix = format!("{}{PROXY_PATH}?", proxy_origin.trim_end_matches('/'));

    let mut out = String::with_capacity(playlist.len() + playlist.len() / 2);
    for raw in playlist.split_inclusive('\n') {
        let (line, ending) = split_line_ending(raw);
        out.push_str(&rewrite_line(line, base.as_ref(), proxy_origin, &proxy_prefix));
        out.push_str(ending);
    }
    out
}

fn rewrite_line(line: &str, base: Option<&Url>, proxy_origin: &str, proxy_prefix: &str) -> String {
    if line.starts_with('#') {
        if !line.contains("URI=\"") {
            return line.to_string();
        }
        return URI_ATTRIBUTE
            .replace_all(line, |caps: &Captures<'_>| {
                let value = &caps[1];
                match proxied(value, base, proxy_origin, proxy_prefix) {
                    Some(rewritten) => format!("URI=\"{rewritten}\""),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
    }

    let trimmed = line.trim();
    if trimmed.is_empty() || !has_rewritten_extension(trimmed) {
        return line.to_string();
    }
    proxied(trimmed, base, proxy_origin, proxy_prefix).unwrap_or_else(|| line.to_string())
}

/// Proxy form of `reference`, or `None` when it must be left untouched.
fn proxied(reference: &str, base: Option<&Url>, proxy_origin: &str, proxy_prefix: &str) -> Option<String> {
    if reference.is_empty() || reference.starts_with(proxy_prefix) {
        return None;
    }
    let absolute = resolve(reference, base)?;
    Some(proxy_url(proxy_origin, &absolute))
}

/// Resolve `reference` to an absolute URL against `base`.
fn resolve(reference: &str, base: Option<&Url>) -> Option<String> {
    if let Ok(absolute) = Url::parse(reference) {
        // Keep the original spelling of references that are already absolute.
        return absolute.has_host().then(|| reference.to_string());
    }
    base?.join(reference).ok().map(String::from)
}

fn has_rewritten_extension(uri: &str) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or(uri).to_ascii_lowercase();
    REWRITTEN_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}

/// Returns `true` if a fetched resource is an HLS playlist.
///
/// Checks the URL path first, then the upstream content type, then the body.
#[must_use]
pub fn is_playlist(url: &str, content_type: Option<&str>, body: &[u8]) -> bool {
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        return true;
    }
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("mpegurl")) {
        return true;
    }
    let start = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    start.starts_with(b"#EXTM3U")
}
