//! Upstream identity headers
//!
//! The origin only serves playlists and segments to requests that look like
//! they come from its own embedded player. The same identity is used by the
//! proxy's HTTP client and by browser pages.

use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT,
};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Desktop Chrome on Windows, the most common player host.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Spoofed request identity presented to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamIdentity {
    pub user_agent: String,
    /// `Referer` header. When unset the origin of the resolver page is used.
    pub referer: Option<String>,
    /// `Origin` header. When unset it is derived from the referer.
    pub origin: Option<String>,
    pub accept_language: String,
}

impl Default for UpstreamIdentity {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: None,
            origin: None,
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }
}

impl UpstreamIdentity {
    /// Fill in `referer` and `origin` from the page the player lives on.
    #[must_use]
    pub fn with_page_defaults(mut self, page_url: &str) -> Self {
        if self.referer.is_none() {
            self.referer = site_root(page_url);
        }
        if self.origin.is_none() {
            self.origin = self.referer.as_deref().and_then(origin_of);
        }
        self
    }

    /// Convert to a reqwest `HeaderMap`.
    pub fn to_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value("User-Agent", &self.user_agent)?);
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            header_value("Accept-Language", &self.accept_language)?,
        );
        if let Some(referer) = &self.referer {
            headers.insert(REFERER, header_value("Referer", referer)?);
        }
        if let Some(origin) = &self.origin {
            headers.insert(ORIGIN, header_value("Origin", origin)?);
        }
        // Media requests from a player are cross-site fetches, not navigations.
        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("cross-site"));
        Ok(headers)
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| RelayError::BadRequest(format!("invalid {name} header value: {value:?}")))
}

/// `https://host/` for any URL on that host.
fn site_root(page_url: &str) -> Option<String> {
    let parsed = url::Url::parse(page_url).ok()?;
    parsed.host_str()?;
    Some(format!("{}/", parsed.origin().ascii_serialization()))
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str()?;
    Some(parsed.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_fill_referer_and_origin() {
        let identity =
            UpstreamIdentity::default().with_page_defaults("https://player.example.com/e/XYZ");
        assert_eq!(
            identity.referer.as_deref(),
            Some("https://player.example.com/")
        );
        assert_eq!(identity.origin.as_deref(), Some("https://player.example.com"));
    }

    #[test]
    fn explicit_referer_wins() {
        let identity = UpstreamIdentity {
            referer: Some("https://other.example.net/watch".into()),
            ..UpstreamIdentity::default()
        }
        .with_page_defaults("https://player.example.com/e/XYZ");
        assert_eq!(
            identity.referer.as_deref(),
            Some("https://other.example.net/watch")
        );
        assert_eq!(identity.origin.as_deref(), Some("https://other.example.net"));
    }

    #[test]
    fn headers_include_identity() {
        let headers = UpstreamIdentity::default()
            .with_page_defaults("https://player.example.com/e/XYZ")
            .to_headers()
            .unwrap();
        assert_eq!(headers.get(USER_AGENT).unwrap(), DEFAULT_USER_AGENT);
        assert_eq!(headers.get(REFERER).unwrap(), "https://player.example.com/");
        assert_eq!(headers.get(ORIGIN).unwrap(), "https://player.example.com");
        assert!(headers.contains_key("sec-fetch-mode"));
    }

    #[test]
    fn invalid_header_value_is_rejected() {
        let identity = UpstreamIdentity {
            user_agent: "bad\nagent".into(),
            ..UpstreamIdentity::default()
        };
        assert!(matches!(
            identity.to_headers(),
            Err(RelayError::BadRequest(_))
        ));
    }
}
