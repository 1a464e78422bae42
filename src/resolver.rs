//! Stream resolver
//!
//! Turns an opaque content code into the address of its HLS manifest. The
//! player page only requests media once its JavaScript runs, so the page is
//! loaded in the shared browser and the first outgoing segment request is
//! captured. The manifest lives next to that segment.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::activity::RecentCodes;
use crate::browser::{NetworkEvent, Page, SessionManager};
use crate::cache::TtlCache;
use crate::config::ResolverConfig;
use crate::error::{RelayError, Result};
use crate::flight::SingleFlight;

/// Longest accepted content code.
pub const MAX_CODE_LEN: usize = 128;

/// Compiled resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Page address template containing `{code}`.
    pub page_url: String,
    /// Matches the URL of a media segment request.
    pub segment_pattern: Regex,
    pub manifest_name: String,
    pub play_selector: String,
    pub navigation_timeout: Duration,
    pub capture_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub recent_codes: usize,
}

impl ResolverSettings {
    /// Compile the segment pattern from the configured section.
    pub fn from_config(config: &ResolverConfig) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            page_url: config.page_url.clone(),
            segment_pattern: Regex::new(&config.segment_pattern)?,
            manifest_name: config.manifest_name.clone(),
            play_selector: config.play_selector.clone(),
            navigation_timeout: Duration::from_secs(config.navigation_timeout_secs),
            capture_timeout: Duration::from_secs(config.capture_timeout_secs),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache_capacity: config.cache_capacity,
            recent_codes: config.recent_codes,
        })
    }

    /// Player page address for `code`, percent-encoded into the template.
    pub fn page_for(&self, code: &str) -> String {
        self.page_url.replace("{code}", &urlencoding::encode(code))
    }

    fn is_segment(&self, url: &str) -> bool {
        self.segment_pattern.is_match(url)
    }
}

/// Resolves codes to manifest URLs, caching successes.
pub struct StreamResolver {
    sessions: SessionManager,
    settings: Arc<ResolverSettings>,
    cache: Arc<TtlCache<String>>,
    flights: SingleFlight<String, String>,
    recent: Arc<RecentCodes>,
}

impl StreamResolver {
    pub fn new(sessions: SessionManager, settings: ResolverSettings) -> Self {
        let cache = Arc::new(TtlCache::new("resolution", settings.cache_capacity));
        let recent = Arc::new(RecentCodes::new(settings.recent_codes));
        Self {
            sessions,
            settings: Arc::new(settings),
            cache,
            flights: SingleFlight::new(),
            recent,
        }
    }

    /// Resolve `code` to its manifest URL.
    ///
    /// Concurrent calls for the same code share one browser run. Failures
    /// are never cached.
    #[instrument(skip(self))]
    pub async fn resolve(&self, code: &str) -> Result<String> {
        validate_code(code)?;

        if let Some(url) = self.cache.get(code) {
            debug!("Resolution cache hit");
            return Ok(url);
        }

        let sessions = self.sessions.clone();
        let settings = Arc::clone(&self.settings);
        let cache = Arc::clone(&self.cache);
        let recent = Arc::clone(&self.recent);
        let code = code.to_string();
        self.flights
            .run(code.clone(), move || async move {
                let manifest = resolve_uncached(&sessions, &settings, &code).await?;
                cache.put(code.clone(), manifest.clone(), settings.cache_ttl);
                recent.push(&code);
                info!(code = %code, manifest = %manifest, "Resolved stream");
                Ok(manifest)
            })
            .await
    }

    /// Drop every cached resolution.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Codes resolved most recently, newest first.
    pub fn recent_codes(&self) -> Vec<String> {
        self.recent.snapshot()
    }

    /// Resolutions currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}

/// Codes are opaque: any 1 to [`MAX_CODE_LEN`] bytes except the dot
/// segments, which would climb out of the page template's path.
pub fn validate_code(code: &str) -> Result<()> {
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(RelayError::BadRequest(format!(
            "code must be 1-{MAX_CODE_LEN} bytes"
        )));
    }
    if code == "." || code == ".." {
        return Err(RelayError::BadRequest(format!("invalid code '{code}'")));
    }
    Ok(())
}

async fn resolve_uncached(
    sessions: &SessionManager,
    settings: &ResolverSettings,
    code: &str,
) -> Result<String> {
    let page_url = settings.page_for(code);
    let lease = sessions.acquire().await?;
    let mut page = lease.browser().new_page().await?;

    let outcome = capture_segment(page.as_mut(), settings, &page_url).await;
    if let Err(e) = page.close().await {
        warn!("Failed to close page: {e}");
    }
    drop(lease);

    let segment = outcome?.ok_or_else(|| {
        RelayError::NotFound(format!("no segment request observed for code '{code}'"))
    })?;
    debug!(segment = %segment, "Captured segment request");
    derive_manifest_url(&segment, &settings.manifest_name)
}

/// Drive the page and return the first segment request URL seen, if any.
async fn capture_segment(
    page: &mut dyn Page,
    settings: &ResolverSettings,
    page_url: &str,
) -> Result<Option<String>> {
    page.navigate(page_url, settings.navigation_timeout).await?;

    match page.click(&settings.play_selector).await {
        Ok(true) => debug!("Clicked play control"),
        Ok(false) => debug!("No play control on page"),
        Err(e) => warn!("Play control click failed: {e}"),
    }
    match page.play_media().await {
        Ok(n) => debug!(media_elements = n, "Requested playback"),
        Err(e) => warn!("Media playback failed: {e}"),
    }

    let deadline = Instant::now() + settings.capture_timeout;
    let mut captured: Option<String> = None;
    loop {
        let event = match tokio::time::timeout_at(deadline, page.next_network_event()).await {
            Ok(event) => event?,
            Err(_) => {
                debug!("No segment response within {:?}", settings.capture_timeout);
                break;
            }
        };
        let Some(event) = event else {
            break;
        };
        if !settings.is_segment(event.url()) {
            continue;
        }
        match event {
            NetworkEvent::Request(url) => {
                if captured.is_none() {
                    captured = Some(url);
                }
            }
            NetworkEvent::Response { url, status } => {
                debug!(status, url = %url, "Segment response observed");
                if captured.is_none() {
                    captured = Some(url);
                }
                break;
            }
        }
    }
    Ok(captured)
}

/// Replace the segment's file name with `manifest_name`, dropping any query
/// string or fragment.
pub fn derive_manifest_url(segment_url: &str, manifest_name: &str) -> Result<String> {
    let mut url = Url::parse(segment_url)
        .map_err(|e| RelayError::Upstream(format!("captured invalid URL '{segment_url}': {e}")))?;
    {
        let mut segments = url.path_segments_mut().map_err(|()| {
            RelayError::Upstream(format!("captured URL '{segment_url}' has no path"))
        })?;
        segments.pop();
        segments.push(manifest_name);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}
