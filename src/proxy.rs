//! Caching, rewriting reverse proxy for HLS resources.
//!
//! Playlists are rewritten so every nested reference routes back through
//! the proxy; everything else passes through untouched.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use url::Url;

use crate::cache::TtlCache;
use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use crate::flight::SingleFlight;
use crate::http_client::UpstreamClient;
use crate::rewrite::{is_playlist, rewrite, PLAYLIST_CONTENT_TYPE};

/// Content type for non-playlist bodies without one.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Body and content type served for a target URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedResource {
    pub body: Bytes,
    pub content_type: String,
}

impl ProxiedResource {
    #[must_use]
    pub fn is_playlist(&self) -> bool {
        self.content_type == PLAYLIST_CONTENT_TYPE
    }
}

/// Fetches, rewrites and caches upstream resources.
pub struct ProxyFetcher {
    client: UpstreamClient,
    cache: Arc<TtlCache<ProxiedResource>>,
    flights: SingleFlight<String, ProxiedResource>,
    ttl: Duration,
}

impl ProxyFetcher {
    pub fn new(client: UpstreamClient, config: &ProxyConfig) -> Self {
        Self {
            client,
            cache: Arc::new(TtlCache::new("proxy", config.cache_capacity)),
            flights: SingleFlight::new(),
            ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    /// Capacity 200, entries kept for three hours.
    pub fn with_defaults(client: UpstreamClient) -> Self {
        Self::new(client, &ProxyConfig::default())
    }

    /// Serve `target` through the proxy.
    ///
    /// `proxy_origin` is the public origin embedded into rewritten
    /// playlists. Cache entries are keyed by target alone.
    #[instrument(skip(self, proxy_origin))]
    pub async fn fetch(&self, target: &str, proxy_origin: &str) -> Result<ProxiedResource> {
        let target = validate_target(target)?;

        if let Some(hit) = self.cache.get(&target) {
            debug!("Proxy cache hit");
            return Ok(hit);
        }

        let client = self.client.clone();
        let cache = Arc::clone(&self.cache);
        let ttl = self.ttl;
        let origin = proxy_origin.to_string();
        let key = target.clone();
        self.flights
            .run(key, move || async move {
                let resource = fetch_uncached(&client, &target, &origin).await?;
                cache.put(target.clone(), resource.clone(), ttl);
                Ok(resource)
            })
            .await
    }

    /// Drop every cached resource.
    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Require an absolute `http` or `https` URL.
pub fn validate_target(target: &str) -> Result<String> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(RelayError::BadRequest("missing m3u8 parameter".into()));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| RelayError::BadRequest(format!("invalid target URL '{trimmed}': {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(trimmed.to_string()),
        scheme => Err(RelayError::BadRequest(format!(
            "unsupported target '{trimmed}' (scheme {scheme})"
        ))),
    }
}

async fn fetch_uncached(
    client: &UpstreamClient,
    target: &str,
    proxy_origin: &str,
) -> Result<ProxiedResource> {
    let fetched = client.fetch_bytes(target).await?;

    if is_playlist(target, fetched.content_type.as_deref(), &fetched.body) {
        let text = String::from_utf8_lossy(&fetched.body);
        // Relative references resolve against where the playlist actually
        // came from, after redirects.
        let rewritten = rewrite(&text, &fetched.final_url, proxy_origin);
        info!(url = %target, bytes = rewritten.len(), "Rewrote playlist");
        return Ok(ProxiedResource {
            body: Bytes::from(rewritten),
            content_type: PLAYLIST_CONTENT_TYPE.to_string(),
        });
    }

    debug!(url = %target, bytes = fetched.body.len(), "Passing through");
    Ok(ProxiedResource {
        body: fetched.body,
        content_type: fetched
            .content_type
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::UpstreamIdentity;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const ORIGIN: &str = "http://relay.local:3000";

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
#EXTINF:10.0,\n\
seg.ts\n\
#EXT-X-ENDLIST\n";

    struct Upstream {
        base: String,
        hits: Arc<AtomicUsize>,
    }

    async fn upstream() -> Upstream {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/a/master.m3u8",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { ([("content-type", "text/plain")], MASTER) }
                }),
            )
            .route(
                "/a/playlist",
                get(|| async { ([("content-type", "application/x-mpegURL")], "#EXTM3U\nx.ts\n") }),
            )
            .route(
                "/a/seg.ts",
                get(|| async { ([("content-type", "video/mp2t")], vec![0x47u8, 0x40, 0x00, 0xff]) }),
            )
            .route("/a/raw", get(|| async { vec![1u8, 2, 3] }))
            .route("/a/gone.ts", get(|| async { StatusCode::NOT_FOUND }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Upstream {
            base: format!("http://{addr}"),
            hits,
        }
    }

    fn fetcher() -> ProxyFetcher {
        let client =
            UpstreamClient::new(&UpstreamIdentity::default(), Duration::from_secs(5)).unwrap();
        ProxyFetcher::with_defaults(client)
    }

    #[tokio::test]
    async fn playlist_is_rewritten() {
        let upstream = upstream().await;
        let proxy = fetcher();
        let target = format!("{}/a/master.m3u8", upstream.base);

        let resource = proxy.fetch(&target, ORIGIN).await.unwrap();
        assert!(resource.is_playlist());

        let body = String::from_utf8(resource.body.to_vec()).unwrap();
        let seg = urlencoding::encode(&format!("{}/a/seg.ts", upstream.base)).into_owned();
        let key = urlencoding::encode(&format!("{}/a/key.bin", upstream.base)).into_owned();
        assert!(body.contains(&format!("{ORIGIN}/proxy?m3u8={seg}\n")));
        assert!(body.contains(&format!("URI=\"{ORIGIN}/proxy?m3u8={key}\"")));
        assert!(body.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(body.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn playlist_detected_by_content_type() {
        let upstream = upstream().await;
        let proxy = fetcher();

        let resource = proxy
            .fetch(&format!("{}/a/playlist", upstream.base), ORIGIN)
            .await
            .unwrap();
        assert_eq!(resource.content_type, PLAYLIST_CONTENT_TYPE);
        assert!(String::from_utf8_lossy(&resource.body).contains("/proxy?m3u8="));
    }

    #[tokio::test]
    async fn cache_hit_skips_upstream() {
        let upstream = upstream().await;
        let proxy = fetcher();
        let target = format!("{}/a/master.m3u8", upstream.base);

        let first = proxy.fetch(&target, ORIGIN).await.unwrap();
        let second = proxy.fetch(&target, ORIGIN).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.cache_len(), 1);

        proxy.clear();
        proxy.fetch(&target, ORIGIN).await.unwrap();
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_fetches_are_coalesced() {
        let upstream = upstream().await;
        let proxy = fetcher();
        let target = format!("{}/a/master.m3u8", upstream.base);

        let (a, b) = tokio::join!(proxy.fetch(&target, ORIGIN), proxy.fetch(&target, ORIGIN));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn binary_passes_through() {
        let upstream = upstream().await;
        let proxy = fetcher();

        let seg = proxy
            .fetch(&format!("{}/a/seg.ts", upstream.base), ORIGIN)
            .await
            .unwrap();
        assert_eq!(seg.content_type, "video/mp2t");
        assert_eq!(seg.body.as_ref(), &[0x47, 0x40, 0x00, 0xff]);

        let raw = proxy
            .fetch(&format!("{}/a/raw", upstream.base), ORIGIN)
            .await
            .unwrap();
        assert_eq!(raw.body.as_ref(), &[1, 2, 3]);
        assert!(!raw.is_playlist());
    }

    #[tokio::test]
    async fn upstream_failure_is_not_cached() {
        let upstream = upstream().await;
        let proxy = fetcher();

        let err = proxy
            .fetch(&format!("{}/a/gone.ts", upstream.base), ORIGIN)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UpstreamStatus { status: 404, .. }));
        assert_eq!(proxy.cache_len(), 0);
    }

    #[tokio::test]
    async fn bad_targets_are_rejected() {
        let proxy = fetcher();
        for target in ["", "   ", "not a url", "ftp://h/a.ts", "file:///etc/passwd"] {
            let err = proxy.fetch(target, ORIGIN).await.unwrap_err();
            assert!(matches!(err, RelayError::BadRequest(_)), "{target}: {err:?}");
        }
    }
}
