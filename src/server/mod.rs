//! HTTP server: shared state, router and lifecycle.

pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::activity::ErrorLog;
use crate::browser::{BrowserLauncher, ChromeLauncher, SessionManager};
use crate::config::Config;
use crate::http_client::UpstreamClient;
use crate::proxy::ProxyFetcher;
use crate::resolver::{ResolverSettings, StreamResolver};

pub use routes::router;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<StreamResolver>,
    pub proxy: Arc<ProxyFetcher>,
    pub errors: Arc<ErrorLog>,
    /// Origin written into rewritten playlists; derived per request when
    /// unset.
    pub public_url: Option<String>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(resolver: StreamResolver, proxy: ProxyFetcher, public_url: Option<String>) -> Self {
        Self {
            resolver: Arc::new(resolver),
            proxy: Arc::new(proxy),
            errors: Arc::new(ErrorLog::default()),
            public_url: public_url.map(|u| u.trim_end_matches('/').to_string()),
            start_time: Instant::now(),
        }
    }

    /// Wire up the Chrome-backed resolver and the proxy from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let identity = config.effective_identity();
        let launcher = ChromeLauncher::new(config.browser.executable.clone())
            .with_args(config.browser.extra_args.clone())
            .with_user_agent(identity.user_agent.clone());
        let sessions = SessionManager::with_timeouts(
            Arc::new(launcher) as Arc<dyn BrowserLauncher>,
            config.idle_timeout(),
            config.launch_timeout(),
        );
        let settings = ResolverSettings::from_config(&config.resolver)
            .context("invalid resolver.segment_pattern")?;
        let client = UpstreamClient::new(
            &identity,
            std::time::Duration::from_secs(config.proxy.timeout_secs),
        )
        .context("failed to build upstream HTTP client")?;

        Ok(Self::new(
            StreamResolver::new(sessions, settings),
            ProxyFetcher::new(client, &config.proxy),
            config.server.public_url.clone(),
        ))
    }
}

/// Serve until Ctrl-C, then close the browser.
pub async fn serve(config: &Config) -> Result<()> {
    let state = AppState::from_config(config)?;
    let sessions = state.resolver.sessions().clone();
    let app: Router = router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down");
    sessions.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
