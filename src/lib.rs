//! `hlsrelay` - HLS manifest resolver and rewriting proxy
//!
//! # Features
//!
//! - **Resolution**: drives a headless Chrome over the DevTools protocol to
//!   capture the first media segment a player page requests, and derives
//!   the manifest URL from it
//! - **Session reuse**: one shared browser, launched on demand and closed
//!   after an idle window with no active lease
//! - **Proxy**: fetches playlists and segments with a fixed upstream
//!   identity, rewriting playlists so nested references route back through
//!   the proxy
//! - **Caching**: bounded FIFO caches with TTL, plus per-key single-flight
//!
//! # Example
//!
//! ```rust
//! use hlsrelay::rewrite;
//!
//! let out = rewrite("#EXTM3U\nseg1.ts\n", "https://h/a/b/master.m3u8", "http://relay");
//! assert_eq!(
//!     out,
//!     "#EXTM3U\nhttp://relay/proxy?m3u8=https%3A%2F%2Fh%2Fa%2Fb%2Fseg1.ts\n"
//! );
//! ```

pub mod activity;
pub mod browser;
pub mod cache;
pub mod config;
pub mod error;
pub mod flight;
pub mod http_client;
pub mod identity;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod server;

pub use activity::{ErrorLog, ErrorRecord, RecentCodes};
pub use browser::{ChromeLauncher, SessionLease, SessionManager, SessionStatus};
pub use cache::TtlCache;
pub use config::Config;
pub use error::{RelayError, Result};
pub use flight::SingleFlight;
pub use http_client::UpstreamClient;
pub use identity::UpstreamIdentity;
pub use proxy::{ProxiedResource, ProxyFetcher};
pub use resolver::{ResolverSettings, StreamResolver};
pub use rewrite::{is_playlist, proxy_url, rewrite};
pub use server::{router, AppState};

/// Version of hlsrelay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
