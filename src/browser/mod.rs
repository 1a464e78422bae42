//! Headless browser collaborator
//!
//! The resolver needs exactly one interaction recipe from a browser: open a
//! page, watch its network traffic, poke the player into starting, and shut
//! down cleanly. These traits describe that surface; [`chrome`] implements
//! it over the DevTools protocol and [`session`] manages the single shared
//! instance.

pub mod cdp;
pub mod chrome;
pub mod session;

#[cfg(test)]
pub(crate) mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use chrome::ChromeLauncher;
pub use session::{SessionLease, SessionManager, SessionStatus};

/// Network activity observed on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// An outgoing request is about to be sent.
    Request(String),
    /// A response arrived for a request.
    Response { url: String, status: u16 },
}

impl NetworkEvent {
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Request(url) | Self::Response { url, .. } => url,
        }
    }
}

/// Starts browser processes.
#[async_trait]
pub trait BrowserLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<Arc<dyn Browser>>;
}

/// A running browser process.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a fresh, isolated page with network observation enabled.
    async fn new_page(&self) -> Result<Box<dyn Page>>;

    /// Shut the browser down. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    /// Returns `false` once the browser is known to be gone.
    fn is_connected(&self) -> bool {
        true
    }
}

/// One page (tab) in a [`Browser`].
#[async_trait]
pub trait Page: Send {
    /// Navigate to `url` and wait until network activity settles.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Click the first element matching `selector`. Returns whether one was
    /// found.
    async fn click(&mut self, selector: &str) -> Result<bool>;

    /// Start playback on every media element. Returns how many were found.
    async fn play_media(&mut self) -> Result<usize>;

    /// Next buffered network event, waiting for one if none is pending.
    /// `None` once the page can produce no more events.
    async fn next_network_event(&mut self) -> Result<Option<NetworkEvent>>;

    /// Close the page.
    async fn close(self: Box<Self>) -> Result<()>;
}
