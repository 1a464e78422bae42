//! In-memory browser whose pages replay a fixed script of network events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Browser, BrowserLauncher, NetworkEvent, Page};
use crate::error::{RelayError, Result};

/// What a page does when driven.
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    /// Events observed while the page loads.
    pub on_load: Vec<NetworkEvent>,
    /// Events observed once playback is started.
    pub on_play: Vec<NetworkEvent>,
    /// Navigation fails with this error.
    pub navigate_error: Option<RelayError>,
    /// Time the page takes to settle after navigation starts.
    pub settle_delay: Option<Duration>,
    /// Whether a play control exists.
    pub has_play_control: bool,
}

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    closed: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
}

pub struct ScriptedLauncher {
    launch_delay: Duration,
    failing: AtomicUsize,
    script: Mutex<PageScript>,
    counters: Arc<Counters>,
    browsers: Mutex<Vec<Arc<ScriptedBrowser>>>,
    navigations: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            launch_delay: Duration::ZERO,
            failing: AtomicUsize::new(0),
            script: Mutex::new(PageScript::default()),
            counters: Arc::new(Counters::default()),
            browsers: Mutex::new(Vec::new()),
            navigations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// The next `n` launches fail.
    pub fn failing_launches(self, n: usize) -> Self {
        self.failing.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_script(self, script: PageScript) -> Self {
        *self.script.lock() = script;
        self
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.counters.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.counters.pages_closed.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().clone()
    }

    pub fn disconnect_all(&self) {
        for browser in self.browsers.lock().iter() {
            browser.connected.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let failing = self.failing.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing.store(failing - 1, Ordering::SeqCst);
            return Err(RelayError::Upstream("scripted launch failure".into()));
        }
        let browser = Arc::new(ScriptedBrowser {
            script: self.script.lock().clone(),
            counters: Arc::clone(&self.counters),
            navigations: Arc::clone(&self.navigations),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.browsers.lock().push(Arc::clone(&browser));
        Ok(browser)
    }
}

pub struct ScriptedBrowser {
    script: PageScript,
    counters: Arc<Counters>,
    navigations: Arc<Mutex<Vec<String>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn new_page(&self) -> Result<Box<dyn Page>> {
        self.counters.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage {
            script: self.script.clone(),
            pending: VecDeque::new(),
            counters: Arc::clone(&self.counters),
            navigations: Arc::clone(&self.navigations),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct ScriptedPage {
    script: PageScript,
    pending: VecDeque<NetworkEvent>,
    counters: Arc<Counters>,
    navigations: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Page for ScriptedPage {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        self.navigations.lock().push(url.to_string());
        if let Some(err) = self.script.navigate_error.clone() {
            return Err(err);
        }
        if let Some(delay) = self.script.settle_delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(RelayError::Timeout(format!(
                    "network did not settle on {url} within {timeout:?}"
                )));
            }
            tokio::time::sleep(delay).await;
        }
        self.pending.extend(self.script.on_load.iter().cloned());
        Ok(())
    }

    async fn click(&mut self, _selector: &str) -> Result<bool> {
        Ok(self.script.has_play_control)
    }

    async fn play_media(&mut self) -> Result<usize> {
        self.pending.extend(self.script.on_play.iter().cloned());
        Ok(1)
    }

    async fn next_network_event(&mut self) -> Result<Option<NetworkEvent>> {
        match self.pending.pop_front() {
            Some(event) => Ok(Some(event)),
            // A quiet page: nothing more will arrive.
            None => std::future::pending().await,
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.counters.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
