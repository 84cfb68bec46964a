//! Reloadable name sources.
//!
//! A [`NameIndex`] is an ordered list of [`NameItem`]s, each backed by a
//! file path or an https URL. Match calls read the current set under a
//! shared lock; reload workers rebuild a whole [`DomainSet`] off to the
//! side and swap it in under the exclusive lock, so readers never observe
//! a partially updated set.

use super::domain_set::DomainSet;
use super::fetch::{build_list_client, content_hash, fetch_list};
use super::parser::parse_name_list;
use dnsteer_domain::ForwardError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Retry delays for the initial URL population.
const INITIAL_URL_RETRIES: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(1500)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Path,
    Url,
}

#[derive(Default)]
struct ItemState {
    names: DomainSet,
    // Path sources: skip re-parsing when unchanged.
    mtime: Option<SystemTime>,
    size: u64,
    // URL sources: FNV-64a of the last fetched body.
    hash: Option<u64>,
}

pub struct NameItem {
    kind: SourceKind,
    source: String,
    state: RwLock<ItemState>,
    /// Bumped on every swap; lets callers observe that an unchanged source
    /// did not produce a new set.
    generation: AtomicU64,
}

impl NameItem {
    fn new(kind: SourceKind, source: String) -> Self {
        Self {
            kind,
            source,
            state: RwLock::new(ItemState::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn matches(&self, child: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .names
            .matches(child)
    }

    async fn reload_path(&self) {
        let meta = match tokio::fs::metadata(&self.source).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Missing files were already reported at setup.
                debug!(path = %self.source, "name list file does not exist");
                return;
            }
            Err(e) => {
                warn!(path = %self.source, error = %e, "cannot stat name list");
                return;
            }
        };

        let mtime = meta.modified().ok();
        let size = meta.len();
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.mtime == mtime && state.size == size && mtime.is_some() {
                return;
            }
        }

        let content = match tokio::fs::read_to_string(&self.source).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.source, error = %e, "cannot read name list");
                return;
            }
        };

        let outcome = parse_name_list(&content);
        debug!(
            path = %self.source,
            names = outcome.names.len(),
            lines = outcome.total_lines,
            "name list file reloaded"
        );

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.names = outcome.names;
        state.mtime = mtime;
        state.size = size;
        drop(state);
        self.generation.fetch_add(1, Ordering::Release);
    }

    async fn reload_url(&self, client: &reqwest::Client) -> Result<(), ForwardError> {
        let content = fetch_list(client, &self.source).await?;
        let hash = content_hash(&content);

        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.hash == Some(hash) {
                debug!(url = %self.source, "name list url unchanged");
                return Ok(());
            }
        }

        let outcome = parse_name_list(&content);
        debug!(
            url = %self.source,
            names = outcome.names.len(),
            lines = outcome.total_lines,
            "name list url reloaded"
        );

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.names = outcome.names;
        state.hash = Some(hash);
        drop(state);
        self.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

pub struct NameIndex {
    items: Arc<Vec<NameItem>>,
    path_reload: Duration,
    url_reload: Duration,
    url_read_timeout: Duration,
    stop_tx: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NameIndex {
    /// Classifies sources by shape: anything with a scheme separator is a
    /// URL, everything else a file path. Patterns (bare domains) are the
    /// caller's concern and must not reach here.
    pub fn from_sources(
        sources: &[String],
        path_reload: Duration,
        url_reload: Duration,
        url_read_timeout: Duration,
    ) -> Self {
        let items = sources
            .iter()
            .map(|s| {
                let kind = if s.contains("://") {
                    SourceKind::Url
                } else {
                    SourceKind::Path
                };
                NameItem::new(kind, s.clone())
            })
            .collect();

        let (stop_tx, _) = watch::channel(false);
        Self {
            items: Arc::new(items),
            path_reload,
            url_reload,
            url_read_timeout,
            stop_tx,
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[NameItem] {
        &self.items
    }

    fn has_kind(&self, kind: SourceKind) -> bool {
        self.items.iter().any(|item| item.kind == kind)
    }

    /// First match wins across items, each consulted under its read lock.
    pub fn matches(&self, child: &str) -> bool {
        self.items.iter().any(|item| item.matches(child))
    }

    /// Populates path items synchronously, kicks off the initial URL fetch
    /// asynchronously, and starts the periodic reload workers.
    pub async fn start(
        &self,
        bootstrap: &[SocketAddr],
        no_ipv6: bool,
    ) -> Result<(), ForwardError> {
        let mut workers = Vec::new();

        if self.has_kind(SourceKind::Path) {
            for item in self.items.iter() {
                if item.kind == SourceKind::Path {
                    item.reload_path().await;
                }
            }

            if !self.path_reload.is_zero() {
                let items = Arc::clone(&self.items);
                let mut stop_rx = self.stop_tx.subscribe();
                let period = self.path_reload;
                workers.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = stop_rx.changed() => return,
                            _ = ticker.tick() => {
                                for item in items.iter() {
                                    if item.kind == SourceKind::Path {
                                        item.reload_path().await;
                                    }
                                }
                            }
                        }
                    }
                }));
            }
        }

        if self.has_kind(SourceKind::Url) {
            let client = build_list_client(bootstrap, no_ipv6, self.url_read_timeout)?;

            {
                let items = Arc::clone(&self.items);
                let client = client.clone();
                let stop_rx = self.stop_tx.subscribe();
                workers.push(tokio::spawn(async move {
                    initial_url_population(&items, &client, stop_rx).await;
                }));
            }

            if !self.url_reload.is_zero() {
                let items = Arc::clone(&self.items);
                let mut stop_rx = self.stop_tx.subscribe();
                let period = self.url_reload;
                workers.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = stop_rx.changed() => return,
                            _ = ticker.tick() => {
                                for item in items.iter() {
                                    if item.kind == SourceKind::Url {
                                        if let Err(e) = item.reload_url(&client).await {
                                            warn!(url = %item.source, error = %e, "url reload failed");
                                        }
                                    }
                                }
                            }
                        }
                    }
                }));
            }
        }

        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(workers);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn initial_url_population(
    items: &[NameItem],
    client: &reqwest::Client,
    mut stop_rx: watch::Receiver<bool>,
) {
    for item in items.iter().filter(|i| i.kind == SourceKind::Url) {
        let mut attempt = 0;
        loop {
            match item.reload_url(client).await {
                Ok(()) => break,
                Err(e) if attempt < INITIAL_URL_RETRIES.len() => {
                    warn!(url = %item.source, error = %e, attempt, "initial url fetch failed, retrying");
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(INITIAL_URL_RETRIES[attempt]) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(url = %item.source, error = %e, "initial url fetch failed, giving up");
                    break;
                }
            }
        }
    }
}
