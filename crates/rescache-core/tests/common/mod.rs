//! Shared helpers for the integration tests

#![allow(dead_code)]

use axum::Router;
use parking_lot::Mutex;
use rescache_core::{
    CacheSettings, CompletionOutcome, FetchStrategy, Registry, Resource, ResourceInfo,
    ResourceKey, ResourceWatcher, TransferContext,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use url::Url;

// ============================================================================
// Registry
// ============================================================================

pub fn settings(dir: &TempDir) -> CacheSettings {
    CacheSettings {
        index_debounce_ms: 10,
        ..CacheSettings::with_cache_dir(dir.path())
    }
}

pub async fn registry(dir: &TempDir) -> Registry {
    Registry::new(settings(dir)).await.unwrap()
}

pub fn manual_url(name: &str) -> String {
    format!("manual://host/{name}")
}

// ============================================================================
// Manually driven strategy
// ============================================================================

/// Hands every started transfer to the test through a channel
pub struct ManualStrategy {
    scheme: &'static str,
    tx: mpsc::UnboundedSender<TransferContext>,
    cancelled: Mutex<Vec<ResourceKey>>,
}

impl ManualStrategy {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransferContext>) {
        Self::for_scheme("manual")
    }

    pub fn for_scheme(
        scheme: &'static str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransferContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let strategy = Arc::new(Self {
            scheme,
            tx,
            cancelled: Mutex::new(Vec::new()),
        });
        (strategy, rx)
    }

    pub fn cancelled(&self) -> Vec<ResourceKey> {
        self.cancelled.lock().clone()
    }
}

impl FetchStrategy for ManualStrategy {
    fn name(&self) -> &str {
        self.scheme
    }

    fn can_handle(&self, url: &Url) -> bool {
        url.scheme() == self.scheme
    }

    fn start(&self, transfer: TransferContext) {
        let _ = self.tx.send(transfer);
    }

    fn cancel(&self, key: &ResourceKey) {
        self.cancelled.lock().push(key.clone());
    }
}

/// Drain every transfer started so far
pub fn started(rx: &mut mpsc::UnboundedReceiver<TransferContext>) -> Vec<TransferContext> {
    let mut out = Vec::new();
    while let Ok(transfer) = rx.try_recv() {
        out.push(transfer);
    }
    out
}

pub async fn complete(mut transfer: TransferContext, body: &[u8]) {
    transfer.set_expected_length(body.len() as i64);
    transfer.append(body).await.unwrap();
    transfer.finish(Ok(())).await;
}

// ============================================================================
// Watchers
// ============================================================================

/// Records every callback as a short string
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("status:"))
            .collect()
    }
}

impl ResourceWatcher for Recorder {
    fn status_changed(&self, resource: &ResourceInfo) {
        self.events.lock().push(format!("status:{}", resource.status));
    }

    fn progress_changed(&self, _resource: &ResourceInfo, progress: f32) {
        self.events.lock().push(format!("progress:{progress:.2}"));
    }

    fn completed(&self, _resource: &ResourceInfo, error: Option<&rescache_core::CacheError>) {
        let entry = match error {
            None => "completed:ok".to_string(),
            Some(_) => "completed:err".to_string(),
        };
        self.events.lock().push(entry);
    }

    fn cancelled(&self, _resource: &ResourceInfo) {
        self.events.lock().push("cancelled".to_string());
    }
}

pub fn watch(registry: &Registry, resource: &Resource) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder::default());
    let id = registry.register_watcher(recorder.clone());
    resource.add_watcher(id);
    recorder
}

/// Arm a completion handler and hand back its receiver
pub fn outcome_of(resource: &Resource) -> oneshot::Receiver<CompletionOutcome> {
    let (tx, rx) = oneshot::channel();
    resource.add_completion_handler(move |_, outcome| {
        let _ = tx.send(outcome.clone());
    });
    rx
}

pub async fn wait(rx: oneshot::Receiver<CompletionOutcome>) -> CompletionOutcome {
    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("transfer did not finish in time")
        .expect("completion handler dropped")
}

// ============================================================================
// HTTP server
// ============================================================================

pub struct TestServer {
    base_url: Url,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn new(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });

        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            base_url: Url::parse(&format!("http://{}", addr)).unwrap(),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        self.base_url.join(path).unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
