//! Pluggable fetch strategies

use crate::engine::TransferContext;
use crate::key::ResourceKey;
use std::sync::Arc;
use url::Url;

/// Fetches the bytes of a resource
///
/// `start` must return promptly: the strategy spawns its own work and reports
/// through the [`TransferContext`], ending with exactly one `finish` call.
/// After `cancel` (or once the context's token fires) anything it reports is
/// ignored.
pub trait FetchStrategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn can_handle(&self, url: &Url) -> bool;

    fn start(&self, transfer: TransferContext);

    /// Called after the transfer's token has been cancelled
    fn cancel(&self, _key: &ResourceKey) {}
}

/// Registered strategies in registration order, with a fallback
pub(crate) struct StrategyList {
    custom: Vec<Arc<dyn FetchStrategy>>,
    fallback: Arc<dyn FetchStrategy>,
}

impl StrategyList {
    pub fn new(fallback: Arc<dyn FetchStrategy>) -> Self {
        Self {
            custom: Vec::new(),
            fallback,
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn FetchStrategy>) {
        self.custom.push(strategy);
    }

    /// Drop every strategy registered under `name`
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.custom.len();
        self.custom.retain(|s| s.name() != name);
        self.custom.len() != before
    }

    pub fn len(&self) -> usize {
        self.custom.len()
    }

    /// First registered strategy that claims `url`, else the fallback
    pub fn select(&self, url: &Url) -> Arc<dyn FetchStrategy> {
        self.custom
            .iter()
            .find(|s| s.can_handle(url))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
