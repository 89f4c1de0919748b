//! Watchers, completion handlers and ordered notification delivery
//!
//! Mutations happen under the registry's state lock and enqueue
//! [`Notification`]s while still holding it, so the outbox order is the
//! mutation order. Delivery runs after the lock is released, one notification
//! at a time, on whichever thread wins the delivery guard.

use crate::engine::FetchRequest;
use crate::error::CacheError;
use parking_lot::Mutex;
use rescache_types::{ResourceEvent, ResourceInfo};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Observer of resource status and progress
///
/// Callbacks run synchronously on the delivery path and must not block: no
/// network or disk calls from a watcher.
pub trait ResourceWatcher: Send + Sync {
    fn status_changed(&self, resource: &ResourceInfo);

    /// Last chance to adjust the outgoing request, e.g. add headers
    fn will_send_request(&self, _resource: &ResourceInfo, _request: &mut FetchRequest) {}

    fn progress_changed(&self, _resource: &ResourceInfo, _progress: f32) {}

    /// `None` means the download succeeded
    fn completed(&self, _resource: &ResourceInfo, _error: Option<&CacheError>) {}

    fn cancelled(&self, _resource: &ResourceInfo) {}
}

/// Handle of a watcher registered with a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub(crate) u64);

/// How a download attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Downloaded,
    Failed(CacheError),
    Cancelled,
}

impl CompletionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Downloaded)
    }

    pub fn error(&self) -> Option<&CacheError> {
        match self {
            CompletionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// One-shot callback fired on the next terminal transition of a resource
pub type CompletionHandler = Box<dyn FnOnce(&ResourceInfo, &CompletionOutcome) + Send + 'static>;

/// One-shot callback fired when the registry runs out of work
pub type IdleHandler = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Notice {
    StatusChanged,
    Progress(f32),
    Completed(Option<CacheError>),
    Cancelled,
    Removed,
    Evicted,
}

pub(crate) enum Notification {
    Resource {
        info: ResourceInfo,
        watchers: Vec<Arc<dyn ResourceWatcher>>,
        notice: Notice,
        handlers: Vec<CompletionHandler>,
    },
    Idle {
        handlers: Vec<IdleHandler>,
    },
}

pub(crate) struct Dispatcher {
    outbox: Mutex<VecDeque<Notification>>,
    delivering: Mutex<()>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl Dispatcher {
    pub fn new(event_tx: broadcast::Sender<ResourceEvent>) -> Self {
        Self {
            outbox: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: ResourceEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn push(&self, notification: Notification) {
        self.outbox.lock().push_back(notification);
    }

    /// Deliver everything queued so far.
    ///
    /// Reentrant calls (a watcher mutating the registry) and calls racing with
    /// an active deliverer return immediately; the active deliverer re-checks
    /// the outbox after releasing the guard so nothing is stranded.
    pub fn flush(&self) {
        loop {
            let Some(guard) = self.delivering.try_lock() else {
                return;
            };
            loop {
                let next = self.outbox.lock().pop_front();
                match next {
                    Some(notification) => self.deliver(notification),
                    None => break,
                }
            }
            drop(guard);
            if self.outbox.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, notification: Notification) {
        match notification {
            Notification::Resource {
                info,
                watchers,
                notice,
                handlers,
            } => {
                for watcher in &watchers {
                    let result = catch_unwind(AssertUnwindSafe(|| match &notice {
                        Notice::StatusChanged | Notice::Removed | Notice::Evicted => {
                            watcher.status_changed(&info)
                        }
                        Notice::Progress(progress) => watcher.progress_changed(&info, *progress),
                        Notice::Completed(error) => watcher.completed(&info, error.as_ref()),
                        Notice::Cancelled => watcher.cancelled(&info),
                    }));
                    if result.is_err() {
                        warn!(url = %info.url, "Watcher panicked during notification");
                    }
                }

                if !handlers.is_empty() {
                    let outcome = match &notice {
                        Notice::Completed(None) => CompletionOutcome::Downloaded,
                        Notice::Completed(Some(e)) => CompletionOutcome::Failed(e.clone()),
                        _ => CompletionOutcome::Cancelled,
                    };
                    for handler in handlers {
                        if catch_unwind(AssertUnwindSafe(|| handler(&info, &outcome))).is_err() {
                            warn!(url = %info.url, "Completion handler panicked");
                        }
                    }
                }

                self.emit(event_for(&info, &notice));
            }
            Notification::Idle { handlers } => {
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(handler)).is_err() {
                        warn!("Idle completion handler panicked");
                    }
                }
                self.emit(ResourceEvent::Idle);
            }
        }
    }
}

fn event_for(info: &ResourceInfo, notice: &Notice) -> ResourceEvent {
    let url = info.url.clone();
    match notice {
        Notice::StatusChanged => ResourceEvent::StatusChanged {
            url,
            status: info.status,
        },
        Notice::Progress(progress) => ResourceEvent::Progress {
            url,
            downloaded: info.downloaded_length,
            expected: u64::try_from(info.expected_length).ok(),
            progress: *progress,
        },
        Notice::Completed(error) => ResourceEvent::Completed {
            url,
            error: error.as_ref().map(|e| e.to_string()),
        },
        Notice::Cancelled => ResourceEvent::Cancelled { url },
        Notice::Removed => ResourceEvent::Removed { url },
        Notice::Evicted => ResourceEvent::Evicted { url },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rescache_types::ResourceStatus;
    use std::time::Duration;

    struct Recorder(Mutex<Vec<String>>);

    impl ResourceWatcher for Recorder {
        fn status_changed(&self, resource: &ResourceInfo) {
            self.0.lock().push(format!("status:{}", resource.status));
        }
        fn cancelled(&self, _resource: &ResourceInfo) {
            self.0.lock().push("cancelled".to_string());
        }
    }

    struct Panicker;

    impl ResourceWatcher for Panicker {
        fn status_changed(&self, _resource: &ResourceInfo) {
            panic!("watcher failure");
        }
    }

    fn info(status: ResourceStatus) -> ResourceInfo {
        ResourceInfo {
            url: "https://example.com/x".to_string(),
            status,
            content_type: None,
            expected_length: -1,
            downloaded_length: 0,
            progress: 0.0,
            loaded_date: None,
            last_access_date: None,
            last_error: None,
            last_response: None,
            expiration_period: Duration::ZERO,
        }
    }

    #[test]
    fn test_panicking_watcher_does_not_block_others() {
        let (tx, mut rx) = broadcast::channel(16);
        let dispatcher = Dispatcher::new(tx);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        dispatcher.push(Notification::Resource {
            info: info(ResourceStatus::InProgress),
            watchers: vec![Arc::new(Panicker), recorder.clone()],
            notice: Notice::StatusChanged,
            handlers: Vec::new(),
        });
        dispatcher.flush();

        assert_eq!(*recorder.0.lock(), vec!["status:in progress".to_string()]);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ResourceEvent::StatusChanged { .. }
        ));
    }

    #[test]
    fn test_completion_handlers_receive_outcome_in_order() {
        let (tx, _rx) = broadcast::channel(16);
        let dispatcher = Dispatcher::new(tx);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        dispatcher.push(Notification::Resource {
            info: info(ResourceStatus::NotDownloaded),
            watchers: Vec::new(),
            notice: Notice::Cancelled,
            handlers: vec![Box::new(move |_, outcome| s.lock().push(outcome.clone()))],
        });
        let s = seen.clone();
        dispatcher.push(Notification::Resource {
            info: info(ResourceStatus::Downloaded),
            watchers: Vec::new(),
            notice: Notice::Completed(None),
            handlers: vec![Box::new(move |_, outcome| s.lock().push(outcome.clone()))],
        });
        dispatcher.flush();

        assert_eq!(
            *seen.lock(),
            vec![CompletionOutcome::Cancelled, CompletionOutcome::Downloaded]
        );
    }
}
