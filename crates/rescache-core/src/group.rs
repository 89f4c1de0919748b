//! Resource groups: one status and progress over many resources

use crate::error::Result;
use crate::key::{IntoResourceKey, ResourceKey};
use crate::resource::Resource;
use crate::watcher::{ResourceWatcher, WatcherId};
use crate::Registry;
use parking_lot::Mutex;
use rescache_types::{ResourceInfo, ResourceStatus};
use std::sync::Arc;
use tracing::debug;

/// Aggregate view of a group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub status: ResourceStatus,
    pub progress: f32,
    /// Sums over children with a known expected length
    pub downloaded_length: u64,
    pub expected_length: u64,
    pub count: usize,
}

/// Observer of a group's aggregate
pub trait GroupWatcher: Send + Sync {
    fn group_changed(&self, group: &GroupInfo);
}

/// Fold child snapshots into one status and progress
///
/// Progress counts only children with a known expected length and is 0 when
/// none is known. Status is `Downloaded` when every child is, `InProgress`
/// when any child is, `NotDownloaded` otherwise.
pub fn aggregate(children: &[ResourceInfo]) -> GroupInfo {
    let (downloaded, expected) = children
        .iter()
        .filter(|c| c.length_known())
        .fold((0u64, 0u64), |(d, e), c| {
            let expected = c.expected_length as u64;
            (d + c.downloaded_length.min(expected), e + expected)
        });

    let progress = if expected == 0 {
        0.0
    } else {
        (downloaded as f64 / expected as f64).clamp(0.0, 1.0) as f32
    };

    let status = if !children.is_empty() && children.iter().all(ResourceInfo::is_downloaded) {
        ResourceStatus::Downloaded
    } else if children
        .iter()
        .any(|c| c.status == ResourceStatus::InProgress)
    {
        ResourceStatus::InProgress
    } else {
        ResourceStatus::NotDownloaded
    };

    GroupInfo {
        status,
        progress,
        downloaded_length: downloaded,
        expected_length: expected,
        count: children.len(),
    }
}

struct Child {
    resource: Resource,
    info: ResourceInfo,
}

#[derive(Default)]
struct GroupShared {
    children: Mutex<Vec<Child>>,
    watchers: Mutex<Vec<Arc<dyn GroupWatcher>>>,
}

impl GroupShared {
    fn recompute(&self) -> GroupInfo {
        let infos: Vec<ResourceInfo> = self
            .children
            .lock()
            .iter()
            .map(|c| c.info.clone())
            .collect();
        aggregate(&infos)
    }

    fn publish(&self) {
        let info = self.recompute();
        let watchers = self.watchers.lock().clone();
        for watcher in watchers {
            watcher.group_changed(&info);
        }
    }

    fn child_changed(&self, resource: &ResourceInfo) {
        let updated = {
            let mut children = self.children.lock();
            match children.iter_mut().find(|c| c.info.url == resource.url) {
                Some(child) => {
                    child.info = resource.clone();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.publish();
        }
    }
}

impl ResourceWatcher for GroupShared {
    fn status_changed(&self, resource: &ResourceInfo) {
        self.child_changed(resource);
    }

    fn progress_changed(&self, resource: &ResourceInfo, _progress: f32) {
        self.child_changed(resource);
    }
}

/// Ordered collection of resources treated as one unit
///
/// The group watches each child and re-publishes its aggregate to
/// [`GroupWatcher`]s on every child status or progress change.
pub struct ResourceGroup {
    registry: Registry,
    watcher_id: WatcherId,
    shared: Arc<GroupShared>,
}

impl ResourceGroup {
    pub fn new(registry: &Registry) -> Self {
        let shared = Arc::new(GroupShared::default());
        let watcher_id = registry.register_watcher(shared.clone());
        Self {
            registry: registry.clone(),
            watcher_id,
            shared,
        }
    }

    /// Build a group over `urls`, in order
    pub fn with_urls<I, U>(registry: &Registry, urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = U>,
        U: IntoResourceKey,
    {
        let group = Self::new(registry);
        for url in urls {
            let resource = registry.resource_for(url)?;
            group.add(&resource);
        }
        Ok(group)
    }

    /// Append `resource`; adding a member twice is a no-op
    pub fn add(&self, resource: &Resource) {
        if self.find(resource.key()).is_some() {
            return;
        }
        // Watch before taking the snapshot so no change falls between them
        resource.add_watcher(self.watcher_id);
        let info = resource.info();
        {
            let mut children = self.shared.children.lock();
            if children.iter().any(|c| c.resource.key() == resource.key()) {
                return;
            }
            children.push(Child {
                resource: resource.clone(),
                info,
            });
        }
        debug!(url = %resource.key(), "Added to group");
        self.shared.publish();
    }

    pub fn remove(&self, url: impl IntoResourceKey) -> bool {
        let Ok(key) = url.into_resource_key() else {
            return false;
        };
        let removed = {
            let mut children = self.shared.children.lock();
            let pos = children.iter().position(|c| c.resource.key() == &key);
            pos.map(|pos| children.remove(pos))
        };
        match removed {
            Some(child) => {
                child.resource.remove_watcher(self.watcher_id);
                self.shared.publish();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Resource> {
        self.shared
            .children
            .lock()
            .get(index)
            .map(|c| c.resource.clone())
    }

    pub fn index_of(&self, url: impl IntoResourceKey) -> Option<usize> {
        let key = url.into_resource_key().ok()?;
        self.shared
            .children
            .lock()
            .iter()
            .position(|c| c.resource.key() == &key)
    }

    pub fn resource_for(&self, url: impl IntoResourceKey) -> Option<Resource> {
        let key = url.into_resource_key().ok()?;
        self.find(&key)
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.shared
            .children
            .lock()
            .iter()
            .map(|c| c.resource.clone())
            .collect()
    }

    pub fn info(&self) -> GroupInfo {
        self.shared.recompute()
    }

    pub fn status(&self) -> ResourceStatus {
        self.info().status
    }

    pub fn progress(&self) -> f32 {
        self.info().progress
    }

    /// Start every child; the first error is returned after all were tried
    pub fn start(&self) -> Result<()> {
        let mut first_error = None;
        for resource in self.resources() {
            if let Err(e) = resource.start() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn cancel(&self) {
        for resource in self.resources() {
            resource.cancel();
        }
    }

    pub fn add_watcher(&self, watcher: Arc<dyn GroupWatcher>) {
        self.shared.watchers.lock().push(watcher);
    }

    pub fn remove_watcher(&self, watcher: &Arc<dyn GroupWatcher>) {
        self.shared
            .watchers
            .lock()
            .retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn find(&self, key: &ResourceKey) -> Option<Resource> {
        self.shared
            .children
            .lock()
            .iter()
            .find(|c| c.resource.key() == key)
            .map(|c| c.resource.clone())
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        self.registry.unregister_watcher(self.watcher_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn child(status: ResourceStatus, expected: i64, downloaded: u64) -> ResourceInfo {
        ResourceInfo {
            url: format!("https://example.com/{expected}/{downloaded}"),
            status,
            content_type: None,
            expected_length: expected,
            downloaded_length: downloaded,
            progress: 0.0,
            loaded_date: None,
            last_access_date: None,
            last_error: None,
            last_response: None,
            expiration_period: Duration::ZERO,
        }
    }

    #[test]
    fn test_progress_over_known_lengths() {
        let info = aggregate(&[
            child(ResourceStatus::InProgress, 100, 50),
            child(ResourceStatus::Downloaded, 200, 200),
        ]);
        assert!((info.progress - 250.0 / 300.0).abs() < 1e-6);
        assert_eq!(info.status, ResourceStatus::InProgress);
        assert_eq!((info.downloaded_length, info.expected_length), (250, 300));
    }

    #[test]
    fn test_unknown_lengths_excluded() {
        let info = aggregate(&[
            child(ResourceStatus::InProgress, -1, 999),
            child(ResourceStatus::InProgress, 100, 25),
        ]);
        assert_eq!(info.progress, 0.25);

        let none_known = aggregate(&[child(ResourceStatus::InProgress, -1, 10)]);
        assert_eq!(none_known.progress, 0.0);
    }

    #[test]
    fn test_status_rules() {
        let all_done = aggregate(&[
            child(ResourceStatus::Downloaded, 1, 1),
            child(ResourceStatus::Downloaded, 2, 2),
        ]);
        assert_eq!(all_done.status, ResourceStatus::Downloaded);

        let mixed = aggregate(&[
            child(ResourceStatus::Downloaded, 1, 1),
            child(ResourceStatus::NotDownloaded, 2, 0),
        ]);
        assert_eq!(mixed.status, ResourceStatus::NotDownloaded);

        assert_eq!(aggregate(&[]).status, ResourceStatus::NotDownloaded);
    }
}
