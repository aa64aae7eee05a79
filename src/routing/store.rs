//! Expectation and route collections
//!
//! Both collections are copy-on-write: mutations swap in a new `Arc<Vec<_>>`
//! under a write lock, and matching clones the current `Arc`, so a scan
//! always sees one consistent snapshot.

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::expectation::Expectation;
use super::route::Route;
use crate::message::HttpRequest;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Why a rule set changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    Api,
    FileLoad,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    ExpectationAdded,
    ExpectationRemoved,
    RouteAdded,
    RouteRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub kind: ChangeKind,
    pub id: String,
    pub cause: Cause,
}

/// Receiver half that only yields changes with one of the wanted causes
pub struct ChangeSubscription {
    rx: broadcast::Receiver<ConfigChange>,
    causes: Option<Vec<Cause>>,
}

impl ChangeSubscription {
    /// Next matching change; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<ConfigChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    if self.wants(&change) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Change subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ConfigChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.wants(&change) => return Some(change),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    fn wants(&self, change: &ConfigChange) -> bool {
        self.causes
            .as_ref()
            .map_or(true, |causes| causes.contains(&change.cause))
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ConfigChange>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl ChangeFeed {
    /// Subscribe to changes, optionally restricted to some causes
    pub fn subscribe(&self, causes: Option<Vec<Cause>>) -> ChangeSubscription {
        ChangeSubscription {
            rx: self.tx.subscribe(),
            causes,
        }
    }

    fn publish(&self, kind: ChangeKind, id: &str, cause: Cause) {
        // No subscribers is fine
        let _ = self.tx.send(ConfigChange {
            kind,
            id: id.to_string(),
            cause,
        });
    }
}

/// Expectations ordered by priority (descending), then insertion order
#[derive(Debug, Default)]
pub struct ExpectationStore {
    entries: RwLock<Arc<Vec<Arc<Expectation>>>>,
    feed: ChangeFeed,
}

impl ExpectationStore {
    pub fn new(feed: ChangeFeed) -> Self {
        Self {
            entries: RwLock::default(),
            feed,
        }
    }

    /// Insert, replacing any expectation with the same id; returns the id
    pub fn add(&self, expectation: Expectation, cause: Cause) -> String {
        let id = expectation.id.clone();
        {
            let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let mut next: Vec<Arc<Expectation>> =
                guard.iter().filter(|e| e.id != id).cloned().collect();
            // Stable: after every entry with priority >= the new one
            let pos = next
                .iter()
                .position(|e| e.priority < expectation.priority)
                .unwrap_or(next.len());
            next.insert(pos, Arc::new(expectation));
            *guard = Arc::new(next);
        }
        info!(expectation_id = %id, cause = ?cause, "Expectation added");
        self.feed.publish(ChangeKind::ExpectationAdded, &id, cause);
        id
    }

    pub fn remove(&self, id: &str, cause: Cause) -> bool {
        let removed = {
            let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let next: Vec<Arc<Expectation>> =
                guard.iter().filter(|e| e.id != id).cloned().collect();
            let removed = next.len() != guard.len();
            *guard = Arc::new(next);
            removed
        };
        if removed {
            info!(expectation_id = %id, cause = ?cause, "Expectation removed");
            self.feed.publish(ChangeKind::ExpectationRemoved, id, cause);
        }
        removed
    }

    pub fn clear(&self, cause: Cause) {
        let ids: Vec<String> = self.snapshot().iter().map(|e| e.id.clone()).collect();
        for id in ids {
            self.remove(&id, cause);
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Expectation>>> {
        Arc::clone(&self.entries.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// All expectations matching `request`, in evaluation order
    pub fn candidates(&self, request: &HttpRequest, host: Option<&str>) -> Vec<Arc<Expectation>> {
        self.snapshot()
            .iter()
            .filter(|e| e.matches(request, host))
            .cloned()
            .collect()
    }

    /// First match in evaluation order
    pub fn first_match(&self, request: &HttpRequest, host: Option<&str>) -> Option<Arc<Expectation>> {
        self.snapshot()
            .iter()
            .find(|e| e.matches(request, host))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Static routes in insertion order
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Arc<Vec<Arc<Route>>>>,
    feed: ChangeFeed,
}

impl RouteTable {
    pub fn new(feed: ChangeFeed) -> Self {
        Self {
            routes: RwLock::default(),
            feed,
        }
    }

    pub fn add(&self, route: Route, cause: Cause) -> String {
        let id = route.id.clone();
        {
            let mut guard = self.routes.write().unwrap_or_else(|e| e.into_inner());
            let mut next: Vec<Arc<Route>> = guard.iter().filter(|r| r.id != id).cloned().collect();
            next.push(Arc::new(route));
            *guard = Arc::new(next);
        }
        info!(route_id = %id, cause = ?cause, "Route added");
        self.feed.publish(ChangeKind::RouteAdded, &id, cause);
        id
    }

    pub fn remove(&self, id: &str, cause: Cause) -> bool {
        let removed = {
            let mut guard = self.routes.write().unwrap_or_else(|e| e.into_inner());
            let next: Vec<Arc<Route>> = guard.iter().filter(|r| r.id != id).cloned().collect();
            let removed = next.len() != guard.len();
            *guard = Arc::new(next);
            removed
        };
        if removed {
            info!(route_id = %id, cause = ?cause, "Route removed");
            self.feed.publish(ChangeKind::RouteRemoved, id, cause);
        }
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Route>>> {
        Arc::clone(&self.routes.read().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HttpResponse;
    use crate::routing::expectation::RequestMatcher;

    fn respond(status: u16, priority: i32) -> Expectation {
        Expectation::respond(RequestMatcher::any(), HttpResponse::new(status)).with_priority(priority)
    }

    fn selected_status(store: &ExpectationStore) -> u16 {
        let request = HttpRequest::new("GET", "/");
        match &store.first_match(&request, None).unwrap().action {
            crate::routing::expectation::Action::Respond(resp) => resp.status,
            _ => panic!("expected canned response"),
        }
    }

    #[test]
    fn test_higher_priority_wins_regardless_of_insertion_order() {
        let store = ExpectationStore::default();
        store.add(respond(205, 5), Cause::Api);
        store.add(respond(210, 10), Cause::Api);
        assert_eq!(selected_status(&store), 210);

        let store = ExpectationStore::default();
        store.add(respond(210, 10), Cause::Api);
        store.add(respond(205, 5), Cause::Api);
        assert_eq!(selected_status(&store), 210);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let store = ExpectationStore::default();
        store.add(respond(201, 1), Cause::Api);
        store.add(respond(202, 1), Cause::Api);
        assert_eq!(selected_status(&store), 201);

        let request = HttpRequest::new("GET", "/");
        assert_eq!(store.candidates(&request, None).len(), 2);
    }

    #[test]
    fn test_remove_by_id() {
        let store = ExpectationStore::default();
        let id = store.add(respond(200, 0), Cause::Api);
        assert!(store.remove(&id, Cause::Api));
        assert!(!store.remove(&id, Cause::Api));
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let store = ExpectationStore::default();
        store.add(respond(200, 0), Cause::Api);
        let snapshot = store.snapshot();
        store.add(respond(201, 0), Cause::Api);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_change_subscription_filters_causes() {
        let feed = ChangeFeed::default();
        let store = ExpectationStore::new(feed.clone());
        let mut api_only = feed.subscribe(Some(vec![Cause::Api]));
        let mut all = feed.subscribe(None);

        store.add(respond(200, 0).with_id("from-file"), Cause::FileLoad);
        store.add(respond(200, 0).with_id("from-api"), Cause::Api);

        assert_eq!(api_only.try_recv().unwrap().id, "from-api");
        assert!(api_only.try_recv().is_none());
        assert_eq!(all.try_recv().unwrap().id, "from-file");
        assert_eq!(all.try_recv().unwrap().cause, Cause::Api);
    }

    #[test]
    fn test_route_table_add_remove() {
        let table = RouteTable::default();
        let id = table.add(Route::new("/a", "http://b").unwrap(), Cause::Initializer);
        assert_eq!(table.snapshot().len(), 1);
        assert!(table.remove(&id, Cause::Api));
        assert!(table.snapshot().is_empty());
    }
}
