//! Retained capture traffic under a byte budget

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::element::{CapturedElement, CapturedMessage, Endpoints};

struct Retained {
    messages: VecDeque<Arc<CapturedMessage>>,
    bytes: usize,
}

/// Captured messages ordered by sequence number
///
/// Once the retained bytes exceed the budget the oldest messages are dropped
/// first. The newest message is always kept.
pub struct CaptureStore {
    retained: Mutex<Retained>,
    budget: usize,
    next_sequence: AtomicU64,
    latest: watch::Sender<u64>,
}

impl std::fmt::Debug for CaptureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStore")
            .field("budget", &self.budget)
            .field("len", &self.len())
            .field("bytes", &self.bytes())
            .finish()
    }
}

impl CaptureStore {
    pub fn new(budget: usize) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            retained: Mutex::new(Retained {
                messages: VecDeque::new(),
                bytes: 0,
            }),
            budget,
            next_sequence: AtomicU64::new(1),
            latest,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Retained> {
        self.retained.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Assign the next sequence number and retain the message
    pub fn push(&self, element: CapturedElement, endpoints: Endpoints) -> Arc<CapturedMessage> {
        self.push_message(CapturedMessage {
            sequence_number: 0,
            uuid: Uuid::new_v4(),
            endpoints,
            timestamp: Utc::now(),
            element,
        })
    }

    /// Retain a message built elsewhere (e.g. read from a capture file),
    /// renumbering it into this store's sequence
    pub fn push_message(&self, mut message: CapturedMessage) -> Arc<CapturedMessage> {
        let size = message.size();
        let mut retained = self.lock();
        message.sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let message = Arc::new(message);
        retained.messages.push_back(Arc::clone(&message));
        retained.bytes += size;

        let mut evicted = 0usize;
        // The newest message always stays, even when it alone exceeds the budget
        while retained.bytes > self.budget && retained.messages.len() > 1 {
            if let Some(oldest) = retained.messages.pop_front() {
                retained.bytes -= oldest.size();
                evicted += 1;
            }
        }
        self.latest.send_replace(message.sequence_number);
        drop(retained);

        if evicted > 0 {
            debug!(evicted, budget = self.budget, "Capture budget exceeded, dropped oldest messages");
        }
        if size > self.budget {
            warn!(size, budget = self.budget, "Single captured message exceeds capture budget");
        }
        message
    }

    pub fn messages(&self) -> Vec<Arc<CapturedMessage>> {
        self.lock().messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<Arc<CapturedMessage>> {
        self.lock().messages.back().cloned()
    }

    pub fn find_by_seq(&self, sequence_number: u64) -> Option<Arc<CapturedMessage>> {
        let retained = self.lock();
        retained
            .messages
            .binary_search_by_key(&sequence_number, |m| m.sequence_number)
            .ok()
            .and_then(|idx| retained.messages.get(idx).cloned())
    }

    /// Wait until a message newer than any present at call time arrives
    pub async fn wait_for_next(&self, timeout: Duration) -> Option<Arc<CapturedMessage>> {
        let mut rx = self.latest.subscribe();
        let baseline = *rx.borrow_and_update();

        let wait = async {
            loop {
                rx.changed().await.ok()?;
                let latest = *rx.borrow_and_update();
                if latest > baseline {
                    // The first newer message may already be evicted
                    return self.find_by_seq(baseline + 1).or_else(|| self.last());
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub fn clear(&self) {
        let mut retained = self.lock();
        retained.messages.clear();
        retained.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}
