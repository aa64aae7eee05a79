//! Notification scheduler
//!
//! Listener callbacks run on a small pool of dedicated OS threads fed by an
//! unbounded queue, never on the runtime threads that drive connections.
//! Every listener gets its own queued task per message so a slow or panicking
//! listener cannot hold up the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::capture::CapturedMessage;

/// Receives every captured message
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &CapturedMessage);
}

impl<F> MessageListener for F
where
    F: Fn(&CapturedMessage) + Send + Sync,
{
    fn on_message(&self, message: &CapturedMessage) {
        self(message)
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct NotificationScheduler {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    completed: Arc<AtomicU64>,
    panicked: Arc<AtomicU64>,
}

impl std::fmt::Debug for NotificationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationScheduler")
            .field("listeners", &self.listener_count())
            .field("completed", &self.completed())
            .field("panicked", &self.panicked())
            .finish()
    }
}

impl NotificationScheduler {
    /// Start `worker_count` worker threads (at least one)
    ///
    /// Needs no async runtime; a worker that cannot be spawned is logged and
    /// the pool runs with the rest.
    pub fn start(worker_count: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let completed = Arc::new(AtomicU64::new(0));
        let panicked = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_id in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let completed = Arc::clone(&completed);
            let panicked = Arc::clone(&panicked);
            let spawned = thread::Builder::new()
                .name(format!("wiretap-notify-{}", worker_id))
                .spawn(move || {
                    loop {
                        // Hold the lock only while waiting, never while running a task
                        let task = match rx.lock() {
                            Ok(rx) => rx.recv(),
                            Err(poisoned) => poisoned.into_inner().recv(),
                        };
                        let Ok(task) = task else {
                            break;
                        };
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            panicked.fetch_add(1, Ordering::Relaxed);
                            error!(worker_id, "Notification task panicked");
                        }
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(worker_id, "Notification worker stopped");
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(worker_id, error = %e, "Failed to spawn notification worker"),
            }
        }

        info!(workers = workers.len(), "Notification scheduler started");
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            listeners: RwLock::new(Vec::new()),
            completed,
            panicked,
        })
    }

    /// Queue `task`; returns false once the scheduler is stopped
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match sender.as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => {
                warn!("Notification scheduler stopped, dropping task");
                false
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().unwrap_or_else(|p| p.into_inner()).push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Queue one task per registered listener
    pub fn notify(&self, message: Arc<CapturedMessage>) {
        let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner()).clone();
        for listener in listeners {
            let message = Arc::clone(&message);
            self.submit(move || listener.on_message(&message));
        }
    }

    /// Close the queue and wait for queued tasks to finish
    ///
    /// The worker threads are joined off the async executor.
    pub async fn stop(&self) {
        let workers = self.close();
        if workers.is_empty() {
            return;
        }
        match tokio::task::spawn_blocking(move || join_workers(workers)).await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "Notification join task failed"),
        }
        info!(completed = self.completed(), panicked = self.panicked(), "Notification scheduler stopped");
    }

    /// Blocking variant of [`stop`](Self::stop) for code outside a runtime
    pub fn stop_blocking(&self) {
        let workers = self.close();
        if workers.is_empty() {
            return;
        }
        join_workers(workers);
        info!(completed = self.completed(), panicked = self.panicked(), "Notification scheduler stopped");
    }

    /// Drop the sender and take the worker handles; empty if already stopped
    fn close(&self) -> Vec<JoinHandle<()>> {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        if sender.is_none() {
            return Vec::new();
        }
        drop(sender);
        std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

impl Drop for NotificationScheduler {
    fn drop(&mut self) {
        // Workers exit once the queue is closed; they are not joined here
        self.sender.get_mut().unwrap_or_else(|p| p.into_inner()).take();
    }
}

fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            warn!("Notification worker ended abnormally");
        }
    }
}
