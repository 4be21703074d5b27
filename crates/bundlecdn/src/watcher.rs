//! Polling-based invalidation of cached bundles
//!
//! The remote store offers no change notifications, so a [`DependencyWatcher`]
//! polls the last-modified timestamp of every source file behind a cached
//! bundle and raises a single notification on the first mismatch.
//!
//! ```text
//!   Armed ──(timestamp mismatch)──▶ Fired ──(dispose)──▶ Disposed
//!     │                                                     ▲
//!     └──────────────────────(dispose)──────────────────────┘
//! ```
//!
//! Each poll tick holds a per-watcher lock, so ticks never overlap. A read
//! failure counts as "unchanged" for that file; the failure streak can be
//! escalated to a forced invalidation via
//! [`WatcherConfig::failure_escalation_threshold`].

use crate::config::DEFAULT_CACHE_POLL_SECS;
use bundlecdn_blobstore::BlobStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Callback invoked once when a watched source changes
pub type ChangeCallback = Box<dyn FnOnce(ChangeNotification) + Send + 'static>;

/// Something that can tell a cache its content went stale
pub trait Invalidatable: Send + Sync {
    /// Register a callback for the (single) change notification.
    ///
    /// If the change already happened the callback runs immediately.
    fn on_source_changed(&self, callback: ChangeCallback);

    /// Whether a change has been detected
    fn is_stale(&self) -> bool;

    /// Stop watching; idempotent
    fn dispose(&self);
}

/// Polling settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Time between poll ticks
    pub poll_interval: Duration,
    /// Consecutive ticks with read failures before a forced invalidation.
    /// `None` never escalates.
    pub failure_escalation_threshold: Option<u32>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_CACHE_POLL_SECS),
            failure_escalation_threshold: None,
        }
    }
}

/// Lifecycle of a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Polling and comparing
    Armed,
    /// Change detected and notified
    Fired,
    /// Stopped for good
    Disposed,
}

/// The tracked content set went stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Timestamp that triggered the change
    pub last_modified: DateTime<Utc>,
}

/// Last known state of one tracked source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    /// Blob path of the source file
    pub path: String,
    /// Container holding the file
    pub container: String,
    /// Last observed modification time; `None` until a read succeeds
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of one poll tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every readable file matched its recorded timestamp
    Unchanged,
    /// A timestamp mismatch fired the notification
    Changed,
    /// Repeated read failures forced the notification
    Escalated,
    /// Watcher already fired or was disposed; nothing compared
    Inactive,
}

struct Status {
    state: WatcherState,
    last_modified: DateTime<Utc>,
    fired: Option<ChangeNotification>,
    callbacks: Vec<ChangeCallback>,
}

struct Shared {
    store: Arc<dyn BlobStore>,
    records: tokio::sync::Mutex<Vec<DependencyRecord>>,
    status: Mutex<Status>,
    notify_tx: watch::Sender<Option<ChangeNotification>>,
    failure_streak: AtomicU32,
    escalation_threshold: Option<u32>,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> WatcherState {
        self.status.lock().state
    }

    /// Armed → Fired; returns false if the watcher was not armed
    fn fire(&self, last_modified: DateTime<Utc>) -> bool {
        let notification = ChangeNotification { last_modified };
        let callbacks = {
            let mut status = self.status.lock();
            if status.state != WatcherState::Armed {
                return false;
            }
            status.state = WatcherState::Fired;
            status.last_modified = last_modified;
            status.fired = Some(notification);
            std::mem::take(&mut status.callbacks)
        };

        self.notify_tx.send_replace(Some(notification));
        for callback in callbacks {
            callback(notification);
        }
        true
    }

    async fn tick(&self) -> TickOutcome {
        if self.state() != WatcherState::Armed || self.cancel.is_cancelled() {
            return TickOutcome::Inactive;
        }

        let mut records = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return TickOutcome::Inactive,
            guard = self.records.lock() => guard,
        };
        // Another tick may have fired while this one waited for the lock
        if self.state() != WatcherState::Armed {
            return TickOutcome::Inactive;
        }

        let mut failures = 0u32;
        for record in records.iter_mut() {
            if self.cancel.is_cancelled() {
                return TickOutcome::Inactive;
            }

            match self
                .store
                .last_modified(&record.container, &record.path)
                .await
            {
                Ok(current) => match record.last_modified {
                    Some(known) if known == current => {}
                    Some(known) => {
                        info!(
                            path = %record.path,
                            previous = %known,
                            current = %current,
                            "Watched source changed"
                        );
                        record.last_modified = Some(current);
                        self.failure_streak.store(0, Ordering::SeqCst);
                        return if self.fire(current) {
                            TickOutcome::Changed
                        } else {
                            TickOutcome::Inactive
                        };
                    }
                    None => {
                        debug!(path = %record.path, baseline = %current, "Adopted first readable timestamp");
                        record.last_modified = Some(current);
                    }
                },
                Err(e) if e.is_not_found() => {
                    if record.last_modified.take().is_some() {
                        info!(path = %record.path, "Watched source was removed");
                        self.failure_streak.store(0, Ordering::SeqCst);
                        return if self.fire(Utc::now()) {
                            TickOutcome::Changed
                        } else {
                            TickOutcome::Inactive
                        };
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        path = %record.path,
                        error = %e,
                        "Failed to read source timestamp, treating as unchanged"
                    );
                }
            }
        }

        if failures == 0 {
            self.failure_streak.store(0, Ordering::SeqCst);
            return TickOutcome::Unchanged;
        }

        let streak = self.failure_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(threshold) = self.escalation_threshold
            && streak >= threshold
        {
            warn!(
                streak,
                threshold, "Poll failures reached escalation threshold, forcing invalidation"
            );
            if self.fire(Utc::now()) {
                return TickOutcome::Escalated;
            }
            return TickOutcome::Inactive;
        }
        debug!(streak, failures, "Poll tick finished with read failures");
        TickOutcome::Unchanged
    }
}

/// Background poller raising one change notification per instance
pub struct DependencyWatcher {
    shared: Arc<Shared>,
    container: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DependencyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyWatcher")
            .field("container", &self.container)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DependencyWatcher {
    /// Build a watcher and record the current timestamp of every path.
    ///
    /// No polling happens until [`spawn_polling`](Self::spawn_polling) is
    /// called; [`start`](Self::start) does both.
    pub async fn new<I, S>(
        store: Arc<dyn BlobStore>,
        container: impl Into<String>,
        paths: I,
        utc_start: DateTime<Utc>,
        config: &WatcherConfig,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let container = container.into();
        let mut records = Vec::new();
        for path in paths {
            let path = path.into();
            let last_modified = match store.last_modified(&container, &path).await {
                Ok(at) => Some(at),
                Err(e) => {
                    warn!(path = %path, error = %e, "No baseline timestamp for watched source");
                    None
                }
            };
            records.push(DependencyRecord {
                path,
                container: container.clone(),
                last_modified,
            });
        }
        debug!(container = %container, files = records.len(), "Dependency watcher armed");

        let (notify_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                store,
                records: tokio::sync::Mutex::new(records),
                status: Mutex::new(Status {
                    state: WatcherState::Armed,
                    last_modified: utc_start,
                    fired: None,
                    callbacks: Vec::new(),
                }),
                notify_tx,
                failure_streak: AtomicU32::new(0),
                escalation_threshold: config.failure_escalation_threshold,
                cancel: CancellationToken::new(),
            }),
            container,
            task: Mutex::new(None),
        }
    }

    /// Build a watcher and start polling at the configured interval
    pub async fn start<I, S>(
        store: Arc<dyn BlobStore>,
        container: impl Into<String>,
        paths: I,
        utc_start: DateTime<Utc>,
        config: &WatcherConfig,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let watcher = Self::new(store, container, paths, utc_start, config).await;
        watcher.spawn_polling(config.poll_interval);
        watcher
    }

    /// Start the background polling task; no-op if already running or disposed
    pub fn spawn_polling(&self, poll_interval: Duration) {
        let mut task = self.task.lock();
        if task.is_some() || self.shared.cancel.is_cancelled() {
            return;
        }

        let period = poll_interval.max(Duration::from_millis(1));
        let shared = Arc::clone(&self.shared);
        let container = self.container.clone();
        *task = Some(tokio::spawn(async move {
            // Baselines were just recorded, so the first comparison waits a full period
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shared.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match shared.tick().await {
                    TickOutcome::Unchanged => {}
                    TickOutcome::Changed | TickOutcome::Escalated | TickOutcome::Inactive => break,
                }
            }
            debug!(container = %container, "Dependency polling stopped");
        }));
    }

    /// Run one poll tick now, serialized with the background task
    #[instrument(name = "dependency_poll", skip(self), fields(container = %self.container))]
    pub async fn poll_once(&self) -> TickOutcome {
        self.shared.tick().await
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> WatcherState {
        self.shared.state()
    }

    /// The watcher's overall last-modified marker
    #[must_use]
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.shared.status.lock().last_modified
    }

    /// Consecutive poll ticks that had read failures
    #[must_use]
    pub fn failure_streak(&self) -> u32 {
        self.shared.failure_streak.load(Ordering::SeqCst)
    }

    /// Snapshot of the tracked files
    pub async fn records(&self) -> Vec<DependencyRecord> {
        self.shared.records.lock().await.clone()
    }

    /// Receiver that observes the notification
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ChangeNotification>> {
        self.shared.notify_tx.subscribe()
    }

    /// Wait for the notification; `None` if the watcher is disposed first
    pub async fn changed(&self) -> Option<ChangeNotification> {
        let mut rx = self.subscribe();
        tokio::select! {
            result = rx.wait_for(Option::is_some) => result.ok().and_then(|n| *n),
            () = self.shared.cancel.cancelled() => self.shared.status.lock().fired,
        }
    }

    /// Stop polling. Safe to call from anywhere, any number of times,
    /// including while a tick is in flight.
    pub fn dispose(&self) {
        {
            let mut status = self.shared.status.lock();
            if status.state == WatcherState::Disposed {
                return;
            }
            status.state = WatcherState::Disposed;
            status.callbacks.clear();
        }
        self.shared.cancel.cancel();
        debug!(container = %self.container, "Dependency watcher disposed");
    }

    /// Dispose and wait for the polling task to finish
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Dependency polling task ended abnormally");
        }
    }
}

impl Invalidatable for DependencyWatcher {
    fn on_source_changed(&self, callback: ChangeCallback) {
        let mut status = self.shared.status.lock();
        match (status.state, status.fired) {
            (WatcherState::Armed, _) => status.callbacks.push(callback),
            (_, Some(notification)) => {
                drop(status);
                callback(notification);
            }
            (_, None) => {
                debug!(container = %self.container, "Callback registered on disposed watcher dropped");
            }
        }
    }

    fn is_stale(&self) -> bool {
        self.shared.status.lock().fired.is_some()
    }

    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl Drop for DependencyWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
