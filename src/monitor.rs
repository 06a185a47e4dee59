//! Per-server monitoring: a subscriber-counted refresh timer that polls the
//! server's management API, publishes the merged model, and relaunches the
//! process when the API stops answering.
//!
//! The engine is `Idle` while nobody is subscribed and `Monitoring` while at
//! least one [`Subscription`] is alive and the server answers. An unreachable
//! API parks the timer even with observers present; it is re-armed by a
//! successful refresh, a process start, a relaunch or a new observer. Timer
//! creation and teardown happen under one lock together with the subscriber
//! count.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api_client::ApiClient;
use crate::config::ServerDefinition;
use crate::error::{ApiError, ProcessError};

/// Game-specific live data. Replaced or merged by [`GameTitle::poll_once`].
pub trait ServerModel: Default + Clone + Serialize + Send + Sync + 'static {
    fn is_online(&self) -> bool;
    /// Drop whatever implies the server is reachable.
    fn mark_offline(&mut self);
}

/// What one game title plugs into the generic engine.
pub trait GameTitle: Send + Sync + 'static {
    type Model: ServerModel;

    /// One-time setup before monitoring starts (e.g. loading settings).
    fn initialize<'a>(&'a self, definition: &'a ServerDefinition) -> BoxFuture<'a, anyhow::Result<()>>;

    /// One poll cycle. Stops at the first fault; earlier results stay merged.
    fn poll_once<'a>(
        &'a self,
        client: &'a ApiClient,
        model: &'a mut Self::Model,
    ) -> BoxFuture<'a, Result<(), ApiError>>;

    fn on_process_stopped<'a>(&'a self, definition: &'a ServerDefinition) -> BoxFuture<'a, ()>;
}

/// The relaunch half of the process supervisor, as seen by the engine.
pub trait ServerLauncher: Send + Sync + 'static {
    fn relaunch(&self) -> BoxFuture<'_, Result<(), ProcessError>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveModel<M> {
    #[serde(flatten)]
    pub data: M,
    pub is_loading: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl<M: ServerModel> LiveModel<M> {
    pub fn is_online(&self) -> bool {
        self.data.is_online()
    }
}

impl<M: Default> Default for LiveModel<M> {
    fn default() -> Self {
        Self {
            data: M::default(),
            is_loading: false,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated,
    /// The API answered with an error or an unexpected payload.
    Failed,
    /// The API could not be reached.
    Offline,
    /// No API is configured for this server.
    Skipped,
}

#[derive(Default)]
struct Control {
    subscribers: usize,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

fn disarm(id: &str, control: &mut Control) {
    if let Some(timer) = control.timer.take() {
        timer.abort();
        tracing::info!("Monitoring stopped for server '{}'", id);
    }
}

struct Inner<G: GameTitle> {
    definition: ServerDefinition,
    title: G,
    client: Option<ApiClient>,
    launcher: Arc<dyn ServerLauncher>,
    interval: Duration,
    model: Mutex<LiveModel<G::Model>>,
    updates: watch::Sender<LiveModel<G::Model>>,
    control: std::sync::Mutex<Control>,
    restarting: AtomicBool,
    closed: watch::Sender<bool>,
}

pub struct MonitoringEngine<G: GameTitle> {
    inner: Arc<Inner<G>>,
}

impl<G: GameTitle> Clone for MonitoringEngine<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: GameTitle> MonitoringEngine<G> {
    pub fn new(
        definition: ServerDefinition,
        title: G,
        client: Option<ApiClient>,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        let interval = Duration::from_secs(definition.refresh_interval_secs.max(1));
        Self::with_interval(definition, title, client, launcher, interval)
    }

    pub fn with_interval(
        definition: ServerDefinition,
        title: G,
        client: Option<ApiClient>,
        launcher: Arc<dyn ServerLauncher>,
        interval: Duration,
    ) -> Self {
        let (updates, _) = watch::channel(LiveModel::default());
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                definition,
                title,
                client,
                launcher,
                interval,
                model: Mutex::new(LiveModel::default()),
                updates,
                control: std::sync::Mutex::new(Control::default()),
                restarting: AtomicBool::new(false),
                closed,
            }),
        }
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.inner.definition
    }

    pub fn title(&self) -> &G {
        &self.inner.title
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.inner.title.initialize(&self.inner.definition).await
    }

    pub fn state(&self) -> MonitorState {
        if self.inner.lock_control().timer.is_some() {
            MonitorState::Monitoring
        } else {
            MonitorState::Idle
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_control().subscribers
    }

    /// Latest published model.
    pub fn snapshot(&self) -> LiveModel<G::Model> {
        self.inner.updates.borrow().clone()
    }

    /// Register an observer. Moving to `Monitoring` (first observer, or one
    /// joining a parked engine) runs one refresh immediately, then one per
    /// interval.
    pub fn subscribe(&self) -> Subscription<G> {
        let updates = self.inner.updates.subscribe();
        let closed = self.inner.closed.subscribe();
        {
            let mut control = self.inner.lock_control();
            control.subscribers += 1;
            Inner::arm(&self.inner, &mut control, Duration::ZERO);
        }
        Subscription {
            inner: Arc::clone(&self.inner),
            updates,
            closed,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription<G>) {
        drop(subscription);
    }

    /// Run one refresh cycle now, regardless of subscribers. Does not change
    /// the Idle/Monitoring state.
    pub async fn force_refresh(&self) -> RefreshOutcome {
        Inner::run_cycle(&self.inner).await
    }

    /// Called by the owner when the supervised process has started. Resumes a
    /// parked timer, giving the server one interval to bring its API up.
    pub fn process_started(&self) {
        let mut control = self.inner.lock_control();
        // a relaunch in flight re-arms on its own
        if control.subscribers > 0 && !self.inner.restarting.load(Ordering::SeqCst) {
            let delay = self.inner.interval;
            Inner::arm(&self.inner, &mut control, delay);
        }
    }

    /// Called by the owner when the supervised process has exited.
    pub async fn process_stopped(&self) {
        tracing::info!("Server '{}' process stopped", self.inner.definition.id);
        self.inner.title.on_process_stopped(&self.inner.definition).await;
    }

    /// Stop the timer for good and end every subscription. Later
    /// subscriptions no longer arm it.
    pub fn shutdown(&self) {
        {
            let mut control = self.inner.lock_control();
            control.disposed = true;
            disarm(&self.inner.definition.id, &mut control);
        }
        self.inner.closed.send_replace(true);
    }
}

impl<G: GameTitle> Inner<G> {
    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(this: &Arc<Self>, control: &mut Control, first_delay: Duration) {
        if control.timer.is_some() || control.disposed {
            return;
        }
        if this.client.is_none() {
            tracing::debug!("Server '{}' has no API configured, not monitoring", this.definition.id);
            return;
        }
        if !this.definition.monitoring_enabled {
            tracing::debug!("Monitoring disabled for server '{}'", this.definition.id);
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(this);
        let period = this.interval;
        control.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Inner::run_cycle(&inner).await;
            }
        }));
        tracing::info!("Monitoring started for server '{}'", this.definition.id);
    }

    fn release_subscriber(&self) {
        let mut control = self.lock_control();
        control.subscribers = control.subscribers.saturating_sub(1);
        if control.subscribers == 0 {
            disarm(&self.definition.id, &mut control);
        }
    }

    async fn run_cycle(this: &Arc<Self>) -> RefreshOutcome {
        let outcome = this.refresh().await;
        match outcome {
            RefreshOutcome::Offline => {
                // Aborting the timer from inside its own cycle takes effect at
                // its next tick; nothing below awaits.
                disarm(&this.definition.id, &mut this.lock_control());
                if this.definition.auto_restart {
                    Inner::schedule_restart(this);
                }
            }
            RefreshOutcome::Updated => {
                let mut control = this.lock_control();
                if control.subscribers > 0 {
                    Inner::arm(this, &mut control, this.interval);
                }
            }
            RefreshOutcome::Failed | RefreshOutcome::Skipped => {}
        }
        outcome
    }

    async fn refresh(&self) -> RefreshOutcome {
        let Some(client) = self.client.as_ref() else {
            return RefreshOutcome::Skipped;
        };

        let mut cycle = CycleGuard::begin(self.model.lock().await, &self.updates);
        let result = self.title.poll_once(client, &mut cycle.model.data).await;

        match result {
            Ok(()) => {
                cycle.model.last_updated = Some(Utc::now());
                RefreshOutcome::Updated
            }
            Err(e) if e.is_connection() => {
                tracing::warn!(
                    "Could not connect to server '{}' via its API: {}",
                    self.definition.id,
                    e
                );
                cycle.model.data.mark_offline();
                RefreshOutcome::Offline
            }
            Err(e) => {
                tracing::warn!("Error refreshing server '{}': {}", self.definition.id, e);
                RefreshOutcome::Failed
            }
        }
    }

    fn schedule_restart(this: &Arc<Self>) {
        if this.restarting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Restart of server '{}' already in progress", this.definition.id);
            return;
        }

        // Runs on its own task: the timer task that detected the outage has
        // already been aborted.
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            tracing::warn!(
                "Server '{}' was detected offline, attempting to restart",
                inner.definition.id
            );
            let delay = match inner.launcher.relaunch().await {
                Ok(()) => Duration::ZERO,
                Err(ProcessError::AlreadyRunning) => {
                    tracing::info!(
                        "Server '{}' is still running, waiting for its API to answer",
                        inner.definition.id
                    );
                    inner.interval
                }
                Err(e) => {
                    tracing::error!("Restart of server '{}' failed: {}", inner.definition.id, e);
                    inner.interval
                }
            };

            // Cleared under the lock so an outage seen meanwhile is either
            // covered by this re-arm or free to schedule its own restart.
            let mut control = inner.lock_control();
            inner.restarting.store(false, Ordering::SeqCst);
            if control.subscribers > 0 {
                Inner::arm(&inner, &mut control, delay);
            }
        });
    }
}

/// Holds the model for one refresh cycle. Publishes `is_loading = true` on
/// entry and always clears and republishes on exit, including cancellation.
struct CycleGuard<'a, M: ServerModel> {
    model: MutexGuard<'a, LiveModel<M>>,
    updates: &'a watch::Sender<LiveModel<M>>,
}

impl<'a, M: ServerModel> CycleGuard<'a, M> {
    fn begin(mut model: MutexGuard<'a, LiveModel<M>>, updates: &'a watch::Sender<LiveModel<M>>) -> Self {
        model.is_loading = true;
        updates.send_replace(model.clone());
        Self { model, updates }
    }
}

impl<M: ServerModel> Drop for CycleGuard<'_, M> {
    fn drop(&mut self) {
        self.model.is_loading = false;
        self.updates.send_replace(self.model.clone());
    }
}

/// An observer registration. Dropping it unsubscribes.
pub struct Subscription<G: GameTitle> {
    inner: Arc<Inner<G>>,
    updates: watch::Receiver<LiveModel<G::Model>>,
    closed: watch::Receiver<bool>,
}

impl<G: GameTitle> Subscription<G> {
    pub fn current(&self) -> LiveModel<G::Model> {
        self.updates.borrow().clone()
    }

    /// Wait for the next published model. `None` once the engine has been
    /// shut down.
    pub async fn changed(&mut self) -> Option<LiveModel<G::Model>> {
        if *self.closed.borrow() {
            return None;
        }
        let closed = &mut self.closed;
        tokio::select! {
            changed = self.updates.changed() => changed.ok()?,
            _ = async { let _ = closed.wait_for(|done| *done).await; } => return None,
        }
        Some(self.updates.borrow_and_update().clone())
    }
}

impl<G: GameTitle> Drop for Subscription<G> {
    fn drop(&mut self) {
        self.inner.release_subscriber();
    }
}
