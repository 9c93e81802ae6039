//! Non-blocking front-end of the event pipeline.
//!
//! Owns the ingress queue, the dispatcher task, and all periodic timers.
//! Every public operation returns immediately: events that cannot be
//! queued are dropped (with one warning per full transition), and all
//! failure reporting happens through logs and diagnostic counters.
//!
//! Must be constructed inside a tokio runtime; construction spawns the
//! dispatcher and timer tasks.

use crate::buffer::EventBuffer;
use crate::config::EventsConfig;
use crate::dedupe::{LruUserDeduplicator, UserDeduplicator};
use crate::diagnostics::DiagnosticStore;
use crate::dispatcher::{DispatchMessage, EventDispatcher};
use crate::event::{Event, now_millis};
use crate::format::OutputFormatter;
use crate::sender::{DeliveryStatus, EventSender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// EventProcessor
// ---------------------------------------------------------------------------

/// Handle through which the host application feeds the pipeline.
pub struct EventProcessor {
    tx: mpsc::Sender<DispatchMessage>,
    offline: Arc<AtomicBool>,
    /// Set while the ingress queue is rejecting events; cleared by a
    /// successful submit.  Gates the warning to one per transition.
    input_capacity_exceeded: AtomicBool,
    timers: Vec<JoinHandle<()>>,
    diagnostic_timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    disable_watcher: Option<JoinHandle<()>>,
}

impl EventProcessor {
    /// Start the pipeline: dispatcher task, flush/user-keys/diagnostic
    /// timers, and (unless diagnostics are absent) the eager startup
    /// diagnostic payloads.
    ///
    /// `diagnostic_disable` is an optional external toggle: `true` stops
    /// diagnostic payloads, `false` re-arms the timer and re-sends the
    /// init payload (once per process lifetime).
    pub fn new<S: EventSender>(
        config: EventsConfig,
        sender: S,
        diagnostics: Option<Arc<DiagnosticStore>>,
        diagnostic_disable: Option<watch::Receiver<bool>>,
    ) -> Self {
        let config = Arc::new(config);
        let sender = Arc::new(sender);
        let diagnostics = if config.diagnostic_opt_out {
            None
        } else {
            diagnostics
        };
        let (tx, rx) = mpsc::channel(config.capacity.max(1));

        let offline = Arc::new(AtomicBool::new(false));
        let last_known_server_time = Arc::new(AtomicI64::new(0));
        let disabled = Arc::new(AtomicBool::new(false));

        let deduplicator = LruUserDeduplicator::new(
            config.user_keys_capacity,
            Some(config.user_keys_flush_interval),
        );
        let user_keys_interval = deduplicator.flush_interval();

        let dispatcher = EventDispatcher::new(
            rx,
            EventBuffer::new(config.capacity),
            Box::new(deduplicator),
            Arc::new(OutputFormatter::new(&config)),
            Arc::clone(&sender),
            diagnostics.clone(),
            config.inline_users_in_events,
            last_known_server_time,
            Arc::clone(&disabled),
        );
        tokio::spawn(dispatcher.run());

        let mut timers = Vec::new();
        timers.push(spawn_flush_timer(
            tx.clone(),
            config.flush_interval,
            Arc::clone(&offline),
        ));
        if let Some(interval) = user_keys_interval {
            timers.push(spawn_user_keys_timer(tx.clone(), interval));
        }

        let (diagnostic_timer, disable_watcher) = start_diagnostics(
            &tx,
            &config,
            &sender,
            diagnostics,
            diagnostic_disable,
            &disabled,
        );

        EventProcessor {
            tx,
            offline,
            input_capacity_exceeded: AtomicBool::new(false),
            timers,
            diagnostic_timer,
            disable_watcher,
        }
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Enqueue an event.  Never blocks; past queue capacity the event is
    /// dropped with one warning per not-full → full transition.
    pub fn submit(&self, event: Event) {
        match self.tx.try_send(DispatchMessage::Event(event)) {
            Ok(()) => {
                self.input_capacity_exceeded.store(false, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                if !self.input_capacity_exceeded.swap(true, Ordering::Relaxed) {
                    warn!("event queue is full; dropping events until it drains");
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event pipeline is shut down; discarding event");
            }
        }
    }

    /// Ask for a flush of everything buffered so far.  No-op while offline.
    pub fn flush(&self) {
        if self.offline.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.try_send(DispatchMessage::Flush);
    }

    /// Suppress scheduled flushes (submissions still queue for later).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Wait until the dispatcher has handled everything queued before this
    /// call and no flush worker is in flight.
    pub async fn wait_until_inactive(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(DispatchMessage::Sync(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Flush remaining events, wait for in-flight deliveries, and stop.
    pub async fn close(mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(watcher) = self.disable_watcher.take() {
            watcher.abort();
        }
        if let Some(timer) = self.diagnostic_timer.lock().await.take() {
            timer.abort();
        }
        let _ = self.tx.send(DispatchMessage::Flush).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(DispatchMessage::Shutdown(reply_tx))
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics wiring
// ---------------------------------------------------------------------------

/// Fire the eager startup payloads, arm the periodic timer, and (when a
/// disable signal is supplied) watch it to tear down / re-arm the timer.
fn start_diagnostics<S: EventSender>(
    tx: &mpsc::Sender<DispatchMessage>,
    config: &Arc<EventsConfig>,
    sender: &Arc<S>,
    diagnostics: Option<Arc<DiagnosticStore>>,
    diagnostic_disable: Option<watch::Receiver<bool>>,
    disabled: &Arc<AtomicBool>,
) -> (Arc<Mutex<Option<JoinHandle<()>>>>, Option<JoinHandle<()>>) {
    let Some(store) = diagnostics else {
        return (Arc::new(Mutex::new(None)), None);
    };

    // Replay the prior run's unsent stats, if the store kept any.
    if let Some(prior) = store.take_persisted_unsent() {
        spawn_diagnostic_send(Arc::clone(sender), prior.body, Arc::clone(disabled));
    }
    spawn_diagnostic_send(
        Arc::clone(sender),
        store.init_event(config).body,
        Arc::clone(disabled),
    );

    let timer = spawn_diagnostic_timer(
        tx.clone(),
        config.diagnostic_recording_interval,
        store.data_since(),
    );
    let timer_slot = Arc::new(Mutex::new(Some(timer)));

    let mut watcher = None;
    if let Some(mut signal) = diagnostic_disable {
        let timer_slot = Arc::clone(&timer_slot);
        let tx = tx.clone();
        let sender = Arc::clone(sender);
        let config = Arc::clone(config);
        let disabled = Arc::clone(disabled);
        watcher = Some(tokio::spawn(async move {
            let mut init_resent = false;
            while signal.changed().await.is_ok() {
                let disable = *signal.borrow();
                // Always drop the old timer first so two can never race.
                let mut guard = timer_slot.lock().await;
                if let Some(timer) = guard.take() {
                    timer.abort();
                }
                if !disable {
                    *guard = Some(spawn_diagnostic_timer(
                        tx.clone(),
                        config.diagnostic_recording_interval,
                        store.data_since(),
                    ));
                    if !init_resent {
                        init_resent = true;
                        spawn_diagnostic_send(
                            Arc::clone(&sender),
                            store.init_event(&config).body,
                            Arc::clone(&disabled),
                        );
                    }
                }
            }
        }));
    }

    (timer_slot, watcher)
}

// ---------------------------------------------------------------------------
// Timer tasks
// ---------------------------------------------------------------------------

fn spawn_flush_timer(
    tx: mpsc::Sender<DispatchMessage>,
    period: Duration,
    offline: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if offline.load(Ordering::Relaxed) {
                continue;
            }
            if tx.send(DispatchMessage::Flush).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_user_keys_timer(tx: mpsc::Sender<DispatchMessage>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(DispatchMessage::FlushUsers).await.is_err() {
                break;
            }
        }
    })
}

/// The first firing lands one full period after `data_since`, so a cold
/// start never defers past one interval and a warm re-arm keeps cadence.
fn spawn_diagnostic_timer(
    tx: mpsc::Sender<DispatchMessage>,
    period: Duration,
    data_since: i64,
) -> JoinHandle<()> {
    let elapsed = Duration::from_millis((now_millis() - data_since).max(0) as u64);
    let initial_delay = period.saturating_sub(elapsed).min(period);
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        loop {
            if tx.send(DispatchMessage::Diagnostic).await.is_err() {
                break;
            }
            tokio::time::sleep(period).await;
        }
    })
}

fn spawn_diagnostic_send<S: EventSender>(
    sender: Arc<S>,
    body: serde_json::Value,
    disabled: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        match serde_json::to_string(&body) {
            Ok(json) => {
                let result = sender.send_diagnostic(json).await;
                if result.status == DeliveryStatus::FailedAndMustShutDown {
                    disabled.store(true, Ordering::Relaxed);
                }
            }
            Err(e) => debug!(error = %e, "failed to serialize diagnostic payload"),
        }
    });
}
