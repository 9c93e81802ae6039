//! Single-consumer dispatch loop.
//!
//! Exactly one dispatcher task runs per processor.  It is the only writer
//! of the buffer, summarizer, and deduplicator, so those structures need no
//! locks — the single-writer property is structural, not advisory.  Flush
//! workers are short-lived tasks capped by a semaphore; they share only
//! atomics with the dispatcher (last known server time, disabled flag).

use crate::buffer::{EventBuffer, FlushPayload};
use crate::dedupe::UserDeduplicator;
use crate::diagnostics::DiagnosticStore;
use crate::event::{Event, FeatureRequestEvent, IndexEvent, now_millis};
use crate::format::OutputFormatter;
use crate::sender::{DeliveryStatus, EventSender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, error};

/// Upper bound on concurrently running flush workers.
pub(crate) const MAX_FLUSH_WORKERS: u32 = 5;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Everything the front-end can ask the dispatcher to do.
#[derive(Debug)]
pub(crate) enum DispatchMessage {
    Event(Event),
    Flush,
    FlushUsers,
    Diagnostic,
    /// Join all in-flight flush workers, then reply.
    Sync(oneshot::Sender<()>),
    /// Join all in-flight flush workers, reply, and terminate the loop.
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub(crate) struct EventDispatcher<S: EventSender> {
    rx: mpsc::Receiver<DispatchMessage>,
    buffer: EventBuffer,
    deduplicator: Box<dyn UserDeduplicator>,
    formatter: Arc<OutputFormatter>,
    sender: Arc<S>,
    diagnostics: Option<Arc<DiagnosticStore>>,
    inline_users: bool,
    /// `Date` header of the most recent successful delivery (ms).
    last_known_server_time: Arc<AtomicI64>,
    /// Latched by a fatal delivery result; events become no-ops.
    disabled: Arc<AtomicBool>,
    flush_workers: Arc<Semaphore>,
}

impl<S: EventSender> EventDispatcher<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rx: mpsc::Receiver<DispatchMessage>,
        buffer: EventBuffer,
        deduplicator: Box<dyn UserDeduplicator>,
        formatter: Arc<OutputFormatter>,
        sender: Arc<S>,
        diagnostics: Option<Arc<DiagnosticStore>>,
        inline_users: bool,
        last_known_server_time: Arc<AtomicI64>,
        disabled: Arc<AtomicBool>,
    ) -> Self {
        EventDispatcher {
            rx,
            buffer,
            deduplicator,
            formatter,
            sender,
            diagnostics,
            inline_users,
            last_known_server_time,
            disabled,
            flush_workers: Arc::new(Semaphore::new(MAX_FLUSH_WORKERS as usize)),
        }
    }

    /// Consume messages until the queue closes or a shutdown arrives.
    ///
    /// Every handler is infallible; the loop cannot die while the queue is
    /// open.
    pub(crate) async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                DispatchMessage::Event(event) => self.process_event(event),
                DispatchMessage::Flush => self.start_flush(),
                DispatchMessage::FlushUsers => self.deduplicator.flush(),
                DispatchMessage::Diagnostic => self.send_diagnostic_stats(),
                DispatchMessage::Sync(reply) => {
                    self.join_flush_workers().await;
                    let _ = reply.send(());
                }
                DispatchMessage::Shutdown(reply) => {
                    self.join_flush_workers().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("event dispatcher stopped");
    }

    // -----------------------------------------------------------------------
    // Event classification
    // -----------------------------------------------------------------------

    fn process_event(&mut self, event: Event) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }

        // Every feature request contributes to the summary, kept or not.
        self.buffer.add_to_summary(&event);

        let mut keep_full = true;
        let mut debug_copy: Option<Event> = None;
        if let Event::FeatureRequest(fe) = &event {
            // Experiment evaluations are always tracked in full.
            keep_full = fe.track_events
                || fe.reason.as_ref().is_some_and(|r| r.in_experiment);
            if self.should_debug(fe) {
                let mut copy = fe.clone();
                copy.debug = true;
                debug_copy = Some(Event::FeatureRequest(copy));
            }
        }

        match &event {
            // An identify already carries its user; just mark the key seen.
            Event::Identify(ie) => self.deduplicator.notice_user(&ie.user.key),
            Event::FeatureRequest(_) | Event::Custom(_) => {
                // The user payload travels separately unless this very event
                // is about to carry it inline.
                if !(keep_full && self.inline_users) {
                    let user = event.user();
                    if self.deduplicator.process_user(&user.key) {
                        let index = Event::Index(IndexEvent {
                            creation_date: event.creation_date(),
                            user: user.clone(),
                        });
                        self.add_to_buffer(index);
                    } else if let Some(diagnostics) = &self.diagnostics {
                        diagnostics.record_deduplicated_user();
                    }
                }
            }
            Event::Index(_) => {}
        }

        if keep_full {
            self.add_to_buffer(event);
        }
        if let Some(debug_copy) = debug_copy {
            self.add_to_buffer(debug_copy);
        }
    }

    /// Debug copies are emitted only while the deadline is ahead of both the
    /// local clock and the last clock the server reported.  A fast-forward
    /// local clock alone cannot suppress debugging, and a server already
    /// past the window always ends it.
    fn should_debug(&self, fe: &FeatureRequestEvent) -> bool {
        match fe.debug_events_until_date {
            None => false,
            Some(until) => {
                until > self.last_known_server_time.load(Ordering::Relaxed)
                    && until > now_millis()
            }
        }
    }

    fn add_to_buffer(&mut self, event: Event) {
        if !self.buffer.add(event) {
            if let Some(diagnostics) = &self.diagnostics {
                diagnostics.record_dropped_event();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    fn start_flush(&mut self) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }

        // Claim a worker slot before touching the buffer, so an exhausted
        // pool leaves the events in place for the next flush cycle.
        let Ok(permit) = Arc::clone(&self.flush_workers).try_acquire_owned() else {
            debug!("all flush workers busy; deferring flush");
            return;
        };

        let payload = self.buffer.payload();
        if payload.is_empty() {
            return;
        }
        self.buffer.clear();

        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_events_in_batch(payload.events.len());
        }

        let formatter = Arc::clone(&self.formatter);
        let sender = Arc::clone(&self.sender);
        let last_known_server_time = Arc::clone(&self.last_known_server_time);
        let disabled = Arc::clone(&self.disabled);
        tokio::spawn(async move {
            let _permit = permit;
            run_flush(payload, &formatter, &*sender, &last_known_server_time, &disabled).await;
        });
    }

    /// Block until no flush worker is running, by holding every permit.
    async fn join_flush_workers(&mut self) {
        if let Ok(all) = self.flush_workers.acquire_many(MAX_FLUSH_WORKERS).await {
            drop(all);
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    fn send_diagnostic_stats(&self) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(diagnostics) = &self.diagnostics else {
            return;
        };
        let event = diagnostics.stats_event();
        let sender = Arc::clone(&self.sender);
        let disabled = Arc::clone(&self.disabled);
        tokio::spawn(async move {
            match serde_json::to_string(&event.body) {
                Ok(body) => {
                    let result = sender.send_diagnostic(body).await;
                    if result.status == DeliveryStatus::FailedAndMustShutDown {
                        disabled.store(true, Ordering::Relaxed);
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize diagnostic payload"),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Flush worker
// ---------------------------------------------------------------------------

async fn run_flush<S: EventSender>(
    payload: FlushPayload,
    formatter: &OutputFormatter,
    sender: &S,
    last_known_server_time: &AtomicI64,
    disabled: &AtomicBool,
) {
    let (body, count) = match formatter.serialize(&payload) {
        Ok(serialized) => serialized,
        Err(e) => {
            // A serialization failure is a bug in the encoder, not a
            // delivery problem: drop this payload, keep the pipeline up.
            error!(error = %e, "failed to serialize event payload; dropping batch");
            return;
        }
    };

    let result = sender.send_events(body, count).await;
    if let Some(server_time) = result.server_time {
        last_known_server_time.store(server_time, Ordering::Relaxed);
    }
    if result.status == DeliveryStatus::FailedAndMustShutDown {
        disabled.store(true, Ordering::Relaxed);
    }
}
