//! Periodic self-diagnostics: who this SDK instance is, how it is
//! configured, and what the pipeline has been doing.
//!
//! Two payload kinds go to the diagnostic endpoint: a one-shot
//! `diagnostic-init` describing SDK, platform, and configuration, and a
//! periodic `diagnostic` with counters accumulated since the previous one.
//! Counters are atomics: the dispatcher and buffer side write them, the
//! periodic task snapshots-and-resets them.

use crate::config::{EventsConfig, SDK_NAME, SDK_VERSION};
use crate::event::now_millis;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Non-secret identity attached to every diagnostic payload.
#[derive(Debug, Clone)]
pub struct DiagnosticId {
    pub diagnostic_id: Uuid,
    /// Last six characters of the SDK key; enough to correlate, not to use.
    pub sdk_key_suffix: String,
}

impl DiagnosticId {
    fn to_json(&self) -> Value {
        json!({
            "diagnosticId": self.diagnostic_id.to_string(),
            "sdkKeySuffix": self.sdk_key_suffix,
        })
    }
}

/// One diagnostic payload, ready to serialize and POST.
#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub kind: &'static str,
    pub creation_date: i64,
    /// The complete wire object, `kind` and `creationDate` included.
    pub body: Value,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Accumulates runtime counters between diagnostic payloads.
#[derive(Debug)]
pub struct DiagnosticStore {
    id: DiagnosticId,
    /// Start of the current recording period (ms).
    data_since: AtomicI64,
    dropped_events: AtomicU64,
    deduplicated_users: AtomicU64,
    events_in_last_batch: AtomicU64,
}

impl DiagnosticStore {
    pub fn new(config: &EventsConfig) -> Self {
        DiagnosticStore {
            id: DiagnosticId {
                diagnostic_id: Uuid::new_v4(),
                sdk_key_suffix: config.sdk_key_suffix(),
            },
            data_since: AtomicI64::new(now_millis()),
            dropped_events: AtomicU64::new(0),
            deduplicated_users: AtomicU64::new(0),
            events_in_last_batch: AtomicU64::new(0),
        }
    }

    /// Start of the current recording period (ms).
    pub fn data_since(&self) -> i64 {
        self.data_since.load(Ordering::Relaxed)
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated_user(&self) {
        self.deduplicated_users.fetch_add(1, Ordering::Relaxed);
    }

    /// Size of the most recent flush payload, in events.
    pub fn record_events_in_batch(&self, count: usize) {
        self.events_in_last_batch
            .store(count as u64, Ordering::Relaxed);
    }

    /// The `diagnostic-init` payload: identity, SDK, platform, and the
    /// configuration snapshot the collection service expects.
    pub fn init_event(&self, config: &EventsConfig) -> DiagnosticEvent {
        let creation_date = now_millis();
        let body = json!({
            "kind": "diagnostic-init",
            "id": self.id.to_json(),
            "creationDate": creation_date,
            "sdk": {
                "name": SDK_NAME,
                "version": SDK_VERSION,
            },
            "platform": {
                "name": "rust",
                "osName": std::env::consts::OS,
                "osArch": std::env::consts::ARCH,
            },
            "configuration": {
                "eventsCapacity": config.capacity,
                "eventsFlushIntervalMillis": config.flush_interval.as_millis() as u64,
                "allAttributesPrivate": config.all_attributes_private,
                "inlineUsersInEvents": config.inline_users_in_events,
                "userKeysCapacity": config.user_keys_capacity,
                "userKeysFlushIntervalMillis": config.user_keys_flush_interval.as_millis() as u64,
                "diagnosticRecordingIntervalMillis":
                    config.diagnostic_recording_interval.as_millis() as u64,
                "socketTimeoutMillis": config.http_timeout.as_millis() as u64,
                "customEventsURI":
                    config.events_uri != EventsConfig::default().events_uri,
            },
        });
        DiagnosticEvent {
            kind: "diagnostic-init",
            creation_date,
            body,
        }
    }

    /// The periodic `diagnostic` payload.  Taking it zeroes the counters
    /// and starts the next recording period at this payload's timestamp.
    pub fn stats_event(&self) -> DiagnosticEvent {
        let creation_date = now_millis();
        let data_since = self.data_since.swap(creation_date, Ordering::Relaxed);
        let dropped = self.dropped_events.swap(0, Ordering::Relaxed);
        let deduplicated = self.deduplicated_users.swap(0, Ordering::Relaxed);
        let in_last_batch = self.events_in_last_batch.swap(0, Ordering::Relaxed);
        let body = json!({
            "kind": "diagnostic",
            "id": self.id.to_json(),
            "creationDate": creation_date,
            "dataSinceDate": data_since,
            "droppedEvents": dropped,
            "deduplicatedUsers": deduplicated,
            "eventsInLastBatch": in_last_batch,
        });
        DiagnosticEvent {
            kind: "diagnostic",
            creation_date,
            body,
        }
    }

    /// A stats payload recorded by a previous run but never delivered.
    ///
    /// The in-memory store has none; hosts that persist diagnostics can
    /// wrap the store and replay the prior run's final payload at startup.
    pub fn take_persisted_unsent(&self) -> Option<DiagnosticEvent> {
        None
    }
}
