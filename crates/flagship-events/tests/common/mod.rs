// Shared helpers for the integration suite.
#![allow(dead_code)] // not every test file uses every helper

use flagship_events::sender::{DeliveryResult, DeliveryStatus, EventSender};
use flagship_events::{EventsConfig, IdentifyEvent, User};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An in-process sender that records every payload and always succeeds.
#[derive(Clone, Default)]
pub struct CapturingSender {
    pub analytics: Arc<Mutex<Vec<(String, usize)>>>,
    pub diagnostics: Arc<Mutex<Vec<String>>>,
}

impl EventSender for CapturingSender {
    async fn send_events(&self, body: String, event_count: usize) -> DeliveryResult {
        self.analytics.lock().unwrap().push((body, event_count));
        DeliveryResult {
            status: DeliveryStatus::Succeeded,
            server_time: None,
        }
    }

    async fn send_diagnostic(&self, body: String) -> DeliveryResult {
        self.diagnostics.lock().unwrap().push(body);
        DeliveryResult {
            status: DeliveryStatus::Succeeded,
            server_time: None,
        }
    }
}

impl CapturingSender {
    /// Poll until `count` analytics payloads have been captured.
    pub async fn wait_for_analytics(&self, count: usize, timeout: Duration) -> Vec<(String, usize)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let captured = self.analytics.lock().unwrap().clone();
            if captured.len() >= count {
                return captured;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} analytics payloads within {:?}, got {}",
                count,
                timeout,
                captured.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `count` diagnostic payloads have been captured.
    pub async fn wait_for_diagnostics(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let captured = self.diagnostics.lock().unwrap().clone();
            if captured.len() >= count {
                return captured;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} diagnostic payloads within {:?}, got {}",
                count,
                timeout,
                captured.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Config with automatic flushes pushed out of the test's way.
pub fn manual_flush_config() -> EventsConfig {
    EventsConfig {
        sdk_key: "sdk-12345-abcdef".to_owned(),
        flush_interval: Duration::from_secs(3600),
        ..EventsConfig::default()
    }
}

pub fn identify(ts: i64, key: &str) -> IdentifyEvent {
    IdentifyEvent {
        creation_date: ts,
        user: User::with_key(key),
    }
}
