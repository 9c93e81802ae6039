//! HTTP delivery of event payloads.
//!
//! # Protocol
//! Analytics payloads POST to `<events-uri>/bulk` with the schema-version
//! header and a per-payload UUID; the payload ID is reused across the retry
//! so the server can deduplicate.  Diagnostic payloads POST to
//! `<diagnostic-uri>/diagnostic` with neither header.
//!
//! # Retry policy
//! At most two attempts, one second apart.  Recoverable: transport errors,
//! timeouts, 400/408/429 and 5xx.  Fatal (no retry, delivery must stop for
//! good): 401/403.  Other 4xx fail without retry.  An external cancel
//! signal aborts immediately without retry.

use crate::config::{EventsConfig, SDK_NAME, SDK_VERSION};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, DATE, USER_AGENT};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
const PAYLOAD_ID_HEADER: &str = "X-LaunchDarkly-Payload-ID";
const EVENT_SCHEMA_VERSION: &str = "3";

const MAX_ATTEMPTS: u32 = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Succeeded,
    Failed,
    /// Credentials were rejected; the processor must disable itself.
    FailedAndMustShutDown,
}

/// Outcome of one delivery (including its retry, if any).
#[derive(Debug, Clone, Copy)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    /// The server's `Date` response header (epoch ms), when present on a
    /// successful response.
    pub server_time: Option<i64>,
}

impl DeliveryResult {
    fn failed() -> Self {
        DeliveryResult {
            status: DeliveryStatus::Failed,
            server_time: None,
        }
    }

    fn fatal() -> Self {
        DeliveryResult {
            status: DeliveryStatus::FailedAndMustShutDown,
            server_time: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Delivery seam between the dispatcher and the network.
///
/// Implementations must never panic; every failure mode is a
/// [`DeliveryResult`].
pub trait EventSender: Send + Sync + 'static {
    /// Deliver one analytics payload (a JSON array of `event_count`
    /// top-level objects).
    fn send_events(
        &self,
        body: String,
        event_count: usize,
    ) -> impl Future<Output = DeliveryResult> + Send;

    /// Deliver one diagnostic payload (a single JSON object).
    fn send_diagnostic(&self, body: String) -> impl Future<Output = DeliveryResult> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// The production sender: reqwest client, per-attempt timeout, cancel signal.
#[derive(Debug)]
pub struct HttpEventSender {
    http: reqwest::Client,
    sdk_key: String,
    user_agent: String,
    events_uri: String,
    diagnostic_uri: String,
    retry_delay: Duration,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl HttpEventSender {
    pub fn new(config: &EventsConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(HttpEventSender {
            http,
            sdk_key: config.sdk_key.clone(),
            user_agent: format!("{SDK_NAME}/{SDK_VERSION}"),
            events_uri: format!("{}/bulk", config.events_uri.trim_end_matches('/')),
            diagnostic_uri: format!("{}/diagnostic", config.diagnostic_uri.trim_end_matches('/')),
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel_tx,
            cancel_rx,
        })
    }

    /// Override the inter-attempt delay.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Abort any in-flight or future deliveries without retry.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    async fn deliver(&self, uri: &str, body: &str, payload_id: Option<&str>) -> DeliveryResult {
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::select! {
                    () = tokio::time::sleep(self.retry_delay) => {}
                    () = cancelled(self.cancel_rx.clone()) => {
                        debug!("delivery cancelled during retry delay");
                        return DeliveryResult::failed();
                    }
                }
            }

            let mut request = self
                .http
                .post(uri)
                .header(AUTHORIZATION, &self.sdk_key)
                .header(USER_AGENT, &self.user_agent)
                .header(CONTENT_TYPE, "application/json");
            if let Some(id) = payload_id {
                request = request
                    .header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION)
                    .header(PAYLOAD_ID_HEADER, id);
            }

            let response = tokio::select! {
                r = request.body(body.to_owned()).send() => r,
                () = cancelled(self.cancel_rx.clone()) => {
                    debug!("delivery cancelled mid-request");
                    return DeliveryResult::failed();
                }
            };

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return DeliveryResult {
                            status: DeliveryStatus::Succeeded,
                            server_time: parse_server_date(&response),
                        };
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        warn!(
                            status = %status,
                            "event delivery rejected; shutting event delivery down"
                        );
                        return DeliveryResult::fatal();
                    }
                    if !is_recoverable(status) {
                        warn!(status = %status, "event delivery failed; dropping payload");
                        return DeliveryResult::failed();
                    }
                    warn!(
                        status = %status,
                        attempt = attempt + 1,
                        "event delivery failed"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        timeout = e.is_timeout(),
                        attempt = attempt + 1,
                        "event delivery failed"
                    );
                }
            }
        }
        warn!("event delivery failed after retry; dropping payload");
        DeliveryResult::failed()
    }
}

impl EventSender for HttpEventSender {
    async fn send_events(&self, body: String, event_count: usize) -> DeliveryResult {
        let payload_id = Uuid::new_v4().to_string();
        debug!(
            events = event_count,
            payload_id = %payload_id,
            "delivering analytics payload"
        );
        self.deliver(&self.events_uri, &body, Some(&payload_id))
            .await
    }

    async fn send_diagnostic(&self, body: String) -> DeliveryResult {
        debug!("delivering diagnostic payload");
        self.deliver(&self.diagnostic_uri, &body, None).await
    }
}

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

/// Worth a second attempt?  400/408/429 and every 5xx are; all other 4xx
/// are permanent for this payload.
fn is_recoverable(status: StatusCode) -> bool {
    match status.as_u16() {
        400 | 408 | 429 => true,
        s if (400..500).contains(&s) => false,
        _ => true,
    }
}

/// Resolves when the cancel flag flips to true; never resolves otherwise.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender kept alive by HttpEventSender; unreachable in practice.
            std::future::pending::<()>().await;
        }
    }
}

fn parse_server_date(response: &reqwest::Response) -> Option<i64> {
    let date = response.headers().get(DATE)?.to_str().ok()?;
    chrono::DateTime::parse_from_rfc2822(date)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
