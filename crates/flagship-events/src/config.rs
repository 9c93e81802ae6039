//! Event pipeline configuration.
//!
//! A plain options struct: the host SDK decides where values come from
//! (file, environment, builder) and hands the finished struct to
//! [`EventProcessor::new`](crate::processor::EventProcessor::new).
//!
//! # Defaults
//! `EventsConfig::default()` matches the hosted collection service's
//! recommended settings; only `sdk_key` has no usable default.

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Product identification baked into `User-Agent` and diagnostic payloads.
pub const SDK_NAME: &str = "flagship-events";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Floor for the diagnostic recording interval.
pub const MIN_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Config struct
// ---------------------------------------------------------------------------

/// All knobs recognized by the event pipeline.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Authorization credential sent with every delivery; its last six
    /// characters also identify this SDK instance in diagnostic payloads.
    pub sdk_key: String,
    /// Bound of both the ingress queue and the output buffer.  Events
    /// beyond it are dropped and counted, never queued to disk.
    pub capacity: usize,
    /// Period of automatic flushes.
    pub flush_interval: Duration,
    /// Redact every non-key user attribute in delivered payloads.
    pub all_attributes_private: bool,
    /// Attribute names redacted for every user.
    pub private_attribute_names: BTreeSet<String>,
    /// Embed the full user in every event instead of emitting separate
    /// index events keyed by `userKey`.
    pub inline_users_in_events: bool,
    /// Bound of the user-key deduplication set (LRU, oldest evicted).
    pub user_keys_capacity: usize,
    /// Period after which the deduplication set is reset.
    pub user_keys_flush_interval: Duration,
    /// Period of diagnostic self-reports; clamped up to
    /// [`MIN_DIAGNOSTIC_RECORDING_INTERVAL`] by [`EventsConfig::validate`].
    pub diagnostic_recording_interval: Duration,
    /// Disable all diagnostic payloads.
    pub diagnostic_opt_out: bool,
    /// Per-attempt HTTP timeout.
    pub http_timeout: Duration,
    /// Base URI for analytics payloads; the sender POSTs to `<base>/bulk`.
    pub events_uri: String,
    /// Base URI for diagnostic payloads; the sender POSTs to
    /// `<base>/diagnostic`.
    pub diagnostic_uri: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            sdk_key: String::new(),
            capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            all_attributes_private: false,
            private_attribute_names: BTreeSet::new(),
            inline_users_in_events: false,
            user_keys_capacity: 1_000,
            user_keys_flush_interval: Duration::from_secs(5 * 60),
            diagnostic_recording_interval: Duration::from_secs(15 * 60),
            diagnostic_opt_out: false,
            http_timeout: Duration::from_secs(10),
            events_uri: "https://events.example.com".to_owned(),
            diagnostic_uri: "https://events.example.com".to_owned(),
        }
    }
}

impl EventsConfig {
    /// Check hard requirements and clamp soft ones.
    ///
    /// Rejects an empty `sdk_key` and a zero `capacity`; raises
    /// `diagnostic_recording_interval` to the floor if set below it.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.sdk_key.is_empty() {
            return Err(ConfigError::MissingField("sdk_key".to_owned()));
        }
        if self.capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "capacity must be at least 1".to_owned(),
            ));
        }
        if self.diagnostic_recording_interval < MIN_DIAGNOSTIC_RECORDING_INTERVAL {
            self.diagnostic_recording_interval = MIN_DIAGNOSTIC_RECORDING_INTERVAL;
        }
        Ok(self)
    }

    /// Last six characters of the SDK key (the whole key when shorter),
    /// used as the non-secret identity in diagnostic payloads.
    pub fn sdk_key_suffix(&self) -> String {
        let chars: Vec<char> = self.sdk_key.chars().collect();
        let start = chars.len().saturating_sub(6);
        chars[start..].iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EventsConfig {
        EventsConfig {
            sdk_key: "sdk-12345-abcdef".to_owned(),
            ..EventsConfig::default()
        }
    }

    #[test]
    fn validate_rejects_empty_sdk_key() {
        let err = EventsConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "sdk_key"));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let cfg = EventsConfig {
            capacity: 0,
            ..base()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn validate_clamps_diagnostic_interval_to_floor() {
        let cfg = EventsConfig {
            diagnostic_recording_interval: Duration::from_secs(5),
            ..base()
        };
        let cfg = cfg.validate().unwrap();
        assert_eq!(
            cfg.diagnostic_recording_interval,
            MIN_DIAGNOSTIC_RECORDING_INTERVAL
        );
    }

    #[test]
    fn sdk_key_suffix_is_last_six_chars() {
        assert_eq!(base().sdk_key_suffix(), "abcdef");
        let short = EventsConfig {
            sdk_key: "key".to_owned(),
            ..EventsConfig::default()
        };
        assert_eq!(short.sdk_key_suffix(), "key");
    }
}
