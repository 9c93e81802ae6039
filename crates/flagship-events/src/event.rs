//! Analytics event model: input events, users, and evaluation reasons.
//!
//! Events are a tagged union; the only two places that discriminate are the
//! dispatcher (retention classification) and the output formatter (wire
//! serialization).  Everything in between moves whole `Event` values.
//!
//! Timestamps are epoch milliseconds (`i64`) throughout.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// The subject of flag evaluations and custom events.
///
/// Immutable after construction: build with a struct literal (or
/// [`User::with_key`]) and never mutate a user that has been submitted.
/// `key` is required and non-empty for non-anonymous users.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub key: String,
    pub secondary: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub anonymous: Option<bool>,
    /// Custom attribute name → arbitrary JSON value.
    pub custom: BTreeMap<String, Value>,
    /// Attribute names this user wants redacted, in addition to the global set.
    pub private_attribute_names: BTreeSet<String>,
}

impl User {
    /// A user with only a key set.
    pub fn with_key(key: impl Into<String>) -> Self {
        User {
            key: key.into(),
            ..User::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation reasons
// ---------------------------------------------------------------------------

/// Why an evaluation produced the variation it did.
///
/// Serialized inline into feature/debug events as an object with a `kind`
/// discriminator, e.g. `{"kind":"RULE_MATCH","ruleIndex":1,"ruleId":"r"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReason {
    #[serde(flatten)]
    pub kind: ReasonKind,
    /// True when the evaluation was part of an experiment; omitted when false.
    #[serde(rename = "inExperiment", skip_serializing_if = "std::ops::Not::not")]
    pub in_experiment: bool,
    #[serde(rename = "bigSegmentsStatus", skip_serializing_if = "Option::is_none")]
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl EvaluationReason {
    pub fn off() -> Self {
        ReasonKind::Off.into()
    }

    pub fn fallthrough() -> Self {
        ReasonKind::Fallthrough.into()
    }
}

impl From<ReasonKind> for EvaluationReason {
    fn from(kind: ReasonKind) -> Self {
        EvaluationReason {
            kind,
            in_experiment: false,
            big_segments_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ReasonKind {
    Off,
    Fallthrough,
    TargetMatch,
    RuleMatch { rule_index: u64, rule_id: String },
    PrerequisiteFailed { prerequisite_key: String },
    Error { error_kind: EvaluationErrorKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationErrorKind {
    ClientNotReady,
    FlagNotFound,
    MalformedFlag,
    UserNotSpecified,
    WrongType,
    Exception,
}

/// Health of the big-segments store at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    NotConfigured,
    StoreError,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An input event accepted by the pipeline.
///
/// `Index` is internal: it is emitted by the dispatcher to carry a full user
/// payload once per deduplication window, never by calling code.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FeatureRequest(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    Index(IndexEvent),
}

impl Event {
    pub fn creation_date(&self) -> i64 {
        match self {
            Event::FeatureRequest(e) => e.creation_date,
            Event::Identify(e) => e.creation_date,
            Event::Custom(e) => e.creation_date,
            Event::Index(e) => e.creation_date,
        }
    }

    pub fn user(&self) -> &User {
        match self {
            Event::FeatureRequest(e) => &e.user,
            Event::Identify(e) => &e.user,
            Event::Custom(e) => &e.user,
            Event::Index(e) => &e.user,
        }
    }
}

/// The result of a single flag evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRequestEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
    /// Flag version; `None` when the flag was unknown.
    pub version: Option<u64>,
    /// 0-based index of the variation served; `None` when no variation applied.
    pub variation: Option<u64>,
    pub value: Value,
    pub default: Value,
    /// Set when this evaluation ran as a prerequisite of another flag.
    pub prereq_of: Option<String>,
    /// Keep a full-fidelity copy of this event in the output.
    pub track_events: bool,
    /// Emit debug copies while this deadline (ms) is in the future.
    pub debug_events_until_date: Option<i64>,
    /// Populated when the caller evaluated in with-reasons mode, or the
    /// evaluation was part of an experiment.
    pub reason: Option<EvaluationReason>,
    /// True only on the debug copy the dispatcher makes.
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifyEvent {
    pub creation_date: i64,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub creation_date: i64,
    pub key: String,
    pub user: User,
    /// Arbitrary JSON payload; `Value::Null` means absent.
    pub data: Value,
    pub metric_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEvent {
    pub creation_date: i64,
    pub user: User,
}
