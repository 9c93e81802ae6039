//! Wire serialization of flush payloads.
//!
//! One JSON array per payload: one object per retained event, then a single
//! trailing `kind:"summary"` object when the summary window is non-empty.
//! The encoder walks the typed events and builds the output by hand so that
//! absent optional fields are omitted instead of serialized as null.
//!
//! # User redaction
//! An attribute is redacted when it is in the global private set, in the
//! user's own private set, or when all attributes are configured private.
//! `key` (and the `anonymous` marker) are never redacted.  Redacted names
//! surface in `privateAttrs`, alphabetically ordered.

use crate::buffer::FlushPayload;
use crate::config::EventsConfig;
use crate::event::{CustomEvent, Event, FeatureRequestEvent, User};
use crate::summary::SummaryState;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// OutputFormatter
// ---------------------------------------------------------------------------

/// Serializes a [`FlushPayload`] to the collection service's JSON schema.
#[derive(Debug)]
pub struct OutputFormatter {
    inline_users: bool,
    all_attributes_private: bool,
    global_private_attributes: BTreeSet<String>,
}

impl OutputFormatter {
    pub fn new(config: &EventsConfig) -> Self {
        OutputFormatter {
            inline_users: config.inline_users_in_events,
            all_attributes_private: config.all_attributes_private,
            global_private_attributes: config.private_attribute_names.clone(),
        }
    }

    /// Serialize the payload to its wire form.
    ///
    /// Returns the JSON document and the number of top-level objects
    /// emitted (including the summary, when present).
    pub fn serialize(&self, payload: &FlushPayload) -> Result<(String, usize), serde_json::Error> {
        let mut out: Vec<Value> = Vec::with_capacity(payload.events.len() + 1);
        for event in &payload.events {
            out.push(self.event_json(event));
        }
        if !payload.summary.is_empty() {
            out.push(summary_json(&payload.summary));
        }
        let count = out.len();
        let body = serde_json::to_string(&Value::Array(out))?;
        Ok((body, count))
    }

    // -----------------------------------------------------------------------
    // Per-event encoding
    // -----------------------------------------------------------------------

    fn event_json(&self, event: &Event) -> Value {
        match event {
            Event::FeatureRequest(fe) => self.feature_json(fe),
            Event::Identify(ie) => json!({
                "kind": "identify",
                "creationDate": ie.creation_date,
                "user": self.user_json(&ie.user),
            }),
            Event::Custom(ce) => self.custom_json(ce),
            Event::Index(ix) => json!({
                "kind": "index",
                "creationDate": ix.creation_date,
                "user": self.user_json(&ix.user),
            }),
        }
    }

    fn feature_json(&self, fe: &FeatureRequestEvent) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "kind".to_owned(),
            Value::from(if fe.debug { "debug" } else { "feature" }),
        );
        obj.insert("creationDate".to_owned(), Value::from(fe.creation_date));
        obj.insert("key".to_owned(), Value::from(fe.key.clone()));
        if let Some(version) = fe.version {
            obj.insert("version".to_owned(), Value::from(version));
        }
        if let Some(variation) = fe.variation {
            obj.insert("variation".to_owned(), Value::from(variation));
        }
        obj.insert("value".to_owned(), fe.value.clone());
        if !fe.default.is_null() {
            obj.insert("default".to_owned(), fe.default.clone());
        }
        if let Some(prereq_of) = &fe.prereq_of {
            obj.insert("prereqOf".to_owned(), Value::from(prereq_of.clone()));
        }
        if let Some(reason) = &fe.reason {
            // Reason structures always serialize cleanly; fall back to null
            // rather than poisoning the whole payload.
            obj.insert(
                "reason".to_owned(),
                serde_json::to_value(reason).unwrap_or(Value::Null),
            );
        }
        // Debug copies always carry the full user.
        if fe.debug || self.inline_users {
            obj.insert("user".to_owned(), self.user_json(&fe.user));
        } else {
            obj.insert("userKey".to_owned(), Value::from(fe.user.key.clone()));
        }
        Value::Object(obj)
    }

    fn custom_json(&self, ce: &CustomEvent) -> Value {
        let mut obj = Map::new();
        obj.insert("kind".to_owned(), Value::from("custom"));
        obj.insert("creationDate".to_owned(), Value::from(ce.creation_date));
        obj.insert("key".to_owned(), Value::from(ce.key.clone()));
        if !ce.data.is_null() {
            obj.insert("data".to_owned(), ce.data.clone());
        }
        if let Some(metric_value) = ce.metric_value {
            obj.insert("metricValue".to_owned(), Value::from(metric_value));
        }
        if self.inline_users {
            obj.insert("user".to_owned(), self.user_json(&ce.user));
        } else {
            obj.insert("userKey".to_owned(), Value::from(ce.user.key.clone()));
        }
        Value::Object(obj)
    }

    // -----------------------------------------------------------------------
    // User encoding with redaction
    // -----------------------------------------------------------------------

    fn is_private(&self, user: &User, attribute: &str) -> bool {
        self.all_attributes_private
            || self.global_private_attributes.contains(attribute)
            || user.private_attribute_names.contains(attribute)
    }

    fn user_json(&self, user: &User) -> Value {
        let mut obj = Map::new();
        let mut redacted: BTreeSet<String> = BTreeSet::new();

        obj.insert("key".to_owned(), Value::from(user.key.clone()));

        let built_ins: [(&str, &Option<String>); 8] = [
            ("secondary", &user.secondary),
            ("ip", &user.ip),
            ("country", &user.country),
            ("firstName", &user.first_name),
            ("lastName", &user.last_name),
            ("name", &user.name),
            ("avatar", &user.avatar),
            ("email", &user.email),
        ];
        for (attribute, value) in built_ins {
            if let Some(value) = value {
                if self.is_private(user, attribute) {
                    redacted.insert(attribute.to_owned());
                } else {
                    obj.insert(attribute.to_owned(), Value::from(value.clone()));
                }
            }
        }

        if let Some(anonymous) = user.anonymous {
            obj.insert("anonymous".to_owned(), Value::from(anonymous));
        }

        let mut custom: BTreeMap<String, Value> = BTreeMap::new();
        for (attribute, value) in &user.custom {
            if self.is_private(user, attribute) {
                redacted.insert(attribute.clone());
            } else {
                custom.insert(attribute.clone(), value.clone());
            }
        }
        if !custom.is_empty() {
            obj.insert(
                "custom".to_owned(),
                Value::Object(custom.into_iter().collect()),
            );
        }

        if !redacted.is_empty() {
            obj.insert(
                "privateAttrs".to_owned(),
                Value::Array(redacted.into_iter().map(Value::from).collect()),
            );
        }

        Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// Summary encoding
// ---------------------------------------------------------------------------

fn summary_json(summary: &SummaryState) -> Value {
    let mut features: Map<String, Value> = Map::new();

    for (counter_key, counter) in &summary.counters {
        let flag = features
            .entry(counter_key.key.clone())
            .or_insert_with(|| {
                json!({
                    "default": summary
                        .defaults
                        .get(&counter_key.key)
                        .cloned()
                        .unwrap_or(Value::Null),
                    "counters": [],
                })
            });

        let mut entry = Map::new();
        match counter_key.variation {
            Some(variation) => {
                entry.insert("variation".to_owned(), Value::from(variation));
            }
            None => {
                entry.insert("unknown".to_owned(), Value::from(true));
            }
        }
        entry.insert("value".to_owned(), counter.value.clone());
        if let Some(version) = counter_key.version {
            entry.insert("version".to_owned(), Value::from(version));
        }
        entry.insert("count".to_owned(), Value::from(counter.count));

        if let Some(Value::Array(counters)) = flag.get_mut("counters") {
            counters.push(Value::Object(entry));
        }
    }

    json!({
        "kind": "summary",
        "startDate": summary.start_date,
        "endDate": summary.end_date,
        "features": Value::Object(features),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        EvaluationReason, FeatureRequestEvent, IdentifyEvent, IndexEvent, ReasonKind, User,
    };
    use crate::summary::EventSummarizer;

    fn formatter(config: &EventsConfig) -> OutputFormatter {
        OutputFormatter::new(config)
    }

    fn config() -> EventsConfig {
        EventsConfig {
            sdk_key: "sdk-key".to_owned(),
            ..EventsConfig::default()
        }
    }

    fn feature(user: User) -> FeatureRequestEvent {
        FeatureRequestEvent {
            creation_date: 1000,
            key: "flag".to_owned(),
            user,
            version: Some(11),
            variation: Some(1),
            value: json!("v"),
            default: Value::Null,
            prereq_of: None,
            track_events: true,
            debug_events_until_date: None,
            reason: None,
            debug: false,
        }
    }

    fn serialize_one(f: &OutputFormatter, event: Event) -> Value {
        let payload = FlushPayload {
            events: vec![event],
            summary: SummaryState::default(),
        };
        let (body, count) = f.serialize(&payload).unwrap();
        assert_eq!(count, 1);
        let parsed: Value = serde_json::from_str(&body).unwrap();
        parsed.as_array().unwrap()[0].clone()
    }

    #[test]
    fn identify_event_inlines_the_user() {
        let f = formatter(&config());
        let mut user = User::with_key("u1");
        user.name = Some("Red".to_owned());
        let out = serialize_one(
            &f,
            Event::Identify(IdentifyEvent {
                creation_date: 1000,
                user,
            }),
        );
        assert_eq!(
            out,
            json!({
                "kind": "identify",
                "creationDate": 1000,
                "user": {"key": "u1", "name": "Red"},
            })
        );
    }

    #[test]
    fn feature_event_references_user_by_key_by_default() {
        let f = formatter(&config());
        let out = serialize_one(&f, Event::FeatureRequest(feature(User::with_key("u1"))));
        assert_eq!(out["kind"], "feature");
        assert_eq!(out["userKey"], "u1");
        assert_eq!(out["version"], 11);
        assert_eq!(out["variation"], 1);
        assert_eq!(out["value"], "v");
        assert!(out.get("user").is_none());
        assert!(out.get("default").is_none());
        assert!(out.get("reason").is_none());
    }

    #[test]
    fn feature_event_inlines_user_when_configured() {
        let cfg = EventsConfig {
            inline_users_in_events: true,
            ..config()
        };
        let f = formatter(&cfg);
        let out = serialize_one(&f, Event::FeatureRequest(feature(User::with_key("u1"))));
        assert_eq!(out["user"]["key"], "u1");
        assert!(out.get("userKey").is_none());
    }

    #[test]
    fn debug_event_always_inlines_user() {
        let f = formatter(&config());
        let mut fe = feature(User::with_key("u1"));
        fe.debug = true;
        let out = serialize_one(&f, Event::FeatureRequest(fe));
        assert_eq!(out["kind"], "debug");
        assert_eq!(out["user"]["key"], "u1");
        assert!(out.get("userKey").is_none());
    }

    #[test]
    fn feature_event_includes_populated_optionals() {
        let f = formatter(&config());
        let mut fe = feature(User::with_key("u1"));
        fe.default = json!("fallback");
        fe.prereq_of = Some("parent-flag".to_owned());
        fe.reason = Some(EvaluationReason::from(ReasonKind::TargetMatch));
        let out = serialize_one(&f, Event::FeatureRequest(fe));
        assert_eq!(out["default"], "fallback");
        assert_eq!(out["prereqOf"], "parent-flag");
        assert_eq!(out["reason"]["kind"], "TARGET_MATCH");
    }

    #[test]
    fn custom_event_omits_absent_data_and_metric() {
        let f = formatter(&config());
        let bare = CustomEvent {
            creation_date: 1000,
            key: "click".to_owned(),
            user: User::with_key("u1"),
            data: Value::Null,
            metric_value: None,
        };
        let out = serialize_one(&f, Event::Custom(bare.clone()));
        assert!(out.get("data").is_none());
        assert!(out.get("metricValue").is_none());

        let full = CustomEvent {
            data: json!({"page": "home"}),
            metric_value: Some(2.5),
            ..bare
        };
        let out = serialize_one(&f, Event::Custom(full));
        assert_eq!(out["data"]["page"], "home");
        assert_eq!(out["metricValue"], 2.5);
    }

    #[test]
    fn index_event_inlines_user() {
        let f = formatter(&config());
        let out = serialize_one(
            &f,
            Event::Index(IndexEvent {
                creation_date: 1000,
                user: User::with_key("u1"),
            }),
        );
        assert_eq!(out, json!({"kind": "index", "creationDate": 1000, "user": {"key": "u1"}}));
    }

    #[test]
    fn all_attributes_private_redacts_everything_but_key() {
        let cfg = EventsConfig {
            all_attributes_private: true,
            ..config()
        };
        let f = formatter(&cfg);
        let mut user = User::with_key("u1");
        user.name = Some("Red".to_owned());
        let out = serialize_one(
            &f,
            Event::Identify(IdentifyEvent {
                creation_date: 1000,
                user,
            }),
        );
        assert_eq!(
            out["user"],
            json!({"key": "u1", "privateAttrs": ["name"]})
        );
    }

    #[test]
    fn private_attrs_are_alphabetical_across_builtin_and_custom() {
        let cfg = EventsConfig {
            private_attribute_names: ["name".to_owned(), "zebra".to_owned(), "age".to_owned()]
                .into_iter()
                .collect(),
            ..config()
        };
        let f = formatter(&cfg);
        let mut user = User::with_key("u1");
        user.name = Some("Red".to_owned());
        user.email = Some("red@example.com".to_owned());
        user.custom.insert("zebra".to_owned(), json!(1));
        user.custom.insert("age".to_owned(), json!(30));
        user.custom.insert("city".to_owned(), json!("Oslo"));
        user.private_attribute_names.insert("email".to_owned());

        let out = serialize_one(
            &f,
            Event::Identify(IdentifyEvent {
                creation_date: 1000,
                user,
            }),
        );
        assert_eq!(
            out["user"]["privateAttrs"],
            json!(["age", "email", "name", "zebra"])
        );
        assert_eq!(out["user"]["custom"], json!({"city": "Oslo"}));
    }

    #[test]
    fn anonymous_marker_is_never_redacted() {
        let cfg = EventsConfig {
            all_attributes_private: true,
            ..config()
        };
        let f = formatter(&cfg);
        let mut user = User::with_key("u1");
        user.anonymous = Some(true);
        let out = serialize_one(
            &f,
            Event::Identify(IdentifyEvent {
                creation_date: 1000,
                user,
            }),
        );
        assert_eq!(out["user"]["anonymous"], true);
        assert!(out["user"].get("privateAttrs").is_none());
    }

    #[test]
    fn summary_is_appended_when_window_is_nonempty() {
        let f = formatter(&config());
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&Event::FeatureRequest(feature(User::with_key("u1"))));
        summarizer.summarize(&Event::FeatureRequest(feature(User::with_key("u1"))));

        let payload = FlushPayload {
            events: vec![],
            summary: summarizer.snapshot(),
        };
        let (body, count) = f.serialize(&payload).unwrap();
        assert_eq!(count, 1);
        let parsed: Value = serde_json::from_str(&body).unwrap();
        let summary = &parsed.as_array().unwrap()[0];
        assert_eq!(summary["kind"], "summary");
        assert_eq!(summary["startDate"], 1000);
        assert_eq!(summary["endDate"], 1000);
        let counters = summary["features"]["flag"]["counters"].as_array().unwrap();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0]["count"], 2);
        assert_eq!(counters[0]["variation"], 1);
        assert_eq!(counters[0]["version"], 11);
        assert_eq!(summary["features"]["flag"]["default"], Value::Null);
    }

    #[test]
    fn unknown_variation_is_marked_in_summary() {
        let f = formatter(&config());
        let mut fe = feature(User::with_key("u1"));
        fe.variation = None;
        fe.version = None;
        let mut summarizer = EventSummarizer::new();
        summarizer.summarize(&Event::FeatureRequest(fe));

        let payload = FlushPayload {
            events: vec![],
            summary: summarizer.snapshot(),
        };
        let (body, _) = f.serialize(&payload).unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        let counter = &parsed[0]["features"]["flag"]["counters"][0];
        assert_eq!(counter["unknown"], true);
        assert!(counter.get("variation").is_none());
        assert!(counter.get("version").is_none());
    }

    #[test]
    fn count_includes_events_and_summary() {
        let f = formatter(&config());
        let mut summarizer = EventSummarizer::new();
        let fe = feature(User::with_key("u1"));
        summarizer.summarize(&Event::FeatureRequest(fe.clone()));
        let payload = FlushPayload {
            events: vec![Event::FeatureRequest(fe)],
            summary: summarizer.snapshot(),
        };
        let (_, count) = f.serialize(&payload).unwrap();
        assert_eq!(count, 2);
    }
}
