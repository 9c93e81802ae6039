//! Rolling aggregation of flag evaluations over one flush window.
//!
//! Instead of retaining every untracked evaluation in full, the pipeline
//! counts them per (flag key, variation, flag version) and remembers the
//! window bounds plus the last default value seen per flag.  The formatter
//! turns a snapshot of this state into the trailing `kind:"summary"` object.

use crate::event::Event;
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

/// One aggregation bucket.  `variation`/`version` of `None` mean the
/// evaluation produced no variation index / the flag was unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub key: String,
    pub variation: Option<u64>,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CounterValue {
    /// Number of evaluations in this bucket; always > 0 for a stored entry.
    pub count: u64,
    /// The evaluation result, recorded when the bucket is first created.
    pub value: Value,
}

/// Aggregate state for one flush window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryState {
    /// Earliest event timestamp in the window (ms); 0 = nothing summarized.
    pub start_date: i64,
    /// Latest event timestamp in the window (ms); 0 = nothing summarized.
    pub end_date: i64,
    pub counters: HashMap<CounterKey, CounterValue>,
    /// Flag key → last default value seen.
    pub defaults: HashMap<String, Value>,
}

impl SummaryState {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Summarizer
// ---------------------------------------------------------------------------

/// Accumulates [`SummaryState`] from the event stream.
///
/// Written only by the dispatcher task; no interior synchronization.
#[derive(Debug, Default)]
pub struct EventSummarizer {
    state: SummaryState,
}

impl EventSummarizer {
    pub fn new() -> Self {
        EventSummarizer::default()
    }

    /// Fold one event into the window.  Non-feature events are ignored.
    pub fn summarize(&mut self, event: &Event) {
        let Event::FeatureRequest(fe) = event else {
            return;
        };

        let state = &mut self.state;
        if state.start_date == 0 || fe.creation_date < state.start_date {
            state.start_date = fe.creation_date;
        }
        if fe.creation_date > state.end_date {
            state.end_date = fe.creation_date;
        }

        state
            .defaults
            .insert(fe.key.clone(), fe.default.clone());

        let key = CounterKey {
            key: fe.key.clone(),
            variation: fe.variation,
            version: fe.version,
        };
        state
            .counters
            .entry(key)
            .and_modify(|c| c.count += 1)
            .or_insert_with(|| CounterValue {
                count: 1,
                value: fe.value.clone(),
            });
    }

    /// Current window state.  The caller owns the snapshot; the live window
    /// keeps accumulating until [`clear`](Self::clear).
    pub fn snapshot(&self) -> SummaryState {
        self.state.clone()
    }

    /// Begin a fresh window: zero dates, empty counters and defaults.
    pub fn clear(&mut self) {
        self.state = SummaryState::default();
    }
}
