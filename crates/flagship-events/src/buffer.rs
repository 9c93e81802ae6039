//! Bounded output buffer: retained events plus the summary window.
//!
//! Owned exclusively by the dispatcher task.  `add` never blocks: past
//! capacity, events are dropped and counted.  A flush snapshots the buffer
//! into a [`FlushPayload`] and clears it; the payload is the sole owner of
//! its events from then on.

use crate::event::Event;
use crate::summary::{EventSummarizer, SummaryState};
use tracing::warn;

// ---------------------------------------------------------------------------
// FlushPayload
// ---------------------------------------------------------------------------

/// Immutable snapshot handed to a flush worker.
#[derive(Debug, Clone)]
pub struct FlushPayload {
    pub events: Vec<Event>,
    pub summary: SummaryState,
}

impl FlushPayload {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.summary.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// Bounded event list + drop counter + summarizer.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    events: Vec<Event>,
    summarizer: EventSummarizer,
    /// Events dropped since the buffer was created (monotonic).
    dropped: u64,
    /// Set while the buffer is rejecting events; cleared by a successful
    /// append.  Gates the capacity warning to one per transition.
    exceeded: bool,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        EventBuffer {
            capacity,
            events: Vec::new(),
            summarizer: EventSummarizer::new(),
            dropped: 0,
            exceeded: false,
        }
    }

    /// Append an event, or drop it when the buffer is full.
    ///
    /// Returns whether the event was stored.  The capacity warning fires
    /// once per not-full → full transition.
    pub fn add(&mut self, event: Event) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            if !self.exceeded {
                self.exceeded = true;
                warn!(
                    capacity = self.capacity,
                    "event buffer is full; dropping events until the next flush"
                );
            }
            return false;
        }
        self.exceeded = false;
        self.events.push(event);
        true
    }

    /// Fold an event into the summary window without retaining it.
    pub fn add_to_summary(&mut self, event: &Event) {
        self.summarizer.summarize(event);
    }

    /// Snapshot retained events and the summary window.
    pub fn payload(&self) -> FlushPayload {
        FlushPayload {
            events: self.events.clone(),
            summary: self.summarizer.snapshot(),
        }
    }

    /// Empty the buffer and begin a fresh summary window.
    pub fn clear(&mut self) {
        self.events.clear();
        self.summarizer.clear();
    }

    /// Events dropped since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{IdentifyEvent, User};

    fn identify(ts: i64) -> Event {
        Event::Identify(IdentifyEvent {
            creation_date: ts,
            user: User::with_key("u"),
        })
    }

    #[test]
    fn add_beyond_capacity_drops_and_counts() {
        let mut buffer = EventBuffer::new(2);
        assert!(buffer.add(identify(1)));
        assert!(buffer.add(identify(2)));
        for i in 0..3 {
            assert!(!buffer.add(identify(3 + i)));
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped_count(), 3);
    }

    #[test]
    fn payload_preserves_append_order() {
        let mut buffer = EventBuffer::new(10);
        buffer.add(identify(1));
        buffer.add(identify(2));
        buffer.add(identify(3));
        let payload = buffer.payload();
        let dates: Vec<i64> = payload.events.iter().map(Event::creation_date).collect();
        assert_eq!(dates, vec![1, 2, 3]);
    }

    #[test]
    fn clear_empties_events_and_summary() {
        let mut buffer = EventBuffer::new(10);
        buffer.add(identify(1));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.payload().is_empty());
    }

    #[test]
    fn dropped_count_is_monotonic_across_clears() {
        let mut buffer = EventBuffer::new(1);
        buffer.add(identify(1));
        buffer.add(identify(2));
        buffer.clear();
        buffer.add(identify(3));
        buffer.add(identify(4));
        assert_eq!(buffer.dropped_count(), 2);
    }

    #[test]
    fn payload_is_empty_only_without_events_and_summary() {
        let mut buffer = EventBuffer::new(10);
        assert!(buffer.payload().is_empty());
        buffer.add(identify(1));
        assert!(!buffer.payload().is_empty());
    }
}
