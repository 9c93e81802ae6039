// flagship-test-utils: Shared test utilities for the event pipeline suite.
//
// Provides a mock HTTP collection server that records every request and
// serves a scripted sequence of responses, for integration testing of the
// event sender and processor without a real endpoint.

pub mod mock_events_server;

pub use mock_events_server::{MockEventsServer, MockResponse, RecordedRequest};
