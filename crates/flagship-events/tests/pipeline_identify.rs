/// End-to-end delivery of an identify event over real HTTP: wire body,
/// endpoint path, and required headers.
mod common;

use common::manual_flush_config;
use flagship_events::{Event, EventProcessor, HttpEventSender, IdentifyEvent, User};
use flagship_test_utils::MockEventsServer;
use serde_json::{Value, json};
use std::time::Duration;

/// Test: one identify event produces the documented single-element array.
#[tokio::test]
async fn identify_event_round_trips_to_the_collection_service() {
    let server = MockEventsServer::start().await.unwrap();
    let config = flagship_events::EventsConfig {
        events_uri: server.uri(),
        diagnostic_uri: server.uri(),
        ..manual_flush_config()
    };
    let sender = HttpEventSender::new(&config).unwrap();
    let processor = EventProcessor::new(config, sender, None, None);

    let mut user = User::with_key("u1");
    user.name = Some("Red".to_owned());
    processor.submit(Event::Identify(IdentifyEvent {
        creation_date: 1000,
        user,
    }));
    processor.flush();

    let requests = server.wait_for_requests(1, Duration::from_secs(5)).await;
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/bulk");

    let body: Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(
        body,
        json!([{
            "kind": "identify",
            "creationDate": 1000,
            "user": {"key": "u1", "name": "Red"},
        }])
    );

    processor.close().await;
}

/// Test: analytics requests carry authorization, content type, schema
/// version, a payload ID, and the product user agent.
#[tokio::test]
async fn analytics_requests_carry_the_required_headers() {
    let server = MockEventsServer::start().await.unwrap();
    let config = flagship_events::EventsConfig {
        events_uri: server.uri(),
        diagnostic_uri: server.uri(),
        ..manual_flush_config()
    };
    let sdk_key = config.sdk_key.clone();
    let sender = HttpEventSender::new(&config).unwrap();
    let processor = EventProcessor::new(config, sender, None, None);

    processor.submit(Event::Identify(IdentifyEvent {
        creation_date: 1000,
        user: User::with_key("u1"),
    }));
    processor.flush();

    let requests = server.wait_for_requests(1, Duration::from_secs(5)).await;
    let request = &requests[0];
    assert_eq!(request.header("authorization"), Some(sdk_key.as_str()));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("x-launchdarkly-event-schema"), Some("3"));
    let payload_id = request.header("x-launchdarkly-payload-id").unwrap();
    assert_eq!(payload_id.len(), 36, "payload ID should be a UUID: {payload_id}");
    assert!(
        request
            .header("user-agent")
            .unwrap()
            .starts_with("flagship-events/"),
    );

    processor.close().await;
}
