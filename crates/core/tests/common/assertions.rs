//! Assertion helpers over progress events.

use dcp_protocol::ipc::Event;
use std::time::Duration;
use tokio::sync::broadcast;

/// Drain `events` until the run's terminal event and return everything seen.
#[allow(dead_code)]
pub async fn collect_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for events");
        match event {
            Ok(event) => {
                let last = matches!(event, Event::RunCompleted { .. } | Event::RunFailed { .. });
                seen.push(event);
                if last {
                    return seen;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return seen,
        }
    }
}

/// Assert that a run started first and ended with exactly one terminal event.
#[allow(dead_code)]
pub fn assert_event_sequence(events: &[Event]) {
    assert!(
        matches!(events.first(), Some(Event::RunStarted { .. })),
        "First event should be RunStarted, got: {:?}",
        events.first()
    );
    let terminal = events
        .iter()
        .filter(|e| matches!(e, Event::RunCompleted { .. } | Event::RunFailed { .. }))
        .count();
    assert_eq!(terminal, 1, "Expected one terminal event in {events:?}");
    assert!(
        matches!(events.last(), Some(Event::RunCompleted { .. } | Event::RunFailed { .. })),
        "Last event should be terminal, got: {:?}",
        events.last()
    );
}

/// Whether any state update reported the central node waiting on `client_id`.
#[allow(dead_code)]
pub fn was_waiting_on(events: &[Event], client_id: &str) -> bool {
    events.iter().any(|e| match e {
        Event::StateUpdate { snapshot, .. } => snapshot.run.waiting_on.iter().any(|id| id == client_id),
        _ => false,
    })
}
