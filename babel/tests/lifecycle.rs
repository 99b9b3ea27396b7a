use std::sync::{Arc, Mutex};
use std::time::Duration;

use babel::{Handler, NeighbourInfo, Speaker, SpeakerConfig};

#[derive(Default)]
struct RecordingHandler {
    neighbours: Mutex<Vec<NeighbourInfo>>,
}

impl Handler for RecordingHandler {
    fn neighbour_added(&self, n: &NeighbourInfo) {
        self.neighbours.lock().unwrap().push(*n);
    }
}

// The speaker starts with no bound interfaces when the filter rejects them
// all, runs its event loop and shuts down cleanly.
#[tokio::test]
async fn starts_and_closes_cleanly() {
    let _ = tracing_subscriber::fmt::try_init();

    let handler = Arc::new(RecordingHandler::default());
    let speaker = Speaker::new(SpeakerConfig {
        multicast: false,
        interface_filter: Some(Arc::new(|_: &str| false)),
        handler: Some(handler.clone()),
        ..Default::default()
    })
    .await
    .unwrap();

    assert!(speaker.router_id().is_valid());
    assert!(speaker.routes().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;

    speaker.close().await.unwrap();
    assert!(handler.neighbours.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rejects_an_invalid_configuration() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = SpeakerConfig::default();
    config.parameters.multicast_hello_interval = Duration::ZERO;

    match Speaker::new(config).await {
        Err(babel::Error::Config(_)) => {}
        other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
    }
}
