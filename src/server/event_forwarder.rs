use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, MonitoringEvent};

/// Streams every bus event, serialized as `{"type", "payload"}` JSON, into the log.
///
/// This is the hook point for UI and notification bridges: they consume the
/// same wire format from the bus tap.
pub struct EventForwarder {
    receiver: broadcast::Receiver<MonitoringEvent>,
    shutdown_rx: watch::Receiver<()>,
}

impl EventForwarder {
    /// Subscribes immediately so no event emitted after this call is missed.
    pub fn new(event_bus: &EventBus, shutdown_rx: watch::Receiver<()>) -> Self {
        Self {
            receiver: event_bus.subscribe(),
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("Event forwarder started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    break;
                }
                received = self.receiver.recv() => match received {
                    Ok(event) => forward(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event forwarder lagged behind; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        info!("Event forwarder stopped");
    }
}

fn forward(event: &MonitoringEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!(event = event.name(), payload = %json, "Monitoring event"),
        Err(e) => error!(event = event.name(), error = %e, "Failed to serialize monitoring event"),
    }
}

/// Convenience for callers that hold the bus behind an `Arc`.
pub fn spawn_forwarder(
    event_bus: &Arc<EventBus>,
    shutdown_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    EventForwarder::new(event_bus, shutdown_rx).spawn()
}
