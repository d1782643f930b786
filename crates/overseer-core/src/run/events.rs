//! Per-run event sink
//!
//! Consumers subscribe by run id and only ever see that run's events.
//! The channel for a run is dropped after its terminal lifecycle event, so
//! the map does not grow with history.

use crate::types::RunEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of run events to presentation-layer subscribers
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one run's event stream.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to the run's current subscribers. A run nobody is
    /// watching has no channel and the event is dropped.
    pub fn emit(&self, event: RunEvent) {
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(event.run_id()) {
            // Send only fails when every receiver is gone.
            let _ = tx.send(event);
        }
    }

    /// Drop the run's channel. Called after the terminal lifecycle event.
    pub fn close(&self, run_id: &str) {
        self.channels.lock().remove(run_id);
    }
}
