//! Per-plugin event delivery.
//!
//! Each loaded plugin owns a bounded queue drained by a single worker, so
//! deliveries to one plugin never overlap while plugins proceed
//! independently of each other. Publishing never waits on a plugin.

use std::sync::{Mutex, PoisonError};

use marquee_plugin_sdk::Event;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::client::PluginClient;

pub struct EventQueue {
    plugin: String,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    worker: JoinHandle<()>,
}

impl EventQueue {
    pub fn spawn(plugin: &str, client: PluginClient, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(deliver(plugin.to_string(), client, rx));
        Self {
            plugin: plugin.to_string(),
            tx: Mutex::new(Some(tx)),
            worker,
        }
    }

    /// Queues `event` without waiting. Returns `false` if it was dropped.
    pub fn offer(&self, event: Event) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(tx) = tx else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(plugin = %self.plugin, event = %event.kind, "event queue full; dropping event");
                metrics::counter!("marquee_plugin_events_total", "outcome" => "dropped").increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stops accepting events and abandons anything still queued.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.worker.abort();
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn deliver(plugin: String, client: PluginClient, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        let kind = event.kind.clone();
        match client.handle_event(event).await {
            Ok(()) => {
                tracing::debug!(plugin = %plugin, event = %kind, "event delivered");
                metrics::counter!("marquee_plugin_events_total", "outcome" => "delivered").increment(1);
            }
            Err(err) => {
                tracing::warn!(plugin = %plugin, call = "handle_event", event = %kind, error = %err, "event delivery failed");
                metrics::counter!("marquee_plugin_events_total", "outcome" => "failed").increment(1);
            }
        }
    }
}
