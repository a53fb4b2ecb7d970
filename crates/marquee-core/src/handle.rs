//! One loaded plugin: its process, connection, broker and health.

use std::{fmt, sync::Arc, time::Duration};

use marquee_plugin_sdk::{Capability, PluginMetadata, UiManifest};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

use crate::{
    broker::Broker, catalog::PluginSpec, client::PluginClient, events::EventQueue,
    launcher::PluginProcess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Starting,
    Healthy,
    Crashed,
    Stopped,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Health::Starting => "starting",
            Health::Healthy => "healthy",
            Health::Crashed => "crashed",
            Health::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

pub struct PluginHandle {
    spec: PluginSpec,
    metadata: PluginMetadata,
    ui: Option<UiManifest>,
    client: PluginClient,
    broker: Arc<Broker>,
    events: EventQueue,
    health: watch::Sender<Health>,
    in_flight: watch::Sender<usize>,
    process: Mutex<Option<PluginProcess>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PluginHandle {
    pub(crate) fn new(
        spec: PluginSpec,
        metadata: PluginMetadata,
        ui: Option<UiManifest>,
        client: PluginClient,
        broker: Arc<Broker>,
        events: EventQueue,
        process: PluginProcess,
    ) -> Self {
        Self {
            spec,
            metadata,
            ui,
            client,
            broker,
            events,
            health: watch::Sender::new(Health::Starting),
            in_flight: watch::Sender::new(0),
            process: Mutex::new(Some(process)),
            supervisor: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Cached UI manifest; `None` for plugins without the `ui` capability.
    pub fn ui_manifest(&self) -> Option<&UiManifest> {
        self.ui.as_ref()
    }

    pub fn client(&self) -> &PluginClient {
        &self.client
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub(crate) fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn health(&self) -> Health {
        *self.health.borrow()
    }

    pub fn is_usable(&self) -> bool {
        self.health() == Health::Healthy
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.metadata.has_capability(capability)
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// OS process id, for plugins running as child processes.
    pub async fn process_id(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(PluginProcess::pid)
    }

    pub(crate) fn mark_healthy(&self) {
        self.health.send_if_modified(|health| {
            if *health == Health::Starting {
                *health = Health::Healthy;
                true
            } else {
                false
            }
        });
    }

    /// Flags a healthy plugin as crashed. Returns `false` if it was not healthy.
    pub(crate) fn mark_crashed(&self) -> bool {
        self.health.send_if_modified(|health| {
            if *health == Health::Healthy {
                *health = Health::Crashed;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_stopped(&self) {
        self.health.send_replace(Health::Stopped);
    }

    pub(crate) fn set_supervisor(&self, task: JoinHandle<()>) {
        let mut slot = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(task);
    }

    /// Counts a dispatch against this plugin, unless it is no longer usable.
    ///
    /// The count is raised before health is checked, so an unload that sees
    /// zero in-flight requests after marking the plugin stopped cannot race
    /// with a dispatch that is about to start.
    pub fn begin_request(self: &Arc<Self>) -> Option<InFlight> {
        self.in_flight.send_modify(|count| *count += 1);
        let guard = InFlight {
            handle: Arc::clone(self),
        };
        self.is_usable().then_some(guard)
    }

    /// Waits up to `grace` for in-flight dispatches to finish. Returns the
    /// number still running when it gave up.
    pub(crate) async fn drain(&self, grace: Duration) -> usize {
        let mut rx = self.in_flight.subscribe();
        let drained = tokio::time::timeout(grace, rx.wait_for(|count| *count == 0))
            .await
            .is_ok();
        if drained {
            0
        } else {
            self.in_flight()
        }
    }

    /// Tears everything down: broker, event worker, process.
    pub(crate) async fn stop(&self) {
        self.mark_stopped();
        self.broker.close_all();
        self.events.close();
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = supervisor {
            task.abort();
        }
        if !self.client.connection().is_closed() {
            if let Err(err) = self.client.shutdown().await {
                tracing::debug!(plugin = %self.id(), error = %err, "plugin did not acknowledge shutdown");
            }
        }
        if let Some(mut process) = self.process.lock().await.take() {
            process.terminate().await;
        }
    }
}

/// Marks one dispatch as in flight until dropped.
pub struct InFlight {
    handle: Arc<PluginHandle>,
}

impl InFlight {
    pub fn handle(&self) -> &Arc<PluginHandle> {
        &self.handle
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.handle
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
