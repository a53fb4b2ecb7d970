//! Plugin lifecycle: launch, handshake, interrogate, register, stop.
//!
//! Failures are contained to the plugin they concern. A plugin that cannot
//! be loaded is logged and remembered, and the host carries on with the
//! rest. A plugin whose connection drops is marked crashed and its routes
//! answer as unavailable until an operator reloads it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use futures::future::join_all;
use marquee_plugin_sdk::{
    rpc::RpcError, Capability, Event, HandshakeConfig, PluginMetadata, RouteDescriptor,
    UiManifest,
};
use serde::Serialize;

use crate::{
    broker::Broker,
    catalog::PluginSpec,
    client::PluginClient,
    config::{Plugins, Timeouts},
    connection::Connection,
    contracts::ConfigStore,
    error::LoadError,
    events::EventQueue,
    handle::{Health, PluginHandle},
    launcher::{Launcher, PluginIo},
    registry::{RegisterReport, RouteConflict, RouteRegistry},
};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub timeouts: Timeouts,
    pub event_queue: usize,
    pub handshake: HandshakeConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&Plugins::default())
    }
}

impl ManagerOptions {
    pub fn from_config(plugins: &Plugins) -> Self {
        Self {
            timeouts: plugins.timeouts(),
            event_queue: plugins.event_queue,
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub plugin: String,
    pub version: String,
    pub registered: Vec<RouteDescriptor>,
    pub conflicts: Vec<RouteConflict>,
    pub rejected: Vec<RouteDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub id: String,
    pub enabled: bool,
    pub loaded: bool,
    pub health: Option<Health>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub capabilities: Vec<Capability>,
    pub routes: Vec<RouteDescriptor>,
    pub in_flight: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    spec: PluginSpec,
    enabled: bool,
}

type ErrorLog = Arc<Mutex<HashMap<String, String>>>;

pub struct PluginManager {
    registry: Arc<RouteRegistry>,
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn ConfigStore>,
    options: ManagerOptions,
    catalog: RwLock<BTreeMap<String, CatalogEntry>>,
    loaded: RwLock<HashMap<String, Arc<PluginHandle>>>,
    last_errors: ErrorLog,
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PluginManager {
    pub fn new(
        registry: Arc<RouteRegistry>,
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn ConfigStore>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            registry,
            launcher,
            store,
            options,
            catalog: RwLock::new(BTreeMap::new()),
            loaded: RwLock::new(HashMap::new()),
            last_errors: Arc::new(Mutex::new(HashMap::new())),
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Adds or replaces a catalog entry. Takes effect on the next load.
    pub fn add_plugin(&self, spec: PluginSpec, enabled: bool) {
        let id = spec.id.clone();
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, CatalogEntry { spec, enabled });
    }

    pub fn known(&self) -> Vec<String> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .is_some_and(|entry| entry.enabled)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginHandle>> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn last_error(&self, id: &str) -> Option<String> {
        self.last_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub async fn load(&self, id: &str) -> Result<LoadReport, LoadError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        let result = self.load_locked(id).await;
        self.record_load(id, result)
    }

    /// Loads every enabled plugin that is not loaded yet. Never fails as a
    /// whole; each plugin's outcome is returned and logged.
    pub async fn load_all(&self) -> Vec<(String, Result<LoadReport, LoadError>)> {
        let pending: Vec<String> = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            catalog
                .values()
                .filter(|entry| entry.enabled)
                .map(|entry| entry.spec.id.clone())
                .collect()
        };
        let mut outcomes = Vec::with_capacity(pending.len());
        for id in pending {
            if self.get(&id).is_some() {
                continue;
            }
            let result = self.load(&id).await;
            outcomes.push((id, result));
        }
        let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
        tracing::info!(
            loaded = outcomes.len() - failed,
            failed,
            "plugin loading finished"
        );
        outcomes
    }

    /// Removes the plugin's routes, lets in-flight requests finish within the
    /// unload grace, then stops it. Returns `false` if it was not loaded.
    pub async fn unload(&self, id: &str) -> bool {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.unload_locked(id).await
    }

    pub async fn reload(&self, id: &str) -> Result<LoadReport, LoadError> {
        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        self.unload_locked(id).await;
        let result = self.load_locked(id).await;
        self.record_load(id, result)
    }

    /// Flips the enable flag and loads or unloads to match.
    pub async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Option<LoadReport>, LoadError> {
        {
            let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
            let entry = catalog
                .get_mut(id)
                .ok_or_else(|| LoadError::UnknownPlugin(id.to_string()))?;
            entry.enabled = enabled;
        }
        tracing::info!(plugin = id, enabled, "plugin enable flag changed");

        let lock = self.lifecycle_lock(id);
        let _guard = lock.lock().await;
        if !enabled {
            self.unload_locked(id).await;
            return Ok(None);
        }
        if self.get(id).is_some() {
            return Ok(None);
        }
        let result = self.load_locked(id).await;
        self.record_load(id, result).map(Some)
    }

    /// Queues `event` for every usable plugin interested in it. Returns the
    /// number of plugins it was queued for.
    pub fn publish(&self, event: &Event) -> usize {
        let handles: Vec<Arc<PluginHandle>> = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        handles
            .iter()
            .filter(|handle| handle.is_usable() && handle.metadata().wants_event(&event.kind))
            .filter(|handle| handle.events().offer(event.clone()))
            .count()
    }

    /// UI manifests of usable plugins, keyed by plugin id.
    pub fn ui_manifests(&self) -> BTreeMap<String, UiManifest> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| handle.is_usable())
            .filter_map(|handle| {
                handle
                    .ui_manifest()
                    .map(|ui| (handle.id().to_string(), ui.clone()))
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<PluginStatus> {
        let catalog = self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        catalog
            .into_values()
            .map(|entry| {
                let id = entry.spec.id.clone();
                let handle = self.get(&id);
                let metadata = handle.as_ref().map(|h| h.metadata());
                PluginStatus {
                    enabled: entry.enabled,
                    loaded: handle.is_some(),
                    health: handle.as_ref().map(|h| h.health()),
                    name: metadata.map(|m| m.name.clone()),
                    version: metadata.map(|m| m.version.clone()),
                    description: metadata
                        .map(|m| m.description.clone())
                        .filter(|d| !d.is_empty())
                        .or(entry.spec.description.clone()),
                    capabilities: metadata
                        .map(|m| m.capabilities.iter().copied().collect())
                        .unwrap_or_default(),
                    routes: self.registry.routes_of(&id),
                    in_flight: handle.as_ref().map_or(0, |h| h.in_flight()),
                    last_error: self.last_error(&id),
                    id,
                }
            })
            .collect()
    }

    /// Unloads every loaded plugin.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tracing::info!(plugins = ids.len(), "stopping plugins");
        join_all(ids.iter().map(|id| self.unload(id))).await;
    }

    async fn load_locked(&self, id: &str) -> Result<LoadReport, LoadError> {
        let spec = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            let entry = catalog
                .get(id)
                .ok_or_else(|| LoadError::UnknownPlugin(id.to_string()))?;
            if !entry.enabled {
                return Err(LoadError::Disabled(id.to_string()));
            }
            entry.spec.clone()
        };
        if self.get(id).is_some() {
            return Err(LoadError::AlreadyLoaded(id.to_string()));
        }

        let timeouts = self.options.timeouts;
        let PluginIo {
            reader,
            writer,
            mut process,
        } = self.launcher.launch(&spec, &self.options.handshake).await?;
        let broker = Arc::new(Broker::new(id, Arc::clone(&self.store)));
        let conn = match Connection::establish(
            id,
            reader,
            writer,
            &self.options.handshake,
            timeouts.handshake,
            Arc::clone(&broker),
        )
        .await
        {
            Ok(conn) => conn,
            Err(source) => {
                process.terminate().await;
                return Err(LoadError::Handshake {
                    id: id.to_string(),
                    source,
                });
            }
        };
        let client = PluginClient::new(conn, timeouts);

        let (metadata, routes, ui) = match interrogate(id, &client).await {
            Ok(answers) => answers,
            Err(err) => {
                drop(client);
                process.terminate().await;
                return Err(err);
            }
        };

        let events = EventQueue::spawn(id, client.clone(), self.options.event_queue);
        let handle = Arc::new(PluginHandle::new(
            spec, metadata, ui, client, broker, events, process,
        ));
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), Arc::clone(&handle));

        let report = if handle.has_capability(Capability::Api) {
            self.registry.register(id, &routes)
        } else {
            if !routes.is_empty() {
                tracing::warn!(
                    plugin = id,
                    routes = routes.len(),
                    "plugin declared routes without the `api` capability; ignoring them"
                );
            }
            RegisterReport::default()
        };
        for conflict in &report.conflicts {
            tracing::warn!(
                plugin = id,
                owner = %conflict.owner,
                method = %conflict.route.method,
                path = %conflict.route.path,
                "route already owned by another plugin; not registered"
            );
        }
        for route in &report.rejected {
            tracing::warn!(
                plugin = id,
                method = %route.method,
                path = %route.path,
                "route pattern is malformed; not registered"
            );
        }

        handle.mark_healthy();
        self.supervise(&handle);
        tracing::info!(
            plugin = id,
            version = %handle.metadata().version,
            routes = report.registered.len(),
            ui = handle.ui_manifest().is_some(),
            "plugin loaded"
        );

        Ok(LoadReport {
            plugin: id.to_string(),
            version: handle.metadata().version.clone(),
            registered: report.registered,
            conflicts: report.conflicts,
            rejected: report.rejected,
        })
    }

    async fn unload_locked(&self, id: &str) -> bool {
        let removed = self
            .loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(handle) = removed else {
            return false;
        };
        handle.mark_stopped();
        let routes = self.registry.remove_plugin(id);
        let remaining = handle.drain(self.options.timeouts.unload_grace).await;
        if remaining > 0 {
            tracing::warn!(
                plugin = id,
                remaining,
                "unload grace elapsed with requests still in flight"
            );
        }
        handle.stop().await;
        tracing::info!(plugin = id, routes, "plugin unloaded");
        true
    }

    fn supervise(&self, handle: &Arc<PluginHandle>) {
        let weak = Arc::downgrade(handle);
        let client = handle.client().clone();
        let errors = Arc::clone(&self.last_errors);
        let id = handle.id().to_string();
        let task = tokio::spawn(async move {
            client.connection().closed().await;
            let Some(handle) = weak.upgrade() else {
                return;
            };
            if handle.mark_crashed() {
                tracing::error!(plugin = %id, "plugin connection closed unexpectedly; marking crashed");
                metrics::counter!("marquee_plugin_loads_total", "outcome" => "crashed").increment(1);
                handle.broker().close_all();
                handle.events().close();
                errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, "plugin process exited unexpectedly".to_string());
            }
        });
        handle.set_supervisor(task);
    }

    fn record_load(
        &self,
        id: &str,
        result: Result<LoadReport, LoadError>,
    ) -> Result<LoadReport, LoadError> {
        let mut errors = self.last_errors.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(report) => {
                metrics::counter!("marquee_plugin_loads_total", "outcome" => "loaded").increment(1);
                if report.conflicts.is_empty() {
                    errors.remove(id);
                } else {
                    let paths: Vec<String> = report
                        .conflicts
                        .iter()
                        .map(|c| format!("{} {} (owned by {})", c.route.method, c.route.path, c.owner))
                        .collect();
                    errors.insert(id.to_string(), format!("route conflicts: {}", paths.join(", ")));
                }
            }
            Err(err) => {
                tracing::error!(plugin = id, error = %err, "plugin failed to load");
                metrics::counter!("marquee_plugin_loads_total", "outcome" => err.outcome()).increment(1);
                errors.insert(id.to_string(), err.to_string());
            }
        }
        result
    }

    fn lifecycle_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

/// Asks a freshly connected plugin who it is and what it serves, once each.
async fn interrogate(
    id: &str,
    client: &PluginClient,
) -> Result<(PluginMetadata, Vec<RouteDescriptor>, Option<UiManifest>), LoadError> {
    let failed = |call: &'static str| {
        move |source: RpcError| LoadError::Interrogation {
            id: id.to_string(),
            call,
            source,
        }
    };
    let metadata = client.metadata().await.map_err(failed("metadata"))?;
    validate_metadata(id, &metadata)?;
    let routes = client.api_routes().await.map_err(failed("api_routes"))?;
    let ui = client.ui_manifest().await.map_err(failed("ui_manifest"))?;
    let ui = metadata.has_capability(Capability::Ui).then_some(ui);
    Ok((metadata, routes, ui))
}

fn validate_metadata(id: &str, metadata: &PluginMetadata) -> Result<(), LoadError> {
    let invalid = |reason: String| LoadError::InvalidMetadata {
        id: id.to_string(),
        reason,
    };
    if metadata.id != id {
        return Err(invalid(format!(
            "plugin reports id `{}` but is configured as `{id}`",
            metadata.id
        )));
    }
    if metadata.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    semver::Version::parse(&metadata.version)
        .map_err(|err| invalid(format!("version `{}` is not semver: {err}", metadata.version)))?;
    Ok(())
}
