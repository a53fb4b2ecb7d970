#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use marquee_core::{
    auth::TokenAuth,
    catalog::PluginSpec,
    config::{AuthToken, Timeouts},
    launcher::Launcher,
    manager::{ManagerOptions, PluginManager},
    registry::RouteRegistry,
    server::HostService,
    store::MemoryConfigStore,
};
use marquee_plugin_sdk::{
    AuthLevel, Capability, Event, Fault, HostServices, NavItem, Plugin, PluginHttpRequest,
    PluginHttpResponse, PluginMetadata, RouteDescriptor, SdkError, UiManifest, UiRoute,
};
use serde_json::{json, Value};

pub const USER_TOKEN: &str = "user-token";
pub const ADMIN_TOKEN: &str = "admin-token";

/// Observations shared between a stub plugin and the test driving it.
#[derive(Clone, Default)]
pub struct Probe {
    pub api_calls: Arc<AtomicUsize>,
    pub events: Arc<Mutex<Vec<String>>>,
    active_events: Arc<AtomicUsize>,
    pub events_overlapped: Arc<AtomicBool>,
    stash: Arc<Mutex<Option<HostServices>>>,
}

impl Probe {
    pub fn api_calls(&self) -> usize {
        self.api_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// Plugin serving a fixed set of routes under `/api/plugins/{id}/`.
pub struct StubPlugin {
    pub metadata: PluginMetadata,
    pub routes: Vec<RouteDescriptor>,
    pub probe: Probe,
    pub event_delay: Duration,
}

impl StubPlugin {
    pub fn new(id: &str, probe: Probe) -> Self {
        let base = format!("/api/plugins/{id}");
        let routes = vec![
            RouteDescriptor::get(format!("{base}/hello"), AuthLevel::None),
            RouteDescriptor::get(format!("{base}/status"), AuthLevel::Session),
            RouteDescriptor::get(format!("{base}/admin"), AuthLevel::Admin),
            RouteDescriptor::get(format!("{base}/config"), AuthLevel::None),
            RouteDescriptor::post(format!("{base}/echo"), AuthLevel::None),
            RouteDescriptor::get(format!("{base}/slow"), AuthLevel::None),
            RouteDescriptor::get(format!("{base}/fault"), AuthLevel::None),
            RouteDescriptor::get(format!("{base}/stash"), AuthLevel::None),
            RouteDescriptor::get(format!("{base}/stale"), AuthLevel::None),
            RouteDescriptor::get(format!("{base}/files/*"), AuthLevel::None).with_tag("files"),
        ];
        let metadata = PluginMetadata::new(id, format!("Stub {id}"), "1.0.0")
            .with_capability(Capability::Api)
            .with_capability(Capability::Ui);
        Self {
            metadata,
            routes,
            probe,
            event_delay: Duration::from_millis(5),
        }
    }

    pub fn with_routes(mut self, routes: Vec<RouteDescriptor>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_metadata(mut self, metadata: PluginMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }
}

#[async_trait]
impl Plugin for StubPlugin {
    async fn metadata(&self) -> Result<PluginMetadata, Fault> {
        Ok(self.metadata.clone())
    }

    async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, Fault> {
        Ok(self.routes.clone())
    }

    async fn ui_manifest(&self) -> Result<UiManifest, Fault> {
        let id = &self.metadata.id;
        Ok(UiManifest {
            nav_items: vec![NavItem {
                label: format!("Stub {id}"),
                path: format!("/plugins/{id}"),
                icon: "puzzle".into(),
            }],
            routes: vec![UiRoute {
                path: format!("/plugins/{id}"),
                bundle_url: format!("/static/plugins/{id}/main.js"),
            }],
        })
    }

    async fn handle_api(
        &self,
        request: PluginHttpRequest,
        host: HostServices,
    ) -> Result<PluginHttpResponse, Fault> {
        self.probe.api_calls.fetch_add(1, Ordering::SeqCst);
        let base = format!("/api/plugins/{}", self.metadata.id);
        let rest = request.path.strip_prefix(&base).unwrap_or_default().to_string();
        let json = |status: u16, value: Value| {
            PluginHttpResponse::json(status, &value).map_err(|err| Fault::internal(err.to_string()))
        };

        match rest.as_str() {
            "/hello" => json(200, json!({ "message": format!("hello from {}", self.metadata.id) })),
            "/status" => json(200, json!({ "user": request.user_id })),
            "/admin" => json(200, json!({ "admin": request.user_id })),
            "/config" => {
                let key = request.query_param("key").unwrap_or_default().to_string();
                if let Some(delay) = request.query_param("delay_ms") {
                    let ms = delay.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                match host.config_get_string(&key).await {
                    Ok(value) => json(
                        200,
                        json!({ "key": key, "value": value, "broker": request.sdk.map(|h| h.broker_id()) }),
                    ),
                    Err(SdkError::NotFound(_)) => json(404, json!({ "missing": key })),
                    Err(err) => json(500, json!({ "error": err.to_string() })),
                }
            }
            "/echo" => Ok(PluginHttpResponse::new(207)
                .with_header("x-one", "1")
                .with_header("set-cookie", "a=1")
                .with_header("set-cookie", "b=2")
                .with_header("content-type", "application/octet-stream")
                .with_body(request.body)),
            "/slow" => {
                let ms = request
                    .query_param("ms")
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(200);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(PluginHttpResponse::text(200, "done"))
            }
            "/fault" => Err(Fault::internal("boom")),
            "/stash" => {
                *self.probe.stash.lock().unwrap() = Some(host);
                Ok(PluginHttpResponse::new(204))
            }
            "/stale" => {
                let stashed = self.probe.stash.lock().unwrap().take();
                let Some(old) = stashed else {
                    return json(409, json!({ "error": "nothing stashed" }));
                };
                let outcome = old.config_get_string("plugins.demo.key").await;
                json(
                    200,
                    json!({ "unavailable": matches!(outcome, Err(SdkError::Unavailable(_))) }),
                )
            }
            "/files/known" => Ok(PluginHttpResponse::text(200, "known file")),
            _ => Ok(PluginHttpResponse::not_found()),
        }
    }

    async fn handle_event(&self, event: Event) -> Result<(), Fault> {
        if self.probe.active_events.fetch_add(1, Ordering::SeqCst) > 0 {
            self.probe.events_overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.event_delay).await;
        self.probe.events.lock().unwrap().push(event.kind.clone());
        self.probe.active_events.fetch_sub(1, Ordering::SeqCst);
        if event.kind == "explode" {
            return Err(Fault::internal("event handler failed"));
        }
        Ok(())
    }
}

pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        timeouts: Timeouts {
            handshake: Duration::from_secs(2),
            call: Duration::from_secs(2),
            dispatch: Duration::from_secs(2),
            event: Duration::from_secs(2),
            unload_grace: Duration::from_secs(5),
        },
        ..ManagerOptions::default()
    }
}

pub struct Harness {
    pub manager: Arc<PluginManager>,
    pub service: Arc<HostService>,
}

impl Harness {
    /// Builds a host around `launcher` with every id in the catalog, loaded in order.
    pub async fn start<L: Launcher>(launcher: L, ids: &[&str], options: ManagerOptions) -> Self {
        let settings = BTreeMap::from([
            ("plugins.demo.key".to_string(), json!("abc")),
            ("plugins.demo.other".to_string(), json!("xyz")),
            ("plugins.demo.empty".to_string(), json!("")),
        ]);
        let store = MemoryConfigStore::seeded(&settings).unwrap();
        let manager = Arc::new(PluginManager::new(
            Arc::new(RouteRegistry::new()),
            Arc::new(launcher),
            Arc::new(store),
            options,
        ));
        for id in ids {
            manager.add_plugin(PluginSpec::bundled(*id), true);
        }
        for id in ids {
            let _ = manager.load(id).await;
        }
        let auth = TokenAuth::new(&[
            AuthToken {
                token: USER_TOKEN.into(),
                user_id: "alice".into(),
                admin: false,
            },
            AuthToken {
                token: ADMIN_TOKEN.into(),
                user_id: "root".into(),
                admin: true,
            },
        ]);
        let service = Arc::new(HostService::new(Arc::clone(&manager), Arc::new(auth)));
        Self { manager, service }
    }

    pub async fn send(&self, request: Request<Bytes>) -> Response<Bytes> {
        self.service.handle(request).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Response<Bytes> {
        self.send(request("GET", path, token, Bytes::new())).await
    }

    pub async fn post(&self, path: &str, token: Option<&str>, body: impl Into<Bytes>) -> Response<Bytes> {
        self.send(request("POST", path, token, body.into())).await
    }
}

pub fn request(method: &str, path: &str, token: Option<&str>, body: Bytes) -> Request<Bytes> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(body).unwrap()
}

pub fn json_body(response: &Response<Bytes>) -> Value {
    serde_json::from_slice(response.body()).unwrap()
}

/// Polls `condition` until it holds or a second has passed.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
