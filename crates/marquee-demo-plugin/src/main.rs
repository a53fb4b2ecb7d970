//! Reference plugin for the marquee host.
//!
//! Serves a greeting, the caller's identity and a config value read back
//! from the host, publishes a small UI manifest and remembers recent events.

use std::{collections::VecDeque, process::ExitCode, sync::Mutex};

use async_trait::async_trait;
use marquee_plugin_sdk::{
    serve, AuthLevel, Capability, Event, Fault, HostServices, NavItem, Plugin, PluginHttpRequest,
    PluginHttpResponse, PluginMetadata, RouteDescriptor, SdkError, UiManifest, UiRoute,
};
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

const ID: &str = "demo";
const CONFIG_KEY: &str = "plugins.demo.key";
const GREETING_KEY: &str = "plugins.demo.greeting";
const RECENT_EVENTS: usize = 16;

#[derive(Default)]
struct DemoPlugin {
    recent: Mutex<VecDeque<Event>>,
}

#[derive(Deserialize)]
struct GreetingUpdate {
    greeting: String,
}

fn route(path: &str) -> String {
    format!("/api/plugins/{ID}/{path}")
}

fn json(status: u16, value: serde_json::Value) -> Result<PluginHttpResponse, Fault> {
    PluginHttpResponse::json(status, &value).map_err(|err| Fault::internal(err.to_string()))
}

impl DemoPlugin {
    async fn config(&self, host: &HostServices) -> Result<PluginHttpResponse, Fault> {
        match host.config_get_string(CONFIG_KEY).await {
            Ok(value) => json(200, json!({ "key": CONFIG_KEY, "value": value })),
            Err(SdkError::NotFound(key)) => json(404, json!({ "error": "not set", "key": key })),
            Err(err) => {
                tracing::warn!(error = %err, "config callback failed");
                json(503, json!({ "error": err.to_string() }))
            }
        }
    }

    async fn greeting(&self, request: &PluginHttpRequest, host: &HostServices) -> Result<PluginHttpResponse, Fault> {
        if request.method == "PUT" {
            let update: GreetingUpdate = serde_json::from_slice(&request.body)
                .map_err(|err| Fault::bad_request(format!("invalid greeting: {err}")))?;
            return match host.config_set_json(GREETING_KEY, &update.greeting).await {
                Ok(()) => Ok(PluginHttpResponse::new(204)),
                Err(err) => json(503, json!({ "error": err.to_string() })),
            };
        }
        match host.config_delete(GREETING_KEY).await {
            Ok(()) => Ok(PluginHttpResponse::new(204)),
            Err(SdkError::NotFound(_)) => Ok(PluginHttpResponse::not_found()),
            Err(err) => json(503, json!({ "error": err.to_string() })),
        }
    }

    async fn hello(&self, host: &HostServices) -> Result<PluginHttpResponse, Fault> {
        let greeting = match host.config_get_string(GREETING_KEY).await {
            Ok(greeting) => greeting,
            Err(_) => "hello from the demo plugin".to_string(),
        };
        json(200, json!({ "message": greeting }))
    }
}

#[async_trait]
impl Plugin for DemoPlugin {
    async fn metadata(&self) -> Result<PluginMetadata, Fault> {
        Ok(PluginMetadata::new(ID, "Demo", env!("CARGO_PKG_VERSION"))
            .with_description("Reference plugin exercising routes, config callbacks, UI and events")
            .with_capability(Capability::Api)
            .with_capability(Capability::Ui))
    }

    async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, Fault> {
        Ok(vec![
            RouteDescriptor::get(route("hello"), AuthLevel::None),
            RouteDescriptor::get(route("status"), AuthLevel::Session),
            RouteDescriptor::get(route("config"), AuthLevel::None),
            RouteDescriptor::new("PUT", route("greeting"), AuthLevel::Admin),
            RouteDescriptor::new("DELETE", route("greeting"), AuthLevel::Admin),
            RouteDescriptor::get(route("events"), AuthLevel::Admin).with_tag("debug"),
        ])
    }

    async fn handle_api(
        &self,
        request: PluginHttpRequest,
        host: HostServices,
    ) -> Result<PluginHttpResponse, Fault> {
        tracing::debug!(method = %request.method, path = %request.path, "handling request");
        let path = request.path.trim_end_matches('/');
        match path.rsplit('/').next().unwrap_or_default() {
            "hello" => self.hello(&host).await,
            "status" => json(
                200,
                json!({ "status": "ok", "user": request.user_id, "version": env!("CARGO_PKG_VERSION") }),
            ),
            "config" => self.config(&host).await,
            "greeting" => self.greeting(&request, &host).await,
            "events" => {
                let recent: Vec<Event> = self
                    .recent
                    .lock()
                    .map_err(|_| Fault::internal("event log poisoned"))?
                    .iter()
                    .cloned()
                    .collect();
                json(200, json!({ "events": recent }))
            }
            _ => Ok(PluginHttpResponse::not_found()),
        }
    }

    async fn ui_manifest(&self) -> Result<UiManifest, Fault> {
        Ok(UiManifest {
            nav_items: vec![NavItem {
                label: "Demo".into(),
                path: format!("/plugins/{ID}"),
                icon: "puzzle".into(),
            }],
            routes: vec![UiRoute {
                path: format!("/plugins/{ID}"),
                bundle_url: format!("/static/plugins/{ID}/main.js"),
            }],
        })
    }

    async fn handle_event(&self, event: Event) -> Result<(), Fault> {
        tracing::info!(event = %event.kind, "event received");
        let mut recent = self
            .recent
            .lock()
            .map_err(|_| Fault::internal("event log poisoned"))?;
        if recent.len() == RECENT_EVENTS {
            recent.pop_front();
        }
        recent.push_back(event);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the protocol; logs go to stderr where the host picks them up.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .ok();

    match serve(DemoPlugin::default()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("marquee-demo-plugin: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> PluginHttpRequest {
        PluginHttpRequest {
            method: "GET".into(),
            path: path.into(),
            ..PluginHttpRequest::default()
        }
    }

    #[tokio::test]
    async fn hello_falls_back_without_a_host() {
        let plugin = DemoPlugin::default();
        let response = plugin
            .handle_api(get("/api/plugins/demo/hello"), HostServices::detached())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body, json!({ "message": "hello from the demo plugin" }));
    }

    #[tokio::test]
    async fn config_reports_an_unreachable_host() {
        let plugin = DemoPlugin::default();
        let response = plugin
            .handle_api(get("/api/plugins/demo/config"), HostServices::detached())
            .await
            .unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn only_recent_events_are_kept() {
        let plugin = DemoPlugin::default();
        for n in 0..(RECENT_EVENTS + 4) {
            plugin
                .handle_event(Event::new("library.scan", json!({ "n": n })))
                .await
                .unwrap();
        }
        let recent = plugin.recent.lock().unwrap();
        assert_eq!(recent.len(), RECENT_EVENTS);
        assert_eq!(recent[0].payload["n"], 4);
    }

    #[tokio::test]
    async fn unknown_paths_are_answered_with_404() {
        let plugin = DemoPlugin::default();
        let response = plugin
            .handle_api(get("/api/plugins/demo/nope"), HostServices::detached())
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }
}
