mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{fast_options, json_body, Harness, Probe, StubPlugin, ADMIN_TOKEN, USER_TOKEN};
use marquee_core::launcher::InProcessLauncher;
use marquee_plugin_sdk::{AuthLevel, RouteDescriptor};
use serde_json::json;

async fn single(id: &'static str) -> (Harness, Probe) {
    let probe = Probe::default();
    let shared = probe.clone();
    let launcher =
        InProcessLauncher::new().with_plugin(id, move || StubPlugin::new(id, shared.clone()));
    let harness = Harness::start(launcher, &[id], fast_options()).await;
    (harness, probe)
}

#[tokio::test]
async fn anonymous_route_returns_plugin_json() {
    let (host, probe) = single("demo").await;
    let response = host.get("/api/plugins/demo/hello", None).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(json_body(&response), json!({ "message": "hello from demo" }));
    assert_eq!(probe.api_calls(), 1);
}

#[tokio::test]
async fn responses_round_trip_status_headers_and_bytes() {
    let (host, _) = single("demo").await;
    let payload = Bytes::from_static(&[0, 159, 146, 150, 255, b'\n', 0]);
    let response = host
        .post("/api/plugins/demo/echo", None, payload.clone())
        .await;

    assert_eq!(response.status(), 207);
    assert_eq!(response.headers()["x-one"], "1");
    let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
    assert_eq!(response.body(), &payload);
}

#[tokio::test]
async fn session_routes_require_a_caller() {
    let (host, probe) = single("demo").await;

    let anonymous = host.get("/api/plugins/demo/status", None).await;
    assert_eq!(anonymous.status(), 401);
    let unknown = host.get("/api/plugins/demo/status", Some("bogus")).await;
    assert_eq!(unknown.status(), 401);
    assert_eq!(probe.api_calls(), 0);

    let signed_in = host.get("/api/plugins/demo/status", Some(USER_TOKEN)).await;
    assert_eq!(signed_in.status(), 200);
    assert_eq!(json_body(&signed_in), json!({ "user": "alice" }));
    assert_eq!(probe.api_calls(), 1);
}

#[tokio::test]
async fn admin_routes_reject_regular_users_before_the_plugin_runs() {
    let (host, probe) = single("demo").await;

    let denied = host.get("/api/plugins/demo/admin", Some(USER_TOKEN)).await;
    assert_eq!(denied.status(), 403);
    assert_eq!(probe.api_calls(), 0);

    let allowed = host.get("/api/plugins/demo/admin", Some(ADMIN_TOKEN)).await;
    assert_eq!(allowed.status(), 200);
    assert_eq!(json_body(&allowed), json!({ "admin": "root" }));
    assert_eq!(probe.api_calls(), 1);
}

#[tokio::test]
async fn plugins_read_host_config_through_the_request_handle() {
    let (host, _) = single("demo").await;

    let found = host
        .get("/api/plugins/demo/config?key=plugins.demo.key", None)
        .await;
    assert_eq!(found.status(), 200);
    let body = json_body(&found);
    assert_eq!(body["value"], "abc");
    assert!(body["broker"].as_u64().is_some());

    let empty = host
        .get("/api/plugins/demo/config?key=plugins.demo.empty", None)
        .await;
    assert_eq!(json_body(&empty)["value"], "");

    let missing = host
        .get("/api/plugins/demo/config?key=plugins.demo.absent", None)
        .await;
    assert_eq!(missing.status(), 404);
    assert_eq!(json_body(&missing), json!({ "missing": "plugins.demo.absent" }));
}

#[tokio::test]
async fn concurrent_requests_keep_their_own_callbacks() {
    let (host, _) = single("demo").await;

    let first = host.get("/api/plugins/demo/config?key=plugins.demo.key&delay_ms=50", None);
    let second = host.get("/api/plugins/demo/config?key=plugins.demo.other&delay_ms=10", None);
    let (first, second) = tokio::join!(first, second);

    let first = json_body(&first);
    let second = json_body(&second);
    assert_eq!(first["value"], "abc");
    assert_eq!(second["value"], "xyz");
    assert_ne!(first["broker"], second["broker"]);
}

#[tokio::test]
async fn handles_stop_working_once_the_request_is_over() {
    let (host, _) = single("demo").await;

    let stashed = host.get("/api/plugins/demo/stash", None).await;
    assert_eq!(stashed.status(), 204);

    let reused = host.get("/api/plugins/demo/stale", None).await;
    assert_eq!(reused.status(), 200);
    assert_eq!(json_body(&reused), json!({ "unavailable": true }));
    assert_eq!(host.manager.get("demo").unwrap().broker().open_listeners(), 0);
}

#[tokio::test]
async fn plugin_faults_and_timeouts_map_to_gateway_errors() {
    let mut options = fast_options();
    options.timeouts.dispatch = Duration::from_millis(100);
    let probe = Probe::default();
    let shared = probe.clone();
    let launcher = InProcessLauncher::new()
        .with_plugin("demo", move || StubPlugin::new("demo", shared.clone()));
    let host = Harness::start(launcher, &["demo"], options).await;

    let fault = host.get("/api/plugins/demo/fault", None).await;
    assert_eq!(fault.status(), 500);

    let slow = host.get("/api/plugins/demo/slow?ms=1000", None).await;
    assert_eq!(slow.status(), 504);

    // A timed-out call does not take the plugin down.
    let after = host.get("/api/plugins/demo/hello", None).await;
    assert_eq!(after.status(), 200);
}

#[tokio::test]
async fn prefix_routes_forward_the_full_path() {
    let (host, _) = single("demo").await;

    let known = host.get("/api/plugins/demo/files/known", None).await;
    assert_eq!(known.status(), 200);
    assert_eq!(known.body().as_ref(), b"known file");

    let other = host.get("/api/plugins/demo/files/nested/other", None).await;
    assert_eq!(other.status(), 404);
}

#[tokio::test]
async fn unmatched_paths_fall_through_to_the_host() {
    let (host, probe) = single("demo").await;

    let response = host.get("/api/plugins/demo/nowhere", None).await;
    assert_eq!(response.status(), 404);
    assert_eq!(json_body(&response), json!({ "error": "no matching route" }));

    let wrong_method = host.post("/api/plugins/demo/hello", None, "").await;
    assert_eq!(wrong_method.status(), 404);
    assert_eq!(probe.api_calls(), 0);
}

#[tokio::test]
async fn first_plugin_keeps_a_contested_route() {
    let probe_a = Probe::default();
    let probe_b = Probe::default();
    let (shared_a, shared_b) = (probe_a.clone(), probe_b.clone());
    let shared_route = "/api/plugins/shared/hello";
    let launcher = InProcessLauncher::new()
        .with_plugin("alpha", move || {
            StubPlugin::new("alpha", shared_a.clone())
                .with_routes(vec![RouteDescriptor::get(shared_route, AuthLevel::None)])
        })
        .with_plugin("beta", move || {
            StubPlugin::new("beta", shared_b.clone()).with_routes(vec![
                RouteDescriptor::get(shared_route, AuthLevel::None),
                RouteDescriptor::get("/api/plugins/beta/hello", AuthLevel::None),
            ])
        });
    let host = Harness::start(launcher, &[], fast_options()).await;
    host.manager.add_plugin(marquee_core::catalog::PluginSpec::bundled("alpha"), true);
    host.manager.add_plugin(marquee_core::catalog::PluginSpec::bundled("beta"), true);

    let alpha = host.manager.load("alpha").await.unwrap();
    assert_eq!(alpha.registered.len(), 1);
    let beta = host.manager.load("beta").await.unwrap();
    assert_eq!(beta.conflicts.len(), 1);
    assert_eq!(beta.conflicts[0].owner, "alpha");
    assert_eq!(beta.registered.len(), 1);

    // The stub answers 404 for paths outside its own prefix, so only the
    // call counters tell who served the contested route.
    host.get(shared_route, None).await;
    assert_eq!(probe_a.api_calls(), 1);
    assert_eq!(probe_b.api_calls(), 0);

    let own = host.get("/api/plugins/beta/hello", None).await;
    assert_eq!(json_body(&own), json!({ "message": "hello from beta" }));
}
