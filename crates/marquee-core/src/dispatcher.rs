//! Forwarding inbound HTTP requests to the plugin that owns their route.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    header::{HeaderName, HeaderValue, CONTENT_TYPE},
    request::Parts,
    Request, Response, StatusCode,
};
use marquee_plugin_sdk::{
    rpc::RpcError, AuthLevel, PluginHttpRequest, PluginHttpResponse,
};

use crate::{
    contracts::{AuthResolver, Caller},
    manager::PluginManager,
};

/// Result of offering a request to the plugin routes.
#[derive(Debug)]
pub enum Routed {
    Handled(Response<Bytes>),
    /// No plugin owns the route; the request is handed back untouched.
    Unmatched(Request<Bytes>),
}

pub struct Dispatcher {
    manager: Arc<PluginManager>,
    auth: Arc<dyn AuthResolver>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(manager: Arc<PluginManager>, auth: Arc<dyn AuthResolver>) -> Self {
        let timeout = manager.options().timeouts.dispatch;
        Self {
            manager,
            auth,
            timeout,
        }
    }

    pub async fn dispatch(&self, request: Request<Bytes>) -> Routed {
        let registry = self.manager.registry();
        let Some(hit) = registry.lookup(request.method(), request.uri().path()) else {
            return Routed::Unmatched(request);
        };
        let span = tracing::Span::current();
        span.record("plugin", hit.plugin.as_str());

        let guard = self
            .manager
            .get(&hit.plugin)
            .and_then(|handle| handle.begin_request());
        let Some(guard) = guard else {
            tracing::warn!(plugin = %hit.plugin, "route owner is not usable");
            return Routed::Handled(reject("unavailable", StatusCode::SERVICE_UNAVAILABLE, "plugin unavailable"));
        };
        let handle = guard.handle();

        let (parts, body) = request.into_parts();
        let caller = match hit.route.auth {
            AuthLevel::None => None,
            level => match self.auth.resolve(&parts).await {
                None => {
                    return Routed::Handled(reject(
                        "unauthorized",
                        StatusCode::UNAUTHORIZED,
                        "authentication required",
                    ))
                }
                Some(Caller { is_admin: false, .. }) if level == AuthLevel::Admin => {
                    return Routed::Handled(reject(
                        "forbidden",
                        StatusCode::FORBIDDEN,
                        "administrator access required",
                    ))
                }
                Some(caller) => Some(caller),
            },
        };

        let user_id = caller.map(|caller| caller.user_id);
        let lease = handle.broker().open(user_id.clone());
        let mut plugin_request = to_plugin_request(&parts, body, user_id);
        plugin_request.sdk = lease.as_ref().map(|lease| lease.handle());

        metrics::counter!("marquee_plugin_requests_total", "outcome" => "hit").increment(1);
        let result = handle
            .client()
            .handle_api(plugin_request, self.timeout)
            .await;
        drop(lease);

        let response = match result {
            Ok(response) => match from_plugin_response(response) {
                Ok(response) => response,
                Err(reason) => {
                    tracing::error!(plugin = %hit.plugin, call = "handle_api", %reason, "plugin returned a malformed response");
                    reject("error", StatusCode::BAD_GATEWAY, "malformed plugin response")
                }
            },
            Err(RpcError::Timeout(after)) => {
                tracing::error!(plugin = %hit.plugin, call = "handle_api", ?after, "plugin call timed out");
                reject("timeout", StatusCode::GATEWAY_TIMEOUT, "plugin timed out")
            }
            Err(RpcError::Fault(fault)) => {
                tracing::error!(plugin = %hit.plugin, call = "handle_api", %fault, "plugin reported a fault");
                reject("error", StatusCode::INTERNAL_SERVER_ERROR, "plugin error")
            }
            Err(err) => {
                tracing::error!(plugin = %hit.plugin, call = "handle_api", error = %err, "plugin call failed");
                reject("error", StatusCode::BAD_GATEWAY, "plugin unreachable")
            }
        };
        Routed::Handled(response)
    }
}

fn to_plugin_request(parts: &Parts, body: Bytes, user_id: Option<String>) -> PluginHttpRequest {
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let query = parts
        .uri
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    PluginHttpRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        headers,
        query,
        body: body.to_vec(),
        user_id,
        sdk: None,
    }
}

fn from_plugin_response(response: PluginHttpResponse) -> Result<Response<Bytes>, String> {
    let status = StatusCode::from_u16(response.status)
        .map_err(|_| format!("invalid status code {}", response.status))?;
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid header name `{name}`"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("invalid value for header `{name}`"))?;
        builder = builder.header(name, value);
    }
    builder
        .body(Bytes::from(response.body))
        .map_err(|err| err.to_string())
}

fn reject(outcome: &'static str, status: StatusCode, message: &str) -> Response<Bytes> {
    metrics::counter!("marquee_plugin_requests_total", "outcome" => outcome).increment(1);
    json_error(status, message)
}

/// `{"error": message}` with the given status.
pub(crate) fn json_error(status: StatusCode, message: &str) -> Response<Bytes> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
