use std::{future::Future, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http::{header::CONTENT_TYPE, request::Parts, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::{body::Incoming, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use marquee_plugin_sdk::{AuthLevel, Event};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::{
    config::{Config, Tls},
    contracts::{AuthResolver, Caller},
    dispatcher::{json_error, Dispatcher, Routed},
    error::LoadError,
    manager::PluginManager,
};

/// Request handling for the whole host: plugin routes first, then the
/// host's own plugin endpoints.
pub struct HostService {
    dispatcher: Dispatcher,
    manager: Arc<PluginManager>,
    auth: Arc<dyn AuthResolver>,
}

impl HostService {
    pub fn new(manager: Arc<PluginManager>, auth: Arc<dyn AuthResolver>) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&manager), Arc::clone(&auth)),
            manager,
            auth,
        }
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let start = Instant::now();
        let span = tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            plugin = tracing::field::Empty,
            status = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );
        let response = async {
            match self.dispatcher.dispatch(request).await {
                Routed::Handled(response) => response,
                Routed::Unmatched(request) => self.host_route(request).await,
            }
        }
        .instrument(span.clone())
        .await;
        span.record("status", response.status().as_u16());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        response
    }

    async fn host_route(&self, request: Request<Bytes>) -> Response<Bytes> {
        let (parts, body) = request.into_parts();
        let segments: Vec<&str> = parts
            .uri
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        match (&parts.method, segments.as_slice()) {
            (&Method::GET, ["api", "ui", "plugins"]) => {
                if let Err(denied) = self.require(&parts, AuthLevel::Session).await {
                    return denied;
                }
                json_ok(StatusCode::OK, &self.manager.ui_manifests())
            }
            (&Method::GET, ["api", "admin", "plugins"]) => {
                if let Err(denied) = self.require(&parts, AuthLevel::Admin).await {
                    return denied;
                }
                json_ok(StatusCode::OK, &self.manager.statuses())
            }
            (&Method::POST, ["api", "admin", "plugins", id, action]) => {
                let caller = match self.require(&parts, AuthLevel::Admin).await {
                    Ok(caller) => caller,
                    Err(denied) => return denied,
                };
                tracing::info!(plugin = %id, action = %action, user = %caller.user_id, "plugin admin action");
                match *action {
                    "reload" => match self.manager.reload(id).await {
                        Ok(report) => json_ok(StatusCode::OK, &report),
                        Err(err) => load_error(&err),
                    },
                    "enable" => match self.manager.set_enabled(id, true).await {
                        Ok(report) => json_ok(
                            StatusCode::OK,
                            &serde_json::json!({ "id": id, "enabled": true, "load": report }),
                        ),
                        Err(err) => load_error(&err),
                    },
                    "disable" => match self.manager.set_enabled(id, false).await {
                        Ok(_) => json_ok(
                            StatusCode::OK,
                            &serde_json::json!({ "id": id, "enabled": false }),
                        ),
                        Err(err) => load_error(&err),
                    },
                    _ => json_error(StatusCode::NOT_FOUND, "no matching route"),
                }
            }
            (&Method::POST, ["api", "admin", "events"]) => {
                if let Err(denied) = self.require(&parts, AuthLevel::Admin).await {
                    return denied;
                }
                let event: Event = match serde_json::from_slice(&body) {
                    Ok(event) => event,
                    Err(err) => {
                        return json_error(StatusCode::BAD_REQUEST, &format!("invalid event: {err}"))
                    }
                };
                let queued = self.manager.publish(&event);
                json_ok(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({ "type": event.kind, "queued": queued }),
                )
            }
            _ => json_error(StatusCode::NOT_FOUND, "no matching route"),
        }
    }

    async fn require(&self, parts: &Parts, level: AuthLevel) -> Result<Caller, Response<Bytes>> {
        let Some(caller) = self.auth.resolve(parts).await else {
            return Err(json_error(StatusCode::UNAUTHORIZED, "authentication required"));
        };
        if level == AuthLevel::Admin && !caller.is_admin {
            return Err(json_error(StatusCode::FORBIDDEN, "administrator access required"));
        }
        Ok(caller)
    }
}

fn json_ok<T: Serialize>(status: StatusCode, value: &T) -> Response<Bytes> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to encode response");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn load_error(err: &LoadError) -> Response<Bytes> {
    let status = match err {
        LoadError::UnknownPlugin(_) => StatusCode::NOT_FOUND,
        LoadError::Disabled(_) | LoadError::AlreadyLoaded(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_GATEWAY,
    };
    json_error(status, &err.to_string())
}

/// HTTP listener in front of a [`HostService`].
pub struct Server {
    service: Arc<HostService>,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(config: &Config, service: HostService) -> Result<Self> {
        config.validate()?;
        let addr = config.server.parse_bind_addr()?;
        let acceptor = match &config.server.tls {
            Some(tls) => Some(TlsAcceptor::from(Arc::new(build_tls_config(tls)?))),
            None => None,
        };
        Ok(Self {
            service: Arc::new(service),
            addr,
            acceptor,
        })
    }

    /// Serves until Ctrl-C, then unloads every plugin.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        let manager = Arc::clone(self.service.manager());
        let shutdown = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown signal received; draining"),
                Err(err) => tracing::error!(error = %err, "failed to install ctrl-c handler"),
            }
        };
        let result = self.serve(listener, shutdown).await;
        manager.shutdown().await;
        result
    }

    /// Accepts connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, tls = self.acceptor.is_some(), "listener ready");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!(%addr, "listener shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let service = Arc::clone(&self.service);
                    let acceptor = self.acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(acceptor, service, stream).await {
                            tracing::warn!(%peer, error = %err, "connection closed with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    acceptor: Option<TlsAcceptor>,
    service: Arc<HostService>,
    stream: TcpStream,
) -> Result<()> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await?;
            serve_connection(tls, service).await
        }
        None => serve_connection(stream, service).await,
    }
}

async fn serve_connection<I>(io: I, service: Arc<HostService>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let svc = service_fn(move |req: Request<Incoming>| {
        let service = Arc::clone(&service);
        async move {
            let (parts, body) = req.into_parts();
            let response = match body.collect().await {
                Ok(collected) => {
                    let request = Request::from_parts(parts, collected.to_bytes());
                    service.handle(request).await
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read request body");
                    json_error(StatusCode::BAD_REQUEST, "unreadable request body")
                }
            };
            Ok::<_, hyper::Error>(response.map(Full::new))
        }
    });
    http1::Builder::new()
        .serve_connection(TokioIo::new(io), svc)
        .await
        .context("connection handling failed")
}

fn build_tls_config(tls: &Tls) -> Result<ServerConfig> {
    let certs = load_certs(&tls.cert)?;
    let key = load_private_key(&tls.key)?;
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| format!("{} does not match {}", tls.key, tls.cert))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Every PEM section in `path`, in file order.
fn read_pem(path: &str) -> Result<Vec<Item>> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open {path}"))?;
    let mut reader = std::io::BufReader::new(file);
    std::iter::from_fn(|| rustls_pemfile::read_one(&mut reader).transpose())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("{path} is not valid PEM"))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let certs: Vec<_> = read_pem(path)?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();
    if certs.is_empty() {
        bail!("no certificates found in {path}");
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    read_pem(path)?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("no usable private keys found in {path}"))
}
