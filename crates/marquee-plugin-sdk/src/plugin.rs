use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;

use crate::codec::{CodecError, FrameCodec};
use crate::handshake::{HandshakeConfig, HandshakeError};
use crate::host::{CallbackLink, CallbackTable, HostServices};
use crate::rpc::spawn_writer;
use crate::types::{
    Event, PluginHttpRequest, PluginHttpResponse, PluginMetadata, RouteDescriptor, UiManifest,
};
use crate::wire::{Fault, Frame, HostCall, HostReply};

/// Capability set every plugin implements.
///
/// The runtime calls these concurrently; an implementation guards its own
/// shared state. Only `metadata` is mandatory.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    async fn metadata(&self) -> Result<PluginMetadata, Fault>;

    async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, Fault> {
        Ok(Vec::new())
    }

    async fn handle_api(
        &self,
        _request: PluginHttpRequest,
        _host: HostServices,
    ) -> Result<PluginHttpResponse, Fault> {
        Ok(PluginHttpResponse::not_found())
    }

    async fn ui_manifest(&self) -> Result<UiManifest, Fault> {
        Ok(UiManifest::default())
    }

    async fn handle_event(&self, _event: Event) -> Result<(), Fault> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("host connection failed: {0}")]
    Codec(#[from] CodecError),
    #[error("host connection closed before the hello was sent")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub handshake: HandshakeConfig,
    /// Bound on every host callback made through [`HostServices`].
    pub callback_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            callback_timeout: Duration::from_secs(5),
        }
    }
}

/// Runs `plugin` over stdin/stdout until the host hangs up or asks it to stop.
///
/// Returns [`HandshakeError::NotLaunchedByHost`] when started by hand.
pub async fn serve<P: Plugin>(plugin: P) -> Result<(), ServeError> {
    let options = ServeOptions::default();
    options.handshake.check_env()?;
    serve_io(
        Arc::new(plugin),
        tokio::io::stdin(),
        tokio::io::stdout(),
        options,
    )
    .await
}

/// Runs `plugin` over an arbitrary byte stream pair.
pub async fn serve_io<R, W>(
    plugin: Arc<dyn Plugin>,
    reader: R,
    writer: W,
    options: ServeOptions,
) -> Result<(), ServeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, writer_task) = spawn_writer(writer);
    outbound
        .send(options.handshake.hello())
        .await
        .map_err(|_| ServeError::Closed)?;

    let callbacks = Arc::new(CallbackTable::new());
    let link = CallbackLink {
        outbound: outbound.clone(),
        pending: Arc::clone(&callbacks),
        timeout: options.callback_timeout,
    };
    let mut frames = FramedRead::new(reader, FrameCodec::new());
    let mut handlers = JoinSet::new();
    let (events, queued) = mpsc::unbounded_channel();
    handlers.spawn(deliver_events(
        Arc::clone(&plugin),
        link.clone(),
        outbound.clone(),
        queued,
    ));

    let result = loop {
        let next = tokio::select! {
            biased;
            Some(_) = handlers.join_next(), if !handlers.is_empty() => continue,
            next = frames.next() => next,
        };
        match next {
            None => break Ok(()),
            Some(Err(err)) => break Err(ServeError::Codec(err)),
            Some(Ok(Frame::Call {
                id,
                call: HostCall::Shutdown,
            })) => {
                tracing::debug!("host requested shutdown");
                outbound
                    .send(Frame::Reply {
                        id,
                        result: Ok(HostReply::Ack),
                    })
                    .await
                    .ok();
                break Ok(());
            }
            Some(Ok(Frame::Call {
                id,
                call: HostCall::HandleEvent(event),
            })) => {
                if events.send((id, event)).is_err() {
                    tracing::warn!(id, "event worker is gone, dropping event");
                }
            }
            Some(Ok(Frame::Call { id, call })) => {
                handlers.spawn(answer(
                    Arc::clone(&plugin),
                    link.clone(),
                    outbound.clone(),
                    id,
                    call,
                ));
            }
            Some(Ok(Frame::CallbackReply { id, result })) => {
                if !callbacks.resolve(id, result) {
                    tracing::debug!(id, "dropping reply for abandoned host callback");
                }
            }
            Some(Ok(other)) => {
                tracing::warn!(kind = other.kind(), "ignoring unexpected frame from host");
            }
        }
    };

    drop(events);
    callbacks.close();
    handlers.shutdown().await;
    drop(link);
    drop(outbound);
    writer_task.await.ok();
    result
}

/// Hands events to the plugin one at a time, in arrival order, even when the
/// host has already given up waiting on an earlier one.
async fn deliver_events(
    plugin: Arc<dyn Plugin>,
    link: CallbackLink,
    outbound: mpsc::Sender<Frame>,
    mut queued: mpsc::UnboundedReceiver<(u64, Event)>,
) {
    while let Some((id, event)) = queued.recv().await {
        answer(
            Arc::clone(&plugin),
            link.clone(),
            outbound.clone(),
            id,
            HostCall::HandleEvent(event),
        )
        .await;
    }
}

async fn answer(
    plugin: Arc<dyn Plugin>,
    link: CallbackLink,
    outbound: mpsc::Sender<Frame>,
    id: u64,
    call: HostCall,
) {
    let kind = call.kind();
    let result = match call {
        HostCall::Metadata => plugin.metadata().await.map(HostReply::Metadata),
        HostCall::ApiRoutes => plugin.api_routes().await.map(HostReply::ApiRoutes),
        HostCall::HandleApi(request) => {
            let host = HostServices::new(request.sdk, link);
            plugin
                .handle_api(request, host)
                .await
                .map(HostReply::Response)
        }
        HostCall::UiManifest => plugin.ui_manifest().await.map(HostReply::UiManifest),
        HostCall::HandleEvent(event) => plugin.handle_event(event).await.map(|()| HostReply::Ack),
        HostCall::Shutdown => Ok(HostReply::Ack),
    };
    if let Err(fault) = &result {
        tracing::debug!(call = kind, %fault, "plugin call failed");
    }
    if outbound.send(Frame::Reply { id, result }).await.is_err() {
        tracing::debug!(call = kind, "host went away before the reply was sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthLevel, Capability};
    use futures::SinkExt;
    use tokio::io::duplex;
    use tokio_util::codec::{FramedRead, FramedWrite};

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        async fn metadata(&self) -> Result<PluginMetadata, Fault> {
            Ok(PluginMetadata::new("echo", "Echo", "1.0.0").with_capability(Capability::Api))
        }

        async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, Fault> {
            Ok(vec![RouteDescriptor::post("/api/plugins/echo", AuthLevel::None)])
        }

        async fn handle_api(
            &self,
            request: PluginHttpRequest,
            _host: HostServices,
        ) -> Result<PluginHttpResponse, Fault> {
            Ok(PluginHttpResponse::new(200).with_body(request.body))
        }
    }

    #[tokio::test]
    async fn serves_calls_and_stops_on_shutdown() {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        let runtime = tokio::spawn(serve_io(
            Arc::new(Echo),
            plugin_read,
            plugin_write,
            ServeOptions::default(),
        ));

        let (host_read, host_write) = tokio::io::split(host_side);
        let mut frames = FramedRead::new(host_read, FrameCodec::new());
        let mut sink = FramedWrite::new(host_write, FrameCodec::new());

        let hello = frames.next().await.unwrap().unwrap();
        assert_eq!(HandshakeConfig::default().verify(&hello), Ok(()));

        let request = PluginHttpRequest {
            method: "POST".into(),
            path: "/api/plugins/echo".into(),
            body: b"ping".to_vec(),
            ..PluginHttpRequest::default()
        };
        sink.send(Frame::Call {
            id: 1,
            call: HostCall::HandleApi(request),
        })
        .await
        .unwrap();
        match frames.next().await.unwrap().unwrap() {
            Frame::Reply {
                id: 1,
                result: Ok(HostReply::Response(response)),
            } => assert_eq!(response.body, b"ping"),
            other => panic!("unexpected reply {other:?}"),
        }

        sink.send(Frame::Call {
            id: 2,
            call: HostCall::Shutdown,
        })
        .await
        .unwrap();
        let ack = frames.next().await.unwrap().unwrap();
        assert_eq!(
            ack,
            Frame::Reply {
                id: 2,
                result: Ok(HostReply::Ack)
            }
        );
        runtime.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn default_handlers_answer_not_found_and_empty_manifest() {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        tokio::spawn(serve_io(
            Arc::new(Echo),
            plugin_read,
            plugin_write,
            ServeOptions::default(),
        ));
        let (host_read, host_write) = tokio::io::split(host_side);
        let mut frames = FramedRead::new(host_read, FrameCodec::new());
        let mut sink = FramedWrite::new(host_write, FrameCodec::new());
        frames.next().await.unwrap().unwrap();

        sink.send(Frame::Call {
            id: 5,
            call: HostCall::UiManifest,
        })
        .await
        .unwrap();
        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::Reply {
                id: 5,
                result: Ok(HostReply::UiManifest(UiManifest::default()))
            }
        );
    }

    #[derive(Default)]
    struct SlowListener {
        active: std::sync::atomic::AtomicUsize,
        overlapped: std::sync::atomic::AtomicBool,
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Plugin for SlowListener {
        async fn metadata(&self) -> Result<PluginMetadata, Fault> {
            Ok(PluginMetadata::new("slow", "Slow", "1.0.0").with_capability(Capability::Api))
        }

        async fn handle_event(&self, event: Event) -> Result<(), Fault> {
            use std::sync::atomic::Ordering;
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.seen.lock().unwrap().push(event.kind);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_are_handled_one_at_a_time_in_order() {
        let listener = Arc::new(SlowListener::default());
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        tokio::spawn(serve_io(
            Arc::clone(&listener) as Arc<dyn Plugin>,
            plugin_read,
            plugin_write,
            ServeOptions::default(),
        ));
        let (host_read, host_write) = tokio::io::split(host_side);
        let mut frames = FramedRead::new(host_read, FrameCodec::new());
        let mut sink = FramedWrite::new(host_write, FrameCodec::new());
        frames.next().await.unwrap().unwrap();

        // Sent back to back without waiting, as a host does after timing out.
        for (id, kind) in [(1, "first"), (2, "second"), (3, "third")] {
            sink.send(Frame::Call {
                id,
                call: HostCall::HandleEvent(Event::new(kind, serde_json::Value::Null)),
            })
            .await
            .unwrap();
        }
        for expected in 1..=3 {
            match frames.next().await.unwrap().unwrap() {
                Frame::Reply {
                    id,
                    result: Ok(HostReply::Ack),
                } => assert_eq!(id, expected),
                other => panic!("unexpected reply {other:?}"),
            }
        }

        assert!(!listener.overlapped.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*listener.seen.lock().unwrap(), ["first", "second", "third"]);
    }
}
