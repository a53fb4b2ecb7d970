//! Host end of one plugin's stdio connection.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use marquee_plugin_sdk::{
    codec::FrameCodec,
    rpc::{spawn_writer, Pending, RpcError},
    wire::{Frame, HostCall, HostReply},
    Fault, HandshakeConfig, HandshakeError,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::codec::FramedRead;

use crate::broker::Broker;

type ReplyTable = Pending<Result<HostReply, Fault>>;

/// A handshaken connection multiplexing host calls and plugin callbacks.
///
/// Any number of calls may be outstanding; each is matched to its reply by
/// id. Callbacks from the plugin are served concurrently by the broker and
/// answered on the same stream.
pub struct Connection {
    plugin: String,
    outbound: mpsc::Sender<Frame>,
    pending: Arc<ReplyTable>,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Waits for the plugin's hello, then starts serving the stream.
    pub async fn establish<R, W>(
        plugin: &str,
        reader: R,
        writer: W,
        handshake: &HandshakeConfig,
        timeout: Duration,
        broker: Arc<Broker>,
    ) -> Result<Self, HandshakeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let hello = match tokio::time::timeout(timeout, frames.next()).await {
            Err(_) => return Err(HandshakeError::Timeout(timeout)),
            Ok(None) => return Err(HandshakeError::Closed),
            Ok(Some(Err(err))) => return Err(HandshakeError::Transport(err.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };
        handshake.verify(&hello)?;
        tracing::debug!(plugin, "handshake complete");

        let (outbound, writer) = spawn_writer(writer);
        let pending = Arc::new(ReplyTable::new());
        let (closed_tx, closed) = watch::channel(false);
        let reader = tokio::spawn(read_loop(
            plugin.to_string(),
            frames,
            Arc::clone(&pending),
            outbound.clone(),
            broker,
            closed_tx,
        ));

        Ok(Self {
            plugin: plugin.to_string(),
            outbound,
            pending,
            closed,
            reader,
            writer,
        })
    }

    pub async fn call(&self, call: HostCall, timeout: Duration) -> Result<HostReply, RpcError> {
        let ticket = self.pending.register()?;
        let frame = Frame::Call {
            id: ticket.id(),
            call,
        };
        Ok(ticket.send_and_wait(&self.outbound, frame, timeout).await??)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the plugin's end of the stream has gone away.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the reader task is gone, which also means closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::trace!(plugin = %self.plugin, "dropping plugin connection");
        self.pending.close();
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<R>(
    plugin: String,
    mut frames: FramedRead<R, FrameCodec>,
    pending: Arc<ReplyTable>,
    outbound: mpsc::Sender<Frame>,
    broker: Arc<Broker>,
    closed: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    while let Some(next) = frames.next().await {
        match next {
            Ok(Frame::Reply { id, result }) => {
                if !pending.resolve(id, result) {
                    tracing::debug!(plugin = %plugin, id, "dropping reply for abandoned call");
                }
            }
            Ok(Frame::Callback { id, broker: listener, call }) => {
                let broker = Arc::clone(&broker);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let result = broker.serve(listener, call).await;
                    outbound.send(Frame::CallbackReply { id, result }).await.ok();
                });
            }
            Ok(other) => {
                tracing::warn!(plugin = %plugin, kind = other.kind(), "ignoring unexpected frame from plugin");
            }
            Err(err) => {
                tracing::warn!(plugin = %plugin, error = %err, "plugin stream failed");
                break;
            }
        }
    }
    tracing::debug!(plugin = %plugin, "plugin closed its stream");
    pending.close();
    closed.send_replace(true);
}
