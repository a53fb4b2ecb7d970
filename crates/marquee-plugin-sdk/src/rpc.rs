//! Call correlation shared by host and plugin.
//!
//! Every outstanding call owns a [`Ticket`]; the reader task of the
//! connection resolves tickets by id as replies arrive, in any order. Many
//! calls can be in flight over one connection at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::SinkExt;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use crate::codec::FrameCodec;
use crate::wire::{Fault, Frame};

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote fault: {0}")]
    Fault(#[from] Fault),
    #[error("unexpected reply to `{call}`")]
    UnexpectedReply { call: &'static str },
}

/// Table of calls awaiting a reply, keyed by the id this side allocated.
#[derive(Debug)]
pub struct Pending<T> {
    next_id: AtomicU64,
    state: Mutex<PendingState<T>>,
}

#[derive(Debug)]
struct PendingState<T> {
    waiters: HashMap<u64, oneshot::Sender<T>>,
    closed: bool,
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(PendingState {
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocates a fresh id and parks a waiter for it.
    pub fn register(self: &Arc<Self>) -> Result<Ticket<T>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::Closed);
        }
        state.waiters.insert(id, tx);
        Ok(Ticket {
            id,
            rx,
            pending: Arc::clone(self),
        })
    }

    /// Hands a reply to its waiter. Returns `false` for unknown or abandoned ids.
    pub fn resolve(&self, id: u64, value: T) -> bool {
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Fails every outstanding call and refuses new ones.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, PendingState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Claim on one outstanding call. Dropping it abandons the call.
#[derive(Debug)]
pub struct Ticket<T> {
    id: u64,
    rx: oneshot::Receiver<T>,
    pending: Arc<Pending<T>>,
}

impl<T> Ticket<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<T, RpcError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::Timeout(timeout)),
        }
    }

    /// Queues `frame` on `outbound` and waits for its reply. `timeout` bounds
    /// both steps, so a peer that stopped reading cannot stall the caller.
    pub async fn send_and_wait(
        mut self,
        outbound: &mpsc::Sender<Frame>,
        frame: Frame,
        timeout: Duration,
    ) -> Result<T, RpcError> {
        let exchange = async {
            outbound.send(frame).await.map_err(|_| RpcError::Closed)?;
            (&mut self.rx).await.map_err(|_| RpcError::Closed)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .unwrap_or(Err(RpcError::Timeout(timeout)))
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

/// Spawns the task that owns the write half of a connection.
///
/// Frames are written in the order they were queued. The task stops when the
/// last sender is dropped or the stream fails.
pub fn spawn_writer<W>(writer: W) -> (mpsc::Sender<Frame>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, FrameCodec::new());
        while let Some(frame) = rx.recv().await {
            if let Err(err) = sink.send(frame).await {
                tracing::warn!(error = %err, "frame writer stopped");
                break;
            }
        }
    });
    (tx, handle)
}
