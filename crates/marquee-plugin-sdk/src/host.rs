//! Plugin-side client for services the host exposes during a dispatch.
//!
//! A [`HostServices`] value is handed to [`Plugin::handle_api`] and is bound
//! to the broker listener the host opened for that single request. Once the
//! host has answered the request the listener is gone and every call fails
//! with [`SdkError::Unavailable`].
//!
//! [`Plugin::handle_api`]: crate::Plugin::handle_api

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::rpc::{Pending, RpcError};
use crate::types::SdkHandle;
use crate::wire::{BrokerCall, BrokerReply, Fault, FaultCode, Frame};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SdkError {
    #[error("config key `{0}` not found")]
    NotFound(String),
    #[error("config key `{0}` does not hold a string")]
    TypeMismatch(String),
    #[error("host callback channel unavailable: {0}")]
    Unavailable(String),
    #[error("host callback timed out after {0:?}")]
    Timeout(Duration),
    #[error("host rejected the call: {0}")]
    Host(String),
}

pub(crate) type CallbackTable = Pending<Result<BrokerReply, Fault>>;

/// Shared write half and pending table used for plugin-initiated calls.
#[derive(Debug, Clone)]
pub(crate) struct CallbackLink {
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) pending: Arc<CallbackTable>,
    pub(crate) timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HostServices {
    handle: Option<SdkHandle>,
    link: CallbackLink,
}

impl HostServices {
    pub(crate) fn new(handle: Option<SdkHandle>, link: CallbackLink) -> Self {
        Self { handle, link }
    }

    /// Services with no host behind them; every call reports `Unavailable`.
    ///
    /// Handy for unit-testing a plugin's handlers without a host.
    pub fn detached() -> Self {
        let (outbound, _) = mpsc::channel(1);
        let pending = Arc::new(CallbackTable::new());
        pending.close();
        Self {
            handle: None,
            link: CallbackLink {
                outbound,
                pending,
                timeout: Duration::from_secs(1),
            },
        }
    }

    pub fn is_available(&self) -> bool {
        self.handle.is_some() && !self.link.pending.is_closed()
    }

    /// Raw JSON bytes stored under `key`.
    pub async fn config_get(&self, key: &str) -> Result<Vec<u8>, SdkError> {
        match self.call(BrokerCall::ConfigGet { key: key.to_string() }).await? {
            BrokerReply::Raw(bytes) => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    /// The value under `key`, which must be a JSON string.
    pub async fn config_get_string(&self, key: &str) -> Result<String, SdkError> {
        match self
            .call(BrokerCall::ConfigGetString { key: key.to_string() })
            .await?
        {
            BrokerReply::Text(text) => Ok(text),
            other => Err(unexpected(&other)),
        }
    }

    /// Stores raw JSON bytes; the host rejects bytes that are not JSON.
    pub async fn config_set(&self, key: &str, value: &[u8]) -> Result<(), SdkError> {
        let call = BrokerCall::ConfigSet {
            key: key.to_string(),
            value: value.to_vec(),
        };
        match self.call(call).await? {
            BrokerReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn config_set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SdkError> {
        let bytes = serde_json::to_vec(value).map_err(|err| SdkError::Host(err.to_string()))?;
        self.config_set(key, &bytes).await
    }

    pub async fn config_delete(&self, key: &str) -> Result<(), SdkError> {
        match self
            .call(BrokerCall::ConfigDelete { key: key.to_string() })
            .await?
        {
            BrokerReply::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&self, call: BrokerCall) -> Result<BrokerReply, SdkError> {
        let Some(handle) = self.handle else {
            return Err(SdkError::Unavailable(
                "request carries no host handle".to_string(),
            ));
        };
        let key = call.key().to_string();
        let ticket = self
            .link
            .pending
            .register()
            .map_err(|err| SdkError::Unavailable(err.to_string()))?;
        let frame = Frame::Callback {
            id: ticket.id(),
            broker: handle.broker_id(),
            call,
        };
        match ticket
            .send_and_wait(&self.link.outbound, frame, self.link.timeout)
            .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(fault)) => Err(from_fault(fault, key)),
            Err(RpcError::Timeout(after)) => Err(SdkError::Timeout(after)),
            Err(err) => Err(SdkError::Unavailable(err.to_string())),
        }
    }
}

fn from_fault(fault: Fault, key: String) -> SdkError {
    match fault.code {
        FaultCode::NotFound => SdkError::NotFound(key),
        FaultCode::TypeMismatch => SdkError::TypeMismatch(key),
        FaultCode::Unavailable => SdkError::Unavailable(fault.message),
        FaultCode::BadRequest | FaultCode::Internal => SdkError::Host(fault.message),
    }
}

fn unexpected(reply: &BrokerReply) -> SdkError {
    SdkError::Host(format!("unexpected broker reply {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked(handle: Option<SdkHandle>) -> (HostServices, mpsc::Receiver<Frame>, Arc<CallbackTable>) {
        let (outbound, rx) = mpsc::channel(8);
        let pending = Arc::new(CallbackTable::new());
        let link = CallbackLink {
            outbound,
            pending: Arc::clone(&pending),
            timeout: Duration::from_millis(200),
        };
        (HostServices::new(handle, link), rx, pending)
    }

    #[tokio::test]
    async fn detached_services_are_unavailable() {
        let services = HostServices::detached();
        assert!(!services.is_available());
        assert!(matches!(
            services.config_get_string("plugins.demo.key").await,
            Err(SdkError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn calls_are_addressed_to_the_request_listener() {
        let (services, mut rx, pending) = linked(Some(SdkHandle::new(9)));
        let call = tokio::spawn(async move { services.config_get_string("plugins.demo.key").await });

        let Some(Frame::Callback { id, broker, call: sent }) = rx.recv().await else {
            panic!("expected a callback frame");
        };
        assert_eq!(broker, 9);
        assert_eq!(sent, BrokerCall::ConfigGetString { key: "plugins.demo.key".into() });
        assert!(pending.resolve(id, Ok(BrokerReply::Text("abc".into()))));
        assert_eq!(call.await.unwrap(), Ok("abc".to_string()));
    }

    #[tokio::test]
    async fn not_found_is_distinct_from_empty() {
        let (services, mut rx, pending) = linked(Some(SdkHandle::new(1)));
        let call = tokio::spawn(async move { services.config_get_string("missing").await });
        let Some(Frame::Callback { id, .. }) = rx.recv().await else {
            panic!("expected a callback frame");
        };
        pending.resolve(id, Err(Fault::not_found("missing")));
        assert_eq!(call.await.unwrap(), Err(SdkError::NotFound("missing".into())));
    }

    #[tokio::test]
    async fn silent_host_times_out() {
        let (services, _rx, _pending) = linked(Some(SdkHandle::new(1)));
        let result = services.config_delete("k").await;
        assert_eq!(result, Err(SdkError::Timeout(Duration::from_millis(200))));
    }

    #[tokio::test]
    async fn full_outbound_queue_times_out() {
        let (outbound, _rx) = mpsc::channel(1);
        outbound
            .try_send(Frame::CallbackReply { id: 0, result: Ok(BrokerReply::Ack) })
            .unwrap();
        let pending = Arc::new(CallbackTable::new());
        let link = CallbackLink {
            outbound,
            pending: Arc::clone(&pending),
            timeout: Duration::from_millis(50),
        };
        let services = HostServices::new(Some(SdkHandle::new(1)), link);

        let result = tokio::time::timeout(Duration::from_secs(2), services.config_delete("k"))
            .await
            .expect("call must not outlive its timeout");
        assert_eq!(result, Err(SdkError::Timeout(Duration::from_millis(50))));
        assert!(pending.is_empty());
    }
}
