//! Host side of the plugin callback channel.
//!
//! Each plugin gets one [`Broker`]. Before a request is handed to the plugin
//! the dispatcher opens a listener on it and embeds the listener id in the
//! request; the returned [`BrokerLease`] retires the listener when dropped.
//! Callbacks naming a listener that is not open are refused, so a handle
//! cannot outlive the request it was issued for.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use marquee_plugin_sdk::{
    wire::{BrokerCall, BrokerReply},
    Fault, FaultCode, SdkHandle,
};
use serde_json::Value;

use crate::contracts::{ConfigStore, StoreError};

#[derive(Debug, Clone)]
struct Listener {
    user_id: Option<String>,
}

pub struct Broker {
    plugin: String,
    store: Arc<dyn ConfigStore>,
    next_id: AtomicU64,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    listeners: HashMap<u64, Listener>,
    closed: bool,
}

impl Broker {
    pub fn new(plugin: impl Into<String>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            plugin: plugin.into(),
            store,
            next_id: AtomicU64::new(1),
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Opens a listener scoped to one dispatched request.
    ///
    /// Returns `None` once the broker is closed; the request then goes out
    /// without a handle and the plugin's callbacks are unavailable.
    pub fn open(self: &Arc<Self>, user_id: Option<String>) -> Option<BrokerLease> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.listeners.insert(id, Listener { user_id });
        Some(BrokerLease {
            broker: Arc::clone(self),
            id,
        })
    }

    pub fn open_listeners(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Retires every listener and refuses new ones.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.listeners.clear();
    }

    /// Answers one callback addressed to `listener`.
    pub async fn serve(&self, listener: u64, call: BrokerCall) -> Result<BrokerReply, Fault> {
        let scope = self.lock().listeners.get(&listener).cloned();
        let Some(scope) = scope else {
            tracing::debug!(plugin = %self.plugin, listener, call = call.kind(), "callback for a listener that is not open");
            return Err(Fault::unavailable(format!(
                "broker listener {listener} is not open"
            )));
        };
        tracing::trace!(
            plugin = %self.plugin,
            listener,
            call = call.kind(),
            key = call.key(),
            user = scope.user_id.as_deref().unwrap_or_default(),
            "serving plugin callback"
        );

        match call {
            BrokerCall::ConfigGet { key } => match self.store.get(&key).await {
                Ok(Some(bytes)) => Ok(BrokerReply::Raw(bytes)),
                Ok(None) => Err(Fault::not_found(key)),
                Err(err) => Err(store_fault(err)),
            },
            BrokerCall::ConfigGetString { key } => {
                let bytes = match self.store.get(&key).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return Err(Fault::not_found(key)),
                    Err(err) => return Err(store_fault(err)),
                };
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(Value::String(text)) => Ok(BrokerReply::Text(text)),
                    Ok(_) => Err(Fault::new(
                        FaultCode::TypeMismatch,
                        format!("`{key}` does not hold a string"),
                    )),
                    Err(err) => Err(Fault::internal(format!(
                        "stored value for `{key}` is not JSON: {err}"
                    ))),
                }
            }
            BrokerCall::ConfigSet { key, value } => {
                if serde_json::from_slice::<Value>(&value).is_err() {
                    return Err(Fault::bad_request(format!(
                        "value for `{key}` is not valid JSON"
                    )));
                }
                self.store
                    .set(&key, value)
                    .await
                    .map(|()| BrokerReply::Ack)
                    .map_err(store_fault)
            }
            BrokerCall::ConfigDelete { key } => match self.store.delete(&key).await {
                Ok(true) => Ok(BrokerReply::Ack),
                Ok(false) => Err(Fault::not_found(key)),
                Err(err) => Err(store_fault(err)),
            },
        }
    }

    fn retire(&self, id: u64) {
        self.lock().listeners.remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn store_fault(err: StoreError) -> Fault {
    match err {
        StoreError::InvalidValue { .. } => Fault::bad_request(err.to_string()),
        StoreError::Unavailable(_) => Fault::unavailable(err.to_string()),
    }
}

/// An open listener. Dropping it retires the listener id.
pub struct BrokerLease {
    broker: Arc<Broker>,
    id: u64,
}

impl BrokerLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> SdkHandle {
        SdkHandle::new(self.id)
    }
}

impl Drop for BrokerLease {
    fn drop(&mut self) {
        self.broker.retire(self.id);
    }
}
