use std::{sync::Arc, time::Duration};

use marquee_plugin_sdk::{
    rpc::RpcError,
    wire::{HostCall, HostReply},
    Event, PluginHttpRequest, PluginHttpResponse, PluginMetadata, RouteDescriptor, UiManifest,
};

use crate::{config::Timeouts, connection::Connection};

/// Typed host-to-plugin calls over a [`Connection`].
#[derive(Clone)]
pub struct PluginClient {
    conn: Arc<Connection>,
    timeouts: Timeouts,
}

impl PluginClient {
    pub fn new(conn: Connection, timeouts: Timeouts) -> Self {
        Self {
            conn: Arc::new(conn),
            timeouts,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn metadata(&self) -> Result<PluginMetadata, RpcError> {
        match self.conn.call(HostCall::Metadata, self.timeouts.call).await? {
            HostReply::Metadata(metadata) => Ok(metadata),
            _ => Err(RpcError::UnexpectedReply { call: "metadata" }),
        }
    }

    pub async fn api_routes(&self) -> Result<Vec<RouteDescriptor>, RpcError> {
        match self.conn.call(HostCall::ApiRoutes, self.timeouts.call).await? {
            HostReply::ApiRoutes(routes) => Ok(routes),
            _ => Err(RpcError::UnexpectedReply { call: "api_routes" }),
        }
    }

    pub async fn ui_manifest(&self) -> Result<UiManifest, RpcError> {
        match self.conn.call(HostCall::UiManifest, self.timeouts.call).await? {
            HostReply::UiManifest(manifest) => Ok(manifest),
            _ => Err(RpcError::UnexpectedReply { call: "ui_manifest" }),
        }
    }

    pub async fn handle_api(
        &self,
        request: PluginHttpRequest,
        timeout: Duration,
    ) -> Result<PluginHttpResponse, RpcError> {
        match self.conn.call(HostCall::HandleApi(request), timeout).await? {
            HostReply::Response(response) => Ok(response),
            _ => Err(RpcError::UnexpectedReply { call: "handle_api" }),
        }
    }

    pub async fn handle_event(&self, event: Event) -> Result<(), RpcError> {
        match self
            .conn
            .call(HostCall::HandleEvent(event), self.timeouts.event)
            .await?
        {
            HostReply::Ack => Ok(()),
            _ => Err(RpcError::UnexpectedReply { call: "handle_event" }),
        }
    }

    /// Asks the plugin to exit on its own.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        match self.conn.call(HostCall::Shutdown, self.timeouts.call).await? {
            HostReply::Ack => Ok(()),
            _ => Err(RpcError::UnexpectedReply { call: "shutdown" }),
        }
    }
}
