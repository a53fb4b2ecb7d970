//! Frames exchanged over the plugin's standard streams.
//!
//! One connection carries two independent services. The host issues
//! [`HostCall`]s and the plugin answers with [`Frame::Reply`]; while serving
//! a `handle_api` call the plugin may issue [`BrokerCall`]s addressed to the
//! broker listener named in the request's [`SdkHandle`](crate::SdkHandle),
//! answered with [`Frame::CallbackReply`]. Each side allocates the ids of the
//! calls it initiates, so the two id spaces never collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    Event, PluginHttpRequest, PluginHttpResponse, PluginMetadata, RouteDescriptor, UiManifest,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        magic_cookie: String,
        protocol_version: u32,
    },
    Call {
        id: u64,
        call: HostCall,
    },
    Reply {
        id: u64,
        result: Result<HostReply, Fault>,
    },
    Callback {
        id: u64,
        broker: u64,
        call: BrokerCall,
    },
    CallbackReply {
        id: u64,
        result: Result<BrokerReply, Fault>,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Call { .. } => "call",
            Frame::Reply { .. } => "reply",
            Frame::Callback { .. } => "callback",
            Frame::CallbackReply { .. } => "callback_reply",
        }
    }
}

/// Host-initiated operations a plugin serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum HostCall {
    Metadata,
    ApiRoutes,
    HandleApi(PluginHttpRequest),
    UiManifest,
    HandleEvent(Event),
    Shutdown,
}

impl HostCall {
    pub fn kind(&self) -> &'static str {
        match self {
            HostCall::Metadata => "metadata",
            HostCall::ApiRoutes => "api_routes",
            HostCall::HandleApi(_) => "handle_api",
            HostCall::UiManifest => "ui_manifest",
            HostCall::HandleEvent(_) => "handle_event",
            HostCall::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HostReply {
    Metadata(PluginMetadata),
    ApiRoutes(Vec<RouteDescriptor>),
    Response(PluginHttpResponse),
    UiManifest(UiManifest),
    Ack,
}

/// Plugin-initiated configuration operations served by the host broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BrokerCall {
    ConfigGet {
        key: String,
    },
    ConfigGetString {
        key: String,
    },
    ConfigSet {
        key: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    ConfigDelete {
        key: String,
    },
}

impl BrokerCall {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerCall::ConfigGet { .. } => "config_get",
            BrokerCall::ConfigGetString { .. } => "config_get_string",
            BrokerCall::ConfigSet { .. } => "config_set",
            BrokerCall::ConfigDelete { .. } => "config_delete",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            BrokerCall::ConfigGet { key }
            | BrokerCall::ConfigGetString { key }
            | BrokerCall::ConfigSet { key, .. }
            | BrokerCall::ConfigDelete { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BrokerReply {
    Raw(#[serde(with = "base64_bytes")] Vec<u8>),
    Text(String),
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    NotFound,
    TypeMismatch,
    Unavailable,
    BadRequest,
    Internal,
}

impl FaultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultCode::NotFound => "not_found",
            FaultCode::TypeMismatch => "type_mismatch",
            FaultCode::Unavailable => "unavailable",
            FaultCode::BadRequest => "bad_request",
            FaultCode::Internal => "internal",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value carried across the wire in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
}

impl Fault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FaultCode::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FaultCode::Unavailable, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(FaultCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultCode::Internal, message)
    }
}

/// Serde adapter writing byte payloads as standard base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_calls_serialize_without_params() {
        let frame = Frame::Call {
            id: 7,
            call: HostCall::Metadata,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"kind": "call", "id": 7, "call": {"method": "metadata"}})
        );
    }

    #[test]
    fn fault_replies_decode() {
        let raw = r#"{"kind":"callback_reply","id":3,"result":{"Err":{"code":"not_found","message":"plugins.demo.key"}}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            Frame::CallbackReply {
                id: 3,
                result: Err(Fault::not_found("plugins.demo.key")),
            }
        );
    }

    #[test]
    fn broker_calls_carry_their_listener() {
        let raw = r#"{"kind":"callback","id":1,"broker":42,"call":{"method":"config_get_string","key":"plugins.demo.key"}}"#;
        let Frame::Callback { broker, call, .. } = serde_json::from_str::<Frame>(raw).unwrap() else {
            panic!("expected callback frame");
        };
        assert_eq!(broker, 42);
        assert_eq!(call.kind(), "config_get_string");
        assert_eq!(call.key(), "plugins.demo.key");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let raw = r#"{"method":"config_set","key":"k","value":"***"}"#;
        assert!(serde_json::from_str::<BrokerCall>(raw).is_err());
    }
}
