//! Shared contracts between the Marquee host and its out-of-process plugins.
//!
//! Both sides of the bridge link this crate: the host uses the wire types,
//! codec and pending-call tables to drive a plugin process, while a plugin
//! binary implements [`Plugin`] and hands it to [`serve`]. Nothing in here
//! depends on the host, so plugins never pull in the server stack.

pub mod codec;
pub mod handshake;
pub mod host;
pub mod manifest;
pub mod plugin;
pub mod rpc;
pub mod types;
pub mod wire;

pub use handshake::{HandshakeConfig, HandshakeError, PROTOCOL_VERSION};
pub use host::{HostServices, SdkError};
pub use manifest::PluginManifest;
pub use plugin::{serve, serve_io, Plugin, ServeError, ServeOptions};
pub use types::{
    AuthLevel, Capability, Event, NavItem, PluginHttpRequest, PluginHttpResponse, PluginMetadata,
    RouteDescriptor, SdkHandle, UiManifest, UiRoute,
};
pub use wire::{Fault, FaultCode};
