//! Host side of the Marquee plugin bridge.
//!
//! The [`manager::PluginManager`] launches plugins and owns the
//! [`registry::RouteRegistry`]; the [`dispatcher::Dispatcher`] forwards
//! matching requests to them; [`server::Server`] puts both behind HTTP.

pub mod auth;
pub mod broker;
pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod contracts;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handle;
pub mod launcher;
pub mod manager;
pub mod registry;
pub mod server;
pub mod store;

pub use error::LoadError;
