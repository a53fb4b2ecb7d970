use marquee_plugin_sdk::rpc::RpcError;
use marquee_plugin_sdk::HandshakeError;
use thiserror::Error;

/// Why a plugin could not be brought into service.
///
/// Every variant is contained to the one plugin named in it; the manager logs
/// it, records it as the plugin's last error and carries on with the others.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("plugin `{0}` is not in the catalog")]
    UnknownPlugin(String),
    #[error("plugin `{0}` is disabled")]
    Disabled(String),
    #[error("plugin `{0}` is already loaded")]
    AlreadyLoaded(String),
    #[error("failed to launch plugin `{id}`: {reason}")]
    Launch { id: String, reason: String },
    #[error("handshake with plugin `{id}` failed: {source}")]
    Handshake {
        id: String,
        #[source]
        source: HandshakeError,
    },
    #[error("plugin `{id}` failed `{call}` during interrogation: {source}")]
    Interrogation {
        id: String,
        call: &'static str,
        #[source]
        source: RpcError,
    },
    #[error("plugin `{id}` reported invalid metadata: {reason}")]
    InvalidMetadata { id: String, reason: String },
}

impl LoadError {
    pub fn launch(id: &str, reason: impl ToString) -> Self {
        Self::Launch {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short label used as the `outcome` of load metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            LoadError::UnknownPlugin(_) => "unknown",
            LoadError::Disabled(_) => "disabled",
            LoadError::AlreadyLoaded(_) => "already_loaded",
            LoadError::Launch { .. } => "launch",
            LoadError::Handshake { .. } => "handshake",
            LoadError::Interrogation { .. } => "interrogation",
            LoadError::InvalidMetadata { .. } => "invalid_metadata",
        }
    }
}
