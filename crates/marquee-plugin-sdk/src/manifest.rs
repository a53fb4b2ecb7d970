use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk JSON manifest placed in the plugin directory for each plugin executable.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PluginManifest {
    pub id: String,
    /// Executable path, relative to the manifest's directory unless absolute.
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub description: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("plugin manifest is missing an id")]
    MissingId,
    #[error("plugin id `{0}` must be a lowercase slug (a-z, 0-9, '-', '_')")]
    InvalidId(String),
    #[error("plugin `{0}` does not name an executable")]
    MissingExecutable(String),
}

impl PluginManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::MissingId);
        }
        if !is_slug(&self.id) {
            return Err(ManifestError::InvalidId(self.id.clone()));
        }
        if self.executable.trim().is_empty() {
            return Err(ManifestError::MissingExecutable(self.id.clone()));
        }
        Ok(())
    }
}

/// Plugin ids double as URL segments, so they are restricted to slugs.
pub fn is_slug(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_parses_with_defaults() {
        let manifest: PluginManifest =
            serde_json::from_str(r#"{"id":"demo","executable":"bin/demo"}"#).unwrap();
        assert!(manifest.args.is_empty());
        assert!(manifest.env.is_empty());
        assert_eq!(manifest.validate(), Ok(()));
    }

    #[test]
    fn ids_must_be_slugs() {
        let manifest = PluginManifest {
            id: "Demo Plugin".into(),
            executable: "demo".into(),
            ..PluginManifest::default()
        };
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::InvalidId("Demo Plugin".into()))
        );
    }

    #[test]
    fn executable_is_required() {
        let manifest = PluginManifest {
            id: "demo".into(),
            ..PluginManifest::default()
        };
        assert_eq!(
            manifest.validate(),
            Err(ManifestError::MissingExecutable("demo".into()))
        );
    }
}
