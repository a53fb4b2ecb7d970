//! Plugin discovery from the manifest directory.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use marquee_plugin_sdk::PluginManifest;

/// Everything the launcher needs to start one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub id: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub description: Option<String>,
}

impl PluginSpec {
    /// A spec for a plugin with no executable on disk, served by an in-process launcher.
    pub fn bundled(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executable: PathBuf::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            description: None,
        }
    }

    /// Resolves `manifest` against the directory it was read from.
    pub fn from_manifest(manifest: PluginManifest, base: &Path) -> Result<Self> {
        manifest.validate()?;
        let executable = PathBuf::from(&manifest.executable);
        let executable = if executable.is_absolute() {
            executable
        } else {
            base.join(executable)
        };
        Ok(Self {
            id: manifest.id,
            executable,
            args: manifest.args,
            env: manifest.env,
            description: manifest.description,
        })
    }
}

/// Reads every `*.json` manifest in `dir`, sorted by id.
///
/// A missing directory yields no plugins. Two manifests claiming one id is a
/// configuration error.
pub fn discover(dir: &Path) -> Result<Vec<PluginSpec>> {
    let mut specs = Vec::new();
    if !dir.exists() {
        return Ok(specs);
    }
    let mut seen = HashSet::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: PluginManifest = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        let spec = PluginSpec::from_manifest(manifest, dir)
            .with_context(|| format!("invalid manifest {}", path.display()))?;
        if !seen.insert(spec.id.clone()) {
            bail!(
                "plugin id `{}` is declared by more than one manifest ({})",
                spec.id,
                path.display()
            );
        }
        specs.push(spec);
    }
    specs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(specs)
}
