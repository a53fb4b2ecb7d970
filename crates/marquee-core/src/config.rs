use std::{
    collections::{BTreeMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub plugins: Plugins,
    pub auth: Auth,
    /// Initial contents of the reference config store, keyed by config key.
    pub settings: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub bind: String,
    pub tls: Option<Tls>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: ":8096".into(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Plugins {
    /// Directory scanned for `*.json` plugin manifests.
    pub dir: PathBuf,
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub event_timeout_ms: u64,
    pub unload_grace_ms: u64,
    pub event_queue: usize,
    /// Per-plugin enable flags; plugins not listed are enabled.
    pub enabled: BTreeMap<String, bool>,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            handshake_timeout_ms: 5_000,
            call_timeout_ms: 5_000,
            dispatch_timeout_ms: 30_000,
            event_timeout_ms: 5_000,
            unload_grace_ms: 10_000,
            event_queue: 64,
            enabled: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Auth {
    pub tokens: Vec<AuthToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub admin: bool,
}

/// Time bounds applied by the plugin manager and dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub call: Duration,
    pub dispatch: Duration,
    pub event: Duration,
    pub unload_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Plugins::default().timeouts()
    }
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.plugins.validate()?;
        self.auth.validate()?;
        Ok(())
    }
}

impl Server {
    pub fn validate(&self) -> Result<()> {
        self.parse_bind_addr()
            .with_context(|| format!("invalid bind address `{}`", self.bind))?;
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    pub fn parse_bind_addr(&self) -> Result<SocketAddr> {
        if self.bind.starts_with(':') {
            let addr = format!("0.0.0.0{}", self.bind);
            Ok(SocketAddr::from_str(&addr)?)
        } else {
            Ok(SocketAddr::from_str(&self.bind)?)
        }
    }
}

impl Tls {
    pub fn validate(&self) -> Result<()> {
        if self.cert.trim().is_empty() || self.key.trim().is_empty() {
            bail!("tls cert and key paths must be provided");
        }
        Ok(())
    }
}

impl Plugins {
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
            ("event_timeout_ms", self.event_timeout_ms),
            ("unload_grace_ms", self.unload_grace_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                bail!("plugins.{name} must be greater than zero");
            }
        }
        if self.event_queue == 0 {
            bail!("plugins.event_queue must be greater than zero");
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            call: Duration::from_millis(self.call_timeout_ms),
            dispatch: Duration::from_millis(self.dispatch_timeout_ms),
            event: Duration::from_millis(self.event_timeout_ms),
            unload_grace: Duration::from_millis(self.unload_grace_ms),
        }
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.enabled.get(id).copied().unwrap_or(true)
    }
}

impl Auth {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for token in &self.tokens {
            if token.token.trim().is_empty() {
                bail!("auth token for user `{}` must not be empty", token.user_id);
            }
            if token.user_id.trim().is_empty() {
                bail!("auth tokens must name a user_id");
            }
            if !seen.insert(token.token.as_str()) {
                bail!("duplicate auth token for user `{}`", token.user_id);
            }
        }
        Ok(())
    }
}
