use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use marquee_core::{
    auth::TokenAuth,
    catalog::{self, PluginSpec},
    config::Config,
    launcher::ProcessLauncher,
    manager::{ManagerOptions, PluginManager},
    registry::RouteRegistry,
    server::{HostService, Server},
    store::MemoryConfigStore,
};
use regex::Regex;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "demos/config/minimal.marquee.toml";

#[derive(Parser, Debug)]
#[command(name = "marquee", author, version, about = "Plugin host for media-server extensions")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace) or a full filter directive.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the configured plugins and serve HTTP until interrupted.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Validate or print configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect plugin manifests and plugin binaries.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Dump the resolved configuration as JSON, with tokens redacted.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled minimal configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists the manifests found in a plugin directory.
    List {
        #[arg(long, value_name = "DIR", default_value = "demos/plugins")]
        dir: PathBuf,
    },
    /// Launches one plugin, prints what it declares, then stops it.
    Probe {
        #[arg(long, value_name = "DIR", default_value = "demos/plugins")]
        dir: PathBuf,
        #[arg(long, value_name = "ID")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    match cli.command {
        Commands::Run { config } => handle_run(&config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command).await,
        Commands::Diag { config } => handle_diag(&config),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
}

async fn handle_run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;

    let manager = build_manager(&config)?;
    let specs = catalog::discover(&config.plugins.dir)?;
    if specs.is_empty() {
        tracing::warn!(dir = %config.plugins.dir.display(), "no plugin manifests found");
    }
    for spec in specs {
        let enabled = config.plugins.is_enabled(&spec.id);
        manager.add_plugin(spec, enabled);
    }
    manager.load_all().await;

    let auth = TokenAuth::new(&config.auth.tokens);
    let service = HostService::new(Arc::clone(&manager), Arc::new(auth));
    Server::new(&config, service)?.run().await
}

fn build_manager(config: &Config) -> Result<Arc<PluginManager>> {
    let store = MemoryConfigStore::seeded(&config.settings)
        .map_err(|err| anyhow!("invalid [settings] entry: {err}"))?;
    Ok(Arc::new(PluginManager::new(
        Arc::new(RouteRegistry::new()),
        Arc::new(ProcessLauncher::new()),
        Arc::new(store),
        ManagerOptions::from_config(&config.plugins),
    )))
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            let specs = catalog::discover(&cfg.plugins.dir)?;
            println!(
                "configuration OK: {} ({} plugin manifest(s) in {})",
                config.display(),
                specs.len(),
                cfg.plugins.dir.display()
            );
        }
        ConfigCommands::Example => {
            println!(
                "{}",
                include_str!("../../../demos/config/minimal.marquee.toml")
            );
        }
    }
    Ok(())
}

async fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { dir } => {
            let specs = catalog::discover(&dir)?;
            if specs.is_empty() {
                println!("no plugin manifests found under {}", dir.display());
            }
            for spec in specs {
                let description = spec
                    .description
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default();
                println!("- {} ({}){}", spec.id, spec.executable.display(), description);
            }
        }
        PluginCommands::Probe { dir, id } => probe(&dir, &id).await?,
    }
    Ok(())
}

#[derive(Serialize)]
struct ProbeOutput {
    metadata: marquee_plugin_sdk::PluginMetadata,
    routes: Vec<marquee_plugin_sdk::RouteDescriptor>,
    ui: Option<marquee_plugin_sdk::UiManifest>,
}

async fn probe(dir: &Path, id: &str) -> Result<()> {
    let spec: PluginSpec = catalog::discover(dir)?
        .into_iter()
        .find(|spec| spec.id == id)
        .with_context(|| format!("no manifest for plugin `{id}` in {}", dir.display()))?;

    let manager = build_manager(&Config::default())?;
    manager.add_plugin(spec, true);
    let report = manager.load(id).await?;
    let output = match manager.get(id) {
        Some(handle) => ProbeOutput {
            metadata: handle.metadata().clone(),
            routes: report.registered,
            ui: handle.ui_manifest().cloned(),
        },
        None => bail!("plugin `{id}` was unloaded while probing"),
    };
    manager.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn handle_diag(path: &Path) -> Result<()> {
    let mut cfg = load_config(path)?;
    for token in &mut cfg.auth.tokens {
        token.token = "<redacted>".into();
    }
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

/// Replaces `${NAME}` and `${NAME:default}` with environment values.
fn interpolate_env(input: &str) -> Result<String> {
    let regex = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]*))?\}")?;
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}
