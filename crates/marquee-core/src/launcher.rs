//! Starting plugin processes and wiring up their byte streams.
//!
//! A [`Launcher`] only produces a pair of streams plus something that can be
//! terminated later; the handshake and everything after it happen in
//! [`Connection`](crate::connection::Connection), so a child process and an
//! in-process plugin look identical to the rest of the host.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use marquee_plugin_sdk::{serve_io, HandshakeConfig, Plugin, ServeOptions};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
};

use crate::{catalog::PluginSpec, error::LoadError};

const IN_PROCESS_PIPE_BYTES: usize = 256 * 1024;
/// How long an acknowledged shutdown may take before the child is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Streams of a freshly started plugin, before the handshake.
pub struct PluginIo {
    /// What the plugin writes (its stdout).
    pub reader: BoxedReader,
    /// What the plugin reads (its stdin).
    pub writer: BoxedWriter,
    pub process: PluginProcess,
}

/// The running thing behind a plugin connection.
#[derive(Debug)]
pub enum PluginProcess {
    Child(Child),
    Task(JoinHandle<()>),
}

impl PluginProcess {
    pub fn pid(&self) -> Option<u32> {
        match self {
            PluginProcess::Child(child) => child.id(),
            PluginProcess::Task(_) => None,
        }
    }

    /// Reaps the plugin, killing it if it does not exit on its own shortly.
    /// Safe to call on an exited plugin.
    pub async fn terminate(&mut self) {
        match self {
            PluginProcess::Child(child) => {
                if let Ok(Ok(status)) = tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                    tracing::debug!(%status, "plugin process exited");
                    return;
                }
                if let Err(err) = child.kill().await {
                    tracing::debug!(error = %err, "plugin process already gone");
                }
            }
            PluginProcess::Task(task) => {
                task.abort();
                let _ = task.await;
            }
        }
    }
}

#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, spec: &PluginSpec, handshake: &HandshakeConfig)
        -> Result<PluginIo, LoadError>;
}

/// Runs each plugin as a child process speaking over its stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &PluginSpec,
        handshake: &HandshakeConfig,
    ) -> Result<PluginIo, LoadError> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .envs(handshake.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            LoadError::launch(
                &spec.id,
                format!("{}: {err}", spec.executable.display()),
            )
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoadError::launch(&spec.id, "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoadError::launch(&spec.id, "stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.id.clone(), stderr));
        }
        tracing::info!(plugin = %spec.id, pid = child.id(), executable = %spec.executable.display(), "plugin process started");

        Ok(PluginIo {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: PluginProcess::Child(child),
        })
    }
}

async fn forward_stderr(plugin: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(plugin = %plugin, "{line}"),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(plugin = %plugin, error = %err, "plugin stderr closed");
                break;
            }
        }
    }
}

pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Runs bundled plugins inside the host over in-memory pipes.
///
/// The plugin side goes through [`serve_io`], so the handshake and framing
/// are exactly those of a child process.
#[derive(Clone, Default)]
pub struct InProcessLauncher {
    factories: HashMap<String, PluginFactory>,
    options: ServeOptions,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin<F, P>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin,
    {
        let factory: PluginFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Plugin>);
        self.factories.insert(id.into(), factory);
        self
    }

    /// Serve options for the plugin side; the handshake is always taken from the host.
    pub fn with_options(mut self, options: ServeOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(
        &self,
        spec: &PluginSpec,
        handshake: &HandshakeConfig,
    ) -> Result<PluginIo, LoadError> {
        let factory = self
            .factories
            .get(&spec.id)
            .ok_or_else(|| LoadError::launch(&spec.id, "no bundled plugin with this id"))?;
        let plugin = factory();

        let (host_end, plugin_end) = tokio::io::duplex(IN_PROCESS_PIPE_BYTES);
        let (host_reader, host_writer) = tokio::io::split(host_end);
        let (plugin_reader, plugin_writer) = tokio::io::split(plugin_end);
        let options = ServeOptions {
            handshake: handshake.clone(),
            ..self.options.clone()
        };
        let id = spec.id.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = serve_io(plugin, plugin_reader, plugin_writer, options).await {
                tracing::warn!(plugin = %id, error = %err, "bundled plugin stopped");
            }
        });

        Ok(PluginIo {
            reader: Box::new(host_reader),
            writer: Box::new(host_writer),
            process: PluginProcess::Task(task),
        })
    }
}
