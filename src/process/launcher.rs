//! Spawning a plugin process and completing its handshake.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::env::EnvConfig;
use super::handshake::Handshake;
use crate::types::{Error, Result};

/// How to start a plugin binary.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the plugin executable.
    pub program: PathBuf,
    /// Arguments passed to the plugin.
    pub args: Vec<String>,
    /// Environment variables set on the child, on top of the inherited ones.
    pub env_vars: BTreeMap<String, String>,
}

impl LaunchConfig {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env_vars: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Add every entry of the plugin environment surface.
    pub fn with_env_config(mut self, env: &EnvConfig) -> Self {
        self.env_vars.extend(env.as_cmd_env());
        self
    }
}

/// A running plugin with its connection established.
#[derive(Debug)]
pub struct Launched {
    pub child: Child,
    pub addr: SocketAddr,
    pub stream: TcpStream,
}

/// Spawn the plugin, wait for its handshake line and connect.
///
/// A line that does not match `handshake`, a process that exits before
/// announcing, or no announcement within `start_timeout` all fail with
/// [`Error::Handshake`]. The child is killed on every failure path.
pub async fn launch(
    name: &str,
    config: &LaunchConfig,
    handshake: &Handshake,
    start_timeout: Duration,
) -> Result<Launched> {
    let (cookie_key, cookie_value) = handshake.cookie_env();
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .envs(&config.env_vars)
        .env(cookie_key, cookie_value)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    debug!(plugin = name, program = %config.program.display(), pid = ?child.id(), "spawned");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::internal("plugin stdout not captured"))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(name.to_string(), stderr));
    }

    let mut lines = BufReader::new(stdout).lines();
    let line = match tokio::time::timeout(start_timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            let status = child.wait().await?;
            return Err(Error::handshake(format!(
                "{} exited before handshake ({})",
                name, status
            )));
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(Error::handshake(format!(
                "{} did not announce within {:?}",
                name, start_timeout
            )))
        }
    };

    let addr = handshake.parse_announcement(&line)?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!(plugin = name, %addr, pid = ?child.id(), "plugin connected");

    // Anything else on stdout is diagnostics.
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "relay_loop::plugin", stream = "stdout", "{}", line);
        }
    });

    Ok(Launched {
        child,
        addr,
        stream,
    })
}

/// Forward a plugin's stderr into our own tracing output.
async fn forward_lines<R: AsyncRead + Unpin>(plugin: String, stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "relay_loop::plugin", plugin = %plugin, "{}", line);
    }
}
