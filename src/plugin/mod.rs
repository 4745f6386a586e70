//! Plugin-process side of the handshake.
//!
//! [`serve`] is what a plugin binary's `main` calls: it refuses to run
//! without the family's magic cookie, reads the environment surface, listens
//! on an ephemeral loopback port, announces it on stdout, and serves its root
//! service to the single host connection until that connection closes.

use std::sync::Weak;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{Broker, BrokerConfig, Server};
use crate::process::{EnvConfig, Handshake};
use crate::types::{MuxConfig, Result};

/// What a plugin gets to build its root service from.
#[derive(Debug)]
pub struct PluginContext<'a> {
    /// The broker the root will be served on.
    pub broker: Weak<Broker>,
    pub env: &'a EnvConfig,
    /// Cancelled when the host connection goes away.
    pub stop: CancellationToken,
}

/// Run a plugin process. Returns once the host connection is closed.
pub async fn serve<F>(handshake: Handshake, root: F) -> Result<()>
where
    F: FnOnce(PluginContext<'_>) -> Result<Server>,
{
    let cookie = std::env::var(handshake.cookie_key).ok();
    handshake.verify_cookie(cookie.as_deref())?;

    let env = EnvConfig::from_env()?;
    let mux_config = MuxConfig {
        call_limit: env.call_limit,
        ..MuxConfig::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", handshake.announce(addr)).as_bytes())
        .await?;
    stdout.flush().await?;

    let (stream, peer) = listener.accept().await?;
    drop(listener);
    stream.set_nodelay(true)?;
    info!(%addr, %peer, call_limit = ?env.call_limit, "host connected");

    let stop = CancellationToken::new();
    let config = BrokerConfig::new("plugin").with_stop(stop.clone());
    let broker = Broker::connect_with_root(stream, config, mux_config, 0, |broker| {
        root(PluginContext {
            broker,
            env: &env,
            stop: stop.clone(),
        })
    })?;

    tokio::select! {
        _ = broker.closed() => info!(served = broker.mux().served_calls(), "host connection closed"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    stop.cancel();
    broker.shutdown().await;
    Ok(())
}
