//! Supervised plugin process.
//!
//! A [`PluginClient`] launches its plugin, keeps it alive and relaunches it
//! after a crash. Each launch is one incarnation with its own broker and a
//! monotonically increasing generation; connections composed against an older
//! generation recompose on their next use.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handshake::Handshake;
use super::launcher::{launch, LaunchConfig};
use super::state::PluginState;
use crate::broker::{Broker, BrokerConfig, PING_METHOD};
use crate::clientconn::BrokerSource;
use crate::ipc::wire;
use crate::service::{HealthReport, ServiceLifecycle};
use crate::types::{DialOptions, Error, MuxConfig, Result, ServiceHandle, SupervisorConfig};

/// Everything needed to run one plugin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub name: String,
    pub handshake: Handshake,
    pub launch: LaunchConfig,
    pub supervisor: SupervisorConfig,
    pub mux: MuxConfig,
    pub dial: DialOptions,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, handshake: Handshake, launch: LaunchConfig) -> Self {
        Self {
            name: name.into(),
            handshake,
            launch,
            supervisor: SupervisorConfig::default(),
            mux: MuxConfig::default(),
            dial: DialOptions::default(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_dial(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }
}

struct Incarnation {
    generation: u64,
    /// Asks the monitor to kill the child.
    kill: CancellationToken,
    /// Cancelled by the monitor once the child is reaped.
    exited: CancellationToken,
}

struct Inner {
    config: PluginConfig,
    stop: CancellationToken,
    state: watch::Sender<PluginState>,
    broker: watch::Sender<Option<Arc<Broker>>>,
    /// Held across launches so only one runs at a time.
    current: Mutex<Option<Incarnation>>,
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Host-side handle to a supervised plugin process. Cheap to clone.
#[derive(Clone)]
pub struct PluginClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClient")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl PluginClient {
    pub fn new(config: PluginConfig) -> Self {
        let (state, _) = watch::channel(PluginState::Unstarted);
        let (broker, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                stop: CancellationToken::new(),
                state,
                broker,
                current: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Stop signal shared by everything built on this client.
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    /// Launch the plugin and start the keep-alive tick.
    ///
    /// A failed first launch is fatal: the client moves to `Closed`.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut current = inner.current.lock().await;
        match inner.state() {
            PluginState::Unstarted => {}
            PluginState::Closed => return Err(Error::closed(inner.config.name.clone())),
            other => {
                return Err(Error::validation(format!(
                    "{} already started ({})",
                    inner.config.name, other
                )))
            }
        }

        match inner.launch_incarnation().await {
            Ok(incarnation) => {
                *current = Some(incarnation);
                inner.transition(PluginState::Unstarted, PluginState::Connected);
                tokio::spawn(keep_alive(
                    Arc::downgrade(inner),
                    inner.stop.clone(),
                    inner.config.supervisor.keep_alive_interval,
                ));
                Ok(())
            }
            Err(e) => {
                error!(plugin = %inner.config.name, "start failed: {}", e);
                inner.shut();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> PluginState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<PluginState> {
        self.inner.state.subscribe()
    }

    /// Wait until the client reaches `want`.
    pub async fn wait_for_state(&self, want: PluginState, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|s| *s == want))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::closed(self.inner.config.name.clone())),
            Err(_) => Err(Error::timeout(format!(
                "{} still {} after {:?}, wanted {}",
                self.inner.config.name,
                self.state(),
                timeout,
                want
            ))),
        }
    }

    /// Generation of the current (or last) incarnation. Starts at 1.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Kill the plugin process, as if it had crashed.
    ///
    /// Returns once the process is gone and the client is `Killed`. Recovery
    /// is left to the keep-alive tick.
    pub async fn kill(&self) -> Result<()> {
        let current = self.inner.current.lock().await;
        let Some(incarnation) = current.as_ref() else {
            return Err(Error::unavailable(format!("{} is not running", self.name())));
        };
        info!(plugin = %self.name(), generation = incarnation.generation, "killing plugin");
        incarnation.kill.cancel();
        incarnation.exited.cancelled().await;
        Ok(())
    }

    /// Tear the plugin down and relaunch it now.
    pub async fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let mut current = inner.current.lock().await;
        match inner.state() {
            PluginState::Closed => return Err(Error::closed(inner.config.name.clone())),
            PluginState::Unstarted => {
                return Err(Error::validation(format!("{} not started", inner.config.name)))
            }
            _ => {}
        }
        info!(plugin = %inner.config.name, "resetting plugin");
        if let Some(incarnation) = current.as_ref() {
            incarnation.kill.cancel();
            incarnation.exited.cancelled().await;
        }
        inner.relaunch_locked(&mut current).await
    }

    /// Shut the plugin down. Terminal: no relaunch happens afterwards.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        inner.shut();
        let incarnation = inner.current.lock().await.take();
        if let Some(incarnation) = incarnation {
            incarnation.kill.cancel();
            let exited = incarnation.exited.cancelled();
            if tokio::time::timeout(inner.config.supervisor.close_timeout, exited)
                .await
                .is_err()
            {
                warn!(plugin = %inner.config.name, "plugin did not exit within close timeout");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSource for PluginClient {
    async fn broker(&self) -> Result<Arc<Broker>> {
        let name = &self.inner.config.name;
        match self.state() {
            PluginState::Connected => self
                .inner
                .broker
                .borrow()
                .clone()
                .filter(|b| !b.is_closed())
                .ok_or_else(|| Error::unavailable(format!("{} connection lost", name))),
            PluginState::Closed => Err(Error::closed(name.clone())),
            other => Err(Error::unavailable(format!("{} is {}", name, other))),
        }
    }
}

#[async_trait]
impl ServiceLifecycle for PluginClient {
    fn name(&self) -> String {
        self.inner.config.name.clone()
    }

    async fn start(&self) -> Result<()> {
        PluginClient::start(self).await
    }

    async fn close(&self) -> Result<()> {
        PluginClient::close(self).await
    }

    async fn ready(&self) -> Result<()> {
        let broker = self.broker().await?;
        self.inner.ping(&broker).await
    }

    async fn health_report(&self) -> HealthReport {
        let status = match ServiceLifecycle::ready(self).await {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        HealthReport::from([(self.inner.config.name.clone(), status)])
    }
}

impl Inner {
    fn state(&self) -> PluginState {
        *self.state.borrow()
    }

    fn transition(&self, from: PluginState, to: PluginState) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s == from && s.can_transition_to(to) {
                *s = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(plugin = %self.config.name, %from, %to, "plugin state changed");
        }
        changed
    }

    /// Move to `Closed` and stop every background task.
    fn shut(&self) {
        self.stop.cancel();
        let from = self.state.send_replace(PluginState::Closed);
        self.broker.send_replace(None);
        if from != PluginState::Closed {
            info!(plugin = %self.config.name, %from, to = %PluginState::Closed, "plugin state changed");
        }
    }

    /// Process death of `generation`. Older generations are ignored.
    fn mark_killed(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if self.transition(PluginState::Connected, PluginState::Killed) {
            self.broker.send_replace(None);
        }
    }

    async fn ping(&self, broker: &Broker) -> Result<()> {
        broker
            .mux()
            .call(
                ServiceHandle::ROOT,
                PING_METHOD,
                wire::empty(),
                self.config.dial.dial_timeout,
            )
            .await
            .map(|_| ())
    }

    async fn launch_incarnation(self: &Arc<Self>) -> Result<Incarnation> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let launched = launch(
            &self.config.name,
            &self.config.launch,
            &self.config.handshake,
            self.config.supervisor.start_timeout,
        )
        .await?;

        let broker_config = BrokerConfig::new(self.config.name.clone())
            .with_dial(self.config.dial.clone())
            .with_stop(self.stop.clone());
        let broker = Broker::connect(launched.stream, broker_config, self.config.mux.clone(), generation);
        broker.dial("root", ServiceHandle::ROOT).await?;

        let incarnation = Incarnation {
            generation,
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        };
        tokio::spawn(monitor(
            Arc::downgrade(self),
            launched.child,
            broker.clone(),
            generation,
            incarnation.kill.clone(),
            incarnation.exited.clone(),
            self.stop.clone(),
        ));
        self.broker.send_replace(Some(broker));
        Ok(incarnation)
    }

    async fn relaunch_locked(self: &Arc<Self>, current: &mut Option<Incarnation>) -> Result<()> {
        if !self.transition(PluginState::Killed, PluginState::Reconnecting) {
            return Err(Error::unavailable(format!(
                "{} cannot relaunch while {}",
                self.config.name,
                self.state()
            )));
        }
        current.take();

        match self.launch_incarnation().await {
            Ok(incarnation) => {
                let generation = incarnation.generation;
                *current = Some(incarnation);
                self.transition(PluginState::Reconnecting, PluginState::Connected);
                // The new process may already have died before we got here.
                let dead = self.broker.borrow().as_ref().map_or(true, |b| b.is_closed());
                if dead {
                    self.mark_killed(generation);
                }
                Ok(())
            }
            Err(e @ Error::Handshake(_)) => {
                error!(plugin = %self.config.name, "relaunch handshake failed, giving up: {}", e);
                self.shut();
                Err(e)
            }
            Err(e) => {
                warn!(plugin = %self.config.name, "relaunch failed: {}", e);
                self.transition(PluginState::Reconnecting, PluginState::Killed);
                Err(e)
            }
        }
    }

    async fn tick(self: &Arc<Self>) {
        match self.state() {
            PluginState::Killed => {
                let mut current = self.current.lock().await;
                // kill() or reset() may have raced us to the lock.
                if self.state() == PluginState::Killed {
                    let _ = self.relaunch_locked(&mut current).await;
                }
            }
            PluginState::Connected => {
                let broker = self.broker.borrow().clone();
                let Some(broker) = broker else { return };
                if let Err(e) = self.ping(&broker).await {
                    warn!(plugin = %self.config.name, "keep-alive ping failed: {}", e);
                    let current = self.current.lock().await;
                    if let Some(incarnation) = current.as_ref() {
                        if incarnation.generation == broker.generation() {
                            incarnation.kill.cancel();
                        }
                    }
                    self.mark_killed(broker.generation());
                }
            }
            _ => {}
        }
    }
}

async fn keep_alive(inner: Weak<Inner>, stop: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        if inner.stop.is_cancelled() {
            break;
        }
        inner.tick().await;
    }
    debug!("keep-alive stopped");
}

async fn monitor(
    inner: Weak<Inner>,
    mut child: Child,
    broker: Arc<Broker>,
    generation: u64,
    kill: CancellationToken,
    exited: CancellationToken,
    stop: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = broker.closed() => {
            debug!(generation, "connection lost, reaping plugin");
            let _ = child.start_kill();
            child.wait().await
        }
        _ = kill.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
        _ = stop.cancelled() => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    match status {
        Ok(status) => info!(generation, %status, "plugin exited"),
        Err(e) => warn!(generation, "waiting for plugin failed: {}", e),
    }

    broker.shutdown().await;
    if let Some(inner) = inner.upgrade() {
        inner.mark_killed(generation);
    }
    exited.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlaunched() -> PluginClient {
        let launch = LaunchConfig::new("/nonexistent/relay-loop-plugin");
        PluginClient::new(PluginConfig::new("idle", Handshake::REPORTING, launch))
    }

    #[tokio::test]
    async fn test_wait_for_state_returns_or_times_out() {
        let client = unlaunched();
        client
            .wait_for_state(PluginState::Unstarted, Duration::from_millis(10))
            .await
            .unwrap();
        let err = client
            .wait_for_state(PluginState::Connected, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(ref m) if m.contains("still unstarted")), "{:?}", err);
    }

    #[tokio::test]
    async fn test_wait_for_state_sees_close() {
        let client = unlaunched();
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .wait_for_state(PluginState::Closed, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        client.close().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(matches!(client.broker().await, Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn test_failed_first_start_is_fatal() {
        let client = unlaunched();
        assert!(client.start().await.is_err());
        assert_eq!(client.state(), PluginState::Closed);
    }
}
