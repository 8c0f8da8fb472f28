//! Gateway control task
//!
//! All registry state lives in one task. Connection handlers reach it
//! through a [`GatewayHandle`]; process drivers report through the
//! notification channel; the idle scan is driven by a [`RecurringTimer`].
//! Each message is handled to completion before the next one is taken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::process::{Launcher, ProcessNotification, TranscoderConfig};
use crate::registry::{
    RegistryConfig, RequestParams, SessionKey, SessionRegistry, Subscriber, SubscriberId,
};
use crate::stats::StatsSnapshot;

/// Requests from connection handlers
#[derive(Debug)]
pub enum Command {
    /// A new subscriber connection arrived
    Subscribe {
        key: SessionKey,
        params: RequestParams,
        subscriber: Subscriber,
    },
    /// A subscriber connection went away
    Unsubscribe {
        key: SessionKey,
        subscriber: SubscriberId,
    },
    /// Report statistics
    Stats(oneshot::Sender<StatsSnapshot>),
    /// Tear everything down and stop
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the gateway task
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    /// Hand a subscriber connection to the registry
    pub async fn subscribe(
        &self,
        key: SessionKey,
        params: RequestParams,
        subscriber: Subscriber,
    ) -> Result<()> {
        self.send(Command::Subscribe {
            key,
            params,
            subscriber,
        })
        .await
    }

    /// Remove a subscriber from its session
    pub async fn unsubscribe(&self, key: SessionKey, subscriber: SubscriberId) -> Result<()> {
        self.send(Command::Unsubscribe { key, subscriber }).await
    }

    /// Fetch a statistics snapshot
    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).await?;
        rx.await.map_err(|_| Error::GatewayClosed)
    }

    /// Stop the gateway, tearing down every session
    ///
    /// Resolves once all sessions are gone. Calling this on a gateway that
    /// already stopped succeeds immediately.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Whether the gateway task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::GatewayClosed)
    }
}

/// Fixed-period timer that can be started and stopped repeatedly
///
/// The first tick fires one full period after `start`. While stopped,
/// `tick` never resolves.
#[derive(Debug)]
pub struct RecurringTimer {
    period: Duration,
    interval: Option<Interval>,
}

impl RecurringTimer {
    /// Create a stopped timer
    ///
    /// A zero period is raised to one millisecond.
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            interval: None,
        }
    }

    /// Start ticking; no effect if already running
    pub fn start(&mut self) {
        if self.interval.is_none() {
            let mut interval = time::interval_at(Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.interval = Some(interval);
        }
    }

    /// Stop ticking; no effect if already stopped
    pub fn stop(&mut self) {
        self.interval = None;
    }

    /// Whether the timer is running
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait for the next tick
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// The control task owning the session registry
pub struct Gateway {
    registry: SessionRegistry,
    commands: mpsc::Receiver<Command>,
    notifications: mpsc::UnboundedReceiver<ProcessNotification>,
    timer: RecurringTimer,
}

impl Gateway {
    /// Create a gateway and its handle
    ///
    /// Nothing runs until [`Gateway::run`] is polled. Fails if the registry
    /// configuration is invalid.
    pub fn new(
        registry_config: RegistryConfig,
        transcoder: TranscoderConfig,
        launcher: Arc<dyn Launcher>,
        command_queue: usize,
    ) -> Result<(Self, GatewayHandle)> {
        registry_config.validate()?;

        let (tx, commands) = mpsc::channel(command_queue.max(1));
        let (events_tx, notifications) = mpsc::unbounded_channel();
        let timer = RecurringTimer::new(registry_config.check_interval);
        let registry = SessionRegistry::new(registry_config, transcoder, launcher, events_tx);

        let gateway = Self {
            registry,
            commands,
            notifications,
            timer,
        };

        Ok((gateway, GatewayHandle { tx }))
    }

    /// Create a gateway and run it on a new task
    pub fn spawn(
        registry_config: RegistryConfig,
        transcoder: TranscoderConfig,
        launcher: Arc<dyn Launcher>,
        command_queue: usize,
    ) -> Result<(GatewayHandle, JoinHandle<()>)> {
        let (gateway, handle) = Self::new(registry_config, transcoder, launcher, command_queue)?;
        Ok((handle, tokio::spawn(gateway.run())))
    }

    /// Process commands, notifications and idle ticks until shut down
    ///
    /// Also stops, after tearing everything down, once every handle is dropped.
    pub async fn run(mut self) {
        self.timer.start();
        tracing::debug!(
            check_interval_secs = self.registry.config().check_interval.as_secs(),
            idle_timeout_secs = self.registry.config().idle_timeout.as_secs(),
            "Gateway started"
        );

        let ack = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(ack) = self.handle_command(command) {
                            break Some(ack);
                        }
                    }
                    None => break None,
                },
                Some(notification) = self.notifications.recv() => {
                    self.registry.handle_notification(notification);
                }
                _ = self.timer.tick() => {
                    let reaped = self.registry.reap_idle();
                    tracing::debug!(
                        sessions = self.registry.session_count(),
                        reaped = reaped,
                        "Idle check"
                    );
                }
            }
        };

        self.timer.stop();
        self.registry.shutdown();
        tracing::info!("Gateway stopped");

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    /// Apply one command; returns the acknowledgement channel on shutdown
    fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Subscribe {
                key,
                params,
                subscriber,
            } => {
                self.registry.subscribe(key, subscriber, &params);
                None
            }
            Command::Unsubscribe { key, subscriber } => {
                self.registry.unsubscribe(&key, subscriber);
                None
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.registry.snapshot());
                None
            }
            Command::Shutdown(ack) => Some(ack),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::process::{CommandLine, EventSink, ProcessHandle, SpawnError};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_first_tick_after_period() {
        let mut timer = RecurringTimer::new(Duration::from_secs(10));
        timer.start();
        let started = Instant::now();

        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_start_stop_idempotent() {
        let mut timer = RecurringTimer::new(Duration::from_secs(1));
        assert!(!timer.is_running());

        timer.start();
        timer.start();
        assert!(timer.is_running());

        timer.stop();
        timer.stop();
        assert!(!timer.is_running());

        let stopped = time::timeout(Duration::from_secs(5), timer.tick()).await;
        assert!(stopped.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_zero_period_still_ticks() {
        let mut timer = RecurringTimer::new(Duration::ZERO);
        timer.start();
        let started = Instant::now();

        timer.tick().await;
        assert_eq!(started.elapsed(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_zero_check_interval_rejected() {
        struct NoLauncher;

        impl Launcher for NoLauncher {
            fn launch(
                &self,
                command: &CommandLine,
                _events: EventSink,
            ) -> std::result::Result<Box<dyn ProcessHandle>, SpawnError> {
                Err(SpawnError {
                    program: command.program.clone(),
                    source: std::io::ErrorKind::NotFound.into(),
                })
            }
        }

        let result = Gateway::spawn(
            RegistryConfig::default().check_interval(Duration::ZERO),
            TranscoderConfig::default(),
            Arc::new(NoLauncher),
            16,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
