//! Connection lifecycle supervisor.
//!
//! Owns the transport connection and the session credential. The policy lives
//! in [`Lifecycle`], a synchronous state machine; [`ConnectionSupervisor`] drives
//! it from the transport's event stream.
//!
//! Failure classes:
//! - recoverable close: one reconnect per triggering event
//! - logged out: terminal, no reconnect for this process
//! - session corrupt: wipe the credential, then reconnect with a clean handshake

use std::{sync::Arc, time::Duration};

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    credentials::CredentialStore,
    domain::Jid,
    errors::Error,
    messaging::{
        port::Transport,
        queue::OutboundQueue,
        types::{CloseReason, InboundMessage, TransportEvent},
    },
    settings::SettingsStore,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Read-only view of the process-wide connection state.
///
/// Only the supervisor publishes; everyone else subscribes.
pub struct ConnectionStatus {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    fn publish(&self, state: ConnectionState) {
        let prev = self.tx.send_replace(state);
        if prev != state {
            debug!(?prev, ?state, "connection state changed");
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives decoded inbound messages from the supervisor (the command router).
///
/// Returning a session-corrupt error routes the supervisor into the
/// wipe-and-restart path; any other error is logged and the event dropped.
pub trait InboundSink: Send + Sync {
    fn deliver(&self, message: InboundMessage) -> Result<()>;
}

/// Session corruption raised by command handlers, after the inbound hand-off.
///
/// Reports coalesce: several before the supervisor reacts cause a single wipe.
#[derive(Clone)]
pub struct SessionFaults {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl SessionFaults {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn report(&self, reason: impl Into<String>) {
        self.tx.send_replace(Some(reason.into()));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for SessionFaults {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of feeding an event to the [`Lifecycle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    NotifyConnected,
    Reconnect { delay: Duration },
    WipeAndReconnect,
    Terminate,
}

/// Marks a reconnect decision; cleared only when a later attempt opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ReconnectToken {
    trigger: u64,
}

/// Reconnect/wipe/terminate policy, independent of any I/O.
///
/// Every connection attempt gets a generation number; recoverable events from
/// superseded generations are ignored.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    generation: u64,
    reconnect: Option<ReconnectToken>,
    wipe_pending: bool,
    notified: bool,
    terminal: bool,
    retry_delay: Duration,
}

impl Lifecycle {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            reconnect: None,
            wipe_pending: false,
            notified: false,
            terminal: false,
            retry_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn reconnect_in_flight(&self) -> bool {
        self.reconnect.is_some()
    }

    /// Disconnected -> Connecting. Returns the new attempt's generation.
    pub fn begin_attempt(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.wipe_pending = false;
        self.generation
    }

    pub fn on_opened(&mut self, generation: u64) -> Action {
        if self.terminal || generation != self.generation {
            return Action::None;
        }
        self.state = ConnectionState::Open;
        self.reconnect = None;
        if self.notified {
            return Action::None;
        }
        self.notified = true;
        Action::NotifyConnected
    }

    pub fn on_closed(&mut self, generation: u64, reason: &CloseReason) -> Action {
        if self.terminal {
            return Action::None;
        }
        match reason {
            CloseReason::LoggedOut => {
                self.terminal = true;
                self.reconnect = None;
                self.state = ConnectionState::Disconnected;
                Action::Terminate
            }
            CloseReason::SessionCorrupt(_) => self.on_corrupt(),
            CloseReason::Recoverable(_) => {
                if generation != self.generation {
                    return Action::None;
                }
                if matches!(self.reconnect, Some(t) if t.trigger == generation) {
                    // Repeated close for an event we already reconnect for.
                    return Action::None;
                }
                // An attempt that never opened failed; space the retries out.
                let delay = if self.state == ConnectionState::Open {
                    Duration::ZERO
                } else {
                    self.retry_delay
                };
                self.reconnect = Some(ReconnectToken {
                    trigger: generation,
                });
                self.state = ConnectionState::Connecting;
                Action::Reconnect { delay }
            }
        }
    }

    /// Session/integrity corruption. Supersedes any in-flight reconnect.
    pub fn on_corrupt(&mut self) -> Action {
        if self.terminal || self.wipe_pending {
            return Action::None;
        }
        self.wipe_pending = true;
        self.reconnect = Some(ReconnectToken {
            trigger: self.generation,
        });
        self.state = ConnectionState::Disconnected;
        Action::WipeAndReconnect
    }

    /// Classify a failure that happened outside the event stream (connect, credential load).
    pub fn on_error(&mut self, generation: u64, err: &Error) -> Action {
        match err {
            Error::SessionCorrupt(_) => self.on_corrupt(),
            Error::LoggedOut => self.on_closed(generation, &CloseReason::LoggedOut),
            other => self.on_closed(generation, &CloseReason::Recoverable(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Delay before retrying an attempt that failed before it opened.
    pub retry_delay: Duration,
    /// Recipient of the one-time "connected" notification.
    pub notify: Option<Jid>,
}

enum Step {
    Reconnect,
    Wipe,
    LoggedOut,
    Shutdown,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    queue: OutboundQueue,
    settings: Arc<SettingsStore>,
    inbound: Arc<dyn InboundSink>,
    status: Arc<ConnectionStatus>,
    faults: SessionFaults,
    cfg: SupervisorConfig,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        queue: OutboundQueue,
        settings: Arc<SettingsStore>,
        inbound: Arc<dyn InboundSink>,
        status: Arc<ConnectionStatus>,
        cfg: SupervisorConfig,
    ) -> Self {
        Self {
            transport,
            credentials,
            queue,
            settings,
            inbound,
            status,
            faults: SessionFaults::new(),
            cfg,
        }
    }

    /// Share a fault channel with the dispatch layer.
    pub fn with_session_faults(mut self, faults: SessionFaults) -> Self {
        self.faults = faults;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.status.current()
    }

    /// Run until shutdown (`Ok`) or a terminal logout (`Err(Error::LoggedOut)`).
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut machine = Lifecycle::new(self.cfg.retry_delay);
        let mut faults = self.faults.subscribe();

        loop {
            let generation = machine.begin_attempt();
            self.status.publish(machine.state());
            // Reports raised before this attempt belong to a session already torn down.
            faults.borrow_and_update();
            info!(generation, "connecting");

            match self
                .attempt(generation, &mut machine, &mut faults, &shutdown)
                .await
            {
                Step::Reconnect => {
                    info!(generation, "reconnecting");
                }
                Step::Wipe => {
                    warn!(generation, "session corrupt; wiping credentials and re-pairing");
                    self.transport.disconnect().await;
                    self.credentials.wipe().map_err(|e| {
                        error!("failed to wipe session credentials: {e}");
                        e
                    })?;
                }
                Step::LoggedOut => {
                    self.transport.disconnect().await;
                    self.status.publish(ConnectionState::Disconnected);
                    error!("session was logged out; pair the device again and restart");
                    return Err(Error::LoggedOut);
                }
                Step::Shutdown => {
                    self.status.publish(ConnectionState::Closing);
                    self.transport.disconnect().await;
                    self.status.publish(ConnectionState::Disconnected);
                    info!("connection supervisor stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn attempt(
        &self,
        generation: u64,
        machine: &mut Lifecycle,
        faults: &mut watch::Receiver<Option<String>>,
        shutdown: &CancellationToken,
    ) -> Step {
        let credentials = match self.credentials.load() {
            Ok(c) => c,
            Err(e) => {
                warn!(generation, "failed to load session credentials: {e}");
                let action = machine.on_error(generation, &e);
                self.status.publish(machine.state());
                return self
                    .settle(action, None, generation, machine, faults, shutdown)
                    .await;
            }
        };
        if credentials.is_none() {
            info!("no stored session; waiting for pairing");
        }

        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Step::Shutdown,
            res = self.transport.connect(credentials) => res,
        };
        let mut events = match connected {
            Ok(rx) => rx,
            Err(e) => {
                warn!(generation, "connect failed: {e}");
                let action = machine.on_error(generation, &e);
                self.status.publish(machine.state());
                return self
                    .settle(action, None, generation, machine, faults, shutdown)
                    .await;
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Step::Shutdown,
                Ok(()) = faults.changed() => {
                    let action = self.on_fault(generation, faults, machine);
                    if action == Action::None {
                        continue;
                    }
                    return self
                        .settle(action, Some(&mut events), generation, machine, faults, shutdown)
                        .await;
                }
                ev = events.recv() => ev,
            };

            let Some(event) = event else {
                let reason = CloseReason::Recoverable("event stream ended".to_string());
                let action = machine.on_closed(generation, &reason);
                self.status.publish(machine.state());
                if action == Action::None {
                    // Nothing left to listen to; do not spin on a closed stream.
                    return self.wait(self.cfg.retry_delay, shutdown).await;
                }
                return self
                    .settle(action, None, generation, machine, faults, shutdown)
                    .await;
            };

            let action = self.observe(generation, event, machine);
            if action == Action::NotifyConnected {
                self.notify_connected().await;
                continue;
            }
            if action != Action::None {
                return self
                    .settle(action, Some(&mut events), generation, machine, faults, shutdown)
                    .await;
            }
        }
    }

    fn on_fault(
        &self,
        generation: u64,
        faults: &watch::Receiver<Option<String>>,
        machine: &mut Lifecycle,
    ) -> Action {
        let reason = faults.borrow().clone().unwrap_or_default();
        error!(generation, "command dispatch hit session corruption: {reason}");
        let action = machine.on_corrupt();
        self.status.publish(machine.state());
        action
    }

    /// Apply one transport event to the machine, performing the side effects
    /// that do not change the connection (credential saves, inbound delivery).
    fn observe(&self, generation: u64, event: TransportEvent, machine: &mut Lifecycle) -> Action {
        let action = match event {
            TransportEvent::Opened { own_id } => {
                let action = machine.on_opened(generation);
                if machine.state() == ConnectionState::Open {
                    info!(
                        generation,
                        own_id = own_id.as_ref().map(|j| j.as_str()).unwrap_or("unknown"),
                        "connection open"
                    );
                }
                action
            }
            TransportEvent::Closed(reason) => {
                match &reason {
                    CloseReason::Recoverable(why) => {
                        warn!(generation, "connection closed: {why}")
                    }
                    CloseReason::LoggedOut => error!(generation, "connection closed: logged out"),
                    CloseReason::SessionCorrupt(why) => {
                        error!(generation, "connection closed, session corrupt: {why}")
                    }
                }
                machine.on_closed(generation, &reason)
            }
            TransportEvent::Inbound(message) => match self.inbound.deliver(message) {
                Ok(()) => Action::None,
                Err(e) if e.is_session_corrupt() => {
                    error!(generation, "inbound processing hit session corruption: {e}");
                    machine.on_corrupt()
                }
                Err(e) => {
                    warn!(generation, "dropping inbound event: {e}");
                    Action::None
                }
            },
            TransportEvent::CredentialsUpdated(credentials) => {
                if let Err(e) = self.credentials.save(&credentials) {
                    warn!("failed to persist session credentials: {e}");
                } else {
                    debug!("session credentials saved");
                }
                Action::None
            }
            TransportEvent::PairingCode(code) => {
                info!(code = %code, "pairing required: scan this code from the phone app");
                Action::None
            }
        };
        self.status.publish(machine.state());
        action
    }

    /// Turn a decision into the next step, serving any reconnect delay.
    ///
    /// While waiting, the old stream is still drained so a corruption or
    /// logout report supersedes the pending reconnect.
    async fn settle(
        &self,
        action: Action,
        mut events: Option<&mut mpsc::Receiver<TransportEvent>>,
        generation: u64,
        machine: &mut Lifecycle,
        faults: &mut watch::Receiver<Option<String>>,
        shutdown: &CancellationToken,
    ) -> Step {
        let delay = match action {
            Action::WipeAndReconnect => return Step::Wipe,
            Action::Terminate => return Step::LoggedOut,
            Action::Reconnect { delay } => delay,
            Action::None | Action::NotifyConnected => self.cfg.retry_delay,
        };
        if delay.is_zero() {
            return Step::Reconnect;
        }
        debug!(generation, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            let next = match events.as_deref_mut() {
                Some(rx) => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Step::Shutdown,
                    _ = &mut deadline => return Step::Reconnect,
                    Ok(()) = faults.changed() => {
                        if self.on_fault(generation, faults, machine) == Action::WipeAndReconnect {
                            return Step::Wipe;
                        }
                        continue;
                    }
                    ev = rx.recv() => ev,
                },
                None => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Step::Shutdown,
                    _ = &mut deadline => return Step::Reconnect,
                    Ok(()) = faults.changed() => {
                        if self.on_fault(generation, faults, machine) == Action::WipeAndReconnect {
                            return Step::Wipe;
                        }
                        continue;
                    }
                },
            };

            match next {
                None => events = None,
                Some(TransportEvent::Closed(reason @ CloseReason::LoggedOut))
                | Some(TransportEvent::Closed(reason @ CloseReason::SessionCorrupt(_))) => {
                    match machine.on_closed(generation, &reason) {
                        Action::WipeAndReconnect => return Step::Wipe,
                        Action::Terminate => return Step::LoggedOut,
                        _ => {}
                    }
                }
                Some(TransportEvent::CredentialsUpdated(credentials)) => {
                    if let Err(e) = self.credentials.save(&credentials) {
                        warn!("failed to persist session credentials: {e}");
                    }
                }
                Some(_) => {}
            }
        }
    }

    async fn wait(&self, delay: Duration, shutdown: &CancellationToken) -> Step {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Step::Shutdown,
            _ = sleep(delay) => Step::Reconnect,
        }
    }

    async fn notify_connected(&self) {
        let Some(to) = self.cfg.notify.as_ref() else {
            debug!("no owner configured; skipping connected notification");
            return;
        };
        let prefix = self.settings.snapshot().await.prefix;
        let connected_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let text = connected_banner(&prefix, &connected_at);
        match self.queue.send_text(to, text) {
            Ok(()) => info!(to = %to, "connected notification queued"),
            Err(e) => warn!(to = %to, "failed to queue connected notification: {e}"),
        }
    }
}

fn connected_banner(prefix: &str, timestamp: &str) -> String {
    format!(
        "✅ *Bot Connected!*\n\n\
         🤖 WhatsApp bot is online\n\
         ⏰ Connected at: {timestamp}\n\
         📱 Status: Ready\n\n\
         Type {prefix}help for commands."
    )
}
