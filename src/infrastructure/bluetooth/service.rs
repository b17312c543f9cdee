//! Cube Session Module
//!
//! A single task owns the peripheral, the cipher and the driver for one
//! connection at a time. Callers talk to it through [`SessionHandle`]; all
//! decoded data and lifecycle transitions come back on one event channel.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::models::{
    ConnectionInfo, CubeCommand, CubeEvent, DisconnectReason, Generation, HostMillis,
    LifecycleEvent, MessageSeverity, PeripheralIdentity, SessionEvent, SessionState,
    StatusMessage,
};
use crate::domain::settings::Settings;
use crate::error::{CubeError, Result, TransportError};
use crate::infrastructure::bluetooth::connection::{
    ActiveLink, BleConnection, ConnectTarget, ConnectionConfig,
};
use crate::infrastructure::bluetooth::platform::BlePlatform;
use crate::infrastructure::bluetooth::scanner::{BleScanner, CandidateMatcher};

/// Commands requested right after connecting so the first facelet state,
/// hardware info and battery level arrive without the caller asking.
const SNAPSHOT_COMMANDS: [CubeCommand; 3] = [
    CubeCommand::RequestFacelets,
    CubeCommand::RequestHardware,
    CubeCommand::RequestBattery,
];

/// Current host time in Unix milliseconds.
pub fn now_millis() -> HostMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as HostMillis)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct SessionShared {
    state: SessionState,
    info: ConnectionInfo,
}

/// State readable from any handle plus the event sender, shared by the
/// session task and the connection setup it drives.
#[derive(Clone)]
pub(crate) struct StatusReporter {
    shared: Arc<Mutex<SessionShared>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl StatusReporter {
    fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SessionShared::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emits [`LifecycleEvent::StateChanged`] only on an actual change.
    pub fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut self.lock().state, state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
            self.emit(SessionEvent::Lifecycle(LifecycleEvent::StateChanged(state)));
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn set_target(&self, identity: &PeripheralIdentity) {
        let mut shared = self.lock();
        shared.info = ConnectionInfo {
            connected: false,
            device_name: identity.name.clone(),
            address: Some(identity.address.clone()),
            generation: identity.generation,
        };
    }

    pub fn set_generation(&self, generation: Generation) {
        self.lock().info.generation = Some(generation);
    }

    fn mark_connected(&self, identity: &PeripheralIdentity) -> ConnectionInfo {
        let mut shared = self.lock();
        shared.info = ConnectionInfo {
            connected: true,
            device_name: identity.name.clone(),
            address: Some(identity.address.clone()),
            generation: identity.generation,
        };
        shared.info.clone()
    }

    pub fn info(&self) -> ConnectionInfo {
        self.lock().info.clone()
    }

    pub fn clear_info(&self) {
        self.lock().info = ConnectionInfo::default();
    }

    pub fn emit(&self, event: SessionEvent) {
        // Nobody listening is not an error for the session.
        let _ = self.events.send(event);
    }

    pub fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.emit(SessionEvent::Log(StatusMessage {
            message: message.into(),
            severity,
        }));
    }
}

enum SessionCommand {
    Connect {
        target: ConnectTarget,
        reply: oneshot::Sender<Result<ConnectionInfo>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    SendCommand {
        command: CubeCommand,
        reply: oneshot::Sender<Result<()>>,
    },
    StartScan {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScan {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap, cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: StatusReporter,
}

impl SessionHandle {
    /// Resolves once the link is subscribed and ready, or setup failed. A
    /// concurrent [`SessionHandle::disconnect`] resolves it with
    /// [`CubeError::Cancelled`].
    pub async fn connect(&self, target: ConnectTarget) -> Result<ConnectionInfo> {
        self.request(|reply| SessionCommand::Connect { target, reply })
            .await
    }

    /// Ends the current connection or cancels one in progress. A no-op when
    /// idle.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Disconnect { reply })
            .await
    }

    /// Encrypts and writes a command. Commands without an encoding for the
    /// connected generation succeed without writing anything.
    pub async fn send_command(&self, command: CubeCommand) -> Result<()> {
        self.request(|reply| SessionCommand::SendCommand { command, reply })
            .await
    }

    /// Candidates arrive as [`LifecycleEvent::CandidateFound`].
    pub async fn start_scan(&self) -> Result<()> {
        self.request(|reply| SessionCommand::StartScan { reply })
            .await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(|reply| SessionCommand::StopScan { reply })
            .await
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.status.info()
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| CubeError::SessionClosed)?;
        response.await.map_err(|_| CubeError::SessionClosed)?
    }
}

/// Starts the session task on the current tokio runtime. The task ends once
/// every [`SessionHandle`] is dropped.
pub fn spawn_session<P: BlePlatform>(
    platform: Arc<P>,
    settings: Settings,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    JoinHandle<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let status = StatusReporter::new(event_tx.clone());

    let session = CubeSession {
        scanner: BleScanner::new(
            platform.clone(),
            CandidateMatcher::from_settings(&settings),
            event_tx,
        ),
        platform,
        config: ConnectionConfig::from(&settings),
        snapshot_delay: Duration::from_millis(settings.snapshot_delay_ms),
        status: status.clone(),
        commands: command_rx,
    };
    let task = tokio::spawn(session.run());

    (
        SessionHandle {
            commands: command_tx,
            status,
        },
        event_rx,
        task,
    )
}

enum ConnectStep {
    Finished(Result<ActiveLink>),
    Command(Option<SessionCommand>),
}

enum ConnectOutcome {
    Connected(ActiveLink),
    Idle,
    Shutdown,
}

enum LinkStep {
    Command(Option<SessionCommand>),
    Notification(Option<Vec<u8>>),
    Snapshot,
}

struct CubeSession<P: BlePlatform> {
    platform: Arc<P>,
    config: ConnectionConfig,
    snapshot_delay: Duration,
    status: StatusReporter,
    scanner: BleScanner<P>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl<P: BlePlatform> CubeSession<P> {
    async fn run(mut self) {
        info!("Cube session started");

        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Connect { target, reply } => {
                    match self.connect(target, reply).await {
                        ConnectOutcome::Connected(link) => {
                            if !self.run_connected(link).await {
                                break;
                            }
                        }
                        ConnectOutcome::Idle => {}
                        ConnectOutcome::Shutdown => break,
                    }
                }
                SessionCommand::Disconnect { reply } => {
                    debug!("Disconnect requested while idle");
                    let _ = reply.send(Ok(()));
                }
                SessionCommand::SendCommand { reply, .. } => {
                    let _ = reply.send(Err(TransportError::NotConnected.into()));
                }
                SessionCommand::StartScan { reply } => {
                    let _ = reply.send(self.start_scan().await);
                }
                SessionCommand::StopScan { reply } => {
                    let result = self.scanner.stop().await;
                    if self.status.state() == SessionState::Scanning {
                        self.status.set_state(SessionState::Idle);
                    }
                    let _ = reply.send(result.map_err(Into::into));
                }
            }
        }

        if let Err(e) = self.scanner.stop().await {
            warn!("Failed to stop scan on shutdown: {}", e);
        }
        info!("Cube session stopped");
    }

    async fn start_scan(&mut self) -> Result<()> {
        if self.status.state() == SessionState::Idle {
            self.status.set_state(SessionState::Scanning);
        }
        self.scanner.start().await.map_err(Into::into)
    }

    /// Drives connection setup while still answering commands.
    async fn connect(
        &mut self,
        target: ConnectTarget,
        reply: oneshot::Sender<Result<ConnectionInfo>>,
    ) -> ConnectOutcome {
        if let Err(e) = self.scanner.stop().await {
            warn!("Failed to stop scan before connecting: {}", e);
        }

        let connection = BleConnection::new(
            self.platform.clone(),
            self.config.clone(),
            self.status.clone(),
        );
        let mut attempt = Box::pin(connection.establish(target));

        loop {
            let step = tokio::select! {
                result = &mut attempt => ConnectStep::Finished(result),
                command = self.commands.recv() => ConnectStep::Command(command),
            };

            match step {
                ConnectStep::Finished(Ok(link)) => {
                    let info = self.status.mark_connected(&link.identity);
                    self.status.set_state(SessionState::Connected);
                    info!("Cube {} ready", link.identity.address);
                    self.status
                        .emit(SessionEvent::Lifecycle(LifecycleEvent::Connected(info.clone())));
                    self.status
                        .log("Connected to cube", MessageSeverity::Success);
                    let _ = reply.send(Ok(info));
                    return ConnectOutcome::Connected(link);
                }
                ConnectStep::Finished(Err(e)) => {
                    error!("Connection failed: {}", e);
                    self.status.clear_info();
                    self.status.set_state(SessionState::Idle);
                    self.status
                        .emit(SessionEvent::Lifecycle(LifecycleEvent::Error(e.to_string())));
                    self.status
                        .log(format!("Connection failed: {}", e), MessageSeverity::Error);
                    let _ = reply.send(Err(e));
                    return ConnectOutcome::Idle;
                }
                ConnectStep::Command(Some(SessionCommand::Disconnect { reply: done })) => {
                    drop(attempt);
                    self.cancel_connect().await;
                    let _ = reply.send(Err(CubeError::Cancelled));
                    let _ = done.send(Ok(()));
                    return ConnectOutcome::Idle;
                }
                ConnectStep::Command(Some(SessionCommand::Connect { reply: other, .. })) => {
                    let address = self
                        .status
                        .info()
                        .address
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "pending peripheral".to_string());
                    let _ = other.send(Err(TransportError::AlreadyConnected(address).into()));
                }
                ConnectStep::Command(Some(SessionCommand::SendCommand { reply, .. })) => {
                    let _ = reply.send(Err(TransportError::NotConnected.into()));
                }
                ConnectStep::Command(Some(SessionCommand::StartScan { reply })) => {
                    let _ = reply.send(Err(TransportError::Scan(
                        "connection attempt in progress".to_string(),
                    )
                    .into()));
                }
                ConnectStep::Command(Some(SessionCommand::StopScan { reply })) => {
                    let _ = reply.send(Ok(()));
                }
                ConnectStep::Command(None) => {
                    drop(attempt);
                    self.cancel_connect().await;
                    let _ = reply.send(Err(CubeError::Cancelled));
                    return ConnectOutcome::Shutdown;
                }
            }
        }
    }

    async fn cancel_connect(&mut self) {
        info!("Connection attempt cancelled");
        let was_scanning = self.status.state() == SessionState::Scanning;
        self.status.set_state(SessionState::Disconnecting);
        // Dropping the resolve step does not stop the radio scan it started.
        if was_scanning {
            if let Err(e) = self.platform.stop_scan().await {
                debug!("Stop scan after cancel failed: {}", e);
            }
        }
        if let Some(address) = self.status.info().address {
            if let Err(e) = self.platform.disconnect(&address).await {
                debug!("Disconnect after cancel failed: {}", e);
            }
        }
        self.status.clear_info();
        self.status
            .log("Connection attempt cancelled", MessageSeverity::Warning);
        self.status.set_state(SessionState::Idle);
    }

    /// Runs until the link ends. Returns `false` when the session itself
    /// should stop.
    async fn run_connected(&mut self, mut link: ActiveLink) -> bool {
        let snapshot = tokio::time::sleep(self.snapshot_delay);
        tokio::pin!(snapshot);
        let mut snapshot_pending = true;

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => LinkStep::Command(command),
                frame = link.notifications.next() => LinkStep::Notification(frame),
                _ = &mut snapshot, if snapshot_pending => LinkStep::Snapshot,
            };

            match step {
                LinkStep::Snapshot => {
                    snapshot_pending = false;
                    debug!("Requesting initial cube snapshot");
                    for command in SNAPSHOT_COMMANDS {
                        self.write_command(&link, command, None);
                    }
                }
                LinkStep::Notification(Some(frame)) => {
                    if let Some(reason) = self.handle_notification(&mut link, frame) {
                        self.teardown(link, reason).await;
                        return true;
                    }
                }
                LinkStep::Notification(None) => {
                    warn!("Notification stream ended, link lost");
                    self.teardown(link, DisconnectReason::Transport).await;
                    return true;
                }
                LinkStep::Command(Some(command)) => match command {
                    SessionCommand::Disconnect { reply } => {
                        self.teardown(link, DisconnectReason::Requested).await;
                        let _ = reply.send(Ok(()));
                        return true;
                    }
                    SessionCommand::SendCommand { command, reply } => {
                        self.write_command(&link, command, Some(reply));
                    }
                    SessionCommand::Connect { reply, .. } => {
                        let address = link.identity.address.to_string();
                        let _ = reply.send(Err(TransportError::AlreadyConnected(address).into()));
                    }
                    SessionCommand::StartScan { reply } => {
                        let _ = reply.send(self.scanner.start().await.map_err(Into::into));
                    }
                    SessionCommand::StopScan { reply } => {
                        let _ = reply.send(self.scanner.stop().await.map_err(Into::into));
                    }
                },
                LinkStep::Command(None) => {
                    self.teardown(link, DisconnectReason::Requested).await;
                    return false;
                }
            }
        }
    }

    /// Decrypts and decodes one notification. Malformed frames are logged
    /// and dropped; the link stays up.
    fn handle_notification(
        &self,
        link: &mut ActiveLink,
        mut frame: Vec<u8>,
    ) -> Option<DisconnectReason> {
        let generation = link.profile.generation;
        let decoded = link
            .cipher
            .decrypt(&mut frame)
            .and_then(|()| link.driver.decode(&frame, now_millis()));

        match decoded {
            Ok(events) => {
                for event in events {
                    let cube_leaving = matches!(event, CubeEvent::Disconnect { .. });
                    self.status.emit(SessionEvent::Cube(event));
                    if cube_leaving {
                        info!("Cube announced disconnect");
                        return Some(DisconnectReason::CubeInitiated);
                    }
                }
            }
            Err(e) => {
                warn!("Dropping {} frame ({} bytes): {}", generation, frame.len(), e);
                self.status.log(
                    format!("Dropped malformed {} frame: {}", generation, e),
                    MessageSeverity::Warning,
                );
            }
        }
        None
    }

    /// Encodes and encrypts on the session task, then writes off it so a
    /// slow write never stalls notification handling.
    fn write_command(
        &self,
        link: &ActiveLink,
        command: CubeCommand,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let Some(mut frame) = link.driver.encode(command) else {
            debug!(
                "{:?} has no {} encoding, skipping",
                command, link.profile.generation
            );
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };

        if let Err(e) = link.cipher.encrypt(&mut frame) {
            error!("Failed to encrypt {:?}: {}", command, e);
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.into()));
            }
            return;
        }

        let platform = self.platform.clone();
        let address = link.identity.address.clone();
        let characteristic = link.profile.command_char;
        tokio::spawn(async move {
            let result = platform
                .write(&address, characteristic, &frame)
                .await
                .map_err(CubeError::from);
            match &result {
                Ok(()) => debug!("Sent {:?}", command),
                Err(e) => warn!("Failed to send {:?}: {}", command, e),
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }

    async fn teardown(&mut self, link: ActiveLink, reason: DisconnectReason) {
        self.status.set_state(SessionState::Disconnecting);
        let address = link.identity.address.clone();
        info!("Disconnecting from {} ({:?})", address, reason);

        if let Err(e) = self.platform.disconnect(&address).await {
            debug!("Platform disconnect failed: {}", e);
        }
        drop(link);

        self.status.clear_info();
        self.status
            .emit(SessionEvent::Lifecycle(LifecycleEvent::Disconnected {
                address: Some(address),
                reason,
            }));
        self.status
            .log("Disconnected from cube", MessageSeverity::Info);
        self.status.set_state(SessionState::Idle);
    }
}
