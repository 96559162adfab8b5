//! Broker worker with statum state machine
//!
//! One worker task drives one [`BrokerConnection`]. It is the only owner of
//! the connection, so device set mutations (commands) and the reconnect
//! replay (connect acknowledgement) are serialized on the same task and can
//! never interleave.
//!
//! # State Machine
//!
//! ```text
//! Idle ──► Running ──► Draining ──► Stopped
//!  (start)   (cancel / handle dropped)  (close)
//! ```
//!
//! # Running loop
//!
//! ```text
//!            ┌─────────── commands (listen / mute / publish)
//!            │
//! select! ───┼─────────── drive_network() ──► router ──► handlers
//!            │                 │ error
//!            │                 ▼
//!            └─────────── backoff timer ──► connect()
//! ```

use crate::error::HubError;
use crate::handlers::{EventSink, HubEvent};
use crate::mqtt::backoff::Backoff;
use crate::mqtt::config::ReconnectConfig;
use crate::mqtt::connection::{BrokerConnection, BrokerStatus, ConnectionState, Progress};
use crate::mqtt::router::MessageRouter;
use crate::mqtt::topic::{BrokerId, DeviceId, TopicKind};
use crate::mqtt::transport::Transport;
use bytes::Bytes;
use statum::{machine, state};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

macro_rules! respond {
    ($response_tx:expr, $result:expr) => {
        if $response_tx.send($result).is_err() {
            debug!("Requester went away before the response");
        }
    };
}

/// Request from the manager to one broker worker
#[derive(Debug)]
pub enum BrokerCommand {
    Listen {
        device: DeviceId,
        response_tx: oneshot::Sender<Result<bool, HubError>>,
    },
    Mute {
        device: DeviceId,
        response_tx: oneshot::Sender<Result<bool, HubError>>,
    },
    Publish {
        kind: TopicKind,
        device: Option<DeviceId>,
        payload: Bytes,
        /// Reject with `UnknownDevice` unless the device is listened to
        require_tracked: bool,
        response_tx: oneshot::Sender<Result<(), HubError>>,
    },
}

pub type DriveFuture<'a> = Pin<Box<dyn Future<Output = Result<Progress, HubError>> + Send + 'a>>;

/// Transport-erased view of a [`BrokerConnection`] as seen by its worker
pub trait BrokerSession: Send {
    fn id(&self) -> BrokerId;
    fn state(&self) -> ConnectionState;
    fn is_initialized(&self) -> bool;
    fn is_tracked(&self, device: DeviceId) -> bool;
    fn status(&self) -> BrokerStatus;
    fn connect(&mut self);
    fn drive(&mut self) -> DriveFuture<'_>;
    fn listen_device(&mut self, device: DeviceId) -> Result<bool, HubError>;
    fn mute_device(&mut self, device: DeviceId) -> Result<bool, HubError>;
    fn publish(&mut self, kind: TopicKind, device: Option<DeviceId>, payload: Bytes)
        -> Result<(), HubError>;
    fn close(&mut self);
}

impl<T: Transport> BrokerSession for BrokerConnection<T> {
    fn id(&self) -> BrokerId {
        BrokerConnection::id(self)
    }

    fn state(&self) -> ConnectionState {
        BrokerConnection::state(self)
    }

    fn is_initialized(&self) -> bool {
        BrokerConnection::is_initialized(self)
    }

    fn is_tracked(&self, device: DeviceId) -> bool {
        BrokerConnection::is_tracked(self, device)
    }

    fn status(&self) -> BrokerStatus {
        BrokerConnection::status(self)
    }

    fn connect(&mut self) {
        BrokerConnection::connect(self)
    }

    fn drive(&mut self) -> DriveFuture<'_> {
        Box::pin(self.drive_network())
    }

    fn listen_device(&mut self, device: DeviceId) -> Result<bool, HubError> {
        BrokerConnection::listen_device(self, device)
    }

    fn mute_device(&mut self, device: DeviceId) -> Result<bool, HubError> {
        BrokerConnection::mute_device(self, device)
    }

    fn publish(
        &mut self,
        kind: TopicKind,
        device: Option<DeviceId>,
        payload: Bytes,
    ) -> Result<(), HubError> {
        BrokerConnection::publish(self, kind, device, payload)
    }

    fn close(&mut self) {
        BrokerConnection::close(self)
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[machine]
pub struct BrokerWorker<S: WorkerState> {
    connection: Box<dyn BrokerSession>,
    router: MessageRouter,
    sink: EventSink,
    commands: mpsc::Receiver<BrokerCommand>,
    status_tx: watch::Sender<BrokerStatus>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_reported: Option<ConnectionState>,
}

impl<S: WorkerState> BrokerWorker<S> {
    pub fn broker(&self) -> BrokerId {
        self.connection.id()
    }

    fn publish_status(&self) {
        let mut status = self.connection.status();
        status.reconnect_attempts = self.backoff.attempts();
        status.next_retry_in = self
            .retry_at
            .map(|at| at.saturating_duration_since(Instant::now()));
        self.status_tx.send_replace(status);
    }

    /// Forwards a state change to the sink, once per transition
    fn report_state(&mut self, cause: Option<String>) {
        let state = self.connection.state();
        if self.last_reported == Some(state) {
            return;
        }
        self.last_reported = Some(state);
        let event = HubEvent::connectivity(self.connection.id(), state, cause);
        if let Err(e) = self.sink.emit(event) {
            debug!(broker = %self.connection.id(), "Connectivity event not delivered: {}", e);
        }
    }
}

impl BrokerWorker<Idle> {
    pub fn create(
        connection: Box<dyn BrokerSession>,
        router: MessageRouter,
        sink: EventSink,
        commands: mpsc::Receiver<BrokerCommand>,
        status_tx: watch::Sender<BrokerStatus>,
        reconnect: ReconnectConfig,
    ) -> Self {
        debug!(broker = %connection.id(), "Creating broker worker");
        Self::new(
            connection,
            router,
            sink,
            commands,
            status_tx,
            Backoff::new(reconnect),
            None, // retry_at
            None, // last_reported
        )
    }

    /// Issues the first connect and transitions to Running.
    ///
    /// The handshake itself completes inside the run loop, so an unreachable
    /// broker is recorded there and never blocks the other brokers.
    pub fn start(mut self) -> BrokerWorker<Running> {
        self.connection.connect();
        self.report_state(None);
        self.publish_status();
        self.transition()
    }
}

impl BrokerWorker<Running> {
    /// Main loop. Runs until cancelled or until every command sender is gone.
    pub async fn run_until_shutdown(
        mut self,
        cancel: CancellationToken,
    ) -> BrokerWorker<Draining> {
        info!(broker = %self.connection.id(), "Broker worker running");

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(broker = %self.connection.id(), "Shutdown requested");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!(broker = %self.connection.id(), "Command channel closed");
                        break;
                    }
                },

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    debug!(
                        broker = %self.connection.id(),
                        attempt = self.backoff.attempts(),
                        "Retrying connection"
                    );
                    self.connection.connect();
                    self.report_state(None);
                    self.publish_status();
                }

                progress = self.connection.drive(), if retry_at.is_none() => {
                    self.on_progress(progress);
                }
            }
        }

        self.transition()
    }

    fn on_progress(&mut self, progress: Result<Progress, HubError>) {
        match progress {
            Ok(Progress::Connected) => {
                if self.backoff.attempts() > 0 {
                    info!(
                        broker = %self.connection.id(),
                        attempts = self.backoff.attempts(),
                        "Reconnected"
                    );
                }
                self.backoff.reset();
                self.report_state(None);
                self.publish_status();
            }
            Ok(Progress::Message(message)) => {
                // Already logged and counted by the router
                let _ = self
                    .router
                    .route(self.connection.id(), &message.topic, &message.payload);
                self.publish_status();
            }
            Ok(Progress::Disconnected) => {
                self.report_state(Some("broker closed the session".to_string()));
                self.schedule_retry();
            }
            // Acks drain the request queue, which may have let deferred requests out
            Ok(Progress::Idle) => self.publish_status(),
            Err(e) => {
                warn!(broker = %self.connection.id(), "{}", e);
                self.report_state(Some(e.to_string()));
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        if !self.connection.is_initialized() {
            return;
        }
        let delay = self.backoff.next_delay();
        info!(
            broker = %self.connection.id(),
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
        self.publish_status();
    }

    fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Listen {
                device,
                response_tx,
            } => {
                respond!(response_tx, self.connection.listen_device(device));
            }
            BrokerCommand::Mute {
                device,
                response_tx,
            } => {
                respond!(response_tx, self.connection.mute_device(device));
            }
            BrokerCommand::Publish {
                kind,
                device,
                payload,
                require_tracked,
                response_tx,
            } => {
                let result = match device {
                    Some(device) if require_tracked && !self.connection.is_tracked(device) => {
                        Err(HubError::UnknownDevice {
                            broker: self.connection.id(),
                            device,
                        })
                    }
                    _ => self.connection.publish(kind, device, payload),
                };
                respond!(response_tx, result);
            }
        }
        self.publish_status();
    }
}

impl BrokerWorker<Draining> {
    /// Closes the session and answers every queued command with `WorkerGone`
    pub fn shutdown(mut self) -> BrokerWorker<Stopped> {
        let broker = self.connection.id();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                BrokerCommand::Listen { response_tx, .. } | BrokerCommand::Mute { response_tx, .. } => {
                    respond!(response_tx, Err(HubError::WorkerGone(broker)));
                }
                BrokerCommand::Publish { response_tx, .. } => {
                    respond!(response_tx, Err(HubError::WorkerGone(broker)));
                }
            }
        }

        self.connection.close();
        self.retry_at = None;
        self.report_state(Some("hub shutting down".to_string()));
        self.publish_status();
        info!(broker = %broker, "Broker worker stopped");
        self.transition()
    }
}

/// Handle to a broker worker running in a tokio task
pub struct BrokerHandle {
    pub broker: BrokerId,
    pub name: String,
    commands: mpsc::Sender<BrokerCommand>,
    status: watch::Receiver<BrokerStatus>,
    task_handle: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    /// Spawns the worker for `connection` and issues its first connect
    pub fn spawn<T: Transport>(
        connection: BrokerConnection<T>,
        router: MessageRouter,
        sink: EventSink,
        reconnect: ReconnectConfig,
        command_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let broker = connection.id();
        let name = connection.config().name.clone();
        let (commands, command_rx) = mpsc::channel(command_capacity.max(1));
        let (status_tx, status) = watch::channel(connection.status());

        let worker =
            BrokerWorker::create(Box::new(connection), router, sink, command_rx, status_tx, reconnect)
                .start();

        let task_handle = tokio::spawn(async move {
            let draining = worker.run_until_shutdown(cancel).await;
            let _ = draining.shutdown();
        });

        Self {
            broker,
            name,
            commands,
            status,
            task_handle: Some(task_handle),
        }
    }

    pub fn status(&self) -> BrokerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<BrokerStatus> {
        self.status.clone()
    }

    pub async fn listen(&self, device: DeviceId) -> Result<bool, HubError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(BrokerCommand::Listen {
            device,
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| HubError::WorkerGone(self.broker))?
    }

    pub async fn mute(&self, device: DeviceId) -> Result<bool, HubError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(BrokerCommand::Mute {
            device,
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| HubError::WorkerGone(self.broker))?
    }

    pub async fn publish(
        &self,
        kind: TopicKind,
        device: Option<DeviceId>,
        payload: Bytes,
        require_tracked: bool,
    ) -> Result<(), HubError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(BrokerCommand::Publish {
            kind,
            device,
            payload,
            require_tracked,
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| HubError::WorkerGone(self.broker))?
    }

    async fn request(&self, command: BrokerCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::WorkerGone(self.broker))
    }

    /// Waits for the worker task to finish
    pub async fn join(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!(broker = %self.broker, "Broker worker panicked: {}", e);
            }
        }
    }
}
