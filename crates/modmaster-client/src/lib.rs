//! Modbus TCP master.
//!
//! [`ModbusMaster`] is the caller-facing handle. It forwards operations to a
//! [`MasterDriver`] task which owns the [`Engine`] and polls it on a fixed
//! beat, so any number of handles share one connection.

#![forbid(unsafe_code)]

pub mod engine;
pub mod operation;
pub mod sync;
pub mod transaction;

pub use engine::{Completion, Engine, PollReport, RequestFrame};
pub use operation::{RegisterRequest, RegisterResponse, WriteAck};
pub use sync::{SyncMasterError, SyncModbusTcpMaster};
pub use transaction::{TransactionError, TransactionManager};

pub use modmaster_transport::ConnectionState;

use engine::Responder;
use modmaster_core::pdu::{ExceptionCode, ExceptionResponse, FunctionCode};
use modmaster_core::{DecodeError, EncodeError};
use modmaster_transport::{Connector, TcpConnector, Transport, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterConfig {
    /// Deadline for each operation, measured from when its frame is sent.
    /// `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Transactions allowed on the wire at once.
    pub max_in_flight: usize,
    pub poll_interval: Duration,
    /// Bytes requested from the transport per read.
    pub receive_chunk: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            response_timeout: None,
            connect_timeout: Some(Duration::from_secs(5)),
            max_in_flight: 1,
            poll_interval: Duration::from_millis(1),
            receive_chunk: 260,
        }
    }
}

impl MasterConfig {
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_receive_chunk(mut self, receive_chunk: usize) -> Self {
        self.receive_chunk = receive_chunk.max(1);
        self
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("not connected (connection is {0})")]
    NotConnected(ConnectionState),
    #[error("connection closed before the response arrived")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("modbus exception: {0}")]
    Exception(ExceptionResponse),
    #[error("request timed out")]
    Timeout,
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

impl ClientError {
    /// The slave's exception code, when the slave answered with one.
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::Exception(ex) => Some(ex.exception_code),
            _ => None,
        }
    }
}

/// A response that decoded cleanly but does not answer its request, or a
/// byte stream that lost framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(DecodeError),
    #[error("unit id mismatch: expected {expected}, got {got}")]
    UnitMismatch { expected: u8, got: u8 },
    #[error("unexpected function code: expected 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedFunction { expected: u8, got: u8 },
    #[error("register count mismatch: expected {expected}, got {got}")]
    CountMismatch { expected: usize, got: usize },
    #[error(
        "write echo mismatch: expected {expected_quantity} at {expected_start}, got {quantity} at {start}"
    )]
    EchoMismatch {
        expected_start: u16,
        expected_quantity: u16,
        start: u16,
        quantity: u16,
    },
}

#[cfg(feature = "metrics")]
#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests_total: AtomicU64,
    successful_responses: AtomicU64,
    exceptions_total: AtomicU64,
    timeouts_total: AtomicU64,
    dropped_frames_total: AtomicU64,
    malformed_frames_total: AtomicU64,
    protocol_errors_total: AtomicU64,
    transport_errors_total: AtomicU64,
}

#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub requests_total: u64,
    pub successful_responses: u64,
    pub exceptions_total: u64,
    pub timeouts_total: u64,
    pub dropped_frames_total: u64,
    pub malformed_frames_total: u64,
    pub protocol_errors_total: u64,
    pub transport_errors_total: u64,
}

#[cfg(feature = "metrics")]
impl ClientMetrics {
    fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            successful_responses: self.successful_responses.load(Ordering::Relaxed),
            exceptions_total: self.exceptions_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            dropped_frames_total: self.dropped_frames_total.load(Ordering::Relaxed),
            malformed_frames_total: self.malformed_frames_total.load(Ordering::Relaxed),
            protocol_errors_total: self.protocol_errors_total.load(Ordering::Relaxed),
            transport_errors_total: self.transport_errors_total.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Submit {
        unit_id: u8,
        request: RegisterRequest,
        timeout: Option<Duration>,
        responder: Responder,
    },
    Close {
        done: oneshot::Sender<()>,
    },
    Reconnect {
        done: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Cloneable handle to a running master.
///
/// Operations suspend the calling task until the driver settles them.
/// Dropping every handle stops the driver and closes the connection.
#[derive(Debug, Clone)]
pub struct ModbusMaster {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    response_timeout: Option<Duration>,
    #[cfg(feature = "metrics")]
    metrics: Arc<ClientMetrics>,
}

impl ModbusMaster {
    /// Wraps an already connected transport. The returned driver must be
    /// run (usually spawned) for operations to make progress.
    pub fn new<T: Transport + 'static>(transport: T, config: MasterConfig) -> (Self, MasterDriver<T>) {
        Self::assemble(Engine::new(transport, config), None, config)
    }

    /// Like [`new`](Self::new) but the driver connects through `connector`
    /// when it starts, and again on every [`reconnect`](Self::reconnect).
    pub fn with_connector<C>(connector: C, config: MasterConfig) -> (Self, MasterDriver<C::Transport>)
    where
        C: Connector + 'static,
    {
        Self::assemble(Engine::detached(config), Some(Box::new(connector)), config)
    }

    /// Connects to `addr` and spawns the driver on the current runtime.
    pub async fn connect_tcp(addr: impl Into<String>, config: MasterConfig) -> Result<Self, ClientError> {
        let connector = TcpConnector::new(addr).with_connect_timeout(config.connect_timeout);
        let transport = connector.connect().await?;
        debug!(addr = connector.addr(), "modbus tcp connection established");
        let (master, driver) = Self::assemble(
            Engine::new(transport, config),
            Some(Box::new(connector)),
            config,
        );
        tokio::spawn(driver.run());
        Ok(master)
    }

    fn assemble<T: Transport + 'static>(
        engine: Engine<T>,
        connector: Option<Box<dyn Connector<Transport = T>>>,
        config: MasterConfig,
    ) -> (Self, MasterDriver<T>) {
        #[cfg(feature = "metrics")]
        let metrics = Arc::new(ClientMetrics::default());
        #[cfg(feature = "metrics")]
        let engine = engine.with_metrics(Arc::clone(&metrics));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(engine.state());
        let master = Self {
            commands: command_tx,
            state: state_rx,
            response_timeout: config.response_timeout,
            #[cfg(feature = "metrics")]
            metrics,
        };
        let driver = MasterDriver {
            engine,
            connector,
            commands: command_rx,
            state: state_tx,
            poll_interval: config.poll_interval,
        };
        (master, driver)
    }

    /// A handle whose operations use `timeout` instead of the configured
    /// response timeout.
    pub fn with_response_timeout(&self, timeout: Option<Duration>) -> Self {
        let mut master = self.clone();
        master.response_timeout = timeout;
        master
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the connection state satisfies `ready`.
    pub async fn wait_for_state(
        &self,
        ready: impl Fn(ConnectionState) -> bool,
    ) -> Result<ConnectionState, ClientError> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if ready(current) {
                return Ok(current);
            }
            state.changed().await.map_err(|_| ClientError::Disconnected)?;
        }
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn read_holding_registers(
        &self,
        unit_id: u8,
        start: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ClientError> {
        let request = RegisterRequest::read_holding_registers(start, quantity)?;
        match self.execute(unit_id, request).await? {
            RegisterResponse::Registers(values) => Ok(values),
            RegisterResponse::Written(_) => Err(ProtocolError::UnexpectedFunction {
                expected: FunctionCode::ReadHoldingRegisters.as_u8(),
                got: FunctionCode::WriteMultipleRegisters.as_u8(),
            }
            .into()),
        }
    }

    pub async fn write_multiple_registers(
        &self,
        unit_id: u8,
        start: u16,
        values: &[u16],
    ) -> Result<WriteAck, ClientError> {
        let request = RegisterRequest::write_multiple_registers(start, values)?;
        match self.execute(unit_id, request).await? {
            RegisterResponse::Written(ack) => Ok(ack),
            RegisterResponse::Registers(_) => Err(ProtocolError::UnexpectedFunction {
                expected: FunctionCode::WriteMultipleRegisters.as_u8(),
                got: FunctionCode::ReadHoldingRegisters.as_u8(),
            }
            .into()),
        }
    }

    /// Submits a prepared request and waits for its outcome.
    pub async fn execute(
        &self,
        unit_id: u8,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, ClientError> {
        let (responder, completion) = Completion::channel();
        self.commands
            .send(Command::Submit {
                unit_id,
                request,
                timeout: self.response_timeout,
                responder,
            })
            .map_err(|_| ClientError::Disconnected)?;
        completion.wait().await
    }

    /// Closes the connection. Outstanding operations fail with
    /// [`ClientError::Disconnected`].
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = closed.await;
        }
    }

    /// Drops the current connection and opens a new one.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let (done, reconnected) = oneshot::channel();
        self.commands
            .send(Command::Reconnect { done })
            .map_err(|_| ClientError::Disconnected)?;
        reconnected.await.unwrap_or(Err(ClientError::Disconnected))
    }
}

/// Owns the engine and drives it until every [`ModbusMaster`] handle is gone.
pub struct MasterDriver<T: Transport> {
    engine: Engine<T>,
    connector: Option<Box<dyn Connector<Transport = T>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    poll_interval: Duration,
}

impl<T: Transport + 'static> MasterDriver<T> {
    pub async fn run(mut self) {
        if !self.engine.state().is_connected() && self.connector.is_some() {
            if let Err(err) = self.reconnect().await {
                warn!(error = %err, "initial modbus connection failed");
            }
        }

        let period = if self.poll_interval.is_zero() {
            MasterConfig::default().poll_interval
        } else {
            self.poll_interval
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => {}
            }
            self.engine.poll(Instant::now());
            self.publish_state();
        }

        self.engine.close();
        self.publish_state();
        debug!("modbus master driver stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                unit_id,
                request,
                timeout,
                responder,
            } => self.engine.enqueue(unit_id, request, timeout, responder),
            Command::Close { done } => {
                debug!(in_flight = self.engine.in_flight(), "closing modbus connection");
                self.engine.close();
                self.publish_state();
                let _ = done.send(());
            }
            Command::Reconnect { done } => {
                let result = self.reconnect().await;
                let _ = done.send(result);
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ClientError> {
        let Some(connector) = self.connector.as_ref() else {
            return Err(ClientError::InvalidArgument(
                "master was built without a connector",
            ));
        };
        self.engine.begin_connect();
        self.publish_state();

        match connector.connect().await {
            Ok(transport) => {
                self.engine.attach(transport);
                self.publish_state();
                debug!(state = %self.engine.state(), "modbus connection re-established");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "modbus connect attempt failed");
                self.engine.connect_failed();
                self.publish_state();
                Err(ClientError::Transport(err))
            }
        }
    }

    fn publish_state(&self) {
        let state = self.engine.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
