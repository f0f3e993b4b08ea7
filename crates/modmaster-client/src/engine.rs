//! The polling protocol engine.
//!
//! [`Engine`] owns one transport and everything in flight on it. Nothing in
//! here blocks or sleeps: the host calls [`Engine::poll`] on a regular beat
//! and each call moves every transaction as far forward as the bytes at hand
//! allow. Callers learn about their operation through a [`Completion`].

use crate::operation::{RegisterRequest, RegisterResponse, WriteAck};
use crate::transaction::TransactionManager;
use crate::{ClientError, MasterConfig, ProtocolError};
use modmaster_core::encoding::Writer;
use modmaster_core::frame::tcp::{self, ResponseFrame, MAX_ADU_LEN};
use modmaster_core::pdu::{ExceptionResponse, FunctionCode, Response};
use modmaster_core::{DecodeError, FrameError};
use modmaster_transport::{ConnectionState, Transport, TransportError};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[cfg(feature = "metrics")]
use crate::ClientMetrics;
#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::sync::Arc;

pub(crate) type Outcome = Result<RegisterResponse, ClientError>;
pub(crate) type Responder = oneshot::Sender<Outcome>;

/// Pending result of one submitted operation.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub(crate) fn channel() -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Suspends until the engine settles the operation.
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or_else(|_| Err(ClientError::Disconnected))
    }

    /// The result if the operation has settled, without waiting.
    pub fn try_result(&mut self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ClientError::Disconnected)),
        }
    }
}

/// What the engine remembers about a request it has put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: FunctionCode,
    pub start_address: u16,
    pub quantity: u16,
    pub issued_at: Instant,
}

/// Summary of one [`Engine::poll`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub bytes_received: usize,
    pub frames_sent: usize,
    /// Responses matched to an outstanding transaction.
    pub resolved: usize,
    /// Well-formed responses nobody was waiting for.
    pub dropped: usize,
    pub timed_out: usize,
    /// The receive stream lost framing during this pass.
    pub malformed: bool,
    pub state: ConnectionState,
}

impl PollReport {
    fn new(state: ConnectionState) -> Self {
        Self {
            bytes_received: 0,
            frames_sent: 0,
            resolved: 0,
            dropped: 0,
            timed_out: 0,
            malformed: false,
            state,
        }
    }
}

struct Queued {
    unit_id: u8,
    request: RegisterRequest,
    timeout: Option<Duration>,
    responder: Responder,
}

struct InFlight {
    frame: RequestFrame,
    responder: Responder,
}

/// Decoded response detached from the receive buffer.
#[derive(Debug)]
enum Reply {
    Registers(Vec<u16>),
    Written(WriteAck),
    Exception(ExceptionResponse),
}

impl Reply {
    fn from_response(response: &Response<'_>) -> Self {
        match response {
            Response::ReadHoldingRegisters(data) => Self::Registers(data.registers().collect()),
            Response::WriteMultipleRegisters(echo) => Self::Written(WriteAck {
                start_address: echo.start_address,
                quantity: echo.quantity,
            }),
            Response::Exception(ex) => Self::Exception(*ex),
        }
    }
}

pub struct Engine<T: Transport> {
    transport: Option<T>,
    state: ConnectionState,
    config: MasterConfig,
    rx_buf: Vec<u8>,
    chunk: Vec<u8>,
    transactions: TransactionManager<InFlight>,
    queue: VecDeque<Queued>,
    #[cfg(feature = "metrics")]
    metrics: Arc<ClientMetrics>,
}

impl<T: Transport> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("in_flight", &self.transactions.len())
            .field("queued", &self.queue.len())
            .field("buffered", &self.rx_buf.len())
            .finish()
    }
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, config: MasterConfig) -> Self {
        let mut engine = Self::detached(config);
        engine.attach(transport);
        engine
    }

    /// An engine with no transport yet; it reports
    /// [`ConnectionState::Disconnected`] until [`attach`](Self::attach).
    pub fn detached(config: MasterConfig) -> Self {
        Self {
            transport: None,
            state: ConnectionState::Disconnected,
            config,
            rx_buf: Vec::with_capacity(MAX_ADU_LEN),
            chunk: vec![0u8; config.receive_chunk.max(1)],
            transactions: TransactionManager::new(),
            queue: VecDeque::new(),
            #[cfg(feature = "metrics")]
            metrics: Arc::new(ClientMetrics::default()),
        }
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> crate::ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> MasterConfig {
        self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transactions on the wire awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.transactions.len()
    }

    /// Submitted operations not yet sent.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Installs a freshly connected transport.
    pub fn attach(&mut self, transport: T) {
        if let Some(previous) = self.transport.as_mut() {
            previous.disconnect();
        }
        self.fail_all(|| ClientError::Disconnected);
        self.rx_buf.clear();
        self.state = if transport.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.transport = Some(transport);
    }

    /// Drops the current transport ahead of a reconnect attempt.
    pub fn begin_connect(&mut self) {
        self.shutdown(ConnectionState::Connecting, || ClientError::Disconnected);
    }

    /// Records a failed connect attempt.
    pub fn connect_failed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Disconnects and fails everything outstanding with
    /// [`ClientError::Disconnected`].
    pub fn close(&mut self) {
        self.shutdown(ConnectionState::Disconnected, || ClientError::Disconnected);
    }

    /// Queues a request using the configured response timeout.
    pub fn submit(&mut self, unit_id: u8, request: RegisterRequest) -> Result<Completion, ClientError> {
        let timeout = self.config.response_timeout;
        self.submit_with_timeout(unit_id, request, timeout)
    }

    /// Queues a request. Invalid arguments and a connection that is not up
    /// are reported here, before anything reaches the wire.
    pub fn submit_with_timeout(
        &mut self,
        unit_id: u8,
        request: RegisterRequest,
        timeout: Option<Duration>,
    ) -> Result<Completion, ClientError> {
        self.admit(&request)?;
        let (responder, completion) = Completion::channel();
        self.queue.push_back(Queued {
            unit_id,
            request,
            timeout,
            responder,
        });
        Ok(completion)
    }

    /// Same as [`submit_with_timeout`](Self::submit_with_timeout) but
    /// reports every outcome, rejections included, through `responder`.
    pub(crate) fn enqueue(
        &mut self,
        unit_id: u8,
        request: RegisterRequest,
        timeout: Option<Duration>,
        responder: Responder,
    ) {
        if let Err(err) = self.admit(&request) {
            let _ = responder.send(Err(err));
            return;
        }
        self.queue.push_back(Queued {
            unit_id,
            request,
            timeout,
            responder,
        });
    }

    fn admit(&self, request: &RegisterRequest) -> Result<(), ClientError> {
        request.validate()?;
        if !self.state.is_connected() {
            return Err(ClientError::NotConnected(self.state));
        }
        Ok(())
    }

    /// One cooperative step: read, decode, expire, flush.
    pub fn poll(&mut self, now: Instant) -> PollReport {
        let mut report = PollReport::new(self.state);

        if self.state.is_connected() {
            let receive_error = self.receive_available(&mut report);
            self.decode_buffered(&mut report);
            if let Some(err) = receive_error {
                if self.state.is_connected() {
                    self.lose_connection(&err);
                }
            }
        }

        self.expire(now, &mut report);

        if self.state.is_connected() {
            self.flush(now, &mut report);
        }

        report.state = self.state;
        report
    }

    fn receive_available(&mut self, report: &mut PollReport) -> Option<TransportError> {
        let transport = self.transport.as_mut()?;
        loop {
            match transport.receive(&mut self.chunk) {
                Ok(0) => return None,
                Ok(n) => {
                    trace!(len = n, "modbus bytes received");
                    self.rx_buf.extend_from_slice(&self.chunk[..n]);
                    report.bytes_received += n;
                }
                Err(err) => return Some(err),
            }
        }
    }

    fn decode_buffered(&mut self, report: &mut PollReport) {
        while self.state.is_connected() {
            let decoded = tcp::decode_response(&self.rx_buf)
                .map(|(frame, consumed)| (Inbound::from_frame(&frame), consumed));
            match decoded {
                Ok((inbound, consumed)) => {
                    self.rx_buf.drain(..consumed);
                    self.settle(inbound, report);
                }
                Err(FrameError::Incomplete) => {
                    let oversized = self.rx_buf.len() > MAX_ADU_LEN
                        || tcp::frame_len(&self.rx_buf).is_some_and(|len| len > MAX_ADU_LEN);
                    if oversized {
                        self.fault(DecodeError::InvalidLength, report);
                    }
                    return;
                }
                Err(FrameError::Malformed(err)) => {
                    self.fault(err, report);
                    return;
                }
            }
        }
    }

    fn settle(&mut self, inbound: Inbound, report: &mut PollReport) {
        let Some(in_flight) = self.transactions.resolve(inbound.transaction_id) else {
            warn!(
                transaction_id = inbound.transaction_id,
                unit_id = inbound.unit_id,
                "dropping modbus response with no outstanding transaction"
            );
            report.dropped += 1;
            #[cfg(feature = "metrics")]
            count(&self.metrics.dropped_frames_total);
            return;
        };

        let request = in_flight.frame;
        let outcome = match_response(&request, inbound);
        match &outcome {
            Ok(_) => {
                debug!(
                    transaction_id = request.transaction_id,
                    unit_id = request.unit_id,
                    function = request.function.as_u8(),
                    elapsed_us = request.issued_at.elapsed().as_micros() as u64,
                    "modbus request succeeded"
                );
                #[cfg(feature = "metrics")]
                count(&self.metrics.successful_responses);
            }
            Err(ClientError::Exception(ex)) => {
                debug!(
                    transaction_id = request.transaction_id,
                    unit_id = request.unit_id,
                    function = request.function.as_u8(),
                    exception = %ex.exception_code,
                    "modbus exception response"
                );
                #[cfg(feature = "metrics")]
                count(&self.metrics.exceptions_total);
            }
            Err(err) => {
                warn!(
                    transaction_id = request.transaction_id,
                    unit_id = request.unit_id,
                    function = request.function.as_u8(),
                    error = %err,
                    "modbus response does not match its request"
                );
                #[cfg(feature = "metrics")]
                count(&self.metrics.protocol_errors_total);
            }
        }
        report.resolved += 1;
        let _ = in_flight.responder.send(outcome);
    }

    fn expire(&mut self, now: Instant, report: &mut PollReport) {
        for (transaction_id, in_flight) in self.transactions.expire(now) {
            warn!(
                transaction_id,
                unit_id = in_flight.frame.unit_id,
                function = in_flight.frame.function.as_u8(),
                "modbus request timed out"
            );
            report.timed_out += 1;
            #[cfg(feature = "metrics")]
            count(&self.metrics.timeouts_total);
            let _ = in_flight.responder.send(Err(ClientError::Timeout));
        }
    }

    fn flush(&mut self, now: Instant, report: &mut PollReport) {
        let limit = self.config.max_in_flight.max(1);
        while self.state.is_connected() && self.transactions.len() < limit {
            let Some(queued) = self.queue.pop_front() else {
                return;
            };
            if self.send_queued(queued, now) {
                report.frames_sent += 1;
            }
        }
    }

    /// Puts one request on the wire. Returns whether it is now in flight.
    fn send_queued(&mut self, queued: Queued, now: Instant) -> bool {
        let transaction_id = match self.transactions.allocate() {
            Ok(id) => id,
            Err(err) => {
                let _ = queued.responder.send(Err(ClientError::Transaction(err)));
                return false;
            }
        };

        let mut buf = [0u8; MAX_ADU_LEN];
        let mut w = Writer::new(&mut buf);
        if let Err(err) =
            tcp::encode_request(&mut w, transaction_id, queued.unit_id, &queued.request.as_pdu())
        {
            let _ = queued.responder.send(Err(ClientError::Encode(err)));
            return false;
        }
        let bytes = w.as_written();

        let Some(transport) = self.transport.as_mut() else {
            let _ = queued.responder.send(Err(ClientError::NotConnected(self.state)));
            return false;
        };
        let function = queued.request.function_code();
        trace!(transaction_id, frame = ?bytes, "modbus frame out");
        let sent = transport.send(bytes);
        #[cfg(feature = "metrics")]
        count(&self.metrics.requests_total);

        let failure = match sent {
            Ok(n) if n == bytes.len() => None,
            Ok(n) => Some(TransportError::ShortWrite {
                expected: bytes.len(),
                written: n,
            }),
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            warn!(
                transaction_id,
                unit_id = queued.unit_id,
                function = function.as_u8(),
                error = %err,
                "failed to send modbus request"
            );
            self.lose_connection(&err);
            let _ = queued.responder.send(Err(ClientError::Transport(err)));
            return false;
        }

        let frame = RequestFrame {
            transaction_id,
            unit_id: queued.unit_id,
            function,
            start_address: queued.request.start_address(),
            quantity: queued.request.quantity(),
            issued_at: now,
        };
        debug!(
            transaction_id,
            unit_id = frame.unit_id,
            function = function.as_u8(),
            start_address = frame.start_address,
            quantity = frame.quantity,
            "dispatched modbus request"
        );
        let deadline = queued.timeout.map(|timeout| now + timeout);
        let in_flight = InFlight {
            frame,
            responder: queued.responder,
        };
        if let Err((err, in_flight)) = self.transactions.register(transaction_id, deadline, in_flight) {
            let _ = in_flight.responder.send(Err(ClientError::Transaction(err)));
            return false;
        }
        true
    }

    /// The receive stream can no longer be trusted.
    fn fault(&mut self, err: DecodeError, report: &mut PollReport) {
        warn!(
            error = %err,
            buffered = self.rx_buf.len(),
            in_flight = self.transactions.len(),
            "malformed modbus frame, dropping connection"
        );
        report.malformed = true;
        #[cfg(feature = "metrics")]
        count(&self.metrics.malformed_frames_total);
        self.shutdown(ConnectionState::Faulted, || {
            ClientError::Protocol(ProtocolError::MalformedFrame(err))
        });
    }

    fn lose_connection(&mut self, err: &TransportError) {
        let next = if err.is_disconnect() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Faulted
        };
        warn!(
            error = %err,
            in_flight = self.transactions.len(),
            queued = self.queue.len(),
            state = %next,
            "modbus connection lost"
        );
        #[cfg(feature = "metrics")]
        count(&self.metrics.transport_errors_total);
        self.shutdown(next, || ClientError::Disconnected);
    }

    fn shutdown(&mut self, next: ConnectionState, reason: impl Fn() -> ClientError) {
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect();
        }
        self.transport = None;
        self.rx_buf.clear();
        self.state = next;
        self.fail_all(reason);
    }

    fn fail_all(&mut self, reason: impl Fn() -> ClientError) {
        for (_, in_flight) in self.transactions.drain() {
            let _ = in_flight.responder.send(Err(reason()));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.responder.send(Err(reason()));
        }
    }
}

#[cfg(feature = "metrics")]
fn count(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug)]
struct Inbound {
    transaction_id: u16,
    unit_id: u8,
    reply: Reply,
}

impl Inbound {
    fn from_frame(frame: &ResponseFrame<'_>) -> Self {
        Self {
            transaction_id: frame.transaction_id(),
            unit_id: frame.unit_id(),
            reply: Reply::from_response(&frame.response),
        }
    }
}

fn match_response(request: &RequestFrame, inbound: Inbound) -> Outcome {
    if inbound.unit_id != request.unit_id {
        return Err(ProtocolError::UnitMismatch {
            expected: request.unit_id,
            got: inbound.unit_id,
        }
        .into());
    }

    let expected = request.function.as_u8();
    match (request.function, inbound.reply) {
        (_, Reply::Exception(ex)) if ex.function_code == expected => Err(ClientError::Exception(ex)),
        (_, Reply::Exception(ex)) => Err(ProtocolError::UnexpectedFunction {
            expected,
            got: ex.function_code | 0x80,
        }
        .into()),
        (FunctionCode::ReadHoldingRegisters, Reply::Registers(values)) => {
            if values.len() != usize::from(request.quantity) {
                return Err(ProtocolError::CountMismatch {
                    expected: usize::from(request.quantity),
                    got: values.len(),
                }
                .into());
            }
            Ok(RegisterResponse::Registers(values))
        }
        (FunctionCode::WriteMultipleRegisters, Reply::Written(ack)) => {
            if ack.start_address != request.start_address || ack.quantity != request.quantity {
                return Err(ProtocolError::EchoMismatch {
                    expected_start: request.start_address,
                    expected_quantity: request.quantity,
                    start: ack.start_address,
                    quantity: ack.quantity,
                }
                .into());
            }
            Ok(RegisterResponse::Written(ack))
        }
        (_, Reply::Registers(_)) => Err(ProtocolError::UnexpectedFunction {
            expected,
            got: FunctionCode::ReadHoldingRegisters.as_u8(),
        }
        .into()),
        (_, Reply::Written(_)) => Err(ProtocolError::UnexpectedFunction {
            expected,
            got: FunctionCode::WriteMultipleRegisters.as_u8(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Completion, Engine};
    use crate::operation::{RegisterRequest, RegisterResponse, WriteAck};
    use crate::{ClientError, MasterConfig, ProtocolError};
    use modmaster_core::pdu::ExceptionCode;
    use modmaster_core::DecodeError;
    use modmaster_transport::{ConnectionState, MemoryPeer, MemoryTransport, TransportError};
    use std::time::Duration;
    use tokio::time::Instant;

    const READ_REQUEST: [u8; 12] = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x03,
    ];
    const READ_RESPONSE: [u8; 15] = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x03, 0x06, 0x00, 0x63, 0x00, 0x96, 0x01, 0x32,
    ];

    fn engine(config: MasterConfig) -> (Engine<MemoryTransport>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        (Engine::new(transport, config), peer)
    }

    fn read(start: u16, quantity: u16) -> RegisterRequest {
        RegisterRequest::read_holding_registers(start, quantity).unwrap()
    }

    fn pending(completion: &mut Completion) -> bool {
        completion.try_result().is_none()
    }

    #[test]
    fn read_holding_registers_round_trip() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();

        let report = engine.poll(t0);
        assert_eq!(report.frames_sent, 1);
        assert_eq!(peer.take_sent(), READ_REQUEST);
        assert!(pending(&mut completion));

        peer.push(&READ_RESPONSE);
        let report = engine.poll(t0);
        assert_eq!(report.bytes_received, READ_RESPONSE.len());
        assert_eq!(report.resolved, 1);
        assert_eq!(
            completion.try_result().unwrap().unwrap(),
            RegisterResponse::Registers(vec![99, 150, 306])
        );
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn write_uses_next_transaction_id() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut first = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);
        peer.take_sent();
        peer.push(&READ_RESPONSE);
        engine.poll(t0);
        assert!(first.try_result().unwrap().is_ok());

        let request = RegisterRequest::write_multiple_registers(1, &[99, 150, 306]).unwrap();
        let mut write = engine.submit(1, request).unwrap();
        engine.poll(t0);
        assert_eq!(
            peer.take_sent(),
            [
                0x00, 0x02, 0x00, 0x00, 0x00, 0x0D, 0x01, 0x10, 0x00, 0x01, 0x00, 0x03, 0x06,
                0x00, 0x63, 0x00, 0x96, 0x01, 0x32,
            ]
        );

        peer.push(&[
            0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x01, 0x00, 0x03,
        ]);
        engine.poll(t0);
        assert_eq!(
            write.try_result().unwrap().unwrap(),
            RegisterResponse::Written(WriteAck {
                start_address: 1,
                quantity: 3
            })
        );
    }

    #[test]
    fn exception_response_reaches_caller() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        peer.push(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
        engine.poll(t0);
        match completion.try_result().unwrap() {
            Err(ClientError::Exception(ex)) => {
                assert_eq!(ex.function_code, 0x03);
                assert_eq!(ex.exception_code, ExceptionCode::IllegalDataAddress);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.state(), ConnectionState::Connected);
    }

    #[test]
    fn response_split_across_polls_resolves_once_complete() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        for byte in &READ_RESPONSE[..READ_RESPONSE.len() - 1] {
            peer.push(&[*byte]);
            let report = engine.poll(t0);
            assert_eq!(report.resolved, 0);
            assert!(pending(&mut completion));
        }
        peer.push(&READ_RESPONSE[READ_RESPONSE.len() - 1..]);
        assert_eq!(engine.poll(t0).resolved, 1);
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[test]
    fn unmatched_transaction_id_is_dropped() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        let mut stray = READ_RESPONSE;
        stray[1] = 0x63;
        peer.push(&stray);
        let report = engine.poll(t0);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.resolved, 0);
        assert!(pending(&mut completion));
        assert_eq!(engine.state(), ConnectionState::Connected);

        peer.push(&READ_RESPONSE);
        engine.poll(t0);
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[test]
    fn malformed_frame_faults_connection() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        let mut bad = READ_RESPONSE;
        bad[3] = 0x01;
        peer.push(&bad);
        let report = engine.poll(t0);
        assert!(report.malformed);
        assert_eq!(report.state, ConnectionState::Faulted);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Protocol(ProtocolError::MalformedFrame(
                DecodeError::InvalidProtocolId(1)
            )))
        ));
        assert!(!peer.master_connected());
        assert!(matches!(
            engine.submit(1, read(1, 3)),
            Err(ClientError::NotConnected(ConnectionState::Faulted))
        ));
    }

    #[test]
    fn oversized_declared_length_faults_without_waiting() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        peer.push(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01]);
        let report = engine.poll(t0);
        assert!(report.malformed);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Protocol(ProtocolError::MalformedFrame(
                DecodeError::InvalidLength
            )))
        ));
    }

    #[test]
    fn timeout_expires_and_late_response_is_dropped() {
        let config = MasterConfig::default().with_response_timeout(Some(Duration::from_millis(100)));
        let (mut engine, peer) = engine(config);
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        assert_eq!(engine.poll(t0 + Duration::from_millis(50)).timed_out, 0);
        let report = engine.poll(t0 + Duration::from_millis(150));
        assert_eq!(report.timed_out, 1);
        assert!(matches!(completion.try_result().unwrap(), Err(ClientError::Timeout)));
        assert_eq!(engine.in_flight(), 0);

        peer.push(&READ_RESPONSE);
        assert_eq!(engine.poll(t0 + Duration::from_millis(200)).dropped, 1);
        assert_eq!(engine.state(), ConnectionState::Connected);
    }

    #[test]
    fn no_timeout_by_default() {
        let (mut engine, _peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);
        engine.poll(t0 + Duration::from_secs(3600));
        assert!(pending(&mut completion));
        assert_eq!(engine.in_flight(), 1);
    }

    #[test]
    fn per_request_timeout_overrides_config() {
        let (mut engine, _peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine
            .submit_with_timeout(1, read(1, 3), Some(Duration::from_millis(10)))
            .unwrap();
        engine.poll(t0);
        engine.poll(t0 + Duration::from_millis(10));
        assert!(matches!(completion.try_result().unwrap(), Err(ClientError::Timeout)));
    }

    #[test]
    fn peer_close_fails_pending_with_disconnected() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        peer.close();
        let report = engine.poll(t0);
        assert_eq!(report.state, ConnectionState::Disconnected);
        assert!(matches!(completion.try_result().unwrap(), Err(ClientError::Disconnected)));
    }

    #[test]
    fn response_delivered_just_before_close_still_resolves() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        peer.push(&READ_RESPONSE);
        peer.close();
        let report = engine.poll(t0);
        assert_eq!(report.resolved, 1);
        assert!(completion.try_result().unwrap().is_ok());
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn close_fails_in_flight_and_queued() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut sent = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);
        let mut waiting = engine.submit(1, read(10, 1)).unwrap();
        engine.poll(t0);
        assert_eq!(engine.queued(), 1);

        engine.close();
        assert!(matches!(sent.try_result().unwrap(), Err(ClientError::Disconnected)));
        assert!(matches!(waiting.try_result().unwrap(), Err(ClientError::Disconnected)));
        assert!(!peer.master_connected());
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn short_write_fails_request_and_faults() {
        let (mut engine, peer) = engine(MasterConfig::default());
        peer.limit_writes(Some(5));
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        let report = engine.poll(t0);
        assert_eq!(report.frames_sent, 0);
        assert_eq!(report.state, ConnectionState::Faulted);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Transport(TransportError::ShortWrite {
                expected: 12,
                written: 5
            }))
        ));
    }

    #[test]
    fn invalid_arguments_never_reach_the_wire() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let oversized = RegisterRequest::ReadHoldingRegisters {
            start_address: 0,
            quantity: 126,
        };
        assert!(matches!(
            engine.submit(1, oversized),
            Err(ClientError::InvalidArgument(_))
        ));
        let empty = RegisterRequest::WriteMultipleRegisters {
            start_address: 0,
            values: Vec::new(),
        };
        assert!(matches!(engine.submit(1, empty), Err(ClientError::InvalidArgument(_))));

        engine.poll(Instant::now());
        assert!(peer.take_sent().is_empty());
    }

    #[test]
    fn detached_engine_rejects_submissions() {
        let mut engine: Engine<MemoryTransport> = Engine::detached(MasterConfig::default());
        assert!(matches!(
            engine.submit(1, read(0, 1)),
            Err(ClientError::NotConnected(ConnectionState::Disconnected))
        ));

        let (transport, _peer) = MemoryTransport::pair();
        engine.attach(transport);
        assert!(engine.submit(1, read(0, 1)).is_ok());
    }

    #[test]
    fn requests_queue_behind_the_in_flight_limit() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut first = engine.submit(1, read(1, 3)).unwrap();
        let mut second = engine.submit(1, read(7, 1)).unwrap();

        engine.poll(t0);
        assert_eq!(peer.take_sent(), READ_REQUEST);
        assert_eq!(engine.in_flight(), 1);
        assert_eq!(engine.queued(), 1);

        peer.push(&READ_RESPONSE);
        let report = engine.poll(t0);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.frames_sent, 1);
        assert!(first.try_result().unwrap().is_ok());
        assert!(pending(&mut second));
        assert_eq!(
            peer.take_sent(),
            [0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x07, 0x00, 0x01]
        );
    }

    #[test]
    fn pipelined_responses_match_by_transaction_id() {
        let config = MasterConfig::default().with_max_in_flight(2);
        let (mut engine, peer) = engine(config);
        let t0 = Instant::now();
        let mut first = engine.submit(1, read(1, 3)).unwrap();
        let mut second = engine.submit(1, read(7, 1)).unwrap();
        assert_eq!(engine.poll(t0).frames_sent, 2);
        peer.take_sent();

        let mut both = vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34];
        both.extend_from_slice(&READ_RESPONSE);
        peer.push(&both);
        assert_eq!(engine.poll(t0).resolved, 2);
        assert_eq!(
            second.try_result().unwrap().unwrap(),
            RegisterResponse::Registers(vec![0x1234])
        );
        assert_eq!(
            first.try_result().unwrap().unwrap(),
            RegisterResponse::Registers(vec![99, 150, 306])
        );
    }

    #[test]
    fn mismatched_unit_is_a_protocol_error_for_that_caller() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        let mut other_unit = READ_RESPONSE;
        other_unit[6] = 0x02;
        peer.push(&other_unit);
        engine.poll(t0);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Protocol(ProtocolError::UnitMismatch {
                expected: 1,
                got: 2
            }))
        ));
        assert_eq!(engine.state(), ConnectionState::Connected);
    }

    #[test]
    fn short_register_payload_is_a_count_mismatch() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 3)).unwrap();
        engine.poll(t0);

        peer.push(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x63]);
        engine.poll(t0);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Protocol(ProtocolError::CountMismatch {
                expected: 3,
                got: 1
            }))
        ));
    }

    #[test]
    fn wrong_write_echo_is_rejected() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let request = RegisterRequest::write_multiple_registers(1, &[10, 258]).unwrap();
        let mut completion = engine.submit(1, request).unwrap();
        engine.poll(t0);

        peer.push(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x02, 0x00, 0x02]);
        engine.poll(t0);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Protocol(ProtocolError::EchoMismatch { .. }))
        ));
    }

    #[test]
    fn response_for_another_function_is_rejected() {
        let (mut engine, peer) = engine(MasterConfig::default());
        let t0 = Instant::now();
        let mut completion = engine.submit(1, read(1, 2)).unwrap();
        engine.poll(t0);

        peer.push(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02]);
        engine.poll(t0);
        assert!(matches!(
            completion.try_result().unwrap(),
            Err(ClientError::Protocol(ProtocolError::UnexpectedFunction {
                expected: 0x03,
                got: 0x10
            }))
        ));
    }
}
