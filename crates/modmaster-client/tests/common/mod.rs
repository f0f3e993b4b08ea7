//! A small Modbus TCP slave built straight on a tokio listener.

#![allow(dead_code)]

use modmaster_core::encoding::{Reader, Writer};
use modmaster_core::frame::tcp::{encode_frame, MbapHeader, MAX_ADU_LEN, MBAP_HEADER_LEN};
use modmaster_core::pdu::{
    DecodedRequest, ExceptionCode, ExceptionResponse, ReadHoldingRegistersResponse, Response,
    WriteMultipleRegistersResponse, MAX_PDU_LEN,
};
use modmaster_core::DecodeError;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Shared {
    registers: Mutex<Vec<u16>>,
    silent: AtomicBool,
    hang_up: AtomicBool,
    requests: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct SlaveHandle {
    shared: Arc<Shared>,
}

impl SlaveHandle {
    pub fn register(&self, address: u16) -> Option<u16> {
        self.shared.registers.lock().unwrap().get(usize::from(address)).copied()
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.shared.registers.lock().unwrap()[usize::from(address)] = value;
    }

    /// Swallow requests without answering.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Close the connection as soon as a request arrives.
    pub fn set_hang_up(&self, hang_up: bool) {
        self.shared.hang_up.store(hang_up, Ordering::SeqCst);
    }

    pub fn requests_seen(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }
}

pub struct TestSlave {
    pub addr: SocketAddr,
    pub handle: SlaveHandle,
    task: JoinHandle<()>,
}

impl TestSlave {
    pub async fn start(register_count: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            registers: Mutex::new(vec![0; register_count]),
            ..Shared::default()
        });
        let handle = SlaveHandle {
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, shared).await;
                });
            }
        });
        Self { addr, handle, task }
    }
}

impl Drop for TestSlave {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn invalid_data(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let header = MbapHeader::decode(&mut Reader::new(&header)).map_err(invalid_data)?;
        let mut pdu = vec![0u8; header.pdu_len()];
        stream.read_exact(&mut pdu).await?;
        shared.requests.fetch_add(1, Ordering::SeqCst);

        if shared.hang_up.load(Ordering::SeqCst) {
            return Ok(());
        }
        if shared.silent.load(Ordering::SeqCst) {
            continue;
        }

        let reply = answer(&pdu, &shared);
        let mut out = [0u8; MAX_ADU_LEN];
        let mut w = Writer::new(&mut out);
        encode_frame(&mut w, header.transaction_id, header.unit_id, &reply).map_err(invalid_data)?;
        stream.write_all(w.as_written()).await?;
    }
}

fn answer(pdu: &[u8], shared: &Shared) -> Vec<u8> {
    let function = pdu.first().copied().unwrap_or_default();
    let mut buf = [0u8; MAX_PDU_LEN];
    let mut w = Writer::new(&mut buf);

    let encoded = match DecodedRequest::decode(&mut Reader::new(pdu)) {
        Ok(DecodedRequest::ReadHoldingRegisters(request)) => {
            let registers = shared.registers.lock().unwrap();
            let start = usize::from(request.start_address);
            let end = start + usize::from(request.quantity);
            match registers.get(start..end) {
                Some(values) => {
                    let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
                    Response::ReadHoldingRegisters(ReadHoldingRegistersResponse { data: &data })
                        .encode(&mut w)
                }
                None => exception(function, ExceptionCode::IllegalDataAddress).encode(&mut w),
            }
        }
        Ok(DecodedRequest::WriteMultipleRegisters(request)) => {
            let mut registers = shared.registers.lock().unwrap();
            let start = usize::from(request.start_address);
            let end = start + request.quantity();
            match registers.get_mut(start..end) {
                Some(slots) => {
                    for (index, slot) in slots.iter_mut().enumerate() {
                        *slot = request.register(index).unwrap_or_default();
                    }
                    Response::WriteMultipleRegisters(WriteMultipleRegistersResponse {
                        start_address: request.start_address,
                        quantity: request.quantity() as u16,
                    })
                    .encode(&mut w)
                }
                None => exception(function, ExceptionCode::IllegalDataAddress).encode(&mut w),
            }
        }
        Err(DecodeError::InvalidFunctionCode(_)) => {
            exception(function, ExceptionCode::IllegalFunction).encode(&mut w)
        }
        Err(_) => exception(function, ExceptionCode::IllegalDataValue).encode(&mut w),
    };
    encoded.unwrap();
    w.as_written().to_vec()
}

fn exception(function: u8, code: ExceptionCode) -> ExceptionResponse {
    ExceptionResponse {
        function_code: function & 0x7F,
        exception_code: code,
    }
}
