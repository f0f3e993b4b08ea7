use crate::{ClientError, ConnectionState, MasterConfig, ModbusMaster, WriteAck};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Debug, Error)]
pub enum SyncMasterError {
    #[error("runtime init error: {0}")]
    RuntimeInit(std::io::Error),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

/// Blocking wrapper around [`ModbusMaster`] that owns its own runtime.
pub struct SyncModbusTcpMaster {
    master: ModbusMaster,
    runtime: Runtime,
}

impl SyncModbusTcpMaster {
    pub fn connect(addr: &str) -> Result<Self, SyncMasterError> {
        Self::connect_with_config(addr, MasterConfig::default())
    }

    pub fn connect_with_config(addr: &str, config: MasterConfig) -> Result<Self, SyncMasterError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(SyncMasterError::RuntimeInit)?;
        let master = runtime.block_on(ModbusMaster::connect_tcp(addr, config))?;
        Ok(Self { master, runtime })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.master.connection_state()
    }

    pub fn set_response_timeout(&mut self, timeout: Option<Duration>) {
        self.master = self.master.with_response_timeout(timeout);
    }

    pub fn read_holding_registers(
        &self,
        unit_id: u8,
        start: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, SyncMasterError> {
        self.runtime
            .block_on(self.master.read_holding_registers(unit_id, start, quantity))
            .map_err(SyncMasterError::Client)
    }

    pub fn write_multiple_registers(
        &self,
        unit_id: u8,
        start: u16,
        values: &[u16],
    ) -> Result<WriteAck, SyncMasterError> {
        self.runtime
            .block_on(self.master.write_multiple_registers(unit_id, start, values))
            .map_err(SyncMasterError::Client)
    }

    pub fn reconnect(&self) -> Result<(), SyncMasterError> {
        self.runtime
            .block_on(self.master.reconnect())
            .map_err(SyncMasterError::Client)
    }

    pub fn close(&self) {
        self.runtime.block_on(self.master.close());
    }
}
