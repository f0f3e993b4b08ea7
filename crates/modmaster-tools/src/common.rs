use clap::Args;
use modmaster_client::{ClientError, MasterConfig, ModbusMaster};
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct TcpConnectionArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 502)]
    pub port: u16,
    /// Response timeout in milliseconds; 0 waits indefinitely.
    #[arg(long, default_value_t = 5000)]
    pub timeout: u64,
}

impl TcpConnectionArgs {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }
}

pub async fn build_master(args: &TcpConnectionArgs) -> Result<ModbusMaster, ClientError> {
    let config = MasterConfig::default().with_response_timeout(args.response_timeout());
    ModbusMaster::connect_tcp(args.addr(), config).await
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

/// Parses a register value written in decimal or as `0x`-prefixed hex.
pub fn parse_register(input: &str) -> Result<u16, String> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => input.parse::<u16>(),
    };
    parsed.map_err(|_| format!("invalid register value: {input}"))
}
