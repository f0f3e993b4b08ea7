//! Drives an [`Engine`] by hand instead of through `ModbusMaster`.
//!
//! Usage: `cargo run --example poll_loop -- 127.0.0.1:502`

use modmaster_client::{Engine, MasterConfig, RegisterRequest, RegisterResponse};
use modmaster_transport::{Connector, TcpConnector};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:502".to_string());
    let transport = TcpConnector::new(addr).connect().await?;
    let config = MasterConfig::default().with_response_timeout(Some(Duration::from_secs(2)));
    let mut engine = Engine::new(transport, config);

    let mut read = engine.submit(1, RegisterRequest::read_holding_registers(0, 4)?)?;
    let mut write = engine.submit(1, RegisterRequest::write_multiple_registers(10, &[1, 2])?)?;

    let (mut read_done, mut write_done) = (false, false);
    while !(read_done && write_done) {
        engine.poll(Instant::now());
        if !read_done {
            if let Some(outcome) = read.try_result() {
                match outcome {
                    Ok(RegisterResponse::Registers(values)) => println!("registers 0..4: {values:?}"),
                    Ok(other) => println!("unexpected reply: {other:?}"),
                    Err(err) => println!("read failed: {err}"),
                }
                read_done = true;
            }
        }
        if !write_done {
            if let Some(outcome) = write.try_result() {
                match outcome {
                    Ok(reply) => println!("write acknowledged: {reply:?}"),
                    Err(err) => println!("write failed: {err}"),
                }
                write_done = true;
            }
        }
        sleep(config.poll_interval).await;
    }

    engine.close();
    Ok(())
}
