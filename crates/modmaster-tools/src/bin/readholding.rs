use clap::Parser;
use modmaster_tools::common::{build_master, init_tracing, TcpConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "readholding", about = "Read holding registers (FC03)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long, default_value_t = 1)]
    unit_id: u8,
    #[arg(long)]
    start: u16,
    #[arg(long, default_value_t = 1)]
    quantity: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let master = build_master(&args.conn).await?;

    let values = master
        .read_holding_registers(args.unit_id, args.start, args.quantity)
        .await?;

    for (offset, value) in (0u16..).zip(values.iter()) {
        let address = args.start.wrapping_add(offset);
        println!("addr={address} value={value} (0x{value:04X})");
    }
    master.close().await;
    Ok(())
}
