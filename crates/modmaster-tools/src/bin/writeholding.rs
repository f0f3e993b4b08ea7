use clap::Parser;
use modmaster_tools::common::{build_master, init_tracing, parse_register, TcpConnectionArgs};

#[derive(Debug, Parser)]
#[command(
    name = "writeholding",
    about = "Write one or more holding registers (FC16)"
)]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long, default_value_t = 1)]
    unit_id: u8,
    #[arg(long)]
    start: u16,
    #[arg(long, value_delimiter = ',', num_args = 1.., value_parser = parse_register)]
    values: Vec<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let master = build_master(&args.conn).await?;

    let ack = master
        .write_multiple_registers(args.unit_id, args.start, &args.values)
        .await?;

    println!(
        "wrote {} register(s) starting at {}",
        ack.quantity, ack.start_address
    );
    master.close().await;
    Ok(())
}
