use {
    clap::Parser,
    log::{debug, info},
    nfsrpc::{
        Registry, RpcTransport, Target, TransportConfig, io_err, res,
        rpc::{CallHeader, ReplyHeader, XidGenerator},
        utils::parse_proto,
        xdr::XdrReader,
    },
    std::time::{Duration, Instant},
};

#[derive(Parser, Debug)]
#[command(about = "Ping an ONC RPC program over TCP")]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp
    #[arg(required = true)]
    address: String,

    /// RPC program number, e.g. 100003 for NFS
    #[arg(long)]
    program: u32,

    /// Program version
    #[arg(long)]
    version: u32,

    /// Procedure to call; 0 is NULL for every program
    #[arg(long, default_value_t = 0)]
    procedure: u32,

    /// Bind a reserved local port (1..=1023) before connecting
    #[arg(long)]
    privileged: bool,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Number of calls to make
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Seconds to wait for the connection
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Largest fragment body to send, in bytes
    #[arg(long)]
    max_fragment: Option<usize>,
}

impl Cli {
    fn config(&self) -> TransportConfig {
        let mut config = TransportConfig::default()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout));
        if let Some(size) = self.max_fragment {
            config = config.with_max_fragment_size(size);
        }
        config
    }
}

async fn ping(
    transport: &dyn RpcTransport,
    target: &Target,
    header: CallHeader,
    timeout: Duration,
) -> nfsrpc::Result<Duration> {
    let started = Instant::now();
    let reply = transport
        .call_target(target, header.encode(), timeout)
        .await?;
    let rtt = started.elapsed();

    let reply = ReplyHeader::decode(&mut XdrReader::new(reply))?.into_result()?;
    debug!("reply {:?}", reply);
    Ok(rtt)
}

async fn rpcping_main(cli: Cli) -> nfsrpc::Result<i32> {
    let (proto, host, port) = match parse_proto(&cli.address) {
        Some(parsed) => parsed,
        None => return res!(io_err!(InvalidInput, format!("invalid address: {}", cli.address))),
    };
    if proto != "tcp" {
        return res!(io_err!(InvalidInput, format!("unsupported protocol: {}", proto)));
    }

    let registry = Registry::new(cli.config());
    info!("transport config: {:?}", registry.config());

    let target = Target::new(host, port, cli.privileged);
    let timeout = Duration::from_secs(cli.timeout);
    let xids = XidGenerator::new();
    let mut failures = 0;

    println!(
        "[*] Calling program {} version {} procedure {} on {}",
        cli.program, cli.version, cli.procedure, target
    );
    for seq in 0..cli.count {
        let xid = xids.next_xid();
        let header = CallHeader::new(xid, cli.program, cli.version, cli.procedure);
        match ping(&registry, &target, header, timeout).await {
            Ok(rtt) => println!("[*] seq={} xid={:#010x} time={:?}", seq, xid, rtt),
            Err(e) => {
                failures += 1;
                println!("[!] seq={} xid={:#010x} {}", seq, xid, e);
            }
        }
    }

    if let Some(port) = registry
        .connection(&target)
        .and_then(|conn| conn.local_port())
    {
        debug!("last connection used local port {}", port);
    }
    registry.shutdown_all();

    println!(
        "[*] {} calls, {} replies, {} failed",
        cli.count,
        cli.count - failures,
        failures
    );
    Ok(if failures == 0 { 0 } else { 1 })
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = rpcping_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
