use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use walbak_proto::net::KeepAliveParams;
use walbak_server::dispatch::{serve, ServerConfig};
use walbak_server::storage::StorageNode;

#[derive(Parser)]
#[command(name = "walbak-storaged", version, about = "walbak storage daemon")]
struct Opt {
    /// Listen port
    #[arg(short, long, default_value_t = walbak_proto::DEFAULT_STORAGE_PORT)]
    port: u16,

    /// Base directory for volume metadata (full path)
    #[arg(short, long, default_value = "/var/walbak/storage")]
    base_dir: PathBuf,

    /// Archive daemon address
    #[arg(short, long)]
    archive: SocketAddr,

    /// Proxy daemon addresses, comma separated
    #[arg(long, value_delimiter = ',')]
    proxy: Vec<SocketAddr>,

    /// Node identifier
    #[arg(long, default_value = "storage0")]
    id: String,

    /// Socket timeout in seconds (ignored when keep-alive is on)
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Enable TCP keep-alive instead of socket timeouts
    #[arg(long)]
    keep_alive: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    if let Err(e) = run(opt) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&opt.base_dir)?;
    let keep_alive = KeepAliveParams {
        enabled: opt.keep_alive,
        ..Default::default()
    };
    keep_alive.verify()?;

    let listener = TcpListener::bind(("0.0.0.0", opt.port))?;
    let node = StorageNode::new(&opt.id, &opt.base_dir, opt.archive, opt.proxy);
    let config = ServerConfig {
        node_id: opt.id,
        keep_alive,
        socket_timeout: Duration::from_secs(opt.timeout),
    };
    serve(listener, node, config, StorageNode::handlers())?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
