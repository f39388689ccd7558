use anyhow::Result;
use sqlcluster::replica::RaftConfig;
use sqlcluster::{Config, Database};
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "sqlclusterd")]
struct Opt {
    /// Data directory of this node.
    #[structopt(parse(from_os_str))]
    path: PathBuf,
    /// Peer RPC listen address: host:port, :port or a Unix socket path.
    #[structopt(short, long, default_value = "127.0.0.1:4101")]
    listen: String,
    /// HTTP listen address.
    #[structopt(long, default_value = "127.0.0.1:4001")]
    http: String,
    /// HTTP address of a cluster member to join through.
    #[structopt(short, long)]
    join: Option<String>,
    /// Leader heartbeat interval in milliseconds.
    #[structopt(long, default_value = "50")]
    heartbeat_ms: u64,
    /// Lower bound of the election timeout in milliseconds.
    #[structopt(long, default_value = "150")]
    election_timeout_ms: u64,
    /// Pause between join attempts in milliseconds.
    #[structopt(long, default_value = "200")]
    join_retry_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();
    let mut config = Config::new(opt.path, &opt.listen, &opt.http);
    config.join = opt.join;
    config.raft = RaftConfig {
        heartbeat_interval: Duration::from_millis(opt.heartbeat_ms),
        min_election_timeout: Duration::from_millis(opt.election_timeout_ms),
        max_election_timeout: Duration::from_millis(opt.election_timeout_ms * 7 / 3),
        ..RaftConfig::default()
    };
    config.join_retry_interval = Duration::from_millis(opt.join_retry_ms);
    let db = Database::new(config);
    db.run().await?;
    Ok(())
}
