//! sqlcluster database API.

use crate::http::{self, JoinRequest};
use crate::join::{self, JOIN_RETRY_INTERVAL};
use crate::raft_log::RaftLog;
use crate::replica::RaftConfig;
use crate::rpc::proto::rpc_server::RpcServer;
use crate::rpc::{RpcService, RpcTransport};
use crate::sql::Sql;
use crate::state_machine::SqlStateMachine;
use crate::transport::Listener;
use crate::{StoreError, StoreServer};
use anyhow::Result;
use derivative::Derivative;
use futures_util::FutureExt;
use log::info;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Server;

const NAME_FILE: &str = "name";
const LOG_DIR: &str = "raft";
const DB_FILE: &str = "storage.sql";

/// sqlcluster node configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Data directory holding the node name, the log and the database.
    pub path: PathBuf,
    /// Peer RPC listen address: `host:port`, `:port` or a socket path.
    pub listen: String,
    /// HTTP listen address: `host:port` or `:port`.
    pub http_listen: String,
    /// HTTP address of a cluster member to join through. Without it a node
    /// with an empty log bootstraps a new cluster.
    pub join: Option<String>,
    /// Consensus timings.
    pub raft: RaftConfig,
    /// Pause between join attempts.
    pub join_retry_interval: Duration,
}

impl Config {
    /// Creates a configuration with default timings that does not join.
    pub fn new<P: Into<PathBuf>>(path: P, listen: &str, http_listen: &str) -> Self {
        Config {
            path: path.into(),
            listen: listen.to_string(),
            http_listen: http_listen.to_string(),
            join: None,
            raft: RaftConfig::default(),
            join_retry_interval: JOIN_RETRY_INTERVAL,
        }
    }
}

/// sqlcluster database API.
#[derive(Debug)]
pub struct Database {
    /// Configuration of this sqlcluster node.
    config: Config,
}

impl Database {
    /// Creates a new `Database` object.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs the node until it halts.
    pub async fn run(&self) -> Result<()> {
        let node = Node::start(&self.config).await?;
        node.wait().await
    }
}

/// A running node: consensus loop, peer RPC server and HTTP front.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Node {
    server: Arc<StoreServer<RpcTransport>>,
    http_addr: SocketAddr,
    #[derivative(Debug = "ignore")]
    replica: JoinHandle<Result<(), StoreError>>,
    #[derivative(Debug = "ignore")]
    rpc: JoinHandle<Result<(), tonic::transport::Error>>,
    #[derivative(Debug = "ignore")]
    http: JoinHandle<io::Result<()>>,
    #[derivative(Debug = "ignore")]
    join: Option<JoinHandle<()>>,
    #[derivative(Debug = "ignore")]
    rpc_shutdown: Option<oneshot::Sender<()>>,
    #[derivative(Debug = "ignore")]
    http_shutdown: Option<oneshot::Sender<()>>,
}

impl Node {
    /// Starts a node as described by `config`.
    ///
    /// A node with an empty log and no join target bootstraps a single-node
    /// cluster before this returns. A node with a join target keeps asking
    /// to be admitted in the background. Joining with a non-empty log is
    /// refused before anything is started.
    pub async fn start(config: &Config) -> Result<Node> {
        std::fs::create_dir_all(&config.path)?;
        let name = node_name(&config.path)?;
        let log = RaftLog::open(config.path.join(LOG_DIR))?;
        if config.join.is_some() && !log.is_empty() {
            return Err(StoreError::JoinWithExistingLog.into());
        }
        let bootstrap = config.join.is_none() && log.is_empty();

        let listener = Listener::bind(&config.listen).await?;
        let connection_string = listener.connection_string()?;
        let http_listener = TcpListener::bind(http_bind_addr(&config.http_listen)).await?;
        let http_addr = http_listener.local_addr()?;

        let sql = Sql::open(config.path.join(DB_FILE))?;
        let server = StoreServer::start(
            name.clone(),
            connection_string.clone(),
            log,
            Box::new(SqlStateMachine::new(sql)),
            RpcTransport::new(),
            config.raft.clone(),
        )?;
        let server = Arc::new(server);
        info!(
            "{} listening for peers at {} and clients at http://{}",
            name, connection_string, http_addr
        );

        let replica = {
            let server = server.clone();
            tokio::task::spawn_blocking(move || server.run())
        };
        let (rpc_shutdown, rpc_rx) = oneshot::channel::<()>();
        let rpc = {
            let service = RpcService::new(server.clone());
            tokio::task::spawn(async move {
                Server::builder()
                    .add_service(RpcServer::new(service))
                    .serve_with_incoming_shutdown(listener.incoming(), rpc_rx.map(drop))
                    .await
            })
        };
        let (http_shutdown, http_rx) = oneshot::channel::<()>();
        let http = {
            let app = http::router(server.clone());
            tokio::task::spawn(async move {
                axum::serve(http_listener, app)
                    .with_graceful_shutdown(http_rx.map(drop))
                    .await
            })
        };

        let mut node = Node {
            server: server.clone(),
            http_addr,
            replica,
            rpc,
            http,
            join: None,
            rpc_shutdown: Some(rpc_shutdown),
            http_shutdown: Some(http_shutdown),
        };
        match &config.join {
            Some(target) => {
                let target = target.clone();
                let request = JoinRequest {
                    name: name.clone(),
                    connection_string,
                };
                let retry_interval = config.join_retry_interval;
                node.join = Some(tokio::task::spawn(async move {
                    join::join_cluster(&target, &request, retry_interval).await
                }));
            }
            None if bootstrap => {
                if let Err(e) = server.join(name.clone(), connection_string).await {
                    node.shutdown().await?;
                    return Err(e.into());
                }
                info!("{} bootstrapped a new cluster", name);
            }
            None => info!("{} recovered from log", name),
        }
        Ok(node)
    }

    /// The node's consensus server.
    pub fn server(&self) -> &Arc<StoreServer<RpcTransport>> {
        &self.server
    }

    /// Stable name of the node.
    pub fn name(&self) -> &str {
        self.server.name()
    }

    /// Connection string peers reach the node at.
    pub fn connection_string(&self) -> &str {
        self.server.connection_string()
    }

    /// Address the HTTP front listens on.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Waits until the consensus loop stops, then stops the servers.
    pub async fn wait(mut self) -> Result<()> {
        let replica = (&mut self.replica).await;
        self.stop_servers();
        let rpc = self.rpc.await;
        let http = self.http.await;
        replica??;
        rpc??;
        http??;
        Ok(())
    }

    /// Halts the node and waits for everything to stop.
    pub async fn shutdown(self) -> Result<()> {
        self.server.halt();
        self.wait().await
    }

    fn stop_servers(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
        if let Some(tx) = self.rpc_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.http_shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Reads the node name from `path`, generating and persisting one on first
/// start.
fn node_name(path: &Path) -> Result<String> {
    let file = path.join(NAME_FILE);
    match std::fs::read_to_string(&file) {
        Ok(name) if !name.trim().is_empty() => return Ok(name.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let name = format!("{:07x}", rand::thread_rng().gen_range(0..0x1000_0000u32));
    std::fs::write(&file, format!("{}\n", name))?;
    Ok(name)
}

fn http_bind_addr(http_listen: &str) -> String {
    match http_listen.strip_prefix(':') {
        Some(port) => format!("127.0.0.1:{}", port),
        None => http_listen.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let name = node_name(dir.path()).unwrap();
        assert_eq!(name.len(), 7);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(node_name(dir.path()).unwrap(), name);
    }

    #[test]
    fn http_port_only_binds_loopback() {
        assert_eq!(http_bind_addr(":4001"), "127.0.0.1:4001");
        assert_eq!(http_bind_addr("0.0.0.0:4001"), "0.0.0.0:4001");
    }
}
