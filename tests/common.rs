use sqlcluster::{Config, Node};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub struct TestNode {
    pub node: Node,
    pub config: Config,
}

impl TestNode {
    pub async fn start(config: Config) -> Self {
        let node = Node::start(&config).await.unwrap();
        Self { node, config }
    }

    pub async fn halt(self) -> Config {
        self.node.shutdown().await.unwrap();
        self.config
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn is_leader(&self) -> bool {
        self.node.server().is_leader()
    }
}

pub struct TestCluster {
    pub dir: TempDir,
    pub nodes: Vec<TestNode>,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.node.server().halt();
        }
        // Event loops must stop writing before `dir` is removed.
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.nodes.iter().any(|n| !n.node.server().is_halted()) {
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Peer RPC listen address for node `id` under `dir`.
pub fn listen_addr(dir: &Path, id: usize, unix: bool) -> String {
    if unix {
        dir.join(format!("node{}.sock", id)).to_string_lossy().to_string()
    } else {
        "127.0.0.1:0".to_string()
    }
}

pub fn node_config(dir: &Path, id: usize, unix: bool) -> Config {
    Config::new(
        dir.join(format!("node{}", id)),
        &listen_addr(dir, id, unix),
        "127.0.0.1:0",
    )
}

/// Starts `nr` nodes: the first bootstraps, the others join through it.
/// Returns once every node sees every other node as a peer.
pub async fn make_cluster(nr: usize, unix: bool) -> TestCluster {
    let _ = pretty_env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = Vec::new();
    let first = TestNode::start(node_config(dir.path(), 1, unix)).await;
    let target = first.node.http_addr().to_string();
    nodes.push(first);
    for id in 2..=nr {
        let mut config = node_config(dir.path(), id, unix);
        config.join = Some(target.clone());
        nodes.push(TestNode::start(config).await);
    }
    let cluster = TestCluster { dir, nodes };
    wait_until("cluster membership", || {
        cluster
            .nodes
            .iter()
            .all(|n| n.node.server().peers().len() == nr - 1 && n.node.server().leader().is_some())
    })
    .await;
    cluster
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Posts `stmt` to the node's `/sql` endpoint and returns status and body.
pub async fn execute_query(node: &TestNode, stmt: &str) -> (u16, String) {
    let url = format!("http://{}/sql", node.node.http_addr());
    let response = reqwest::Client::new()
        .post(url)
        .body(stmt.to_string())
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

/// Waits until every node has applied everything the leader has committed.
pub async fn wait_for_convergence(cluster: &TestCluster) {
    let leader = cluster.nodes.iter().find(|n| n.is_leader()).unwrap();
    let commit_index = leader.node.server().commit_index();
    wait_until("replicas to apply the log", || {
        cluster
            .nodes
            .iter()
            .all(|n| n.node.server().last_applied() >= commit_index)
    })
    .await;
}

pub fn table_exists(node: &TestNode, table: &str) -> bool {
    let conn = sqlite::open(node.config.path.join("storage.sql")).unwrap();
    let mut found = false;
    conn.iterate(
        format!(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '{}'",
            table
        ),
        |_| {
            found = true;
            true
        },
    )
    .unwrap();
    found
}
