mod common;

use common::*;
use sqlcluster::StoreError;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_write_on_follower_reaches_every_node() {
    let cluster = make_cluster(3, false).await;
    assert!(cluster.nodes[0].is_leader());
    assert!(!cluster.nodes[2].is_leader());

    let (status, body) = execute_query(&cluster.nodes[2], "CREATE TABLE t (x)").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 1\n");

    wait_for_convergence(&cluster).await;
    for node in &cluster.nodes {
        assert!(table_exists(node, "t"), "table missing on {}", node.name());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarded_reply_matches_leader_reply() {
    let cluster = make_cluster(3, false).await;
    execute_query(&cluster.nodes[0], "CREATE TABLE t (x, y)").await;
    let (status, _) =
        execute_query(&cluster.nodes[1], "INSERT INTO t VALUES (1, 'one'), (2, NULL)").await;
    assert_eq!(status, 200);

    let (status, body) = execute_query(&cluster.nodes[2], "SELECT x, y FROM t ORDER BY x").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 3\n1|one\n2|\n");

    let (status, body) = execute_query(&cluster.nodes[0], "SELECT count(*) FROM t").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 4\n2\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_statement_is_a_client_error() {
    let cluster = make_cluster(2, false).await;
    let (status, body) = execute_query(&cluster.nodes[1], "SELECT * FROM missing").await;
    assert_eq!(status, 400);
    assert!(
        body.starts_with("Error executing \"SELECT * FROM missing\""),
        "unexpected body: {}",
        body
    );
    assert!(body.contains("SQLite error: Error: no such table: missing"));

    // The failure still took a sequence number.
    let (status, body) = execute_query(&cluster.nodes[0], "SELECT 1").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 2\n1\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_with_existing_log_is_refused() {
    let _ = pretty_env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path(), 1, false)).await;
    execute_query(&node, "CREATE TABLE t (x)").await;
    let mut config = node.halt().await;

    config.join = Some("127.0.0.1:1".to_string());
    let err = sqlcluster::Node::start(&config).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::JoinWithExistingLog)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover() {
    let mut cluster = make_cluster(3, false).await;
    execute_query(&cluster.nodes[0], "CREATE TABLE t (x)").await;
    execute_query(&cluster.nodes[1], "INSERT INTO t VALUES (1)").await;
    wait_for_convergence(&cluster).await;

    let old_leader = cluster.nodes.remove(0);
    let old_name = old_leader.name().to_string();
    old_leader.halt().await;

    wait_until("a new leader", || {
        cluster.nodes.iter().all(|n| {
            matches!(n.node.server().leader(), Some(leader) if leader != old_name)
        })
    })
    .await;

    let (status, body) = execute_query(&cluster.nodes[1], "INSERT INTO t VALUES (2)").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 3\n");
    let (_, body) = execute_query(&cluster.nodes[0], "SELECT x FROM t ORDER BY x").await;
    assert_eq!(body, "SequenceNumber: 4\n1\n2\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_rebuilds_database_from_log() {
    let _ = pretty_env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(node_config(dir.path(), 1, true)).await;
    let name = node.name().to_string();
    execute_query(&node, "CREATE TABLE t (x)").await;
    execute_query(&node, "INSERT INTO t VALUES (7)").await;
    let config = node.halt().await;

    let node = TestNode::start(config).await;
    assert_eq!(node.name(), name);
    let (status, body) = execute_query(&node, "SELECT x FROM t").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 3\n7\n");
    node.halt().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unix_socket_cluster() {
    let cluster = make_cluster(3, true).await;
    for node in &cluster.nodes {
        assert!(node.node.connection_string().starts_with("unix://"));
    }
    let (status, body) = execute_query(&cluster.nodes[1], "CREATE TABLE u (x)").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 1\n");
    wait_for_convergence(&cluster).await;
    for node in &cluster.nodes {
        assert!(table_exists(node, "u"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_retries_until_target_is_up() {
    let _ = pretty_env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let target = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let mut config = node_config(dir.path(), 2, false);
    config.join = Some(target.to_string());
    config.join_retry_interval = Duration::from_millis(50);
    let joiner = TestNode::start(config).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(joiner.node.server().peers().is_empty());
    assert!(joiner.node.server().leader().is_none());

    let mut config = node_config(dir.path(), 1, false);
    config.http_listen = target.to_string();
    let first = TestNode::start(config).await;
    let cluster = TestCluster {
        dir,
        nodes: vec![first, joiner],
    };
    wait_until("the joiner to be admitted", || {
        cluster
            .nodes
            .iter()
            .all(|n| n.node.server().peers().len() == 1 && n.node.server().leader().is_some())
    })
    .await;
    let (status, body) = execute_query(&cluster.nodes[1], "CREATE TABLE t (x)").await;
    assert_eq!(status, 200);
    assert_eq!(body, "SequenceNumber: 1\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forward_to_lost_leader_is_unavailable() {
    let _ = pretty_env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let leader = TestNode::start(node_config(dir.path(), 1, false)).await;
    let mut config = node_config(dir.path(), 2, false);
    config.join = Some(leader.node.http_addr().to_string());
    // Keep the follower from electing itself once the leader is gone.
    config.raft.min_election_timeout = Duration::from_secs(60);
    config.raft.max_election_timeout = Duration::from_secs(60);
    let follower = TestNode::start(config).await;
    let leader_name = leader.name().to_string();
    wait_until("the follower to join", || {
        follower.node.server().leader() == Some(leader_name.clone())
            && follower.node.server().peers().contains_key(&leader_name)
    })
    .await;

    leader.halt().await;
    let (status, body) = execute_query(&follower, "CREATE TABLE t (x)").await;
    assert_eq!(status, 503, "unexpected body: {}", body);
    follower.halt().await;
}
