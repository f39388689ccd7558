//! sqlcluster RPC module.

use crate::command::Command;
use crate::errors::StoreError;
use crate::message::Message;
use crate::raft_log::LogEntry;
use crate::rpc::proto::rpc_server::Rpc;
use crate::transport;
use crate::{StoreServer, StoreTransport};
use async_mutex::Mutex;
use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use log::{error, warn};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status};

#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("proto");
}

use proto::rpc_client::RpcClient;
use proto::{
    AppendEntriesRequest, AppendEntriesResponse, Query, QueryResults, VoteRequest, VoteResponse,
};

/// How long a consensus request, connecting included, may take before the
/// peer counts as unreachable. Forwarded queries wait for their commit
/// instead.
const RAFT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ConnectionPool {
    connections: ArrayQueue<RpcClient<Channel>>,
}

struct Connection {
    conn: RpcClient<Channel>,
    pool: Arc<ConnectionPool>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.pool.replenish(self.conn.clone())
    }
}

impl ConnectionPool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: ArrayQueue::new(16),
        })
    }

    async fn connection(&self, connection_string: &str) -> Result<RpcClient<Channel>, StoreError> {
        match self.connections.pop() {
            Some(x) => Ok(x),
            None => Ok(RpcClient::new(transport::connect(connection_string).await?)),
        }
    }

    fn replenish(&self, conn: RpcClient<Channel>) {
        let _ = self.connections.push(conn);
    }
}

#[derive(Debug, Clone)]
struct Connections(Arc<Mutex<HashMap<String, Arc<ConnectionPool>>>>);

impl Connections {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(HashMap::new())))
    }

    async fn connection(&self, connection_string: &str) -> Result<Connection, StoreError> {
        let pool = {
            let mut conns = self.0.lock().await;
            conns
                .entry(connection_string.to_string())
                .or_insert_with(ConnectionPool::new)
                .clone()
        };
        Ok(Connection {
            conn: pool.connection(connection_string).await?,
            pool,
        })
    }

    async fn invalidate(&self, connection_string: &str) {
        let mut conns = self.0.lock().await;
        conns.remove(connection_string);
    }
}

/// RPC transport.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    connections: Connections,
}

impl RpcTransport {
    /// Creates a new RPC transport.
    pub fn new() -> Self {
        RpcTransport {
            connections: Connections::new(),
        }
    }

    async fn call(&self, client: &mut RpcClient<Channel>, msg: Message) -> Result<Message, Status> {
        match msg {
            Message::AppendEntryRequest {
                from,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => {
                let request = AppendEntriesRequest {
                    from,
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries: entries.iter().map(proto::LogEntry::from).collect(),
                    commit_index,
                };
                let response = client.append_entries(Request::new(request)).await?;
                Ok(Message::from(response.into_inner()))
            }
            Message::VoteRequest {
                from,
                term,
                last_log_index,
                last_log_term,
            } => {
                let request = VoteRequest {
                    from,
                    term,
                    last_log_index,
                    last_log_term,
                };
                let response = client.vote(Request::new(request)).await?;
                Ok(Message::from(response.into_inner()))
            }
            other => Err(Status::invalid_argument(format!(
                "{:?} is not a request",
                other
            ))),
        }
    }
}

impl Default for RpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreTransport for RpcTransport {
    async fn send(&self, to: &str, msg: Message) -> Result<Message, StoreError> {
        let exchange = async {
            let mut client = self.connections.connection(to).await?;
            self.call(&mut client.conn, msg).await.map_err(from_status)
        };
        match tokio::time::timeout(RAFT_RPC_TIMEOUT, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.connections.invalidate(to).await;
                Err(e)
            }
            Err(_) => {
                self.connections.invalidate(to).await;
                Err(StoreError::Unavailable(format!("request to {} timed out", to)))
            }
        }
    }

    async fn delegate(&self, to: &str, sql: String) -> Result<Vec<u8>, StoreError> {
        let mut client = self.connections.connection(to).await?;
        let query = Request::new(Query { sql });
        match client.conn.execute(query).await {
            Ok(response) => Ok(response.into_inner().output),
            Err(status) => {
                if status.code() != Code::FailedPrecondition {
                    self.connections.invalidate(to).await;
                }
                Err(from_status(status))
            }
        }
    }
}

impl From<AppendEntriesResponse> for Message {
    fn from(response: AppendEntriesResponse) -> Self {
        Message::AppendEntryResponse {
            from: response.from,
            term: response.term,
            success: response.success,
            last_index: response.last_index,
            mismatch_index: Some(response.mismatch_index).filter(|&index| index > 0),
        }
    }
}

impl From<VoteResponse> for Message {
    fn from(response: VoteResponse) -> Self {
        Message::VoteResponse {
            from: response.from,
            term: response.term,
            vote_granted: response.vote_granted,
        }
    }
}

/// Maps a failed call back to the error the remote node reported.
fn from_status(status: Status) -> StoreError {
    match status.code() {
        Code::FailedPrecondition => StoreError::Execution(status.message().to_string()),
        _ => StoreError::Unavailable(status.message().to_string()),
    }
}

fn to_status(err: StoreError) -> Status {
    match err {
        StoreError::Execution(message) => Status::failed_precondition(message),
        err if err.is_transient() => Status::unavailable(err.to_string()),
        err => Status::internal(err.to_string()),
    }
}

/// RPC service.
#[derive(Debug)]
pub struct RpcService {
    /// The sqlcluster server access via this RPC service.
    pub server: Arc<StoreServer<RpcTransport>>,
}

impl RpcService {
    /// Creates a new RPC service.
    pub fn new(server: Arc<StoreServer<RpcTransport>>) -> Self {
        Self { server }
    }
}

#[tonic::async_trait]
impl Rpc for RpcService {
    async fn execute(&self, request: Request<Query>) -> Result<Response<QueryResults>, Status> {
        let sql = request.into_inner().sql;
        let output = self
            .server
            .submit(Command::Query { sql })
            .await
            .map_err(to_status)?;
        Ok(Response::new(QueryResults { output }))
    }

    async fn vote(&self, request: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let msg = request.into_inner();
        let msg = Message::VoteRequest {
            from: msg.from,
            term: msg.term,
            last_log_index: msg.last_log_index,
            last_log_term: msg.last_log_term,
        };
        match self.server.recv_msg(msg).await.map_err(to_status)? {
            Message::VoteResponse {
                from,
                term,
                vote_granted,
            } => Ok(Response::new(VoteResponse {
                from,
                term,
                vote_granted,
            })),
            other => Err(Status::internal(format!("unexpected reply {:?}", other))),
        }
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let msg = request.into_inner();
        let entries = match msg
            .entries
            .into_iter()
            .map(LogEntry::try_from)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(entries) => entries,
            Err(e) => {
                error!("undecodable entries from {}: {}", msg.from, e);
                let status = Status::invalid_argument(e.to_string());
                self.server.abort(StoreError::ProtocolViolation(format!(
                    "undecodable entries from {}: {}",
                    msg.from, e
                )));
                return Err(status);
            }
        };
        let msg = Message::AppendEntryRequest {
            from: msg.from,
            term: msg.term,
            prev_log_index: msg.prev_log_index,
            prev_log_term: msg.prev_log_term,
            entries,
            commit_index: msg.commit_index,
        };
        match self.server.recv_msg(msg).await.map_err(to_status)? {
            Message::AppendEntryResponse {
                from,
                term,
                success,
                last_index,
                mismatch_index,
            } => Ok(Response::new(AppendEntriesResponse {
                from,
                term,
                success,
                last_index,
                mismatch_index: mismatch_index.unwrap_or(0),
            })),
            other => {
                warn!("unexpected reply to append entries: {:?}", other);
                Err(Status::internal("unexpected reply"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_errors_survive_the_wire() {
        let message = "Error executing \"SELEC 1\" (near \"SELEC\": syntax error)";
        let status = to_status(StoreError::Execution(message.to_string()));
        assert_eq!(status.code(), Code::FailedPrecondition);
        match from_status(status) {
            StoreError::Execution(m) => assert_eq!(m, message),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn not_leader_is_reported_as_unavailable() {
        let status = to_status(StoreError::NotLeader);
        assert_eq!(status.code(), Code::Unavailable);
        assert!(from_status(status).is_transient());
        let status = to_status(StoreError::JoinWithExistingLog);
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn vote_response_becomes_a_message() {
        let msg = Message::from(VoteResponse {
            from: "n3".to_string(),
            term: 4,
            vote_granted: true,
        });
        assert_eq!(msg.sender(), "n3");
        assert_eq!(msg.term(), 4);
        assert!(matches!(
            msg,
            Message::VoteResponse {
                vote_granted: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unresponsive_peer_fails_within_the_rpc_timeout() {
        // Connections land in the backlog but are never served.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = transport::encode(&listener.local_addr().unwrap().to_string()).unwrap();
        let transport = RpcTransport::new();
        let request = Message::VoteRequest {
            from: "n1".to_string(),
            term: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = tokio::time::timeout(
            RAFT_RPC_TIMEOUT + Duration::from_secs(2),
            transport.send(&to, request),
        )
        .await
        .expect("send outlived the rpc timeout");
        assert!(result.unwrap_err().is_transient());
        drop(listener);
    }

    #[test]
    fn zero_mismatch_index_means_none() {
        let response = AppendEntriesResponse {
            from: "n2".to_string(),
            term: 3,
            success: true,
            last_index: 7,
            mismatch_index: 0,
        };
        match Message::from(response) {
            Message::AppendEntryResponse { mismatch_index, .. } => {
                assert_eq!(mismatch_index, None)
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
