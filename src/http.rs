//! HTTP front of a node.
//!
//! | Method | Path    | Body                          | Reply                         |
//! |--------|---------|-------------------------------|-------------------------------|
//! | `POST` | `/sql`  | raw query text                | `SequenceNumber: N\n<rows>`   |
//! | `POST` | `/join` | `{"name", "connectionString"}`| empty                         |

use crate::errors::StoreError;
use crate::rpc::RpcTransport;
use crate::StoreServer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Server state shared across handlers.
pub type AppState = Arc<StoreServer<RpcTransport>>;

/// Body of a join request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Name of the joining node.
    pub name: String,
    /// Connection string the cluster reaches the joining node at.
    #[serde(rename = "connectionString")]
    pub connection_string: String,
}

/// Creates the router serving `/sql` and `/join`.
pub fn router(server: AppState) -> Router {
    Router::new()
        .route("/sql", post(sql))
        .route("/join", post(join))
        .with_state(server)
}

async fn sql(State(server): State<AppState>, body: Bytes) -> Response {
    let query = match String::from_utf8(body.to_vec()) {
        Ok(query) => query,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Couldn't read body: {}", e)).into_response()
        }
    };
    debug!("[{}] received query: {:?}", server.name(), query);
    match server.query(&query).await {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            debug!("[{}] query failed: {}", server.name(), e);
            (query_status(&e), e.to_string()).into_response()
        }
    }
}

/// Client mistakes are 400s, cluster trouble the client may retry through
/// is 503, everything else 500.
fn query_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::Execution(_) => StatusCode::BAD_REQUEST,
        err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn join(State(server): State<AppState>, body: Bytes) -> Response {
    let request: JoinRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("[{}] undecodable join request: {}", server.name(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    match server
        .join(request.name.clone(), request.connection_string)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!("[{}] could not admit {}: {}", server.name(), request.name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_request_uses_camel_case_connection_string() {
        let request: JoinRequest =
            serde_json::from_str(r#"{"name":"a1b2c3d","connectionString":"unix:///tmp/n.sock"}"#)
                .unwrap();
        assert_eq!(request.name, "a1b2c3d");
        assert_eq!(request.connection_string, "unix:///tmp/n.sock");
        let encoded = serde_json::to_value(&request).unwrap();
        assert!(encoded.get("connectionString").is_some());
    }

    #[test]
    fn query_failures_map_to_status_codes() {
        assert_eq!(
            query_status(&StoreError::Execution("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            query_status(&StoreError::NotLeader),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            query_status(&StoreError::Unavailable("gone".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            query_status(&StoreError::ProtocolViolation("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
