//! HTTP Handlers
//!
//! `/sql` accepts raw SQL text. On the leader it runs the command layer's
//! write path; on any other node it proxies the request to the current
//! leader and relays the response byte-for-byte, so any node answers
//! queries correctly at the cost of one extra hop. `/join` admits new
//! members. The consensus transport is mounted under `/internal/raft/`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::consensus::transport::{
    AppendEntriesRequest, VoteRequest, APPEND_ENTRIES_PATH, REQUEST_VOTE_PATH,
};
use crate::consensus::{Member, NodeRole, RaftLog};
use crate::node::Node;

/// HTTP client for forwarding writes to the leader
static HTTP_CLIENT: std::sync::LazyLock<reqwest::Client> = std::sync::LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client")
});

/// Fixed body returned when a non-leader has no leader to forward to
const NO_LEADER_BODY: &str = "no leader yet";

/// Shared handler state
pub struct AppState {
    /// The node itself
    pub node: Arc<Node>,
    /// The bundled engine, for the internal transport routes
    pub raft: Arc<RaftLog>,
}

/// Build the node's router
pub fn router(node: Arc<Node>, raft: Arc<RaftLog>) -> Router {
    let state = Arc::new(AppState { node, raft });

    Router::new()
        .route("/sql", post(sql_handler))
        .route("/join", post(join_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route(APPEND_ENTRIES_PATH, post(append_entries_handler))
        .route(REQUEST_VOTE_PATH, post(request_vote_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Response Types ============

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node: String,
    pub role: String,
    pub leader: Option<String>,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub sequence_number: u64,
    pub members: Vec<Member>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node: String,
    pub role: String,
}

// ============ Handlers ============

async fn sql_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let role = state.node.consensus().role().await;

    if role != NodeRole::Leader {
        return forward_to_leader(&state, body).await;
    }

    match state.node.execute_query(body).await {
        Ok(response) => response.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// Relay a write to the current leader, byte-for-byte in both directions.
async fn forward_to_leader(state: &AppState, body: Bytes) -> Response {
    let leader = match state.node.consensus().leader_address().await {
        Some(leader) => leader,
        None => return (StatusCode::BAD_REQUEST, NO_LEADER_BODY).into_response(),
    };

    if leader == state.node.connection_string() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "routing error: not leader but leader lookup returned this node",
        )
            .into_response();
    }

    tracing::debug!("forwarding query to leader at {}", leader);

    let response = match HTTP_CLIENT
        .post(format!("{}/sql", leader))
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("leader unreachable when proxying query: {}", e);
            let err = crate::error::Error::LeaderUnreachable {
                address: leader,
                reason: e.to_string(),
            };
            return (StatusCode::BAD_GATEWAY, err.to_string()).into_response();
        }
    };

    // Relay the leader's response unchanged, failures included.
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match response.bytes().await {
        Ok(bytes) => (status, bytes).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            format!("Failed to read leader response: {}", e),
        )
            .into_response(),
    }
}

async fn join_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let member: Member = match serde_json::from_slice(&body) {
        Ok(member) => member,
        Err(e) => {
            tracing::warn!("invalid join request: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Invalid join request: {}", e),
            )
                .into_response();
        }
    };

    tracing::info!(
        "join request from {} at {}",
        member.name,
        member.connection_string
    );

    match state.node.consensus().add_member(member).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::warn!("join command failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let consensus = state.node.consensus();

    Json(StatusResponse {
        node: state.node.name().to_string(),
        role: consensus.role().await.to_string(),
        leader: consensus.leader_address().await,
        term: state.raft.term().await,
        commit_index: state.raft.commit_index().await,
        last_applied: state.raft.last_applied().await,
        sequence_number: state.node.machine().sequence_number().await,
        members: consensus.peers().await,
        started_at: state.node.started_at(),
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        node: state.node.name().to_string(),
        role: state.node.consensus().role().await.to_string(),
    })
}

async fn append_entries_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Response {
    match state.raft.handle_append_entries(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn request_vote_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VoteRequest>,
) -> Response {
    match state.raft.handle_request_vote(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::QueryMachine;
    use crate::consensus::{ConsensusLog, LogStore, RaftConfig};
    use crate::executor::SqliteExecutor;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_node(name: &str) -> (Router, Arc<Node>) {
        let machine = Arc::new(QueryMachine::new(SqliteExecutor::open_in_memory().unwrap()));
        let store = LogStore::open_in_memory().unwrap();
        let member = Member {
            name: name.to_string(),
            connection_string: format!("http://{}.test:4001", name),
        };
        let raft = RaftLog::new(
            member.clone(),
            store,
            Arc::clone(&machine) as Arc<dyn crate::consensus::StateMachine>,
            RaftConfig::default(),
        );
        let node = Node::new(
            member.name,
            member.connection_string,
            machine,
            Arc::clone(&raft) as Arc<dyn ConsensusLog>,
        );
        (router(Arc::clone(&node), raft), node)
    }

    async fn post(router: &Router, uri: &str, body: &[u8]) -> (StatusCode, Bytes) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::from(body.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes)
    }

    #[tokio::test]
    async fn test_sql_without_leader_is_rejected() {
        let (router, _node) = test_node("n1");

        let (status, body) = post(&router, "/sql", b"SELECT 1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(&body[..], NO_LEADER_BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_leader_write_path_and_cached_retry() {
        let (router, node) = test_node("n1");
        node.bootstrap().await.unwrap();

        let (status, body) = post(&router, "/sql", b"CREATE TABLE t (id INTEGER)").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"SequenceNumber: 1\n");

        let (status, body) = post(&router, "/sql", b"INSERT INTO t VALUES (1)").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"SequenceNumber: 2\n");

        // The verbatim retry is served from the cache: same bytes, no new
        // row, no sequence advance.
        let (status, body) = post(&router, "/sql", b"INSERT INTO t VALUES (1)").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"SequenceNumber: 2\n");

        let (_, body) = post(&router, "/sql", b"SELECT COUNT(*) FROM t").await;
        assert_eq!(&body[..], b"SequenceNumber: 3\n1\n");
        assert_eq!(node.machine().sequence_number().await, 3);
    }

    #[tokio::test]
    async fn test_invalid_query_reports_query_and_diagnostics() {
        let (router, node) = test_node("n1");
        node.bootstrap().await.unwrap();

        let (status, body) = post(&router, "/sql", b"NOT VALID SQL").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("NOT VALID SQL"), "body: {}", text);
        assert!(text.contains("SQLite error:"), "body: {}", text);

        assert_eq!(node.machine().sequence_number().await, 0);
        assert!(node.machine().cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_join_with_malformed_payload() {
        let (router, node) = test_node("n1");
        node.bootstrap().await.unwrap();

        let (status, body) = post(&router, "/join", b"not json").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8(body.to_vec())
            .unwrap()
            .contains("Invalid join request"));
    }

    #[tokio::test]
    async fn test_join_adds_member() {
        let (router, node) = test_node("n1");
        node.bootstrap().await.unwrap();

        let joiner = Member {
            name: "n2".to_string(),
            connection_string: "http://n2.test:4001".to_string(),
        };
        let (status, body) = post(
            &router,
            "/join",
            &serde_json::to_vec(&joiner).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {:?}", body);

        let members = node.consensus().peers().await;
        assert!(members.contains(&joiner));
        assert!(members.contains(&node.member()));
    }

    #[tokio::test]
    async fn test_status_reports_leader_after_bootstrap() {
        let (router, node) = test_node("n1");
        node.bootstrap().await.unwrap();

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["node"], "n1");
        assert_eq!(status["role"], "LEADER");
        assert_eq!(status["leader"], "http://n1.test:4001");
    }
}
