//! HTTP boundary of a node
//!
//! The gateway-facing surface: health, vote submission and status, election
//! results and the admin reset. Error mapping follows the cluster taxonomy:
//! validation → 4xx, duplicate → 409, transient infrastructure → 503,
//! anything else → 500.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ballot_core::consensus::{SubmitError, VoteStatus};
use ballot_core::mutex::MutexError;
use ballot_core::node::Node;
use ballot_core::store::StoreError;
use ballot_core::types::Ballot;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/votes", post(submit_vote))
        .route("/votes/:vote_id", get(vote_status))
        .route("/elections/:election_id/results", get(election_results))
        .route("/elections/:election_id/reset", post(reset_election))
        .with_state(node)
}

async fn health(State(node): State<Arc<Node>>) -> Response {
    let report = node.health_report().await;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn submit_vote(State(node): State<Arc<Node>>, Json(ballot): Json<Ballot>) -> Response {
    match node.submit_vote(ballot).await {
        Ok(vote_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "vote_id": vote_id })),
        )
            .into_response(),
        Err(SubmitError::Invalid(reason)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "detail": reason }))).into_response()
        }
        Err(SubmitError::AlreadyVoted) => (
            StatusCode::CONFLICT,
            Json(json!({ "detail": "Voter has already cast a vote in this election" })),
        )
            .into_response(),
        Err(SubmitError::Store(err)) => store_error(err),
    }
}

async fn vote_status(
    State(node): State<Arc<Node>>,
    Path(vote_id): Path<String>,
) -> Response {
    match node.vote_status(&vote_id).await {
        VoteStatus::Finalized(vote) => {
            (StatusCode::OK, Json(json!({ "status": "finalized", "vote": vote })))
                .into_response()
        }
        VoteStatus::Pending {
            approvals,
            total_nodes,
            approval_percentage,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "pending",
                "approvals": approvals,
                "total_nodes": total_nodes,
                "approval_percentage": approval_percentage,
            })),
        )
            .into_response(),
        VoteStatus::Unknown => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Vote not found" })),
        )
            .into_response(),
    }
}

async fn election_results(
    State(node): State<Arc<Node>>,
    Path(election_id): Path<String>,
) -> Response {
    match node.results(&election_id).await {
        Ok(tally) => (StatusCode::OK, Json(tally)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn reset_election(
    State(node): State<Arc<Node>>,
    Path(election_id): Path<String>,
) -> Response {
    match node.reset_election(&election_id).await {
        Ok(report) => {
            let status = if report.complete() { "success" } else { "partial" };
            (
                StatusCode::OK,
                Json(json!({ "status": status, "details": report })),
            )
                .into_response()
        }
        Err(MutexError::Timeout(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Another reset for this election is in progress" })),
        )
            .into_response(),
        Err(MutexError::Store(err)) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    warn!("HTTP: store failure surfaced to client: {}", err);
    let code = if err.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(json!({ "detail": "Shared store unavailable" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ballot_core::config::{
        ConsensusTiming, DirectoryTiming, ElectionTiming, NodeConfig,
    };
    use ballot_core::store::MemoryStore;
    use ballot_core::types::Role;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn fast_config(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            initial_role: Role::Leader,
            directory: DirectoryTiming {
                heartbeat_interval: Duration::from_millis(20),
                heartbeat_ttl: Duration::from_millis(400),
                observe_interval: Duration::from_millis(20),
                liveness_window: 0.4,
                failure_threshold: 5,
            },
            consensus: ConsensusTiming {
                initial_recheck: Duration::from_millis(20),
                recheck_interval: Duration::from_millis(40),
                pending_ttl: Duration::from_secs(5),
            },
            election: ElectionTiming {
                timeout_min: Duration::from_secs(30),
                timeout_max: Duration::from_secs(60),
                heartbeat_interval: Duration::from_millis(100),
                check_interval: Duration::from_millis(25),
            },
            ..NodeConfig::default()
        }
    }

    async fn started_node() -> Arc<Node> {
        let store: Arc<dyn ballot_core::store::SharedStore> = Arc::new(MemoryStore::new());
        let node = Node::new(fast_config("api-node"), store);
        node.start().await.unwrap();
        node
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_vote(voter: &str, candidate: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/votes")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "voter_id": voter,
                    "election_id": "e1",
                    "candidate_id": candidate,
                })
                .to_string(),
            ))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_vote_lifecycle_over_http() {
        let node = started_node().await;
        let app = router(node);

        let response = app.clone().oneshot(post_vote("v1", "c1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "accepted");
        let vote_id = body["vote_id"].as_str().unwrap().to_string();
        assert!(vote_id.starts_with("e1:v1:"));

        // Single-node cluster: the rechecker finalizes quickly
        let mut finalized = false;
        for _ in 0..50 {
            let response = app
                .clone()
                .oneshot(get(&format!("/votes/{}", vote_id)))
                .await
                .unwrap();
            let body = body_json(response).await;
            if body["status"] == "finalized" {
                assert_eq!(body["vote"]["candidate_id"], "c1");
                finalized = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(finalized, "vote never finalized");

        let response = app
            .clone()
            .oneshot(get("/elections/e1/results"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_votes"], 1);
        assert_eq!(body["results"]["c1"], 1);

        // Second vote by the same voter conflicts
        let response = app.clone().oneshot(post_vote("v1", "c2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Admin reset zeroes the tally
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/elections/e1/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "success");

        let response = app
            .clone()
            .oneshot(get("/elections/e1/results"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["total_votes"], 0);
    }

    #[tokio::test]
    async fn test_validation_and_not_found() {
        let node = started_node().await;
        let app = router(node);

        let response = app.clone().oneshot(post_vote("", "c1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(get("/votes/e1:nobody:missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_becomes_healthy() {
        let node = started_node().await;
        let app = router(node);

        let mut healthy = false;
        for _ in 0..50 {
            let response = app.clone().oneshot(get("/health")).await.unwrap();
            if response.status() == StatusCode::OK {
                let body = body_json(response).await;
                assert_eq!(body["status"], "healthy");
                assert_eq!(body["role"], "leader");
                assert_eq!(body["clock_sync"]["is_leader"], true);
                healthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(healthy, "node never became healthy");
    }
}
