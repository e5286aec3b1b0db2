//! Integration tests for the HTTP API.

mod common;

use common::*;
use pipeline_healer::server::{build_router, ServerState};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Serve the API for `h` on a random port.
async fn start_api(h: &Harness) -> SocketAddr {
    let app = build_router(Arc::new(ServerState::new(h.orchestrator.clone())));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn wait_for_final(client: &reqwest::Client, addr: SocketAddr, run_id: &str) -> Value {
    for _ in 0..300 {
        let body: Value = client
            .get(format!("http://{addr}/api/run/{run_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["stage"] == "FINALIZED" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finalize");
}

fn passing_harness() -> Harness {
    harness(
        seeded_repo(),
        ScriptedChecks::always(passing()),
        FakeGenerator::editing(),
        None,
    )
}

#[tokio::test]
async fn test_health() {
    let h = passing_harness();
    let addr = start_api(&h).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["runs"], 0);
}

#[tokio::test]
async fn test_start_run_and_read_result() {
    let h = passing_harness();
    let addr = start_api(&h).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/run"))
        .json(&json!({
            "repo_url": REPO_URL,
            "team_name": "Rift Organisers",
            "leader_name": "Saiyam Kumar",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let started: Value = response.json().await.unwrap();
    assert_eq!(started["branch"], "RIFT_ORGANISERS_SAIYAM_KUMAR_AI_Fix");
    let run_id = started["run_id"].as_str().unwrap().to_string();

    let run = wait_for_final(&client, addr, &run_id).await;
    assert_eq!(run["id"], run_id.as_str());
    assert_eq!(run["outcome"]["status"], "passed");
    assert!(!run["progress"].as_array().unwrap().is_empty());

    let results: Value = client
        .get(format!("http://{addr}/api/results"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(results["runs"].as_array().unwrap().len(), 1);
    assert_eq!(results["runs"][0]["run_id"], run_id.as_str());
}

#[tokio::test]
async fn test_stream_of_finished_run_replays_and_ends() {
    let h = passing_harness();
    let addr = start_api(&h).await;
    let client = reqwest::Client::new();

    let started: Value = client
        .post(format!("http://{addr}/api/run"))
        .json(&json!({
            "repo_url": REPO_URL,
            "team_name": "team",
            "leader_name": "lead",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let run_id = started["run_id"].as_str().unwrap().to_string();
    wait_for_final(&client, addr, &run_id).await;

    let body = tokio::time::timeout(
        Duration::from_secs(5),
        client
            .get(format!("http://{addr}/api/run/{run_id}/stream"))
            .send()
            .await
            .unwrap()
            .text(),
    )
    .await
    .expect("stream should end after the finished event")
    .unwrap();

    assert!(body.contains("event: progress"));
    assert!(body.contains("event: finished"));
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let h = passing_harness();
    let addr = start_api(&h).await;
    let client = reqwest::Client::new();

    for path in [
        "/api/run/00000000-0000-0000-0000-000000000000",
        "/api/run/not-a-uuid",
        "/api/run/not-a-uuid/stream",
    ] {
        let status = client
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }

    let status = client
        .delete(format!("http://{addr}/api/run/not-a-uuid"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_names_are_rejected() {
    let h = passing_harness();
    let addr = start_api(&h).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/run"))
        .json(&json!({
            "repo_url": REPO_URL,
            "team_name": "!!!",
            "leader_name": "lead",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Team"));
    assert!(h.orchestrator.registry().is_empty().await);
}

#[tokio::test]
async fn test_cancel_finished_run_conflicts() {
    let h = passing_harness();
    let addr = start_api(&h).await;
    let client = reqwest::Client::new();

    let started: Value = client
        .post(format!("http://{addr}/api/run"))
        .json(&json!({
            "repo_url": REPO_URL,
            "team_name": "team",
            "leader_name": "lead",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let run_id = started["run_id"].as_str().unwrap().to_string();
    wait_for_final(&client, addr, &run_id).await;

    let status = client
        .delete(format!("http://{addr}/api/run/{run_id}"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, StatusCode::CONFLICT);
}
