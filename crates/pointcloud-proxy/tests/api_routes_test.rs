//! HTTP API tests
//!
//! Exercise the router end to end with `axum_test::TestServer`: status
//! codes, the response envelope, artifact serving and path sandboxing.

mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};

use common::{BERN, ConverterBehaviour, Harness, ScriptedFetcher};

async fn server() -> (Harness, TestServer) {
    let harness = Harness::new(ScriptedFetcher::default(), ConverterBehaviour::Succeed).await;
    let server = TestServer::new(harness.app.router()).unwrap();
    (harness, server)
}

fn submission(session: &str, lat: f64, lon: f64) -> Value {
    json!({
        "parcel_id": "CH-1234",
        "lat": lat,
        "lon": lon,
        "session_id": session,
    })
}

#[tokio::test]
async fn test_submit_returns_accepted_job() {
    let (_harness, server) = server().await;

    let response = server
        .post("/api/v1/jobs")
        .json(&submission("s1", BERN.0, BERN.1))
        .await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);

    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["deduplicated"], false);
    let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

    let status = server.get(&format!("/api/v1/jobs/{job_id}")).await;
    assert_eq!(status.status_code(), StatusCode::OK);
    let body: Value = status.json();
    assert_eq!(body["data"]["job_id"], job_id.as_str());
    assert_eq!(body["data"]["status"], "pending");
}

#[tokio::test]
async fn test_invalid_submissions_are_bad_requests() {
    let (_harness, server) = server().await;

    let outside = server
        .post("/api/v1/jobs")
        .json(&submission("s1", 51.5, -0.12))
        .await;
    assert_eq!(outside.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = outside.json();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("outside"));

    let empty_session = server
        .post("/api/v1/jobs")
        .json(&submission("", BERN.0, BERN.1))
        .await;
    assert_eq!(empty_session.status_code(), StatusCode::BAD_REQUEST);

    let mut crop = submission("s1", BERN.0, BERN.1);
    crop["crop_bbox"] = json!({
        "min_e": 2_700_000.0,
        "min_n": 1_250_000.0,
        "max_e": 2_700_100.0,
        "max_n": 1_250_100.0,
    });
    let crop_outside = server.post("/api/v1/jobs").json(&crop).await;
    assert_eq!(crop_outside.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (_harness, server) = server().await;

    let response = server
        .get(&format!("/api/v1/jobs/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ready_tile_files_are_served() {
    let (harness, server) = server().await;

    let submitted: Value = server
        .post("/api/v1/jobs")
        .json(&submission("s1", BERN.0, BERN.1))
        .await
        .json();
    let tile_id = submitted["data"]["tile_id"].as_str().unwrap().to_string();

    // Nothing is served before the descriptor exists
    let early = server.get(&format!("/tiles/{tile_id}/")).await;
    assert_eq!(early.status_code(), StatusCode::NOT_FOUND);

    harness.drain().await;

    let job_id = submitted["data"]["job_id"].as_str().unwrap();
    let status: Value = server.get(&format!("/api/v1/jobs/{job_id}")).await.json();
    assert_eq!(status["data"]["status"], "ready");
    let result_url = status["data"]["result_url"].as_str().unwrap().to_string();
    assert_eq!(result_url, format!("/tiles/{tile_id}/"));

    let descriptor = server.get(&result_url).await;
    assert_eq!(descriptor.status_code(), StatusCode::OK);
    assert!(descriptor.text().contains(&tile_id));

    let octree = server.get(&format!("/tiles/{tile_id}/data/octree.bin")).await;
    assert_eq!(octree.status_code(), StatusCode::OK);
    assert_eq!(octree.as_bytes().as_ref(), b"octree nodes");

    let missing = server.get(&format!("/tiles/{tile_id}/data/none.bin")).await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tile_paths_cannot_escape_the_cache() {
    let (harness, server) = server().await;
    harness
        .app
        .orchestrator
        .submit(common::request("s1", BERN))
        .await
        .unwrap();
    harness.drain().await;
    let tile_id = harness
        .app
        .orchestrator
        .grid()
        .tile_for_point(BERN.0, BERN.1)
        .tile_id;

    for path in [
        format!("/tiles/{tile_id}/..%2F..%2Fraw%2F{tile_id}%2F{tile_id}.laz"),
        format!("/tiles/{tile_id}/data%2F..%2F..%2F..%2Fsecret"),
        "/tiles/not-a-tile/".to_string(),
        "/tiles/..%2Fraw/".to_string(),
    ] {
        let response = server.get(&path).await;
        assert!(
            response.status_code().is_client_error(),
            "{path} answered {}",
            response.status_code()
        );
    }
}

#[tokio::test]
async fn test_malformed_tile_id_is_not_found() {
    let (_harness, server) = server().await;

    for path in ["/tiles/not-a-tile/", "/tiles/12_x/data/octree.bin"] {
        let response = server.get(path).await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND, "{path}");
        let body: Value = response.json();
        assert_eq!(body["success"], false);
    }
}

#[tokio::test]
async fn test_availability_and_bbox_queries() {
    let (_harness, server) = server().await;

    let availability: Value = server
        .get("/api/v1/tiles/availability")
        .add_query_param("lat", BERN.0)
        .add_query_param("lon", BERN.1)
        .await
        .json();
    assert_eq!(availability["data"]["coverage_available"], true);
    assert_eq!(availability["data"]["converted_cached"], false);

    let small = server
        .get("/api/v1/tiles/bbox")
        .add_query_param("min_lat", 46.94)
        .add_query_param("min_lon", 7.43)
        .add_query_param("max_lat", 46.96)
        .add_query_param("max_lon", 7.46)
        .await;
    assert_eq!(small.status_code(), StatusCode::OK);
    let tiles: Value = small.json();
    let tiles = tiles["data"].as_array().unwrap();
    assert!(!tiles.is_empty() && tiles.len() <= 16);

    let whole_country = server
        .get("/api/v1/tiles/bbox")
        .add_query_param("min_lat", 45.9)
        .add_query_param("min_lon", 6.0)
        .add_query_param("max_lat", 47.8)
        .add_query_param("max_lon", 10.4)
        .await;
    assert_eq!(whole_country.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_openapi() {
    let (_harness, server) = server().await;

    let health = server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    let body: Value = health.json();
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["pending_jobs"], 0);

    let stats = server.get("/api/v1/cache/stats").await;
    assert_eq!(stats.status_code(), StatusCode::OK);

    let document: Value = server.get("/api/openapi.json").await.json();
    assert!(document["paths"]["/api/v1/jobs"].is_object());
}
