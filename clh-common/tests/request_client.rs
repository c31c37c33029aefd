//! RequestClient against an in-process HTTP server.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clh_common::request::RequestOptions;
use clh_common::sandbox::SandboxOptions;
use clh_common::{Endpoint, HarnessError};
use serde_json::{json, Value};

use common::{free_port, serve, TestSandbox};

fn node_router() -> Router {
    Router::new()
        .route(
            "/3/Cloud.json",
            get(|| async { Json(json!({"cloud_name": "test", "cloud_size": 1, "consensus": true})) }),
        )
        .route("/3/Shutdown.json", post(|| async { Json(json!({})) }))
        .route(
            "/3/Echo.json",
            get(|Query(params): Query<HashMap<String, String>>| async move { Json(json!(params)) }),
        )
        .route("/3/Broken.json", get(|| async { Json(json!({"error": "disk full"})) }))
        .route(
            "/3/Slow.json",
            get(|| async { Json(json!({"warning": "slow", "rows": 3})) }),
        )
        .route(
            "/3/Quiet.json",
            get(|| async { Json(json!({"error": null, "warnings": [], "rows": 3})) }),
        )
        .route("/3/Html.json", get(|| async { "<html>oops</html>" }))
        .route("/3/Scalar.json", get(|| async { "42" }))
        .route(
            "/3/Crash.json",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route("/3/Frames.json", get(|| async { Json(json!([{"id": 1}, {"id": 2}])) }))
}

fn node() -> Endpoint {
    Endpoint::new("127.0.0.1", serve(node_router()))
}

#[test]
fn test_get_cloud_returns_parsed_body() {
    let sb = TestSandbox::new("test_get_cloud_returns_parsed_body");
    let endpoint = node();

    let cloud = sb
        .client
        .get_cloud(&endpoint, Duration::from_secs(5), false)
        .unwrap();
    assert_eq!(cloud["cloud_size"], 1);

    let url = endpoint.url("3/Cloud.json");
    assert_eq!(sb.client.url_history(), vec![url.clone()]);
    assert!(sb.commands_log().contains(&format!("Start {url}")));
}

#[test]
fn test_params_without_value_are_dropped() {
    let sb = TestSandbox::new("test_params_without_value_are_dropped");
    let endpoint = node();

    let options = RequestOptions::get("3/Echo.json")
        .param("frame", "iris.hex")
        .param_opt("cols", None::<String>)
        .param("row_count", 5);
    let body = sb.client.request(&endpoint, &options).unwrap().unwrap();

    assert_eq!(body["frame"], "iris.hex");
    assert_eq!(body["row_count"], "5");
    assert!(body.get("cols").is_none());
}

#[test]
fn test_remote_error_raised_unless_ignored() {
    let sb = TestSandbox::new("test_remote_error_raised_unless_ignored");
    let endpoint = node();

    let err = sb
        .client
        .request(&endpoint, &RequestOptions::get("3/Broken.json"))
        .unwrap_err();
    match &err {
        HarnessError::Remote { url, value } => {
            assert!(url.ends_with("3/Broken.json"));
            assert_eq!(value, &json!("disk full"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(err.to_string().contains("disk full"));

    let body = sb
        .client
        .request(
            &endpoint,
            &RequestOptions::get("3/Broken.json").ignore_remote_errors(true),
        )
        .unwrap()
        .unwrap();
    assert_eq!(body, json!({"error": "disk full"}));
}

#[test]
fn test_warnings_and_null_errors_are_not_failures() {
    let sb = TestSandbox::new("test_warnings_and_null_errors_are_not_failures");
    let endpoint = node();

    let slow = sb
        .client
        .request(&endpoint, &RequestOptions::get("3/Slow.json"))
        .unwrap()
        .unwrap();
    assert_eq!(slow["rows"], 3);

    let quiet = sb
        .client
        .request(&endpoint, &RequestOptions::get("3/Quiet.json"))
        .unwrap()
        .unwrap();
    assert_eq!(quiet["rows"], 3);
}

#[test]
fn test_top_level_array_is_accepted() {
    let sb = TestSandbox::new("test_top_level_array_is_accepted");
    let body = sb
        .client
        .request(&node(), &RequestOptions::get("3/Frames.json"))
        .unwrap()
        .unwrap();
    assert_eq!(body.as_array().map(Vec::len), Some(2));
}

#[test]
fn test_undecodable_bodies() {
    let sb = TestSandbox::new("test_undecodable_bodies");
    let endpoint = node();

    let err = sb
        .client
        .request(&endpoint, &RequestOptions::get("3/Html.json"))
        .unwrap_err();
    match err {
        HarnessError::Decode { body, .. } => assert_eq!(body, "<html>oops</html>"),
        other => panic!("expected decode error, got {other:?}"),
    }

    let err = sb
        .client
        .request(&endpoint, &RequestOptions::get("3/Scalar.json"))
        .unwrap_err();
    assert!(matches!(err, HarnessError::Decode { .. }));
}

#[test]
fn test_http_error_status_is_protocol_error_naming_caller() {
    let sb = TestSandbox::new("test_http_error_status_is_protocol_error_naming_caller");
    let endpoint = node();

    for path in ["3/Missing.json", "3/Crash.json"] {
        let err = sb
            .client
            .request(&endpoint, &RequestOptions::get(path))
            .unwrap_err();
        match err {
            HarnessError::Protocol(message) => {
                assert!(message.contains(path), "{message}");
                assert!(message.contains("request_client.rs"), "{message}");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
    assert!(sb.client.url_history().is_empty());
}

#[test]
fn test_return_fast_skips_body() {
    let sb = TestSandbox::new("test_return_fast_skips_body");
    let endpoint = node();

    let reply = sb
        .client
        .request(&endpoint, &RequestOptions::get("3/Broken.json").return_fast(true))
        .unwrap();
    assert!(reply.is_none());

    sb.client
        .shutdown_all(&endpoint, Duration::from_secs(5))
        .unwrap();
    assert_eq!(sb.client.url_history().len(), 2);
}

#[test]
fn test_full_url_ignores_endpoint() {
    let sb = TestSandbox::new("test_full_url_ignores_endpoint");
    let target = node();
    let elsewhere = Endpoint::new("127.0.0.1", free_port());

    let body = sb
        .client
        .request(
            &elsewhere,
            &RequestOptions::full_url(target.url("3/Echo.json")).param("k", "v"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(body["k"], "v");
}

#[test]
fn test_refused_connection_is_transport_error() {
    let sb = TestSandbox::new("test_refused_connection_is_transport_error");
    let endpoint = Endpoint::new("127.0.0.1", free_port());

    let err = sb
        .client
        .get_cloud(&endpoint, Duration::from_secs(2), true)
        .unwrap_err();
    assert!(matches!(err, HarnessError::Transport { .. }));
    assert!(err.is_connection_failure());
    assert!(!sb.sandbox().state().was_reported());
}

#[test]
fn test_transport_failure_scans_sandbox() {
    let sb = TestSandbox::new("test_transport_failure_scans_sandbox");
    std::fs::write(
        sb.root().join("node-0.stdout.log"),
        "starting\njava.lang.OutOfMemoryError: Java heap space\n",
    )
    .unwrap();
    let endpoint = Endpoint::new("127.0.0.1", free_port());

    let err = sb
        .client
        .get_cloud(&endpoint, Duration::from_secs(2), false)
        .unwrap_err();

    // The scan result is logged; the transport failure is what surfaces.
    assert!(matches!(err, HarnessError::Transport { .. }));
    assert!(sb.sandbox().state().was_reported());
}

#[test]
fn test_rest_log_records_exchange() {
    let sb = TestSandbox::with_options(SandboxOptions {
        test_name: "test_rest_log_records_exchange".to_string(),
        debug_rest: true,
        ignore_errors: false,
    });
    let endpoint = node();

    sb.client
        .request(
            &endpoint,
            &RequestOptions::get("3/Cloud.json").comment("first contact"),
        )
        .unwrap();

    let rest = std::fs::read_to_string(sb.sandbox().rest_log_path()).unwrap();
    assert!(rest.contains("# Extra comment info about this request: first contact"));
    assert!(rest.contains("GET"));
    assert!(rest.contains(&endpoint.url("3/Cloud.json")));
    assert!(rest.contains("HTTP status code: 200"));
    assert!(rest.contains("cloud_size"));

    let commands = sb.commands_log();
    assert!(commands.contains("#first contact"));
}

#[test]
fn test_rest_log_absent_without_debug_rest() {
    let sb = TestSandbox::new("test_rest_log_absent_without_debug_rest");
    let endpoint = node();

    sb.client
        .get_cloud(&endpoint, Duration::from_secs(5), false)
        .unwrap();

    assert!(!sb.sandbox().debug_rest());
    assert!(!sb.sandbox().rest_log_path().exists());
    assert!(sb.commands_log().contains("Start "));
}

#[test]
fn test_log_and_echo() {
    let echo = Router::new().route(
        "/3/LogAndEcho.json",
        get(|Query(params): Query<HashMap<String, String>>| async move {
            Json(json!({"message": params.get("message").cloned().unwrap_or_default()}))
        }),
    );
    let endpoint = Endpoint::new("127.0.0.1", serve(echo));
    let sb = TestSandbox::new("test_log_and_echo");

    let body: Value = sb.client.log_and_echo(&endpoint, "start of test 7").unwrap();
    assert_eq!(body["message"], "start of test 7");
}
