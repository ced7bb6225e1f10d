#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use common::{run_config, SharedProbe};
use memory_squeezer::config::MIB;
use memory_squeezer::{routes, AppState, Metrics, SqueezeRunner, SqueezerConfig};
use serde_json::Value;

fn app_state(probe: &SharedProbe) -> AppState {
    let runner = SqueezeRunner::new(run_config(MIB, 0, 4 * MIB), Metrics::new().unwrap())
        .with_probe(probe.factory());
    AppState {
        reporter: Arc::new(runner.reporter()),
        runner,
        display: SqueezerConfig::default().display(),
    }
}

#[actix_web::test]
async fn start_stop_and_metrics() {
    let probe = SharedProbe::healthy();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state(&probe)))
            .configure(routes),
    )
    .await;

    // healthz
    let req = test::TestRequest::get().uri("/healthz").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["state"], "IDLE");

    // unconfirmed start is refused
    let req = test::TestRequest::post()
        .uri("/squeeze/start")
        .set_json(serde_json::json!({"confirmed": false}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

    // start
    let req = test::TestRequest::post()
        .uri("/squeeze/start")
        .set_json(serde_json::json!({"confirmed": true}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    if resp.status() != StatusCode::ACCEPTED {
        let body = test::read_body(resp).await;
        panic!("/squeeze/start failed: {}", String::from_utf8_lossy(&body));
    }

    // second start conflicts
    let req = test::TestRequest::post()
        .uri("/squeeze/start")
        .set_json(serde_json::json!({"confirmed": true}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // the 4 MiB ceiling is reached and held
    let mut held = false;
    for _ in 0..200 {
        let req = test::TestRequest::get().uri("/squeeze/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        if body["holding"] == true {
            assert_eq!(body["state"], "RUNNING");
            assert_eq!(body["retained_bytes"], 4 * MIB);
            held = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(held, "run never reached its ceiling");

    // snapshot
    let req = test::TestRequest::get().uri("/snapshot").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["retained_bytes"], 4 * MIB);
    assert_eq!(body["system"]["total_bytes"], 64 * common::GIB);

    // metrics scrape
    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let text = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    assert!(text.contains("squeezer_runs_total 1"));

    // stop releases everything
    let req = test::TestRequest::post().uri("/squeeze/stop").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "STOPPED");
    assert_eq!(body["retained_bytes"], 0);

    // stopping again is a conflict
    let req = test::TestRequest::post().uri("/squeeze/stop").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[actix_web::test]
async fn display_and_snapshot_errors() {
    let probe = SharedProbe::healthy();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state(&probe)))
            .configure(routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/display").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["width"], 600);
    assert_eq!(body["height"], 500);

    probe.fail();
    let req = test::TestRequest::get().uri("/snapshot").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let req = test::TestRequest::post()
        .uri("/squeeze/start")
        .set_json(serde_json::json!({"confirmed": true}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let req = test::TestRequest::post().uri("/squeeze/emergency-stop").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}
