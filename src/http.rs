#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{get, post, web, App, HttpResponse, HttpServer};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::DisplaySettings;
use crate::domain::StartRequest;
use crate::error::SqueezeError;
use crate::reporter::StatusReporter;
use crate::service::SqueezeRunner;

#[derive(Clone)]
pub struct AppState {
    pub runner: SqueezeRunner,
    pub reporter: Arc<StatusReporter>,
    pub display: DisplaySettings,
}

fn status_for(e: &SqueezeError) -> StatusCode {
    match e {
        SqueezeError::AlreadyActive(_)
        | SqueezeError::NotRunning(_)
        | SqueezeError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SqueezeError::NotConfirmed | SqueezeError::LowMemoryUnacknowledged { .. } => {
            StatusCode::PRECONDITION_FAILED
        }
        SqueezeError::Configuration(_) => StatusCode::BAD_REQUEST,
        SqueezeError::MetricsUnavailable(_)
        | SqueezeError::WorkerSpawnFailure { .. }
        | SqueezeError::ResourceExhaustion { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[post("/squeeze/start")]
pub async fn start(payload: web::Json<StartRequest>, data: web::Data<AppState>) -> HttpResponse {
    let req = payload.into_inner();
    info!(
        confirmed = req.confirmed,
        acknowledge_low_memory = req.acknowledge_low_memory,
        "start request"
    );
    match data.runner.start(&req) {
        Ok(st) => HttpResponse::Accepted().json(st),
        Err(e) => {
            if e.is_rejection() {
                warn!(error=%e, "start rejected");
            } else {
                error!(error=%e, "start failed");
            }
            json_error(status_for(&e), &e.to_string())
        }
    }
}

#[post("/squeeze/stop")]
pub async fn stop(data: web::Data<AppState>) -> HttpResponse {
    match data.runner.stop().await {
        Ok(st) => HttpResponse::Ok().json(st),
        Err(e) => {
            warn!(error=%e, "stop rejected");
            json_error(status_for(&e), &e.to_string())
        }
    }
}

#[post("/squeeze/emergency-stop")]
pub async fn emergency_stop(data: web::Data<AppState>) -> HttpResponse {
    match data.runner.emergency_stop() {
        Ok(st) => HttpResponse::Ok().json(st),
        Err(e) => json_error(status_for(&e), &e.to_string()),
    }
}

#[get("/squeeze/status")]
pub async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.runner.status())
}

#[get("/snapshot")]
pub async fn snapshot(data: web::Data<AppState>) -> HttpResponse {
    match data.reporter.snapshot() {
        Ok(snap) => HttpResponse::Ok().json(snap),
        Err(e) => {
            error!(error=%e, "snapshot failed");
            json_error(status_for(&e), &e.to_string())
        }
    }
}

#[get("/display")]
pub async fn display(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(&data.display)
}

#[get("/healthz")]
pub async fn healthz(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.runner.health())
}

#[get("/metrics")]
pub async fn scrape_metrics(data: web::Data<AppState>) -> HttpResponse {
    match data.runner.encode_metrics() {
        Ok(buf) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(buf),
        Err(e) => {
            error!(error=%format!("{e:#}"), "encode metrics failed");
            HttpResponse::InternalServerError().body("encode metrics failed")
        }
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(start)
        .service(stop)
        .service(emergency_stop)
        .service(status)
        .service(snapshot)
        .service(display)
        .service(healthz)
        .service(scrape_metrics);
}

pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes)
    })
    .bind(bind)?
    .run()
    .await
}

fn json_error(code: StatusCode, reason: &str) -> HttpResponse {
    HttpResponse::build(code).json(json!({"status":"error","reason":reason}))
}
