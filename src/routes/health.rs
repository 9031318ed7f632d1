use actix_web::{HttpResponse, Responder, get, web};
use serde_json::json;

use crate::engine::AssessmentEngine;

#[get("/health")]
pub async fn health_handler(engine: web::Data<AssessmentEngine>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "sandbox_backend": engine.executor().backend().kind(),
    }))
}
