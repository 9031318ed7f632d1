use actix_web::{HttpResponse, Responder, post, web};
use serde::Deserialize;

use super::error_response;
use crate::engine::AssessmentEngine;

#[derive(Deserialize, Debug)]
pub struct RunRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub input: String,
}

/// Debugging path: no assessment, no test cases
#[post("/execute/run")]
pub async fn run_handler(
    engine: web::Data<AssessmentEngine>,
    body: web::Json<RunRequest>,
) -> impl Responder {
    match engine
        .run_adhoc(&body.code, &body.language, &body.input)
        .await
    {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => error_response(&e),
    }
}
