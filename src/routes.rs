mod assessments;
mod execute;
mod health;

pub use assessments::*;
pub use execute::*;
pub use health::*;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorKind};

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub reason: String,
    pub code: u32,
    pub message: String,
}

impl ErrorResponse {
    fn new(reason: &str, code: u32, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            code,
            message: message.into(),
        }
    }
}

/// Candidate identity on reads
#[derive(Deserialize, Debug)]
pub struct CandidateQuery {
    pub candidate_id: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse::new(
        "ERR_INVALID_ARGUMENT",
        1,
        err.to_string(),
    ));
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse::new(
        "ERR_INVALID_ARGUMENT",
        1,
        err.to_string(),
    ));
    InternalError::from_response(err, response).into()
}

/// Maps an engine error onto the status code and body the API promises
pub fn error_response(err: &EngineError) -> HttpResponse {
    match err.kind() {
        ErrorKind::Validation => HttpResponse::BadRequest().json(ErrorResponse::new(
            "ERR_INVALID_ARGUMENT",
            1,
            err.to_string(),
        )),
        ErrorKind::State => HttpResponse::BadRequest().json(ErrorResponse::new(
            "ERR_INVALID_STATE",
            2,
            err.to_string(),
        )),
        ErrorKind::NotFound => {
            HttpResponse::NotFound().json(ErrorResponse::new("ERR_NOT_FOUND", 3, err.to_string()))
        }
        ErrorKind::SandboxUnavailable => {
            log::warn!("{err}");
            HttpResponse::ServiceUnavailable().json(ErrorResponse::new(
                "ERR_EXTERNAL",
                5,
                err.to_string(),
            ))
        }
        ErrorKind::Internal => {
            log::error!("{err}");
            HttpResponse::InternalServerError().json(ErrorResponse::new(
                "ERR_INTERNAL",
                6,
                "Internal server error",
            ))
        }
    }
}
