use actix_web::{HttpResponse, Responder, get, post, web};
use serde::Deserialize;

use super::{CandidateQuery, error_response};
use crate::engine::AssessmentEngine;
use crate::models::NewAssessment;

#[derive(Deserialize, Debug)]
pub struct SubmitRequest {
    pub candidate_id: String,
    pub language: String,
    pub code: String,
}

#[post("/assessments")]
pub async fn post_assessment_handler(
    engine: web::Data<AssessmentEngine>,
    body: web::Json<NewAssessment>,
) -> impl Responder {
    match engine.create_assessment(body.into_inner()).await {
        Ok(assessment) => HttpResponse::Created().json(assessment),
        Err(e) => error_response(&e),
    }
}

#[get("/assessments/{id}")]
pub async fn get_assessment_handler(
    engine: web::Data<AssessmentEngine>,
    path: web::Path<(u64,)>,
    query: web::Query<CandidateQuery>,
) -> impl Responder {
    let assessment_id = path.into_inner().0;

    match engine
        .get_assessment(assessment_id, &query.candidate_id)
        .await
    {
        Ok(assessment) => HttpResponse::Ok().json(assessment),
        Err(e) => error_response(&e),
    }
}

#[post("/assessments/{id}/start")]
pub async fn start_assessment_handler(
    engine: web::Data<AssessmentEngine>,
    path: web::Path<(u64,)>,
    query: web::Query<CandidateQuery>,
) -> impl Responder {
    let assessment_id = path.into_inner().0;

    match engine
        .start_assessment(assessment_id, &query.candidate_id)
        .await
    {
        Ok(assessment) => HttpResponse::Ok().json(assessment),
        Err(e) => {
            log::info!("Assessment {assessment_id} not started: {e}");
            error_response(&e)
        }
    }
}

#[get("/assessments/{id}/questions")]
pub async fn get_questions_handler(
    engine: web::Data<AssessmentEngine>,
    path: web::Path<(u64,)>,
    query: web::Query<CandidateQuery>,
) -> impl Responder {
    let assessment_id = path.into_inner().0;

    match engine
        .list_questions(assessment_id, &query.candidate_id)
        .await
    {
        Ok(questions) => HttpResponse::Ok().json(questions),
        Err(e) => error_response(&e),
    }
}

#[post("/assessments/{id}/questions/{question_id}/submit")]
pub async fn submit_handler(
    engine: web::Data<AssessmentEngine>,
    path: web::Path<(u64, u64)>,
    body: web::Json<SubmitRequest>,
) -> impl Responder {
    let (assessment_id, question_id) = path.into_inner();

    match engine
        .submit(
            assessment_id,
            question_id,
            &body.candidate_id,
            &body.language,
            &body.code,
        )
        .await
    {
        Ok(submission) => HttpResponse::Ok().json(submission),
        Err(e) => {
            log::info!("Submission to question {question_id} rejected: {e}");
            error_response(&e)
        }
    }
}
