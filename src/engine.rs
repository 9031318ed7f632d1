//! Entry points used by the HTTP layer.
//!
//! Every operation takes the candidate identity it acts for; a mismatch is
//! reported exactly like a missing record.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::evaluator::{Evaluation, Evaluator, HiddenCases};
use crate::executor::Executor;
use crate::language::Language;
use crate::models::{
    Assessment, AssessmentStatus, NewAssessment, Question, QuestionView, Submission,
    SubmissionStatus, SubmissionView, TestCase, TestResult,
};
use crate::sandbox::ExecutionResult;
use crate::session::{self, Gate};
use crate::store::Store;

pub struct AssessmentEngine {
    store: Arc<Store>,
    executor: Arc<Executor>,
    evaluator: Evaluator,
    hidden_on_submit: HiddenCases,
    /// Held across read, transition and write of an assessment's status
    lifecycle: Mutex<()>,
}

impl AssessmentEngine {
    pub fn new(store: Arc<Store>, executor: Arc<Executor>, config: &EngineConfig) -> Self {
        let hidden_on_submit = if config.grade_hidden_on_submit {
            HiddenCases::Grade
        } else {
            HiddenCases::Skip
        };
        Self {
            evaluator: Evaluator::new(executor.clone()),
            store,
            executor,
            hidden_on_submit,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Creates an assessment with its questions and test cases.
    ///
    /// Questions and test cases are ordered by their position in the request,
    /// starting at 1.
    pub async fn create_assessment(&self, new: NewAssessment) -> Result<Assessment> {
        if new.title.trim().is_empty() {
            return Err(EngineError::Invalid("title must not be empty".to_string()));
        }
        if new.duration_minutes == 0 {
            return Err(EngineError::Invalid(
                "duration_minutes must be positive".to_string(),
            ));
        }
        if new.candidate_id.trim().is_empty() {
            return Err(EngineError::Invalid("candidate_id must not be empty".to_string()));
        }

        let assessment = self
            .store
            .insert(&Assessment {
                id: 0,
                title: new.title,
                description: new.description,
                duration_minutes: new.duration_minutes,
                candidate_id: new.candidate_id,
                status: AssessmentStatus::NotStarted,
                started_at: None,
                expires_at: None,
                created_at: String::new(),
                updated_at: String::new(),
            })
            .await?;

        for (q_index, new_question) in new.questions.into_iter().enumerate() {
            let question = self
                .store
                .insert(&Question {
                    id: 0,
                    assessment_id: assessment.id,
                    title: new_question.title,
                    description: new_question.description,
                    order: q_index as u32 + 1,
                    time_limit_minutes: new_question.time_limit_minutes,
                    allowed_languages: new_question.allowed_languages,
                    created_at: String::new(),
                    updated_at: String::new(),
                })
                .await?;

            for (c_index, new_case) in new_question.test_cases.into_iter().enumerate() {
                self.store
                    .insert(&TestCase {
                        id: 0,
                        question_id: question.id,
                        input: new_case.input,
                        expected_output: new_case.expected_output,
                        is_sample: new_case.is_sample,
                        order: c_index as u32 + 1,
                        created_at: String::new(),
                        updated_at: String::new(),
                    })
                    .await?;
            }
        }

        log::info!(
            "Created assessment {} for candidate {}",
            assessment.id,
            assessment.candidate_id
        );
        Ok(assessment)
    }

    pub async fn get_assessment(&self, assessment_id: u64, candidate_id: &str) -> Result<Assessment> {
        self.store
            .find::<Assessment>(assessment_id)
            .await?
            .filter(|a| a.candidate_id == candidate_id)
            .ok_or(EngineError::NotFound("Assessment"))
    }

    pub async fn start_assessment(
        &self,
        assessment_id: u64,
        candidate_id: &str,
    ) -> Result<Assessment> {
        let guard = self.lifecycle.lock().await;
        let mut assessment = self.get_assessment(assessment_id, candidate_id).await?;
        session::start(&mut assessment, Utc::now())?;
        let assessment = self.save_lifecycle(&assessment).await?;
        drop(guard);

        log::info!(
            "Assessment {} started, expires at {}",
            assessment.id,
            assessment
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );
        Ok(assessment)
    }

    /// Questions in order with their sample test cases. Works in every
    /// lifecycle state, including after expiry.
    pub async fn list_questions(
        &self,
        assessment_id: u64,
        candidate_id: &str,
    ) -> Result<Vec<QuestionView>> {
        let assessment = self.get_assessment(assessment_id, candidate_id).await?;

        let mut questions: Vec<Question> = self
            .store
            .select(&[("assessment_id", json!(assessment.id))])
            .await?;
        questions.sort_by_key(|q| q.order);

        let mut views = Vec::with_capacity(questions.len());
        for question in questions {
            let cases = self.test_cases(question.id).await?;
            views.push(QuestionView::new(question, &cases));
        }
        Ok(views)
    }

    /// Grades `code` against a question without touching any assessment.
    /// Callers decide how much of the hidden cases they may see.
    pub async fn evaluate(
        &self,
        code: &str,
        language: &str,
        question_id: u64,
        hidden: HiddenCases,
    ) -> Result<Evaluation> {
        self.executor.check_code_length(code)?;
        let language: Language = language.parse()?;

        let question = self
            .store
            .find::<Question>(question_id)
            .await?
            .ok_or(EngineError::NotFound("Question"))?;
        let cases = self.test_cases(question.id).await?;
        if cases.is_empty() {
            return Err(EngineError::NoTestCases);
        }

        self.evaluator
            .evaluate(code, language, &question, &cases, hidden)
            .await
    }

    /// Records and grades a candidate's submission.
    ///
    /// Every check happens before the sandbox is touched; an expired
    /// assessment is persisted as expired and the submission refused.
    pub async fn submit(
        &self,
        assessment_id: u64,
        question_id: u64,
        candidate_id: &str,
        language: &str,
        code: &str,
    ) -> Result<SubmissionView> {
        self.executor.check_code_length(code)?;
        let language: Language = language.parse()?;

        let assessment = {
            let _guard = self.lifecycle.lock().await;
            let mut assessment = self.get_assessment(assessment_id, candidate_id).await?;
            match session::admit_submission(&mut assessment, Utc::now()) {
                Gate::Open => assessment,
                Gate::Expired => {
                    self.save_lifecycle(&assessment).await?;
                    log::info!("Assessment {} expired", assessment.id);
                    return Err(EngineError::Expired);
                }
                Gate::Closed(e) => return Err(e),
            }
        };

        let question = self
            .store
            .find::<Question>(question_id)
            .await?
            .filter(|q| q.assessment_id == assessment.id)
            .ok_or(EngineError::NotFound("Question"))?;
        if !question.allows(language) {
            return Err(EngineError::LanguageNotAllowed(language.to_string()));
        }
        let cases = self.test_cases(question.id).await?;
        if cases.is_empty() {
            return Err(EngineError::NoTestCases);
        }

        let submission = self
            .store
            .insert(&Submission {
                id: 0,
                assessment_id: assessment.id,
                question_id: question.id,
                candidate_id: candidate_id.to_string(),
                language,
                code: code.to_string(),
                status: SubmissionStatus::Running,
                sample_passed: 0,
                sample_total: 0,
                hidden_passed: 0,
                hidden_total: 0,
                passed_test_cases: 0,
                total_test_cases: 0,
                compilation_logs: None,
                execution_logs: None,
                execution_time_ms: None,
                created_at: String::new(),
                updated_at: String::new(),
            })
            .await?;

        let evaluation = match self
            .evaluator
            .evaluate(code, language, &question, &cases, self.hidden_on_submit)
            .await
        {
            Ok(evaluation) => evaluation,
            Err(e) => {
                // Do not leave the submission running forever
                self.store
                    .patch::<Submission>(
                        submission.id,
                        json!({
                            "status": SubmissionStatus::Completed,
                            "execution_logs": e.to_string(),
                        }),
                    )
                    .await?;
                return Err(e);
            }
        };

        let mut test_results = Vec::with_capacity(evaluation.outcomes.len());
        for outcome in &evaluation.outcomes {
            let result = self
                .store
                .insert(&TestResult {
                    id: 0,
                    submission_id: submission.id,
                    test_case_id: outcome.test_case_id,
                    is_sample: outcome.is_sample,
                    order: outcome.order,
                    passed: outcome.passed,
                    actual_output: outcome.actual_output.clone(),
                    expected_output: outcome.expected_output.clone(),
                    error: outcome.error.clone(),
                    execution_time_ms: outcome.execution_time_ms,
                    created_at: String::new(),
                    updated_at: String::new(),
                })
                .await?;
            test_results.push(result);
        }

        let submission = self
            .store
            .patch::<Submission>(
                submission.id,
                json!({
                    "status": SubmissionStatus::Completed,
                    "sample_passed": evaluation.sample_passed,
                    "sample_total": evaluation.sample_total,
                    "hidden_passed": evaluation.hidden_passed,
                    "hidden_total": evaluation.hidden_total,
                    "passed_test_cases": evaluation.passed(),
                    "total_test_cases": evaluation.total(),
                    "compilation_logs": evaluation.compilation_logs,
                    "execution_logs": evaluation.last_output,
                    "execution_time_ms": evaluation.first_execution_time_ms,
                }),
            )
            .await?
            .ok_or(EngineError::NotFound("Submission"))?;

        log::info!(
            "Submission {} for question {} completed: {}/{} passed",
            submission.id,
            question.id,
            submission.passed_test_cases,
            submission.total_test_cases
        );
        Ok(SubmissionView {
            submission,
            test_results,
        })
    }

    /// Runs code once with the given stdin, outside of any assessment
    pub async fn run_adhoc(&self, code: &str, language: &str, input: &str) -> Result<ExecutionResult> {
        self.executor.check_code_length(code)?;
        let language: Language = language.parse()?;
        self.executor.execute(code, language, input).await
    }

    /// Creates every assessment of a seed file
    pub async fn seed(&self, assessments: Vec<NewAssessment>) -> Result<Vec<Assessment>> {
        let mut created = Vec::with_capacity(assessments.len());
        for new in assessments {
            created.push(self.create_assessment(new).await?);
        }
        log::info!("Seeded {} assessments", created.len());
        Ok(created)
    }

    async fn test_cases(&self, question_id: u64) -> Result<Vec<TestCase>> {
        let mut cases: Vec<TestCase> = self
            .store
            .select(&[("question_id", json!(question_id))])
            .await?;
        cases.sort_by_key(|c| c.order);
        Ok(cases)
    }

    /// Writes the lifecycle fields of `assessment` back to the store
    async fn save_lifecycle(&self, assessment: &Assessment) -> Result<Assessment> {
        self.store
            .patch::<Assessment>(
                assessment.id,
                json!({
                    "status": assessment.status,
                    "started_at": assessment.started_at,
                    "expires_at": assessment.expires_at,
                }),
            )
            .await?
            .ok_or(EngineError::NotFound("Assessment"))
    }
}
