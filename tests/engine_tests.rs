use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use assessd::config::{BackendKind, EngineConfig};
use assessd::engine::AssessmentEngine;
use assessd::error::EngineError;
use assessd::evaluator::HiddenCases;
use assessd::executor::Executor;
use assessd::language::Language;
use assessd::models::{
    Assessment, AssessmentStatus, NewAssessment, NewQuestion, NewTestCase, SubmissionStatus,
};
use assessd::sandbox::{ExecutionResult, SandboxBackend, SandboxError, SandboxRequest};
use assessd::store::Store;

const CORRECT: &str = "import json\nnums = json.loads(input())\n# solves two sum";
const WRONG: &str = "print('[9,9]')  # WRONG";
const BROKEN: &str = "int main() { COMPILE_ERROR }";

/// Answers Two Sum inputs from a table instead of running anything
struct ScriptedBackend {
    calls: AtomicUsize,
    answers: HashMap<&'static str, &'static str>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            answers: HashMap::from([
                ("[2,7,11,15]\n9", "[0,1]"),
                ("[3,2,4]\n6", "[1,2]"),
                ("[3,3]\n6", "[0,1]"),
            ]),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BareSubprocess
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let elapsed = Duration::from_millis(7);

        if request.source.contains("COMPILE_ERROR") {
            return Ok(ExecutionResult::compile_failure(
                "solution.cpp:1:14: error: 'COMPILE_ERROR' was not declared in this scope".into(),
                Some(1),
                elapsed,
            ));
        }
        let stdout = if request.source.contains("WRONG") {
            "[9,9]\n".to_string()
        } else {
            // Trailing newline on purpose: comparison must ignore it
            format!("{}\n", self.answers.get(request.input).unwrap_or(&""))
        };
        Ok(ExecutionResult::from_streams(stdout, String::new(), Some(0), elapsed))
    }
}

struct Fixture {
    engine: Arc<AssessmentEngine>,
    backend: Arc<ScriptedBackend>,
    _workspaces: TempDir,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let workspaces = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::new());
    let executor = Executor::new(backend.clone(), &config).with_workspace_root(workspaces.path());
    let engine = AssessmentEngine::new(Arc::new(Store::in_memory()), Arc::new(executor), &config);
    Fixture {
        engine: Arc::new(engine),
        backend,
        _workspaces: workspaces,
    }
}

fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

fn case(input: &str, expected_output: &str, is_sample: bool) -> NewTestCase {
    NewTestCase {
        input: input.to_string(),
        expected_output: expected_output.to_string(),
        is_sample,
    }
}

fn two_sum_assessment() -> NewAssessment {
    NewAssessment {
        title: "Screening".into(),
        description: String::new(),
        duration_minutes: 60,
        candidate_id: "cand-1".into(),
        questions: vec![
            NewQuestion {
                title: "Two Sum".into(),
                description: String::new(),
                time_limit_minutes: None,
                allowed_languages: vec![Language::Python, Language::Cpp],
                test_cases: vec![
                    case("[2,7,11,15]\n9", "[0,1]", true),
                    case("[3,2,4]\n6", "[1,2]", true),
                    case("[3,3]\n6", "[0,1]", false),
                ],
            },
            NewQuestion {
                title: "Empty".into(),
                description: String::new(),
                time_limit_minutes: None,
                allowed_languages: vec![Language::Python],
                test_cases: vec![],
            },
        ],
    }
}

/// Creates and starts the Two Sum assessment; returns its id and the question ids
async fn started(engine: &AssessmentEngine) -> (u64, u64, u64) {
    let assessment = engine.create_assessment(two_sum_assessment()).await.unwrap();
    engine.start_assessment(assessment.id, "cand-1").await.unwrap();
    let questions = engine.list_questions(assessment.id, "cand-1").await.unwrap();
    (assessment.id, questions[0].id, questions[1].id)
}

#[tokio::test]
async fn test_two_sum_sample_only_submission() {
    let f = fixture();
    let (a, q, _) = started(&f.engine).await;

    let view = f.engine.submit(a, q, "cand-1", "python", CORRECT).await.unwrap();
    let s = &view.submission;
    assert_eq!(s.status, SubmissionStatus::Completed);
    assert_eq!((s.sample_passed, s.sample_total), (2, 2));
    assert_eq!((s.hidden_passed, s.hidden_total), (0, 0));
    assert_eq!((s.passed_test_cases, s.total_test_cases), (2, 2));
    assert_eq!(s.execution_logs.as_deref(), Some("[1,2]"));
    assert_eq!(s.execution_time_ms, Some(7));
    assert_eq!(s.compilation_logs, None);

    assert_eq!(view.test_results.len(), 2);
    assert!(view.test_results.iter().all(|r| r.passed && r.is_sample));
    assert_eq!(view.test_results[0].actual_output.as_deref(), Some("[0,1]"));
    assert_eq!(f.backend.calls(), 2);
}

#[tokio::test]
async fn test_hidden_cases_graded_on_submit_stay_hidden() {
    let f = fixture_with(EngineConfig {
        grade_hidden_on_submit: true,
        ..EngineConfig::default()
    });
    let (a, q, _) = started(&f.engine).await;

    let view = f.engine.submit(a, q, "cand-1", "python", CORRECT).await.unwrap();
    assert_eq!(
        (view.submission.hidden_passed, view.submission.hidden_total),
        (1, 1)
    );

    let body = serde_json::to_value(&view).unwrap();
    let results = body["test_results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[2]["is_sample"], json!(false));
    assert_eq!(results[2]["passed"], json!(true));
    assert!(results[2].get("expected_output").is_none());
    assert!(results[2].get("actual_output").is_none());
    assert_eq!(results[0]["expected_output"], json!("[0,1]"));
}

#[tokio::test]
async fn test_hidden_reveal_is_explicit() {
    let f = fixture();
    let (_, q, _) = started(&f.engine).await;

    let graded = f
        .engine
        .evaluate(CORRECT, "python", q, HiddenCases::Grade)
        .await
        .unwrap();
    assert_eq!((graded.hidden_passed, graded.hidden_total), (1, 1));
    assert_eq!(graded.outcomes[2].expected_output, None);

    let revealed = f
        .engine
        .evaluate(CORRECT, "python", q, HiddenCases::Reveal)
        .await
        .unwrap();
    assert_eq!(revealed.outcomes[2].expected_output.as_deref(), Some("[0,1]"));
    assert_eq!(revealed.outcomes[2].actual_output.as_deref(), Some("[0,1]"));

    let skipped = f
        .engine
        .evaluate(CORRECT, "python", q, HiddenCases::Skip)
        .await
        .unwrap();
    assert_eq!(skipped.hidden_total, 0);
    assert_eq!(skipped.outcomes.len(), 2);
}

#[tokio::test]
async fn test_wrong_answer_fails_every_case() {
    let f = fixture();
    let (a, q, _) = started(&f.engine).await;

    let view = f.engine.submit(a, q, "cand-1", "python", WRONG).await.unwrap();
    assert_eq!(view.submission.sample_passed, 0);
    assert!(view.test_results.iter().all(|r| !r.passed));
    assert_eq!(view.test_results[1].actual_output.as_deref(), Some("[9,9]"));
    assert_eq!(view.test_results[1].expected_output.as_deref(), Some("[1,2]"));
}

#[tokio::test]
async fn test_disallowed_language_never_reaches_backend() {
    let f = fixture();
    let (a, _, empty_q) = started(&f.engine).await;

    let err = f
        .engine
        .submit(a, empty_q, "cand-1", "cpp", "int main() {}")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LanguageNotAllowed(ref l) if l == "cpp"));

    let err = f
        .engine
        .submit(a, empty_q, "cand-1", "cobol", "DISPLAY 'HI'.")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedLanguage(_)));

    assert_eq!(f.backend.calls(), 0);
}

#[tokio::test]
async fn test_question_without_cases_is_rejected() {
    let f = fixture();
    let (a, _, empty_q) = started(&f.engine).await;

    let err = f
        .engine
        .submit(a, empty_q, "cand-1", "python", CORRECT)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoTestCases));
    assert_eq!(f.backend.calls(), 0);
}

#[tokio::test]
async fn test_compile_failure_short_circuits() {
    let f = fixture_with(EngineConfig {
        grade_hidden_on_submit: true,
        ..EngineConfig::default()
    });
    let (a, q, _) = started(&f.engine).await;

    let view = f.engine.submit(a, q, "cand-1", "cpp", BROKEN).await.unwrap();
    assert_eq!(view.test_results.len(), 3);
    for result in &view.test_results {
        assert!(!result.passed);
        assert_eq!(result.actual_output, None);
        assert!(result.error.as_deref().unwrap().contains("error:"));
    }

    let logs = view.submission.compilation_logs.unwrap();
    assert!(logs.starts_with("[test case "));
    assert!(logs.contains("was not declared"));
    assert_eq!(logs.matches("[test case ").count(), 1);

    // Compiled once, not once per case
    assert_eq!(f.backend.calls(), 1);
}

#[tokio::test]
async fn test_double_start_keeps_first_start_time() {
    let f = fixture();
    let assessment = f.engine.create_assessment(two_sum_assessment()).await.unwrap();
    assert_eq!(assessment.status, AssessmentStatus::NotStarted);

    let first = f.engine.start_assessment(assessment.id, "cand-1").await.unwrap();
    assert_eq!(first.status, AssessmentStatus::InProgress);
    assert!(first.expires_at.unwrap() > first.started_at.unwrap());

    let err = f
        .engine
        .start_assessment(assessment.id, "cand-1")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyStarted));

    let stored = f.engine.get_assessment(assessment.id, "cand-1").await.unwrap();
    assert_eq!(stored.started_at, first.started_at);
}

#[tokio::test]
async fn test_expiry_blocks_submission_but_not_reading() {
    let f = fixture();
    let (a, q, _) = started(&f.engine).await;

    f.engine
        .store()
        .patch::<Assessment>(
            a,
            json!({ "expires_at": Utc::now() - chrono::Duration::minutes(1) }),
        )
        .await
        .unwrap();

    let err = f.engine.submit(a, q, "cand-1", "python", CORRECT).await.unwrap_err();
    assert!(matches!(err, EngineError::Expired));
    assert_eq!(f.backend.calls(), 0);

    let stored = f.engine.get_assessment(a, "cand-1").await.unwrap();
    assert_eq!(stored.status, AssessmentStatus::Expired);

    let questions = f.engine.list_questions(a, "cand-1").await.unwrap();
    assert_eq!(questions.len(), 2);

    let err = f.engine.submit(a, q, "cand-1", "python", CORRECT).await.unwrap_err();
    assert!(matches!(err, EngineError::NotActive));
}

#[tokio::test]
async fn test_submission_before_start_is_refused() {
    let f = fixture();
    let assessment = f.engine.create_assessment(two_sum_assessment()).await.unwrap();
    let questions = f.engine.list_questions(assessment.id, "cand-1").await.unwrap();

    let err = f
        .engine
        .submit(assessment.id, questions[0].id, "cand-1", "python", CORRECT)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotActive));
}

#[tokio::test]
async fn test_other_candidate_sees_nothing() {
    let f = fixture();
    let (a, q, _) = started(&f.engine).await;

    let err = f.engine.get_assessment(a, "cand-2").await.unwrap_err();
    assert_eq!(err.to_string(), "Assessment not found");
    let missing = f.engine.get_assessment(a + 100, "cand-1").await.unwrap_err();
    assert_eq!(missing.to_string(), err.to_string());

    assert!(matches!(
        f.engine.list_questions(a, "cand-2").await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        f.engine.submit(a, q, "cand-2", "python", CORRECT).await,
        Err(EngineError::NotFound(_))
    ));

    // A question of another assessment is not reachable through this one
    let other = f.engine.create_assessment(two_sum_assessment()).await.unwrap();
    let foreign = f.engine.list_questions(other.id, "cand-1").await.unwrap()[0].id;
    assert!(matches!(
        f.engine.submit(a, foreign, "cand-1", "python", CORRECT).await,
        Err(EngineError::NotFound("Question"))
    ));
}

#[tokio::test]
async fn test_questions_expose_samples_in_order() {
    let f = fixture();
    let assessment = f.engine.create_assessment(two_sum_assessment()).await.unwrap();
    let questions = f.engine.list_questions(assessment.id, "cand-1").await.unwrap();

    assert_eq!(questions[0].title, "Two Sum");
    assert_eq!(questions[0].order, 1);
    assert_eq!(questions[1].order, 2);
    let inputs: Vec<_> = questions[0]
        .sample_test_cases
        .iter()
        .map(|c| c.input.as_str())
        .collect();
    assert_eq!(inputs, vec!["[2,7,11,15]\n9", "[3,2,4]\n6"]);
}

#[tokio::test]
async fn test_code_length_is_checked_first() {
    let f = fixture_with(EngineConfig {
        max_code_length: 10,
        ..EngineConfig::default()
    });

    let err = f
        .engine
        .run_adhoc(&"x".repeat(11), "cobol", "")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CodeTooLong { len: 11, max: 10 }));

    let result = f.engine.run_adhoc("print(1)", "python", "[3,3]\n6").await.unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "[0,1]");
    assert_eq!(f.backend.calls(), 1);
}

#[tokio::test]
async fn test_invalid_assessment_is_rejected() {
    let f = fixture();
    let mut new = two_sum_assessment();
    new.duration_minutes = 0;
    assert!(matches!(
        f.engine.create_assessment(new).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn test_seed_file_loads() {
    let f = fixture();
    let file = std::fs::File::open("data/seed.json").unwrap();
    let seed: assessd::models::Seed = serde_json::from_reader(file).unwrap();
    let created = f.engine.seed(seed.assessments).await.unwrap();
    assert_eq!(created.len(), 1);

    let questions = f
        .engine
        .list_questions(created[0].id, &created[0].candidate_id)
        .await
        .unwrap();
    assert_eq!(questions[0].title, "Two Sum");
    assert_eq!(questions[0].sample_test_cases.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_admit_exactly_one() {
    let f = fixture();
    let assessment = f.engine.create_assessment(two_sum_assessment()).await.unwrap();
    let id = assessment.id;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.start_assessment(id, "cand-1").await })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(started) => winners.push(started),
            Err(e) => assert!(matches!(e, EngineError::AlreadyStarted), "{e:?}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = f.engine.get_assessment(id, "cand-1").await.unwrap();
    assert_eq!(stored.status, AssessmentStatus::InProgress);
    assert_eq!(stored.started_at, winners[0].started_at);
    assert_eq!(stored.expires_at, winners[0].expires_at);
}

/// Echoes its input after a delay that shrinks with the input number, and
/// records how many runs overlap
#[derive(Default)]
struct DelayedBackend {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl SandboxBackend for DelayedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BareSubprocess
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let n: u64 = request.input.trim().parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(20 * (8 - n))).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionResult::from_streams(
            request.input.to_string(),
            String::new(),
            Some(0),
            Duration::from_millis(1),
        ))
    }
}

#[tokio::test]
async fn test_cases_run_bounded_and_report_in_order() {
    let workspaces = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        max_concurrent_executions: 2,
        ..EngineConfig::default()
    };
    let backend = Arc::new(DelayedBackend::default());
    let executor = Executor::new(backend.clone(), &config).with_workspace_root(workspaces.path());
    let engine = AssessmentEngine::new(Arc::new(Store::in_memory()), Arc::new(executor), &config);

    let mut new = two_sum_assessment();
    new.questions[0].test_cases = (1..=6)
        .map(|n| case(&n.to_string(), &n.to_string(), n <= 2))
        .collect();
    let assessment = engine.create_assessment(new).await.unwrap();
    let questions = engine.list_questions(assessment.id, "cand-1").await.unwrap();

    let evaluation = engine
        .evaluate("print(input())", "python", questions[0].id, HiddenCases::Reveal)
        .await
        .unwrap();

    let orders: Vec<_> = evaluation.outcomes.iter().map(|o| o.order).collect();
    assert_eq!(orders, vec![1, 2, 3, 4, 5, 6]);
    let outputs: Vec<_> = evaluation
        .outcomes
        .iter()
        .map(|o| o.actual_output.clone().unwrap())
        .collect();
    assert_eq!(outputs, vec!["1", "2", "3", "4", "5", "6"]);
    assert!(evaluation.outcomes.iter().all(|o| o.passed));
    assert_eq!(evaluation.passed(), 6);

    // Slower early cases overlap with later ones, but never beyond the limit
    assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
}
