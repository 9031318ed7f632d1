use std::sync::Arc;

use futures_util::future::join_all;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::language::Language;
use crate::models::{Question, TestCase};
use crate::sandbox::ExecutionResult;

/// Words in error text that mark it as worth collecting into the compile log
const ERROR_INDICATORS: [&str; 3] = ["error", "exception", "traceback"];

/// What to do with a question's hidden test cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenCases {
    /// Run sample cases only
    Skip,
    /// Run hidden cases and count them, but reveal nothing about them
    Grade,
    /// Run hidden cases and include their outputs; privileged callers only
    Reveal,
}

impl HiddenCases {
    fn runs_hidden(self) -> bool {
        self != Self::Skip
    }
}

/// Result of one test case, already filtered for visibility
#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutcome {
    pub test_case_id: u64,
    pub is_sample: bool,
    pub order: u32,
    pub passed: bool,
    pub actual_output: Option<String>,
    pub expected_output: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// In test case order
    pub outcomes: Vec<CaseOutcome>,
    pub compilation_logs: Option<String>,
    pub sample_passed: u32,
    pub sample_total: u32,
    pub hidden_passed: u32,
    pub hidden_total: u32,
    /// Raw stdout of the last case that ran
    pub last_output: Option<String>,
    /// Execution time of the first case that ran
    pub first_execution_time_ms: Option<u64>,
}

impl Evaluation {
    pub fn passed(&self) -> u32 {
        self.sample_passed + self.hidden_passed
    }

    pub fn total(&self) -> u32 {
        self.sample_total + self.hidden_total
    }
}

pub struct Evaluator {
    executor: Arc<Executor>,
}

impl Evaluator {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    /// Runs `code` against the question's test cases.
    ///
    /// The language is checked before anything runs. The first case runs
    /// alone: if it fails to compile, every other case is failed with the same
    /// diagnostics instead of being compiled again. The rest run concurrently,
    /// bounded by the executor.
    pub async fn evaluate(
        &self,
        code: &str,
        language: Language,
        question: &Question,
        cases: &[TestCase],
        hidden: HiddenCases,
    ) -> Result<Evaluation, EngineError> {
        if !question.allows(language) {
            return Err(EngineError::LanguageNotAllowed(language.to_string()));
        }

        let mut selected: Vec<&TestCase> = cases
            .iter()
            .filter(|c| c.is_sample || hidden.runs_hidden())
            .collect();
        selected.sort_by_key(|c| c.order);

        let Some((first, rest)) = selected.split_first() else {
            return Ok(Evaluation::default());
        };

        let first_result = self.executor.execute(code, language, &first.input).await?;
        let mut results = vec![first_result];

        if results[0].compile_failed {
            log::debug!(
                "Question {}: compilation failed, skipping {} remaining cases",
                question.id,
                rest.len()
            );
            let failed = results[0].clone();
            results.extend(rest.iter().map(|_| failed.clone()));
        } else {
            let runs = rest
                .iter()
                .map(|case| self.executor.execute(code, language, &case.input));
            for result in join_all(runs).await {
                results.push(result?);
            }
        }

        let mut evaluation = Evaluation::default();
        let mut compile_logs = Vec::new();
        let compile_failed = results[0].compile_failed;

        for (index, (case, result)) in selected.iter().zip(results).enumerate() {
            log::debug!(
                "Test case {} finished in {} ms (success: {})",
                case.id,
                result.execution_time_ms,
                result.success
            );

            // A shared compile failure is logged once, under the first case
            if let Some(error) = &result.error {
                if (!compile_failed || index == 0) && has_error_indicator(error) {
                    compile_logs.push(format!("[test case {}]\n{}", case.id, error));
                }
            }

            let outcome = judge(case, &result, hidden);
            if case.is_sample {
                evaluation.sample_total += 1;
                evaluation.sample_passed += u32::from(outcome.passed);
            } else {
                evaluation.hidden_total += 1;
                evaluation.hidden_passed += u32::from(outcome.passed);
            }
            if evaluation.first_execution_time_ms.is_none() {
                evaluation.first_execution_time_ms = Some(result.execution_time_ms);
            }
            evaluation.last_output = Some(result.stdout);
            evaluation.outcomes.push(outcome);
        }

        if !compile_logs.is_empty() {
            evaluation.compilation_logs = Some(compile_logs.join("\n\n"));
        }
        Ok(evaluation)
    }
}

fn has_error_indicator(text: &str) -> bool {
    let lowered = text.to_lowercase();
    ERROR_INDICATORS.iter().any(|w| lowered.contains(w))
}

/// Output comparison ignores leading and trailing whitespace on both sides
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

fn judge(case: &TestCase, result: &ExecutionResult, hidden: HiddenCases) -> CaseOutcome {
    let ran = !result.compile_failed && !result.timed_out;
    let passed = ran && outputs_match(&result.stdout, &case.expected_output);
    let visible = case.is_sample || hidden == HiddenCases::Reveal;

    CaseOutcome {
        test_case_id: case.id,
        is_sample: case.is_sample,
        order: case.order,
        passed,
        actual_output: (visible && !result.compile_failed).then(|| result.stdout.trim().to_string()),
        expected_output: visible.then(|| case.expected_output.clone()),
        error: if passed { None } else { result.error.clone() },
        execution_time_ms: result.execution_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(id: u64, is_sample: bool, expected: &str) -> TestCase {
        TestCase {
            id,
            question_id: 1,
            input: String::new(),
            expected_output: expected.to_string(),
            is_sample,
            order: id as u32,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn ran(stdout: &str) -> ExecutionResult {
        ExecutionResult::from_streams(stdout.to_string(), String::new(), Some(0), Default::default())
    }

    #[test]
    fn test_trailing_newline_is_ignored() {
        assert!(outputs_match("[0, 1]\n", "[0, 1]"));
        assert!(outputs_match("  42 ", "42\n"));
        assert!(!outputs_match("[0,1]", "[0, 1]"));
    }

    #[test]
    fn test_hidden_outputs_stay_hidden_unless_revealed() {
        let hidden = case(3, false, "[0,1]");
        let result = ran("[0,1]\n");

        let graded = judge(&hidden, &result, HiddenCases::Grade);
        assert!(graded.passed);
        assert_eq!(graded.actual_output, None);
        assert_eq!(graded.expected_output, None);

        let revealed = judge(&hidden, &result, HiddenCases::Reveal);
        assert_eq!(revealed.actual_output.as_deref(), Some("[0,1]"));
        assert_eq!(revealed.expected_output.as_deref(), Some("[0,1]"));

        let sample = judge(&case(1, true, "x"), &ran("y"), HiddenCases::Skip);
        assert!(!sample.passed);
        assert_eq!(sample.actual_output.as_deref(), Some("y"));
        assert_eq!(sample.expected_output.as_deref(), Some("x"));
    }

    #[test]
    fn test_compile_failure_never_passes() {
        let result = ExecutionResult::compile_failure(
            "error: expected ';'".into(),
            Some(1),
            Default::default(),
        );
        let outcome = judge(&case(1, true, ""), &result, HiddenCases::Skip);
        assert!(!outcome.passed);
        assert_eq!(outcome.actual_output, None);
        assert_eq!(outcome.error.as_deref(), Some("error: expected ';'"));
    }

    #[test]
    fn test_error_indicators() {
        assert!(has_error_indicator("Traceback (most recent call last)"));
        assert!(has_error_indicator("Exception in thread \"main\""));
        assert!(!has_error_indicator("Process exited with code 3"));
    }
}
