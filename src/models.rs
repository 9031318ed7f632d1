use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::language::Language;

/// A record kept in one table of the record store
pub trait Record: Serialize + DeserializeOwned + Send {
    const TABLE: &'static str;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    NotStarted,
    InProgress,
    Completed,
    Expired,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Assessment {
    #[serde(default)]
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_minutes: u32,
    pub candidate_id: String,
    pub status: AssessmentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Record for Assessment {
    const TABLE: &'static str = "assessments";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Question {
    #[serde(default)]
    pub id: u64,
    pub assessment_id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub order: u32,
    pub time_limit_minutes: Option<u32>,
    /// Empty means every supported language
    #[serde(default)]
    pub allowed_languages: Vec<Language>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Question {
    pub fn allows(&self, language: Language) -> bool {
        self.allowed_languages.is_empty() || self.allowed_languages.contains(&language)
    }
}

impl Record for Question {
    const TABLE: &'static str = "questions";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestCase {
    #[serde(default)]
    pub id: u64,
    pub question_id: u64,
    pub input: String,
    pub expected_output: String,
    pub is_sample: bool,
    pub order: u32,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Record for TestCase {
    const TABLE: &'static str = "test_cases";
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Running,
    Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Submission {
    #[serde(default)]
    pub id: u64,
    pub assessment_id: u64,
    pub question_id: u64,
    pub candidate_id: String,
    pub language: Language,
    pub code: String,
    pub status: SubmissionStatus,
    pub sample_passed: u32,
    pub sample_total: u32,
    pub hidden_passed: u32,
    pub hidden_total: u32,
    pub passed_test_cases: u32,
    pub total_test_cases: u32,
    pub compilation_logs: Option<String>,
    /// Output of the last executed test case
    pub execution_logs: Option<String>,
    /// Execution time of the first test case
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Record for Submission {
    const TABLE: &'static str = "submissions";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    #[serde(default)]
    pub id: u64,
    pub submission_id: u64,
    pub test_case_id: u64,
    pub is_sample: bool,
    pub order: u32,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Record for TestResult {
    const TABLE: &'static str = "test_results";
}

/// Sample test case as shown to the candidate
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SampleCaseView {
    pub id: u64,
    pub input: String,
    pub expected_output: String,
    pub order: u32,
}

/// Question as shown to the candidate: hidden test cases are never part of it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QuestionView {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub order: u32,
    pub time_limit_minutes: Option<u32>,
    pub allowed_languages: Vec<Language>,
    pub sample_test_cases: Vec<SampleCaseView>,
}

impl QuestionView {
    pub fn new(question: Question, cases: &[TestCase]) -> Self {
        let mut sample_test_cases: Vec<_> = cases
            .iter()
            .filter(|c| c.is_sample && c.question_id == question.id)
            .map(|c| SampleCaseView {
                id: c.id,
                input: c.input.clone(),
                expected_output: c.expected_output.clone(),
                order: c.order,
            })
            .collect();
        sample_test_cases.sort_by_key(|c| c.order);

        let allowed_languages = if question.allowed_languages.is_empty() {
            Language::ALL.to_vec()
        } else {
            question.allowed_languages
        };

        Self {
            id: question.id,
            title: question.title,
            description: question.description,
            order: question.order,
            time_limit_minutes: question.time_limit_minutes,
            allowed_languages,
            sample_test_cases,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmissionView {
    #[serde(flatten)]
    pub submission: Submission,
    pub test_results: Vec<TestResult>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewTestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_sample: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewQuestion {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub time_limit_minutes: Option<u32>,
    #[serde(default)]
    pub allowed_languages: Vec<Language>,
    #[serde(default)]
    pub test_cases: Vec<NewTestCase>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NewAssessment {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_minutes: u32,
    pub candidate_id: String,
    #[serde(default)]
    pub questions: Vec<NewQuestion>,
}

/// Demo data loaded at boot with `--seed`
#[derive(Deserialize, Debug, Clone)]
pub struct Seed {
    pub assessments: Vec<NewAssessment>,
}
