use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, RemoteConfig};
use crate::limits::ResourceLimits;

use super::capture::truncate_utf8;
use super::{ExecutionResult, SandboxBackend, SandboxError, SandboxRequest};

/// Slack on top of the remote timeouts before we give up on the request
const REQUEST_GRACE: Duration = Duration::from_secs(10);

/// Delegates execution to a Piston v2 compatible service
pub struct RemoteBackend {
    client: reqwest::Client,
    config: RemoteConfig,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<SourceFile<'a>>,
    stdin: &'a str,
    compile_timeout: u64,
    run_timeout: u64,
    /// Bytes, -1 for no limit
    run_memory_limit: i64,
}

#[derive(Debug, Serialize)]
struct SourceFile<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    run: StageOutput,
    compile: Option<StageOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct StageOutput {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    code: Option<i32>,
    signal: Option<String>,
    /// Newer Piston versions report `TO` for a timed out stage
    status: Option<String>,
}

impl StageOutput {
    fn timed_out(&self) -> bool {
        self.status.as_deref() == Some("TO")
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Result<Self, SandboxError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = reqwest::header::HeaderValue::from_str(key)
                .map_err(|_| SandboxError::Protocol("API key is not a valid header value".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn version_for(&self, request: &SandboxRequest<'_>) -> &str {
        self.config
            .language_versions
            .get(&request.plan.language)
            .map(String::as_str)
            .unwrap_or("*")
    }

    fn classify(&self, e: reqwest::Error) -> SandboxError {
        if e.is_connect() {
            SandboxError::Unavailable(format!(
                "Remote execution service at {} is unreachable ({e}). \
                 Check `remote.base_url` and that the service is running.",
                self.config.base_url
            ))
        } else {
            SandboxError::Remote(e)
        }
    }
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteService
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        let response = self
            .client
            .get(self.url("runtimes"))
            .timeout(REQUEST_GRACE)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        if !response.status().is_success() {
            return Err(SandboxError::Unavailable(format!(
                "Remote execution service answered {} to a runtime listing",
                response.status()
            )));
        }
        Ok(())
    }

    async fn run(&self, request: SandboxRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        let limits = request.limits;
        let body = ExecuteRequest {
            language: request.plan.language.remote_name(),
            version: self.version_for(&request),
            files: vec![SourceFile {
                name: &request.plan.source_file,
                content: request.source,
            }],
            stdin: request.input,
            compile_timeout: limits.compile_wall_clock.as_millis() as u64,
            run_timeout: limits.wall_clock.as_millis() as u64,
            run_memory_limit: limits.memory_bytes.map_or(-1, |b| b as i64),
        };

        let start_time = Instant::now();
        let sent = self
            .client
            .post(self.url("execute"))
            .json(&body)
            .timeout(limits.compile_wall_clock + limits.wall_clock + REQUEST_GRACE)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(ExecutionResult::timed_out(
                    limits.wall_clock,
                    String::new(),
                    String::new(),
                    start_time.elapsed(),
                ));
            }
            Err(e) => return Err(self.classify(e)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(SandboxError::Protocol(format!(
                "remote service rejected the request: {message}"
            )));
        }

        let parsed: ExecuteResponse = response.json().await?;
        Ok(normalize(parsed, limits, start_time.elapsed()))
    }
}

/// Folds the separate compile and run stages into one result, compile
/// diagnostics ahead of run stderr
fn normalize(response: ExecuteResponse, limits: &ResourceLimits, elapsed: Duration) -> ExecutionResult {
    let max = limits.max_output_bytes;
    let compile = response.compile.unwrap_or_default();

    if compile.timed_out() {
        let mut result = ExecutionResult::compile_failure(truncate_utf8(compile.stderr, max), None, elapsed);
        result.timed_out = true;
        result.error = Some(format!(
            "Compilation timeout after {} ms",
            limits.compile_wall_clock.as_millis()
        ));
        return result;
    }
    if compile.code.is_some_and(|code| code != 0) {
        let log = if compile.stderr.trim().is_empty() {
            compile.stdout
        } else {
            compile.stderr
        };
        return ExecutionResult::compile_failure(truncate_utf8(log, max), compile.code, elapsed);
    }

    let run = response.run;
    let run_timed_out = run.timed_out();
    let stdout = truncate_utf8(run.stdout, max);
    let stderr = if compile.stderr.trim().is_empty() {
        run.stderr
    } else {
        format!("{}\n{}", compile.stderr, run.stderr).trim().to_string()
    };
    let stderr = truncate_utf8(stderr, max);

    if run_timed_out {
        return ExecutionResult::timed_out(limits.wall_clock, stdout, stderr, elapsed);
    }

    // Piston leaves `code` empty when the run was killed by a signal
    let code = run.code.or_else(|| run.signal.as_deref().map(|_| 137));
    ExecutionResult::from_streams(stdout, stderr, code, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn limits() -> ResourceLimits {
        ResourceLimits::from_config(&EngineConfig::default())
    }

    fn parse(body: &str) -> ExecuteResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_run_stage_only() {
        let response = parse(
            r#"{"language":"python","version":"3.10.0",
                "run":{"stdout":"hello\n","stderr":"","code":0,"signal":null,"output":"hello\n"}}"#,
        );
        let result = normalize(response, &limits(), Duration::from_millis(40));
        assert!(result.success);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.return_code, Some(0));
    }

    #[test]
    fn test_compile_error_short_circuits() {
        let response = parse(
            r#"{"language":"c++","version":"10.2.0",
                "compile":{"stdout":"","stderr":"file0.code: error: expected ';'","code":1,"signal":null},
                "run":{"stdout":"","stderr":"","code":null,"signal":null}}"#,
        );
        let result = normalize(response, &limits(), Duration::from_millis(40));
        assert!(result.compile_failed);
        assert_eq!(result.error.as_deref(), Some("file0.code: error: expected ';'"));
    }

    #[test]
    fn test_compile_warnings_precede_run_stderr() {
        let response = parse(
            r#"{"compile":{"stdout":"","stderr":"warning: unused variable","code":0},
                "run":{"stdout":"","stderr":"boom","code":1}}"#,
        );
        let result = normalize(response, &limits(), Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.stderr, "warning: unused variable\nboom");
    }

    #[test]
    fn test_remote_timeout_status() {
        let response = parse(
            r#"{"run":{"stdout":"partial","stderr":"","code":null,"signal":"SIGKILL","status":"TO"}}"#,
        );
        let result = normalize(response, &limits(), Duration::ZERO);
        assert!(result.timed_out);
        assert_eq!(result.stdout, "partial");
        assert!(result.error.unwrap().contains("10000"));
    }

    #[test]
    fn test_request_shape() {
        let body = ExecuteRequest {
            language: "c++",
            version: "*",
            files: vec![SourceFile {
                name: "solution.cpp",
                content: "int main(){}",
            }],
            stdin: "",
            compile_timeout: 20000,
            run_timeout: 10000,
            run_memory_limit: -1,
        };
        let expected = serde_json::json!({
            "language": "c++",
            "version": "*",
            "files": [{"name": "solution.cpp", "content": "int main(){}"}],
            "stdin": "",
            "compile_timeout": 20000,
            "run_timeout": 10000,
            "run_memory_limit": -1,
        });
        assert_json_diff::assert_json_eq!(serde_json::to_value(&body).unwrap(), expected);
    }
}
