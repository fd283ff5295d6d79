//! Piston adapter (remote code execution).
//!
//! Talks to the Piston v2 HTTP API: `GET /runtimes` for the language list and
//! `POST /execute` to run code. The service is shared and rate-limited, so 429
//! responses are retried with a fixed backoff.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::sleep;

use crb_core::{
    config::ExecutionLimits,
    domain::{CodeSubmission, ExecutionResult, SourceFile},
    errors::Error,
    execution::ExecutionBackend,
    ExecutionError, Result,
};

mod wire;

use wire::{ExecuteRequest, ExecuteResponse, Runtime, WireFile};

const ANY_VERSION: &str = "*";
const ERROR_BODY_PREVIEW: usize = 200;

pub struct PistonClient {
    limits: ExecutionLimits,
    http: reqwest::Client,
    languages: RwLock<Option<Arc<HashSet<String>>>>,
}

impl PistonClient {
    pub fn new(limits: ExecutionLimits) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(limits.http_timeout)
            .build()
            .map_err(|e| Error::External(format!("piston http client build failed: {e}")))?;
        Ok(Self {
            limits,
            http,
            languages: RwLock::new(None),
        })
    }

    /// Supported language names and aliases, lower-cased.
    ///
    /// Fetched once and kept for the life of the process. Concurrent first
    /// calls may fetch twice; the last one wins.
    pub async fn list_languages(&self) -> std::result::Result<Arc<HashSet<String>>, ExecutionError> {
        if let Some(cached) = self.cached_languages() {
            return Ok(cached);
        }

        let url = format!("{}/runtimes", self.limits.base_url);
        let resp = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExecutionError::RateLimited { attempts: 1 });
        }
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let runtimes: Vec<Runtime> = resp.json().await.map_err(transport_error)?;
        let langs: HashSet<String> = runtimes
            .into_iter()
            .flat_map(|rt| std::iter::once(rt.language).chain(rt.aliases))
            .map(|l| l.to_lowercase())
            .collect();
        tracing::info!(count = langs.len(), "fetched piston runtimes");

        let langs = Arc::new(langs);
        *self
            .languages
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(langs.clone());
        Ok(langs)
    }

    /// Drop the cached language list; the next lookup refetches it.
    pub fn invalidate_languages(&self) {
        *self
            .languages
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Run `files` as `language` with the given run timeout.
    pub async fn execute(
        &self,
        language: &str,
        files: &[SourceFile],
        run_timeout: Duration,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        let language = language.trim().to_lowercase();
        // Unknown languages are rejected before any execute call.
        if !self.list_languages().await?.contains(&language) {
            return Err(ExecutionError::UnknownLanguage { language });
        }

        let body = ExecuteRequest {
            language: &language,
            version: ANY_VERSION,
            files: files
                .iter()
                .map(|f| WireFile {
                    name: f.name.as_deref(),
                    content: &f.content,
                })
                .collect(),
            run_timeout: u64::try_from(run_timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let url = format!("{}/execute", self.limits.base_url);
        let retries = self.limits.rate_limit_retries;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let resp = self
                .authorized(self.http.post(&url))
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt > retries {
                    return Err(ExecutionError::RateLimited { attempts: attempt });
                }
                tracing::warn!(
                    attempt,
                    backoff_ms = self.limits.rate_limit_backoff.as_millis() as u64,
                    "piston rate limited, backing off"
                );
                sleep(self.limits.rate_limit_backoff).await;
                continue;
            }
            if !status.is_success() {
                return Err(status_error(resp).await);
            }

            let decoded: ExecuteResponse = resp.json().await.map_err(transport_error)?;
            let (language, stage) = decoded.reported_stage();
            return Ok(ExecutionResult {
                exit_signal: stage.signal.as_ref().and_then(|s| s.as_number()),
                exit_code: stage.code,
                stdout: stage.output,
                language,
            });
        }
    }

    fn cached_languages(&self) -> Option<Arc<HashSet<String>>> {
        self.languages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.limits.api_key {
            Some(key) => req.header(reqwest::header::AUTHORIZATION, key),
            None => req,
        }
    }
}

#[async_trait]
impl ExecutionBackend for PistonClient {
    fn name(&self) -> &'static str {
        "piston"
    }

    async fn languages(&self) -> std::result::Result<Arc<HashSet<String>>, ExecutionError> {
        self.list_languages().await
    }

    async fn execute(
        &self,
        submission: &CodeSubmission,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        PistonClient::execute(
            self,
            submission.language(),
            submission.files(),
            self.limits.run_timeout,
        )
        .await
    }
}

fn transport_error(e: reqwest::Error) -> ExecutionError {
    ExecutionError::RemoteExecutionError {
        status: e.status().map(|s| s.as_u16()),
        message: format!("piston request error: {e}"),
    }
}

async fn status_error(resp: reqwest::Response) -> ExecutionError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ExecutionError::RemoteExecutionError {
        status: Some(status.as_u16()),
        message: body.chars().take(ERROR_BODY_PREVIEW).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn runtimes() -> serde_json::Value {
        serde_json::json!([
            {"language": "python", "version": "3.10.0", "aliases": ["py", "py3", "python3"]},
            {"language": "javascript", "version": "18.15.0", "aliases": ["node-javascript", "js"]},
            {"language": "rust", "version": "1.68.2", "aliases": ["rs"]}
        ])
    }

    fn run_ok(stdout: &str) -> serde_json::Value {
        serde_json::json!({
            "language": "python",
            "version": "3.10.0",
            "run": {"stdout": stdout, "stderr": "", "output": stdout, "code": 0, "signal": null}
        })
    }

    async fn server_with_runtimes() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runtimes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(runtimes()))
            .mount(&server)
            .await;
        server
    }

    fn client(server: &MockServer, backoff: Duration) -> PistonClient {
        PistonClient::new(ExecutionLimits {
            base_url: server.uri(),
            rate_limit_backoff: backoff,
            ..ExecutionLimits::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lists_languages_with_aliases_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runtimes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(runtimes()))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let first = c.list_languages().await.unwrap();
        let second = c.list_languages().await.unwrap();

        assert_eq!(first, second);
        assert!(first.contains("py"));
        assert!(first.contains("javascript"));
        assert!(first.contains("rs"));
        server.verify().await;
    }

    #[tokio::test]
    async fn invalidation_refetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runtimes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(runtimes()))
            .expect(2)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        c.list_languages().await.unwrap();
        c.invalidate_languages();
        c.list_languages().await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn unknown_language_never_hits_execute() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(run_ok("")))
            .expect(0)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let err = c
            .execute("brainfudge", &[SourceFile::anonymous("+")], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownLanguage { .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn executes_case_insensitively() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(serde_json::json!({
                "language": "py",
                "version": "*",
                "run_timeout": 1000,
                "files": [{"name": "code", "content": "print('hi')"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(run_ok("hi\n")))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let result = c
            .execute(
                "PY",
                &[SourceFile::named("code", "print('hi')")],
                Duration::from_millis(1000),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.exit_signal, None);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.language, "python");
        server.verify().await;
    }

    #[tokio::test]
    async fn gives_up_after_five_retries() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(429))
            .expect(6)
            .mount(&server)
            .await;

        let backoff = Duration::from_millis(10);
        let c = client(&server, backoff);
        let started = Instant::now();
        let err = c
            .execute("python", &[SourceFile::anonymous("1")], Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::RateLimited { attempts: 6 }));
        assert!(started.elapsed() >= backoff * 5);
        server.verify().await;
    }

    #[tokio::test]
    async fn recovers_when_rate_limit_clears() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(run_ok("ok\n")))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let result = c
            .execute("python", &[SourceFile::anonymous("1")], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.stdout, "ok\n");
        server.verify().await;
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let err = c
            .execute("python", &[SourceFile::anonymous("1")], Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ExecutionError::RemoteExecutionError { status, message } => {
                assert_eq!(status, Some(500));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        server.verify().await;
    }

    #[tokio::test]
    async fn backend_uses_configured_run_timeout() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(serde_json::json!({"run_timeout": 1000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "language": "python",
                "version": "3.10.0",
                "run": {"output": "", "code": null, "signal": "SIGKILL"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let backend: &dyn ExecutionBackend = &c;
        let result = backend
            .execute(&CodeSubmission::single("python", "while True: pass"))
            .await
            .unwrap();
        assert_eq!(result.exit_signal, Some(9));
        assert_eq!(result.effective_status(), 9);
        server.verify().await;
    }

    #[tokio::test]
    async fn rate_limited_runtimes_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runtimes"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let err = c.list_languages().await.unwrap_err();
        assert!(matches!(err, ExecutionError::RateLimited { .. }));
        assert!(err.user_message("@bob").contains("try again later"));
        server.verify().await;
    }

    #[tokio::test]
    async fn undecodable_body_is_a_remote_error() {
        let server = server_with_runtimes().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, Duration::from_millis(1));
        let err = c
            .execute("python", &[SourceFile::anonymous("1")], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::RemoteExecutionError { .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn unreachable_service_is_a_remote_error() {
        let server = MockServer::start().await;
        let base_url = server.uri();
        drop(server);

        let c = PistonClient::new(ExecutionLimits {
            base_url,
            ..ExecutionLimits::default()
        })
        .unwrap();
        let err = c.list_languages().await.unwrap_err();
        match err {
            ExecutionError::RemoteExecutionError { status, .. } => assert_eq!(status, None),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
