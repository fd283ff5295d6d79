use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;

use crb_core::{
    config::{FormatLimits, SandboxLimits},
    domain::{CodeSubmission, ExecutionResult},
    errors::ExecutionError,
    execution::{ExecutionBackend, ExecutionSwitch},
    formatting::{format_sandbox_result, FormattedOutput},
};

use crate::process::ProcessSandbox;

const LANGUAGES: [&str; 3] = ["python", "python3", "py"];

/// Legacy mode: run Python submissions in a local hardened interpreter.
#[derive(Debug)]
pub struct LocalBackend {
    sandbox: ProcessSandbox,
    switch: Arc<ExecutionSwitch>,
    languages: Arc<HashSet<String>>,
}

impl LocalBackend {
    pub fn new(limits: SandboxLimits, switch: Arc<ExecutionSwitch>) -> Self {
        Self {
            sandbox: ProcessSandbox::new(limits),
            switch,
            languages: Arc::new(LANGUAGES.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn languages(&self) -> Result<Arc<HashSet<String>>, ExecutionError> {
        Ok(self.languages.clone())
    }

    async fn execute(
        &self,
        submission: &CodeSubmission,
    ) -> Result<ExecutionResult, ExecutionError> {
        let language = submission.language().to_lowercase();
        if !self.languages.contains(&language) {
            return Err(ExecutionError::UnknownLanguage {
                language: submission.language().to_string(),
            });
        }

        let token = self.switch.run_token();
        let outcome = self
            .sandbox
            .run(&submission.joined_source(), &token)
            .await?;
        tracing::info!(state = ?outcome.state, status = outcome.status, "local run finished");
        Ok(outcome.into_result(&language))
    }

    fn render(
        &self,
        result: &ExecutionResult,
        mention: &str,
        limits: &FormatLimits,
    ) -> FormattedOutput {
        format_sandbox_result(result, mention, limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crb_core::config::find_interpreter;

    #[tokio::test]
    async fn rejects_other_languages() {
        let backend = LocalBackend::new(SandboxLimits::default(), Arc::new(ExecutionSwitch::new(true)));
        let err = backend
            .execute(&CodeSubmission::single("rust", "fn main() {}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownLanguage { .. }));
        assert!(backend.languages().await.unwrap().contains("py"));
    }

    #[tokio::test]
    async fn runs_python_and_renders_sandbox_wording() {
        let Some(python) = find_interpreter("python3") else {
            return;
        };
        let limits = SandboxLimits {
            python_path: python,
            ..SandboxLimits::default()
        };
        let backend = LocalBackend::new(limits, Arc::new(ExecutionSwitch::new(true)));
        let result = backend
            .execute(&CodeSubmission::single("Py", "print('hi')"))
            .await
            .unwrap();
        assert_eq!(result.effective_status(), 0);
        assert_eq!(result.stdout, "hi\n");

        let rendered = backend.render(&result, "@bob", &FormatLimits::default());
        assert!(rendered.as_str().starts_with("@bob"));
        assert!(rendered.as_str().contains("001 | hi"));
    }

    #[tokio::test]
    async fn disabling_execution_cancels_running_code() {
        let Some(python) = find_interpreter("python3") else {
            return;
        };
        let limits = SandboxLimits {
            python_path: python,
            ..SandboxLimits::default()
        };
        let switch = Arc::new(ExecutionSwitch::new(true));
        let backend = LocalBackend::new(limits, switch.clone());

        let toggler = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            switch.set_enabled(false);
        });
        let result = backend
            .execute(&CodeSubmission::single("python", "while True: pass"))
            .await
            .unwrap();
        toggler.await.unwrap();

        assert_eq!(result.effective_status(), 15);
    }
}
