//! Piston v2 request/response bodies.

use std::str::FromStr;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub(crate) struct Runtime {
    pub language: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExecuteRequest<'a> {
    pub language: &'a str,
    pub version: &'a str,
    pub files: Vec<WireFile<'a>>,
    pub run_timeout: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireFile<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    pub content: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecuteResponse {
    pub language: String,
    #[serde(default)]
    pub run: Option<Stage>,
    #[serde(default)]
    pub compile: Option<Stage>,
}

impl ExecuteResponse {
    /// The stage whose outcome is reported: run, or compile when the program
    /// never got to run.
    pub fn reported_stage(self) -> (String, Stage) {
        let stage = self.run.or(self.compile).unwrap_or_default();
        (self.language, stage)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Stage {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub signal: Option<SignalField>,
}

/// Piston reports signals by name; some deployments send the number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum SignalField {
    Number(i32),
    Name(String),
}

impl SignalField {
    pub fn as_number(&self) -> Option<i32> {
        match self {
            SignalField::Number(n) => Some(*n),
            SignalField::Name(name) => Signal::from_str(name.trim())
                .ok()
                .map(|s| s as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_and_numeric_signals() {
        let body = r#"{"language":"c","version":"10.2.0",
            "run":{"stdout":"","stderr":"","output":"","code":null,"signal":"SIGKILL"}}"#;
        let resp: ExecuteResponse = serde_json::from_str(body).unwrap();
        let (lang, stage) = resp.reported_stage();
        assert_eq!(lang, "c");
        assert_eq!(stage.signal.and_then(|s| s.as_number()), Some(9));

        let body = r#"{"language":"c","version":"1","run":{"output":"x","code":0,"signal":11}}"#;
        let resp: ExecuteResponse = serde_json::from_str(body).unwrap();
        let (_, stage) = resp.reported_stage();
        assert_eq!(stage.signal.and_then(|s| s.as_number()), Some(11));
    }

    #[test]
    fn falls_back_to_compile_stage() {
        let body = r#"{"language":"rust","version":"1.68.2",
            "compile":{"output":"error[E0425]","code":1,"signal":null}}"#;
        let resp: ExecuteResponse = serde_json::from_str(body).unwrap();
        let (_, stage) = resp.reported_stage();
        assert_eq!(stage.code, Some(1));
        assert_eq!(stage.output, "error[E0425]");
    }

    #[test]
    fn omits_missing_file_names() {
        let req = ExecuteRequest {
            language: "python",
            version: "*",
            files: vec![WireFile {
                name: None,
                content: "print(1)",
            }],
            run_timeout: 1000,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "language": "python",
                "version": "*",
                "files": [{"content": "print(1)"}],
                "run_timeout": 1000
            })
        );
    }
}
