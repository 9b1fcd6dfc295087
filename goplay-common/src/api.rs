//! HTTP wire types

use serde::{Deserialize, Serialize};

/// Form body of `POST /run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunForm {
    pub code: String,
}

/// Query string of `POST /compile`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileQuery {
    /// tinygo target, `wasm` or `wasi`
    pub target: Option<String>,
}

/// JSON body returned by `POST /run`
///
/// `output` and `error` keep the field names the browser client reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub output: String,
    pub error: String,
    /// `ok`, `nonzero-exit`, `timeout`, `output-too-large`, `internal-error`,
    /// `validation` or `capacity`
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl RunResponse {
    pub fn rejected(status: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            status: status.into(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// JSON body returned by `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub capacity: usize,
    pub in_use: usize,
}
