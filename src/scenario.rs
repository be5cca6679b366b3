//! Load tests described in a JSON file.
//!
//! A scenario file lets the `hatchling` binary run a load test without writing any
//! Rust. It names the host, an optional [`AuthFlow`], and the tasks to run:
//!
//! ```json
//! {
//!   "host": "http://127.0.0.1:3000",
//!   "auth": {},
//!   "tasks": [
//!     {"label": "read", "weight": 7, "method": "GET", "path": "/dashboard", "requires_auth": true},
//!     {"label": "write", "weight": 3, "method": "POST", "path": "/quizzes", "body": {"title": "Quiz"}}
//!   ]
//! }
//! ```
//!
//! An empty `auth` object uses the default register-then-login flow, leaving it out
//! runs every user anonymously.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::session::AuthFlow;
use crate::task::{Task, TaskMethod, TaskRequest};
use crate::HatchlingError;

fn default_weight() -> usize {
    1
}

/// One task of a scenario.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTask {
    pub label: String,
    #[serde(default = "default_weight")]
    pub weight: usize,
    pub method: TaskMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub requires_auth: bool,
}
impl ScenarioTask {
    /// Convert into a [`Task`] that always sends the same request.
    pub fn into_task(self) -> Result<Task, HatchlingError> {
        let request = TaskRequest {
            method: self.method,
            path: self.path,
            body: self.body,
        };
        Ok(Task::from_request(&self.label, request)
            .set_weight(self.weight)?
            .set_requires_auth(self.requires_auth))
    }
}

/// A complete load test description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Default host, overridden by `--host`.
    #[serde(default)]
    pub host: Option<String>,
    /// How users register and log in. Users run anonymously without one.
    #[serde(default)]
    pub auth: Option<AuthFlow>,
    pub tasks: Vec<ScenarioTask>,
}
impl Scenario {
    /// Load a scenario from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, HatchlingError> {
        let path = path.as_ref();
        let error = |detail: String| HatchlingError::Scenario {
            path: path.display().to_string(),
            detail,
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| error(format!("failed to read scenario: {}", e)))?;
        let scenario: Scenario = serde_json::from_str(&contents)
            .map_err(|e| error(format!("failed to parse scenario: {}", e)))?;
        if scenario.tasks.is_empty() {
            return Err(error("scenario defines no tasks".to_string()));
        }
        info!(
            "loaded scenario {} with {} tasks",
            path.display(),
            scenario.tasks.len()
        );
        Ok(scenario)
    }

    /// Convert every task, failing on the first invalid one.
    pub fn tasks(&self) -> Result<Vec<Task>, HatchlingError> {
        self.tasks
            .iter()
            .cloned()
            .map(ScenarioTask::into_task)
            .collect()
    }
}
