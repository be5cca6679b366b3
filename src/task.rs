//! Tasks and weighted task selection.
//!
//! A [`Task`] is one kind of action a virtual user can perform: a label used to group
//! metrics, a relative weight, and a handler that builds the [`TaskRequest`] to send.
//! The set of tasks is immutable once a load test starts and is shared by every
//! virtual user through a [`TaskSelector`].
//!
//! ```rust
//! use hatchling::prelude::*;
//! use serde_json::json;
//!
//! fn tasks() -> Result<Vec<Task>, HatchlingError> {
//!     Ok(vec![
//!         Task::get("read", "/dashboard").set_weight(7)?,
//!         Task::post_json("write", "/quizzes", json!({"title": "Load test"})).set_weight(3)?,
//!     ])
//! }
//! ```

use http::Method;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::session::Identity;
use crate::HatchlingError;

/// Supported HTTP methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskMethod {
    Delete,
    Get,
    Head,
    Patch,
    Post,
    Put,
}
impl From<TaskMethod> for Method {
    fn from(method: TaskMethod) -> Method {
        match method {
            TaskMethod::Delete => Method::DELETE,
            TaskMethod::Get => Method::GET,
            TaskMethod::Head => Method::HEAD,
            TaskMethod::Patch => Method::PATCH,
            TaskMethod::Post => Method::POST,
            TaskMethod::Put => Method::PUT,
        }
    }
}
impl fmt::Display for TaskMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Method::from(*self))
    }
}

/// The request a task sends: a method, a path relative to the host, and an optional
/// JSON body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub method: TaskMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}
impl TaskRequest {
    /// A `GET` request for `path`.
    pub fn get(path: &str) -> Self {
        TaskRequest {
            method: TaskMethod::Get,
            path: path.to_string(),
            body: None,
        }
    }

    /// A `POST` request for `path` with a JSON body.
    pub fn post_json(path: &str, body: serde_json::Value) -> Self {
        TaskRequest {
            method: TaskMethod::Post,
            path: path.to_string(),
            body: Some(body),
        }
    }
}

/// What a task handler knows about the virtual user running it.
#[derive(Debug)]
pub struct TaskContext<'a> {
    /// Sequential index of the virtual user, starting at 0.
    pub user_index: usize,
    /// How many tasks this virtual user has already run.
    pub iteration: usize,
    /// The identity the virtual user registered with.
    pub identity: &'a Identity,
}

/// A function that builds the request a task sends.
pub type TaskHandler = Arc<dyn for<'a> Fn(&TaskContext<'a>) -> TaskRequest + Send + Sync>;

/// An individual task a virtual user can run.
#[derive(Clone)]
pub struct Task {
    /// Label under which results of this task are aggregated.
    pub label: String,
    /// Relative weight, used to select this task more or less often than other tasks.
    pub weight: usize,
    /// Skip this task when the virtual user holds no credential.
    pub requires_auth: bool,
    handler: TaskHandler,
}
impl Task {
    /// Create a task with a weight of 1 from a request-building handler.
    pub fn new<F>(label: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&TaskContext<'a>) -> TaskRequest + Send + Sync + 'static,
    {
        trace!("new task: {}", label);
        Task {
            label: label.to_string(),
            weight: 1,
            requires_auth: false,
            handler: Arc::new(handler),
        }
    }

    /// Create a task that always sends the same request.
    pub fn from_request(label: &str, request: TaskRequest) -> Self {
        Task::new(label, move |_| request.clone())
    }

    /// Create a task that sends a `GET` request for `path`.
    pub fn get(label: &str, path: &str) -> Self {
        Task::from_request(label, TaskRequest::get(path))
    }

    /// Create a task that sends a `POST` request for `path` with a JSON body.
    pub fn post_json(label: &str, path: &str, body: serde_json::Value) -> Self {
        Task::from_request(label, TaskRequest::post_json(path, body))
    }

    /// Set the task's relative weight. A weight of 0 is invalid.
    ///
    /// # Example
    /// ```rust
    /// use hatchling::prelude::*;
    ///
    /// assert!(Task::get("front page", "/").set_weight(3).is_ok());
    /// assert!(Task::get("front page", "/").set_weight(0).is_err());
    /// ```
    pub fn set_weight(mut self, weight: usize) -> Result<Self, HatchlingError> {
        trace!("{} set_weight: {}", self.label, weight);
        if weight == 0 {
            return Err(HatchlingError::InvalidWeight {
                weight,
                detail: format!("Weight of task {} must be set to at least 1.", self.label),
            });
        }
        self.weight = weight;
        Ok(self)
    }

    /// Require a credential to run this task.
    pub fn set_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    /// Build the request for one invocation of this task.
    pub fn build_request(&self, context: &TaskContext) -> TaskRequest {
        (self.handler)(context)
    }
}
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("weight", &self.weight)
            .field("requires_auth", &self.requires_auth)
            .finish_non_exhaustive()
    }
}

/// Picks tasks at random, in proportion to their weights.
///
/// The selector is immutable and can be shared by any number of virtual users.
#[derive(Clone, Debug)]
pub struct TaskSelector {
    tasks: Arc<Vec<Task>>,
    index: WeightedIndex<usize>,
}
impl TaskSelector {
    /// Build a selector. The task list can't be empty and no weight can be zero.
    pub fn new(tasks: Arc<Vec<Task>>) -> Result<Self, HatchlingError> {
        if tasks.is_empty() {
            return Err(HatchlingError::NoTasks {
                detail: "No tasks are defined.".to_string(),
            });
        }
        if let Some(task) = tasks.iter().find(|t| t.weight == 0) {
            return Err(HatchlingError::InvalidWeight {
                weight: 0,
                detail: format!("Weight of task {} must be set to at least 1.", task.label),
            });
        }
        let index = WeightedIndex::new(tasks.iter().map(|t| t.weight)).map_err(|e| {
            HatchlingError::InvalidWeight {
                weight: 0,
                detail: format!("Failed to weight tasks: {}", e),
            }
        })?;
        Ok(TaskSelector { tasks, index })
    }

    /// Select the next task using the thread-local random number generator.
    pub fn select(&self) -> &Task {
        self.select_with(&mut rand::rng())
    }

    /// Select the next task using the provided random number generator.
    pub fn select_with<R: Rng>(&self, rng: &mut R) -> &Task {
        &self.tasks[self.index.sample(rng)]
    }

    /// All tasks, in the order they were registered.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}
