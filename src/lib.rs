//! # Hatchling
//!
//! Hatchling is a virtual-user load generation engine inspired by
//! [Locust](https://locust.io/).
//!
//! A load test simulates many independent virtual users. Each virtual user
//! optionally registers and logs in against the target service to acquire a
//! bearer token, then repeatedly picks one of a weighted set of tasks, sends the
//! resulting HTTP request, and pauses for a random think-time before picking the
//! next one. Every result flows to a single metrics aggregator which maintains
//! per-label statistics that can be read at any time, and which are printed when
//! the load test finishes.
//!
//! Hatchling uses [`reqwest`](https://docs.rs/reqwest/) to provide an HTTP client,
//! and [`tokio`](https://docs.rs/tokio/) to run every virtual user as its own task.
//!
//! ## Creating a load test
//!
//! Add Hatchling as a dependency in `Cargo.toml`, then define one or more
//! [`Task`](./task/struct.Task.html)s. Each task has a label, a relative weight,
//! and a handler that builds the request to send:
//!
//! ```rust,no_run
//! use hatchling::prelude::*;
//! use serde_json::json;
//!
//! fn main() -> Result<(), HatchlingError> {
//!     let report = LoadTest::initialize()?
//!         // Register and log in each virtual user before it starts running tasks.
//!         .set_auth(AuthFlow::default())
//!         // Read the dashboard 70% of the time.
//!         .register_task(
//!             Task::get("read dashboard", "/dashboard")
//!                 .set_weight(7)?
//!                 .set_requires_auth(true),
//!         )
//!         // Create a quiz 30% of the time.
//!         .register_task(
//!             Task::new("write quiz", |context| {
//!                 TaskRequest::post_json(
//!                     "/quizzes",
//!                     json!({"title": format!("Quiz from user {}", context.user_index)}),
//!                 )
//!             })
//!             .set_weight(3)?
//!             .set_requires_auth(true),
//!         )
//!         .execute()?;
//!
//!     if report.outcome == RunOutcome::Aborted {
//!         eprintln!("load test was canceled");
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Running a load test
//!
//! The load test is configured at run time with command line options, for
//! example to simulate 100 users, launching 10 per second, for 5 minutes:
//!
//! ```bash
//! $ cargo run --release -- --host http://127.0.0.1:3000 -u100 -r10 -t5m
//! ```
//!
//! Or with an explicit test plan that ramps to 50 users over 30 seconds, holds for
//! one minute, then ramps back down over 10 seconds:
//!
//! ```bash
//! $ cargo run --release -- --host http://127.0.0.1:3000 --test-plan "50,30s;50,1m;0,10s"
//! ```
//!
//! Run with `-h` to see all available options.
//!
//! ## License
//!
//! Copyright 2020-26 Jeremy Andrews
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

pub mod config;
pub mod executor;
pub mod logger;
pub mod metrics;
mod pool;
pub mod prelude;
pub mod scenario;
pub mod session;
pub mod task;
pub mod test_plan;
pub mod user;
pub mod util;

use chrono::prelude::*;
use gumdrop::Options;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use crate::config::{LoadTestConfiguration, LoadTestDefaults};
use crate::executor::RequestExecutor;
use crate::metrics::{LoadTestMetrics, MetricsAggregator};
use crate::pool::{PoolSettings, UserPool};
use crate::session::AuthFlow;
use crate::task::{Task, TaskSelector};
use crate::test_plan::TestPlan;
use crate::user::UserSettings;

pub use crate::config::{LoadTestDefault, LoadTestDefaultType};

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time given to virtual users to exit cleanly before they are aborted.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Set by the ctrl-c handler, reset each time a load test starts.
pub(crate) static CANCELED: AtomicBool = AtomicBool::new(false);

/// An enumeration of all errors Hatchling can return.
#[derive(Debug)]
pub enum HatchlingError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Serde(serde_json::Error),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid think time specified.
    InvalidWaitTime {
        /// The specified minimum think time.
        min_wait: Duration,
        /// The specified maximum think time.
        max_wait: Duration,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid weight specified.
    InvalidWeight {
        /// The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`LoadTest`] has no [`Task`](./task/struct.Task.html) defined.
    NoTasks {
        /// An optional explanation of the error.
        detail: String,
    },
    /// Failed to load a scenario file.
    Scenario {
        /// The scenario file that caused this error.
        path: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A virtual user failed to acquire a credential.
    Bootstrap {
        /// The identity that failed to bootstrap.
        user: String,
        /// An explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl HatchlingError {
    fn describe(&self) -> &str {
        match *self {
            HatchlingError::Io(_) => "io::Error",
            HatchlingError::Reqwest(_) => "reqwest::Error",
            HatchlingError::TokioJoin(_) => "tokio::task::JoinError",
            HatchlingError::Serde(_) => "serde_json::Error",
            HatchlingError::InvalidHost { .. } => "failed to parse hostname",
            HatchlingError::InvalidOption { .. } => "invalid option or value specified",
            HatchlingError::InvalidWaitTime { .. } => "invalid think time specified",
            HatchlingError::InvalidWeight { .. } => "invalid weight specified",
            HatchlingError::NoTasks { .. } => "no tasks defined",
            HatchlingError::Scenario { .. } => "failed to load scenario",
            HatchlingError::Bootstrap { .. } => "failed to bootstrap session",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for HatchlingError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HatchlingError::Io(ref source) => {
                write!(f, "HatchlingError: {} ({})", self.describe(), source)
            }
            HatchlingError::Reqwest(ref source) => {
                write!(f, "HatchlingError: {} ({})", self.describe(), source)
            }
            HatchlingError::TokioJoin(ref source) => {
                write!(f, "HatchlingError: {} ({})", self.describe(), source)
            }
            HatchlingError::Serde(ref source) => {
                write!(f, "HatchlingError: {} ({})", self.describe(), source)
            }
            HatchlingError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "HatchlingError: {} ({})", self.describe(), parse_error),
            HatchlingError::InvalidOption { ref detail, .. }
            | HatchlingError::InvalidWaitTime { ref detail, .. }
            | HatchlingError::InvalidWeight { ref detail, .. }
            | HatchlingError::NoTasks { ref detail }
            | HatchlingError::Scenario { ref detail, .. }
            | HatchlingError::Bootstrap { ref detail, .. } => {
                write!(f, "HatchlingError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for HatchlingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            HatchlingError::Io(ref source) => Some(source),
            HatchlingError::Reqwest(ref source) => Some(source),
            HatchlingError::TokioJoin(ref source) => Some(source),
            HatchlingError::Serde(ref source) => Some(source),
            HatchlingError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for HatchlingError {
    fn from(err: reqwest::Error) -> HatchlingError {
        HatchlingError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for HatchlingError {
    fn from(err: io::Error) -> HatchlingError {
        HatchlingError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for HatchlingError {
    fn from(err: tokio::task::JoinError) -> HatchlingError {
        HatchlingError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for HatchlingError {
    fn from(err: serde_json::Error) -> HatchlingError {
        HatchlingError::Serde(err)
    }
}

/// How a load test ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The test plan finished, all users were stopped and all metrics were collected.
    Completed,
    /// The load test was canceled with ctrl-c or a [`CancelHandle`] before the
    /// test plan finished.
    Aborted,
}

/// Returned by [`LoadTest::execute`] when a load test finishes.
#[derive(Clone, Debug)]
pub struct LoadTestReport {
    /// Whether the load test ran to completion.
    pub outcome: RunOutcome,
    /// All metrics collected during the load test.
    pub metrics: LoadTestMetrics,
}

/// Cancels a running load test from another thread.
///
/// # Example
/// ```rust,no_run
/// use hatchling::prelude::*;
///
/// let load_test = LoadTest::initialize()
///     .unwrap()
///     .register_task(Task::get("front page", "/"));
/// let cancel = load_test.cancel_handle();
///
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(10));
///     cancel.cancel();
/// });
///
/// let report = load_test.execute().unwrap();
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);
impl CancelHandle {
    /// Tell the load test to stop all users and return.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true if either this handle or ctrl-c canceled the load test.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || CANCELED.load(Ordering::SeqCst)
    }
}

/// Global load test state.
pub struct LoadTest {
    /// All tasks virtual users can run.
    tasks: Vec<Task>,
    /// An optional register-then-login flow run once by each virtual user.
    auth: Option<AuthFlow>,
    /// Programmatic defaults, overridden by the command line.
    defaults: LoadTestDefaults,
    /// Configuration parsed from the command line.
    configuration: LoadTestConfiguration,
    /// Shared cancellation flag.
    cancel: CancelHandle,
}
impl LoadTest {
    /// Load configuration from the command line and initialize a [`LoadTest`].
    ///
    /// # Example
    /// ```rust
    /// use hatchling::prelude::*;
    ///
    /// let mut load_test = LoadTest::initialize();
    /// ```
    pub fn initialize() -> Result<LoadTest, HatchlingError> {
        Ok(LoadTest::initialize_with_config(
            LoadTestConfiguration::parse_args_default_or_exit(),
        ))
    }

    /// Initialize a [`LoadTest`] with an already loaded configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use hatchling::LoadTest;
    /// use hatchling::config::LoadTestConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = LoadTestConfiguration::parse_args_default(&["--users", "5"]).unwrap();
    /// let load_test = LoadTest::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(configuration: LoadTestConfiguration) -> LoadTest {
        LoadTest {
            tasks: Vec::new(),
            auth: None,
            defaults: LoadTestDefaults::default(),
            configuration,
            cancel: CancelHandle::default(),
        }
    }

    /// Register a [`Task`](./task/struct.Task.html) that virtual users can run.
    ///
    /// Tasks are selected at random, in proportion to their weight.
    pub fn register_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Configure the [`AuthFlow`](./session/struct.AuthFlow.html) each virtual user runs
    /// once before it starts running tasks.
    ///
    /// Without an `AuthFlow` virtual users run anonymously.
    pub fn set_auth(mut self, auth: AuthFlow) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Returns a handle that can cancel this load test while it runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute the [`LoadTest`] load test.
    ///
    /// Returns a [`LoadTestReport`] once the test plan finishes or the load test is
    /// canceled. Only configuration errors are returned as an `Err`: failed requests
    /// and failed users are recorded in the metrics.
    pub fn execute(mut self) -> Result<LoadTestReport, HatchlingError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // At least one task is required.
        if self.tasks.is_empty() {
            return Err(HatchlingError::NoTasks {
                detail: "No tasks are defined.".to_string(),
            });
        }

        // Display tasks, then exit.
        if self.configuration.list {
            println!("Available tasks:");
            for task in &self.tasks {
                println!(" - {} (weight: {})", task.label, task.weight);
            }
            std::process::exit(0);
        }

        // Configure LoadTestConfiguration.
        self.configuration.configure(&self.defaults);

        // Validate LoadTestConfiguration.
        self.configuration.validate()?;

        let host = util::is_valid_host(&self.configuration.host)?;
        info!("global host configured: {}", host);

        let test_plan = TestPlan::build(&self.configuration);
        debug!("test plan: {:?}", test_plan.steps);

        let pool_settings = PoolSettings {
            max_users: self
                .configuration
                .max_users
                .unwrap_or_else(|| test_plan.peak_users()),
            grace_period: self
                .configuration
                .grace_period
                .as_deref()
                .and_then(util::parse_timespan)
                .unwrap_or(DEFAULT_GRACE_PERIOD),
            replace_failed_users: self.configuration.replace_failed_users,
        };
        let timeout = self
            .configuration
            .timeout
            .as_deref()
            .and_then(util::parse_timespan)
            .unwrap_or(DEFAULT_TIMEOUT);
        let think_time = self.configuration.think_time.unwrap_or_default();

        // Build the immutable state shared by all virtual users.
        let selector = TaskSelector::new(Arc::new(std::mem::take(&mut self.tasks)))?;
        let executor = RequestExecutor::new(host, timeout)?;
        let settings = Arc::new(UserSettings {
            selector,
            executor,
            auth: self.auth.take(),
            think_time,
        });

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run(settings, test_plan, pool_settings))
    }

    /// Run the load test, from launching the first virtual user to collecting the
    /// last metric.
    async fn run(
        self,
        settings: Arc<UserSettings>,
        test_plan: TestPlan,
        pool_settings: PoolSettings,
    ) -> Result<LoadTestReport, HatchlingError> {
        // Stop cleanly on ctrl-c.
        CANCELED.store(false, Ordering::SeqCst);
        util::setup_ctrlc_handler();

        // Optionally log every ActionResult.
        let (logger_handle, logger_tx) = logger::setup_request_logger(&self.configuration).await?;

        let aggregator = MetricsAggregator::new(&self.configuration.host);
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let aggregator_handle = tokio::spawn(aggregator.clone().run(metrics_rx, logger_tx.clone()));

        let running_metrics = match self.configuration.running_metrics {
            Some(seconds) if seconds > 0 && !self.configuration.no_print_metrics => {
                Some(tokio::spawn(metrics::print_running_metrics(
                    aggregator.clone(),
                    Duration::from_secs(seconds as u64),
                )))
            }
            _ => None,
        };

        aggregator.set_started(Local::now());
        let pool = UserPool::new(
            settings,
            test_plan,
            pool_settings,
            metrics_tx,
            self.cancel.clone(),
        );
        let summary = pool.run().await;
        aggregator.set_stopped(Local::now());

        if let Some(handle) = running_metrics {
            handle.abort();
        }

        // All senders are gone once the pool returns, so the aggregator drains the
        // channel and exits.
        if let Err(e) = aggregator_handle.await {
            error!("metrics aggregator failed: {}", e);
        }

        if let Some(tx) = logger_tx {
            // Empty message means it's time to flush and exit.
            let _ = tx.send(None);
        }
        if let Some(handle) = logger_handle {
            match handle.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("request logger failed: {}", e),
                Err(e) => warn!("request logger failed: {}", e),
            }
        }

        let mut metrics = aggregator.snapshot();
        metrics.set_pool_summary(&summary);
        metrics.final_metrics = true;

        let outcome = if summary.canceled {
            RunOutcome::Aborted
        } else {
            RunOutcome::Completed
        };
        info!("load test {:?} after {} seconds", outcome, metrics.duration);

        if !self.configuration.no_print_metrics {
            metrics.print();
        }

        Ok(LoadTestReport { outcome, metrics })
    }
}
