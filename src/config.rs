//! Functions and structures related to configuring a Hatchling load test.
//!
//! Hatchling can be configured at run time by passing in the options and flags defined by
//! the [`LoadTestConfiguration`] structure.
//!
//! Hatchling can be configured programmatically with [`LoadTestDefaultType::set_default`].
//! Options set on the command line always take precedence over programmatic defaults,
//! which in turn take precedence over built-in defaults.

use gumdrop::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::logger::RequestLogFormat;
use crate::test_plan::TestPlan;
use crate::util;
use crate::{HatchlingError, LoadTest};

/// Runtime options available when launching a Hatchling load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`LoadTestDefaultType::set_default`].
///
/// Hatchling leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive the help from
/// the below structure. Pass `-h` to see it.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Hatchling is a virtual-user load generation engine, written in Rust.

The following runtime options are available when launching a load test:"#
)]
pub struct LoadTestConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all tasks and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all tasks and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Sets concurrent users (default: number of CPUs)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Starts users for up to (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "s", meta = "TIME")]
    pub startup_time: String,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Defines a more complex test plan ("10,60s;0,30s")
    #[options(no_short, meta = "\"TESTPLAN\"")]
    pub test_plan: Option<TestPlan>,
    /// Caps concurrently active users (default: peak users of the test plan)
    #[options(no_short, meta = "USERS")]
    pub max_users: Option<usize>,
    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Metrics:' header after this option
        help = "Increases verbosity (-v, -vv, etc)\n\nMetrics:"
    )]
    pub verbose: u8,

    /// How often to optionally print running metrics, in seconds
    #[options(no_short, meta = "TIME")]
    pub running_metrics: Option<usize>,
    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,
    /// Sets request log file name
    #[options(short = "R", meta = "NAME")]
    pub request_log: String,
    /// Sets request log format (csv, json, raw, pretty)
    #[options(
        no_short,
        meta = "FORMAT",
        // Add a blank line and then an 'Advanced:' header after this option
        help = "Sets request log format (csv, json, raw, pretty)\n\nAdvanced:"
    )]
    pub request_format: Option<RequestLogFormat>,

    /// Sets think time between tasks (default: "1s,5s")
    #[options(no_short, meta = "MIN,MAX")]
    pub think_time: Option<ThinkTime>,
    /// Sets per-request timeout (default: 60s)
    #[options(no_short, meta = "TIME")]
    pub timeout: Option<String>,
    /// Sets how long stopping users may take before being aborted (default: 5s)
    #[options(no_short, meta = "TIME")]
    pub grace_period: Option<String>,
    /// Replaces users whose task exits unexpectedly
    #[options(no_short)]
    pub replace_failed_users: bool,
    /// Loads host, authentication and tasks from a JSON scenario file
    #[options(no_short, meta = "FILE")]
    pub scenario: String,
}

/// The range a virtual user's pause between two tasks is drawn from.
///
/// Can be specified as `"MIN,MAX"` where each side is a time span, for example
/// `"500ms,2s"`, or as a single time span for a fixed pause.
///
/// # Example
/// ```rust
/// use hatchling::config::ThinkTime;
/// use std::time::Duration;
///
/// let think_time: ThinkTime = "250ms,1s".parse().unwrap();
/// assert_eq!(think_time.min, Duration::from_millis(250));
/// assert_eq!(think_time.max, Duration::from_secs(1));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    /// The shortest pause.
    pub min: Duration,
    /// The longest pause.
    pub max: Duration,
}
impl Default for ThinkTime {
    fn default() -> Self {
        ThinkTime {
            min: Duration::from_secs(1),
            max: Duration::from_secs(5),
        }
    }
}
impl ThinkTime {
    /// Create a validated think time range.
    pub fn new(min: Duration, max: Duration) -> Result<Self, HatchlingError> {
        let think_time = ThinkTime { min, max };
        think_time.validate()?;
        Ok(think_time)
    }

    /// Returns an [`InvalidWaitTime`](../enum.HatchlingError.html#variant.InvalidWaitTime)
    /// error if the minimum is larger than the maximum.
    pub fn validate(&self) -> Result<(), HatchlingError> {
        if self.min > self.max {
            return Err(HatchlingError::InvalidWaitTime {
                min_wait: self.min,
                max_wait: self.max,
                detail: "The minimum think time can not be larger than the maximum think time."
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Draw a pause uniformly from the range, with millisecond precision.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if min >= max {
            self.min
        } else {
            Duration::from_millis(rng.random_range(min..=max))
        }
    }
}
impl FromStr for ThinkTime {
    type Err = HatchlingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HatchlingError::InvalidOption {
            option: "`configuration.think_time`".to_string(),
            value: s.to_string(),
            detail: "Expected format: --think-time \"{min},{max}\", ie \"1s,5s\".".to_string(),
        };
        let mut parts = s.split(',');
        let min = parts
            .next()
            .and_then(util::parse_timespan)
            .ok_or_else(invalid)?;
        let max = match parts.next() {
            Some(max) => util::parse_timespan(max).ok_or_else(invalid)?,
            None => min,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(ThinkTime { min, max })
    }
}
impl fmt::Display for ThinkTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}..{:?}", self.min, self.max)
    }
}

/// Optional default values for load test options.
///
/// Set with [`LoadTestDefaultType::set_default`], and used when the matching option
/// isn't passed on the command line.
#[derive(Clone, Debug, Default)]
pub(crate) struct LoadTestDefaults {
    /// An optional default host to run this load test against.
    pub host: Option<String>,
    /// An optional default number of users to simulate.
    pub users: Option<usize>,
    /// An optional default number of users to start per second.
    pub hatch_rate: Option<String>,
    /// An optional default number of seconds for the test to start.
    pub startup_time: Option<usize>,
    /// An optional default number of seconds for the test to run.
    pub run_time: Option<usize>,
    /// An optional default test plan.
    pub test_plan: Option<TestPlan>,
    /// An optional default ceiling on concurrently active users.
    pub max_users: Option<usize>,
    /// An optional default log level.
    pub log_level: Option<u8>,
    /// An optional default for the log file name.
    pub log_file: Option<String>,
    /// An optional default value for quiet level.
    pub quiet: Option<u8>,
    /// An optional default value for verbosity level.
    pub verbose: Option<u8>,
    /// An optional default for printing running metrics.
    pub running_metrics: Option<usize>,
    /// An optional default for not displaying metrics at the end of the load test.
    pub no_print_metrics: Option<bool>,
    /// An optional default for the request log file name.
    pub request_log: Option<String>,
    /// An optional default for the request log format.
    pub request_format: Option<RequestLogFormat>,
    /// An optional default think time range.
    pub think_time: Option<ThinkTime>,
    /// An optional default per-request timeout.
    pub timeout: Option<String>,
    /// An optional default grace period.
    pub grace_period: Option<String>,
    /// An optional default for replacing failed users.
    pub replace_failed_users: Option<bool>,
}

/// All run-time options that can be configured with custom defaults.
///
/// For example, you can optionally configure a default host for the load test. This is
/// used if no per-scenario host is defined and no `--host` CLI option is configured.
/// ```rust
/// use hatchling::prelude::*;
///
/// fn main() -> Result<(), HatchlingError> {
///     LoadTest::initialize()?
///         .set_default(LoadTestDefault::Host, "local.dev")?;
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub enum LoadTestDefault {
    /// An optional default host to run this load test against.
    Host,
    /// An optional default number of users to simulate.
    Users,
    /// An optional default number of users to start per second.
    HatchRate,
    /// An optional default number of seconds for the test to start up.
    StartupTime,
    /// An optional default number of seconds for the test to run.
    RunTime,
    /// An optional default test plan.
    TestPlan,
    /// An optional default ceiling on concurrently active users.
    MaxUsers,
    /// An optional default log level.
    LogLevel,
    /// An optional default for the log file name.
    LogFile,
    /// An optional default value for quiet level.
    Quiet,
    /// An optional default value for verbosity level.
    Verbose,
    /// An optional default for printing running metrics.
    RunningMetrics,
    /// An optional default for not displaying metrics at the end of the load test.
    NoPrintMetrics,
    /// An optional default for the request log file name.
    RequestLog,
    /// An optional default for the request log format.
    RequestFormat,
    /// An optional default think time range, "MIN,MAX".
    ThinkTime,
    /// An optional default per-request timeout.
    Timeout,
    /// An optional default grace period.
    GracePeriod,
    /// An optional default for replacing failed users.
    ReplaceFailedUsers,
}

/// Most run-time options can be programmatically configured with custom defaults.
///
/// The following run-time options can be configured with a custom default using a
/// borrowed string slice (`&str`):
///  - [`LoadTestDefault::Host`]
///  - [`LoadTestDefault::HatchRate`]
///  - [`LoadTestDefault::TestPlan`]
///  - [`LoadTestDefault::LogFile`]
///  - [`LoadTestDefault::RequestLog`]
///  - [`LoadTestDefault::RequestFormat`]
///  - [`LoadTestDefault::ThinkTime`]
///  - [`LoadTestDefault::Timeout`]
///  - [`LoadTestDefault::GracePeriod`]
///
/// The following run-time options can be configured with a custom default using a
/// `usize` integer:
///  - [`LoadTestDefault::Users`]
///  - [`LoadTestDefault::StartupTime`]
///  - [`LoadTestDefault::RunTime`]
///  - [`LoadTestDefault::MaxUsers`]
///  - [`LoadTestDefault::LogLevel`]
///  - [`LoadTestDefault::Quiet`]
///  - [`LoadTestDefault::Verbose`]
///  - [`LoadTestDefault::RunningMetrics`]
///
/// The following run-time flags can be configured with a custom default using a
/// `bool` (and otherwise default to `false`):
///  - [`LoadTestDefault::NoPrintMetrics`]
///  - [`LoadTestDefault::ReplaceFailedUsers`]
pub trait LoadTestDefaultType<T> {
    /// Sets a [`LoadTestDefault`] to the provided value. The required type of each option
    /// is documented in [`LoadTestDefaultType`].
    ///
    /// # Example
    /// ```rust
    /// use hatchling::prelude::*;
    ///
    /// fn main() -> Result<(), HatchlingError> {
    ///     LoadTest::initialize()?
    ///         // Do not display info level logs while the test runs.
    ///         .set_default(LoadTestDefault::Quiet, 1)?
    ///         // Pause between 500 milliseconds and 2 seconds between tasks.
    ///         .set_default(LoadTestDefault::ThinkTime, "500ms,2s")?
    ///         // Log all requests made during the test to `./hatchling-request.log`.
    ///         .set_default(LoadTestDefault::RequestLog, "hatchling-request.log")?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: LoadTestDefault, value: T) -> Result<Box<Self>, HatchlingError>;
}
impl LoadTestDefaultType<&str> for LoadTest {
    /// Sets [`LoadTestDefault`] to a [`&str`] value.
    fn set_default(mut self, key: LoadTestDefault, value: &str) -> Result<Box<Self>, HatchlingError> {
        match key {
            // Set valid defaults.
            LoadTestDefault::Host => {
                self.defaults.host = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            LoadTestDefault::HatchRate => self.defaults.hatch_rate = Some(value.to_string()),
            LoadTestDefault::TestPlan => self.defaults.test_plan = Some(value.parse()?),
            LoadTestDefault::LogFile => self.defaults.log_file = Some(value.to_string()),
            LoadTestDefault::RequestLog => self.defaults.request_log = Some(value.to_string()),
            LoadTestDefault::RequestFormat => self.defaults.request_format = Some(value.parse()?),
            LoadTestDefault::ThinkTime => self.defaults.think_time = Some(value.parse()?),
            LoadTestDefault::Timeout => self.defaults.timeout = Some(value.to_string()),
            LoadTestDefault::GracePeriod => self.defaults.grace_period = Some(value.to_string()),
            // Otherwise display a helpful and explicit error.
            LoadTestDefault::Users
            | LoadTestDefault::StartupTime
            | LoadTestDefault::RunTime
            | LoadTestDefault::MaxUsers
            | LoadTestDefault::LogLevel
            | LoadTestDefault::Quiet
            | LoadTestDefault::Verbose
            | LoadTestDefault::RunningMetrics => {
                return Err(HatchlingError::InvalidOption {
                    option: format!("LoadTestDefault::{:?}", key),
                    value: value.to_string(),
                    detail: format!(
                        "set_default(LoadTestDefault::{:?}, {}) expected usize value, received &str",
                        key, value
                    ),
                });
            }
            LoadTestDefault::NoPrintMetrics | LoadTestDefault::ReplaceFailedUsers => {
                return Err(HatchlingError::InvalidOption {
                    option: format!("LoadTestDefault::{:?}", key),
                    value: value.to_string(),
                    detail: format!(
                        "set_default(LoadTestDefault::{:?}, {}) expected bool value, received &str",
                        key, value
                    ),
                });
            }
        }
        Ok(Box::new(self))
    }
}
impl LoadTestDefaultType<usize> for LoadTest {
    /// Sets [`LoadTestDefault`] to a [`usize`] value.
    fn set_default(mut self, key: LoadTestDefault, value: usize) -> Result<Box<Self>, HatchlingError> {
        match key {
            LoadTestDefault::Users => self.defaults.users = Some(value),
            LoadTestDefault::StartupTime => self.defaults.startup_time = Some(value),
            LoadTestDefault::RunTime => self.defaults.run_time = Some(value),
            LoadTestDefault::MaxUsers => self.defaults.max_users = Some(value),
            LoadTestDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            LoadTestDefault::Quiet => self.defaults.quiet = Some(value as u8),
            LoadTestDefault::Verbose => self.defaults.verbose = Some(value as u8),
            LoadTestDefault::RunningMetrics => self.defaults.running_metrics = Some(value),
            // Otherwise display a helpful and explicit error.
            LoadTestDefault::Host
            | LoadTestDefault::HatchRate
            | LoadTestDefault::TestPlan
            | LoadTestDefault::LogFile
            | LoadTestDefault::RequestLog
            | LoadTestDefault::RequestFormat
            | LoadTestDefault::ThinkTime
            | LoadTestDefault::Timeout
            | LoadTestDefault::GracePeriod => {
                return Err(HatchlingError::InvalidOption {
                    option: format!("LoadTestDefault::{:?}", key),
                    value: format!("{}", value),
                    detail: format!(
                        "set_default(LoadTestDefault::{:?}, {}) expected &str value, received usize",
                        key, value
                    ),
                })
            }
            LoadTestDefault::NoPrintMetrics | LoadTestDefault::ReplaceFailedUsers => {
                return Err(HatchlingError::InvalidOption {
                    option: format!("LoadTestDefault::{:?}", key),
                    value: format!("{}", value),
                    detail: format!(
                        "set_default(LoadTestDefault::{:?}, {}) expected bool value, received usize",
                        key, value
                    ),
                })
            }
        }
        Ok(Box::new(self))
    }
}
impl LoadTestDefaultType<bool> for LoadTest {
    /// Sets [`LoadTestDefault`] to a [`bool`] value.
    fn set_default(mut self, key: LoadTestDefault, value: bool) -> Result<Box<Self>, HatchlingError> {
        match key {
            LoadTestDefault::NoPrintMetrics => self.defaults.no_print_metrics = Some(value),
            LoadTestDefault::ReplaceFailedUsers => {
                self.defaults.replace_failed_users = Some(value)
            }
            // Otherwise display a helpful and explicit error.
            LoadTestDefault::Host
            | LoadTestDefault::HatchRate
            | LoadTestDefault::TestPlan
            | LoadTestDefault::LogFile
            | LoadTestDefault::RequestLog
            | LoadTestDefault::RequestFormat
            | LoadTestDefault::ThinkTime
            | LoadTestDefault::Timeout
            | LoadTestDefault::GracePeriod => {
                return Err(HatchlingError::InvalidOption {
                    option: format!("LoadTestDefault::{:?}", key),
                    value: format!("{}", value),
                    detail: format!(
                        "set_default(LoadTestDefault::{:?}, {}) expected &str value, received bool",
                        key, value
                    ),
                })
            }
            LoadTestDefault::Users
            | LoadTestDefault::StartupTime
            | LoadTestDefault::RunTime
            | LoadTestDefault::MaxUsers
            | LoadTestDefault::LogLevel
            | LoadTestDefault::Quiet
            | LoadTestDefault::Verbose
            | LoadTestDefault::RunningMetrics => {
                return Err(HatchlingError::InvalidOption {
                    option: format!("LoadTestDefault::{:?}", key),
                    value: format!("{}", value),
                    detail: format!(
                        "set_default(LoadTestDefault::{:?}, {}) expected usize value, received bool",
                        key, value
                    ),
                })
            }
        }
        Ok(Box::new(self))
    }
}

/// Used internally to configure [`LoadTestConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct ConfigValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Filter using this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait Configure<T> {
    /// Return the first unfiltered [`ConfigValue`].
    fn get_value(&self, values: Vec<ConfigValue<T>>) -> Option<T>;
}
impl<T: fmt::Debug> Configure<T> for LoadTestConfiguration {
    fn get_value(&self, values: Vec<ConfigValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                } else {
                    if !value.message.is_empty() {
                        info!("{} = {:?}", value.message, v)
                    }
                    return Some(v);
                }
            }
        }
        None
    }
}

impl LoadTestConfiguration {
    /// Implement precedence rules for all [`LoadTestConfiguration`] values.
    pub(crate) fn configure(&mut self, defaults: &LoadTestDefaults) {
        // Configure `quiet`.
        self.quiet = self
            .get_value(vec![
                // Use --quiet if set.
                ConfigValue {
                    value: Some(self.quiet),
                    filter: self.quiet == 0,
                    message: "",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.quiet,
                    filter: defaults.quiet.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = self
            .get_value(vec![
                // Use --verbose if set.
                ConfigValue {
                    value: Some(self.verbose),
                    filter: self.verbose == 0,
                    message: "",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.verbose,
                    filter: defaults.verbose.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = self
            .get_value(vec![
                // Use --log-level if set.
                ConfigValue {
                    value: Some(self.log_level),
                    filter: self.log_level == 0,
                    message: "",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.log_level,
                    filter: defaults.log_level.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `log_file`.
        self.log_file = self
            .get_value(vec![
                // Use --log-file if set.
                ConfigValue {
                    value: Some(self.log_file.to_string()),
                    filter: self.log_file.is_empty(),
                    message: "",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.log_file.clone(),
                    filter: defaults.log_file.is_none(),
                    message: "",
                },
            ])
            .unwrap_or_default();

        // Initialize the logger.
        self.initialize_logger();

        // Configure `host`.
        self.host = self
            .get_value(vec![
                // Use --host if set.
                ConfigValue {
                    value: Some(self.host.to_string()),
                    filter: self.host.is_empty(),
                    message: "host",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.host.clone(),
                    filter: defaults.host.is_none(),
                    message: "host",
                },
            ])
            .unwrap_or_default();

        // Configure `test_plan` before `users` so users doesn't get assigned a default when
        // using a test plan.
        self.test_plan = self.get_value(vec![
            // Use --test-plan if set.
            ConfigValue {
                value: self.test_plan.clone(),
                filter: self.test_plan.is_none(),
                message: "test_plan",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.test_plan.clone(),
                filter: defaults.test_plan.is_none(),
                message: "test_plan",
            },
        ]);

        // Determine how many CPUs are available.
        let default_users = match std::thread::available_parallelism() {
            Ok(ap) => Some(ap.get()),
            Err(e) => {
                // Default to 1 user if unable to detect number of CPUs.
                info!("failed to detect available_parallelism: {}", e);
                Some(1)
            }
        };

        // Configure `users`.
        self.users = self.get_value(vec![
            // Use --users if set.
            ConfigValue {
                value: self.users,
                filter: false,
                message: "users",
            },
            // Otherwise use LoadTestDefault if set and not using a test plan.
            ConfigValue {
                value: defaults.users,
                filter: defaults.users.is_none() || self.test_plan.is_some(),
                message: "users",
            },
            // Otherwise use detected number of CPUs if not using a test plan.
            ConfigValue {
                value: default_users,
                filter: self.test_plan.is_some(),
                message: "users defaulted to number of CPUs",
            },
        ]);

        // Configure `startup_time`.
        self.startup_time = self
            .get_value(vec![
                // Use --startup-time if set.
                ConfigValue {
                    value: Some(self.startup_time.to_string()),
                    filter: self.startup_time.is_empty() || self.startup_time == "0",
                    message: "startup_time",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.startup_time.map(|s| s.to_string()),
                    filter: defaults.startup_time.is_none(),
                    message: "startup_time",
                },
            ])
            .unwrap_or_else(|| "0".to_string());

        // Configure `run_time`.
        self.run_time = self
            .get_value(vec![
                // Use --run-time if set.
                ConfigValue {
                    value: Some(self.run_time.to_string()),
                    filter: self.run_time.is_empty() || self.run_time == "0",
                    message: "run_time",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.run_time.map(|s| s.to_string()),
                    filter: defaults.run_time.is_none(),
                    message: "run_time",
                },
            ])
            .unwrap_or_else(|| "0".to_string());

        // Configure `hatch_rate`.
        self.hatch_rate = self.get_value(vec![
            // Use --hatch-rate if set.
            ConfigValue {
                value: self.hatch_rate.clone(),
                filter: self.hatch_rate.is_none(),
                message: "hatch_rate",
            },
            // Otherwise use LoadTestDefault if set and not using --startup-time.
            ConfigValue {
                value: defaults.hatch_rate.clone(),
                filter: defaults.hatch_rate.is_none() || self.startup_time != "0",
                message: "hatch_rate",
            },
        ]);

        // Configure `max_users`.
        self.max_users = self.get_value(vec![
            // Use --max-users if set.
            ConfigValue {
                value: self.max_users,
                filter: self.max_users.is_none(),
                message: "max_users",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.max_users,
                filter: defaults.max_users.is_none(),
                message: "max_users",
            },
        ]);

        // Configure `running_metrics`.
        self.running_metrics = self.get_value(vec![
            // Use --running-metrics if set.
            ConfigValue {
                value: self.running_metrics,
                filter: self.running_metrics.is_none(),
                message: "running_metrics",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.running_metrics,
                filter: defaults.running_metrics.is_none(),
                message: "running_metrics",
            },
        ]);

        // Configure `no_print_metrics`.
        self.no_print_metrics = self
            .get_value(vec![
                // Use --no-print-metrics if set.
                ConfigValue {
                    value: Some(self.no_print_metrics),
                    filter: !self.no_print_metrics,
                    message: "no_print_metrics",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.no_print_metrics,
                    filter: defaults.no_print_metrics.is_none(),
                    message: "no_print_metrics",
                },
            ])
            .unwrap_or(false);

        // Configure `request_log`.
        self.request_log = self
            .get_value(vec![
                // Use --request-log if set.
                ConfigValue {
                    value: Some(self.request_log.to_string()),
                    filter: self.request_log.is_empty(),
                    message: "request_log",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.request_log.clone(),
                    filter: defaults.request_log.is_none(),
                    message: "request_log",
                },
            ])
            .unwrap_or_default();

        // Configure `request_format`.
        self.request_format = self.get_value(vec![
            // Use --request-format if set.
            ConfigValue {
                value: self.request_format.clone(),
                filter: self.request_format.is_none(),
                message: "request_format",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.request_format.clone(),
                filter: defaults.request_format.is_none(),
                message: "request_format",
            },
        ]);

        // Configure `think_time`.
        self.think_time = self.get_value(vec![
            // Use --think-time if set.
            ConfigValue {
                value: self.think_time,
                filter: self.think_time.is_none(),
                message: "think_time",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.think_time,
                filter: defaults.think_time.is_none(),
                message: "think_time",
            },
        ]);

        // Configure `timeout`.
        self.timeout = self.get_value(vec![
            // Use --timeout if set.
            ConfigValue {
                value: self.timeout.clone(),
                filter: self.timeout.is_none(),
                message: "timeout",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.timeout.clone(),
                filter: defaults.timeout.is_none(),
                message: "timeout",
            },
        ]);

        // Configure `grace_period`.
        self.grace_period = self.get_value(vec![
            // Use --grace-period if set.
            ConfigValue {
                value: self.grace_period.clone(),
                filter: self.grace_period.is_none(),
                message: "grace_period",
            },
            // Otherwise use LoadTestDefault if set.
            ConfigValue {
                value: defaults.grace_period.clone(),
                filter: defaults.grace_period.is_none(),
                message: "grace_period",
            },
        ]);

        // Configure `replace_failed_users`.
        self.replace_failed_users = self
            .get_value(vec![
                // Use --replace-failed-users if set.
                ConfigValue {
                    value: Some(self.replace_failed_users),
                    filter: !self.replace_failed_users,
                    message: "replace_failed_users",
                },
                // Otherwise use LoadTestDefault if set.
                ConfigValue {
                    value: defaults.replace_failed_users,
                    filter: defaults.replace_failed_users.is_none(),
                    message: "replace_failed_users",
                },
            ])
            .unwrap_or(false);
    }

    /// Validate configured [`LoadTestConfiguration`] values.
    pub(crate) fn validate(&self) -> Result<(), HatchlingError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(HatchlingError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // A host is required, and must be a valid base url.
        if self.host.is_empty() {
            return Err(HatchlingError::InvalidOption {
                option: "`configuration.host`".to_string(),
                value: self.host.to_string(),
                detail: "A host must be defined via the --host option or LoadTestDefault::Host."
                    .to_string(),
            });
        }
        util::is_valid_host(&self.host)?;

        // If set, hatch rate must be a positive number.
        if let Some(hatch_rate) = self.hatch_rate.as_ref() {
            match hatch_rate.parse::<f32>() {
                Ok(rate) if rate > 0.0 && rate.is_finite() => (),
                _ => {
                    return Err(HatchlingError::InvalidOption {
                        option: "`configuration.hatch_rate`".to_string(),
                        value: hatch_rate.to_string(),
                        detail: "`configuration.hatch_rate` must be a number greater than 0."
                            .to_string(),
                    });
                }
            }
        }

        // Validate `users`.
        if let Some(users) = self.users.as_ref() {
            if users == &0 {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` must be set to at least 1.".to_string(),
                });
            }
        }

        // Validate `startup_time`.
        if util::parse_timespan_millis(&self.startup_time).is_none() {
            return Err(HatchlingError::InvalidOption {
                option: "`configuration.startup_time`".to_string(),
                value: self.startup_time.to_string(),
                detail: "`configuration.startup_time` must be a time span, ie 30s, 20m, 1h30m."
                    .to_string(),
            });
        }
        if self.startup_time != "0" && self.hatch_rate.is_some() {
            // Startup time can't be set with hatch rate.
            return Err(HatchlingError::InvalidOption {
                option: "`configuration.startup_time`".to_string(),
                value: self.startup_time.to_string(),
                detail:
                    "`configuration.startup_time` can not be set with `configuration.hatch_rate`."
                        .to_string(),
            });
        }

        // Validate `run_time`.
        if util::parse_timespan_millis(&self.run_time).is_none() {
            return Err(HatchlingError::InvalidOption {
                option: "`configuration.run_time`".to_string(),
                value: self.run_time.to_string(),
                detail: "`configuration.run_time` must be a time span, ie 30s, 20m, 1h30m."
                    .to_string(),
            });
        }

        // Validate `test_plan`.
        if let Some(test_plan) = self.test_plan.as_ref() {
            // The --users option isn't compatible with --test-plan.
            if let Some(users) = self.users.as_ref() {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: users.to_string(),
                    detail: "`configuration.users` can not be set with `configuration.test_plan`."
                        .to_string(),
                });
            }
            // The --hatch-rate option isn't compatible with --test-plan.
            if let Some(hatch_rate) = self.hatch_rate.as_ref() {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.hatch_rate`".to_string(),
                    value: hatch_rate.to_string(),
                    detail:
                        "`configuration.hatch_rate` can not be set with `configuration.test_plan`."
                            .to_string(),
                });
            }
            // The --startup-time and --run-time options aren't compatible with --test-plan.
            if self.startup_time != "0" || self.run_time != "0" {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.run_time`".to_string(),
                    value: self.run_time.to_string(),
                    detail: "`configuration.startup_time` and `configuration.run_time` can not be set with `configuration.test_plan`.".to_string(),
                });
            }
            if test_plan.steps.is_empty() {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.test_plan`".to_string(),
                    value: String::new(),
                    detail: "`configuration.test_plan` must contain at least one step."
                        .to_string(),
                });
            }
        }

        // Validate `max_users`.
        if let Some(max_users) = self.max_users.as_ref() {
            if max_users == &0 {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.max_users`".to_string(),
                    value: max_users.to_string(),
                    detail: "`configuration.max_users` must be set to at least 1.".to_string(),
                });
            }
        }

        // Validate `think_time`.
        if let Some(think_time) = self.think_time.as_ref() {
            think_time.validate()?;
        }

        // If set, timeout must be greater than zero.
        if let Some(timeout) = self.timeout.as_ref() {
            match util::parse_timespan(timeout) {
                Some(t) if !t.is_zero() => (),
                _ => {
                    return Err(HatchlingError::InvalidOption {
                        option: "`configuration.timeout`".to_string(),
                        value: timeout.to_string(),
                        detail: "`configuration.timeout` must be a time span greater than 0."
                            .to_string(),
                    });
                }
            }
        }

        // If set, grace period must be a valid time span.
        if let Some(grace_period) = self.grace_period.as_ref() {
            if util::parse_timespan(grace_period).is_none() {
                return Err(HatchlingError::InvalidOption {
                    option: "`configuration.grace_period`".to_string(),
                    value: grace_period.to_string(),
                    detail: "`configuration.grace_period` must be a time span, ie 5s, 500ms."
                        .to_string(),
                });
            }
        }

        // Request format is only useful with a request log.
        if self.request_format.is_some() && self.request_log.is_empty() {
            return Err(HatchlingError::InvalidOption {
                option: "`configuration.request_format`".to_string(),
                value: format!("{:?}", self.request_format),
                detail: "`configuration.request_format` can not be set without setting `configuration.request_log`.".to_string(),
            });
        }

        Ok(())
    }

    /// Initialize the console logger and the optional log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Open the log file if configured.
        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        // Otherwise disable the log.
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
        loggers.push(SimpleLogger::new(debug_level, Config::default()));
        let mut log_file_error = None;
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => log_file_error = Some(e),
            }
        }

        match CombinedLogger::init(loggers) {
            Ok(_) => (),
            Err(e) => {
                info!("failed to initialize CombinedLogger: {}", e);
            }
        }

        if let Some(log_to_file) = log_file {
            match log_file_error {
                None => info!("Writing to log file: {}", log_to_file.display()),
                Some(e) => warn!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
