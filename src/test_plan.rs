//! Test plan structures and functions.
//!
//! Internally, Hatchling represents all load tests as a series of test plan steps. Each
//! step is a target number of users and how long it takes to get there from the
//! previous step. Between steps the target is interpolated linearly, so a step of
//! `(100, 10_000)` after `(0, 0)` adds ten users per second.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::LoadTestConfiguration;
use crate::util;
use crate::HatchlingError;

/// Internal data structure representing a test plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    // A test plan is a vector of tuples each indicating a # of users and milliseconds.
    pub(crate) steps: Vec<(usize, usize)>,
}

/// Automatically represent all load tests internally as a test plan.
///
/// Load tests launched using `--users`, `--startup-time`, `--hatch-rate`, and/or `--run-time` are
/// automatically converted to a `Vec<(usize, usize)>` test plan.
impl TestPlan {
    /// Build a test plan from current configuration.
    pub(crate) fn build(configuration: &LoadTestConfiguration) -> TestPlan {
        if let Some(test_plan) = configuration.test_plan.as_ref() {
            // Test plan was manually defined, clone and return as is.
            return test_plan.clone();
        }

        let mut steps: Vec<(usize, usize)> = Vec::new();

        // Build a simple test plan from configured options if possible.
        if let Some(users) = configuration.users {
            let startup_time = util::parse_timespan_millis(&configuration.startup_time)
                .filter(|startup_time| *startup_time > 0);
            if let Some(startup_time) = startup_time {
                // Load test is configured with --startup-time.
                steps.push((users, startup_time));
            } else {
                // Load test is configured with --hatch-rate.
                let hatch_rate = configuration
                    .hatch_rate
                    .as_deref()
                    .and_then(|r| r.parse::<f32>().ok())
                    .filter(|r| *r > 0.0)
                    .unwrap_or(1.0);
                // Convert hatch_rate to milliseconds.
                let ms_hatch_rate = 1.0 / hatch_rate * 1_000.0;
                // Finally, multiply the hatch rate by the number of users to hatch.
                let total_time = ms_hatch_rate * users as f32;
                steps.push((users, total_time as usize));
            }

            // A run-time is set, configure the load plan to run for the specified time then shut down.
            let run_time = util::parse_timespan_millis(&configuration.run_time)
                .filter(|run_time| *run_time > 0);
            if let Some(run_time) = run_time {
                // Maintain the configured number of users for the configured run-time.
                steps.push((users, run_time));
                // Then shut down the load test as quickly as possible.
                steps.push((0, 0));
            }
        }

        TestPlan { steps }
    }

    /// The largest number of users any step asks for.
    pub fn peak_users(&self) -> usize {
        self.steps.iter().map(|(users, _)| *users).max().unwrap_or(0)
    }

    /// How long the whole plan takes, or `None` if the last step keeps users running
    /// until the load test is canceled.
    pub fn total_duration(&self) -> Option<Duration> {
        match self.steps.last() {
            Some((0, _)) => Some(Duration::from_millis(
                self.steps
                    .iter()
                    .fold(0u64, |total, (_, ms)| total.saturating_add(*ms as u64)),
            )),
            Some(_) => None,
            None => Some(Duration::ZERO),
        }
    }

    /// Returns true once the plan has ramped down to zero users and has no more steps.
    pub fn is_finished(&self, elapsed: Duration) -> bool {
        match self.total_duration() {
            Some(total) => elapsed >= total,
            None => false,
        }
    }

    /// The number of users that should be running `elapsed` after the load test started.
    ///
    /// Increases are rounded down and decreases are rounded up, so a ramp never runs
    /// ahead of its schedule.
    pub fn target_users(&self, elapsed: Duration) -> usize {
        let elapsed = usize::try_from(elapsed.as_millis()).unwrap_or(usize::MAX);
        let mut previous_users: usize = 0;
        let mut step_start: usize = 0;
        for (users, ms) in &self.steps {
            // A step ending beyond usize::MAX milliseconds never ends.
            let step_end = step_start.checked_add(*ms).unwrap_or(usize::MAX);
            if elapsed < step_end {
                let progress = elapsed - step_start;
                // Widen so large user counts and long steps can't overflow.
                let ramped = |difference: usize| {
                    (difference as u128 * progress as u128 / *ms as u128) as usize
                };
                return if *users >= previous_users {
                    previous_users + ramped(users - previous_users)
                } else {
                    previous_users - ramped(previous_users - users)
                };
            }
            previous_users = *users;
            step_start = step_end;
        }
        previous_users
    }
}

/// Implement [`FromStr`] to convert `"users,timespan"` string formatted test plans to
/// Hatchling's internal representation of Vec<(usize, usize)>.
///
/// Users are represented simply as an integer.
///
/// Time span can be specified as an integer, indicating seconds. Or can use integers together
/// with one or more of "h", "m", "s" and "ms", in that order. Valid formats include: 20, 20s,
/// 3m, 2h, 1h20m, 3h30m10s, 500ms, etc.
impl FromStr for TestPlan {
    type Err = HatchlingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Convert string into a TestPlan.
        let mut steps: Vec<(usize, usize)> = Vec::new();
        // Each line of the test plan must be in the format "{users},{timespan}", white space is ignored
        let re = Regex::new(r"^\s*(\d+)\s*,\s*([0-9hms]+)\s*$")
            .expect("failed to compile test plan regex");
        // A test plan can have multiple lines split by the semicolon ";".
        for line in s.split(';') {
            let step = re.captures(line).and_then(|cap| {
                let users = cap[1].parse::<usize>().ok()?;
                let ms = util::parse_timespan_millis(&cap[2])?;
                Some((users, ms))
            });
            match step {
                Some(step) => steps.push(step),
                None => {
                    // Logger isn't initialized yet, provide helpful debug output.
                    eprintln!("ERROR: invalid `configuration.test_plan` value: '{}'", line);
                    eprintln!("  Expected format: --test-plan \"{{users}},{{timespan}};{{users}},{{timespan}}\"");
                    eprintln!("    {{users}} must be an integer, ie \"100\"");
                    eprintln!("    {{timespan}} can be integer seconds or \"30s\", \"20m\", \"3h\", \"1h30m\", \"500ms\", etc");
                    return Err(HatchlingError::InvalidOption {
                        option: "`configuration.test_plan`".to_string(),
                        value: line.to_string(),
                        detail: "invalid `configuration.test_plan` value.".to_string(),
                    });
                }
            }
        }
        // The steps are only valid if the logic gets this far.
        Ok(TestPlan { steps })
    }
}
