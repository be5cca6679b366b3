//! Metrics collected and aggregated during load tests.
//!
//! Virtual users send a [`MetricMessage`] for every request they send, every task
//! they skip, and once when their bootstrap finishes. Messages travel over an
//! [`unbounded Flume channel`](https://docs.rs/flume/*/flume/fn.unbounded.html) to a
//! single [`MetricsAggregator`] task, so virtual users never wait on metrics.
//!
//! The aggregator folds each message into a [`LoadTestMetrics`] table of per-label
//! [`ActionMetricAggregate`]s. A consistent copy of the table can be taken at any
//! time with [`MetricsAggregator::snapshot`], and is returned by
//! [`LoadTest::execute()`](../struct.LoadTest.html#method.execute) when the load test
//! finishes. When viewed with [`std::fmt::Display`] the metrics are displayed in
//! tables.

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use std::{f32, fmt};
use strum::IntoEnumIterator;

use crate::executor::{ActionResult, Outcome};
use crate::pool::PoolSummary;
use crate::util;

/// Percentiles displayed in the final metrics.
const PERCENTILES: [f32; 6] = [0.5, 0.75, 0.98, 0.99, 0.999, 0.9999];

/// Sent by virtual users to the [`MetricsAggregator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricMessage {
    /// A request was sent.
    Action(ActionResult),
    /// A task was skipped because the virtual user holds no credential.
    Skipped {
        /// The label of the skipped task.
        label: String,
    },
    /// A virtual user finished bootstrapping.
    Bootstrapped {
        /// Whether the virtual user acquired a credential.
        success: bool,
    },
}

/// All metrics collected for one label, (for example `read dashboard`).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionMetricAggregate {
    /// The label for which metrics are being collected.
    pub label: String,
    /// Per-response-time counters, tracking how often requests complete with this response time.
    ///
    /// All response times between 1 and 100ms are stored without any rounding. Response times between
    /// 100 and 500ms are rounded to the nearest 10ms and then stored. Response times between 500 and
    /// 1000ms are rounded to the nearest 100ms. Response times larger than 1000ms are rounded to the
    /// nearest 1000ms.
    pub response_times: BTreeMap<usize, usize>,
    /// The shortest response time seen so far, not rounded.
    pub min_response_time: usize,
    /// The longest response time seen so far, not rounded.
    pub max_response_time: usize,
    /// Total combined response times seen so far.
    pub total_response_time: usize,
    /// Total number of response times seen so far.
    pub response_time_counter: usize,
    /// Per-status-code counters, tracking how often each status code was returned.
    pub status_code_counts: HashMap<u16, usize>,
    /// Per-outcome counters.
    pub outcome_counts: BTreeMap<Outcome, usize>,
    /// Requests that ended with [`Outcome::Success`].
    pub success_count: usize,
    /// Requests that ended with any other outcome.
    pub fail_count: usize,
    /// Tasks skipped because the virtual user held no credential. Skipped tasks are
    /// not requests, and are not included in any other counter.
    pub skipped_count: usize,
}
impl ActionMetricAggregate {
    /// Create a new ActionMetricAggregate object.
    pub(crate) fn new(label: &str) -> Self {
        trace!("new label: {}", label);
        ActionMetricAggregate {
            label: label.to_string(),
            response_times: BTreeMap::new(),
            min_response_time: 0,
            max_response_time: 0,
            total_response_time: 0,
            response_time_counter: 0,
            status_code_counts: HashMap::new(),
            outcome_counts: BTreeMap::new(),
            success_count: 0,
            fail_count: 0,
            skipped_count: 0,
        }
    }

    /// Fold one result into the aggregate.
    pub(crate) fn record(&mut self, result: &ActionResult) {
        self.set_response_time(result.response_time());
        if let Some(status_code) = result.status_code {
            self.set_status_code(status_code);
        }
        *self.outcome_counts.entry(result.outcome).or_insert(0) += 1;
        if result.outcome.is_success() {
            self.success_count += 1;
        } else {
            self.fail_count += 1;
        }
    }

    /// Track response time.
    pub(crate) fn set_response_time(&mut self, response_time: u64) {
        let response_time_usize = response_time as usize;

        // Update minimum if this one is fastest yet.
        self.min_response_time = update_min_time(
            self.min_response_time,
            self.response_time_counter,
            response_time_usize,
        );

        // Update maximum if this one is slowest yet.
        self.max_response_time = update_max_time(self.max_response_time, response_time_usize);

        self.total_response_time += response_time_usize;
        self.response_time_counter += 1;

        // Round the response time so similar times are combined together.
        // No rounding for 1-100ms response times.
        let rounded_response_time = if response_time < 100 {
            response_time_usize
        }
        // Round to nearest 10 for 100-500ms response times.
        else if response_time < 500 {
            ((response_time as f64 / 10.0).round() * 10.0) as usize
        }
        // Round to nearest 100 for 500-1000ms response times.
        else if response_time < 1000 {
            ((response_time as f64 / 100.0).round() * 100.0) as usize
        }
        // Round to nearest 1000 for all larger response times.
        else {
            ((response_time as f64 / 1000.0).round() * 1000.0) as usize
        };

        let counter = self.response_times.entry(rounded_response_time).or_insert(0);
        *counter += 1;
        debug!("incremented {} counter: {}", rounded_response_time, counter);
    }

    /// Increment counter for status code, creating new counter if first time seeing status code.
    pub(crate) fn set_status_code(&mut self, status_code: u16) {
        let counter = self.status_code_counts.entry(status_code).or_insert(0);
        *counter += 1;
        debug!("incremented {} counter: {}", status_code, counter);
    }

    /// Merge another aggregate into this one.
    pub(crate) fn merge(&mut self, other: &ActionMetricAggregate) {
        self.response_times = merge_times(
            std::mem::take(&mut self.response_times),
            other.response_times.clone(),
        );
        // An aggregate with only skipped tasks has no minimum to offer.
        if other.response_time_counter > 0 {
            self.min_response_time = update_min_time(
                self.min_response_time,
                self.response_time_counter,
                other.min_response_time,
            );
        }
        self.max_response_time = update_max_time(self.max_response_time, other.max_response_time);
        self.total_response_time += other.total_response_time;
        self.response_time_counter += other.response_time_counter;
        prepare_status_codes(
            &other.status_code_counts,
            &mut Some(&mut self.status_code_counts),
        );
        for (outcome, count) in &other.outcome_counts {
            *self.outcome_counts.entry(*outcome).or_insert(0) += count;
        }
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.skipped_count += other.skipped_count;
    }

    /// Total number of requests sent, excluding skipped tasks.
    pub fn request_count(&self) -> usize {
        self.success_count + self.fail_count
    }

    /// How many requests ended with this outcome.
    pub fn outcome_count(&self, outcome: Outcome) -> usize {
        self.outcome_counts.get(&outcome).copied().unwrap_or(0)
    }

    /// Average response time in milliseconds.
    pub fn average_response_time(&self) -> f32 {
        match self.response_time_counter {
            0 => 0.0,
            _ => self.total_response_time as f32 / self.response_time_counter as f32,
        }
    }

    /// The response time within which `percent` of requests completed.
    fn percentile(&self, percent: f32) -> String {
        calculate_response_time_percentile(
            &self.response_times,
            self.response_time_counter,
            self.min_response_time,
            self.max_response_time,
            percent,
        )
    }
}
/// Implement ordering for ActionMetricAggregate.
impl Ord for ActionMetricAggregate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.label.cmp(&other.label)
    }
}
/// Implement partial-ordering for ActionMetricAggregate.
impl PartialOrd for ActionMetricAggregate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// All per-label metrics, keyed by label.
pub type ActionMetrics = HashMap<String, ActionMetricAggregate>;

/// Metrics about the virtual users themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetrics {
    /// Virtual users launched, including replacements.
    pub spawned: usize,
    /// Virtual users that acquired a credential, or that run anonymously.
    pub bootstrapped: usize,
    /// Virtual users that failed to acquire a credential.
    pub failed_bootstrap: usize,
    /// The largest number of virtual users that were active at the same time.
    pub peak_active: usize,
    /// Virtual users whose task exited unexpectedly.
    pub supervision_failures: usize,
    /// Virtual users that were aborted after the grace period expired.
    pub forced_stops: usize,
}

/// Metrics collected during a Hatchling load test.
#[derive(Clone, Debug, Default)]
pub struct LoadTestMetrics {
    /// The host being load tested.
    pub host: String,
    /// When the load test started.
    pub started: Option<DateTime<Local>>,
    /// When the load test stopped.
    pub stopped: Option<DateTime<Local>>,
    /// Total number of seconds the load test ran.
    pub duration: usize,
    /// Per-label metrics.
    pub actions: ActionMetrics,
    /// Virtual user metrics.
    pub users: UserMetrics,
    /// Flag indicating whether or not these are the final metrics, used to determine
    /// which metrics should be displayed.
    pub final_metrics: bool,
}
impl LoadTestMetrics {
    fn new(host: &str) -> Self {
        LoadTestMetrics {
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// Fold one message into the metrics.
    pub(crate) fn record(&mut self, message: &MetricMessage) {
        match message {
            MetricMessage::Action(result) => self
                .actions
                .entry(result.label.to_string())
                .or_insert_with(|| ActionMetricAggregate::new(&result.label))
                .record(result),
            MetricMessage::Skipped { label } => {
                self.actions
                    .entry(label.to_string())
                    .or_insert_with(|| ActionMetricAggregate::new(label))
                    .skipped_count += 1
            }
            MetricMessage::Bootstrapped { success: true } => self.users.bootstrapped += 1,
            MetricMessage::Bootstrapped { success: false } => self.users.failed_bootstrap += 1,
        }
    }

    /// Copy what only the user pool knows into the user metrics.
    pub(crate) fn set_pool_summary(&mut self, summary: &PoolSummary) {
        self.users.spawned = summary.spawned;
        self.users.peak_active = summary.peak_active;
        self.users.supervision_failures = summary.supervision_failures;
        self.users.forced_stops = summary.forced_stops;
    }

    /// Update the duration from the start and stop times.
    fn update_duration(&mut self) {
        self.duration = match (self.started, self.stopped) {
            (Some(started), Some(stopped)) => (stopped - started).num_seconds().max(0) as usize,
            (Some(started), None) => (Local::now() - started).num_seconds().max(0) as usize,
            _ => 0,
        };
    }

    /// Metrics for a label, if any were recorded.
    pub fn action(&self, label: &str) -> Option<&ActionMetricAggregate> {
        self.actions.get(label)
    }

    /// All labels merged together.
    pub fn aggregated(&self) -> ActionMetricAggregate {
        let mut aggregated = ActionMetricAggregate::new("Aggregated");
        for action in self.actions.values() {
            aggregated.merge(action);
        }
        aggregated
    }

    /// Display all metrics from a completed load test.
    ///
    /// # Example
    /// ```rust,no_run
    /// use hatchling::prelude::*;
    ///
    /// fn main() -> Result<(), HatchlingError> {
    ///     LoadTest::initialize()?
    ///         .register_task(Task::get("front page", "/"))
    ///         // Set a default host so the load test will start.
    ///         .set_default(LoadTestDefault::Host, "http://localhost/")?
    ///         // Set a default run time so this test runs to completion.
    ///         .set_default(LoadTestDefault::RunTime, 1)?
    ///         .execute()?
    ///         .metrics
    ///         .print();
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn print(&self) {
        info!("printing final metrics after {} seconds...", self.duration);
        print!("{}", self);
    }

    /// Displays metrics while a load test is running.
    pub(crate) fn print_running(&self) {
        info!(
            "printing running metrics after {} seconds...",
            self.duration
        );

        // Include a blank line after printing running metrics.
        println!("{}", self);
    }

    /// Prepares a table of requests and fails.
    pub(crate) fn fmt_requests(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === PER LABEL METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for action in self.actions.values().sorted() {
            self.fmt_request_row(fmt, action)?;
        }
        if self.actions.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+---------------+----------------+----------+--------"
            )?;
            self.fmt_request_row(fmt, &self.aggregated())?;
        }

        Ok(())
    }

    fn fmt_request_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        action: &ActionMetricAggregate,
    ) -> fmt::Result {
        let total_count = action.request_count();
        let fail_percent = if action.fail_count > 0 {
            action.fail_count as f32 / total_count as f32 * 100.0
        } else {
            0.0
        };
        // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
        let fails = if fail_percent as usize == 100 || fail_percent as usize == 0 {
            format!("{} ({}%)", format_number(action.fail_count), fail_percent as usize)
        } else {
            format!("{} ({:.1}%)", format_number(action.fail_count), fail_percent)
        };
        let (reqs_per_second, fails_per_second) =
            per_second_calculations(self.duration, total_count, action.fail_count);
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.reqs_p$} | {:>7.fails_p$}",
            util::truncate_string(&action.label, 24),
            format_number(total_count),
            fails,
            reqs_per_second,
            fails_per_second,
            reqs_p = determine_precision(reqs_per_second),
            fails_p = determine_precision(fails_per_second),
        )
    }

    /// Prepares a table of response times.
    pub(crate) fn fmt_response_times(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // If there's nothing to display, exit immediately.
        if self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>10} | {:>11}",
            "Name", "Avg (ms)", "Min", "Max", "Median"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for action in self.actions.values().sorted() {
            Self::fmt_response_time_row(fmt, action)?;
        }
        if self.actions.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+-------------+------------+------------+------------"
            )?;
            Self::fmt_response_time_row(fmt, &self.aggregated())?;
        }

        Ok(())
    }

    fn fmt_response_time_row(
        fmt: &mut fmt::Formatter<'_>,
        action: &ActionMetricAggregate,
    ) -> fmt::Result {
        let average = action.average_response_time();
        writeln!(
            fmt,
            " {:<24} | {:>11.avg_precision$} | {:>10} | {:>10} | {:>11}",
            util::truncate_string(&action.label, 24),
            average,
            format_number(action.min_response_time),
            format_number(action.max_response_time),
            format_number(util::median(
                &action.response_times,
                action.response_time_counter,
                action.min_response_time,
                action.max_response_time
            )),
            avg_precision = determine_precision(average),
        )
    }

    /// Prepares a table of slowest response times within several percentiles.
    pub(crate) fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only include percentiles when displaying the final metrics report.
        if !self.final_metrics || self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Slowest page load within specified percentile of requests (in ms):"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
            "Name", "50%", "75%", "98%", "99%", "99.9%", "99.99%"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for action in self.actions.values().sorted() {
            Self::fmt_percentile_row(fmt, action)?;
        }
        if self.actions.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+--------+--------+--------+--------+--------+-------"
            )?;
            Self::fmt_percentile_row(fmt, &self.aggregated())?;
        }

        Ok(())
    }

    fn fmt_percentile_row(
        fmt: &mut fmt::Formatter<'_>,
        action: &ActionMetricAggregate,
    ) -> fmt::Result {
        let p: Vec<String> = PERCENTILES.iter().map(|p| action.percentile(*p)).collect();
        writeln!(
            fmt,
            " {:<24} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6} | {:>6}",
            util::truncate_string(&action.label, 24),
            p[0],
            p[1],
            p[2],
            p[3],
            p[4],
            p[5],
        )
    }

    /// Prepares a table of outcomes, including skipped tasks.
    pub(crate) fn fmt_outcomes(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>9} | {:>9} | {:>9} | {:>9} | {:>8}",
            "Name", "Success", "Client", "Server", "Network", "Skipped"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for action in self.actions.values().sorted() {
            Self::fmt_outcome_row(fmt, action)?;
        }
        if self.actions.len() > 1 {
            writeln!(
                fmt,
                " -------------------------+-----------+-----------+-----------+-----------+------"
            )?;
            Self::fmt_outcome_row(fmt, &self.aggregated())?;
        }

        Ok(())
    }

    fn fmt_outcome_row(
        fmt: &mut fmt::Formatter<'_>,
        action: &ActionMetricAggregate,
    ) -> fmt::Result {
        let counts: Vec<String> = Outcome::iter()
            .map(|outcome| format_number(action.outcome_count(outcome)))
            .collect();
        writeln!(
            fmt,
            " {:<24} | {:>9} | {:>9} | {:>9} | {:>9} | {:>8}",
            util::truncate_string(&action.label, 24),
            counts[0],
            counts[1],
            counts[2],
            counts[3],
            format_number(action.skipped_count),
        )
    }

    /// Prepares a table of response status codes.
    pub(crate) fn fmt_status_codes(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.final_metrics || self.actions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<24} | {:>51} ", "Name", "Status codes")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut aggregated_status_code_counts: HashMap<u16, usize> = HashMap::new();
        for action in self.actions.values().sorted() {
            let codes = prepare_status_codes(
                &action.status_code_counts,
                &mut Some(&mut aggregated_status_code_counts),
            );

            writeln!(
                fmt,
                " {:<24} | {:>51}",
                util::truncate_string(&action.label, 24),
                codes,
            )?;
        }
        writeln!(
            fmt,
            " -------------------------+----------------------------------------------------"
        )?;
        let codes = prepare_status_codes(&aggregated_status_code_counts, &mut None);
        writeln!(fmt, " {:<24} | {:>51} ", "Aggregated", codes)?;

        Ok(())
    }

    /// Prepares a summary of virtual users.
    pub(crate) fn fmt_users(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.final_metrics {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === USERS ===\n ------------------------------------------------------------------------------"
        )?;
        let rows = [
            ("Spawned", self.users.spawned),
            ("Bootstrapped", self.users.bootstrapped),
            ("Failed bootstrap", self.users.failed_bootstrap),
            ("Peak active", self.users.peak_active),
            ("Supervision failures", self.users.supervision_failures),
            ("Forced stops", self.users.forced_stops),
            ("Skipped tasks", self.aggregated().skipped_count),
        ];
        for (name, value) in rows {
            writeln!(fmt, " {:<24} | {:>13}", name, format_number(value))?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;

        Ok(())
    }
}
impl Serialize for LoadTestMetrics {
    // LoadTestMetrics serialization can't be derived because of the started and stopped fields.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("LoadTestMetrics", 7)?;
        s.serialize_field("host", &self.host)?;
        // Convert timestamps to unix timestamps.
        s.serialize_field("started", &self.started.map_or(0, |t| t.timestamp()))?;
        s.serialize_field("stopped", &self.stopped.map_or(0, |t| t.timestamp()))?;
        s.serialize_field("duration", &self.duration)?;
        s.serialize_field("actions", &self.actions)?;
        s.serialize_field("users", &self.users)?;
        s.serialize_field("final_metrics", &self.final_metrics)?;
        s.end()
    }
}

/// Implement format trait to allow displaying metrics.
impl fmt::Display for LoadTestMetrics {
    // Implement display of metrics with `{}` marker.
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_requests(fmt)?;
        self.fmt_response_times(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_outcomes(fmt)?;
        self.fmt_status_codes(fmt)?;
        self.fmt_users(fmt)
    }
}

/// The single place all metrics are folded into.
///
/// Cloning is cheap, all clones share the same table.
#[derive(Clone, Debug, Default)]
pub struct MetricsAggregator {
    metrics: Arc<RwLock<LoadTestMetrics>>,
}
impl MetricsAggregator {
    /// Create an aggregator for a load test against `host`.
    pub fn new(host: &str) -> Self {
        MetricsAggregator {
            metrics: Arc::new(RwLock::new(LoadTestMetrics::new(host))),
        }
    }

    // A panic while holding the lock can't leave the table half-updated, keep going.
    fn read(&self) -> RwLockReadGuard<'_, LoadTestMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LoadTestMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Receive messages until every sender is dropped, folding each into the table.
    ///
    /// Results are also forwarded to the request logger, if one is running.
    pub async fn run(
        self,
        receiver: flume::Receiver<MetricMessage>,
        request_logger: Option<flume::Sender<Option<ActionResult>>>,
    ) {
        while let Ok(message) = receiver.recv_async().await {
            if let (Some(logger), MetricMessage::Action(result)) = (&request_logger, &message) {
                if let Err(e) = logger.send(Some(result.clone())) {
                    warn!("failed to forward result to request logger: {}", e);
                }
            }
            self.record(&message);
        }
        debug!("all metrics senders dropped, exiting aggregator");
    }

    /// Fold a single message into the table.
    pub fn record(&self, message: &MetricMessage) {
        self.write().record(message);
    }

    /// A consistent copy of all metrics collected so far.
    pub fn snapshot(&self) -> LoadTestMetrics {
        let mut metrics = self.read().clone();
        metrics.update_duration();
        metrics
    }

    pub(crate) fn set_started(&self, started: DateTime<Local>) {
        let mut metrics = self.write();
        metrics.started = Some(started);
        metrics.stopped = None;
    }

    pub(crate) fn set_stopped(&self, stopped: DateTime<Local>) {
        self.write().stopped = Some(stopped);
    }
}

/// Print a snapshot of the metrics every `interval` until aborted.
pub(crate) async fn print_running_metrics(aggregator: MetricsAggregator, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        aggregator.snapshot().print_running();
    }
}

/// Helper to calculate requests and fails per seconds.
pub(crate) fn per_second_calculations(duration: usize, total: usize, fail: usize) -> (f32, f32) {
    if duration == 0 {
        (0.0, 0.0)
    } else {
        (
            total as f32 / duration as f32,
            fail as f32 / duration as f32,
        )
    }
}

fn determine_precision(value: f32) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// A helper function that merges together times.
pub(crate) fn merge_times(
    mut global_response_times: BTreeMap<usize, usize>,
    local_response_times: BTreeMap<usize, usize>,
) -> BTreeMap<usize, usize> {
    for (response_time, count) in local_response_times {
        *global_response_times.entry(response_time).or_insert(0) += count;
    }
    global_response_times
}

/// A helper function to update the global minimum time based on local time. The
/// global minimum is meaningless until at least one sample has been counted.
pub(crate) fn update_min_time(global_min: usize, global_samples: usize, min: usize) -> usize {
    if global_samples == 0 {
        min
    } else {
        global_min.min(min)
    }
}

/// A helper function to update the global maximum time based on local time.
pub(crate) fn update_max_time(global_max: usize, max: usize) -> usize {
    global_max.max(max)
}

/// Get the response time that a certain number of percent of the requests finished within.
pub(crate) fn calculate_response_time_percentile(
    response_times: &BTreeMap<usize, usize>,
    total_requests: usize,
    min: usize,
    max: usize,
    percent: f32,
) -> String {
    let percentile_request = (total_requests as f32 * percent).round() as usize;
    debug!(
        "percentile: {}, request {} of total {}",
        percent, percentile_request, total_requests
    );

    let mut total_count: usize = 0;

    for (value, counter) in response_times {
        total_count += counter;
        if total_count >= percentile_request {
            return format_number((*value).clamp(min, max.max(min)));
        }
    }
    format_number(0)
}

/// Helper to count and aggregate seen status codes.
pub(crate) fn prepare_status_codes(
    status_code_counts: &HashMap<u16, usize>,
    aggregate_counts: &mut Option<&mut HashMap<u16, usize>>,
) -> String {
    let mut codes: Vec<String> = Vec::new();
    for (status_code, count) in status_code_counts.iter().sorted() {
        codes.push(format!("{} [{}]", format_number(*count), status_code));
        if let Some(aggregate_status_code_counts) = aggregate_counts.as_mut() {
            *aggregate_status_code_counts.entry(*status_code).or_insert(0) += count;
        }
    }
    codes.join(", ")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::{TaskMethod, TaskRequest};
    use http::StatusCode;

    fn result(label: &str, status: Option<u16>, response_time: u64) -> ActionResult {
        let request = TaskRequest::get("/");
        let latency = Duration::from_millis(response_time);
        match status {
            Some(status) => ActionResult::from_status(
                label,
                &request,
                StatusCode::from_u16(status).unwrap(),
                latency,
            ),
            None => ActionResult::network_failure(label, &request, latency, "refused".into()),
        }
    }

    #[test]
    fn max_response_time() {
        let mut max_response_time = 99;
        // Update max response time to a higher value.
        max_response_time = update_max_time(max_response_time, 101);
        assert_eq!(max_response_time, 101);
        // Max response time doesn't update when updating with a lower value.
        max_response_time = update_max_time(max_response_time, 1);
        assert_eq!(max_response_time, 101);
    }

    #[test]
    fn min_response_time() {
        // The first sample always sets the minimum.
        let mut min_response_time = update_min_time(0, 0, 11);
        assert_eq!(min_response_time, 11);
        // Update min response time to a lower value.
        min_response_time = update_min_time(min_response_time, 1, 9);
        assert_eq!(min_response_time, 9);
        // Min response time doesn't update when updating with a higher value.
        min_response_time = update_min_time(min_response_time, 2, 22);
        assert_eq!(min_response_time, 9);
        // A 0ms response is a real minimum.
        min_response_time = update_min_time(min_response_time, 3, 0);
        assert_eq!(min_response_time, 0);
        min_response_time = update_min_time(min_response_time, 4, 5);
        assert_eq!(min_response_time, 0);
    }

    #[test]
    fn zero_millisecond_responses() {
        let mut action = ActionMetricAggregate::new("fast");
        action.set_response_time(5);
        action.set_response_time(0);
        action.set_response_time(3);
        assert_eq!(action.min_response_time, 0);
        assert_eq!(action.max_response_time, 5);
        assert_eq!(action.percentile(0.0), "0");

        // A first sample of 0 isn't overwritten by later ones.
        let mut action = ActionMetricAggregate::new("fast");
        action.set_response_time(0);
        action.set_response_time(7);
        assert_eq!(action.min_response_time, 0);
    }

    #[test]
    fn merge_without_samples() {
        let mut read = ActionMetricAggregate::new("read");
        read.set_response_time(4);
        read.set_response_time(9);

        // Only skipped tasks, so no response times.
        let mut skipped = ActionMetricAggregate::new("read");
        skipped.skipped_count = 2;

        read.merge(&skipped);
        assert_eq!(read.min_response_time, 4);
        assert_eq!(read.max_response_time, 9);
        assert_eq!(read.skipped_count, 2);

        // Merging into an empty aggregate takes the other side's minimum, even 0.
        let mut zero = ActionMetricAggregate::new("read");
        zero.set_response_time(0);
        skipped.merge(&zero);
        assert_eq!(skipped.min_response_time, 0);
        skipped.merge(&read);
        assert_eq!(skipped.min_response_time, 0);
        assert_eq!(skipped.max_response_time, 9);
        assert_eq!(skipped.response_time_counter, 3);
    }

    #[test]
    fn response_time_merge() {
        let mut global: BTreeMap<usize, usize> = BTreeMap::new();
        global.insert(1, 2);
        global.insert(10, 1);
        let mut local: BTreeMap<usize, usize> = BTreeMap::new();
        local.insert(10, 3);
        local.insert(20, 1);
        let merged = merge_times(global, local);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&1], 2);
        assert_eq!(merged[&10], 4);
        assert_eq!(merged[&20], 1);
    }

    #[test]
    fn max_response_time_percentile() {
        let mut response_times: BTreeMap<usize, usize> = BTreeMap::new();
        response_times.insert(1, 1);
        response_times.insert(2, 1);
        response_times.insert(3, 1);
        // 3 * .5 = 1.5, rounds to 2.
        assert_eq!(calculate_response_time_percentile(&response_times, 3, 1, 3, 0.5), "2");
        response_times.insert(3, 2);
        // 4 * .5 = 2
        assert_eq!(calculate_response_time_percentile(&response_times, 4, 1, 3, 0.5), "2");
        // 4 * .25 = 1
        assert_eq!(calculate_response_time_percentile(&response_times, 4, 1, 3, 0.25), "1");
        // 4 * .75 = 3
        assert_eq!(calculate_response_time_percentile(&response_times, 4, 1, 3, 0.75), "3");
        // 4 * 1 = 4 (and the 4th response time is also 3)
        assert_eq!(calculate_response_time_percentile(&response_times, 4, 1, 3, 1.0), "3");

        // 4 * .25 = 1, but uses specified minimum of 2
        assert_eq!(calculate_response_time_percentile(&response_times, 4, 2, 3, 0.25), "2");
        // 4 * .75 = 3, but uses specified maximum of 2
        assert_eq!(calculate_response_time_percentile(&response_times, 4, 1, 2, 0.75), "2");

        response_times.insert(10, 25);
        response_times.insert(20, 25);
        response_times.insert(30, 25);
        response_times.insert(50, 25);
        response_times.insert(100, 10);
        response_times.insert(200, 1);
        assert_eq!(calculate_response_time_percentile(&response_times, 115, 1, 200, 0.9), "50");
        assert_eq!(calculate_response_time_percentile(&response_times, 115, 1, 200, 0.99), "100");
        assert_eq!(calculate_response_time_percentile(&response_times, 115, 1, 200, 0.999), "200");
    }

    #[test]
    fn calculate_per_second() {
        // With duration of 0, requests and fails per second is always 0.
        let (requests_per_second, fails_per_second) = per_second_calculations(0, 100, 10);
        assert!(requests_per_second == 0.0);
        assert!(fails_per_second == 0.0);

        // With non-zero duration, requests and fails per second return properly.
        let (requests_per_second, fails_per_second) = per_second_calculations(10, 100, 10);
        assert!((requests_per_second - 10.0).abs() < f32::EPSILON);
        assert!((fails_per_second - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn status_codes() {
        let mut counts: HashMap<u16, usize> = HashMap::new();
        counts.insert(500, 2);
        counts.insert(200, 1_500);
        let mut aggregated: HashMap<u16, usize> = HashMap::new();
        aggregated.insert(200, 1);
        assert_eq!(
            prepare_status_codes(&counts, &mut Some(&mut aggregated)),
            "1,500 [200], 2 [500]"
        );
        assert_eq!(aggregated[&200], 1_501);
        assert_eq!(aggregated[&500], 2);
    }

    #[test]
    fn rounded_response_times() {
        let mut action = ActionMetricAggregate::new("read");
        for response_time in [1, 10, 10, 101, 102, 155, 2345] {
            action.set_response_time(response_time);
        }
        // 101 and 102 are rounded to 100, 155 to 160 and 2345 to 2000.
        assert_eq!(action.response_times.len(), 5);
        assert_eq!(action.response_times[&10], 2);
        assert_eq!(action.response_times[&100], 2);
        assert_eq!(action.response_times[&160], 1);
        assert_eq!(action.response_times[&2000], 1);
        // Minimum and maximum aren't rounded.
        assert_eq!(action.min_response_time, 1);
        assert_eq!(action.max_response_time, 2345);
        assert_eq!(action.total_response_time, 2724);
        assert_eq!(action.response_time_counter, 7);
        // Tracking response times doesn't track requests.
        assert_eq!(action.request_count(), 0);
    }

    #[test]
    fn record_results() {
        let mut metrics = LoadTestMetrics::new("http://127.0.0.1/");
        metrics.record(&MetricMessage::Action(result("read", Some(200), 12)));
        metrics.record(&MetricMessage::Action(result("read", Some(200), 8)));
        metrics.record(&MetricMessage::Action(result("read", Some(404), 3)));
        metrics.record(&MetricMessage::Action(result("write", Some(503), 40)));
        metrics.record(&MetricMessage::Action(result("write", None, 5_000)));
        metrics.record(&MetricMessage::Skipped {
            label: "write".to_string(),
        });
        metrics.record(&MetricMessage::Bootstrapped { success: true });
        metrics.record(&MetricMessage::Bootstrapped { success: false });

        let read = metrics.action("read").unwrap();
        assert_eq!(read.request_count(), 3);
        assert_eq!(read.success_count, 2);
        assert_eq!(read.fail_count, 1);
        assert_eq!(read.outcome_count(Outcome::Success), 2);
        assert_eq!(read.outcome_count(Outcome::ClientError), 1);
        assert_eq!(read.status_code_counts[&200], 2);
        assert_eq!(read.min_response_time, 3);
        assert_eq!(read.max_response_time, 12);

        let write = metrics.action("write").unwrap();
        // Skipped tasks aren't requests.
        assert_eq!(write.request_count(), 2);
        assert_eq!(write.skipped_count, 1);
        assert_eq!(write.outcome_count(Outcome::ServerError), 1);
        assert_eq!(write.outcome_count(Outcome::NetworkFailure), 1);
        // Network failures have no status code.
        assert_eq!(write.status_code_counts.len(), 1);

        let aggregated = metrics.aggregated();
        assert_eq!(aggregated.request_count(), 5);
        assert_eq!(aggregated.fail_count, 3);
        assert_eq!(aggregated.skipped_count, 1);
        assert_eq!(aggregated.min_response_time, 3);
        assert_eq!(aggregated.max_response_time, 5_000);

        assert_eq!(metrics.users.bootstrapped, 1);
        assert_eq!(metrics.users.failed_bootstrap, 1);
    }

    #[test]
    fn display() {
        let mut metrics = LoadTestMetrics::new("http://127.0.0.1/");
        metrics.record(&MetricMessage::Action(result("read", Some(200), 12)));
        metrics.record(&MetricMessage::Action(result("write", Some(201), 30)));

        let running = metrics.to_string();
        assert!(running.contains("PER LABEL METRICS"));
        assert!(running.contains("read"));
        assert!(running.contains("Aggregated"));
        // Percentiles, status codes and users are only in the final metrics.
        assert!(!running.contains("99.99%"));
        assert!(!running.contains("=== USERS ==="));

        metrics.final_metrics = true;
        let last = metrics.to_string();
        assert!(last.contains("99.99%"));
        assert!(last.contains("1 [201]"));
        assert!(last.contains("=== USERS ==="));

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["actions"]["read"]["success_count"], 1);
        assert_eq!(json["final_metrics"], true);
    }

    #[tokio::test]
    async fn aggregate_from_channel() {
        let aggregator = MetricsAggregator::new("http://127.0.0.1/");
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let (logger_tx, logger_rx) = flume::unbounded();
        let handle = tokio::spawn(aggregator.clone().run(metrics_rx, Some(logger_tx)));

        for _ in 0..10 {
            metrics_tx
                .send(MetricMessage::Action(result("read", Some(200), 5)))
                .unwrap();
        }
        metrics_tx
            .send(MetricMessage::Skipped {
                label: "read".to_string(),
            })
            .unwrap();
        drop(metrics_tx);
        handle.await.unwrap();

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.action("read").unwrap().request_count(), 10);
        assert_eq!(snapshot.action("read").unwrap().skipped_count, 1);

        // Only requests are logged.
        let logged: Vec<Option<ActionResult>> = logger_rx.drain().collect();
        assert_eq!(logged.len(), 10);
        assert!(logged
            .iter()
            .all(|r| r.as_ref().map(|r| r.method) == Some(TaskMethod::Get)));
    }
}
