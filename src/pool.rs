//! The user pool launches and stops virtual users to follow the test plan.
//!
//! Every virtual user holds a permit from a semaphore sized to the concurrency ceiling
//! for as long as its task runs, so the number of active users can never exceed the
//! ceiling. When no permit is available, launching is deferred until a later tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics::MetricMessage;
use crate::test_plan::TestPlan;
use crate::user::{user_main, UserCommand, UserSettings, UserState, VirtualUser};
use crate::{util, CancelHandle};

/// How often the pool adjusts the number of users and supervises them.
const TICK: Duration = Duration::from_millis(100);

/// How the pool manages its users.
#[derive(Clone, Debug)]
pub(crate) struct PoolSettings {
    /// Hard ceiling on concurrently active users.
    pub(crate) max_users: usize,
    /// How long users are given to exit before they are aborted.
    pub(crate) grace_period: Duration,
    /// Launch a new user when a user's task exits unexpectedly.
    pub(crate) replace_failed_users: bool,
}

/// What happened to the users of a load test.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PoolSummary {
    /// The load test was canceled before the test plan finished.
    pub(crate) canceled: bool,
    /// Users launched, including replacements.
    pub(crate) spawned: usize,
    /// The largest number of users active at the same time.
    pub(crate) peak_active: usize,
    /// Users whose task exited unexpectedly.
    pub(crate) supervision_failures: usize,
    /// Users that exited cleanly when told to stop.
    pub(crate) stopped: usize,
    /// Users that were aborted after the grace period.
    pub(crate) forced_stops: usize,
}

/// A launched virtual user, as seen by the pool.
struct ActiveUser {
    index: usize,
    commands: flume::Sender<UserCommand>,
    state: watch::Receiver<UserState>,
    handle: JoinHandle<()>,
}

pub(crate) struct UserPool {
    settings: Arc<UserSettings>,
    test_plan: TestPlan,
    pool_settings: PoolSettings,
    metrics: flume::Sender<MetricMessage>,
    cancel: CancelHandle,
    permits: Arc<Semaphore>,
    /// Users counted towards the target, oldest first.
    users: Vec<ActiveUser>,
    /// Users told to exit during a ramp down that haven't exited yet.
    stopping: Vec<ActiveUser>,
    next_index: usize,
    /// Set once the ceiling deferred a launch, to only log it once.
    ceiling_reached: bool,
    /// Users that failed while counted towards the target.
    lost_users: usize,
    summary: PoolSummary,
}
impl UserPool {
    pub(crate) fn new(
        settings: Arc<UserSettings>,
        test_plan: TestPlan,
        pool_settings: PoolSettings,
        metrics: flume::Sender<MetricMessage>,
        cancel: CancelHandle,
    ) -> Self {
        UserPool {
            settings,
            test_plan,
            permits: Arc::new(Semaphore::new(pool_settings.max_users)),
            pool_settings,
            metrics,
            cancel,
            users: Vec::new(),
            stopping: Vec::new(),
            next_index: 0,
            ceiling_reached: false,
            lost_users: 0,
            summary: PoolSummary::default(),
        }
    }

    /// Follow the test plan until it finishes or the load test is canceled, then
    /// stop every user.
    pub(crate) async fn run(mut self) -> PoolSummary {
        let started = Instant::now();
        let mut drift_timer = Instant::now();

        loop {
            if self.cancel.is_canceled() {
                info!("load test canceled, stopping users...");
                self.summary.canceled = true;
                break;
            }

            let elapsed = started.elapsed();
            if self.test_plan.is_finished(elapsed) {
                info!("test plan finished after {:?}", elapsed);
                break;
            }

            self.supervise().await;
            let target = self.target_users(elapsed);
            self.adjust(target);

            drift_timer = util::sleep_minus_drift(TICK, drift_timer).await;
        }

        self.shutdown().await;
        self.summary
    }

    /// The number of users that should be running, less users that failed and are
    /// not being replaced. Users that fail after being told to stop were already
    /// removed from the target, so they don't lower it again.
    fn target_users(&self, elapsed: Duration) -> usize {
        let target = self.test_plan.target_users(elapsed);
        if self.pool_settings.replace_failed_users {
            target
        } else {
            target.saturating_sub(self.lost_users)
        }
    }

    /// Launch or stop users to reach `target`.
    fn adjust(&mut self, target: usize) {
        while self.users.len() < target {
            if !self.launch_user() {
                if !self.ceiling_reached {
                    info!(
                        "{} users active, deferring launches until capacity frees",
                        self.pool_settings.max_users
                    );
                    self.ceiling_reached = true;
                }
                break;
            }
        }

        // Stop the most recently launched users first.
        while self.users.len() > target {
            if let Some(user) = self.users.pop() {
                debug!("telling user {} to exit", user.index);
                let _ = user.commands.send(UserCommand::Exit);
                self.stopping.push(user);
            }
        }
    }

    /// Launch one user, if there's capacity for it.
    fn launch_user(&mut self) -> bool {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let index = self.next_index;
        self.next_index += 1;
        let (user, state) =
            VirtualUser::new(index, Arc::clone(&self.settings), self.metrics.clone());
        let (commands, receiver) = flume::unbounded();
        let handle = tokio::spawn(async move {
            // The permit is released when the user's task ends, even if it panics.
            let _permit = permit;
            user_main(user, receiver).await;
        });

        self.users.push(ActiveUser {
            index,
            commands,
            state,
            handle,
        });
        self.summary.spawned += 1;
        let active = self.pool_settings.max_users - self.permits.available_permits();
        self.summary.peak_active = self.summary.peak_active.max(active);
        true
    }

    /// Collect users whose task has ended.
    async fn supervise(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.users)
            .into_iter()
            .partition(|user| user.handle.is_finished());
        self.users = running;
        for user in finished {
            // Users only exit when told to, so any exit here is unexpected.
            self.summary.supervision_failures += 1;
            self.lost_users += 1;
            match user.handle.await {
                Err(e) if e.is_panic() => error!("user {} panicked: {}", user.index, e),
                Err(e) => error!("user {} failed: {}", user.index, e),
                Ok(()) => error!("user {} exited unexpectedly", user.index),
            }
            if self.pool_settings.replace_failed_users {
                info!("replacing user {}", user.index);
            }
        }

        let (finished, stopping): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stopping)
            .into_iter()
            .partition(|user| user.handle.is_finished());
        self.stopping = stopping;
        for user in finished {
            let result = user.handle.await;
            self.collect(user.index, result);
        }
    }

    /// Record how a stopped user's task ended.
    fn collect(&mut self, index: usize, result: Result<(), tokio::task::JoinError>) {
        match result {
            Ok(()) => self.summary.stopped += 1,
            Err(e) if e.is_panic() => {
                error!("user {} panicked: {}", index, e);
                self.summary.supervision_failures += 1;
            }
            Err(e) => debug!("user {} canceled: {}", index, e),
        }
    }

    /// Tell every user to exit, wait up to the grace period, then abort stragglers.
    async fn shutdown(&mut self) {
        let mut users = std::mem::take(&mut self.users);
        users.append(&mut self.stopping);
        info!("stopping {} users...", users.len());

        for user in &users {
            let _ = user.commands.send(UserCommand::Exit);
        }

        let deadline = Instant::now() + self.pool_settings.grace_period;
        for mut user in users {
            match tokio::time::timeout_at(deadline, &mut user.handle).await {
                Ok(result) => self.collect(user.index, result),
                Err(_) => {
                    warn!(
                        "user {} still {:?} after {:?}, aborting",
                        user.index,
                        *user.state.borrow(),
                        self.pool_settings.grace_period
                    );
                    user.handle.abort();
                    // Wait for the abort, so the user's metrics sender is dropped.
                    if let Err(e) = user.handle.await {
                        if e.is_panic() {
                            error!("user {} panicked: {}", user.index, e);
                            self.summary.supervision_failures += 1;
                            continue;
                        }
                    }
                    self.summary.forced_stops += 1;
                }
            }
        }
        info!(
            "{} users stopped, {} aborted",
            self.summary.stopped, self.summary.forced_stops
        );
    }
}
