//! Virtual users.
//!
//! Each virtual user runs as its own tokio task. It bootstraps exactly once, then loops
//! selecting a weighted task, sending its request, and pausing for a random think time,
//! until the user pool tells it to exit.
//!
//! ```text
//! Bootstrapping ──> Running ──> Stopped
//!       │                          ^
//!       └────────> Failed ─────────┘
//! ```
//!
//! A `Failed` user couldn't acquire a credential. It keeps cycling through the task
//! loop, but every task is skipped.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::ThinkTime;
use crate::executor::RequestExecutor;
use crate::metrics::MetricMessage;
use crate::session::{AuthFlow, Credential, Identity};
use crate::task::{TaskContext, TaskSelector};

/// Password used by anonymous users' identities.
const ANONYMOUS_PASSWORD: &str = "";

/// Lifecycle of a virtual user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserState {
    /// Registering and logging in.
    Bootstrapping,
    /// Running tasks.
    Running,
    /// Running, but without a credential, so every task is skipped.
    Failed,
    /// Exited the task loop.
    Stopped,
}

/// Commands the user pool sends to virtual users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UserCommand {
    /// Stop running tasks and exit.
    Exit,
}

/// Immutable state shared by every virtual user.
#[derive(Debug)]
pub(crate) struct UserSettings {
    pub(crate) selector: TaskSelector,
    pub(crate) executor: RequestExecutor,
    pub(crate) auth: Option<AuthFlow>,
    pub(crate) think_time: ThinkTime,
}

/// A single simulated client.
pub(crate) struct VirtualUser {
    /// Sequential index, starting at 0.
    pub(crate) index: usize,
    identity: Identity,
    credential: Option<Credential>,
    state: watch::Sender<UserState>,
    settings: Arc<UserSettings>,
    metrics: flume::Sender<MetricMessage>,
    iterations: usize,
}
impl VirtualUser {
    /// Create a virtual user, returning a receiver that observes its state.
    pub(crate) fn new(
        index: usize,
        settings: Arc<UserSettings>,
        metrics: flume::Sender<MetricMessage>,
    ) -> (Self, watch::Receiver<UserState>) {
        let password = settings
            .auth
            .as_ref()
            .map_or(ANONYMOUS_PASSWORD, |auth| auth.password.as_str());
        let identity = Identity::generate(password).set_user_index(index);
        let (state, state_rx) = watch::channel(UserState::Bootstrapping);
        (
            VirtualUser {
                index,
                identity,
                credential: None,
                state,
                settings,
                metrics,
                iterations: 0,
            },
            state_rx,
        )
    }

    fn set_state(&self, state: UserState) {
        debug!("user {}: {:?}", self.index, state);
        self.state.send_replace(state);
    }

    fn state(&self) -> UserState {
        *self.state.borrow()
    }

    /// Acquire a credential, if an auth flow is configured.
    async fn bootstrap(&mut self) {
        let success = match self.settings.auth.as_ref() {
            Some(auth) => {
                match auth
                    .bootstrap(&self.settings.executor, &self.identity, &self.metrics)
                    .await
                {
                    Ok(credential) => {
                        self.credential = Some(credential);
                        true
                    }
                    Err(e) => {
                        info!("user {}: {}", self.index, e);
                        false
                    }
                }
            }
            // Anonymous users have nothing to bootstrap.
            None => true,
        };
        let _ = self.metrics.send(MetricMessage::Bootstrapped { success });
        self.set_state(if success {
            UserState::Running
        } else {
            UserState::Failed
        });
    }

    /// Select and run one task.
    async fn run_task(&mut self) {
        let settings = Arc::clone(&self.settings);
        let task = settings.selector.select();

        if self.state() == UserState::Failed || (task.requires_auth && self.credential.is_none()) {
            trace!("user {}: skipping {}", self.index, task.label);
            let _ = self.metrics.send(MetricMessage::Skipped {
                label: task.label.to_string(),
            });
        } else {
            let request = task.build_request(&TaskContext {
                user_index: self.index,
                iteration: self.iterations,
                identity: &self.identity,
            });
            let result = settings
                .executor
                .execute(&task.label, &request, self.credential.as_ref())
                .await;
            let _ = self.metrics.send(MetricMessage::Action(result));
        }
        self.iterations += 1;
    }
}

/// Run a virtual user until it receives [`UserCommand::Exit`], or the pool goes away.
pub(crate) async fn user_main(mut user: VirtualUser, commands: flume::Receiver<UserCommand>) {
    info!("launching user {}...", user.index);

    user.bootstrap().await;

    loop {
        if received_exit(&commands) {
            break;
        }

        user.run_task().await;

        // Pause between tasks, waking immediately if told to exit.
        let think_time = user.settings.think_time.sample(&mut rand::rng());
        trace!("user {} sleeping {:?}...", user.index, think_time);
        tokio::select! {
            _ = tokio::time::sleep(think_time) => (),
            _ = commands.recv_async() => break,
        }
    }

    user.set_state(UserState::Stopped);
    info!(
        "exiting user {} after {} tasks...",
        user.index, user.iterations
    );
}

// Determine if the pool has sent UserCommand::Exit, or dropped its sender.
fn received_exit(commands: &flume::Receiver<UserCommand>) -> bool {
    match commands.try_recv() {
        Ok(UserCommand::Exit) => true,
        Err(flume::TryRecvError::Disconnected) => true,
        Err(flume::TryRecvError::Empty) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Outcome;
    use crate::task::Task;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use std::time::Duration;
    use url::Url;

    fn settings(
        server: &MockServer,
        tasks: Vec<Task>,
        auth: Option<AuthFlow>,
        think_time: ThinkTime,
    ) -> Arc<UserSettings> {
        let base_url = Url::parse(&server.base_url()).unwrap();
        Arc::new(UserSettings {
            selector: TaskSelector::new(Arc::new(tasks)).unwrap(),
            executor: RequestExecutor::new(base_url, Duration::from_secs(5)).unwrap(),
            auth,
            think_time,
        })
    }

    fn think_time(millis: u64) -> ThinkTime {
        ThinkTime {
            min: Duration::from_millis(millis),
            max: Duration::from_millis(millis),
        }
    }

    #[tokio::test]
    async fn failed_login_skips_tasks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/register");
                then.status(201);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/login");
                then.status(500);
            })
            .await;
        let dashboard = server
            .mock_async(|when, then| {
                when.method(GET).path("/dashboard");
                then.status(200);
            })
            .await;
        let tasks = vec![
            Task::get("read", "/dashboard").set_requires_auth(true),
            // A failed user skips anonymous tasks too.
            Task::get("public", "/dashboard"),
        ];
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let (user, mut state) = VirtualUser::new(
            0,
            settings(&server, tasks, Some(AuthFlow::default()), think_time(5)),
            metrics_tx,
        );
        let (command_tx, command_rx) = flume::unbounded();
        let handle = tokio::spawn(user_main(user, command_rx));

        state
            .wait_for(|state| *state == UserState::Failed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        command_tx.send(UserCommand::Exit).unwrap();
        handle.await.unwrap();
        assert_eq!(*state.borrow(), UserState::Stopped);

        assert_eq!(dashboard.hits_async().await, 0);
        let messages: Vec<MetricMessage> = metrics_rx.drain().collect();
        assert!(messages
            .iter()
            .any(|m| matches!(m, MetricMessage::Bootstrapped { success: false })));
        let skipped = messages
            .iter()
            .filter(|m| matches!(m, MetricMessage::Skipped { .. }))
            .count();
        assert!(skipped > 1, "only {} tasks skipped", skipped);
        // Only register and login were sent.
        let actions = messages
            .iter()
            .filter(|m| matches!(m, MetricMessage::Action(_)))
            .count();
        assert_eq!(actions, 2);
    }

    #[tokio::test]
    async fn anonymous_user_runs_tasks() {
        let server = MockServer::start_async().await;
        let index = server
            .mock_async(|when, then| {
                when.method(GET).path("/items/3");
                then.status(200);
            })
            .await;
        let tasks = vec![
            Task::new("item", |context| {
                crate::task::TaskRequest::get(&format!("/items/{}", context.user_index))
            }),
            Task::get("private", "/private").set_requires_auth(true),
        ];
        let (metrics_tx, metrics_rx) = flume::unbounded();
        let (user, state) =
            VirtualUser::new(3, settings(&server, tasks, None, think_time(1)), metrics_tx);
        let (command_tx, command_rx) = flume::unbounded();
        let handle = tokio::spawn(user_main(user, command_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*state.borrow(), UserState::Running);
        command_tx.send(UserCommand::Exit).unwrap();
        handle.await.unwrap();

        let mut sent = 0;
        for message in metrics_rx.drain() {
            match message {
                MetricMessage::Action(result) => {
                    assert_eq!(result.label, "item");
                    assert_eq!(result.outcome, Outcome::Success);
                    sent += 1;
                }
                MetricMessage::Skipped { label } => assert_eq!(label, "private"),
                MetricMessage::Bootstrapped { success } => assert!(success),
            }
        }
        assert!(sent > 0);
        assert_eq!(index.hits_async().await, sent);
    }

    #[tokio::test]
    async fn exit_interrupts_think_time() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200);
            })
            .await;
        let (metrics_tx, _metrics_rx) = flume::unbounded();
        let (user, mut state) = VirtualUser::new(
            0,
            settings(
                &server,
                vec![Task::get("index", "/")],
                None,
                think_time(60_000),
            ),
            metrics_tx,
        );
        let (command_tx, command_rx) = flume::unbounded();
        let handle = tokio::spawn(user_main(user, command_rx));
        state
            .wait_for(|state| *state == UserState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        command_tx.send(UserCommand::Exit).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("user didn't exit while thinking")
            .unwrap();
        assert_eq!(*state.borrow(), UserState::Stopped);
    }

    #[tokio::test]
    async fn dropped_pool_stops_user() {
        let server = MockServer::start_async().await;
        let (metrics_tx, _metrics_rx) = flume::unbounded();
        let (user, _state) = VirtualUser::new(
            0,
            settings(&server, vec![Task::get("index", "/")], None, think_time(1)),
            metrics_tx,
        );
        let (command_tx, command_rx) = flume::unbounded::<UserCommand>();
        drop(command_tx);
        tokio::time::timeout(Duration::from_secs(1), user_main(user, command_rx))
            .await
            .unwrap();
    }
}
