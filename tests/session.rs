/// Validate that virtual users register and log in once, authenticate their requests,
/// and skip their tasks when they fail to log in.
use httpmock::{
    Method::{GET, POST},
    MockServer,
};
use serde_json::json;
use serial_test::serial;

mod common;

use hatchling::prelude::*;

// Paths used in load tests performed during these tests.
const DASHBOARD_PATH: &str = "/dashboard";
const QUIZZES_PATH: &str = "/quizzes";

// Load test configuration.
const USERS: usize = 3;

fn tasks() -> Vec<Task> {
    vec![
        Task::get("read dashboard", DASHBOARD_PATH)
            .set_weight(7)
            .unwrap()
            .set_requires_auth(true),
        Task::post_json("write quiz", QUIZZES_PATH, json!({"title": "Quiz"}))
            .set_weight(3)
            .unwrap()
            .set_requires_auth(true),
    ]
}

fn configuration(server: &MockServer) -> LoadTestConfiguration {
    common::build_configuration(
        server,
        vec![
            "--users",
            &USERS.to_string(),
            "--hatch-rate",
            "10",
            "--run-time",
            "2",
            "--no-print-metrics",
        ],
    )
}

#[test]
#[serial]
/// Users that logged in send their token with every request.
fn test_authenticated_users() {
    let server = MockServer::start();
    let (register, login) = common::setup_auth_endpoints(&server, 200);
    let dashboard = server.mock(|when, then| {
        when.method(GET)
            .path(DASHBOARD_PATH)
            .header("authorization", "Bearer t0k3n");
        then.status(200);
    });
    let quizzes = server.mock(|when, then| {
        when.method(POST)
            .path(QUIZZES_PATH)
            .header("authorization", "Bearer t0k3n")
            .json_body(json!({"title": "Quiz"}));
        then.status(201);
    });

    let report = common::run_load_test(common::build_load_test(
        configuration(&server),
        tasks(),
        Some(AuthFlow::default()),
    ));

    assert_eq!(report.outcome, RunOutcome::Completed);

    // Each user bootstraps exactly once.
    assert_eq!(register.hits(), USERS);
    assert_eq!(login.hits(), USERS);
    assert_eq!(report.metrics.users.bootstrapped, USERS);
    assert_eq!(report.metrics.users.failed_bootstrap, 0);

    // Every task request matched the mocks requiring the token.
    let read = report.metrics.action("read dashboard").unwrap();
    assert!(read.request_count() > 0);
    assert_eq!(read.request_count(), dashboard.hits());
    assert_eq!(read.outcome_count(Outcome::Success), read.request_count());
    assert_eq!(read.skipped_count, 0);
    if let Some(write) = report.metrics.action("write quiz") {
        assert_eq!(write.request_count(), quizzes.hits());
        assert_eq!(write.fail_count, 0);
    }

    // Bootstrap requests are recorded under their own labels.
    assert_eq!(report.metrics.action("login").unwrap().request_count(), USERS);
}

#[test]
#[serial]
/// Users that fail to log in never send their tasks' requests.
fn test_failed_login() {
    let server = MockServer::start();
    let (register, login) = common::setup_auth_endpoints(&server, 401);
    let dashboard = server.mock(|when, then| {
        when.method(GET).path(DASHBOARD_PATH);
        then.status(200);
    });
    let quizzes = server.mock(|when, then| {
        when.method(POST).path(QUIZZES_PATH);
        then.status(201);
    });

    let report = common::run_load_test(common::build_load_test(
        configuration(&server),
        tasks(),
        Some(AuthFlow::default()),
    ));

    // Failed users don't fail the load test.
    assert_eq!(report.outcome, RunOutcome::Completed);

    assert_eq!(register.hits(), USERS);
    assert_eq!(login.hits(), USERS);
    assert_eq!(dashboard.hits(), 0);
    assert_eq!(quizzes.hits(), 0);

    assert_eq!(report.metrics.users.bootstrapped, 0);
    assert_eq!(report.metrics.users.failed_bootstrap, USERS);
    // Failed users keep running, they're not supervision failures.
    assert_eq!(report.metrics.users.supervision_failures, 0);

    let login_metrics = report.metrics.action("login").unwrap();
    assert_eq!(login_metrics.outcome_count(Outcome::ClientError), USERS);

    // Tasks were selected and skipped, not sent.
    let skipped = report.metrics.aggregated().skipped_count;
    assert!(skipped > 0);
    let sent = report
        .metrics
        .action("read dashboard")
        .map_or(0, |read| read.request_count());
    assert_eq!(sent, 0);
}

#[test]
#[serial]
/// Only users whose login failed skip their tasks, the others keep sending them.
fn test_some_logins_fail() {
    let server = MockServer::start();
    let register = server.mock(|when, then| {
        when.method(POST).path("/register");
        then.status(201);
    });
    // The second user launched is refused, everyone else gets a token.
    let refused = server.mock(|when, then| {
        when.method(POST).path("/login").body_includes("\"user-1\"");
        then.status(401);
    });
    let accepted = server.mock(|when, then| {
        when.method(POST).path("/login").body_excludes("\"user-1\"");
        then.status(200).json_body(json!({"token": "t0k3n"}));
    });
    // Only requests carrying the token are expected.
    let dashboard = server.mock(|when, then| {
        when.method(GET)
            .path(DASHBOARD_PATH)
            .header("authorization", "Bearer t0k3n");
        then.status(200);
    });
    let anonymous = server.mock(|when, then| {
        when.method(GET).path(DASHBOARD_PATH).header_missing("authorization");
        then.status(200);
    });

    let auth = AuthFlow {
        login_body: json!({
            "email": "{email}",
            "password": "{password}",
            "device": "user-{user_index}",
        }),
        ..Default::default()
    };
    let report = common::run_load_test(common::build_load_test(
        configuration(&server),
        vec![Task::get("read dashboard", DASHBOARD_PATH).set_requires_auth(true)],
        Some(auth),
    ));

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(register.hits(), USERS);
    assert_eq!(refused.hits(), 1);
    assert_eq!(accepted.hits(), USERS - 1);

    let users = &report.metrics.users;
    assert_eq!(users.bootstrapped, USERS - 1);
    assert_eq!(users.failed_bootstrap, 1);
    assert_eq!(users.supervision_failures, 0);

    let login = report.metrics.action("login").unwrap();
    assert_eq!(login.outcome_count(Outcome::Success), USERS - 1);
    assert_eq!(login.outcome_count(Outcome::ClientError), 1);

    // Logged in users sent every request with their token, the refused user sent none.
    let read = report.metrics.action("read dashboard").unwrap();
    assert!(read.request_count() > 0);
    assert_eq!(read.request_count(), dashboard.hits());
    assert_eq!(read.outcome_count(Outcome::Success), read.request_count());
    assert_eq!(anonymous.hits(), 0);
    // The refused user kept selecting tasks, and skipped each one.
    assert!(read.skipped_count > 0);
}

#[test]
#[serial]
/// Log in without registering, reading a nested token.
fn test_custom_token_pointer() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/login");
        then.status(200)
            .json_body(json!({"data": {"access_token": "n3st3d"}}));
    });
    let dashboard = server.mock(|when, then| {
        when.method(GET)
            .path(DASHBOARD_PATH)
            .header("authorization", "Bearer n3st3d");
        then.status(200);
    });

    let auth = AuthFlow {
        register_path: None,
        login_path: "/api/login".to_string(),
        token_pointer: "/data/access_token".to_string(),
        ..Default::default()
    };
    let report = common::run_load_test(common::build_load_test(
        configuration(&server),
        vec![Task::get("read dashboard", DASHBOARD_PATH).set_requires_auth(true)],
        Some(auth),
    ));

    assert_eq!(report.metrics.users.bootstrapped, USERS);
    assert!(dashboard.hits() > 0);
    assert!(report.metrics.action("register").is_none());
}
